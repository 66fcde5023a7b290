use bytes::Bytes;
use tracing::error;

mod parse;

use crate::config::Config;
use crate::connection::Connection;
use crate::db::Db;
use crate::frame::Frame;
use crate::snapshot;
use parse::{Parse, ParseError};

#[derive(Debug)]
pub enum Command {
    Ping(Ping),
    Echo(Echo),
    Get(Get),
    Set(Set),
    Keys(Keys),
    Config(ConfigCmd),
    Save(Save),
    Unknown(Unknown),
}

#[derive(Debug, Default)]
pub struct Ping {
    pub msg: Option<Bytes>,
}

#[derive(Debug)]
pub struct Echo {
    pub msg: Bytes,
}

#[derive(Debug)]
pub struct Get {
    pub key: Bytes,
}

#[derive(Debug)]
pub struct Set {
    pub key: Bytes,
    pub value: Bytes,
    pub ttl_ms: Option<i64>,
}

#[derive(Debug)]
pub struct Keys {
    pub pattern: Bytes,
}

#[derive(Debug)]
pub struct ConfigCmd {
    action: ConfigAction,
}

#[derive(Debug)]
enum ConfigAction {
    Get(String),
    Path,
    Invalid,
}

#[derive(Debug, Default)]
pub struct Save;

#[derive(Debug)]
pub struct Unknown {
    name: String,
}

impl Command {
    /// Map a request frame onto a command. Command names are matched
    /// case-insensitively; arguments are taken byte-exact. Errors carry
    /// the full protocol error message for the reply.
    pub fn from_frame(frame: Frame) -> crate::Result<Command> {
        let mut parse = Parse::new(frame)?;

        let name = parse.next_string()?;

        let command = match name.to_lowercase().as_str() {
            "ping" => Command::Ping(Ping::parse_frames(&mut parse)?),
            "echo" => Command::Echo(
                Echo::parse_frames(&mut parse).map_err(|e| missing_args(e, "echo"))?,
            ),
            "get" => {
                Command::Get(Get::parse_frames(&mut parse).map_err(|e| missing_args(e, "get"))?)
            }
            "set" => {
                Command::Set(Set::parse_frames(&mut parse).map_err(|e| missing_args(e, "set"))?)
            }
            "keys" => Command::Keys(
                Keys::parse_frames(&mut parse).map_err(|e| missing_args(e, "keys"))?,
            ),
            "config" => Command::Config(ConfigCmd::parse_frames(&mut parse)?),
            "save" => Command::Save(Save),
            _ => Command::Unknown(Unknown { name }),
        };

        Ok(command)
    }

    pub(crate) async fn apply(
        self,
        conn: &mut Connection,
        db: &Db,
        config: &Config,
    ) -> crate::Result<()> {
        use Command::*;

        match self {
            Ping(cmd) => cmd.apply(conn).await,
            Echo(cmd) => cmd.apply(conn).await,
            Get(cmd) => cmd.apply(conn, db).await,
            Set(cmd) => cmd.apply(conn, db).await,
            Keys(cmd) => cmd.apply(conn, db).await,
            Config(cmd) => cmd.apply(conn, config).await,
            Save(cmd) => cmd.apply(conn, db, config).await,
            Unknown(cmd) => cmd.apply(conn).await,
        }
    }
}

/// A missing argument surfaces as the standard wrong-arity error for the
/// command; every other parse failure keeps its own message.
fn missing_args(err: ParseError, cmd: &str) -> crate::Error {
    match err {
        ParseError::EndOfStream => {
            format!("ERR wrong number of arguments for '{}' command", cmd).into()
        }
        err => err.into(),
    }
}

impl Ping {
    pub fn new(msg: Option<Bytes>) -> Ping {
        Ping { msg }
    }

    pub fn into_frame(self) -> Frame {
        let mut frame = Frame::array();
        frame.push_bulk(Bytes::from_static(b"ping"));

        if let Some(msg) = self.msg {
            frame.push_bulk(msg);
        }

        frame
    }

    fn parse_frames(parse: &mut Parse) -> Result<Ping, ParseError> {
        match parse.next_bytes() {
            Ok(msg) => Ok(Ping { msg: Some(msg) }),
            Err(ParseError::EndOfStream) => Ok(Ping::default()),
            Err(e) => Err(e),
        }
    }

    async fn apply(self, conn: &mut Connection) -> crate::Result<()> {
        let response = match self.msg {
            Some(msg) => Frame::Bulk(msg),
            None => Frame::Simple("PONG".to_string()),
        };

        conn.write_frame(&response).await?;

        Ok(())
    }
}

impl Echo {
    pub fn new(msg: Bytes) -> Echo {
        Echo { msg }
    }

    pub fn into_frame(self) -> Frame {
        let mut frame = Frame::array();
        frame.push_bulk(Bytes::from_static(b"echo"));
        frame.push_bulk(self.msg);

        frame
    }

    fn parse_frames(parse: &mut Parse) -> Result<Echo, ParseError> {
        let msg = parse.next_bytes()?;

        Ok(Echo { msg })
    }

    async fn apply(self, conn: &mut Connection) -> crate::Result<()> {
        conn.write_frame(&Frame::Bulk(self.msg)).await?;

        Ok(())
    }
}

impl Get {
    pub fn new(key: impl Into<Bytes>) -> Get {
        Get { key: key.into() }
    }

    pub fn into_frame(self) -> Frame {
        let mut frame = Frame::array();
        frame.push_bulk(Bytes::from_static(b"get"));
        frame.push_bulk(self.key);

        frame
    }

    // keys are opaque byte sequences, never validated as text
    fn parse_frames(parse: &mut Parse) -> Result<Get, ParseError> {
        let key = parse.next_bytes()?;

        Ok(Get { key })
    }

    async fn apply(self, conn: &mut Connection, db: &Db) -> crate::Result<()> {
        let response = match db.get(&self.key) {
            Some(value) => Frame::Bulk(value),
            None => Frame::Null,
        };

        conn.write_frame(&response).await?;

        Ok(())
    }
}

impl Set {
    pub fn new(key: impl Into<Bytes>, value: Bytes, ttl_ms: Option<i64>) -> Set {
        Set {
            key: key.into(),
            value,
            ttl_ms,
        }
    }

    pub fn into_frame(self) -> Frame {
        let mut frame = Frame::array();
        frame.push_bulk(Bytes::from_static(b"set"));
        frame.push_bulk(self.key);
        frame.push_bulk(self.value);

        if let Some(ms) = self.ttl_ms {
            frame.push_bulk(Bytes::from_static(b"px"));
            frame.push_bulk(Bytes::from(ms.to_string().into_bytes()));
        }

        frame
    }

    /// `SET key value [PX <ms>]`. Remaining arguments are scanned for a
    /// `PX` pair; the first one sets the TTL, anything unrecognized is
    /// accepted and ignored, and a trailing `PX` with no value is
    /// ignored as well.
    fn parse_frames(parse: &mut Parse) -> Result<Set, ParseError> {
        let key = parse.next_bytes()?;
        let value = parse.next_bytes()?;

        let mut ttl_ms = None;

        loop {
            match parse.next_bytes() {
                Ok(option) if option.as_ref().eq_ignore_ascii_case(b"px") => {
                    match parse.next_bytes() {
                        Ok(raw) => {
                            let ms = atoi::atoi::<i64>(&raw).ok_or(ParseError::Other(
                                "ERR value is not an integer or out of range".into(),
                            ))?;

                            if ttl_ms.is_none() {
                                ttl_ms = Some(ms);
                            }
                        }
                        Err(ParseError::EndOfStream) => break,
                        Err(e) => return Err(e),
                    }
                }
                Ok(_) => {}
                Err(ParseError::EndOfStream) => break,
                Err(e) => return Err(e),
            }
        }

        Ok(Set { key, value, ttl_ms })
    }

    async fn apply(self, conn: &mut Connection, db: &Db) -> crate::Result<()> {
        db.set(self.key, self.value, self.ttl_ms);

        conn.write_frame(&Frame::Simple("OK".to_string())).await?;

        Ok(())
    }
}

impl Keys {
    pub fn new(pattern: impl Into<Bytes>) -> Keys {
        Keys {
            pattern: pattern.into(),
        }
    }

    pub fn into_frame(self) -> Frame {
        let mut frame = Frame::array();
        frame.push_bulk(Bytes::from_static(b"keys"));
        frame.push_bulk(self.pattern);

        frame
    }

    fn parse_frames(parse: &mut Parse) -> Result<Keys, ParseError> {
        let pattern = parse.next_bytes()?;

        Ok(Keys { pattern })
    }

    async fn apply(self, conn: &mut Connection, db: &Db) -> crate::Result<()> {
        let mut response = Frame::array();

        for key in db.keys(&self.pattern) {
            response.push_bulk(key);
        }

        conn.write_frame(&response).await?;

        Ok(())
    }
}

impl ConfigCmd {
    pub fn get(param: impl ToString) -> ConfigCmd {
        ConfigCmd {
            action: ConfigAction::Get(param.to_string()),
        }
    }

    pub fn into_frame(self) -> Frame {
        let mut frame = Frame::array();
        frame.push_bulk(Bytes::from_static(b"config"));

        match self.action {
            ConfigAction::Get(param) => {
                frame.push_bulk(Bytes::from_static(b"get"));
                frame.push_bulk(Bytes::from(param.into_bytes()));
            }
            ConfigAction::Path => {
                frame.push_bulk(Bytes::from_static(b"path"));
            }
            ConfigAction::Invalid => {}
        }

        frame
    }

    /// Subcommand errors are reported as `ERR syntax error` at apply
    /// time rather than during parsing.
    fn parse_frames(parse: &mut Parse) -> Result<ConfigCmd, ParseError> {
        let action = match parse.next_string() {
            Ok(sub) => match sub.to_lowercase().as_str() {
                "get" => match parse.next_string() {
                    Ok(param) => ConfigAction::Get(param),
                    Err(ParseError::EndOfStream) => ConfigAction::Invalid,
                    Err(e) => return Err(e),
                },
                "path" => ConfigAction::Path,
                _ => ConfigAction::Invalid,
            },
            Err(ParseError::EndOfStream) => ConfigAction::Invalid,
            Err(e) => return Err(e),
        };

        Ok(ConfigCmd { action })
    }

    async fn apply(self, conn: &mut Connection, config: &Config) -> crate::Result<()> {
        let response = match self.action {
            ConfigAction::Get(param) => {
                let mut frame = Frame::array();

                if let Some(value) = config.get(&param) {
                    let value = value.to_string();
                    frame.push_bulk(Bytes::from(param.into_bytes()));
                    frame.push_bulk(Bytes::from(value.into_bytes()));
                }

                frame
            }
            ConfigAction::Path => {
                let path = config.db_path();
                let absolute = std::path::absolute(&path).unwrap_or(path);

                let mut frame = Frame::array();
                frame.push_bulk(Bytes::from_static(b"path"));
                frame.push_bulk(Bytes::from(
                    absolute.to_string_lossy().into_owned().into_bytes(),
                ));

                frame
            }
            ConfigAction::Invalid => Frame::Error("ERR syntax error".to_string()),
        };

        conn.write_frame(&response).await?;

        Ok(())
    }
}

impl Save {
    pub fn into_frame(self) -> Frame {
        let mut frame = Frame::array();
        frame.push_bulk(Bytes::from_static(b"save"));

        frame
    }

    async fn apply(self, conn: &mut Connection, db: &Db, config: &Config) -> crate::Result<()> {
        let response = match snapshot::save(config, db) {
            Ok(()) => Frame::Simple("OK".to_string()),
            Err(err) => {
                error!(cause = %err, "snapshot save failed");
                Frame::Error("ERR failed to save RDB file".to_string())
            }
        };

        conn.write_frame(&response).await?;

        Ok(())
    }
}

impl Unknown {
    async fn apply(self, conn: &mut Connection) -> crate::Result<()> {
        let response = Frame::Error(format!("ERR unknown command '{}'", self.name));

        conn.write_frame(&response).await?;

        Ok(())
    }
}
