use bytes::Bytes;
use tokio::net::{TcpStream, ToSocketAddrs};

use crate::cmd::{ConfigCmd, Echo, Get, Keys, Ping, Save, Set};
use crate::connection::Connection;
use crate::frame::Frame;

/// Minimal client over the wire protocol, used by the demo binary and
/// the end-to-end tests.
pub struct Client {
    connection: Connection,
}

impl Client {
    pub async fn connect<T: ToSocketAddrs>(addr: T) -> crate::Result<Client> {
        let socket = TcpStream::connect(addr).await?;
        let connection = Connection::new(socket);

        Ok(Client { connection })
    }

    /// `PING` replies `PONG`; `PING msg` echoes the message back.
    pub async fn ping(&mut self, msg: Option<Bytes>) -> crate::Result<Bytes> {
        let frame = Ping::new(msg).into_frame();
        self.connection.write_frame(&frame).await?;

        match self.read_response().await? {
            Frame::Simple(s) => Ok(Bytes::from(s.into_bytes())),
            Frame::Bulk(data) => Ok(data),
            frame => Err(unexpected(frame)),
        }
    }

    pub async fn echo(&mut self, msg: Bytes) -> crate::Result<Bytes> {
        let frame = Echo::new(msg).into_frame();
        self.connection.write_frame(&frame).await?;

        match self.read_response().await? {
            Frame::Bulk(data) => Ok(data),
            frame => Err(unexpected(frame)),
        }
    }

    pub async fn get(&mut self, key: &str) -> crate::Result<Option<Bytes>> {
        let frame = Get::new(Bytes::copy_from_slice(key.as_bytes())).into_frame();
        self.connection.write_frame(&frame).await?;

        match self.read_response().await? {
            Frame::Bulk(data) => Ok(Some(data)),
            Frame::Null => Ok(None),
            frame => Err(unexpected(frame)),
        }
    }

    pub async fn set(&mut self, key: &str, value: Bytes) -> crate::Result<()> {
        let key = Bytes::copy_from_slice(key.as_bytes());
        self.set_cmd(Set::new(key, value, None)).await
    }

    /// `SET` with a millisecond time-to-live (`PX`).
    pub async fn set_px(&mut self, key: &str, value: Bytes, ttl_ms: i64) -> crate::Result<()> {
        let key = Bytes::copy_from_slice(key.as_bytes());
        self.set_cmd(Set::new(key, value, Some(ttl_ms))).await
    }

    pub async fn keys(&mut self, pattern: &str) -> crate::Result<Vec<Bytes>> {
        let frame = Keys::new(Bytes::copy_from_slice(pattern.as_bytes())).into_frame();
        self.connection.write_frame(&frame).await?;

        match self.read_response().await? {
            Frame::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    Frame::Bulk(data) => Ok(data),
                    frame => Err(unexpected(frame)),
                })
                .collect(),
            frame => Err(unexpected(frame)),
        }
    }

    /// `CONFIG GET param`; `None` if the server does not know the param.
    pub async fn config_get(&mut self, param: &str) -> crate::Result<Option<(String, String)>> {
        let frame = ConfigCmd::get(param).into_frame();
        self.connection.write_frame(&frame).await?;

        match self.read_response().await? {
            Frame::Array(items) => {
                let mut items = items.into_iter();

                match (items.next(), items.next(), items.next()) {
                    (None, _, _) => Ok(None),
                    (Some(Frame::Bulk(name)), Some(Frame::Bulk(value)), None) => Ok(Some((
                        String::from_utf8_lossy(&name).into_owned(),
                        String::from_utf8_lossy(&value).into_owned(),
                    ))),
                    _ => Err("unexpected server response".into()),
                }
            }
            frame => Err(unexpected(frame)),
        }
    }

    /// Trigger a snapshot save on the server.
    pub async fn save(&mut self) -> crate::Result<()> {
        let frame = Save.into_frame();
        self.connection.write_frame(&frame).await?;

        match self.read_response().await? {
            Frame::Simple(_) => Ok(()),
            frame => Err(unexpected(frame)),
        }
    }

    async fn set_cmd(&mut self, cmd: Set) -> crate::Result<()> {
        self.connection.write_frame(&cmd.into_frame()).await?;

        match self.read_response().await? {
            Frame::Simple(_) => Ok(()),
            frame => Err(unexpected(frame)),
        }
    }

    async fn read_response(&mut self) -> crate::Result<Frame> {
        match self.connection.read_frame().await? {
            Some(Frame::Error(message)) => Err(message.into()),
            Some(frame) => Ok(frame),
            None => Err("connection reset by server".into()),
        }
    }
}

fn unexpected(frame: Frame) -> crate::Error {
    format!("unexpected server response: {:?}", frame).into()
}
