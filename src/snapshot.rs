use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::{Buf, Bytes};

use crate::config::Config;
use crate::db::{Db, Entry};

/// On-disk snapshot codec, compatible with the legacy RDB version 11
/// layout: magic header, metadata records, a single database section for
/// index 0, and an EOF marker followed by an (unverified) checksum slot.

const MAGIC: &[u8] = b"REDIS0011";

const OP_METADATA: u8 = 0xFA;
const OP_RESIZEDB: u8 = 0xFB;
const OP_EXPIRETIME_MS: u8 = 0xFC;
const OP_EXPIRETIME_SEC: u8 = 0xFD;
const OP_SELECTDB: u8 = 0xFE;
const OP_EOF: u8 = 0xFF;

const TYPE_STRING: u8 = 0x00;

const ENC_INT8: u8 = 0xC0;
const ENC_INT16: u8 = 0xC1;
const ENC_INT32: u8 = 0xC2;

#[derive(Debug)]
pub enum Error {
    /// The file ended inside a record.
    Truncated,
    /// The 9-byte magic header is missing or names another version.
    BadMagic,
    /// Only database index 0 is supported.
    UnsupportedDbIndex(u64),
    /// Only string values (type byte 0x00) are supported.
    UnsupportedValueType(u8),
    /// A special string encoding this codec does not understand.
    UnsupportedEncoding(u8),
    /// A byte in opcode position that is not a known opcode.
    UnexpectedOpcode(u8),
    Io(io::Error),
}

/// Load the snapshot named by `config`.
///
/// A missing file is not an error; the dataset simply starts empty.
/// Entries whose expiry already passed are kept and left to lazy expiry.
pub fn load(config: &Config) -> Result<Option<HashMap<Bytes, Entry>>, Error> {
    let data = match fs::read(config.db_path()) {
        Ok(data) => data,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(Error::Io(err)),
    };

    parse(&data).map(Some)
}

/// Serialize the current dataset to the snapshot file, creating the
/// parent directory if needed.
pub fn save(config: &Config, db: &Db) -> Result<(), Error> {
    let entries = db.snapshot();
    let data = encode(&entries);

    let path = config.db_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(Error::Io)?;
    }
    fs::write(path, data).map_err(Error::Io)?;

    Ok(())
}

fn parse(mut src: &[u8]) -> Result<HashMap<Bytes, Entry>, Error> {
    let src = &mut src;

    if src.len() < MAGIC.len() || &src[..MAGIC.len()] != MAGIC {
        return Err(Error::BadMagic);
    }
    src.advance(MAGIC.len());

    // Metadata records: 0xFA, string key, string value. Skipped entirely.
    while src.first() == Some(&OP_METADATA) {
        src.advance(1);
        read_string(src)?;
        read_string(src)?;
    }

    let now = Instant::now();
    let wall_now_ms = wall_clock_ms();

    let mut entries = HashMap::new();

    while src.has_remaining() {
        match get_u8(src)? {
            OP_EOF => break, // trailing checksum bytes are ignored
            OP_SELECTDB => {
                let index = read_length(src)?;
                if index != 0 {
                    return Err(Error::UnsupportedDbIndex(index));
                }
            }
            OP_RESIZEDB => {
                // table size hints; discarded
                read_length(src)?;
                read_length(src)?;
            }
            op @ (OP_EXPIRETIME_SEC | OP_EXPIRETIME_MS) => {
                let epoch_ms = if op == OP_EXPIRETIME_SEC {
                    u64::from(get_u32_le(src)?) * 1000
                } else {
                    get_u64_le(src)?
                };

                let value_type = get_u8(src)?;
                if value_type != TYPE_STRING {
                    return Err(Error::UnsupportedValueType(value_type));
                }

                let key = read_string(src)?;
                let value = read_string(src)?;

                let expires_at = epoch_ms_to_instant(epoch_ms, now, wall_now_ms);
                entries.insert(key, Entry::new(value, Some(expires_at)));
            }
            TYPE_STRING => {
                let key = read_string(src)?;
                let value = read_string(src)?;

                entries.insert(key, Entry::new(value, None));
            }
            op => return Err(Error::UnexpectedOpcode(op)),
        }
    }

    Ok(entries)
}

fn encode(entries: &[(Bytes, Entry)]) -> Vec<u8> {
    let now = Instant::now();
    let wall_now_ms = wall_clock_ms();

    let mut out = Vec::with_capacity(128);
    out.extend_from_slice(MAGIC);

    write_metadata(&mut out, b"redis-ver", b"6.0.16");
    write_metadata(&mut out, b"redis-bits", b"64");

    out.push(OP_SELECTDB);
    write_length(&mut out, 0);

    let expiring = entries
        .iter()
        .filter(|(_, entry)| entry.expires_at.is_some())
        .count();

    out.push(OP_RESIZEDB);
    write_length(&mut out, entries.len() as u64);
    write_length(&mut out, expiring as u64);

    for (key, entry) in entries {
        if let Some(expires_at) = entry.expires_at {
            out.push(OP_EXPIRETIME_MS);
            let epoch_ms = instant_to_epoch_ms(expires_at, now, wall_now_ms);
            out.extend_from_slice(&epoch_ms.to_le_bytes());
        }

        out.push(TYPE_STRING);
        write_string(&mut out, key);
        write_string(&mut out, &entry.data);
    }

    out.push(OP_EOF);
    // checksum slot; written as zeros and never verified
    out.extend_from_slice(&[0u8; 8]);

    out
}

// -- size and string encodings ------------------------------------------------

/// Read a size encoding. The top two bits of the first byte select the
/// width; the `11` forms carry the legacy integer encodings, whose value
/// is returned directly.
fn read_length(src: &mut &[u8]) -> Result<u64, Error> {
    let first = get_u8(src)?;

    match first >> 6 {
        0b00 => Ok(u64::from(first & 0x3F)),
        0b01 => {
            let next = get_u8(src)?;
            Ok(u64::from(first & 0x3F) << 8 | u64::from(next))
        }
        0b10 => Ok(u64::from(get_u32_be(src)?)),
        _ => match first {
            ENC_INT8 => Ok(u64::from(get_u8(src)?)),
            ENC_INT16 => Ok(u64::from(get_u16_le(src)?)),
            ENC_INT32 => Ok(u64::from(get_u32_le(src)?)),
            other => Err(Error::UnsupportedEncoding(other)),
        },
    }
}

/// Read a string encoding: either an integer encoding rendered as its
/// decimal form, or a size followed by that many raw bytes.
fn read_string(src: &mut &[u8]) -> Result<Bytes, Error> {
    match src.first() {
        Some(&(ENC_INT8 | ENC_INT16 | ENC_INT32)) => {
            let value = read_length(src)?;
            Ok(Bytes::from(value.to_string().into_bytes()))
        }
        _ => {
            let len = read_length(src)? as usize;
            get_bytes(src, len)
        }
    }
}

/// Write a size encoding. Always uses the plain length forms; the
/// two-byte form masks the value to 14 bits under the `01` tag.
fn write_length(out: &mut Vec<u8>, len: u64) {
    debug_assert!(len < 1 << 32);

    if len < 64 {
        out.push(len as u8);
    } else if len < 16384 {
        out.push(0x40 | ((len >> 8) as u8 & 0x3F));
        out.push(len as u8);
    } else {
        out.push(0x80);
        out.extend_from_slice(&(len as u32).to_be_bytes());
    }
}

fn write_string(out: &mut Vec<u8>, data: &[u8]) {
    write_length(out, data.len() as u64);
    out.extend_from_slice(data);
}

fn write_metadata(out: &mut Vec<u8>, key: &[u8], value: &[u8]) {
    out.push(OP_METADATA);
    write_string(out, key);
    write_string(out, value);
}

// -- cursor helpers -----------------------------------------------------------

fn get_u8(src: &mut &[u8]) -> Result<u8, Error> {
    if !src.has_remaining() {
        return Err(Error::Truncated);
    }
    Ok(src.get_u8())
}

fn get_u16_le(src: &mut &[u8]) -> Result<u16, Error> {
    if src.remaining() < 2 {
        return Err(Error::Truncated);
    }
    Ok(src.get_u16_le())
}

fn get_u32_le(src: &mut &[u8]) -> Result<u32, Error> {
    if src.remaining() < 4 {
        return Err(Error::Truncated);
    }
    Ok(src.get_u32_le())
}

fn get_u32_be(src: &mut &[u8]) -> Result<u32, Error> {
    if src.remaining() < 4 {
        return Err(Error::Truncated);
    }
    Ok(src.get_u32())
}

fn get_u64_le(src: &mut &[u8]) -> Result<u64, Error> {
    if src.remaining() < 8 {
        return Err(Error::Truncated);
    }
    Ok(src.get_u64_le())
}

fn get_bytes(src: &mut &[u8], n: usize) -> Result<Bytes, Error> {
    if src.remaining() < n {
        return Err(Error::Truncated);
    }
    Ok(src.copy_to_bytes(n))
}

// -- clock conversions --------------------------------------------------------

// Expiries live on the monotonic clock in memory but as wall-clock epoch
// milliseconds on disk; the conversion anchors on a (monotonic, wall)
// instant pair taken once per load or save.

fn wall_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn instant_to_epoch_ms(expires_at: Instant, now: Instant, wall_now_ms: u64) -> u64 {
    if expires_at >= now {
        wall_now_ms.saturating_add((expires_at - now).as_millis() as u64)
    } else {
        wall_now_ms.saturating_sub((now - expires_at).as_millis() as u64)
    }
}

fn epoch_ms_to_instant(epoch_ms: u64, now: Instant, wall_now_ms: u64) -> Instant {
    if epoch_ms >= wall_now_ms {
        now.checked_add(Duration::from_millis(epoch_ms - wall_now_ms))
            .unwrap_or_else(|| now + Duration::from_secs(60 * 60 * 24 * 365))
    } else {
        // already elapsed; anchor just behind "now" so the entry survives
        // the load and is dropped on first access
        now.checked_sub(Duration::from_millis(wall_now_ms - epoch_ms))
            .unwrap_or(now)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Truncated => "snapshot truncated".fmt(f),
            Error::BadMagic => "invalid snapshot header".fmt(f),
            Error::UnsupportedDbIndex(index) => {
                write!(f, "unsupported database index {}", index)
            }
            Error::UnsupportedValueType(value_type) => {
                write!(f, "unsupported value type 0x{:02X}", value_type)
            }
            Error::UnsupportedEncoding(byte) => {
                write!(f, "unsupported string encoding 0x{:02X}", byte)
            }
            Error::UnexpectedOpcode(op) => write!(f, "unexpected opcode 0x{:02X}", op),
            Error::Io(err) => err.fmt(f),
        }
    }
}

impl From<io::Error> for Error {
    fn from(src: io::Error) -> Error {
        Error::Io(src)
    }
}

impl std::error::Error for Error {}
