// Length-delimited framing over byte streams.
//
// Each frame is a 4-byte big-endian length followed by that many payload
// bytes. `write_message` / `read_message` move raw byte frames;
// `write_frame` / `read_frame` add JSON encoding of any serde type on top, and
// are what the socket transport uses for `ClientMessage` / `ServerMessage`.
//
// `MAX_MESSAGE_SIZE` (16 MB) bounds the allocation a length prefix can ask
// for, so a corrupt or hostile peer cannot make the reader allocate gigabytes.

use std::io::{self, Read, Write};

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Largest frame accepted in either direction.
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FramingError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("frame too large: {len} bytes (max {MAX_MESSAGE_SIZE})")]
    TooLarge { len: usize },
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),
}

impl FramingError {
    /// True when the error just means the peer went away.
    pub fn is_disconnect(&self) -> bool {
        match self {
            FramingError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::NotConnected
            ),
            _ => false,
        }
    }
}

/// Write one frame: length prefix, payload, flush.
pub fn write_message<W: Write>(writer: &mut W, msg: &[u8]) -> Result<(), FramingError> {
    let len = msg.len();
    if len > MAX_MESSAGE_SIZE as usize {
        return Err(FramingError::TooLarge { len });
    }
    #[expect(clippy::cast_possible_truncation)]
    let len_bytes = (len as u32).to_be_bytes();
    writer.write_all(&len_bytes)?;
    writer.write_all(msg)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame. A stream that closes before or inside a frame yields an
/// `UnexpectedEof` I/O error.
pub fn read_message<R: Read>(reader: &mut R) -> Result<Vec<u8>, FramingError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_MESSAGE_SIZE {
        return Err(FramingError::TooLarge { len: len as usize });
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

/// Serialize `value` as JSON and write it as one frame.
pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, value: &T) -> Result<(), FramingError> {
    let json = serde_json::to_vec(value)?;
    write_message(writer, &json)
}

/// Read one frame and deserialize it from JSON.
pub fn read_frame<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<T, FramingError> {
    let bytes = read_message(reader)?;
    Ok(serde_json::from_slice(&bytes)?)
}
