// Error type shared by transports, the relay server and the client.
//
// `NetError` travels through `Promise`s, which hand out clones of their
// outcome, so it must be `Clone`. I/O errors are not, so they are held in an
// `Arc`.

use std::io;
use std::sync::Arc;

use multiplayer_protocol::{ClientId, FramingError, ServerId};
use thiserror::Error;

#[derive(Clone, Debug, Error)]
pub enum NetError {
    #[error("i/o error: {0}")]
    Io(Arc<io::Error>),
    #[error("framing error: {0}")]
    Framing(String),
    #[error("no server listening as {0}")]
    ServerNotFound(ServerId),
    #[error("another server is already listening as {0}")]
    ServerIdInUse(ServerId),
    #[error("invalid server id: {0}")]
    InvalidServerId(ServerId),
    #[error("timed out")]
    Timeout,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("not connected")]
    NotConnected,
    #[error("already connected or connecting")]
    AlreadyConnected,
    #[error("disposed")]
    Disposed,
    #[error("rejected by server: {0}")]
    Rejected(String),
    #[error("message claims sender {0}, which is not this client")]
    ForeignSender(ClientId),
}

impl From<io::Error> for NetError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::TimedOut => NetError::Timeout,
            _ => NetError::Io(Arc::new(e)),
        }
    }
}

impl From<FramingError> for NetError {
    fn from(e: FramingError) -> Self {
        match e {
            FramingError::Io(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                NetError::ConnectionClosed
            }
            FramingError::Io(e) => NetError::from(e),
            other => NetError::Framing(other.to_string()),
        }
    }
}
