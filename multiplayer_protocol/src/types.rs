// Identity types for the multiplayer protocol.
//
// `ClientId` is generated by each client before it connects and carried in
// the connect envelope; the server only checks it is not already in use. It is
// a UUID rather than a compact counter because clients in different processes
// pick their ids without coordination.
//
// `ServerId` names a listening endpoint. The protocol never looks inside it:
// the in-process transport uses it as a registry key, the socket transport as
// a `host:port` string.

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Protocol version carried in every connect envelope.
pub const PROTOCOL_VERSION: u32 = 1;

/// Client-chosen identity, unique per connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(pub Uuid);

impl ClientId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Opaque name of a listening endpoint, interpreted only by transports.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerId(String);

impl ServerId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ServerId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for ServerId {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl From<SocketAddr> for ServerId {
    fn from(addr: SocketAddr) -> Self {
        Self(addr.to_string())
    }
}
