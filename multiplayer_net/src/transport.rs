// Transport capability traits.
//
// The relay server and client never touch sockets directly; they talk to a
// `ServerTransport` / `ClientTransport` pair and to the `Connection`s those
// produce. Two implementations satisfy the same contract:
// - `in_process.rs`: a process-wide registry and synchronous in-memory pipes.
// - `socket.rs`:     TCP with length-prefixed JSON frames.
//
// Contract for a `Connection`:
// - `send` queues one message for the peer. Messages on one connection arrive
//   in order.
// - `received` fires once per incoming message, on whichever thread delivers
//   it (the sender's thread in-process, the reader thread for sockets).
// - `lifetime` ends exactly once, when either side closes or the link fails.
//   It is the only disconnect notification.
// - `close` ends the lifetime; closing twice is harmless. Messages sent
//   before `close` are still delivered if the link allows.
//
// Transports may also bound the `Connect`/`Welcome` exchange through
// `handshake_timeout`; the protocol layer enforces it.

use std::sync::Arc;
use std::time::Duration;

use multiplayer_lifetime::{Event, LifetimeManager, Promise};
use multiplayer_protocol::{ClientMessage, ServerId, ServerMessage};

use crate::error::NetError;

/// One end of an established link. `Out` is what this end sends.
pub trait Connection<Out, In>: Send + Sync {
    fn send(&self, message: Out) -> Result<(), NetError>;
    fn received(&self) -> &Event<In>;
    fn lifetime(&self) -> &LifetimeManager;
    fn close(&self);

    fn is_open(&self) -> bool {
        !self.lifetime().is_expired()
    }
}

/// Server side of a connection: sends `ServerMessage`, receives `ClientMessage`.
pub type ServerConnection = Arc<dyn Connection<ServerMessage, ClientMessage>>;

/// Client side of a connection: sends `ClientMessage`, receives `ServerMessage`.
pub type ClientConnection = Arc<dyn Connection<ClientMessage, ServerMessage>>;

/// Listening half of a transport.
pub trait ServerTransport: Send + Sync {
    /// Identity clients use to reach this server. For sockets this is only
    /// final once the listener is bound.
    fn server_id(&self) -> ServerId;

    /// Start accepting connections. Resolves once clients can connect.
    fn open_for_new_connections(&self) -> Promise<(), NetError>;

    /// Stop accepting connections. Existing connections are unaffected.
    fn close_for_new_connections(&self) -> Promise<(), NetError>;

    /// Fires for every accepted connection, before any message from it is
    /// delivered.
    fn new_connection(&self) -> &Event<ServerConnection>;

    /// How long an accepted connection may stay unregistered. `None` waits
    /// forever.
    fn handshake_timeout(&self) -> Option<Duration> {
        None
    }
}

/// Connecting half of a transport.
pub trait ClientTransport: Send + Sync {
    fn connect(&self, server: &ServerId) -> Promise<ClientConnection, NetError>;

    /// How long to wait for `Welcome` once connected. `None` waits forever.
    fn handshake_timeout(&self) -> Option<Duration> {
        None
    }
}
