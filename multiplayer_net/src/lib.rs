// multiplayer_net — transports, relay server and client for multiplayer
// messaging.
//
// A `MultiPlayerServer` relays `MultiPlayerMessage`s between
// `MultiPlayerClient`s. Neither side touches sockets directly: both talk to a
// transport pair, so the same server and client logic runs in-process (tests,
// single-process games) or over TCP (the `relay` binary).
//
// Module overview:
// - `transport.rs`:  `Connection`, `ServerTransport` and `ClientTransport`
//                    traits, the contract every transport implements.
// - `in_process.rs`: Process-wide registry and synchronous in-memory pipes.
// - `socket.rs`:     TCP listener with an accept thread, dialing with a
//                    timeout, and one reader thread per connection decoding
//                    length-prefixed JSON frames.
// - `server.rs`:     Client registry, join/leave handshake and routing.
// - `client.rs`:     Connection state machine and peer tracking.
// - `config.rs`:     Socket and relay configuration, plus argument parsing
//                    for the binary.
// - `error.rs`:      `NetError`.
//
// Dependencies: `multiplayer_lifetime` (lifetimes, promises, events) and
// `multiplayer_protocol` (message types and framing). No async runtime.
//
// The relay can run as a standalone binary (`main.rs`) or be embedded in a
// game process via `MultiPlayerServer::socket`.

pub mod client;
pub mod config;
pub mod error;
pub mod in_process;
pub mod server;
pub mod socket;
pub mod transport;

mod sync;

pub use client::{ClientState, MultiPlayerClient};
pub use config::{RelayConfig, SocketClientConfig, SocketServerConfig};
pub use error::NetError;
pub use in_process::{InProcessClientTransport, InProcessServerTransport};
pub use server::{MultiPlayerServer, ServerState};
pub use socket::{SocketClientTransport, SocketServerTransport};
pub use transport::{ClientConnection, ClientTransport, Connection, ServerConnection, ServerTransport};
