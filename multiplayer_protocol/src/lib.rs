// multiplayer_protocol — wire vocabulary shared by multiplayer servers,
// clients and transports.
//
// This crate defines identity types, the application message envelope, the
// connection-level message enums, and the byte framing used by the socket
// transport. It has no knowledge of transports or lifetimes.
//
// Module overview:
// - `types.rs`:    `ClientId`, `ServerId`, `PROTOCOL_VERSION`.
// - `message.rs`:  `MultiPlayerMessage` and `Recipient`, plus the
//                  `ClientMessage` / `ServerMessage` enums exchanged over a
//                  connection.
// - `framing.rs`:  Length-delimited framing over any `Read`/`Write` stream:
//                  4-byte big-endian length prefix, then JSON payload.
//
// Design decisions:
// - **JSON serialization.** Human-readable on the wire, which helps when
//   debugging the relay with packet captures.
// - **Payloads as opaque `Vec<u8>`.** The server never inspects application
//   payloads, only the recipient.
// - **No async runtime.** Uses `std::io::Read`/`Write` for framing, compatible
//   with both blocking TCP streams and buffered wrappers.

pub mod framing;
pub mod message;
pub mod types;

pub use framing::{FramingError, MAX_MESSAGE_SIZE, read_frame, read_message, write_frame, write_message};
pub use message::{ClientMessage, MultiPlayerMessage, Recipient, ServerMessage};
pub use types::{ClientId, PROTOCOL_VERSION, ServerId};
