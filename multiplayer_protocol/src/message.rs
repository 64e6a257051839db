// Protocol messages for client-server communication.
//
// `MultiPlayerMessage` is the application envelope: who sent it, who it is
// for, a free-form event tag, and an opaque payload. The server routes on
// `recipient` and never looks at `event_id` or `payload`.
//
// Two enums carry envelopes and membership changes over a connection:
// - `ClientMessage`: client → server.
// - `ServerMessage`: server → client.
//
// The in-process transport passes these values directly; the socket transport
// serializes them to JSON and frames them (see `framing.rs`).

use serde::{Deserialize, Serialize};

use crate::types::ClientId;

/// Addressee of a `MultiPlayerMessage`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Recipient {
    /// A single connected client.
    Client(ClientId),
    /// Every connected client except the sender.
    Broadcast,
}

/// Application envelope relayed by the server. Immutable once built.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiPlayerMessage {
    sender_id: ClientId,
    recipient: Recipient,
    event_id: String,
    payload: Vec<u8>,
}

impl MultiPlayerMessage {
    pub fn new(
        sender_id: ClientId,
        recipient: Recipient,
        event_id: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            sender_id,
            recipient,
            event_id: event_id.into(),
            payload: payload.into(),
        }
    }

    pub fn sender_id(&self) -> ClientId {
        self.sender_id
    }

    pub fn recipient(&self) -> Recipient {
        self.recipient
    }

    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// The payload as UTF-8 text, if it is valid UTF-8.
    pub fn payload_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    pub fn is_broadcast(&self) -> bool {
        self.recipient == Recipient::Broadcast
    }
}

/// Messages sent by a client to the server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Handshake: the first message on every connection.
    Connect {
        client_id: ClientId,
        protocol_version: u32,
    },
    /// An application message to relay.
    Send(MultiPlayerMessage),
    /// The client is leaving gracefully.
    Goodbye,
}

/// Messages sent by the server to a client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Handshake accepted. `peers` lists the clients already connected.
    Welcome {
        client_id: ClientId,
        peers: Vec<ClientId>,
    },
    /// Handshake refused; the server closes the connection after sending it.
    Rejected { reason: String },
    /// Another client connected.
    UserJoined { client_id: ClientId },
    /// Another client disconnected.
    UserLeft { client_id: ClientId },
    /// A relayed application message.
    Deliver(MultiPlayerMessage),
    /// A message this client sent could not be routed.
    Undeliverable(MultiPlayerMessage),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accessors_expose_constructed_fields() {
        let alice = ClientId::generate();
        let bob = ClientId::generate();
        let msg = MultiPlayerMessage::new(alice, Recipient::Client(bob), "HelloWorld1", "hi");

        assert_eq!(msg.sender_id(), alice);
        assert_eq!(msg.recipient(), Recipient::Client(bob));
        assert_eq!(msg.event_id(), "HelloWorld1");
        assert_eq!(msg.payload(), b"hi");
        assert_eq!(msg.payload_text(), Some("hi"));
        assert!(!msg.is_broadcast());
    }

    #[test]
    fn binary_payload_has_no_text() {
        let msg = MultiPlayerMessage::new(
            ClientId::generate(),
            Recipient::Broadcast,
            "blob",
            vec![0xFF, 0xFE, 0x00],
        );
        assert!(msg.is_broadcast());
        assert_eq!(msg.payload_text(), None);
    }
}
