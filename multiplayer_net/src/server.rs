// Relay server: client registry and message routing over any transport.
//
// The server is a thin message broker. It accepts connections from its
// `ServerTransport`, registers each client under the id it announces in
// `Connect`, and relays `MultiPlayerMessage`s to the addressed client (or to
// every other client for a broadcast). It never looks at payloads.
//
// Join handshake, for a new client N with already-registered peers P:
// 1. N's id is inserted into the registry (rejected if already present or if
//    the protocol version differs).
// 2. `UserJoined(N)` is sent to every peer in P.
// 3. `Welcome { peers: P }` is sent to N.
// 4. `new_remote_user(N)` fires locally.
// Because every peer hears about N before N is welcomed, no peer can receive
// a message from N before knowing N exists.
//
// Leaving: when a registered connection ends (Goodbye, peer close, I/O
// failure, or server dispose), the client is evicted exactly once,
// `UserLeft` goes to the remaining clients and `remote_user_left` fires.
//
// Handshake window: when the transport sets a handshake timeout, a connection
// that has not registered within it is closed. A watchdog thread waits on a
// promise that settles on registration or on the connection ending, so it
// never outlives the window.
//
// Ownership: every accepted connection, registered or still handshaking, is
// kept in `connections` until its lifetime ends. Disposing the server marks
// it disposed, then closes everything in that table. The state check in
// `accept` happens under the table lock, so a connection accepted during
// dispose is closed either way. Connection cleanups only remove table
// entries; they never wait on the server lifetime, so a reader thread ending
// a connection cannot deadlock against a thread disposing the server. All
// callbacks hold `Weak` references to the server.
//
// Concurrency: handlers run on whichever thread delivers the message. The
// registry lock is never held while sending or firing, because in-process
// sends re-enter handlers synchronously.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::Duration;

use multiplayer_lifetime::{Deferred, Event, Lifetime, LifetimeManager, Promise};
use multiplayer_protocol::{
    ClientId, ClientMessage, MultiPlayerMessage, PROTOCOL_VERSION, Recipient, ServerId,
    ServerMessage,
};
use tracing::{debug, info, warn};

use crate::config::SocketServerConfig;
use crate::error::NetError;
use crate::in_process::InProcessServerTransport;
use crate::socket::SocketServerTransport;
use crate::sync::lock;
use crate::transport::{ServerConnection, ServerTransport};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerState {
    Created,
    Listening,
    Closed,
    Disposed,
}

struct ServerInner {
    transport: Box<dyn ServerTransport>,
    lifetime: Lifetime,
    state: Mutex<ServerState>,
    clients: Mutex<BTreeMap<ClientId, ServerConnection>>,
    connections: Mutex<HashMap<u64, ServerConnection>>,
    next_connection: AtomicU64,
    new_remote_user: Event<ClientId>,
    remote_user_left: Event<ClientId>,
    message_received: Event<MultiPlayerMessage>,
    undeliverable: Event<MultiPlayerMessage>,
}

/// Relays messages between connected clients. Dropping it disposes it.
pub struct MultiPlayerServer {
    inner: Arc<ServerInner>,
}

impl MultiPlayerServer {
    pub fn new(transport: impl ServerTransport + 'static) -> Self {
        let inner = Arc::new(ServerInner {
            transport: Box::new(transport),
            lifetime: Lifetime::new(),
            state: Mutex::new(ServerState::Created),
            clients: Mutex::new(BTreeMap::new()),
            connections: Mutex::new(HashMap::new()),
            next_connection: AtomicU64::new(0),
            new_remote_user: Event::new(),
            remote_user_left: Event::new(),
            message_received: Event::new(),
            undeliverable: Event::new(),
        });

        let weak = Arc::downgrade(&inner);
        inner.transport.new_connection().subscribe(
            move |connection: &ServerConnection| {
                if let Some(server) = weak.upgrade() {
                    server.accept(connection);
                }
            },
            inner.lifetime.manager(),
        );

        Self { inner }
    }

    /// A server reachable by in-process clients as `id`.
    pub fn in_process(id: impl Into<ServerId>) -> Self {
        Self::new(InProcessServerTransport::new(id))
    }

    /// A server listening on TCP.
    pub fn socket(config: SocketServerConfig) -> Self {
        Self::new(SocketServerTransport::new(config))
    }

    /// Start accepting clients. The state is `Listening` by the time the
    /// returned promise resolves.
    pub fn open_for_new_connections(&self) -> Promise<(), NetError> {
        if self.inner.is_disposed() {
            return Promise::rejected(NetError::Disposed);
        }
        let weak = Arc::downgrade(&self.inner);
        self.inner
            .transport
            .open_for_new_connections()
            .inspect(move |outcome| {
                if let (Ok(()), Some(server)) = (outcome, weak.upgrade()) {
                    server.set_state(ServerState::Listening);
                    info!(server = %server.transport.server_id(), "open for new connections");
                }
            })
    }

    /// Stop accepting clients. Connected clients stay connected.
    pub fn close_for_new_connections(&self) -> Promise<(), NetError> {
        if self.inner.is_disposed() {
            return Promise::rejected(NetError::Disposed);
        }
        let weak = Arc::downgrade(&self.inner);
        self.inner
            .transport
            .close_for_new_connections()
            .inspect(move |outcome| {
                if let (Ok(()), Some(server)) = (outcome, weak.upgrade()) {
                    server.set_state(ServerState::Closed);
                    info!(server = %server.transport.server_id(), "closed for new connections");
                }
            })
    }

    /// Stop listening and close every connection. Idempotent.
    pub fn dispose(&self) {
        self.inner.dispose();
    }

    pub fn state(&self) -> ServerState {
        *lock(&self.inner.state)
    }

    pub fn server_id(&self) -> ServerId {
        self.inner.transport.server_id()
    }

    /// Ends when the server is disposed.
    pub fn lifetime(&self) -> &LifetimeManager {
        self.inner.lifetime.manager()
    }

    pub fn connected_clients(&self) -> Vec<ClientId> {
        lock(&self.inner.clients).keys().copied().collect()
    }

    pub fn is_connected(&self, client_id: ClientId) -> bool {
        lock(&self.inner.clients).contains_key(&client_id)
    }

    pub fn client_count(&self) -> usize {
        lock(&self.inner.clients).len()
    }

    pub fn new_remote_user(&self) -> &Event<ClientId> {
        &self.inner.new_remote_user
    }

    pub fn remote_user_left(&self) -> &Event<ClientId> {
        &self.inner.remote_user_left
    }

    /// Every message a registered client sends, before it is routed.
    pub fn message_received(&self) -> &Event<MultiPlayerMessage> {
        &self.inner.message_received
    }

    pub fn undeliverable(&self) -> &Event<MultiPlayerMessage> {
        &self.inner.undeliverable
    }
}

impl Drop for MultiPlayerServer {
    fn drop(&mut self) {
        self.inner.dispose();
    }
}

impl ServerInner {
    fn is_disposed(&self) -> bool {
        *lock(&self.state) == ServerState::Disposed
    }

    fn set_state(&self, next: ServerState) {
        let mut state = lock(&self.state);
        if *state != ServerState::Disposed {
            *state = next;
        }
    }

    fn dispose(&self) {
        {
            let mut state = lock(&self.state);
            if *state == ServerState::Disposed {
                return;
            }
            *state = ServerState::Disposed;
        }
        info!(server = %self.transport.server_id(), "disposing server");
        self.transport.close_for_new_connections();
        self.lifetime.dispose();

        let connections = std::mem::take(&mut *lock(&self.connections));
        for connection in connections.into_values() {
            connection.close();
        }
    }

    fn accept(self: &Arc<Self>, connection: &ServerConnection) {
        let key = self.next_connection.fetch_add(1, Ordering::Relaxed);
        {
            let mut connections = lock(&self.connections);
            if self.is_disposed() {
                drop(connections);
                connection.close();
                return;
            }
            connections.insert(key, Arc::clone(connection));
        }
        let server = Arc::downgrade(self);
        connection.lifetime().on_disposed(move || {
            if let Some(server) = server.upgrade() {
                lock(&server.connections).remove(&key);
            }
        });

        // Settles once the client registered or the connection is gone.
        let greeted: Deferred<()> = Deferred::new();
        let settle = greeted.clone();
        connection.lifetime().on_disposed(move || {
            settle.resolve(()).ok();
        });
        if let Some(window) = self.transport.handshake_timeout() {
            watch_handshake(connection, greeted.promise(), window);
        }

        let registered: Arc<OnceLock<ClientId>> = Arc::new(OnceLock::new());
        let server = Arc::downgrade(self);
        let weak_connection = Arc::downgrade(connection);
        connection.received().subscribe(
            move |message: &ClientMessage| {
                let (Some(server), Some(connection)) = (server.upgrade(), weak_connection.upgrade())
                else {
                    return;
                };
                server.handle(&connection, &registered, message);
                if registered.get().is_some() && !greeted.is_settled() {
                    greeted.resolve(()).ok();
                }
            },
            connection.lifetime(),
        );
    }

    fn handle(
        self: &Arc<Self>,
        connection: &ServerConnection,
        registered: &OnceLock<ClientId>,
        message: &ClientMessage,
    ) {
        match message {
            ClientMessage::Connect {
                client_id,
                protocol_version,
            } => self.register(connection, registered, *client_id, *protocol_version),
            ClientMessage::Send(message) => match registered.get() {
                Some(&sender) => self.route(sender, message.clone()),
                None => {
                    warn!("message before connect, closing connection");
                    connection.close();
                }
            },
            ClientMessage::Goodbye => {
                debug!(client = ?registered.get(), "goodbye");
                connection.close();
            }
        }
    }

    fn register(
        self: &Arc<Self>,
        connection: &ServerConnection,
        registered: &OnceLock<ClientId>,
        client_id: ClientId,
        protocol_version: u32,
    ) {
        if registered.get().is_some() {
            warn!(client = %client_id, "second connect on one connection, closing it");
            connection.close();
            return;
        }
        if protocol_version != PROTOCOL_VERSION {
            reject(
                connection,
                format!(
                    "protocol version {protocol_version} not supported (expected {PROTOCOL_VERSION})"
                ),
            );
            return;
        }

        let peers: Vec<(ClientId, ServerConnection)> = {
            let mut clients = lock(&self.clients);
            if clients.contains_key(&client_id) {
                drop(clients);
                reject(connection, format!("client id {client_id} is already connected"));
                return;
            }
            let peers = clients
                .iter()
                .map(|(id, peer)| (*id, Arc::clone(peer)))
                .collect();
            clients.insert(client_id, Arc::clone(connection));
            peers
        };
        registered.set(client_id).ok();
        info!(client = %client_id, peers = peers.len(), "client joined");

        for (_, peer) in &peers {
            peer.send(ServerMessage::UserJoined { client_id }).ok();
        }
        connection
            .send(ServerMessage::Welcome {
                client_id,
                peers: peers.iter().map(|(id, _)| *id).collect(),
            })
            .ok();
        self.new_remote_user.fire(&client_id);

        // Runs immediately if the connection already ended.
        let server = Arc::downgrade(self);
        connection.lifetime().on_disposed(move || {
            if let Some(server) = server.upgrade() {
                server.evict(client_id);
            }
        });
    }

    fn evict(&self, client_id: ClientId) {
        let remaining: Vec<ServerConnection> = {
            let mut clients = lock(&self.clients);
            if clients.remove(&client_id).is_none() {
                return;
            }
            clients.values().cloned().collect()
        };
        info!(client = %client_id, "client left");
        if self.is_disposed() {
            return;
        }

        for peer in remaining {
            peer.send(ServerMessage::UserLeft { client_id }).ok();
        }
        self.remote_user_left.fire(&client_id);
    }

    fn route(&self, sender: ClientId, message: MultiPlayerMessage) {
        if message.sender_id() != sender {
            warn!(
                client = %sender,
                claimed = %message.sender_id(),
                "message with foreign sender id"
            );
            self.report_undeliverable(sender, message);
            return;
        }
        self.message_received.fire(&message);

        match message.recipient() {
            Recipient::Client(target) => {
                let connection = lock(&self.clients).get(&target).cloned();
                let delivered = connection
                    .is_some_and(|c| c.send(ServerMessage::Deliver(message.clone())).is_ok());
                if !delivered {
                    self.report_undeliverable(sender, message);
                }
            }
            Recipient::Broadcast => {
                let peers: Vec<ServerConnection> = lock(&self.clients)
                    .iter()
                    .filter(|(id, _)| **id != sender)
                    .map(|(_, peer)| Arc::clone(peer))
                    .collect();
                for peer in peers {
                    peer.send(ServerMessage::Deliver(message.clone())).ok();
                }
            }
        }
    }

    fn report_undeliverable(&self, sender: ClientId, message: MultiPlayerMessage) {
        debug!(
            client = %sender,
            recipient = ?message.recipient(),
            event = message.event_id(),
            "undeliverable"
        );
        self.undeliverable.fire(&message);
        let connection = lock(&self.clients).get(&sender).cloned();
        if let Some(connection) = connection {
            connection.send(ServerMessage::Undeliverable(message)).ok();
        }
    }
}

/// Close `connection` unless `greeted` settles within `window`.
fn watch_handshake(connection: &ServerConnection, greeted: Promise<()>, window: Duration) {
    let connection = Arc::downgrade(connection);
    thread::spawn(move || {
        if greeted.wait_timeout(window).is_some() {
            return;
        }
        if let Some(connection) = connection.upgrade() {
            warn!(?window, "no connect within the handshake window, closing connection");
            connection.close();
        }
    });
}

fn reject(connection: &ServerConnection, reason: String) {
    warn!(%reason, "rejecting client");
    connection.send(ServerMessage::Rejected { reason }).ok();
    connection.close();
}
