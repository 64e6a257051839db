// Relay client: one connection to a `MultiPlayerServer` over any transport.
//
// Life of a client:
// - `Created`: has an id (generated, or given by the caller) but no
//   connection.
// - `Connecting`: the transport is dialing, or the connection is open and
//   `Connect` has been sent. The promise from `connect()` is pending.
// - `Connected`: `Welcome` arrived. The peers it listed have been reported
//   through `new_remote_user`, and the connect promise is resolved.
// - `Disconnected`: the server went away, rejected us, or the transport
//   failed. Terminal; clients are not reused.
// - `Disposed`: `dispose()` was called (or the client was dropped). A
//   best-effort `Goodbye` is sent, the connection is closed, and no event
//   fires afterwards.
//
// Peer bookkeeping: the client keeps the current peer set so it never reports
// a peer twice, or itself. A `UserLeft` that overtakes the `Welcome` listing
// the same peer is remembered in `departed_early`, so that peer is not
// reported as joined afterwards.
//
// Handshake: when the transport sets a handshake timeout, a watchdog thread
// waits on the connect promise and gives up (`NetError::Timeout`, connection
// closed) if no `Welcome` arrives in time.
//
// Handlers run on whichever thread delivers the message (the reader thread
// for sockets, the sending thread in-process). The session lock is never held
// while sending, firing, or settling a promise. Every notification goes
// through `notify`, which records the firing thread in the session; `dispose`
// marks the client disposed and then waits until no other thread is still
// inside a notification, so nothing fires once `dispose` has returned.

use std::collections::BTreeSet;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, ThreadId};
use std::time::Duration;

use multiplayer_lifetime::{Deferred, Event, Lifetime, LifetimeManager, Promise};
use multiplayer_protocol::{
    ClientId, ClientMessage, MultiPlayerMessage, PROTOCOL_VERSION, Recipient, ServerId,
    ServerMessage,
};
use tracing::{debug, info, warn};

use crate::config::SocketClientConfig;
use crate::error::NetError;
use crate::in_process::InProcessClientTransport;
use crate::socket::SocketClientTransport;
use crate::sync::lock;
use crate::transport::{ClientConnection, ClientTransport};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientState {
    Created,
    Connecting,
    Connected,
    Disconnected,
    Disposed,
}

struct Session {
    state: ClientState,
    connection: Option<ClientConnection>,
    pending: Option<Deferred<(), NetError>>,
    peers: BTreeSet<ClientId>,
    departed_early: BTreeSet<ClientId>,
    /// Threads currently inside `notify`.
    dispatching: Vec<ThreadId>,
}

struct ClientInner {
    id: ClientId,
    transport: Box<dyn ClientTransport>,
    lifetime: Lifetime,
    session: Mutex<Session>,
    idle: Condvar,
    new_remote_user: Event<ClientId>,
    remote_user_left: Event<ClientId>,
    message_received: Event<MultiPlayerMessage>,
    undeliverable: Event<MultiPlayerMessage>,
    disconnected: Event<()>,
}

/// A participant connected through a relay server. Dropping it disposes it.
pub struct MultiPlayerClient {
    inner: Arc<ClientInner>,
}

impl MultiPlayerClient {
    pub fn new(transport: impl ClientTransport + 'static) -> Self {
        Self::with_id(transport, ClientId::generate())
    }

    /// A client with a caller-chosen id.
    pub fn with_id(transport: impl ClientTransport + 'static, id: ClientId) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                id,
                transport: Box::new(transport),
                lifetime: Lifetime::new(),
                session: Mutex::new(Session {
                    state: ClientState::Created,
                    connection: None,
                    pending: None,
                    peers: BTreeSet::new(),
                    departed_early: BTreeSet::new(),
                    dispatching: Vec::new(),
                }),
                idle: Condvar::new(),
                new_remote_user: Event::new(),
                remote_user_left: Event::new(),
                message_received: Event::new(),
                undeliverable: Event::new(),
                disconnected: Event::new(),
            }),
        }
    }

    pub fn in_process() -> Self {
        Self::new(InProcessClientTransport::new())
    }

    pub fn socket(config: SocketClientConfig) -> Self {
        Self::new(SocketClientTransport::new(config))
    }

    /// Connect and introduce ourselves. Resolves once the server has welcomed
    /// us and the peers it listed have been reported. Only valid once.
    pub fn connect(&self, server: &ServerId) -> Promise<(), NetError> {
        let deferred = Deferred::new();
        let promise = deferred.promise();
        {
            let mut session = lock(&self.inner.session);
            match session.state {
                ClientState::Created => {}
                ClientState::Disposed => return Promise::rejected(NetError::Disposed),
                _ => return Promise::rejected(NetError::AlreadyConnected),
            }
            session.state = ClientState::Connecting;
            session.pending = Some(deferred);
        }
        info!(client = %self.inner.id, %server, "connecting");

        let weak = Arc::downgrade(&self.inner);
        self.inner
            .transport
            .connect(server)
            .on_complete(move |outcome| match (weak.upgrade(), outcome) {
                (Some(client), Ok(connection)) => client.attach(connection),
                (Some(client), Err(e)) => client.fail_connect(e.clone()),
                (None, Ok(connection)) => connection.close(),
                (None, Err(_)) => {}
            });
        promise
    }

    /// Send `message` to the server for relaying. The message must carry this
    /// client's id as sender.
    pub fn send_message(&self, message: MultiPlayerMessage) -> Result<(), NetError> {
        if message.sender_id() != self.inner.id {
            return Err(NetError::ForeignSender(message.sender_id()));
        }
        let connection = {
            let session = lock(&self.inner.session);
            match (session.state, &session.connection) {
                (ClientState::Connected, Some(connection)) => Arc::clone(connection),
                (ClientState::Disposed, _) => return Err(NetError::Disposed),
                _ => return Err(NetError::NotConnected),
            }
        };
        connection.send(ClientMessage::Send(message))
    }

    /// Like `send_message`, reporting only whether the message went out.
    pub fn try_send_message(&self, message: MultiPlayerMessage) -> bool {
        match self.send_message(message) {
            Ok(()) => true,
            Err(e) => {
                debug!(client = %self.inner.id, error = %e, "send failed");
                false
            }
        }
    }

    /// A message from this client.
    pub fn message_to(
        &self,
        recipient: Recipient,
        event_id: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> MultiPlayerMessage {
        MultiPlayerMessage::new(self.inner.id, recipient, event_id, payload)
    }

    pub fn send_to(
        &self,
        recipient: Recipient,
        event_id: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Result<(), NetError> {
        self.send_message(self.message_to(recipient, event_id, payload))
    }

    /// Say goodbye, close the connection, and end the client lifetime.
    /// Idempotent.
    pub fn dispose(&self) {
        self.inner.dispose();
    }

    pub fn client_id(&self) -> ClientId {
        self.inner.id
    }

    pub fn state(&self) -> ClientState {
        lock(&self.inner.session).state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ClientState::Connected
    }

    /// Peers currently known to be connected, excluding ourselves.
    pub fn remote_users(&self) -> Vec<ClientId> {
        lock(&self.inner.session).peers.iter().copied().collect()
    }

    /// Ends when the client is disposed.
    pub fn lifetime(&self) -> &LifetimeManager {
        self.inner.lifetime.manager()
    }

    pub fn new_remote_user(&self) -> &Event<ClientId> {
        &self.inner.new_remote_user
    }

    pub fn remote_user_left(&self) -> &Event<ClientId> {
        &self.inner.remote_user_left
    }

    pub fn message_received(&self) -> &Event<MultiPlayerMessage> {
        &self.inner.message_received
    }

    /// Messages we sent that the server could not route.
    pub fn undeliverable(&self) -> &Event<MultiPlayerMessage> {
        &self.inner.undeliverable
    }

    /// Fires once if the connection is lost after we were welcomed.
    pub fn disconnected(&self) -> &Event<()> {
        &self.inner.disconnected
    }
}

impl Drop for MultiPlayerClient {
    fn drop(&mut self) {
        self.inner.dispose();
    }
}

impl ClientInner {
    fn attach(self: &Arc<Self>, connection: &ClientConnection) {
        let welcome = {
            let mut session = lock(&self.session);
            if session.state != ClientState::Connecting {
                drop(session);
                connection.close();
                return;
            }
            session.connection = Some(Arc::clone(connection));
            session.pending.as_ref().map(Deferred::promise)
        };

        // Stop listening as soon as either side is done.
        let scope = Lifetime::earliest_of(&[
            connection.lifetime().clone(),
            self.lifetime.manager().clone(),
        ]);
        let client = Arc::downgrade(self);
        connection.received().subscribe(
            move |message: &ServerMessage| {
                if let Some(client) = client.upgrade() {
                    client.handle(message);
                }
            },
            scope.manager(),
        );

        let client = Arc::downgrade(self);
        connection.lifetime().on_disposed(move || {
            if let Some(client) = client.upgrade() {
                client.connection_lost();
            }
        });

        let hello = ClientMessage::Connect {
            client_id: self.id,
            protocol_version: PROTOCOL_VERSION,
        };
        if let Err(e) = connection.send(hello) {
            self.fail_connect(e);
            return;
        }

        if let (Some(window), Some(welcome)) = (self.transport.handshake_timeout(), welcome) {
            let client = Arc::downgrade(self);
            thread::spawn(move || {
                if welcome.wait_timeout(window).is_some() {
                    return;
                }
                if let Some(client) = client.upgrade() {
                    client.handshake_timed_out(window);
                }
            });
        }
    }

    fn handshake_timed_out(&self, window: Duration) {
        let (pending, connection) = {
            let mut session = lock(&self.session);
            if session.state != ClientState::Connecting {
                return;
            }
            session.state = ClientState::Disconnected;
            (session.pending.take(), session.connection.take())
        };
        warn!(client = %self.id, ?window, "no welcome from the server, giving up");
        if let Some(pending) = pending {
            pending.reject(NetError::Timeout).ok();
        }
        if let Some(connection) = connection {
            connection.close();
        }
    }

    fn fail_connect(&self, error: NetError) {
        let pending = {
            let mut session = lock(&self.session);
            if session.state != ClientState::Connecting {
                return;
            }
            session.state = ClientState::Disconnected;
            session.pending.take()
        };
        warn!(client = %self.id, %error, "connect failed");
        if let Some(pending) = pending {
            pending.reject(error).ok();
        }
    }

    fn handle(&self, message: &ServerMessage) {
        match message {
            ServerMessage::Welcome { client_id, peers } => self.welcomed(*client_id, peers),
            ServerMessage::Rejected { reason } => {
                self.fail_connect(NetError::Rejected(reason.clone()));
            }
            ServerMessage::UserJoined { client_id } => self.peer_joined(*client_id),
            ServerMessage::UserLeft { client_id } => self.peer_left(*client_id),
            ServerMessage::Deliver(message) => {
                if self.is_live() {
                    self.notify(&self.message_received, message);
                }
            }
            ServerMessage::Undeliverable(message) => {
                if self.is_live() {
                    self.notify(&self.undeliverable, message);
                }
            }
        }
    }

    fn is_live(&self) -> bool {
        matches!(
            lock(&self.session).state,
            ClientState::Connecting | ClientState::Connected
        )
    }

    /// Fire `event` unless the client is disposed.
    fn notify<T: 'static>(&self, event: &Event<T>, value: &T) {
        let me = thread::current().id();
        {
            let mut session = lock(&self.session);
            if session.state == ClientState::Disposed {
                return;
            }
            session.dispatching.push(me);
        }
        let _dispatch = Dispatch {
            client: self,
            thread: me,
        };
        event.fire(value);
    }

    fn welcomed(&self, client_id: ClientId, peers: &[ClientId]) {
        if client_id != self.id {
            warn!(client = %self.id, welcomed = %client_id, "welcome addressed to another id");
        }
        let (joined, pending) = {
            let mut session = lock(&self.session);
            if session.state != ClientState::Connecting {
                return;
            }
            session.state = ClientState::Connected;
            let mut joined = Vec::new();
            for &peer in peers {
                if peer != self.id
                    && !session.departed_early.contains(&peer)
                    && session.peers.insert(peer)
                {
                    joined.push(peer);
                }
            }
            session.departed_early.clear();
            (joined, session.pending.take())
        };
        info!(client = %self.id, peers = joined.len(), "connected");

        for peer in &joined {
            self.notify(&self.new_remote_user, peer);
        }
        if let Some(pending) = pending {
            pending.resolve(()).ok();
        }
    }

    fn peer_joined(&self, peer: ClientId) {
        let fresh = {
            let mut session = lock(&self.session);
            matches!(
                session.state,
                ClientState::Connecting | ClientState::Connected
            ) && peer != self.id
                && session.peers.insert(peer)
        };
        if fresh {
            debug!(client = %self.id, %peer, "peer joined");
            self.notify(&self.new_remote_user, &peer);
        }
    }

    fn peer_left(&self, peer: ClientId) {
        let gone = {
            let mut session = lock(&self.session);
            match session.state {
                ClientState::Connected => session.peers.remove(&peer),
                ClientState::Connecting => {
                    let known = session.peers.remove(&peer);
                    if !known {
                        session.departed_early.insert(peer);
                    }
                    known
                }
                _ => false,
            }
        };
        if gone {
            debug!(client = %self.id, %peer, "peer left");
            self.notify(&self.remote_user_left, &peer);
        }
    }

    fn connection_lost(&self) {
        let (was_connected, pending) = {
            let mut session = lock(&self.session);
            let previous = session.state;
            match previous {
                ClientState::Connecting | ClientState::Connected => {
                    session.state = ClientState::Disconnected;
                    session.connection = None;
                    session.peers.clear();
                    (
                        previous == ClientState::Connected,
                        session.pending.take(),
                    )
                }
                _ => {
                    session.connection = None;
                    (false, None)
                }
            }
        };
        if let Some(pending) = pending {
            pending.reject(NetError::ConnectionClosed).ok();
        }
        if was_connected {
            info!(client = %self.id, "disconnected from server");
            self.notify(&self.disconnected, &());
        }
    }

    fn dispose(&self) {
        let me = thread::current().id();
        let (connection, pending) = {
            let mut session = lock(&self.session);
            if session.state == ClientState::Disposed {
                return;
            }
            session.state = ClientState::Disposed;
            session.peers.clear();
            // A handler disposing its own client is not waited for.
            while session.dispatching.iter().any(|t| *t != me) {
                session = self
                    .idle
                    .wait(session)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            (session.connection.take(), session.pending.take())
        };
        debug!(client = %self.id, "disposing client");

        if let Some(pending) = pending {
            pending.reject(NetError::Disposed).ok();
        }
        self.lifetime.dispose();
        if let Some(connection) = connection {
            connection.send(ClientMessage::Goodbye).ok();
            connection.close();
        }
    }
}

/// Marks one thread as inside `notify` until dropped, even if a handler
/// panics.
struct Dispatch<'a> {
    client: &'a ClientInner,
    thread: ThreadId,
}

impl Drop for Dispatch<'_> {
    fn drop(&mut self) {
        let mut session = lock(&self.client.session);
        if let Some(index) = session.dispatching.iter().position(|t| *t == self.thread) {
            session.dispatching.swap_remove(index);
        }
        drop(session);
        self.client.idle.notify_all();
    }
}
