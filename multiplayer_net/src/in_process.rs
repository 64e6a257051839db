// In-process transport: server and clients in the same process, no I/O.
//
// A process-wide registry maps `ServerId` to the listening server. Opening
// registers the server, closing removes it, and `connect` looks the id up
// and hands out a pipe pair synchronously. The registry holds `Weak`
// references, so a dropped server transport frees its id even if it was
// never closed.
//
// A pipe pair is two `PipeEnd`s sharing one `Lifetime` and two `Event`s: one
// end's outbox is the other end's inbox. `send` fires the peer's `received`
// event on the sending thread, so a whole request/response exchange can
// complete before `send` returns. No lock is held while firing.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex, Weak};

use multiplayer_lifetime::{Event, Lifetime, LifetimeManager, Promise};
use multiplayer_protocol::{ClientMessage, ServerId, ServerMessage};
use tracing::debug;

use crate::error::NetError;
use crate::sync::lock;
use crate::transport::{ClientConnection, ClientTransport, Connection, ServerConnection, ServerTransport};

static REGISTRY: LazyLock<Mutex<HashMap<ServerId, Weak<ListenerInner>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

struct ListenerInner {
    id: ServerId,
    new_connection: Event<ServerConnection>,
}

/// Listening half of the in-process transport.
pub struct InProcessServerTransport {
    inner: Arc<ListenerInner>,
}

impl InProcessServerTransport {
    pub fn new(id: impl Into<ServerId>) -> Self {
        Self {
            inner: Arc::new(ListenerInner {
                id: id.into(),
                new_connection: Event::new(),
            }),
        }
    }

    /// Remove our registry entry, leaving any other server's entry alone.
    fn unregister(&self) {
        let mut registry = lock(&REGISTRY);
        let ours = registry
            .get(&self.inner.id)
            .is_some_and(|entry| entry.as_ptr() == Arc::as_ptr(&self.inner));
        if ours {
            registry.remove(&self.inner.id);
        }
    }
}

impl ServerTransport for InProcessServerTransport {
    fn server_id(&self) -> ServerId {
        self.inner.id.clone()
    }

    fn open_for_new_connections(&self) -> Promise<(), NetError> {
        if self.inner.id.as_str().is_empty() {
            return Promise::rejected(NetError::InvalidServerId(self.inner.id.clone()));
        }
        let mut registry = lock(&REGISTRY);
        let holder = registry.get(&self.inner.id).and_then(Weak::upgrade);
        match holder {
            Some(holder) if !Arc::ptr_eq(&holder, &self.inner) => {
                Promise::rejected(NetError::ServerIdInUse(self.inner.id.clone()))
            }
            _ => {
                registry.insert(self.inner.id.clone(), Arc::downgrade(&self.inner));
                debug!(server = %self.inner.id, "in-process server open");
                Promise::resolved(())
            }
        }
    }

    fn close_for_new_connections(&self) -> Promise<(), NetError> {
        self.unregister();
        debug!(server = %self.inner.id, "in-process server closed for new connections");
        Promise::resolved(())
    }

    fn new_connection(&self) -> &Event<ServerConnection> {
        &self.inner.new_connection
    }
}

impl Drop for InProcessServerTransport {
    fn drop(&mut self) {
        self.unregister();
    }
}

/// Connecting half of the in-process transport. Stateless.
#[derive(Clone, Copy, Debug, Default)]
pub struct InProcessClientTransport;

impl InProcessClientTransport {
    pub fn new() -> Self {
        Self
    }
}

impl ClientTransport for InProcessClientTransport {
    fn connect(&self, server: &ServerId) -> Promise<ClientConnection, NetError> {
        let listener = lock(&REGISTRY).get(server).and_then(Weak::upgrade);
        let Some(listener) = listener else {
            return Promise::rejected(NetError::ServerNotFound(server.clone()));
        };

        let (server_end, client_end) = pipe_pair();
        listener.new_connection.fire(&server_end);
        Promise::resolved(client_end)
    }
}

struct PipeEnd<Out, In> {
    outbox: Event<Out>,
    inbox: Event<In>,
    lifetime: Lifetime,
}

impl<Out: 'static, In: 'static> Connection<Out, In> for PipeEnd<Out, In> {
    fn send(&self, message: Out) -> Result<(), NetError> {
        if self.lifetime.is_expired() {
            return Err(NetError::ConnectionClosed);
        }
        self.outbox.fire(&message);
        Ok(())
    }

    fn received(&self) -> &Event<In> {
        &self.inbox
    }

    fn lifetime(&self) -> &LifetimeManager {
        self.lifetime.manager()
    }

    fn close(&self) {
        self.lifetime.dispose();
    }
}

fn pipe_pair() -> (ServerConnection, ClientConnection) {
    let to_server: Event<ClientMessage> = Event::new();
    let to_client: Event<ServerMessage> = Event::new();
    let lifetime = Lifetime::new();
    let server_end = PipeEnd {
        outbox: to_client.clone(),
        inbox: to_server.clone(),
        lifetime: lifetime.clone(),
    };
    let client_end = PipeEnd {
        outbox: to_server,
        inbox: to_client,
        lifetime,
    };
    (Arc::new(server_end), Arc::new(client_end))
}
