// TCP transport: length-prefixed JSON frames over `std::net` sockets.
//
// Architecture: thread-per-reader, no async runtime.
//
// - **Accept thread** (one per open server): polls a non-blocking
//   `TcpListener` until the listening lifetime ends, sleeping 50ms whenever
//   there is nothing to accept. Each accepted stream becomes a
//   `TcpConnection`, is announced through `new_connection`, and only then gets
//   its reader thread, so subscribers never miss the first message.
// - **Connect thread** (one per `connect` call): resolves the `host:port`
//   server id, connects with the configured timeout, resolves the promise,
//   then starts the reader.
// - **Reader threads** (one per connection): call `read_frame()` in a loop
//   and fire `received` for each message. On EOF, error or a malformed frame
//   they end the connection lifetime and exit.
// - **Writer threads** (one per connection): drain the connection's outbound
//   queue with `write_frame()`. `send` only enqueues, so a peer that stops
//   reading never blocks the thread relaying to it. A write that makes no
//   progress within the write timeout, or a queue that fills up, drops that
//   peer.
//
// Ending a connection's lifetime closes its queue. The writer flushes what
// was already queued (so a final `Rejected` or `Goodbye` still goes out),
// then shuts the socket down in both directions, which also unblocks the
// reader.

use std::io::{self, BufReader, BufWriter};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use multiplayer_lifetime::{Deferred, Event, Lifetime, LifetimeManager, Promise};
use multiplayer_protocol::{ClientMessage, ServerId, ServerMessage, read_frame, write_frame};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::config::{SocketClientConfig, SocketServerConfig};
use crate::error::NetError;
use crate::sync::lock;
use crate::transport::{ClientConnection, ClientTransport, Connection, ServerConnection, ServerTransport};

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Frames a connection may have queued before its peer counts as stalled.
const OUTBOX_CAPACITY: usize = 1024;

type Outbox<Out> = Arc<Mutex<Option<SyncSender<Out>>>>;

/// A framed TCP stream. `Out` is what this end writes.
pub struct TcpConnection<Out, In> {
    outbox: Outbox<Out>,
    received: Event<In>,
    lifetime: Lifetime,
    peer: SocketAddr,
}

impl<Out, In> TcpConnection<Out, In>
where
    Out: Serialize + Send + 'static,
    In: DeserializeOwned + Send + 'static,
{
    /// Wrap a connected stream and start its writer. The reader is returned
    /// separately and must be handed to `start_reader` once subscribers are
    /// attached.
    fn open(
        stream: TcpStream,
        write_timeout: Duration,
    ) -> io::Result<(Arc<Self>, BufReader<TcpStream>)> {
        stream.set_nodelay(true).ok();
        stream.set_write_timeout(Some(write_timeout))?;
        let peer = stream.peer_addr()?;
        let reader = BufReader::new(stream.try_clone()?);

        let (sender, queued) = mpsc::sync_channel(OUTBOX_CAPACITY);
        let outbox: Outbox<Out> = Arc::new(Mutex::new(Some(sender)));
        let lifetime = Lifetime::new();
        let closing = Arc::clone(&outbox);
        lifetime.on_disposed(move || {
            lock(&closing).take();
        });

        let writer = BufWriter::new(stream);
        let writer_lifetime = lifetime.clone();
        thread::spawn(move || writer_loop(writer, queued, writer_lifetime, peer));

        let connection = Arc::new(Self {
            outbox,
            received: Event::new(),
            lifetime,
            peer,
        });
        Ok((connection, reader))
    }

    fn start_reader(&self, reader: BufReader<TcpStream>) {
        let received = self.received.clone();
        let lifetime = self.lifetime.clone();
        let peer = self.peer;
        thread::spawn(move || reader_loop::<In>(reader, received, lifetime, peer));
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

impl<Out, In> Connection<Out, In> for TcpConnection<Out, In>
where
    Out: Serialize + Send + 'static,
    In: DeserializeOwned + Send + 'static,
{
    fn send(&self, message: Out) -> Result<(), NetError> {
        let queued = match lock(&self.outbox).as_ref() {
            Some(outbox) => outbox.try_send(message),
            None => return Err(NetError::ConnectionClosed),
        };
        match queued {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!(peer = %self.peer, "peer is not keeping up, dropping connection");
                self.lifetime.dispose();
                Err(NetError::ConnectionClosed)
            }
            Err(TrySendError::Disconnected(_)) => Err(NetError::ConnectionClosed),
        }
    }

    fn received(&self) -> &Event<In> {
        &self.received
    }

    fn lifetime(&self) -> &LifetimeManager {
        self.lifetime.manager()
    }

    fn close(&self) {
        self.lifetime.dispose();
    }
}

impl<Out, In> Drop for TcpConnection<Out, In> {
    /// The writer only exits once the outbox closes, so the last handle going
    /// away has to end the connection.
    fn drop(&mut self) {
        self.lifetime.dispose();
    }
}

fn reader_loop<In: DeserializeOwned + 'static>(
    mut reader: BufReader<TcpStream>,
    received: Event<In>,
    lifetime: Lifetime,
    peer: SocketAddr,
) {
    while !lifetime.is_expired() {
        match read_frame::<_, In>(&mut reader) {
            Ok(message) => received.fire(&message),
            Err(e) if e.is_disconnect() => {
                debug!(%peer, "peer closed the connection");
                break;
            }
            Err(e) => {
                if !lifetime.is_expired() {
                    warn!(%peer, error = %e, "dropping connection");
                }
                break;
            }
        }
    }
    lifetime.dispose();
}

fn writer_loop<Out: Serialize>(
    mut writer: BufWriter<TcpStream>,
    queued: Receiver<Out>,
    lifetime: Lifetime,
    peer: SocketAddr,
) {
    // Ends once the lifetime dropped the sender and the queue is empty.
    for message in queued.iter() {
        if let Err(e) = write_frame(&mut writer, &message) {
            if !lifetime.is_expired() {
                warn!(%peer, error = %e, "write failed, dropping connection");
            }
            break;
        }
    }
    writer.get_ref().shutdown(Shutdown::Both).ok();
    lifetime.dispose();
}

struct Listening {
    lifetime: Lifetime,
    stopped: Promise<(), NetError>,
}

struct SocketServerInner {
    config: SocketServerConfig,
    new_connection: Event<ServerConnection>,
    bound: Mutex<Option<SocketAddr>>,
    listening: Mutex<Option<Listening>>,
}

/// Listening half of the TCP transport.
pub struct SocketServerTransport {
    inner: Arc<SocketServerInner>,
}

impl SocketServerTransport {
    pub fn new(config: SocketServerConfig) -> Self {
        Self {
            inner: Arc::new(SocketServerInner {
                config,
                new_connection: Event::new(),
                bound: Mutex::new(None),
                listening: Mutex::new(None),
            }),
        }
    }

    /// The address actually bound, once open. With port 0 this is where the
    /// OS-assigned port shows up.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.inner.bound)
    }

    fn stop(&self) -> Promise<(), NetError> {
        let listening = lock(&self.inner.listening).take();
        match listening {
            Some(listening) => {
                listening.lifetime.dispose();
                listening.stopped
            }
            None => Promise::resolved(()),
        }
    }
}

impl ServerTransport for SocketServerTransport {
    fn server_id(&self) -> ServerId {
        let addr = self
            .local_addr()
            .unwrap_or_else(|| self.inner.config.socket_addr());
        ServerId::from(addr)
    }

    fn open_for_new_connections(&self) -> Promise<(), NetError> {
        let mut listening = lock(&self.inner.listening);
        if listening.is_some() {
            return Promise::resolved(());
        }

        let listener = match bind(&self.inner.config) {
            Ok(listener) => listener,
            Err(e) => {
                warn!(addr = %self.inner.config.socket_addr(), error = %e, "bind failed");
                return Promise::rejected(e.into());
            }
        };
        let addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => return Promise::rejected(e.into()),
        };
        *lock(&self.inner.bound) = Some(addr);

        let lifetime = Lifetime::new();
        let stopped = Deferred::new();
        *listening = Some(Listening {
            lifetime: lifetime.clone(),
            stopped: stopped.promise(),
        });
        drop(listening);

        let new_connection = self.inner.new_connection.clone();
        let write_timeout = self.inner.config.write_timeout;
        thread::spawn(move || {
            accept_loop(listener, new_connection, lifetime, stopped, write_timeout);
        });
        info!(%addr, "listening");
        Promise::resolved(())
    }

    fn close_for_new_connections(&self) -> Promise<(), NetError> {
        self.stop()
    }

    fn new_connection(&self) -> &Event<ServerConnection> {
        &self.inner.new_connection
    }

    fn handshake_timeout(&self) -> Option<Duration> {
        Some(self.inner.config.handshake_timeout)
    }
}

impl Drop for SocketServerTransport {
    fn drop(&mut self) {
        self.stop();
    }
}

fn bind(config: &SocketServerConfig) -> io::Result<TcpListener> {
    let listener = TcpListener::bind(config.socket_addr())?;
    // Non-blocking so the accept thread can notice the lifetime ending.
    listener.set_nonblocking(true)?;
    Ok(listener)
}

fn accept_loop(
    listener: TcpListener,
    new_connection: Event<ServerConnection>,
    lifetime: Lifetime,
    stopped: Deferred<(), NetError>,
    write_timeout: Duration,
) {
    while !lifetime.is_expired() {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!(%peer, "accepted connection");
                adopt(stream, &new_connection, &lifetime, write_timeout);
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
        }
    }
    drop(listener);
    debug!("accept loop stopped");
    stopped.resolve(()).ok();
}

fn adopt(
    stream: TcpStream,
    new_connection: &Event<ServerConnection>,
    listening: &Lifetime,
    write_timeout: Duration,
) {
    // The listener may have closed while `accept` was returning.
    if listening.is_expired() {
        debug!("listener closed, dropping late connection");
        return;
    }
    stream.set_nonblocking(false).ok();
    match TcpConnection::<ServerMessage, ClientMessage>::open(stream, write_timeout) {
        Ok((connection, reader)) => {
            let handle: ServerConnection = connection.clone();
            new_connection.fire(&handle);
            connection.start_reader(reader);
        }
        Err(e) => warn!(error = %e, "could not set up accepted connection"),
    }
}

/// Connecting half of the TCP transport.
#[derive(Clone, Debug, Default)]
pub struct SocketClientTransport {
    config: SocketClientConfig,
}

impl SocketClientTransport {
    pub fn new(config: SocketClientConfig) -> Self {
        Self { config }
    }
}

impl ClientTransport for SocketClientTransport {
    fn connect(&self, server: &ServerId) -> Promise<ClientConnection, NetError> {
        let deferred = Deferred::new();
        let promise = deferred.promise();
        let server = server.clone();
        let timeout = self.config.connect_timeout;
        let write_timeout = self.config.write_timeout;

        thread::spawn(move || match dial(&server, timeout) {
            Ok(stream) => match TcpConnection::<ClientMessage, ServerMessage>::open(
                stream,
                write_timeout,
            ) {
                Ok((connection, reader)) => {
                    let handle: ClientConnection = connection.clone();
                    debug!(%server, "connected");
                    deferred.resolve(handle).ok();
                    connection.start_reader(reader);
                }
                Err(e) => {
                    deferred.reject(e.into()).ok();
                }
            },
            Err(e) => {
                debug!(%server, error = %e, "connect failed");
                deferred.reject(e).ok();
            }
        });
        promise
    }

    fn handshake_timeout(&self) -> Option<Duration> {
        Some(self.config.handshake_timeout)
    }
}

fn dial(server: &ServerId, timeout: Duration) -> Result<TcpStream, NetError> {
    let addrs: Vec<SocketAddr> = server
        .as_str()
        .to_socket_addrs()
        .map_err(|_| NetError::InvalidServerId(server.clone()))?
        .collect();

    let mut last_error = NetError::InvalidServerId(server.clone());
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => last_error = e.into(),
        }
    }
    Err(last_error)
}
