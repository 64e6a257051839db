// Test harness for end-to-end multiplayer scenarios.
//
// Wraps real `MultiPlayerServer` / `MultiPlayerClient` instances over either
// transport and records every notification a client sees into one ordered
// timeline. Scenarios then compare timelines, with client ids replaced by
// names, so the same assertions hold for in-process and socket runs.
//
// The only test-specific code here is the recording and polling. All routing
// and transport logic uses the same code paths as a real deployment.
//
// See also: `tests/in_process.rs` and `tests/socket.rs` for the scenarios.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use multiplayer_lifetime::{Event, LifetimeManager};
use multiplayer_net::{MultiPlayerClient, MultiPlayerServer, SocketClientConfig, SocketServerConfig};
use multiplayer_protocol::{ClientId, MultiPlayerMessage, Recipient, ServerId};

/// Default timeout for blocking waits.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Sleep duration between poll attempts.
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How long to keep watching for notifications that should not arrive.
pub const QUIET_PERIOD: Duration = Duration::from_millis(100);

/// Poll `condition` until it holds or `WAIT_TIMEOUT` passes.
pub fn wait_until(condition: impl FnMut() -> bool) -> bool {
    wait_until_for(WAIT_TIMEOUT, condition)
}

pub fn wait_until_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Thread-safe capture of values fired by one or more events.
pub struct Recorder<T> {
    items: Arc<Mutex<Vec<T>>>,
}

impl<T> Clone for Recorder<T> {
    fn clone(&self) -> Self {
        Self {
            items: Arc::clone(&self.items),
        }
    }
}

impl<T: Clone + Send + 'static> Recorder<T> {
    pub fn new() -> Self {
        Self {
            items: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Record every value `event` fires until `lifetime` ends.
    pub fn attach(event: &Event<T>, lifetime: &LifetimeManager) -> Self {
        let recorder = Self::new();
        recorder.record(event, lifetime, T::clone);
        recorder
    }

    /// Record `map(value)` for every value `event` fires until `lifetime`
    /// ends. Several events can feed one recorder to get a single timeline.
    pub fn record<S: 'static>(
        &self,
        event: &Event<S>,
        lifetime: &LifetimeManager,
        map: impl Fn(&S) -> T + Send + Sync + 'static,
    ) {
        let items = Arc::clone(&self.items);
        event.subscribe(move |value: &S| guard(&items).push(map(value)), lifetime);
    }

    pub fn snapshot(&self) -> Vec<T> {
        guard(&self.items).clone()
    }

    pub fn len(&self) -> usize {
        guard(&self.items).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until at least `count` values were recorded.
    pub fn wait_for_len(&self, count: usize) -> bool {
        wait_until(|| self.len() >= count)
    }
}

impl<T: Clone + Send + 'static> Default for Recorder<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn guard<T>(items: &Mutex<Vec<T>>) -> MutexGuard<'_, Vec<T>> {
    items.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Everything a client can observe, in arrival order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notification {
    Joined(ClientId),
    Left(ClientId),
    Received {
        from: ClientId,
        event_id: String,
        payload: Vec<u8>,
    },
    Undeliverable {
        event_id: String,
    },
    Disconnected,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportKind {
    InProcess,
    Socket,
}

/// A listening server plus the knowledge of how to build matching clients.
pub struct TestSession {
    pub server: MultiPlayerServer,
    kind: TransportKind,
}

impl TestSession {
    /// Start a server open for connections. In-process servers get a unique
    /// name; socket servers an OS-assigned localhost port.
    pub fn start(kind: TransportKind) -> Self {
        let server = match kind {
            TransportKind::InProcess => MultiPlayerServer::in_process(unique_server_id()),
            TransportKind::Socket => MultiPlayerServer::socket(SocketServerConfig::ephemeral()),
        };
        let opened = server
            .open_for_new_connections()
            .wait_timeout(WAIT_TIMEOUT)
            .expect("timed out opening server");
        opened.expect("failed to open server");
        Self { server, kind }
    }

    pub fn server_id(&self) -> ServerId {
        self.server.server_id()
    }

    /// A client for this session's transport, with its timeline recording,
    /// not yet connected.
    pub fn new_client(&self) -> TestClient {
        let client = match self.kind {
            TransportKind::InProcess => MultiPlayerClient::in_process(),
            TransportKind::Socket => MultiPlayerClient::socket(SocketClientConfig::default()),
        };
        TestClient::new(client)
    }

    /// A connected client. Panics if the connect fails or times out.
    pub fn connect_client(&self) -> TestClient {
        let client = self.new_client();
        let connected = client
            .client
            .connect(&self.server_id())
            .wait_timeout(WAIT_TIMEOUT)
            .expect("timed out connecting");
        connected.expect("connect failed");
        client
    }
}

fn unique_server_id() -> ServerId {
    static NEXT: AtomicUsize = AtomicUsize::new(0);
    ServerId::new(format!(
        "test-session-{}-{}",
        std::process::id(),
        NEXT.fetch_add(1, Ordering::Relaxed)
    ))
}

/// A client whose notifications all land in one timeline.
pub struct TestClient {
    pub client: MultiPlayerClient,
    pub timeline: Recorder<Notification>,
}

impl TestClient {
    pub fn new(client: MultiPlayerClient) -> Self {
        let timeline = Recorder::new();
        let lifetime = client.lifetime().clone();
        timeline.record(client.new_remote_user(), &lifetime, |id| {
            Notification::Joined(*id)
        });
        timeline.record(client.remote_user_left(), &lifetime, |id| {
            Notification::Left(*id)
        });
        timeline.record(client.message_received(), &lifetime, |msg: &MultiPlayerMessage| {
            Notification::Received {
                from: msg.sender_id(),
                event_id: msg.event_id().to_owned(),
                payload: msg.payload().to_vec(),
            }
        });
        timeline.record(client.undeliverable(), &lifetime, |msg: &MultiPlayerMessage| {
            Notification::Undeliverable {
                event_id: msg.event_id().to_owned(),
            }
        });
        timeline.record(client.disconnected(), &lifetime, |_| {
            Notification::Disconnected
        });
        Self { client, timeline }
    }

    pub fn id(&self) -> ClientId {
        self.client.client_id()
    }

    pub fn send_to(&self, recipient: &TestClient, event_id: &str, payload: &str) {
        self.client
            .send_to(Recipient::Client(recipient.id()), event_id, payload)
            .expect("send failed");
    }

    pub fn joins(&self) -> Vec<ClientId> {
        self.filter(|n| match n {
            Notification::Joined(id) => Some(*id),
            _ => None,
        })
    }

    pub fn leaves(&self) -> Vec<ClientId> {
        self.filter(|n| match n {
            Notification::Left(id) => Some(*id),
            _ => None,
        })
    }

    pub fn received_event_ids(&self) -> Vec<String> {
        self.filter(|n| match n {
            Notification::Received { event_id, .. } => Some(event_id.clone()),
            _ => None,
        })
    }

    pub fn undeliverable_count(&self) -> usize {
        self.filter(|n| match n {
            Notification::Undeliverable { .. } => Some(()),
            _ => None,
        })
        .len()
    }

    fn filter<R>(&self, pick: impl Fn(&Notification) -> Option<R>) -> Vec<R> {
        self.timeline.snapshot().iter().filter_map(pick).collect()
    }

    /// The timeline with ids replaced by the names in `names`.
    pub fn describe(&self, names: &[(ClientId, &str)]) -> Vec<String> {
        let name = |id: &ClientId| {
            names
                .iter()
                .find(|(known, _)| known == id)
                .map_or_else(|| "unknown".to_owned(), |(_, name)| (*name).to_owned())
        };
        self.timeline
            .snapshot()
            .iter()
            .map(|n| match n {
                Notification::Joined(id) => format!("joined {}", name(id)),
                Notification::Left(id) => format!("left {}", name(id)),
                Notification::Received {
                    from,
                    event_id,
                    payload,
                } => format!(
                    "received {event_id} from {}: {}",
                    name(from),
                    String::from_utf8_lossy(payload)
                ),
                Notification::Undeliverable { event_id } => format!("undeliverable {event_id}"),
                Notification::Disconnected => "disconnected".to_owned(),
            })
            .collect()
    }
}

/// What each participant of the HelloWorld scenario observed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScenarioReport {
    pub client1: Vec<String>,
    pub client2: Vec<String>,
}

/// Two clients greet each other, then client1 leaves.
///
/// Asserts the exactly-once properties along the way and returns both
/// timelines with ids replaced by names, so runs over different transports
/// can be compared directly.
pub fn run_hello_world_scenario(kind: TransportKind) -> ScenarioReport {
    let session = TestSession::start(kind);
    let client1 = session.connect_client();
    let client2 = session.connect_client();

    assert!(wait_until(|| client1.joins().len() == 1 && client2.joins().len() == 1));
    assert_eq!(client1.joins(), vec![client2.id()]);
    assert_eq!(client2.joins(), vec![client1.id()]);

    client1.send_to(&client2, "HelloWorld1", "Hello from client1");
    client2.send_to(&client1, "HelloWorld2", "Hello from client2");
    assert!(wait_until(|| {
        client1.received_event_ids().len() == 1 && client2.received_event_ids().len() == 1
    }));

    let names = [(client1.id(), "client1"), (client2.id(), "client2")];
    let client1_report = client1.describe(&names);

    client1.client.dispose();
    assert!(wait_until(|| client2.leaves().len() == 1));
    assert!(wait_until(|| !session.server.is_connected(client1.id())));

    // Nothing else may trickle in.
    thread::sleep(QUIET_PERIOD);
    assert_eq!(client2.received_event_ids(), vec!["HelloWorld1"]);
    assert_eq!(client1.received_event_ids(), vec!["HelloWorld2"]);
    assert_eq!(client2.leaves(), vec![client1.id()]);
    assert_eq!(client1.undeliverable_count(), 0);
    assert_eq!(client2.undeliverable_count(), 0);
    assert_eq!(client1.timeline.snapshot().len(), 2, "client1 saw extra notifications");

    ScenarioReport {
        client1: client1_report,
        client2: client2.describe(&names),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_until_gives_up() {
        assert!(!wait_until_for(Duration::from_millis(30), || false));
        assert!(wait_until_for(Duration::from_millis(30), || true));
    }

    #[test]
    fn recorder_feeds_from_several_events() {
        let numbers: Event<u32> = Event::new();
        let words: Event<String> = Event::new();
        let recorder: Recorder<String> = Recorder::new();
        let forever = multiplayer_lifetime::Lifetime::forever();
        recorder.record(&numbers, &forever, |n| n.to_string());
        recorder.record(&words, &forever, String::clone);

        numbers.fire(&1);
        words.fire(&"two".to_owned());
        numbers.fire(&3);
        assert_eq!(recorder.snapshot(), vec!["1", "two", "3"]);
        assert!(recorder.wait_for_len(3));
    }
}
