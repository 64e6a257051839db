// End-to-end scenarios over the TCP transport, and a parity check against
// the in-process transport.
//
// Every notification crosses a reader thread here, so assertions poll with
// `wait_until` instead of checking right after each call.

use multiplayer_net::{ClientState, MultiPlayerClient, SocketClientConfig};
use multiplayer_protocol::{ClientId, Recipient};
use multiplayer_tests::{
    Notification, QUIET_PERIOD, TestSession, TransportKind, WAIT_TIMEOUT, run_hello_world_scenario,
    wait_until,
};

#[test]
fn hello_world() {
    let report = run_hello_world_scenario(TransportKind::Socket);
    assert_eq!(
        report.client2,
        vec![
            "joined client1",
            "received HelloWorld1 from client1: Hello from client1",
            "left client1",
        ]
    );
}

#[test]
fn same_observations_as_in_process() {
    let over_sockets = run_hello_world_scenario(TransportKind::Socket);
    let in_process = run_hello_world_scenario(TransportKind::InProcess);
    assert_eq!(over_sockets, in_process);
}

#[test]
fn unknown_recipient_is_undeliverable_exactly_once() {
    let session = TestSession::start(TransportKind::Socket);
    let sender = session.connect_client();

    sender
        .client
        .send_to(Recipient::Client(ClientId::generate()), "nowhere", "x")
        .unwrap();

    assert!(wait_until(|| sender.undeliverable_count() == 1));
    std::thread::sleep(QUIET_PERIOD);
    assert_eq!(sender.undeliverable_count(), 1);
}

#[test]
fn server_shutdown_disconnects_clients_once() {
    let session = TestSession::start(TransportKind::Socket);
    let client = session.connect_client();

    session.server.dispose();

    assert!(wait_until(|| client.client.state() == ClientState::Disconnected));
    std::thread::sleep(QUIET_PERIOD);
    let disconnects = client
        .timeline
        .snapshot()
        .into_iter()
        .filter(|n| *n == Notification::Disconnected)
        .count();
    assert_eq!(disconnects, 1);
}

#[test]
fn connect_to_closed_port_fails() {
    let session = TestSession::start(TransportKind::Socket);
    let id = session.server_id();
    drop(session);

    let client = MultiPlayerClient::socket(SocketClientConfig::default());
    let result = client
        .connect(&id)
        .wait_timeout(WAIT_TIMEOUT)
        .expect("connect timed out");
    assert!(result.is_err());
    assert_eq!(client.state(), ClientState::Disconnected);
}
