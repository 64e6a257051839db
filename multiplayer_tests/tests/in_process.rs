// End-to-end scenarios over the in-process transport.
//
// Sends complete synchronously here, so most assertions hold the moment a
// call returns; the shared helpers still poll so the same scenarios run
// unchanged over sockets (see `socket.rs`).

use std::sync::Arc;
use std::thread;

use multiplayer_net::{ClientState, NetError};
use multiplayer_protocol::{ClientId, Recipient};
use multiplayer_tests::{TestSession, TransportKind, run_hello_world_scenario, wait_until};

#[test]
fn hello_world() {
    let report = run_hello_world_scenario(TransportKind::InProcess);
    assert_eq!(
        report.client1,
        vec![
            "joined client2",
            "received HelloWorld2 from client2: Hello from client2",
        ]
    );
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
fn unknown_recipient_is_undeliverable_exactly_once() {
    let session = TestSession::start(TransportKind::InProcess);
    let sender = session.connect_client();
    let bystander = session.connect_client();
    let server_undeliverable =
        multiplayer_tests::Recorder::attach(session.server.undeliverable(), session.server.lifetime());

    sender
        .client
        .send_to(Recipient::Client(ClientId::generate()), "nowhere", "x")
        .unwrap();

    assert_eq!(sender.undeliverable_count(), 1);
    assert_eq!(server_undeliverable.len(), 1);
    assert!(sender.received_event_ids().is_empty());
    assert!(bystander.received_event_ids().is_empty());
}

#[test]
fn broadcast_reaches_everyone_else() {
    let session = TestSession::start(TransportKind::InProcess);
    let clients: Vec<_> = (0..4).map(|_| session.connect_client()).collect();

    clients[0]
        .client
        .send_to(Recipient::Broadcast, "announce", "all hands")
        .unwrap();

    assert!(clients[0].received_event_ids().is_empty());
    for other in &clients[1..] {
        assert_eq!(other.received_event_ids(), vec!["announce"]);
    }
}

#[test]
fn every_pair_meets_exactly_once_under_concurrent_joins() {
    const CLIENTS: usize = 8;
    let session = Arc::new(TestSession::start(TransportKind::InProcess));

    let handles: Vec<_> = (0..CLIENTS)
        .map(|_| {
            let session = Arc::clone(&session);
            thread::spawn(move || session.connect_client())
        })
        .collect();
    let clients: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert!(wait_until(|| clients
        .iter()
        .all(|c| c.joins().len() == CLIENTS - 1)));
    for client in &clients {
        let mut seen = client.joins();
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), CLIENTS - 1, "duplicate join notification");
        assert!(!seen.contains(&client.id()), "client heard about itself");
    }
    assert_eq!(session.server.client_count(), CLIENTS);
}

#[test]
fn leaving_clients_are_reported_to_all_remaining() {
    let session = TestSession::start(TransportKind::InProcess);
    let stayer_a = session.connect_client();
    let stayer_b = session.connect_client();
    let leaver = session.connect_client();
    let leaver_id = leaver.id();

    drop(leaver);

    assert_eq!(stayer_a.leaves(), vec![leaver_id]);
    assert_eq!(stayer_b.leaves(), vec![leaver_id]);
    assert!(!session.server.is_connected(leaver_id));
    assert_eq!(stayer_a.client.remote_users(), vec![stayer_b.id()]);
}

#[test]
fn disposed_server_disconnects_clients() {
    let session = TestSession::start(TransportKind::InProcess);
    let client = session.connect_client();

    session.server.dispose();

    assert_eq!(client.client.state(), ClientState::Disconnected);
    assert!(client.timeline.snapshot().contains(&multiplayer_tests::Notification::Disconnected));
    let late = session.new_client();
    let result = late.client.connect(&session.server_id()).wait();
    assert!(matches!(result, Err(NetError::ServerNotFound(_))));
}
