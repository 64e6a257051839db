// Integration smoke test for the socket relay.
//
// Starts a `MultiPlayerServer` on an ephemeral localhost port and drives it
// with plain TCP sockets speaking the protocol crate's framing and message
// types directly, without `MultiPlayerClient`. This pins down the wire
// behavior: handshake, routing, undeliverable reports, rejection, and leave
// notifications.

use std::io::{BufReader, BufWriter, Write};
use std::net::{SocketAddr, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use multiplayer_net::{MultiPlayerServer, SocketServerConfig, SocketServerTransport};
use multiplayer_protocol::framing::{read_frame, read_message, write_frame};
use multiplayer_protocol::{
    ClientId, ClientMessage, MultiPlayerMessage, PROTOCOL_VERSION, Recipient, ServerMessage,
};

/// Helper: send a ClientMessage over a framed TCP stream.
fn send(writer: &mut BufWriter<TcpStream>, msg: &ClientMessage) {
    write_frame(writer, msg).unwrap();
}

/// Helper: receive a ServerMessage from a framed TCP stream.
fn recv(reader: &mut BufReader<TcpStream>) -> ServerMessage {
    read_frame(reader).unwrap()
}

fn start_relay() -> (MultiPlayerServer, SocketAddr) {
    start_relay_with(SocketServerConfig::ephemeral())
}

fn start_relay_with(config: SocketServerConfig) -> (MultiPlayerServer, SocketAddr) {
    let transport = SocketServerTransport::new(config);
    let server = MultiPlayerServer::new(transport);
    server.open_for_new_connections().wait().unwrap();
    let addr = server.server_id().as_str().parse().unwrap();
    (server, addr)
}

fn open(addr: SocketAddr) -> (BufReader<TcpStream>, BufWriter<TcpStream>) {
    let stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let reader = BufReader::new(stream.try_clone().unwrap());
    (reader, BufWriter::new(stream))
}

/// Connect and perform the Connect handshake. Returns the reader/writer pair
/// and the peers listed in the Welcome.
fn connect_and_hello(
    addr: SocketAddr,
    id: ClientId,
) -> (BufReader<TcpStream>, BufWriter<TcpStream>, Vec<ClientId>) {
    let (mut reader, mut writer) = open(addr);
    send(
        &mut writer,
        &ClientMessage::Connect {
            client_id: id,
            protocol_version: PROTOCOL_VERSION,
        },
    );
    match recv(&mut reader) {
        ServerMessage::Welcome { client_id, peers } => {
            assert_eq!(client_id, id);
            (reader, writer, peers)
        }
        other => panic!("expected Welcome, got {other:?}"),
    }
}

#[test]
fn full_session_lifecycle() {
    let (server, addr) = start_relay();
    let (alice, bob) = (ClientId::generate(), ClientId::generate());

    // 1. Alice joins an empty server.
    let (mut reader_a, mut writer_a, peers) = connect_and_hello(addr, alice);
    assert!(peers.is_empty());

    // 2. Bob joins and is told about Alice; Alice hears about Bob.
    let (mut reader_b, mut writer_b, peers) = connect_and_hello(addr, bob);
    assert_eq!(peers, vec![alice]);
    assert_eq!(recv(&mut reader_a), ServerMessage::UserJoined { client_id: bob });

    // 3. A directed message reaches Bob unchanged.
    let hello = MultiPlayerMessage::new(alice, Recipient::Client(bob), "HelloWorld1", "hi bob");
    send(&mut writer_a, &ClientMessage::Send(hello.clone()));
    assert_eq!(recv(&mut reader_b), ServerMessage::Deliver(hello));

    // 4. A broadcast from Bob reaches Alice only.
    let shout = MultiPlayerMessage::new(bob, Recipient::Broadcast, "shout", vec![1, 2, 3]);
    send(&mut writer_b, &ClientMessage::Send(shout.clone()));
    assert_eq!(recv(&mut reader_a), ServerMessage::Deliver(shout));

    // 5. A message to nobody bounces back to its sender.
    let lost = MultiPlayerMessage::new(
        alice,
        Recipient::Client(ClientId::generate()),
        "lost",
        Vec::new(),
    );
    send(&mut writer_a, &ClientMessage::Send(lost.clone()));
    assert_eq!(recv(&mut reader_a), ServerMessage::Undeliverable(lost));

    // 6. Alice leaves; Bob is told.
    send(&mut writer_a, &ClientMessage::Goodbye);
    assert_eq!(recv(&mut reader_b), ServerMessage::UserLeft { client_id: alice });
    assert_eq!(server.connected_clients(), vec![bob]);

    // 7. Disposing the server closes Bob's connection.
    server.dispose();
    assert!(read_message(&mut reader_b).unwrap_err().is_disconnect());
}

#[test]
fn duplicate_client_id_is_rejected() {
    let (_server, addr) = start_relay();
    let id = ClientId::generate();
    let (_reader_a, _writer_a, _) = connect_and_hello(addr, id);

    let (mut reader, mut writer) = open(addr);
    send(
        &mut writer,
        &ClientMessage::Connect {
            client_id: id,
            protocol_version: PROTOCOL_VERSION,
        },
    );
    match recv(&mut reader) {
        ServerMessage::Rejected { reason } => assert!(reason.contains("already connected")),
        other => panic!("expected Rejected, got {other:?}"),
    }
    assert!(read_message(&mut reader).unwrap_err().is_disconnect());
}

#[test]
fn malformed_frame_drops_only_that_connection() {
    let (server, addr) = start_relay();
    let (alice, bob) = (ClientId::generate(), ClientId::generate());
    let (mut reader_a, _writer_a, _) = connect_and_hello(addr, alice);
    let (mut reader_b, mut writer_b, _) = connect_and_hello(addr, bob);
    assert_eq!(recv(&mut reader_a), ServerMessage::UserJoined { client_id: bob });

    // A length prefix followed by bytes that are not JSON.
    writer_b.write_all(&4u32.to_be_bytes()).unwrap();
    writer_b.write_all(b"nope").unwrap();
    writer_b.flush().unwrap();

    assert!(read_message(&mut reader_b).unwrap_err().is_disconnect());
    assert_eq!(recv(&mut reader_a), ServerMessage::UserLeft { client_id: bob });
    assert_eq!(server.connected_clients(), vec![alice]);
}

fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

#[test]
fn stalled_peer_does_not_hold_up_new_joins() {
    let (server, addr) = start_relay_with(SocketServerConfig {
        write_timeout: Duration::from_millis(500),
        ..SocketServerConfig::ephemeral()
    });
    let (stalled, flooder) = (ClientId::generate(), ClientId::generate());

    // 1. One peer joins and then never reads again.
    let (_stalled_reader, _stalled_writer, _) = connect_and_hello(addr, stalled);

    // 2. Another peer floods it, far more than the socket buffers hold.
    let (_flood_reader, mut flood_writer, _) = connect_and_hello(addr, flooder);
    let flood = thread::spawn(move || {
        let bulk = MultiPlayerMessage::new(
            flooder,
            Recipient::Client(stalled),
            "bulk",
            vec![7u8; 256 * 1024],
        );
        for _ in 0..64 {
            if write_frame(&mut flood_writer, &ClientMessage::Send(bulk.clone())).is_err() {
                break;
            }
        }
    });

    // 3. A newcomer is still welcomed promptly.
    let (_reader, _writer, peers) = connect_and_hello(addr, ClientId::generate());
    assert!(peers.contains(&flooder));

    // 4. The stalled peer is dropped once its writes time out.
    assert!(eventually(|| !server.is_connected(stalled)));
    flood.join().unwrap();
}

#[test]
fn silent_connection_is_closed_after_the_handshake_window() {
    let (server, addr) = start_relay_with(SocketServerConfig {
        handshake_timeout: Duration::from_millis(200),
        ..SocketServerConfig::ephemeral()
    });

    // Connected, but never sends Connect.
    let (mut reader, _writer) = open(addr);
    assert!(read_message(&mut reader).unwrap_err().is_disconnect());
    assert_eq!(server.client_count(), 0);

    // Clients that do say hello in time are unaffected.
    let id = ClientId::generate();
    let (_reader, _writer, _) = connect_and_hello(addr, id);
    thread::sleep(Duration::from_millis(400));
    assert!(server.is_connected(id));
}
