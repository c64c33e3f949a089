//! Integration tests for the handshake and secure channel over UDP.

use std::time::Duration;

use phaze_core::{Control, Datagram, KdfParams, Packet};
use phaze_crypto::channel::RejectReason;
use phaze_crypto::password::generate_salt;
use phaze_crypto::{
    unix_millis, ChannelConfig, ChannelError, ClientHandshake, Credentials, HandshakeState,
    PasswordVerifier, SecureChannel, ServerHandshake,
};
use rand::{thread_rng, Rng};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use uuid::Uuid;

const CHEAP: KdfParams = KdfParams {
    m_cost: 8,
    t_cost: 1,
    p_cost: 1,
};

async fn recv_datagram(socket: &UdpSocket) -> Datagram {
    let mut buf = vec![0u8; 2048];
    let (len, _) = timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
        .await
        .expect("timed out")
        .unwrap();
    Datagram::decode(&buf[..len]).unwrap()
}

/// Run the four-message handshake between two local sockets.
async fn establish(password: &[u8]) -> (SecureChannel, SecureChannel, UdpSocket, UdpSocket) {
    let server_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let client_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server_addr = server_socket.local_addr().unwrap();
    let client_addr = client_socket.local_addr().unwrap();

    let salt = generate_salt();
    let credentials = Credentials {
        verifier: PasswordVerifier::derive(b"alice password", &salt, CHEAP).unwrap(),
        salt,
        kdf: CHEAP,
    };

    let mut client = ClientHandshake::new("alice", ChannelConfig::default());
    let init = client.start(unix_millis()).unwrap();
    client_socket.send_to(&init.encode(), server_addr).await.unwrap();

    let received = recv_datagram(&server_socket).await;
    let Packet::Init(init) = &received.packet else {
        panic!("expected init");
    };
    let session_id = Uuid::new_v4();
    let (mut server, response) = ServerHandshake::respond(
        init,
        session_id,
        &credentials,
        unix_millis(),
        ChannelConfig::default(),
    )
    .unwrap();
    server_socket.send_to(&response.encode(), client_addr).await.unwrap();

    let received = recv_datagram(&client_socket).await;
    let Packet::Response(response) = &received.packet else {
        panic!("expected response");
    };
    let verifier = PasswordVerifier::derive(password, &response.salt, response.kdf).unwrap();
    let confirm = client
        .on_response(received.header.session_id, response, &verifier)
        .unwrap();
    client_socket.send_to(&confirm.encode(), server_addr).await.unwrap();

    let received = recv_datagram(&server_socket).await;
    let Packet::Confirm(confirm) = &received.packet else {
        panic!("expected confirm");
    };
    let (server_channel, ack) = server.on_confirm(confirm).unwrap();
    server_socket.send_to(&ack.encode(), client_addr).await.unwrap();

    let received = recv_datagram(&client_socket).await;
    let Packet::Ack(ack) = &received.packet else {
        panic!("expected ack");
    };
    let client_channel = client.on_ack(received.header.session_id, ack).unwrap();
    assert_eq!(client.state(), HandshakeState::Established);
    assert_eq!(server.state(), HandshakeState::Established);

    (client_channel, server_channel, client_socket, server_socket)
}

/// Test the full handshake over UDP sockets followed by traffic both ways.
#[tokio::test]
async fn test_handshake_over_udp() {
    let (mut client, mut server, client_socket, server_socket) =
        establish(b"alice password").await;
    let server_addr = server_socket.local_addr().unwrap();
    let client_addr = client_socket.local_addr().unwrap();

    let up = client.seal(&Control::Payload(b"Hello from client!".to_vec())).unwrap();
    client_socket.send_to(&up.encode(), server_addr).await.unwrap();

    let received = recv_datagram(&server_socket).await;
    let Packet::Transport(frame) = &received.packet else {
        panic!("expected transport");
    };
    assert_eq!(
        server.open(&received.header, frame).unwrap().control,
        Control::Payload(b"Hello from client!".to_vec())
    );

    let down = server.seal(&Control::Payload(b"Hello from server!".to_vec())).unwrap();
    server_socket.send_to(&down.encode(), client_addr).await.unwrap();

    let received = recv_datagram(&client_socket).await;
    let Packet::Transport(frame) = &received.packet else {
        panic!("expected transport");
    };
    assert_eq!(
        client.open(&received.header, frame).unwrap().control,
        Control::Payload(b"Hello from server!".to_vec())
    );
}

/// 1000 frames with 5% simulated loss and replays of accepted frames.
#[tokio::test]
async fn test_lossy_stream_with_replays() {
    let (mut client, mut server, _client_socket, _server_socket) =
        establish(b"alice password").await;
    let mut rng = thread_rng();

    let mut accepted = Vec::new();
    let mut delivered = 0usize;
    for i in 0..1000u32 {
        let datagram = client
            .seal(&Control::Payload(i.to_be_bytes().to_vec()))
            .unwrap();
        if rng.gen_bool(0.05) {
            continue;
        }

        let decoded = Datagram::decode(&datagram.encode()).unwrap();
        let Packet::Transport(frame) = &decoded.packet else {
            panic!("expected transport");
        };
        let received = server.open(&decoded.header, frame).unwrap();
        assert_eq!(received.control, Control::Payload(i.to_be_bytes().to_vec()));
        delivered += 1;
        accepted.push(decoded);

        // Replay a recently accepted frame now and then.
        if i % 10 == 0 {
            let replay = &accepted[rng.gen_range(0..accepted.len())];
            let Packet::Transport(frame) = &replay.packet else {
                panic!("expected transport");
            };
            let err = server.open(&replay.header, frame).unwrap_err();
            assert_eq!(err, ChannelError::Rejected(RejectReason::Replay));
        }
    }

    assert!(delivered > 900);

    // The session is still usable in both directions.
    let down = server.seal(&Control::Keepalive).unwrap();
    let Packet::Transport(frame) = &down.packet else {
        panic!("expected transport");
    };
    let received = client.open(&down.header, frame).unwrap();
    assert_eq!(received.control, Control::Keepalive);
    assert!(received.reply.is_some());
}

#[tokio::test]
async fn test_wrong_password_never_establishes() {
    let server_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let client_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server_addr = server_socket.local_addr().unwrap();

    let salt = generate_salt();
    let credentials = Credentials {
        verifier: PasswordVerifier::derive(b"right", &salt, CHEAP).unwrap(),
        salt,
        kdf: CHEAP,
    };

    let mut client = ClientHandshake::new("mallory", ChannelConfig::default());
    let init = client.start(unix_millis()).unwrap();
    let Packet::Init(init_body) = &init.packet else {
        panic!("expected init");
    };
    let session_id = Uuid::new_v4();
    let (mut server, response) = ServerHandshake::respond(
        init_body,
        session_id,
        &credentials,
        unix_millis(),
        ChannelConfig::default(),
    )
    .unwrap();
    let Packet::Response(response) = &response.packet else {
        panic!("expected response");
    };

    let verifier = PasswordVerifier::derive(b"wrong", &response.salt, response.kdf).unwrap();
    let confirm = client.on_response(session_id, response, &verifier).unwrap();
    client_socket.send_to(&confirm.encode(), server_addr).await.unwrap();

    let received = recv_datagram(&server_socket).await;
    let Packet::Confirm(confirm) = &received.packet else {
        panic!("expected confirm");
    };
    assert!(server.on_confirm(confirm).is_err());
    assert_eq!(server.state(), HandshakeState::Closed);
}
