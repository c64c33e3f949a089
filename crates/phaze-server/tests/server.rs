//! Server integration tests: load, revocation, registry sharing and a full
//! UDP round trip.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use phaze_common::tunnel::tunnel_pair;
use phaze_core::{ClientMode, Control, Datagram, KdfParams, Packet};
use phaze_crypto::{unix_millis, ChannelConfig, ClientHandshake, PasswordVerifier, SecureChannel};
use phaze_server::{ClientRegistry, Dispatcher, DropReason, PhazeServer, ServerConfig};
use tokio::net::UdpSocket;
use tokio::time::timeout;

const CHEAP: KdfParams = KdfParams {
    m_cost: 8,
    t_cost: 1,
    p_cost: 1,
};

fn registry() -> Arc<ClientRegistry> {
    let registry = Arc::new(ClientRegistry::new(CHEAP));
    registry
        .register("alice", b"alice password", ClientMode::Standard)
        .unwrap();
    registry
        .register("bob", b"bob password", ClientMode::Standard)
        .unwrap();
    registry
}

fn single(replies: &[phaze_server::Reply]) -> Datagram {
    assert_eq!(replies.len(), 1);
    Datagram::decode(&replies[0].bytes).unwrap()
}

async fn connect(
    dispatcher: &Dispatcher,
    name: &str,
    password: &[u8],
    src: SocketAddr,
) -> SecureChannel {
    let mut client = ClientHandshake::new(name, ChannelConfig::default());
    let init = client.start(unix_millis()).unwrap();
    let outcome = dispatcher.handle_datagram(&init.encode(), src).await.unwrap();
    let response = single(&outcome.replies);
    let Packet::Response(body) = &response.packet else {
        panic!("expected response");
    };
    let verifier = PasswordVerifier::derive(password, &body.salt, body.kdf).unwrap();
    let confirm = client
        .on_response(response.header.session_id, body, &verifier)
        .unwrap();
    let outcome = dispatcher
        .handle_datagram(&confirm.encode(), src)
        .await
        .unwrap();
    let ack = single(&outcome.replies);
    let Packet::Ack(body) = &ack.packet else {
        panic!("expected ack");
    };
    client.on_ack(ack.header.session_id, body).unwrap()
}

fn ipv4_packet(src: [u8; 4], dst: [u8; 4]) -> Vec<u8> {
    let mut packet = vec![0u8; 48];
    packet[0] = 0x45;
    packet[12..16].copy_from_slice(&src);
    packet[16..20].copy_from_slice(&dst);
    packet
}

#[tokio::test]
async fn test_half_open_flood_is_bounded() {
    let config = ServerConfig {
        max_half_open: 64,
        ..ServerConfig::default()
    };
    let dispatcher = Arc::new(Dispatcher::new(config, registry()).unwrap());

    let established: SocketAddr = "192.0.2.1:40000".parse().unwrap();
    let mut channel = connect(&dispatcher, "alice", b"alice password", established).await;

    let mut tasks = Vec::new();
    for i in 0..200u32 {
        let dispatcher = dispatcher.clone();
        tasks.push(tokio::spawn(async move {
            let ip = Ipv4Addr::new(198, 18, (i / 250) as u8, (i % 250 + 1) as u8);
            let src = SocketAddr::new(IpAddr::V4(ip), 50000);
            let mut client = ClientHandshake::new("bob", ChannelConfig::default());
            let init = client.start(unix_millis()).unwrap();
            dispatcher.handle_datagram(&init.encode(), src).await
        }));
    }

    let mut accepted = 0;
    let mut refused = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => accepted += 1,
            Err(DropReason::Resource(_)) => refused += 1,
            Err(other) => panic!("unexpected drop: {other}"),
        }
    }
    assert_eq!(accepted, 64);
    assert_eq!(refused, 136);

    let (live, half_open) = dispatcher.session_counts().await;
    assert_eq!(live, 1);
    assert_eq!(half_open, 64);
    assert_eq!(dispatcher.snapshot().await.resource_drops, 136);

    // The established session is unaffected by the flood.
    let frame = channel.seal(&Control::Payload(vec![0x45; 20])).unwrap();
    let outcome = dispatcher
        .handle_datagram(&frame.encode(), established)
        .await
        .unwrap();
    assert_eq!(outcome.deliveries.len(), 1);
}

#[tokio::test]
async fn test_revocation_only_affects_revoked_client() {
    let registry = registry();
    let dispatcher = Dispatcher::new(ServerConfig::default(), registry.clone()).unwrap();

    let alice_addr: SocketAddr = "192.0.2.20:40000".parse().unwrap();
    let bob_addr: SocketAddr = "192.0.2.21:40000".parse().unwrap();
    let mut alice = connect(&dispatcher, "alice", b"alice password", alice_addr).await;
    let mut bob = connect(&dispatcher, "bob", b"bob password", bob_addr).await;

    assert!(registry.revoke("alice").unwrap());
    assert!(!registry.revoke("alice").unwrap());
    assert_eq!(dispatcher.disconnect_client("alice").await.len(), 1);
    assert!(dispatcher.disconnect_client("alice").await.is_empty());

    let frame = alice.seal(&Control::Payload(vec![0x45; 20])).unwrap();
    assert_eq!(
        dispatcher
            .handle_datagram(&frame.encode(), alice_addr)
            .await
            .unwrap_err(),
        DropReason::UnknownSession
    );

    let mut again = ClientHandshake::new("alice", ChannelConfig::default());
    let init = again.start(unix_millis()).unwrap();
    assert_eq!(
        dispatcher
            .handle_datagram(&init.encode(), alice_addr)
            .await
            .unwrap_err(),
        DropReason::UnknownClient
    );

    let frame = bob.seal(&Control::Payload(vec![0x45; 20])).unwrap();
    let outcome = dispatcher
        .handle_datagram(&frame.encode(), bob_addr)
        .await
        .unwrap();
    assert_eq!(outcome.deliveries[0].client_name, "bob");
    assert_eq!(dispatcher.session_counts().await, (1, 0));
}

async fn recv_datagram(socket: &UdpSocket) -> Datagram {
    let mut buf = vec![0u8; phaze_core::RECV_BUFFER_SIZE];
    let (len, _) = timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
        .await
        .expect("timed out")
        .unwrap();
    Datagram::decode(&buf[..len]).unwrap()
}

async fn recv_control(socket: &UdpSocket, channel: &mut SecureChannel) -> Control {
    let datagram = recv_datagram(socket).await;
    let Packet::Transport(frame) = &datagram.packet else {
        panic!("expected transport frame");
    };
    channel.open(&datagram.header, frame).unwrap().control
}

#[tokio::test]
async fn test_udp_round_trip_through_tunnel() {
    let registry = registry();
    registry
        .set_tunnel_address("alice", Some("10.9.0.2".parse().unwrap()))
        .unwrap();

    let config = ServerConfig {
        listen: "127.0.0.1:0".parse().unwrap(),
        ..ServerConfig::default()
    };
    let server = PhazeServer::bind(config, registry).await.unwrap();
    let server_addr = server.local_addr().unwrap();
    let (port, mut device) = tunnel_pair(16);
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let handle = tokio::spawn(server.run(port, async {
        let _ = stop_rx.await;
    }));

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut client = ClientHandshake::new("alice", ChannelConfig::default());
    let init = client.start(unix_millis()).unwrap();
    socket.send_to(&init.encode(), server_addr).await.unwrap();

    let response = recv_datagram(&socket).await;
    let Packet::Response(body) = &response.packet else {
        panic!("expected response");
    };
    let verifier = PasswordVerifier::derive(b"alice password", &body.salt, body.kdf).unwrap();
    let confirm = client
        .on_response(response.header.session_id, body, &verifier)
        .unwrap();
    socket.send_to(&confirm.encode(), server_addr).await.unwrap();

    let ack = recv_datagram(&socket).await;
    let Packet::Ack(body) = &ack.packet else {
        panic!("expected ack");
    };
    let mut channel = client.on_ack(ack.header.session_id, body).unwrap();

    // Client to tunnel device.
    let upstream = ipv4_packet([10, 9, 0, 2], [1, 1, 1, 1]);
    let frame = channel.seal(&Control::Payload(upstream.clone())).unwrap();
    socket.send_to(&frame.encode(), server_addr).await.unwrap();
    let delivered = timeout(Duration::from_secs(5), device.from_core.recv())
        .await
        .expect("timed out")
        .unwrap();
    assert_eq!(delivered, upstream);

    // Tunnel device to client.
    let downstream = ipv4_packet([1, 1, 1, 1], [10, 9, 0, 2]);
    device.to_core.send(downstream.clone()).await.unwrap();
    assert_eq!(
        recv_control(&socket, &mut channel).await,
        Control::Payload(downstream)
    );

    // Shutdown tears the session down.
    stop_tx.send(()).unwrap();
    assert_eq!(recv_control(&socket, &mut channel).await, Control::Teardown);
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_cli_revocation_reaches_running_server() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("clients.json");
    let registry = Arc::new(ClientRegistry::open(&path, CHEAP).unwrap());
    registry
        .register("alice", b"alice password", ClientMode::Standard)
        .unwrap();
    let dispatcher = Dispatcher::new(ServerConfig::default(), registry.clone()).unwrap();
    let alice_addr: SocketAddr = "192.0.2.40:40000".parse().unwrap();
    let mut alice = connect(&dispatcher, "alice", b"alice password", alice_addr).await;

    // A second process editing the same file, as `phaze-server client` does.
    let cli = ClientRegistry::open(&path, CHEAP).unwrap();
    assert!(cli.revoke("alice").unwrap());
    cli.register("carol", b"carol password", ClientMode::Standard)
        .unwrap();

    let replies = dispatcher.sweep().await;
    let datagram = single(&replies);
    let Packet::Transport(frame) = &datagram.packet else {
        panic!("expected transport frame");
    };
    assert_eq!(
        alice.open(&datagram.header, frame).unwrap().control,
        Control::Teardown
    );
    assert_eq!(dispatcher.session_counts().await, (0, 0));

    let init = ClientHandshake::new("alice", ChannelConfig::default())
        .start(unix_millis())
        .unwrap();
    assert_eq!(
        dispatcher
            .handle_datagram(&init.encode(), alice_addr)
            .await
            .unwrap_err(),
        DropReason::UnknownClient
    );

    // A later write by the server keeps the revocation on disk.
    registry
        .register("dave", b"dave password", ClientMode::Standard)
        .unwrap();
    let reopened = ClientRegistry::open(&path, CHEAP).unwrap();
    assert!(!reopened.permits("alice", ClientMode::Standard));
    assert!(reopened.credentials("carol").is_some());
    assert!(reopened.credentials("dave").is_some());
}
