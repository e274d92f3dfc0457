//! Discovery facade → connection bridge → local TCP client, end to end
//!
//! Run with: cargo test --test integration_bridge

use meshbeacon_core::bridge::{BridgeConfig, ConnectionBridge, ConnectionState, DuplicatePolicy};
use meshbeacon_core::identity::{LocalKeyPair, PeerId};
use meshbeacon_core::relay::{open, RelayEvent};
use meshbeacon_core::transport::{
    run_bridge_loop, DiscoveryConfig, HostEvent, PeerDiscoveryFacade, TransportType,
};
use proptest::prelude::*;
use std::time::Duration;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

struct Harness {
    facade: PeerDiscoveryFacade,
    bridge: ConnectionBridge,
    host: mpsc::Receiver<HostEvent>,
    bridge_loop: JoinHandle<()>,
}

fn harness(config: BridgeConfig) -> Harness {
    let (facade, events) = PeerDiscoveryFacade::new(DiscoveryConfig::default()).unwrap();
    let bridge = ConnectionBridge::new(config).unwrap();
    let (host_tx, host) = mpsc::channel(16);
    let bridge_loop = tokio::spawn(run_bridge_loop(events, bridge.clone(), host_tx));
    Harness {
        facade,
        bridge,
        host,
        bridge_loop,
    }
}

impl Harness {
    async fn connect(&mut self, peer: &PeerId, transport: DuplexStream) -> HostEvent {
        let key = LocalKeyPair::generate().public_key();
        self.facade
            .connection_established(peer.clone(), key, TransportType::Local, transport)
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), self.host.recv())
            .await
            .unwrap()
            .unwrap()
    }

    async fn finish(self) {
        drop(self.facade);
        self.bridge_loop.await.unwrap();
        assert_eq!(self.bridge.active_connections(), 0);
    }
}

async fn wait_released(bridge: &ConnectionBridge, peer: &PeerId) {
    for _ in 0..500 {
        if bridge.port_for(peer).is_none() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("port for {} never released", peer);
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

#[tokio::test]
async fn test_connection_bridged_full_duplex() {
    let mut h = harness(BridgeConfig::default());
    let peer = PeerId::from("peer-p");
    let (transport, remote) = duplex(16 * 1024);

    let port = match h.connect(&peer, transport).await {
        HostEvent::LocalPort { port, .. } => port,
        other => panic!("unexpected host event {:?}", other),
    };
    let client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

    // Both directions at once, larger than any buffer on the path
    let upload = pattern(200_000, 1);
    let download = pattern(150_000, 7);

    let (mut client_read, mut client_write) = client.into_split();
    let (mut remote_read, mut remote_write) = tokio::io::split(remote);

    let up = upload.clone();
    let writer_a = tokio::spawn(async move { client_write.write_all(&up).await.unwrap() });
    let down = download.clone();
    let writer_b = tokio::spawn(async move { remote_write.write_all(&down).await.unwrap() });

    let mut got_up = vec![0u8; upload.len()];
    let mut got_down = vec![0u8; download.len()];
    let (a, b) = tokio::join!(
        remote_read.read_exact(&mut got_up),
        client_read.read_exact(&mut got_down)
    );
    a.unwrap();
    b.unwrap();
    writer_a.await.unwrap();
    writer_b.await.unwrap();

    assert_eq!(got_up, upload);
    assert_eq!(got_down, download);
    assert_eq!(h.bridge.state_of(&peer), Some(ConnectionState::Bridging));

    h.facade.peer_lost(peer.clone()).await.unwrap();
    assert_eq!(
        h.host.recv().await,
        Some(HostEvent::PeerLost { peer: peer.clone() })
    );
    assert_eq!(h.bridge.port_for(&peer), None);
    h.finish().await;
}

#[tokio::test]
async fn test_local_close_propagates_to_transport() {
    let mut h = harness(BridgeConfig::default());
    let peer = PeerId::from("peer-p");
    let (transport, mut remote) = duplex(4096);

    let port = match h.connect(&peer, transport).await {
        HostEvent::LocalPort { port, .. } => port,
        other => panic!("unexpected host event {:?}", other),
    };
    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    client.write_all(b"last words").await.unwrap();
    client.shutdown().await.unwrap();
    drop(client);

    let mut received = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), remote.read_to_end(&mut received))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, b"last words");

    wait_released(&h.bridge, &peer).await;
    h.finish().await;
}

#[tokio::test]
async fn test_reject_duplicate_is_reported_to_host() {
    let config = BridgeConfig::default().with_duplicate_policy(DuplicatePolicy::RejectDuplicate);
    let mut h = harness(config);
    let peer = PeerId::from("peer-p");
    let (first, _r1) = duplex(1024);
    let (second, mut r2) = duplex(1024);

    let port = match h.connect(&peer, first).await {
        HostEvent::LocalPort { port, .. } => port,
        other => panic!("unexpected host event {:?}", other),
    };
    match h.connect(&peer, second).await {
        HostEvent::ConnectFailed { peer: p, reason } => {
            assert_eq!(p, peer);
            assert!(reason.contains("already connected"));
        }
        other => panic!("unexpected host event {:?}", other),
    }

    // The rejected transport was dropped; the original bridge is untouched
    let mut buf = [0u8; 1];
    assert_eq!(r2.read(&mut buf).await.unwrap(), 0);
    assert_eq!(h.bridge.port_for(&peer), Some(port));
    h.finish().await;
}

#[tokio::test]
async fn test_reuse_existing_hands_back_same_port() {
    let mut h = harness(BridgeConfig::default());
    let peer = PeerId::from("peer-p");
    let (first, _r1) = duplex(1024);
    let (second, _r2) = duplex(1024);

    let a = h.connect(&peer, first).await;
    let b = h.connect(&peer, second).await;
    assert_eq!(a, b);
    assert_eq!(h.bridge.active_connections(), 1);
    h.finish().await;
}

#[tokio::test]
async fn test_ports_are_unique_per_peer() {
    let mut h = harness(BridgeConfig::default());
    let mut ports = Vec::new();
    let mut remotes = Vec::new();
    for i in 0..8 {
        let (transport, remote) = duplex(1024);
        remotes.push(remote);
        match h.connect(&PeerId::new(format!("peer-{}", i)), transport).await {
            HostEvent::LocalPort { port, .. } => ports.push(port),
            other => panic!("unexpected host event {:?}", other),
        }
    }
    let mut distinct = ports.clone();
    distinct.sort_unstable();
    distinct.dedup();
    assert_eq!(distinct.len(), ports.len());
    h.finish().await;
}

async fn relay_through(data: Vec<u8>, buffer_size: usize) -> Vec<u8> {
    let (sink, mut drain) = duplex(1024);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let relay = open(
        "prop",
        std::io::Cursor::new(data),
        sink,
        buffer_size,
        Some(tx),
    )
    .unwrap();

    let reader = tokio::spawn(async move {
        let mut out = Vec::new();
        drain.read_to_end(&mut out).await.unwrap();
        out
    });

    loop {
        match rx.recv().await {
            Some(RelayEvent::Done { .. }) => break,
            Some(event) if event.is_terminal() => panic!("relay ended with {:?}", event),
            Some(_) => continue,
            None => panic!("relay event channel closed"),
        }
    }
    // Done leaves the streams open; stopping closes the sink so the reader ends
    relay.stop().await;
    reader.await.unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_relay_delivers_every_byte_in_order(
        data in proptest::collection::vec(any::<u8>(), 0..20_000),
        buffer_size in 1usize..=8192,
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let out = rt.block_on(relay_through(data.clone(), buffer_size));
        prop_assert_eq!(out, data);
    }
}
