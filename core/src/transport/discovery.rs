// Peer discovery facade — typed events from the native discovery layer
//
// The native layer calls into the facade; the facade keeps a table of known
// peers and forwards typed events onto a channel. `run_bridge_loop` consumes
// that channel, drives the connection bridge and reports local ports back to
// the host application on a second channel.

use super::{TransportStream, TransportType};
use crate::bridge::{BridgeError, ConnectionBridge};
use crate::clock::{Clock, SystemClock};
use crate::identity::{PeerId, PeerPublicKey};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Discovery event channel closed")]
    ChannelClosed,
}

/// Discovery configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryConfig {
    /// A peer not seen for this long is considered lost
    pub silence_window: Duration,
    /// Capacity of the event channel
    pub channel_capacity: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            silence_window: Duration::from_secs(60),
            channel_capacity: 64,
        }
    }
}

impl DiscoveryConfig {
    pub fn with_silence_window(mut self, window: Duration) -> Self {
        self.silence_window = window;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), DiscoveryError> {
        if self.silence_window.is_zero() {
            return Err(DiscoveryError::Configuration(
                "silence_window must be positive".to_string(),
            ));
        }
        if self.channel_capacity == 0 {
            return Err(DiscoveryError::Configuration(
                "channel_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// A peer known to the discovery layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: PeerId,
    pub public_key: PeerPublicKey,
    pub transport: TransportType,
    /// Unix milliseconds
    pub last_seen_at: u64,
}

/// Events from the native discovery layer
pub enum DiscoveryEvent {
    PeerDiscovered {
        peer: PeerId,
        public_key: PeerPublicKey,
    },
    PeerLost {
        peer: PeerId,
    },
    ConnectionEstablished {
        peer: PeerId,
        public_key: PeerPublicKey,
        transport: Box<dyn TransportStream>,
    },
}

impl fmt::Debug for DiscoveryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscoveryEvent::PeerDiscovered { peer, public_key } => f
                .debug_struct("PeerDiscovered")
                .field("peer", peer)
                .field("public_key", public_key)
                .finish(),
            DiscoveryEvent::PeerLost { peer } => {
                f.debug_struct("PeerLost").field("peer", peer).finish()
            }
            DiscoveryEvent::ConnectionEstablished {
                peer, public_key, ..
            } => f
                .debug_struct("ConnectionEstablished")
                .field("peer", peer)
                .field("public_key", public_key)
                .finish_non_exhaustive(),
        }
    }
}

/// Results reported back to the host application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostEvent {
    /// The peer is reachable on this local port
    LocalPort { peer: PeerId, port: u16 },
    /// Bridging the peer failed; nothing was set up
    ConnectFailed { peer: PeerId, reason: String },
    /// The peer is gone and its bridge torn down
    PeerLost { peer: PeerId },
}

/// Entry point for the native discovery layer
pub struct PeerDiscoveryFacade {
    config: DiscoveryConfig,
    clock: Arc<dyn Clock>,
    peers: RwLock<HashMap<PeerId, Peer>>,
    events: mpsc::Sender<DiscoveryEvent>,
}

impl PeerDiscoveryFacade {
    /// Create a facade and the receiving end of its event channel
    pub fn new(
        config: DiscoveryConfig,
    ) -> Result<(Self, mpsc::Receiver<DiscoveryEvent>), DiscoveryError> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: DiscoveryConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<(Self, mpsc::Receiver<DiscoveryEvent>), DiscoveryError> {
        config.validate()?;
        let (events, rx) = mpsc::channel(config.channel_capacity);
        Ok((
            Self {
                config,
                clock,
                peers: RwLock::new(HashMap::new()),
                events,
            },
            rx,
        ))
    }

    async fn emit(&self, event: DiscoveryEvent) -> Result<(), DiscoveryError> {
        self.events
            .send(event)
            .await
            .map_err(|_| DiscoveryError::ChannelClosed)
    }

    /// Returns true if this is the first time the peer is seen
    fn touch(&self, id: &PeerId, public_key: PeerPublicKey, transport: TransportType) -> bool {
        let now = self.clock.now_ms();
        let mut peers = self.peers.write();
        match peers.get_mut(id) {
            Some(peer) => {
                peer.public_key = public_key;
                peer.transport = transport;
                peer.last_seen_at = now;
                false
            }
            None => {
                peers.insert(
                    id.clone(),
                    Peer {
                        id: id.clone(),
                        public_key,
                        transport,
                        last_seen_at: now,
                    },
                );
                true
            }
        }
    }

    /// A peer was seen. Only the first sighting is forwarded.
    pub async fn peer_discovered(
        &self,
        peer: PeerId,
        public_key: PeerPublicKey,
        transport: TransportType,
    ) -> Result<(), DiscoveryError> {
        if !self.touch(&peer, public_key, transport) {
            return Ok(());
        }
        info!("Discovered peer {} via {}", peer, transport);
        self.emit(DiscoveryEvent::PeerDiscovered { peer, public_key })
            .await
    }

    /// A peer went away. Unknown peers are ignored.
    pub async fn peer_lost(&self, peer: PeerId) -> Result<(), DiscoveryError> {
        if self.peers.write().remove(&peer).is_none() {
            debug!("Lost unknown peer {}", peer);
            return Ok(());
        }
        info!("Lost peer {}", peer);
        self.emit(DiscoveryEvent::PeerLost { peer }).await
    }

    /// A native link to the peer is up
    pub async fn connection_established(
        &self,
        peer: PeerId,
        public_key: PeerPublicKey,
        transport_type: TransportType,
        transport: impl TransportStream,
    ) -> Result<(), DiscoveryError> {
        self.touch(&peer, public_key, transport_type);
        debug!("Connection established with {} via {}", peer, transport_type);
        self.emit(DiscoveryEvent::ConnectionEstablished {
            peer,
            public_key,
            transport: Box::new(transport),
        })
        .await
    }

    /// Forget peers silent for longer than the window and report them lost
    pub async fn evict_stale(&self) -> Result<Vec<PeerId>, DiscoveryError> {
        let now = self.clock.now_ms();
        let window = self.config.silence_window.as_millis() as u64;

        let stale: Vec<PeerId> = {
            let mut peers = self.peers.write();
            let stale: Vec<PeerId> = peers
                .values()
                .filter(|p| now.saturating_sub(p.last_seen_at) >= window)
                .map(|p| p.id.clone())
                .collect();
            for id in &stale {
                peers.remove(id);
            }
            stale
        };

        for peer in &stale {
            info!("Evicting silent peer {}", peer);
            self.emit(DiscoveryEvent::PeerLost { peer: peer.clone() })
                .await?;
        }
        Ok(stale)
    }

    pub fn peer(&self, id: &PeerId) -> Option<Peer> {
        self.peers.read().get(id).cloned()
    }

    pub fn known_peers(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self.peers.read().values().cloned().collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }
}

/// Feed discovery events into the bridge until either channel closes.
///
/// Every bridge is torn down on exit.
pub async fn run_bridge_loop(
    mut events: mpsc::Receiver<DiscoveryEvent>,
    bridge: ConnectionBridge,
    host: mpsc::Sender<HostEvent>,
) {
    while let Some(event) = events.recv().await {
        let reply = match event {
            DiscoveryEvent::PeerDiscovered { peer, .. } => {
                debug!("Peer {} discovered, waiting for a connection", peer);
                None
            }
            DiscoveryEvent::ConnectionEstablished {
                peer, transport, ..
            } => match bridge.on_peer_connected(peer.clone(), transport) {
                Ok(port) => Some(HostEvent::LocalPort { peer, port }),
                Err(e) => {
                    warn!("Failed to bridge {}: {}", peer, e);
                    Some(HostEvent::ConnectFailed {
                        peer,
                        reason: e.to_string(),
                    })
                }
            },
            DiscoveryEvent::PeerLost { peer } => {
                match bridge.on_peer_disconnected(&peer).await {
                    Ok(()) | Err(BridgeError::NotConnected(_)) => {}
                    Err(e) => warn!("Failed to tear down bridge for {}: {}", peer, e),
                }
                Some(HostEvent::PeerLost { peer })
            }
        };

        if let Some(reply) = reply {
            if host.send(reply).await.is_err() {
                info!("Host event channel closed, stopping bridge loop");
                break;
            }
        }
    }

    bridge.shutdown().await;
    debug!("Bridge loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::BridgeConfig;
    use crate::clock::ManualClock;
    use crate::identity::LocalKeyPair;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn key() -> PeerPublicKey {
        LocalKeyPair::generate().public_key()
    }

    #[test]
    fn test_config_validation() {
        assert!(DiscoveryConfig::default().validate().is_ok());
        assert!(DiscoveryConfig::default()
            .with_silence_window(Duration::ZERO)
            .validate()
            .is_err());
    }

    #[tokio::test]
    async fn test_discovered_is_forwarded_once() {
        let (facade, mut rx) = PeerDiscoveryFacade::new(DiscoveryConfig::default()).unwrap();
        let peer = PeerId::from("p");
        let k = key();

        facade.peer_discovered(peer.clone(), k, TransportType::BLE).await.unwrap();
        facade.peer_discovered(peer.clone(), k, TransportType::BLE).await.unwrap();
        facade.peer_lost(peer.clone()).await.unwrap();

        assert!(matches!(rx.recv().await, Some(DiscoveryEvent::PeerDiscovered { .. })));
        assert!(matches!(rx.recv().await, Some(DiscoveryEvent::PeerLost { .. })));
        assert!(rx.try_recv().is_err());
        assert!(facade.peer(&peer).is_none());
    }

    #[tokio::test]
    async fn test_evict_stale_uses_silence_window() {
        let clock = ManualClock::new(0);
        let config = DiscoveryConfig::default().with_silence_window(Duration::from_secs(10));
        let (facade, mut rx) =
            PeerDiscoveryFacade::with_clock(config, Arc::new(clock.clone())).unwrap();
        let quiet = PeerId::from("quiet");
        let chatty = PeerId::from("chatty");

        facade.peer_discovered(quiet.clone(), key(), TransportType::BLE).await.unwrap();
        facade.peer_discovered(chatty.clone(), key(), TransportType::WiFiAware).await.unwrap();
        clock.set(6_000);
        let k = facade.peer(&chatty).unwrap().public_key;
        facade.peer_discovered(chatty.clone(), k, TransportType::WiFiAware).await.unwrap();

        clock.set(10_000);
        assert_eq!(facade.evict_stale().await.unwrap(), vec![quiet.clone()]);
        assert_eq!(facade.known_peers().len(), 1);
        assert_eq!(facade.peer(&chatty).unwrap().last_seen_at, 6_000);

        rx.recv().await.unwrap();
        rx.recv().await.unwrap();
        match rx.recv().await {
            Some(DiscoveryEvent::PeerLost { peer }) => assert_eq!(peer, quiet),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_closed_channel_is_reported() {
        let (facade, rx) = PeerDiscoveryFacade::new(DiscoveryConfig::default()).unwrap();
        drop(rx);
        assert_eq!(
            facade.peer_discovered(PeerId::from("p"), key(), TransportType::Local).await,
            Err(DiscoveryError::ChannelClosed)
        );
    }

    #[tokio::test]
    async fn test_bridge_loop_reports_ports_and_losses() {
        let (facade, rx) = PeerDiscoveryFacade::new(DiscoveryConfig::default()).unwrap();
        let bridge = ConnectionBridge::new(BridgeConfig::default()).unwrap();
        let (host_tx, mut host_rx) = mpsc::channel(8);
        let loop_task = tokio::spawn(run_bridge_loop(rx, bridge.clone(), host_tx));

        let peer = PeerId::from("p");
        let (transport, mut remote) = duplex(4096);
        facade
            .connection_established(peer.clone(), key(), TransportType::Local, transport)
            .await
            .unwrap();

        let port = match host_rx.recv().await {
            Some(HostEvent::LocalPort { peer: p, port }) => {
                assert_eq!(p, peer);
                port
            }
            other => panic!("unexpected host event {:?}", other),
        };

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        facade.peer_lost(peer.clone()).await.unwrap();
        assert_eq!(
            host_rx.recv().await,
            Some(HostEvent::PeerLost { peer: peer.clone() })
        );
        assert_eq!(bridge.port_for(&peer), None);

        drop(facade);
        loop_task.await.unwrap();
    }
}
