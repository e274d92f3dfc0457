//! Connection Bridge — maps native peer transports onto local TCP sockets
//!
//! `on_peer_connected` binds a local port and returns it immediately. A
//! per-connection task accepts the first local client on that port and runs
//! two relays: local → transport (upload) and transport → local (download).
//! The first relay to finish, fail or close tears the whole bridge down; so
//! does a disconnect or an accept timeout. The listener is held until teardown
//! so the port stays assigned to exactly one peer.

use super::connection::{Connection, ConnectionState, DuplicatePolicy, SessionTable};
use crate::identity::PeerId;
use crate::relay::{RelayConfig, RelayError, RelayEvent, RelayTask};
use crate::transport::TransportStream;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BridgeError {
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Peer already connected: {0}")]
    AlreadyConnected(PeerId),
    #[error("Peer not connected: {0}")]
    NotConnected(PeerId),
    #[error("No local port available: {0}")]
    ResourceExhaustion(String),
    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),
}

/// Bridge configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Address local ports are bound on
    pub bind_ip: IpAddr,
    /// How long a Pending connection waits for its local client
    pub accept_timeout: Duration,
    pub duplicate_policy: DuplicatePolicy,
    /// Upper bound on simultaneously held local ports
    pub max_connections: usize,
    /// Applied to both relays of every connection
    pub relay: RelayConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            accept_timeout: Duration::from_secs(30),
            duplicate_policy: DuplicatePolicy::ReuseExisting,
            max_connections: 256,
            relay: RelayConfig::default(),
        }
    }
}

impl BridgeConfig {
    pub fn with_accept_timeout(mut self, timeout: Duration) -> Self {
        self.accept_timeout = timeout;
        self
    }

    pub fn with_duplicate_policy(mut self, policy: DuplicatePolicy) -> Self {
        self.duplicate_policy = policy;
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_relay(mut self, relay: RelayConfig) -> Self {
        self.relay = relay;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.accept_timeout.is_zero() {
            return Err(BridgeError::Configuration(
                "accept_timeout must be positive".to_string(),
            ));
        }
        if self.max_connections == 0 {
            return Err(BridgeError::Configuration(
                "max_connections must be at least 1".to_string(),
            ));
        }
        self.relay.validate()?;
        Ok(())
    }
}

struct BridgeInner {
    config: BridgeConfig,
    sessions: SessionTable,
    next_generation: AtomicU64,
}

impl BridgeInner {
    /// Drop the entry if it still belongs to `generation`; the port is free after this
    fn release(&self, peer: &PeerId, generation: u64) {
        if let Some(mut conn) = self.sessions.remove_generation(peer, generation) {
            conn.transition(ConnectionState::Closed);
            conn.mark_released();
            info!(peer = %peer, port = conn.port(), "Bridge closed, port released");
        }
    }
}

/// Bridges connected peers to local TCP ports
#[derive(Clone)]
pub struct ConnectionBridge {
    inner: Arc<BridgeInner>,
}

impl ConnectionBridge {
    pub fn new(config: BridgeConfig) -> Result<Self, BridgeError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(BridgeInner {
                config,
                sessions: SessionTable::new(),
                next_generation: AtomicU64::new(1),
            }),
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    /// Bind a local port for `peer` and start bridging it to `transport`.
    ///
    /// Returns the port before any local client has connected. Must be called
    /// from within a tokio runtime. On error nothing is left behind.
    pub fn on_peer_connected(
        &self,
        peer: PeerId,
        transport: impl TransportStream,
    ) -> Result<u16, BridgeError> {
        let config = &self.inner.config;
        let generation = self.inner.next_generation.fetch_add(1, Ordering::SeqCst);

        let reserved = self.inner.sessions.with_sessions(|sessions| {
            if let Some(existing) = sessions.get(&peer) {
                return match config.duplicate_policy {
                    DuplicatePolicy::ReuseExisting => Ok(Reserved::Existing(existing.port())),
                    DuplicatePolicy::RejectDuplicate => {
                        Err(BridgeError::AlreadyConnected(peer.clone()))
                    }
                };
            }
            if sessions.len() >= config.max_connections {
                return Err(BridgeError::ResourceExhaustion(format!(
                    "connection limit of {} reached",
                    config.max_connections
                )));
            }

            let listener = bind_local(config.bind_ip)?;
            let port = listener
                .local_addr()
                .map_err(|e| BridgeError::ResourceExhaustion(e.to_string()))?
                .port();
            let conn = Connection::new(peer.clone(), port, generation);
            let disconnect = conn.disconnect_signal();
            sessions.insert(peer.clone(), conn);
            Ok(Reserved::New {
                listener,
                port,
                disconnect,
            })
        })?;

        let (listener, port, disconnect) = match reserved {
            Reserved::Existing(port) => {
                info!(peer = %peer, port, "Peer already bridged, reusing existing port");
                return Ok(port);
            }
            Reserved::New {
                listener,
                port,
                disconnect,
            } => (listener, port, disconnect),
        };

        let task = tokio::spawn(run_bridge(
            Arc::clone(&self.inner),
            peer.clone(),
            generation,
            listener,
            Box::new(transport),
            disconnect,
        ));
        let attached = self.inner.sessions.update_for_peer(&peer, |conn| {
            if conn.generation() == generation {
                conn.attach_task(task);
                true
            } else {
                false
            }
        });
        if attached != Some(true) {
            debug!(peer = %peer, "Bridge finished before its task was attached");
        }

        info!(peer = %peer, port, "Bridge pending on local port");
        Ok(port)
    }

    /// Tear down the peer's bridge and wait until its port is released.
    ///
    /// Concurrent calls for the same peer all return after the release.
    pub async fn on_peer_disconnected(&self, peer: &PeerId) -> Result<(), BridgeError> {
        let (signal, task, generation, mut released) = self
            .inner
            .sessions
            .update_for_peer(peer, |conn| {
                (
                    conn.disconnect_signal(),
                    conn.take_task(),
                    conn.generation(),
                    conn.released_signal(),
                )
            })
            .ok_or_else(|| BridgeError::NotConnected(peer.clone()))?;

        debug!(peer = %peer, "Disconnect requested");
        signal.notify_one();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(peer = %peer, "Bridge task ended abnormally: {}", e);
                self.inner.release(peer, generation);
            }
        }
        // Either the sender flipped to true or the connection is gone
        let _ = released.wait_for(|released| *released).await;
        Ok(())
    }

    pub fn port_for(&self, peer: &PeerId) -> Option<u16> {
        self.inner.sessions.port_for(peer)
    }

    pub fn state_of(&self, peer: &PeerId) -> Option<ConnectionState> {
        self.inner.sessions.state_of(peer)
    }

    pub fn active_connections(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.inner.sessions.peers()
    }

    /// Tear down every bridge
    pub async fn shutdown(&self) {
        let peers = self.peers();
        info!("Shutting down {} bridge(s)", peers.len());
        for peer in peers {
            // A bridge may close on its own meanwhile; that is fine here
            let _ = self.on_peer_disconnected(&peer).await;
        }
    }
}

enum Reserved {
    Existing(u16),
    New {
        listener: std::net::TcpListener,
        port: u16,
        disconnect: Arc<Notify>,
    },
}

fn bind_local(ip: IpAddr) -> Result<std::net::TcpListener, BridgeError> {
    let exhausted = |e: std::io::Error| BridgeError::ResourceExhaustion(e.to_string());
    let listener = std::net::TcpListener::bind(SocketAddr::new(ip, 0)).map_err(exhausted)?;
    listener.set_nonblocking(true).map_err(exhausted)?;
    Ok(listener)
}

async fn run_bridge(
    inner: Arc<BridgeInner>,
    peer: PeerId,
    generation: u64,
    listener: std::net::TcpListener,
    mut transport: Box<dyn TransportStream>,
    disconnect: Arc<Notify>,
) {
    let listener = match TcpListener::from_std(listener) {
        Ok(listener) => listener,
        Err(e) => {
            warn!(peer = %peer, "Failed to register local listener: {}", e);
            let _ = transport.shutdown().await;
            inner.release(&peer, generation);
            return;
        }
    };

    let accepted = tokio::select! {
        _ = disconnect.notified() => {
            debug!(peer = %peer, "Disconnected before local accept");
            None
        }
        accepted = tokio::time::timeout(inner.config.accept_timeout, listener.accept()) => {
            match accepted {
                Ok(Ok((socket, addr))) => {
                    debug!(peer = %peer, %addr, "Accepted local client");
                    Some(socket)
                }
                Ok(Err(e)) => {
                    warn!(peer = %peer, "Local accept failed: {}", e);
                    None
                }
                Err(_) => {
                    warn!(
                        peer = %peer,
                        "No local client within {:?}, closing pending bridge",
                        inner.config.accept_timeout
                    );
                    None
                }
            }
        }
    };

    let Some(socket) = accepted else {
        let _ = transport.shutdown().await;
        inner.release(&peer, generation);
        return;
    };

    let (transport_read, transport_write) = tokio::io::split(transport);
    let (local_read, local_write) = socket.into_split();
    let relay_config = inner.config.relay.clone();

    let upload = RelayTask::new(
        format!("{}:upload", peer),
        local_read,
        transport_write,
        relay_config.clone(),
    );
    let download = RelayTask::new(
        format!("{}:download", peer),
        transport_read,
        local_write,
        relay_config,
    );
    let (upload, download) = match (upload, download) {
        (Ok(upload), Ok(download)) => (upload, download),
        (Err(e), _) | (_, Err(e)) => {
            warn!(peer = %peer, "Failed to set up relays: {}", e);
            inner.release(&peer, generation);
            return;
        }
    };

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let upload = upload.start(Some(events_tx.clone()));
    let download = download.start(Some(events_tx));

    inner.sessions.update_for_peer(&peer, |conn| {
        if conn.generation() == generation {
            conn.transition(ConnectionState::Bridging);
        }
    });
    info!(peer = %peer, "Bridging");

    loop {
        tokio::select! {
            _ = disconnect.notified() => {
                debug!(peer = %peer, "Disconnected while bridging");
                break;
            }
            event = events_rx.recv() => match event {
                Some(event) if event.is_terminal() => {
                    log_terminal(&peer, &event);
                    break;
                }
                Some(_) => continue,
                None => break,
            },
        }
    }

    upload.stop().await;
    download.stop().await;
    upload.join().await;
    download.join().await;

    let up = upload.stats();
    let down = download.stats();
    info!(
        peer = %peer,
        uploaded = up.bytes_written,
        downloaded = down.bytes_written,
        "Relays stopped"
    );

    drop(listener);
    inner.release(&peer, generation);
}

fn log_terminal(peer: &PeerId, event: &RelayEvent) {
    match event {
        RelayEvent::Error { relay, side, cause } => {
            warn!(peer = %peer, "Relay {} failed on {}: {}", relay, side, cause)
        }
        other => debug!(peer = %peer, "Relay {} finished: {:?}", other.relay(), other),
    }
}
