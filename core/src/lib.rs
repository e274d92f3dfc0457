// MeshBeacon Core — replication notification and connection bridging
//
// Tells mesh peers "I have data for you" through per-peer encrypted beacons
// served over HTTP, keeps those beacons in step with the replicated store,
// and exposes native peer links (BLE, WiFi Aware, ...) as local TCP ports.

pub mod beacon;
pub mod bridge;
pub mod clock;
pub mod crypto;
pub mod identity;
pub mod notify;
pub mod relay;
pub mod store;
pub mod transport;

use thiserror::Error;

pub use beacon::{
    BeaconError, BeaconParser, BeaconRouter, BeaconServer, BeaconServerConfig,
    BeaconServerFactory, BeaconService, BeaconServiceFactory, NotificationSet,
    DEFAULT_BEACON_PATH,
};
pub use bridge::{BridgeConfig, BridgeError, ConnectionBridge, ConnectionState, DuplicatePolicy};
pub use clock::{Clock, ManualClock, SystemClock};
pub use identity::{LocalKeyPair, PeerId, PeerPublicKey};
pub use notify::{NotifierConfig, NotifierError, NotifyPolicy, ReplicationNotifier};
pub use relay::{RelayConfig, RelayError, RelayEvent, RelayHandle, RelayTask};
pub use store::{ChangeCursor, ChangeEvent, ChangeFeed, MemoryChangeFeed, SledChangeFeed, StoreError};
pub use transport::{
    run_bridge_loop, DiscoveryEvent, HostEvent, PeerDiscoveryFacade, TransportStream,
};

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Crate-wide error, one variant per failure kind
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MeshBeaconError {
    /// Bad or missing construction argument; never retried
    #[error("Configuration error: {0}")]
    Configuration(String),
    /// I/O failure that may succeed on retry
    #[error("Transient I/O error: {0}")]
    TransientIo(String),
    /// Malformed beacon or wire data
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Resource exhausted: {0}")]
    ResourceExhaustion(String),
    #[error("Peer already connected: {0}")]
    AlreadyConnected(PeerId),
    #[error("Peer not connected: {0}")]
    NotConnected(PeerId),
    #[error("Storage error: {0}")]
    Storage(String),
}

impl From<identity::KeyError> for MeshBeaconError {
    fn from(err: identity::KeyError) -> Self {
        MeshBeaconError::Configuration(err.to_string())
    }
}

impl From<crypto::CryptoError> for MeshBeaconError {
    fn from(err: crypto::CryptoError) -> Self {
        MeshBeaconError::Protocol(err.to_string())
    }
}

impl From<RelayError> for MeshBeaconError {
    fn from(err: RelayError) -> Self {
        MeshBeaconError::Configuration(err.to_string())
    }
}

impl From<BeaconError> for MeshBeaconError {
    fn from(err: BeaconError) -> Self {
        match err {
            BeaconError::Configuration(msg) => MeshBeaconError::Configuration(msg),
            BeaconError::Router(e) => MeshBeaconError::Configuration(e.to_string()),
            BeaconError::Crypto(e) => e.into(),
            BeaconError::Protocol(msg) => MeshBeaconError::Protocol(msg),
        }
    }
}

impl From<StoreError> for MeshBeaconError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Storage(msg) => MeshBeaconError::Storage(msg),
            StoreError::Interrupted(msg) => MeshBeaconError::TransientIo(msg),
        }
    }
}

impl From<NotifierError> for MeshBeaconError {
    fn from(err: NotifierError) -> Self {
        match err {
            NotifierError::Configuration(msg) => MeshBeaconError::Configuration(msg),
            NotifierError::Beacon(e) => e.into(),
            NotifierError::Store(e) => e.into(),
        }
    }
}

impl From<BridgeError> for MeshBeaconError {
    fn from(err: BridgeError) -> Self {
        match err {
            BridgeError::Configuration(msg) => MeshBeaconError::Configuration(msg),
            BridgeError::AlreadyConnected(peer) => MeshBeaconError::AlreadyConnected(peer),
            BridgeError::NotConnected(peer) => MeshBeaconError::NotConnected(peer),
            BridgeError::ResourceExhaustion(msg) => MeshBeaconError::ResourceExhaustion(msg),
            BridgeError::Relay(e) => e.into(),
        }
    }
}

impl From<transport::DiscoveryError> for MeshBeaconError {
    fn from(err: transport::DiscoveryError) -> Self {
        match err {
            transport::DiscoveryError::Configuration(msg) => MeshBeaconError::Configuration(msg),
            transport::DiscoveryError::ChannelClosed => {
                MeshBeaconError::TransientIo(err.to_string())
            }
        }
    }
}
