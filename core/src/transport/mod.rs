//! Native transport plumbing
//!
//! The host's native discovery layer (BLE, WiFi Aware, ...) is a collaborator.
//! It reports peers and established links through [`discovery`]; the links
//! themselves are opaque byte streams.

pub mod discovery;

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::io::{AsyncRead, AsyncWrite};

pub use discovery::{
    run_bridge_loop, DiscoveryConfig, DiscoveryError, DiscoveryEvent, HostEvent, Peer,
    PeerDiscoveryFacade,
};

/// A native peer link: any full-duplex async byte stream
pub trait TransportStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> TransportStream for T {}

/// Native transport a peer was seen on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportType {
    /// Bluetooth Low Energy
    BLE,
    /// WiFi Aware (Neighbor Awareness Networking)
    WiFiAware,
    /// WiFi Direct (peer-to-peer)
    WiFiDirect,
    /// Local transport for testing
    Local,
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportType::BLE => write!(f, "BLE"),
            TransportType::WiFiAware => write!(f, "WiFiAware"),
            TransportType::WiFiDirect => write!(f, "WiFiDirect"),
            TransportType::Local => write!(f, "Local"),
        }
    }
}
