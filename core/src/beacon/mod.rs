/// Notification beacons
///
/// This module provides the issuing side (builder + HTTP server) and the
/// receiving side (parser) of per-peer encrypted beacons:
///
/// - **payload**: notification set construction, wire encoding, parsing
/// - **router**: runtime mount table exposed to the host as a warp filter
/// - **server**: the start/stop beacon service and its factory

pub mod payload;
pub mod router;
pub mod server;

use crate::crypto::CryptoError;
use thiserror::Error;

pub use payload::{
    decode_list, Beacon, BeaconBuilder, BeaconParser, NotificationSet, DEFAULT_BEACON_PATH,
};
pub use router::{BeaconRouter, RouteHandler, RouterError};
pub use server::{
    BeaconServer, BeaconServerConfig, BeaconServerFactory, BeaconService, BeaconServiceFactory,
};

/// Errors for beacon operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BeaconError {
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Beacon sealing failed: {0}")]
    Crypto(#[from] CryptoError),
    #[error("Malformed beacon data: {0}")]
    Protocol(String),
    #[error("Router error: {0}")]
    Router(#[from] RouterError),
}
