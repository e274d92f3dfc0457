//! Connection bridging
//!
//! - **connection**: per-peer state machine and the session table
//! - **manager**: the bridge itself, allocating local ports and running relay pairs

pub mod connection;
pub mod manager;

pub use connection::{Connection, ConnectionState, DuplicatePolicy, SessionTable};
pub use manager::{BridgeConfig, BridgeError, ConnectionBridge};
