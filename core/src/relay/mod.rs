//! Byte relays
//!
//! A relay is a unidirectional copy worker between two async streams. The
//! connection bridge pairs two of them (upload + download) per peer.

pub mod stream;

pub use stream::{
    open, RelayConfig, RelayError, RelayEvent, RelayHandle, RelayOutcome, RelaySide, RelaySink,
    RelaySource, RelayStats, RelayTask, DEFAULT_BUFFER_SIZE, MAX_BUFFER_SIZE, STOP_GRACE,
};
