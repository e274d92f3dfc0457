//! Replication notification
//!
//! - **policy**: which peers a change is relevant to, and what is still pending
//! - **notifier**: follows the change feed and drives the beacon service

pub mod notifier;
pub mod policy;

pub use notifier::{NotifierConfig, NotifierError, ReplicationNotifier, ReplicationNotifierBuilder};
pub use policy::{AudiencePolicy, FnPolicy, NotifyPolicy, PendingChanges};
