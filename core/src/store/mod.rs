// Store module — replicated-store change feed consumed by the notifier
//
// The store engine itself is a collaborator. This crate only needs an ordered,
// resumable feed of change events carrying enough to decide who to notify.

pub mod backend;

use crate::identity::PeerPublicKey;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use backend::{MemoryChangeFeed, SledChangeFeed};

/// Position in the change feed. Zero is "before the first change".
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ChangeCursor(pub u64);

impl ChangeCursor {
    pub const START: ChangeCursor = ChangeCursor(0);

    /// Move forward to `other` if it is ahead. Cursors never move back.
    pub fn advance_to(&mut self, other: ChangeCursor) {
        if other > *self {
            *self = other;
        }
    }
}

/// One mutation in the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub cursor: ChangeCursor,
    pub doc_id: String,
    /// Peers the changed document is shared with
    pub audience: Vec<PeerPublicKey>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Change feed interrupted: {0}")]
    Interrupted(String),
}

impl From<sled::Error> for StoreError {
    fn from(err: sled::Error) -> Self {
        StoreError::Storage(err.to_string())
    }
}

/// Stream of changes; an `Err` item or the end of the stream ends the subscription
pub type ChangeStream = BoxStream<'static, Result<ChangeEvent, StoreError>>;

/// Change-feed subscription primitive
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Every change after `since` in order, followed by live changes
    async fn subscribe(&self, since: ChangeCursor) -> Result<ChangeStream, StoreError>;
}
