//! Notify policy — which peers a batch of changes should be announced to
//!
//! Relevance is pluggable. The notifier folds each batch into a table of
//! outstanding changes per peer; a peer stays in the notify-set until it
//! acknowledges everything up to its latest relevant change.

use crate::identity::PeerPublicKey;
use crate::store::{ChangeCursor, ChangeEvent};
use std::collections::{BTreeSet, HashMap};

/// Decides which peers a single change is relevant to
pub trait NotifyPolicy: Send + Sync {
    fn relevant_peers(&self, event: &ChangeEvent) -> Vec<PeerPublicKey>;
}

/// Notifies every peer the changed document is shared with
#[derive(Debug, Clone, Copy, Default)]
pub struct AudiencePolicy;

impl NotifyPolicy for AudiencePolicy {
    fn relevant_peers(&self, event: &ChangeEvent) -> Vec<PeerPublicKey> {
        event.audience.clone()
    }
}

/// Closure-backed policy
pub struct FnPolicy<F>(pub F);

impl<F> NotifyPolicy for FnPolicy<F>
where
    F: Fn(&ChangeEvent) -> Vec<PeerPublicKey> + Send + Sync,
{
    fn relevant_peers(&self, event: &ChangeEvent) -> Vec<PeerPublicKey> {
        (self.0)(event)
    }
}

/// Latest un-acknowledged relevant change per peer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingChanges {
    outstanding: HashMap<PeerPublicKey, ChangeCursor>,
}

impl PendingChanges {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a batch in. Returns true if the set of pending peers grew.
    pub fn apply(&mut self, batch: &[ChangeEvent], policy: &dyn NotifyPolicy) -> bool {
        let before = self.outstanding.len();
        for event in batch {
            for peer in policy.relevant_peers(event) {
                self.outstanding
                    .entry(peer)
                    .or_default()
                    .advance_to(event.cursor);
            }
        }
        self.outstanding.len() != before
    }

    /// Clear a peer if it has seen everything up to `cursor`.
    /// Returns true if the peer was removed.
    pub fn acknowledge(&mut self, peer: &PeerPublicKey, cursor: ChangeCursor) -> bool {
        match self.outstanding.get(peer) {
            Some(latest) if *latest <= cursor => {
                self.outstanding.remove(peer);
                true
            }
            _ => false,
        }
    }

    pub fn peers(&self) -> BTreeSet<PeerPublicKey> {
        self.outstanding.keys().copied().collect()
    }

    pub fn latest_for(&self, peer: &PeerPublicKey) -> Option<ChangeCursor> {
        self.outstanding.get(peer).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.outstanding.is_empty()
    }
}
