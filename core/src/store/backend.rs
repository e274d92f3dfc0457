// Change-feed backends: in-memory (tests, ephemeral nodes) and sled (durable)

use super::{ChangeCursor, ChangeEvent, ChangeFeed, ChangeStream, StoreError};
use crate::identity::PeerPublicKey;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

const LIVE_CHANNEL_CAPACITY: usize = 1024;

const DOCS_TREE: &str = "docs";
const CHANGES_TREE: &str = "changes";

// ============================================================================
// IN-MEMORY FEED
// ============================================================================

struct MemoryLog {
    events: Vec<ChangeEvent>,
    next: u64,
}

/// In-memory change feed useful for testing and nodes without persistence
#[derive(Clone)]
pub struct MemoryChangeFeed {
    log: Arc<Mutex<MemoryLog>>,
    live: broadcast::Sender<ChangeEvent>,
}

impl MemoryChangeFeed {
    pub fn new() -> Self {
        let (live, _) = broadcast::channel(LIVE_CHANNEL_CAPACITY);
        Self {
            log: Arc::new(Mutex::new(MemoryLog {
                events: Vec::new(),
                next: 1,
            })),
            live,
        }
    }

    /// Append a change and publish it to live subscribers
    pub fn record_change(&self, doc_id: &str, audience: Vec<PeerPublicKey>) -> ChangeCursor {
        let mut log = self.log.lock();
        let event = ChangeEvent {
            cursor: ChangeCursor(log.next),
            doc_id: doc_id.to_string(),
            audience,
        };
        log.next += 1;
        log.events.push(event.clone());
        // Sent under the lock so a concurrent subscribe sees it exactly once
        let _ = self.live.send(event.clone());
        event.cursor
    }

    pub fn len(&self) -> usize {
        self.log.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChangeFeed for MemoryChangeFeed {
    async fn subscribe(&self, since: ChangeCursor) -> Result<ChangeStream, StoreError> {
        let (backlog, receiver) = {
            let log = self.log.lock();
            let backlog: Vec<_> = log
                .events
                .iter()
                .filter(|e| e.cursor > since)
                .cloned()
                .collect();
            (backlog, self.live.subscribe())
        };

        let live = stream::unfold(Some(receiver), |state| async move {
            let mut receiver = state?;
            match receiver.recv().await {
                Ok(event) => Some((Ok(event), Some(receiver))),
                Err(broadcast::error::RecvError::Lagged(skipped)) => Some((
                    Err(StoreError::Interrupted(format!(
                        "subscriber lagged by {} changes",
                        skipped
                    ))),
                    None,
                )),
                Err(broadcast::error::RecvError::Closed) => None,
            }
        });

        Ok(stream::iter(backlog.into_iter().map(Ok)).chain(live).boxed())
    }
}

// ============================================================================
// SLED FEED
// ============================================================================

#[derive(Serialize, Deserialize)]
struct ChangeRecord {
    doc_id: String,
    audience: Vec<PeerPublicKey>,
}

fn decode_change(key: &[u8], value: &[u8]) -> Option<ChangeEvent> {
    let seq: [u8; 8] = key.try_into().ok()?;
    let record: ChangeRecord = match serde_json::from_slice(value) {
        Ok(record) => record,
        Err(e) => {
            warn!("Skipping corrupt change record: {}", e);
            return None;
        }
    };
    Some(ChangeEvent {
        cursor: ChangeCursor(u64::from_be_bytes(seq)),
        doc_id: record.doc_id,
        audience: record.audience,
    })
}

/// Durable store with a sequence-numbered change log.
///
/// Clones share one writer lock, so cursors land in the log in the order they
/// were allocated. Write through clones of one feed, not through separate
/// `from_db` feeds over the same database.
#[derive(Clone)]
pub struct SledChangeFeed {
    db: sled::Db,
    docs: sled::Tree,
    changes: sled::Tree,
    writer: Arc<Mutex<()>>,
}

impl SledChangeFeed {
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    pub fn from_db(db: sled::Db) -> Result<Self, StoreError> {
        let docs = db.open_tree(DOCS_TREE)?;
        let changes = db.open_tree(CHANGES_TREE)?;
        Ok(Self {
            db,
            docs,
            changes,
            writer: Arc::new(Mutex::new(())),
        })
    }

    /// Write a document and append the matching change record
    pub fn record_change(
        &self,
        doc_id: &str,
        audience: Vec<PeerPublicKey>,
        body: &[u8],
    ) -> Result<ChangeCursor, StoreError> {
        let record = serde_json::to_vec(&ChangeRecord {
            doc_id: doc_id.to_string(),
            audience,
        })
        .map_err(|e| StoreError::Storage(e.to_string()))?;

        // Live subscribers drop anything at or below the last cursor they saw,
        // so allocation and append must not interleave between writers
        let _writer = self.writer.lock();
        // generate_id is monotonic; +1 keeps cursor zero free for "start"
        let cursor = ChangeCursor(self.db.generate_id()? + 1);
        self.docs.insert(doc_id.as_bytes(), body)?;
        self.changes.insert(cursor.0.to_be_bytes(), record)?;
        debug!("Recorded change {} for {}", cursor.0, doc_id);
        Ok(cursor)
    }

    pub fn document(&self, doc_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.docs.get(doc_id.as_bytes())?.map(|v| v.to_vec()))
    }

    /// Cursor of the newest recorded change
    pub fn head(&self) -> Result<ChangeCursor, StoreError> {
        Ok(self
            .changes
            .last()?
            .and_then(|(k, v)| decode_change(&k, &v))
            .map(|e| e.cursor)
            .unwrap_or(ChangeCursor::START))
    }

    pub async fn flush(&self) -> Result<(), StoreError> {
        self.db.flush_async().await?;
        Ok(())
    }
}

#[async_trait]
impl ChangeFeed for SledChangeFeed {
    async fn subscribe(&self, since: ChangeCursor) -> Result<ChangeStream, StoreError> {
        // Watch before scanning so nothing written in between is missed;
        // duplicates are dropped by cursor below.
        let mut subscriber = self.changes.watch_prefix(Vec::<u8>::new());

        let mut backlog = Vec::new();
        let start = since.0.saturating_add(1).to_be_bytes();
        for item in self.changes.range(start..) {
            let (key, value) = item?;
            if let Some(event) = decode_change(&key, &value) {
                backlog.push(event);
            }
        }

        let (tx, rx) = mpsc::channel::<Result<ChangeEvent, StoreError>>(LIVE_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            let mut last = since;
            for event in backlog {
                last.advance_to(event.cursor);
                if tx.send(Ok(event)).await.is_err() {
                    return;
                }
            }

            loop {
                let next = tokio::select! {
                    _ = tx.closed() => return,
                    next = &mut subscriber => next,
                };
                match next {
                    Some(sled::Event::Insert { key, value }) => {
                        let Some(event) = decode_change(&key, &value) else {
                            continue;
                        };
                        if event.cursor <= last {
                            continue;
                        }
                        last = event.cursor;
                        if tx.send(Ok(event)).await.is_err() {
                            return;
                        }
                    }
                    Some(sled::Event::Remove { .. }) => continue,
                    None => {
                        let _ = tx
                            .send(Err(StoreError::Interrupted(
                                "sled subscriber closed".to_string(),
                            )))
                            .await;
                        return;
                    }
                }
            }
        });

        let stream = stream::unfold(rx, |mut rx| async move {
            let item = rx.recv().await?;
            Some((item, rx))
        });
        Ok(stream.boxed())
    }
}
