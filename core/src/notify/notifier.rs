//! Replication Notifier — keeps the beacon set in step with the store
//!
//! The notifier owns exactly one beacon service, created once at build time.
//! While started it follows the store's change feed, folds debounced batches
//! into a per-peer table of outstanding changes and re-issues beacons whenever
//! the notify-set changes. Feed failures are retried with exponential backoff;
//! beacon-service failures are logged in the background and surfaced from
//! `start`/`stop`/`acknowledge`.

use super::policy::{AudiencePolicy, NotifyPolicy, PendingChanges};
use crate::beacon::{
    BeaconError, BeaconRouter, BeaconServerFactory, BeaconService, BeaconServiceFactory,
};
use crate::identity::{LocalKeyPair, PeerPublicKey};
use crate::store::{ChangeCursor, ChangeEvent, ChangeFeed, ChangeStream, StoreError};
use futures::StreamExt;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NotifierError {
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Beacon service error: {0}")]
    Beacon(#[from] BeaconError),
    #[error("Change feed error: {0}")]
    Store(#[from] StoreError),
}

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Notifier tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifierConfig {
    /// Changes arriving within this window of the first one form one batch
    pub debounce: Duration,
    /// First delay before re-subscribing after a feed failure
    pub initial_backoff: Duration,
    /// Backoff doubles up to this cap
    pub max_backoff: Duration,
    /// Re-issue beacons before they expire while peers are still pending
    pub refresh_before_expiry: bool,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(250),
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(30),
            refresh_before_expiry: true,
        }
    }
}

impl NotifierConfig {
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    pub fn with_refresh(mut self, refresh: bool) -> Self {
        self.refresh_before_expiry = refresh;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), NotifierError> {
        if self.initial_backoff.is_zero() {
            return Err(NotifierError::Configuration(
                "initial_backoff must be positive".to_string(),
            ));
        }
        if self.max_backoff < self.initial_backoff {
            return Err(NotifierError::Configuration(
                "max_backoff must be >= initial_backoff".to_string(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// BUILDER
// ============================================================================

fn missing(what: &str) -> NotifierError {
    NotifierError::Configuration(format!("missing required argument: {}", what))
}

/// Collects the four required construction arguments plus optional seams
pub struct ReplicationNotifierBuilder {
    router: Option<BeaconRouter>,
    local_key: Option<LocalKeyPair>,
    expiration_ms: Option<u64>,
    store: Option<Arc<dyn ChangeFeed>>,
    policy: Arc<dyn NotifyPolicy>,
    factory: Arc<dyn BeaconServiceFactory>,
    config: NotifierConfig,
}

impl Default for ReplicationNotifierBuilder {
    fn default() -> Self {
        Self {
            router: None,
            local_key: None,
            expiration_ms: None,
            store: None,
            policy: Arc::new(AudiencePolicy),
            factory: Arc::new(BeaconServerFactory::new()),
            config: NotifierConfig::default(),
        }
    }
}

impl ReplicationNotifierBuilder {
    pub fn router(mut self, router: BeaconRouter) -> Self {
        self.router = Some(router);
        self
    }

    pub fn local_key(mut self, local_key: LocalKeyPair) -> Self {
        self.local_key = Some(local_key);
        self
    }

    pub fn expiration_ms(mut self, expiration_ms: u64) -> Self {
        self.expiration_ms = Some(expiration_ms);
        self
    }

    pub fn store(mut self, store: Arc<dyn ChangeFeed>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn policy(mut self, policy: Arc<dyn NotifyPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn factory(mut self, factory: Arc<dyn BeaconServiceFactory>) -> Self {
        self.factory = factory;
        self
    }

    pub fn config(mut self, config: NotifierConfig) -> Self {
        self.config = config;
        self
    }

    /// Validate everything, then create the beacon service exactly once.
    pub fn build(self) -> Result<ReplicationNotifier, NotifierError> {
        let router = self.router.ok_or_else(|| missing("router"))?;
        let local_key = self.local_key.ok_or_else(|| missing("local key pair"))?;
        let expiration_ms = self
            .expiration_ms
            .ok_or_else(|| missing("milliseconds until expiration"))?;
        let store = self.store.ok_or_else(|| missing("store"))?;

        if expiration_ms == 0 {
            return Err(NotifierError::Configuration(
                "milliseconds until expiration must be positive".to_string(),
            ));
        }
        self.config.validate()?;

        let beacons = self.factory.create(router, local_key, expiration_ms)?;

        Ok(ReplicationNotifier {
            shared: Arc::new(Shared {
                beacons,
                policy: self.policy,
                state: parking_lot::Mutex::new(NotifyState::default()),
                published: Mutex::new(None),
                refresh: refresh_period(&self.config, expiration_ms),
                refresh_at: parking_lot::Mutex::new(None),
            }),
            feed: store,
            config: self.config,
            expiration_ms,
            lifecycle: Mutex::new(None),
        })
    }
}

// ============================================================================
// SHARED STATE
// ============================================================================

#[derive(Default)]
struct NotifyState {
    initial: BTreeSet<PeerPublicKey>,
    pending: PendingChanges,
    cursor: ChangeCursor,
}

struct Shared {
    beacons: Arc<dyn BeaconService>,
    policy: Arc<dyn NotifyPolicy>,
    state: parking_lot::Mutex<NotifyState>,
    /// Last set handed to the beacon service; the lock also orders publishes
    published: Mutex<Option<Vec<PeerPublicKey>>>,
    /// Re-issue period, `None` when refresh is off
    refresh: Option<Duration>,
    /// Deadline for the next re-issue. Moves only when beacons are issued.
    refresh_at: parking_lot::Mutex<Option<Instant>>,
}

impl Shared {
    fn notify_set(&self) -> Vec<PeerPublicKey> {
        let state = self.state.lock();
        let mut peers = state.initial.clone();
        peers.extend(state.pending.peers());
        peers.into_iter().collect()
    }

    fn cursor(&self) -> ChangeCursor {
        self.state.lock().cursor
    }

    fn apply(&self, batch: &[ChangeEvent]) {
        let mut state = self.state.lock();
        state.pending.apply(batch, self.policy.as_ref());
        for event in batch {
            state.cursor.advance_to(event.cursor);
        }
    }

    /// Hand the current notify-set to the beacon service. Unless `force`d,
    /// an unchanged set is not re-issued. Returns whether a start was made.
    async fn publish(&self, force: bool) -> Result<bool, BeaconError> {
        let mut published = self.published.lock().await;
        let targets = self.notify_set();
        if !force && published.as_ref() == Some(&targets) {
            return Ok(false);
        }

        debug!("Publishing beacons for {} peer(s)", targets.len());
        self.beacons.start(targets.clone()).await?;
        *self.refresh_at.lock() = match self.refresh {
            Some(period) if !targets.is_empty() => Some(Instant::now() + period),
            _ => None,
        };
        *published = Some(targets);
        Ok(true)
    }

    fn refresh_deadline(&self) -> Option<Instant> {
        *self.refresh_at.lock()
    }

    fn defer_refresh(&self, delay: Duration) {
        *self.refresh_at.lock() = Some(Instant::now() + delay);
    }

    async fn forget_published(&self) {
        *self.published.lock().await = None;
        *self.refresh_at.lock() = None;
    }
}

// ============================================================================
// NOTIFIER
// ============================================================================

struct Subscription {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Subscription {
    async fn close(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!("Change feed watcher ended abnormally: {}", e);
        }
    }
}

/// Drives a beacon service from a store's change feed
pub struct ReplicationNotifier {
    shared: Arc<Shared>,
    feed: Arc<dyn ChangeFeed>,
    config: NotifierConfig,
    expiration_ms: u64,
    /// Serializes start/stop/acknowledge; `Some` while started
    lifecycle: Mutex<Option<Subscription>>,
}

impl ReplicationNotifier {
    pub fn builder() -> ReplicationNotifierBuilder {
        ReplicationNotifierBuilder::default()
    }

    /// Build with the default policy, config and beacon server
    pub fn new(
        router: BeaconRouter,
        local_key: LocalKeyPair,
        expiration_ms: u64,
        store: Arc<dyn ChangeFeed>,
    ) -> Result<Self, NotifierError> {
        Self::builder()
            .router(router)
            .local_key(local_key)
            .expiration_ms(expiration_ms)
            .store(store)
            .build()
    }

    pub async fn is_started(&self) -> bool {
        self.lifecycle.lock().await.is_some()
    }

    /// Peers currently being announced to (initial peers plus pending ones)
    pub fn notify_set(&self) -> Vec<PeerPublicKey> {
        self.shared.notify_set()
    }

    /// Last change folded into the notify-set
    pub fn cursor(&self) -> ChangeCursor {
        self.shared.cursor()
    }

    /// Lifetime of every issued beacon
    pub fn expiration_ms(&self) -> u64 {
        self.expiration_ms
    }

    /// Start announcing to `initial_peers` and follow the change feed.
    ///
    /// Calling again while started replaces the initial peers. If the beacon
    /// service fails on the first start, the feed is never subscribed.
    pub async fn start(&self, initial_peers: Option<Vec<PeerPublicKey>>) -> Result<(), NotifierError> {
        let mut lifecycle = self.lifecycle.lock().await;

        self.shared.state.lock().initial = initial_peers.unwrap_or_default().into_iter().collect();
        self.shared.publish(true).await?;

        if lifecycle.is_none() {
            let (shutdown, watcher) = watch::channel(false);
            let task = tokio::spawn(watch_changes(
                Arc::clone(&self.shared),
                Arc::clone(&self.feed),
                self.config.clone(),
                watcher,
            ));
            *lifecycle = Some(Subscription { shutdown, task });
            info!(
                "Replication notifier started from cursor {} (beacons live {} ms)",
                self.shared.cursor().0,
                self.expiration_ms
            );
        }
        Ok(())
    }

    /// Unsubscribe from the change feed, then stop the beacon service.
    ///
    /// The subscription is torn down even when the beacon service fails; its
    /// error is returned afterwards. No-op when not started.
    pub async fn stop(&self) -> Result<(), NotifierError> {
        let mut lifecycle = self.lifecycle.lock().await;
        let Some(subscription) = lifecycle.take() else {
            debug!("Replication notifier stop requested while not started");
            return Ok(());
        };

        subscription.close().await;
        let stopped = self.shared.beacons.stop().await;
        self.shared.forget_published().await;
        stopped?;

        info!("Replication notifier stopped");
        Ok(())
    }

    /// Record that `peer` has replicated everything up to `cursor`.
    ///
    /// Returns true if the peer left the pending set. While started, the
    /// beacon set is re-issued without it.
    pub async fn acknowledge(
        &self,
        peer: &PeerPublicKey,
        cursor: ChangeCursor,
    ) -> Result<bool, NotifierError> {
        let lifecycle = self.lifecycle.lock().await;
        let cleared = self.shared.state.lock().pending.acknowledge(peer, cursor);
        if cleared {
            debug!("Peer {} acknowledged through {}", peer.short(), cursor.0);
            if lifecycle.is_some() {
                self.shared.publish(false).await?;
            }
        }
        Ok(cleared)
    }
}

// ============================================================================
// CHANGE FEED WATCHER
// ============================================================================

fn refresh_period(config: &NotifierConfig, expiration_ms: u64) -> Option<Duration> {
    if !config.refresh_before_expiry {
        return None;
    }
    // Re-issue at three quarters of the beacon lifetime
    Some(Duration::from_millis((expiration_ms - expiration_ms / 4).max(1)))
}

fn next_backoff(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}

/// Sleep for `delay`, still refreshing beacons that come due meanwhile.
/// Returns true if shutdown was requested.
async fn pause(
    delay: Duration,
    shared: &Shared,
    retry: Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    let wake = tokio::time::sleep(delay);
    tokio::pin!(wake);
    loop {
        tokio::select! {
            _ = shutdown.changed() => return true,
            _ = &mut wake => return false,
            _ = refresh_due(shared) => refresh_beacons(shared, retry).await,
        }
    }
}

/// Resolves when the live beacons are due for re-issue
async fn refresh_due(shared: &Shared) {
    match shared.refresh_deadline() {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

enum Followed {
    Shutdown,
    Interrupted(String),
}

async fn watch_changes(
    shared: Arc<Shared>,
    feed: Arc<dyn ChangeFeed>,
    config: NotifierConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = config.initial_backoff;

    loop {
        let since = shared.cursor();
        let subscribed = tokio::select! {
            _ = shutdown.changed() => return,
            subscribed = feed.subscribe(since) => subscribed,
        };

        let reason = match subscribed {
            Ok(mut changes) => {
                debug!("Subscribed to change feed after cursor {}", since.0);
                match follow(&shared, &mut changes, &config, &mut shutdown, &mut backoff).await {
                    Followed::Shutdown => return,
                    Followed::Interrupted(reason) => reason,
                }
            }
            Err(e) => e.to_string(),
        };

        warn!("Change feed unavailable, retrying in {:?}: {}", backoff, reason);
        if pause(backoff, &shared, config.initial_backoff, &mut shutdown).await {
            return;
        }
        backoff = next_backoff(backoff, config.max_backoff);
    }
}

async fn follow(
    shared: &Shared,
    changes: &mut ChangeStream,
    config: &NotifierConfig,
    shutdown: &mut watch::Receiver<bool>,
    backoff: &mut Duration,
) -> Followed {
    loop {
        let first = tokio::select! {
            _ = shutdown.changed() => return Followed::Shutdown,
            _ = refresh_due(shared) => {
                refresh_beacons(shared, config.initial_backoff).await;
                continue;
            }
            next = changes.next() => next,
        };
        let first = match first {
            Some(Ok(event)) => event,
            Some(Err(e)) => return Followed::Interrupted(e.to_string()),
            None => return Followed::Interrupted("change feed ended".to_string()),
        };
        *backoff = config.initial_backoff;

        let mut batch = vec![first];
        let mut ended = None;
        let window = tokio::time::sleep(config.debounce);
        tokio::pin!(window);
        loop {
            tokio::select! {
                _ = shutdown.changed() => return Followed::Shutdown,
                _ = &mut window => break,
                next = changes.next() => match next {
                    Some(Ok(event)) => batch.push(event),
                    Some(Err(e)) => {
                        ended = Some(e.to_string());
                        break;
                    }
                    None => {
                        ended = Some("change feed ended".to_string());
                        break;
                    }
                },
            }
        }

        shared.apply(&batch);
        match shared.publish(false).await {
            Ok(true) => info!("Notify-set updated after {} change(s)", batch.len()),
            Ok(false) => debug!("{} change(s) left the notify-set unchanged", batch.len()),
            Err(e) => warn!("Failed to re-issue beacons: {}", e),
        }

        if let Some(reason) = ended {
            return Followed::Interrupted(reason);
        }
    }
}

async fn refresh_beacons(shared: &Shared, retry: Duration) {
    if let Err(e) = shared.publish(true).await {
        warn!("Failed to refresh beacons before expiry, retrying in {:?}: {}", retry, e);
        shared.defer_refresh(retry);
    }
}
