//! Beacon Server — issues per-peer beacons and serves them over HTTP
//!
//! `start` replaces the whole notification set and `stop` retires it. Both
//! run under one async lock, so an overlapping call sees either the old set or
//! the new one, never a mix. The HTTP handler takes a single snapshot of the
//! current set per request and filters out anything expired.

use super::payload::{BeaconBuilder, NotificationSet, DEFAULT_BEACON_PATH};
use super::router::{BeaconRouter, RouteHandler};
use super::BeaconError;
use crate::clock::{Clock, SystemClock};
use crate::identity::{LocalKeyPair, PeerPublicKey};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};
use warp::Reply;

#[cfg(test)]
use mockall::automock;

/// Beacon server configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeaconServerConfig {
    /// Lifetime of every issued beacon
    pub expiration_ms: u64,
    /// Path the beacon list is mounted on
    pub path: String,
}

impl BeaconServerConfig {
    pub fn new(expiration_ms: u64) -> Self {
        Self {
            expiration_ms,
            path: DEFAULT_BEACON_PATH.to_string(),
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), BeaconError> {
        if self.expiration_ms == 0 {
            return Err(BeaconError::Configuration(
                "milliseconds until expiration must be positive".to_string(),
            ));
        }
        if !self.path.starts_with('/') {
            return Err(BeaconError::Configuration(format!(
                "beacon path must start with '/': {}",
                self.path
            )));
        }
        Ok(())
    }
}

/// Start/stop surface the notifier drives
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BeaconService: Send + Sync {
    /// Replace the active notification set with beacons for `targets`
    async fn start(&self, targets: Vec<PeerPublicKey>) -> Result<(), BeaconError>;
    /// Retire every beacon and unmount the endpoint. No-op when not started.
    async fn stop(&self) -> Result<(), BeaconError>;
}

/// Constructs the beacon service a notifier owns
#[cfg_attr(test, automock)]
pub trait BeaconServiceFactory: Send + Sync {
    fn create(
        &self,
        router: BeaconRouter,
        local_key: LocalKeyPair,
        expiration_ms: u64,
    ) -> Result<Arc<dyn BeaconService>, BeaconError>;
}

/// Factory producing real [`BeaconServer`]s
#[derive(Clone)]
pub struct BeaconServerFactory {
    clock: Arc<dyn Clock>,
    path: String,
}

impl BeaconServerFactory {
    pub fn new() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            path: DEFAULT_BEACON_PATH.to_string(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }
}

impl Default for BeaconServerFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl BeaconServiceFactory for BeaconServerFactory {
    fn create(
        &self,
        router: BeaconRouter,
        local_key: LocalKeyPair,
        expiration_ms: u64,
    ) -> Result<Arc<dyn BeaconService>, BeaconError> {
        let config = BeaconServerConfig::new(expiration_ms).with_path(self.path.clone());
        let server = BeaconServer::with_clock(router, local_key, config, Arc::clone(&self.clock))?;
        Ok(Arc::new(server))
    }
}

type SharedSet = Arc<RwLock<Arc<NotificationSet>>>;

/// Read-only HTTP handler over the current notification set
struct BeaconListHandler {
    current: SharedSet,
    clock: Arc<dyn Clock>,
}

impl RouteHandler for BeaconListHandler {
    fn handle(&self) -> warp::reply::Response {
        let snapshot = Arc::clone(&self.current.read());
        let live = snapshot.encode_live(self.clock.now_ms());
        warp::reply::json(&live).into_response()
    }
}

/// Issues and serves notification beacons
pub struct BeaconServer {
    router: BeaconRouter,
    builder: BeaconBuilder,
    path: String,
    clock: Arc<dyn Clock>,
    current: SharedSet,
    /// Serializes start/stop; holds whether the endpoint is mounted
    started: Mutex<bool>,
}

impl BeaconServer {
    /// Create a beacon server using the system clock
    pub fn new(
        router: BeaconRouter,
        local_key: LocalKeyPair,
        config: BeaconServerConfig,
    ) -> Result<Self, BeaconError> {
        Self::with_clock(router, local_key, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        router: BeaconRouter,
        local_key: LocalKeyPair,
        config: BeaconServerConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, BeaconError> {
        config.validate()?;
        Ok(Self {
            router,
            builder: BeaconBuilder::new(local_key, config.expiration_ms)?,
            path: config.path,
            clock,
            current: Arc::new(RwLock::new(Arc::new(NotificationSet::empty()))),
            started: Mutex::new(false),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub async fn is_started(&self) -> bool {
        *self.started.lock().await
    }

    /// Snapshot of the current notification set, expired beacons included
    pub fn notification_set(&self) -> Arc<NotificationSet> {
        Arc::clone(&self.current.read())
    }

    /// What a fetcher would receive right now
    pub fn live_beacons(&self) -> Vec<String> {
        self.notification_set().encode_live(self.clock.now_ms())
    }
}

#[async_trait]
impl BeaconService for BeaconServer {
    async fn start(&self, targets: Vec<PeerPublicKey>) -> Result<(), BeaconError> {
        let mut started = self.started.lock().await;

        let next = self.builder.build(&targets, self.clock.now_ms())?;
        let previous = self.notification_set();
        let retired = previous.targets().difference(&next.targets()).count();

        if !*started {
            let handler = BeaconListHandler {
                current: Arc::clone(&self.current),
                clock: Arc::clone(&self.clock),
            };
            self.router.mount(&self.path, Arc::new(handler))?;
            *started = true;
        }

        let count = next.len();
        *self.current.write() = Arc::new(next);

        info!(
            "Beacon server started: {} beacon(s) at {}, {} retired",
            count, self.path, retired
        );
        Ok(())
    }

    async fn stop(&self) -> Result<(), BeaconError> {
        let mut started = self.started.lock().await;
        if !*started {
            debug!("Beacon server stop requested while not started");
            return Ok(());
        }

        self.router.unmount(&self.path);
        *self.current.write() = Arc::new(NotificationSet::empty());
        *started = false;

        info!("Beacon server stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beacon::payload::BeaconParser;
    use crate::clock::ManualClock;

    fn server(clock: &ManualClock, expiration_ms: u64) -> (BeaconServer, BeaconRouter, LocalKeyPair) {
        let router = BeaconRouter::new();
        let local = LocalKeyPair::generate();
        let server = BeaconServer::with_clock(
            router.clone(),
            local.clone(),
            BeaconServerConfig::new(expiration_ms),
            Arc::new(clock.clone()),
        )
        .unwrap();
        (server, router, local)
    }

    async fn fetch(router: &BeaconRouter) -> Option<String> {
        let response = router.dispatch(DEFAULT_BEACON_PATH)?;
        let body = warp::hyper::body::to_bytes(response.into_body()).await.unwrap();
        Some(String::from_utf8(body.to_vec()).unwrap())
    }

    #[test]
    fn test_config_validation() {
        assert!(BeaconServerConfig::new(0).validate().is_err());
        assert!(BeaconServerConfig::new(10).with_path("x").validate().is_err());
        assert!(BeaconServerConfig::new(10).validate().is_ok());
    }

    #[tokio::test]
    async fn test_stop_when_never_started_is_noop() {
        let clock = ManualClock::new(0);
        let (server, router, _) = server(&clock, 1_000);
        server.stop().await.unwrap();
        server.stop().await.unwrap();
        assert!(!router.is_mounted(DEFAULT_BEACON_PATH));
    }

    #[tokio::test]
    async fn test_start_mounts_and_stop_unmounts() {
        let clock = ManualClock::new(0);
        let (server, router, _) = server(&clock, 1_000);
        let peer = LocalKeyPair::generate();

        server.start(vec![peer.public_key()]).await.unwrap();
        assert!(router.is_mounted(DEFAULT_BEACON_PATH));
        assert_eq!(server.live_beacons().len(), 1);

        server.stop().await.unwrap();
        assert!(!router.is_mounted(DEFAULT_BEACON_PATH));
        assert!(server.live_beacons().is_empty());
        assert!(fetch(&router).await.is_none());
    }

    #[tokio::test]
    async fn test_restart_replaces_and_regenerates() {
        let clock = ManualClock::new(0);
        let (server, _router, _) = server(&clock, 1_000);
        let p = LocalKeyPair::generate().public_key();
        let q = LocalKeyPair::generate().public_key();
        let r = LocalKeyPair::generate().public_key();

        server.start(vec![p, q]).await.unwrap();
        let first = server.notification_set();

        clock.advance(10);
        server.start(vec![q, r]).await.unwrap();
        let second = server.notification_set();

        assert_eq!(second.targets(), [q, r].into_iter().collect());
        assert!(second.get(&p).is_none());

        let old_q = first.get(&q).unwrap();
        let new_q = second.get(&q).unwrap();
        assert_ne!(old_q.payload, new_q.payload);
        assert_eq!(new_q.issued_at, 10);
        assert_eq!(new_q.expires_at, 1_010);
    }

    #[tokio::test]
    async fn test_expired_beacons_are_never_served() {
        let clock = ManualClock::new(1_000);
        let (server, router, local) = server(&clock, 500);
        let peer = LocalKeyPair::generate();
        server.start(vec![peer.public_key()]).await.unwrap();

        clock.set(1_499);
        let body = fetch(&router).await.unwrap();
        let found = BeaconParser::new(peer.clone()).parse_list(&body, clock.now_ms());
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].sender, local.public_key());

        clock.set(1_501);
        assert_eq!(fetch(&router).await.unwrap(), "[]");
    }

    #[tokio::test]
    async fn test_concurrent_starts_leave_a_whole_set() {
        let clock = ManualClock::new(0);
        let (server, _router, _) = server(&clock, 1_000);
        let server = Arc::new(server);
        let a: Vec<_> = (0..3).map(|_| LocalKeyPair::generate().public_key()).collect();
        let b: Vec<_> = (0..5).map(|_| LocalKeyPair::generate().public_key()).collect();

        let s1 = Arc::clone(&server);
        let a1 = a.clone();
        let t1 = tokio::spawn(async move { s1.start(a1).await });
        let s2 = Arc::clone(&server);
        let b1 = b.clone();
        let t2 = tokio::spawn(async move { s2.start(b1).await });
        t1.await.unwrap().unwrap();
        t2.await.unwrap().unwrap();

        let targets = server.notification_set().targets();
        let a_set = a.into_iter().collect();
        let b_set = b.into_iter().collect();
        assert!(targets == a_set || targets == b_set);
    }
}
