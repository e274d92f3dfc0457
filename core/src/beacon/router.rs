//! Beacon Router — a mount table shared with the host's HTTP server
//!
//! The host builds its warp routes once and includes [`BeaconRouter::filter`].
//! Components mount and unmount read-only handlers at runtime; unmounted or
//! unknown paths fall through as a 404 rejection.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use warp::filters::path::FullPath;
use warp::filters::BoxedFilter;
use warp::Filter;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RouterError {
    #[error("Path already mounted: {0}")]
    PathInUse(String),
    #[error("Invalid path: {0}")]
    InvalidPath(String),
}

/// A GET handler mounted on the router. Handlers only read state.
pub trait RouteHandler: Send + Sync + 'static {
    fn handle(&self) -> warp::reply::Response;
}

/// Cloneable handle to one shared mount table.
///
/// Clones compare equal: they are the same router.
#[derive(Clone, Default)]
pub struct BeaconRouter {
    routes: Arc<RwLock<HashMap<String, Arc<dyn RouteHandler>>>>,
}

impl BeaconRouter {
    pub fn new() -> Self {
        Self::default()
    }

    fn validate(path: &str) -> Result<(), RouterError> {
        if !path.starts_with('/') || path.len() < 2 {
            return Err(RouterError::InvalidPath(path.to_string()));
        }
        Ok(())
    }

    /// Mount a handler at `path`
    pub fn mount(&self, path: &str, handler: Arc<dyn RouteHandler>) -> Result<(), RouterError> {
        Self::validate(path)?;
        let mut routes = self.routes.write();
        if routes.contains_key(path) {
            return Err(RouterError::PathInUse(path.to_string()));
        }
        routes.insert(path.to_string(), handler);
        tracing::debug!("Mounted handler at {}", path);
        Ok(())
    }

    /// Unmount whatever is at `path`. Returns false if nothing was mounted.
    pub fn unmount(&self, path: &str) -> bool {
        let removed = self.routes.write().remove(path).is_some();
        if removed {
            tracing::debug!("Unmounted handler at {}", path);
        }
        removed
    }

    pub fn is_mounted(&self, path: &str) -> bool {
        self.routes.read().contains_key(path)
    }

    /// Run the handler mounted at `path`, if any
    pub fn dispatch(&self, path: &str) -> Option<warp::reply::Response> {
        // Clone the handler out so no lock is held while it runs
        let handler = self.routes.read().get(path).cloned()?;
        Some(handler.handle())
    }

    /// Warp filter serving every mounted path on GET
    pub fn filter(&self) -> BoxedFilter<(warp::reply::Response,)> {
        let router = self.clone();
        warp::get()
            .and(warp::path::full())
            .and_then(move |path: FullPath| {
                let router = router.clone();
                async move {
                    router
                        .dispatch(path.as_str())
                        .ok_or_else(warp::reject::not_found)
                }
            })
            .boxed()
    }
}

impl PartialEq for BeaconRouter {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.routes, &other.routes)
    }
}

impl Eq for BeaconRouter {}

impl fmt::Debug for BeaconRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let routes = self.routes.read();
        let mut paths: Vec<&String> = routes.keys().collect();
        paths.sort();
        f.debug_struct("BeaconRouter").field("paths", &paths).finish()
    }
}
