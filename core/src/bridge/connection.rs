// Connection — per-peer bridge state and the session table that owns it
//
// The table is the single owner of every Connection. All reads and updates go
// through it under one lock; nothing hands out references to entries.

use crate::identity::PeerId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::warn;

/// Lifecycle of one bridged connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Port allocated, waiting for the local accept
    Pending,
    /// Both relays running
    Bridging,
    /// Terminal
    Closed,
}

impl ConnectionState {
    /// Pending → Bridging → Closed, and Pending → Closed. Nothing leaves Closed.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        matches!(
            (self, next),
            (ConnectionState::Pending, ConnectionState::Bridging)
                | (ConnectionState::Pending, ConnectionState::Closed)
                | (ConnectionState::Bridging, ConnectionState::Closed)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Pending => write!(f, "Pending"),
            ConnectionState::Bridging => write!(f, "Bridging"),
            ConnectionState::Closed => write!(f, "Closed"),
        }
    }
}

/// What to do when a peer that is already bridged connects again
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DuplicatePolicy {
    /// Keep the live bridge and hand back its port; the new transport is dropped
    #[default]
    ReuseExisting,
    /// Refuse with `AlreadyConnected`
    RejectDuplicate,
}

/// One peer's bridge: a local port and the relay pair behind it
#[derive(Debug)]
pub struct Connection {
    peer: PeerId,
    port: u16,
    generation: u64,
    state: ConnectionState,
    opened_at: Instant,
    disconnect: Arc<Notify>,
    /// Flips to true once the port is given back
    released: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl Connection {
    pub fn new(peer: PeerId, port: u16, generation: u64) -> Self {
        Self {
            peer,
            port,
            generation,
            state: ConnectionState::Pending,
            opened_at: Instant::now(),
            disconnect: Arc::new(Notify::new()),
            released: watch::channel(false).0,
            task: None,
        }
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Distinguishes successive bridges for the same peer
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn opened_at(&self) -> Instant {
        self.opened_at
    }

    /// Move to `next`. Invalid transitions are refused and logged.
    pub fn transition(&mut self, next: ConnectionState) -> bool {
        if !self.state.can_transition_to(next) {
            warn!(
                peer = %self.peer,
                "Refusing connection transition {} -> {}", self.state, next
            );
            return false;
        }
        self.state = next;
        true
    }

    pub(crate) fn disconnect_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.disconnect)
    }

    pub(crate) fn released_signal(&self) -> watch::Receiver<bool> {
        self.released.subscribe()
    }

    /// Wake everyone waiting in [`Connection::released_signal`]
    pub(crate) fn mark_released(&self) {
        self.released.send_replace(true);
    }

    pub(crate) fn attach_task(&mut self, task: JoinHandle<()>) {
        self.task = Some(task);
    }

    pub(crate) fn take_task(&mut self) -> Option<JoinHandle<()>> {
        self.task.take()
    }
}

/// Peer → Connection table
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: Mutex<HashMap<PeerId, Connection>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` against the whole table under its lock
    pub fn with_sessions<R>(&self, f: impl FnOnce(&mut HashMap<PeerId, Connection>) -> R) -> R {
        f(&mut self.sessions.lock())
    }

    /// Run `f` against one peer's connection, if present
    pub fn update_for_peer<R>(
        &self,
        peer: &PeerId,
        f: impl FnOnce(&mut Connection) -> R,
    ) -> Option<R> {
        self.sessions.lock().get_mut(peer).map(f)
    }

    /// Remove the peer's entry only if it is still the given generation
    pub fn remove_generation(&self, peer: &PeerId, generation: u64) -> Option<Connection> {
        let mut sessions = self.sessions.lock();
        match sessions.get(peer) {
            Some(conn) if conn.generation == generation => sessions.remove(peer),
            _ => None,
        }
    }

    pub fn port_for(&self, peer: &PeerId) -> Option<u16> {
        self.sessions.lock().get(peer).map(|c| c.port)
    }

    pub fn state_of(&self, peer: &PeerId) -> Option<ConnectionState> {
        self.sessions.lock().get(peer).map(|c| c.state)
    }

    pub fn peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<_> = self.sessions.lock().keys().cloned().collect();
        peers.sort();
        peers
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
