//! Stream Relay — copies bytes from one stream to another on its own task
//!
//! A relay never owns the decision of when its streams are closed, except
//! when it is explicitly stopped. On natural end-of-stream or on an I/O error
//! the streams are parked inside the handle, and the caller decides whether to
//! close them with [`RelayHandle::stop`].

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Upper bound for the copy buffer
pub const MAX_BUFFER_SIZE: usize = 8 * 1024;

/// Copy buffer used when none is configured
pub const DEFAULT_BUFFER_SIZE: usize = 4 * 1024;

/// How long a write, flush or shutdown may keep running after a stop
pub const STOP_GRACE: Duration = Duration::from_millis(500);

/// Anything a relay can read from
pub trait RelaySource: AsyncRead + Send + Unpin + 'static {}
impl<T: AsyncRead + Send + Unpin + 'static> RelaySource for T {}

/// Anything a relay can write to
pub trait RelaySink: AsyncWrite + Send + Unpin + 'static {}
impl<T: AsyncWrite + Send + Unpin + 'static> RelaySink for T {}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("Invalid buffer size {size}: must be > 0 and <= {max}")]
    InvalidBufferSize { size: usize, max: usize },
}

/// Relay configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Size of the copy buffer in bytes, in `1..=MAX_BUFFER_SIZE`
    pub buffer_size: usize,
    /// Emit a [`RelayEvent::Progress`] per chunk. Off by default, it costs throughput.
    pub notify_progress: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            notify_progress: false,
        }
    }
}

impl RelayConfig {
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    pub fn with_progress(mut self, notify: bool) -> Self {
        self.notify_progress = notify;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.buffer_size == 0 || self.buffer_size > MAX_BUFFER_SIZE {
            return Err(RelayError::InvalidBufferSize {
                size: self.buffer_size,
                max: MAX_BUFFER_SIZE,
            });
        }
        Ok(())
    }
}

/// Which side of the copy failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelaySide {
    Read,
    Write,
}

impl std::fmt::Display for RelaySide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelaySide::Read => write!(f, "read"),
            RelaySide::Write => write!(f, "write"),
        }
    }
}

/// Events reported by a running relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// One chunk was read and written (only when progress is enabled)
    Progress { relay: String, bytes: usize },
    /// Source reached end-of-stream; sink flushed
    Done { relay: String },
    /// Copy failed and the relay exited
    Error {
        relay: String,
        side: RelaySide,
        cause: String,
    },
    /// Streams were closed after a stop
    Closed { relay: String },
}

impl RelayEvent {
    pub fn relay(&self) -> &str {
        match self {
            RelayEvent::Progress { relay, .. }
            | RelayEvent::Done { relay }
            | RelayEvent::Error { relay, .. }
            | RelayEvent::Closed { relay } => relay,
        }
    }

    /// Done, Error and Closed all end the relay
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RelayEvent::Progress { .. })
    }
}

/// How the copy loop ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    Done,
    Stopped,
    Failed { side: RelaySide, cause: String },
}

/// Byte counters for one relay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub bytes_read: u64,
    pub bytes_written: u64,
}

struct Streams {
    source: Box<dyn RelaySource>,
    sink: Box<dyn RelaySink>,
}

struct Shared {
    name: String,
    stop: AtomicBool,
    stop_signal: Notify,
    closed: AtomicBool,
    /// Streams handed back by the worker once it exits without a stop
    parked: Mutex<Option<Streams>>,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    events: Option<mpsc::UnboundedSender<RelayEvent>>,
}

impl Shared {
    fn emit(&self, event: RelayEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    /// Close both streams once. Never fails; close errors are logged.
    async fn close_streams(&self, streams: Streams) {
        let Streams { source, mut sink } = streams;
        drop(source);
        match tokio::time::timeout(STOP_GRACE, sink.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("close_streams: failed to shut down sink ({}): {}", self.name, e),
            Err(_) => warn!("close_streams: sink shutdown timed out ({})", self.name),
        }
        drop(sink);

        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("close_streams: streams closed ({})", self.name);
            self.emit(RelayEvent::Closed {
                relay: self.name.clone(),
            });
        }
    }

    /// Drive a sink operation to completion. After a stop it gets
    /// [`STOP_GRACE`] to finish; `None` means it was abandoned.
    async fn until_stopped<F>(&self, op: F) -> Option<io::Result<()>>
    where
        F: Future<Output = io::Result<()>>,
    {
        tokio::pin!(op);
        if !self.stop.load(Ordering::SeqCst) {
            tokio::select! {
                result = &mut op => return Some(result),
                _ = self.stop_signal.notified() => {}
            }
        }
        tokio::time::timeout(STOP_GRACE, op).await.ok()
    }
}

/// A unidirectional copy job that has not been started yet
pub struct RelayTask {
    name: String,
    config: RelayConfig,
    streams: Streams,
}

impl RelayTask {
    /// Create a relay task. The buffer size is checked here, never clamped.
    pub fn new(
        name: impl Into<String>,
        source: impl RelaySource,
        sink: impl RelaySink,
        config: RelayConfig,
    ) -> Result<Self, RelayError> {
        config.validate()?;
        Ok(Self {
            name: name.into(),
            config,
            streams: Streams {
                source: Box::new(source),
                sink: Box::new(sink),
            },
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawn the copy loop. Events go to `events` when given.
    pub fn start(self, events: Option<mpsc::UnboundedSender<RelayEvent>>) -> RelayHandle {
        let shared = Arc::new(Shared {
            name: self.name,
            stop: AtomicBool::new(false),
            stop_signal: Notify::new(),
            closed: AtomicBool::new(false),
            parked: Mutex::new(None),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            events,
        });

        let worker = Arc::clone(&shared);
        let task = tokio::spawn(run(worker, self.streams, self.config));

        RelayHandle {
            shared,
            task: Mutex::new(Some(task)),
        }
    }
}

/// Open and start a relay in one step.
pub fn open(
    name: impl Into<String>,
    source: impl RelaySource,
    sink: impl RelaySink,
    buffer_size: usize,
    events: Option<mpsc::UnboundedSender<RelayEvent>>,
) -> Result<RelayHandle, RelayError> {
    let config = RelayConfig::default().with_buffer_size(buffer_size);
    Ok(RelayTask::new(name, source, sink, config)?.start(events))
}

async fn run(shared: Arc<Shared>, streams: Streams, config: RelayConfig) -> RelayOutcome {
    debug!("Entering relay ({})", shared.name);

    let Streams {
        mut source,
        mut sink,
    } = streams;
    let mut buffer = vec![0u8; config.buffer_size];
    let mut failure: Option<(RelaySide, String)> = None;
    let mut done = false;

    loop {
        if shared.stop.load(Ordering::SeqCst) {
            break;
        }

        let read = tokio::select! {
            _ = shared.stop_signal.notified() => break,
            read = source.read(&mut buffer) => read,
        };

        let count = match read {
            Ok(0) => {
                done = true;
                break;
            }
            Ok(count) => count,
            Err(e) => {
                failure = Some((RelaySide::Read, e.to_string()));
                break;
            }
        };
        shared.bytes_read.fetch_add(count as u64, Ordering::Relaxed);

        // An in-flight write may finish after a stop, within the grace period
        match shared.until_stopped(sink.write_all(&buffer[..count])).await {
            Some(Ok(())) => {}
            Some(Err(e)) => {
                failure = Some((RelaySide::Write, e.to_string()));
                break;
            }
            None => {
                warn!("Abandoned a blocked write after stop ({})", shared.name);
                break;
            }
        }
        shared.bytes_written.fetch_add(count as u64, Ordering::Relaxed);

        if config.notify_progress {
            shared.emit(RelayEvent::Progress {
                relay: shared.name.clone(),
                bytes: count,
            });
        }
    }

    match shared.until_stopped(sink.flush()).await {
        Some(Ok(())) => {}
        Some(Err(e)) => warn!("Failed to flush sink ({}): {}", shared.name, e),
        None => warn!("Abandoned a blocked flush after stop ({})", shared.name),
    }

    // The stop flag is only read or written under the parked lock, so either
    // the streams get parked before a stop (and the stop closes them) or the
    // worker sees the stop and closes them itself.
    let streams = Streams { source, sink };
    let mut parked = shared.parked.lock().await;
    if !shared.stop.load(Ordering::SeqCst) {
        *parked = Some(streams);
        drop(parked);
        return finish(&shared, done, failure);
    }

    shared.close_streams(streams).await;
    drop(parked);
    log_exit(&shared);
    RelayOutcome::Stopped
}

fn finish(shared: &Shared, done: bool, failure: Option<(RelaySide, String)>) -> RelayOutcome {
    let outcome = if let Some((side, cause)) = failure {
        error!("Relay {} failed on {}: {}", shared.name, side, cause);
        shared.emit(RelayEvent::Error {
            relay: shared.name.clone(),
            side,
            cause: cause.clone(),
        });
        RelayOutcome::Failed { side, cause }
    } else {
        debug_assert!(done);
        debug!("End of stream reached ({})", shared.name);
        shared.emit(RelayEvent::Done {
            relay: shared.name.clone(),
        });
        RelayOutcome::Done
    };
    log_exit(shared);
    outcome
}

fn log_exit(shared: &Shared) {
    info!(
        relay = %shared.name,
        bytes_read = shared.bytes_read.load(Ordering::Relaxed),
        bytes_written = shared.bytes_written.load(Ordering::Relaxed),
        "Exiting relay"
    );
}

/// Handle to a running (or finished) relay
pub struct RelayHandle {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<RelayOutcome>>>,
}

impl RelayHandle {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            bytes_read: self.shared.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.shared.bytes_written.load(Ordering::Relaxed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Stop the relay and close both streams.
    ///
    /// Safe to call concurrently, repeatedly, and after the relay has already
    /// finished on its own. Streams are closed exactly once.
    pub async fn stop(&self) {
        debug!("stop: {}", self.shared.name);
        let mut parked = self.shared.parked.lock().await;
        self.shared.stop.store(true, Ordering::SeqCst);
        self.shared.stop_signal.notify_one();

        if let Some(streams) = parked.take() {
            drop(parked);
            self.shared.close_streams(streams).await;
        }
    }

    /// Alias for [`RelayHandle::stop`]
    pub async fn close(&self) {
        self.stop().await
    }

    /// Wait for the copy loop to exit. Returns `None` if already joined.
    pub async fn join(&self) -> Option<RelayOutcome> {
        let task = self.task.lock().await.take()?;
        match task.await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                error!("Relay task {} panicked or was cancelled: {}", self.shared.name, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::duplex;

    async fn next_terminal(rx: &mut mpsc::UnboundedReceiver<RelayEvent>) -> RelayEvent {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for relay event")
                .expect("event channel closed");
            if event.is_terminal() {
                return event;
            }
        }
    }

    #[test]
    fn test_buffer_size_bounds() {
        assert!(RelayConfig::default().validate().is_ok());
        assert!(RelayConfig::default()
            .with_buffer_size(MAX_BUFFER_SIZE)
            .validate()
            .is_ok());
        assert_eq!(
            RelayConfig::default().with_buffer_size(0).validate(),
            Err(RelayError::InvalidBufferSize {
                size: 0,
                max: MAX_BUFFER_SIZE
            })
        );
        assert!(RelayConfig::default()
            .with_buffer_size(MAX_BUFFER_SIZE + 1)
            .validate()
            .is_err());
    }

    #[tokio::test]
    async fn test_open_rejects_bad_buffer() {
        let (a, _b) = duplex(64);
        let (c, _d) = duplex(64);
        assert!(open("bad", a, c, 0, None).is_err());
    }

    #[tokio::test]
    async fn test_copies_until_end_of_stream() {
        let (mut writer, source) = duplex(1024);
        let (sink, mut reader) = duplex(64 * 1024);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handle = open("copy", source, sink, 16, Some(tx)).unwrap();

        let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        writer.write_all(&payload).await.unwrap();
        drop(writer);

        assert_eq!(
            next_terminal(&mut rx).await,
            RelayEvent::Done {
                relay: "copy".to_string()
            }
        );
        assert_eq!(handle.join().await, Some(RelayOutcome::Done));
        assert_eq!(handle.stats().bytes_written, payload.len() as u64);

        // Done does not close the sink; the caller still owns it
        assert!(!handle.is_closed());
        handle.stop().await;
        assert!(handle.is_closed());

        let mut received = Vec::new();
        reader.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn test_stop_closes_streams_and_signals_closed() {
        let (_writer, source) = duplex(1024);
        let (sink, mut reader) = duplex(1024);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handle = open("idle", source, sink, 1024, Some(tx)).unwrap();
        handle.stop().await;

        assert_eq!(
            next_terminal(&mut rx).await,
            RelayEvent::Closed {
                relay: "idle".to_string()
            }
        );
        assert_eq!(handle.join().await, Some(RelayOutcome::Stopped));

        // Sink was shut down: reader sees EOF
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_closes_once() {
        let (writer, source) = duplex(64);
        let (sink, _reader) = duplex(64);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handle = open("twice", source, sink, 64, Some(tx)).unwrap();
        drop(writer);
        assert!(matches!(next_terminal(&mut rx).await, RelayEvent::Done { .. }));
        handle.join().await;

        handle.stop().await;
        handle.stop().await;
        handle.close().await;

        assert!(matches!(rx.recv().await, Some(RelayEvent::Closed { .. })));
        drop(handle);
        assert!(rx.recv().await.is_none(), "Closed must be reported once");
    }

    #[tokio::test]
    async fn test_concurrent_stops_do_not_race() {
        let (_writer, source) = duplex(64);
        let (sink, _reader) = duplex(64);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handle = Arc::new(open("race", source, sink, 64, Some(tx)).unwrap());
        let stops: Vec<_> = (0..8)
            .map(|_| {
                let handle = Arc::clone(&handle);
                tokio::spawn(async move { handle.stop().await })
            })
            .collect();
        for stop in stops {
            stop.await.unwrap();
        }
        handle.join().await;

        let mut closed = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, RelayEvent::Closed { .. }) {
                closed += 1;
            }
        }
        assert_eq!(closed, 1);
    }

    #[tokio::test]
    async fn test_write_failure_reports_write_side() {
        let (mut writer, source) = duplex(64);
        let (sink, reader) = duplex(64);
        drop(reader);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handle = open("broken", source, sink, 64, Some(tx)).unwrap();
        writer.write_all(b"hello").await.unwrap();

        match next_terminal(&mut rx).await {
            RelayEvent::Error { side, .. } => assert_eq!(side, RelaySide::Write),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(!handle.is_closed(), "errors do not close streams");
        handle.stop().await;
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_stop_wins_over_a_blocked_write() {
        let (mut writer, source) = duplex(64 * 1024);
        // Never drained: the relay blocks once the sink's buffer is full
        let (sink, _stalled) = duplex(64);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handle = open("stalled", source, sink, 1024, Some(tx)).unwrap();
        writer.write_all(&[1u8; 8 * 1024]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.stats().bytes_written, 0);

        tokio::time::timeout(STOP_GRACE * 4, handle.stop())
            .await
            .expect("stop blocked");
        let outcome = tokio::time::timeout(STOP_GRACE * 4, handle.join())
            .await
            .expect("relay worker did not exit");
        assert_eq!(outcome, Some(RelayOutcome::Stopped));
        assert!(matches!(next_terminal(&mut rx).await, RelayEvent::Closed { .. }));
    }

    #[tokio::test]
    async fn test_progress_events_when_enabled() {
        let (mut writer, source) = duplex(64);
        let (sink, _reader) = duplex(1024);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let config = RelayConfig::default().with_buffer_size(8).with_progress(true);
        let handle = RelayTask::new("progress", source, sink, config)
            .unwrap()
            .start(Some(tx));

        writer.write_all(&[7u8; 20]).await.unwrap();
        drop(writer);

        let mut progressed = 0;
        loop {
            match rx.recv().await.unwrap() {
                RelayEvent::Progress { bytes, .. } => progressed += bytes,
                RelayEvent::Done { .. } => break,
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(progressed, 20);
        handle.stop().await;
    }
}
