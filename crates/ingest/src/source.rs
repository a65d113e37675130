//! Capture workers.
//!
//! Each `FrameSource` owns one capture stream on its own thread and publishes
//! envelopes into the shared channel at a rate-limited cadence. Device and
//! file sources run the same loop; only the opener call differs.

use crate::channel::{Publisher, Rejected};
use crate::error::PublishError;
use crate::frame::{Envelope, Frame, SourceId};
use crate::policy::{Backoff, PublishPolicy};
use crate::rate_limiter::RateLimiter;
use crate::stream::StreamOpener;
use opentelemetry::{KeyValue, global, metrics::Counter};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Longest uninterrupted sleep of a worker, so stop requests are seen promptly.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Status line cadence, in captured frames.
const STATUS_EVERY: u64 = 30;

/// Per-frame payload producer applied before publishing.
///
/// `Ok(None)` skips the frame without counting it as dropped.
pub type Transform<P> = Arc<dyn Fn(Frame) -> anyhow::Result<Option<P>> + Send + Sync>;

/// Transform that publishes raw frames.
pub fn identity() -> Transform<Frame> {
    Arc::new(|frame: Frame| -> anyhow::Result<Option<Frame>> { Ok(Some(frame)) })
}

/// What a source captures from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    Device(u32),
    File(PathBuf),
}

impl SourceKind {
    /// Identifier used when the descriptor does not name the source.
    pub fn default_id(&self) -> SourceId {
        match self {
            SourceKind::Device(index) => SourceId::Index(*index),
            SourceKind::File(path) => SourceId::Name(
                path.file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.display().to_string()),
            ),
        }
    }
}

/// Immutable capture parameters of one source.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptureSettings {
    /// Maximum capture frequency; `<= 0` captures as fast as the stream allows.
    pub fps: f64,
    /// How long one publish attempt may wait for room in the channel.
    pub timeout: Duration,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            fps: 30.0,
            timeout: Duration::from_millis(100),
        }
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessState {
    Created = 0,
    Running = 1,
    Stopped = 2,
}

impl LivenessState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => LivenessState::Created,
            1 => LivenessState::Running,
            _ => LivenessState::Stopped,
        }
    }
}

/// How a source's worker ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceExit {
    /// The stream ran out of frames.
    Finished,
    /// A stop was requested, or the source was never started.
    Cancelled,
    /// The stream could not be opened or read, the channel closed, or the worker panicked.
    Failed(String),
}

#[derive(Debug, Default)]
struct SourceCounters {
    captured: AtomicU64,
    published: AtomicU64,
    dropped: AtomicU64,
    retries: AtomicU64,
}

/// Point-in-time copy of a source's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceStats {
    pub captured: u64,
    pub published: u64,
    pub dropped: u64,
    pub retries: u64,
}

/// State shared between a source handle and its worker thread.
#[derive(Debug, Default)]
pub(crate) struct SourceShared {
    state: AtomicU8,
    stop: AtomicBool,
    counters: SourceCounters,
}

impl SourceShared {
    pub(crate) fn state(&self) -> LivenessState {
        LivenessState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: LivenessState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    pub(crate) fn stats(&self) -> SourceStats {
        let c = &self.counters;
        SourceStats {
            captured: c.captured.load(Ordering::Relaxed),
            published: c.published.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            retries: c.retries.load(Ordering::Relaxed),
        }
    }
}

/// Marks the source `Stopped` when the worker returns or unwinds.
struct StoppedOnExit(Arc<SourceShared>);

impl Drop for StoppedOnExit {
    fn drop(&mut self) {
        self.0.set_state(LivenessState::Stopped);
    }
}

/// Everything a worker needs, moved onto its thread at start.
pub(crate) struct SourceWiring<P> {
    pub publisher: Publisher<P>,
    pub opener: Arc<dyn StreamOpener>,
    pub transform: Transform<P>,
    pub policy: PublishPolicy,
}

enum Worker<P> {
    Pending(SourceWiring<P>),
    Spawned(JoinHandle<SourceExit>),
    Joined(SourceExit),
}

/// Handle to one capture worker.
pub struct FrameSource<P> {
    id: SourceId,
    kind: SourceKind,
    settings: CaptureSettings,
    shared: Arc<SourceShared>,
    worker: Worker<P>,
}

impl<P: Send + 'static> FrameSource<P> {
    pub(crate) fn new(
        id: SourceId,
        kind: SourceKind,
        settings: CaptureSettings,
        wiring: SourceWiring<P>,
    ) -> Self {
        Self {
            id,
            kind,
            settings,
            shared: Arc::new(SourceShared::default()),
            worker: Worker::Pending(wiring),
        }
    }

    /// Spawn the worker. Returns `false` if it was already started.
    pub(crate) fn start(&mut self) -> bool {
        let wiring =
            match std::mem::replace(&mut self.worker, Worker::Joined(SourceExit::Cancelled)) {
                Worker::Pending(wiring) => wiring,
                other => {
                    self.worker = other;
                    return false;
                }
            };

        let capture = CaptureLoop {
            id: self.id.clone(),
            kind: self.kind.clone(),
            settings: self.settings,
            shared: Arc::clone(&self.shared),
            wiring,
        };

        self.shared.set_state(LivenessState::Running);
        match spawn_worker(&self.id, move || capture.run()) {
            Ok(handle) => self.worker = Worker::Spawned(handle),
            Err(e) => {
                tracing::error!(source_id = %self.id, error = %e, "Failed to spawn capture worker");
                self.shared.set_state(LivenessState::Stopped);
                self.worker = Worker::Joined(SourceExit::Failed(format!("spawn failed: {}", e)));
            }
        }
        true
    }
}

impl<P> FrameSource<P> {
    pub fn id(&self) -> &SourceId {
        &self.id
    }

    pub fn kind(&self) -> &SourceKind {
        &self.kind
    }

    pub fn settings(&self) -> &CaptureSettings {
        &self.settings
    }

    pub fn state(&self) -> LivenessState {
        self.shared.state()
    }

    pub fn stats(&self) -> SourceStats {
        self.shared.stats()
    }

    pub(crate) fn shared(&self) -> Arc<SourceShared> {
        Arc::clone(&self.shared)
    }

    /// Ask the worker to stop at its next loop iteration.
    pub(crate) fn request_stop(&self) {
        self.shared.stop.store(true, Ordering::Relaxed);
    }

    /// Wait for the worker to exit. Safe to call repeatedly and on sources
    /// that never started or already ended on their own.
    pub(crate) fn join(&mut self) -> SourceExit {
        let exit = match std::mem::replace(&mut self.worker, Worker::Joined(SourceExit::Cancelled))
        {
            Worker::Pending(_) => {
                self.shared.set_state(LivenessState::Stopped);
                SourceExit::Cancelled
            }
            Worker::Spawned(handle) => handle.join().unwrap_or_else(|_| {
                tracing::error!(source_id = %self.id, "Capture worker panicked");
                SourceExit::Failed("worker panicked".to_string())
            }),
            Worker::Joined(exit) => exit,
        };
        self.worker = Worker::Joined(exit.clone());
        exit
    }
}

/// Run `work` on a dedicated named thread.
fn spawn_worker<F>(id: &SourceId, work: F) -> std::io::Result<JoinHandle<SourceExit>>
where
    F: FnOnce() -> SourceExit + Send + 'static,
{
    thread::Builder::new()
        .name(format!("framefeed-source-{}", id))
        .spawn(work)
}

struct SourceMetrics {
    captured: Counter<u64>,
    dropped: Counter<u64>,
    retries: Counter<u64>,
    attributes: [KeyValue; 1],
}

fn init_metrics(id: &SourceId) -> SourceMetrics {
    let meter = global::meter("ingest");
    SourceMetrics {
        captured: meter
            .u64_counter("ingest_frames_captured_total")
            .with_description("Frames read from the capture stream")
            .build(),
        dropped: meter
            .u64_counter("ingest_frames_dropped_total")
            .with_description("Frames discarded (channel full or transform error)")
            .build(),
        retries: meter
            .u64_counter("ingest_publish_retries_total")
            .with_description("Publish attempts that found the channel full")
            .build(),
        attributes: [KeyValue::new("source_id", id.to_string())],
    }
}

enum Published {
    Sent,
    Dropped,
    Cancelled,
    Closed,
}

struct CaptureLoop<P> {
    id: SourceId,
    kind: SourceKind,
    settings: CaptureSettings,
    shared: Arc<SourceShared>,
    wiring: SourceWiring<P>,
}

impl<P> CaptureLoop<P> {
    fn run(self) -> SourceExit {
        // Declared first so it drops last, after the stream is closed.
        let _stopped = StoppedOnExit(Arc::clone(&self.shared));

        let span = tracing::info_span!("frame_source", source_id = %self.id);
        let _enter = span.enter();

        let mut stream = match self.wiring.opener.open(&self.kind) {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!(error = %e, "Failed to open capture stream");
                return SourceExit::Failed(e.to_string());
            }
        };

        tracing::info!(
            kind = ?self.kind,
            fps = self.settings.fps,
            timeout = ?self.settings.timeout,
            "Capture started"
        );

        let metrics = init_metrics(&self.id);
        let mut limiter = RateLimiter::new(self.settings.fps);
        let mut backoff = match self.wiring.policy {
            PublishPolicy::Backoff(config) => Some(Backoff::new(config)),
            PublishPolicy::DropOnFull => None,
        };
        let counters = &self.shared.counters;
        let started = Instant::now();

        let exit = loop {
            if self.shared.stop_requested() {
                break SourceExit::Cancelled;
            }

            let delay = limiter.remaining();
            if !self.pause(delay) {
                break SourceExit::Cancelled;
            }
            limiter.mark(delay);

            let frame = match stream.read() {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    tracing::info!("End of stream reached");
                    break SourceExit::Finished;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Capture failed");
                    break SourceExit::Failed(e.to_string());
                }
            };

            let captured = counters.captured.fetch_add(1, Ordering::Relaxed) + 1;
            metrics.captured.add(1, &metrics.attributes);
            let sequence = frame.sequence();
            let _frame_span = tracing::debug_span!("frame", frame = sequence).entered();

            let payload = match (self.wiring.transform)(frame) {
                Ok(Some(payload)) => payload,
                Ok(None) => continue,
                Err(e) => {
                    counters.dropped.fetch_add(1, Ordering::Relaxed);
                    metrics.dropped.add(1, &metrics.attributes);
                    tracing::warn!(frame = sequence, error = %e, "Transform failed, frame dropped");
                    continue;
                }
            };

            let envelope = Envelope::new(self.id.clone(), payload);
            match self.publish(envelope, backoff.as_mut(), &metrics) {
                Published::Sent => {
                    counters.published.fetch_add(1, Ordering::Relaxed);
                }
                Published::Dropped => {
                    counters.dropped.fetch_add(1, Ordering::Relaxed);
                    metrics.dropped.add(1, &metrics.attributes);
                    tracing::debug!(frame = sequence, "Channel full, frame dropped");
                }
                Published::Cancelled => break SourceExit::Cancelled,
                Published::Closed => {
                    tracing::error!("Channel closed, stopping source");
                    break SourceExit::Failed(PublishError::Closed.to_string());
                }
            }

            if captured % STATUS_EVERY == 0 {
                let stats = self.shared.stats();
                tracing::debug!(
                    "Status: [Captured: {}] [Published: {}] [Dropped: {}] [Retries: {}]",
                    stats.captured,
                    stats.published,
                    stats.dropped,
                    stats.retries
                );
            }
        };

        let stats = self.shared.stats();
        tracing::info!(
            exit = ?exit,
            captured = stats.captured,
            published = stats.published,
            dropped = stats.dropped,
            elapsed = ?started.elapsed(),
            "Capture stopped"
        );
        exit
    }

    fn publish(
        &self,
        mut envelope: Envelope<P>,
        mut backoff: Option<&mut Backoff>,
        metrics: &SourceMetrics,
    ) -> Published {
        let publisher = &self.wiring.publisher;
        loop {
            match publisher.publish(envelope, self.settings.timeout) {
                Ok(()) => {
                    if let Some(backoff) = backoff.as_deref_mut() {
                        backoff.on_success();
                    }
                    return Published::Sent;
                }
                Err(Rejected {
                    reason: PublishError::Closed,
                    ..
                }) => return Published::Closed,
                Err(Rejected {
                    reason: PublishError::Timeout,
                    envelope: rejected,
                }) => {
                    let Some(backoff) = backoff.as_deref_mut() else {
                        return Published::Dropped;
                    };
                    if self.shared.stop_requested() {
                        return Published::Cancelled;
                    }

                    self.shared
                        .counters
                        .retries
                        .fetch_add(1, Ordering::Relaxed);
                    metrics.retries.add(1, &metrics.attributes);

                    let delay = backoff.on_failure();
                    tracing::trace!(delay = ?delay, "Channel full, backing off");
                    if !self.pause(delay) {
                        return Published::Cancelled;
                    }
                    envelope = rejected;
                }
            }
        }
    }

    /// Sleep for `delay`, waking early on a stop request. Returns `false` if stopped.
    fn pause(&self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            if self.shared.stop_requested() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep((deadline - now).min(STOP_POLL_INTERVAL));
        }
    }
}
