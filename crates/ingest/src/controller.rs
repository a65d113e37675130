//! Supervisor of a fixed set of sources and owner of the consumer buffer.
//!
//! Every operation takes `&self`, so one controller can be shared through an
//! `Arc` by a drain thread and a consumer thread.

use crate::channel::Collector;
use crate::frame::{Envelope, SourceId};
use crate::source::{FrameSource, LivenessState, SourceExit, SourceShared, SourceStats};
use common::span;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct FrameController<P> {
    sources: Mutex<Vec<FrameSource<P>>>,
    shared: Vec<(SourceId, Arc<SourceShared>)>,
    collector: Collector<P>,
    buffer: Mutex<Vec<Envelope<P>>>,
    started: AtomicBool,
}

impl<P: Send + 'static> FrameController<P> {
    pub(crate) fn new(sources: Vec<FrameSource<P>>, collector: Collector<P>) -> Self {
        let shared = sources
            .iter()
            .map(|source| (source.id().clone(), source.shared()))
            .collect();
        Self {
            sources: Mutex::new(sources),
            shared,
            collector,
            buffer: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Spawn every source that has not been started yet. Returns how many
    /// workers were spawned by this call.
    pub fn start_sources(&self) -> usize {
        let mut sources = lock(&self.sources);
        let mut spawned = 0;
        for source in sources.iter_mut() {
            if source.start() {
                spawned += 1;
            } else {
                tracing::warn!(source_id = %source.id(), "Source already started, skipping");
            }
        }
        self.started.store(true, Ordering::Release);
        tracing::info!(
            sources = sources.len(),
            spawned,
            capacity = self.collector.capacity(),
            "Sources started"
        );
        spawned
    }
}

impl<P> FrameController<P> {
    /// Whether `start_sources` has completed.
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// At least one source has not reached `Stopped`. Sources that were
    /// never started count as alive.
    pub fn has_alive_sources(&self) -> bool {
        self.shared
            .iter()
            .any(|(_, shared)| shared.state() != LivenessState::Stopped)
    }

    /// Wait up to `timeout` for one envelope, then move it and everything
    /// else already queued into the buffer. Returns the number moved.
    pub fn drain(&self, timeout: Duration) -> usize {
        let Some(first) = self.collector.receive(timeout) else {
            return 0;
        };

        let mut batch = vec![first];
        self.collect_ready(&mut batch);

        let moved = batch.len();
        lock(&self.buffer).extend(batch);
        moved
    }

    /// Hand the whole buffer to the caller, oldest first.
    pub fn take_buffered(&self) -> Vec<Envelope<P>> {
        std::mem::take(&mut *lock(&self.buffer))
    }

    pub fn fetch_and_take(&self, timeout: Duration) -> Vec<Envelope<P>> {
        self.drain(timeout);
        self.take_buffered()
    }

    /// Drain until every source has stopped, then sweep whatever they
    /// published last. Returns the total number of envelopes moved.
    pub fn run_loop(&self, timeout: Duration) -> usize {
        let mut moved = 0;
        while self.has_alive_sources() {
            moved += self.drain(timeout);
        }

        let mut rest = Vec::new();
        self.collect_ready(&mut rest);
        moved += rest.len();
        lock(&self.buffer).extend(rest);

        tracing::debug!(moved, "Drain loop finished, no live sources left");
        moved
    }

    /// Stop every worker and wait for all of them. Safe to call more than
    /// once and on sources that already ended.
    pub fn stop_sources(&self) -> Vec<(SourceId, SourceExit)> {
        let _s = span!("stop_sources");
        let mut sources = lock(&self.sources);
        for source in sources.iter() {
            source.request_stop();
        }

        let exits: Vec<_> = sources
            .iter_mut()
            .map(|source| (source.id().clone(), source.join()))
            .collect();

        for (id, exit) in &exits {
            match exit {
                SourceExit::Failed(reason) => {
                    tracing::warn!(source_id = %id, reason = %reason, "Source failed")
                }
                other => tracing::debug!(source_id = %id, exit = ?other, "Source joined"),
            }
        }
        exits
    }

    pub fn source_ids(&self) -> Vec<SourceId> {
        self.shared.iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn states(&self) -> Vec<(SourceId, LivenessState)> {
        self.shared
            .iter()
            .map(|(id, shared)| (id.clone(), shared.state()))
            .collect()
    }

    pub fn stats(&self) -> Vec<(SourceId, SourceStats)> {
        self.shared
            .iter()
            .map(|(id, shared)| (id.clone(), shared.stats()))
            .collect()
    }

    pub fn capacity(&self) -> usize {
        self.collector.capacity()
    }

    /// Non-blocking: append queued envelopes, at most one channel's worth.
    fn collect_ready(&self, batch: &mut Vec<Envelope<P>>) {
        let limit = batch.len() + self.collector.capacity();
        while batch.len() < limit {
            match self.collector.try_receive() {
                Some(envelope) => batch.push(envelope),
                None => break,
            }
        }
    }
}

impl<P> Drop for FrameController<P> {
    fn drop(&mut self) {
        let sources = self
            .sources
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        for source in sources.iter() {
            source.request_stop();
        }
        for source in sources.iter_mut() {
            source.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel;
    use crate::error::CaptureError;
    use crate::frame::Frame;
    use crate::policy::{BackoffConfig, PublishPolicy};
    use crate::source::{CaptureSettings, SourceKind, SourceWiring, Transform, identity};
    use crate::stream::{CaptureStream, StreamOpener};
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use std::thread;
    use std::time::Instant;

    /// Stream of `remaining` tiny frames that records when it is released.
    struct FakeStream {
        remaining: u64,
        next: u64,
        closed: Arc<AtomicBool>,
    }

    impl CaptureStream for FakeStream {
        fn read(&mut self) -> Result<Option<Frame>, CaptureError> {
            if self.remaining == 0 {
                return Ok(None);
            }
            self.remaining -= 1;
            let frame = Frame::new(1, 1, self.next, vec![0; 3]);
            self.next += 1;
            Ok(Some(frame))
        }
    }

    impl Drop for FakeStream {
        fn drop(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn fake(frames: u64, closed: Arc<AtomicBool>) -> Arc<dyn StreamOpener> {
        Arc::new(
            move |_: &SourceKind| -> Result<Box<dyn CaptureStream>, CaptureError> {
                Ok(Box::new(FakeStream {
                    remaining: frames,
                    next: 0,
                    closed: Arc::clone(&closed),
                }))
            },
        )
    }

    fn failing() -> Arc<dyn StreamOpener> {
        Arc::new(
            |kind: &SourceKind| -> Result<Box<dyn CaptureStream>, CaptureError> {
                Err(CaptureError::open(format!("{:?}", kind), "device busy"))
            },
        )
    }

    struct Setup<P> {
        capacity: usize,
        policy: PublishPolicy,
        timeout: Duration,
        transform: Transform<P>,
    }

    impl Setup<Frame> {
        fn new(capacity: usize) -> Self {
            Self {
                capacity,
                policy: PublishPolicy::default(),
                timeout: Duration::from_millis(20),
                transform: identity(),
            }
        }
    }

    impl<P: Send + 'static> Setup<P> {
        fn build(self, openers: Vec<(&str, Arc<dyn StreamOpener>)>) -> FrameController<P> {
            let (publisher, collector) = channel::bounded(self.capacity);
            let settings = CaptureSettings {
                fps: 0.0,
                timeout: self.timeout,
            };
            let sources = openers
                .into_iter()
                .map(|(name, opener)| {
                    FrameSource::new(
                        SourceId::from(name),
                        SourceKind::File(PathBuf::from(name)),
                        settings,
                        SourceWiring {
                            publisher: publisher.clone(),
                            opener,
                            transform: Arc::clone(&self.transform),
                            policy: self.policy,
                        },
                    )
                })
                .collect();
            FrameController::new(sources, collector)
        }
    }

    fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[test]
    fn kill_during_backoff_releases_stream() {
        let closed = Arc::new(AtomicBool::new(false));
        let mut setup = Setup::new(1);
        setup.policy = PublishPolicy::Backoff(BackoffConfig {
            initial: Duration::from_millis(50),
            max: Duration::from_secs(5),
            ..BackoffConfig::default()
        });
        setup.timeout = Duration::from_millis(5);
        let controller = setup.build(vec![("cam", fake(u64::MAX, Arc::clone(&closed)))]);

        controller.start_sources();
        assert!(wait_until(Duration::from_secs(2), || {
            controller.stats()[0].1.retries >= 2
        }));
        assert!(!closed.load(Ordering::SeqCst));

        let exits = controller.stop_sources();
        assert_eq!(exits, vec![(SourceId::from("cam"), SourceExit::Cancelled)]);
        assert!(closed.load(Ordering::SeqCst), "Stream must be released");
        assert!(!controller.has_alive_sources());
        assert_eq!(controller.take_buffered().len(), 0);
        assert_eq!(controller.fetch_and_take(Duration::ZERO).len(), 1);
    }

    #[test]
    fn drop_policy_loses_a_bounded_number_of_frames() {
        let closed = Arc::new(AtomicBool::new(false));
        let mut setup = Setup::new(2);
        setup.policy = PublishPolicy::DropOnFull;
        setup.timeout = Duration::from_millis(1);
        let controller = setup.build(vec![("burst", fake(20, Arc::clone(&closed)))]);

        controller.start_sources();
        assert!(wait_until(Duration::from_secs(5), || !controller
            .has_alive_sources()));

        let batch = controller.fetch_and_take(Duration::from_millis(50));
        let sequences: Vec<u64> = batch.iter().map(|e| e.payload.sequence()).collect();
        assert_eq!(sequences, vec![0, 1]);

        let stats = controller.stats()[0].1;
        assert_eq!(stats.captured, 20);
        assert_eq!(stats.published, 2);
        assert_eq!(stats.dropped, 18);
        assert!(closed.load(Ordering::SeqCst));
    }

    #[test]
    fn open_failure_only_stops_that_source() {
        let closed = Arc::new(AtomicBool::new(false));
        let controller = Setup::new(4).build(vec![
            ("broken", failing()),
            ("good", fake(6, Arc::clone(&closed))),
        ]);

        controller.start_sources();
        controller.run_loop(Duration::from_millis(10));

        let batch = controller.take_buffered();
        assert_eq!(batch.len(), 6);
        assert!(batch.iter().all(|e| e.source_id == SourceId::from("good")));

        let exits = controller.stop_sources();
        assert!(matches!(exits[0].1, SourceExit::Failed(ref reason) if reason.contains("device busy")));
        assert_eq!(exits[1].1, SourceExit::Finished);
    }

    #[test]
    fn second_take_is_empty() {
        let closed = Arc::new(AtomicBool::new(false));
        let controller = Setup::new(8).build(vec![("once", fake(3, closed))]);

        controller.start_sources();
        controller.run_loop(Duration::from_millis(10));

        assert_eq!(controller.take_buffered().len(), 3);
        assert!(controller.take_buffered().is_empty());
    }

    #[test]
    fn liveness_follows_source_states() {
        let closed = Arc::new(AtomicBool::new(false));
        let controller = Setup::new(8).build(vec![
            ("a", fake(2, Arc::clone(&closed))),
            ("b", fake(4, Arc::clone(&closed))),
        ]);

        assert!(!controller.is_started());
        assert!(controller.has_alive_sources());
        assert!(
            controller
                .states()
                .iter()
                .all(|(_, state)| *state == LivenessState::Created)
        );

        assert_eq!(controller.start_sources(), 2);
        assert!(controller.is_started());
        assert_eq!(controller.start_sources(), 0);

        controller.run_loop(Duration::from_millis(10));
        assert!(!controller.has_alive_sources());
        assert!(
            controller
                .states()
                .iter()
                .all(|(_, state)| *state == LivenessState::Stopped)
        );
    }

    #[test]
    fn drain_moves_everything_available() {
        let closed = Arc::new(AtomicBool::new(false));
        let controller = Setup::new(5).build(vec![("five", fake(5, Arc::clone(&closed)))]);

        controller.start_sources();
        assert!(wait_until(Duration::from_secs(5), || !controller
            .has_alive_sources()));

        assert_eq!(controller.drain(Duration::from_millis(10)), 5);
        assert_eq!(controller.drain(Duration::from_millis(10)), 0);
        assert_eq!(controller.take_buffered().len(), 5);
    }

    #[test]
    fn per_source_order_is_preserved() {
        let closed = Arc::new(AtomicBool::new(false));
        let controller = Arc::new(Setup::new(4).build(vec![
            ("a", fake(25, Arc::clone(&closed))),
            ("b", fake(25, Arc::clone(&closed))),
            ("c", fake(25, Arc::clone(&closed))),
        ]));

        controller.start_sources();
        let drainer = {
            let controller = Arc::clone(&controller);
            thread::spawn(move || controller.run_loop(Duration::from_millis(10)))
        };

        let mut seen: BTreeMap<SourceId, Vec<u64>> = BTreeMap::new();
        loop {
            for envelope in controller.fetch_and_take(Duration::from_millis(5)) {
                seen.entry(envelope.source_id)
                    .or_default()
                    .push(envelope.payload.sequence());
            }
            if drainer.is_finished() {
                break;
            }
        }
        drainer.join().unwrap();
        for envelope in controller.take_buffered() {
            seen.entry(envelope.source_id)
                .or_default()
                .push(envelope.payload.sequence());
        }

        let expected: Vec<u64> = (0..25).collect();
        assert_eq!(seen.len(), 3);
        for sequences in seen.values() {
            assert_eq!(sequences, &expected);
        }
    }

    #[test]
    fn transform_filters_payloads() {
        let closed = Arc::new(AtomicBool::new(false));
        let transform: Transform<u64> =
            Arc::new(|frame: Frame| -> anyhow::Result<Option<u64>> {
                Ok((frame.sequence() % 2 == 0).then_some(frame.sequence()))
            });
        let setup = Setup {
            capacity: 8,
            policy: PublishPolicy::default(),
            timeout: Duration::from_millis(20),
            transform,
        };
        let controller = setup.build(vec![("even", fake(6, closed))]);

        controller.start_sources();
        controller.run_loop(Duration::from_millis(10));

        let payloads: Vec<u64> = controller
            .take_buffered()
            .into_iter()
            .map(|e| e.payload)
            .collect();
        assert_eq!(payloads, vec![0, 2, 4]);
    }

    #[test]
    fn stop_is_idempotent_and_tolerates_unstarted_sources() {
        let closed = Arc::new(AtomicBool::new(false));
        let controller = Setup::new(2).build(vec![("idle", fake(3, Arc::clone(&closed)))]);

        let first = controller.stop_sources();
        assert_eq!(first, vec![(SourceId::from("idle"), SourceExit::Cancelled)]);
        assert_eq!(controller.stop_sources(), first);
        assert!(!controller.has_alive_sources());
        assert!(!closed.load(Ordering::SeqCst), "Stream was never opened");
    }

    #[test]
    fn dropping_controller_joins_workers() {
        let closed = Arc::new(AtomicBool::new(false));
        let controller = Setup::new(1).build(vec![("endless", fake(u64::MAX, Arc::clone(&closed)))]);

        controller.start_sources();
        assert!(wait_until(Duration::from_secs(2), || {
            controller.stats()[0].1.published >= 1
        }));
        drop(controller);

        assert!(closed.load(Ordering::SeqCst));
    }
}
