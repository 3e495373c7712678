//! Off-thread processing.
//!
//! [`ProcessingQueue`] moves a [`RegionProcessor`] and its
//! [`ProcessorCache`] onto a dedicated thread and runs submitted jobs one
//! at a time, first in first out. Outcomes come back on a channel owned by
//! the submitting thread; each is tagged with its [`JobId`] so callers can
//! ignore results they no longer care about.

use std::collections::VecDeque;
use std::fmt;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use crate::cache::{CacheKey, ProcessorCache};
use crate::process::AbortFlag;
use crate::processor::{ErrorPolicy, ProcessError, RegionProcessor, RunInput, RunOutput};

/// Identifier of a submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Result of one job.
#[derive(Debug)]
pub struct JobOutcome {
    /// The job.
    pub job: JobId,
    /// Cache key the job ran under.
    pub key: CacheKey,
    /// What the run produced.
    pub result: Result<RunOutput, ProcessError>,
}

/// Errors from the queue itself.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// The job is running and cancelling it was not forced.
    #[error("job {0} is running; cancelling it needs force")]
    RunningJob(JobId),

    /// The job is neither pending nor running.
    #[error("job {0} is not queued")]
    UnknownJob(JobId),

    /// The worker thread could not be started.
    #[error("failed to start worker thread: {0}")]
    Spawn(#[source] std::io::Error),

    /// The worker thread is gone.
    #[error("worker thread disconnected")]
    Disconnected,

    /// The worker thread panicked.
    #[error("worker thread panicked")]
    Panicked,
}

struct Job {
    id: JobId,
    input: RunInput,
    key: CacheKey,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Job>,
    running: Option<JobId>,
    paused: bool,
    shutdown: bool,
    reset_requested: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<QueueState>,
    wake: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A worker thread running one job at a time.
pub struct ProcessingQueue {
    shared: Arc<Shared>,
    abort: AbortFlag,
    results: Receiver<JobOutcome>,
    handle: Option<JoinHandle<(RegionProcessor, ProcessorCache)>>,
    next_job: u64,
}

impl fmt::Debug for ProcessingQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessingQueue")
            .field("pending", &self.pending())
            .field("running", &self.running())
            .finish_non_exhaustive()
    }
}

impl ProcessingQueue {
    /// Start a worker thread owning `processor` and `cache`.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Spawn`] if the thread cannot be created.
    pub fn spawn(
        processor: RegionProcessor,
        cache: ProcessorCache,
        policy: ErrorPolicy,
    ) -> Result<Self, WorkerError> {
        let shared = Arc::new(Shared::default());
        let abort = processor.abort_flag();
        let (sender, results) = mpsc::channel();
        let worker_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("s3a-processing".to_owned())
            .spawn(move || worker_loop(&worker_shared, processor, cache, policy, &sender))
            .map_err(WorkerError::Spawn)?;
        Ok(Self {
            shared,
            abort,
            results,
            handle: Some(handle),
            next_job: 0,
        })
    }

    /// Queue a run under `key`.
    pub fn submit(&mut self, input: RunInput, key: CacheKey) -> JobId {
        let id = JobId(self.next_job);
        self.next_job += 1;
        self.shared.lock().pending.push_back(Job { id, input, key });
        self.shared.wake.notify_one();
        tracing::debug!(job = %id, ?key, "job submitted");
        id
    }

    /// Jobs waiting to run, in order.
    #[must_use]
    pub fn pending(&self) -> Vec<JobId> {
        self.shared.lock().pending.iter().map(|j| j.id).collect()
    }

    /// The job currently running.
    #[must_use]
    pub fn running(&self) -> Option<JobId> {
        self.shared.lock().running
    }

    /// Stop starting new jobs; the running one finishes.
    pub fn pause(&self) {
        self.shared.lock().paused = true;
    }

    /// Start jobs again after [`pause`](Self::pause).
    pub fn resume(&self) {
        self.shared.lock().paused = false;
        self.shared.wake.notify_one();
    }

    /// Cancel `job`.
    ///
    /// A pending job is dropped and produces no outcome. The running job is
    /// only cancelled with `force`: it stops at the next stage boundary with
    /// [`ProcessError::Aborted`], and the processor's retained stage state
    /// is reset afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::RunningJob`] for the running job without
    /// `force`, and [`WorkerError::UnknownJob`] for a job that is neither
    /// pending nor running.
    pub fn cancel(&self, job: JobId, force: bool) -> Result<(), WorkerError> {
        let mut state = self.shared.lock();
        if let Some(index) = state.pending.iter().position(|j| j.id == job) {
            state.pending.remove(index);
            tracing::debug!(job = %job, "pending job cancelled");
            return Ok(());
        }
        if state.running != Some(job) {
            return Err(WorkerError::UnknownJob(job));
        }
        if !force {
            return Err(WorkerError::RunningJob(job));
        }
        self.abort.abort();
        state.reset_requested = true;
        tracing::info!(job = %job, "running job aborted");
        Ok(())
    }

    /// The next outcome, if one is ready.
    #[must_use]
    pub fn try_recv(&self) -> Option<JobOutcome> {
        match self.results.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Wait for the next outcome.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Disconnected`] if the worker thread has
    /// stopped.
    pub fn recv(&self) -> Result<JobOutcome, WorkerError> {
        self.results.recv().map_err(|_| WorkerError::Disconnected)
    }

    /// Finish the pending jobs, stop the thread, and hand back the
    /// processor and cache. Outcomes not yet received are dropped.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Panicked`] if the worker thread panicked.
    pub fn shutdown(mut self) -> Result<(RegionProcessor, ProcessorCache), WorkerError> {
        {
            let mut state = self.shared.lock();
            state.shutdown = true;
            state.paused = false;
        }
        self.shared.wake.notify_one();
        let handle = self.handle.take().ok_or(WorkerError::Disconnected)?;
        handle.join().map_err(|_| WorkerError::Panicked)
    }
}

impl Drop for ProcessingQueue {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        {
            let mut state = self.shared.lock();
            state.pending.clear();
            state.shutdown = true;
            state.paused = false;
        }
        self.abort.abort();
        self.shared.wake.notify_one();
        if handle.join().is_err() {
            tracing::warn!("worker thread panicked");
        }
    }
}

fn worker_loop(
    shared: &Shared,
    mut processor: RegionProcessor,
    mut cache: ProcessorCache,
    policy: ErrorPolicy,
    results: &Sender<JobOutcome>,
) -> (RegionProcessor, ProcessorCache) {
    let abort = processor.abort_flag();
    loop {
        let job = {
            let mut state = shared.lock();
            loop {
                if !state.paused
                    && let Some(job) = state.pending.pop_front()
                {
                    state.running = Some(job.id);
                    abort.reset();
                    break Some(job);
                }
                if state.shutdown && (state.paused || state.pending.is_empty()) {
                    break None;
                }
                state = shared.wake.wait(state).unwrap_or_else(PoisonError::into_inner);
            }
        };
        let Some(job) = job else {
            break;
        };

        tracing::debug!(job = %job.id, "job started");
        let result = processor.run(job.input, job.key, &mut cache, policy);
        {
            let mut state = shared.lock();
            state.running = None;
            if std::mem::take(&mut state.reset_requested) {
                processor.reset_state();
            }
        }
        let outcome = JobOutcome {
            job: job.id,
            key: job.key,
            result,
        };
        if results.send(outcome).is_err() {
            tracing::debug!("result receiver dropped, stopping worker");
            break;
        }
    }
    (processor, cache)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::mpsc::SyncSender;
    use std::time::Duration;

    use image::RgbImage;

    use super::*;
    use crate::diagnostics::Clock;
    use crate::geometry::XYVertices;
    use crate::process::{AtomicProcess, Process};
    use crate::stages::Operation;

    fn draw_processor() -> RegionProcessor {
        RegionProcessor::new(
            Process::new("Draw").with_stage(AtomicProcess::new("Draw Vertices", Operation::DrawVertices)),
        )
    }

    fn input(side: f64) -> RunInput {
        RunInput::new(
            RgbImage::new(20, 20),
            XYVertices::from_pairs([(2.0, 2.0), (2.0 + side, 2.0), (2.0 + side, 2.0 + side), (2.0, 2.0 + side)]),
        )
    }

    #[test]
    fn jobs_run_in_submission_order() {
        let mut queue = ProcessingQueue::spawn(draw_processor(), ProcessorCache::new(), ErrorPolicy::Strict).unwrap();
        queue.pause();
        let ids: Vec<_> = [3.0, 5.0, 7.0]
            .into_iter()
            .map(|side| queue.submit(input(side), CacheKey::Unassigned))
            .collect();
        assert_eq!(queue.pending(), ids);
        queue.resume();
        let outcomes: Vec<_> = (0..3).map(|_| queue.recv().unwrap()).collect();
        assert_eq!(outcomes.iter().map(|o| o.job).collect::<Vec<_>>(), ids);
        let pixels: Vec<_> = outcomes
            .iter()
            .map(|o| o.result.as_ref().unwrap().diagnostics.summary.result_pixels)
            .collect();
        assert_eq!(pixels, [16, 36, 64]);
        let (_, cache) = queue.shutdown().unwrap();
        assert!(!cache.is_first_run(CacheKey::Unassigned));
    }

    #[test]
    fn pending_jobs_can_be_cancelled() {
        let mut queue = ProcessingQueue::spawn(draw_processor(), ProcessorCache::new(), ErrorPolicy::Strict).unwrap();
        queue.pause();
        let keep = queue.submit(input(3.0), CacheKey::Unassigned);
        let dropped = queue.submit(input(5.0), CacheKey::Unassigned);
        queue.cancel(dropped, false).unwrap();
        assert!(matches!(queue.cancel(dropped, false), Err(WorkerError::UnknownJob(_))));
        assert_eq!(queue.pending(), [keep]);
        queue.resume();
        assert_eq!(queue.recv().unwrap().job, keep);
        assert!(queue.pending().is_empty());
        queue.shutdown().unwrap();
    }

    /// Blocks the first reading until the gate opens.
    struct GateClock {
        started: Mutex<Option<SyncSender<()>>>,
        gate: Arc<(Mutex<bool>, Condvar)>,
    }

    impl Clock for GateClock {
        fn now(&self) -> Duration {
            if let Some(tx) = self.started.lock().unwrap().take() {
                tx.send(()).unwrap();
            }
            let (open, changed) = &*self.gate;
            let mut open = open.lock().unwrap();
            while !*open {
                open = changed.wait(open).unwrap();
            }
            Duration::ZERO
        }
    }

    #[test]
    fn running_job_needs_force_and_resets_state() {
        let (started_tx, started_rx) = mpsc::sync_channel(1);
        let gate = Arc::new((Mutex::new(false), Condvar::new()));
        let processor = draw_processor().with_clock(GateClock {
            started: Mutex::new(Some(started_tx)),
            gate: Arc::clone(&gate),
        });
        let mut queue = ProcessingQueue::spawn(processor, ProcessorCache::new(), ErrorPolicy::Recover).unwrap();
        let job = queue.submit(input(3.0), CacheKey::Unassigned);
        started_rx.recv().unwrap();
        assert_eq!(queue.running(), Some(job));
        assert!(matches!(queue.cancel(job, false), Err(WorkerError::RunningJob(_))));
        queue.cancel(job, true).unwrap();
        {
            let (open, changed) = &*gate;
            *open.lock().unwrap() = true;
            changed.notify_all();
        }
        let outcome = queue.recv().unwrap();
        assert!(matches!(outcome.result, Err(ProcessError::Aborted { .. })));

        let next = queue.submit(input(3.0), CacheKey::Unassigned);
        let outcome = queue.recv().unwrap();
        assert_eq!(outcome.job, next);
        assert!(outcome.result.is_ok());
        let (processor, _) = queue.shutdown().unwrap();
        assert!(processor.last_output().is_some());
    }

    #[test]
    fn shutdown_drains_pending_jobs() {
        let mut queue = ProcessingQueue::spawn(draw_processor(), ProcessorCache::new(), ErrorPolicy::Strict).unwrap();
        queue.pause();
        queue.submit(input(3.0), CacheKey::Unassigned);
        queue.submit(input(4.0), CacheKey::Unassigned);
        let (processor, _) = queue.shutdown().unwrap();
        assert_eq!(processor.last_output().unwrap().diagnostics.summary.result_pixels, 25);
    }
}
