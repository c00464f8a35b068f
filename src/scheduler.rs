//! Parallel Job Scheduler: a bounded worker pool for one phase of a pipeline.
//!
//! Jobs are submitted up front and launched while fewer than `max_parallel` are
//! running; the rest wait in a FIFO queue and are launched as running jobs
//! complete. Completion is observed through [`WorkerPool::wait_any`] and
//! [`WorkerPool::wait_all`].
//!
//! Failure semantics: once any job has failed, queued jobs are cancelled instead
//! of launched, but every job already running is still awaited. `wait_all` never
//! returns while work from its batch is in flight.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::{Result, SyncError};

/// Label reported for a worker task that ended without handing back its job.
const LOST_WORKER: &str = "lost-worker";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
    /// Never launched because an earlier job in the batch failed.
    Cancelled,
}

impl JobState {
    fn from_u8(raw: u8) -> JobState {
        match raw {
            0 => JobState::Pending,
            1 => JobState::Running,
            2 => JobState::Succeeded,
            3 => JobState::Failed,
            _ => JobState::Cancelled,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            JobState::Pending => 0,
            JobState::Running => 1,
            JobState::Succeeded => 2,
            JobState::Failed => 3,
            JobState::Cancelled => 4,
        }
    }
}

/// Handle to a submitted job. Cheap to clone; the state is shared with the worker.
#[derive(Clone)]
pub struct JobHandle {
    id: usize,
    label: Arc<str>,
    state: Arc<AtomicU8>,
}

impl JobHandle {
    fn new(id: usize, label: &str) -> Self {
        JobHandle {
            id,
            label: Arc::from(label),
            state: Arc::new(AtomicU8::new(JobState::Pending.as_u8())),
        }
    }

    /// Submission order within the pool.
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn state(&self) -> JobState {
        JobState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set(&self, state: JobState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }
}

impl fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("state", &self.state())
            .finish()
    }
}

/// How a job ended.
#[derive(Debug)]
pub enum Outcome<T> {
    Succeeded(T),
    Failed(SyncError),
    Cancelled,
}

impl<T> Outcome<T> {
    fn state(&self) -> JobState {
        match self {
            Outcome::Succeeded(_) => JobState::Succeeded,
            Outcome::Failed(_) => JobState::Failed,
            Outcome::Cancelled => JobState::Cancelled,
        }
    }
}

/// Shared stop request for long blocking jobs. Set once a run is interrupted;
/// jobs check it between units of work and bail out with `ErrorKind::Interrupted`.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        CancelFlag::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// `Err` once cancelled, for use with `?` in `io::Result` code.
    pub fn check(&self) -> std::io::Result<()> {
        if self.is_cancelled() {
            return Err(std::io::Error::new(std::io::ErrorKind::Interrupted, "run cancelled"));
        }
        Ok(())
    }
}

/// Counts jobs currently executing and remembers the maximum seen.
#[derive(Debug, Default)]
pub struct ActivityGauge {
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl ActivityGauge {
    fn enter(self: &Arc<Self>) -> ActiveGuard {
        let now = self.active.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak.fetch_max(now, Ordering::AcqRel);
        ActiveGuard(Arc::clone(self))
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Acquire)
    }
}

struct ActiveGuard(Arc<ActivityGauge>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Result of a whole batch.
#[derive(Debug)]
pub struct BatchReport<T> {
    /// Successful results in submission order.
    pub succeeded: Vec<(String, T)>,
    /// Failures in completion order.
    pub failures: Vec<(String, SyncError)>,
    pub cancelled: usize,
    /// Most jobs observed running at the same time.
    pub peak_active: usize,
}

impl<T> BatchReport<T> {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && self.cancelled == 0
    }

    /// The values on success, otherwise the first failure. A batch with cancelled
    /// jobs is never a success, even if no failure was recorded.
    pub fn into_result(self) -> Result<Vec<T>> {
        if let Some((_, first)) = self.failures.into_iter().next() {
            return Err(first);
        }
        if self.cancelled > 0 {
            return Err(SyncError::Job {
                label: "batch".to_string(),
                message: format!("{} job(s) cancelled without a recorded failure", self.cancelled),
            });
        }
        Ok(self.succeeded.into_iter().map(|(_, value)| value).collect())
    }
}

struct Queued<T> {
    handle: JobHandle,
    job: BoxFuture<'static, Result<T>>,
}

/// Bounded worker pool for one batch of independent jobs.
pub struct WorkerPool<T> {
    name: String,
    max_parallel: usize,
    running: JoinSet<(JobHandle, Outcome<T>)>,
    queued: VecDeque<Queued<T>>,
    /// Outcomes decided without running (cancellations), not yet handed out.
    settled: VecDeque<(JobHandle, Outcome<T>)>,
    next_id: usize,
    aborted: bool,
    gauge: Arc<ActivityGauge>,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Must be used from within a tokio runtime.
    pub fn new(name: impl Into<String>, max_parallel: usize) -> Self {
        WorkerPool {
            name: name.into(),
            max_parallel: max_parallel.max(1),
            running: JoinSet::new(),
            queued: VecDeque::new(),
            settled: VecDeque::new(),
            next_id: 0,
            aborted: false,
            gauge: Arc::new(ActivityGauge::default()),
        }
    }

    pub fn gauge(&self) -> Arc<ActivityGauge> {
        Arc::clone(&self.gauge)
    }

    /// Jobs submitted and not yet handed out by `wait_any`.
    pub fn outstanding(&self) -> usize {
        self.running.len() + self.queued.len() + self.settled.len()
    }

    /// Queue an async job.
    pub fn submit<F>(&mut self, label: impl Into<String>, job: F) -> JobHandle
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let label = label.into();
        let handle = JobHandle::new(self.next_id, &label);
        self.next_id += 1;
        debug!(pool = %self.name, job = %label, id = handle.id, "[POOL] Job submitted");
        self.queued.push_back(Queued {
            handle: handle.clone(),
            job: job.boxed(),
        });
        self.fill();
        handle
    }

    /// Queue a blocking job; it runs on tokio's blocking thread pool.
    pub fn submit_blocking<F>(&mut self, label: impl Into<String>, job: F) -> JobHandle
    where
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let label = label.into();
        let job_label = label.clone();
        self.submit(label, async move {
            match tokio::task::spawn_blocking(job).await {
                Ok(result) => result,
                Err(e) if e.is_panic() => Err(SyncError::Job {
                    label: job_label,
                    message: panic_message(&*e.into_panic()),
                }),
                Err(e) => Err(SyncError::Job {
                    label: job_label,
                    message: e.to_string(),
                }),
            }
        })
    }

    fn fill(&mut self) {
        if self.aborted {
            while let Some(queued) = self.queued.pop_front() {
                queued.handle.set(JobState::Cancelled);
                debug!(pool = %self.name, job = %queued.handle.label(), "[POOL] Job cancelled before launch");
                self.settled.push_back((queued.handle, Outcome::Cancelled));
            }
            return;
        }
        while self.running.len() < self.max_parallel {
            let Some(queued) = self.queued.pop_front() else {
                break;
            };
            self.launch(queued);
        }
    }

    fn launch(&mut self, queued: Queued<T>) {
        let Queued { handle, job } = queued;
        let gauge = Arc::clone(&self.gauge);
        self.running.spawn(async move {
            handle.set(JobState::Running);
            let outcome = {
                let _active = gauge.enter();
                match AssertUnwindSafe(job).catch_unwind().await {
                    Ok(Ok(value)) => Outcome::Succeeded(value),
                    Ok(Err(e)) => Outcome::Failed(e),
                    Err(panic) => Outcome::Failed(SyncError::Job {
                        label: handle.label().to_string(),
                        message: panic_message(&*panic),
                    }),
                }
            };
            handle.set(outcome.state());
            (handle, outcome)
        });
    }

    /// Wait for the next job to finish. `None` once every submitted job has been
    /// handed out.
    pub async fn wait_any(&mut self) -> Option<(JobHandle, Outcome<T>)> {
        loop {
            if let Some(settled) = self.settled.pop_front() {
                return Some(settled);
            }
            match self.running.join_next().await {
                Some(Ok((handle, outcome))) => {
                    if let Outcome::Failed(e) = &outcome {
                        if !self.aborted {
                            warn!(
                                pool = %self.name,
                                job = %handle.label(),
                                error = %e,
                                queued = self.queued.len(),
                                "[POOL] Job failed; cancelling queued jobs and draining running ones"
                            );
                        }
                        self.aborted = true;
                    }
                    self.fill();
                    return Some((handle, outcome));
                }
                Some(Err(e)) => {
                    // The worker task itself was torn down; its handle cannot be recovered.
                    error!(pool = %self.name, error = %e, "[POOL][ERROR] Worker task lost");
                    self.aborted = true;
                    self.fill();
                    let lost = JobHandle::new(usize::MAX, LOST_WORKER);
                    lost.set(JobState::Failed);
                    let failure = SyncError::Job {
                        label: LOST_WORKER.to_string(),
                        message: e.to_string(),
                    };
                    return Some((lost, Outcome::Failed(failure)));
                }
                None => {
                    if self.queued.is_empty() {
                        return None;
                    }
                    self.fill();
                }
            }
        }
    }

    /// Wait for every submitted job and collect the batch result.
    pub async fn wait_all(mut self) -> BatchReport<T> {
        let mut succeeded = Vec::new();
        let mut failures = Vec::new();
        let mut cancelled = 0;
        while let Some((handle, outcome)) = self.wait_any().await {
            match outcome {
                Outcome::Succeeded(value) => succeeded.push((handle.id, handle.label().to_string(), value)),
                Outcome::Failed(e) => {
                    error!(
                        pool = %self.name,
                        job = %handle.label(),
                        class = e.class(),
                        error = %e,
                        "[POOL][ERROR] Job failed"
                    );
                    failures.push((handle.label().to_string(), e));
                }
                Outcome::Cancelled => cancelled += 1,
            }
        }
        succeeded.sort_by_key(|(id, _, _)| *id);

        let report = BatchReport {
            succeeded: succeeded
                .into_iter()
                .map(|(_, label, value)| (label, value))
                .collect(),
            failures,
            cancelled,
            peak_active: self.gauge.peak(),
        };
        info!(
            pool = %self.name,
            succeeded = report.succeeded.len(),
            failed = report.failures.len(),
            cancelled = report.cancelled,
            peak_active = report.peak_active,
            max_parallel = self.max_parallel,
            "[POOL] Batch finished"
        );
        report
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn never_exceeds_max_parallel() {
        let mut pool = WorkerPool::new("test", 3);
        let gauge = pool.gauge();
        for i in 0..20u64 {
            let gauge = Arc::clone(&gauge);
            pool.submit(format!("job{i}"), async move {
                assert!(gauge.active() <= 3);
                tokio::time::sleep(Duration::from_millis(5 + i % 4)).await;
                Ok(i)
            });
        }
        let report = pool.wait_all().await;
        assert!(report.peak_active <= 3);
        assert!(report.peak_active >= 1);
        assert_eq!(report.into_result().unwrap(), (0..20).collect::<Vec<_>>());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn blocking_jobs_respect_the_bound() {
        let mut pool = WorkerPool::new("blocking", 2);
        for i in 0..8usize {
            pool.submit_blocking(format!("job{i}"), move || {
                std::thread::sleep(Duration::from_millis(10));
                Ok(i * 2)
            });
        }
        let report = pool.wait_all().await;
        assert!(report.peak_active <= 2);
        assert_eq!(report.into_result().unwrap(), vec![0, 2, 4, 6, 8, 10, 12, 14]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn failure_waits_for_running_siblings() {
        let finished = Arc::new(AtomicBool::new(false));
        let mut pool = WorkerPool::new("fail", 2);
        let slow_flag = Arc::clone(&finished);
        let slow = pool.submit("slow", async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            slow_flag.store(true, Ordering::SeqCst);
            Ok(())
        });
        let bad = pool.submit("bad", async { Err(SyncError::transfer("k", "boom")) });

        let report = pool.wait_all().await;
        assert!(finished.load(Ordering::SeqCst), "sibling must finish before wait_all returns");
        assert_eq!(slow.state(), JobState::Succeeded);
        assert_eq!(bad.state(), JobState::Failed);
        assert_eq!(report.failures.len(), 1);
        assert!(matches!(report.into_result(), Err(SyncError::Transfer { .. })));
    }

    #[tokio::test]
    async fn queued_jobs_are_cancelled_after_a_failure() {
        let mut pool = WorkerPool::new("cancel", 1);
        let bad = pool.submit("bad", async { Err::<(), _>(SyncError::config("nope")) });
        let queued: Vec<_> = (0..3)
            .map(|i| pool.submit(format!("queued{i}"), async { Ok(()) }))
            .collect();

        let report = pool.wait_all().await;
        assert_eq!(bad.state(), JobState::Failed);
        for handle in queued {
            assert_eq!(handle.state(), JobState::Cancelled);
        }
        assert_eq!(report.cancelled, 3);
        assert!(!report.is_success());
    }

    #[tokio::test]
    async fn panics_become_job_errors() {
        let mut pool: WorkerPool<()> = WorkerPool::new("panic", 2);
        pool.submit("async-panic", async {
            let missing: Option<()> = None;
            missing.expect("kaboom");
            Ok(())
        });
        let report = pool.wait_all().await;
        match report.into_result() {
            Err(SyncError::Job { label, message }) => {
                assert_eq!(label, "async-panic");
                assert!(message.contains("kaboom"));
            }
            other => panic!("expected job error, got {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn blocking_panics_become_job_errors() {
        let mut pool: WorkerPool<()> = WorkerPool::new("panic", 2);
        pool.submit_blocking("blocking-panic", || panic!("blocking kaboom"));
        let report = pool.wait_all().await;
        assert!(matches!(report.into_result(), Err(SyncError::Job { .. })));
    }

    #[tokio::test]
    async fn wait_any_hands_out_each_job_once() {
        let mut pool = WorkerPool::new("any", 2);
        for i in 0..5u8 {
            pool.submit(format!("job{i}"), async move { Ok(i) });
        }
        let mut seen = Vec::new();
        while let Some((handle, outcome)) = pool.wait_any().await {
            match outcome {
                Outcome::Succeeded(v) => seen.push((handle.id(), v)),
                other => panic!("unexpected outcome {other:?}"),
            }
        }
        seen.sort();
        assert_eq!(seen, (0..5).map(|i| (i as usize, i)).collect::<Vec<_>>());
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn lost_worker_fails_the_batch() {
        let mut pool = WorkerPool::new("lost", 2);
        pool.submit("fast", async { Ok(1u8) });
        pool.submit("stuck", async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(2u8)
        });
        pool.running.abort_all();

        let report = pool.wait_all().await;
        assert!(!report.is_success());
        assert!(report.failures.iter().any(|(label, _)| label == LOST_WORKER));
        assert!(matches!(report.into_result(), Err(SyncError::Job { .. })));
    }

    #[test]
    fn cancelled_jobs_without_failures_are_not_a_success() {
        let report = BatchReport {
            succeeded: vec![("a".to_string(), 1u8)],
            failures: Vec::new(),
            cancelled: 2,
            peak_active: 1,
        };
        match report.into_result() {
            Err(SyncError::Job { message, .. }) => assert!(message.contains("2 job(s) cancelled")),
            other => panic!("expected job error, got {other:?}"),
        }
    }

    #[test]
    fn cancel_flag_is_shared_between_clones() {
        let flag = CancelFlag::new();
        let worker = flag.clone();
        assert!(worker.check().is_ok());
        flag.cancel();
        assert!(worker.is_cancelled());
        assert_eq!(worker.check().unwrap_err().kind(), std::io::ErrorKind::Interrupted);
    }

    #[tokio::test]
    async fn empty_batch_is_a_success() {
        let pool: WorkerPool<()> = WorkerPool::new("empty", 4);
        let report = pool.wait_all().await;
        assert!(report.is_success());
        assert_eq!(report.peak_active, 0);
    }
}
