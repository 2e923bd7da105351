use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use ember_core::{JobsConfig, PlaceholderResolver};
use tokio::runtime::{Handle, Runtime};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::{JobFailure, Result, SchedulerError};
use crate::job::{Job, Output, Work};
use crate::lifecycle::{EventAnchors, ANCHOR_PREFIX};
use crate::progress::ProgressGauge;
use crate::trigger::Trigger;
use crate::types::{JobId, JobKind, JobStatus};

/// Worker thread name prefix.
const THREAD_NAME: &str = "ember-jobs";

/// Shared state behind every `JobManager` clone.
///
/// Owns a dedicated tokio runtime: its blocking pool runs payloads (bounded by
/// `pool_size`) and its async workers drive admission timers.
pub(crate) struct Inner {
    pub(crate) instance_id: String,
    pub(crate) jobs: DashMap<JobId, Arc<Job>>,
    /// Jobs waiting for a time-based admission.
    pub(crate) scheduled: DashMap<JobId, Arc<Job>>,
    pub(crate) anchors: EventAnchors,
    resolver: RwLock<Option<Arc<dyn PlaceholderResolver>>>,
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
    /// Parent of every job token.
    root: CancellationToken,
    closed: AtomicBool,
    grace: Duration,
}

impl Inner {
    pub(crate) fn new(config: &JobsConfig, instance_id: String) -> Result<Self> {
        config
            .validate()
            .map_err(|e| SchedulerError::InvalidSchedule(e.to_string()))?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.timer_threads)
            .max_blocking_threads(config.pool_size)
            .thread_name(THREAD_NAME)
            .enable_time()
            .build()?;
        let handle = runtime.handle().clone();
        let root = CancellationToken::new();

        info!(
            %instance_id,
            pool_size = config.pool_size,
            timer_threads = config.timer_threads,
            "job manager started"
        );

        Ok(Self {
            instance_id,
            jobs: DashMap::new(),
            scheduled: DashMap::new(),
            anchors: EventAnchors::new(&root),
            resolver: RwLock::new(None),
            runtime: Mutex::new(Some(runtime)),
            handle,
            root,
            closed: AtomicBool::new(false),
            grace: Duration::from_millis(config.shutdown_grace_ms),
        })
    }

    pub(crate) fn set_resolver(&self, resolver: Arc<dyn PlaceholderResolver>) {
        *self.resolver.write().unwrap_or_else(PoisonError::into_inner) = Some(resolver);
    }

    pub(crate) fn resolver(&self) -> Option<Arc<dyn PlaceholderResolver>> {
        self.resolver
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(SchedulerError::ShutDown);
        }
        Ok(())
    }

    // --- registry ------------------------------------------------------------

    /// Build a job and register it under `id` (or a generated id).
    pub(crate) fn register<T>(
        &self,
        id: Option<JobId>,
        kind: JobKind,
        work: Work<T>,
        trigger: Option<Trigger>,
    ) -> Result<Arc<Job>> {
        self.ensure_open()?;
        let id = id.unwrap_or_else(|| JobId::generate(&self.instance_id));
        // Lifecycle anchors own these ids.
        if id.as_str().starts_with(ANCHOR_PREFIX) {
            return Err(SchedulerError::DuplicateId { id: id.0 });
        }
        let token = self.root.child_token();

        let job = match self.jobs.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(SchedulerError::DuplicateId { id: id.0 });
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let job = Arc::new(Job::new(id, kind, work, trigger, token));
                slot.insert(Arc::clone(&job));
                job
            }
        };

        // A shutdown that drained the registry before the insert never saw this job.
        if self.is_closed() {
            self.deregister(&job);
            job.mark_cancelled();
            job.destroy();
            return Err(SchedulerError::ShutDown);
        }
        debug!(job_id = %job.id, kind = ?kind, payload = job.payload_kind(), "job registered");
        Ok(job)
    }

    pub(crate) fn lookup(&self, id: &JobId) -> Result<Arc<Job>> {
        self.jobs
            .get(id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| SchedulerError::NotFound { id: id.0.clone() })
    }

    /// Drop `job` from the registry unless its id was already reused.
    fn deregister(&self, job: &Arc<Job>) {
        self.jobs.remove_if(&job.id, |_, j| Arc::ptr_eq(j, job));
        self.scheduled.remove_if(&job.id, |_, j| Arc::ptr_eq(j, job));
    }

    pub(crate) fn progress_of(&self, id: &JobId) -> Result<ProgressGauge> {
        self.lookup(id)?
            .progress()
            .ok_or_else(|| SchedulerError::NotFound { id: id.0.clone() })
    }

    // --- execution -----------------------------------------------------------

    /// Hand a job to the worker pool.
    pub(crate) fn dispatch(self: &Arc<Self>, job: Arc<Job>) {
        if self.is_closed() {
            trace!(job_id = %job.id, "dispatch after shutdown, job discarded");
            self.deregister(&job);
            job.mark_cancelled();
            job.destroy();
            return;
        }
        let inner = Arc::clone(self);
        self.handle.spawn_blocking(move || inner.run_job(&job));
    }

    /// Run a job on the calling thread, together with its links.
    ///
    /// Parallel jobs are dispatched first, precedence jobs run inline in
    /// attachment order, then the payload runs, then following jobs are
    /// dispatched. The payload never starts before every precedence job is
    /// terminal, including ones started elsewhere through `run_now`.
    pub(crate) fn run_job(self: &Arc<Self>, job: &Arc<Job>) {
        let Some(links) = job.take_links() else {
            trace!(job_id = %job.id, "job already started, skipping");
            return;
        };

        for parallel in links.parallel {
            self.dispatch(parallel);
        }
        for precedence in &links.precedence {
            self.run_job(precedence);
            // Returns at once when another thread already took it.
            precedence.wait_terminal();
        }

        let ran = job.try_start();
        if ran {
            let result = self.execute(job);
            if job.kind == JobKind::OneShot {
                // Before publishing the outcome, so the id is free once waiters wake.
                self.deregister(job);
                job.destroy();
            }
            job.finish(result);
        } else {
            if job.is_cancelled() {
                job.mark_cancelled();
            }
            trace!(job_id = %job.id, status = %job.status(), "job not pending, payload skipped");
        }

        if !ran && job.status() == JobStatus::Cancelled {
            for following in &links.following {
                self.deregister(following);
                self.cancel_job(following);
            }
            return;
        }
        for following in links.following {
            self.dispatch(following);
        }
    }

    fn execute(&self, job: &Job) -> std::result::Result<Output, JobFailure> {
        let Some(payload) = job.payload() else {
            return Ok(Box::new(()));
        };
        let gauge = job.progress().unwrap_or_default();

        let _scope = job.context().map(|c| c.enter());
        let started = Instant::now();
        let result = payload.execute(&gauge);
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match &result {
            Ok(_) => debug!(job_id = %job.id, elapsed_ms, "job finished"),
            Err(e) => warn!(job_id = %job.id, elapsed_ms, error = %e, "job failed"),
        }
        result
    }

    // --- admission -----------------------------------------------------------

    /// Admit a job after `delay`, or right away when the delay is zero.
    pub(crate) fn admit(self: &Arc<Self>, job: Arc<Job>, delay: Duration) {
        if delay.is_zero() {
            self.dispatch(job);
            return;
        }

        self.scheduled.insert(job.id.clone(), Arc::clone(&job));
        debug!(job_id = %job.id, delay_ms = delay.as_millis() as u64, "job scheduled");

        let weak = Arc::downgrade(self);
        self.handle.spawn(async move {
            tokio::select! {
                _ = job.cancelled() => {
                    trace!(job_id = %job.id, "admission cancelled");
                }
                _ = tokio::time::sleep(delay) => {
                    if let Some(inner) = weak.upgrade() {
                        inner.scheduled.remove_if(&job.id, |_, j| Arc::ptr_eq(j, &job));
                        inner.dispatch(job);
                    }
                }
            }
        });
    }

    /// Drive a repeating job until it is cancelled or the manager closes.
    ///
    /// Every occurrence waits for the previous one, so runs never overlap.
    pub(crate) fn start_periodic(self: &Arc<Self>, job: Arc<Job>, trigger: &Trigger, first: Duration) {
        let (period, fixed_rate) = match trigger {
            Trigger::FixedRate { period, .. } => (*period, true),
            Trigger::FixedDelay { period, .. } => (*period, false),
            _ => return,
        };

        self.scheduled.insert(job.id.clone(), Arc::clone(&job));
        info!(
            job_id = %job.id,
            period_ms = period.as_millis() as u64,
            fixed_rate,
            "repeating job scheduled"
        );

        let weak = Arc::downgrade(self);
        self.handle.spawn(async move {
            if fixed_rate {
                let Some(start) = tokio::time::Instant::now().checked_add(first) else {
                    warn!(job_id = %job.id, "first admission out of range, job dropped");
                    if let Some(inner) = weak.upgrade() {
                        inner.deregister(&job);
                        inner.cancel_job(&job);
                    }
                    return;
                };
                let mut ticks = tokio::time::interval_at(start, period);
                ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = job.cancelled() => break,
                        _ = ticks.tick() => {}
                    }
                    if !run_occurrence(&weak, &job).await {
                        break;
                    }
                }
            } else {
                let mut wait = first;
                loop {
                    tokio::select! {
                        _ = job.cancelled() => break,
                        _ = tokio::time::sleep(wait) => {}
                    }
                    if !run_occurrence(&weak, &job).await {
                        break;
                    }
                    wait = period;
                }
            }

            if let Some(inner) = weak.upgrade() {
                inner.deregister(&job);
            }
            debug!(job_id = %job.id, "repeating job stopped");
        });
    }

    // --- cancellation --------------------------------------------------------

    /// Cancel the live job or pending admission registered under `id`.
    pub(crate) fn cancel(&self, id: &JobId) -> bool {
        if let Some((_, job)) = self.jobs.remove(id) {
            self.scheduled.remove_if(id, |_, j| Arc::ptr_eq(j, &job));
            self.cancel_job(&job);
            return true;
        }
        if let Some((_, job)) = self.scheduled.remove(id) {
            self.cancel_job(&job);
            return true;
        }
        false
    }

    /// Cancel exactly this job, leaving any newer job with the same id alone.
    pub(crate) fn cancel_exact(&self, job: &Arc<Job>) -> bool {
        let registered = self.jobs.remove_if(&job.id, |_, j| Arc::ptr_eq(j, job)).is_some();
        let scheduled = self
            .scheduled
            .remove_if(&job.id, |_, j| Arc::ptr_eq(j, job))
            .is_some();
        if registered || scheduled {
            self.cancel_job(job);
        }
        registered || scheduled
    }

    /// Cancel a job and every linked job that has not started yet.
    pub(crate) fn cancel_job(&self, job: &Arc<Job>) {
        let was_pending = job.mark_cancelled();
        info!(job_id = %job.id, was_pending, "job cancelled");

        for linked in job.drain_links() {
            if linked.status() == JobStatus::Pending {
                self.jobs.remove_if(&linked.id, |_, j| Arc::ptr_eq(j, &linked));
                self.cancel_job(&linked);
            }
        }
        job.destroy();
    }

    // --- shutdown ------------------------------------------------------------

    /// Stop accepting work, cancel everything pending and stop the pool.
    ///
    /// Idempotent. Runs already executing are not interrupted; they are given
    /// up to `shutdown_grace_ms` to finish before the pool is released.
    pub(crate) fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(instance_id = %self.instance_id, "job manager shutting down");

        self.root.cancel();
        self.scheduled.clear();
        let jobs: Vec<Arc<Job>> = self.jobs.iter().map(|e| Arc::clone(e.value())).collect();
        self.jobs.clear();
        let mut running = Vec::new();
        let mut discarded = 0;
        for job in jobs {
            if job.mark_cancelled() {
                discarded += 1;
            } else {
                running.push(Arc::clone(&job));
            }
            job.destroy();
        }
        self.anchors.destroy();

        if !self.grace.is_zero() {
            let deadline = Instant::now() + self.grace;
            for job in &running {
                let left = deadline.saturating_duration_since(Instant::now());
                if !job.wait_terminal_timeout(left) {
                    warn!(job_id = %job.id, "job still running at shutdown");
                }
            }
        }

        let runtime = self
            .runtime
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(runtime) = runtime {
            runtime.shutdown_background();
        }
        info!(discarded, running = running.len(), "job manager stopped");
    }

    pub(crate) fn check_trigger(&self, trigger: &Trigger) -> Result<Duration> {
        self.ensure_open()?;
        trigger.first_admission(Utc::now())
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Run one occurrence of a repeating job on the blocking pool.
///
/// Returns `false` when the job should not be re-admitted.
async fn run_occurrence(weak: &Weak<Inner>, job: &Arc<Job>) -> bool {
    let Some(inner) = weak.upgrade() else {
        return false;
    };
    if inner.is_closed() || job.is_cancelled() {
        return false;
    }
    inner.scheduled.remove_if(&job.id, |_, j| Arc::ptr_eq(j, job));

    let runner = Arc::clone(job);
    let task = tokio::task::spawn_blocking(move || inner.run_job(&runner));
    if let Err(e) = task.await {
        warn!(job_id = %job.id, error = %e, "repeating job worker aborted");
        return false;
    }

    if let Some(failure) = job.last_failure() {
        debug!(job_id = %job.id, error = %failure, "repeating job continues after failure");
    }
    if job.is_cancelled() {
        return false;
    }
    match weak.upgrade() {
        Some(inner) if !inner.is_closed() => {
            inner.scheduled.insert(job.id.clone(), Arc::clone(job));
            true
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inner() -> Arc<Inner> {
        Arc::new(Inner::new(&JobsConfig::default(), "engine-".into()).unwrap())
    }

    #[test]
    fn dispatch_after_close_cancels_the_job() {
        let inner = inner();
        let job = inner
            .register(Some(JobId::from("late")), JobKind::OneShot, Work::action(|| {}), None)
            .unwrap();
        inner.closed.store(true, Ordering::Release);

        inner.dispatch(Arc::clone(&job));
        assert_eq!(job.status(), JobStatus::Cancelled);
        assert!(job.wait_terminal_timeout(Duration::ZERO));
        assert!(inner.lookup(&job.id).is_err());
    }

    #[test]
    fn register_after_close_is_refused() {
        let inner = inner();
        inner.shutdown();
        let registered = inner.register(None, JobKind::OneShot, Work::action(|| {}), None);
        assert!(matches!(registered, Err(SchedulerError::ShutDown)));
        assert!(inner.jobs.is_empty());
    }

    #[test]
    fn precedence_started_elsewhere_is_awaited() {
        let inner = inner();
        let target = inner
            .register(Some(JobId::from("target")), JobKind::OneShot, Work::action(|| {}), None)
            .unwrap();
        let pre = inner
            .register(
                Some(JobId::from("pre")),
                JobKind::OneShot,
                Work::action(|| std::thread::sleep(Duration::from_millis(80))),
                None,
            )
            .unwrap();
        assert!(target.attach(crate::types::Relation::Precedence, Arc::clone(&pre)).is_ok());

        inner.dispatch(Arc::clone(&pre));
        while pre.status() == JobStatus::Pending {
            std::thread::sleep(Duration::from_millis(1));
        }
        inner.run_job(&target);
        assert_eq!(pre.status(), JobStatus::Completed);
        assert_eq!(target.status(), JobStatus::Completed);
    }
}
