use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ember_core::{JobsConfig, PlaceholderResolver};
use ember_events::EventBus;
use tracing::debug;

use crate::engine::Inner;
use crate::error::{Result, SchedulerError};
use crate::handle::JobHandle;
use crate::job::{Job, Work};
use crate::progress::ProgressGauge;
use crate::trigger::{self, Trigger};
use crate::types::{JobId, JobInfo, JobKind, JobStatus, Relation};

/// Application-wide job scheduler.
///
/// Cheap to clone; all clones share one registry and worker pool. The pool
/// is shut down by [`JobManager::shutdown`] or when the last clone is dropped.
#[derive(Clone)]
pub struct JobManager {
    pub(crate) inner: Arc<Inner>,
}

/// Builder for a [`JobManager`] with a custom instance id or placeholder source.
pub struct JobManagerBuilder {
    config: JobsConfig,
    instance_id: Option<String>,
    resolver: Option<Arc<dyn PlaceholderResolver>>,
}

impl JobManagerBuilder {
    /// Prefix for generated job ids.
    pub fn instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    /// Source for `${key}` placeholders in duration strings.
    pub fn placeholders(mut self, resolver: Arc<dyn PlaceholderResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Start the worker pool and subscribe to the lifecycle events of `bus`.
    pub fn build(self, bus: &EventBus) -> Result<JobManager> {
        let instance_id = self
            .instance_id
            .unwrap_or_else(ember_core::config::default_instance_id);
        let inner = Arc::new(Inner::new(&self.config, instance_id)?);
        if let Some(resolver) = self.resolver {
            inner.set_resolver(resolver);
        }
        inner.bind_anchors(bus);
        Ok(JobManager { inner })
    }
}

impl JobManager {
    pub fn new(config: &JobsConfig, bus: &EventBus) -> Result<Self> {
        Self::builder(config).build(bus)
    }

    pub fn builder(config: &JobsConfig) -> JobManagerBuilder {
        JobManagerBuilder {
            config: config.clone(),
            instance_id: None,
            resolver: None,
        }
    }

    /// Replace the placeholder source used by the string-duration operations.
    pub fn with_placeholders(self, resolver: Arc<dyn PlaceholderResolver>) -> Self {
        self.inner.set_resolver(resolver);
        self
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    pub(crate) fn handle<T: Send + 'static>(&self, job: Arc<Job>) -> JobHandle<T> {
        JobHandle::new(job, Arc::downgrade(&self.inner))
    }

    // --- one-shot submission -------------------------------------------------

    /// Run `work` on the pool as soon as a worker is free.
    pub fn submit_now<T: Send + 'static>(&self, work: Work<T>) -> Result<JobHandle<T>> {
        self.schedule(None, work, Trigger::Immediate)
    }

    /// Like [`JobManager::submit_now`] under a caller-chosen id.
    ///
    /// Fails with `DuplicateId` while another job with that id is live.
    pub fn submit_now_with_id<T: Send + 'static>(
        &self,
        id: impl Into<JobId>,
        work: Work<T>,
    ) -> Result<JobHandle<T>> {
        self.schedule(Some(id.into()), work, Trigger::Immediate)
    }

    pub fn submit_after<T: Send + 'static>(&self, work: Work<T>, delay: Duration) -> Result<JobHandle<T>> {
        self.schedule(None, work, Trigger::delay(delay))
    }

    /// Delay given as a duration string, optionally a `${key}` placeholder.
    pub fn submit_after_str<T: Send + 'static>(&self, work: Work<T>, delay: &str) -> Result<JobHandle<T>> {
        let delay = self.parse_duration(delay)?;
        self.submit_after(work, delay)
    }

    /// Run `work` at `at`. Instants in the past are rejected.
    pub fn submit_at<T: Send + 'static>(&self, work: Work<T>, at: DateTime<Utc>) -> Result<JobHandle<T>> {
        self.schedule(None, work, Trigger::at(at))
    }

    /// Register a one-shot job admitted according to `trigger`.
    ///
    /// The trigger is checked before anything is registered. Periodic
    /// triggers belong to [`JobManager::repeat`].
    pub fn schedule<T: Send + 'static>(
        &self,
        id: Option<JobId>,
        work: Work<T>,
        trigger: Trigger,
    ) -> Result<JobHandle<T>> {
        if trigger.is_periodic() {
            return Err(SchedulerError::InvalidSchedule(
                "periodic trigger on a one-shot job, use repeat".into(),
            ));
        }
        let delay = self.inner.check_trigger(&trigger)?;
        let recorded = (trigger != Trigger::Immediate).then_some(trigger);

        let job = self.inner.register(id, JobKind::OneShot, work, recorded)?;
        self.inner.admit(Arc::clone(&job), delay);
        Ok(self.handle(job))
    }

    // --- prepared jobs -------------------------------------------------------

    /// Register `work` without running it; start it later with [`JobManager::run_now`].
    pub fn prepare<T: Send + 'static>(&self, work: Work<T>) -> Result<JobHandle<T>> {
        let job = self.inner.register(None, JobKind::OneShot, work, None)?;
        Ok(self.handle(job))
    }

    pub fn prepare_with_id<T: Send + 'static>(
        &self,
        id: impl Into<JobId>,
        work: Work<T>,
    ) -> Result<JobHandle<T>> {
        let job = self.inner.register(Some(id.into()), JobKind::OneShot, work, None)?;
        Ok(self.handle(job))
    }

    /// Submit a registered job to the pool. A job that already started is
    /// left alone. Repeating jobs only run on their trigger and are rejected.
    pub fn run_now(&self, id: &JobId) -> Result<()> {
        let job = self.inner.lookup(id)?;
        if job.kind == JobKind::Repeating {
            return Err(SchedulerError::InvalidSchedule(format!(
                "{id} repeats on its own trigger"
            )));
        }
        debug!(job_id = %id, "run requested");
        self.inner.dispatch(job);
        Ok(())
    }

    // --- repeating jobs ------------------------------------------------------

    /// Register a repeating job driven by a periodic trigger.
    ///
    /// Values produced by the payload are dropped; failures are logged and
    /// do not stop the repetition.
    pub fn repeat<T: Send + 'static>(
        &self,
        id: Option<JobId>,
        work: Work<T>,
        trigger: Trigger,
    ) -> Result<JobId> {
        if !trigger.is_periodic() {
            return Err(SchedulerError::InvalidSchedule(
                "repeat needs a fixed-rate or fixed-delay trigger".into(),
            ));
        }
        let first = self.inner.check_trigger(&trigger)?;

        let job = self
            .inner
            .register(id, JobKind::Repeating, work, Some(trigger.clone()))?;
        let id = job.id.clone();
        self.inner.start_periodic(job, &trigger, first);
        Ok(id)
    }

    /// Fixed-rate repetition with a duration string such as `"10s"` or `"${key}"`.
    pub fn every<T: Send + 'static>(&self, id: Option<JobId>, work: Work<T>, period: &str) -> Result<JobId> {
        let period = self.parse_duration(period)?;
        self.repeat(id, work, Trigger::every(period))
    }

    /// Fixed-delay repetition with a duration string such as `"10s"` or `"${key}"`.
    pub fn fixed_delay<T: Send + 'static>(
        &self,
        id: Option<JobId>,
        work: Work<T>,
        delay: &str,
    ) -> Result<JobId> {
        let delay = self.parse_duration(delay)?;
        self.repeat(id, work, Trigger::fixed_delay(delay))
    }

    // --- links ---------------------------------------------------------------

    /// Register `work` as a new job linked to the live job `target`.
    ///
    /// If `target` already started and takes no more links, the new job is
    /// submitted right away.
    pub fn attach<T: Send + 'static>(
        &self,
        target: &JobId,
        relation: Relation,
        id: Option<JobId>,
        work: Work<T>,
    ) -> Result<JobHandle<T>> {
        let target = self.inner.lookup(target)?;
        let job = self.inner.register(id, JobKind::OneShot, work, None)?;

        match target.attach(relation, Arc::clone(&job)) {
            Ok(()) => debug!(job_id = %job.id, target = %target.id, %relation, "job linked"),
            Err(late) => {
                debug!(job_id = %late.id, target = %target.id, "target already started, submitting now");
                self.inner.dispatch(late);
            }
        }
        Ok(self.handle(job))
    }

    // --- inspection and control ----------------------------------------------

    /// Cancel a live job or a pending admission. Returns `false` if `id` is unknown.
    ///
    /// Linked jobs that have not started are cancelled with it. A running job
    /// is not interrupted but will not be admitted again.
    pub fn cancel(&self, id: &JobId) -> bool {
        self.inner.cancel(id)
    }

    pub fn progress_of(&self, id: &JobId) -> Result<ProgressGauge> {
        self.inner.progress_of(id)
    }

    /// Replace the gauge of a live job, e.g. to share one gauge between jobs.
    pub fn set_progress_gauge(&self, id: &JobId, gauge: ProgressGauge) -> Result<()> {
        if self.inner.lookup(id)?.replace_progress(gauge) {
            Ok(())
        } else {
            Err(SchedulerError::NotFound { id: id.0.clone() })
        }
    }

    pub fn status_of(&self, id: &JobId) -> Result<JobStatus> {
        Ok(self.inner.lookup(id)?.status())
    }

    /// Snapshot of every live job, ordered by id.
    pub fn jobs(&self) -> Vec<JobInfo> {
        let mut infos: Vec<JobInfo> = self.inner.jobs.iter().map(|e| e.value().info()).collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    /// Ids currently waiting for a time-based admission.
    pub fn pending_admissions(&self) -> Vec<JobId> {
        let mut ids: Vec<JobId> = self.inner.scheduled.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Parse a duration string, resolving a `${key}` placeholder first.
    pub fn parse_duration(&self, raw: &str) -> Result<Duration> {
        let resolver = self.inner.resolver();
        trigger::parse_duration_with(raw, resolver.as_deref())
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.is_closed()
    }

    /// Cancel all pending work, destroy every job and stop the pool.
    ///
    /// Idempotent. Later submissions fail with `ShutDown`.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}
