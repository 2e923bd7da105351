//! Jobs: the unit of work the manager registers, links and executes.
//!
//! A [`Work`] describes *what* to run and is consumed on submission; the
//! manager turns it into a [`Job`] record that owns the payload, its state,
//! progress gauge and links to other jobs.

use std::any::Any;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::context::JobContext;
use crate::error::JobFailure;
use crate::progress::ProgressGauge;
use crate::trigger::Trigger;
use crate::types::{JobId, JobInfo, JobKind, JobStatus, Relation};

/// Type-erased value produced by a payload.
pub(crate) type Output = Box<dyn Any + Send>;

/// The three payload shapes a job can carry.
pub(crate) enum Payload {
    /// Argument-less; failure is a panic.
    Action(Box<dyn Fn() + Send + Sync>),
    Callable(Box<dyn Fn() -> anyhow::Result<Output> + Send + Sync>),
    /// Receives the job's progress gauge.
    Worker(Box<dyn Fn(&ProgressGauge) -> anyhow::Result<Output> + Send + Sync>),
}

impl Payload {
    /// Run the payload, turning both `Err` returns and panics into a [`JobFailure`].
    pub(crate) fn execute(&self, gauge: &ProgressGauge) -> Result<Output, JobFailure> {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| match self {
            Payload::Action(f) => {
                f();
                Ok(Box::new(()) as Output)
            }
            Payload::Callable(f) => f(),
            Payload::Worker(f) => f(gauge),
        }));

        match outcome {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(JobFailure::from(e)),
            Err(panic) => Err(JobFailure::Panicked(panic_message(panic.as_ref()))),
        }
    }

    fn kind_name(&self) -> &'static str {
        match self {
            Payload::Action(_) => "action",
            Payload::Callable(_) => "callable",
            Payload::Worker(_) => "worker",
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// A unit of work to submit, producing a `T`.
///
/// The execution context current on the building thread is captured here,
/// unless one is set explicitly with [`Work::with_context`].
pub struct Work<T = ()> {
    pub(crate) payload: Payload,
    pub(crate) context: Option<JobContext>,
    _output: PhantomData<fn() -> T>,
}

impl Work<()> {
    /// Argument-less runnable. A panic counts as failure.
    pub fn action<F>(f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self::from_payload(Payload::Action(Box::new(f)))
    }
}

impl<T: Send + 'static> Work<T> {
    /// Value-producing computation.
    pub fn callable<F>(f: F) -> Self
    where
        F: Fn() -> anyhow::Result<T> + Send + Sync + 'static,
    {
        Self::from_payload(Payload::Callable(Box::new(move || {
            f().map(|v| Box::new(v) as Output)
        })))
    }

    /// Progress-aware worker; it receives the job's gauge on every run.
    pub fn worker<F>(f: F) -> Self
    where
        F: Fn(&ProgressGauge) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        Self::from_payload(Payload::Worker(Box::new(move |gauge| {
            f(gauge).map(|v| Box::new(v) as Output)
        })))
    }

    pub fn with_context(mut self, context: JobContext) -> Self {
        self.context = Some(context);
        self
    }

    fn from_payload(payload: Payload) -> Self {
        Self {
            payload,
            context: JobContext::current(),
            _output: PhantomData,
        }
    }
}

/// Links collected from a job when it starts.
#[derive(Default)]
pub(crate) struct LinkSet {
    pub precedence: Vec<Arc<Job>>,
    pub following: Vec<Arc<Job>>,
    pub parallel: Vec<Arc<Job>>,
}

impl LinkSet {
    fn into_iter_all(self) -> impl Iterator<Item = Arc<Job>> {
        self.precedence
            .into_iter()
            .chain(self.following)
            .chain(self.parallel)
    }
}

#[derive(Default)]
struct Links {
    /// Set once a one-shot job has started (or been destroyed); no further
    /// links are accepted after that.
    sealed: bool,
    set: LinkSet,
}

struct State {
    status: JobStatus,
    output: Option<Output>,
    failure: Option<JobFailure>,
    run_count: u64,
}

pub(crate) struct Job {
    pub(crate) id: JobId,
    pub(crate) kind: JobKind,
    /// `None` for lifecycle anchors.
    payload: Option<Payload>,
    context: Option<JobContext>,
    trigger: Option<Trigger>,
    /// Detached when the job is destroyed.
    progress: Mutex<Option<ProgressGauge>>,
    state: Mutex<State>,
    finished: Condvar,
    notify: Notify,
    links: Mutex<Links>,
    cancel: CancellationToken,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Job {
    pub(crate) fn new<T>(
        id: JobId,
        kind: JobKind,
        work: Work<T>,
        trigger: Option<Trigger>,
        cancel: CancellationToken,
    ) -> Self {
        Self::build(id, kind, Some(work.payload), work.context, trigger, cancel)
    }

    /// A payload-less one-shot job used as an attachment point.
    pub(crate) fn anchor(id: JobId, cancel: CancellationToken) -> Self {
        Self::build(id, JobKind::OneShot, None, None, None, cancel)
    }

    fn build(
        id: JobId,
        kind: JobKind,
        payload: Option<Payload>,
        context: Option<JobContext>,
        trigger: Option<Trigger>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            kind,
            payload,
            context,
            trigger,
            progress: Mutex::new(Some(ProgressGauge::new())),
            state: Mutex::new(State {
                status: JobStatus::Pending,
                output: None,
                failure: None,
                run_count: 0,
            }),
            finished: Condvar::new(),
            notify: Notify::new(),
            links: Mutex::new(Links::default()),
            cancel,
        }
    }

    pub(crate) fn payload(&self) -> Option<&Payload> {
        self.payload.as_ref()
    }

    pub(crate) fn payload_kind(&self) -> &'static str {
        self.payload.as_ref().map_or("anchor", Payload::kind_name)
    }

    pub(crate) fn context(&self) -> Option<&JobContext> {
        self.context.as_ref()
    }

    pub(crate) fn status(&self) -> JobStatus {
        lock(&self.state).status
    }

    pub(crate) fn progress(&self) -> Option<ProgressGauge> {
        lock(&self.progress).clone()
    }

    /// Swap in a caller-provided gauge. Fails once the job is destroyed.
    pub(crate) fn replace_progress(&self, gauge: ProgressGauge) -> bool {
        let mut slot = lock(&self.progress);
        match slot.as_mut() {
            Some(current) => {
                *current = gauge;
                true
            }
            None => false,
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub(crate) fn is_sealed(&self) -> bool {
        lock(&self.links).sealed
    }

    /// Add a link. Hands the job back when this job no longer takes links.
    pub(crate) fn attach(&self, relation: Relation, job: Arc<Job>) -> Result<(), Arc<Job>> {
        let mut links = lock(&self.links);
        if links.sealed {
            return Err(job);
        }
        match relation {
            Relation::Precedence => links.set.precedence.push(job),
            Relation::Following => links.set.following.push(job),
            Relation::Parallel => links.set.parallel.push(job),
        }
        Ok(())
    }

    /// Links to act on for this run, or `None` if a one-shot job already started.
    ///
    /// One-shot jobs hand their links over exactly once; repeating jobs keep
    /// them, so linked one-shot jobs run with the first occurrence only.
    pub(crate) fn take_links(&self) -> Option<LinkSet> {
        let mut links = lock(&self.links);
        if links.sealed {
            return None;
        }
        match self.kind {
            JobKind::OneShot => {
                links.sealed = true;
                Some(std::mem::take(&mut links.set))
            }
            JobKind::Repeating => Some(LinkSet {
                precedence: links.set.precedence.clone(),
                following: links.set.following.clone(),
                parallel: links.set.parallel.clone(),
            }),
        }
    }

    /// Seal and empty the links, returning every job that was linked.
    pub(crate) fn drain_links(&self) -> Vec<Arc<Job>> {
        let mut links = lock(&self.links);
        links.sealed = true;
        std::mem::take(&mut links.set).into_iter_all().collect()
    }

    /// `Pending → Running`. Fails when cancelled or not pending.
    pub(crate) fn try_start(&self) -> bool {
        let mut state = lock(&self.state);
        if state.status != JobStatus::Pending || self.cancel.is_cancelled() {
            return false;
        }
        state.status = JobStatus::Running;
        true
    }

    /// Record the outcome of a run and wake waiters.
    pub(crate) fn finish(&self, result: Result<Output, JobFailure>) {
        {
            let mut state = lock(&self.state);
            state.run_count += 1;
            match self.kind {
                JobKind::OneShot => match result {
                    Ok(output) => {
                        state.output = Some(output);
                        state.status = JobStatus::Completed;
                    }
                    Err(failure) => {
                        state.failure = Some(failure);
                        state.status = JobStatus::Failed;
                    }
                },
                JobKind::Repeating => {
                    // Only the latest failure is kept; values are dropped.
                    state.failure = result.err();
                    state.status = if self.cancel.is_cancelled() {
                        JobStatus::Cancelled
                    } else {
                        JobStatus::Pending
                    };
                }
            }
        }
        self.wake();
    }

    /// Cancel the job. Returns `true` if it had not started yet.
    ///
    /// A running job keeps running; a repeating one is not re-admitted.
    pub(crate) fn mark_cancelled(&self) -> bool {
        self.cancel.cancel();
        let changed = {
            let mut state = lock(&self.state);
            if state.status == JobStatus::Pending {
                state.status = JobStatus::Cancelled;
                true
            } else {
                false
            }
        };
        if changed {
            self.wake();
        }
        changed
    }

    /// Release links and detach the progress gauge.
    pub(crate) fn destroy(&self) {
        self.drain_links();
        lock(&self.progress).take();
    }

    fn wake(&self) {
        self.finished.notify_all();
        self.notify.notify_waiters();
    }

    pub(crate) fn wait_terminal(&self) {
        let mut state = lock(&self.state);
        while !state.status.is_terminal() {
            state = self
                .finished
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub(crate) fn wait_terminal_timeout(&self, timeout: Duration) -> bool {
        let state = lock(&self.state);
        let (state, _) = self
            .finished
            .wait_timeout_while(state, timeout, |s| !s.status.is_terminal())
            .unwrap_or_else(PoisonError::into_inner);
        state.status.is_terminal()
    }

    pub(crate) async fn terminal(&self) {
        loop {
            // Created before the check so a wake in between is not lost.
            let notified = self.notify.notified();
            if self.status().is_terminal() {
                return;
            }
            notified.await;
        }
    }

    /// Take the produced value, or the failure that replaced it.
    pub(crate) fn take_outcome(&self) -> (JobStatus, Option<Output>, Option<JobFailure>) {
        let mut state = lock(&self.state);
        (state.status, state.output.take(), state.failure.clone())
    }

    pub(crate) fn last_failure(&self) -> Option<JobFailure> {
        lock(&self.state).failure.clone()
    }

    pub(crate) fn info(&self) -> JobInfo {
        let (status, run_count) = {
            let state = lock(&self.state);
            (state.status, state.run_count)
        };
        let ids = |jobs: &[Arc<Job>]| -> Vec<JobId> {
            jobs.iter()
                .filter(|j| j.status() == JobStatus::Pending)
                .map(|j| j.id.clone())
                .collect()
        };
        let (precedence, following, parallel) = {
            let links = lock(&self.links);
            (
                ids(&links.set.precedence),
                ids(&links.set.following),
                ids(&links.set.parallel),
            )
        };

        JobInfo {
            id: self.id.clone(),
            kind: self.kind,
            status,
            trigger: self.trigger.clone(),
            progress: self.progress().unwrap_or_default().snapshot(),
            run_count,
            precedence,
            following,
            parallel,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one_shot<T>(id: &str, work: Work<T>) -> Job {
        Job::new(JobId::from(id), JobKind::OneShot, work, None, CancellationToken::new())
    }

    #[test]
    fn payload_errors_and_panics_become_failures() {
        let gauge = ProgressGauge::new();

        let ok = Work::callable(|| Ok(7_u32));
        let out = ok.payload.execute(&gauge).unwrap();
        assert_eq!(*out.downcast::<u32>().unwrap(), 7);

        let err = Work::<u32>::callable(|| anyhow::bail!("disk full"));
        let failure = err.payload.execute(&gauge).unwrap_err();
        assert_eq!(failure.to_string(), "disk full");

        let boom = Work::action(|| panic!("kaboom"));
        let failure = boom.payload.execute(&gauge).unwrap_err();
        assert!(matches!(failure, JobFailure::Panicked(ref m) if m == "kaboom"));
    }

    #[test]
    fn worker_receives_the_gauge() {
        let gauge = ProgressGauge::with_max_hint(2);
        let work = Work::worker(|g: &ProgressGauge| {
            g.step();
            Ok(())
        });
        work.payload.execute(&gauge).unwrap();
        assert_eq!(gauge.percentage(), Some(50));
    }

    #[test]
    fn one_shot_hands_out_links_once() {
        let job = one_shot("a", Work::action(|| {}));
        let child = Arc::new(one_shot("b", Work::action(|| {})));
        assert!(job.attach(Relation::Following, Arc::clone(&child)).is_ok());

        let links = job.take_links().unwrap();
        assert_eq!(links.following.len(), 1);
        assert!(job.take_links().is_none());
        assert!(job.attach(Relation::Precedence, child).is_err());
    }

    #[test]
    fn cancel_only_flips_pending_jobs() {
        let pending = one_shot("p", Work::action(|| {}));
        assert!(pending.mark_cancelled());
        assert_eq!(pending.status(), JobStatus::Cancelled);
        assert!(!pending.try_start());

        let running = one_shot("r", Work::action(|| {}));
        assert!(running.try_start());
        assert!(!running.mark_cancelled());
        running.finish(Ok(Box::new(())));
        assert_eq!(running.status(), JobStatus::Completed);
    }

    #[test]
    fn repeating_job_returns_to_pending_until_cancelled() {
        let job = Job::new(
            JobId::from("tick"),
            JobKind::Repeating,
            Work::action(|| {}),
            Some(Trigger::every(Duration::from_secs(1))),
            CancellationToken::new(),
        );
        assert!(job.try_start());
        job.finish(Ok(Box::new(())));
        assert_eq!(job.status(), JobStatus::Pending);

        assert!(job.try_start());
        job.mark_cancelled();
        job.finish(Ok(Box::new(())));
        assert_eq!(job.status(), JobStatus::Cancelled);
        assert_eq!(job.info().run_count, 2);
    }

    #[test]
    fn destroy_detaches_progress() {
        let job = one_shot("d", Work::action(|| {}));
        assert!(job.progress().is_some());
        job.destroy();
        assert!(job.progress().is_none());
        assert!(!job.replace_progress(ProgressGauge::new()));
        assert!(job.is_sealed());
    }

    #[test]
    fn wait_with_timeout_reports_unfinished_jobs() {
        let job = one_shot("w", Work::action(|| {}));
        assert!(!job.wait_terminal_timeout(Duration::from_millis(10)));
        job.mark_cancelled();
        assert!(job.wait_terminal_timeout(Duration::from_millis(10)));
    }
}
