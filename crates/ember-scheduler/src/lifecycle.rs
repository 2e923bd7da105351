//! Bridges application lifecycle events to the job graph.
//!
//! Every [`AppEvent`] gets an anchor: a payload-less job created with the
//! manager and never registered under a public id. Work bound "before" an
//! event becomes a precedence link of its anchor, "after" a following link and
//! "alongside" a parallel link. When the event bus emits the event, the anchor
//! runs on the emitting thread, so precedence work has finished by the time
//! `emit` returns.
//!
//! Once an anchor has fired it accepts no more links. Work bound afterwards is
//! dispatched right away, or run on the caller's thread when requested.

use std::sync::Arc;

use ember_events::{AppEvent, EventBus};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::engine::Inner;
use crate::error::Result;
use crate::handle::JobHandle;
use crate::job::{Job, Work};
use crate::manager::JobManager;
use crate::types::{JobId, JobKind, Relation};

/// Prefix of the reserved anchor ids.
pub const ANCHOR_PREFIX: &str = "__app_event__";

/// Reserved id of the anchor for `event`.
pub fn anchor_id(event: AppEvent) -> JobId {
    JobId(format!("{ANCHOR_PREFIX}{}", event.as_str()))
}

/// One anchor job per lifecycle event, indexed by [`AppEvent::index`].
pub(crate) struct EventAnchors {
    anchors: [Arc<Job>; AppEvent::COUNT],
}

impl EventAnchors {
    pub(crate) fn new(root: &CancellationToken) -> Self {
        Self {
            anchors: std::array::from_fn(|i| {
                Arc::new(Job::anchor(anchor_id(AppEvent::ALL[i]), root.child_token()))
            }),
        }
    }

    pub(crate) fn get(&self, event: AppEvent) -> &Arc<Job> {
        &self.anchors[event.index()]
    }

    pub(crate) fn destroy(&self) {
        for anchor in &self.anchors {
            anchor.destroy();
        }
    }
}

impl Inner {
    /// Subscribe every anchor to `bus`.
    ///
    /// Events the bus already dispatched fire their anchor immediately.
    pub(crate) fn bind_anchors(self: &Arc<Self>, bus: &EventBus) {
        let listener = format!("job-manager/{}", self.instance_id);
        for event in AppEvent::ALL {
            let weak = Arc::downgrade(self);
            bus.on(listener.clone(), event, move |event| {
                if let Some(inner) = weak.upgrade() {
                    inner.fire(event);
                }
                Ok(())
            });
            if bus.is_dispatched(event) {
                self.fire(event);
            }
        }
    }

    fn fire(self: &Arc<Self>, event: AppEvent) {
        if self.is_closed() {
            return;
        }
        let anchor = Arc::clone(self.anchors.get(event));
        info!(%event, anchor = %anchor.id, "lifecycle anchor fired");
        self.run_job(&anchor);
    }

    fn bind_to_event<T: Send + 'static>(
        self: &Arc<Self>,
        event: AppEvent,
        relation: Relation,
        id: Option<JobId>,
        work: Work<T>,
        run_immediately: bool,
    ) -> Result<Arc<Job>> {
        let job = self.register(id, JobKind::OneShot, work, None)?;

        match self.anchors.get(event).attach(relation, Arc::clone(&job)) {
            Ok(()) => {
                debug!(job_id = %job.id, %event, %relation, "job bound to lifecycle event");
            }
            Err(late) if run_immediately => {
                debug!(job_id = %late.id, %event, "event already dispatched, running on caller thread");
                self.run_job(&late);
            }
            Err(late) => {
                debug!(job_id = %late.id, %event, "event already dispatched, submitting now");
                self.dispatch(late);
            }
        }
        Ok(job)
    }
}

impl JobManager {
    /// Run `work` before `event` completes dispatch.
    ///
    /// If the event already fired, `work` runs on the calling thread when
    /// `run_immediately` is set (the call returns after it finished), or is
    /// submitted to the pool otherwise.
    pub fn before<T: Send + 'static>(
        &self,
        event: AppEvent,
        id: Option<JobId>,
        work: Work<T>,
        run_immediately: bool,
    ) -> Result<JobHandle<T>> {
        let job = self
            .inner
            .bind_to_event(event, Relation::Precedence, id, work, run_immediately)?;
        Ok(self.handle(job))
    }

    /// Submit `work` once `event` has been dispatched. Same late-binding rules
    /// as [`JobManager::before`].
    pub fn after<T: Send + 'static>(
        &self,
        event: AppEvent,
        id: Option<JobId>,
        work: Work<T>,
        run_immediately: bool,
    ) -> Result<JobHandle<T>> {
        let job = self
            .inner
            .bind_to_event(event, Relation::Following, id, work, run_immediately)?;
        Ok(self.handle(job))
    }

    /// Submit `work` when `event` is dispatched, concurrently with the rest of
    /// the event's work. Falls back to immediate submission.
    pub fn alongside<T: Send + 'static>(
        &self,
        event: AppEvent,
        id: Option<JobId>,
        work: Work<T>,
    ) -> Result<JobHandle<T>> {
        let job = self
            .inner
            .bind_to_event(event, Relation::Parallel, id, work, false)?;
        Ok(self.handle(job))
    }

    pub fn before_app_start<T: Send + 'static>(&self, work: Work<T>) -> Result<JobHandle<T>> {
        self.before(AppEvent::Start, None, work, false)
    }

    pub fn after_app_start<T: Send + 'static>(&self, work: Work<T>) -> Result<JobHandle<T>> {
        self.after(AppEvent::Start, None, work, false)
    }

    pub fn before_app_stop<T: Send + 'static>(&self, work: Work<T>) -> Result<JobHandle<T>> {
        self.before(AppEvent::Stop, None, work, true)
    }

    /// Whether the anchor for `event` has fired.
    pub fn is_event_dispatched(&self, event: AppEvent) -> bool {
        self.inner.anchors.get(event).is_sealed()
    }
}
