use std::marker::PhantomData;
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::anyhow;

use crate::engine::Inner;
use crate::error::{JobFailure, Result, SchedulerError};
use crate::job::Job;
use crate::progress::ProgressGauge;
use crate::types::{JobId, JobStatus};

/// Caller-side handle to a submitted job producing a `T`.
///
/// Dropping the handle does not cancel the job.
pub struct JobHandle<T> {
    job: Arc<Job>,
    manager: Weak<Inner>,
    _output: PhantomData<fn() -> T>,
}

impl<T: Send + 'static> JobHandle<T> {
    pub(crate) fn new(job: Arc<Job>, manager: Weak<Inner>) -> Self {
        Self {
            job,
            manager,
            _output: PhantomData,
        }
    }

    pub fn id(&self) -> &JobId {
        &self.job.id
    }

    pub fn status(&self) -> JobStatus {
        self.job.status()
    }

    /// The job's gauge, or `None` once the job was destroyed.
    pub fn progress(&self) -> Option<ProgressGauge> {
        self.job.progress()
    }

    pub fn is_finished(&self) -> bool {
        self.job.status().is_terminal()
    }

    /// Cancel this job. Returns `false` if it is no longer live.
    pub fn cancel(&self) -> bool {
        match self.manager.upgrade() {
            Some(inner) => inner.cancel_exact(&self.job),
            None => false,
        }
    }

    /// Block up to `timeout` for the job to finish. Returns whether it did.
    pub fn wait_finished(&self, timeout: Duration) -> bool {
        self.job.wait_terminal_timeout(timeout)
    }

    /// Block until the job finishes and return its outcome.
    pub fn wait(self) -> Result<T> {
        self.job.wait_terminal();
        self.into_result()
    }

    /// Like [`JobHandle::wait`], bounded by `timeout`.
    pub fn wait_timeout(self, timeout: Duration) -> Result<T> {
        if !self.job.wait_terminal_timeout(timeout) {
            return Err(SchedulerError::Timeout {
                ms: timeout.as_millis() as u64,
            });
        }
        self.into_result()
    }

    /// Wait for the job without blocking the async runtime.
    pub async fn join(self) -> Result<T> {
        self.job.terminal().await;
        self.into_result()
    }

    fn into_result(self) -> Result<T> {
        let (status, output, failure) = self.job.take_outcome();
        match status {
            JobStatus::Completed => output
                .and_then(|o| o.downcast::<T>().ok())
                .map(|v| *v)
                .ok_or_else(|| {
                    SchedulerError::PayloadFailure(JobFailure::from(anyhow!(
                        "job {} produced no value of the expected type",
                        self.job.id
                    )))
                }),
            JobStatus::Failed => Err(SchedulerError::PayloadFailure(failure.unwrap_or_else(
                || JobFailure::from(anyhow!("job {} failed without a cause", self.job.id)),
            ))),
            _ => Err(SchedulerError::Cancelled {
                id: self.job.id.0.clone(),
            }),
        }
    }
}

impl<T> std::fmt::Debug for JobHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.job.id)
            .field("status", &self.job.status())
            .finish()
    }
}
