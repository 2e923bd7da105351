use std::fmt;

use serde::{Deserialize, Serialize};

use crate::progress::ProgressSnapshot;
use crate::trigger::Trigger;

/// Opaque identifier for a job.
///
/// Either supplied by the caller or generated as `<instance id><random suffix>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a fresh id under the given application instance prefix.
    pub fn generate(instance_id: &str) -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("{instance_id}{}", &suffix[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for JobId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Registered, not running. Repeating jobs return here after each run.
    Pending,
    /// Payload executing on a worker.
    Running,
    Completed,
    /// Payload returned an error or panicked.
    Failed,
    /// Cancelled before it ran, or a repeating job cancelled between runs.
    Cancelled,
}

impl JobStatus {
    /// Terminal states never change again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Runs at most once, then leaves the registry.
    OneShot,
    /// Re-admitted by its trigger after every run until cancelled.
    Repeating,
}

/// How a job is linked to the job it is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relation {
    /// Must finish before the target starts.
    Precedence,
    /// Started once the target has finished, whatever its outcome.
    Following,
    /// Started at the same admission point as the target.
    Parallel,
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Relation::Precedence => "precedence",
            Relation::Following => "following",
            Relation::Parallel => "parallel",
        };
        write!(f, "{s}")
    }
}

/// Point-in-time view of a registered job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInfo {
    pub id: JobId,
    pub kind: JobKind,
    pub status: JobStatus,
    /// Set for jobs admitted through a trigger.
    pub trigger: Option<Trigger>,
    pub progress: ProgressSnapshot,
    /// Number of completed or failed runs so far.
    pub run_count: u64,
    /// Ids of linked jobs that have not been started yet.
    pub precedence: Vec<JobId>,
    pub following: Vec<JobId>,
    pub parallel: Vec<JobId>,
}
