//! `ember-scheduler` — in-process job scheduler with lifecycle-event triggers.
//!
//! # Overview
//!
//! A [`JobManager`] owns a registry of jobs and a dedicated Tokio runtime:
//! payloads run on its blocking pool (capped at `pool_size` threads), timers
//! that admit delayed and repeating jobs run on its async workers. Jobs can be
//! linked to each other or to application lifecycle events, see
//! [`lifecycle`].
//!
//! # Triggers
//!
//! | Variant      | Admission                                              |
//! |--------------|--------------------------------------------------------|
//! | `Immediate`  | As soon as a worker is free                            |
//! | `Delay`      | Once, after a duration                                 |
//! | `At`         | Once, at a UTC instant (past instants are rejected)    |
//! | `FixedRate`  | Every period from the first admission; missed ticks are skipped |
//! | `FixedDelay` | One period after the previous run finished             |
//!
//! # Links
//!
//! | Relation     | Runs                                                   |
//! |--------------|--------------------------------------------------------|
//! | `Precedence` | Inline, before the target's payload                    |
//! | `Following`  | Submitted after the target finished, whatever the outcome |
//! | `Parallel`   | Submitted when the target is admitted                  |

pub mod context;
mod engine;
pub mod error;
mod handle;
mod job;
pub mod lifecycle;
mod manager;
pub mod progress;
pub mod trigger;
pub mod types;

pub use context::{ContextGuard, JobContext};
pub use error::{JobFailure, Result, SchedulerError};
pub use handle::JobHandle;
pub use job::Work;
pub use lifecycle::anchor_id;
pub use manager::{JobManager, JobManagerBuilder};
pub use progress::{ProgressGauge, ProgressSnapshot};
pub use trigger::{parse_duration, Trigger};
pub use types::{JobId, JobInfo, JobKind, JobStatus, Relation};
