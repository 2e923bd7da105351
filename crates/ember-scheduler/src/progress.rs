//! Progress reporting for running jobs.
//!
//! A [`ProgressGauge`] is owned by its job and handed to worker payloads,
//! which advance it as they go. Anyone holding a clone (usually obtained via
//! `JobManager::progress_of`) can read it concurrently.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Shared, lock-free progress counter.
///
/// Without a max hint the gauge is indeterminate and reports no percentage.
#[derive(Clone, Default)]
pub struct ProgressGauge {
    state: Arc<GaugeState>,
}

#[derive(Default)]
struct GaugeState {
    current: AtomicU64,
    max_hint: AtomicU64,
    done: AtomicBool,
}

/// Serializable view of a gauge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub current: u64,
    pub max_hint: u64,
    /// `None` while indeterminate.
    pub percentage: Option<u8>,
    pub done: bool,
}

impl ProgressGauge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Gauge that expects `max_hint` steps.
    pub fn with_max_hint(max_hint: u64) -> Self {
        let gauge = Self::new();
        gauge.set_max_hint(max_hint);
        gauge
    }

    pub fn set_max_hint(&self, max_hint: u64) {
        self.state.max_hint.store(max_hint, Ordering::Release);
    }

    pub fn step(&self) {
        self.step_by(1);
    }

    pub fn step_by(&self, steps: u64) {
        self.state.current.fetch_add(steps, Ordering::AcqRel);
    }

    pub fn set_progress(&self, current: u64) {
        self.state.current.store(current, Ordering::Release);
    }

    /// Force the gauge to 100% regardless of the step count.
    pub fn mark_done(&self) {
        self.state.done.store(true, Ordering::Release);
    }

    pub fn current(&self) -> u64 {
        self.state.current.load(Ordering::Acquire)
    }

    pub fn max_hint(&self) -> u64 {
        self.state.max_hint.load(Ordering::Acquire)
    }

    pub fn is_done(&self) -> bool {
        if self.state.done.load(Ordering::Acquire) {
            return true;
        }
        let max = self.max_hint();
        max > 0 && self.current() >= max
    }

    /// Completion in percent, clamped to 100. `None` when indeterminate.
    pub fn percentage(&self) -> Option<u8> {
        if self.state.done.load(Ordering::Acquire) {
            return Some(100);
        }
        let max = self.max_hint();
        if max == 0 {
            return None;
        }
        let pct = self.current().saturating_mul(100) / max;
        Some(pct.min(100) as u8)
    }

    /// Reset to an indeterminate, zero-step gauge.
    pub fn clear(&self) {
        self.state.current.store(0, Ordering::Release);
        self.state.max_hint.store(0, Ordering::Release);
        self.state.done.store(false, Ordering::Release);
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            current: self.current(),
            max_hint: self.max_hint(),
            percentage: self.percentage(),
            done: self.is_done(),
        }
    }

    /// Whether both handles observe the same gauge.
    pub fn same_as(&self, other: &ProgressGauge) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

impl fmt::Debug for ProgressGauge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressGauge")
            .field("current", &self.current())
            .field("max_hint", &self.max_hint())
            .field("done", &self.state.done.load(Ordering::Acquire))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indeterminate_without_max_hint() {
        let gauge = ProgressGauge::new();
        gauge.step_by(5);
        assert_eq!(gauge.percentage(), None);
        assert!(!gauge.is_done());
    }

    #[test]
    fn percentage_follows_steps_and_clamps() {
        let gauge = ProgressGauge::with_max_hint(4);
        gauge.step();
        assert_eq!(gauge.percentage(), Some(25));
        gauge.step_by(2);
        assert_eq!(gauge.percentage(), Some(75));
        gauge.step_by(10);
        assert_eq!(gauge.percentage(), Some(100));
        assert!(gauge.is_done());
    }

    #[test]
    fn mark_done_overrides_steps() {
        let gauge = ProgressGauge::with_max_hint(100);
        gauge.set_progress(3);
        gauge.mark_done();
        assert_eq!(gauge.percentage(), Some(100));
        assert!(gauge.snapshot().done);
    }

    #[test]
    fn clones_share_state_and_clear_resets() {
        let gauge = ProgressGauge::with_max_hint(10);
        let view = gauge.clone();
        gauge.step_by(5);
        assert_eq!(view.percentage(), Some(50));
        assert!(view.same_as(&gauge));

        gauge.clear();
        assert_eq!(
            view.snapshot(),
            ProgressSnapshot {
                current: 0,
                max_hint: 0,
                percentage: None,
                done: false,
            }
        );
    }
}
