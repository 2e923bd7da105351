//! Housekeeping jobs the host binds to its own lifecycle.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ember_core::Settings;
use ember_events::AppEvent;
use ember_scheduler::{JobId, JobManager, ProgressGauge, Work};
use tracing::{debug, info};

/// Config key for the heartbeat period, e.g. `schedules.heartbeat = "30s"`.
pub const HEARTBEAT_KEY: &str = "schedules.heartbeat";
pub const DEFAULT_HEARTBEAT: &str = "30s";

const WARM_UP_STEPS: u64 = 5;

pub fn register(jobs: &JobManager, settings: &Settings) -> anyhow::Result<()> {
    let app = settings.config.app.name.clone();
    jobs.before(
        AppEvent::PreStart,
        Some(JobId::from("config-check")),
        Work::action(move || info!(app = %app, "configuration checked")),
        false,
    )?;

    jobs.alongside(
        AppEvent::Start,
        Some(JobId::from("warm-up")),
        Work::worker(|gauge: &ProgressGauge| {
            gauge.set_max_hint(WARM_UP_STEPS);
            for _ in 0..WARM_UP_STEPS {
                std::thread::sleep(Duration::from_millis(20));
                gauge.step();
            }
            debug!("caches warmed up");
            Ok(())
        }),
    )?;

    let beats = Arc::new(AtomicU64::new(0));
    let period = if settings.lookup(HEARTBEAT_KEY).is_some() {
        format!("${{{HEARTBEAT_KEY}}}")
    } else {
        DEFAULT_HEARTBEAT.to_string()
    };
    jobs.after_app_start(Work::action(|| info!("application is up")))?;
    jobs.every(
        Some(JobId::from("heartbeat")),
        Work::action(move || {
            let n = beats.fetch_add(1, Ordering::Relaxed) + 1;
            info!(beat = n, "heartbeat");
        }),
        &period,
    )?;

    jobs.before_app_stop(Work::action(|| info!("flushing before stop")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use ember_core::EmberConfig;
    use ember_events::EventBus;
    use ember_scheduler::{JobKind, JobStatus};

    use super::*;

    #[test]
    fn registers_lifecycle_and_heartbeat_jobs() {
        let settings = Settings::from_config(EmberConfig::default());
        let bus = EventBus::new();
        let jobs = JobManager::new(&settings.config.jobs, &bus).unwrap();

        register(&jobs, &settings).unwrap();
        let heartbeat = jobs
            .jobs()
            .into_iter()
            .find(|j| j.id.as_str() == "heartbeat")
            .unwrap();
        assert_eq!(heartbeat.kind, JobKind::Repeating);
        assert_eq!(jobs.status_of(&JobId::from("config-check")).unwrap(), JobStatus::Pending);

        bus.emit_all_through(AppEvent::Start);
        assert!(jobs.status_of(&JobId::from("config-check")).is_err());
        jobs.shutdown();
    }
}
