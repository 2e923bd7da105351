// Jobs bound to application lifecycle events, driven through a real EventBus.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use ember_core::JobsConfig;
use ember_events::{AppEvent, EventBus, EventError};
use ember_scheduler::{JobId, JobManager, JobStatus, SchedulerError, Work};

fn setup() -> (EventBus, JobManager) {
    let bus = EventBus::new();
    let jobs = JobManager::new(&JobsConfig::default(), &bus).unwrap();
    (bus, jobs)
}

#[test]
fn parallel_jobs_are_admitted_when_the_event_fires() {
    let (bus, jobs) = setup();
    let admitted = Arc::new(Mutex::new(Vec::new()));

    let handles: Vec<_> = ["c", "d"]
        .into_iter()
        .map(|name| {
            let admitted = Arc::clone(&admitted);
            jobs.alongside(
                AppEvent::AppCodeScanned,
                Some(JobId::from(name)),
                Work::action(move || admitted.lock().unwrap().push((name, Instant::now()))),
            )
            .unwrap()
        })
        .collect();

    thread::sleep(Duration::from_millis(30));
    assert!(admitted.lock().unwrap().is_empty());

    let fired_at = Instant::now();
    bus.emit(AppEvent::AppCodeScanned);
    for handle in handles {
        handle.wait().unwrap();
    }

    let mut admitted = admitted.lock().unwrap().clone();
    admitted.sort_by_key(|(name, _)| *name);
    assert_eq!(admitted.len(), 2);
    assert!(admitted.iter().all(|(_, at)| *at >= fired_at));
}

#[test]
fn before_with_run_immediately_after_fire_is_synchronous() {
    let (bus, jobs) = setup();
    bus.emit_all_through(AppEvent::PreStart);

    let ran = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&ran);
    let handle = jobs
        .before(
            AppEvent::PreStart,
            Some(JobId::from("late-init")),
            Work::action(move || {
                thread::sleep(Duration::from_millis(20));
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            true,
        )
        .unwrap();

    assert_eq!(ran.load(Ordering::SeqCst), 1);
    assert_eq!(handle.status(), JobStatus::Completed);
    assert!(jobs.status_of(&JobId::from("late-init")).is_err());
}

#[test]
fn before_registered_early_runs_once_event_fires() {
    let (bus, jobs) = setup();
    let ran = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&ran);

    let handle = jobs
        .before(
            AppEvent::PreStart,
            None,
            Work::action(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            true,
        )
        .unwrap();

    thread::sleep(Duration::from_millis(30));
    assert_eq!(ran.load(Ordering::SeqCst), 0);
    assert_eq!(handle.status(), JobStatus::Pending);

    bus.emit(AppEvent::PreStart);
    assert_eq!(ran.load(Ordering::SeqCst), 1);
    handle.wait().unwrap();

    // Repeated dispatch is ignored by the bus.
    bus.emit(AppEvent::PreStart);
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

#[test]
fn event_waits_for_before_work_started_by_hand() {
    let (bus, jobs) = setup();
    let (started_tx, started_rx) = mpsc::channel::<()>();
    let started_tx = Mutex::new(started_tx);
    let ran = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&ran);

    let handle = jobs
        .before(
            AppEvent::PreStart,
            Some(JobId::from("early-flush")),
            Work::action(move || {
                let _ = started_tx.lock().unwrap().send(());
                thread::sleep(Duration::from_millis(80));
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            false,
        )
        .unwrap();

    jobs.run_now(handle.id()).unwrap();
    started_rx.recv_timeout(Duration::from_secs(2)).unwrap();

    bus.emit(AppEvent::PreStart);
    assert_eq!(ran.load(Ordering::SeqCst), 1);
    assert_eq!(handle.status(), JobStatus::Completed);
}

#[test]
fn late_binding_without_flag_submits_to_the_pool() {
    let (bus, jobs) = setup();
    bus.emit_all_through(AppEvent::Start);

    let caller = thread::current().id();
    let handle = jobs
        .after(
            AppEvent::Start,
            None,
            Work::callable(|| Ok(thread::current().id())),
            false,
        )
        .unwrap();
    assert_ne!(handle.wait().unwrap(), caller);
}

#[test]
fn lifecycle_sequence_runs_bound_work_in_phase_order() {
    let (bus, jobs) = setup();
    let log = Arc::new(Mutex::new(Vec::new()));

    let bind = |event: AppEvent, label: &'static str| {
        let log = Arc::clone(&log);
        jobs.before(event, None, Work::action(move || log.lock().unwrap().push(label)), false)
            .unwrap()
    };
    bind(AppEvent::Start, "before start");
    bind(AppEvent::ClassLoaded, "before classes loaded");
    bind(AppEvent::PreStart, "before pre start");

    bus.emit_all_through(AppEvent::Start);
    assert_eq!(
        *log.lock().unwrap(),
        vec!["before classes loaded", "before pre start", "before start"]
    );
    assert!(!jobs.is_event_dispatched(AppEvent::Stop));
}

#[test]
fn failing_event_work_does_not_block_other_listeners() {
    let (bus, jobs) = setup();
    let others = Arc::new(AtomicUsize::new(0));

    let failing = jobs
        .before(AppEvent::Stop, None, Work::action(|| panic!("flush failed")), false)
        .unwrap();
    let counter = Arc::clone(&others);
    bus.on("audit", AppEvent::Stop, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok::<(), EventError>(())
    });

    assert_eq!(bus.emit(AppEvent::Stop), 2);
    assert_eq!(others.load(Ordering::SeqCst), 1);
    assert!(matches!(failing.wait(), Err(SchedulerError::PayloadFailure(_))));
}

#[test]
fn shutdown_discards_unfired_event_work() {
    let (bus, jobs) = setup();
    let handle = jobs
        .after_app_start(Work::action(|| panic!("must not run")))
        .unwrap();

    jobs.shutdown();
    bus.emit(AppEvent::Start);
    assert!(matches!(handle.wait(), Err(SchedulerError::Cancelled { .. })));
    assert!(matches!(
        jobs.before_app_stop(Work::action(|| {})),
        Err(SchedulerError::ShutDown)
    ));
}
