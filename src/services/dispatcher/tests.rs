//! Tests for the Dispatcher module

use super::*;
use crate::domain::types::{BeaconIdentity, Proximity};
use crate::io::sources::SourceHandle;
use crate::services::notifier::{capture_channel, Notification, NotificationQueue};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Source that hands its callback handle to the test
struct ManualSource {
    name: &'static str,
    auto_ready: bool,
    handle: Mutex<Option<SourceHandle>>,
    starts: AtomicUsize,
    stops: AtomicUsize,
}

impl ManualSource {
    fn new(name: &'static str, auto_ready: bool) -> Arc<Self> {
        Arc::new(Self {
            name,
            auto_ready,
            handle: Mutex::new(None),
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
        })
    }

    fn handle(&self) -> SourceHandle {
        self.handle.lock().clone().expect("source was never started")
    }
}

impl SensorSource for ManualSource {
    fn name(&self) -> &'static str {
        self.name
    }

    fn start(&self, handle: SourceHandle) {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self.auto_ready {
            handle.ready();
        }
        *self.handle.lock() = Some(handle);
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

/// Test harness that keeps the notification receiver alive
struct TestDispatcher {
    dispatcher: Dispatcher,
    handle: DispatcherHandle,
    notifications: NotificationQueue,
}

impl std::ops::Deref for TestDispatcher {
    type Target = Dispatcher;
    fn deref(&self) -> &Self::Target {
        &self.dispatcher
    }
}

impl std::ops::DerefMut for TestDispatcher {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.dispatcher
    }
}

impl TestDispatcher {
    /// Apply every queued control message (source readiness and failures)
    fn pump_control(&mut self) {
        while let Ok(control) = self.dispatcher.control_rx.try_recv() {
            self.dispatcher.process_control(control);
        }
    }

    fn start(&mut self) -> Transition {
        let (tx, mut rx) = oneshot::channel();
        self.process_control(Control::Start { reply: tx });
        self.pump_control();
        rx.try_recv().unwrap()
    }

    fn pause(&mut self) -> Result<Transition, EngageError> {
        let (tx, mut rx) = oneshot::channel();
        self.process_control(Control::Pause { reply: tx });
        rx.try_recv().unwrap()
    }

    fn resume(&mut self) -> Result<Transition, EngageError> {
        let (tx, mut rx) = oneshot::channel();
        self.process_control(Control::Resume { reply: tx });
        rx.try_recv().unwrap()
    }

    fn notifications(&mut self) -> Vec<Notification> {
        std::iter::from_fn(|| self.notifications.try_recv()).collect()
    }
}

fn create_test_dispatcher(sources: Vec<Arc<dyn SensorSource>>) -> TestDispatcher {
    create_test_dispatcher_with_config(Config::default(), sources)
}

fn create_test_dispatcher_with_config(
    config: Config,
    sources: Vec<Arc<dyn SensorSource>>,
) -> TestDispatcher {
    let metrics = Arc::new(Metrics::new());
    let (notifier, notifications) = capture_channel(1024, metrics.clone());
    let (dispatcher, handle) = create_dispatcher(&config, sources, notifier, metrics);
    TestDispatcher { dispatcher, handle, notifications }
}

fn running_dispatcher() -> TestDispatcher {
    let mut d = create_test_dispatcher(vec![]);
    d.start();
    assert_eq!(d.state(), &LifecycleState::Running);
    d
}

fn beacon() -> BeaconIdentity {
    BeaconIdentity::new("U", 1, 1)
}

fn enter(at: Instant) -> Sighting {
    Sighting::RegionEnter { identity: beacon(), at }
}

fn ranged(rssi: i16, at: Instant) -> Sighting {
    Sighting::Ranged { identity: beacon(), rssi, proximity: Proximity::Unknown, at }
}

// ============================================================================
// Lifecycle
// ============================================================================

#[test]
fn test_start_without_sources_runs_immediately() {
    let mut d = create_test_dispatcher(vec![]);
    assert!(d.start().changed());
    assert_eq!(d.state(), &LifecycleState::Running);
    assert_eq!(*d.handle.state_rx.borrow(), LifecycleState::Running);
}

#[test]
fn test_start_waits_for_every_source() {
    let region = ManualSource::new("region", false);
    let ranging = ManualSource::new("ranging", false);
    let mut d = create_test_dispatcher(vec![region.clone(), ranging.clone()]);

    d.start();
    assert_eq!(d.state(), &LifecycleState::Starting);
    assert_eq!(region.starts.load(Ordering::SeqCst), 1);
    assert_eq!(ranging.starts.load(Ordering::SeqCst), 1);

    region.handle().ready();
    region.handle().ready();
    d.pump_control();
    assert_eq!(d.state(), &LifecycleState::Starting);

    ranging.handle().ready();
    d.pump_control();
    assert_eq!(d.state(), &LifecycleState::Running);
}

#[test]
fn test_duplicate_start_is_noop() {
    let source = ManualSource::new("region", true);
    let mut d = create_test_dispatcher(vec![source.clone()]);
    assert!(d.start().changed());
    assert_eq!(d.start(), Transition::Unchanged);
    assert_eq!(source.starts.load(Ordering::SeqCst), 1);
}

#[test]
fn test_resume_without_start_leaves_state() {
    let mut d = create_test_dispatcher(vec![]);
    assert!(matches!(d.resume(), Err(EngageError::InvalidState { .. })));
    assert_eq!(d.state(), &LifecycleState::Idle);
}

#[test]
fn test_pause_stops_sources_and_resume_restarts_them() {
    let source = ManualSource::new("ranging", true);
    let mut d = create_test_dispatcher(vec![source.clone()]);
    d.start();
    d.pump_control();

    assert!(d.pause().unwrap().changed());
    assert_eq!(source.stops.load(Ordering::SeqCst), 1);
    assert_eq!(*d.handle.state_rx.borrow(), LifecycleState::Paused);

    assert!(d.resume().unwrap().changed());
    d.pump_control();
    assert_eq!(source.starts.load(Ordering::SeqCst), 2);
    assert_eq!(d.state(), &LifecycleState::Running);
}

// ============================================================================
// Sightings
// ============================================================================

#[test]
fn test_enter_then_strong_ranging_appears_then_updates() {
    let mut d = running_dispatcher();
    let t0 = Instant::now();

    d.process_sighting(enter(t0));
    d.process_sighting(ranged(-45, t0 + Duration::from_millis(100)));
    d.drain_inbox();

    let notes = d.notifications();
    assert_eq!(notes.len(), 2);
    assert!(matches!(&notes[0], Notification::Appeared(s) if s.proximity == Proximity::Unknown));
    assert!(matches!(&notes[1], Notification::Updated(s) if s.proximity == Proximity::Immediate));

    let snapshot = d.handle.beacons_rx.borrow().clone();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot["U-1-1"].proximity, Proximity::Immediate);
}

#[test]
fn test_sightings_before_running_are_rejected() {
    let source = ManualSource::new("ranging", false);
    let mut d = create_test_dispatcher(vec![source]);
    d.start();

    d.process_sighting(enter(Instant::now()));
    assert!(d.registry.is_empty());
    assert!(d.notifications().is_empty());
    assert_eq!(d.metrics.sightings_rejected(), 1);
}

#[test]
fn test_pause_wins_over_queued_sightings() {
    let source = ManualSource::new("ranging", true);
    let mut d = create_test_dispatcher(vec![source.clone()]);
    d.start();
    d.pump_control();

    source.handle().ranged(beacon(), -60, Proximity::Near);
    d.pause().unwrap();
    // Arrives after stop was requested
    source.handle().ranged(beacon(), -60, Proximity::Near);
    d.drain_inbox();

    assert!(d.registry.is_empty());
    assert!(d.notifications().is_empty());
    assert_eq!(d.state(), &LifecycleState::Paused);
    assert_eq!(d.metrics.sightings_rejected(), 2);
}

#[test]
fn test_rapid_alternating_tiers_are_debounced() {
    let mut d = running_dispatcher();
    let t0 = Instant::now();
    for i in 0..100u64 {
        let rssi = if i % 2 == 0 { -70 } else { -80 };
        d.process_sighting(ranged(rssi, t0 + Duration::from_millis(i * 10)));
    }

    let updates = d
        .notifications()
        .iter()
        .filter(|n| matches!(n, Notification::Updated(_)))
        .count();
    assert!(updates < 100, "got {updates} updates");
    assert_eq!(d.registry.len(), 1);
}

#[test]
fn test_zero_rssi_does_not_change_tier() {
    let mut d = running_dispatcher();
    let t0 = Instant::now();
    d.process_sighting(ranged(-50, t0));
    d.process_sighting(ranged(0, t0 + Duration::from_millis(10)));

    let state = d.registry.get(&beacon()).unwrap();
    assert_eq!(state.proximity, Proximity::Immediate);
    assert_eq!(state.samples.len(), 1);
}

// ============================================================================
// Sweep and exit
// ============================================================================

#[test]
fn test_silent_beacon_disappears_once_per_absence() {
    let config = Config::default().with_silence_timeout_ms(1_000);
    let mut d = create_test_dispatcher_with_config(config, vec![]);
    d.start();
    let t0 = Instant::now();

    d.process_sighting(enter(t0));
    d.process_sweep(t0 + Duration::from_millis(500));
    d.process_sweep(t0 + Duration::from_millis(1_500));
    d.process_sweep(t0 + Duration::from_millis(3_000));

    d.process_sighting(enter(t0 + Duration::from_millis(4_000)));
    d.process_sweep(t0 + Duration::from_millis(6_000));

    let kinds: Vec<&str> = d
        .notifications()
        .iter()
        .map(|n| match n {
            Notification::Appeared(_) => "appeared",
            Notification::Updated(_) => "updated",
            Notification::Disappeared(_) => "disappeared",
            Notification::Failure { .. } => "failure",
        })
        .collect();
    assert_eq!(kinds, vec!["appeared", "disappeared", "appeared", "disappeared"]);
    assert!(d.handle.beacons_rx.borrow().is_empty());
}

#[test]
fn test_region_exit_removed_on_next_sweep() {
    let mut d = running_dispatcher();
    let t0 = Instant::now();
    d.process_sighting(enter(t0));
    d.process_sighting(Sighting::RegionExit { identity: beacon(), at: t0 });
    assert_eq!(d.registry.len(), 1);

    d.process_sweep(t0 + Duration::from_millis(10));
    assert!(d.registry.is_empty());
    assert!(matches!(d.notifications().last(), Some(Notification::Disappeared(id)) if *id == beacon()));
}

#[test]
fn test_resume_refreshes_silence_window() {
    let config = Config::default().with_silence_timeout_ms(1_000);
    let mut d = create_test_dispatcher_with_config(config, vec![]);
    d.start();
    let t0 = Instant::now();
    d.process_sighting(enter(t0));

    d.pause().unwrap();
    d.process_sweep(t0 + Duration::from_secs(60));
    assert_eq!(d.registry.len(), 1, "sweep must not run while paused");

    // Resumed "now": the retained beacon is not instantly expired
    d.resume().unwrap();
    d.process_sweep(Instant::now());
    assert_eq!(d.registry.len(), 1);
}

// ============================================================================
// Failures
// ============================================================================

#[test]
fn test_source_failure_clears_registry_and_notifies() {
    let source = ManualSource::new("region", true);
    let mut d = create_test_dispatcher(vec![source.clone()]);
    d.start();
    d.pump_control();

    let handle = source.handle();
    handle.region_enter(BeaconIdentity::new("U", 1, 2));
    handle.region_enter(beacon());
    d.drain_inbox();
    d.notifications();

    handle.ranged(beacon(), -50, Proximity::Immediate);
    handle.failed(ErrorKind::PermissionDenied, "location denied");
    d.pump_control();

    assert!(matches!(d.state(), LifecycleState::Failed(r) if r.kind == ErrorKind::PermissionDenied));
    assert!(d.registry.is_empty());
    assert!(d.inbox.is_empty());
    assert_eq!(source.stops.load(Ordering::SeqCst), 1);

    let notes = d.notifications();
    assert_eq!(notes.len(), 3);
    assert!(matches!(&notes[0], Notification::Disappeared(id) if *id == beacon()));
    assert!(matches!(&notes[1], Notification::Disappeared(id) if id.minor() == 2));
    assert!(matches!(&notes[2], Notification::Failure { kind: ErrorKind::PermissionDenied, .. }));
    assert!(d.handle.beacons_rx.borrow().is_empty());
}

#[test]
fn test_non_fatal_source_error_is_ignored() {
    let source = ManualSource::new("ranging", true);
    let mut d = create_test_dispatcher(vec![source.clone()]);
    d.start();
    d.pump_control();

    source.handle().failed(ErrorKind::NetworkUnavailable, "flaky");
    d.pump_control();
    assert_eq!(d.state(), &LifecycleState::Running);
}

#[test]
fn test_restart_after_failure() {
    let source = ManualSource::new("ranging", true);
    let mut d = create_test_dispatcher(vec![source.clone()]);
    d.start();
    d.pump_control();
    source.handle().failed(ErrorKind::HardwareUnavailable, "radio off");
    d.pump_control();
    assert!(d.resume().is_err());

    assert!(d.start().changed());
    d.pump_control();
    assert_eq!(d.state(), &LifecycleState::Running);
    assert_eq!(source.starts.load(Ordering::SeqCst), 2);
}

// ============================================================================
// Run loop
// ============================================================================

#[tokio::test]
async fn test_run_loop_processes_sightings_and_shuts_down() {
    let source = ManualSource::new("ranging", true);
    let d = create_test_dispatcher(vec![source.clone()]);
    let TestDispatcher { dispatcher, handle, mut notifications } = d;
    let task = tokio::spawn(dispatcher.run());

    let (tx, rx) = oneshot::channel();
    handle.control_tx.send(Control::Start { reply: tx }).unwrap();
    assert!(rx.await.unwrap().changed());

    let mut state_rx = handle.state_rx.clone();
    state_rx.wait_for(|s| *s == LifecycleState::Running).await.unwrap();

    source.handle().region_enter(beacon());
    let note = tokio::time::timeout(Duration::from_secs(1), notifications.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(note, Notification::Appeared(_)));

    handle.control_tx.send(Control::Shutdown).unwrap();
    tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    assert!(source.stops.load(Ordering::SeqCst) >= 1);
}
