//! Manager facade - the public entry point of the engine
//!
//! `EngageManager` is a cheap clone handle over the running tasks
//! (dispatcher, delivery worker, notifier). It is the only caller of
//! lifecycle transitions and queue enqueue. One instance per process is
//! enforced with [`ManagerSlot`], an explicitly owned guard rather than a
//! hidden global.

use crate::domain::engagement::{Advertisement, EngagementEvent, EngagementKind};
use crate::domain::types::LifecycleState;
use crate::infra::config::Config;
use crate::infra::error::{EngageError, Result};
use crate::infra::metrics::Metrics;
use crate::io::backend::{EngagementSink, HttpSink};
use crate::io::sources::SensorSource;
use crate::io::store::{load_or_create_device_id, FileStore, KeyValueStore};
use crate::services::delivery::{create_delivery_worker, EngagementQueue, QueueHandle, RetryPolicy};
use crate::services::dispatcher::{create_dispatcher, Control, DispatcherHandle};
use crate::services::notifier::{create_notifier, DelegateSlot, EngageObserver};
use crate::services::registry::DetectedBeacons;
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Package version with the build's git short hash
pub const SDK_VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "+", env!("GIT_HASH"));

/// Collects collaborators, then spawns the engine tasks
pub struct ManagerBuilder {
    config: Config,
    store: Option<Arc<dyn KeyValueStore>>,
    sink: Option<Arc<dyn EngagementSink>>,
    sources: Vec<Arc<dyn SensorSource>>,
    metrics: Option<Arc<Metrics>>,
}

impl ManagerBuilder {
    pub fn new(config: Config) -> Self {
        Self { config, store: None, sink: None, sources: Vec::new(), metrics: None }
    }

    /// Durable store; defaults to a `FileStore` under `storage.dir`
    pub fn store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Backend sink; defaults to `HttpSink` against `backend.url`
    pub fn sink(mut self, sink: Arc<dyn EngagementSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn source(mut self, source: Arc<dyn SensorSource>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Load persisted state and spawn the engine. Must run inside a Tokio runtime.
    pub fn build(self) -> Result<EngageManager> {
        let config = self.config;
        let metrics = self.metrics.unwrap_or_default();

        let store: Arc<dyn KeyValueStore> = match self.store {
            Some(store) => store,
            None => Arc::new(FileStore::open(config.storage_dir())?),
        };
        let sink: Arc<dyn EngagementSink> = match self.sink {
            Some(sink) => sink,
            None => Arc::new(
                HttpSink::new(&config).map_err(|e| EngageError::NetworkUnavailable(e.to_string()))?,
            ),
        };

        let device_id = load_or_create_device_id(store.as_ref())?;
        let queue = EngagementQueue::load(
            store,
            RetryPolicy::from_config(&config),
            config.dead_letter_retention(),
            Instant::now(),
        )?;

        let (notifier_handle, notifier, delegate) =
            create_notifier(config.notifier_capacity(), metrics.clone());
        let (dispatcher, dispatcher_handle) =
            create_dispatcher(&config, self.sources, notifier_handle, metrics.clone());
        let (queue_handle, worker) =
            create_delivery_worker(queue, sink, &config, SDK_VERSION, metrics.clone());

        let tasks = vec![
            tokio::spawn(dispatcher.run()),
            tokio::spawn(worker.run()),
            tokio::spawn(notifier.run()),
        ];

        let reporter = match config.metrics_interval_secs() {
            0 => None,
            secs => {
                let metrics = metrics.clone();
                Some(tokio::spawn(async move {
                    let mut interval = tokio::time::interval(std::time::Duration::from_secs(secs));
                    interval.tick().await;
                    loop {
                        interval.tick().await;
                        metrics.report().log();
                    }
                }))
            }
        };

        info!(
            device_id = %device_id,
            sdk_version = %SDK_VERSION,
            config_file = %config.config_file(),
            "engage_manager_built"
        );

        Ok(EngageManager {
            inner: Arc::new(Inner {
                dispatcher: dispatcher_handle,
                queue: queue_handle,
                delegate,
                device_id,
                api_key: RwLock::new(None),
                user_id: RwLock::new(None),
                metrics,
                tasks: Mutex::new(tasks),
                reporter: Mutex::new(reporter),
            }),
        })
    }
}

struct Inner {
    dispatcher: DispatcherHandle,
    queue: QueueHandle,
    delegate: DelegateSlot,
    device_id: String,
    api_key: RwLock<Option<String>>,
    user_id: RwLock<Option<String>>,
    metrics: Arc<Metrics>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    reporter: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn stop(&self) {
        let _ = self.dispatcher.control_tx.send(Control::Shutdown);
        self.queue.shutdown();
        if let Some(reporter) = self.reporter.lock().take() {
            reporter.abort();
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Handle to the engine
#[derive(Clone)]
pub struct EngageManager {
    inner: Arc<Inner>,
}

impl EngageManager {
    pub fn builder(config: Config) -> ManagerBuilder {
        ManagerBuilder::new(config)
    }

    /// Begin Starting. A repeat start while Starting/Running/Paused is a
    /// no-op and keeps the original API key.
    pub async fn start(&self, api_key: &str) -> Result<EngageManager> {
        let (reply, rx) = oneshot::channel();
        self.send(Control::Start { reply })?;
        let transition = rx.await.map_err(|_| EngageError::ShutDown)?;

        if transition.changed() {
            *self.inner.api_key.write() = Some(api_key.to_string());
            info!(device_id = %self.inner.device_id, "engage_manager_started");
        } else {
            debug!(state = %self.state().as_str(), "duplicate_start_ignored");
        }
        Ok(self.clone())
    }

    /// Attach an application-chosen identifier to future engagement events
    pub fn set_user_identifier(&self, user_id: Option<&str>) {
        *self.inner.user_id.write() = user_id.map(str::to_string);
    }

    /// Suspend sources. Returns once the dispatcher has applied the pause,
    /// so no sighting is processed after this resolves.
    pub async fn pause(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Control::Pause { reply })?;
        rx.await.map_err(|_| EngageError::ShutDown)?.map(|_| ())
    }

    /// False when there is no paused or running session to resume
    pub async fn resume(&self) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.send(Control::Resume { reply }).is_err() {
            return false;
        }
        match rx.await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                warn!(error = %e, "resume_rejected");
                false
            }
            Err(_) => false,
        }
    }

    pub fn mark_advertisement_opened(&self, advertisement: &Advertisement) {
        self.mark(EngagementKind::Opened, advertisement);
    }

    pub fn mark_advertisement_claimed(&self, advertisement: &Advertisement) {
        self.mark(EngagementKind::Claimed, advertisement);
    }

    /// Never fails toward the caller; delivery problems stay in the queue
    fn mark(&self, kind: EngagementKind, advertisement: &Advertisement) {
        let Some(api_key) = self.inner.api_key.read().clone() else {
            warn!(
                advertisement_id = %advertisement.id,
                kind = %kind.as_str(),
                "engagement_dropped_not_started"
            );
            return;
        };
        let event = EngagementEvent::new(
            kind,
            advertisement,
            &self.inner.device_id,
            self.inner.user_id.read().clone(),
            &api_key,
        );
        info!(
            event_id = %event.id,
            kind = %kind.as_str(),
            advertisement_id = %advertisement.id,
            beacon = %advertisement.beacon,
            "engagement_marked"
        );
        self.inner.queue.enqueue(event);
    }

    /// Verbose diagnostics only; no effect on behavior
    pub fn set_debug_mode(&self, enabled: bool) {
        self.inner.metrics.set_debug_mode(enabled);
        info!(enabled = %enabled, "debug_mode_set");
    }

    pub fn device_id(&self) -> &str {
        &self.inner.device_id
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.dispatcher.state_rx.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<LifecycleState> {
        self.inner.dispatcher.state_rx.clone()
    }

    /// Snapshot of detected beacons keyed by identity string
    pub fn detected_beacons(&self) -> Arc<DetectedBeacons> {
        self.inner.dispatcher.beacons_rx.borrow().clone()
    }

    pub fn sdk_version(&self) -> &'static str {
        SDK_VERSION
    }

    pub fn api_key(&self) -> Option<String> {
        self.inner.api_key.read().clone()
    }

    /// Held weakly; dropping the observer silently detaches it
    pub fn set_delegate(&self, observer: Weak<dyn EngageObserver>) {
        self.inner.delegate.set(observer);
    }

    pub fn clear_delegate(&self) {
        self.inner.delegate.clear();
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.inner.metrics.clone()
    }

    /// Diagnostic snapshot of events awaiting delivery
    pub async fn pending_events(&self) -> Result<Vec<EngagementEvent>> {
        self.inner.queue.pending().await
    }

    /// Diagnostic snapshot of retained dead letters
    pub async fn dead_letters(&self) -> Result<Vec<EngagementEvent>> {
        self.inner.queue.dead_letters().await
    }

    /// Stop sources and every engine task, waiting for them to finish
    pub async fn shutdown(&self) {
        self.inner.stop();
        let tasks: Vec<JoinHandle<()>> = self.inner.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "engine_task_join_failed");
            }
        }
        info!("engage_manager_shutdown");
    }

    /// Whether both handles refer to the same engine
    pub fn same_instance(&self, other: &EngageManager) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn send(&self, control: Control) -> Result<()> {
        self.inner.dispatcher.control_tx.send(control).map_err(|_| EngageError::ShutDown)
    }
}

/// Process-owned guard: the first initialization wins, later ones get the
/// existing handle back
#[derive(Default)]
pub struct ManagerSlot {
    manager: Mutex<Option<EngageManager>>,
}

impl ManagerSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `builder` unless a manager already exists
    pub fn get_or_init(&self, builder: ManagerBuilder) -> Result<EngageManager> {
        let mut slot = self.manager.lock();
        if let Some(existing) = slot.as_ref() {
            debug!("manager_already_constructed");
            return Ok(existing.clone());
        }
        let manager = builder.build()?;
        *slot = Some(manager.clone());
        Ok(manager)
    }

    pub fn get(&self) -> Option<EngageManager> {
        self.manager.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::BeaconIdentity;
    use crate::io::store::MemoryStore;

    fn builder(store: Arc<MemoryStore>) -> ManagerBuilder {
        ManagerBuilder::new(Config::default())
            .store(store)
            .sink(Arc::new(HttpSink::new(&Config::default().with_backend_url("http://127.0.0.1:9")).unwrap()))
    }

    #[tokio::test]
    async fn test_slot_returns_existing_instance() {
        let slot = ManagerSlot::new();
        assert!(slot.get().is_none());

        let store = Arc::new(MemoryStore::new());
        let first = slot.get_or_init(builder(store.clone())).unwrap();
        let second = slot.get_or_init(builder(Arc::new(MemoryStore::new()))).unwrap();
        assert!(first.same_instance(&second));
        assert_eq!(first.device_id(), second.device_id());

        first.shutdown().await;
    }

    #[tokio::test]
    async fn test_device_id_is_persisted_across_builds() {
        let store = Arc::new(MemoryStore::new());
        let first = builder(store.clone()).build().unwrap();
        let device_id = first.device_id().to_string();
        first.shutdown().await;

        let second = builder(store).build().unwrap();
        assert_eq!(second.device_id(), device_id);
        second.shutdown().await;
    }

    #[tokio::test]
    async fn test_mark_before_start_is_dropped() {
        let manager = builder(Arc::new(MemoryStore::new())).build().unwrap();
        let ad = Advertisement::new("ad1", BeaconIdentity::new("U", 1, 1));
        manager.mark_advertisement_opened(&ad);
        assert!(manager.pending_events().await.unwrap().is_empty());
        assert_eq!(manager.api_key(), None);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_keeps_first_api_key() {
        let manager = builder(Arc::new(MemoryStore::new())).build().unwrap();
        let handle = manager.start("key1").await.unwrap();
        assert!(handle.same_instance(&manager));
        manager.start("key2").await.unwrap();
        assert_eq!(manager.api_key().as_deref(), Some("key1"));
        assert_eq!(manager.state(), LifecycleState::Running);
        manager.shutdown().await;
    }

    #[test]
    fn test_sdk_version_carries_build_hash() {
        assert!(SDK_VERSION.starts_with(env!("CARGO_PKG_VERSION")));
        assert!(SDK_VERSION.contains('+'));
    }
}
