//! Delegate notifier - delivers observer callbacks off the dispatcher
//!
//! The dispatcher never waits on the observer. Notifications travel in order
//! on one channel whose depth is tracked; once `capacity` are queued, further
//! `Updated` notifications are dropped (and counted). Appeared, Disappeared
//! and Failure are always queued, so every appearance gets its disappearance
//! and fatal failures always reach the observer.
//! The observer is held weakly: its lifetime belongs to the host application.

use crate::domain::types::{BeaconIdentity, BeaconState, ErrorKind};
use crate::infra::metrics::Metrics;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// External observer contract. All methods default to no-ops.
pub trait EngageObserver: Send + Sync {
    fn on_beacon_appeared(&self, _beacon: &BeaconState) {}
    fn on_beacon_updated(&self, _beacon: &BeaconState) {}
    fn on_beacon_disappeared(&self, _identity: &BeaconIdentity) {}
    fn on_failure(&self, _kind: ErrorKind, _detail: &str) {}
}

#[derive(Debug, Clone)]
pub enum Notification {
    Appeared(BeaconState),
    Updated(BeaconState),
    Disappeared(BeaconIdentity),
    Failure { kind: ErrorKind, detail: String },
}

impl Notification {
    fn as_str(&self) -> &'static str {
        match self {
            Notification::Appeared(_) => "appeared",
            Notification::Updated(_) => "updated",
            Notification::Disappeared(_) => "disappeared",
            Notification::Failure { .. } => "failure",
        }
    }
}

/// Weak reference to the host's observer, replaceable at any time
#[derive(Clone, Default)]
pub struct DelegateSlot {
    inner: Arc<RwLock<Option<Weak<dyn EngageObserver>>>>,
}

impl DelegateSlot {
    pub fn set(&self, observer: Weak<dyn EngageObserver>) {
        *self.inner.write() = Some(observer);
    }

    pub fn clear(&self) {
        *self.inner.write() = None;
    }

    /// Live observer, if one is set and still alive
    pub fn get(&self) -> Option<Arc<dyn EngageObserver>> {
        self.inner.read().as_ref().and_then(Weak::upgrade)
    }
}

/// Dispatcher-side sender
#[derive(Clone)]
pub struct NotifierHandle {
    tx: mpsc::UnboundedSender<Notification>,
    depth: Arc<AtomicUsize>,
    capacity: usize,
    metrics: Arc<Metrics>,
}

impl NotifierHandle {
    pub fn notify(&self, notification: Notification) {
        let droppable = matches!(notification, Notification::Updated(_));
        if droppable && self.depth.load(Ordering::Acquire) >= self.capacity {
            self.metrics.record_notification_dropped();
            warn!(kind = %notification.as_str(), capacity = %self.capacity, "notification_dropped_observer_slow");
            return;
        }

        self.depth.fetch_add(1, Ordering::AcqRel);
        if self.tx.send(notification).is_err() {
            self.depth.fetch_sub(1, Ordering::AcqRel);
            debug!("notification_after_shutdown");
        }
    }
}

/// Receiving end; keeps the shared depth in step with what is queued
pub struct NotificationQueue {
    rx: mpsc::UnboundedReceiver<Notification>,
    depth: Arc<AtomicUsize>,
}

impl NotificationQueue {
    pub async fn recv(&mut self) -> Option<Notification> {
        let notification = self.rx.recv().await?;
        self.depth.fetch_sub(1, Ordering::AcqRel);
        Some(notification)
    }

    pub fn try_recv(&mut self) -> Option<Notification> {
        let notification = self.rx.try_recv().ok()?;
        self.depth.fetch_sub(1, Ordering::AcqRel);
        Some(notification)
    }

    /// Notifications queued and not yet received
    pub fn len(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn notification_channel(capacity: usize, metrics: Arc<Metrics>) -> (NotifierHandle, NotificationQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    let depth = Arc::new(AtomicUsize::new(0));
    let handle = NotifierHandle { tx, depth: depth.clone(), capacity: capacity.max(1), metrics };
    (handle, NotificationQueue { rx, depth })
}

/// Task that invokes the observer
pub struct Notifier {
    queue: NotificationQueue,
    delegate: DelegateSlot,
}

impl Notifier {
    pub async fn run(mut self) {
        info!("notifier_started");

        while let Some(notification) = self.queue.recv().await {
            // Resolved per notification so a replaced or dropped observer takes effect at once
            let Some(observer) = self.delegate.get() else {
                continue;
            };
            match notification {
                Notification::Appeared(state) => observer.on_beacon_appeared(&state),
                Notification::Updated(state) => observer.on_beacon_updated(&state),
                Notification::Disappeared(identity) => observer.on_beacon_disappeared(&identity),
                Notification::Failure { kind, detail } => observer.on_failure(kind, &detail),
            }
        }

        info!("notifier_stopped");
    }
}

/// Create the notifier channel, task, and observer slot
pub fn create_notifier(
    capacity: usize,
    metrics: Arc<Metrics>,
) -> (NotifierHandle, Notifier, DelegateSlot) {
    let (handle, queue) = notification_channel(capacity, metrics);
    let delegate = DelegateSlot::default();
    let notifier = Notifier { queue, delegate: delegate.clone() };
    (handle, notifier, delegate)
}

/// Handle whose notifications land on a plain queue, for inspecting
/// dispatcher output without an observer task
#[cfg(test)]
pub(crate) fn capture_channel(
    capacity: usize,
    metrics: Arc<Metrics>,
) -> (NotifierHandle, NotificationQueue) {
    notification_channel(capacity, metrics)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
    }

    impl EngageObserver for Recorder {
        fn on_beacon_appeared(&self, beacon: &BeaconState) {
            self.calls.lock().push(format!("appeared {}", beacon.identity));
        }
        fn on_beacon_disappeared(&self, identity: &BeaconIdentity) {
            self.calls.lock().push(format!("disappeared {identity}"));
        }
        fn on_failure(&self, kind: ErrorKind, _detail: &str) {
            self.calls.lock().push(format!("failure {kind}"));
        }
    }

    #[tokio::test]
    async fn test_notifications_reach_observer_in_order() {
        let (handle, notifier, delegate) = create_notifier(8, Arc::new(Metrics::new()));
        let recorder = Arc::new(Recorder::default());
        let observer: Arc<dyn EngageObserver> = recorder.clone();
        delegate.set(Arc::downgrade(&observer));
        let task = tokio::spawn(notifier.run());

        let id = BeaconIdentity::new("U", 1, 1);
        handle.notify(Notification::Appeared(BeaconState::new(id.clone(), Instant::now())));
        handle.notify(Notification::Disappeared(id));
        handle.notify(Notification::Failure {
            kind: ErrorKind::PermissionDenied,
            detail: "denied".into(),
        });
        drop(handle);
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();

        assert_eq!(
            *recorder.calls.lock(),
            vec!["appeared U-1-1", "disappeared U-1-1", "failure permission_denied"]
        );
    }

    fn state() -> BeaconState {
        BeaconState::new(BeaconIdentity::new("U", 1, 1), Instant::now())
    }

    #[test]
    fn test_full_channel_drops_updates_and_counts() {
        let metrics = Arc::new(Metrics::new());
        let (handle, mut queue) = capture_channel(1, metrics.clone());
        handle.notify(Notification::Updated(state()));
        handle.notify(Notification::Updated(state()));
        assert_eq!(metrics.notifications_dropped(), 1);
        assert_eq!(queue.len(), 1);

        // Room again once the observer catches up
        assert!(queue.try_recv().is_some());
        handle.notify(Notification::Updated(state()));
        assert_eq!(queue.len(), 1);
        assert_eq!(metrics.notifications_dropped(), 1);
    }

    #[test]
    fn test_full_channel_keeps_presence_and_failure() {
        let metrics = Arc::new(Metrics::new());
        let (handle, mut queue) = capture_channel(2, metrics.clone());
        let id = BeaconIdentity::new("U", 1, 1);

        handle.notify(Notification::Updated(state()));
        handle.notify(Notification::Updated(state()));
        handle.notify(Notification::Updated(state()));
        handle.notify(Notification::Disappeared(id.clone()));
        handle.notify(Notification::Appeared(state()));
        handle.notify(Notification::Failure {
            kind: ErrorKind::PermissionDenied,
            detail: "revoked".into(),
        });

        let kinds: Vec<&str> = std::iter::from_fn(|| queue.try_recv()).map(|n| n.as_str()).collect();
        assert_eq!(kinds, vec!["updated", "updated", "disappeared", "appeared", "failure"]);
        assert_eq!(metrics.notifications_dropped(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_notify_after_shutdown_leaves_depth_unchanged() {
        let (handle, queue) = capture_channel(4, Arc::new(Metrics::new()));
        let depth = queue.depth.clone();
        drop(queue);
        handle.notify(Notification::Disappeared(BeaconIdentity::new("U", 1, 1)));
        assert_eq!(depth.load(Ordering::Acquire), 0);
    }

    #[test]
    fn test_dropped_observer_is_not_upgraded() {
        let delegate = DelegateSlot::default();
        {
            let observer: Arc<dyn EngageObserver> = Arc::new(Recorder::default());
            delegate.set(Arc::downgrade(&observer));
            assert!(delegate.get().is_some());
        }
        assert!(delegate.get().is_none());
    }
}
