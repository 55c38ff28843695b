//! Bounded sighting inbox shared by all sensor sources
//!
//! When full, the oldest ranging sample is evicted first; region events are
//! only evicted when no ranging sample is queued. Lifecycle and hardware
//! signals never pass through here.

use crate::domain::types::{BeaconIdentity, BeaconObservation, Proximity};
use crate::infra::metrics::Metrics;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Notify;
use tracing::warn;

/// Raw sighting as posted by a source
#[derive(Debug, Clone, PartialEq)]
pub enum Sighting {
    RegionEnter { identity: BeaconIdentity, at: Instant },
    RegionExit { identity: BeaconIdentity, at: Instant },
    Ranged { identity: BeaconIdentity, rssi: i16, proximity: Proximity, at: Instant },
}

impl Sighting {
    pub fn identity(&self) -> &BeaconIdentity {
        match self {
            Sighting::RegionEnter { identity, .. }
            | Sighting::RegionExit { identity, .. }
            | Sighting::Ranged { identity, .. } => identity,
        }
    }

    /// Ranging samples are periodic and replaceable; region events are not
    #[inline]
    fn is_low_value(&self) -> bool {
        matches!(self, Sighting::Ranged { .. })
    }

    /// Observation for the registry; exits have none
    pub fn into_observation(self) -> Option<BeaconObservation> {
        match self {
            Sighting::RegionEnter { identity, at } => Some(BeaconObservation::region(identity, at)),
            Sighting::RegionExit { .. } => None,
            Sighting::Ranged { identity, rssi, proximity, at } => {
                Some(BeaconObservation::ranging(identity, rssi, proximity, at))
            }
        }
    }
}

pub struct SightingInbox {
    queue: Mutex<VecDeque<Sighting>>,
    capacity: usize,
    notify: Notify,
    metrics: Arc<Metrics>,
}

impl SightingInbox {
    pub fn new(capacity: usize, metrics: Arc<Metrics>) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            notify: Notify::new(),
            metrics,
        }
    }

    /// Enqueue from any thread, evicting per the overflow policy
    pub fn push(&self, sighting: Sighting) {
        self.metrics.record_sighting_received();
        {
            let mut queue = self.queue.lock();
            if queue.len() >= self.capacity {
                let victim = queue.iter().position(Sighting::is_low_value).unwrap_or(0);
                if let Some(dropped) = queue.remove(victim) {
                    self.metrics.record_sighting_dropped();
                    warn!(beacon = %dropped.identity(), capacity = %self.capacity, "sighting_inbox_full");
                }
            }
            queue.push_back(sighting);
        }
        self.notify.notify_one();
    }

    pub fn pop(&self) -> Option<Sighting> {
        self.queue.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn clear(&self) -> usize {
        let mut queue = self.queue.lock();
        let n = queue.len();
        queue.clear();
        n
    }

    /// Resolve once at least one sighting is queued
    pub async fn wait(&self) {
        if !self.is_empty() {
            return;
        }
        // A push between the check and here leaves a stored permit
        self.notify.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(minor: u16) -> BeaconIdentity {
        BeaconIdentity::new("U", 1, minor)
    }

    fn ranged(minor: u16) -> Sighting {
        Sighting::Ranged { identity: id(minor), rssi: -60, proximity: Proximity::Near, at: Instant::now() }
    }

    fn enter(minor: u16) -> Sighting {
        Sighting::RegionEnter { identity: id(minor), at: Instant::now() }
    }

    #[test]
    fn test_fifo_order() {
        let inbox = SightingInbox::new(8, Arc::new(Metrics::new()));
        inbox.push(enter(1));
        inbox.push(ranged(2));
        assert_eq!(inbox.pop().unwrap().identity(), &id(1));
        assert_eq!(inbox.pop().unwrap().identity(), &id(2));
        assert!(inbox.pop().is_none());
    }

    #[test]
    fn test_overflow_evicts_oldest_ranging_first() {
        let metrics = Arc::new(Metrics::new());
        let inbox = SightingInbox::new(3, metrics.clone());
        inbox.push(enter(1));
        inbox.push(ranged(2));
        inbox.push(ranged(3));
        inbox.push(enter(4));

        assert_eq!(inbox.len(), 3);
        assert_eq!(metrics.sightings_dropped(), 1);
        let order: Vec<_> = std::iter::from_fn(|| inbox.pop()).map(|s| s.identity().minor()).collect();
        assert_eq!(order, vec![1, 3, 4]);
    }

    #[test]
    fn test_overflow_without_ranging_evicts_oldest() {
        let inbox = SightingInbox::new(2, Arc::new(Metrics::new()));
        inbox.push(enter(1));
        inbox.push(enter(2));
        inbox.push(enter(3));
        let order: Vec<_> = std::iter::from_fn(|| inbox.pop()).map(|s| s.identity().minor()).collect();
        assert_eq!(order, vec![2, 3]);
    }

    #[test]
    fn test_exit_has_no_observation() {
        let exit = Sighting::RegionExit { identity: id(1), at: Instant::now() };
        assert!(exit.into_observation().is_none());
        assert!(enter(1).into_observation().is_some());
    }

    #[tokio::test]
    async fn test_wait_wakes_on_push() {
        let inbox = Arc::new(SightingInbox::new(4, Arc::new(Metrics::new())));
        let waiter = {
            let inbox = inbox.clone();
            tokio::spawn(async move { inbox.wait().await })
        };
        tokio::task::yield_now().await;
        inbox.push(enter(1));
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter).await.unwrap().unwrap();
    }
}
