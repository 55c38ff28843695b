//! Engagement event queue and delivery worker
//!
//! Events are persisted on enqueue and removed from durable storage once
//! Delivered or DeadLettered. Each event carries its own retry state
//! (`attempts`, next eligible instant); a single worker loop scans for due
//! events, so there are no per-event timers.
//!
//! Ordering: an event is never attempted while an earlier event with the
//! same (advertisement, beacon) key is still queued. Unrelated events pass
//! a failing one freely.

use crate::domain::engagement::{DeliveryStatus, EngagementEvent, StatusTransitionError};
use crate::domain::types::BeaconIdentity;
use crate::infra::config::Config;
use crate::infra::error::{DeliveryError, EngageError, Result};
use crate::infra::metrics::Metrics;
use crate::io::backend::EngagementSink;
use crate::io::store::KeyValueStore;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Persisted key of the pending queue (JSON array, FIFO order)
pub const PENDING_KEY: &str = "engagement.pending";
/// Persisted key of retained dead letters (JSON array, oldest first)
pub const DEAD_LETTERS_KEY: &str = "engagement.dead_letters";

/// Exponential backoff with a cap and an attempt limit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            base: config.base_backoff(),
            max: config.max_backoff(),
            max_attempts: config.max_attempts(),
        }
    }

    /// Delay after the given number of failed attempts: base * 2^(n-1), capped
    pub fn backoff(&self, attempts: u32) -> Duration {
        let factor = 1u32.checked_shl(attempts.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

/// What happened to an event after one attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Delivered,
    Retry { delay: Duration },
    DeadLettered,
}

#[derive(Debug, Clone)]
struct QueuedEvent {
    event: EngagementEvent,
    next_attempt_at: Instant,
}

fn illegal(e: StatusTransitionError) -> EngageError {
    EngageError::InvalidState { state: e.from.as_str() }
}

/// Durable FIFO of engagement events with per-event retry state
pub struct EngagementQueue {
    store: Arc<dyn KeyValueStore>,
    policy: RetryPolicy,
    pending: VecDeque<QueuedEvent>,
    dead_letters: VecDeque<EngagementEvent>,
    retention: usize,
}

impl EngagementQueue {
    /// Reload persisted state. Attempts interrupted by a restart go back to
    /// Pending with their attempt count kept; everything is due at `now`.
    pub fn load(
        store: Arc<dyn KeyValueStore>,
        policy: RetryPolicy,
        retention: usize,
        now: Instant,
    ) -> Result<Self> {
        let mut recovered = 0usize;
        let pending: VecDeque<QueuedEvent> = read_events(store.as_ref(), PENDING_KEY)?
            .into_iter()
            .map(|mut event| {
                if event.status() == DeliveryStatus::InFlight {
                    recovered += 1;
                }
                event.recover_interrupted();
                QueuedEvent { event, next_attempt_at: now }
            })
            .collect();
        let dead_letters: VecDeque<EngagementEvent> =
            read_events(store.as_ref(), DEAD_LETTERS_KEY)?.into_iter().collect();

        let queue = Self { store, policy, pending, dead_letters, retention };
        if recovered > 0 {
            queue.persist_pending()?;
        }
        info!(
            pending = %queue.pending.len(),
            dead_letters = %queue.dead_letters.len(),
            recovered_in_flight = %recovered,
            "engagement_queue_loaded"
        );
        Ok(queue)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Append a Pending event and persist before returning
    pub fn enqueue(&mut self, event: EngagementEvent, now: Instant) -> Result<()> {
        if event.status() != DeliveryStatus::Pending {
            return Err(EngageError::InvalidState { state: event.status().as_str() });
        }
        debug!(event_id = %event.id, kind = %event.kind.as_str(), "engagement_enqueued");
        self.pending.push_back(QueuedEvent { event, next_attempt_at: now });
        self.persist_pending()
    }

    /// Index of the first event eligible for dispatch, and the earliest
    /// instant any unblocked event becomes eligible
    fn scan(&self, now: Instant) -> (Option<usize>, Option<Instant>) {
        let mut blocked: Vec<(&str, &BeaconIdentity)> = Vec::new();
        let mut wakeup: Option<Instant> = None;

        for (index, queued) in self.pending.iter().enumerate() {
            let key = queued.event.ordering_key();
            if blocked.contains(&key) {
                continue;
            }
            if queued.event.status() == DeliveryStatus::Pending && queued.next_attempt_at <= now {
                return (Some(index), Some(queued.next_attempt_at));
            }
            if queued.event.status() == DeliveryStatus::Pending {
                wakeup = Some(wakeup.map_or(queued.next_attempt_at, |w| w.min(queued.next_attempt_at)));
            }
            blocked.push(key);
        }
        (None, wakeup)
    }

    /// Take the next due event, marking it InFlight.
    ///
    /// A failed write of the InFlight marker is logged and the event is
    /// still handed out: `complete` persists the outcome, and a store that
    /// still says Pending only means a retry after a crash.
    pub fn next_due(&mut self, now: Instant) -> Result<Option<EngagementEvent>> {
        let (Some(index), _) = self.scan(now) else {
            return Ok(None);
        };
        let queued = &mut self.pending[index];
        queued.event.advance(DeliveryStatus::InFlight).map_err(illegal)?;
        let event = queued.event.clone();
        if let Err(e) = self.persist_pending() {
            warn!(event_id = %event.id, error = %e, "engagement_in_flight_persist_failed");
        }
        Ok(Some(event))
    }

    /// Earliest instant an unblocked event becomes due
    pub fn next_wakeup(&self, now: Instant) -> Option<Instant> {
        self.scan(now).1
    }

    /// Record the result of an attempt on an InFlight event
    pub fn complete(
        &mut self,
        event_id: &str,
        result: std::result::Result<(), DeliveryError>,
        now: Instant,
    ) -> Result<Option<AttemptOutcome>> {
        let Some(index) = self.pending.iter().position(|q| q.event.id == event_id) else {
            return Ok(None);
        };

        let outcome = match result {
            Ok(()) => {
                if let Some(mut queued) = self.pending.remove(index) {
                    queued.event.advance(DeliveryStatus::Delivered).map_err(illegal)?;
                }
                AttemptOutcome::Delivered
            }
            Err(_) => {
                let queued = &mut self.pending[index];
                queued.event.attempts += 1;
                if queued.event.attempts >= self.policy.max_attempts {
                    queued.event.advance(DeliveryStatus::DeadLettered).map_err(illegal)?;
                    if let Some(queued) = self.pending.remove(index) {
                        self.dead_letters.push_back(queued.event);
                    }
                    while self.dead_letters.len() > self.retention {
                        self.dead_letters.pop_front();
                    }
                    self.persist_dead_letters()?;
                    AttemptOutcome::DeadLettered
                } else {
                    queued.event.advance(DeliveryStatus::Pending).map_err(illegal)?;
                    let delay = self.policy.backoff(queued.event.attempts);
                    queued.next_attempt_at = now + delay;
                    AttemptOutcome::Retry { delay }
                }
            }
        };

        self.persist_pending()?;
        Ok(Some(outcome))
    }

    pub fn pending_events(&self) -> Vec<EngagementEvent> {
        self.pending.iter().map(|q| q.event.clone()).collect()
    }

    pub fn dead_letters(&self) -> Vec<EngagementEvent> {
        self.dead_letters.iter().cloned().collect()
    }

    fn persist_pending(&self) -> Result<()> {
        if self.pending.is_empty() {
            return self.store.delete(PENDING_KEY);
        }
        let events: Vec<&EngagementEvent> = self.pending.iter().map(|q| &q.event).collect();
        self.store.put(PENDING_KEY, &serde_json::to_vec(&events)?)
    }

    fn persist_dead_letters(&self) -> Result<()> {
        if self.dead_letters.is_empty() {
            return self.store.delete(DEAD_LETTERS_KEY);
        }
        self.store.put(DEAD_LETTERS_KEY, &serde_json::to_vec(&self.dead_letters)?)
    }
}

fn read_events(store: &dyn KeyValueStore, key: &str) -> Result<Vec<EngagementEvent>> {
    match store.get(key)? {
        Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
        None => Ok(Vec::new()),
    }
}

/// Requests to the delivery worker
#[derive(Debug)]
pub enum QueueCommand {
    Enqueue(EngagementEvent),
    Pending(oneshot::Sender<Vec<EngagementEvent>>),
    DeadLetters(oneshot::Sender<Vec<EngagementEvent>>),
    Shutdown,
}

/// Worker owning the queue; delivers one event at a time
pub struct DeliveryWorker {
    queue: EngagementQueue,
    sink: Arc<dyn EngagementSink>,
    cmd_rx: mpsc::UnboundedReceiver<QueueCommand>,
    attempt_timeout: Duration,
    poll_interval: Duration,
    sdk_version: String,
    metrics: Arc<Metrics>,
}

impl DeliveryWorker {
    /// Run until Shutdown or until every sender is gone
    pub async fn run(mut self) {
        info!(pending = %self.queue.len(), "delivery_worker_started");
        self.metrics.set_queue_depth(self.queue.len() as u64);

        'outer: loop {
            while let Ok(cmd) = self.cmd_rx.try_recv() {
                if !self.handle_command(cmd) {
                    break 'outer;
                }
            }

            let now = Instant::now();
            match self.queue.next_due(now) {
                Ok(Some(event)) => {
                    if !self.attempt(event).await {
                        break;
                    }
                    continue;
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "engagement_queue_persist_failed"),
            }

            let poll_deadline = now + self.poll_interval;
            let wake = self.queue.next_wakeup(now).map_or(poll_deadline, |w| w.min(poll_deadline));

            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => {
                            if !self.handle_command(cmd) {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = tokio::time::sleep_until(wake.into()) => {}
            }
        }

        info!(pending = %self.queue.len(), "delivery_worker_stopped");
    }

    /// Returns false on shutdown
    fn handle_command(&mut self, cmd: QueueCommand) -> bool {
        match cmd {
            QueueCommand::Enqueue(event) => {
                let event_id = event.id.clone();
                if let Err(e) = self.queue.enqueue(event, Instant::now()) {
                    warn!(event_id = %event_id, error = %e, "engagement_persist_failed");
                }
                self.metrics.set_queue_depth(self.queue.len() as u64);
            }
            QueueCommand::Pending(reply) => {
                let _ = reply.send(self.queue.pending_events());
            }
            QueueCommand::DeadLetters(reply) => {
                let _ = reply.send(self.queue.dead_letters());
            }
            QueueCommand::Shutdown => return false,
        }
        true
    }

    /// One delivery attempt, run to completion or timeout. Commands keep
    /// being served meanwhile, so marks made during a slow attempt are
    /// persisted at once. Returns false if shutdown was requested; the
    /// attempt still finishes first.
    async fn attempt(&mut self, event: EngagementEvent) -> bool {
        let payload = event.payload(&self.sdk_version);
        let sink = self.sink.clone();
        let attempt_timeout = self.attempt_timeout;
        let send_start = Instant::now();

        let delivery = async {
            match tokio::time::timeout(attempt_timeout, sink.deliver(&event.api_key, &payload)).await {
                Ok(result) => result,
                Err(_) => Err(DeliveryError::Timeout),
            }
        };
        tokio::pin!(delivery);

        let mut keep_running = true;
        let result = loop {
            tokio::select! {
                result = &mut delivery => break result,
                cmd = self.cmd_rx.recv(), if keep_running => {
                    match cmd {
                        Some(cmd) => keep_running = self.handle_command(cmd),
                        None => keep_running = false,
                    }
                }
            }
        };
        let latency_ms = send_start.elapsed().as_millis() as u64;

        if let Err(e) = &result {
            self.metrics.record_delivery_failed();
            if self.metrics.debug_mode() {
                info!(event_id = %event.id, attempt = %payload.attempt, error = %e, latency_ms = %latency_ms, "delivery_failed");
            } else {
                debug!(event_id = %event.id, attempt = %payload.attempt, error = %e, latency_ms = %latency_ms, "delivery_failed");
            }
        }

        match self.queue.complete(&event.id, result, Instant::now()) {
            Ok(Some(AttemptOutcome::Delivered)) => {
                self.metrics.record_delivery_succeeded();
                info!(
                    event_id = %event.id,
                    kind = %event.kind.as_str(),
                    attempt = %payload.attempt,
                    latency_ms = %latency_ms,
                    "engagement_delivered"
                );
            }
            Ok(Some(AttemptOutcome::Retry { delay })) => {
                debug!(event_id = %event.id, delay_ms = %delay.as_millis(), "delivery_retry_scheduled");
            }
            Ok(Some(AttemptOutcome::DeadLettered)) => {
                self.metrics.record_dead_lettered();
                let err = EngageError::DeliveryExhausted {
                    event_id: event.id.clone(),
                    attempts: payload.attempt,
                };
                warn!(event_id = %event.id, error = %err, "engagement_dead_lettered");
            }
            Ok(None) => {
                warn!(event_id = %event.id, "delivery_completed_unknown_event");
            }
            Err(e) => {
                warn!(event_id = %event.id, error = %e, "engagement_queue_persist_failed");
            }
        }
        self.metrics.set_queue_depth(self.queue.len() as u64);
        keep_running
    }
}

/// Facade-side sender to the delivery worker
#[derive(Clone)]
pub struct QueueHandle {
    tx: mpsc::UnboundedSender<QueueCommand>,
}

impl QueueHandle {
    /// Hand an event to the worker. Never fails; after shutdown the event is
    /// logged and dropped.
    pub fn enqueue(&self, event: EngagementEvent) {
        if let Err(mpsc::error::SendError(QueueCommand::Enqueue(event))) =
            self.tx.send(QueueCommand::Enqueue(event))
        {
            warn!(event_id = %event.id, "engagement_dropped_after_shutdown");
        }
    }

    pub async fn pending(&self) -> Result<Vec<EngagementEvent>> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(QueueCommand::Pending(tx)).map_err(|_| EngageError::ShutDown)?;
        rx.await.map_err(|_| EngageError::ShutDown)
    }

    pub async fn dead_letters(&self) -> Result<Vec<EngagementEvent>> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(QueueCommand::DeadLetters(tx)).map_err(|_| EngageError::ShutDown)?;
        rx.await.map_err(|_| EngageError::ShutDown)
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(QueueCommand::Shutdown);
    }
}

/// Create the worker and the handle used to feed it
pub fn create_delivery_worker(
    queue: EngagementQueue,
    sink: Arc<dyn EngagementSink>,
    config: &Config,
    sdk_version: &str,
    metrics: Arc<Metrics>,
) -> (QueueHandle, DeliveryWorker) {
    let (tx, cmd_rx) = mpsc::unbounded_channel();
    let worker = DeliveryWorker {
        queue,
        sink,
        cmd_rx,
        attempt_timeout: config.attempt_timeout(),
        poll_interval: config.delivery_poll_interval(),
        sdk_version: sdk_version.to_string(),
        metrics,
    };
    (QueueHandle { tx }, worker)
}
