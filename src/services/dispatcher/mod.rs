//! Dispatcher - the single serialization point for engine state
//!
//! The Dispatcher owns the Lifecycle and the BeaconRegistry and is the only
//! task that mutates them. It merges three inputs into one sequence:
//! - Control messages (facade requests, source readiness and failures) on an
//!   unbounded channel that never drops
//! - Sightings from the bounded [`SightingInbox`], drained in batches
//! - Sweep ticks, armed only while Running
//!
//! Control is polled first, so a pause that arrives behind queued sightings
//! still takes effect before any of them reach the registry.

mod handlers;
mod inbox;
#[cfg(test)]
mod tests;

pub use inbox::{Sighting, SightingInbox};

use crate::domain::types::{ErrorKind, LifecycleState};
use crate::infra::config::Config;
use crate::infra::error::EngageError;
use crate::infra::metrics::Metrics;
use crate::io::sources::SensorSource;
use crate::services::lifecycle::{Lifecycle, Transition};
use crate::services::notifier::NotifierHandle;
use crate::services::registry::{BeaconRegistry, DetectedBeacons};
use smallvec::SmallVec;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::info;

/// Requests and hardware signals handled ahead of sightings
#[derive(Debug)]
pub enum Control {
    Start { reply: oneshot::Sender<Transition> },
    Pause { reply: oneshot::Sender<Result<Transition, EngageError>> },
    Resume { reply: oneshot::Sender<Result<Transition, EngageError>> },
    SourceReady { source: &'static str },
    SourceFailed { source: &'static str, kind: ErrorKind, detail: String },
    Shutdown,
}

/// Facade-side view of a running dispatcher
#[derive(Clone)]
pub struct DispatcherHandle {
    pub control_tx: mpsc::UnboundedSender<Control>,
    pub inbox: Arc<SightingInbox>,
    pub state_rx: watch::Receiver<LifecycleState>,
    pub beacons_rx: watch::Receiver<Arc<DetectedBeacons>>,
}

pub struct Dispatcher {
    pub(crate) lifecycle: Lifecycle,
    pub(crate) registry: BeaconRegistry,
    pub(crate) sources: Vec<Arc<dyn SensorSource>>,
    /// Sources that signalled ready since the last start
    pub(crate) ready: SmallVec<[&'static str; 4]>,
    pub(crate) inbox: Arc<SightingInbox>,
    pub(crate) control_tx: mpsc::UnboundedSender<Control>,
    control_rx: mpsc::UnboundedReceiver<Control>,
    pub(crate) notifier: NotifierHandle,
    state_tx: watch::Sender<LifecycleState>,
    beacons_tx: watch::Sender<Arc<DetectedBeacons>>,
    /// Registry changed since the last snapshot was published
    pub(crate) dirty: bool,
    sweep_interval: Duration,
    drain_batch: usize,
    pub(crate) metrics: Arc<Metrics>,
}

/// Create a dispatcher and the handle the facade talks to it through
pub fn create_dispatcher(
    config: &Config,
    sources: Vec<Arc<dyn SensorSource>>,
    notifier: NotifierHandle,
    metrics: Arc<Metrics>,
) -> (Dispatcher, DispatcherHandle) {
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let inbox = Arc::new(SightingInbox::new(config.inbox_capacity(), metrics.clone()));
    let (state_tx, state_rx) = watch::channel(LifecycleState::Idle);
    let (beacons_tx, beacons_rx) = watch::channel(Arc::new(DetectedBeacons::new()));

    let dispatcher = Dispatcher {
        lifecycle: Lifecycle::new(),
        registry: BeaconRegistry::new(config),
        sources,
        ready: SmallVec::new(),
        inbox: inbox.clone(),
        control_tx: control_tx.clone(),
        control_rx,
        notifier,
        state_tx,
        beacons_tx,
        dirty: false,
        sweep_interval: config.sweep_interval(),
        drain_batch: config.drain_batch(),
        metrics,
    };
    let handle = DispatcherHandle { control_tx, inbox, state_rx, beacons_rx };
    (dispatcher, handle)
}

impl Dispatcher {
    /// Run until a Shutdown control message arrives
    pub async fn run(mut self) {
        let inbox = self.inbox.clone();
        let mut sweep = interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            sources = %self.sources.len(),
            sweep_ms = %self.sweep_interval.as_millis(),
            "dispatcher_started"
        );

        loop {
            let running = self.lifecycle.accepts_sightings();
            tokio::select! {
                biased;

                control = self.control_rx.recv() => {
                    match control {
                        Some(control) => {
                            if !self.process_control(control) {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = inbox.wait() => {
                    self.drain_inbox();
                }
                _ = sweep.tick(), if running => {
                    self.process_sweep(Instant::now());
                }
            }
        }

        for source in &self.sources {
            source.stop();
        }
        info!("dispatcher_stopped");
    }

    /// Apply one control message. Returns false on shutdown.
    ///
    /// Replies are sent after the new state is published, so a caller that
    /// awaits the reply observes it.
    pub fn process_control(&mut self, control: Control) -> bool {
        let step_start = Instant::now();

        match control {
            Control::Start { reply } => {
                let transition = self.handle_start();
                self.publish();
                let _ = reply.send(transition);
            }
            Control::Pause { reply } => {
                let result = self.handle_pause();
                self.publish();
                let _ = reply.send(result);
            }
            Control::Resume { reply } => {
                let result = self.handle_resume(Instant::now());
                self.publish();
                let _ = reply.send(result);
            }
            Control::SourceReady { source } => {
                self.handle_source_ready(source);
                self.publish();
            }
            Control::SourceFailed { source, kind, detail } => {
                self.handle_source_failed(source, kind, &detail);
                self.publish();
            }
            Control::Shutdown => {
                info!(state = %self.lifecycle.state().as_str(), "dispatcher_shutdown_requested");
                return false;
            }
        }

        self.metrics.record_step(step_start.elapsed().as_micros() as u64);
        true
    }

    /// Drain up to one batch from the inbox
    pub fn drain_inbox(&mut self) {
        for _ in 0..self.drain_batch {
            let Some(sighting) = self.inbox.pop() else {
                break;
            };
            self.process_sighting(sighting);
        }
        self.publish();
    }

    pub fn process_sighting(&mut self, sighting: Sighting) {
        let step_start = Instant::now();
        self.handle_sighting(sighting);
        self.metrics.record_step(step_start.elapsed().as_micros() as u64);
    }

    pub fn process_sweep(&mut self, now: Instant) {
        let step_start = Instant::now();
        self.handle_sweep(now);
        self.publish();
        self.metrics.record_step(step_start.elapsed().as_micros() as u64);
    }

    #[inline]
    pub fn state(&self) -> &LifecycleState {
        self.lifecycle.state()
    }

    /// Push lifecycle and registry snapshots to watchers
    fn publish(&mut self) {
        let state = self.lifecycle.state();
        if *self.state_tx.borrow() != *state {
            self.state_tx.send_replace(state.clone());
        }
        if self.dirty {
            self.dirty = false;
            self.metrics.set_detected_beacons(self.registry.len() as u64);
            self.beacons_tx.send_replace(Arc::new(self.registry.snapshot()));
        }
    }
}
