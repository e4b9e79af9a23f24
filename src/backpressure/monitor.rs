// SPDX-License-Identifier: MPL-2.0

//! The backpressure polling thread.
//!
//! One tick: snapshot the registered providers under the lock, sample each
//! provider outside it, feed the samples through the state machine, elect
//! the most severe `(action, state)` across all queues, and publish a
//! single signal when the elected pair changed. A failing provider only
//! skips its own registration for that tick.

use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

use depthview_config::BackpressureConfig;

use crate::backpressure::strategy::{compute_watermarks, decide_state};
use crate::backpressure::types::{
    BackpressureAction, BackpressureSignal, BackpressureSource, BackpressureState,
    MetricsProvider, QueueMetrics, Registration, Watermarks,
};
use crate::error::{InitError, RegisterError};
use crate::event_bus::{Event, EventBus};

struct RegEntry {
    queue_id: String,
    provider: MetricsProvider,
    watermarks: Watermarks,
    drop_threshold: u64,
    state: BackpressureState,
    high_hits: u32,
    low_hits: u32,
}

#[derive(Default)]
struct LoopState {
    running: bool,
    finished: bool,
}

struct Shared {
    config: BackpressureConfig,
    bus: Arc<EventBus>,
    // Vec keeps registration order, which breaks severity ties
    // deterministically (first registered wins).
    registrations: Mutex<Vec<RegEntry>>,
    loop_state: Mutex<LoopState>,
    loop_cv: Condvar,
}

/// Centralized backpressure monitor. See the module docs for the tick
/// shape; lifecycle is idempotent `start` / bounded `stop`.
pub struct BackpressureMonitor {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BackpressureMonitor {
    #[must_use]
    pub fn new(config: BackpressureConfig, bus: Arc<EventBus>) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                bus,
                registrations: Mutex::new(Vec::new()),
                loop_state: Mutex::new(LoopState::default()),
                loop_cv: Condvar::new(),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Initialize (or fetch) the process-wide monitor. The first call wins;
    /// later calls must pass the same config and bus.
    pub fn initialize(
        config: BackpressureConfig,
        bus: Arc<EventBus>,
    ) -> Result<Arc<Self>, InitError> {
        let monitor = global_cell().get_or_init(|| Arc::new(Self::new(config, bus.clone())));
        if monitor.shared.config != config || !Arc::ptr_eq(&monitor.shared.bus, &bus) {
            return Err(InitError::ConflictingConfig);
        }
        Ok(Arc::clone(monitor))
    }

    /// Fetch the process-wide monitor, creating it with defaults on first
    /// use.
    #[must_use]
    pub fn global() -> Arc<Self> {
        Arc::clone(global_cell().get_or_init(|| {
            Arc::new(Self::new(BackpressureConfig::default(), EventBus::global()))
        }))
    }

    #[must_use]
    pub fn config(&self) -> &BackpressureConfig {
        &self.shared.config
    }

    /// Watch a queue. Watermarks are derived from `capacity` once, here.
    pub fn register_queue(
        &self,
        queue_id: impl Into<String>,
        provider: MetricsProvider,
        capacity: usize,
    ) -> Result<(), RegisterError> {
        let queue_id: String = queue_id.into();
        let mut registrations = self.shared.registrations.lock().unwrap();
        if registrations.iter().any(|r| r.queue_id == queue_id) {
            return Err(RegisterError::DuplicateId(queue_id));
        }
        let watermarks = compute_watermarks(capacity, &self.shared.config);
        let drop_threshold = (self.shared.config.drop_rate_threshold * capacity as f64) as u64;
        tracing::info!(
            queue_id = %queue_id,
            capacity,
            high = watermarks.high,
            low = watermarks.low,
            drop_threshold,
            "registered queue"
        );
        registrations.push(RegEntry {
            queue_id,
            provider,
            watermarks,
            drop_threshold,
            state: BackpressureState::Unknown,
            high_hits: 0,
            low_hits: 0,
        });
        Ok(())
    }

    pub fn register(&self, registration: Registration) -> Result<(), RegisterError> {
        self.register_queue(
            registration.queue_id,
            registration.metrics_provider,
            registration.capacity,
        )
    }

    /// Register every queue a component exposes.
    pub fn register_source(&self, source: &dyn BackpressureSource) -> Result<(), RegisterError> {
        for registration in source.backpressure_registrations() {
            self.register(registration)?;
        }
        Ok(())
    }

    /// Stop watching a queue. Unknown ids are ignored.
    pub fn unregister_queue(&self, queue_id: &str) {
        let mut registrations = self.shared.registrations.lock().unwrap();
        registrations.retain(|r| r.queue_id != queue_id);
        tracing::info!(queue_id, "unregistered queue");
    }

    pub fn unregister_source(&self, source: &dyn BackpressureSource) {
        for registration in source.backpressure_registrations() {
            self.unregister_queue(&registration.queue_id);
        }
    }

    /// Launch the polling thread. Calling on a running monitor is a no-op.
    pub fn start(&self) {
        let mut worker = self.worker.lock().unwrap();
        {
            let state = self.shared.loop_state.lock().unwrap();
            if state.running {
                return;
            }
        }
        // Reap a worker left over from a timed-out stop before flipping the
        // running flag, or the old thread would see it and keep going.
        if let Some(handle) = worker.take() {
            let _ = handle.join();
        }
        {
            let mut state = self.shared.loop_state.lock().unwrap();
            state.running = true;
            state.finished = false;
        }
        let shared = Arc::clone(&self.shared);
        *worker = Some(
            std::thread::Builder::new()
                .name("backpressure-monitor".into())
                .spawn(move || run_loop(&shared))
                .expect("failed to spawn backpressure monitor thread"),
        );
        tracing::info!(
            interval_ms = self.shared.config.poll_interval_ms,
            "backpressure monitor started"
        );
    }

    /// Signal the polling thread and wait up to `timeout` for it to exit.
    ///
    /// Returns `false` when the thread did not terminate in time; it is
    /// never killed.
    pub fn stop(&self, timeout: Duration) -> bool {
        let mut worker = self.worker.lock().unwrap();
        {
            let mut state = self.shared.loop_state.lock().unwrap();
            if !state.running && worker.is_none() {
                return true;
            }
            state.running = false;
            self.shared.loop_cv.notify_all();
        }

        let deadline = Instant::now() + timeout;
        let mut state = self.shared.loop_state.lock().unwrap();
        while !state.finished {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                tracing::warn!("backpressure monitor did not stop within {timeout:?}");
                return false;
            }
            state = self.shared.loop_cv.wait_timeout(state, remaining).unwrap().0;
        }
        drop(state);

        if let Some(handle) = worker.take() {
            let _ = handle.join();
        }
        tracing::info!("backpressure monitor stopped");
        true
    }
}

fn global_cell() -> &'static OnceLock<Arc<BackpressureMonitor>> {
    static GLOBAL: OnceLock<Arc<BackpressureMonitor>> = OnceLock::new();
    &GLOBAL
}

fn run_loop(shared: &Shared) {
    let interval = shared.config.poll_interval();
    // last published pair; a tick only publishes when its winner differs
    let mut published = (BackpressureAction::Normal, BackpressureState::Unknown);

    loop {
        {
            let state = shared.loop_state.lock().unwrap();
            if !state.running {
                break;
            }
            let (state, _) = shared.loop_cv.wait_timeout(state, interval).unwrap();
            if !state.running {
                break;
            }
        }
        tick(shared, &mut published);
    }

    let mut state = shared.loop_state.lock().unwrap();
    state.finished = true;
    shared.loop_cv.notify_all();
}

fn tick(shared: &Shared, published: &mut (BackpressureAction, BackpressureState)) {
    // Snapshot providers so sampling happens without the registry lock.
    let providers: Vec<(String, MetricsProvider)> = {
        let registrations = shared.registrations.lock().unwrap();
        registrations
            .iter()
            .map(|r| (r.queue_id.clone(), Arc::clone(&r.provider)))
            .collect()
    };

    let mut samples: Vec<(String, QueueMetrics)> = Vec::with_capacity(providers.len());
    for (queue_id, provider) in providers {
        match provider() {
            Ok(metrics) => samples.push((queue_id, metrics)),
            Err(err) => {
                tracing::error!(queue_id = %queue_id, %err, "metrics provider failed; skipping this tick");
            }
        }
    }

    let mut best: Option<Winner> = None;
    {
        let mut registrations = shared.registrations.lock().unwrap();
        for (queue_id, metrics) in samples {
            // the queue may have been unregistered while we sampled
            let Some(entry) = registrations.iter_mut().find(|r| r.queue_id == queue_id) else {
                continue;
            };

            update_hits(entry, &metrics);
            let (state, action, reason) = decide_state(
                &metrics,
                entry.watermarks,
                entry.drop_threshold,
                entry.state,
                entry.high_hits,
                entry.low_hits,
                shared.config.high_hits_threshold,
                shared.config.low_hits_threshold,
            );
            entry.state = state;

            let incumbent = best
                .as_ref()
                .map_or((BackpressureAction::Normal, BackpressureState::Unknown), |w| {
                    (w.action, w.state)
                });
            if (action, state) > incumbent {
                best = Some(Winner {
                    queue_id,
                    action,
                    state,
                    reason,
                    metrics,
                });
            }
        }
    }

    if let Some(winner) = best {
        if (winner.action, winner.state) != *published {
            publish(shared, &winner);
            *published = (winner.action, winner.state);
        }
    }
}

struct Winner {
    queue_id: String,
    action: BackpressureAction,
    state: BackpressureState,
    reason: &'static str,
    metrics: QueueMetrics,
}

fn update_hits(entry: &mut RegEntry, metrics: &QueueMetrics) {
    match entry.state {
        BackpressureState::Normal | BackpressureState::Unknown => {
            if metrics.current_size >= entry.watermarks.high {
                entry.high_hits += 1;
            } else {
                entry.high_hits = 0;
            }
            entry.low_hits = 0;
        }
        BackpressureState::Pressured => {
            if metrics.current_size <= entry.watermarks.low {
                entry.low_hits += 1;
            } else {
                entry.low_hits = 0;
            }
            entry.high_hits = 0;
        }
        BackpressureState::Overloaded => {
            entry.high_hits = 0;
            entry.low_hits = 0;
        }
    }
}

fn publish(shared: &Shared, winner: &Winner) {
    let signal = BackpressureSignal {
        queue_id: winner.queue_id.clone(),
        action: winner.action,
        state: winner.state,
        reason: winner.reason,
        usage: winner.metrics.usage,
        drop_count: winner.metrics.drop_count,
        pressure_level: winner.metrics.pressure_level,
        timestamp: SystemTime::now(),
    };
    tracing::info!(
        queue_id = %signal.queue_id,
        action = %signal.action,
        state = %signal.state,
        reason = signal.reason,
        usage = signal.usage,
        drops = signal.drop_count,
        level = %signal.pressure_level,
        "backpressure signal"
    );
    shared.bus.publish(&Event::Backpressure(Arc::new(signal)));
}
