// SPDX-License-Identifier: MPL-2.0

//! Drives raw detection batches through the filter stack.
//!
//! Subscribes to `raw_detection_data`, smooths each batch with the
//! [`FilterManager`], and republishes the result as `processed_data` for
//! the pairing stage. Empty batches flow through untouched, since a frame
//! with nothing detected still needs its detection half to pair.
//!
//! The decision step that fills in per-detection status lives outside the
//! core; states pass through, reordered alongside their rows.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use depthview_config::{FilterConfig, PackagerConfig};

use crate::backpressure::provider::queue_registration;
use crate::backpressure::{BackpressureSource, Registration};
use crate::error::ConfigError;
use crate::event_bus::{Event, EventBus, EventType, SubscriberId};
use crate::queue::OverflowQueue;
use crate::tracking::FilterManager;
use crate::types::{DetectionBatch, DeviceDetections};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessorStats {
    pub batches_in: u64,
    pub batches_out: u64,
}

#[derive(Default)]
struct LoopState {
    running: bool,
    finished: bool,
}

struct Shared {
    poll_timeout: Duration,
    input: Arc<OverflowQueue<Arc<DeviceDetections>>>,
    manager: Mutex<FilterManager>,
    bus: Arc<EventBus>,
    stats: Mutex<ProcessorStats>,
    loop_state: Mutex<LoopState>,
    loop_cv: Condvar,
}

struct Lifecycle {
    worker: Option<JoinHandle<()>>,
    subscription: Option<SubscriberId>,
    running: bool,
}

/// The "filter manager driver": one worker thread between the camera-side
/// detection stream and the pairing stage.
pub struct DetectionProcessor {
    shared: Arc<Shared>,
    lifecycle: Mutex<Lifecycle>,
}

impl DetectionProcessor {
    pub fn new(
        packager_config: &PackagerConfig,
        filter_config: &FilterConfig,
        device_ids: &[String],
        label_count: usize,
        bus: Arc<EventBus>,
    ) -> Result<Self, ConfigError> {
        let input = Arc::new(OverflowQueue::new(packager_config.queue_capacity)?);
        let manager = FilterManager::new(device_ids, label_count, filter_config);
        Ok(Self {
            shared: Arc::new(Shared {
                poll_timeout: packager_config.poll_timeout(),
                input,
                manager: Mutex::new(manager),
                bus,
                stats: Mutex::new(ProcessorStats::default()),
                loop_state: Mutex::new(LoopState::default()),
                loop_cv: Condvar::new(),
            }),
            lifecycle: Mutex::new(Lifecycle {
                worker: None,
                subscription: None,
                running: false,
            }),
        })
    }

    /// Returns `false` when already running.
    pub fn start(&self) -> bool {
        let mut lifecycle = self.lifecycle.lock().unwrap();
        if lifecycle.running {
            return false;
        }

        // reap a worker left over from a timed-out stop before flipping the
        // running flag, or the old thread would see it and keep going
        if let Some(handle) = lifecycle.worker.take() {
            let _ = handle.join();
        }
        *self.shared.stats.lock().unwrap() = ProcessorStats::default();
        {
            let mut state = self.shared.loop_state.lock().unwrap();
            state.running = true;
            state.finished = false;
        }

        let input = Arc::clone(&self.shared.input);
        lifecycle.subscription = Some(self.shared.bus.subscribe_fn(
            EventType::RawDetectionData,
            move |event| {
                if let Event::RawDetections(batch) = event {
                    input.put_with_overflow(Arc::clone(batch));
                }
                Ok(())
            },
        ));

        let shared = Arc::clone(&self.shared);
        lifecycle.worker = Some(
            std::thread::Builder::new()
                .name("detection-processor".into())
                .spawn(move || run_loop(&shared))
                .expect("failed to spawn detection processor"),
        );
        lifecycle.running = true;
        tracing::info!("detection processor started");
        true
    }

    /// Returns `false` when the worker failed to exit within `timeout`.
    pub fn stop(&self, timeout: Duration) -> bool {
        let mut lifecycle = self.lifecycle.lock().unwrap();
        if !lifecycle.running {
            return true;
        }

        if let Some(id) = lifecycle.subscription.take() {
            self.shared.bus.unsubscribe(EventType::RawDetectionData, id);
        }
        {
            let mut state = self.shared.loop_state.lock().unwrap();
            state.running = false;
        }

        let deadline = Instant::now() + timeout;
        let mut joined = true;
        {
            let mut state = self.shared.loop_state.lock().unwrap();
            while !state.finished {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    tracing::warn!("detection processor did not stop within {timeout:?}");
                    joined = false;
                    break;
                }
                state = self.shared.loop_cv.wait_timeout(state, remaining).unwrap().0;
            }
        }
        if joined {
            if let Some(handle) = lifecycle.worker.take() {
                let _ = handle.join();
            }
        }

        self.shared.input.clear();
        self.shared.manager.lock().unwrap().reset();

        let stats = *self.shared.stats.lock().unwrap();
        tracing::info!(
            batches_in = stats.batches_in,
            batches_out = stats.batches_out,
            "detection processor stopped"
        );
        lifecycle.running = false;
        joined
    }

    #[must_use]
    pub fn stats(&self) -> ProcessorStats {
        *self.shared.stats.lock().unwrap()
    }

    /// Pool occupancy, keyed by (device, label).
    #[must_use]
    pub fn pool_stats(
        &self,
    ) -> std::collections::HashMap<(String, i32), crate::tracking::PoolStats> {
        self.shared.manager.lock().unwrap().pool_stats()
    }
}

impl BackpressureSource for DetectionProcessor {
    fn backpressure_registrations(&self) -> Vec<Registration> {
        vec![queue_registration(&self.shared.input, "processor.input")]
    }
}

impl std::fmt::Debug for DetectionProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetectionProcessor")
            .field("stats", &self.stats())
            .finish()
    }
}

fn run_loop(shared: &Shared) {
    loop {
        if !shared.loop_state.lock().unwrap().running {
            break;
        }
        match shared.input.get(shared.poll_timeout) {
            Ok(incoming) => process_batch(shared, &incoming),
            Err(_) => continue,
        }
    }

    let mut state = shared.loop_state.lock().unwrap();
    state.finished = true;
    shared.loop_cv.notify_all();
}

fn process_batch(shared: &Shared, incoming: &DeviceDetections) {
    shared.stats.lock().unwrap().batches_in += 1;

    let batch = &incoming.batch;
    let (coords, bboxes, confidences, labels) = {
        let mut manager = shared.manager.lock().unwrap();
        manager.process(
            &incoming.device_id,
            batch.coords.view(),
            batch.bboxes.view(),
            batch.confidences.view(),
            batch.labels.view(),
        )
    };

    // the output is the label-grouped permutation of the input rows; carry
    // the external status values along in the same order
    let mut states: Vec<i32> = Vec::with_capacity(labels.len());
    let mut current_group: Option<i32> = None;
    for &label in &labels {
        if current_group != Some(label) {
            current_group = Some(label);
            for (row, &row_label) in batch.labels.iter().enumerate() {
                if row_label == label {
                    states.push(batch.states[row]);
                }
            }
        }
    }
    let states = ndarray::Array1::from_vec(states);

    let processed = match DetectionBatch::new(labels, bboxes, confidences, coords, states) {
        Ok(processed) => processed,
        Err(err) => {
            tracing::error!(
                device_id = %incoming.device_id,
                frame_id = incoming.frame_id,
                %err,
                "filtered batch shape mismatch; batch dropped"
            );
            return;
        }
    };

    let outgoing = DeviceDetections::new(&*incoming.device_id, incoming.frame_id, processed);
    shared.stats.lock().unwrap().batches_out += 1;
    shared
        .bus
        .publish(&Event::Processed(Arc::new(outgoing)));
}
