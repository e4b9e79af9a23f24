// SPDX-License-Identifier: MPL-2.0

//! Pairs video frames with their processed detections into render packets.
//!
//! ```text
//! raw_frame_data ──┐                        ┌──► render queue (device A)
//!                  ├──► input queue ──► pairing ──► render queue (device B)
//! processed_data ──┘       (worker thread)  └──► ...
//! ```
//!
//! Both halves of a pair arrive independently; the worker buffers the first
//! arrival under `(device_id, frame_id)` and completes the packet when the
//! complement shows up. Half-pairs older than the pairing timeout are
//! purged and counted as drops. Every queue in the stage sheds oldest-first
//! under pressure, so a stalled renderer can never wedge the producers.
//!
//! The last completed packet per device is cached so a renderer polling
//! `get_packets` can freeze the previous frame while a device momentarily
//! starves.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use depthview_config::PackagerConfig;

use crate::backpressure::{BackpressureSource, Registration};
use crate::backpressure::provider::queue_registration;
use crate::error::{ConfigError, RecvError};
use crate::event_bus::{Event, EventBus, EventType, SubscriberId};
use crate::queue::OverflowQueue;
use crate::types::{PayloadKind, RawEvent, RenderPacket};

/// Pairing counters, readable at any time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PackagerStats {
    pub render_packets: u64,
    pub drops: u64,
}

/// Occupancy snapshot of one output queue.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueueStats {
    pub size: usize,
    pub capacity: usize,
    pub usage: f64,
    pub drop_count: u64,
}

/// A half-pair waiting for its complement.
struct PartialMatch {
    first_arrival: Instant,
    video: Option<Arc<crate::types::VideoFrame>>,
    detections: Option<Arc<crate::types::DeviceDetections>>,
}

#[derive(Default)]
struct LoopState {
    running: bool,
    finished: bool,
}

struct Shared {
    config: PackagerConfig,
    input: Arc<OverflowQueue<RawEvent>>,
    /// fixed at construction, so the worker reads it lock-free
    outputs: HashMap<String, Arc<OverflowQueue<RenderPacket>>>,
    buffer: Mutex<HashMap<(String, u64), PartialMatch>>,
    cache: Mutex<HashMap<String, (RenderPacket, Instant)>>,
    stats: Mutex<PackagerStats>,
    loop_state: Mutex<LoopState>,
    loop_cv: Condvar,
}

struct Lifecycle {
    worker: Option<JoinHandle<()>>,
    subscriptions: Vec<(EventType, SubscriberId)>,
    running: bool,
}

pub struct RenderPacketPackager {
    bus: Arc<EventBus>,
    shared: Arc<Shared>,
    lifecycle: Mutex<Lifecycle>,
}

impl RenderPacketPackager {
    pub fn new(
        config: PackagerConfig,
        device_ids: &[String],
        bus: Arc<EventBus>,
    ) -> Result<Self, ConfigError> {
        let mut outputs = HashMap::with_capacity(device_ids.len());
        for device_id in device_ids {
            outputs.insert(
                device_id.clone(),
                Arc::new(OverflowQueue::new(config.queue_capacity)?),
            );
        }
        let input = Arc::new(OverflowQueue::new(config.queue_capacity)?);
        tracing::info!(
            devices = device_ids.len(),
            queue_capacity = config.queue_capacity,
            pairing_timeout_ms = config.pairing_timeout_ms,
            "render packet packager created"
        );
        Ok(Self {
            bus,
            shared: Arc::new(Shared {
                config,
                input,
                outputs,
                buffer: Mutex::new(HashMap::new()),
                cache: Mutex::new(HashMap::new()),
                stats: Mutex::new(PackagerStats::default()),
                loop_state: Mutex::new(LoopState::default()),
                loop_cv: Condvar::new(),
            }),
            lifecycle: Mutex::new(Lifecycle {
                worker: None,
                subscriptions: Vec::new(),
                running: false,
            }),
        })
    }

    /// Subscribe the event handlers and launch the pairing worker.
    ///
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
        *self.shared.stats.lock().unwrap() = PackagerStats::default();
        {
            let mut state = self.shared.loop_state.lock().unwrap();
            state.running = true;
            state.finished = false;
        }

        let input = Arc::clone(&self.shared.input);
        let video_sub = self.bus.subscribe_fn(EventType::RawFrameData, move |event| {
            if let Event::RawFrame(frame) = event {
                input.put_with_overflow(RawEvent::Video(Arc::clone(frame)));
            }
            Ok(())
        });
        let input = Arc::clone(&self.shared.input);
        let detections_sub = self.bus.subscribe_fn(EventType::ProcessedData, move |event| {
            if let Event::Processed(detections) = event {
                input.put_with_overflow(RawEvent::Detections(Arc::clone(detections)));
            }
            Ok(())
        });
        lifecycle.subscriptions = vec![
            (EventType::RawFrameData, video_sub),
            (EventType::ProcessedData, detections_sub),
        ];

        let shared = Arc::clone(&self.shared);
        lifecycle.worker = Some(
            std::thread::Builder::new()
                .name("render-packager".into())
                .spawn(move || run_loop(&shared))
                .expect("failed to spawn packager worker"),
        );
        lifecycle.running = true;
        tracing::info!("render packet packager started");
        true
    }

    /// Unsubscribe, stop the worker, and clear all pairing state.
    ///
    /// Returns `false` when the worker failed to exit within `timeout`.
    pub fn stop(&self, timeout: Duration) -> bool {
        let mut lifecycle = self.lifecycle.lock().unwrap();
        if !lifecycle.running {
            return true;
        }

        // no new events may enter the input queue
        for (event_type, id) in lifecycle.subscriptions.drain(..) {
            self.bus.unsubscribe(event_type, id);
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
                    tracing::warn!("packager worker did not stop within {timeout:?}");
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

        self.shared.buffer.lock().unwrap().clear();
        self.shared.cache.lock().unwrap().clear();
        self.shared.input.clear();
        for queue in self.shared.outputs.values() {
            queue.clear();
        }

        let stats = *self.shared.stats.lock().unwrap();
        let total = stats.render_packets + stats.drops;
        let success_rate = if total > 0 {
            stats.render_packets as f64 / total as f64
        } else {
            0.0
        };
        tracing::info!(
            render_packets = stats.render_packets,
            drops = stats.drops,
            success_rate = format_args!("{:.1}%", success_rate * 100.0),
            "render packet packager stopped"
        );

        lifecycle.running = false;
        joined
    }

    /// Pop the next packet for one device, waiting up to `timeout`.
    ///
    /// Does not consult the last-packet cache; callers that want frame
    /// freezing use [`Self::get_packets`].
    #[must_use]
    pub fn get_packet_by_id(&self, device_id: &str, timeout: Duration) -> Option<RenderPacket> {
        let Some(queue) = self.shared.outputs.get(device_id) else {
            tracing::warn!(device_id, "unknown device requested");
            return None;
        };
        queue.get(timeout).ok()
    }

    /// Collect the freshest packet per device, falling back to the cached
    /// last packet for devices that starve.
    #[must_use]
    pub fn get_packets(&self, timeout: Duration) -> HashMap<String, RenderPacket> {
        let mut packets = HashMap::with_capacity(self.shared.outputs.len());

        for (device_id, queue) in &self.shared.outputs {
            match queue.get(timeout) {
                Ok(packet) => {
                    self.shared
                        .cache
                        .lock()
                        .unwrap()
                        .insert(device_id.clone(), (packet.clone(), Instant::now()));
                    packets.insert(device_id.clone(), packet);
                }
                Err(RecvError::Timeout | RecvError::Empty) => {
                    let cache = self.shared.cache.lock().unwrap();
                    if let Some((cached, _)) = cache.get(device_id) {
                        packets.insert(device_id.clone(), cached.clone());
                    }
                }
            }
        }
        packets
    }

    #[must_use]
    pub fn stats(&self) -> PackagerStats {
        *self.shared.stats.lock().unwrap()
    }

    /// Half-pairs currently waiting for their complement.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.shared.buffer.lock().unwrap().len()
    }

    /// Occupancy of every per-device output queue.
    #[must_use]
    pub fn queue_stats(&self) -> HashMap<String, QueueStats> {
        self.shared
            .outputs
            .iter()
            .map(|(device_id, queue)| {
                (
                    device_id.clone(),
                    QueueStats {
                        size: queue.len(),
                        capacity: queue.capacity(),
                        usage: queue.usage(),
                        drop_count: queue.drop_count(),
                    },
                )
            })
            .collect()
    }

    #[must_use]
    pub fn device_ids(&self) -> Vec<String> {
        self.shared.outputs.keys().cloned().collect()
    }
}

impl BackpressureSource for RenderPacketPackager {
    fn backpressure_registrations(&self) -> Vec<Registration> {
        let mut registrations = vec![queue_registration(&self.shared.input, "packager.input")];
        for (device_id, queue) in &self.shared.outputs {
            registrations.push(queue_registration(queue, format!("packager.render.{device_id}")));
        }
        registrations
    }
}

impl std::fmt::Debug for RenderPacketPackager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderPacketPackager")
            .field("devices", &self.shared.outputs.len())
            .field("pending", &self.pending_count())
            .field("stats", &self.stats())
            .finish()
    }
}

fn run_loop(shared: &Shared) {
    loop {
        if !shared.loop_state.lock().unwrap().running {
            break;
        }
        match shared.input.get(shared.config.poll_timeout()) {
            Ok(event) => {
                handle_event(shared, event);
                purge(shared);
            }
            Err(_) => purge(shared),
        }
    }

    let mut state = shared.loop_state.lock().unwrap();
    state.finished = true;
    shared.loop_cv.notify_all();
}

fn handle_event(shared: &Shared, event: RawEvent) {
    let device_id = event.device_id().to_owned();
    let frame_id = event.frame_id();
    let kind = event.kind();

    if !shared.outputs.contains_key(&device_id) {
        tracing::warn!(device_id, frame_id, "event for unconfigured device dropped");
        shared.stats.lock().unwrap().drops += 1;
        return;
    }

    let key = (device_id, frame_id);
    let mut buffer = shared.buffer.lock().unwrap();

    if !buffer.contains_key(&key) {
        // first arrival opens a half-pair; enforce the hard cap first
        if buffer.len() >= shared.config.max_pending {
            if let Some(oldest) = buffer
                .iter()
                .min_by_key(|(_, p)| p.first_arrival)
                .map(|(k, _)| k.clone())
            {
                buffer.remove(&oldest);
                shared.stats.lock().unwrap().drops += 1;
                tracing::warn!(
                    device_id = %oldest.0,
                    frame_id = oldest.1,
                    max_pending = shared.config.max_pending,
                    "pairing buffer full; evicted oldest half-pair"
                );
            }
        }
        let (video, detections) = match event {
            RawEvent::Video(frame) => (Some(frame), None),
            RawEvent::Detections(batch) => (None, Some(batch)),
        };
        buffer.insert(
            key,
            PartialMatch {
                first_arrival: Instant::now(),
                video,
                detections,
            },
        );
        return;
    }
    let Some(partial) = buffer.get_mut(&key) else {
        return;
    };

    // duplicate half: producer bug; drop the event, keep the pending half
    let duplicate = match kind {
        PayloadKind::Video => partial.video.is_some(),
        PayloadKind::Detections => partial.detections.is_some(),
    };
    if duplicate {
        tracing::warn!(
            device_id = %key.0,
            frame_id,
            payload = %kind,
            "duplicate payload before pairing; event discarded"
        );
        return;
    }

    match event {
        RawEvent::Video(frame) => partial.video = Some(frame),
        RawEvent::Detections(batch) => partial.detections = Some(batch),
    }
    let partial = buffer.remove(&key).expect("entry present");
    drop(buffer);

    let (Some(video), Some(detections)) = (partial.video, partial.detections) else {
        unreachable!("completed pair holds both halves");
    };
    let packet = RenderPacket::new(video, detections);
    if let Some(queue) = shared.outputs.get(&key.0) {
        queue.put_with_overflow(packet);
        shared.stats.lock().unwrap().render_packets += 1;
    }
}

fn purge(shared: &Shared) {
    let timeout = shared.config.pairing_timeout();
    let mut buffer = shared.buffer.lock().unwrap();
    let before = buffer.len();
    buffer.retain(|_, partial| partial.first_arrival.elapsed() <= timeout);
    let removed = before - buffer.len();
    drop(buffer);
    if removed > 0 {
        shared.stats.lock().unwrap().drops += removed as u64;
        tracing::debug!(removed, "purged expired half-pairs");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DetectionBatch, DeviceDetections, VideoFrame};
    use image::RgbImage;

    fn test_config() -> PackagerConfig {
        PackagerConfig::default()
            .queue_capacity(4)
            .poll_timeout_ms(20)
            .pairing_timeout_ms(80)
    }

    fn packager(config: PackagerConfig) -> (Arc<EventBus>, RenderPacketPackager) {
        let bus = Arc::new(EventBus::new());
        let devices = vec!["cam-a".to_owned()];
        let packager = RenderPacketPackager::new(config, &devices, Arc::clone(&bus)).unwrap();
        (bus, packager)
    }

    fn frame(device: &str, frame_id: u64) -> Event {
        Event::RawFrame(Arc::new(VideoFrame::new(device, frame_id, RgbImage::new(2, 2))))
    }

    fn detections(device: &str, frame_id: u64) -> Event {
        Event::Processed(Arc::new(DeviceDetections::new(
            device,
            frame_id,
            DetectionBatch::empty(),
        )))
    }

    fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if predicate() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        predicate()
    }

    #[test]
    fn pairs_video_with_detections() {
        let (bus, packager) = packager(test_config());
        assert!(packager.start());

        bus.publish(&frame("cam-a", 0));
        bus.publish(&detections("cam-a", 0));

        let packet = wait_until(Duration::from_secs(2), || packager.stats().render_packets == 1)
            .then(|| packager.get_packet_by_id("cam-a", Duration::from_millis(100)))
            .flatten()
            .expect("paired packet");
        assert_eq!(packet.device_id(), "cam-a");
        assert_eq!(packet.frame_id(), 0);
        assert_eq!(packager.pending_count(), 0);

        assert!(packager.stop(Duration::from_secs(2)));
    }

    #[test]
    fn pairs_regardless_of_arrival_order() {
        let (bus, packager) = packager(test_config());
        assert!(packager.start());

        bus.publish(&detections("cam-a", 3));
        bus.publish(&frame("cam-a", 3));

        assert!(wait_until(Duration::from_secs(2), || {
            packager.stats().render_packets == 1
        }));
        assert!(packager.stop(Duration::from_secs(2)));
    }

    #[test]
    fn unpaired_half_is_purged_after_timeout() {
        let (bus, packager) = packager(test_config());
        assert!(packager.start());

        bus.publish(&frame("cam-a", 7));
        assert!(wait_until(Duration::from_secs(1), || packager.pending_count() == 1));

        // worker purges on poll timeouts; the half-pair must age out
        assert!(wait_until(Duration::from_secs(2), || {
            packager.pending_count() == 0 && packager.stats().drops == 1
        }));
        assert_eq!(packager.stats().render_packets, 0);

        // a late complement opens a fresh half-pair instead of completing
        bus.publish(&detections("cam-a", 7));
        assert!(wait_until(Duration::from_secs(1), || packager.pending_count() == 1));
        assert_eq!(packager.stats().render_packets, 0);

        assert!(packager.stop(Duration::from_secs(2)));
    }

    #[test]
    fn duplicate_payload_is_discarded_but_pairing_still_completes() {
        let (bus, packager) = packager(test_config());
        assert!(packager.start());

        bus.publish(&frame("cam-a", 5));
        bus.publish(&frame("cam-a", 5)); // duplicate video half
        bus.publish(&detections("cam-a", 5));

        assert!(wait_until(Duration::from_secs(2), || {
            packager.stats().render_packets == 1
        }));
        assert_eq!(packager.pending_count(), 0);
        assert!(packager.stop(Duration::from_secs(2)));
    }

    #[test]
    fn hard_cap_evicts_oldest_half_pair() {
        let config = test_config().max_pending(2).pairing_timeout_ms(10_000);
        let (bus, packager) = packager(config);
        assert!(packager.start());

        bus.publish(&frame("cam-a", 0));
        bus.publish(&frame("cam-a", 1));
        bus.publish(&frame("cam-a", 2)); // evicts frame 0's half-pair

        assert!(wait_until(Duration::from_secs(2), || {
            packager.pending_count() == 2 && packager.stats().drops == 1
        }));

        // frame 0 is gone: its complement opens a new half instead of pairing
        bus.publish(&detections("cam-a", 1));
        assert!(wait_until(Duration::from_secs(2), || {
            packager.stats().render_packets == 1
        }));
        assert!(packager.stop(Duration::from_secs(2)));
    }

    #[test]
    fn get_packets_freezes_last_frame_while_starving() {
        let (bus, packager) = packager(test_config());
        assert!(packager.start());

        bus.publish(&frame("cam-a", 0));
        bus.publish(&detections("cam-a", 0));
        assert!(wait_until(Duration::from_secs(2), || {
            packager.stats().render_packets == 1
        }));

        // fresh pop caches the packet
        let packets = packager.get_packets(Duration::from_millis(50));
        assert_eq!(packets["cam-a"].frame_id(), 0);

        // queue now empty: the cached packet is served, however long the
        // device starves
        std::thread::sleep(Duration::from_millis(200));
        for _ in 0..3 {
            let packets = packager.get_packets(Duration::from_millis(1));
            assert_eq!(packets["cam-a"].frame_id(), 0);
        }

        // a newer pair replaces the cached packet
        bus.publish(&frame("cam-a", 1));
        bus.publish(&detections("cam-a", 1));
        assert!(wait_until(Duration::from_secs(2), || {
            packager.stats().render_packets == 2
        }));
        let packets = packager.get_packets(Duration::from_millis(50));
        assert_eq!(packets["cam-a"].frame_id(), 1);
        let packets = packager.get_packets(Duration::from_millis(1));
        assert_eq!(packets["cam-a"].frame_id(), 1);

        assert!(packager.stop(Duration::from_secs(2)));
    }

    #[test]
    fn unknown_device_events_are_counted_and_dropped() {
        let (bus, packager) = packager(test_config());
        assert!(packager.start());

        bus.publish(&frame("cam-zz", 0));
        assert!(wait_until(Duration::from_secs(1), || packager.stats().drops == 1));
        assert_eq!(packager.pending_count(), 0);
        assert!(packager.get_packet_by_id("cam-zz", Duration::from_millis(10)).is_none());

        assert!(packager.stop(Duration::from_secs(2)));
    }

    #[test]
    fn lifecycle_is_idempotent_and_clears_state() {
        let (bus, packager) = packager(test_config());
        assert!(packager.start());
        assert!(!packager.start(), "second start is a no-op");

        bus.publish(&frame("cam-a", 0));
        bus.publish(&detections("cam-a", 0));
        assert!(wait_until(Duration::from_secs(2), || {
            packager.stats().render_packets == 1
        }));

        assert!(packager.stop(Duration::from_secs(2)));
        assert!(packager.stop(Duration::from_secs(1)), "second stop is a no-op");
        assert_eq!(packager.pending_count(), 0);
        assert!(packager.get_packet_by_id("cam-a", Duration::from_millis(10)).is_none());

        // events published while stopped never reach the input queue
        bus.publish(&frame("cam-a", 1));
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(packager.pending_count(), 0);

        // restart is a fresh run with fresh stats
        assert!(packager.start());
        assert_eq!(packager.stats(), PackagerStats::default());
        bus.publish(&frame("cam-a", 2));
        bus.publish(&detections("cam-a", 2));
        assert!(wait_until(Duration::from_secs(2), || {
            packager.stats().render_packets == 1
        }));
        assert!(packager.stop(Duration::from_secs(2)));
    }

    #[test]
    fn exposes_backpressure_registrations_for_all_queues() {
        let (_bus, packager) = packager(test_config());
        let registrations = packager.backpressure_registrations();
        let ids: Vec<&str> = registrations.iter().map(|r| r.queue_id.as_str()).collect();
        assert!(ids.contains(&"packager.input"));
        assert!(ids.contains(&"packager.render.cam-a"));
        for registration in &registrations {
            assert_eq!(registration.capacity, 4);
            let metrics = (registration.metrics_provider)().unwrap();
            assert_eq!(metrics.capacity, 4);
        }
    }
}
