// SPDX-License-Identifier: MPL-2.0

//! depthview daemon.
//!
//! Wires the streaming core together: backpressure monitor, detection
//! processor, render packet packager, display orchestrator. Without real
//! cameras attached (capture is a separate service) the daemon soaks the
//! substrate with synthetic per-device producers that honor advisory
//! backpressure, which makes it a deployable smoke test for the pipeline.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use calloop::signals::{Signal, Signals};
use calloop::timer::{TimeoutAction, Timer};
use eyre::Context;
use image::{Rgb, RgbImage};
use tracing_subscriber::prelude::*;

use depthview::backpressure::{BackpressureAction, BackpressureMonitor, BackpressureSource};
use depthview::display::{DisplayOrchestrator, Renderer};
use depthview::event_bus::{Event, EventBus, EventType};
use depthview::packager::RenderPacketPackager;
use depthview::processor::DetectionProcessor;
use depthview::types::{DetectionBatch, DeviceDetections, RawDetection, VideoFrame};
use depthview_config::{DeviceEntry, Settings};

const ACTION_NORMAL: u8 = 0;
const ACTION_THROTTLE: u8 = 1;
const ACTION_PAUSE: u8 = 2;

struct Daemon {
    exit: bool,
}

fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    init_logger();

    let settings = load_settings();
    let device_ids = settings.device_ids();
    tracing::info!(devices = ?device_ids, labels = ?settings.labels, "starting depthview");

    let bus = Arc::new(EventBus::new());

    let monitor = Arc::new(BackpressureMonitor::new(
        settings.backpressure,
        Arc::clone(&bus),
    ));
    let processor = Arc::new(DetectionProcessor::new(
        &settings.packager,
        &settings.filter,
        &device_ids,
        settings.labels.len(),
        Arc::clone(&bus),
    )?);
    let packager = Arc::new(RenderPacketPackager::new(
        settings.packager,
        &device_ids,
        Arc::clone(&bus),
    )?);

    monitor
        .register_source(&*packager)
        .wrap_err("registering packager queues")?;
    monitor
        .register_source(&*processor)
        .wrap_err("registering processor queue")?;

    let renderer = HeadlessRenderer::new(
        Arc::clone(&packager),
        settings.display.consume_interval(),
    );
    let orchestrator = Arc::new(DisplayOrchestrator::new(
        settings.display,
        Arc::clone(&packager),
        Some(Box::new(renderer)),
    )?);

    monitor.start();
    processor.start();
    orchestrator.start()?;

    // Producers honor advisory backpressure through a shared pace flag:
    // Throttle halves the rate, Pause stops publishing entirely.
    let pace = Arc::new(AtomicU8::new(ACTION_NORMAL));
    let pace_sink = Arc::clone(&pace);
    bus.subscribe_fn(EventType::BackpressureSignal, move |event| {
        if let Event::Backpressure(signal) = event {
            let action = match signal.action {
                BackpressureAction::Normal => ACTION_NORMAL,
                BackpressureAction::Throttle => ACTION_THROTTLE,
                BackpressureAction::Pause => ACTION_PAUSE,
            };
            pace_sink.store(action, Ordering::Relaxed);
        }
        Ok(())
    });

    // Renderer-side shutdown requests arrive as system_shutdown events.
    let shutdown_requested = Arc::new(AtomicBool::new(false));
    let shutdown_sink = Arc::clone(&shutdown_requested);
    bus.subscribe_fn(EventType::SystemShutdown, move |_| {
        shutdown_sink.store(true, Ordering::SeqCst);
        Ok(())
    });

    let producers_running = Arc::new(AtomicBool::new(true));
    let producers: Vec<JoinHandle<()>> = device_ids
        .iter()
        .map(|device_id| {
            spawn_producer(
                device_id.clone(),
                Arc::clone(&bus),
                Arc::clone(&producers_running),
                Arc::clone(&pace),
                settings.labels.len(),
            )
        })
        .collect();

    let mut event_loop: calloop::EventLoop<Daemon> =
        calloop::EventLoop::try_new().wrap_err("failed to create event loop")?;

    let signals = Signals::new(&[Signal::SIGINT, Signal::SIGTERM])
        .wrap_err("failed to install signal source")?;
    let signal_bus = Arc::clone(&bus);
    event_loop
        .handle()
        .insert_source(signals, move |event, _, daemon: &mut Daemon| {
            tracing::info!(signal = ?event.signal(), "shutdown signal received");
            signal_bus.publish(&Event::Shutdown);
            daemon.exit = true;
        })
        .map_err(|err| eyre::eyre!("failed to insert signal source: {err}"))?;

    let stats_orchestrator = Arc::clone(&orchestrator);
    let stats_processor = Arc::clone(&processor);
    event_loop
        .handle()
        .insert_source(
            Timer::from_duration(Duration::from_secs(5)),
            move |_deadline, _, _daemon| {
                let display_stats = stats_orchestrator.stats();
                let processing = stats_processor.stats();
                tracing::info!(
                    render_packets = display_stats.packager.render_packets,
                    total_drops = display_stats.total_drops,
                    batches_in = processing.batches_in,
                    batches_out = processing.batches_out,
                    "pipeline stats"
                );
                TimeoutAction::ToDuration(Duration::from_secs(5))
            },
        )
        .map_err(|err| eyre::eyre!("failed to insert stats timer: {err}"))?;

    let mut daemon = Daemon { exit: false };
    loop {
        event_loop
            .dispatch(Some(Duration::from_millis(250)), &mut daemon)
            .wrap_err("event loop dispatch failed")?;
        if daemon.exit || shutdown_requested.load(Ordering::SeqCst) {
            break;
        }
    }

    tracing::info!("shutting down");
    producers_running.store(false, Ordering::SeqCst);
    for producer in producers {
        let _ = producer.join();
    }

    let shutdown_timeout = Duration::from_secs(5);
    let mut clean = orchestrator.stop(shutdown_timeout);
    clean &= processor.stop(shutdown_timeout);
    clean &= monitor.stop(shutdown_timeout);

    if !clean {
        tracing::warn!("shutdown was not clean");
        std::process::exit(1);
    }
    Ok(())
}

fn load_settings() -> Settings {
    match std::env::var_os("DEPTHVIEW_CONFIG") {
        Some(path) => match Settings::load(&path) {
            Ok(settings) => settings,
            Err(why) => {
                tracing::error!(?why, "config file error, falling back to defaults");
                default_settings()
            }
        },
        None => default_settings(),
    }
}

/// Two synthetic stereo devices, two labels. Real deployments pass a RON
/// file via `DEPTHVIEW_CONFIG`.
fn default_settings() -> Settings {
    let mut left = DeviceEntry::new("14442C10D13EABCE00");
    left.alias = Some("left".into());
    let mut right = DeviceEntry::new("14442C10D13EABCF00");
    right.alias = Some("right".into());
    Settings {
        devices: vec![left, right],
        labels: vec!["person".into(), "pallet".into()],
        ..Settings::default()
    }
}

fn spawn_producer(
    device_id: String,
    bus: Arc<EventBus>,
    running: Arc<AtomicBool>,
    pace: Arc<AtomicU8>,
    label_count: usize,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name(format!("producer-{device_id}"))
        .spawn(move || {
            let mut frame_id = 0u64;
            while running.load(Ordering::SeqCst) {
                match pace.load(Ordering::Relaxed) {
                    ACTION_PAUSE => {
                        std::thread::sleep(Duration::from_millis(20));
                        continue;
                    }
                    ACTION_THROTTLE => std::thread::sleep(Duration::from_millis(66)),
                    _ => std::thread::sleep(Duration::from_millis(33)),
                }

                let frame = VideoFrame::new(
                    device_id.as_str(),
                    frame_id,
                    RgbImage::from_pixel(64, 48, Rgb([32, 96, 160])),
                );
                bus.publish(&Event::RawFrame(Arc::new(frame)));
                bus.publish(&Event::RawDetections(Arc::new(DeviceDetections::new(
                    device_id.as_str(),
                    frame_id,
                    synthetic_batch(frame_id, label_count),
                ))));
                frame_id += 1;
            }
            tracing::debug!(device_id, frames = frame_id, "producer exiting");
        })
        .expect("failed to spawn producer thread")
}

/// A box sweeping left to right plus one stationary target, deterministic
/// per frame id.
fn synthetic_batch(frame_id: u64, label_count: usize) -> DetectionBatch {
    let phase = (frame_id % 60) as f32 / 60.0;
    let x = 0.1 + 0.6 * phase;
    let rows = [
        RawDetection {
            label: 0,
            bbox: [x, 0.2, x + 0.2, 0.5],
            confidence: 0.9,
            coords: [x * 1000.0, 200.0, 1500.0],
        },
        RawDetection {
            label: (label_count as i32 - 1).max(0),
            bbox: [0.55, 0.55, 0.8, 0.85],
            confidence: 0.8,
            coords: [-120.0, 40.0, 2200.0],
        },
    ];
    DetectionBatch::from_rows(&rows)
}

/// Consumer standing in for the OpenCV renderer: drains render packets on
/// the display cadence and reports what it would have drawn.
struct HeadlessRenderer {
    packager: Arc<RenderPacketPackager>,
    interval: Duration,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl HeadlessRenderer {
    fn new(packager: Arc<RenderPacketPackager>, interval: Duration) -> Self {
        Self {
            packager,
            interval,
            running: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        }
    }
}

impl Renderer for HeadlessRenderer {
    fn start(&mut self) -> eyre::Result<()> {
        self.running.store(true, Ordering::SeqCst);
        let packager = Arc::clone(&self.packager);
        let running = Arc::clone(&self.running);
        let interval = self.interval;
        let handle = std::thread::Builder::new()
            .name("headless-renderer".into())
            .spawn(move || {
                let mut rendered = 0u64;
                while running.load(Ordering::SeqCst) {
                    let packets = packager.get_packets(Duration::from_millis(5));
                    rendered += packets.len() as u64;
                    for (device_id, packet) in &packets {
                        tracing::trace!(
                            device_id = %device_id,
                            frame_id = packet.frame_id(),
                            detections = packet.detections.batch.len(),
                            "rendered"
                        );
                    }
                    std::thread::sleep(interval);
                }
                tracing::info!(rendered, "headless renderer exiting");
            })
            .wrap_err("failed to spawn renderer thread")?;
        *self.worker.lock().unwrap() = Some(handle);
        Ok(())
    }

    fn stop(&mut self, timeout: Duration) -> bool {
        self.running.store(false, Ordering::SeqCst);
        let Some(handle) = self.worker.lock().unwrap().take() else {
            return true;
        };
        let deadline = Instant::now() + timeout;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                tracing::warn!("headless renderer did not stop within {timeout:?}");
                return false;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        let _ = handle.join();
        true
    }
}

fn init_logger() {
    let log_level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|level| level.parse::<tracing::Level>().ok())
        .unwrap_or(tracing::Level::INFO);

    let log_format = tracing_subscriber::fmt::format()
        .pretty()
        .without_time()
        .with_line_number(true)
        .with_file(true)
        .with_target(false)
        .with_thread_names(true);

    let log_filter = tracing_subscriber::fmt::Layer::default()
        .with_writer(std::io::stderr)
        .event_format(log_format)
        .with_filter(tracing_subscriber::filter::filter_fn(move |metadata| {
            metadata.level() == &tracing::Level::ERROR
                || (metadata.target().starts_with("depthview") && metadata.level() <= &log_level)
        }));

    tracing_subscriber::registry().with(log_filter).init();
}
