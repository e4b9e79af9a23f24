// SPDX-License-Identifier: MPL-2.0

//! Thin controller over the pairing stage and the external renderer.
//!
//! The orchestrator never rasterizes anything itself. The renderer is an
//! injected [`Renderer`] implementation (an OpenCV-style window manager in
//! the full system, a headless consumer in soak runs). What lives here is
//! lifecycle: validate configuration up front, start the pieces in order,
//! stop them in reverse, and fold their counters into one stats report.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use depthview_config::DisplayConfig;

use crate::packager::{PackagerStats, QueueStats, RenderPacketPackager};

/// Usage above which a device's render queue draws a shutdown warning.
const QUEUE_USAGE_WARN: f64 = 0.8;

/// External rendering surface. Implementations own their window/thread.
pub trait Renderer: Send {
    fn start(&mut self) -> eyre::Result<()>;

    /// Returns `false` if the renderer failed to stop within `timeout`.
    fn stop(&mut self, timeout: Duration) -> bool;
}

/// Aggregated shutdown report.
#[derive(Debug, Clone, Default)]
pub struct DisplayStats {
    pub packager: PackagerStats,
    pub per_device: HashMap<String, QueueStats>,
    /// packager drops plus every device queue's eviction count
    pub total_drops: u64,
}

struct State {
    running: bool,
    renderer: Option<Box<dyn Renderer>>,
}

pub struct DisplayOrchestrator {
    config: DisplayConfig,
    packager: Arc<RenderPacketPackager>,
    state: Mutex<State>,
}

impl DisplayOrchestrator {
    /// Fails fast on invalid configuration.
    pub fn new(
        config: DisplayConfig,
        packager: Arc<RenderPacketPackager>,
        renderer: Option<Box<dyn Renderer>>,
    ) -> Result<Self, depthview_config::ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            packager,
            state: Mutex::new(State {
                running: false,
                renderer,
            }),
        })
    }

    /// Start the packager, then (if enabled) the renderer.
    ///
    /// Returns `Ok(false)` when already running. A renderer failure rolls
    /// the packager back before the error propagates.
    pub fn start(&self) -> eyre::Result<bool> {
        let mut state = self.state.lock().unwrap();
        if state.running {
            tracing::info!("display orchestrator already running");
            return Ok(false);
        }

        if !self.packager.start() {
            return Err(eyre::eyre!("render packet packager failed to start"));
        }

        if self.config.enable_display {
            if let Some(renderer) = state.renderer.as_mut() {
                if let Err(err) = renderer.start() {
                    tracing::error!(%err, "renderer failed to start; rolling back");
                    self.stop_locked(&mut state, Duration::from_secs(2));
                    return Err(err);
                }
            }
        } else {
            tracing::info!("renderer disabled by configuration");
        }

        state.running = true;
        tracing::info!("display orchestrator started");
        Ok(true)
    }

    /// Stop the renderer, then the packager; log the aggregated stats.
    ///
    /// Idempotent; returns `false` when any piece failed to stop in time.
    pub fn stop(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock().unwrap();
        if !state.running {
            tracing::info!("display orchestrator not running");
            return true;
        }
        let clean = self.stop_locked(&mut state, timeout);
        state.running = false;
        clean
    }

    /// Shared teardown for `stop` and `start`'s rollback path; the state
    /// lock is already held, so re-entry cannot deadlock.
    fn stop_locked(&self, state: &mut State, timeout: Duration) -> bool {
        let renderer_clean = match state.renderer.as_mut() {
            Some(renderer) if self.config.enable_display => {
                let clean = renderer.stop(timeout);
                if !clean {
                    tracing::warn!("renderer did not stop within {timeout:?}");
                }
                clean
            }
            _ => true,
        };

        let stats = self.stats();
        let packager_clean = self.packager.stop(timeout);

        for (device_id, queue) in &stats.per_device {
            if queue.usage > QUEUE_USAGE_WARN {
                tracing::warn!(
                    device_id = %device_id,
                    usage = format_args!("{:.2}", queue.usage),
                    drops = queue.drop_count,
                    "render queue was saturated at shutdown"
                );
            }
        }
        tracing::info!(
            render_packets = stats.packager.render_packets,
            packager_drops = stats.packager.drops,
            total_drops = stats.total_drops,
            "display orchestrator stopped"
        );

        renderer_clean && packager_clean
    }

    /// Current counters: packager totals plus per-device queue occupancy.
    #[must_use]
    pub fn stats(&self) -> DisplayStats {
        let packager = self.packager.stats();
        let per_device = self.packager.queue_stats();
        let queue_drops: u64 = per_device.values().map(|q| q.drop_count).sum();
        DisplayStats {
            total_drops: packager.drops + queue_drops,
            packager,
            per_device,
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state.lock().unwrap().running
    }
}

impl std::fmt::Debug for DisplayOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DisplayOrchestrator")
            .field("running", &self.is_running())
            .field("enable_display", &self.config.enable_display)
            .finish()
    }
}
