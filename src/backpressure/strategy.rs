// SPDX-License-Identifier: MPL-2.0

//! Pure decision functions. Everything stateful lives in the monitor; this
//! module maps one metric sample plus the previous state onto the next
//! `(state, action, reason)` triple, so the transition table is testable in
//! isolation.

use depthview_config::BackpressureConfig;

use crate::backpressure::types::{
    BackpressureAction, BackpressureState, QueueMetrics, Watermarks,
};

/// Turn a capacity into absolute watermarks.
///
/// Queues below `min_capacity` get fixed fractions with floors of 2/1 so a
/// tiny queue still has a usable hysteresis band.
#[must_use]
pub fn compute_watermarks(capacity: usize, config: &BackpressureConfig) -> Watermarks {
    if capacity < config.min_capacity {
        Watermarks {
            high: ((capacity as f64 * 0.9) as usize).max(2),
            low: ((capacity as f64 * 0.5) as usize).max(1),
        }
    } else {
        Watermarks {
            high: (capacity as f64 * config.high_ratio) as usize,
            low: (capacity as f64 * config.low_ratio) as usize,
        }
    }
}

/// One step of the per-queue state machine.
///
/// Transition priority:
/// 1. a drop burst at or above `drop_threshold` forces Overloaded/Pause;
/// 2. Overloaded exits only once occupancy falls below the low watermark;
/// 3. Pressured exits only after `low_hits_threshold` consecutive
///    low-watermark samples (hysteresis);
/// 4. from Normal, any drop throttles immediately, and sustained
///    high-watermark occupancy (`high_hits_threshold` consecutive samples)
///    throttles too;
/// 5. otherwise stay Normal.
#[allow(clippy::too_many_arguments)]
#[must_use]
pub fn decide_state(
    metrics: &QueueMetrics,
    watermarks: Watermarks,
    drop_threshold: u64,
    prev_state: BackpressureState,
    high_hits: u32,
    low_hits: u32,
    high_hits_threshold: u32,
    low_hits_threshold: u32,
) -> (BackpressureState, BackpressureAction, &'static str) {
    if metrics.drop_delta >= drop_threshold {
        return (
            BackpressureState::Overloaded,
            BackpressureAction::Pause,
            "drop_rate",
        );
    }

    if prev_state == BackpressureState::Overloaded {
        return if metrics.current_size < watermarks.low {
            (
                BackpressureState::Normal,
                BackpressureAction::Normal,
                "queue_low",
            )
        } else {
            (
                BackpressureState::Overloaded,
                BackpressureAction::Pause,
                "queue_overload",
            )
        };
    }

    if prev_state == BackpressureState::Pressured {
        return if metrics.current_size <= watermarks.low && low_hits >= low_hits_threshold {
            (
                BackpressureState::Normal,
                BackpressureAction::Normal,
                "queue_low_hits",
            )
        } else {
            (
                BackpressureState::Pressured,
                BackpressureAction::Throttle,
                "pressure_hold",
            )
        };
    }

    if metrics.drop_delta > 0 {
        return (
            BackpressureState::Pressured,
            BackpressureAction::Throttle,
            "drop_warn",
        );
    }
    if metrics.current_size >= watermarks.high && high_hits >= high_hits_threshold {
        return (
            BackpressureState::Pressured,
            BackpressureAction::Throttle,
            "queue_high_hits",
        );
    }

    (
        BackpressureState::Normal,
        BackpressureAction::Normal,
        "queue_ok",
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::PressureLevel;
    use std::time::SystemTime;

    fn metrics(size: usize, capacity: usize, drop_delta: u64) -> QueueMetrics {
        let usage = size as f64 / capacity as f64;
        QueueMetrics {
            queue_id: "q".into(),
            usage,
            current_size: size,
            capacity,
            drop_count: drop_delta,
            drop_delta,
            pressure_level: PressureLevel::from_usage(usage),
            timestamp: SystemTime::now(),
        }
    }

    #[test]
    fn watermarks_use_ratios_at_normal_capacity() {
        let config = BackpressureConfig::default();
        let wm = compute_watermarks(100, &config);
        assert_eq!(wm, Watermarks { high: 80, low: 50 });
    }

    #[test]
    fn small_capacity_watermarks_are_clamped() {
        let config = BackpressureConfig::default(); // min_capacity = 10
        assert_eq!(compute_watermarks(1, &config), Watermarks { high: 2, low: 1 });
        assert_eq!(compute_watermarks(4, &config), Watermarks { high: 3, low: 2 });
        assert_eq!(compute_watermarks(8, &config), Watermarks { high: 7, low: 4 });
    }

    #[test]
    fn drop_burst_forces_overload() {
        let (state, action, reason) = decide_state(
            &metrics(1, 8, 4),
            Watermarks { high: 7, low: 4 },
            4,
            BackpressureState::Normal,
            0,
            0,
            2,
            2,
        );
        assert_eq!(state, BackpressureState::Overloaded);
        assert_eq!(action, BackpressureAction::Pause);
        assert_eq!(reason, "drop_rate");
    }

    #[test]
    fn overload_holds_until_below_low_watermark() {
        let wm = Watermarks { high: 7, low: 4 };
        let (state, action, reason) = decide_state(
            &metrics(5, 8, 0),
            wm,
            4,
            BackpressureState::Overloaded,
            0,
            0,
            2,
            2,
        );
        assert_eq!(
            (state, action, reason),
            (
                BackpressureState::Overloaded,
                BackpressureAction::Pause,
                "queue_overload"
            )
        );

        let (state, action, reason) = decide_state(
            &metrics(3, 8, 0),
            wm,
            4,
            BackpressureState::Overloaded,
            0,
            0,
            2,
            2,
        );
        assert_eq!(
            (state, action, reason),
            (
                BackpressureState::Normal,
                BackpressureAction::Normal,
                "queue_low"
            )
        );
    }

    #[test]
    fn pressured_needs_sustained_low_hits_to_recover() {
        let wm = Watermarks { high: 7, low: 4 };
        // at the low watermark but only one hit: hold
        let (state, _, reason) = decide_state(
            &metrics(4, 8, 0),
            wm,
            4,
            BackpressureState::Pressured,
            0,
            1,
            2,
            2,
        );
        assert_eq!(state, BackpressureState::Pressured);
        assert_eq!(reason, "pressure_hold");

        // second consecutive hit: recover
        let (state, action, reason) = decide_state(
            &metrics(4, 8, 0),
            wm,
            4,
            BackpressureState::Pressured,
            0,
            2,
            2,
            2,
        );
        assert_eq!(
            (state, action, reason),
            (
                BackpressureState::Normal,
                BackpressureAction::Normal,
                "queue_low_hits"
            )
        );
    }

    #[test]
    fn any_drop_throttles_from_normal() {
        let (state, action, reason) = decide_state(
            &metrics(2, 8, 1),
            Watermarks { high: 7, low: 4 },
            4,
            BackpressureState::Normal,
            0,
            0,
            2,
            2,
        );
        assert_eq!(
            (state, action, reason),
            (
                BackpressureState::Pressured,
                BackpressureAction::Throttle,
                "drop_warn"
            )
        );
    }

    #[test]
    fn high_occupancy_needs_sustained_hits() {
        let wm = Watermarks { high: 7, low: 4 };
        let (state, _, reason) = decide_state(
            &metrics(7, 8, 0),
            wm,
            4,
            BackpressureState::Normal,
            1,
            0,
            2,
            2,
        );
        assert_eq!(state, BackpressureState::Normal);
        assert_eq!(reason, "queue_ok");

        let (state, action, reason) = decide_state(
            &metrics(7, 8, 0),
            wm,
            4,
            BackpressureState::Normal,
            2,
            0,
            2,
            2,
        );
        assert_eq!(
            (state, action, reason),
            (
                BackpressureState::Pressured,
                BackpressureAction::Throttle,
                "queue_high_hits"
            )
        );
    }

    #[test]
    fn unknown_state_behaves_like_normal() {
        let (state, action, reason) = decide_state(
            &metrics(0, 8, 0),
            Watermarks { high: 7, low: 4 },
            4,
            BackpressureState::Unknown,
            0,
            0,
            2,
            2,
        );
        assert_eq!(
            (state, action, reason),
            (
                BackpressureState::Normal,
                BackpressureAction::Normal,
                "queue_ok"
            )
        );
    }

    #[test]
    fn severity_orders_follow_discriminants() {
        use BackpressureAction as A;
        use BackpressureState as S;
        assert!(A::Pause > A::Throttle && A::Throttle > A::Normal);
        assert!(S::Overloaded > S::Pressured && S::Pressured > S::Normal && S::Normal > S::Unknown);
        // the election compares action first
        assert!((A::Throttle, S::Normal) > (A::Normal, S::Overloaded));
    }
}
