// SPDX-License-Identifier: MPL-2.0

//! Adapter exposing an [`OverflowQueue`] as a metrics provider.
//!
//! The adapter owns the drop-delta bookkeeping: each sample reports the
//! evictions since the previous sample, which is what the overload rule in
//! [`crate::backpressure::strategy`] keys on.

use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use crate::backpressure::types::{MetricsProvider, QueueMetrics, Registration};
use crate::queue::OverflowQueue;

/// Build a provider sampling `queue` under the given id.
pub fn queue_metrics_provider<T: Send + 'static>(
    queue: &Arc<OverflowQueue<T>>,
    queue_id: impl Into<String>,
) -> MetricsProvider {
    let queue = Arc::clone(queue);
    let queue_id: String = queue_id.into();
    let last_drop_count = Mutex::new(0u64);

    Arc::new(move || {
        let drop_count = queue.drop_count();
        let drop_delta = {
            let mut last = last_drop_count.lock().unwrap();
            // saturating: a reset_drop_count between samples must not wrap
            let delta = drop_count.saturating_sub(*last);
            *last = drop_count;
            delta
        };

        Ok(QueueMetrics {
            queue_id: queue_id.clone(),
            usage: queue.usage().clamp(0.0, 1.0),
            current_size: queue.len(),
            capacity: queue.capacity(),
            drop_count,
            drop_delta,
            pressure_level: queue.pressure_level(),
            timestamp: SystemTime::now(),
        })
    })
}

/// Build a full [`Registration`] for `queue`.
pub fn queue_registration<T: Send + 'static>(
    queue: &Arc<OverflowQueue<T>>,
    queue_id: impl Into<String>,
) -> Registration {
    let queue_id: String = queue_id.into();
    Registration {
        metrics_provider: queue_metrics_provider(queue, queue_id.clone()),
        capacity: queue.capacity(),
        queue_id,
    }
}
