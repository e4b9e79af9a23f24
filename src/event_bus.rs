// SPDX-License-Identifier: MPL-2.0

//! Topic-addressed publish/subscribe with synchronous fan-out.
//!
//! Dispatch happens on the publishing thread, in subscription order, over a
//! snapshot of the subscriber list. The table lock is never held across a
//! handler call, so handlers may subscribe and unsubscribe freely (changes
//! take effect on the next publish). A failing handler is logged and does
//! not stop later handlers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use crate::backpressure::BackpressureSignal;
use crate::types::{DeviceDetections, VideoFrame};

/// Closed topic set. Adding a topic is a compile-time change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    RawFrameData,
    RawDetectionData,
    ProcessedData,
    BackpressureSignal,
    SystemShutdown,
}

/// Payload published on the bus; its variant determines the topic.
#[derive(Debug, Clone)]
pub enum Event {
    RawFrame(Arc<VideoFrame>),
    RawDetections(Arc<DeviceDetections>),
    Processed(Arc<DeviceDetections>),
    Backpressure(Arc<BackpressureSignal>),
    Shutdown,
}

impl Event {
    #[must_use]
    pub fn event_type(&self) -> EventType {
        match self {
            Self::RawFrame(_) => EventType::RawFrameData,
            Self::RawDetections(_) => EventType::RawDetectionData,
            Self::Processed(_) => EventType::ProcessedData,
            Self::Backpressure(_) => EventType::BackpressureSignal,
            Self::Shutdown => EventType::SystemShutdown,
        }
    }
}

/// Subscriber callback. Handlers must not block; enqueueing handlers use
/// `OverflowQueue::put_with_overflow`.
pub type Handler = Arc<dyn Fn(&Event) -> eyre::Result<()> + Send + Sync>;

/// Token identifying one subscription, returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriberId(u64);

#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<HashMap<EventType, Vec<(SubscriberId, Handler)>>>,
    next_id: AtomicU64,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide bus. First use wins; prefer passing an explicit
    /// `Arc<EventBus>` through constructors and keep this for wiring code.
    #[must_use]
    pub fn global() -> Arc<EventBus> {
        static GLOBAL: OnceLock<Arc<EventBus>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(EventBus::new())))
    }

    /// Register `handler` for `event_type`, after any existing subscribers.
    pub fn subscribe(&self, event_type: EventType, handler: Handler) -> SubscriberId {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .lock()
            .unwrap()
            .entry(event_type)
            .or_default()
            .push((id, handler));
        id
    }

    /// Convenience wrapper accepting a plain closure.
    pub fn subscribe_fn<F>(&self, event_type: EventType, handler: F) -> SubscriberId
    where
        F: Fn(&Event) -> eyre::Result<()> + Send + Sync + 'static,
    {
        self.subscribe(event_type, Arc::new(handler))
    }

    /// Remove a subscription. Returns `false` if the token was not found.
    pub fn unsubscribe(&self, event_type: EventType, id: SubscriberId) -> bool {
        let mut subscribers = self.subscribers.lock().unwrap();
        let Some(handlers) = subscribers.get_mut(&event_type) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|(handler_id, _)| *handler_id != id);
        let removed = handlers.len() != before;
        if handlers.is_empty() {
            subscribers.remove(&event_type);
        }
        removed
    }

    /// Invoke every subscriber of the event's topic, in subscription order,
    /// on the calling thread.
    pub fn publish(&self, event: &Event) {
        let event_type = event.event_type();
        let handlers: Vec<(SubscriberId, Handler)> = {
            let subscribers = self.subscribers.lock().unwrap();
            subscribers.get(&event_type).cloned().unwrap_or_default()
        };
        for (id, handler) in handlers {
            if let Err(err) = handler(event) {
                tracing::warn!(?event_type, subscriber = id.0, %err, "event handler failed");
            }
        }
    }

    #[must_use]
    pub fn subscriber_count(&self, event_type: EventType) -> usize {
        self.subscribers
            .lock()
            .unwrap()
            .get(&event_type)
            .map_or(0, Vec::len)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let subscribers = self.subscribers.lock().unwrap();
        let mut map = f.debug_map();
        for (event_type, handlers) in subscribers.iter() {
            map.entry(event_type, &handlers.len());
        }
        map.finish()
    }
}
