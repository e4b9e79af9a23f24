// SPDX-License-Identifier: MPL-2.0

//! Error taxonomy for the streaming core.
//!
//! Only failures that cross an API boundary get a type. Everything the
//! worker loops can survive (duplicate payloads, provider hiccups, handler
//! failures) is logged at the point of occurrence and the loop continues.

use thiserror::Error;

/// Construction-time validation failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("queue capacity must be > 0")]
    ZeroCapacity,
}

/// Mismatched parallel arrays in a detection batch.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("detection batch arrays disagree: {0}")]
pub struct ShapeError(pub String);

/// Failures registering a queue with the backpressure monitor.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegisterError {
    #[error("queue id already registered: {0}")]
    DuplicateId(String),
}

/// Failures initializing a process-wide singleton.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InitError {
    #[error("backpressure monitor already initialized with a different config")]
    ConflictingConfig,
}

/// Non-blocking and bounded-wait dequeue failures.
#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum RecvError {
    #[error("queue is empty")]
    Empty,
    #[error("timed out waiting for an item")]
    Timeout,
}
