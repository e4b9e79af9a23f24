// SPDX-License-Identifier: MPL-2.0

//! Data carried between pipeline stages.
//!
//! Frames and detection batches are immutable once constructed and travel
//! through the event bus in `Arc`s, so fan-out to multiple subscribers
//! never copies pixel data.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use image::RgbImage;
use ndarray::{Array1, Array2};

use crate::error::ShapeError;

/// One decoded color frame (plus optional aligned depth) from a device.
///
/// `frame_id` is the per-device monotonic sequence number shared with the
/// detection batch computed from the same capture.
#[derive(Clone)]
pub struct VideoFrame {
    pub device_id: String,
    pub frame_id: u64,
    pub rgb: RgbImage,
    /// aligned depth plane in millimeters, when depth output is enabled
    pub depth: Option<Array2<u16>>,
    pub captured_at: Instant,
}

impl VideoFrame {
    pub fn new(device_id: impl Into<String>, frame_id: u64, rgb: RgbImage) -> Self {
        Self {
            device_id: device_id.into(),
            frame_id,
            rgb,
            depth: None,
            captured_at: Instant::now(),
        }
    }

    #[must_use]
    pub fn with_depth(mut self, depth: Array2<u16>) -> Self {
        self.depth = Some(depth);
        self
    }
}

impl fmt::Debug for VideoFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VideoFrame")
            .field("device_id", &self.device_id)
            .field("frame_id", &self.frame_id)
            .field("rgb", &format_args!("{}x{}", self.rgb.width(), self.rgb.height()))
            .field("depth", &self.depth.as_ref().map(|d| d.dim()))
            .finish()
    }
}

/// Object status class attached to each detection by the decision step.
///
/// Integer-valued so batches can carry states in a dense array; values are
/// segmented by kind (objects 0–99, humans 100–199).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum DetectionStatus {
    ObjectGraspable = 0,
    ObjectDangerous = 1,
    ObjectOutOfRange = 2,
    ObjectPendingGrasp = 3,
    HumanSafe = 100,
    HumanDangerous = 101,
}

impl DetectionStatus {
    #[must_use]
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::ObjectGraspable),
            1 => Some(Self::ObjectDangerous),
            2 => Some(Self::ObjectOutOfRange),
            3 => Some(Self::ObjectPendingGrasp),
            100 => Some(Self::HumanSafe),
            101 => Some(Self::HumanDangerous),
            _ => None,
        }
    }
}

/// One detection row, used to assemble batches in producers and tests.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawDetection {
    /// class index into the configured label map
    pub label: i32,
    /// (xmin, ymin, xmax, ymax), normalized to [0, 1]
    pub bbox: [f32; 4],
    pub confidence: f32,
    /// camera-space coordinates in millimeters
    pub coords: [f32; 3],
}

/// Dense per-frame detection arrays.
///
/// All arrays share length `n`. Raw batches carry network output; after the
/// filtering stage the coordinates are smoothed and the rows are grouped by
/// label. `states` is populated by the external decision step and passes
/// through the core untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionBatch {
    pub labels: Array1<i32>,
    /// (n, 4) normalized corner boxes
    pub bboxes: Array2<f32>,
    pub confidences: Array1<f32>,
    /// (n, 3) millimeter coordinates
    pub coords: Array2<f32>,
    pub states: Array1<i32>,
}

impl DetectionBatch {
    pub fn new(
        labels: Array1<i32>,
        bboxes: Array2<f32>,
        confidences: Array1<f32>,
        coords: Array2<f32>,
        states: Array1<i32>,
    ) -> Result<Self, ShapeError> {
        let n = labels.len();
        if bboxes.nrows() != n || confidences.len() != n || coords.nrows() != n || states.len() != n
        {
            return Err(ShapeError(format!(
                "labels={n} bboxes={} confidences={} coords={} states={}",
                bboxes.nrows(),
                confidences.len(),
                coords.nrows(),
                states.len()
            )));
        }
        if n > 0 && (bboxes.ncols() != 4 || coords.ncols() != 3) {
            return Err(ShapeError(format!(
                "expected bboxes (n,4) and coords (n,3), got (n,{}) and (n,{})",
                bboxes.ncols(),
                coords.ncols()
            )));
        }
        Ok(Self {
            labels,
            bboxes,
            confidences,
            coords,
            states,
        })
    }

    #[must_use]
    pub fn empty() -> Self {
        Self {
            labels: Array1::zeros(0),
            bboxes: Array2::zeros((0, 4)),
            confidences: Array1::zeros(0),
            coords: Array2::zeros((0, 3)),
            states: Array1::zeros(0),
        }
    }

    /// Assemble a batch from detection rows, with states zeroed.
    #[must_use]
    pub fn from_rows(rows: &[RawDetection]) -> Self {
        let n = rows.len();
        let mut batch = Self {
            labels: Array1::zeros(n),
            bboxes: Array2::zeros((n, 4)),
            confidences: Array1::zeros(n),
            coords: Array2::zeros((n, 3)),
            states: Array1::zeros(n),
        };
        for (i, row) in rows.iter().enumerate() {
            batch.labels[i] = row.label;
            batch.confidences[i] = row.confidence;
            for (j, v) in row.bbox.iter().enumerate() {
                batch.bboxes[[i, j]] = *v;
            }
            for (j, v) in row.coords.iter().enumerate() {
                batch.coords[[i, j]] = *v;
            }
        }
        batch
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// A detection batch bound to its producing device and frame.
#[derive(Debug, Clone)]
pub struct DeviceDetections {
    pub device_id: String,
    pub frame_id: u64,
    pub batch: DetectionBatch,
    pub produced_at: Instant,
}

impl DeviceDetections {
    pub fn new(device_id: impl Into<String>, frame_id: u64, batch: DetectionBatch) -> Self {
        Self {
            device_id: device_id.into(),
            frame_id,
            batch,
            produced_at: Instant::now(),
        }
    }
}

/// A paired frame and its processed detections, ready to rasterize.
///
/// Pairing guarantees both sides refer to the same `(device_id, frame_id)`.
#[derive(Debug, Clone)]
pub struct RenderPacket {
    pub video: Arc<VideoFrame>,
    pub detections: Arc<DeviceDetections>,
}

impl RenderPacket {
    pub fn new(video: Arc<VideoFrame>, detections: Arc<DeviceDetections>) -> Self {
        debug_assert_eq!(video.device_id, detections.device_id);
        debug_assert_eq!(video.frame_id, detections.frame_id);
        Self { video, detections }
    }

    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.video.device_id
    }

    #[must_use]
    pub fn frame_id(&self) -> u64 {
        self.video.frame_id
    }
}

/// Which half of a render pair an event carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Video,
    Detections,
}

impl fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Video => f.write_str("video"),
            Self::Detections => f.write_str("detections"),
        }
    }
}

/// Tagged input to the pairing stage.
#[derive(Debug, Clone)]
pub enum RawEvent {
    Video(Arc<VideoFrame>),
    Detections(Arc<DeviceDetections>),
}

impl RawEvent {
    #[must_use]
    pub fn device_id(&self) -> &str {
        match self {
            Self::Video(frame) => &frame.device_id,
            Self::Detections(batch) => &batch.device_id,
        }
    }

    #[must_use]
    pub fn frame_id(&self) -> u64 {
        match self {
            Self::Video(frame) => frame.frame_id,
            Self::Detections(batch) => batch.frame_id,
        }
    }

    #[must_use]
    pub fn kind(&self) -> PayloadKind {
        match self {
            Self::Video(_) => PayloadKind::Video,
            Self::Detections(_) => PayloadKind::Detections,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn batch_rejects_mismatched_arrays() {
        let err = DetectionBatch::new(
            array![0, 1],
            Array2::zeros((2, 4)),
            array![0.9],
            Array2::zeros((2, 3)),
            array![0, 0],
        );
        assert!(err.is_err());
    }

    #[test]
    fn batch_from_rows_round_trips_fields() {
        let rows = [RawDetection {
            label: 3,
            bbox: [0.1, 0.2, 0.3, 0.4],
            confidence: 0.75,
            coords: [100.0, -50.0, 1200.0],
        }];
        let batch = DetectionBatch::from_rows(&rows);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.labels[0], 3);
        assert_eq!(batch.bboxes[[0, 3]], 0.4);
        assert_eq!(batch.coords[[0, 2]], 1200.0);
        assert_eq!(batch.states[0], 0);
    }

    #[test]
    fn status_round_trips_through_i32() {
        for status in [
            DetectionStatus::ObjectGraspable,
            DetectionStatus::ObjectPendingGrasp,
            DetectionStatus::HumanDangerous,
        ] {
            assert_eq!(DetectionStatus::from_i32(status as i32), Some(status));
        }
        assert_eq!(DetectionStatus::from_i32(42), None);
    }

    #[test]
    fn raw_event_exposes_pair_key() {
        let frame = Arc::new(VideoFrame::new("dev-a", 7, RgbImage::new(4, 4)));
        let event = RawEvent::Video(frame);
        assert_eq!(event.device_id(), "dev-a");
        assert_eq!(event.frame_id(), 7);
        assert_eq!(event.kind(), PayloadKind::Video);
    }
}
