//! Shared data model for the invigil exam-proctoring node.
//!
//! This crate carries only plain types used across the pipeline crates. It
//! has no runtime logic so that every other member can depend on it without
//! pulling in the async or image stacks.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Index into the configured class-name / class-color palette.
pub type ClassId = usize;

/// Identifier of a seat, equal to the final track id from calibration.
pub type SeatId = u32;

/// Mapping from seat id to seat center `(x, y)` in original-frame pixels.
///
/// A `BTreeMap` so that iteration (and thus every API response built from
/// it) is ordered by seat id.
pub type SeatMap = BTreeMap<SeatId, (i32, i32)>;

/// An owned image buffer in BGR order, one byte per channel.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    pub width: usize,
    pub height: usize,
    /// Packed BGR8 pixel data, row major, `width * height * 3` bytes.
    pub data: Vec<u8>,
}

impl Frame {
    pub fn new(width: usize, height: usize, data: Vec<u8>) -> Self {
        debug_assert_eq!(data.len(), width * height * 3);
        Self {
            width,
            height,
            data,
        }
    }

    /// An all-black frame of the given dimensions.
    pub fn black(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            data: vec![0u8; width * height * 3],
        }
    }

    /// Byte offset of the pixel at `(x, y)`.
    #[inline]
    pub fn offset(&self, x: usize, y: usize) -> usize {
        (y * self.width + x) * 3
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Frame {{ {}x{} }}", self.width, self.height)
    }
}

/// A detection in original-frame pixel coordinates.
///
/// Invariants: `x1 < x2`, `y1 < y2`, all coordinates clipped to the image
/// bounds before the box enters the pipeline. The order of boxes within a
/// frame follows the NMS keep order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectionBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
    pub score: f32,
}

impl DetectionBox {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32, score: f32) -> Self {
        Self {
            x1,
            y1,
            x2,
            y2,
            score,
        }
    }

    /// Center of the box in subpixel coordinates.
    #[inline]
    pub fn center(&self) -> (f64, f64) {
        (
            (self.x1 + self.x2) as f64 / 2.0,
            (self.y1 + self.y2) as f64 / 2.0,
        )
    }

    #[inline]
    pub fn width(&self) -> i32 {
        self.x2 - self.x1
    }

    #[inline]
    pub fn height(&self) -> i32 {
        self.y2 - self.y1
    }

    #[inline]
    pub fn area(&self) -> i64 {
        self.width().max(0) as i64 * self.height().max(0) as i64
    }

    /// Intersection over union with another box, in `[0, 1]`.
    pub fn iou(&self, other: &DetectionBox) -> f64 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);
        let iw = (ix2 - ix1).max(0) as i64;
        let ih = (iy2 - iy1).max(0) as i64;
        let inter = iw * ih;
        let union = self.area() + other.area() - inter;
        if union <= 0 {
            0.0
        } else {
            inter as f64 / union as f64
        }
    }
}

/// Class names and BGR draw colors, as configured.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassPalette {
    pub names: Vec<String>,
    /// One `[b, g, r]` triple per class.
    pub colors: Vec<[u8; 3]>,
}

impl ClassPalette {
    pub fn name(&self, id: ClassId) -> &str {
        self.names.get(id).map(String::as_str).unwrap_or("Unknown")
    }

    /// Draw color for a class; unknown classes fall back to green.
    pub fn color(&self, id: ClassId) -> [u8; 3] {
        self.colors.get(id).copied().unwrap_or([0, 255, 0])
    }
}

/// An evidence snapshot queued for upload to the control center.
#[derive(Debug, Clone)]
pub struct AlertUpload {
    pub room_id: i64,
    pub exam_id: Option<i64>,
    pub class_id: ClassId,
    pub seat_id: SeatId,
    pub x: i32,
    pub y: i32,
    pub jpeg: bytes::Bytes,
}
