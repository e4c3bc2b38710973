// THEORY:
// A `MotionBlob` is a single connected region of the dilated difference mask in one
// frame. It is a "dumb" data container: a bounding box, a pixel count and nothing
// about the past. The detector keeps only the largest one per frame.

use serde::{Deserialize, Serialize};

/// A point in image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

/// An axis-aligned box in image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl BoundingBox {
    pub fn area(&self) -> u64 {
        u64::from(self.w) * u64::from(self.h)
    }

    pub fn center(&self) -> Point {
        Point {
            x: f64::from(self.x) + f64::from(self.w) / 2.0,
            y: f64::from(self.y) + f64::from(self.h) / 2.0,
        }
    }
}

/// One spatially coherent region of motion.
#[derive(Debug, Clone, PartialEq)]
pub struct MotionBlob {
    /// Smallest box enclosing every pixel of the region.
    pub bounding_box: BoundingBox,
    /// Number of mask pixels in the region; stands in for enclosed contour area.
    pub area: usize,
}
