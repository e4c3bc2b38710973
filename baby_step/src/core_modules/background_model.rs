// THEORY:
// The `BackgroundModel` is the detector's memory of the static scene. Each pixel
// holds a floating-point running average of its blurred grayscale value. New frames
// are blended in with an exponential weight `alpha`: a high alpha adapts quickly to
// slow lighting drift but also absorbs slow-moving objects into the "background".
//
// The model is purely temporal, like a per-pixel version of a learning chunk: it
// knows *that* a pixel deviates from what it has seen, not which pixels belong
// together. Grouping the deviations into regions is the blob detector's job.

use image::GrayImage;

use crate::core_modules::blob_detector::MotionMask;

/// A per-pixel running average of the scene, owned by exactly one detector.
#[derive(Debug, Clone)]
pub struct BackgroundModel {
    width: u32,
    height: u32,
    pixels: Vec<f32>,
    /// Frames blended in since the model was last seeded.
    scans_since_seed: u32,
}

impl BackgroundModel {
    /// Seeds a fresh model from one frame.
    pub fn seed(frame: &GrayImage) -> Self {
        Self {
            width: frame.width(),
            height: frame.height(),
            pixels: frame.as_raw().iter().map(|&v| f32::from(v)).collect(),
            scans_since_seed: 0,
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// True when `frame` can be compared against this model.
    pub fn matches(&self, frame: &GrayImage) -> bool {
        frame.dimensions() == (self.width, self.height)
    }

    pub fn scans_since_seed(&self) -> u32 {
        self.scans_since_seed
    }

    /// Counts one more scan against this model and returns the new count.
    pub fn record_scan(&mut self) -> u32 {
        self.scans_since_seed += 1;
        self.scans_since_seed
    }

    /// Exponentially blends `frame` into the model in place.
    pub fn blend(&mut self, frame: &GrayImage, alpha: f32) {
        debug_assert!(self.matches(frame));
        let keep = 1.0 - alpha;
        for (model, &value) in self.pixels.iter_mut().zip(frame.as_raw()) {
            *model = keep * *model + alpha * f32::from(value);
        }
    }

    /// Marks every pixel whose absolute difference from the model exceeds `threshold`.
    pub fn difference_mask(&self, frame: &GrayImage, threshold: f32) -> MotionMask {
        let bits = self
            .pixels
            .iter()
            .zip(frame.as_raw())
            .map(|(&model, &value)| (f32::from(value) - model).abs() > threshold)
            .collect();
        MotionMask::new(self.width, self.height, bits)
    }

    /// Mean model intensity, handy for diagnostics.
    pub fn mean(&self) -> f32 {
        if self.pixels.is_empty() {
            return 0.0;
        }
        self.pixels.iter().sum::<f32>() / self.pixels.len() as f32
    }
}
