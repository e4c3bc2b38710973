// THEORY:
// The `BackgroundMotionDetector` is the perception half of the robot. It turns a
// stream of encoded frames into, at most, one `Detection` per call: the dominant
// moving region together with where it is relative to the robot.
//
// Per call:
// 1.  **Guard**: while a maneuver runs the robot itself is moving, so every pixel
//     would look like motion. The shared `moving` flag short-circuits the call and
//     leaves the model alone.
// 2.  **Preprocess**: decode, grayscale, Gaussian blur.
// 3.  **Seed / drift correction**: the first frame, a frame of a new size, or a
//     model that has seen `reseed_interval` scans becomes the new background. A
//     seeding call never reports motion.
// 4.  **Difference**: blend the frame into the running average, threshold the
//     absolute difference, dilate, and keep the largest 8-connected region.
// 5.  **Gate**: regions below `min_area`, or whose box is not larger than
//     `significant_area`, are noise.
// 6.  **Geometry**: bearing from the center offset scaled to the field of view plus
//     the head's own offset; distance from the inverse square root of the box area.
//
// The detector is owned by exactly one thread (the control loop) and needs no lock.
// Frames it cannot use are dropped, but never silently: when a `StatusBroadcaster`
// is attached, decode and overlay failures land in the status history, with runs
// of undecodable frames rate-limited.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use image::imageops;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::actuation::HeadPosition;
use crate::config::DetectorConfig;
use crate::core_modules::annotate::{EncodedImage, annotate};
use crate::core_modules::background_model::BackgroundModel;
use crate::core_modules::blob_detector::largest_blob;
use crate::core_modules::frame::FramePacket;
use crate::core_modules::smart_blob::{BoundingBox, Point};
use crate::status::{FaultCounter, StatusBroadcaster};

/// One accepted motion event, immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
    /// Horizontal angle to the object in degrees; positive is to the robot's right.
    pub bearing_x: f64,
    /// Vertical angle in degrees; positive is below the optical axis.
    pub bearing_y: f64,
    /// Relative distance, `k / sqrt(w * h)`; only comparable between detections.
    pub distance: f64,
    /// Pixel count of the region.
    pub area: usize,
    pub bbox: BoundingBox,
    pub center: Point,
    pub frame_center: Point,
    /// Head offset when the frame was analysed.
    pub head: HeadPosition,
    pub frame_id: u64,
    pub timestamp: DateTime<Utc>,
}

/// Background-subtraction motion detector.
pub struct BackgroundMotionDetector {
    config: DetectorConfig,
    model: Option<BackgroundModel>,
    head: HeadPosition,
    moving: Arc<AtomicBool>,
    status: Option<StatusBroadcaster>,
    decode_failures: FaultCounter,
}

impl BackgroundMotionDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            config,
            model: None,
            head: HeadPosition::default(),
            moving: Arc::new(AtomicBool::new(false)),
            status: None,
            decode_failures: FaultCounter::default(),
        }
    }

    /// Reports dropped frames and overlay failures to `status`.
    pub fn with_status(mut self, status: StatusBroadcaster) -> Self {
        self.status = Some(status);
        self
    }

    fn fault(&self, text: String) {
        if let Some(status) = &self.status {
            status.fault(text);
        }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Shared handle to the "robot is moving" guard. The executor sets it for the
    /// length of a maneuver.
    pub fn moving_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.moving)
    }

    pub fn is_moving(&self) -> bool {
        self.moving.load(Ordering::SeqCst)
    }

    /// Forgets the background; the next frame seeds a new one.
    pub fn reset(&mut self) {
        self.model = None;
        debug!("background model cleared");
    }

    /// Records where the head points, for the bearing bias.
    pub fn set_head_position(&mut self, head: HeadPosition) {
        self.head = head;
    }

    /// Analyses one frame.
    pub fn detect(&mut self, frame: &FramePacket) -> Option<Detection> {
        self.detect_annotated(frame).map(|(detection, _)| detection)
    }

    /// Analyses one frame and, when enabled, renders the diagnostic overlay.
    pub fn detect_annotated(&mut self, frame: &FramePacket) -> Option<(Detection, Option<EncodedImage>)> {
        if self.is_moving() {
            return None;
        }

        let decoded = match frame.decode() {
            Ok(decoded) => {
                self.decode_failures.succeed();
                decoded
            }
            Err(e) => {
                if let Some(consecutive_failures) = self.decode_failures.fail() {
                    warn!(frame_id = frame.frame_id, error = %e, consecutive_failures, "dropping undecodable frame");
                    self.fault(format!("Dropped undecodable frame {} ({consecutive_failures} in a row): {e}", frame.frame_id));
                }
                return None;
            }
        };

        let gray = decoded.to_luma8();
        let gray = if self.config.blur_sigma > 0.0 {
            imageops::blur(&gray, self.config.blur_sigma)
        } else {
            gray
        };

        if self.model.as_ref().is_none_or(|model| !model.matches(&gray)) {
            debug!(width = gray.width(), height = gray.height(), "seeding background model");
            self.model = Some(BackgroundModel::seed(&gray));
            return None;
        }
        let model = self.model.as_mut()?;

        if model.record_scan() >= self.config.reseed_interval {
            debug!(scans = self.config.reseed_interval, "reseeding background model");
            *model = BackgroundModel::seed(&gray);
            return None;
        }

        model.blend(&gray, self.config.alpha);
        let mask = model
            .difference_mask(&gray, self.config.diff_threshold)
            .dilate(self.config.dilate_iterations);
        let blob = largest_blob(&mask)?;

        if blob.area < self.config.min_area {
            return None;
        }
        if let Some(significant) = self.config.significant_area {
            if blob.bounding_box.area() <= significant {
                return None;
            }
        }

        let (width, height) = gray.dimensions();
        let bbox = blob.bounding_box;
        let center = bbox.center();
        let frame_center = Point {
            x: f64::from(width) / 2.0,
            y: f64::from(height) / 2.0,
        };
        let half_fov = self.config.fov_degrees / 2.0;
        let per_step = self.config.head_degrees_per_step;
        let bearing_x = (center.x - frame_center.x) / frame_center.x * half_fov + f64::from(self.head.x_steps) * per_step;
        let bearing_y = (center.y - frame_center.y) / frame_center.y * half_fov + f64::from(self.head.y_steps) * per_step;
        let distance = self.config.distance_constant / (bbox.area() as f64).sqrt();

        let detection = Detection {
            bearing_x,
            bearing_y,
            distance,
            area: blob.area,
            bbox,
            center,
            frame_center,
            head: self.head,
            frame_id: frame.frame_id,
            timestamp: Utc::now(),
        };
        info!(
            frame_id = frame.frame_id,
            bearing_x,
            bearing_y,
            distance,
            area = blob.area,
            "motion detected"
        );

        let image = if self.config.annotate {
            match annotate(&decoded.to_rgb8(), &detection) {
                Ok(image) => Some(image),
                Err(e) => {
                    warn!(error = %e, "failed to render detection overlay");
                    self.fault(format!("Detection overlay failed: {e}"));
                    None
                }
            }
        } else {
            None
        };

        Some((detection, image))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::frame::FrameFormat;
    use crate::synthetic::{Square, SyntheticScene};

    const W: u32 = 64;
    const H: u32 = 48;

    fn small_config() -> DetectorConfig {
        DetectorConfig {
            blur_sigma: 1.0,
            dilate_iterations: 1,
            min_area: 20,
            significant_area: None,
            reseed_interval: 30,
            annotate: false,
            ..DetectorConfig::default()
        }
    }

    fn empty(id: u64) -> FramePacket {
        SyntheticScene::new(W, H).render_packet(id).expect("render")
    }

    fn with_square(id: u64, cx: u32, cy: u32, size: u32) -> FramePacket {
        SyntheticScene::new(W, H)
            .with_square(Square::centered(cx, cy, size))
            .render_packet(id)
            .expect("render")
    }

    fn seeded(config: DetectorConfig) -> BackgroundMotionDetector {
        let mut detector = BackgroundMotionDetector::new(config);
        assert!(detector.detect(&empty(0)).is_none());
        detector
    }

    #[test]
    fn first_frame_only_seeds() {
        let mut detector = BackgroundMotionDetector::new(small_config());
        assert!(detector.detect(&with_square(0, 32, 24, 12)).is_none());
        // identical frame: nothing moved relative to the seed
        assert!(detector.detect(&with_square(1, 32, 24, 12)).is_none());
    }

    #[test]
    fn reset_forces_a_new_seed() {
        let mut detector = seeded(small_config());
        detector.reset();
        assert!(detector.detect(&with_square(1, 32, 24, 12)).is_none());
    }

    #[test]
    fn bearing_sign_follows_offset_from_center() {
        let mut left = seeded(small_config());
        let detection = left.detect(&with_square(1, 12, 24, 12)).expect("left motion");
        assert!(detection.bearing_x < 0.0, "bearing {}", detection.bearing_x);

        let mut right = seeded(small_config());
        let detection = right.detect(&with_square(1, 52, 24, 12)).expect("right motion");
        assert!(detection.bearing_x > 0.0, "bearing {}", detection.bearing_x);
        assert!(detection.bearing_x <= 30.0);
        assert_eq!(detection.frame_center, Point { x: 32.0, y: 24.0 });
    }

    #[test]
    fn distance_shrinks_as_the_region_grows() {
        let mut near = seeded(small_config());
        let big = near.detect(&with_square(1, 32, 24, 24)).expect("big");
        let mut far = seeded(small_config());
        let small = far.detect(&with_square(1, 32, 24, 8)).expect("small");
        assert!(big.distance < small.distance);
        assert!(big.bbox.area() > small.bbox.area());
    }

    #[test]
    fn head_offset_biases_bearing() {
        let mut centered = seeded(small_config());
        let base = centered.detect(&with_square(1, 32, 24, 12)).expect("motion");

        let mut turned = seeded(small_config());
        turned.set_head_position(HeadPosition::new(10, -4));
        let biased = turned.detect(&with_square(1, 32, 24, 12)).expect("motion");
        assert!((biased.bearing_x - base.bearing_x - 10.0).abs() < 1e-9);
        assert!((biased.bearing_y - base.bearing_y + 4.0).abs() < 1e-9);
        assert_eq!(biased.head, HeadPosition::new(10, -4));
    }

    #[test]
    fn reseed_interval_suppresses_a_stationary_blob() {
        let mut detector = seeded(DetectorConfig {
            reseed_interval: 3,
            ..small_config()
        });
        assert!(detector.detect(&with_square(1, 32, 24, 12)).is_some());
        assert!(detector.detect(&with_square(2, 32, 24, 12)).is_some());
        // third scan since the seed hits the interval
        assert!(detector.detect(&with_square(3, 32, 24, 12)).is_none());
        // the blob is now part of the background
        assert!(detector.detect(&with_square(4, 32, 24, 12)).is_none());
    }

    #[test]
    fn area_gates_reject_small_regions() {
        let mut strict = seeded(DetectorConfig {
            min_area: 10_000,
            ..small_config()
        });
        assert!(strict.detect(&with_square(1, 32, 24, 12)).is_none());

        let mut significant = seeded(DetectorConfig {
            significant_area: Some(40 * 40),
            ..small_config()
        });
        assert!(significant.detect(&with_square(1, 32, 24, 12)).is_none());
    }

    #[test]
    fn moving_guard_skips_detection_and_keeps_model() {
        let mut detector = seeded(small_config());
        let moving = detector.moving_flag();
        moving.store(true, Ordering::SeqCst);
        assert!(detector.detect(&with_square(1, 32, 24, 12)).is_none());
        moving.store(false, Ordering::SeqCst);
        // the model was not replaced by the guarded frame
        assert!(detector.detect(&with_square(2, 32, 24, 12)).is_some());
    }

    #[test]
    fn size_change_reseeds() {
        let mut detector = seeded(small_config());
        let bigger = SyntheticScene::new(W * 2, H * 2)
            .with_square(Square::centered(64, 48, 12))
            .render_packet(1)
            .expect("render");
        assert!(detector.detect(&bigger).is_none());
    }

    #[test]
    fn undecodable_frame_is_skipped_and_reported_once_per_run() {
        let status = StatusBroadcaster::new(32);
        let mut detector = seeded(small_config()).with_status(status.clone());
        for id in 1..=5 {
            let junk = FramePacket::new(id, W, H, FrameFormat::Png, vec![0; 16]);
            assert!(detector.detect(&junk).is_none());
        }
        assert!(detector.detect(&with_square(6, 32, 24, 12)).is_some());

        let history = status.snapshot().history;
        let dropped: Vec<_> = history.iter().filter(|l| l.contains("Error: Dropped undecodable frame")).collect();
        assert_eq!(dropped.len(), 1, "history: {history:?}");
        assert!(dropped[0].contains("frame 1 (1 in a row)"));

        // a good frame ends the run, so the next bad one is reported again
        let junk = FramePacket::new(7, W, H, FrameFormat::Png, vec![0; 16]);
        assert!(detector.detect(&junk).is_none());
        let history = status.snapshot().history;
        assert!(history.back().is_some_and(|l| l.contains("frame 7 (1 in a row)")));
    }

    /// Feeds a growing square whose fixed edge sits on one side of the frame and
    /// checks every hit, not just a pair.
    fn approach(detector: &mut BackgroundMotionDetector, squares: &[(u32, u32)]) -> Vec<Detection> {
        let (w, h) = (W * 2, H * 2);
        assert!(detector.detect(&SyntheticScene::new(w, h).render_packet(0).expect("render")).is_none());
        squares
            .iter()
            .zip(1u64..)
            .map(|(&(cx, size), id)| {
                let frame = SyntheticScene::new(w, h)
                    .with_square(Square::centered(cx, h / 2, size))
                    .render_packet(id)
                    .expect("render");
                detector.detect(&frame).expect("motion on every frame")
            })
            .collect()
    }

    #[test]
    fn an_approaching_object_keeps_its_side_and_gets_closer() {
        let mut detector = BackgroundMotionDetector::new(small_config());

        // right of center, left edge pinned at x = 71
        let right = approach(&mut detector, &[(76, 10), (79, 16), (82, 22), (85, 28)]);
        assert_eq!(right.len(), 4);
        assert!(right.iter().all(|d| d.bearing_x > 0.0), "{right:?}");
        assert!(right.windows(2).all(|p| p[1].distance < p[0].distance), "{right:?}");

        // same detector, mirrored: right edge pinned at x = 57
        detector.reset();
        let left = approach(&mut detector, &[(52, 10), (49, 16), (46, 22), (43, 28)]);
        assert_eq!(left.len(), 4);
        assert!(left.iter().all(|d| d.bearing_x < 0.0), "{left:?}");
        assert!(left.windows(2).all(|p| p[1].distance < p[0].distance), "{left:?}");
    }

    #[test]
    fn detection_serializes_for_the_dashboard() {
        let mut detector = seeded(small_config());
        let detection = detector.detect(&with_square(1, 40, 24, 12)).expect("motion");
        let json = serde_json::to_value(&detection).expect("json");
        assert_eq!(json["frame_id"], 1);
        assert!(json["bearing_x"].as_f64().is_some_and(|b| b > 0.0));
        assert!(json["bbox"]["w"].as_u64().is_some());
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn annotation_accompanies_detection_when_enabled() {
        let mut detector = seeded(DetectorConfig {
            annotate: true,
            ..small_config()
        });
        let (_, image) = detector.detect_annotated(&with_square(1, 40, 24, 12)).expect("motion");
        assert!(image.is_some());
    }
}
