//! Tunable behaviour for the detector, the executor and the control loop.
//!
//! The thresholds, smoothing weight and field of view drifted between revisions of
//! the robot without a documented policy, so none of them is hard-coded: every knob
//! has a default here and can be overridden from `BABY_*` environment variables.

use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::error::{RobotError, RobotResult};

/// Configuration for the background-model motion detector.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorConfig {
    /// Gaussian blur sigma applied to the grayscale frame (3.5 is roughly a 21x21 kernel).
    pub blur_sigma: f32,
    /// Weight of the new frame when blending into the background model.
    pub alpha: f32,
    /// Absolute grayscale difference above which a pixel counts as moving.
    pub diff_threshold: f32,
    /// Number of 3x3 dilation passes applied to the difference mask.
    pub dilate_iterations: u32,
    /// Smallest region, in mask pixels, that can count as motion.
    pub min_area: usize,
    /// Stricter gate: the bounding box area must exceed this. `None` disables it.
    pub significant_area: Option<u64>,
    /// Scans after which the model is reseeded even without a detection.
    pub reseed_interval: u32,
    /// Nominal horizontal and vertical field of view of the camera.
    pub fov_degrees: f64,
    /// Proportionality constant of the inverse-sqrt distance estimate.
    pub distance_constant: f64,
    /// Bearing bias contributed by each head servo step away from center.
    pub head_degrees_per_step: f64,
    /// Render a diagnostic overlay for every detection.
    pub annotate: bool,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            blur_sigma: 3.5,
            alpha: 0.3,
            diff_threshold: 25.0,
            dilate_iterations: 2,
            min_area: 500,
            significant_area: Some(5_000),
            reseed_interval: 30,
            fov_degrees: 60.0,
            distance_constant: 100.0,
            head_degrees_per_step: 1.0,
            annotate: true,
        }
    }
}

/// Configuration for maneuver planning and step pacing.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorConfig {
    /// Servo speed passed with every leg step.
    pub speed: u8,
    /// Pause between legs inside one step cycle (gate held).
    pub leg_delay: Duration,
    /// Pause between step cycles (gate released).
    pub step_delay: Duration,
    /// Wall-clock length of the advance phase.
    pub advance_duration: Duration,
    /// Bearings at or below this magnitude need no turn.
    pub turn_deadband_degrees: f64,
    pub degrees_per_turn_step: f64,
    pub max_turn_steps: u32,
    /// Pause after each head move of the self-test routine.
    pub head_settle: Duration,
    /// Head excursion, in steps, used by the self-test routine.
    pub self_test_look_steps: i32,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            speed: 35,
            leg_delay: Duration::from_millis(100),
            step_delay: Duration::from_millis(50),
            advance_duration: Duration::from_secs(2),
            turn_deadband_degrees: 5.0,
            degrees_per_turn_step: 10.0,
            max_turn_steps: 4,
            head_settle: Duration::from_millis(500),
            self_test_look_steps: 30,
        }
    }
}

/// Configuration for the supervising scan/act loop.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlConfig {
    /// Pause between scans that found nothing.
    pub scan_interval: Duration,
    /// Pause when the frame source has nothing to offer.
    pub frame_wait: Duration,
    /// Pacing of the capture pump.
    pub capture_interval: Duration,
    /// Number of lines kept in the status history.
    pub status_history: usize,
    /// Run the startup movement routine before the first scan.
    pub self_test: bool,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_millis(50),
            frame_wait: Duration::from_millis(100),
            capture_interval: Duration::from_millis(33),
            status_history: 10,
            self_test: false,
        }
    }
}

/// Complete robot configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RobotConfig {
    pub detector: DetectorConfig,
    pub executor: ExecutorConfig,
    pub control: ControlConfig,
}

impl RobotConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create config from an arbitrary key lookup; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = DetectorConfig::default();
        let e = ExecutorConfig::default();
        let c = ControlConfig::default();

        let significant_area = match lookup("BABY_SIGNIFICANT_AREA") {
            Some(raw) if raw.trim().eq_ignore_ascii_case("off") || raw.trim() == "0" => None,
            Some(_) => Some(parse_or(&lookup, "BABY_SIGNIFICANT_AREA", d.significant_area.unwrap_or(0))),
            None => d.significant_area,
        };

        Self {
            detector: DetectorConfig {
                blur_sigma: parse_or(&lookup, "BABY_BLUR_SIGMA", d.blur_sigma),
                alpha: parse_or(&lookup, "BABY_ALPHA", d.alpha),
                diff_threshold: parse_or(&lookup, "BABY_DIFF_THRESHOLD", d.diff_threshold),
                dilate_iterations: parse_or(&lookup, "BABY_DILATE_ITERATIONS", d.dilate_iterations),
                min_area: parse_or(&lookup, "BABY_MIN_AREA", d.min_area),
                significant_area,
                reseed_interval: parse_or(&lookup, "BABY_RESEED_INTERVAL", d.reseed_interval),
                fov_degrees: parse_or(&lookup, "BABY_FOV_DEGREES", d.fov_degrees),
                distance_constant: parse_or(&lookup, "BABY_DISTANCE_CONSTANT", d.distance_constant),
                head_degrees_per_step: parse_or(&lookup, "BABY_HEAD_DEGREES_PER_STEP", d.head_degrees_per_step),
                annotate: parse_flag(&lookup, "BABY_ANNOTATE", d.annotate),
            },
            executor: ExecutorConfig {
                speed: parse_or(&lookup, "BABY_STEP_SPEED", e.speed),
                leg_delay: parse_millis(&lookup, "BABY_LEG_DELAY_MS", e.leg_delay),
                step_delay: parse_millis(&lookup, "BABY_STEP_DELAY_MS", e.step_delay),
                advance_duration: parse_millis(&lookup, "BABY_ADVANCE_MS", e.advance_duration),
                ..e
            },
            control: ControlConfig {
                scan_interval: parse_millis(&lookup, "BABY_SCAN_INTERVAL_MS", c.scan_interval),
                frame_wait: parse_millis(&lookup, "BABY_FRAME_WAIT_MS", c.frame_wait),
                capture_interval: parse_millis(&lookup, "BABY_CAPTURE_INTERVAL_MS", c.capture_interval),
                status_history: parse_or(&lookup, "BABY_STATUS_HISTORY", c.status_history),
                self_test: parse_flag(&lookup, "BABY_SELF_TEST", c.self_test),
            },
        }
    }

    /// Rejects values the detector or executor cannot work with.
    pub fn validate(&self) -> RobotResult<()> {
        let d = &self.detector;
        if !(d.alpha > 0.0 && d.alpha <= 1.0) {
            return Err(invalid("alpha", format!("{} is outside (0, 1]", d.alpha)));
        }
        if !(d.fov_degrees > 0.0 && d.fov_degrees < 180.0) {
            return Err(invalid("fov_degrees", format!("{} is outside (0, 180)", d.fov_degrees)));
        }
        if d.blur_sigma < 0.0 {
            return Err(invalid("blur_sigma", "must not be negative"));
        }
        if d.reseed_interval == 0 {
            return Err(invalid("reseed_interval", "must be at least 1"));
        }
        if self.executor.degrees_per_turn_step <= 0.0 {
            return Err(invalid("degrees_per_turn_step", "must be positive"));
        }
        if self.control.status_history == 0 {
            return Err(invalid("status_history", "must keep at least one line"));
        }
        Ok(())
    }
}

fn invalid(key: &str, reason: impl Into<String>) -> RobotError {
    RobotError::Config {
        key: key.to_string(),
        reason: reason.into(),
    }
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match lookup(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, "unparsable configuration value, using default");
            default
        }),
        None => default,
    }
}

fn parse_millis(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: Duration) -> Duration {
    Duration::from_millis(parse_or(lookup, key, default.as_millis() as u64))
}

fn parse_flag(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> bool {
    match lookup(key) {
        Some(raw) => matches!(raw.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        None => default,
    }
}
