//! Error types for the robot core.

use thiserror::Error;

use crate::actuation::Leg;

/// Result type for robot operations.
pub type RobotResult<T> = Result<T, RobotError>;

/// Failures reported by an actuator or indicator driver.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ActuatorError {
    #[error("servo for leg {leg} failed: {reason}")]
    Servo { leg: Leg, reason: String },

    #[error("head servo failed: {0}")]
    Head(String),

    #[error("actuator bus fault: {0}")]
    Bus(String),

    #[error("indicator fault: {0}")]
    Indicator(String),
}

impl ActuatorError {
    pub fn servo(leg: Leg, reason: impl Into<String>) -> Self {
        Self::Servo {
            leg,
            reason: reason.into(),
        }
    }

    pub fn bus(reason: impl Into<String>) -> Self {
        Self::Bus(reason.into())
    }
}

/// Errors that can escape a scan/act cycle or the runtime.
#[derive(Debug, Error)]
pub enum RobotError {
    #[error("camera unavailable: {0}")]
    CameraUnavailable(String),

    #[error("frame decode failed: {0}")]
    FrameDecode(#[from] image::ImageError),

    #[error("actuator failure: {0}")]
    Actuator(#[from] ActuatorError),

    #[error("maneuver worker panicked: {0}")]
    WorkerPanicked(String),

    #[error("invalid configuration for {key}: {reason}")]
    Config { key: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RobotError {
    pub fn camera(reason: impl Into<String>) -> Self {
        Self::CameraUnavailable(reason.into())
    }

    /// Converts a panic payload from a joined thread into an error.
    pub fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        Self::WorkerPanicked(message)
    }
}
