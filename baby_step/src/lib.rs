// THEORY:
// This file is the entry point for the `baby_step` library crate: the perception to
// actuation control loop of a small four-legged robot.
//
// The public surface is small. A binary builds a `RobotConfig`, an `ActuationGate`
// around its servo driver, a `StatusBroadcaster`, and hands them with a camera to
// `Robot::start`. Everything else (the detector, the executor, the scan/act loop) is
// reachable for tests and tooling but wired together by the runtime.
//
// Hardware is always behind a trait (`CameraDevice`, `Actuator`, `Indicator`), and
// every trait has a simulated implementation here so the full loop runs on a desk.

pub mod actuation;
pub mod config;
pub mod core_modules;
pub mod error;
pub mod movement;
pub mod pipeline;
pub mod runtime;
pub mod status;

pub use core_modules::{annotate, frame, motion_detector, synthetic};

pub use actuation::{ActuationGate, Actuator, HeadPosition, Indicator, IndicatorState, LoggingIndicator, SimulatedActuator};
pub use config::{ControlConfig, DetectorConfig, ExecutorConfig, RobotConfig};
pub use error::{ActuatorError, RobotError, RobotResult};
pub use frame::{FrameFormat, FramePacket, FrameSource, LatestFrame};
pub use motion_detector::{BackgroundMotionDetector, Detection};
pub use movement::{MovementExecutor, MovementPlan, Pose};
pub use runtime::{CameraDevice, Robot, ShutdownToken};
pub use status::{StatusBroadcaster, StatusSnapshot};
