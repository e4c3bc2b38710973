// THEORY:
// The `ControlLoop` is the top-level behaviour of the robot. It alternates between
// two phases until shutdown:
//
// 1.  **Scan**: if an earlier detection recorded where the head was pointing, look
//     back there, forget the old background, then feed frames to the detector until
//     it reports motion. Missing frames are skipped.
// 2.  **Act**: publish the detection and hand it to the `MovementExecutor` on a
//     scoped worker thread. The worker is joined before scanning resumes, so there
//     is never more than one maneuver in flight.
//
// Failures are contained at the cycle boundary. An error or a panic anywhere in a
// cycle is recorded in the status history, the legs are forced to stand, the
// detector is reset and the next cycle starts. Only shutdown ends the loop, and on
// the way out the actuators are neutralised through the gate. Failures that do not
// end a cycle (a stand that did not take, a dead status LED) still reach the status
// history.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use tracing::{error, info, warn};

use crate::actuation::{ActuationGate, HeadPosition, Indicator, IndicatorState};
use crate::config::{ControlConfig, RobotConfig};
use crate::core_modules::frame::FrameSource;
use crate::core_modules::motion_detector::BackgroundMotionDetector;
use crate::error::{RobotError, RobotResult};
use crate::movement::{MovementExecutor, Pose};
use crate::runtime::ShutdownToken;
use crate::status::{DetectionEvent, FaultCounter, StatusBroadcaster, StatusEvent};

/// The supervising scan/act loop.
pub struct ControlLoop {
    frames: Arc<dyn FrameSource>,
    detector: BackgroundMotionDetector,
    executor: MovementExecutor,
    indicator: Box<dyn Indicator>,
    gate: Arc<ActuationGate>,
    status: StatusBroadcaster,
    shutdown: ShutdownToken,
    config: ControlConfig,
    /// Head offset of the last accepted detection.
    last_head: Option<HeadPosition>,
    indicator_failures: FaultCounter,
}

impl ControlLoop {
    pub fn new(
        config: &RobotConfig,
        frames: Arc<dyn FrameSource>,
        gate: Arc<ActuationGate>,
        indicator: Box<dyn Indicator>,
        status: StatusBroadcaster,
        shutdown: ShutdownToken,
    ) -> Self {
        let detector = BackgroundMotionDetector::new(config.detector.clone()).with_status(status.clone());
        let executor = MovementExecutor::new(
            Arc::clone(&gate),
            status.clone(),
            detector.moving_flag(),
            config.executor.clone(),
        );
        Self {
            frames,
            detector,
            executor,
            indicator,
            gate,
            status,
            shutdown,
            config: config.control.clone(),
            last_head: None,
            indicator_failures: FaultCounter::default(),
        }
    }

    /// Runs until the shutdown token fires, then neutralises the actuators.
    pub fn run(mut self) {
        info!("control loop started");
        if self.config.self_test {
            if let Err(e) = self.executor.run_self_test() {
                warn!(error = %e, "self-test failed");
                self.status.fault(format!("Self-test failed: {e}"));
            }
        }

        while !self.shutdown.is_triggered() {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.cycle()));
            let failure = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e),
                Err(payload) => Some(RobotError::from_panic(payload)),
            };
            if let Some(e) = failure {
                self.recover(&e);
            }
        }

        self.neutralize();
    }

    /// One scan phase followed, if something moved, by one act phase.
    fn cycle(&mut self) -> RobotResult<()> {
        if let Some(target) = self.last_head {
            if let Err(e) = self.executor.reposition_head(target) {
                warn!(error = %e, "head reposition failed");
                self.status.fault(format!("Head reposition failed: {e}"));
            }
        }
        self.detector.reset();
        self.detector.set_head_position(self.gate.head_position());
        self.indicate(IndicatorState::Scanning);
        self.status.status("Scanning for motion");

        let (detection, image) = loop {
            if self.shutdown.is_triggered() {
                return Ok(());
            }
            let Some(frame) = self.frames.get_frame() else {
                self.shutdown.sleep(self.config.frame_wait);
                continue;
            };
            if let Some(hit) = self.detector.detect_annotated(&frame) {
                break hit;
            }
            self.shutdown.sleep(self.config.scan_interval);
        };

        self.last_head = Some(detection.head);
        self.status.publish(StatusEvent::Detection(DetectionEvent::Motion {
            detection: detection.clone(),
            image,
        }));
        self.status.status(format!("Moving toward motion at {:.1}°", detection.bearing_x));
        self.indicate(IndicatorState::Acting);

        let executor = &mut self.executor;
        let detection = &detection;
        let pose = thread::scope(|scope| -> RobotResult<Pose> {
            let worker = thread::Builder::new()
                .name("maneuver".into())
                .spawn_scoped(scope, move || executor.execute(detection))?;
            worker.join().map_err(RobotError::from_panic)?
        })?;

        info!(x = pose.x, y = pose.y, angle = pose.angle_degrees, "pose updated");
        Ok(())
    }

    fn recover(&mut self, failure: &RobotError) {
        error!(error = %failure, "scan/act cycle failed, recovering");
        self.status.fault(format!("Cycle failed: {failure}"));
        self.status.publish(StatusEvent::Detection(DetectionEvent::Cleared));
        if let Err(e) = self.gate.acquire().stand() {
            warn!(error = %e, "forced stand failed");
            self.status.fault(format!("Forced stand failed: {e}"));
        }
        self.detector.reset();
        self.shutdown.sleep(self.config.scan_interval);
    }

    fn neutralize(&mut self) {
        self.indicate(IndicatorState::Idle);
        {
            let mut bus = self.gate.acquire();
            if let Err(e) = bus.stand() {
                warn!(error = %e, "stand during shutdown failed");
                self.status.fault(format!("Stand during shutdown failed: {e}"));
            }
            if let Err(e) = bus.clean_all() {
                warn!(error = %e, "actuator cleanup failed");
                self.status.fault(format!("Actuator cleanup failed: {e}"));
            }
        }
        self.status.status("Shutdown complete");
        info!("control loop stopped");
    }

    fn indicate(&mut self, state: IndicatorState) {
        match self.indicator.show(state) {
            Ok(()) => {
                self.indicator_failures.succeed();
            }
            Err(e) => {
                if let Some(consecutive_failures) = self.indicator_failures.fail() {
                    warn!(error = %e, ?state, consecutive_failures, "indicator update failed");
                    self.status.fault(format!("Indicator update failed ({consecutive_failures} in a row): {e}"));
                }
            }
        }
    }
}
