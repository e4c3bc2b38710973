// THEORY:
// The `MovementExecutor` is the actuation half of the robot. A `Detection` becomes
// a `MovementPlan` (turn toward the bearing in whole steps, then walk forward for a
// fixed time) and the plan is executed as a series of step cycles.
//
// A step cycle drives all four legs once. It is the unit of exclusion: the
// executor takes the `ActuationGate` for exactly one cycle, then releases it and
// paces itself with a short sleep, so head moves or cleanup from other threads can
// slot in between cycles but never inside one.
//
// Servo faults are expected on this hardware. A single leg failing is logged,
// recorded in the status history and the cycle carries on. A cycle in which every
// leg fails means the bus is gone; that ends the maneuver with an error.
//
// The executor also dead-reckons a 2-D `Pose`. It is a rough estimate built from
// the commanded motion, not a measurement.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::actuation::{ActuationGate, HeadPosition, Leg, StepDirection};
use crate::config::ExecutorConfig;
use crate::core_modules::motion_detector::Detection;
use crate::error::{ActuatorError, RobotResult};
use crate::status::{DetectionEvent, HeadMovement, MovementPhase, MovementProgress, StatusBroadcaster, StatusEvent};

/// Fraction of the estimated distance credited per forward cycle.
const ADVANCE_DIVISOR: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TurnDirection {
    Left,
    Right,
}

impl TurnDirection {
    fn step_direction(self) -> StepDirection {
        match self {
            TurnDirection::Left => StepDirection::Left,
            TurnDirection::Right => StepDirection::Right,
        }
    }

    fn sign(self) -> f64 {
        match self {
            TurnDirection::Left => -1.0,
            TurnDirection::Right => 1.0,
        }
    }
}

/// What one detection asks the legs to do.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MovementPlan {
    pub turn_direction: TurnDirection,
    pub turn_steps: u32,
    pub advance_duration: Duration,
}

impl MovementPlan {
    pub fn from_detection(detection: &Detection, config: &ExecutorConfig) -> Self {
        Self::for_bearing(detection.bearing_x, config)
    }

    pub fn for_bearing(bearing_x: f64, config: &ExecutorConfig) -> Self {
        let magnitude = bearing_x.abs();
        let turn_steps = if magnitude <= config.turn_deadband_degrees {
            0
        } else {
            ((magnitude / config.degrees_per_turn_step).floor() as u32).min(config.max_turn_steps)
        };
        Self {
            turn_direction: if bearing_x > 0.0 {
                TurnDirection::Right
            } else {
                TurnDirection::Left
            },
            turn_steps,
            advance_duration: config.advance_duration,
        }
    }
}

/// Dead-reckoned position and heading since start-up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub x: f64,
    pub y: f64,
    pub angle_degrees: f64,
}

/// Keeps the detector's "moving" guard raised for as long as it lives.
struct MovingGuard<'a>(&'a AtomicBool);

impl<'a> MovingGuard<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for MovingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct MovementExecutor {
    gate: Arc<ActuationGate>,
    status: StatusBroadcaster,
    moving: Arc<AtomicBool>,
    config: ExecutorConfig,
    pose: Pose,
}

impl MovementExecutor {
    pub fn new(
        gate: Arc<ActuationGate>,
        status: StatusBroadcaster,
        moving: Arc<AtomicBool>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            gate,
            status,
            moving,
            config,
            pose: Pose::default(),
        }
    }

    pub fn pose(&self) -> Pose {
        self.pose
    }

    pub fn plan(&self, detection: &Detection) -> MovementPlan {
        MovementPlan::from_detection(detection, &self.config)
    }

    /// Turns toward and approaches the detected object. Returns the updated pose.
    pub fn execute(&mut self, detection: &Detection) -> RobotResult<Pose> {
        let moving = Arc::clone(&self.moving);
        let _guard = MovingGuard::raise(&moving);
        let plan = self.plan(detection);
        info!(
            bearing_x = detection.bearing_x,
            distance = detection.distance,
            turn_steps = plan.turn_steps,
            direction = ?plan.turn_direction,
            "executing maneuver"
        );

        self.turn(&plan, detection.bearing_x)?;
        self.advance(&plan, detection.distance)?;

        {
            let mut bus = self.gate.acquire();
            if let Err(e) = bus.stand() {
                warn!(error = %e, "stand after maneuver failed");
                self.status.fault(format!("Stand failed: {e}"));
            }
        }
        self.report(MovementPhase::Complete, "Movement complete".to_string(), 100.0, 0);
        self.status.publish(StatusEvent::Detection(DetectionEvent::Cleared));
        info!(x = self.pose.x, y = self.pose.y, angle = self.pose.angle_degrees, "maneuver complete");
        Ok(self.pose)
    }

    fn turn(&mut self, plan: &MovementPlan, bearing_x: f64) -> RobotResult<()> {
        if plan.turn_steps == 0 {
            return Ok(());
        }
        let per_step = plan.turn_direction.sign() * bearing_x.abs() / f64::from(plan.turn_steps);
        for i in 1..=plan.turn_steps {
            self.step_cycle(plan.turn_direction.step_direction())?;
            self.pose.angle_degrees += per_step;
            let percent = f64::from(i) / f64::from(plan.turn_steps) * 100.0;
            self.report(
                MovementPhase::Turning,
                format!("Turn progress: {i}/{} ({percent:.0}%)", plan.turn_steps),
                percent,
                i,
            );
        }
        Ok(())
    }

    fn advance(&mut self, plan: &MovementPlan, distance: f64) -> RobotResult<()> {
        let started = Instant::now();
        let mut cycles = 0u32;
        while started.elapsed() < plan.advance_duration {
            self.step_cycle(StepDirection::Forward)?;
            cycles += 1;
            let heading = self.pose.angle_degrees.to_radians();
            self.pose.x += distance / ADVANCE_DIVISOR * heading.cos();
            self.pose.y += distance / ADVANCE_DIVISOR * heading.sin();
            let percent = (started.elapsed().as_secs_f64() / plan.advance_duration.as_secs_f64() * 100.0).min(100.0);
            self.report(
                MovementPhase::Advancing,
                format!("Forward progress: {percent:.0}% ({cycles} steps)"),
                percent,
                cycles,
            );
        }
        Ok(())
    }

    /// Drives all four legs once under the gate, then paces.
    fn step_cycle(&self, direction: StepDirection) -> RobotResult<()> {
        let mut failures = 0;
        {
            let mut bus = self.gate.acquire();
            for leg in Leg::ALL {
                if let Err(e) = bus.step(leg, self.config.speed, direction) {
                    warn!(leg = %leg, error = %e, "leg step failed");
                    self.status.fault(format!("Leg {leg} step failed: {e}"));
                    failures += 1;
                }
                if !self.config.leg_delay.is_zero() {
                    thread::sleep(self.config.leg_delay);
                }
            }
        }
        if failures == Leg::ALL.len() {
            return Err(ActuatorError::bus(format!("every leg failed during a {direction:?} cycle")).into());
        }
        if !self.config.step_delay.is_zero() {
            thread::sleep(self.config.step_delay);
        }
        Ok(())
    }

    fn report(&self, phase: MovementPhase, message: String, percent: f64, steps: u32) {
        self.status.publish(StatusEvent::Movement(MovementProgress {
            phase,
            message,
            percent,
            steps,
            pose: self.pose,
            timestamp: Utc::now(),
        }));
    }

    /// Points the head at `target`, one pan/tilt call per axis that has to move.
    ///
    /// Pan goes first. If the tilt then fails, the pan already happened: that partial
    /// move is published before the error is returned.
    pub fn reposition_head(&self, target: HeadPosition) -> RobotResult<Option<HeadMovement>> {
        let (current, dx, dy, tilt) = {
            let mut bus = self.gate.acquire();
            let current = bus.head_position();
            let (dx, dy) = current.delta_to(target);
            if dx == 0 && dy == 0 {
                return Ok(None);
            }
            if dx != 0 {
                bus.pan_tilt(dx, 0)?;
            }
            let tilt = if dy != 0 { bus.pan_tilt(0, dy) } else { Ok(()) };
            (current, dx, dy, tilt)
        };

        if let Err(e) = tilt {
            if dx != 0 {
                self.status.publish(StatusEvent::Head(HeadMovement {
                    from: current,
                    to: HeadPosition::new(current.x_steps + dx, current.y_steps),
                    dx,
                    dy: 0,
                    timestamp: Utc::now(),
                }));
            }
            warn!(error = %e, dx, dy, "head tilt failed after pan");
            self.status.fault(format!("Head tilt by {dy} failed after panning by {dx}: {e}"));
            return Err(e.into());
        }

        let movement = HeadMovement {
            from: current,
            to: target,
            dx,
            dy,
            timestamp: Utc::now(),
        };
        self.status.publish(StatusEvent::Head(movement.clone()));
        Ok(Some(movement))
    }

    /// Start-up movement routine: initialise, walk, turn and look around.
    pub fn run_self_test(&mut self) -> RobotResult<()> {
        info!("running self-test");
        self.status.status("Running self-test");
        self.gate.acquire().init_all()?;

        for _ in 0..2 {
            self.step_cycle(StepDirection::Forward)?;
        }
        for _ in 0..2 {
            self.step_cycle(StepDirection::Left)?;
        }

        let look = self.config.self_test_look_steps;
        let looks = [
            ("up", HeadPosition::new(0, -look)),
            ("down", HeadPosition::new(0, look)),
            ("left", HeadPosition::new(-look, 0)),
            ("right", HeadPosition::new(look, 0)),
            ("home", HeadPosition::default()),
        ];
        for (label, target) in looks {
            info!(label, "self-test head move");
            self.reposition_head(target)?;
            if !self.config.head_settle.is_zero() {
                thread::sleep(self.config.head_settle);
            }
        }

        self.gate.acquire().stand()?;
        self.status.status("Self-test complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuation::{ActuatorCall, SimulatedActuator};
    use crate::core_modules::smart_blob::{BoundingBox, Point};
    use crate::error::RobotError;

    fn fast_config() -> ExecutorConfig {
        ExecutorConfig {
            leg_delay: Duration::ZERO,
            step_delay: Duration::from_millis(2),
            advance_duration: Duration::from_millis(10),
            head_settle: Duration::ZERO,
            ..ExecutorConfig::default()
        }
    }

    fn detection(bearing_x: f64, distance: f64) -> Detection {
        Detection {
            bearing_x,
            bearing_y: 0.0,
            distance,
            area: 900,
            bbox: BoundingBox { x: 0, y: 0, w: 30, h: 30 },
            center: Point { x: 15.0, y: 15.0 },
            frame_center: Point { x: 32.0, y: 24.0 },
            head: HeadPosition::default(),
            frame_id: 1,
            timestamp: Utc::now(),
        }
    }

    fn executor(actuator: SimulatedActuator, config: ExecutorConfig) -> (MovementExecutor, StatusBroadcaster) {
        let status = StatusBroadcaster::new(64);
        let executor = MovementExecutor::new(
            Arc::new(ActuationGate::new(actuator)),
            status.clone(),
            Arc::new(AtomicBool::new(false)),
            config,
        );
        (executor, status)
    }

    #[test]
    fn plan_follows_bearing() {
        let config = ExecutorConfig::default();
        assert_eq!(MovementPlan::for_bearing(5.0, &config).turn_steps, 0);
        assert_eq!(MovementPlan::for_bearing(-4.9, &config).turn_steps, 0);

        let plan = MovementPlan::for_bearing(37.0, &config);
        assert_eq!(plan.turn_steps, 3);
        assert_eq!(plan.turn_direction, TurnDirection::Right);
        assert_eq!(plan.advance_duration, Duration::from_secs(2));

        let plan = MovementPlan::for_bearing(-80.0, &config);
        assert_eq!(plan.turn_steps, 4);
        assert_eq!(plan.turn_direction, TurnDirection::Left);
    }

    #[test]
    fn execute_turns_advances_and_clears_state() {
        let actuator = SimulatedActuator::new();
        let journal = actuator.journal();
        let (mut executor, status) = executor(actuator, fast_config());
        status.publish(StatusEvent::Detection(DetectionEvent::Motion {
            detection: detection(37.0, 2.0),
            image: None,
        }));

        let pose = executor.execute(&detection(37.0, 2.0)).expect("maneuver");

        assert!((pose.angle_degrees - 37.0).abs() < 1e-9);
        assert!(pose.x != 0.0);
        assert!(!executor.moving.load(Ordering::SeqCst));

        let snapshot = status.snapshot();
        assert!(snapshot.detection.is_none());
        assert_eq!(snapshot.movement.map(|m| m.message), Some("Movement complete".to_string()));
        assert!(snapshot.history.iter().any(|l| l.ends_with("Turn progress: 3/3 (100%)")));

        let calls = journal.calls();
        let right_steps = calls
            .iter()
            .filter(|c| matches!(c, ActuatorCall::Step { direction: StepDirection::Right, .. }))
            .count();
        assert_eq!(right_steps, 12);
        assert_eq!(calls.last(), Some(&ActuatorCall::Stand));
    }

    #[test]
    fn single_leg_failure_is_tolerated() {
        let (mut executor, status) = executor(SimulatedActuator::new().with_failing_leg(Leg::Three), fast_config());
        assert!(executor.execute(&detection(20.0, 1.0)).is_ok());
        assert!(status.snapshot().history.iter().any(|l| l.contains("Leg 3 step failed")));
    }

    #[test]
    fn dead_bus_ends_maneuver_and_lowers_guard() {
        let (mut executor, _status) = executor(SimulatedActuator::new().with_bus_down(), fast_config());
        let result = executor.execute(&detection(20.0, 1.0));
        assert!(matches!(result, Err(RobotError::Actuator(ActuatorError::Bus(_)))));
        assert!(!executor.moving.load(Ordering::SeqCst));
        // the gate is free again
        assert!(executor.gate.acquire().clean_all().is_ok());
    }

    #[test]
    fn head_moves_only_the_axes_that_differ() {
        let actuator = SimulatedActuator::new().with_head(HeadPosition::new(3, 0));
        let journal = actuator.journal();
        let (executor, _status) = executor(actuator, fast_config());

        let movement = executor.reposition_head(HeadPosition::new(-2, 0)).expect("head").expect("moved");
        assert_eq!((movement.dx, movement.dy), (-5, 0));
        assert_eq!(journal.calls(), vec![ActuatorCall::PanTilt { dx: -5, dy: 0 }]);
        assert!(executor.reposition_head(HeadPosition::new(-2, 0)).expect("head").is_none());
    }

    #[test]
    fn a_failed_tilt_still_publishes_the_pan_that_happened() {
        let actuator = SimulatedActuator::new().with_failing_tilt();
        let journal = actuator.journal();
        let (executor, status) = executor(actuator, fast_config());

        let result = executor.reposition_head(HeadPosition::new(4, 2));
        assert!(matches!(result, Err(RobotError::Actuator(ActuatorError::Head(_)))));
        assert_eq!(
            journal.calls(),
            vec![ActuatorCall::PanTilt { dx: 4, dy: 0 }, ActuatorCall::PanTilt { dx: 0, dy: 2 }]
        );

        let snapshot = status.snapshot();
        let head = snapshot.head.expect("partial head move published");
        assert_eq!((head.dx, head.dy), (4, 0));
        assert_eq!(head.to, HeadPosition::new(4, 0));
        assert_eq!(executor.gate.head_position(), HeadPosition::new(4, 0));
        assert!(snapshot.history.iter().any(|l| l.contains("Head moved by (4, 0)")));
        assert!(snapshot.history.back().is_some_and(|l| l.contains("Error: Head tilt by 2 failed after panning by 4")));
    }

    #[test]
    fn concurrent_cycles_never_interleave() {
        let actuator = SimulatedActuator::new();
        let journal = actuator.journal();
        let gate = Arc::new(ActuationGate::new(actuator));
        let config = ExecutorConfig {
            leg_delay: Duration::from_millis(1),
            step_delay: Duration::ZERO,
            ..fast_config()
        };

        let workers: Vec<_> = ["walker-a", "walker-b"]
            .into_iter()
            .map(|name| {
                let executor = MovementExecutor::new(
                    Arc::clone(&gate),
                    StatusBroadcaster::default(),
                    Arc::new(AtomicBool::new(false)),
                    config.clone(),
                );
                thread::Builder::new()
                    .name(name.to_string())
                    .spawn(move || {
                        for _ in 0..15 {
                            executor.step_cycle(StepDirection::Forward).expect("cycle");
                        }
                    })
                    .expect("spawn")
            })
            .collect();
        for worker in workers {
            worker.join().expect("worker");
        }

        let entries = journal.entries();
        assert_eq!(entries.len(), 2 * 15 * 4);
        for cycle in entries.chunks(4) {
            assert!(cycle.iter().all(|e| e.thread == cycle[0].thread));
            let legs: Vec<Leg> = cycle
                .iter()
                .map(|e| match e.call {
                    ActuatorCall::Step { leg, .. } => leg,
                    ref other => panic!("unexpected call {other:?}"),
                })
                .collect();
            assert_eq!(legs, Leg::ALL.to_vec());
        }
    }

    #[test]
    fn self_test_walks_turns_and_returns_head_home() {
        let actuator = SimulatedActuator::new();
        let journal = actuator.journal();
        let (mut executor, status) = executor(actuator, fast_config());
        executor.run_self_test().expect("self-test");

        let calls = journal.calls();
        assert_eq!(calls.first(), Some(&ActuatorCall::InitAll));
        assert_eq!(calls.last(), Some(&ActuatorCall::Stand));
        assert_eq!(executor.gate.head_position(), HeadPosition::default());
        assert_eq!(status.snapshot().status, "Self-test complete");
    }
}
