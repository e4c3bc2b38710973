// THEORY:
// Everything that moves the robot goes through one `ActuationGate`. The gate is a
// plain non-reentrant mutex around the actuator driver: leg steps, head moves, stand,
// init and cleanup all take it, so two command sequences can never interleave on the
// servo bus. Callers hold it for one atomic step cycle at a time, never for a whole
// maneuver, which keeps other users waiting for at most one cycle.
//
// The servo and LED drivers themselves are external; they appear here as the
// `Actuator` and `Indicator` traits. `SimulatedActuator` stands in for the hardware
// on a desk and records every call it receives.

use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::ActuatorError;

const JOURNAL_CAPACITY: usize = 512;

/// One of the four legs, numbered as the servo board numbers them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Leg {
    One,
    Two,
    Three,
    Four,
}

impl Leg {
    /// Legs in the order a full step cycle drives them.
    pub const ALL: [Leg; 4] = [Leg::One, Leg::Two, Leg::Three, Leg::Four];

    pub fn number(self) -> u8 {
        match self {
            Leg::One => 1,
            Leg::Two => 2,
            Leg::Three => 3,
            Leg::Four => 4,
        }
    }
}

impl fmt::Display for Leg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.number())
    }
}

/// Gait direction for a single leg step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepDirection {
    Forward,
    Left,
    Right,
}

/// Pan/tilt offset of the head from center, in servo steps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadPosition {
    pub x_steps: i32,
    pub y_steps: i32,
}

impl HeadPosition {
    pub fn new(x_steps: i32, y_steps: i32) -> Self {
        Self { x_steps, y_steps }
    }

    /// Per-axis offset that takes `self` to `target`.
    pub fn delta_to(self, target: HeadPosition) -> (i32, i32) {
        (target.x_steps - self.x_steps, target.y_steps - self.y_steps)
    }
}

/// The servo driver. Every call may fail independently.
pub trait Actuator: Send {
    fn init_all(&mut self) -> Result<(), ActuatorError>;
    fn step(&mut self, leg: Leg, speed: u8, direction: StepDirection) -> Result<(), ActuatorError>;
    fn stand(&mut self) -> Result<(), ActuatorError>;
    fn clean_all(&mut self) -> Result<(), ActuatorError>;
    fn pan_tilt(&mut self, dx: i32, dy: i32) -> Result<(), ActuatorError>;
    fn head_position(&self) -> HeadPosition;
}

/// The single mutual-exclusion domain over the actuator bus.
pub struct ActuationGate {
    bus: Mutex<Box<dyn Actuator>>,
}

impl ActuationGate {
    pub fn new(actuator: impl Actuator + 'static) -> Self {
        Self {
            bus: Mutex::new(Box::new(actuator)),
        }
    }

    /// Blocks until the bus is free. A holder that panicked does not keep it locked.
    pub fn acquire(&self) -> GateGuard<'_> {
        let guard = self.bus.lock().unwrap_or_else(|poisoned: PoisonError<_>| {
            warn!("actuation gate was poisoned by a panicking holder; recovering");
            poisoned.into_inner()
        });
        GateGuard { guard }
    }

    /// Reads the head position under the gate.
    pub fn head_position(&self) -> HeadPosition {
        self.acquire().head_position()
    }
}

/// Exclusive access to the actuator for as long as it lives.
pub struct GateGuard<'a> {
    guard: MutexGuard<'a, Box<dyn Actuator>>,
}

impl Deref for GateGuard<'_> {
    type Target = dyn Actuator;

    fn deref(&self) -> &Self::Target {
        &**self.guard
    }
}

impl DerefMut for GateGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut **self.guard
    }
}

/// A call observed by the simulated actuator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActuatorCall {
    InitAll,
    Step {
        leg: Leg,
        speed: u8,
        direction: StepDirection,
    },
    Stand,
    CleanAll,
    PanTilt {
        dx: i32,
        dy: i32,
    },
}

/// Journal entry: which thread issued which call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub thread: String,
    pub call: ActuatorCall,
}

/// Shared, bounded record of simulated actuator calls.
#[derive(Debug, Clone, Default)]
pub struct ActuatorJournal {
    entries: Arc<Mutex<VecDeque<JournalEntry>>>,
}

impl ActuatorJournal {
    fn record(&self, call: ActuatorCall) {
        let thread = std::thread::current().name().unwrap_or("unnamed").to_string();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.len() == JOURNAL_CAPACITY {
            entries.pop_front();
        }
        entries.push_back(JournalEntry { thread, call });
    }

    pub fn entries(&self) -> Vec<JournalEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn calls(&self) -> Vec<ActuatorCall> {
        self.entries().into_iter().map(|e| e.call).collect()
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

/// Hardware stand-in used for dry runs and tests.
#[derive(Debug, Default)]
pub struct SimulatedActuator {
    head: HeadPosition,
    journal: ActuatorJournal,
    /// Every step on this leg fails, like a loose servo on the odd leg.
    failing_leg: Option<Leg>,
    /// Every leg fails: the bus is dead.
    bus_down: bool,
    /// Pan works, tilt does not.
    failing_tilt: bool,
}

impl SimulatedActuator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failing_leg(mut self, leg: Leg) -> Self {
        self.failing_leg = Some(leg);
        self
    }

    pub fn with_bus_down(mut self) -> Self {
        self.bus_down = true;
        self
    }

    pub fn with_failing_tilt(mut self) -> Self {
        self.failing_tilt = true;
        self
    }

    pub fn with_head(mut self, head: HeadPosition) -> Self {
        self.head = head;
        self
    }

    /// Handle to the call journal; stays valid after the actuator moves into a gate.
    pub fn journal(&self) -> ActuatorJournal {
        self.journal.clone()
    }
}

impl Actuator for SimulatedActuator {
    fn init_all(&mut self) -> Result<(), ActuatorError> {
        self.journal.record(ActuatorCall::InitAll);
        self.head = HeadPosition::default();
        info!("simulated servos initialised");
        Ok(())
    }

    fn step(&mut self, leg: Leg, speed: u8, direction: StepDirection) -> Result<(), ActuatorError> {
        self.journal.record(ActuatorCall::Step { leg, speed, direction });
        if self.bus_down {
            return Err(ActuatorError::servo(leg, "no response from servo board"));
        }
        if self.failing_leg == Some(leg) {
            return Err(ActuatorError::servo(leg, "servo did not acknowledge"));
        }
        debug!(leg = %leg, speed, ?direction, "step");
        Ok(())
    }

    fn stand(&mut self) -> Result<(), ActuatorError> {
        self.journal.record(ActuatorCall::Stand);
        if self.bus_down {
            return Err(ActuatorError::bus("no response from servo board"));
        }
        Ok(())
    }

    fn clean_all(&mut self) -> Result<(), ActuatorError> {
        self.journal.record(ActuatorCall::CleanAll);
        Ok(())
    }

    fn pan_tilt(&mut self, dx: i32, dy: i32) -> Result<(), ActuatorError> {
        self.journal.record(ActuatorCall::PanTilt { dx, dy });
        if self.bus_down {
            return Err(ActuatorError::Head("no response from servo board".into()));
        }
        if self.failing_tilt && dy != 0 {
            return Err(ActuatorError::Head("tilt servo stalled".into()));
        }
        self.head.x_steps += dx;
        self.head.y_steps += dy;
        Ok(())
    }

    fn head_position(&self) -> HeadPosition {
        self.head
    }
}

/// Tri-state status light.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndicatorState {
    Idle,
    Scanning,
    Acting,
}

/// The LED driver. Failures here must never disturb the control loop.
pub trait Indicator: Send {
    fn show(&mut self, state: IndicatorState) -> Result<(), ActuatorError>;
}

/// Indicator that only logs transitions.
#[derive(Debug, Default)]
pub struct LoggingIndicator {
    current: Option<IndicatorState>,
}

impl Indicator for LoggingIndicator {
    fn show(&mut self, state: IndicatorState) -> Result<(), ActuatorError> {
        if self.current != Some(state) {
            debug!(?state, "indicator");
            self.current = Some(state);
        }
        Ok(())
    }
}
