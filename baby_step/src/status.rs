// THEORY:
// The `StatusBroadcaster` is the one place the dashboard looks. It holds a single
// `StatusSnapshot` inside a `watch` channel: writers apply an event with
// `send_modify`, which runs under the channel's lock, and readers clone the value
// under the same lock. A reader therefore sees either the state before an event or
// after it, never half of one. In particular a detection and its annotated image are
// set and cleared as one `DetectionEvent`.
//
// Every event also appends a timestamped line to a bounded history so the dashboard
// can show what happened recently, including faults that did not stop the robot.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use tokio::sync::watch;

use crate::actuation::HeadPosition;
use crate::core_modules::annotate::EncodedImage;
use crate::core_modules::motion_detector::Detection;
use crate::movement::Pose;

pub const DEFAULT_HISTORY_LEN: usize = 10;
pub const INITIAL_STATUS: &str = "Initializing...";
/// A fault that repeats on every frame is reported once, then every this many times.
pub const REPEATED_FAULT_EVERY: u32 = 100;

/// A detection as shown on the dashboard, paired with its overlay.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionRecord {
    pub detection: Detection,
    pub image: Option<EncodedImage>,
}

/// Change to the "last detection" slot.
#[derive(Debug, Clone, PartialEq)]
pub enum DetectionEvent {
    Motion {
        detection: Detection,
        image: Option<EncodedImage>,
    },
    Cleared,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MovementPhase {
    Turning,
    Advancing,
    Complete,
}

/// Progress of the maneuver in flight.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MovementProgress {
    pub phase: MovementPhase,
    pub message: String,
    pub percent: f64,
    /// Step cycles completed in the current phase.
    pub steps: u32,
    pub pose: Pose,
    pub timestamp: DateTime<Utc>,
}

/// A completed head repositioning.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeadMovement {
    pub from: HeadPosition,
    pub to: HeadPosition,
    pub dx: i32,
    pub dy: i32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatusEvent {
    /// Replaces the headline status text.
    Status(String),
    Detection(DetectionEvent),
    Movement(MovementProgress),
    Head(HeadMovement),
    /// A non-fatal failure; only recorded in the history.
    Fault(String),
}

impl StatusEvent {
    fn history_text(&self) -> String {
        match self {
            StatusEvent::Status(text) => text.clone(),
            StatusEvent::Detection(DetectionEvent::Motion { detection, .. }) => format!(
                "Motion detected: angle={:.1}°, distance={:.2}",
                detection.bearing_x, detection.distance
            ),
            StatusEvent::Detection(DetectionEvent::Cleared) => "Detection cleared".to_string(),
            StatusEvent::Movement(progress) => progress.message.clone(),
            StatusEvent::Head(head) => format!("Head moved by ({}, {})", head.dx, head.dy),
            StatusEvent::Fault(text) => format!("Error: {text}"),
        }
    }
}

/// Immutable copy of everything the dashboard shows.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusSnapshot {
    pub status: String,
    pub detection: Option<DetectionRecord>,
    pub movement: Option<MovementProgress>,
    pub head: Option<HeadMovement>,
    /// Oldest first.
    pub history: VecDeque<String>,
    pub updated_at: DateTime<Utc>,
}

impl StatusSnapshot {
    fn new() -> Self {
        Self {
            status: INITIAL_STATUS.to_string(),
            detection: None,
            movement: None,
            head: None,
            history: VecDeque::new(),
            updated_at: Utc::now(),
        }
    }

    fn apply(&mut self, event: StatusEvent, line: String, history_len: usize) {
        match event {
            StatusEvent::Status(text) => self.status = text,
            StatusEvent::Detection(DetectionEvent::Motion { detection, image }) => {
                self.detection = Some(DetectionRecord { detection, image });
            }
            StatusEvent::Detection(DetectionEvent::Cleared) => self.detection = None,
            StatusEvent::Movement(progress) => self.movement = Some(progress),
            StatusEvent::Head(head) => self.head = Some(head),
            StatusEvent::Fault(_) => {}
        }
        while self.history.len() >= history_len {
            self.history.pop_front();
        }
        self.history.push_back(line);
        self.updated_at = Utc::now();
    }
}

/// Cloneable handle to the process-wide status.
#[derive(Clone)]
pub struct StatusBroadcaster {
    state: Arc<watch::Sender<StatusSnapshot>>,
    history_len: usize,
}

impl StatusBroadcaster {
    pub fn new(history_len: usize) -> Self {
        let (state, _) = watch::channel(StatusSnapshot::new());
        Self {
            state: Arc::new(state),
            history_len: history_len.max(1),
        }
    }

    /// Applies one event atomically and records it in the history.
    pub fn publish(&self, event: StatusEvent) {
        let line = format!("[{}] {}", Local::now().format("%H:%M:%S"), event.history_text());
        self.state
            .send_modify(|snapshot| snapshot.apply(event, line, self.history_len));
    }

    pub fn status(&self, text: impl Into<String>) {
        self.publish(StatusEvent::Status(text.into()));
    }

    pub fn fault(&self, text: impl Into<String>) {
        self.publish(StatusEvent::Fault(text.into()));
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.state.borrow().clone()
    }

    /// Receiver that wakes on every published event.
    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.state.subscribe()
    }
}

/// Counts a run of identical failures so a per-frame fault does not flood the history.
#[derive(Debug, Default)]
pub struct FaultCounter {
    consecutive: u32,
}

impl FaultCounter {
    /// Records one failure. Returns the run length when this one should be reported.
    pub fn fail(&mut self) -> Option<u32> {
        self.consecutive = self.consecutive.saturating_add(1);
        (self.consecutive == 1 || self.consecutive % REPEATED_FAULT_EVERY == 0).then_some(self.consecutive)
    }

    /// Ends the run. Returns how long it was, if there was one.
    pub fn succeed(&mut self) -> Option<u32> {
        let run = std::mem::take(&mut self.consecutive);
        (run > 0).then_some(run)
    }
}

impl Default for StatusBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LEN)
    }
}
