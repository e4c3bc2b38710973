// THEORY:
// The runtime owns the long-lived threads of the robot and nothing else:
//
// *   the **frame pump**, which pulls frames from the `CameraDevice` and replaces
//     the single buffered frame in `LatestFrame`;
// *   the **control loop** (see `pipeline`), which scans and acts.
//
// Both are plain OS threads because everything they call blocks (camera reads,
// servo pacing). They stop cooperatively when the `ShutdownToken` fires and are
// joined by `Robot::join`. The async status server is run by the host on tokio and
// only ever reads shared handles.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::actuation::{ActuationGate, Indicator};
use crate::config::RobotConfig;
use crate::core_modules::frame::{FramePacket, LatestFrame};
use crate::error::{RobotError, RobotResult};
use crate::pipeline::ControlLoop;
use crate::status::{FaultCounter, StatusBroadcaster};

const SHUTDOWN_POLL: Duration = Duration::from_millis(10);

/// Cooperative stop signal shared by every thread and the server.
#[derive(Clone)]
pub struct ShutdownToken {
    flag: Arc<watch::Sender<bool>>,
}

impl ShutdownToken {
    pub fn new() -> Self {
        let (flag, _) = watch::channel(false);
        Self { flag: Arc::new(flag) }
    }

    pub fn trigger(&self) {
        if !self.flag.send_replace(true) {
            info!("shutdown requested");
        }
    }

    pub fn is_triggered(&self) -> bool {
        *self.flag.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.flag.subscribe()
    }

    /// Resolves once shutdown has been triggered.
    pub async fn cancelled(&self) {
        let mut rx = self.subscribe();
        // the sender lives in `self`, so the channel cannot close under us
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    /// Blocking sleep that wakes early on shutdown. Returns true if shutdown fired.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_triggered() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::sleep((deadline - now).min(SHUTDOWN_POLL));
        }
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

/// A camera driver. `open` is called once at start-up; `capture` for every frame.
pub trait CameraDevice: Send {
    fn open(&mut self) -> RobotResult<()>;
    fn capture(&mut self) -> RobotResult<FramePacket>;
}

/// Runs the capture loop until shutdown. A failed capture is skipped and reported,
/// rate-limited, to the log and the status history.
fn pump_frames(
    mut camera: Box<dyn CameraDevice>,
    latest: LatestFrame,
    status: StatusBroadcaster,
    shutdown: ShutdownToken,
    interval: Duration,
) {
    let mut failures = FaultCounter::default();
    while !shutdown.is_triggered() {
        match camera.capture() {
            Ok(frame) => {
                if let Some(after) = failures.succeed() {
                    info!(after, "camera recovered");
                }
                latest.publish(frame);
            }
            Err(e) => {
                if let Some(consecutive_failures) = failures.fail() {
                    warn!(error = %e, consecutive_failures, "frame capture failed");
                    status.fault(format!("Frame capture failed ({consecutive_failures} in a row): {e}"));
                }
            }
        }
        shutdown.sleep(interval);
    }
    info!("frame pump stopped");
}

/// Joins one thread, logging and returning its panic if it had one.
fn join_reporting(handle: JoinHandle<()>) -> Option<RobotError> {
    let name = handle.thread().name().unwrap_or("robot").to_string();
    let payload = handle.join().err()?;
    let e = RobotError::from_panic(payload);
    error!(thread = %name, error = %e, "thread panicked");
    Some(e)
}

/// The running robot: handles to its shared state plus its threads.
pub struct Robot {
    shutdown: ShutdownToken,
    latest: LatestFrame,
    status: StatusBroadcaster,
    gate: Arc<ActuationGate>,
    threads: Vec<JoinHandle<()>>,
}

impl Robot {
    /// Opens the camera and starts the pump and control threads.
    ///
    /// A camera that cannot be opened is fatal: the actuators are released and the
    /// error is returned before any thread starts.
    pub fn start(
        config: RobotConfig,
        mut camera: impl CameraDevice + 'static,
        gate: Arc<ActuationGate>,
        indicator: impl Indicator + 'static,
        status: StatusBroadcaster,
    ) -> RobotResult<Self> {
        config.validate()?;

        if let Err(e) = camera.open() {
            error!(error = %e, "camera could not be opened");
            if let Err(cleanup) = gate.acquire().clean_all() {
                warn!(error = %cleanup, "actuator cleanup failed");
                status.fault(format!("Actuator cleanup failed: {cleanup}"));
            }
            status.status(format!("Camera unavailable: {e}"));
            return Err(e);
        }

        let shutdown = ShutdownToken::new();
        let latest = LatestFrame::new();
        let mut threads = Vec::with_capacity(2);

        let pump = {
            let latest = latest.clone();
            let status = status.clone();
            let shutdown = shutdown.clone();
            let interval = config.control.capture_interval;
            thread::Builder::new()
                .name("frame-pump".into())
                .spawn(move || pump_frames(Box::new(camera), latest, status, shutdown, interval))?
        };
        threads.push(pump);

        let control = ControlLoop::new(
            &config,
            Arc::new(latest.clone()),
            Arc::clone(&gate),
            Box::new(indicator),
            status.clone(),
            shutdown.clone(),
        );
        let control = match thread::Builder::new()
            .name("control-loop".into())
            .spawn(move || control.run())
        {
            Ok(handle) => handle,
            Err(e) => {
                shutdown.trigger();
                for handle in threads {
                    join_reporting(handle);
                }
                return Err(e.into());
            }
        };
        threads.push(control);

        info!("robot started");
        Ok(Self {
            shutdown,
            latest,
            status,
            gate,
            threads,
        })
    }

    pub fn status(&self) -> StatusBroadcaster {
        self.status.clone()
    }

    pub fn latest_frame(&self) -> LatestFrame {
        self.latest.clone()
    }

    pub fn gate(&self) -> Arc<ActuationGate> {
        Arc::clone(&self.gate)
    }

    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown.clone()
    }

    /// Asks every thread to stop; does not wait.
    pub fn shutdown(&self) {
        self.shutdown.trigger();
    }

    /// Waits for every thread. Reports the first one that panicked.
    pub fn join(self) -> RobotResult<()> {
        let mut first_error = None;
        for handle in self.threads {
            if let Some(e) = join_reporting(handle) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuation::{ActuatorCall, LoggingIndicator, SimulatedActuator};
    use crate::core_modules::frame::FrameSource;
    use crate::synthetic::SyntheticCamera;

    struct BrokenCamera;

    impl CameraDevice for BrokenCamera {
        fn open(&mut self) -> RobotResult<()> {
            Err(RobotError::camera("/dev/video0 not found"))
        }

        fn capture(&mut self) -> RobotResult<FramePacket> {
            Err(RobotError::camera("not open"))
        }
    }

    /// Opens fine, then never delivers a frame.
    struct StalledCamera;

    impl CameraDevice for StalledCamera {
        fn open(&mut self) -> RobotResult<()> {
            Ok(())
        }

        fn capture(&mut self) -> RobotResult<FramePacket> {
            Err(RobotError::camera("read timed out"))
        }
    }

    fn quick_config() -> RobotConfig {
        let mut config = RobotConfig::default();
        config.control.capture_interval = Duration::from_millis(5);
        config.control.scan_interval = Duration::from_millis(5);
        config.control.frame_wait = Duration::from_millis(5);
        config
    }

    #[test]
    fn sleep_wakes_on_shutdown() {
        let token = ShutdownToken::new();
        assert!(!token.sleep(Duration::from_millis(5)));
        let remote = token.clone();
        let trigger = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.trigger();
        });
        let started = Instant::now();
        assert!(token.sleep(Duration::from_secs(10)));
        assert!(started.elapsed() < Duration::from_secs(5));
        trigger.join().expect("trigger");
    }

    #[tokio::test]
    async fn cancelled_resolves_after_trigger() {
        let token = ShutdownToken::new();
        let remote = token.clone();
        tokio::spawn(async move { remote.trigger() });
        token.cancelled().await;
        assert!(token.is_triggered());
    }

    #[test]
    fn camera_failure_is_fatal_and_releases_actuators() {
        let actuator = SimulatedActuator::new();
        let journal = actuator.journal();
        let status = StatusBroadcaster::default();
        let result = Robot::start(
            quick_config(),
            BrokenCamera,
            Arc::new(ActuationGate::new(actuator)),
            LoggingIndicator::default(),
            status.clone(),
        );
        assert!(matches!(result, Err(RobotError::CameraUnavailable(_))));
        assert_eq!(journal.calls(), vec![ActuatorCall::CleanAll]);
        assert!(status.snapshot().status.starts_with("Camera unavailable"));
    }

    #[test]
    fn robot_runs_and_shuts_down_cleanly() {
        let actuator = SimulatedActuator::new();
        let journal = actuator.journal();
        let robot = Robot::start(
            quick_config(),
            SyntheticCamera::new(64, 48),
            Arc::new(ActuationGate::new(actuator)),
            LoggingIndicator::default(),
            StatusBroadcaster::default(),
        )
        .expect("start");

        let latest = robot.latest_frame();
        let deadline = Instant::now() + Duration::from_secs(5);
        while latest.get_frame().is_none() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(latest.get_frame().is_some());

        let status = robot.status();
        robot.shutdown();
        robot.join().expect("join");

        assert_eq!(status.snapshot().status, "Shutdown complete");
        let calls = journal.calls();
        assert_eq!(calls.last(), Some(&ActuatorCall::CleanAll));
    }

    #[test]
    fn capture_failures_reach_the_status_history_once_per_run() {
        let robot = Robot::start(
            quick_config(),
            StalledCamera,
            Arc::new(ActuationGate::new(SimulatedActuator::new())),
            LoggingIndicator::default(),
            StatusBroadcaster::new(64),
        )
        .expect("start");
        let status = robot.status();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !status.snapshot().history.iter().any(|l| l.contains("Error: Frame capture failed"))
            && Instant::now() < deadline
        {
            thread::sleep(Duration::from_millis(5));
        }
        // a few more failed captures must not add more lines
        thread::sleep(Duration::from_millis(30));
        robot.shutdown();
        robot.join().expect("join");

        let history = status.snapshot().history;
        let reported = history.iter().filter(|l| l.contains("Frame capture failed")).count();
        assert_eq!(reported, 1, "history: {history:?}");
        assert!(history.iter().any(|l| l.contains("(1 in a row): camera unavailable")));
    }

    #[test]
    fn a_panicked_thread_is_reported_on_join() {
        let handle = thread::Builder::new()
            .name("frame-pump".into())
            .spawn(|| panic!("camera driver crashed"))
            .expect("spawn");
        let reported = join_reporting(handle);
        assert!(matches!(reported, Some(RobotError::WorkerPanicked(ref m)) if m.contains("camera driver crashed")));

        let clean = thread::spawn(|| {});
        assert!(join_reporting(clean).is_none());
    }
}
