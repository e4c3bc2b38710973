#[cfg(feature = "camera")]
mod camera;

use std::sync::Arc;

use baby_host::{HostHandles, ServerConfig, start_server};
use baby_step::{ActuationGate, LoggingIndicator, Robot, RobotConfig, RobotResult, SimulatedActuator, StatusBroadcaster};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[cfg(feature = "camera")]
fn start_robot(config: RobotConfig, gate: Arc<ActuationGate>, status: StatusBroadcaster) -> RobotResult<Robot> {
    let index = std::env::var("BABY_CAMERA_INDEX")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    Robot::start(config, camera::OpenCvCamera::new(index), gate, LoggingIndicator::default(), status)
}

#[cfg(not(feature = "camera"))]
fn start_robot(config: RobotConfig, gate: Arc<ActuationGate>, status: StatusBroadcaster) -> RobotResult<Robot> {
    info!("no camera feature; using the synthetic camera");
    let camera = baby_step::synthetic::SyntheticCamera::new(640, 480);
    Robot::start(config, camera, gate, LoggingIndicator::default(), status)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Environment & Logging ---
    dotenvy::dotenv().ok();
    init_tracing();

    // --- 2. Configuration ---
    let config = RobotConfig::from_env();
    config.validate()?;
    let bind_addr = std::env::var("BABY_BIND").unwrap_or_else(|_| ServerConfig::default().bind_addr);

    // --- 3. Robot Start-up ---
    // The servo driver is external; the simulated one logs and journals every call.
    let status = StatusBroadcaster::new(config.control.status_history);
    let gate = Arc::new(ActuationGate::new(SimulatedActuator::new()));
    let robot = start_robot(config, gate, status.clone())?;

    // --- 4. Status Server ---
    let handles = HostHandles {
        status,
        frames: robot.latest_frame(),
        shutdown: robot.shutdown_token(),
    };
    let server = match start_server(handles, ServerConfig { bind_addr }).await {
        Ok(server) => Some(server),
        Err(e) => {
            warn!(error = %e, "status server not started");
            None
        }
    };

    // --- 5. Shutdown ---
    tokio::signal::ctrl_c().await?;
    info!("ctrl-c received, stopping");
    robot.shutdown();
    tokio::task::spawn_blocking(move || robot.join()).await??;
    if let Some(server) = server {
        server.await.ok();
    }
    Ok(())
}
