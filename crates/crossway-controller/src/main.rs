//! Lane controller process for the Crossway signal coordinator.
//!
//! One process runs per lane. It receives vehicle counts and peer
//! coordination traffic over NATS, runs the lane's [`LaneController`], and
//! drives the lane's signal head.
//!
//! # Startup Sequence
//!
//! 1. Load configuration from `crossway-config.yaml` (or `CROSSWAY_CONFIG`)
//! 2. Initialize structured logging (tracing)
//! 3. Read this process's lane from `LANE_ID`
//! 4. Build the lane controller
//! 5. Connect to NATS and subscribe to the coordination subjects
//! 6. Run the driver loop until Ctrl-C or the subscription ends

mod actuator;
mod bus;
mod driver;
mod error;

use std::path::{Path, PathBuf};

use crossway_core::LaneController;
use crossway_core::clock::SystemClock;
use crossway_core::config::{ControllerConfig, LoggingConfig};
use crossway_types::LaneId;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::actuator::LoggingActuator;
use crate::bus::NatsBus;
use crate::driver::Driver;
use crate::error::NodeError;

/// Where the configuration came from, reported once logging is up.
enum ConfigSource {
    File(PathBuf),
    Defaults(PathBuf),
}

/// Application entry point for one lane controller.
///
/// # Errors
///
/// Returns an error if any startup step fails. Runtime bus faults are logged
/// and never end the process.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Load configuration.
    let (config, source) = load_config()?;

    // 2. Initialize structured logging.
    init_tracing(&config.logging);
    info!("crossway-controller starting");
    match &source {
        ConfigSource::File(path) => info!(path = %path.display(), "configuration loaded"),
        ConfigSource::Defaults(path) => {
            info!(path = %path.display(), "config file not found, using defaults");
        }
    }

    // 3. Identify the lane.
    let lane = lane_from_env()?;
    info!(
        lane = %lane,
        lane_count = config.intersection.lane_count,
        nats_url = config.infrastructure.nats_url,
        subject_prefix = config.infrastructure.subject_prefix,
        tick_interval_ms = config.timing.tick_interval_ms,
        grants_required = config.policy.grants_required,
        "lane configuration"
    );

    // 4. Build the controller.
    let tick_every = config.timing.tick_interval();
    let bus_url = config.infrastructure.nats_url.clone();
    let prefix = config.infrastructure.subject_prefix.clone();
    let controller = LaneController::new(lane, config, SystemClock)?;

    // 5. Connect to the bus.
    let bus = NatsBus::connect(&bus_url, &prefix).await?;
    let inbound = bus.subscribe().await?;

    // 6. Run until shutdown.
    let driver = Driver::new(controller, LoggingActuator, bus.prefix());
    driver::run(driver, inbound, &bus, tick_every, shutdown_signal()).await;

    info!(lane = %lane, "crossway-controller shutdown complete");
    Ok(())
}

/// Load the controller configuration.
///
/// The path comes from `CROSSWAY_CONFIG`, defaulting to
/// `crossway-config.yaml` in the working directory. A missing file means
/// defaults; environment overrides apply either way.
fn load_config() -> Result<(ControllerConfig, ConfigSource), NodeError> {
    let path = std::env::var_os("CROSSWAY_CONFIG")
        .map_or_else(|| PathBuf::from("crossway-config.yaml"), PathBuf::from);
    if Path::new(&path).exists() {
        let config = ControllerConfig::from_file(&path)?;
        Ok((config, ConfigSource::File(path)))
    } else {
        let mut config = ControllerConfig::default();
        config.infrastructure.apply_env_overrides();
        config.validate()?;
        Ok((config, ConfigSource::Defaults(path)))
    }
}

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Read this process's lane from `LANE_ID`.
fn lane_from_env() -> Result<LaneId, NodeError> {
    let raw = std::env::var("LANE_ID").map_err(|e| NodeError::Env {
        name: "LANE_ID",
        reason: e.to_string(),
    })?;
    parse_lane(&raw)
}

fn parse_lane(raw: &str) -> Result<LaneId, NodeError> {
    raw.trim()
        .parse::<u32>()
        .ok()
        .and_then(LaneId::new)
        .ok_or_else(|| NodeError::Env {
            name: "LANE_ID",
            reason: format!("`{raw}` is not a lane number (1 or more)"),
        })
}

/// Resolves on Ctrl-C. If the handler cannot be installed the process runs
/// until the subscription ends.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}
