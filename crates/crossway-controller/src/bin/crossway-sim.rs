//! Whole-intersection simulation on an in-memory lossy bus.
//!
//! Runs one controller per lane against a manual clock and reports the
//! serving order, completed cycles, and whether two lanes were ever off red
//! at once. Knobs come from the environment:
//!
//! | Variable | Default | Meaning |
//! |---|---|---|
//! | `CROSSWAY_CONFIG` | `crossway-config.yaml` | Controller configuration (defaults if missing) |
//! | `CROSSWAY_SIM_SECONDS` | `300` | Simulated run length |
//! | `CROSSWAY_SIM_DROP` | `0.0` | Per-delivery loss probability |
//! | `CROSSWAY_SIM_DUPLICATE` | `0.0` | Per-delivery duplication probability |
//! | `CROSSWAY_SIM_DELAY` | `0.0` | Per-delivery probability of a late arrival |
//! | `CROSSWAY_SIM_MAX_DELAY_MS` | `2000` | Longest late arrival |
//! | `CROSSWAY_SIM_SEED` | `7` | Seed for bus faults and detector traffic |
//! | `CROSSWAY_SIM_MAX_VEHICLES` | `12` | Upper bound of each simulated count |

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context as _, bail};
use crossway_core::config::ControllerConfig;
use crossway_core::simulation::{Simulation, SimulationOptions};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .init();

    let config = load_config()?;
    let seconds: u32 = env_or("CROSSWAY_SIM_SECONDS", 300)?;
    let max_vehicles: u32 = env_or("CROSSWAY_SIM_MAX_VEHICLES", 12)?;
    let options = SimulationOptions {
        drop_rate: env_or("CROSSWAY_SIM_DROP", 0.0)?,
        duplicate_rate: env_or("CROSSWAY_SIM_DUPLICATE", 0.0)?,
        delay_rate: env_or("CROSSWAY_SIM_DELAY", 0.0)?,
        max_delay: Duration::from_millis(env_or("CROSSWAY_SIM_MAX_DELAY_MS", 2_000)?),
        seed: env_or("CROSSWAY_SIM_SEED", 7)?,
        step: config.timing.tick_interval(),
        ..SimulationOptions::default()
    };
    info!(
        seconds,
        max_vehicles,
        drop_rate = options.drop_rate,
        duplicate_rate = options.duplicate_rate,
        delay_rate = options.delay_rate,
        seed = options.seed,
        "crossway-sim starting"
    );

    let lanes: Vec<_> = config
        .intersection
        .ring()
        .context("intersection has no lanes")?
        .lanes()
        .collect();
    let mut sim = Simulation::new(&config, options).context("failed to build simulation")?;
    let mut traffic = StdRng::seed_from_u64(options.seed.wrapping_add(1));

    for _ in 0..seconds {
        for lane in &lanes {
            sim.inject_vehicle_count(*lane, traffic.random_range(0..=max_vehicles))?;
        }
        sim.run_for(Duration::from_secs(1))?;
    }

    let report = sim.report();
    let order: Vec<String> = report.green_order.iter().map(ToString::to_string).collect();
    info!(
        steps = report.steps,
        greens = report.green_order.len(),
        cycles = report.durations.len(),
        grants = report.grants,
        dropped = report.dropped,
        duplicated = report.duplicated,
        delayed = report.delayed,
        max_concurrent_green = report.max_concurrent_green,
        order = order.join(" "),
        "simulation finished"
    );
    for cycle in &report.durations {
        info!(
            lane = %cycle.lane,
            vehicles = cycle.total_vehicles,
            seconds = cycle.duration_seconds,
            "cycle"
        );
    }

    if report.max_concurrent_green > 1 {
        bail!(
            "{} lanes were off red at the same time",
            report.max_concurrent_green
        );
    }
    Ok(())
}

fn load_config() -> anyhow::Result<ControllerConfig> {
    let path = std::env::var_os("CROSSWAY_CONFIG")
        .map_or_else(|| PathBuf::from("crossway-config.yaml"), PathBuf::from);
    if path.exists() {
        ControllerConfig::from_file(&path)
            .with_context(|| format!("failed to load {}", path.display()))
    } else {
        info!(path = %path.display(), "config file not found, using defaults");
        Ok(ControllerConfig::default())
    }
}

fn env_or<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{name}=`{raw}` is not valid")),
        Err(_) => Ok(default),
    }
}
