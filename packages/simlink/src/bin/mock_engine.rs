// packages/simlink/src/bin/mock_engine.rs
//! Reference simulation engine
//!
//! Creates the region named by `SIMLINK_SHM_PATH` and plays a deterministic
//! scenario driven by `--key=value` settings:
//!
//! - `entities`, `steps`, `capacity`
//! - `stagger`: entity *i* first appears at step *i*
//! - `crashAtStep`: exit abruptly with `exitCode` before publishing that step
//! - `exitCode`: process exit code
//! - `actionLog`: JSON-lines file receiving every action batch
//! - `handshake`: send the init request before the first step (default true)
//! - `peerTimeoutMs`, `verbose`

use anyhow::{bail, Context, Result};
use simlink::channel::records::{ControlParams, ObservationRecord};
use simlink::channel::slot::WaitPolicy;
use simlink::interface::EngineInterface;
use simlink::observability::init_tracing;
use simlink::orchestrator::{SimulationSettings, SHM_PATH_ENV};
use simlink::utils::config::LoggingSettings;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

const INITIAL_PARAMS: ControlParams = ControlParams {
    spreading_factor: 12,
    tx_power_dbm: 14,
};

/// Scenario read from the command line
#[derive(Debug)]
struct Scenario {
    entities: u32,
    steps: u64,
    capacity: usize,
    stagger: bool,
    crash_at_step: Option<u64>,
    exit_code: i32,
    action_log: Option<PathBuf>,
    handshake: bool,
    peer_timeout: Duration,
    verbose: bool,
}

impl Scenario {
    fn from_settings(settings: &SimulationSettings) -> Result<Self> {
        let scenario = Self {
            entities: settings.count("entities").unwrap_or(1) as u32,
            steps: settings.count("steps").unwrap_or(1),
            capacity: settings.count("capacity").unwrap_or(64) as usize,
            stagger: settings.flag("stagger").unwrap_or(false),
            crash_at_step: settings.count("crashAtStep"),
            exit_code: settings.count("exitCode").unwrap_or(0) as i32,
            action_log: settings.text("actionLog").map(PathBuf::from),
            handshake: settings.flag("handshake").unwrap_or(true),
            peer_timeout: Duration::from_millis(settings.count("peerTimeoutMs").unwrap_or(30_000)),
            verbose: settings.flag("verbose").unwrap_or(false),
        };
        if scenario.entities as usize > scenario.capacity {
            bail!(
                "{} entities do not fit a region of capacity {}",
                scenario.entities,
                scenario.capacity
            );
        }
        Ok(scenario)
    }

    /// Entities present at `step`
    fn active(&self, step: u64) -> impl Iterator<Item = u32> {
        let count = if self.stagger {
            (step + 1).min(self.entities as u64) as u32
        } else {
            self.entities
        };
        0..count
    }
}

/// Deterministic link metrics of one entity at one step
fn observe(entity_id: u32, step: u64, params: ControlParams, steps: u64) -> ObservationRecord {
    let id = entity_id as u64;
    let snr = -20.0 + ((step * 7 + id * 13) % 25) as f64;
    let rssi = -130.0 + ((step * 3 + id * 5) % 40) as f64;
    let battery = 1.0 - 0.5 * step as f64 / steps.max(1) as f64;
    ObservationRecord::new(entity_id, params).with_metrics(snr, rssi, battery)
}

fn run(scenario: &Scenario, path: PathBuf) -> Result<()> {
    let wait = WaitPolicy::new(scenario.peer_timeout);
    let mut engine = EngineInterface::create(&path, scenario.capacity, wait)
        .with_context(|| format!("Failed to create region {:?}", path))?;
    info!("Region {:?} ready for {} entities", path, scenario.entities);

    if scenario.handshake {
        let manager_id = engine.initialize().context("Init request was not answered")?;
        debug!("Actions must carry manager id {}", manager_id);
    }

    let mut log = match &scenario.action_log {
        Some(path) => Some(BufWriter::new(
            File::create(path).with_context(|| format!("Failed to create {:?}", path))?,
        )),
        None => None,
    };

    let mut params: BTreeMap<u32, ControlParams> = BTreeMap::new();

    for step in 0..scenario.steps {
        if scenario.crash_at_step == Some(step) {
            if let Some(log) = log.as_mut() {
                log.flush()?;
            }
            eprintln!("mock engine: crashing at step {}", step);
            std::process::exit(scenario.exit_code);
        }

        let records: Vec<ObservationRecord> = scenario
            .active(step)
            .map(|id| {
                let current = *params.entry(id).or_insert(INITIAL_PARAMS);
                observe(id, step, current, scenario.steps)
            })
            .collect();

        engine.publish_observations(&records)?;
        let actions = engine.collect_actions()?;

        for action in actions.records() {
            if !records.iter().any(|r| r.entity_id == action.entity_id) {
                bail!("action for unobserved entity {} at step {}", action.entity_id, step);
            }
            params.insert(action.entity_id, action.params());
        }

        if let Some(log) = log.as_mut() {
            serde_json::to_writer(&mut *log, &actions)?;
            log.write_all(b"\n")?;
        }

        if scenario.verbose {
            println!(
                "step {}: {} observations, {} actions",
                step,
                records.len(),
                actions.len()
            );
        }
        debug!("Step {} complete", step);
    }

    engine.finish()?;
    if let Some(mut log) = log {
        log.flush()?;
    }
    Ok(())
}

fn main() -> Result<()> {
    let settings = SimulationSettings::from_args(std::env::args().skip(1));
    let scenario = Scenario::from_settings(&settings)?;

    init_tracing(&LoggingSettings {
        level: if scenario.verbose { "debug" } else { "warn" }.to_string(),
        ..Default::default()
    });

    let path = match std::env::var_os(SHM_PATH_ENV) {
        Some(path) => PathBuf::from(path),
        None => bail!("{} is not set", SHM_PATH_ENV),
    };

    run(&scenario, path)?;

    if scenario.exit_code != 0 {
        std::process::exit(scenario.exit_code);
    }
    Ok(())
}
