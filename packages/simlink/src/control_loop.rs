// packages/simlink/src/control_loop.rs
//! Control loop
//!
//! Drives the message interface and decision container step by step:
//!
//! ```text
//! running ──finished seen after receive_begin──▶ finishing ──receive_end──▶ terminated
//! ```
//!
//! The final step releases the observation without answering it.

use crate::channel::records::{ActionBatch, ObservationBatch};
use crate::container::decision_container::DecisionContainer;
use crate::interface::message_interface::MessageInterface;
use crate::interface::phase::PhaseCounters;
use crate::orchestrator::experiment::Experiment;
use crate::orchestrator::process_manager::ExitReport;
use crate::utils::config::SimlinkConfig;
use crate::utils::errors::{ProtocolViolation, Result, SimlinkError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use tokio::io::AsyncWrite;
use tracing::{debug, error, info};
use ulid::Ulid;

/// Control loop state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Running,
    Finishing,
    Terminated,
}

/// Outcome of a loop that reached the termination signal
#[derive(Debug, Clone, Serialize)]
pub struct LoopSummary {
    /// Steps whose action batch was sent
    pub steps: u64,
    /// Phase calls made on the message interface
    pub counters: PhaseCounters,
    /// Entities tracked by the container at the end of the run
    pub entities: usize,
}

/// Lock-step driver over one attached interface and one container
pub struct ControlLoop<'a> {
    interface: &'a mut MessageInterface,
    container: &'a mut DecisionContainer,
    state: LoopState,
}

impl<'a> ControlLoop<'a> {
    pub fn new(interface: &'a mut MessageInterface, container: &'a mut DecisionContainer) -> Self {
        Self {
            interface,
            container,
            state: LoopState::Running,
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Run steps until the termination signal is observed
    pub fn run(&mut self) -> Result<LoopSummary> {
        let mut steps = 0u64;
        while self.state == LoopState::Running {
            match self.step() {
                Ok(true) => steps += 1,
                Ok(false) => {}
                Err(e) => {
                    self.record_failure(&e);
                    return Err(e);
                }
            }
        }

        info!("Control loop terminated after {} steps", steps);
        Ok(LoopSummary {
            steps,
            counters: self.interface.counters(),
            entities: self.container.len(),
        })
    }

    /// One step; `false` when the termination signal ended the run instead
    fn step(&mut self) -> Result<bool> {
        let observations = self.interface.receive_begin()?;
        self.interface.send_begin()?;

        if self.interface.get_finished()? {
            self.state = LoopState::Finishing;
            debug!("Termination signal at step {}", observations.step());
            self.interface.receive_end()?;
            self.state = LoopState::Terminated;
            return Ok(false);
        }

        debug!(
            "Step {} begin with {} observations",
            observations.step(),
            observations.len()
        );
        metrics::counter!("simlink_observations_total").increment(observations.len() as u64);

        let actions = self.container.step(&observations)?;
        check_entities(&observations, &actions)?;

        self.interface.receive_end()?;
        self.interface.send_end(&actions)?;

        metrics::counter!("simlink_actions_total").increment(actions.len() as u64);
        metrics::counter!("simlink_steps_total").increment(1);
        debug!("Step {} end with {} actions", actions.step(), actions.len());
        Ok(true)
    }

    fn record_failure(&self, e: &SimlinkError) {
        if e.is_protocol_violation() {
            metrics::counter!("simlink_protocol_violations_total").increment(1);
        }
        error!(
            "Control loop failed in phase {:?} after {} completed steps: {}",
            self.interface.phase(),
            self.interface.counters().completed_steps(),
            e
        );
    }
}

/// Every action must answer an entity of the same observation batch
fn check_entities(observations: &ObservationBatch, actions: &ActionBatch) -> Result<()> {
    let observed: HashSet<u32> = observations.iter().map(|r| r.entity_id).collect();
    match actions
        .records()
        .iter()
        .find(|a| !observed.contains(&a.entity_id))
    {
        Some(action) => Err(ProtocolViolation::UnknownEntity {
            entity_id: action.entity_id,
        }
        .into()),
        None => Ok(()),
    }
}

/// Everything known about one finished experiment
#[derive(Debug)]
pub struct RunReport {
    pub run_id: Ulid,
    /// Loop result; the guaranteed teardown ran either way
    pub outcome: Result<LoopSummary>,
    /// How the engine ended, or why reaping it failed
    pub exit: Result<ExitReport>,
    pub engine_pid: Option<u32>,
    pub container: DecisionContainer,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    /// Collapse into one result: loop failure, then teardown failure, then
    /// engine failure, then success
    pub fn into_result(self) -> Result<LoopSummary> {
        let summary = self.outcome?;
        let exit = self.exit?;
        if !exit.success() {
            return Err(SimlinkError::EnvironmentFailure {
                code: exit.code,
                signal: exit.signal,
            });
        }
        Ok(summary)
    }

    /// JSON-friendly view of the report
    pub fn to_json(&self) -> serde_json::Value {
        let outcome = match &self.outcome {
            Ok(summary) => serde_json::json!({ "ok": summary }),
            Err(e) => error_json(e),
        };
        let exit = match &self.exit {
            Ok(exit) => serde_json::json!({ "ok": exit }),
            Err(e) => error_json(e),
        };
        serde_json::json!({
            "run_id": self.run_id.to_string(),
            "outcome": outcome,
            "exit": exit,
            "engine_pid": self.engine_pid,
            "policy": self.container.policy_name(),
            "stream": self.container.stream(),
            "entities": self.container.summaries(),
            "started_at": self.started_at,
            "finished_at": self.finished_at,
        })
    }
}

fn error_json(e: &SimlinkError) -> serde_json::Value {
    serde_json::json!({ "error": e.to_string(), "kind": format!("{:?}", e.kind()) })
}

/// Launch the engine, run the loop to completion and tear everything down
///
/// Launch failures are returned as `Err`; anything after a successful attach
/// ends up in the [`RunReport`]. Engine output goes to our stdout.
pub async fn run_experiment(config: &SimlinkConfig, container: DecisionContainer) -> Result<RunReport> {
    run_experiment_with_output(config, container, tokio::io::stdout()).await
}

/// [`run_experiment`] with the engine's forwarded output written to `sink`
pub async fn run_experiment_with_output<W>(
    config: &SimlinkConfig,
    mut container: DecisionContainer,
    sink: W,
) -> Result<RunReport>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let started_at = Utc::now();
    let experiment = Experiment::launch_with_output(config, sink).await?;
    let run_id = experiment.run_id();
    let engine_pid = experiment.engine_pid();

    let (experiment, container, outcome) = tokio::task::spawn_blocking(move || {
        let mut experiment = experiment;
        let outcome = experiment
            .interface_mut()
            .and_then(|interface| ControlLoop::new(interface, &mut container).run());
        (experiment, container, outcome)
    })
    .await
    .map_err(|e| SimlinkError::RuntimeError(format!("Control loop task failed: {}", e)))?;

    let exit = experiment.shutdown().await;
    let finished_at = Utc::now();

    match (&outcome, &exit) {
        (Ok(_), Ok(report)) => info!(
            "Run {} finished: ok (engine exit code {:?})",
            run_id, report.code
        ),
        (Err(e), Ok(report)) => info!(
            "Run {} finished: failed with {} (engine exit code {:?})",
            run_id, e, report.code
        ),
        (_, Err(e)) => error!(
            "Run {} teardown failed: {} (loop {})",
            run_id,
            e,
            if outcome.is_ok() { "ok" } else { "failed" }
        ),
    }

    Ok(RunReport {
        run_id,
        outcome,
        exit,
        engine_pid,
        container,
        started_at,
        finished_at,
    })
}
