// packages/simlink/src/lib.rs
//! Simlink: lock-step bridge between a simulation engine and a decision agent
//!
//! The simulation engine runs as a separate process and exchanges one
//! observation batch and one action batch per step with this process through
//! a shared memory region.
//!
//! # Architecture
//!
//! - **channel**: region layout, fixed-size records, one-shot handoff slots
//! - **interface**: four-phase message interface (agent side) and its engine
//!   counterpart
//! - **orchestrator**: engine subprocess launch, settings, scoped teardown
//! - **container**: per-entity state and the pluggable decision policy
//! - **control_loop**: the step driver and `run_experiment`
//! - **observability**: tracing and metrics setup
//! - **utils**: configuration and error types

pub mod channel;
pub mod container;
pub mod control_loop;
pub mod interface;
pub mod observability;
pub mod orchestrator;
pub mod utils;

// Re-export commonly used types
pub use channel::{ActionBatch, ActionRecord, ControlParams, ObservationBatch, ObservationRecord};
pub use container::{DecisionContainer, DecisionPolicy, HoldPolicy};
pub use control_loop::{
    run_experiment, run_experiment_with_output, ControlLoop, LoopState, LoopSummary, RunReport,
};
pub use interface::{EngineInterface, MessageInterface};
pub use orchestrator::{ExitReport, Experiment, SimulationSettings};
pub use utils::config::SimlinkConfig;
pub use utils::errors::{Result, SimlinkError};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
