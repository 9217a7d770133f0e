// packages/simlink/src/orchestrator/mod.rs
//! Process orchestration for the simulation engine
//!
//! - **Settings**: the key/value configuration record rendered as engine arguments
//! - **Process Manager**: spawning, signalling and reaping the engine
//! - **Experiment**: scoped subprocess plus channel handle with guaranteed teardown

pub mod experiment;
pub mod process_manager;
pub mod settings;

pub use experiment::Experiment;
pub use process_manager::{ExitReport, ProcessManager, SpawnConfig, SHM_PATH_ENV};
pub use settings::{SettingValue, SimulationSettings};
