// packages/simlink/src/interface/mod.rs
//! Message interface over the shared channel
//!
//! - **Message Interface**: agent side, four-phase step API plus the
//!   termination flag; owns the attach/detach lifecycle
//! - **Engine Interface**: simulation side, creates the region and produces
//!   observations
//! - **Phase**: step phase tracking and per-operation counters

pub mod engine_interface;
pub mod message_interface;
pub mod phase;

pub use engine_interface::EngineInterface;
pub use message_interface::MessageInterface;
pub use phase::{PhaseCounters, PhaseOp, PhaseTracker, StepPhase};
