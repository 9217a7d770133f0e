// packages/simlink/src/container/mod.rs
//! Decision container
//!
//! - **State**: per-entity adaptive state, seeded from the stream id
//! - **Policy**: the pluggable action computation
//! - **Decision Container**: state table plus policy, one step at a time
//!
//! Entities move `unseen → tracked` on their first observation and stay
//! tracked until the container is dropped.

pub mod decision_container;
pub mod policy;
pub mod state;

pub use decision_container::{DecisionContainer, EntitySummary};
pub use policy::{DecisionContext, DecisionPolicy, HoldPolicy};
pub use state::{entity_seed, EntityState, HistoryCombining, StateTuning};
