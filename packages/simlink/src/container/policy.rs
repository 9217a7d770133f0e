// packages/simlink/src/container/policy.rs
//! Pluggable decision policies
//!
//! A policy turns one entity's observation and its accumulated state into
//! new control parameters. The container calls it exactly once per
//! observation record, so a policy cannot skip an entity or answer for one
//! that was not observed.

use crate::channel::records::{ControlParams, ObservationRecord};
use crate::container::state::EntityState;

/// Step-level information handed to the policy alongside each record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecisionContext {
    /// Step the observation batch belongs to
    pub step: u64,
    /// Reproducibility stream id of the container
    pub stream: u64,
    /// Position of the record within the batch
    pub index: usize,
    /// Number of records in the batch
    pub batch_len: usize,
}

/// Action computation injected into the decision container
pub trait DecisionPolicy: Send {
    /// Name used in logs and error reports
    fn name(&self) -> &str;

    /// Compute the new parameters for one observed entity
    ///
    /// Any randomness must come from `state.rng()` so runs with the same
    /// stream id are reproducible.
    fn compute_action(
        &mut self,
        ctx: &DecisionContext,
        observation: &ObservationRecord,
        state: &mut EntityState,
    ) -> anyhow::Result<ControlParams>;
}

/// Re-commands whatever parameters the entity reports
#[derive(Debug, Clone, Copy, Default)]
pub struct HoldPolicy;

impl DecisionPolicy for HoldPolicy {
    fn name(&self) -> &str {
        "hold"
    }

    fn compute_action(
        &mut self,
        _ctx: &DecisionContext,
        observation: &ObservationRecord,
        _state: &mut EntityState,
    ) -> anyhow::Result<ControlParams> {
        Ok(observation.params())
    }
}

impl<P: DecisionPolicy + ?Sized> DecisionPolicy for Box<P> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn compute_action(
        &mut self,
        ctx: &DecisionContext,
        observation: &ObservationRecord,
        state: &mut EntityState,
    ) -> anyhow::Result<ControlParams> {
        (**self).compute_action(ctx, observation, state)
    }
}
