// packages/simlink/src/container/decision_container.rs
//! Decision container
//!
//! Owns every entity's state for the lifetime of a run and turns one
//! observation batch into one action batch per step.

use crate::channel::records::{ActionBatch, ActionRecord, ControlParams, ObservationBatch};
use crate::container::policy::{DecisionContext, DecisionPolicy};
use crate::container::state::{EntityState, StateTuning};
use crate::utils::config::ContainerSettings;
use crate::utils::errors::{ProtocolViolation, Result, SimlinkError};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use tracing::{debug, error};

/// Reported view of one entity at the end of a run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntitySummary {
    pub entity_id: u32,
    pub first_seen_step: u64,
    pub last_seen_step: u64,
    pub observations: u64,
    pub snr_average: f64,
    /// Combined SNR window, absent until `history_range` samples arrived
    pub recent_snr: Option<f64>,
    pub reported: ControlParams,
    pub commanded: Option<ControlParams>,
}

impl From<&EntityState> for EntitySummary {
    fn from(state: &EntityState) -> Self {
        Self {
            entity_id: state.entity_id(),
            first_seen_step: state.first_seen_step(),
            last_seen_step: state.last_seen_step(),
            observations: state.observations(),
            snr_average: state.snr_average(),
            recent_snr: state.recent_snr(),
            reported: state.reported(),
            commanded: state.commanded(),
        }
    }
}

/// Per-entity state keyed by entity id plus the injected policy
pub struct DecisionContainer {
    stream: u64,
    tuning: StateTuning,
    policy: Box<dyn DecisionPolicy>,
    states: HashMap<u32, EntityState>,
    steps: u64,
}

impl DecisionContainer {
    /// Container with default tuning
    pub fn new(stream: u64, policy: Box<dyn DecisionPolicy>) -> Self {
        Self {
            stream,
            tuning: StateTuning::default(),
            policy,
            states: HashMap::new(),
            steps: 0,
        }
    }

    /// Container configured from the `container` settings section
    pub fn from_settings(settings: &ContainerSettings, policy: Box<dyn DecisionPolicy>) -> Self {
        Self {
            stream: settings.stream,
            tuning: StateTuning::from(settings),
            policy,
            states: HashMap::new(),
            steps: 0,
        }
    }

    /// Update state from `observations` and compute the step's actions
    ///
    /// Actions come out in the order of the observations, one per record.
    pub fn step(&mut self, observations: &ObservationBatch) -> Result<ActionBatch> {
        let step = observations.step();

        let mut seen = HashSet::with_capacity(observations.len());
        for record in observations.iter() {
            if !seen.insert(record.entity_id) {
                return Err(ProtocolViolation::DuplicateEntity {
                    entity_id: record.entity_id,
                }
                .into());
            }
        }

        let mut actions = ActionBatch::with_capacity(step, observations.len());
        for (index, record) in observations.iter().enumerate() {
            let stream = self.stream;
            let tuning = self.tuning;
            let state = self.states.entry(record.entity_id).or_insert_with(|| {
                debug!("Tracking entity {} from step {}", record.entity_id, step);
                EntityState::new(record.entity_id, stream, step, tuning)
            });
            state.observe(record, step);

            let ctx = DecisionContext {
                step,
                stream,
                index,
                batch_len: observations.len(),
            };
            let params = self
                .policy
                .compute_action(&ctx, record, state)
                .map_err(|e| {
                    error!(
                        "Policy '{}' failed at step {} for entity {}: {:#}",
                        self.policy.name(),
                        step,
                        record.entity_id,
                        e
                    );
                    SimlinkError::DecisionFailed {
                        step,
                        entity_id: record.entity_id,
                        policy: self.policy.name().to_string(),
                        reason: format!("{:#}", e),
                    }
                })?;

            state.record_action(params);
            actions.push(ActionRecord::new(record.entity_id, params));
        }

        self.steps += 1;
        metrics::gauge!("simlink_tracked_entities").set(self.states.len() as f64);
        Ok(actions)
    }

    pub fn state(&self, entity_id: u32) -> Option<&EntityState> {
        self.states.get(&entity_id)
    }

    /// Ids of all entities seen so far, ascending
    pub fn tracked_entities(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.states.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Summaries of all tracked entities, ascending by id
    pub fn summaries(&self) -> Vec<EntitySummary> {
        self.tracked_entities()
            .into_iter()
            .filter_map(|id| self.states.get(&id).map(EntitySummary::from))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn stream(&self) -> u64 {
        self.stream
    }

    /// Steps processed so far
    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn policy_name(&self) -> &str {
        self.policy.name()
    }
}

impl fmt::Debug for DecisionContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecisionContainer")
            .field("stream", &self.stream)
            .field("policy", &self.policy.name())
            .field("entities", &self.states.len())
            .field("steps", &self.steps)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::records::{ControlParams, ObservationRecord};
    use crate::container::policy::HoldPolicy;
    use crate::container::state::HistoryCombining;
    use proptest::prelude::*;
    use rand::Rng;

    /// Picks a random spreading factor from the entity's own stream
    struct JitterPolicy;

    impl DecisionPolicy for JitterPolicy {
        fn name(&self) -> &str {
            "jitter"
        }

        fn compute_action(
            &mut self,
            _ctx: &DecisionContext,
            observation: &ObservationRecord,
            state: &mut EntityState,
        ) -> anyhow::Result<ControlParams> {
            let sf = state.rng().gen_range(7..=12);
            Ok(ControlParams::new(sf, observation.tx_power_dbm))
        }
    }

    struct FailingPolicy {
        fail_on: u32,
    }

    impl DecisionPolicy for FailingPolicy {
        fn name(&self) -> &str {
            "failing"
        }

        fn compute_action(
            &mut self,
            _ctx: &DecisionContext,
            observation: &ObservationRecord,
            _state: &mut EntityState,
        ) -> anyhow::Result<ControlParams> {
            if observation.entity_id == self.fail_on {
                anyhow::bail!("no model for entity {}", observation.entity_id);
            }
            Ok(observation.params())
        }
    }

    fn obs(id: u32, snr: f64) -> ObservationRecord {
        ObservationRecord::new(id, ControlParams::new(12, 14)).with_metrics(snr, -110.0, 1.0)
    }

    fn batch(step: u64, ids: &[u32]) -> ObservationBatch {
        ObservationBatch::new(step, ids.iter().map(|&id| obs(id, -5.0 - id as f64)).collect())
    }

    #[test]
    fn test_one_action_per_observation_in_order() {
        let mut container = DecisionContainer::new(100, Box::new(HoldPolicy));
        let actions = container.step(&batch(0, &[5, 2, 9])).unwrap();

        let ids: Vec<u32> = actions.records().iter().map(|a| a.entity_id).collect();
        assert_eq!(ids, vec![5, 2, 9]);
        assert_eq!(actions.step(), 0);
        assert_eq!(container.tracked_entities(), vec![2, 5, 9]);
    }

    #[test]
    fn test_empty_batch_yields_empty_actions() {
        let mut container = DecisionContainer::new(1, Box::new(HoldPolicy));
        let actions = container.step(&ObservationBatch::new(4, vec![])).unwrap();
        assert!(actions.is_empty());
        assert!(container.is_empty());
    }

    #[test]
    fn test_entities_initialised_independently() {
        let mut container = DecisionContainer::new(100, Box::new(JitterPolicy));

        container.step(&batch(0, &[1])).unwrap();
        let a_after_first = container.state(1).unwrap().clone();

        container.step(&batch(1, &[2])).unwrap();
        let a = container.state(1).unwrap();
        let b = container.state(2).unwrap();

        assert_eq!(a.first_seen_step(), 0);
        assert_eq!(b.first_seen_step(), 1);
        assert_eq!(a.observations(), a_after_first.observations());
        assert_eq!(a.snr_average(), a_after_first.snr_average());
        assert_eq!(a.commanded(), a_after_first.commanded());
        assert_ne!(a.seed(), b.seed());
    }

    #[test]
    fn test_state_persists_across_steps() {
        let mut container = DecisionContainer::new(100, Box::new(HoldPolicy));
        for step in 0..4 {
            container.step(&batch(step, &[7])).unwrap();
        }
        let state = container.state(7).unwrap();
        assert_eq!(state.observations(), 4);
        assert_eq!(state.last_seen_step(), 3);
        assert_eq!(container.steps(), 4);
    }

    #[test]
    fn test_summaries_combine_snr_window() {
        let settings = ContainerSettings {
            history_range: 2,
            history_combining: HistoryCombining::Maximum,
            ..Default::default()
        };
        let mut container = DecisionContainer::from_settings(&settings, Box::new(HoldPolicy));

        container
            .step(&ObservationBatch::new(0, vec![obs(4, -12.0)]))
            .unwrap();
        assert_eq!(container.summaries()[0].recent_snr, None);

        container
            .step(&ObservationBatch::new(1, vec![obs(4, -3.0), obs(1, -8.0)]))
            .unwrap();
        let summaries = container.summaries();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].entity_id, 1);
        assert_eq!(summaries[0].recent_snr, None);
        assert_eq!(summaries[1].entity_id, 4);
        assert_eq!(summaries[1].recent_snr, Some(-3.0));
        assert_eq!(summaries[1].observations, 2);
        assert_eq!(summaries[1].commanded, Some(ControlParams::new(12, 14)));
    }

    #[test]
    fn test_duplicate_entity_rejected() {
        let mut container = DecisionContainer::new(100, Box::new(HoldPolicy));
        let err = container.step(&batch(0, &[3, 4, 3])).unwrap_err();
        assert_eq!(
            err.as_violation(),
            Some(&ProtocolViolation::DuplicateEntity { entity_id: 3 })
        );
        assert!(container.is_empty());
    }

    #[test]
    fn test_policy_failure_reports_context() {
        let mut container = DecisionContainer::new(100, Box::new(FailingPolicy { fail_on: 8 }));
        let err = container.step(&batch(6, &[1, 8])).unwrap_err();
        match err {
            SimlinkError::DecisionFailed {
                step,
                entity_id,
                policy,
                reason,
            } => {
                assert_eq!(step, 6);
                assert_eq!(entity_id, 8);
                assert_eq!(policy, "failing");
                assert!(reason.contains("no model"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    fn id_batches() -> impl Strategy<Value = Vec<Vec<u32>>> {
        prop::collection::vec(
            prop::collection::hash_set(0u32..32, 0..8).prop_map(|s| s.into_iter().collect()),
            1..12,
        )
    }

    proptest! {
        #[test]
        fn prop_actions_match_observed_ids(batches in id_batches()) {
            let mut container = DecisionContainer::new(100, Box::new(JitterPolicy));
            for (step, ids) in batches.iter().enumerate() {
                let actions = container.step(&batch(step as u64, ids)).unwrap();
                let action_ids: Vec<u32> = actions.records().iter().map(|a| a.entity_id).collect();
                prop_assert_eq!(&action_ids, ids);
            }
        }

        #[test]
        fn prop_same_stream_same_actions(batches in id_batches(), stream in any::<u64>()) {
            let mut first = DecisionContainer::new(stream, Box::new(JitterPolicy));
            let mut second = DecisionContainer::new(stream, Box::new(JitterPolicy));
            for (step, ids) in batches.iter().enumerate() {
                let input = batch(step as u64, ids);
                let a = first.step(&input).unwrap();
                let b = second.step(&input).unwrap();
                prop_assert_eq!(a.as_bytes(), b.as_bytes());
            }
        }
    }
}
