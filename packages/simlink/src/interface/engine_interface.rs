// packages/simlink/src/interface/engine_interface.rs
//! Simulation-engine side of the channel
//!
//! Creates the region and drives the producer half of each step: publish
//! observations, then wait for the matching actions. `finish` raises the
//! termination signal and publishes one last empty observation so a blocked
//! agent wakes up and sees it.
//!
//! Before the first step the engine may send an init request
//! ([`EngineInterface::initialize`]); the agent answers with its manager id,
//! which then tags every observation and must tag every action.

use crate::channel::layout::{SlotState, AGENT_ABORT_BIT, ENGINE_ABORT_BIT};
use crate::channel::records::{ActionBatch, ObservationRecord, OP_INIT};
use crate::channel::region::SharedRegion;
use crate::channel::slot::{SlotHandle, WaitPolicy};
use crate::utils::errors::{ProtocolViolation, Result, SlotKind};
use std::path::Path;
use std::sync::atomic::Ordering;
use tracing::{debug, info, warn};

/// Producer side of the channel
pub struct EngineInterface {
    region: SharedRegion,
    wait: WaitPolicy,
    step: u64,
    finished: bool,
    manager_id: Option<u8>,
}

impl EngineInterface {
    /// Create the region at `path` sized for `capacity` entities
    pub fn create<P: AsRef<Path>>(path: P, capacity: usize, wait: WaitPolicy) -> Result<Self> {
        let region = SharedRegion::create(path, capacity)?;
        Ok(Self {
            region,
            wait,
            step: 0,
            finished: false,
            manager_id: None,
        })
    }

    /// Send the init request and wait for the agent's manager id
    ///
    /// Only meaningful before the first step: the agent answers it once.
    pub fn initialize(&mut self) -> Result<u8> {
        if self.finished {
            return Err(ProtocolViolation::RunFinished.into());
        }
        if self.manager_id.is_some() {
            return Err(ProtocolViolation::AlreadyRegistered.into());
        }

        let slot = init_slot(&self.region);
        slot.claim("initialize", SlotState::Empty, SlotState::Writing, &self.wait)?;
        slot.stamp(0, OP_INIT as u64);
        slot.release(SlotState::Writing, SlotState::Full)?;

        // The answer is stored before the agent hands the slot back.
        slot.claim("initialize", SlotState::Empty, SlotState::Empty, &self.wait)?;
        let manager_id = self.region.header().manager_id.load(Ordering::Acquire) as u8;
        self.manager_id = Some(manager_id);

        info!("Agent registered as manager {}", manager_id);
        Ok(manager_id)
    }

    /// Publish the observations for the current step
    pub fn publish_observations(&mut self, records: &[ObservationRecord]) -> Result<u64> {
        if self.finished {
            return Err(ProtocolViolation::RunFinished.into());
        }
        if records.len() > self.region.capacity() {
            return Err(ProtocolViolation::CapacityExceeded {
                len: records.len(),
                capacity: self.region.capacity(),
            }
            .into());
        }

        observation_slot(&self.region).claim(
            "publish_observations",
            SlotState::Empty,
            SlotState::Writing,
            &self.wait,
        )?;
        match self.manager_id {
            Some(manager_id) => {
                let tagged: Vec<ObservationRecord> = records
                    .iter()
                    .map(|r| ObservationRecord { manager_id, ..*r })
                    .collect();
                self.region.write_observations(&tagged)?;
            }
            None => self.region.write_observations(records)?,
        }

        let slot = observation_slot(&self.region);
        slot.stamp(records.len(), self.step);
        slot.release(SlotState::Writing, SlotState::Full)?;

        debug!("Published step {} ({} observations)", self.step, records.len());
        Ok(self.step)
    }

    /// Wait for the agent's actions for the current step and advance
    pub fn collect_actions(&mut self) -> Result<ActionBatch> {
        let slot = action_slot(&self.region);
        slot.claim(
            "collect_actions",
            SlotState::Full,
            SlotState::Reading,
            &self.wait,
        )?;
        let (len, step) = slot.published();
        let records = self.region.read_actions(len)?;
        slot.release(SlotState::Reading, SlotState::Empty)?;

        if let Some(expected) = self.manager_id {
            if let Some(stray) = records.iter().find(|r| r.manager_id != expected) {
                warn!(
                    "Step {} action for entity {} tagged with manager {}",
                    step, stray.entity_id, stray.manager_id
                );
                return Err(ProtocolViolation::ManagerMismatch {
                    expected,
                    found: stray.manager_id,
                }
                .into());
            }
        }

        self.step += 1;
        Ok(ActionBatch::from_records(step, records))
    }

    /// Raise the termination signal and wake the agent
    pub fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }

        observation_slot(&self.region).claim(
            "finish",
            SlotState::Empty,
            SlotState::Writing,
            &self.wait,
        )?;
        self.region.header().finished.store(1, Ordering::Release);
        let slot = observation_slot(&self.region);
        slot.stamp(0, self.step);
        slot.release(SlotState::Writing, SlotState::Full)?;
        self.finished = true;

        // The agent releases the final observation without answering it.
        slot.claim("finish", SlotState::Empty, SlotState::Empty, &self.wait)?;

        info!("Simulation finished after {} steps", self.step);
        Ok(())
    }

    /// Raise the engine abort flag so a waiting agent stops immediately
    pub fn abort(&self) {
        self.region.header().raise_abort(ENGINE_ABORT_BIT);
    }

    /// Manager id received by [`initialize`](Self::initialize)
    pub fn manager_id(&self) -> Option<u8> {
        self.manager_id
    }

    pub fn agent_aborted(&self) -> bool {
        self.region.header().is_aborted(AGENT_ABORT_BIT)
    }

    /// Steps completed so far
    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn capacity(&self) -> usize {
        self.region.capacity()
    }

    pub fn path(&self) -> &Path {
        self.region.path()
    }
}

impl Drop for EngineInterface {
    fn drop(&mut self) {
        if !self.finished {
            self.abort();
        }
    }
}

fn observation_slot(region: &SharedRegion) -> SlotHandle<'_> {
    SlotHandle {
        kind: SlotKind::Observation,
        control: &region.header().observation,
        header: region.header(),
        peer_abort_bit: AGENT_ABORT_BIT,
    }
}

fn action_slot(region: &SharedRegion) -> SlotHandle<'_> {
    SlotHandle {
        kind: SlotKind::Action,
        control: &region.header().action,
        header: region.header(),
        peer_abort_bit: AGENT_ABORT_BIT,
    }
}

fn init_slot(region: &SharedRegion) -> SlotHandle<'_> {
    SlotHandle {
        kind: SlotKind::Init,
        control: &region.header().init,
        header: region.header(),
        peer_abort_bit: AGENT_ABORT_BIT,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::records::ControlParams;
    use std::time::Duration;
    use tempfile::TempDir;

    fn short_wait() -> WaitPolicy {
        WaitPolicy {
            timeout: Duration::from_millis(100),
            poll_interval: Duration::from_micros(50),
            liveness_interval: Duration::from_millis(1),
            probe: None,
        }
    }

    #[test]
    fn test_second_publish_waits_for_consumer() {
        let dir = TempDir::new().unwrap();
        let mut engine = EngineInterface::create(dir.path().join("e.shm"), 2, short_wait()).unwrap();

        let obs = [ObservationRecord::new(1, ControlParams::new(7, 14))];
        engine.publish_observations(&obs).unwrap();

        // Nobody consumed the first batch, so the slot never frees up.
        let err = engine.publish_observations(&obs).unwrap_err();
        assert!(err.is_peer_lost());
    }

    #[test]
    fn test_publish_rejects_oversized_batch() {
        let dir = TempDir::new().unwrap();
        let mut engine = EngineInterface::create(dir.path().join("e.shm"), 1, short_wait()).unwrap();

        let obs = vec![ObservationRecord::default(); 2];
        assert!(engine.publish_observations(&obs).unwrap_err().is_protocol_violation());
    }

    #[test]
    fn test_drop_unfinished_raises_abort() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("e.shm");
        let engine = EngineInterface::create(&path, 1, short_wait()).unwrap();
        let observer = SharedRegion::try_open(&path).unwrap().unwrap();

        drop(engine);
        assert!(observer.header().is_aborted(ENGINE_ABORT_BIT));
    }

    #[test]
    fn test_initialize_without_agent_times_out() {
        let dir = TempDir::new().unwrap();
        let mut engine = EngineInterface::create(dir.path().join("e.shm"), 1, short_wait()).unwrap();
        assert!(engine.initialize().unwrap_err().is_peer_lost());
        assert_eq!(engine.manager_id(), None);
    }

    #[test]
    fn test_collect_without_agent_times_out() {
        let dir = TempDir::new().unwrap();
        let mut engine = EngineInterface::create(dir.path().join("e.shm"), 1, short_wait()).unwrap();
        assert!(engine.collect_actions().unwrap_err().is_peer_lost());
        assert_eq!(engine.step(), 0);
    }
}
