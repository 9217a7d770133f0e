// packages/simlink/src/interface/message_interface.rs
//! Agent-side message interface
//!
//! Wraps an attached [`SharedRegion`] with the four-phase step API:
//!
//! ```text
//! receive_begin → send_begin → get_finished? → [work] → receive_end → send_end
//! ```
//!
//! `receive_begin` and `send_begin` block until the engine hands the slot
//! over. When `get_finished` reports termination the caller releases the
//! observation with `receive_end` and stops; no action is sent for that step.
//!
//! An engine that sends an init request expects [`MessageInterface::register`]
//! before the first step; registered actions carry the manager id.

use crate::channel::layout::{SlotState, AGENT_ABORT_BIT, ENGINE_ABORT_BIT};
use crate::channel::records::{ActionBatch, ActionRecord, ObservationBatch, OP_INIT};
use crate::channel::region::SharedRegion;
use crate::channel::slot::{SlotHandle, WaitPolicy};
use crate::interface::phase::{PhaseCounters, PhaseOp, PhaseTracker, StepPhase};
use crate::utils::errors::{ProtocolViolation, Result, SimlinkError, SlotKind};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};

/// Handle on the agent side of the channel
pub struct MessageInterface {
    region: Option<SharedRegion>,
    path: PathBuf,
    wait: WaitPolicy,
    tracker: PhaseTracker,
    finished_seen: bool,
    manager_id: Option<u8>,
}

impl MessageInterface {
    /// Attach to the region at `path`, waiting up to `attach_timeout` for the
    /// engine to create it
    pub fn attach<P: AsRef<Path>>(
        path: P,
        wait: WaitPolicy,
        attach_timeout: Duration,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let started = Instant::now();

        let region = loop {
            if let Some(region) = SharedRegion::try_open(&path)? {
                break region;
            }
            if let Some(probe) = &wait.probe {
                if !probe.is_alive() {
                    return Err(SimlinkError::AttachFailed(format!(
                        "{} before exposing {:?}",
                        probe.describe(),
                        path
                    )));
                }
            }
            if started.elapsed() >= attach_timeout {
                return Err(SimlinkError::AttachFailed(format!(
                    "region {:?} not ready within {:?}",
                    path, attach_timeout
                )));
            }
            std::thread::sleep(wait.liveness_interval);
        };

        region
            .header()
            .attached
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| SimlinkError::from(ProtocolViolation::AlreadyAttached))?;

        info!(
            "Attached to region {:?} (capacity {})",
            path,
            region.capacity()
        );

        Ok(Self {
            region: Some(region),
            path,
            wait,
            tracker: PhaseTracker::new(),
            finished_seen: false,
            manager_id: None,
        })
    }

    /// Wait for the engine's init request and answer it with `manager_id`
    pub fn register(&mut self, manager_id: u8) -> Result<()> {
        let region = self.region.as_ref().ok_or(ProtocolViolation::Detached)?;
        if self.manager_id.is_some() {
            return Err(ProtocolViolation::AlreadyRegistered.into());
        }
        if self.tracker.phase() != StepPhase::Idle || self.tracker.counters().receive_begin > 0 {
            return Err(ProtocolViolation::PhaseOutOfOrder {
                operation: "register",
                phase: self.tracker.phase(),
            }
            .into());
        }

        let slot = init_slot(region);
        slot.claim("register", SlotState::Full, SlotState::Reading, &self.wait)?;
        let (_, operation) = slot.published();
        if operation != OP_INIT as u64 {
            slot.release(SlotState::Reading, SlotState::Empty)?;
            return Err(ProtocolViolation::UnexpectedOperation {
                expected: OP_INIT,
                found: operation,
            }
            .into());
        }
        region
            .header()
            .manager_id
            .store(manager_id as u32, Ordering::Release);
        slot.release(SlotState::Reading, SlotState::Empty)?;

        self.manager_id = Some(manager_id);
        info!("Registered with the engine as manager {}", manager_id);
        Ok(())
    }

    /// Block until the engine publishes the next observation batch
    pub fn receive_begin(&mut self) -> Result<ObservationBatch> {
        let region = self.region.as_ref().ok_or(ProtocolViolation::Detached)?;
        self.tracker.check(PhaseOp::ReceiveBegin)?;

        let slot = observation_slot(region);
        slot.claim(
            PhaseOp::ReceiveBegin.name(),
            SlotState::Full,
            SlotState::Reading,
            &self.wait,
        )?;
        let (len, step) = slot.published();
        let records = region.read_observations(len)?;

        self.tracker.advance(PhaseOp::ReceiveBegin);
        trace!("receive_begin: step {} with {} records", step, len);
        Ok(ObservationBatch::new(step, records))
    }

    /// Block until the action slot is free for writing
    pub fn send_begin(&mut self) -> Result<()> {
        let region = self.region.as_ref().ok_or(ProtocolViolation::Detached)?;
        self.tracker.check(PhaseOp::SendBegin)?;

        action_slot(region).claim(
            PhaseOp::SendBegin.name(),
            SlotState::Empty,
            SlotState::Writing,
            &self.wait,
        )?;

        self.tracker.advance(PhaseOp::SendBegin);
        Ok(())
    }

    /// Current value of the termination signal; only valid while the step's
    /// observation is held
    pub fn get_finished(&mut self) -> Result<bool> {
        let region = self.region.as_ref().ok_or(ProtocolViolation::Detached)?;
        self.tracker.check_holding("get_finished")?;
        let finished = region.header().is_finished();
        if finished && !self.finished_seen {
            debug!("Termination signal observed");
            self.finished_seen = true;
        }
        Ok(finished)
    }

    /// Release the observation slot back to the engine
    pub fn receive_end(&mut self) -> Result<()> {
        let region = self.region.as_ref().ok_or(ProtocolViolation::Detached)?;
        self.tracker.check(PhaseOp::ReceiveEnd)?;

        observation_slot(region).release(SlotState::Reading, SlotState::Empty)?;

        self.tracker.advance(PhaseOp::ReceiveEnd);
        if self.finished_seen {
            self.tracker.finish();
        }
        Ok(())
    }

    /// Publish `actions` and hand the action slot to the engine
    pub fn send_end(&mut self, actions: &ActionBatch) -> Result<()> {
        let region = self.region.as_mut().ok_or(ProtocolViolation::Detached)?;
        self.tracker.check(PhaseOp::SendEnd)?;

        match self.manager_id {
            Some(manager_id) => {
                let tagged: Vec<ActionRecord> = actions
                    .records()
                    .iter()
                    .map(|r| r.with_manager(manager_id))
                    .collect();
                region.write_actions(&tagged)?;
            }
            None => region.write_actions(actions.records())?,
        }
        let slot = action_slot(region);
        slot.stamp(actions.len(), actions.step());
        slot.release(SlotState::Writing, SlotState::Full)?;

        self.tracker.advance(PhaseOp::SendEnd);
        trace!(
            "send_end: step {} with {} records",
            actions.step(),
            actions.len()
        );
        Ok(())
    }

    /// Release the region; the handle is unusable afterwards
    pub fn detach(&mut self) -> Result<()> {
        let region = self.region.take().ok_or(ProtocolViolation::Detached)?;
        let header = region.header();

        if !self.finished_seen && !header.is_finished() {
            header.raise_abort(AGENT_ABORT_BIT);
            debug!("Detaching before termination, abort flag raised");
        }
        header.attached.store(0, Ordering::Release);

        info!(
            "Detached from region {:?} after {} steps",
            self.path,
            self.tracker.counters().completed_steps()
        );
        Ok(())
    }

    pub fn is_attached(&self) -> bool {
        self.region.is_some()
    }

    pub fn phase(&self) -> StepPhase {
        self.tracker.phase()
    }

    pub fn counters(&self) -> PhaseCounters {
        self.tracker.counters()
    }

    pub fn manager_id(&self) -> Option<u8> {
        self.manager_id
    }

    pub fn capacity(&self) -> Result<usize> {
        let region = self.region.as_ref().ok_or(ProtocolViolation::Detached)?;
        Ok(region.capacity())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for MessageInterface {
    fn drop(&mut self) {
        if self.region.is_some() {
            let _ = self.detach();
        }
    }
}

fn observation_slot(region: &SharedRegion) -> SlotHandle<'_> {
    SlotHandle {
        kind: SlotKind::Observation,
        control: &region.header().observation,
        header: region.header(),
        peer_abort_bit: ENGINE_ABORT_BIT,
    }
}

fn action_slot(region: &SharedRegion) -> SlotHandle<'_> {
    SlotHandle {
        kind: SlotKind::Action,
        control: &region.header().action,
        header: region.header(),
        peer_abort_bit: ENGINE_ABORT_BIT,
    }
}

fn init_slot(region: &SharedRegion) -> SlotHandle<'_> {
    SlotHandle {
        kind: SlotKind::Init,
        control: &region.header().init,
        header: region.header(),
        peer_abort_bit: ENGINE_ABORT_BIT,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::records::{ControlParams, ObservationRecord, OP_STEP};
    use crate::interface::engine_interface::EngineInterface;
    use tempfile::TempDir;

    fn quick_wait() -> WaitPolicy {
        WaitPolicy {
            timeout: Duration::from_secs(5),
            poll_interval: Duration::from_micros(50),
            liveness_interval: Duration::from_millis(1),
            probe: None,
        }
    }

    fn setup(dir: &TempDir) -> (EngineInterface, MessageInterface) {
        let path = dir.path().join("channel.shm");
        let engine = EngineInterface::create(&path, 4, quick_wait()).unwrap();
        let agent = MessageInterface::attach(&path, quick_wait(), Duration::from_secs(1)).unwrap();
        (engine, agent)
    }

    #[test]
    fn test_single_step_round_trip() {
        let dir = TempDir::new().unwrap();
        let (mut engine, mut agent) = setup(&dir);

        let obs = vec![ObservationRecord::new(3, ControlParams::new(12, 14))];
        engine.publish_observations(&obs).unwrap();

        let batch = agent.receive_begin().unwrap();
        agent.send_begin().unwrap();
        assert!(!agent.get_finished().unwrap());
        assert_eq!(batch.records(), obs.as_slice());

        let mut actions = ActionBatch::new(batch.step());
        actions.push(ActionRecord::new(3, ControlParams::new(10, 8)));
        agent.receive_end().unwrap();
        agent.send_end(&actions).unwrap();

        let received = engine.collect_actions().unwrap();
        assert_eq!(received, actions);
        assert_eq!(agent.counters().completed_steps(), 1);
    }

    #[test]
    fn test_init_exchange_tags_both_directions() {
        let dir = TempDir::new().unwrap();
        let (mut engine, mut agent) = setup(&dir);

        let handle = std::thread::spawn(move || {
            let manager_id = engine.initialize().unwrap();
            engine
                .publish_observations(&[ObservationRecord::new(8, ControlParams::new(9, 10))])
                .unwrap();
            (manager_id, engine.collect_actions().unwrap())
        });

        agent.register(5).unwrap();
        assert_eq!(agent.manager_id(), Some(5));

        let batch = agent.receive_begin().unwrap();
        agent.send_begin().unwrap();
        assert_eq!(batch.records()[0].manager_id, 5);
        assert_eq!(batch.records()[0].op_type, OP_STEP);

        let mut actions = ActionBatch::new(batch.step());
        actions.push(ActionRecord::new(8, ControlParams::new(7, 10)));
        agent.receive_end().unwrap();
        agent.send_end(&actions).unwrap();

        let (manager_id, received) = handle.join().unwrap();
        assert_eq!(manager_id, 5);
        assert_eq!(received.records()[0].manager_id, 5);
        assert_eq!(received.records()[0].params(), ControlParams::new(7, 10));

        let err = agent.register(6).unwrap_err();
        assert_eq!(err.as_violation(), Some(&ProtocolViolation::AlreadyRegistered));
    }

    #[test]
    fn test_register_after_first_step_rejected() {
        let dir = TempDir::new().unwrap();
        let (mut engine, mut agent) = setup(&dir);

        engine
            .publish_observations(&[ObservationRecord::new(1, ControlParams::new(7, 2))])
            .unwrap();
        agent.receive_begin().unwrap();

        let err = agent.register(1).unwrap_err();
        assert_eq!(
            err.as_violation(),
            Some(&ProtocolViolation::PhaseOutOfOrder {
                operation: "register",
                phase: StepPhase::Receiving,
            })
        );
    }

    #[test]
    fn test_unregistered_actions_rejected_by_initialized_engine() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("channel.shm");
        let mut engine = EngineInterface::create(&path, 4, quick_wait()).unwrap();
        let raw = SharedRegion::try_open(&path).unwrap().unwrap();

        // Answer the init request by hand, then forge an untagged action.
        let handle = std::thread::spawn(move || {
            let init = init_slot(&raw);
            init.claim("test", SlotState::Full, SlotState::Reading, &quick_wait())
                .unwrap();
            raw.header().manager_id.store(2, Ordering::Release);
            init.release(SlotState::Reading, SlotState::Empty).unwrap();

            let mut raw = raw;
            let action = action_slot(&raw);
            action
                .claim("test", SlotState::Empty, SlotState::Writing, &quick_wait())
                .unwrap();
            raw.write_actions(&[ActionRecord::new(1, ControlParams::new(7, 2))])
                .unwrap();
            let action = action_slot(&raw);
            action.stamp(1, 0);
            action.release(SlotState::Writing, SlotState::Full).unwrap();
            raw
        });

        assert_eq!(engine.initialize().unwrap(), 2);
        let err = engine.collect_actions().unwrap_err();
        assert_eq!(
            err.as_violation(),
            Some(&ProtocolViolation::ManagerMismatch {
                expected: 2,
                found: 0,
            })
        );
        drop(handle.join().unwrap());
    }

    #[test]
    fn test_second_attach_fails() {
        let dir = TempDir::new().unwrap();
        let (_engine, agent) = setup(&dir);

        let err = match MessageInterface::attach(agent.path(), quick_wait(), Duration::from_secs(1)) {
            Ok(_) => panic!("second attach succeeded"),
            Err(e) => e,
        };
        assert_eq!(err.as_violation(), Some(&ProtocolViolation::AlreadyAttached));
    }

    #[test]
    fn test_reattach_after_detach() {
        let dir = TempDir::new().unwrap();
        let (_engine, mut agent) = setup(&dir);
        agent.detach().unwrap();

        let again = MessageInterface::attach(agent.path(), quick_wait(), Duration::from_secs(1));
        assert!(again.is_ok());
    }

    #[test]
    fn test_use_after_detach_fails() {
        let dir = TempDir::new().unwrap();
        let (_engine, mut agent) = setup(&dir);
        agent.detach().unwrap();

        let err = agent.receive_begin().unwrap_err();
        assert_eq!(err.as_violation(), Some(&ProtocolViolation::Detached));
        assert!(agent.get_finished().is_err());
        assert!(agent.detach().is_err());
    }

    #[test]
    fn test_out_of_order_fails_fast() {
        let dir = TempDir::new().unwrap();
        let (_engine, mut agent) = setup(&dir);

        let started = Instant::now();
        assert!(agent.send_begin().unwrap_err().is_protocol_violation());
        assert!(agent.receive_end().unwrap_err().is_protocol_violation());
        assert!(agent
            .send_end(&ActionBatch::new(0))
            .unwrap_err()
            .is_protocol_violation());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_get_finished_requires_held_observation() {
        let dir = TempDir::new().unwrap();
        let (mut engine, mut agent) = setup(&dir);

        let err = agent.get_finished().unwrap_err();
        assert_eq!(
            err.as_violation(),
            Some(&ProtocolViolation::PhaseOutOfOrder {
                operation: "get_finished",
                phase: StepPhase::Idle,
            })
        );

        engine
            .publish_observations(&[ObservationRecord::new(1, ControlParams::new(7, 2))])
            .unwrap();
        agent.receive_begin().unwrap();
        assert!(!agent.get_finished().unwrap());
        agent.send_begin().unwrap();
        agent.receive_end().unwrap();
        assert!(agent.get_finished().unwrap_err().is_protocol_violation());
    }

    #[test]
    fn test_attach_times_out_without_engine() {
        let dir = TempDir::new().unwrap();
        let err = match MessageInterface::attach(
            dir.path().join("never.shm"),
            quick_wait(),
            Duration::from_millis(50),
        ) {
            Ok(_) => panic!("attached to a missing region"),
            Err(e) => e,
        };
        assert!(matches!(err, SimlinkError::AttachFailed(_)));
    }

    #[test]
    fn test_detach_mid_run_raises_abort() {
        let dir = TempDir::new().unwrap();
        let (engine, mut agent) = setup(&dir);
        agent.detach().unwrap();
        assert!(engine.agent_aborted());
    }

    #[test]
    fn test_final_step_skips_action() {
        let dir = TempDir::new().unwrap();
        let (mut engine, mut agent) = setup(&dir);

        let handle = std::thread::spawn(move || {
            engine.finish().unwrap();
            engine
        });

        let batch = agent.receive_begin().unwrap();
        agent.send_begin().unwrap();
        assert!(agent.get_finished().unwrap());
        assert!(batch.is_empty());
        agent.receive_end().unwrap();

        let engine = handle.join().unwrap();
        assert_eq!(agent.phase(), StepPhase::Finished);
        assert!(agent.send_end(&ActionBatch::new(0)).is_err());

        let counters = agent.counters();
        assert_eq!(counters.receive_begin, 1);
        assert_eq!(counters.receive_end, 1);
        assert_eq!(counters.send_begin, 1);
        assert_eq!(counters.send_end, 0);

        agent.detach().unwrap();
        assert!(!engine.agent_aborted());
    }
}
