// packages/simlink/src/interface/phase.rs
//! Per-step phase tracking for the agent side
//!
//! One step runs `receive_begin → send_begin → receive_end → send_end`.
//! Any other order is a protocol violation and is reported before the
//! shared region is touched.

use crate::utils::errors::{ProtocolViolation, Result};
use serde::Serialize;

/// Where the agent is within the current step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepPhase {
    /// Between steps
    Idle,
    /// Holding the observation slot
    Receiving,
    /// Holding both slots
    Sending,
    /// Observation released, action slot still held
    Released,
    /// Termination observed; no further step may begin
    Finished,
}

/// The four operations of one step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseOp {
    ReceiveBegin,
    SendBegin,
    ReceiveEnd,
    SendEnd,
}

impl PhaseOp {
    pub fn name(self) -> &'static str {
        match self {
            PhaseOp::ReceiveBegin => "receive_begin",
            PhaseOp::SendBegin => "send_begin",
            PhaseOp::ReceiveEnd => "receive_end",
            PhaseOp::SendEnd => "send_end",
        }
    }

    /// Phase the tracker must be in for this operation
    fn precondition(self) -> StepPhase {
        match self {
            PhaseOp::ReceiveBegin => StepPhase::Idle,
            PhaseOp::SendBegin => StepPhase::Receiving,
            PhaseOp::ReceiveEnd => StepPhase::Sending,
            PhaseOp::SendEnd => StepPhase::Released,
        }
    }
}

/// Completed calls per phase operation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PhaseCounters {
    pub receive_begin: u64,
    pub send_begin: u64,
    pub receive_end: u64,
    pub send_end: u64,
}

impl PhaseCounters {
    /// Number of steps whose action was published
    pub fn completed_steps(&self) -> u64 {
        self.send_end
    }
}

/// Phase state machine
#[derive(Debug, Clone)]
pub struct PhaseTracker {
    phase: StepPhase,
    counters: PhaseCounters,
}

impl PhaseTracker {
    pub fn new() -> Self {
        Self {
            phase: StepPhase::Idle,
            counters: PhaseCounters::default(),
        }
    }

    pub fn phase(&self) -> StepPhase {
        self.phase
    }

    pub fn counters(&self) -> PhaseCounters {
        self.counters
    }

    /// Fail unless `operation` may run now
    pub fn check(&self, operation: PhaseOp) -> Result<()> {
        if self.phase == StepPhase::Finished {
            return Err(ProtocolViolation::RunFinished.into());
        }
        if self.phase != operation.precondition() {
            return Err(ProtocolViolation::PhaseOutOfOrder {
                operation: operation.name(),
                phase: self.phase,
            }
            .into());
        }
        Ok(())
    }

    /// Fail unless the observation slot is held, for queries made mid-step
    pub fn check_holding(&self, operation: &'static str) -> Result<()> {
        match self.phase {
            StepPhase::Receiving | StepPhase::Sending => Ok(()),
            phase => Err(ProtocolViolation::PhaseOutOfOrder { operation, phase }.into()),
        }
    }

    /// Record that `operation` completed
    pub fn advance(&mut self, operation: PhaseOp) {
        match operation {
            PhaseOp::ReceiveBegin => {
                self.counters.receive_begin += 1;
                self.phase = StepPhase::Receiving;
            }
            PhaseOp::SendBegin => {
                self.counters.send_begin += 1;
                self.phase = StepPhase::Sending;
            }
            PhaseOp::ReceiveEnd => {
                self.counters.receive_end += 1;
                self.phase = StepPhase::Released;
            }
            PhaseOp::SendEnd => {
                self.counters.send_end += 1;
                self.phase = StepPhase::Idle;
            }
        }
    }

    /// Close the run after the final observation was released
    pub fn finish(&mut self) {
        self.phase = StepPhase::Finished;
    }
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self::new()
    }
}
