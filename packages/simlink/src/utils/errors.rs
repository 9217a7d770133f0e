// packages/simlink/src/utils/errors.rs
//! Error types for the simlink bridge
//!
//! Every failure surfaced to the control loop is a [`SimlinkError`]. The
//! variants follow the run's failure taxonomy: protocol violations are
//! programming errors and abort the run, a lost peer is a runtime condition
//! that still goes through cleanup, decision failures poison the current
//! action batch.

use crate::interface::phase::StepPhase;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, SimlinkError>;

/// Direction of a handoff slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    Observation,
    Action,
    Init,
}

impl fmt::Display for SlotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotKind::Observation => f.write_str("observation"),
            SlotKind::Action => f.write_str("action"),
            SlotKind::Init => f.write_str("init"),
        }
    }
}

/// Breaches of the channel contract
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
    #[error("'{operation}' called in phase {phase:?}")]
    PhaseOutOfOrder {
        operation: &'static str,
        phase: StepPhase,
    },

    #[error("channel is already attached")]
    AlreadyAttached,

    #[error("channel handle used after detach")]
    Detached,

    #[error("{slot} slot expected state {expected} but found {found}")]
    SlotState {
        slot: SlotKind,
        expected: &'static str,
        found: &'static str,
    },

    #[error("run already finished")]
    RunFinished,

    #[error("batch of {len} records exceeds slot capacity {capacity}")]
    CapacityExceeded { len: usize, capacity: usize },

    #[error("action references entity {entity_id} absent from the observation batch")]
    UnknownEntity { entity_id: u32 },

    #[error("entity {entity_id} appears more than once in one observation batch")]
    DuplicateEntity { entity_id: u32 },

    #[error("init slot carried operation {found:#04x}, expected {expected:#04x}")]
    UnexpectedOperation { expected: u8, found: u64 },

    #[error("agent answered the init request twice")]
    AlreadyRegistered,

    #[error("record tagged with manager {found}, registered manager is {expected}")]
    ManagerMismatch { expected: u8, found: u8 },
}

/// Coarse classification of [`SimlinkError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Protocol,
    PeerLost,
    Decision,
    Launch,
    Environment,
    Channel,
    Config,
    Runtime,
}

/// Crate error
#[derive(Debug, Error)]
pub enum SimlinkError {
    #[error("Protocol violation: {0}")]
    ProtocolViolation(#[from] ProtocolViolation),

    #[error("Peer lost during '{operation}' after {waited:?}: {reason}")]
    PeerLost {
        operation: &'static str,
        reason: String,
        waited: Duration,
    },

    #[error("Decision policy '{policy}' failed for entity {entity_id} at step {step}: {reason}")]
    DecisionFailed {
        step: u64,
        entity_id: u32,
        policy: String,
        reason: String,
    },

    #[error("Process spawn failed: {0}")]
    ProcessSpawnFailed(String),

    #[error("Simulation engine exited abnormally (code {code:?}, signal {signal:?})")]
    EnvironmentFailure {
        code: Option<i32>,
        signal: Option<i32>,
    },

    #[error("Attach failed: {0}")]
    AttachFailed(String),

    #[error("Region layout mismatch: {0}")]
    LayoutMismatch(String),

    #[error("Channel I/O error: {0}")]
    ChannelIo(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Runtime error: {0}")]
    RuntimeError(String),
}

impl SimlinkError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            SimlinkError::ProtocolViolation(_) => ErrorKind::Protocol,
            SimlinkError::PeerLost { .. } => ErrorKind::PeerLost,
            SimlinkError::DecisionFailed { .. } => ErrorKind::Decision,
            SimlinkError::ProcessSpawnFailed(_) | SimlinkError::AttachFailed(_) => {
                ErrorKind::Launch
            }
            SimlinkError::EnvironmentFailure { .. } => ErrorKind::Environment,
            SimlinkError::LayoutMismatch(_) | SimlinkError::ChannelIo(_) => ErrorKind::Channel,
            SimlinkError::ConfigError(_) => ErrorKind::Config,
            SimlinkError::RuntimeError(_) => ErrorKind::Runtime,
        }
    }

    pub fn is_peer_lost(&self) -> bool {
        self.kind() == ErrorKind::PeerLost
    }

    pub fn is_protocol_violation(&self) -> bool {
        self.kind() == ErrorKind::Protocol
    }

    /// The nested violation, if this is a protocol error
    pub fn as_violation(&self) -> Option<&ProtocolViolation> {
        match self {
            SimlinkError::ProtocolViolation(v) => Some(v),
            _ => None,
        }
    }
}

impl From<config::ConfigError> for SimlinkError {
    fn from(e: config::ConfigError) -> Self {
        SimlinkError::ConfigError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        let err = SimlinkError::from(ProtocolViolation::AlreadyAttached);
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert!(err.is_protocol_violation());
        assert_eq!(err.as_violation(), Some(&ProtocolViolation::AlreadyAttached));

        let err = SimlinkError::PeerLost {
            operation: "receive_begin",
            reason: "peer process exited".into(),
            waited: Duration::from_millis(5),
        };
        assert!(err.is_peer_lost());
        assert!(err.as_violation().is_none());

        assert_eq!(
            SimlinkError::AttachFailed("gone".into()).kind(),
            ErrorKind::Launch
        );
    }

    #[test]
    fn test_display_includes_context() {
        let err = SimlinkError::DecisionFailed {
            step: 7,
            entity_id: 3,
            policy: "hold".into(),
            reason: "boom".into(),
        };
        let text = err.to_string();
        assert!(text.contains("entity 3"));
        assert!(text.contains("step 7"));
        assert!(text.contains("boom"));

        let v = ProtocolViolation::SlotState {
            slot: SlotKind::Action,
            expected: "writing",
            found: "empty",
        };
        assert_eq!(v.to_string(), "action slot expected state writing but found empty");
    }
}
