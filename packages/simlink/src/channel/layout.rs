// packages/simlink/src/channel/layout.rs
//! Fixed region layout
//!
//! ```text
//! offset 0                 HEADER_SIZE            + cap * OBS_SIZE
//! ┌────────────────────────┬──────────────────────┬─────────────────────┐
//! │ RegionHeader (atomics) │ ObservationRecord[N] │ ActionRecord[N]     │
//! └────────────────────────┴──────────────────────┴─────────────────────┘
//! ```
//!
//! Both peers map the same file; only the control words in the header are
//! accessed concurrently, always through atomics. The record areas are
//! plain bytes whose ownership is handed back and forth by the slot states.

use crate::channel::records::{ActionRecord, ObservationRecord};
use std::mem::size_of;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// `b"SIMLINK1"` read as a little-endian u64
pub const REGION_MAGIC: u64 = u64::from_le_bytes(*b"SIMLINK1");

/// Bumped whenever the layout changes
pub const LAYOUT_VERSION: u32 = 2;

/// Bytes reserved for the header; records start here
pub const HEADER_SIZE: usize = 128;

/// Abort bit raised by the simulation engine
pub const ENGINE_ABORT_BIT: u32 = 0b01;

/// Abort bit raised by the decision agent
pub const AGENT_ABORT_BIT: u32 = 0b10;

const _: () = assert!(size_of::<RegionHeader>() <= HEADER_SIZE);

/// Handoff state of one slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SlotState {
    /// Producer may claim it
    Empty = 0,
    /// Producer is filling it
    Writing = 1,
    /// Published, consumer may claim it
    Full = 2,
    /// Consumer is reading it
    Reading = 3,
}

impl SlotState {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(SlotState::Empty),
            1 => Some(SlotState::Writing),
            2 => Some(SlotState::Full),
            3 => Some(SlotState::Reading),
            _ => None,
        }
    }

    pub fn name(raw: u32) -> &'static str {
        match Self::from_raw(raw) {
            Some(SlotState::Empty) => "empty",
            Some(SlotState::Writing) => "writing",
            Some(SlotState::Full) => "full",
            Some(SlotState::Reading) => "reading",
            None => "corrupt",
        }
    }
}

/// Control words of one handoff slot
#[repr(C)]
pub struct SlotControl {
    /// Raw [`SlotState`]
    pub state: AtomicU32,
    /// Number of records published
    pub len: AtomicU32,
    /// Step number of the published batch
    pub sequence: AtomicU64,
}

impl SlotControl {
    pub fn load_state(&self) -> u32 {
        self.state.load(Ordering::Acquire)
    }
}

/// Header at offset 0 of the region
#[repr(C)]
pub struct RegionHeader {
    pub magic: AtomicU64,
    pub version: AtomicU32,
    pub capacity: AtomicU32,
    /// Set by the creator once the header is initialised
    pub ready: AtomicU32,
    /// Set by the agent while a handle is live
    pub attached: AtomicU32,
    /// Termination signal written by the engine
    pub finished: AtomicU32,
    /// Abort bits, see [`ENGINE_ABORT_BIT`] / [`AGENT_ABORT_BIT`]
    pub aborted: AtomicU32,
    /// Manager id the agent answered the init request with
    pub manager_id: AtomicU32,
    pub observation: SlotControl,
    pub action: SlotControl,
    /// Init exchange: the engine publishes the request, the agent answers
    pub init: SlotControl,
}

impl RegionHeader {
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire) != 0
    }

    pub fn raise_abort(&self, bit: u32) {
        self.aborted.fetch_or(bit, Ordering::AcqRel);
    }

    pub fn is_aborted(&self, bit: u32) -> bool {
        self.aborted.load(Ordering::Acquire) & bit != 0
    }
}

/// Byte offsets of the record areas for a given capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionLayout {
    pub capacity: usize,
}

impl RegionLayout {
    pub fn new(capacity: usize) -> Self {
        Self { capacity }
    }

    pub fn observation_offset(&self) -> usize {
        HEADER_SIZE
    }

    pub fn observation_bytes(&self) -> usize {
        self.capacity * size_of::<ObservationRecord>()
    }

    pub fn action_offset(&self) -> usize {
        self.observation_offset() + self.observation_bytes()
    }

    pub fn action_bytes(&self) -> usize {
        self.capacity * size_of::<ActionRecord>()
    }

    /// Total file size
    pub fn region_size(&self) -> usize {
        self.action_offset() + self.action_bytes()
    }
}
