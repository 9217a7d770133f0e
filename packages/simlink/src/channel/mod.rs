// packages/simlink/src/channel/mod.rs
//! Shared channel between the simulation engine and the decision agent
//!
//! - **Layout**: fixed header of atomics followed by two record areas
//! - **Records**: `Pod` observation and action records
//! - **Region**: the memory-mapped file both processes share
//! - **Slot**: one-shot handoff per direction with bounded waits
//!
//! # Handoff
//!
//! ```text
//!  engine                         region                          agent
//!  send_begin  ──claim Empty→Writing──▶ [observation] ◀──claim Full→Reading── receive_begin
//!  send_end    ──release Writing→Full─▶               ◀─release Reading→Empty─ receive_end
//!  recv_begin  ──claim Full→Reading───▶ [action]      ◀──claim Empty→Writing── send_begin
//!  recv_end    ──release Reading→Empty▶               ◀─release Writing→Full── send_end
//! ```

pub mod layout;
pub mod records;
pub mod region;
pub mod slot;

pub use layout::{RegionHeader, RegionLayout, SlotState, AGENT_ABORT_BIT, ENGINE_ABORT_BIT};
pub use records::{ActionBatch, ActionRecord, ControlParams, ObservationBatch, ObservationRecord};
pub use region::SharedRegion;
pub use slot::{PeerProbe, SlotHandle, WaitPolicy};
