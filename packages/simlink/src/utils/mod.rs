// packages/simlink/src/utils/mod.rs
//! Shared utilities: error taxonomy and configuration

pub mod config;
pub mod errors;

pub use config::{ChannelSettings, ContainerSettings, EngineSettings, LoggingSettings, SimlinkConfig};
pub use errors::{ErrorKind, ProtocolViolation, Result, SimlinkError, SlotKind};
