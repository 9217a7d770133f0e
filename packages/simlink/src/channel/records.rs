// packages/simlink/src/channel/records.rs
//! Fixed-size records exchanged through the region
//!
//! Both records are `Pod` so a batch is copied in and out of the mapped
//! areas as a byte slice.

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

/// Operation type of the engine's init request
pub const OP_INIT: u8 = 0x01;

/// Operation type of a regular step observation
pub const OP_STEP: u8 = 0x02;

/// Control parameters of one entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ControlParams {
    pub spreading_factor: u8,
    pub tx_power_dbm: u8,
}

impl ControlParams {
    pub fn new(spreading_factor: u8, tx_power_dbm: u8) -> Self {
        Self {
            spreading_factor,
            tx_power_dbm,
        }
    }
}

/// One entity's observation for a step (engine → agent)
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable, Serialize, Deserialize)]
pub struct ObservationRecord {
    pub entity_id: u32,
    pub spreading_factor: u8,
    pub tx_power_dbm: u8,
    /// [`OP_STEP`] for step observations
    pub op_type: u8,
    /// Manager the observation is addressed to, 0 before registration
    pub manager_id: u8,
    pub snr_db: f64,
    pub rssi_dbm: f64,
    pub battery_level: f64,
}

impl ObservationRecord {
    pub fn new(entity_id: u32, params: ControlParams) -> Self {
        Self {
            entity_id,
            spreading_factor: params.spreading_factor,
            tx_power_dbm: params.tx_power_dbm,
            op_type: OP_STEP,
            ..Default::default()
        }
    }

    pub fn with_metrics(mut self, snr_db: f64, rssi_dbm: f64, battery_level: f64) -> Self {
        self.snr_db = snr_db;
        self.rssi_dbm = rssi_dbm;
        self.battery_level = battery_level;
        self
    }

    /// Parameters the entity currently runs with
    pub fn params(&self) -> ControlParams {
        ControlParams::new(self.spreading_factor, self.tx_power_dbm)
    }
}

/// One entity's new control parameters (agent → engine)
#[repr(C)]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Pod, Zeroable, Serialize, Deserialize,
)]
pub struct ActionRecord {
    pub entity_id: u32,
    pub spreading_factor: u8,
    pub tx_power_dbm: u8,
    /// Manager that produced the action
    pub manager_id: u8,
    pub reserved: u8,
}

impl ActionRecord {
    pub fn new(entity_id: u32, params: ControlParams) -> Self {
        Self {
            entity_id,
            spreading_factor: params.spreading_factor,
            tx_power_dbm: params.tx_power_dbm,
            manager_id: 0,
            reserved: 0,
        }
    }

    pub fn with_manager(mut self, manager_id: u8) -> Self {
        self.manager_id = manager_id;
        self
    }

    pub fn params(&self) -> ControlParams {
        ControlParams::new(self.spreading_factor, self.tx_power_dbm)
    }
}

/// Observations published for one step
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ObservationBatch {
    step: u64,
    records: Vec<ObservationRecord>,
}

impl ObservationBatch {
    pub fn new(step: u64, records: Vec<ObservationRecord>) -> Self {
        Self { step, records }
    }

    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn records(&self) -> &[ObservationRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, entity_id: u32) -> bool {
        self.records.iter().any(|r| r.entity_id == entity_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ObservationRecord> {
        self.records.iter()
    }
}

/// Actions produced for one step
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ActionBatch {
    step: u64,
    records: Vec<ActionRecord>,
}

impl ActionBatch {
    pub fn new(step: u64) -> Self {
        Self {
            step,
            records: Vec::new(),
        }
    }

    pub fn with_capacity(step: u64, capacity: usize) -> Self {
        Self {
            step,
            records: Vec::with_capacity(capacity),
        }
    }

    pub fn from_records(step: u64, records: Vec<ActionRecord>) -> Self {
        Self { step, records }
    }

    pub fn push(&mut self, record: ActionRecord) {
        self.records.push(record);
    }

    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn records(&self) -> &[ActionRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Wire bytes of the records, as written into the action area
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.records)
    }
}
