// packages/simlink/src/container/state.rs
//! Per-entity adaptive state

use crate::channel::records::{ControlParams, ObservationRecord};
use crate::utils::config::ContainerSettings;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// How the SNR history window is reduced to one value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryCombining {
    #[default]
    Average,
    Maximum,
    Minimum,
}

/// Tuning shared by every entity of one container
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StateTuning {
    pub history_range: usize,
    pub ewma_alpha: f64,
    pub combining: HistoryCombining,
}

impl Default for StateTuning {
    fn default() -> Self {
        Self::from(&ContainerSettings::default())
    }
}

impl From<&ContainerSettings> for StateTuning {
    fn from(settings: &ContainerSettings) -> Self {
        Self {
            history_range: settings.history_range.max(1),
            ewma_alpha: settings.ewma_alpha,
            combining: settings.history_combining,
        }
    }
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Seed of one entity's random stream
pub fn entity_seed(stream: u64, entity_id: u32) -> u64 {
    splitmix64(stream ^ splitmix64(entity_id as u64))
}

/// State tracked for one entity across steps
#[derive(Debug, Clone)]
pub struct EntityState {
    entity_id: u32,
    seed: u64,
    rng: StdRng,
    tuning: StateTuning,
    first_seen_step: u64,
    last_seen_step: u64,
    observations: u64,
    snr_ewma: f64,
    rssi_ewma: f64,
    battery_level: f64,
    snr_history: VecDeque<f64>,
    reported: ControlParams,
    commanded: Option<ControlParams>,
}

impl EntityState {
    /// Fresh state for an entity first seen at `step`
    pub fn new(entity_id: u32, stream: u64, step: u64, tuning: StateTuning) -> Self {
        let seed = entity_seed(stream, entity_id);
        Self {
            entity_id,
            seed,
            rng: StdRng::seed_from_u64(seed),
            tuning,
            first_seen_step: step,
            last_seen_step: step,
            observations: 0,
            snr_ewma: 0.0,
            rssi_ewma: 0.0,
            battery_level: 0.0,
            snr_history: VecDeque::with_capacity(tuning.history_range),
            reported: ControlParams::default(),
            commanded: None,
        }
    }

    /// Fold one observation into the state
    pub fn observe(&mut self, record: &ObservationRecord, step: u64) {
        let alpha = self.tuning.ewma_alpha;
        if self.observations == 0 {
            self.snr_ewma = record.snr_db;
            self.rssi_ewma = record.rssi_dbm;
        } else {
            self.snr_ewma += alpha * (record.snr_db - self.snr_ewma);
            self.rssi_ewma += alpha * (record.rssi_dbm - self.rssi_ewma);
        }

        if self.snr_history.len() == self.tuning.history_range {
            self.snr_history.pop_front();
        }
        self.snr_history.push_back(record.snr_db);

        self.battery_level = record.battery_level;
        self.reported = record.params();
        self.last_seen_step = step;
        self.observations += 1;
    }

    /// Remember the parameters commanded this step
    pub fn record_action(&mut self, params: ControlParams) {
        self.commanded = Some(params);
    }

    /// SNR over the recent window, `None` until the window is full
    pub fn history_snr(&self, method: HistoryCombining) -> Option<f64> {
        if self.snr_history.len() < self.tuning.history_range {
            return None;
        }
        let values = self.snr_history.iter().copied();
        Some(match method {
            HistoryCombining::Average => values.sum::<f64>() / self.snr_history.len() as f64,
            HistoryCombining::Maximum => values.fold(f64::NEG_INFINITY, f64::max),
            HistoryCombining::Minimum => values.fold(f64::INFINITY, f64::min),
        })
    }

    /// [`history_snr`](Self::history_snr) combined the configured way
    pub fn recent_snr(&self) -> Option<f64> {
        self.history_snr(self.tuning.combining)
    }

    /// Per-entity random stream, fixed by the stream id and entity id
    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    pub fn entity_id(&self) -> u32 {
        self.entity_id
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn first_seen_step(&self) -> u64 {
        self.first_seen_step
    }

    pub fn last_seen_step(&self) -> u64 {
        self.last_seen_step
    }

    pub fn observations(&self) -> u64 {
        self.observations
    }

    pub fn snr_average(&self) -> f64 {
        self.snr_ewma
    }

    pub fn rssi_average(&self) -> f64 {
        self.rssi_ewma
    }

    pub fn battery_level(&self) -> f64 {
        self.battery_level
    }

    /// Parameters the entity last reported running with
    pub fn reported(&self) -> ControlParams {
        self.reported
    }

    /// Parameters last commanded by the policy
    pub fn commanded(&self) -> Option<ControlParams> {
        self.commanded
    }
}
