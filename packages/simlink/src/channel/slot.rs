// packages/simlink/src/channel/slot.rs
//! One-shot handoff slots with bounded waits
//!
//! A slot cycles `Empty → Writing → Full → Reading → Empty`. The producer
//! owns it between `Writing` and `Full`, the consumer between `Reading` and
//! `Empty`, so neither side ever sees the other's half-finished work.
//!
//! Claiming a slot blocks. The wait spins with [`Backoff`], then sleeps, and
//! gives up with [`SimlinkError::PeerLost`] when the peer raised its abort bit,
//! its [`PeerProbe`] reports it dead, or the timeout elapses.

use crate::channel::layout::{RegionHeader, SlotControl, SlotState};
use crate::utils::errors::{ProtocolViolation, Result, SimlinkError, SlotKind};
use crossbeam::utils::Backoff;
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

/// Liveness check for the process on the other side of the channel
pub trait PeerProbe: Send + Sync {
    /// `false` once the peer has exited
    fn is_alive(&self) -> bool;

    /// Human-readable description of why the peer is gone
    fn describe(&self) -> String {
        "peer process exited".to_string()
    }
}

/// Bounds applied to every blocking call
#[derive(Clone)]
pub struct WaitPolicy {
    /// Give up after this long
    pub timeout: Duration,
    /// Sleep between polls once spinning is exhausted
    pub poll_interval: Duration,
    /// How often the abort bit and probe are consulted
    pub liveness_interval: Duration,
    /// Optional liveness check of the peer process
    pub probe: Option<Arc<dyn PeerProbe>>,
}

impl WaitPolicy {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Default::default()
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn PeerProbe>) -> Self {
        self.probe = Some(probe);
        self
    }
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            poll_interval: Duration::from_micros(100),
            liveness_interval: Duration::from_millis(10),
            probe: None,
        }
    }
}

impl fmt::Debug for WaitPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitPolicy")
            .field("timeout", &self.timeout)
            .field("poll_interval", &self.poll_interval)
            .field("liveness_interval", &self.liveness_interval)
            .field("probe", &self.probe.is_some())
            .finish()
    }
}

/// One side's view of a slot
pub struct SlotHandle<'a> {
    pub kind: SlotKind,
    pub control: &'a SlotControl,
    pub header: &'a RegionHeader,
    /// Abort bit the *peer* raises
    pub peer_abort_bit: u32,
}

impl<'a> SlotHandle<'a> {
    /// Block until the slot is in `from`, then move it to `to`
    pub fn claim(
        &self,
        operation: &'static str,
        from: SlotState,
        to: SlotState,
        policy: &WaitPolicy,
    ) -> Result<()> {
        let started = Instant::now();
        let backoff = Backoff::new();
        let mut next_check = started + policy.liveness_interval;

        loop {
            if self
                .control
                .state
                .compare_exchange(from as u32, to as u32, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(());
            }

            if backoff.is_completed() {
                std::thread::sleep(policy.poll_interval);
            } else {
                backoff.snooze();
                continue;
            }

            let now = Instant::now();
            if now < next_check {
                continue;
            }
            next_check = now + policy.liveness_interval;

            if let Some(reason) = self.peer_gone(policy) {
                // Whatever the peer published before leaving is still ours.
                if self.control.load_state() == from as u32 {
                    continue;
                }
                return Err(self.lost(operation, reason, started.elapsed()));
            }

            if now.duration_since(started) >= policy.timeout {
                return Err(self.lost(
                    operation,
                    format!("no handoff within {:?}", policy.timeout),
                    started.elapsed(),
                ));
            }
        }
    }

    /// Move the slot from `from` to `to`, failing if it is not in `from`
    pub fn release(&self, from: SlotState, to: SlotState) -> Result<()> {
        self.control
            .state
            .compare_exchange(from as u32, to as u32, Ordering::Release, Ordering::Relaxed)
            .map(|_| ())
            .map_err(|found| {
                ProtocolViolation::SlotState {
                    slot: self.kind,
                    expected: SlotState::name(from as u32),
                    found: SlotState::name(found),
                }
                .into()
            })
    }

    /// Record length and step of the batch about to be published
    pub fn stamp(&self, len: usize, sequence: u64) {
        self.control.len.store(len as u32, Ordering::Relaxed);
        self.control.sequence.store(sequence, Ordering::Relaxed);
    }

    /// Length and step of the published batch
    pub fn published(&self) -> (usize, u64) {
        (
            self.control.len.load(Ordering::Relaxed) as usize,
            self.control.sequence.load(Ordering::Relaxed),
        )
    }

    fn peer_gone(&self, policy: &WaitPolicy) -> Option<String> {
        if self.header.is_aborted(self.peer_abort_bit) {
            return Some("peer raised its abort flag".to_string());
        }
        match &policy.probe {
            Some(probe) if !probe.is_alive() => Some(probe.describe()),
            _ => None,
        }
    }

    fn lost(&self, operation: &'static str, reason: String, waited: Duration) -> SimlinkError {
        warn!(
            "{} slot: '{}' gave up after {:?}: {}",
            self.kind, operation, waited, reason
        );
        metrics::counter!("simlink_peer_lost_total").increment(1);
        SimlinkError::PeerLost {
            operation,
            reason,
            waited,
        }
    }
}
