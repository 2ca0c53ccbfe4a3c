//! Slot identity and lifecycle state.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// Index of a slot in the pool's table.
///
/// Ids increase monotonically and are never reused, so a stale id can
/// only ever miss, never hit a different sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct SlotId(u64);

impl SlotId {
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot-{}", self.0)
    }
}

/// Lifecycle state of a pooled sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotState {
    /// Container created, not yet attached and started.
    Warming,
    /// Idle and available to `try_acquire`.
    Ready,
    /// Owned by exactly one in-flight execution.
    Allocated,
    /// Retired; waiting for teardown. Terminal.
    Draining,
}

impl SlotState {
    /// Whether `self -> next` is a legal edge.
    ///
    /// `Ready -> Draining` is only taken by an explicit retire of an idle
    /// slot (dead container found by the probe, or pool shutdown).
    pub fn can_transition_to(self, next: SlotState) -> bool {
        use SlotState::*;
        matches!(
            (self, next),
            (Warming, Ready)
                | (Warming, Draining)
                | (Ready, Allocated)
                | (Ready, Draining)
                | (Allocated, Ready)
                | (Allocated, Draining)
        )
    }

    /// Counted against `max_size`.
    pub fn is_live(self) -> bool {
        !matches!(self, SlotState::Draining)
    }
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Warming => write!(f, "Warming"),
            Self::Ready => write!(f, "Ready"),
            Self::Allocated => write!(f, "Allocated"),
            Self::Draining => write!(f, "Draining"),
        }
    }
}

/// Point-in-time view of one slot, for reporting.
#[derive(Debug, Clone, Serialize)]
pub struct SlotInfo {
    pub id: SlotId,
    pub container_id: String,
    pub state: SlotState,
    pub created_at: DateTime<Utc>,
}
