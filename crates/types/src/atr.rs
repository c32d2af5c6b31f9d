//! The Active Transaction Record: per-attempt metadata stored in a shared
//! bucket/scope/collection document, one entry per attempt.

use crate::id::DocumentId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Forward-compatibility policy entry: a protocol check the current client
/// may not understand. If `present` and unrecognized, the attempt must abort
/// with `FORWARD_COMPATIBILITY_FAILURE` rather than silently ignore it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardCompatEntry {
    pub protocol_version: Option<String>,
    pub behavior: String,
}

/// A JSON-object-shaped policy map embedded in ATR entries and document
/// links, keyed by extension point name.
pub type ForwardCompat = BTreeMap<String, Vec<ForwardCompatEntry>>;

/// Attempt state machine. Only forward transitions are legal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttemptState {
    NotStarted,
    Pending,
    Committed,
    Completed,
    Aborted,
    RolledBack,
}

/// Returned when a caller requests a transition the state machine forbids.
#[derive(Debug, Clone, thiserror::Error)]
#[error("illegal attempt state transition: {from:?} -> {to:?}")]
pub struct IllegalStateTransition {
    pub from: AttemptState,
    pub to: AttemptState,
}

impl AttemptState {
    /// Attempt the transition, enforcing the forward-only graph:
    ///
    /// `NOT_STARTED -> PENDING -> {ABORTED, COMMITTED}`,
    /// `ABORTED -> ROLLED_BACK`, `COMMITTED -> COMPLETED`.
    pub fn transition_to(self, to: AttemptState) -> Result<AttemptState, IllegalStateTransition> {
        use AttemptState::*;
        let legal = matches!(
            (self, to),
            (NotStarted, Pending) | (Pending, Aborted) | (Pending, Committed)
                | (Aborted, RolledBack) | (Committed, Completed)
        );
        if legal {
            Ok(to)
        } else {
            Err(IllegalStateTransition { from: self, to })
        }
    }

    /// Terminal states accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AttemptState::NotStarted | AttemptState::RolledBack | AttemptState::Completed
        )
    }
}

/// Wall-clock (HLC-sourced) timestamps recorded at each state transition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AtrTimestamps {
    pub start: Option<u64>,
    pub start_commit: Option<u64>,
    pub complete: Option<u64>,
    pub rollback_start: Option<u64>,
    pub rollback_complete: Option<u64>,
}

/// Client-requested durability override for an individual attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DurabilityLevel {
    None,
    Majority,
    MajorityAndPersistToActive,
    PersistToMajority,
}

/// One entry per attempt, keyed by attempt-id within the ATR document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AtrEntry {
    pub attempt_id: String,
    pub state: AttemptState,
    pub timestamps: AtrTimestamps,
    /// Negative values are clamped to zero at construction time.
    pub expires_after_ms: u64,
    pub inserted_ids: Vec<DocumentId>,
    pub replaced_ids: Vec<DocumentId>,
    pub removed_ids: Vec<DocumentId>,
    pub forward_compat: Option<ForwardCompat>,
    pub durability_level: Option<DurabilityLevel>,
    /// The server vbucket's HLC reading at the time the ATR was last read;
    /// used by the cleaner to compute expiry against the server clock.
    pub now_ns: u64,
}

impl AtrEntry {
    pub fn new(attempt_id: impl Into<String>, expires_after_ms: i64, now_ns: u64) -> Self {
        Self {
            attempt_id: attempt_id.into(),
            state: AttemptState::NotStarted,
            timestamps: AtrTimestamps::default(),
            expires_after_ms: expires_after_ms.max(0) as u64,
            inserted_ids: Vec::new(),
            replaced_ids: Vec::new(),
            removed_ids: Vec::new(),
            forward_compat: None,
            durability_level: None,
            now_ns,
        }
    }

    /// Eligible for cleanup by any client once
    /// `PENDING` and `expires_after_ms` has elapsed according to `now_ns`.
    pub fn is_expired_for_cleanup(&self, server_now_ns: u64) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        let expires_at_ns = self.now_ns.saturating_add(self.expires_after_ms.saturating_mul(1_000_000));
        server_now_ns >= expires_at_ns
    }

    /// All document ids touched by this attempt, used by the get-multi
    /// orchestrator's `were_in_t1` intersection.
    pub fn all_staged_ids(&self) -> impl Iterator<Item = &DocumentId> {
        self.inserted_ids
            .iter()
            .chain(self.replaced_ids.iter())
            .chain(self.removed_ids.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legal_forward_transitions() {
        let s = AttemptState::NotStarted;
        let s = s.transition_to(AttemptState::Pending).unwrap();
        let s2 = s.transition_to(AttemptState::Committed).unwrap();
        assert!(s2.transition_to(AttemptState::Completed).is_ok());

        let s3 = s.transition_to(AttemptState::Aborted).unwrap();
        assert!(s3.transition_to(AttemptState::RolledBack).is_ok());
    }

    #[test]
    fn illegal_transitions_rejected() {
        assert!(AttemptState::NotStarted
            .transition_to(AttemptState::Committed)
            .is_err());
        assert!(AttemptState::Completed
            .transition_to(AttemptState::Pending)
            .is_err());
        assert!(AttemptState::RolledBack
            .transition_to(AttemptState::Pending)
            .is_err());
    }

    #[test]
    fn negative_expiry_clamped_to_zero() {
        let entry = AtrEntry::new("attempt-1", -500, 0);
        assert_eq!(entry.expires_after_ms, 0);
    }

    #[test]
    fn cleanup_eligibility_respects_server_hlc() {
        let mut entry = AtrEntry::new("attempt-1", 100, 1_000_000_000);
        entry.state = AttemptState::Pending;
        assert!(!entry.is_expired_for_cleanup(1_000_000_000));
        assert!(entry.is_expired_for_cleanup(1_100_000_001));
    }

    #[test]
    fn terminal_entries_are_never_cleanup_eligible() {
        let mut entry = AtrEntry::new("attempt-1", 100, 0);
        entry.state = AttemptState::Completed;
        assert!(!entry.is_expired_for_cleanup(u64::MAX));
    }
}
