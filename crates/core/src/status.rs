//! Work chunk status state machine.
//!
//! ## Legal edges
//!
//! ```text
//! GATE_WAITING ──► READY ──► QUEUED ──► IN_PROGRESS ──┬──► COMPLETED
//!                    ▲                                 ├──► FAILED
//!                    └──────────── ERRORED ◄───────────┘
//! ```
//!
//! - `GATE_WAITING → READY`: maintenance pass, once the previous step is done
//! - `READY → QUEUED`: enqueue gateway
//! - `QUEUED → IN_PROGRESS`: worker dequeue
//! - `IN_PROGRESS → COMPLETED | ERRORED | FAILED`: worker completion report
//! - `ERRORED → READY`: maintenance pass, when the requeue policy allows it
//!
//! `COMPLETED` and `FAILED` are terminal: nothing leaves them.

use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Status of a single work chunk.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkChunkStatus {
    /// Created for a gated step whose predecessor is not done yet.
    GateWaiting,
    /// Workable; waiting to be handed to the transport.
    Ready,
    /// Handed to the transport; waiting for a worker to claim it.
    Queued,
    /// Claimed by exactly one worker.
    InProgress,
    /// Worker reported success (terminal).
    Completed,
    /// Worker reported a retryable failure.
    Errored,
    /// Worker reported a non-retryable failure (terminal).
    Failed,
}

impl WorkChunkStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [WorkChunkStatus; 7] = [
        Self::GateWaiting,
        Self::Ready,
        Self::Queued,
        Self::InProgress,
        Self::Completed,
        Self::Errored,
        Self::Failed,
    ];

    /// Status a freshly created chunk starts in.
    ///
    /// Chunks of the first step never wait on a gate; later steps of a gated
    /// job do.
    pub fn initial(is_first_step: bool, gated: bool) -> Self {
        if !is_first_step && gated {
            Self::GateWaiting
        } else {
            Self::Ready
        }
    }

    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Finished for the purpose of releasing the next step's gate. `FAILED`
    /// counts; `ERRORED` does not, it is expected to retry.
    pub const fn counts_as_done(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Chunk is in the pool the maintenance pass hands to the enqueue gateway.
    pub const fn is_workable(&self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Chunk is past the gate: queued, claimed or finished in some way.
    pub const fn is_dispatched(&self) -> bool {
        matches!(
            self,
            Self::Queued | Self::InProgress | Self::Completed | Self::Errored | Self::Failed
        )
    }

    pub const fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::GateWaiting => matches!(target, Self::Ready),
            Self::Ready => matches!(target, Self::Queued),
            Self::Queued => matches!(target, Self::InProgress),
            Self::InProgress => matches!(target, Self::Completed | Self::Errored | Self::Failed),
            Self::Errored => matches!(target, Self::Ready),
            Self::Completed | Self::Failed => false,
        }
    }

    pub fn valid_transitions(&self) -> Vec<Self> {
        Self::ALL
            .into_iter()
            .filter(|target| self.can_transition_to(*target))
            .collect()
    }

    /// Checked transition.
    pub fn transition(self, target: Self) -> DomainResult<Self> {
        if self.can_transition_to(target) {
            Ok(target)
        } else {
            Err(DomainError::IllegalTransition {
                from: self,
                to: target,
            })
        }
    }

    /// Canonical upper-case name (`GATE_WAITING`, `IN_PROGRESS`, ...).
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::GateWaiting => "GATE_WAITING",
            Self::Ready => "READY",
            Self::Queued => "QUEUED",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Errored => "ERRORED",
            Self::Failed => "FAILED",
        }
    }

    /// Lower-case label for logs.
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::GateWaiting => "gate_waiting",
            Self::Ready => "ready",
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Errored => "errored",
            Self::Failed => "failed",
        }
    }
}

impl core::fmt::Display for WorkChunkStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkChunkStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase();
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == normalized)
            .ok_or_else(|| DomainError::validation(format!("unknown work chunk status: {s}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn first_step_is_always_ready() {
        assert_eq!(WorkChunkStatus::initial(true, true), WorkChunkStatus::Ready);
        assert_eq!(WorkChunkStatus::initial(true, false), WorkChunkStatus::Ready);
    }

    #[test]
    fn later_steps_wait_only_when_gated() {
        assert_eq!(
            WorkChunkStatus::initial(false, true),
            WorkChunkStatus::GateWaiting
        );
        assert_eq!(WorkChunkStatus::initial(false, false), WorkChunkStatus::Ready);
    }

    #[test]
    fn terminal_states_have_no_outgoing_edges() {
        for status in WorkChunkStatus::ALL {
            assert_eq!(status.is_terminal(), status.valid_transitions().is_empty());
        }
    }

    #[test]
    fn errored_chunks_hold_the_gate() {
        assert!(WorkChunkStatus::Completed.counts_as_done());
        assert!(WorkChunkStatus::Failed.counts_as_done());
        assert!(!WorkChunkStatus::Errored.counts_as_done());
        assert!(!WorkChunkStatus::InProgress.counts_as_done());
    }

    #[test]
    fn errored_reenters_ready_without_gate() {
        assert!(WorkChunkStatus::Errored.can_transition_to(WorkChunkStatus::Ready));
        assert!(!WorkChunkStatus::Errored.can_transition_to(WorkChunkStatus::GateWaiting));
        assert!(!WorkChunkStatus::Errored.can_transition_to(WorkChunkStatus::Queued));
    }

    #[test]
    fn dequeue_requires_queued() {
        for status in WorkChunkStatus::ALL {
            let legal = status.can_transition_to(WorkChunkStatus::InProgress);
            assert_eq!(legal, status == WorkChunkStatus::Queued, "{status}");
        }
    }

    #[test]
    fn illegal_transition_is_reported() {
        let err = WorkChunkStatus::Completed
            .transition(WorkChunkStatus::Ready)
            .unwrap_err();
        assert_eq!(
            err,
            DomainError::IllegalTransition {
                from: WorkChunkStatus::Completed,
                to: WorkChunkStatus::Ready,
            }
        );
    }

    #[test]
    fn parses_display_names_case_insensitively() {
        for status in WorkChunkStatus::ALL {
            assert_eq!(status.to_string().parse::<WorkChunkStatus>().unwrap(), status);
            assert_eq!(
                status.as_label().parse::<WorkChunkStatus>().unwrap(),
                status
            );
        }
        assert!("DONE".parse::<WorkChunkStatus>().is_err());
    }

    #[test]
    fn serde_uses_screaming_snake_case() {
        let json = serde_json::to_string(&WorkChunkStatus::GateWaiting).unwrap();
        assert_eq!(json, "\"GATE_WAITING\"");
    }

    fn any_status() -> impl Strategy<Value = WorkChunkStatus> {
        prop::sample::select(WorkChunkStatus::ALL.to_vec())
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: once a walk of checked transitions reaches a terminal
        /// status, every further request is rejected and the status sticks.
        #[test]
        fn terminal_status_is_sticky(
            start in any_status(),
            requests in prop::collection::vec(any_status(), 0..32)
        ) {
            let mut current = start;
            let mut terminal_seen = current.is_terminal();
            for target in requests {
                match current.transition(target) {
                    Ok(next) => {
                        prop_assert!(!terminal_seen);
                        current = next;
                    }
                    Err(_) => prop_assert!(!current.can_transition_to(target)),
                }
                terminal_seen |= current.is_terminal();
            }
        }
    }
}
