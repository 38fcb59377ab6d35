//! Gate evaluation between consecutive steps of a gated job.
//!
//! A gate opens when every chunk of the preceding step is done. What "done"
//! means for `FAILED` chunks and for steps that produced no chunks at all is
//! decided by [`GatePolicy`].

use serde::{Deserialize, Serialize};

use batchgate_core::WorkChunkStatus;

/// How a predecessor step with zero chunks is treated.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZeroChunkStepPolicy {
    /// Complete only once its producer sealed the step.
    #[default]
    RequireSealed,
    /// Always complete.
    VacuouslyComplete,
    /// Never complete; the gate stays shut.
    Block,
}

/// How `FAILED` chunks of the predecessor step are treated.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailedChunkPolicy {
    /// Failed chunks are done; the instance is marked degraded.
    #[default]
    CountAsDone,
    /// Any failed chunk keeps the gate shut for good.
    BlockGate,
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatePolicy {
    #[serde(default)]
    pub zero_chunk_steps: ZeroChunkStepPolicy,
    #[serde(default)]
    pub failed_chunks: FailedChunkPolicy,
}

impl GatePolicy {
    pub fn with_zero_chunk_steps(mut self, policy: ZeroChunkStepPolicy) -> Self {
        self.zero_chunk_steps = policy;
        self
    }

    pub fn with_failed_chunks(mut self, policy: FailedChunkPolicy) -> Self {
        self.failed_chunks = policy;
        self
    }

    /// Decide whether the gate after `predecessor` is open.
    pub fn evaluate(&self, predecessor: &StepTally, predecessor_sealed: bool) -> GateVerdict {
        let total = predecessor.total();
        if total == 0 {
            return match self.zero_chunk_steps {
                ZeroChunkStepPolicy::VacuouslyComplete => GateVerdict::Open,
                ZeroChunkStepPolicy::RequireSealed if predecessor_sealed => GateVerdict::Open,
                ZeroChunkStepPolicy::RequireSealed => {
                    GateVerdict::Blocked(GateBlock::PredecessorEmptyUnsealed)
                }
                ZeroChunkStepPolicy::Block => GateVerdict::Blocked(GateBlock::PredecessorEmpty),
            };
        }

        let pending = total - predecessor.done();
        if pending > 0 {
            return GateVerdict::Blocked(GateBlock::PredecessorIncomplete { pending });
        }

        let failed = predecessor.count(WorkChunkStatus::Failed);
        if failed > 0 && self.failed_chunks == FailedChunkPolicy::BlockGate {
            return GateVerdict::Blocked(GateBlock::PredecessorFailed { failed });
        }

        GateVerdict::Open
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateVerdict {
    Open,
    Blocked(GateBlock),
}

impl GateVerdict {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }
}

/// Why a gate stayed shut.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum GateBlock {
    /// Predecessor chunks still queued, running, errored or waiting.
    PredecessorIncomplete { pending: usize },
    /// Predecessor has failed chunks and the policy blocks on them.
    PredecessorFailed { failed: usize },
    /// Predecessor has no chunks and was never sealed.
    PredecessorEmptyUnsealed,
    /// Predecessor has no chunks and empty steps never complete.
    PredecessorEmpty,
}

impl core::fmt::Display for GateBlock {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::PredecessorIncomplete { pending } => {
                write!(f, "{pending} predecessor chunk(s) not done")
            }
            Self::PredecessorFailed { failed } => write!(f, "{failed} predecessor chunk(s) failed"),
            Self::PredecessorEmptyUnsealed => f.write_str("predecessor has no chunks and is not sealed"),
            Self::PredecessorEmpty => f.write_str("predecessor has no chunks"),
        }
    }
}

/// Per-status chunk counts of one step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepTally {
    counts: [usize; 7],
}

impl StepTally {
    fn slot(status: WorkChunkStatus) -> usize {
        match status {
            WorkChunkStatus::GateWaiting => 0,
            WorkChunkStatus::Ready => 1,
            WorkChunkStatus::Queued => 2,
            WorkChunkStatus::InProgress => 3,
            WorkChunkStatus::Completed => 4,
            WorkChunkStatus::Errored => 5,
            WorkChunkStatus::Failed => 6,
        }
    }

    pub fn record(&mut self, status: WorkChunkStatus) {
        self.counts[Self::slot(status)] += 1;
    }

    pub fn count(&self, status: WorkChunkStatus) -> usize {
        self.counts[Self::slot(status)]
    }

    pub fn total(&self) -> usize {
        self.counts.iter().sum()
    }

    /// Chunks that count as done for gating.
    pub fn done(&self) -> usize {
        WorkChunkStatus::ALL
            .into_iter()
            .filter(|status| status.counts_as_done())
            .map(|status| self.count(status))
            .sum()
    }
}

impl FromIterator<WorkChunkStatus> for StepTally {
    fn from_iter<T: IntoIterator<Item = WorkChunkStatus>>(iter: T) -> Self {
        let mut tally = Self::default();
        for status in iter {
            tally.record(status);
        }
        tally
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use WorkChunkStatus::*;

    #[test]
    fn all_completed_opens_gate() {
        let tally: StepTally = [Completed, Completed].into_iter().collect();
        assert!(GatePolicy::default().evaluate(&tally, false).is_open());
    }

    #[test]
    fn any_non_terminal_chunk_blocks() {
        for blocker in [GateWaiting, Ready, Queued, InProgress, Errored] {
            let tally: StepTally = [Completed, blocker].into_iter().collect();
            assert_eq!(
                GatePolicy::default().evaluate(&tally, true),
                GateVerdict::Blocked(GateBlock::PredecessorIncomplete { pending: 1 }),
                "{blocker}"
            );
        }
    }

    #[test]
    fn failed_chunks_follow_policy() {
        let tally: StepTally = [Completed, Failed].into_iter().collect();
        assert!(GatePolicy::default().evaluate(&tally, false).is_open());

        let strict = GatePolicy::default().with_failed_chunks(FailedChunkPolicy::BlockGate);
        assert_eq!(
            strict.evaluate(&tally, false),
            GateVerdict::Blocked(GateBlock::PredecessorFailed { failed: 1 })
        );
    }

    #[test]
    fn empty_predecessor_follows_policy() {
        let empty = StepTally::default();
        let default = GatePolicy::default();
        assert_eq!(
            default.evaluate(&empty, false),
            GateVerdict::Blocked(GateBlock::PredecessorEmptyUnsealed)
        );
        assert!(default.evaluate(&empty, true).is_open());

        let vacuous = default.with_zero_chunk_steps(ZeroChunkStepPolicy::VacuouslyComplete);
        assert!(vacuous.evaluate(&empty, false).is_open());

        let block = default.with_zero_chunk_steps(ZeroChunkStepPolicy::Block);
        assert_eq!(
            block.evaluate(&empty, true),
            GateVerdict::Blocked(GateBlock::PredecessorEmpty)
        );
    }

    #[test]
    fn tally_counts_by_status() {
        let tally: StepTally = [Ready, Ready, Failed].into_iter().collect();
        assert_eq!(tally.count(Ready), 2);
        assert_eq!(tally.done(), 1);
        assert_eq!(tally.total(), 3);
    }
}
