//! Commit phases
//!
//! A commit moves through a fixed sequence of phases. `advance` is pure so
//! the coordinator cannot skip a step or continue after a terminal state.

use serde::Serialize;
use tracing::trace;

use crate::error::WriterError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitOutcome {
    Committed,
    /// Failed after the transaction was opened
    RolledBack,
    /// Failed before any write happened
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitPhase {
    Idle,
    LockAcquired,
    TransactionOpen,
    WriteSetBuilt,
    MetricsReconciled,
    Committing,
    Done(CommitOutcome),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseEvent {
    LockGranted,
    TransactionBegun,
    WriteSetApplied,
    MetricsChecked,
    Finalize,
    Committed,
    Failed,
}

impl CommitPhase {
    pub fn advance(self, event: PhaseEvent) -> Result<CommitPhase, WriterError> {
        use CommitPhase::*;
        let next = match (self, event) {
            (Idle, PhaseEvent::LockGranted) => LockAcquired,
            (LockAcquired, PhaseEvent::TransactionBegun) => TransactionOpen,
            (TransactionOpen, PhaseEvent::WriteSetApplied) => WriteSetBuilt,
            (WriteSetBuilt, PhaseEvent::MetricsChecked) => MetricsReconciled,
            (MetricsReconciled, PhaseEvent::Finalize) => Committing,
            (Committing, PhaseEvent::Committed) => Done(CommitOutcome::Committed),
            (Idle | LockAcquired, PhaseEvent::Failed) => Done(CommitOutcome::Aborted),
            (TransactionOpen | WriteSetBuilt | MetricsReconciled | Committing, PhaseEvent::Failed) => {
                Done(CommitOutcome::RolledBack)
            }
            (phase, event) => {
                return Err(WriterError::Internal(format!(
                    "invalid commit transition: {:?} on {:?}",
                    phase, event
                )))
            }
        };
        Ok(next)
    }

    pub fn is_done(&self) -> bool {
        matches!(self, CommitPhase::Done(_))
    }

    pub fn outcome(&self) -> Option<CommitOutcome> {
        match self {
            CommitPhase::Done(outcome) => Some(*outcome),
            _ => None,
        }
    }
}

/// Current phase of one unit's commit
#[derive(Debug)]
pub struct PhaseTracker {
    unit: String,
    phase: CommitPhase,
}

impl PhaseTracker {
    pub fn new(unit: &str) -> Self {
        Self {
            unit: unit.to_string(),
            phase: CommitPhase::Idle,
        }
    }

    pub fn step(&mut self, event: PhaseEvent) -> Result<(), WriterError> {
        let next = self.phase.advance(event)?;
        trace!(unit = %self.unit, from = ?self.phase, to = ?next, "Commit phase");
        self.phase = next;
        Ok(())
    }

    /// Record a failure; a tracker that is already done keeps its outcome
    pub fn fail(&mut self) -> CommitOutcome {
        if let Ok(next) = self.phase.advance(PhaseEvent::Failed) {
            self.phase = next;
        }
        self.phase.outcome().unwrap_or(CommitOutcome::Aborted)
    }

    pub fn phase(&self) -> CommitPhase {
        self.phase
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let events = [
            PhaseEvent::LockGranted,
            PhaseEvent::TransactionBegun,
            PhaseEvent::WriteSetApplied,
            PhaseEvent::MetricsChecked,
            PhaseEvent::Finalize,
            PhaseEvent::Committed,
        ];
        let phase = events
            .iter()
            .try_fold(CommitPhase::Idle, |phase, event| phase.advance(*event))
            .unwrap();
        assert_eq!(phase.outcome(), Some(CommitOutcome::Committed));
    }

    #[test]
    fn test_failure_outcome_depends_on_phase() {
        let aborted = CommitPhase::LockAcquired.advance(PhaseEvent::Failed).unwrap();
        assert_eq!(aborted, CommitPhase::Done(CommitOutcome::Aborted));

        let rolled_back = CommitPhase::WriteSetBuilt.advance(PhaseEvent::Failed).unwrap();
        assert_eq!(rolled_back, CommitPhase::Done(CommitOutcome::RolledBack));
    }

    #[test]
    fn test_no_skipping_and_no_exit_from_done() {
        assert!(CommitPhase::TransactionOpen.advance(PhaseEvent::Finalize).is_err());
        assert!(CommitPhase::Done(CommitOutcome::Committed)
            .advance(PhaseEvent::Failed)
            .is_err());
        assert!(!CommitPhase::Committing.is_done());
    }

    #[test]
    fn test_tracker_failure() {
        let mut tracker = PhaseTracker::new("U");
        tracker.step(PhaseEvent::LockGranted).unwrap();
        tracker.step(PhaseEvent::TransactionBegun).unwrap();
        assert_eq!(tracker.fail(), CommitOutcome::RolledBack);
        assert_eq!(tracker.fail(), CommitOutcome::RolledBack);
        assert!(tracker.step(PhaseEvent::WriteSetApplied).is_err());
    }
}
