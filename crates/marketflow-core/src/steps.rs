use crate::error::WorkflowError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Multi-step workflow operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    AcceptBid,
    CreateTransaction,
    CancelTransaction,
    RefundTransaction,
    CompleteTransaction,
    ReconcileJob,
}

impl Operation {
    pub fn name(self) -> &'static str {
        match self {
            Self::AcceptBid => "accept_bid",
            Self::CreateTransaction => "create_transaction",
            Self::CancelTransaction => "cancel_transaction",
            Self::RefundTransaction => "refund_transaction",
            Self::CompleteTransaction => "complete_transaction",
            Self::ReconcileJob => "reconcile_job",
        }
    }

    /// Ordered step list. Step N+1 never starts before step N is known to have committed.
    pub fn steps(self) -> &'static [Step] {
        match self {
            Self::AcceptBid => &[Step::AcceptTargetBid, Step::RejectOtherBids, Step::AssignJob],
            Self::CreateTransaction => &[Step::InsertTransaction, Step::MarkJobPaymentPending],
            Self::CancelTransaction => &[Step::CancelTransaction, Step::ReturnJobToAssigned],
            Self::RefundTransaction => &[Step::RefundTransaction, Step::ReturnJobToAssigned],
            Self::CompleteTransaction => &[Step::CompleteTransaction, Step::CompleteJob],
            Self::ReconcileJob => &[Step::RejectOtherBids, Step::SyncJobStatus],
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single-row (or single bulk) write inside an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    AcceptTargetBid,
    RejectOtherBids,
    AssignJob,
    InsertTransaction,
    MarkJobPaymentPending,
    CancelTransaction,
    RefundTransaction,
    CompleteTransaction,
    ReturnJobToAssigned,
    CompleteJob,
    SyncJobStatus,
}

impl Step {
    pub fn name(self) -> &'static str {
        match self {
            Self::AcceptTargetBid => "accept_target_bid",
            Self::RejectOtherBids => "reject_other_bids",
            Self::AssignJob => "assign_job",
            Self::InsertTransaction => "insert_transaction",
            Self::MarkJobPaymentPending => "mark_job_payment_pending",
            Self::CancelTransaction => "cancel_transaction",
            Self::RefundTransaction => "refund_transaction",
            Self::CompleteTransaction => "complete_transaction",
            Self::ReturnJobToAssigned => "return_job_to_assigned",
            Self::CompleteJob => "complete_job",
            Self::SyncJobStatus => "sync_job_status",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Result of running an idempotent step function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    /// The step wrote to the store.
    Applied,
    /// Current state already reflected the step; nothing was written.
    AlreadyApplied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: Step,
    pub outcome: StepOutcome,
}

/// Records the last committed step of one operation run.
///
/// Steps must be recorded in the operation's declared order, so a skipped
/// step surfaces as an error instead of silently passing.
#[derive(Debug, Clone)]
pub struct TransitionCursor {
    operation: Operation,
    records: Vec<StepRecord>,
}

impl TransitionCursor {
    pub fn new(operation: Operation) -> Self {
        Self {
            operation,
            records: Vec::new(),
        }
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn records(&self) -> &[StepRecord] {
        &self.records
    }

    /// Steps whose effect is known to be present in the store.
    pub fn committed(&self) -> Vec<Step> {
        self.records.iter().map(|record| record.step).collect()
    }

    pub fn next_step(&self) -> Option<Step> {
        self.operation.steps().get(self.records.len()).copied()
    }

    pub fn is_complete(&self) -> bool {
        self.next_step().is_none()
    }

    pub fn record(&mut self, step: Step, outcome: StepOutcome) -> Result<(), WorkflowError> {
        match self.next_step() {
            Some(expected) if expected == step => {
                self.records.push(StepRecord { step, outcome });
                Ok(())
            }
            Some(expected) => Err(WorkflowError::step_order_violation(
                self.operation,
                expected.name(),
                step.name(),
            )),
            None => Err(WorkflowError::step_order_violation(
                self.operation,
                "<end>",
                step.name(),
            )),
        }
    }
}
