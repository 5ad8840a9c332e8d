//! Cross-entity job/bid/transaction transitions.
//!
//! Each operation is an ordered list of [`Step`]s. Every step is an
//! idempotent step function: it reads current state, reports
//! `AlreadyApplied` when the effect is present, and otherwise issues one
//! guarded write. A failure after at least one committed step is surfaced as
//! `WorkflowError::PartialFailure` carrying the cursor and a snapshot; a retry
//! of the same operation resumes from the first step whose effect is missing.

use crate::config::WorkflowConfig;
use crate::error::{EntitySnapshot, PartialFailureReport, WorkflowError};
use crate::export::{self, ExportDocument, ExportFormat};
use crate::gate::{Identity, Role};
use crate::policy::{authorize, Action, Resource};
use crate::records::Records;
use crate::steps::{Operation, Step, StepOutcome, StepRecord, TransitionCursor};
use marketflow_storage::{
    BidRecord, BidStatus, Collection, EntityStore, Field, Filter, Guard, JobRecord, JobStatus,
    Patch, Row, StorageError, TransactionRecord, TransactionStatus,
};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// What a transaction is created from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionSource {
    /// Charge the job's accepted bid.
    Job(String),
    /// Charge this bid; it must be the job's accepted bid.
    Bid(String),
}

/// Amounts a client expects to be charged. Checked, never trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientQuote {
    pub amount_minor: i64,
    pub commission_minor: i64,
}

/// Outcome of a completed multi-step operation.
#[derive(Debug, Clone, Serialize)]
pub struct TransitionReport {
    pub operation: Operation,
    pub steps: Vec<StepRecord>,
    pub transaction_id: Option<String>,
    pub snapshot: EntitySnapshot,
}

impl TransitionReport {
    /// True when at least one step wrote to the store.
    pub fn changed_state(&self) -> bool {
        self.steps
            .iter()
            .any(|record| record.outcome == StepOutcome::Applied)
    }

    pub fn job(&self) -> Option<&JobRecord> {
        self.snapshot.job.as_ref()
    }

    pub fn transaction(&self) -> Option<&TransactionRecord> {
        let id = self.transaction_id.as_deref()?;
        self.snapshot.transactions.iter().find(|tx| tx.id == id)
    }
}

/// Job status move performed by a step.
struct JobMove {
    from: &'static [JobStatus],
    to: JobStatus,
    /// Statuses past `to` that also count as the step being applied.
    settled: &'static [JobStatus],
}

const ASSIGN_JOB: JobMove = JobMove {
    from: &[JobStatus::Open],
    to: JobStatus::Assigned,
    settled: &[JobStatus::PaymentPending, JobStatus::Completed],
};

const MARK_PAYMENT_PENDING: JobMove = JobMove {
    from: &[JobStatus::Assigned],
    to: JobStatus::PaymentPending,
    settled: &[],
};

const RELEASE_PAYMENT: JobMove = JobMove {
    from: &[JobStatus::PaymentPending],
    to: JobStatus::Assigned,
    settled: &[],
};

const RELEASE_AFTER_REFUND: JobMove = JobMove {
    from: &[JobStatus::PaymentPending, JobStatus::Completed],
    to: JobStatus::Assigned,
    settled: &[],
};

const COMPLETE_JOB: JobMove = JobMove {
    from: &[JobStatus::PaymentPending],
    to: JobStatus::Completed,
    settled: &[],
};

fn no_pending_transaction(job_id: &str) -> Guard {
    Guard::absent(
        Collection::Transactions,
        Filter::new()
            .eq(Field::JobId, job_id)
            .eq(Field::Status, TransactionStatus::Pending),
    )
}

fn transaction_in(job_id: &str, tx_id: &str, status: TransactionStatus) -> Guard {
    Guard::exists(
        Collection::Transactions,
        Filter::by_id(tx_id)
            .eq(Field::JobId, job_id)
            .eq(Field::Status, status),
    )
}

fn bid_accepted(job_id: &str, bid_id: &str) -> Guard {
    Guard::exists(
        Collection::Bids,
        Filter::by_id(bid_id)
            .eq(Field::JobId, job_id)
            .eq(Field::Status, BidStatus::Accepted),
    )
}

fn check_quote(quote: Option<ClientQuote>, amount: i64, commission: i64) -> Result<(), WorkflowError> {
    match quote {
        Some(quote) if quote.amount_minor != amount || quote.commission_minor != commission => {
            Err(WorkflowError::InvalidInput(format!(
                "quoted amount {}/commission {} does not match {}/{}",
                quote.amount_minor, quote.commission_minor, amount, commission
            )))
        }
        _ => Ok(()),
    }
}

/// Executes job/bid/transaction transitions against the entity store.
#[derive(Clone)]
pub struct WorkflowOrchestrator {
    records: Records,
    config: WorkflowConfig,
}

impl WorkflowOrchestrator {
    pub fn new(store: Arc<dyn EntityStore>, config: WorkflowConfig) -> Self {
        Self {
            records: Records::new(store),
            config,
        }
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    fn store(&self) -> &dyn EntityStore {
        self.records.store()
    }

    /// Post a new open job owned by the calling customer.
    #[instrument(skip(self, identity), fields(user_id = %identity.user_id))]
    pub async fn open_job(&self, identity: &Identity, title: &str) -> Result<JobRecord, WorkflowError> {
        authorize(identity, &Resource::Marketplace, Action::OpenJob)?;
        let title = title.trim();
        if title.is_empty() {
            return Err(WorkflowError::InvalidInput("job title is required".to_string()));
        }
        let job = match self
            .store()
            .insert(Row::Job(JobRecord::open(&identity.user_id, title)), &[])
            .await?
        {
            Row::Job(job) => job,
            other => {
                return Err(WorkflowError::StoreFailure(format!(
                    "insert returned a {} row",
                    other.collection()
                )))
            }
        };
        info!(job_id = %job.id, customer_id = %job.customer_id, "job opened");
        Ok(job)
    }

    /// Accept a bid: bid -> accepted, other bids -> rejected, job -> assigned.
    #[instrument(skip(self, identity), fields(user_id = %identity.user_id))]
    pub async fn accept_bid(
        &self,
        identity: &Identity,
        bid_id: &str,
    ) -> Result<TransitionReport, WorkflowError> {
        let bid = self.records.bid(bid_id).await?;
        let job = self.records.job(&bid.job_id).await?;
        authorize(identity, &Resource::Bid { bid: &bid, job: &job }, Action::AcceptBid)?;

        let mut cursor = TransitionCursor::new(Operation::AcceptBid);
        match bid.status {
            BidStatus::Accepted => {
                debug!(bid_id = %bid.id, "bid already accepted, resuming");
                cursor.record(Step::AcceptTargetBid, StepOutcome::AlreadyApplied)?;
            }
            BidStatus::Rejected => {
                return Err(WorkflowError::ConflictingState(format!(
                    "bid '{}' was rejected",
                    bid.id
                )))
            }
            BidStatus::Pending => {
                if job.status != JobStatus::Open {
                    return Err(WorkflowError::ConflictingState(format!(
                        "job '{}' is {}; bids can only be accepted on open jobs",
                        job.id,
                        job.status.as_str()
                    )));
                }
                self.run_step(
                    &mut cursor,
                    &job.id,
                    Step::AcceptTargetBid,
                    self.accept_target_bid(&bid),
                )
                .await?;
            }
        }

        self.run_step(
            &mut cursor,
            &job.id,
            Step::RejectOtherBids,
            self.reject_other_bids(&job.id, &bid.id),
        )
        .await?;
        self.run_step(
            &mut cursor,
            &job.id,
            Step::AssignJob,
            self.move_job(&job.id, &ASSIGN_JOB, vec![bid_accepted(&job.id, &bid.id)]),
        )
        .await?;

        let report = self.finish(cursor, &job.id, None).await;
        info!(
            bid_id = %bid.id,
            job_id = %job.id,
            changed = report.changed_state(),
            "bid accepted"
        );
        Ok(report)
    }

    /// Reject a single pending bid. The job status is left alone.
    #[instrument(skip(self, identity), fields(user_id = %identity.user_id))]
    pub async fn reject_bid(
        &self,
        identity: &Identity,
        bid_id: &str,
    ) -> Result<BidRecord, WorkflowError> {
        let bid = self.records.bid(bid_id).await?;
        let job = self.records.job(&bid.job_id).await?;
        authorize(identity, &Resource::Bid { bid: &bid, job: &job }, Action::RejectBid)?;

        match bid.status {
            BidStatus::Rejected => return Ok(bid),
            BidStatus::Accepted => {
                return Err(WorkflowError::ConflictingState(format!(
                    "bid '{}' is the accepted bid for job '{}'",
                    bid.id, job.id
                )))
            }
            BidStatus::Pending => {}
        }

        let matched = self
            .store()
            .update(
                Collection::Bids,
                &Filter::by_id(bid.id.as_str()).eq(Field::Status, BidStatus::Pending),
                &Patch::new().status(BidStatus::Rejected),
                &[],
            )
            .await?;
        let current = self.records.bid(&bid.id).await?;
        if matched == 0 && current.status != BidStatus::Rejected {
            return Err(WorkflowError::ConflictingState(format!(
                "bid '{}' became {} before it could be rejected",
                current.id,
                current.status.as_str()
            )));
        }
        info!(bid_id = %bid.id, job_id = %job.id, "bid rejected");
        Ok(current)
    }

    /// Charge the accepted bid: insert a pending transaction, job -> payment_pending.
    ///
    /// Amount and commission are always computed here from the bid price and
    /// the configured rate. Retrying while a pending transaction exists
    /// returns that transaction instead of creating a second one.
    #[instrument(skip(self, identity, quote), fields(user_id = %identity.user_id))]
    pub async fn create_transaction(
        &self,
        identity: &Identity,
        source: TransactionSource,
        quote: Option<ClientQuote>,
    ) -> Result<TransitionReport, WorkflowError> {
        let (job, bid) = match &source {
            TransactionSource::Bid(bid_id) => {
                let bid = self.records.bid(bid_id).await?;
                let job = self.records.job(&bid.job_id).await?;
                (job, Some(bid))
            }
            TransactionSource::Job(job_id) => {
                let job = self.records.job(job_id).await?;
                let bid = self.records.accepted_bid(&job.id).await?;
                (job, bid)
            }
        };
        authorize(identity, &Resource::Job(&job), Action::CreateTransaction)?;

        let bid = match bid {
            Some(bid) if bid.status == BidStatus::Accepted => bid,
            Some(bid) => {
                return Err(WorkflowError::ConflictingState(format!(
                    "bid '{}' is {}; only the accepted bid can be charged",
                    bid.id,
                    bid.status.as_str()
                )))
            }
            None => {
                return Err(WorkflowError::ConflictingState(format!(
                    "job '{}' has no accepted bid",
                    job.id
                )))
            }
        };

        let mut cursor = TransitionCursor::new(Operation::CreateTransaction);
        let existing = self.records.pending_transactions(&job.id).await?;
        let tx = match existing.into_iter().next() {
            Some(existing) => {
                check_quote(quote, existing.amount_minor, existing.commission_minor)?;
                debug!(transaction_id = %existing.id, "pending transaction already exists, resuming");
                cursor.record(Step::InsertTransaction, StepOutcome::AlreadyApplied)?;
                existing
            }
            None => {
                if job.status != JobStatus::Assigned {
                    return Err(WorkflowError::ConflictingState(format!(
                        "job '{}' is {}; transactions are created for assigned jobs",
                        job.id,
                        job.status.as_str()
                    )));
                }
                let (commission, amount) = self.config.commission.split(bid.price_minor)?;
                check_quote(quote, amount, commission)?;
                let (tx, outcome) = self
                    .insert_transaction(&job, &bid, amount, commission)
                    .await?;
                cursor.record(Step::InsertTransaction, outcome)?;
                tx
            }
        };

        self.run_step(
            &mut cursor,
            &job.id,
            Step::MarkJobPaymentPending,
            self.move_job(
                &job.id,
                &MARK_PAYMENT_PENDING,
                vec![transaction_in(&job.id, &tx.id, TransactionStatus::Pending)],
            ),
        )
        .await?;

        let report = self.finish(cursor, &job.id, Some(&tx.id)).await;
        info!(
            transaction_id = %tx.id,
            job_id = %job.id,
            amount_minor = tx.amount_minor,
            commission_minor = tx.commission_minor,
            commission_rate_bps = tx.commission_rate_bps,
            "transaction created"
        );
        Ok(report)
    }

    /// Cancel a pending transaction and return the job to assigned.
    #[instrument(skip(self, identity), fields(user_id = %identity.user_id))]
    pub async fn cancel_transaction(
        &self,
        identity: &Identity,
        transaction_id: &str,
    ) -> Result<TransitionReport, WorkflowError> {
        let tx = self.records.transaction(transaction_id).await?;
        let job = self.records.job(&tx.job_id).await?;
        authorize(
            identity,
            &Resource::Transactions {
                job: &job,
                provider_id: None,
            },
            Action::CancelTransaction,
        )?;

        let resumable = tx.status == TransactionStatus::Cancelled
            && self
                .job_step_outstanding(&job, &tx, RELEASE_PAYMENT.from)
                .await?;

        let mut cursor = TransitionCursor::new(Operation::CancelTransaction);
        match tx.status {
            TransactionStatus::Pending => {
                self.run_step(
                    &mut cursor,
                    &job.id,
                    Step::CancelTransaction,
                    self.set_transaction_status(
                        &tx.id,
                        &[TransactionStatus::Pending],
                        TransactionStatus::Cancelled,
                    ),
                )
                .await?;
            }
            TransactionStatus::Cancelled if resumable => {
                debug!(transaction_id = %tx.id, "cancel interrupted before job release, resuming");
                cursor.record(Step::CancelTransaction, StepOutcome::AlreadyApplied)?;
            }
            status => {
                return Err(WorkflowError::ConflictingState(format!(
                    "transaction '{}' is {}; only pending transactions can be cancelled",
                    tx.id,
                    status.as_str()
                )))
            }
        }

        self.run_step(
            &mut cursor,
            &job.id,
            Step::ReturnJobToAssigned,
            self.move_job(&job.id, &RELEASE_PAYMENT, vec![no_pending_transaction(&job.id)]),
        )
        .await?;

        let report = self.finish(cursor, &job.id, Some(&tx.id)).await;
        info!(transaction_id = %tx.id, job_id = %job.id, "transaction cancelled");
        Ok(report)
    }

    /// Refund a pending or completed transaction and return the job to assigned.
    #[instrument(skip(self, identity), fields(user_id = %identity.user_id))]
    pub async fn refund_transaction(
        &self,
        identity: &Identity,
        transaction_id: &str,
    ) -> Result<TransitionReport, WorkflowError> {
        let tx = self.records.transaction(transaction_id).await?;
        let job = self.records.job(&tx.job_id).await?;
        authorize(
            identity,
            &Resource::Transactions {
                job: &job,
                provider_id: None,
            },
            Action::RefundTransaction,
        )?;

        let mut cursor = TransitionCursor::new(Operation::RefundTransaction);
        match tx.status {
            TransactionStatus::Pending | TransactionStatus::Completed => {
                self.run_step(
                    &mut cursor,
                    &job.id,
                    Step::RefundTransaction,
                    self.set_transaction_status(
                        &tx.id,
                        &[TransactionStatus::Pending, TransactionStatus::Completed],
                        TransactionStatus::Refunded,
                    ),
                )
                .await?;
            }
            TransactionStatus::Refunded => {
                cursor.record(Step::RefundTransaction, StepOutcome::AlreadyApplied)?;
                if !self
                    .job_step_outstanding(&job, &tx, RELEASE_AFTER_REFUND.from)
                    .await?
                {
                    // The job has moved on (or was released already); nothing to redo.
                    cursor.record(Step::ReturnJobToAssigned, StepOutcome::AlreadyApplied)?;
                    return Ok(self.finish(cursor, &job.id, Some(&tx.id)).await);
                }
            }
            TransactionStatus::Cancelled => {
                return Err(WorkflowError::ConflictingState(format!(
                    "transaction '{}' was cancelled and cannot be refunded",
                    tx.id
                )))
            }
        }

        self.run_step(
            &mut cursor,
            &job.id,
            Step::ReturnJobToAssigned,
            self.move_job(
                &job.id,
                &RELEASE_AFTER_REFUND,
                vec![no_pending_transaction(&job.id)],
            ),
        )
        .await?;

        let report = self.finish(cursor, &job.id, Some(&tx.id)).await;
        info!(
            transaction_id = %tx.id,
            job_id = %job.id,
            amount_minor = tx.amount_minor,
            "transaction refunded"
        );
        Ok(report)
    }

    /// Settle a pending transaction and complete the job.
    #[instrument(skip(self, identity), fields(user_id = %identity.user_id))]
    pub async fn complete_transaction(
        &self,
        identity: &Identity,
        transaction_id: &str,
    ) -> Result<TransitionReport, WorkflowError> {
        let tx = self.records.transaction(transaction_id).await?;
        let job = self.records.job(&tx.job_id).await?;
        authorize(
            identity,
            &Resource::Transactions {
                job: &job,
                provider_id: None,
            },
            Action::CompleteTransaction,
        )?;

        let mut cursor = TransitionCursor::new(Operation::CompleteTransaction);
        match tx.status {
            TransactionStatus::Pending => {
                self.run_step(
                    &mut cursor,
                    &job.id,
                    Step::CompleteTransaction,
                    self.set_transaction_status(
                        &tx.id,
                        &[TransactionStatus::Pending],
                        TransactionStatus::Completed,
                    ),
                )
                .await?;
            }
            TransactionStatus::Completed => {
                cursor.record(Step::CompleteTransaction, StepOutcome::AlreadyApplied)?;
                if !self
                    .job_step_outstanding(&job, &tx, COMPLETE_JOB.from)
                    .await?
                {
                    cursor.record(Step::CompleteJob, StepOutcome::AlreadyApplied)?;
                    return Ok(self.finish(cursor, &job.id, Some(&tx.id)).await);
                }
            }
            status => {
                return Err(WorkflowError::ConflictingState(format!(
                    "transaction '{}' is {}; only pending transactions can be completed",
                    tx.id,
                    status.as_str()
                )))
            }
        }

        self.run_step(
            &mut cursor,
            &job.id,
            Step::CompleteJob,
            self.move_job(
                &job.id,
                &COMPLETE_JOB,
                vec![transaction_in(&job.id, &tx.id, TransactionStatus::Completed)],
            ),
        )
        .await?;

        let report = self.finish(cursor, &job.id, Some(&tx.id)).await;
        info!(transaction_id = %tx.id, job_id = %job.id, "transaction completed");
        Ok(report)
    }

    /// Transactions of a job, oldest first.
    pub async fn list_transactions(
        &self,
        identity: &Identity,
        job_id: &str,
    ) -> Result<Vec<TransactionRecord>, WorkflowError> {
        let job = self.records.job(job_id).await?;
        let accepted = self.records.accepted_bid(&job.id).await?;
        authorize(
            identity,
            &Resource::Transactions {
                job: &job,
                provider_id: accepted.as_ref().map(|bid| bid.provider_id.as_str()),
            },
            Action::ListTransactions,
        )?;
        self.records.transactions_for_job(&job.id).await
    }

    /// Remove a cancelled or refunded transaction.
    #[instrument(skip(self, identity), fields(user_id = %identity.user_id))]
    pub async fn delete_transaction(
        &self,
        identity: &Identity,
        transaction_id: &str,
    ) -> Result<(), WorkflowError> {
        const DELETABLE: [TransactionStatus; 2] =
            [TransactionStatus::Cancelled, TransactionStatus::Refunded];

        let tx = self.records.transaction(transaction_id).await?;
        let job = self.records.job(&tx.job_id).await?;
        authorize(
            identity,
            &Resource::Transactions {
                job: &job,
                provider_id: None,
            },
            Action::DeleteTransaction,
        )?;
        if !DELETABLE.contains(&tx.status) {
            return Err(WorkflowError::ConflictingState(format!(
                "transaction '{}' is {}; only cancelled or refunded transactions can be deleted",
                tx.id,
                tx.status.as_str()
            )));
        }

        let deleted = self
            .store()
            .delete(
                Collection::Transactions,
                &Filter::by_id(tx.id.as_str()).is_in(Field::Status, DELETABLE),
            )
            .await?;
        if deleted == 0 {
            return Err(WorkflowError::ConflictingState(format!(
                "transaction '{}' changed before it could be deleted",
                tx.id
            )));
        }
        info!(transaction_id = %tx.id, job_id = %job.id, "transaction deleted");
        Ok(())
    }

    /// Export transactions visible to the caller.
    ///
    /// Admins see every transaction; customers see the transactions of jobs
    /// they own.
    #[instrument(skip(self, identity), fields(user_id = %identity.user_id))]
    pub async fn export_transactions(
        &self,
        identity: &Identity,
        format: ExportFormat,
    ) -> Result<ExportDocument, WorkflowError> {
        authorize(identity, &Resource::Ledger, Action::ExportTransactions)?;

        let transactions = if identity.role == Role::Admin {
            self.records.transactions(&Filter::new()).await?
        } else {
            let owned = self
                .records
                .jobs(&Filter::new().eq(Field::CustomerId, identity.user_id.as_str()))
                .await?;
            if owned.is_empty() {
                Vec::new()
            } else {
                self.records
                    .transactions(
                        &Filter::new().is_in(Field::JobId, owned.iter().map(|job| job.id.as_str())),
                    )
                    .await?
            }
        };

        let document = export::render(format, &transactions)?;
        info!(rows = document.rows, format = ?format, "transactions exported");
        Ok(document)
    }

    /// Re-derive a job's status from its accepted bid and latest transaction
    /// and finish any interrupted sequence.
    #[instrument(skip(self, identity), fields(user_id = %identity.user_id))]
    pub async fn reconcile_job(
        &self,
        identity: &Identity,
        job_id: &str,
    ) -> Result<TransitionReport, WorkflowError> {
        let job = self.records.job(job_id).await?;
        authorize(identity, &Resource::Job(&job), Action::ReconcileJob)?;

        let mut cursor = TransitionCursor::new(Operation::ReconcileJob);
        let Some(accepted) = self.records.accepted_bid(&job.id).await? else {
            if matches!(job.status, JobStatus::Open | JobStatus::Cancelled) {
                cursor.record(Step::RejectOtherBids, StepOutcome::AlreadyApplied)?;
                cursor.record(Step::SyncJobStatus, StepOutcome::AlreadyApplied)?;
                return Ok(self.finish(cursor, &job.id, None).await);
            }
            return Err(WorkflowError::ConflictingState(format!(
                "job '{}' is {} but has no accepted bid",
                job.id,
                job.status.as_str()
            )));
        };

        self.run_step(
            &mut cursor,
            &job.id,
            Step::RejectOtherBids,
            self.reject_other_bids(&job.id, &accepted.id),
        )
        .await?;
        self.run_step(
            &mut cursor,
            &job.id,
            Step::SyncJobStatus,
            self.sync_job_status(&job.id),
        )
        .await?;

        let report = self.finish(cursor, &job.id, None).await;
        info!(
            job_id = %job.id,
            changed = report.changed_state(),
            "job reconciled"
        );
        Ok(report)
    }

    async fn run_step<F>(
        &self,
        cursor: &mut TransitionCursor,
        job_id: &str,
        step: Step,
        action: F,
    ) -> Result<(), WorkflowError>
    where
        F: Future<Output = Result<StepOutcome, WorkflowError>>,
    {
        match action.await {
            Ok(outcome) => {
                debug!(operation = %cursor.operation(), step = %step, outcome = ?outcome, job_id, "step done");
                cursor.record(step, outcome)
            }
            Err(cause) => Err(self.fail(cursor, step, cause, job_id).await),
        }
    }

    async fn fail(
        &self,
        cursor: &TransitionCursor,
        step: Step,
        cause: WorkflowError,
        job_id: &str,
    ) -> WorkflowError {
        if cursor.records().is_empty() {
            return cause;
        }
        let committed_steps = cursor.committed();
        warn!(
            operation = %cursor.operation(),
            failed_step = %step,
            committed = ?committed_steps,
            job_id,
            error = %cause,
            "workflow stopped after partial commit"
        );
        let snapshot = self.records.snapshot(job_id).await;
        WorkflowError::PartialFailure(Box::new(PartialFailureReport {
            operation: cursor.operation(),
            failed_step: step,
            committed_steps,
            cause_kind: cause.kind(),
            cause: cause.to_string(),
            snapshot,
        }))
    }

    async fn finish(
        &self,
        cursor: TransitionCursor,
        job_id: &str,
        transaction_id: Option<&str>,
    ) -> TransitionReport {
        TransitionReport {
            operation: cursor.operation(),
            steps: cursor.records().to_vec(),
            transaction_id: transaction_id.map(str::to_string),
            snapshot: self.records.snapshot(job_id).await,
        }
    }

    /// True when `tx` is the job's latest transaction, nothing is pending,
    /// and the job still sits in one of `stuck_in`: the follow-up job step
    /// of a terminal transition never ran.
    async fn job_step_outstanding(
        &self,
        job: &JobRecord,
        tx: &TransactionRecord,
        stuck_in: &[JobStatus],
    ) -> Result<bool, WorkflowError> {
        if !stuck_in.contains(&job.status) {
            return Ok(false);
        }
        let transactions = self.records.transactions_for_job(&job.id).await?;
        let none_pending = transactions
            .iter()
            .all(|other| other.status != TransactionStatus::Pending);
        let is_latest = transactions.last().map(|latest| latest.id.as_str()) == Some(tx.id.as_str());
        Ok(none_pending && is_latest)
    }

    async fn accept_target_bid(&self, bid: &BidRecord) -> Result<StepOutcome, WorkflowError> {
        let guards = [
            Guard::exists(
                Collection::Jobs,
                Filter::by_id(bid.job_id.as_str()).eq(Field::Status, JobStatus::Open),
            ),
            Guard::absent(
                Collection::Bids,
                Filter::new()
                    .eq(Field::JobId, bid.job_id.as_str())
                    .eq(Field::Status, BidStatus::Accepted),
            ),
        ];
        let matched = self
            .store()
            .update(
                Collection::Bids,
                &Filter::by_id(bid.id.as_str()).eq(Field::Status, BidStatus::Pending),
                &Patch::new().status(BidStatus::Accepted),
                &guards,
            )
            .await?;
        if matched > 0 {
            return Ok(StepOutcome::Applied);
        }

        let current = self.records.bid(&bid.id).await?;
        if current.status == BidStatus::Accepted {
            return Ok(StepOutcome::AlreadyApplied);
        }
        Err(WorkflowError::ConflictingState(format!(
            "bid '{}' could not be accepted: job '{}' is no longer open or another bid was accepted",
            bid.id, bid.job_id
        )))
    }

    async fn reject_other_bids(
        &self,
        job_id: &str,
        accepted_bid_id: &str,
    ) -> Result<StepOutcome, WorkflowError> {
        let others = Filter::new()
            .eq(Field::JobId, job_id)
            .ne(Field::Id, accepted_bid_id)
            .eq(Field::Status, BidStatus::Pending);
        if self.records.bids(&others).await?.is_empty() {
            return Ok(StepOutcome::AlreadyApplied);
        }

        let rejected = self
            .store()
            .update(
                Collection::Bids,
                &others,
                &Patch::new().status(BidStatus::Rejected),
                &[bid_accepted(job_id, accepted_bid_id)],
            )
            .await?;
        if rejected == 0 {
            let current = self.records.bid(accepted_bid_id).await?;
            if current.status != BidStatus::Accepted {
                return Err(WorkflowError::ConflictingState(format!(
                    "bid '{}' is no longer accepted",
                    accepted_bid_id
                )));
            }
            return Ok(StepOutcome::AlreadyApplied);
        }
        debug!(job_id, rejected, "competing bids rejected");
        Ok(StepOutcome::Applied)
    }

    async fn move_job(
        &self,
        job_id: &str,
        movement: &JobMove,
        guards: Vec<Guard>,
    ) -> Result<StepOutcome, WorkflowError> {
        let job = self.records.job(job_id).await?;
        if job.status == movement.to || movement.settled.contains(&job.status) {
            return Ok(StepOutcome::AlreadyApplied);
        }
        if !movement.from.contains(&job.status) {
            return Err(WorkflowError::ConflictingState(format!(
                "job '{}' is {} and cannot move to {}",
                job.id,
                job.status.as_str(),
                movement.to.as_str()
            )));
        }

        let matched = self
            .store()
            .update(
                Collection::Jobs,
                &Filter::by_id(job_id).is_in(Field::Status, movement.from.iter().copied()),
                &Patch::new().status(movement.to),
                &guards,
            )
            .await?;
        if matched > 0 {
            return Ok(StepOutcome::Applied);
        }

        let current = self.records.job(job_id).await?;
        if current.status == movement.to {
            return Ok(StepOutcome::AlreadyApplied);
        }
        Err(WorkflowError::ConflictingState(format!(
            "job '{}' ({}) did not move to {}: a concurrent change won",
            job_id,
            current.status.as_str(),
            movement.to.as_str()
        )))
    }

    async fn set_transaction_status(
        &self,
        transaction_id: &str,
        from: &[TransactionStatus],
        to: TransactionStatus,
    ) -> Result<StepOutcome, WorkflowError> {
        let matched = self
            .store()
            .update(
                Collection::Transactions,
                &Filter::by_id(transaction_id).is_in(Field::Status, from.iter().copied()),
                &Patch::new().status(to),
                &[],
            )
            .await?;
        if matched > 0 {
            return Ok(StepOutcome::Applied);
        }

        let current = self.records.transaction(transaction_id).await?;
        if current.status == to {
            return Ok(StepOutcome::AlreadyApplied);
        }
        Err(WorkflowError::ConflictingState(format!(
            "transaction '{}' became {} before it could be marked {}",
            transaction_id,
            current.status.as_str(),
            to.as_str()
        )))
    }

    async fn insert_transaction(
        &self,
        job: &JobRecord,
        bid: &BidRecord,
        amount_minor: i64,
        commission_minor: i64,
    ) -> Result<(TransactionRecord, StepOutcome), WorkflowError> {
        let mut record = TransactionRecord::pending(
            &job.id,
            Some(bid.id.clone()),
            amount_minor,
            commission_minor,
            self.config.commission.bps(),
        );
        if let Some(latest) = self.records.transactions_for_job(&job.id).await?.last() {
            record = record.created_after(latest.created_at);
        }
        let guards = [
            no_pending_transaction(&job.id),
            Guard::exists(
                Collection::Jobs,
                Filter::by_id(job.id.as_str()).eq(Field::Status, JobStatus::Assigned),
            ),
            bid_accepted(&job.id, &bid.id),
        ];

        match self
            .store()
            .insert(Row::Transaction(record), &guards)
            .await
        {
            Ok(Row::Transaction(tx)) => Ok((tx, StepOutcome::Applied)),
            Ok(other) => Err(WorkflowError::StoreFailure(format!(
                "insert returned a {} row",
                other.collection()
            ))),
            Err(StorageError::Conflict(reason)) => {
                // A concurrent create may have won; hand back its transaction.
                match self
                    .records
                    .pending_transactions(&job.id)
                    .await?
                    .into_iter()
                    .next()
                {
                    Some(winner) => Ok((winner, StepOutcome::AlreadyApplied)),
                    None => Err(WorkflowError::ConflictingState(format!(
                        "transaction for job '{}' rejected: {reason}",
                        job.id
                    ))),
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn sync_job_status(&self, job_id: &str) -> Result<StepOutcome, WorkflowError> {
        let job = self.records.job(job_id).await?;
        let transactions = self.records.transactions_for_job(job_id).await?;
        let pending = transactions
            .iter()
            .find(|tx| tx.status == TransactionStatus::Pending);

        let (target, guard) = match (pending, transactions.last()) {
            (Some(tx), _) => (
                JobStatus::PaymentPending,
                transaction_in(job_id, &tx.id, TransactionStatus::Pending),
            ),
            (None, Some(latest)) if latest.status == TransactionStatus::Completed => (
                JobStatus::Completed,
                transaction_in(job_id, &latest.id, TransactionStatus::Completed),
            ),
            _ => (JobStatus::Assigned, no_pending_transaction(job_id)),
        };

        if job.status == target {
            return Ok(StepOutcome::AlreadyApplied);
        }
        if job.status == JobStatus::Cancelled {
            return Err(WorkflowError::ConflictingState(format!(
                "job '{}' is cancelled; refusing to move it to {}",
                job.id,
                target.as_str()
            )));
        }

        let matched = self
            .store()
            .update(
                Collection::Jobs,
                &Filter::by_id(job_id).eq(Field::Status, job.status),
                &Patch::new().status(target),
                &[guard],
            )
            .await?;
        if matched == 0 {
            return Err(WorkflowError::ConflictingState(format!(
                "job '{}' changed during reconciliation",
                job.id
            )));
        }
        info!(
            job_id,
            from = job.status.as_str(),
            to = target.as_str(),
            "job status repaired"
        );
        Ok(StepOutcome::Applied)
    }
}
