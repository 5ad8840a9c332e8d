//! Typed reads over the entity store.

use crate::error::{EntitySnapshot, WorkflowError};
use marketflow_storage::{
    BidRecord, BidStatus, Collection, EntityStore, Field, Filter, JobRecord, Row,
    TransactionRecord, TransactionStatus,
};
use std::sync::Arc;

fn wrong_collection(expected: Collection, row: &Row) -> WorkflowError {
    WorkflowError::StoreFailure(format!(
        "store returned a {} row where {} was expected",
        row.collection(),
        expected
    ))
}

fn into_jobs(rows: Vec<Row>) -> Result<Vec<JobRecord>, WorkflowError> {
    rows.into_iter()
        .map(|row| match row {
            Row::Job(job) => Ok(job),
            other => Err(wrong_collection(Collection::Jobs, &other)),
        })
        .collect()
}

fn into_bids(rows: Vec<Row>) -> Result<Vec<BidRecord>, WorkflowError> {
    rows.into_iter()
        .map(|row| match row {
            Row::Bid(bid) => Ok(bid),
            other => Err(wrong_collection(Collection::Bids, &other)),
        })
        .collect()
}

fn into_transactions(rows: Vec<Row>) -> Result<Vec<TransactionRecord>, WorkflowError> {
    rows.into_iter()
        .map(|row| match row {
            Row::Transaction(tx) => Ok(tx),
            other => Err(wrong_collection(Collection::Transactions, &other)),
        })
        .collect()
}

/// Read helper shared by the bid manager and the orchestrator.
#[derive(Clone)]
pub(crate) struct Records {
    store: Arc<dyn EntityStore>,
}

impl Records {
    pub(crate) fn new(store: Arc<dyn EntityStore>) -> Self {
        Self { store }
    }

    pub(crate) fn store(&self) -> &dyn EntityStore {
        self.store.as_ref()
    }

    pub(crate) async fn job(&self, id: &str) -> Result<JobRecord, WorkflowError> {
        match self.store.get_by_id(Collection::Jobs, id).await? {
            Some(Row::Job(job)) => Ok(job),
            Some(other) => Err(wrong_collection(Collection::Jobs, &other)),
            None => Err(WorkflowError::missing("job", id)),
        }
    }

    pub(crate) async fn bid(&self, id: &str) -> Result<BidRecord, WorkflowError> {
        self.find_bid(id)
            .await?
            .ok_or_else(|| WorkflowError::missing("bid", id))
    }

    pub(crate) async fn find_bid(&self, id: &str) -> Result<Option<BidRecord>, WorkflowError> {
        match self.store.get_by_id(Collection::Bids, id).await? {
            Some(Row::Bid(bid)) => Ok(Some(bid)),
            Some(other) => Err(wrong_collection(Collection::Bids, &other)),
            None => Ok(None),
        }
    }

    pub(crate) async fn transaction(&self, id: &str) -> Result<TransactionRecord, WorkflowError> {
        match self.store.get_by_id(Collection::Transactions, id).await? {
            Some(Row::Transaction(tx)) => Ok(tx),
            Some(other) => Err(wrong_collection(Collection::Transactions, &other)),
            None => Err(WorkflowError::missing("transaction", id)),
        }
    }

    pub(crate) async fn jobs(&self, filter: &Filter) -> Result<Vec<JobRecord>, WorkflowError> {
        into_jobs(self.store.get_by_filter(Collection::Jobs, filter).await?)
    }

    pub(crate) async fn bids(&self, filter: &Filter) -> Result<Vec<BidRecord>, WorkflowError> {
        into_bids(self.store.get_by_filter(Collection::Bids, filter).await?)
    }

    pub(crate) async fn transactions(
        &self,
        filter: &Filter,
    ) -> Result<Vec<TransactionRecord>, WorkflowError> {
        into_transactions(
            self.store
                .get_by_filter(Collection::Transactions, filter)
                .await?,
        )
    }

    pub(crate) async fn bids_for_job(&self, job_id: &str) -> Result<Vec<BidRecord>, WorkflowError> {
        self.bids(&Filter::new().eq(Field::JobId, job_id)).await
    }

    pub(crate) async fn accepted_bid(
        &self,
        job_id: &str,
    ) -> Result<Option<BidRecord>, WorkflowError> {
        let accepted = self
            .bids(
                &Filter::new()
                    .eq(Field::JobId, job_id)
                    .eq(Field::Status, BidStatus::Accepted),
            )
            .await?;
        Ok(accepted.into_iter().next())
    }

    /// Transactions of `job_id`, oldest first.
    pub(crate) async fn transactions_for_job(
        &self,
        job_id: &str,
    ) -> Result<Vec<TransactionRecord>, WorkflowError> {
        self.transactions(&Filter::new().eq(Field::JobId, job_id))
            .await
    }

    pub(crate) async fn pending_transactions(
        &self,
        job_id: &str,
    ) -> Result<Vec<TransactionRecord>, WorkflowError> {
        self.transactions(
            &Filter::new()
                .eq(Field::JobId, job_id)
                .eq(Field::Status, TransactionStatus::Pending),
        )
        .await
    }

    /// Best-effort view of everything hanging off `job_id`.
    ///
    /// Read failures leave the corresponding part empty; the snapshot is
    /// diagnostic only.
    pub(crate) async fn snapshot(&self, job_id: &str) -> EntitySnapshot {
        EntitySnapshot {
            job: self.job(job_id).await.ok(),
            bids: self.bids_for_job(job_id).await.unwrap_or_default(),
            transactions: self.transactions_for_job(job_id).await.unwrap_or_default(),
        }
    }
}
