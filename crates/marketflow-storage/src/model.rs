use crate::filter::{Field, FieldValue, Patch};
use crate::{StorageError, StorageResult};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// The three collections reachable through the entity store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Jobs,
    Bids,
    Transactions,
}

impl Collection {
    pub fn name(self) -> &'static str {
        match self {
            Self::Jobs => "jobs",
            Self::Bids => "bids",
            Self::Transactions => "transactions",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Job lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Open,
    Assigned,
    PaymentPending,
    Completed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Assigned => "assigned",
            Self::PaymentPending => "payment_pending",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> StorageResult<Self> {
        match value {
            "open" => Ok(Self::Open),
            "assigned" => Ok(Self::Assigned),
            "payment_pending" => Ok(Self::PaymentPending),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(StorageError::ConstraintViolation(format!(
                "unknown job status '{other}'"
            ))),
        }
    }
}

/// Bid status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BidStatus {
    Pending,
    Accepted,
    Rejected,
}

impl BidStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> StorageResult<Self> {
        match value {
            "pending" => Ok(Self::Pending),
            "accepted" => Ok(Self::Accepted),
            "rejected" => Ok(Self::Rejected),
            other => Err(StorageError::ConstraintViolation(format!(
                "unknown bid status '{other}'"
            ))),
        }
    }
}

/// Transaction status. Only `Pending` is non-terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Refunded,
    Cancelled,
    Completed,
}

impl TransactionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Refunded => "refunded",
            Self::Cancelled => "cancelled",
            Self::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> StorageResult<Self> {
        match value {
            "pending" => Ok(Self::Pending),
            "refunded" => Ok(Self::Refunded),
            "cancelled" => Ok(Self::Cancelled),
            "completed" => Ok(Self::Completed),
            other => Err(StorageError::ConstraintViolation(format!(
                "unknown transaction status '{other}'"
            ))),
        }
    }
}

/// A unit of work posted by a customer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub customer_id: String,
    pub title: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn open(customer_id: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            customer_id: customer_id.into(),
            title: title.into(),
            status: JobStatus::Open,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A provider's priced offer against a job. Prices are integral minor units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BidRecord {
    pub id: String,
    pub job_id: String,
    pub provider_id: String,
    pub price_minor: i64,
    pub status: BidStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BidRecord {
    pub fn pending(
        job_id: impl Into<String>,
        provider_id: impl Into<String>,
        price_minor: i64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            job_id: job_id.into(),
            provider_id: provider_id.into(),
            price_minor,
            status: BidStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Financial record created once a bid is accepted.
///
/// `amount_minor` and `commission_minor` are fixed at creation time together
/// with the rate that produced them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: String,
    pub job_id: String,
    pub bid_id: Option<String>,
    pub amount_minor: i64,
    pub commission_minor: i64,
    pub commission_rate_bps: u32,
    pub status: TransactionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TransactionRecord {
    pub fn pending(
        job_id: impl Into<String>,
        bid_id: Option<String>,
        amount_minor: i64,
        commission_minor: i64,
        commission_rate_bps: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            job_id: job_id.into(),
            bid_id,
            amount_minor,
            commission_minor,
            commission_rate_bps,
            status: TransactionStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    /// Push `created_at` past `previous` by at least one microsecond, the
    /// coarsest timestamp precision of any backend, so creation order stays
    /// total within a job.
    pub fn created_after(mut self, previous: DateTime<Utc>) -> Self {
        let floor = previous + Duration::microseconds(1);
        if self.created_at < floor {
            self.created_at = floor;
            self.updated_at = floor;
        }
        self
    }

    /// Price the transaction was derived from.
    pub fn gross_minor(&self) -> i64 {
        self.amount_minor + self.commission_minor
    }
}

/// A single row in one of the three collections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "collection", rename_all = "snake_case")]
pub enum Row {
    Job(JobRecord),
    Bid(BidRecord),
    Transaction(TransactionRecord),
}

impl Row {
    pub fn collection(&self) -> Collection {
        match self {
            Self::Job(_) => Collection::Jobs,
            Self::Bid(_) => Collection::Bids,
            Self::Transaction(_) => Collection::Transactions,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Job(job) => &job.id,
            Self::Bid(bid) => &bid.id,
            Self::Transaction(tx) => &tx.id,
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            Self::Job(job) => job.created_at,
            Self::Bid(bid) => bid.created_at,
            Self::Transaction(tx) => tx.created_at,
        }
    }

    pub fn into_job(self) -> Option<JobRecord> {
        match self {
            Self::Job(job) => Some(job),
            _ => None,
        }
    }

    pub fn into_bid(self) -> Option<BidRecord> {
        match self {
            Self::Bid(bid) => Some(bid),
            _ => None,
        }
    }

    pub fn into_transaction(self) -> Option<TransactionRecord> {
        match self {
            Self::Transaction(tx) => Some(tx),
            _ => None,
        }
    }

    /// Value of `field` for predicate evaluation, `None` when the collection has no such column.
    pub fn field(&self, field: Field) -> Option<FieldValue> {
        match (self, field) {
            (_, Field::Id) => Some(FieldValue::text(self.id())),
            (Self::Job(job), Field::CustomerId) => Some(FieldValue::text(&job.customer_id)),
            (Self::Job(job), Field::Status) => Some(FieldValue::text(job.status.as_str())),
            (Self::Bid(bid), Field::JobId) => Some(FieldValue::text(&bid.job_id)),
            (Self::Bid(bid), Field::ProviderId) => Some(FieldValue::text(&bid.provider_id)),
            (Self::Bid(bid), Field::Status) => Some(FieldValue::text(bid.status.as_str())),
            (Self::Bid(bid), Field::Price) => Some(FieldValue::Int(bid.price_minor)),
            (Self::Transaction(tx), Field::JobId) => Some(FieldValue::text(&tx.job_id)),
            (Self::Transaction(tx), Field::Status) => Some(FieldValue::text(tx.status.as_str())),
            _ => None,
        }
    }

    /// Check per-row schema constraints enforced on insert.
    pub fn validate(&self) -> StorageResult<()> {
        if self.id().trim().is_empty() {
            return Err(StorageError::ConstraintViolation(format!(
                "{} row requires a non-empty id",
                self.collection()
            )));
        }
        match self {
            Self::Job(job) if job.customer_id.trim().is_empty() => Err(
                StorageError::ConstraintViolation("job requires customer_id".to_string()),
            ),
            Self::Bid(bid) if bid.price_minor <= 0 => Err(StorageError::ConstraintViolation(
                format!("bid price must be positive, got {}", bid.price_minor),
            )),
            Self::Bid(bid) if bid.provider_id.trim().is_empty() => Err(
                StorageError::ConstraintViolation("bid requires provider_id".to_string()),
            ),
            Self::Transaction(tx) if tx.amount_minor < 0 || tx.commission_minor < 0 => {
                Err(StorageError::ConstraintViolation(format!(
                    "transaction amounts must be non-negative (amount={}, commission={})",
                    tx.amount_minor, tx.commission_minor
                )))
            }
            _ => Ok(()),
        }
    }

    /// Apply a patch in place and bump `updated_at`.
    pub fn apply(&mut self, patch: &Patch, updated_at: DateTime<Utc>) -> StorageResult<()> {
        for (field, value) in patch.sets() {
            match (&mut *self, field, value) {
                (Self::Job(job), Field::Status, FieldValue::Text(raw)) => {
                    job.status = JobStatus::parse(raw)?;
                }
                (Self::Bid(bid), Field::Status, FieldValue::Text(raw)) => {
                    bid.status = BidStatus::parse(raw)?;
                }
                (Self::Bid(bid), Field::Price, FieldValue::Int(price)) => {
                    if *price <= 0 {
                        return Err(StorageError::ConstraintViolation(format!(
                            "bid price must be positive, got {price}"
                        )));
                    }
                    bid.price_minor = *price;
                }
                (Self::Transaction(tx), Field::Status, FieldValue::Text(raw)) => {
                    tx.status = TransactionStatus::parse(raw)?;
                }
                (row, field, _) => {
                    return Err(StorageError::ConstraintViolation(format!(
                        "field '{}' is not writable on {}",
                        field.column(),
                        row.collection()
                    )));
                }
            }
        }

        match self {
            Self::Job(job) => job.updated_at = updated_at,
            Self::Bid(bid) => bid.updated_at = updated_at,
            Self::Transaction(tx) => tx.updated_at = updated_at,
        }
        Ok(())
    }
}
