//! Predicates, patches, and write guards for the entity store contract.

use crate::model::{BidStatus, Collection, JobStatus, Row, TransactionStatus};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Filterable / patchable columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Id,
    JobId,
    CustomerId,
    ProviderId,
    Status,
    Price,
}

impl Field {
    pub fn column(self) -> &'static str {
        match self {
            Self::Id => "id",
            Self::JobId => "job_id",
            Self::CustomerId => "customer_id",
            Self::ProviderId => "provider_id",
            Self::Status => "status",
            Self::Price => "price_minor",
        }
    }
}

/// Scalar value compared or written by the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Text(String),
    Int(i64),
}

impl FieldValue {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(value) => f.write_str(value),
            Self::Int(value) => write!(f, "{value}"),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&String> for FieldValue {
    fn from(value: &String) -> Self {
        Self::Text(value.clone())
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<JobStatus> for FieldValue {
    fn from(value: JobStatus) -> Self {
        Self::text(value.as_str())
    }
}

impl From<BidStatus> for FieldValue {
    fn from(value: BidStatus) -> Self {
        Self::text(value.as_str())
    }
}

impl From<TransactionStatus> for FieldValue {
    fn from(value: TransactionStatus) -> Self {
        Self::text(value.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Clause {
    Eq(Field, FieldValue),
    Ne(Field, FieldValue),
    In(Field, Vec<FieldValue>),
}

impl Clause {
    /// SQL-like semantics: a clause over a column the row lacks never matches.
    pub fn matches(&self, row: &Row) -> bool {
        match self {
            Self::Eq(field, value) => row.field(*field).as_ref() == Some(value),
            Self::Ne(field, value) => row
                .field(*field)
                .map(|actual| &actual != value)
                .unwrap_or(false),
            Self::In(field, values) => row
                .field(*field)
                .map(|actual| values.contains(&actual))
                .unwrap_or(false),
        }
    }
}

impl fmt::Display for Clause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Eq(field, value) => write!(f, "{}={}", field.column(), value),
            Self::Ne(field, value) => write!(f, "{}!={}", field.column(), value),
            Self::In(field, values) => {
                let joined = values
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("|");
                write!(f, "{} in ({})", field.column(), joined)
            }
        }
    }
}

/// Conjunction of clauses. An empty filter matches every row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    clauses: Vec<Clause>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn by_id(id: impl Into<FieldValue>) -> Self {
        Self::new().eq(Field::Id, id)
    }

    pub fn eq(mut self, field: Field, value: impl Into<FieldValue>) -> Self {
        self.clauses.push(Clause::Eq(field, value.into()));
        self
    }

    pub fn ne(mut self, field: Field, value: impl Into<FieldValue>) -> Self {
        self.clauses.push(Clause::Ne(field, value.into()));
        self
    }

    pub fn is_in<V: Into<FieldValue>>(
        mut self,
        field: Field,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        self.clauses.push(Clause::In(
            field,
            values.into_iter().map(Into::into).collect(),
        ));
        self
    }

    pub fn clauses(&self) -> &[Clause] {
        &self.clauses
    }

    pub fn matches(&self, row: &Row) -> bool {
        self.clauses.iter().all(|clause| clause.matches(row))
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.clauses.is_empty() {
            return f.write_str("*");
        }
        let rendered = self
            .clauses
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" & ");
        f.write_str(&rendered)
    }
}

/// Column assignments applied by `update`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    sets: Vec<(Field, FieldValue)>,
}

impl Patch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, field: Field, value: impl Into<FieldValue>) -> Self {
        self.sets.push((field, value.into()));
        self
    }

    pub fn status(self, status: impl Into<FieldValue>) -> Self {
        self.set(Field::Status, status)
    }

    pub fn price(self, price_minor: i64) -> Self {
        self.set(Field::Price, price_minor)
    }

    pub fn sets(&self) -> &[(Field, FieldValue)] {
        &self.sets
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardExpectation {
    Exists,
    Absent,
}

/// Condition evaluated atomically with a write.
///
/// A guarded `update` that fails its guard matches zero rows; a guarded
/// `insert` fails with `StorageError::Conflict`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Guard {
    pub collection: Collection,
    pub filter: Filter,
    pub expectation: GuardExpectation,
}

impl Guard {
    pub fn exists(collection: Collection, filter: Filter) -> Self {
        Self {
            collection,
            filter,
            expectation: GuardExpectation::Exists,
        }
    }

    pub fn absent(collection: Collection, filter: Filter) -> Self {
        Self {
            collection,
            filter,
            expectation: GuardExpectation::Absent,
        }
    }

    /// Evaluate against the number of rows currently matching `filter`.
    pub fn holds(&self, matching: usize) -> bool {
        match self.expectation {
            GuardExpectation::Exists => matching > 0,
            GuardExpectation::Absent => matching == 0,
        }
    }

    /// Serialization key shared by every guard scoped to the same rows.
    ///
    /// Only equality clauses contribute, so `jobs:id=J & status=open` and
    /// `bids:job_id=J & status=accepted` both lock on the job id.
    pub fn lock_key(&self) -> String {
        let scope = self
            .filter
            .clauses()
            .iter()
            .find_map(|clause| match clause {
                Clause::Eq(Field::Id, value) if self.collection == Collection::Jobs => {
                    Some(value.to_string())
                }
                Clause::Eq(Field::JobId, value) => Some(value.to_string()),
                _ => None,
            })
            .unwrap_or_else(|| self.filter.to_string());
        format!("marketflow:job:{scope}")
    }
}

impl fmt::Display for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let expectation = match self.expectation {
            GuardExpectation::Exists => "exists",
            GuardExpectation::Absent => "absent",
        };
        write!(f, "{} {}[{}]", expectation, self.collection, self.filter)
    }
}
