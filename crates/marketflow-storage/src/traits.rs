use crate::filter::{Filter, Guard, Patch};
use crate::model::{Collection, Row};
use crate::StorageResult;
use async_trait::async_trait;

/// Per-row CRUD contract over jobs, bids, and transactions.
///
/// Every call is atomic at single-statement granularity only; callers that
/// need multi-row consistency must sequence calls themselves. Guards are the
/// one exception: they are evaluated atomically with the write they
/// accompany.
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn get_by_id(&self, collection: Collection, id: &str) -> StorageResult<Option<Row>>;

    /// Rows matching `filter`, oldest first by `created_at`, ties broken by id.
    /// Callers that read the last row as "latest" must give rows distinct
    /// creation times.
    async fn get_by_filter(&self, collection: Collection, filter: &Filter)
        -> StorageResult<Vec<Row>>;

    /// Insert `row` into its collection if every guard holds.
    async fn insert(&self, row: Row, guards: &[Guard]) -> StorageResult<Row>;

    /// Bulk update; returns the number of rows matched. A failed guard matches zero rows.
    async fn update(
        &self,
        collection: Collection,
        filter: &Filter,
        patch: &Patch,
        guards: &[Guard],
    ) -> StorageResult<u64>;

    async fn delete(&self, collection: Collection, filter: &Filter) -> StorageResult<u64>;

    /// Short backend label for health output.
    fn backend(&self) -> &'static str;
}
