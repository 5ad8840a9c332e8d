//! In-memory reference implementation of the entity store.
//!
//! A single lock spans all three collections, so guarded writes are
//! trivially atomic. Production deployments should use the PostgreSQL
//! adapter.

use crate::filter::{Filter, Guard, Patch};
use crate::model::{Collection, Row};
use crate::traits::EntityStore;
use crate::{StorageError, StorageResult};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Debug, Default)]
struct Tables {
    jobs: HashMap<String, Row>,
    bids: HashMap<String, Row>,
    transactions: HashMap<String, Row>,
}

impl Tables {
    fn table(&self, collection: Collection) -> &HashMap<String, Row> {
        match collection {
            Collection::Jobs => &self.jobs,
            Collection::Bids => &self.bids,
            Collection::Transactions => &self.transactions,
        }
    }

    fn table_mut(&mut self, collection: Collection) -> &mut HashMap<String, Row> {
        match collection {
            Collection::Jobs => &mut self.jobs,
            Collection::Bids => &mut self.bids,
            Collection::Transactions => &mut self.transactions,
        }
    }

    fn count_matching(&self, collection: Collection, filter: &Filter) -> usize {
        self.table(collection)
            .values()
            .filter(|row| filter.matches(row))
            .count()
    }

    fn guards_hold(&self, guards: &[Guard]) -> bool {
        guards
            .iter()
            .all(|guard| guard.holds(self.count_matching(guard.collection, &guard.filter)))
    }

    fn check_references(&self, row: &Row) -> StorageResult<()> {
        let job_id = match row {
            Row::Job(_) => return Ok(()),
            Row::Bid(bid) => &bid.job_id,
            Row::Transaction(tx) => &tx.job_id,
        };
        if self.jobs.contains_key(job_id) {
            Ok(())
        } else {
            Err(StorageError::ConstraintViolation(format!(
                "{} row references unknown job {}",
                row.collection(),
                job_id
            )))
        }
    }
}

/// In-memory entity store adapter.
#[derive(Debug, Default)]
pub struct InMemoryEntityStore {
    tables: RwLock<Tables>,
}

impl InMemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EntityStore for InMemoryEntityStore {
    async fn get_by_id(&self, collection: Collection, id: &str) -> StorageResult<Option<Row>> {
        let guard = self
            .tables
            .read()
            .map_err(|_| StorageError::Backend("entity tables lock poisoned".to_string()))?;
        Ok(guard.table(collection).get(id).cloned())
    }

    async fn get_by_filter(
        &self,
        collection: Collection,
        filter: &Filter,
    ) -> StorageResult<Vec<Row>> {
        let guard = self
            .tables
            .read()
            .map_err(|_| StorageError::Backend("entity tables lock poisoned".to_string()))?;
        let mut rows = guard
            .table(collection)
            .values()
            .filter(|row| filter.matches(row))
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by(|a, b| {
            a.created_at()
                .cmp(&b.created_at())
                .then_with(|| a.id().cmp(b.id()))
        });
        Ok(rows)
    }

    async fn insert(&self, row: Row, guards: &[Guard]) -> StorageResult<Row> {
        row.validate()?;
        let mut guard = self
            .tables
            .write()
            .map_err(|_| StorageError::Backend("entity tables lock poisoned".to_string()))?;

        guard.check_references(&row)?;
        if !guard.guards_hold(guards) {
            let rendered = guards
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            return Err(StorageError::Conflict(format!(
                "insert guard rejected: {rendered}"
            )));
        }

        let collection = row.collection();
        let table = guard.table_mut(collection);
        if table.contains_key(row.id()) {
            return Err(StorageError::Conflict(format!(
                "{} row {} already exists",
                collection,
                row.id()
            )));
        }
        table.insert(row.id().to_string(), row.clone());
        Ok(row)
    }

    async fn update(
        &self,
        collection: Collection,
        filter: &Filter,
        patch: &Patch,
        guards: &[Guard],
    ) -> StorageResult<u64> {
        if patch.is_empty() {
            return Err(StorageError::InvalidInput("empty patch".to_string()));
        }
        let mut guard = self
            .tables
            .write()
            .map_err(|_| StorageError::Backend("entity tables lock poisoned".to_string()))?;

        if !guard.guards_hold(guards) {
            return Ok(0);
        }

        // Apply to copies first so a constraint failure leaves the table untouched.
        let now = Utc::now();
        let mut patched = Vec::new();
        for row in guard.table(collection).values() {
            if filter.matches(row) {
                let mut copy = row.clone();
                copy.apply(patch, now)?;
                patched.push(copy);
            }
        }

        let table = guard.table_mut(collection);
        let matched = patched.len() as u64;
        for row in patched {
            table.insert(row.id().to_string(), row);
        }
        Ok(matched)
    }

    async fn delete(&self, collection: Collection, filter: &Filter) -> StorageResult<u64> {
        let mut guard = self
            .tables
            .write()
            .map_err(|_| StorageError::Backend("entity tables lock poisoned".to_string()))?;
        let table = guard.table_mut(collection);
        let before = table.len();
        table.retain(|_, row| !filter.matches(row));
        Ok((before - table.len()) as u64)
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
