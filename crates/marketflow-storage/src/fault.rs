//! Deterministic fault-injecting store wrapper for chaos testing.
//!
//! Wraps any [`EntityStore`] and fails selected calls with
//! `StorageError::Backend`, leaving every other call untouched. Rules are
//! matched on operation, collection and the 1-based ordinal of matching calls.

use crate::filter::{Filter, Guard, Patch};
use crate::model::{Collection, Row};
use crate::traits::EntityStore;
use crate::{StorageError, StorageResult};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    GetById,
    GetByFilter,
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone)]
struct FaultRule {
    op: StoreOp,
    collection: Collection,
    nth: usize,
    seen: usize,
    fired: bool,
}

/// Store wrapper that fails the `nth` matching call of configured rules.
pub struct FaultInjectingStore {
    inner: Arc<dyn EntityStore>,
    rules: Mutex<Vec<FaultRule>>,
}

impl FaultInjectingStore {
    pub fn new(inner: Arc<dyn EntityStore>) -> Self {
        Self {
            inner,
            rules: Mutex::new(Vec::new()),
        }
    }

    /// Fail the `nth` (1-based) `op` call against `collection`. Each rule fires once.
    pub fn fail_on(self, op: StoreOp, collection: Collection, nth: usize) -> Self {
        self.arm(op, collection, nth);
        self
    }

    /// Add a rule to an already shared wrapper.
    pub fn arm(&self, op: StoreOp, collection: Collection, nth: usize) {
        if let Ok(mut rules) = self.rules.lock() {
            rules.push(FaultRule {
                op,
                collection,
                nth: nth.max(1),
                seen: 0,
                fired: false,
            });
        }
    }

    /// Drop every pending rule, e.g. before a retry in a test.
    pub fn disarm(&self) {
        if let Ok(mut rules) = self.rules.lock() {
            rules.clear();
        }
    }

    fn check(&self, op: StoreOp, collection: Collection) -> StorageResult<()> {
        let mut rules = self
            .rules
            .lock()
            .map_err(|_| StorageError::Backend("fault rules lock poisoned".to_string()))?;
        for rule in rules.iter_mut() {
            if rule.fired || rule.op != op || rule.collection != collection {
                continue;
            }
            rule.seen += 1;
            if rule.seen == rule.nth {
                rule.fired = true;
                return Err(StorageError::Backend(format!(
                    "injected fault on {:?} {} call #{}",
                    op, collection, rule.nth
                )));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl EntityStore for FaultInjectingStore {
    async fn get_by_id(&self, collection: Collection, id: &str) -> StorageResult<Option<Row>> {
        self.check(StoreOp::GetById, collection)?;
        self.inner.get_by_id(collection, id).await
    }

    async fn get_by_filter(
        &self,
        collection: Collection,
        filter: &Filter,
    ) -> StorageResult<Vec<Row>> {
        self.check(StoreOp::GetByFilter, collection)?;
        self.inner.get_by_filter(collection, filter).await
    }

    async fn insert(&self, row: Row, guards: &[Guard]) -> StorageResult<Row> {
        self.check(StoreOp::Insert, row.collection())?;
        self.inner.insert(row, guards).await
    }

    async fn update(
        &self,
        collection: Collection,
        filter: &Filter,
        patch: &Patch,
        guards: &[Guard],
    ) -> StorageResult<u64> {
        self.check(StoreOp::Update, collection)?;
        self.inner.update(collection, filter, patch, guards).await
    }

    async fn delete(&self, collection: Collection, filter: &Filter) -> StorageResult<u64> {
        self.check(StoreOp::Delete, collection)?;
        self.inner.delete(collection, filter).await
    }

    fn backend(&self) -> &'static str {
        self.inner.backend()
    }
}
