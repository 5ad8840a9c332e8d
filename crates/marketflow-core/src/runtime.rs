use crate::bids::BidLifecycleManager;
use crate::config::{EngineConfig, StoreConfig, WorkflowConfig};
use crate::error::WorkflowError;
use crate::workflow::WorkflowOrchestrator;
use marketflow_storage::memory::InMemoryEntityStore;
use marketflow_storage::EntityStore;
use std::sync::Arc;
use tracing::info;

/// Store plus the two managers that operate on it.
#[derive(Clone)]
pub struct MarketEngine {
    store: Arc<dyn EntityStore>,
    bids: BidLifecycleManager,
    workflow: WorkflowOrchestrator,
}

impl MarketEngine {
    /// Build the configured store backend and wire the managers onto it.
    pub async fn bootstrap(config: EngineConfig) -> Result<Self, WorkflowError> {
        let store = open_store(&config.store).await?;
        info!(
            backend = store.backend(),
            commission_rate_bps = config.workflow.commission.bps(),
            "market engine ready"
        );
        Ok(Self::with_store(store, config.workflow))
    }

    /// Wire the managers onto an existing store (tests, fault injection).
    pub fn with_store(store: Arc<dyn EntityStore>, workflow: WorkflowConfig) -> Self {
        Self {
            bids: BidLifecycleManager::new(Arc::clone(&store)),
            workflow: WorkflowOrchestrator::new(Arc::clone(&store), workflow),
            store,
        }
    }

    pub fn in_memory() -> Self {
        Self::with_store(Arc::new(InMemoryEntityStore::new()), WorkflowConfig::default())
    }

    pub fn bids(&self) -> &BidLifecycleManager {
        &self.bids
    }

    pub fn workflow(&self) -> &WorkflowOrchestrator {
        &self.workflow
    }

    pub fn store(&self) -> Arc<dyn EntityStore> {
        Arc::clone(&self.store)
    }

    pub fn backend_label(&self) -> &'static str {
        self.store.backend()
    }
}

async fn open_store(config: &StoreConfig) -> Result<Arc<dyn EntityStore>, WorkflowError> {
    match config {
        StoreConfig::Memory => Ok(Arc::new(InMemoryEntityStore::new())),
        #[cfg(feature = "postgres")]
        StoreConfig::Postgres {
            database_url,
            max_connections,
        } => {
            let store = marketflow_storage::postgres::PostgresEntityStore::connect(
                database_url,
                *max_connections,
            )
            .await?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "postgres"))]
        StoreConfig::Postgres { .. } => Err(WorkflowError::InvalidInput(
            "postgres storage requested but marketflow-core was built without the 'postgres' feature"
                .to_string(),
        )),
    }
}
