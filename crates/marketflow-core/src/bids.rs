use crate::error::WorkflowError;
use crate::gate::Identity;
use crate::policy::{authorize, Action, Resource};
use crate::records::Records;
use marketflow_storage::{
    BidRecord, BidStatus, Collection, EntityStore, Field, Filter, Guard, JobStatus, Patch, Row,
    StorageError,
};
use std::sync::Arc;
use tracing::{info, instrument};

/// Creates, edits, withdraws, and lists bids.
///
/// Status transitions beyond `pending` belong to the workflow orchestrator.
#[derive(Clone)]
pub struct BidLifecycleManager {
    records: Records,
}

impl BidLifecycleManager {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self {
            records: Records::new(store),
        }
    }

    /// Place a pending bid on an open job.
    #[instrument(skip(self, identity), fields(user_id = %identity.user_id))]
    pub async fn place_bid(
        &self,
        identity: &Identity,
        job_id: &str,
        price_minor: i64,
    ) -> Result<BidRecord, WorkflowError> {
        if price_minor <= 0 {
            return Err(WorkflowError::InvalidInput(format!(
                "bid price must be positive, got {price_minor}"
            )));
        }
        let job = self.records.job(job_id).await?;
        authorize(identity, &Resource::Job(&job), Action::PlaceBid)?;
        if job.status != JobStatus::Open {
            return Err(WorkflowError::ConflictingState(format!(
                "job '{}' is {} and no longer takes bids",
                job.id,
                job.status.as_str()
            )));
        }

        let bid = BidRecord::pending(&job.id, &identity.user_id, price_minor);
        // Bids racing an acceptance must not land after the job is decided.
        let guards = [
            Guard::exists(
                Collection::Jobs,
                Filter::by_id(job.id.as_str()).eq(Field::Status, JobStatus::Open),
            ),
            Guard::absent(
                Collection::Bids,
                Filter::new()
                    .eq(Field::JobId, job.id.as_str())
                    .eq(Field::Status, BidStatus::Accepted),
            ),
        ];
        let inserted = match self.records.store().insert(Row::Bid(bid), &guards).await {
            Ok(Row::Bid(bid)) => bid,
            Ok(other) => {
                return Err(WorkflowError::StoreFailure(format!(
                    "insert returned a {} row",
                    other.collection()
                )))
            }
            Err(StorageError::Conflict(_)) => {
                return Err(WorkflowError::ConflictingState(format!(
                    "job '{}' stopped taking bids",
                    job.id
                )))
            }
            Err(err) => return Err(err.into()),
        };

        info!(
            bid_id = %inserted.id,
            job_id = %inserted.job_id,
            price_minor = inserted.price_minor,
            "bid placed"
        );
        Ok(inserted)
    }

    /// Change the price of a pending bid owned by the caller.
    ///
    /// The write is conditioned on the bid still being pending, so an edit
    /// racing an acceptance either lands first (and the accepted price is the
    /// edited one) or matches zero rows.
    #[instrument(skip(self, identity), fields(user_id = %identity.user_id))]
    pub async fn update_bid(
        &self,
        identity: &Identity,
        bid_id: &str,
        new_price_minor: i64,
    ) -> Result<BidRecord, WorkflowError> {
        if new_price_minor <= 0 {
            return Err(WorkflowError::InvalidInput(format!(
                "bid price must be positive, got {new_price_minor}"
            )));
        }
        let bid = self.records.bid(bid_id).await?;
        let job = self.records.job(&bid.job_id).await?;
        authorize(identity, &Resource::Bid { bid: &bid, job: &job }, Action::UpdateBid)?;
        ensure_pending(&bid)?;

        let matched = self
            .records
            .store()
            .update(
                Collection::Bids,
                &owned_pending(&bid.id, &identity.user_id),
                &Patch::new().price(new_price_minor),
                &[],
            )
            .await?;
        if matched == 0 {
            return Err(self.classify_missed_write(&bid.id).await);
        }

        let updated = self.records.bid(&bid.id).await?;
        info!(
            bid_id = %updated.id,
            old_price_minor = bid.price_minor,
            new_price_minor = updated.price_minor,
            "bid price updated"
        );
        Ok(updated)
    }

    /// Delete a pending bid owned by the caller.
    #[instrument(skip(self, identity), fields(user_id = %identity.user_id))]
    pub async fn withdraw_bid(&self, identity: &Identity, bid_id: &str) -> Result<(), WorkflowError> {
        let bid = self.records.bid(bid_id).await?;
        let job = self.records.job(&bid.job_id).await?;
        authorize(identity, &Resource::Bid { bid: &bid, job: &job }, Action::WithdrawBid)?;
        ensure_pending(&bid)?;

        let deleted = self
            .records
            .store()
            .delete(Collection::Bids, &owned_pending(&bid.id, &identity.user_id))
            .await?;
        if deleted == 0 {
            return Err(self.classify_missed_write(&bid.id).await);
        }
        info!(bid_id = %bid.id, job_id = %bid.job_id, "bid withdrawn");
        Ok(())
    }

    /// Bids on `job_id`, oldest first.
    pub async fn list_bids(
        &self,
        identity: &Identity,
        job_id: &str,
    ) -> Result<Vec<BidRecord>, WorkflowError> {
        let job = self.records.job(job_id).await?;
        authorize(identity, &Resource::Job(&job), Action::ListBids)?;
        self.records.bids_for_job(&job.id).await
    }

    async fn classify_missed_write(&self, bid_id: &str) -> WorkflowError {
        match self.records.find_bid(bid_id).await {
            Ok(None) => WorkflowError::missing("bid", bid_id),
            Ok(Some(current)) => WorkflowError::ConflictingState(format!(
                "bid '{}' changed concurrently and is now {}",
                current.id,
                current.status.as_str()
            )),
            Err(err) => err,
        }
    }
}

fn owned_pending(bid_id: &str, provider_id: &str) -> Filter {
    Filter::by_id(bid_id)
        .eq(Field::ProviderId, provider_id)
        .eq(Field::Status, BidStatus::Pending)
}

fn ensure_pending(bid: &BidRecord) -> Result<(), WorkflowError> {
    if bid.status == BidStatus::Pending {
        Ok(())
    } else {
        Err(WorkflowError::ConflictingState(format!(
            "bid '{}' is {}; only pending bids can change",
            bid.id,
            bid.status.as_str()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use marketflow_storage::memory::InMemoryEntityStore;
    use marketflow_storage::JobRecord;

    async fn setup() -> (BidLifecycleManager, Arc<dyn EntityStore>, JobRecord) {
        let store: Arc<dyn EntityStore> = Arc::new(InMemoryEntityStore::new());
        let job = JobRecord::open("cust-1", "hang drywall");
        store.insert(Row::Job(job.clone()), &[]).await.unwrap();
        (BidLifecycleManager::new(store.clone()), store, job)
    }

    #[tokio::test]
    async fn non_positive_price_creates_nothing() {
        let (manager, store, job) = setup().await;
        for price in [0, -5] {
            let err = manager
                .place_bid(&Identity::provider("prov-1"), &job.id, price)
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidInput);
        }
        let bids = store
            .get_by_filter(Collection::Bids, &Filter::new())
            .await
            .unwrap();
        assert!(bids.is_empty());
    }

    #[tokio::test]
    async fn customers_cannot_place_bids() {
        let (manager, _store, job) = setup().await;
        let err = manager
            .place_bid(&Identity::customer("cust-1"), &job.id, 50)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
    }

    #[tokio::test]
    async fn bid_on_missing_job_is_not_found() {
        let (manager, _store, _job) = setup().await;
        let err = manager
            .place_bid(&Identity::provider("prov-1"), "nope", 50)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn owner_updates_price_while_pending() {
        let (manager, _store, job) = setup().await;
        let owner = Identity::provider("prov-1");
        let bid = manager.place_bid(&owner, &job.id, 120).await.unwrap();

        let updated = manager.update_bid(&owner, &bid.id, 95).await.unwrap();
        assert_eq!(updated.price_minor, 95);
        assert_eq!(updated.status, BidStatus::Pending);
    }

    #[tokio::test]
    async fn update_of_missing_bid_is_not_found() {
        let (manager, _store, _job) = setup().await;
        let err = manager
            .update_bid(&Identity::provider("prov-1"), "nope", 80)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn update_to_non_positive_price_keeps_the_row() {
        let (manager, store, job) = setup().await;
        let owner = Identity::provider("prov-1");
        let bid = manager.place_bid(&owner, &job.id, 120).await.unwrap();

        for price in [0, -40] {
            let err = manager.update_bid(&owner, &bid.id, price).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidInput);
        }
        let stored = store
            .get_by_id(Collection::Bids, &bid.id)
            .await
            .unwrap()
            .and_then(|row| row.into_bid())
            .unwrap();
        assert_eq!(stored.price_minor, 120);
        assert_eq!(stored, bid);
    }

    #[tokio::test]
    async fn update_of_decided_bid_conflicts() {
        let (manager, store, job) = setup().await;
        let owner = Identity::provider("prov-1");
        let bid = manager.place_bid(&owner, &job.id, 120).await.unwrap();
        store
            .update(
                Collection::Bids,
                &Filter::by_id(bid.id.as_str()),
                &Patch::new().status(BidStatus::Rejected),
                &[],
            )
            .await
            .unwrap();

        let err = manager.update_bid(&owner, &bid.id, 90).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConflictingState);
        assert!(manager.withdraw_bid(&owner, &bid.id).await.is_err());
    }

    #[tokio::test]
    async fn withdraw_removes_the_bid() {
        let (manager, _store, job) = setup().await;
        let owner = Identity::provider("prov-1");
        let bid = manager.place_bid(&owner, &job.id, 120).await.unwrap();

        let err = manager
            .withdraw_bid(&Identity::provider("prov-2"), &bid.id)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);

        manager.withdraw_bid(&owner, &bid.id).await.unwrap();
        let remaining = manager
            .list_bids(&Identity::customer("cust-1"), &job.id)
            .await
            .unwrap();
        assert!(remaining.is_empty());
    }
}
