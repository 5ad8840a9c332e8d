//! Property tests: arbitrary operation sequences never break the per-job
//! cardinality rules, and job status always matches what the bid and
//! transaction rows imply.

use marketflow_core::storage::{BidStatus, JobStatus, TransactionStatus};
use marketflow_core::{Identity, MarketEngine, TransactionSource};
use proptest::prelude::*;

#[derive(Debug, Clone, Copy)]
enum MarketOp {
    Place(i64),
    Accept(usize),
    Reject(usize),
    Create,
    Cancel(usize),
    Refund(usize),
    Complete(usize),
}

fn op_strategy() -> impl Strategy<Value = Vec<MarketOp>> {
    proptest::collection::vec(
        prop_oneof![
            (-5i64..500).prop_map(MarketOp::Place),
            (0usize..8).prop_map(MarketOp::Accept),
            (0usize..8).prop_map(MarketOp::Reject),
            Just(MarketOp::Create),
            (0usize..4).prop_map(MarketOp::Cancel),
            (0usize..4).prop_map(MarketOp::Refund),
            (0usize..4).prop_map(MarketOp::Complete),
        ],
        1..40,
    )
}

fn expected_job_status(
    bids: &[marketflow_core::storage::BidRecord],
    txs: &[marketflow_core::storage::TransactionRecord],
) -> JobStatus {
    if !bids.iter().any(|bid| bid.status == BidStatus::Accepted) {
        return JobStatus::Open;
    }
    if txs.iter().any(|tx| tx.status == TransactionStatus::Pending) {
        return JobStatus::PaymentPending;
    }
    match txs.last().map(|tx| tx.status) {
        Some(TransactionStatus::Completed) => JobStatus::Completed,
        _ => JobStatus::Assigned,
    }
}

proptest! {
    #[test]
    fn property_job_state_never_diverges(ops in op_strategy()) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime");

        rt.block_on(async move {
            let engine = MarketEngine::in_memory();
            let customer = Identity::customer("cust-prop");
            let job = engine
                .workflow()
                .open_job(&customer, "property job")
                .await
                .unwrap();

            for (step, op) in ops.into_iter().enumerate() {
                let bids = engine.bids().list_bids(&customer, &job.id).await.unwrap();
                let txs = engine
                    .workflow()
                    .list_transactions(&customer, &job.id)
                    .await
                    .unwrap();
                let pick_bid = |idx: usize| bids.get(idx % bids.len().max(1)).map(|bid| bid.id.clone());
                let pick_tx = |idx: usize| txs.get(idx % txs.len().max(1)).map(|tx| tx.id.clone());

                // Errors are expected for many ops; only the resulting state matters.
                let _ = match op {
                    MarketOp::Place(price) => {
                        let provider = Identity::provider(format!("prov-{step}"));
                        engine.bids().place_bid(&provider, &job.id, price).await.map(|_| ())
                    }
                    MarketOp::Accept(idx) => match pick_bid(idx) {
                        Some(bid_id) => engine.workflow().accept_bid(&customer, &bid_id).await.map(|_| ()),
                        None => Ok(()),
                    },
                    MarketOp::Reject(idx) => match pick_bid(idx) {
                        Some(bid_id) => engine.workflow().reject_bid(&customer, &bid_id).await.map(|_| ()),
                        None => Ok(()),
                    },
                    MarketOp::Create => engine
                        .workflow()
                        .create_transaction(&customer, TransactionSource::Job(job.id.clone()), None)
                        .await
                        .map(|_| ()),
                    MarketOp::Cancel(idx) => match pick_tx(idx) {
                        Some(tx_id) => engine.workflow().cancel_transaction(&customer, &tx_id).await.map(|_| ()),
                        None => Ok(()),
                    },
                    MarketOp::Refund(idx) => match pick_tx(idx) {
                        Some(tx_id) => engine.workflow().refund_transaction(&customer, &tx_id).await.map(|_| ()),
                        None => Ok(()),
                    },
                    MarketOp::Complete(idx) => match pick_tx(idx) {
                        Some(tx_id) => engine.workflow().complete_transaction(&customer, &tx_id).await.map(|_| ()),
                        None => Ok(()),
                    },
                };

                let bids = engine.bids().list_bids(&customer, &job.id).await.unwrap();
                let txs = engine
                    .workflow()
                    .list_transactions(&customer, &job.id)
                    .await
                    .unwrap();

                let accepted = bids.iter().filter(|bid| bid.status == BidStatus::Accepted).count();
                let pending = txs.iter().filter(|tx| tx.status == TransactionStatus::Pending).count();
                assert!(accepted <= 1, "{accepted} accepted bids");
                assert!(pending <= 1, "{pending} pending transactions");
                assert!(bids.iter().all(|bid| bid.price_minor > 0));
                for tx in &txs {
                    let charged = bids.iter().find(|bid| Some(&bid.id) == tx.bid_id.as_ref());
                    if let Some(bid) = charged {
                        assert_eq!(tx.gross_minor(), bid.price_minor);
                    }
                }

                let job_now = engine
                    .workflow()
                    .reconcile_job(&Identity::admin("auditor"), &job.id)
                    .await
                    .unwrap();
                assert!(!job_now.changed_state(), "reconcile had to repair after {op:?}");
                assert_eq!(
                    job_now.job().map(|job| job.status),
                    Some(expected_job_status(&bids, &txs))
                );
            }
        });
    }
}
