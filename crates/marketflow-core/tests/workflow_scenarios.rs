use marketflow_core::storage::fault::{FaultInjectingStore, StoreOp};
use marketflow_core::storage::memory::InMemoryEntityStore;
use marketflow_core::storage::{
    BidRecord, BidStatus, Collection, Filter, JobRecord, JobStatus, Patch, Row,
    TransactionRecord, TransactionStatus,
};
use marketflow_core::{
    ClientQuote, ErrorKind, ExportFormat, Identity, MarketEngine, Operation, Step, StepOutcome,
    TransactionSource, WorkflowConfig,
};
use std::sync::Arc;

fn customer() -> Identity {
    Identity::customer("cust-1")
}

fn admin() -> Identity {
    Identity::admin("ops-1")
}

fn provider(n: usize) -> Identity {
    Identity::provider(format!("prov-{n}"))
}

async fn seed(engine: &MarketEngine, prices: &[i64]) -> (JobRecord, Vec<BidRecord>) {
    let job = engine
        .workflow()
        .open_job(&customer(), "replace water heater")
        .await
        .unwrap();
    let mut bids = Vec::new();
    for (idx, price) in prices.iter().enumerate() {
        let bid = engine
            .bids()
            .place_bid(&provider(idx + 1), &job.id, *price)
            .await
            .unwrap();
        bids.push(bid);
    }
    (job, bids)
}

async fn job_status(engine: &MarketEngine, id: &str) -> JobStatus {
    engine
        .store()
        .get_by_id(Collection::Jobs, id)
        .await
        .unwrap()
        .and_then(|row| row.into_job())
        .unwrap()
        .status
}

async fn bid(engine: &MarketEngine, id: &str) -> BidRecord {
    engine
        .store()
        .get_by_id(Collection::Bids, id)
        .await
        .unwrap()
        .and_then(|row| row.into_bid())
        .unwrap()
}

async fn tx_status(engine: &MarketEngine, id: &str) -> TransactionStatus {
    engine
        .store()
        .get_by_id(Collection::Transactions, id)
        .await
        .unwrap()
        .and_then(|row| row.into_transaction())
        .unwrap()
        .status
}

fn faulty_engine() -> (MarketEngine, Arc<FaultInjectingStore>) {
    let faults = Arc::new(FaultInjectingStore::new(Arc::new(InMemoryEntityStore::new())));
    let engine = MarketEngine::with_store(faults.clone(), WorkflowConfig::default());
    (engine, faults)
}

#[tokio::test]
async fn scenario_a_accept_rejects_competitors_and_assigns_job() {
    let engine = MarketEngine::in_memory();
    let (job, bids) = seed(&engine, &[100, 80]).await;

    let report = engine
        .workflow()
        .accept_bid(&customer(), &bids[0].id)
        .await
        .unwrap();

    assert_eq!(bid(&engine, &bids[0].id).await.status, BidStatus::Accepted);
    assert_eq!(bid(&engine, &bids[1].id).await.status, BidStatus::Rejected);
    assert_eq!(job_status(&engine, &job.id).await, JobStatus::Assigned);
    assert_eq!(report.operation, Operation::AcceptBid);
    assert!(report
        .steps
        .iter()
        .all(|record| record.outcome == StepOutcome::Applied));
    assert_eq!(report.job().map(|job| job.status), Some(JobStatus::Assigned));
}

#[tokio::test]
async fn scenario_b_transaction_takes_ten_percent_commission() {
    let engine = MarketEngine::in_memory();
    let (job, bids) = seed(&engine, &[100, 80]).await;
    engine
        .workflow()
        .accept_bid(&customer(), &bids[0].id)
        .await
        .unwrap();

    let report = engine
        .workflow()
        .create_transaction(&customer(), TransactionSource::Job(job.id.clone()), None)
        .await
        .unwrap();

    let tx = report.transaction().cloned().unwrap();
    assert_eq!(tx.amount_minor, 90);
    assert_eq!(tx.commission_minor, 10);
    assert_eq!(tx.commission_rate_bps, 1_000);
    assert_eq!(tx.status, TransactionStatus::Pending);
    assert_eq!(tx.bid_id.as_deref(), Some(bids[0].id.as_str()));
    assert_eq!(job_status(&engine, &job.id).await, JobStatus::PaymentPending);
}

#[tokio::test]
async fn scenario_c_cancel_returns_job_then_conflicts_on_repeat() {
    let engine = MarketEngine::in_memory();
    let (job, bids) = seed(&engine, &[100]).await;
    engine
        .workflow()
        .accept_bid(&customer(), &bids[0].id)
        .await
        .unwrap();
    let tx = engine
        .workflow()
        .create_transaction(&customer(), TransactionSource::Bid(bids[0].id.clone()), None)
        .await
        .unwrap()
        .transaction_id
        .unwrap();

    engine
        .workflow()
        .cancel_transaction(&customer(), &tx)
        .await
        .unwrap();
    assert_eq!(tx_status(&engine, &tx).await, TransactionStatus::Cancelled);
    assert_eq!(job_status(&engine, &job.id).await, JobStatus::Assigned);

    let err = engine
        .workflow()
        .cancel_transaction(&customer(), &tx)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConflictingState);
    assert_eq!(job_status(&engine, &job.id).await, JobStatus::Assigned);
}

#[tokio::test]
async fn scenario_d_non_owner_cannot_update_bid() {
    let engine = MarketEngine::in_memory();
    let (_job, bids) = seed(&engine, &[100]).await;

    let err = engine
        .bids()
        .update_bid(&provider(2), &bids[0].id, 50)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);

    let unchanged = bid(&engine, &bids[0].id).await;
    assert_eq!(unchanged, bids[0]);
}

#[tokio::test]
async fn place_bid_rejects_non_positive_price() {
    let engine = MarketEngine::in_memory();
    let (job, _) = seed(&engine, &[]).await;

    for price in [0, -1] {
        let err = engine
            .bids()
            .place_bid(&provider(1), &job.id, price)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }
    let listed = engine.bids().list_bids(&customer(), &job.id).await.unwrap();
    assert!(listed.is_empty());
}

#[tokio::test]
async fn repeated_accept_is_a_no_op() {
    let engine = MarketEngine::in_memory();
    let (job, bids) = seed(&engine, &[100, 80, 70]).await;
    engine
        .workflow()
        .accept_bid(&customer(), &bids[0].id)
        .await
        .unwrap();
    let loser_before = bid(&engine, &bids[1].id).await;

    let again = engine
        .workflow()
        .accept_bid(&customer(), &bids[0].id)
        .await
        .unwrap();

    assert!(!again.changed_state());
    assert_eq!(bid(&engine, &bids[1].id).await, loser_before);
    assert_eq!(job_status(&engine, &job.id).await, JobStatus::Assigned);
    let txs = engine
        .workflow()
        .list_transactions(&customer(), &job.id)
        .await
        .unwrap();
    assert!(txs.is_empty());
}

#[tokio::test]
async fn repeated_create_returns_the_same_pending_transaction() {
    let engine = MarketEngine::in_memory();
    let (job, bids) = seed(&engine, &[250]).await;
    engine
        .workflow()
        .accept_bid(&customer(), &bids[0].id)
        .await
        .unwrap();

    let first = engine
        .workflow()
        .create_transaction(&customer(), TransactionSource::Job(job.id.clone()), None)
        .await
        .unwrap();
    let second = engine
        .workflow()
        .create_transaction(&customer(), TransactionSource::Job(job.id.clone()), None)
        .await
        .unwrap();

    assert_eq!(first.transaction_id, second.transaction_id);
    assert!(!second.changed_state());
    let txs = engine
        .workflow()
        .list_transactions(&customer(), &job.id)
        .await
        .unwrap();
    assert_eq!(txs.len(), 1);
}

#[tokio::test]
async fn round_trip_keeps_job_status_in_step() {
    let engine = MarketEngine::in_memory();
    let wf = engine.workflow();
    let (job, bids) = seed(&engine, &[100, 90]).await;

    wf.accept_bid(&customer(), &bids[1].id).await.unwrap();
    assert_eq!(job_status(&engine, &job.id).await, JobStatus::Assigned);

    let first = wf
        .create_transaction(&customer(), TransactionSource::Job(job.id.clone()), None)
        .await
        .unwrap()
        .transaction_id
        .unwrap();
    assert_eq!(job_status(&engine, &job.id).await, JobStatus::PaymentPending);

    wf.cancel_transaction(&customer(), &first).await.unwrap();
    assert_eq!(job_status(&engine, &job.id).await, JobStatus::Assigned);

    let second = wf
        .create_transaction(&customer(), TransactionSource::Job(job.id.clone()), None)
        .await
        .unwrap()
        .transaction_id
        .unwrap();
    assert_ne!(first, second);
    assert_eq!(job_status(&engine, &job.id).await, JobStatus::PaymentPending);

    wf.refund_transaction(&admin(), &second).await.unwrap();
    assert_eq!(tx_status(&engine, &second).await, TransactionStatus::Refunded);
    assert_eq!(job_status(&engine, &job.id).await, JobStatus::Assigned);

    let err = wf.refund_transaction(&customer(), &first).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConflictingState);
}

#[tokio::test]
async fn complete_then_refund_reopens_payment() {
    let engine = MarketEngine::in_memory();
    let wf = engine.workflow();
    let (job, bids) = seed(&engine, &[400]).await;
    wf.accept_bid(&customer(), &bids[0].id).await.unwrap();
    let tx = wf
        .create_transaction(&customer(), TransactionSource::Job(job.id.clone()), None)
        .await
        .unwrap()
        .transaction_id
        .unwrap();

    wf.complete_transaction(&customer(), &tx).await.unwrap();
    assert_eq!(job_status(&engine, &job.id).await, JobStatus::Completed);

    let err = wf.delete_transaction(&customer(), &tx).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConflictingState);

    wf.refund_transaction(&customer(), &tx).await.unwrap();
    assert_eq!(job_status(&engine, &job.id).await, JobStatus::Assigned);

    let repeat = wf.refund_transaction(&customer(), &tx).await.unwrap();
    assert!(!repeat.changed_state());

    wf.delete_transaction(&customer(), &tx).await.unwrap();
    let err = wf.delete_transaction(&customer(), &tx).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn reject_bid_leaves_job_alone() {
    let engine = MarketEngine::in_memory();
    let wf = engine.workflow();
    let (job, bids) = seed(&engine, &[100, 80]).await;

    let rejected = wf.reject_bid(&customer(), &bids[1].id).await.unwrap();
    assert_eq!(rejected.status, BidStatus::Rejected);
    assert_eq!(job_status(&engine, &job.id).await, JobStatus::Open);

    // Idempotent on an already rejected bid.
    assert!(wf.reject_bid(&customer(), &bids[1].id).await.is_ok());

    wf.accept_bid(&customer(), &bids[0].id).await.unwrap();
    let err = wf.reject_bid(&customer(), &bids[0].id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConflictingState);

    let err = wf.reject_bid(&provider(1), &bids[1].id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);
}

#[tokio::test]
async fn bids_close_once_a_bid_is_accepted() {
    let engine = MarketEngine::in_memory();
    let (job, bids) = seed(&engine, &[100]).await;
    engine
        .workflow()
        .accept_bid(&customer(), &bids[0].id)
        .await
        .unwrap();

    let err = engine
        .bids()
        .place_bid(&provider(7), &job.id, 60)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConflictingState);
}

#[tokio::test]
async fn mismatched_quote_is_rejected_before_any_write() {
    let engine = MarketEngine::in_memory();
    let (job, bids) = seed(&engine, &[100]).await;
    engine
        .workflow()
        .accept_bid(&customer(), &bids[0].id)
        .await
        .unwrap();

    let quote = ClientQuote {
        amount_minor: 100,
        commission_minor: 0,
    };
    let err = engine
        .workflow()
        .create_transaction(&customer(), TransactionSource::Job(job.id.clone()), Some(quote))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    assert_eq!(job_status(&engine, &job.id).await, JobStatus::Assigned);

    let quote = ClientQuote {
        amount_minor: 90,
        commission_minor: 10,
    };
    assert!(engine
        .workflow()
        .create_transaction(&customer(), TransactionSource::Job(job.id.clone()), Some(quote))
        .await
        .is_ok());
}

#[tokio::test]
async fn transaction_requires_the_accepted_bid() {
    let engine = MarketEngine::in_memory();
    let (job, bids) = seed(&engine, &[100, 80]).await;

    let err = engine
        .workflow()
        .create_transaction(&customer(), TransactionSource::Job(job.id.clone()), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConflictingState);

    engine
        .workflow()
        .accept_bid(&customer(), &bids[0].id)
        .await
        .unwrap();
    let err = engine
        .workflow()
        .create_transaction(&customer(), TransactionSource::Bid(bids[1].id.clone()), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConflictingState);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_accepts_leave_one_winner() {
    let engine = MarketEngine::in_memory();
    let (job, bids) = seed(&engine, &[100, 95, 90, 85, 80, 75]).await;

    let mut handles = Vec::new();
    for bid in &bids {
        let engine = engine.clone();
        let bid_id = bid.id.clone();
        handles.push(tokio::spawn(async move {
            engine.workflow().accept_bid(&customer(), &bid_id).await
        }));
    }

    let mut winners = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => winners += 1,
            Err(err) => assert_eq!(err.kind(), ErrorKind::ConflictingState),
        }
    }
    assert_eq!(winners, 1);

    let listed = engine.bids().list_bids(&customer(), &job.id).await.unwrap();
    let accepted = listed
        .iter()
        .filter(|bid| bid.status == BidStatus::Accepted)
        .count();
    assert_eq!(accepted, 1);
    assert!(listed.iter().all(|bid| bid.status != BidStatus::Pending));
    assert_eq!(job_status(&engine, &job.id).await, JobStatus::Assigned);
}

#[tokio::test]
async fn failed_job_step_reports_partial_failure_and_retry_resumes() {
    let (engine, faults) = faulty_engine();
    let (job, bids) = seed(&engine, &[100, 80]).await;
    faults.arm(StoreOp::Update, Collection::Jobs, 1);

    let err = engine
        .workflow()
        .accept_bid(&customer(), &bids[0].id)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PartialFailure);
    let report = err.partial_report().unwrap();
    assert_eq!(report.operation, Operation::AcceptBid);
    assert_eq!(report.failed_step, Step::AssignJob);
    assert_eq!(
        report.committed_steps,
        vec![Step::AcceptTargetBid, Step::RejectOtherBids]
    );
    assert_eq!(report.cause_kind, ErrorKind::StoreFailure);
    assert_eq!(
        report.snapshot.job.as_ref().map(|job| job.status),
        Some(JobStatus::Open)
    );
    assert!(report
        .snapshot
        .bids
        .iter()
        .any(|bid| bid.id == bids[0].id && bid.status == BidStatus::Accepted));

    let retry = engine
        .workflow()
        .accept_bid(&customer(), &bids[0].id)
        .await
        .unwrap();
    let outcomes = retry
        .steps
        .iter()
        .map(|record| record.outcome)
        .collect::<Vec<_>>();
    assert_eq!(
        outcomes,
        vec![
            StepOutcome::AlreadyApplied,
            StepOutcome::AlreadyApplied,
            StepOutcome::Applied
        ]
    );
    assert_eq!(job_status(&engine, &job.id).await, JobStatus::Assigned);
}

#[tokio::test]
async fn first_step_failure_is_not_partial() {
    let (engine, faults) = faulty_engine();
    let (job, bids) = seed(&engine, &[100]).await;
    faults.arm(StoreOp::Update, Collection::Bids, 1);

    let err = engine
        .workflow()
        .accept_bid(&customer(), &bids[0].id)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StoreFailure);
    assert_eq!(bid(&engine, &bids[0].id).await.status, BidStatus::Pending);
    assert_eq!(job_status(&engine, &job.id).await, JobStatus::Open);
}

#[tokio::test]
async fn reconcile_finishes_an_interrupted_accept() {
    let (engine, faults) = faulty_engine();
    let (job, bids) = seed(&engine, &[100, 80, 60]).await;
    // Second bids update is the bulk rejection.
    faults.arm(StoreOp::Update, Collection::Bids, 2);

    let err = engine
        .workflow()
        .accept_bid(&customer(), &bids[0].id)
        .await
        .unwrap_err();
    let report = err.partial_report().unwrap();
    assert_eq!(report.failed_step, Step::RejectOtherBids);
    assert_eq!(report.committed_steps, vec![Step::AcceptTargetBid]);

    let err = engine
        .workflow()
        .reconcile_job(&customer(), &job.id)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);

    let repaired = engine
        .workflow()
        .reconcile_job(&admin(), &job.id)
        .await
        .unwrap();
    assert!(repaired.changed_state());
    assert_eq!(bid(&engine, &bids[1].id).await.status, BidStatus::Rejected);
    assert_eq!(bid(&engine, &bids[2].id).await.status, BidStatus::Rejected);
    assert_eq!(job_status(&engine, &job.id).await, JobStatus::Assigned);

    let again = engine
        .workflow()
        .reconcile_job(&admin(), &job.id)
        .await
        .unwrap();
    assert!(!again.changed_state());
}

#[tokio::test]
async fn interrupted_cancel_resumes_on_retry() {
    let (engine, faults) = faulty_engine();
    let (job, bids) = seed(&engine, &[100]).await;
    let wf = engine.workflow();
    wf.accept_bid(&customer(), &bids[0].id).await.unwrap();
    let tx = wf
        .create_transaction(&customer(), TransactionSource::Job(job.id.clone()), None)
        .await
        .unwrap()
        .transaction_id
        .unwrap();
    faults.arm(StoreOp::Update, Collection::Jobs, 1);

    let err = wf.cancel_transaction(&customer(), &tx).await.unwrap_err();
    let report = err.partial_report().unwrap();
    assert_eq!(report.failed_step, Step::ReturnJobToAssigned);
    assert_eq!(report.committed_steps, vec![Step::CancelTransaction]);
    assert_eq!(tx_status(&engine, &tx).await, TransactionStatus::Cancelled);
    assert_eq!(job_status(&engine, &job.id).await, JobStatus::PaymentPending);

    let resumed = wf.cancel_transaction(&customer(), &tx).await.unwrap();
    assert_eq!(resumed.steps[0].outcome, StepOutcome::AlreadyApplied);
    assert_eq!(resumed.steps[1].outcome, StepOutcome::Applied);
    assert_eq!(job_status(&engine, &job.id).await, JobStatus::Assigned);

    let err = wf.cancel_transaction(&customer(), &tx).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConflictingState);
}

#[tokio::test]
async fn transaction_visibility_follows_job_ownership() {
    let engine = MarketEngine::in_memory();
    let wf = engine.workflow();
    let (job, bids) = seed(&engine, &[100, 80]).await;
    wf.accept_bid(&customer(), &bids[0].id).await.unwrap();
    wf.create_transaction(&customer(), TransactionSource::Job(job.id.clone()), None)
        .await
        .unwrap();

    let other_job = wf
        .open_job(&Identity::customer("cust-2"), "mow lawn")
        .await
        .unwrap();
    let other_bid = engine
        .bids()
        .place_bid(&provider(3), &other_job.id, 40)
        .await
        .unwrap();
    wf.accept_bid(&Identity::customer("cust-2"), &other_bid.id)
        .await
        .unwrap();
    wf.create_transaction(
        &Identity::customer("cust-2"),
        TransactionSource::Job(other_job.id.clone()),
        None,
    )
    .await
    .unwrap();

    assert_eq!(wf.list_transactions(&provider(1), &job.id).await.unwrap().len(), 1);
    let err = wf.list_transactions(&provider(2), &job.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);

    let own = wf
        .export_transactions(&customer(), ExportFormat::Json)
        .await
        .unwrap();
    assert_eq!(own.rows, 1);
    let all = wf
        .export_transactions(&admin(), ExportFormat::Csv)
        .await
        .unwrap();
    assert_eq!(all.rows, 2);
    assert_eq!(all.body.lines().count(), 3);

    let err = wf
        .export_transactions(&provider(1), ExportFormat::Json)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);
}

#[tokio::test]
async fn new_transaction_sorts_after_every_earlier_one() {
    let engine = MarketEngine::in_memory();
    let wf = engine.workflow();
    let (job, bids) = seed(&engine, &[100]).await;
    wf.accept_bid(&customer(), &bids[0].id).await.unwrap();

    // An earlier transaction whose clock ran ahead of this host.
    let mut skewed = TransactionRecord::pending(&job.id, Some(bids[0].id.clone()), 90, 10, 1_000);
    skewed.created_at += chrono::Duration::hours(1);
    skewed.updated_at = skewed.created_at;
    let skewed_id = skewed.id.clone();
    engine
        .store()
        .insert(Row::Transaction(skewed), &[])
        .await
        .unwrap();
    engine
        .store()
        .update(
            Collection::Transactions,
            &Filter::by_id(skewed_id.as_str()),
            &Patch::new().status(TransactionStatus::Cancelled),
            &[],
        )
        .await
        .unwrap();

    let fresh = wf
        .create_transaction(&customer(), TransactionSource::Job(job.id.clone()), None)
        .await
        .unwrap()
        .transaction_id
        .unwrap();

    let txs = wf.list_transactions(&customer(), &job.id).await.unwrap();
    assert_eq!(txs.last().map(|tx| tx.id.as_str()), Some(fresh.as_str()));
    assert_eq!(job_status(&engine, &job.id).await, JobStatus::PaymentPending);

    wf.complete_transaction(&customer(), &fresh).await.unwrap();
    let repaired = wf.reconcile_job(&admin(), &job.id).await.unwrap();
    assert!(!repaired.changed_state());
    assert_eq!(job_status(&engine, &job.id).await, JobStatus::Completed);
}
