//! Centralized ownership and capability checks.
//!
//! Every operation funnels its "does this caller own that row" question
//! through [`authorize`], so the rules live in one table.

use crate::error::WorkflowError;
use crate::gate::{Identity, Role};
use marketflow_storage::{BidRecord, JobRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    OpenJob,
    PlaceBid,
    UpdateBid,
    WithdrawBid,
    ListBids,
    AcceptBid,
    RejectBid,
    CreateTransaction,
    CancelTransaction,
    RefundTransaction,
    CompleteTransaction,
    ListTransactions,
    DeleteTransaction,
    ExportTransactions,
    ReconcileJob,
}

impl Action {
    pub fn name(self) -> &'static str {
        match self {
            Self::OpenJob => "open_job",
            Self::PlaceBid => "place_bid",
            Self::UpdateBid => "update_bid",
            Self::WithdrawBid => "withdraw_bid",
            Self::ListBids => "list_bids",
            Self::AcceptBid => "accept_bid",
            Self::RejectBid => "reject_bid",
            Self::CreateTransaction => "create_transaction",
            Self::CancelTransaction => "cancel_transaction",
            Self::RefundTransaction => "refund_transaction",
            Self::CompleteTransaction => "complete_transaction",
            Self::ListTransactions => "list_transactions",
            Self::DeleteTransaction => "delete_transaction",
            Self::ExportTransactions => "export_transactions",
            Self::ReconcileJob => "reconcile_job",
        }
    }
}

/// What an action targets, with the ownership facts needed to decide.
#[derive(Debug, Clone, Copy)]
pub enum Resource<'a> {
    /// Creating new top-level rows.
    Marketplace,
    Job(&'a JobRecord),
    Bid {
        bid: &'a BidRecord,
        job: &'a JobRecord,
    },
    /// Transactions of `job`; `provider_id` is the accepted bid's provider, if any.
    Transactions {
        job: &'a JobRecord,
        provider_id: Option<&'a str>,
    },
    /// The full transaction ledger (export).
    Ledger,
}

pub fn require_role(identity: &Identity, role: Role) -> Result<(), WorkflowError> {
    if identity.role == role {
        Ok(())
    } else {
        Err(WorkflowError::Forbidden(format!(
            "role '{}' required, caller '{}' is '{}'",
            role, identity.user_id, identity.role
        )))
    }
}

fn owns_job(identity: &Identity, job: &JobRecord) -> bool {
    identity.role == Role::Customer && identity.user_id == job.customer_id
}

fn is_admin(identity: &Identity) -> bool {
    identity.role == Role::Admin
}

pub fn authorize(
    identity: &Identity,
    resource: &Resource<'_>,
    action: Action,
) -> Result<(), WorkflowError> {
    use Action::*;

    let allowed = match (action, resource) {
        (OpenJob, Resource::Marketplace) => identity.role == Role::Customer,
        (PlaceBid, Resource::Job(_)) => identity.role == Role::Provider,
        (ListBids, Resource::Job(_)) => true,
        (UpdateBid | WithdrawBid, Resource::Bid { bid, .. }) => {
            identity.role == Role::Provider && identity.user_id == bid.provider_id
        }
        (AcceptBid | RejectBid, Resource::Bid { job, .. }) => owns_job(identity, job),
        (CreateTransaction, Resource::Job(job)) => owns_job(identity, job),
        (
            CancelTransaction | RefundTransaction | CompleteTransaction | DeleteTransaction,
            Resource::Transactions { job, .. },
        ) => owns_job(identity, job) || is_admin(identity),
        (ListTransactions, Resource::Transactions { job, provider_id }) => {
            owns_job(identity, job)
                || is_admin(identity)
                || (identity.role == Role::Provider
                    && provider_id.is_some_and(|provider| provider == identity.user_id))
        }
        (ExportTransactions, Resource::Ledger) => {
            matches!(identity.role, Role::Admin | Role::Customer)
        }
        (ReconcileJob, Resource::Job(_)) => is_admin(identity),
        _ => false,
    };

    if allowed {
        Ok(())
    } else {
        Err(WorkflowError::Forbidden(format!(
            "{} '{}' may not {}",
            identity.role,
            identity.user_id,
            action.name()
        )))
    }
}
