//! Marketplace workflow core.
//!
//! Keeps job, bid, and transaction status fields consistent across
//! sequences of single-row writes. Operations run as ordered, idempotent
//! steps; a sequence interrupted after a committed step reports a
//! `PartialFailure` with the step cursor so it can be resumed by retrying or
//! by `reconcile_job`.

#![deny(unsafe_code)]

pub mod bids;
pub mod config;
pub mod error;
pub mod export;
pub mod gate;
pub mod policy;
mod records;
pub mod runtime;
pub mod steps;
pub mod workflow;

pub use bids::BidLifecycleManager;
pub use config::{CommissionRate, EngineConfig, StoreConfig, WorkflowConfig};
pub use error::{EntitySnapshot, ErrorKind, PartialFailureReport, WorkflowError};
pub use export::{ExportDocument, ExportFormat};
pub use gate::{AuthorizationGate, Identity, IdentityResolver, Role, TokenDirectory};
pub use policy::{Action, Resource};
pub use runtime::MarketEngine;
pub use steps::{Operation, Step, StepOutcome, StepRecord, TransitionCursor};
pub use workflow::{ClientQuote, TransactionSource, TransitionReport, WorkflowOrchestrator};

pub use marketflow_storage as storage;
