//! Entity store contract for the marketplace workflow.
//!
//! Three collections (jobs, bids, transactions) behind one async trait with
//! per-row CRUD, bulk filtered updates, and write guards evaluated atomically
//! with the write they accompany. Adapters:
//! - [`memory::InMemoryEntityStore`] for tests and single-node runs
//! - `postgres::PostgresEntityStore` behind the `postgres` feature
//! - [`fault::FaultInjectingStore`] wrapping either for chaos tests

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

mod error;
pub mod fault;
mod filter;
pub mod memory;
mod model;
#[cfg(feature = "postgres")]
pub mod postgres;
mod traits;

pub use error::{StorageError, StorageResult};
pub use filter::{Clause, Field, FieldValue, Filter, Guard, GuardExpectation, Patch};
pub use model::{
    BidRecord, BidStatus, Collection, JobRecord, JobStatus, Row, TransactionRecord,
    TransactionStatus,
};
pub use traits::EntityStore;
