//! vmrun-testkit
//!
//! In-memory ledger backend plus fixtures for end-to-end scenario tests that
//! need no database.

mod fixtures;
mod memory;

pub use fixtures::{aws_instance, standard_catalog, ts};
pub use memory::MemoryLedger;
