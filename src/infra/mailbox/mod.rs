//! Reply ledger backends.

pub mod memory;

pub use memory::InMemoryReplyLedger;
