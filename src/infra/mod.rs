//! Infrastructure adapters for queues, reply ledgers, and snapshot storage.

pub mod mailbox;
pub mod queue;
pub mod snapshot;

pub use mailbox::InMemoryReplyLedger;
pub use queue::InMemoryEnvelopeQueue;
pub use snapshot::{FileSnapshotStore, InMemorySnapshotStore, SnapshotStore};
