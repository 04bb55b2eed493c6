//! Pending-envelope queue backends.

pub mod memory;

pub use memory::InMemoryEnvelopeQueue;
