//! Delta sinks: where committed registry mutations go.
//!
//! The allocation engine hands every committed [`StateDelta`] to a sink while
//! it still holds the registry write lock, so sinks observe deltas in commit
//! order and must never block.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::trace;

use crate::core::message::{ReplicationMessage, StateDelta};
use crate::core::registry::ClassroomUnit;

/// Destination for committed mutations.
pub trait DeltaSink: Send + Sync {
    /// Accept one committed delta. Called under the registry write lock.
    fn ship(&self, delta: StateDelta);
}

/// Sink that discards everything. Used by engines with no peer.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullDeltaSink;

impl DeltaSink for NullDeltaSink {
    fn ship(&self, _delta: StateDelta) {}
}

/// Bounded in-memory sink for tests and diagnostics.
#[derive(Debug)]
pub struct InMemoryDeltaSink {
    deltas: Mutex<VecDeque<StateDelta>>,
    max_deltas: usize,
}

impl InMemoryDeltaSink {
    /// Create a sink keeping at most `max_deltas` recent deltas.
    #[must_use]
    pub fn new(max_deltas: usize) -> Self {
        Self {
            deltas: Mutex::new(VecDeque::with_capacity(max_deltas.min(1024))),
            max_deltas,
        }
    }

    /// Copy of the retained deltas, oldest first.
    #[must_use]
    pub fn deltas(&self) -> Vec<StateDelta> {
        self.deltas.lock().iter().cloned().collect()
    }
}

impl DeltaSink for InMemoryDeltaSink {
    fn ship(&self, delta: StateDelta) {
        let mut deltas = self.deltas.lock();
        if deltas.len() >= self.max_deltas {
            deltas.pop_front();
        }
        deltas.push_back(delta);
    }
}

/// Sequenced channel from an ACTIVE node to its STANDBY peer.
///
/// Deltas are numbered and stamped with the node's generation. The stream
/// only ships while the node is ACTIVE; while the peer link is cut, deltas
/// still consume sequence numbers so the peer sees the gap once it heals.
#[derive(Debug, Clone)]
pub struct ReplicationStream {
    tx: mpsc::UnboundedSender<ReplicationMessage>,
    generation: Arc<AtomicU64>,
    seq: Arc<AtomicU64>,
    shipping: Arc<AtomicBool>,
    linked: Arc<AtomicBool>,
}

impl ReplicationStream {
    /// Paused stream writing into `tx`.
    #[must_use]
    pub fn new(tx: mpsc::UnboundedSender<ReplicationMessage>) -> Self {
        Self {
            tx,
            generation: Arc::new(AtomicU64::new(0)),
            seq: Arc::new(AtomicU64::new(0)),
            shipping: Arc::new(AtomicBool::new(false)),
            linked: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Start shipping as `generation`, continuing after `last_seq`.
    pub fn resume(&self, generation: u64, last_seq: u64) {
        self.generation.store(generation, Ordering::Release);
        self.seq.store(last_seq, Ordering::Release);
        self.shipping.store(true, Ordering::Release);
    }

    /// Stop shipping. Returns the last sequence number handed out.
    pub fn pause(&self) -> u64 {
        self.shipping.store(false, Ordering::Release);
        self.seq.load(Ordering::Acquire)
    }

    /// Cut or restore the peer link.
    pub fn set_linked(&self, linked: bool) {
        self.linked.store(linked, Ordering::Release);
    }

    /// `true` while the node ships deltas.
    #[must_use]
    pub fn is_shipping(&self) -> bool {
        self.shipping.load(Ordering::Acquire)
    }

    /// Last sequence number handed out.
    #[must_use]
    pub fn seq(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    /// Send the full registry as of the current sequence number.
    ///
    /// Call while holding the registry read lock so no delta can slip in
    /// between reading `units` and reading the sequence.
    pub fn ship_snapshot(&self, units: Vec<ClassroomUnit>) {
        if !self.is_shipping() {
            return;
        }
        let message = ReplicationMessage::Snapshot {
            generation: self.generation.load(Ordering::Acquire),
            seq: self.seq(),
            units,
        };
        self.send(message);
    }

    fn send(&self, message: ReplicationMessage) {
        if !self.linked.load(Ordering::Acquire) {
            trace!(seq = message.seq(), "peer link down, replication message dropped");
            return;
        }
        if self.tx.send(message).is_err() {
            trace!("peer gone, replication message dropped");
        }
    }
}

impl DeltaSink for ReplicationStream {
    fn ship(&self, delta: StateDelta) {
        if !self.is_shipping() {
            return;
        }
        let seq = self.seq.fetch_add(1, Ordering::AcqRel) + 1;
        let message = ReplicationMessage::Delta {
            generation: self.generation.load(Ordering::Acquire),
            seq,
            delta,
        };
        self.send(message);
    }
}
