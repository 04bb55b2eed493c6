//! In-memory FIFO of pending envelopes.

use std::collections::VecDeque;
use std::time::Instant;

use crate::core::{BrokerError, EnvelopeQueue, PendingEnvelope};

/// Bounded FIFO with head insertion for redeliveries.
#[derive(Debug)]
pub struct InMemoryEnvelopeQueue {
    max_depth: usize,
    items: VecDeque<PendingEnvelope>,
}

impl InMemoryEnvelopeQueue {
    /// Create a queue holding at most `max_depth` fresh envelopes.
    #[must_use]
    pub fn new(max_depth: usize) -> Self {
        Self {
            max_depth,
            items: VecDeque::with_capacity(max_depth.min(1024)),
        }
    }

    /// Correlation ids in queue order.
    pub fn correlation_ids(&self) -> impl Iterator<Item = &str> {
        self.items.iter().map(|p| p.envelope.correlation_id.as_str())
    }
}

impl EnvelopeQueue for InMemoryEnvelopeQueue {
    fn push_back(&mut self, item: PendingEnvelope) -> Result<(), BrokerError> {
        if self.items.len() >= self.max_depth {
            return Err(BrokerError::QueueFull(self.max_depth));
        }
        self.items.push_back(item);
        Ok(())
    }

    fn push_front(&mut self, item: PendingEnvelope) {
        self.items.push_front(item);
    }

    fn pop_front(&mut self) -> Option<PendingEnvelope> {
        self.items.pop_front()
    }

    fn prune_older_than(&mut self, cutoff: Instant) -> Vec<PendingEnvelope> {
        let (expired, kept): (VecDeque<_>, VecDeque<_>) = self
            .items
            .drain(..)
            .partition(|p| p.enqueued_at < cutoff);
        self.items = kept;
        expired.into()
    }

    fn drain_all(&mut self) -> Vec<PendingEnvelope> {
        self.items.drain(..).collect()
    }

    fn max_depth(&self) -> usize {
        self.max_depth
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}
