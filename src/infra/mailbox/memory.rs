//! In-memory reply ledger.

use std::collections::{HashMap, VecDeque};

use crate::core::{AllocationResponse, ReplyLedger};

/// Bounded ledger of replies keyed by correlation id.
///
/// When full, the oldest entry is evicted first.
#[derive(Debug, Default)]
pub struct InMemoryReplyLedger {
    replies: HashMap<String, AllocationResponse>,
    order: VecDeque<String>,
    capacity: usize,
}

impl InMemoryReplyLedger {
    /// Ledger keeping at most `capacity` replies.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            replies: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }
}

impl ReplyLedger for InMemoryReplyLedger {
    fn record(&mut self, correlation_id: String, reply: AllocationResponse) {
        if self.replies.insert(correlation_id.clone(), reply).is_some() {
            return;
        }
        self.order.push_back(correlation_id);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.replies.remove(&oldest);
            }
        }
    }

    fn lookup(&self, correlation_id: &str) -> Option<AllocationResponse> {
        self.replies.get(correlation_id).cloned()
    }

    fn forget_pair(&mut self, faculty: &str, program: &str) {
        self.replies
            .retain(|_, r| !(r.faculty == faculty && r.program == program));
        let replies = &self.replies;
        self.order.retain(|id| replies.contains_key(id));
    }

    fn clear(&mut self) {
        self.replies.clear();
        self.order.clear();
    }

    fn len(&self) -> usize {
        self.replies.len()
    }
}
