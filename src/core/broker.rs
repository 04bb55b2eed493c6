//! Load balancer state: the worker FIFO, the pending FIFO, and liveness.
//!
//! `LoadBalancer` does no I/O. Every operation returns the [`Action`]s the
//! control loop must carry out, which keeps the routing rules testable with a
//! synthetic clock.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::message::{Envelope, FailureKind, WorkerAddress};
use crate::core::BrokerError;

/// A client request waiting for, or held by, a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEnvelope {
    /// Routing frame and payload.
    pub envelope: Envelope,
    /// When the broker first received it.
    pub enqueued_at: Instant,
    /// Times it was put back after its worker was evicted.
    pub redeliveries: u32,
}

impl PendingEnvelope {
    /// Freshly received envelope.
    #[must_use]
    pub const fn new(envelope: Envelope, enqueued_at: Instant) -> Self {
        Self {
            envelope,
            enqueued_at,
            redeliveries: 0,
        }
    }
}

/// FIFO of pending envelopes.
pub trait EnvelopeQueue: Send {
    /// Append at the tail.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::QueueFull` at capacity.
    fn push_back(&mut self, item: PendingEnvelope) -> Result<(), BrokerError>;
    /// Insert at the head. Redeliveries are never refused.
    fn push_front(&mut self, item: PendingEnvelope);
    /// Remove the head.
    fn pop_front(&mut self) -> Option<PendingEnvelope>;
    /// Remove and return every envelope received before `cutoff`.
    fn prune_older_than(&mut self, cutoff: Instant) -> Vec<PendingEnvelope>;
    /// Remove and return everything.
    fn drain_all(&mut self) -> Vec<PendingEnvelope>;
    /// Configured capacity.
    fn max_depth(&self) -> usize;
    /// Current depth.
    fn len(&self) -> usize;
    /// `true` when empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Broker-side record of a registered worker endpoint.
#[derive(Debug, Clone)]
pub struct WorkerHandle<C> {
    /// Opaque worker address.
    pub address: WorkerAddress,
    /// Where dispatches for this worker are written.
    pub connection: C,
    /// Evicted if nothing is heard by then.
    pub deadline: Instant,
    /// First registration.
    pub registered_at: Instant,
    /// Request currently owed a reply.
    pub in_flight: Option<PendingEnvelope>,
    /// Replies relayed.
    pub served: u64,
    /// Liveness pings received.
    pub heartbeats: u64,
}

/// Side effect requested by the load balancer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action<C> {
    /// Send `envelope` to `worker` over `connection`.
    Dispatch {
        /// Target worker.
        worker: WorkerAddress,
        /// Its connection.
        connection: C,
        /// Request to deliver.
        envelope: Envelope,
    },
    /// Relay a worker reply to its client.
    Forward {
        /// Reply frame, routing preserved.
        envelope: Envelope,
    },
    /// Answer the client with a terminal error.
    Fail {
        /// The failed request.
        envelope: Envelope,
        /// Failure category.
        kind: FailureKind,
        /// Human-readable reason.
        reason: String,
    },
}

/// Timing limits for the load balancer.
#[derive(Debug, Clone)]
pub struct BrokerLimits {
    /// Silence after which a worker is evicted.
    pub liveness_timeout: Duration,
    /// Age after which a still-pending envelope is failed.
    pub max_pending_age: Duration,
    /// Grace before an idle, never-active worker counts as a ghost.
    pub ghost_grace: Duration,
}

impl Default for BrokerLimits {
    fn default() -> Self {
        Self {
            liveness_timeout: Duration::from_secs(5),
            max_pending_age: Duration::from_secs(30),
            ghost_grace: Duration::from_secs(10),
        }
    }
}

/// Broker counts for the `status` command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerStatus {
    /// Registered worker endpoints.
    pub registered_workers: usize,
    /// Idle workers waiting for work.
    pub available_workers: usize,
    /// Workers owing a reply.
    pub busy_workers: usize,
    /// Envelopes waiting for a worker.
    pub pending_requests: usize,
    /// Connected gateways.
    pub clients: usize,
    /// Draining before shutdown.
    pub draining: bool,
}

/// Matches pending client envelopes to available workers.
pub struct LoadBalancer<C, Q> {
    workers: HashMap<WorkerAddress, WorkerHandle<C>>,
    available: VecDeque<WorkerAddress>,
    pending: Q,
    limits: BrokerLimits,
    draining: bool,
}

impl<C, Q> LoadBalancer<C, Q>
where
    C: Clone,
    Q: EnvelopeQueue,
{
    /// Empty balancer over `pending`.
    pub fn new(pending: Q, limits: BrokerLimits) -> Self {
        Self {
            workers: HashMap::new(),
            available: VecDeque::new(),
            pending,
            limits,
            draining: false,
        }
    }

    /// Limits in force.
    pub const fn limits(&self) -> &BrokerLimits {
        &self.limits
    }

    /// Look up a worker.
    pub fn worker(&self, address: &WorkerAddress) -> Option<&WorkerHandle<C>> {
        self.workers.get(address)
    }

    /// Idle workers, head first.
    pub fn available(&self) -> impl Iterator<Item = &WorkerAddress> {
        self.available.iter()
    }

    /// Register a worker, or refresh it if already known.
    ///
    /// A new worker immediately takes the head of the pending queue if there
    /// is one.
    pub fn register(
        &mut self,
        address: WorkerAddress,
        connection: C,
        now: Instant,
    ) -> Vec<Action<C>> {
        let deadline = now + self.limits.liveness_timeout;
        if let Some(handle) = self.workers.get_mut(&address) {
            handle.deadline = deadline;
            handle.connection = connection;
            debug!(worker = %address, "duplicate registration refreshed");
            return Vec::new();
        }
        info!(worker = %address, "worker registered");
        self.workers.insert(
            address.clone(),
            WorkerHandle {
                address: address.clone(),
                connection,
                deadline,
                registered_at: now,
                in_flight: None,
                served: 0,
                heartbeats: 0,
            },
        );
        self.make_available(address).into_iter().collect()
    }

    /// Accept a client envelope: dispatch to the longest-idle worker, or queue.
    pub fn submit(&mut self, envelope: Envelope, now: Instant) -> Vec<Action<C>> {
        if self.draining {
            return vec![Action::Fail {
                envelope,
                kind: FailureKind::Shutdown,
                reason: BrokerError::ShuttingDown.to_string(),
            }];
        }
        let pending = PendingEnvelope::new(envelope, now);
        if let Some(worker) = self.pop_available() {
            return vec![self.assign(&worker, pending)];
        }
        let envelope = pending.envelope.clone();
        match self.pending.push_back(pending) {
            Ok(()) => Vec::new(),
            Err(e) => {
                warn!(correlation_id = %envelope.correlation_id, error = %e, "request refused");
                vec![Action::Fail {
                    envelope,
                    kind: FailureKind::Overload,
                    reason: e.to_string(),
                }]
            }
        }
    }

    /// Relay a worker reply and hand the worker its next request.
    ///
    /// Replies from unknown workers (e.g. evicted ones answering late) are
    /// still forwarded.
    pub fn on_reply(
        &mut self,
        address: &WorkerAddress,
        reply: Envelope,
        now: Instant,
    ) -> Vec<Action<C>> {
        let mut actions = vec![Action::Forward { envelope: reply }];
        let Some(handle) = self.workers.get_mut(address) else {
            warn!(worker = %address, "reply from unregistered worker forwarded");
            return actions;
        };
        handle.in_flight = None;
        handle.served += 1;
        handle.deadline = now + self.limits.liveness_timeout;
        actions.extend(self.make_available(address.clone()));
        actions
    }

    /// Record a liveness ping. Returns `false` for unknown workers.
    pub fn on_heartbeat(&mut self, address: &WorkerAddress, now: Instant) -> bool {
        match self.workers.get_mut(address) {
            Some(handle) => {
                handle.heartbeats += 1;
                handle.deadline = now + self.limits.liveness_timeout;
                true
            }
            None => false,
        }
    }

    /// Remove one worker, redelivering its in-flight envelope if allowed.
    pub fn evict(&mut self, address: &WorkerAddress, reason: &str) -> Vec<Action<C>> {
        let Some(handle) = self.workers.remove(address) else {
            return Vec::new();
        };
        self.available.retain(|a| a != address);
        warn!(worker = %address, reason, "worker evicted");
        let mut actions = Vec::new();
        if let Some(mut pending) = handle.in_flight {
            if pending.redeliveries == 0 {
                pending.redeliveries = 1;
                warn!(
                    correlation_id = %pending.envelope.correlation_id,
                    worker = %address,
                    "in-flight request requeued for redelivery"
                );
                self.pending.push_front(pending);
            } else {
                warn!(
                    correlation_id = %pending.envelope.correlation_id,
                    "request lost its worker twice, failing"
                );
                actions.push(Action::Fail {
                    envelope: pending.envelope,
                    kind: FailureKind::Eviction,
                    reason: format!("worker {address} evicted twice while handling request"),
                });
            }
        }
        actions.extend(self.drain_pending());
        actions
    }

    /// Remove a worker whose connection refused a dispatch. The envelope never
    /// reached it, so it returns to the head of the queue without counting as
    /// a redelivery.
    pub fn dispatch_failed(&mut self, address: &WorkerAddress) -> Vec<Action<C>> {
        let Some(handle) = self.workers.remove(address) else {
            return Vec::new();
        };
        self.available.retain(|a| a != address);
        warn!(worker = %address, "worker connection closed, removed");
        if let Some(pending) = handle.in_flight {
            self.pending.push_front(pending);
        }
        self.drain_pending()
    }

    /// Evict silent workers, expire stale envelopes, then match what is left.
    pub fn sweep(&mut self, now: Instant) -> Vec<Action<C>> {
        let mut expired: Vec<WorkerAddress> = self
            .workers
            .values()
            .filter(|h| h.deadline <= now)
            .map(|h| h.address.clone())
            .collect();
        expired.sort();

        let mut actions = Vec::new();
        for address in &expired {
            actions.extend(self.evict(address, "liveness deadline elapsed"));
        }

        if let Some(cutoff) = now.checked_sub(self.limits.max_pending_age) {
            let max_age = self.limits.max_pending_age;
            for stale in self.pending.prune_older_than(cutoff) {
                warn!(correlation_id = %stale.envelope.correlation_id, "pending request expired");
                actions.push(Action::Fail {
                    envelope: stale.envelope,
                    kind: FailureKind::Transport,
                    reason: format!("no worker available within {max_age:?}"),
                });
            }
        }

        actions.extend(self.drain_pending());
        actions
    }

    /// Remove ghost workers: registered more than the grace period ago, never
    /// served or pinged, and idle. The pending queue is untouched.
    pub fn cleanup(&mut self, now: Instant) -> Vec<WorkerAddress> {
        let grace = self.limits.ghost_grace;
        let mut ghosts: Vec<WorkerAddress> = self
            .workers
            .values()
            .filter(|h| {
                h.in_flight.is_none()
                    && h.served == 0
                    && h.heartbeats == 0
                    && now.saturating_duration_since(h.registered_at) > grace
            })
            .map(|h| h.address.clone())
            .collect();
        ghosts.sort();
        for address in &ghosts {
            self.workers.remove(address);
            self.available.retain(|a| a != address);
            info!(worker = %address, "ghost worker removed");
        }
        ghosts
    }

    /// Stop accepting new envelopes.
    pub fn begin_drain(&mut self) {
        self.draining = true;
    }

    /// `true` while draining.
    pub const fn is_draining(&self) -> bool {
        self.draining
    }

    /// Nothing pending and nothing in flight.
    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.workers.values().all(|h| h.in_flight.is_none())
    }

    /// Fail everything still pending or in flight with `kind`.
    pub fn abandon_all(&mut self, kind: FailureKind, reason: &str) -> Vec<Action<C>> {
        let mut envelopes: Vec<Envelope> = self
            .pending
            .drain_all()
            .into_iter()
            .map(|p| p.envelope)
            .collect();
        envelopes.extend(
            self.workers
                .values_mut()
                .filter_map(|h| h.in_flight.take())
                .map(|p| p.envelope),
        );
        envelopes
            .into_iter()
            .map(|envelope| Action::Fail {
                envelope,
                kind,
                reason: reason.to_string(),
            })
            .collect()
    }

    /// Current counts. `clients` is left for the caller to fill.
    pub fn status(&self) -> BrokerStatus {
        let busy = self.workers.values().filter(|h| h.in_flight.is_some()).count();
        BrokerStatus {
            registered_workers: self.workers.len(),
            available_workers: self.available.len(),
            busy_workers: busy,
            pending_requests: self.pending.len(),
            clients: 0,
            draining: self.draining,
        }
    }

    fn pop_available(&mut self) -> Option<WorkerAddress> {
        while let Some(address) = self.available.pop_front() {
            if self
                .workers
                .get(&address)
                .is_some_and(|h| h.in_flight.is_none())
            {
                return Some(address);
            }
        }
        None
    }

    fn make_available(&mut self, address: WorkerAddress) -> Option<Action<C>> {
        if let Some(next) = self.pending.pop_front() {
            return Some(self.assign(&address, next));
        }
        if !self.available.contains(&address) {
            self.available.push_back(address);
        }
        None
    }

    fn drain_pending(&mut self) -> Vec<Action<C>> {
        let mut actions = Vec::new();
        while !self.pending.is_empty() {
            let Some(worker) = self.pop_available() else {
                break;
            };
            if let Some(next) = self.pending.pop_front() {
                actions.push(self.assign(&worker, next));
            }
        }
        actions
    }

    fn assign(&mut self, worker: &WorkerAddress, pending: PendingEnvelope) -> Action<C> {
        let envelope = pending.envelope.clone();
        let connection = self.workers.get_mut(worker).map(|h| {
            h.in_flight = Some(pending);
            h.connection.clone()
        });
        match connection {
            Some(connection) => Action::Dispatch {
                worker: worker.clone(),
                connection,
                envelope,
            },
            None => Action::Fail {
                envelope,
                kind: FailureKind::Internal,
                reason: format!("worker {worker} vanished before dispatch"),
            },
        }
    }
}
