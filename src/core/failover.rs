//! ACTIVE/STANDBY role state machine for one member of a redundant pair.
//!
//! The machine only decides; the node runtime acts on the returned
//! [`Transition`] (registering with the broker, shipping snapshots, stopping
//! handler slots).

use std::time::{Duration, Instant};

use tracing::warn;

use crate::core::message::{HeartbeatRecord, Role};

/// Outcome of feeding an event to the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Nothing changed.
    Stay,
    /// This node became ACTIVE at `generation`.
    Promoted {
        /// New generation.
        generation: u64,
    },
    /// This node yielded to a peer at `generation`.
    Demoted {
        /// Generation of the superseding peer.
        generation: u64,
    },
    /// An ACTIVE peer from an older generation is still talking to us.
    PeerBehind {
        /// The peer's stale generation.
        peer_generation: u64,
    },
}

/// Role, generation, and peer liveness for one node.
#[derive(Debug, Clone)]
pub struct FailoverMachine {
    node_id: String,
    role: Role,
    generation: u64,
    peer_seen_at: Instant,
    timeout: Duration,
}

impl FailoverMachine {
    /// Machine starting in `role` at `generation`; the peer counts as heard
    /// at `now`.
    pub fn new(
        node_id: impl Into<String>,
        role: Role,
        generation: u64,
        timeout: Duration,
        now: Instant,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            role,
            generation,
            peer_seen_at: now,
            timeout,
        }
    }

    /// This node's id.
    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Current role.
    #[must_use]
    pub const fn role(&self) -> Role {
        self.role
    }

    /// Highest generation this node knows of.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// `true` while ACTIVE.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.role == Role::Active
    }

    /// Heartbeat to send to the peer, if ACTIVE.
    #[must_use]
    pub fn heartbeat(&self, timestamp: u64) -> Option<HeartbeatRecord> {
        self.is_active().then(|| HeartbeatRecord {
            node: self.node_id.clone(),
            role: self.role,
            generation: self.generation,
            timestamp,
        })
    }

    /// Process a heartbeat from the peer.
    pub fn on_heartbeat(&mut self, heartbeat: &HeartbeatRecord, now: Instant) -> Transition {
        if heartbeat.node == self.node_id {
            return Transition::Stay;
        }
        match self.role {
            Role::Standby => {
                if heartbeat.generation >= self.generation {
                    self.generation = heartbeat.generation;
                    self.peer_seen_at = now;
                }
                Transition::Stay
            }
            Role::Active => {
                let superseded = heartbeat.generation > self.generation
                    || (heartbeat.generation == self.generation
                        && heartbeat.role == Role::Active
                        && heartbeat.node < self.node_id);
                if superseded {
                    warn!(
                        node = %self.node_id,
                        own_generation = self.generation,
                        peer = %heartbeat.node,
                        peer_generation = heartbeat.generation,
                        "superseded by peer, demoting to standby"
                    );
                    self.role = Role::Standby;
                    self.generation = heartbeat.generation;
                    self.peer_seen_at = now;
                    Transition::Demoted {
                        generation: heartbeat.generation,
                    }
                } else if heartbeat.generation < self.generation {
                    Transition::PeerBehind {
                        peer_generation: heartbeat.generation,
                    }
                } else {
                    Transition::Stay
                }
            }
        }
    }

    /// React to any peer message stamped with `generation`: an ACTIVE node
    /// seeing a newer generation yields.
    pub fn yield_to(&mut self, generation: u64, now: Instant) -> Transition {
        if self.role != Role::Active || generation <= self.generation {
            return Transition::Stay;
        }
        warn!(
            node = %self.node_id,
            own_generation = self.generation,
            peer_generation = generation,
            "newer generation observed, demoting to standby"
        );
        self.role = Role::Standby;
        self.generation = generation;
        self.peer_seen_at = now;
        Transition::Demoted { generation }
    }

    /// Check the heartbeat deadline. A STANDBY that has not heard its peer
    /// within the timeout promotes itself to the next generation.
    pub fn on_tick(&mut self, now: Instant) -> Transition {
        if self.role == Role::Active {
            return Transition::Stay;
        }
        if now.saturating_duration_since(self.peer_seen_at) < self.timeout {
            return Transition::Stay;
        }
        self.generation += 1;
        self.role = Role::Active;
        warn!(
            node = %self.node_id,
            generation = self.generation,
            silent_for = ?now.saturating_duration_since(self.peer_seen_at),
            "peer heartbeat lost, promoting to active"
        );
        Transition::Promoted {
            generation: self.generation,
        }
    }

    /// Time left before a STANDBY would promote.
    #[must_use]
    pub fn time_to_promotion(&self, now: Instant) -> Option<Duration> {
        (self.role == Role::Standby).then(|| {
            self.timeout
                .saturating_sub(now.saturating_duration_since(self.peer_seen_at))
        })
    }
}
