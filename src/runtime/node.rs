//! One member of the ACTIVE/STANDBY worker pair.
//!
//! The node task owns the [`FailoverMachine`] and the replication cursor.
//! While ACTIVE it runs `handler_slots` broker endpoints over a shared
//! [`AllocationEngine`], emits heartbeats and ships every committed
//! mutation to its peer. While STANDBY it mirrors the peer's registry and
//! promotes itself when the peer falls silent.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{AbortHandle, JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::config::{EngineConfig, NodeConfig};
use crate::core::{
    AllocationEngine, AllocationHandler, ClassroomUnit, EngineStats, FacultyCatalog,
    FailoverMachine, HeartbeatRecord, NodeError, Registry, RegistryCounts, ReplicationMessage,
    ReplicationStream, Role, Transition, WorkerAddress,
};
use crate::infra::{InMemoryReplyLedger, SnapshotStore};
use crate::runtime::broker::BrokerHandle;
use crate::runtime::slot::{run_slot, SlotExit, SlotStop};
use crate::util::now_ms;

const SLOT_STOP_TIMEOUT: Duration = Duration::from_secs(2);
const MIN_CHECK_INTERVAL: Duration = Duration::from_millis(10);

/// Node-to-node channels: heartbeats and replication travel separately.
#[derive(Debug)]
pub struct PeerLink {
    heartbeat_tx: mpsc::UnboundedSender<HeartbeatRecord>,
    heartbeat_rx: mpsc::UnboundedReceiver<HeartbeatRecord>,
    replication_tx: mpsc::UnboundedSender<ReplicationMessage>,
    replication_rx: mpsc::UnboundedReceiver<ReplicationMessage>,
}

impl PeerLink {
    /// Two connected ends.
    #[must_use]
    pub fn pair() -> (Self, Self) {
        let (hb_a, hb_rx_b) = mpsc::unbounded_channel();
        let (hb_b, hb_rx_a) = mpsc::unbounded_channel();
        let (rep_a, rep_rx_b) = mpsc::unbounded_channel();
        let (rep_b, rep_rx_a) = mpsc::unbounded_channel();
        (
            Self {
                heartbeat_tx: hb_a,
                heartbeat_rx: hb_rx_a,
                replication_tx: rep_a,
                replication_rx: rep_rx_a,
            },
            Self {
                heartbeat_tx: hb_b,
                heartbeat_rx: hb_rx_b,
                replication_tx: rep_b,
                replication_rx: rep_rx_b,
            },
        )
    }
}

/// Point-in-time view of a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    /// Node id.
    pub node_id: String,
    /// Current role.
    pub role: Role,
    /// Current generation.
    pub generation: u64,
    /// Last replication sequence applied (STANDBY) or shipped (ACTIVE).
    pub applied_seq: u64,
    /// Handler slots currently running.
    pub registered_slots: usize,
    /// Registry counts.
    pub counts: RegistryCounts,
    /// Engine counters.
    pub stats: EngineStats,
    /// `true` while the peer link is cut.
    pub partitioned: bool,
}

enum NodeCommand {
    Status(oneshot::Sender<Result<NodeStatus, NodeError>>),
    Cleanup(oneshot::Sender<Result<usize, NodeError>>),
    Release {
        faculty: String,
        program: String,
        reply: oneshot::Sender<Result<Vec<String>, NodeError>>,
    },
    Partition {
        cut: bool,
        reply: oneshot::Sender<()>,
    },
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable admin handle to a running node.
#[derive(Debug, Clone)]
pub struct NodeHandle {
    node_id: Arc<str>,
    commands: mpsc::UnboundedSender<NodeCommand>,
    abort: AbortHandle,
}

impl std::fmt::Debug for NodeCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Status(_) => "Status",
            Self::Cleanup(_) => "Cleanup",
            Self::Release { .. } => "Release",
            Self::Partition { .. } => "Partition",
            Self::Shutdown(_) => "Shutdown",
        };
        f.write_str(name)
    }
}

impl NodeHandle {
    /// Node id.
    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Role, generation, counts and stats.
    ///
    /// # Errors
    ///
    /// `Closed` if the node has stopped; `Allocation` if the registry lock
    /// timed out.
    pub async fn status(&self) -> Result<NodeStatus, NodeError> {
        self.ask(NodeCommand::Status).await?
    }

    /// Reset the registry. Only an ACTIVE node accepts this.
    ///
    /// # Errors
    ///
    /// `NotActive` on a STANDBY, `Closed` if stopped.
    pub async fn cleanup(&self) -> Result<usize, NodeError> {
        self.ask(NodeCommand::Cleanup).await?
    }

    /// Free every unit held by a faculty/program pair. ACTIVE only.
    ///
    /// # Errors
    ///
    /// `NotActive` on a STANDBY, `Closed` if stopped.
    pub async fn release(&self, faculty: &str, program: &str) -> Result<Vec<String>, NodeError> {
        let faculty = faculty.to_string();
        let program = program.to_string();
        self.ask(|reply| NodeCommand::Release {
            faculty,
            program,
            reply,
        })
        .await?
    }

    /// Cut (`true`) or restore (`false`) the link to the peer.
    ///
    /// # Errors
    ///
    /// `Closed` if the node has stopped.
    pub async fn partition(&self, cut: bool) -> Result<(), NodeError> {
        self.ask(|reply| NodeCommand::Partition { cut, reply }).await
    }

    /// Stop serving, close the engine, and exit.
    ///
    /// Requests already in a slot's hands are finished and answered first,
    /// within a bounded wait; nothing new is taken.
    ///
    /// # Errors
    ///
    /// `Closed` if the node had already stopped.
    pub async fn shutdown(&self) -> Result<(), NodeError> {
        self.ask(NodeCommand::Shutdown).await
    }

    /// Abort the node task and its slots without any cleanup.
    pub fn kill(&self) {
        warn!(node = %self.node_id, "node killed");
        self.abort.abort();
    }

    /// `true` once the node task has ended.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.abort.is_finished()
    }

    async fn ask<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> NodeCommand,
    ) -> Result<T, NodeError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .map_err(|_| NodeError::Closed)?;
        rx.await.map_err(|_| NodeError::Closed)
    }
}

/// Builder for one pair member.
pub struct WorkerNode {
    node_id: String,
    role: Role,
    registry: Registry,
    peer: PeerLink,
    config: NodeConfig,
    engine: EngineConfig,
    catalog: FacultyCatalog,
    store: Option<Arc<dyn SnapshotStore>>,
}

impl WorkerNode {
    /// Node starting in `role` at generation 0 over `registry`.
    pub fn new(node_id: impl Into<String>, role: Role, registry: Registry, peer: PeerLink) -> Self {
        Self {
            node_id: node_id.into(),
            role,
            registry,
            peer,
            config: NodeConfig::default(),
            engine: EngineConfig::default(),
            catalog: FacultyCatalog::default(),
            store: None,
        }
    }

    /// Timers and slot count.
    #[must_use]
    pub fn with_config(mut self, config: NodeConfig) -> Self {
        self.config = config;
        self
    }

    /// Engine gate, lock timeout and ledger settings.
    #[must_use]
    pub fn with_engine_config(mut self, engine: EngineConfig) -> Self {
        self.engine = engine;
        self
    }

    /// Faculty catalog used for request validation.
    #[must_use]
    pub fn with_catalog(mut self, catalog: FacultyCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// Where snapshots are persisted.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Start the node task on the current runtime.
    pub fn spawn(self, broker: &BrokerHandle) -> (NodeHandle, JoinHandle<()>) {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let PeerLink {
            heartbeat_tx,
            heartbeat_rx,
            replication_tx,
            replication_rx,
        } = self.peer;

        let stream = ReplicationStream::new(replication_tx);
        let mut engine = AllocationEngine::new(self.registry, self.engine.limits())
            .with_catalog(self.catalog)
            .with_sink(Arc::new(stream.clone()));
        if self.engine.dedup {
            engine = engine.with_ledger(Box::new(InMemoryReplyLedger::new(
                self.engine.ledger_capacity,
            )));
        }

        let machine = FailoverMachine::new(
            self.node_id.clone(),
            self.role,
            0,
            self.config.heartbeat_timeout(),
            Instant::now(),
        );
        let node_id: Arc<str> = Arc::from(self.node_id.as_str());
        let runtime = NodeRuntime {
            machine,
            engine,
            stream,
            broker: broker.clone(),
            config: self.config,
            store: self.store,
            heartbeat_tx,
            heartbeat_rx,
            replication_rx,
            commands,
            slots: JoinSet::new(),
            stop_slots: None,
            applied_generation: 0,
            applied_seq: 0,
            partitioned: false,
        };
        let task = tokio::spawn(runtime.run());
        let handle = NodeHandle {
            node_id,
            commands: commands_tx,
            abort: task.abort_handle(),
        };
        (handle, task)
    }
}

struct NodeRuntime {
    machine: FailoverMachine,
    engine: AllocationEngine,
    stream: ReplicationStream,
    broker: BrokerHandle,
    config: NodeConfig,
    store: Option<Arc<dyn SnapshotStore>>,
    heartbeat_tx: mpsc::UnboundedSender<HeartbeatRecord>,
    heartbeat_rx: mpsc::UnboundedReceiver<HeartbeatRecord>,
    replication_rx: mpsc::UnboundedReceiver<ReplicationMessage>,
    commands: mpsc::UnboundedReceiver<NodeCommand>,
    slots: JoinSet<(usize, SlotExit)>,
    stop_slots: Option<watch::Sender<SlotStop>>,
    applied_generation: u64,
    applied_seq: u64,
    partitioned: bool,
}

impl NodeRuntime {
    async fn run(mut self) {
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut check =
            tokio::time::interval((self.config.heartbeat_timeout() / 10).max(MIN_CHECK_INTERVAL));
        check.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut snapshot = tokio::time::interval(self.config.snapshot_interval());
        snapshot.set_missed_tick_behavior(MissedTickBehavior::Delay);
        snapshot.tick().await;

        info!(
            node = %self.machine.node_id(),
            role = %self.machine.role(),
            slots = self.config.handler_slots,
            "node started"
        );
        if self.machine.is_active() {
            self.become_active(self.machine.generation());
        }

        loop {
            tokio::select! {
                Some(command) = self.commands.recv() => {
                    if self.on_command(command).await.is_break() {
                        break;
                    }
                }
                Some(record) = self.heartbeat_rx.recv() => {
                    if self.partitioned {
                        trace!("peer link cut, heartbeat dropped");
                    } else {
                        let transition = self.machine.on_heartbeat(&record, Instant::now());
                        self.apply_transition(transition).await;
                    }
                }
                Some(message) = self.replication_rx.recv() => {
                    if self.partitioned {
                        trace!("peer link cut, replication message dropped");
                    } else {
                        self.on_replication(message).await;
                    }
                }
                _ = heartbeat.tick() => self.send_heartbeat(),
                _ = check.tick() => {
                    let transition = self.machine.on_tick(Instant::now());
                    self.apply_transition(transition).await;
                }
                _ = snapshot.tick() => {
                    if self.machine.is_active() {
                        self.ship_snapshot();
                    }
                }
                Some(joined) = self.slots.join_next(), if self.stop_slots.is_some() => {
                    self.on_slot_exit(joined);
                }
            }
        }
        info!(node = %self.machine.node_id(), "node stopped");
    }

    fn send_heartbeat(&self) {
        if self.partitioned {
            return;
        }
        if let Some(record) = self.machine.heartbeat(now_ms()) {
            if self.heartbeat_tx.send(record).is_err() {
                trace!(node = %self.machine.node_id(), "peer gone, heartbeat dropped");
            }
        }
    }

    async fn apply_transition(&mut self, transition: Transition) {
        match transition {
            Transition::Stay => {}
            Transition::Promoted { generation } => {
                warn!(
                    node = %self.machine.node_id(),
                    generation,
                    last_applied_seq = self.applied_seq,
                    "failover: serving from registry as of last applied delta, \
                     one in-flight allocation may be lost or replayed"
                );
                self.become_active(generation);
            }
            Transition::Demoted { generation } => {
                self.stop_slots(SlotStop::Abandon).await;
                self.applied_seq = self.stream.pause();
                info!(
                    node = %self.machine.node_id(),
                    generation,
                    "standing by, waiting for peer snapshot"
                );
            }
            Transition::PeerBehind { peer_generation } => {
                debug!(
                    node = %self.machine.node_id(),
                    peer_generation,
                    "stale peer detected, shipping snapshot"
                );
                self.ship_snapshot();
            }
        }
    }

    fn become_active(&mut self, generation: u64) {
        self.applied_generation = generation;
        self.stream.resume(generation, self.applied_seq);
        self.ship_snapshot();
        self.send_heartbeat();
        self.start_slots();
    }

    fn ship_snapshot(&self) {
        let shipped = self.engine.with_registry(|registry| {
            let units = registry.units();
            self.stream.ship_snapshot(units.clone());
            units
        });
        match shipped {
            Ok(units) => self.persist(&units),
            Err(e) => warn!(node = %self.machine.node_id(), error = %e, "snapshot skipped"),
        }
    }

    fn persist(&self, units: &[ClassroomUnit]) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(e) = store.save(units) {
            warn!(node = %self.machine.node_id(), error = %e, "snapshot not persisted");
        }
    }

    fn start_slots(&mut self) {
        if self.stop_slots.is_some() {
            return;
        }
        let (stop_tx, _) = watch::channel(SlotStop::Running);
        self.stop_slots = Some(stop_tx);
        for slot in 0..self.config.handler_slots {
            self.spawn_slot(slot);
        }
    }

    fn spawn_slot(&mut self, slot: usize) {
        let Some(stop) = &self.stop_slots else {
            return;
        };
        let stop = stop.subscribe();
        let address = WorkerAddress::slot(self.machine.node_id(), slot);
        let link = self.broker.worker_link();
        let handler = AllocationHandler::new(self.engine.clone());
        let ping_interval = self.config.broker_ping_interval();
        self.slots.spawn(async move {
            (slot, run_slot(address, link, handler, ping_interval, stop).await)
        });
    }

    /// A slot ended while the pool was still meant to be serving.
    fn on_slot_exit(&mut self, joined: Result<(usize, SlotExit), tokio::task::JoinError>) {
        match joined {
            Ok((slot, SlotExit::Evicted)) => {
                warn!(node = %self.machine.node_id(), slot, "slot evicted, re-registering");
                self.spawn_slot(slot);
            }
            Ok((slot, exit)) => {
                warn!(node = %self.machine.node_id(), slot, ?exit, "slot ended");
            }
            Err(e) => {
                warn!(node = %self.machine.node_id(), error = %e, "slot task failed");
            }
        }
    }

    async fn stop_slots(&mut self, mode: SlotStop) {
        let Some(stop) = self.stop_slots.take() else {
            return;
        };
        debug!(node = %self.machine.node_id(), ?mode, "stopping slots");
        let _ = stop.send(mode);
        let slots = &mut self.slots;
        let joined = tokio::time::timeout(SLOT_STOP_TIMEOUT, async {
            while slots.join_next().await.is_some() {}
        })
        .await;
        if joined.is_err() {
            warn!(node = %self.machine.node_id(), "slots did not stop in time, aborting");
            self.slots.abort_all();
            while self.slots.join_next().await.is_some() {}
        }
    }

    async fn on_replication(&mut self, message: ReplicationMessage) {
        let generation = message.generation();
        let seq = message.seq();
        if self.machine.is_active() {
            let transition = self.machine.yield_to(generation, Instant::now());
            self.apply_transition(transition).await;
            if self.machine.is_active() {
                trace!(generation, seq, "replication from stale peer ignored");
                return;
            }
        }
        if generation < self.applied_generation {
            debug!(generation, applied = self.applied_generation, "replication from older generation ignored");
            return;
        }

        match message {
            ReplicationMessage::Snapshot { units, .. } => {
                if generation == self.applied_generation && seq < self.applied_seq {
                    debug!(seq, applied = self.applied_seq, "stale snapshot ignored");
                    return;
                }
                self.persist(&units);
                if let Err(e) = self.engine.apply_snapshot(units) {
                    warn!(node = %self.machine.node_id(), error = %e, "snapshot rejected");
                    return;
                }
                debug!(generation, seq, "snapshot applied");
                self.applied_generation = generation;
                self.applied_seq = seq;
            }
            ReplicationMessage::Delta { delta, .. } => {
                if generation > self.applied_generation {
                    warn!(
                        generation,
                        seq,
                        applied_generation = self.applied_generation,
                        "delta from new generation before its snapshot"
                    );
                    self.applied_generation = generation;
                } else if seq <= self.applied_seq {
                    debug!(seq, applied = self.applied_seq, "duplicate delta skipped");
                    return;
                }
                if seq != self.applied_seq + 1 {
                    warn!(
                        expected = self.applied_seq + 1,
                        received = seq,
                        "replication gap"
                    );
                }
                if let Err(e) = self.engine.apply_delta(&delta) {
                    warn!(node = %self.machine.node_id(), seq, error = %e, "delta not applied");
                }
                self.applied_seq = seq;
            }
        }
    }

    async fn on_command(&mut self, command: NodeCommand) -> ControlFlow<()> {
        match command {
            NodeCommand::Status(reply) => {
                let _ = reply.send(self.status());
            }
            NodeCommand::Cleanup(reply) => {
                let result = if self.machine.is_active() {
                    self.engine.reset().map_err(NodeError::from)
                } else {
                    Err(NodeError::NotActive)
                };
                let _ = reply.send(result);
            }
            NodeCommand::Release {
                faculty,
                program,
                reply,
            } => {
                let result = if self.machine.is_active() {
                    self.engine
                        .release(&faculty, &program)
                        .map_err(NodeError::from)
                } else {
                    Err(NodeError::NotActive)
                };
                let _ = reply.send(result);
            }
            NodeCommand::Partition { cut, reply } => {
                warn!(node = %self.machine.node_id(), cut, "peer link partition changed");
                self.partitioned = cut;
                self.stream.set_linked(!cut);
                let _ = reply.send(());
            }
            NodeCommand::Shutdown(reply) => {
                info!(node = %self.machine.node_id(), "node shutting down");
                self.stop_slots(SlotStop::Drain).await;
                self.engine.close();
                if self.machine.is_active() {
                    self.ship_snapshot();
                }
                let _ = reply.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn status(&self) -> Result<NodeStatus, NodeError> {
        let applied_seq = if self.machine.is_active() {
            self.stream.seq()
        } else {
            self.applied_seq
        };
        Ok(NodeStatus {
            node_id: self.machine.node_id().to_string(),
            role: self.machine.role(),
            generation: self.machine.generation(),
            applied_seq,
            registered_slots: self.slots.len(),
            counts: self.engine.counts()?,
            stats: self.engine.stats(),
            partitioned: self.partitioned,
        })
    }
}
