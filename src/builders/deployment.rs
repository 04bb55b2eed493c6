//! Broker plus one redundant worker pair, wired from a [`SystemConfig`].

use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::SystemConfig;
use crate::core::{AppResult, GatewayError, NodeError, Registry, Role};
use crate::infra::{FileSnapshotStore, SnapshotStore};
use crate::runtime::{BrokerHandle, BrokerService, GatewayClient, NodeHandle, PeerLink, WorkerNode};

/// Id of the node that starts ACTIVE.
pub const PRIMARY_ID: &str = "primary";
/// Id of the node that starts STANDBY.
pub const BACKUP_ID: &str = "backup";

/// A running broker and worker pair.
pub struct Deployment {
    config: SystemConfig,
    broker: BrokerHandle,
    primary: NodeHandle,
    backup: NodeHandle,
    tasks: Vec<JoinHandle<()>>,
}

impl Deployment {
    /// Validate `config`, restore or build both registries, and start every
    /// task on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Fails on invalid configuration, a duplicate inventory id, or an
    /// unreadable snapshot.
    pub fn launch(config: SystemConfig) -> AppResult<Self> {
        config
            .validate()
            .map_err(|e| anyhow!(e))
            .context("invalid system configuration")?;

        let (broker, broker_task) = BrokerService::spawn(config.broker.clone());
        let (primary_link, backup_link) = PeerLink::pair();
        let (primary, primary_task) =
            Self::node(&config, PRIMARY_ID, Role::Active, primary_link)?.spawn(&broker);
        let (backup, backup_task) =
            Self::node(&config, BACKUP_ID, Role::Standby, backup_link)?.spawn(&broker);
        info!(
            slots = config.node.handler_slots,
            units = config.inventory.units().len(),
            "deployment launched"
        );

        Ok(Self {
            config,
            broker,
            primary,
            backup,
            tasks: vec![broker_task, primary_task, backup_task],
        })
    }

    fn node(config: &SystemConfig, node_id: &str, role: Role, link: PeerLink) -> AppResult<WorkerNode> {
        let store = config
            .node
            .snapshot_path
            .as_deref()
            .map(|dir| snapshot_store(dir, node_id));
        let restored = match &store {
            Some(store) => store
                .load()
                .with_context(|| format!("loading snapshot for node `{node_id}`"))?,
            None => None,
        };
        let registry = match restored {
            Some(registry) => {
                info!(node = node_id, units = registry.len(), "registry restored from snapshot");
                registry
            }
            None => bootstrap_registry(config)?,
        };

        let mut node = WorkerNode::new(node_id, role, registry, link)
            .with_config(config.node.clone())
            .with_engine_config(config.engine.clone())
            .with_catalog(config.catalog());
        if let Some(store) = store {
            node = node.with_store(store);
        }
        Ok(node)
    }

    /// Configuration the deployment was launched with.
    #[must_use]
    pub const fn config(&self) -> &SystemConfig {
        &self.config
    }

    /// Broker handle.
    #[must_use]
    pub const fn broker(&self) -> &BrokerHandle {
        &self.broker
    }

    /// Node started ACTIVE.
    #[must_use]
    pub const fn primary(&self) -> &NodeHandle {
        &self.primary
    }

    /// Node started STANDBY.
    #[must_use]
    pub const fn backup(&self) -> &NodeHandle {
        &self.backup
    }

    /// The node currently reporting ACTIVE, if exactly one does.
    pub async fn active_node(&self) -> Option<&NodeHandle> {
        let mut active = Vec::with_capacity(2);
        for node in [&self.primary, &self.backup] {
            if let Ok(status) = node.status().await {
                if status.role == Role::Active {
                    active.push(node);
                }
            }
        }
        match active.as_slice() {
            [only] => Some(*only),
            _ => None,
        }
    }

    /// Gateway for `faculty`, validating against the configured catalog.
    ///
    /// # Errors
    ///
    /// Returns `Transport(Disconnected)` if the broker has stopped.
    pub fn gateway(&self, faculty: &str) -> Result<GatewayClient, GatewayError> {
        Ok(GatewayClient::connect(faculty, &self.broker, &self.config.gateway)?
            .with_catalog(self.config.catalog()))
    }

    /// Drain the broker, then stop both nodes and wait for every task.
    ///
    /// # Errors
    ///
    /// Fails if a task panicked.
    pub async fn shutdown(self) -> AppResult<()> {
        if self.broker.shutdown().await.is_err() {
            warn!("broker already stopped");
        }
        for node in [&self.primary, &self.backup] {
            match node.shutdown().await {
                Ok(()) | Err(NodeError::Closed) => {}
                Err(e) => warn!(node = node.node_id(), error = %e, "node shutdown failed"),
            }
        }
        for task in self.tasks {
            if let Err(e) = task.await {
                if e.is_panic() {
                    return Err(anyhow::Error::new(e).context("deployment task panicked"));
                }
            }
        }
        info!("deployment stopped");
        Ok(())
    }
}

fn snapshot_store(dir: &Path, node_id: &str) -> Arc<dyn SnapshotStore> {
    Arc::new(FileSnapshotStore::new(dir.join(format!("{node_id}.snapshot"))))
}

fn bootstrap_registry(config: &SystemConfig) -> AppResult<Registry> {
    config
        .inventory
        .build_registry()
        .context("building registry from inventory")
}
