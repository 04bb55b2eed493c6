//! Broker, node, engine, inventory, and gateway configuration.
//!
//! Every struct deserializes with defaults for missing fields; durations are
//! plain millisecond counts.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::{
    BrokerLimits, ClassroomUnit, EngineLimits, FacultyCatalog, Registry, RegistryError,
};
use crate::util::RetryPolicy;

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "CLASSROOM_";

/// Upper bound on default handler slots per node.
pub const MAX_DEFAULT_SLOTS: usize = 10;

fn default_handler_slots() -> usize {
    num_cpus::get().clamp(1, MAX_DEFAULT_SLOTS)
}

/// Broker settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Pending queue capacity.
    pub max_pending: usize,
    /// Silence before a worker is evicted.
    pub liveness_timeout_ms: u64,
    /// Period of the liveness sweep.
    pub sweep_interval_ms: u64,
    /// Age after which a pending request is failed.
    pub max_pending_age_ms: u64,
    /// Grace before an idle, never-active worker counts as a ghost.
    pub ghost_grace_ms: u64,
    /// How long `shutdown` waits for in-flight work.
    pub drain_timeout_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_pending: 1024,
            liveness_timeout_ms: 5_000,
            sweep_interval_ms: 1_000,
            max_pending_age_ms: 30_000,
            ghost_grace_ms: 10_000,
            drain_timeout_ms: 5_000,
        }
    }
}

impl BrokerConfig {
    /// Validate broker settings.
    ///
    /// # Errors
    ///
    /// Returns a message naming the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_pending == 0 {
            return Err("max_pending must be greater than 0".into());
        }
        if self.liveness_timeout_ms == 0 {
            return Err("liveness_timeout_ms must be greater than 0".into());
        }
        if self.sweep_interval_ms == 0 {
            return Err("sweep_interval_ms must be greater than 0".into());
        }
        if self.sweep_interval_ms > self.liveness_timeout_ms {
            return Err("sweep_interval_ms must not exceed liveness_timeout_ms".into());
        }
        if self.max_pending_age_ms == 0 {
            return Err("max_pending_age_ms must be greater than 0".into());
        }
        Ok(())
    }

    /// Load balancer limits.
    #[must_use]
    pub const fn limits(&self) -> BrokerLimits {
        BrokerLimits {
            liveness_timeout: Duration::from_millis(self.liveness_timeout_ms),
            max_pending_age: Duration::from_millis(self.max_pending_age_ms),
            ghost_grace: Duration::from_millis(self.ghost_grace_ms),
        }
    }

    /// Sweep period.
    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Drain bound.
    #[must_use]
    pub const fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

/// Worker node settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Peer heartbeat period while ACTIVE.
    pub heartbeat_interval_ms: u64,
    /// Peer silence after which a STANDBY promotes.
    pub heartbeat_timeout_ms: u64,
    /// Period of full snapshots to the peer.
    pub snapshot_interval_ms: u64,
    /// Worker endpoints registered with the broker while ACTIVE.
    #[serde(default = "default_handler_slots")]
    pub handler_slots: usize,
    /// Liveness ping period towards the broker.
    pub broker_ping_interval_ms: u64,
    /// Where to persist snapshots, if anywhere.
    pub snapshot_path: Option<PathBuf>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 2_000,
            heartbeat_timeout_ms: 5_000,
            snapshot_interval_ms: 10_000,
            handler_slots: default_handler_slots(),
            broker_ping_interval_ms: 1_000,
            snapshot_path: None,
        }
    }
}

impl NodeConfig {
    /// Validate node settings.
    ///
    /// # Errors
    ///
    /// Returns a message naming the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.heartbeat_interval_ms == 0 {
            return Err("heartbeat_interval_ms must be greater than 0".into());
        }
        if self.heartbeat_timeout_ms <= self.heartbeat_interval_ms {
            return Err("heartbeat_timeout_ms must exceed heartbeat_interval_ms".into());
        }
        if self.snapshot_interval_ms == 0 {
            return Err("snapshot_interval_ms must be greater than 0".into());
        }
        if self.handler_slots == 0 {
            return Err("handler_slots must be greater than 0".into());
        }
        if self.broker_ping_interval_ms == 0 {
            return Err("broker_ping_interval_ms must be greater than 0".into());
        }
        Ok(())
    }

    /// Peer heartbeat period.
    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Promotion deadline.
    #[must_use]
    pub const fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    /// Snapshot period.
    #[must_use]
    pub const fn snapshot_interval(&self) -> Duration {
        Duration::from_millis(self.snapshot_interval_ms)
    }

    /// Broker ping period.
    #[must_use]
    pub const fn broker_ping_interval(&self) -> Duration {
        Duration::from_millis(self.broker_ping_interval_ms)
    }
}

/// Allocation engine settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Requests admitted into the search phase at once.
    pub search_permits: usize,
    /// Bound on registry lock and gate waits.
    pub lock_timeout_ms: u64,
    /// Answer redelivered requests from the reply ledger.
    pub dedup: bool,
    /// Replies kept in the ledger.
    pub ledger_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            search_permits: 10,
            lock_timeout_ms: 500,
            dedup: true,
            ledger_capacity: 4_096,
        }
    }
}

impl EngineConfig {
    /// Validate engine settings.
    ///
    /// # Errors
    ///
    /// Returns a message naming the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.search_permits == 0 {
            return Err("search_permits must be greater than 0".into());
        }
        if self.lock_timeout_ms == 0 {
            return Err("lock_timeout_ms must be greater than 0".into());
        }
        if self.dedup && self.ledger_capacity == 0 {
            return Err("ledger_capacity must be greater than 0 when dedup is on".into());
        }
        Ok(())
    }

    /// Engine limits.
    #[must_use]
    pub const fn limits(&self) -> EngineLimits {
        EngineLimits {
            search_permits: self.search_permits,
            lock_timeout: Duration::from_millis(self.lock_timeout_ms),
        }
    }
}

/// Initial classroom inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InventoryConfig {
    /// Generated rooms `R001..`.
    pub room_count: usize,
    /// Seats per generated room.
    pub room_capacity: u32,
    /// Generated labs `L001..`.
    pub lab_count: usize,
    /// Seats per generated lab.
    pub lab_capacity: u32,
    /// Explicit units; when non-empty the generated ones are skipped.
    pub units: Vec<ClassroomUnit>,
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            room_count: 10,
            room_capacity: 40,
            lab_count: 3,
            lab_capacity: 30,
            units: Vec::new(),
        }
    }
}

impl InventoryConfig {
    /// Validate inventory settings.
    ///
    /// # Errors
    ///
    /// Returns a message for an empty inventory or a reserved explicit unit.
    pub fn validate(&self) -> Result<(), String> {
        if self.units.is_empty() && self.room_count == 0 && self.lab_count == 0 {
            return Err("inventory must contain at least one unit".into());
        }
        if let Some(unit) = self.units.iter().find(|u| u.reservation.is_some()) {
            return Err(format!("inventory unit `{}` must start available", unit.id));
        }
        Ok(())
    }

    /// Baseline units.
    #[must_use]
    pub fn units(&self) -> Vec<ClassroomUnit> {
        if !self.units.is_empty() {
            return self.units.clone();
        }
        let rooms = (1..=self.room_count).map(|i| ClassroomUnit::room(format!("R{i:03}"), self.room_capacity));
        let labs = (1..=self.lab_count).map(|i| ClassroomUnit::lab(format!("L{i:03}"), self.lab_capacity));
        rooms.chain(labs).collect()
    }

    /// Registry holding the baseline units.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::DuplicateUnit` for repeated explicit ids.
    pub fn build_registry(&self) -> Result<Registry, RegistryError> {
        Registry::from_units(self.units())
    }
}

/// Gateway client settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Wait for each reply.
    pub reply_timeout_ms: u64,
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// First backoff delay.
    pub retry_base_delay_ms: u64,
    /// Backoff ceiling.
    pub retry_max_delay_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            reply_timeout_ms: 10_000,
            max_retries: 3,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 5_000,
        }
    }
}

impl GatewayConfig {
    /// Validate gateway settings.
    ///
    /// # Errors
    ///
    /// Returns a message naming the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.reply_timeout_ms == 0 {
            return Err("reply_timeout_ms must be greater than 0".into());
        }
        if self.retry_max_delay_ms < self.retry_base_delay_ms {
            return Err("retry_max_delay_ms must be at least retry_base_delay_ms".into());
        }
        Ok(())
    }

    /// Per-attempt reply wait.
    #[must_use]
    pub const fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    /// Retry policy.
    #[must_use]
    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::with_delays(
            self.max_retries,
            Duration::from_millis(self.retry_base_delay_ms),
            Duration::from_millis(self.retry_max_delay_ms),
        )
    }
}

/// Root configuration for one deployment: a broker and one redundant pair.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    /// Broker settings.
    pub broker: BrokerConfig,
    /// Settings shared by both nodes of the pair.
    pub node: NodeConfig,
    /// Engine settings.
    pub engine: EngineConfig,
    /// Initial inventory.
    pub inventory: InventoryConfig,
    /// Gateway settings.
    pub gateway: GatewayConfig,
    /// Faculty name to programs; empty accepts any names.
    pub faculties: BTreeMap<String, Vec<String>>,
}

impl SystemConfig {
    /// Validate every section and their interplay.
    ///
    /// # Errors
    ///
    /// Returns a message prefixed with the failing section.
    pub fn validate(&self) -> Result<(), String> {
        self.broker.validate().map_err(|e| format!("broker invalid: {e}"))?;
        self.node.validate().map_err(|e| format!("node invalid: {e}"))?;
        self.engine.validate().map_err(|e| format!("engine invalid: {e}"))?;
        self.inventory
            .validate()
            .map_err(|e| format!("inventory invalid: {e}"))?;
        self.gateway
            .validate()
            .map_err(|e| format!("gateway invalid: {e}"))?;
        if self.node.broker_ping_interval_ms >= self.broker.liveness_timeout_ms {
            return Err("node broker_ping_interval_ms must be below broker liveness_timeout_ms".into());
        }
        // A slot stuck on the registry lock must not outlast the peer's patience.
        if self.engine.lock_timeout_ms.saturating_mul(2) > self.node.heartbeat_timeout_ms {
            return Err(
                "engine lock_timeout_ms must be at most half of node heartbeat_timeout_ms".into(),
            );
        }
        if self.node.handler_slots > self.engine.search_permits {
            return Err("node handler_slots must not exceed engine search_permits".into());
        }
        if let Some((name, _)) = self.faculties.iter().find(|(_, programs)| programs.is_empty()) {
            return Err(format!("faculty `{name}` lists no programs"));
        }
        Ok(())
    }

    /// Parse from JSON and validate.
    ///
    /// # Errors
    ///
    /// Returns the parse or validation message.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Defaults overridden by `CLASSROOM_*` variables, reading `.env` first
    /// when present.
    ///
    /// # Errors
    ///
    /// Returns a message for an unparsable variable or invalid result.
    pub fn from_env() -> Result<Self, String> {
        let _ = dotenvy::dotenv();
        Self::from_vars(std::env::vars())
    }

    /// Defaults overridden by `CLASSROOM_*` pairs from `vars`.
    ///
    /// # Errors
    ///
    /// Returns a message for an unparsable variable or invalid result.
    pub fn from_vars(vars: impl IntoIterator<Item = (String, String)>) -> Result<Self, String> {
        let mut cfg = Self::default();
        for (key, value) in vars {
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            cfg.apply_override(name, &value)?;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_override(&mut self, name: &str, value: &str) -> Result<(), String> {
        fn num<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, String> {
            value
                .trim()
                .parse()
                .map_err(|_| format!("{ENV_PREFIX}{name}: cannot parse `{value}`"))
        }
        match name {
            "MAX_PENDING" => self.broker.max_pending = num(name, value)?,
            "LIVENESS_TIMEOUT_MS" => self.broker.liveness_timeout_ms = num(name, value)?,
            "SWEEP_INTERVAL_MS" => self.broker.sweep_interval_ms = num(name, value)?,
            "DRAIN_TIMEOUT_MS" => self.broker.drain_timeout_ms = num(name, value)?,
            "HEARTBEAT_INTERVAL_MS" => self.node.heartbeat_interval_ms = num(name, value)?,
            "HEARTBEAT_TIMEOUT_MS" => self.node.heartbeat_timeout_ms = num(name, value)?,
            "SNAPSHOT_INTERVAL_MS" => self.node.snapshot_interval_ms = num(name, value)?,
            "HANDLER_SLOTS" => self.node.handler_slots = num(name, value)?,
            "SNAPSHOT_PATH" => self.node.snapshot_path = Some(PathBuf::from(value)),
            "SEARCH_PERMITS" => self.engine.search_permits = num(name, value)?,
            "LOCK_TIMEOUT_MS" => self.engine.lock_timeout_ms = num(name, value)?,
            "DEDUP" => self.engine.dedup = num(name, value)?,
            "REPLY_TIMEOUT_MS" => self.gateway.reply_timeout_ms = num(name, value)?,
            "MAX_RETRIES" => self.gateway.max_retries = num(name, value)?,
            "FACULTIES" => self.faculties = parse_faculties(value),
            _ => tracing::debug!(variable = name, "unknown configuration override ignored"),
        }
        Ok(())
    }

    /// Catalog built from `faculties`.
    #[must_use]
    pub fn catalog(&self) -> FacultyCatalog {
        FacultyCatalog::new(self.faculties.iter().map(|(f, p)| (f.as_str(), p.iter().map(String::as_str))))
    }
}

/// `Faculty, Program1, Program2` entries separated by `;` or newlines.
fn parse_faculties(value: &str) -> BTreeMap<String, Vec<String>> {
    FacultyCatalog::parse(&value.replace(';', "\n"))
        .iter()
        .map(|(faculty, programs)| (faculty.clone(), programs.iter().cloned().collect()))
        .collect()
}
