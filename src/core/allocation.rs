//! Allocation engine: searches and reserves registry units under mutual
//! exclusion.
//!
//! Requests are planned concurrently under a shared read lock, admitted by a
//! bounded semaphore. Only one request at a time runs the commit phase under
//! the exclusive lock, where the selection is rebuilt against the current
//! registry before anything is reserved. A request is either fully satisfied
//! or leaves the registry untouched.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::core::catalog::FacultyCatalog;
use crate::core::message::{
    AllocationRequest, AllocationResponse, DeltaFields, DeltaOp, StateDelta,
};
use crate::core::registry::{ClassroomUnit, Registry, RegistryCounts, UnitKind};
use crate::core::replication::{DeltaSink, NullDeltaSink};
use crate::core::AllocationError;
use crate::util::clock::now_ms;

/// Highest valid semester number.
pub const MAX_SEMESTER: i64 = 10;

/// Record of replies already given, keyed by correlation id.
///
/// Consulted inside the commit critical section so a redelivered request
/// gets its original answer instead of a second reservation.
pub trait ReplyLedger: Send + Sync {
    /// Remember the reply for `correlation_id`.
    fn record(&mut self, correlation_id: String, reply: AllocationResponse);
    /// Reply previously recorded for `correlation_id`.
    fn lookup(&self, correlation_id: &str) -> Option<AllocationResponse>;
    /// Drop every entry belonging to a faculty/program pair.
    fn forget_pair(&mut self, faculty: &str, program: &str);
    /// Drop everything.
    fn clear(&mut self);
    /// Entries held.
    fn len(&self) -> usize;
    /// `true` when empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Capacity and timing limits for an engine.
#[derive(Debug, Clone)]
pub struct EngineLimits {
    /// Requests admitted into the search phase at once.
    pub search_permits: usize,
    /// Bound on any registry lock or gate wait.
    pub lock_timeout: Duration,
}

impl Default for EngineLimits {
    fn default() -> Self {
        Self {
            search_permits: 10,
            lock_timeout: Duration::from_millis(500),
        }
    }
}

/// Engine statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStats {
    /// Requests fully satisfied.
    pub allocations: u64,
    /// Requests answered `unavailable`.
    pub shortfalls: u64,
    /// Rooms converted to labs.
    pub conversions: u64,
    /// Requests refused by validation.
    pub rejected: u64,
    /// Plans invalidated between search and commit.
    pub replans: u64,
    /// Redelivered requests answered from the ledger.
    pub duplicates_suppressed: u64,
    /// Registry resets.
    pub resets: u64,
    /// Release operations that freed at least one unit.
    pub releases: u64,
}

#[derive(Debug, Default)]
struct EngineCounters {
    allocations: AtomicU64,
    shortfalls: AtomicU64,
    conversions: AtomicU64,
    rejected: AtomicU64,
    replans: AtomicU64,
    duplicates_suppressed: AtomicU64,
    resets: AtomicU64,
    releases: AtomicU64,
}

impl EngineCounters {
    fn snapshot(&self) -> EngineStats {
        EngineStats {
            allocations: self.allocations.load(Ordering::Relaxed),
            shortfalls: self.shortfalls.load(Ordering::Relaxed),
            conversions: self.conversions.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            replans: self.replans.load(Ordering::Relaxed),
            duplicates_suppressed: self.duplicates_suppressed.load(Ordering::Relaxed),
            resets: self.resets.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
        }
    }
}

/// Request fields after validation.
#[derive(Debug, Clone, Copy)]
struct Demand {
    rooms: usize,
    labs: usize,
    min_capacity: u32,
}

/// Tentative selection for one request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Plan {
    rooms: Vec<String>,
    labs: Vec<String>,
    conversions: Vec<String>,
    room_shortfall: usize,
    lab_shortfall: usize,
}

impl Plan {
    fn build(registry: &Registry, demand: Demand) -> Self {
        let rooms: Vec<String> = registry
            .iter()
            .filter(|u| u.fits(UnitKind::Room, demand.min_capacity))
            .take(demand.rooms)
            .map(|u| u.id.clone())
            .collect();
        let labs: Vec<String> = registry
            .iter()
            .filter(|u| u.fits(UnitKind::Lab, demand.min_capacity))
            .take(demand.labs)
            .map(|u| u.id.clone())
            .collect();

        let missing_labs = demand.labs - labs.len();
        let conversions: Vec<String> = if missing_labs > 0 {
            registry
                .iter()
                .filter(|u| u.fits(UnitKind::Room, demand.min_capacity))
                .skip(rooms.len())
                .take(missing_labs)
                .map(|u| u.id.clone())
                .collect()
        } else {
            Vec::new()
        };

        Self {
            room_shortfall: demand.rooms - rooms.len(),
            lab_shortfall: missing_labs - conversions.len(),
            rooms,
            labs,
            conversions,
        }
    }

    const fn is_complete(&self) -> bool {
        self.room_shortfall == 0 && self.lab_shortfall == 0
    }

    fn shortfall_notice(&self) -> String {
        format!(
            "shortfall of {} room(s) and {} lab(s)",
            self.room_shortfall, self.lab_shortfall
        )
    }

    fn conversion_notice(&self) -> Option<String> {
        if self.conversions.is_empty() {
            return None;
        }
        Some(format!(
            "converted {} room(s) to mobile lab(s): {}",
            self.conversions.len(),
            self.conversions.join(", ")
        ))
    }
}

struct EngineState {
    registry: Registry,
    ledger: Option<Box<dyn ReplyLedger>>,
}

/// Concurrency-safe allocation engine over a [`Registry`].
///
/// Cloning is cheap and every clone shares the same registry, gate, and
/// counters.
#[derive(Clone)]
pub struct AllocationEngine {
    state: Arc<RwLock<EngineState>>,
    gate: Arc<Semaphore>,
    catalog: Arc<FacultyCatalog>,
    sink: Arc<dyn DeltaSink>,
    counters: Arc<EngineCounters>,
    limits: EngineLimits,
}

impl std::fmt::Debug for AllocationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocationEngine")
            .field("limits", &self.limits)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl AllocationEngine {
    /// Engine over `registry` with no catalog, ledger, or replication.
    #[must_use]
    pub fn new(registry: Registry, limits: EngineLimits) -> Self {
        Self {
            state: Arc::new(RwLock::new(EngineState {
                registry,
                ledger: None,
            })),
            gate: Arc::new(Semaphore::new(limits.search_permits.max(1))),
            catalog: Arc::new(FacultyCatalog::default()),
            sink: Arc::new(NullDeltaSink),
            counters: Arc::new(EngineCounters::default()),
            limits,
        }
    }

    /// Reject faculties and programs unknown to `catalog`.
    #[must_use]
    pub fn with_catalog(mut self, catalog: FacultyCatalog) -> Self {
        self.catalog = Arc::new(catalog);
        self
    }

    /// Ship committed deltas to `sink`.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn DeltaSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Deduplicate requests by correlation id using `ledger`.
    #[must_use]
    pub fn with_ledger(self, ledger: Box<dyn ReplyLedger>) -> Self {
        self.state.write().ledger = Some(ledger);
        self
    }

    /// Limits in force.
    #[must_use]
    pub const fn limits(&self) -> &EngineLimits {
        &self.limits
    }

    /// Catalog used for validation.
    #[must_use]
    pub fn catalog(&self) -> &FacultyCatalog {
        &self.catalog
    }

    /// Check a request without touching the registry.
    ///
    /// # Errors
    ///
    /// Returns `AllocationError::Validation` describing the first problem.
    pub fn validate(&self, request: &AllocationRequest) -> Result<(), AllocationError> {
        check_request(&self.catalog, request)
    }

    /// Allocate rooms and labs for `request`.
    ///
    /// With a ledger attached and a `correlation_id` given, a request already
    /// answered gets the recorded reply without reserving again.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for malformed requests, `LockTimeout` or
    /// `GateClosed` when the engine cannot be entered in time. A shortfall is
    /// not an error.
    pub async fn allocate(
        &self,
        request: &AllocationRequest,
        correlation_id: Option<&str>,
    ) -> Result<AllocationResponse, AllocationError> {
        let demand = validate_request(&self.catalog, request).inspect_err(|e| {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            debug!(faculty = %request.faculty, program = %request.program, error = %e, "request rejected");
        })?;

        let permit = tokio::time::timeout(self.limits.lock_timeout, self.gate.acquire())
            .await
            .map_err(|_| AllocationError::LockTimeout(self.limits.lock_timeout))?
            .map_err(|_| AllocationError::GateClosed)?;

        let plan = {
            let state = self.read()?;
            if let Some(reply) = lookup(&state, correlation_id) {
                self.counters
                    .duplicates_suppressed
                    .fetch_add(1, Ordering::Relaxed);
                return Ok(reply);
            }
            Plan::build(&state.registry, demand)
        };
        drop(permit);

        self.commit(request, demand, plan, correlation_id)
    }

    fn commit(
        &self,
        request: &AllocationRequest,
        demand: Demand,
        plan: Plan,
        correlation_id: Option<&str>,
    ) -> Result<AllocationResponse, AllocationError> {
        let mut state = self.write()?;
        if let Some(reply) = lookup(&state, correlation_id) {
            self.counters
                .duplicates_suppressed
                .fetch_add(1, Ordering::Relaxed);
            return Ok(reply);
        }

        // The read-phase plan may miss a lower id freed since; only the
        // selection made under the write lock is committed.
        let fresh = Plan::build(&state.registry, demand);
        if fresh != plan {
            self.counters.replans.fetch_add(1, Ordering::Relaxed);
            debug!(
                faculty = %request.faculty,
                program = %request.program,
                "registry changed since search, replanned"
            );
        }
        let plan = fresh;

        let mut response = AllocationResponse {
            faculty: request.faculty.clone(),
            program: request.program.clone(),
            semester: request.semester,
            room_ids: Vec::new(),
            lab_ids: Vec::new(),
            notice: None,
            unavailable: false,
        };

        if !plan.is_complete() {
            self.counters.shortfalls.fetch_add(1, Ordering::Relaxed);
            response.notice = Some(plan.shortfall_notice());
            response.unavailable = true;
            info!(
                faculty = %request.faculty,
                program = %request.program,
                rooms_short = plan.room_shortfall,
                labs_short = plan.lab_shortfall,
                "allocation unavailable"
            );
            return Ok(response);
        }

        response.room_ids.clone_from(&plan.rooms);
        response.lab_ids = plan
            .labs
            .iter()
            .chain(plan.conversions.iter())
            .cloned()
            .collect();
        response.notice = plan.conversion_notice();

        let assigned: Vec<String> = response
            .room_ids
            .iter()
            .chain(response.lab_ids.iter())
            .cloned()
            .collect();
        if assigned.is_empty() {
            self.counters.allocations.fetch_add(1, Ordering::Relaxed);
            return Ok(response);
        }

        if !plan.conversions.is_empty() {
            let convert = StateDelta {
                op: DeltaOp::Convert,
                unit_ids: plan.conversions.clone(),
                fields: DeltaFields {
                    kind: Some(UnitKind::Lab),
                    ..DeltaFields::default()
                },
            };
            state.registry.apply_delta(&convert)?;
            self.sink.ship(convert);
            self.counters
                .conversions
                .fetch_add(plan.conversions.len() as u64, Ordering::Relaxed);
            info!(rooms = ?plan.conversions, "rooms converted to mobile labs");
        }

        let assigned_at = now_ms();
        let assign = StateDelta {
            op: DeltaOp::Assign,
            unit_ids: assigned,
            fields: DeltaFields {
                kind: None,
                faculty: Some(request.faculty.clone()),
                program: Some(request.program.clone()),
                requested_at: Some(request.requested_at.unwrap_or(assigned_at)),
                assigned_at: Some(assigned_at),
                correlation_id: correlation_id.map(str::to_string),
                reply: correlation_id.map(|_| response.clone()),
            },
        };
        state.registry.apply_delta(&assign)?;
        if let (Some(ledger), Some(id)) = (state.ledger.as_mut(), correlation_id) {
            ledger.record(id.to_string(), response.clone());
        }
        self.sink.ship(assign);
        self.counters.allocations.fetch_add(1, Ordering::Relaxed);
        debug!(
            faculty = %request.faculty,
            program = %request.program,
            rooms = response.room_ids.len(),
            labs = response.lab_ids.len(),
            "allocation committed"
        );
        Ok(response)
    }

    /// Return every unit to baseline, reverting conversions and clearing the
    /// ledger. Returns how many units changed.
    ///
    /// # Errors
    ///
    /// Returns `LockTimeout` if the registry lock is not acquired in time.
    pub fn reset(&self) -> Result<usize, AllocationError> {
        let mut state = self.write()?;
        let changed = state.registry.reset_all();
        if let Some(ledger) = state.ledger.as_mut() {
            ledger.clear();
        }
        self.sink.ship(StateDelta::new(DeltaOp::Reset, Vec::new()));
        self.counters.resets.fetch_add(1, Ordering::Relaxed);
        info!(changed, "registry reset");
        Ok(changed)
    }

    /// Free every unit held by a faculty/program pair. Returns the freed ids.
    ///
    /// # Errors
    ///
    /// Returns `LockTimeout` if the registry lock is not acquired in time.
    pub fn release(&self, faculty: &str, program: &str) -> Result<Vec<String>, AllocationError> {
        let mut state = self.write()?;
        let ids = state.registry.held_by(faculty, program);
        if ids.is_empty() {
            return Ok(ids);
        }
        let release = StateDelta {
            op: DeltaOp::Release,
            unit_ids: ids.clone(),
            fields: DeltaFields {
                faculty: Some(faculty.to_string()),
                program: Some(program.to_string()),
                ..DeltaFields::default()
            },
        };
        state.registry.apply_delta(&release)?;
        if let Some(ledger) = state.ledger.as_mut() {
            ledger.forget_pair(faculty, program);
        }
        self.sink.ship(release);
        self.counters.releases.fetch_add(1, Ordering::Relaxed);
        info!(faculty, program, freed = ids.len(), "units released");
        Ok(ids)
    }

    /// Apply a delta received from the peer. Nothing is shipped.
    ///
    /// # Errors
    ///
    /// Returns `Registry` if the delta names an unknown unit, or
    /// `LockTimeout`.
    pub fn apply_delta(&self, delta: &StateDelta) -> Result<(), AllocationError> {
        let mut state = self.write()?;
        state.registry.apply_delta(delta)?;
        let fields = &delta.fields;
        if let Some(ledger) = state.ledger.as_mut() {
            match delta.op {
                DeltaOp::Assign => {
                    if let (Some(id), Some(reply)) = (&fields.correlation_id, &fields.reply) {
                        ledger.record(id.clone(), reply.clone());
                    }
                }
                DeltaOp::Release => {
                    if let (Some(faculty), Some(program)) = (&fields.faculty, &fields.program) {
                        ledger.forget_pair(faculty, program);
                    }
                }
                DeltaOp::Reset if delta.unit_ids.is_empty() => ledger.clear(),
                DeltaOp::Reset | DeltaOp::Convert => {}
            }
        }
        Ok(())
    }

    /// Replace the registry with a peer snapshot. The ledger is kept.
    ///
    /// # Errors
    ///
    /// Returns `Registry` for duplicate ids, or `LockTimeout`.
    pub fn apply_snapshot(&self, units: Vec<ClassroomUnit>) -> Result<(), AllocationError> {
        let mut state = self.write()?;
        state.registry.replace_all(units)?;
        Ok(())
    }

    /// Run `f` against the registry under the read lock.
    ///
    /// # Errors
    ///
    /// Returns `LockTimeout` if the lock is not acquired in time.
    pub fn with_registry<R>(&self, f: impl FnOnce(&Registry) -> R) -> Result<R, AllocationError> {
        let state = self.read()?;
        Ok(f(&state.registry))
    }

    /// Aggregate registry counts.
    ///
    /// # Errors
    ///
    /// Returns `LockTimeout` if the lock is not acquired in time.
    pub fn counts(&self) -> Result<RegistryCounts, AllocationError> {
        self.with_registry(Registry::counts)
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> EngineStats {
        self.counters.snapshot()
    }

    /// Refuse new requests from now on.
    pub fn close(&self) {
        self.gate.close();
        warn!("allocation gate closed");
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, EngineState>, AllocationError> {
        self.state
            .try_read_for(self.limits.lock_timeout)
            .ok_or(AllocationError::LockTimeout(self.limits.lock_timeout))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, EngineState>, AllocationError> {
        self.state
            .try_write_for(self.limits.lock_timeout)
            .ok_or(AllocationError::LockTimeout(self.limits.lock_timeout))
    }
}

fn lookup(state: &EngineState, correlation_id: Option<&str>) -> Option<AllocationResponse> {
    let id = correlation_id?;
    state.ledger.as_ref()?.lookup(id)
}

/// Validate a request against `catalog` without an engine.
///
/// # Errors
///
/// Returns `AllocationError::Validation` describing the first problem.
pub fn check_request(
    catalog: &FacultyCatalog,
    request: &AllocationRequest,
) -> Result<(), AllocationError> {
    validate_request(catalog, request).map(|_| ())
}

fn validate_request(
    catalog: &FacultyCatalog,
    request: &AllocationRequest,
) -> Result<Demand, AllocationError> {
    catalog.check(&request.faculty, &request.program)?;
    if !(1..=MAX_SEMESTER).contains(&request.semester) {
        return Err(AllocationError::Validation(format!(
            "semester {} outside 1..={MAX_SEMESTER}",
            request.semester
        )));
    }
    let count = |value: i64, field: &str| {
        usize::try_from(value)
            .map_err(|_| AllocationError::Validation(format!("{field} must be >= 0, got {value}")))
    };
    let rooms = count(request.rooms, "rooms")?;
    let labs = count(request.labs, "labs")?;
    let min_capacity = u32::try_from(request.min_capacity).map_err(|_| {
        AllocationError::Validation(format!(
            "minCapacity out of range, got {}",
            request.min_capacity
        ))
    })?;
    Ok(Demand {
        rooms,
        labs,
        min_capacity,
    })
}
