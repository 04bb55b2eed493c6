//! Core domain: registry, allocation engine, routing and failover state.

pub mod allocation;
pub mod broker;
pub mod catalog;
pub mod error;
pub mod executor;
pub mod failover;
pub mod message;
pub mod registry;
pub mod replication;

pub use allocation::{
    check_request, AllocationEngine, EngineLimits, EngineStats, ReplyLedger, MAX_SEMESTER,
};
pub use broker::{
    Action, BrokerLimits, BrokerStatus, EnvelopeQueue, LoadBalancer, PendingEnvelope, WorkerHandle,
};
pub use catalog::FacultyCatalog;
pub use error::{
    AllocationError, AppResult, BrokerError, GatewayError, NodeError, RegistryError, SnapshotError,
    TransportError,
};
pub use executor::{AllocationHandler, RequestHandler};
pub use failover::{FailoverMachine, Transition};
pub use message::{
    AllocationRequest, AllocationResponse, ClientAddress, DeltaFields, DeltaOp, Envelope,
    ErrorReply, FailureKind, HeartbeatRecord, ReplicationMessage, Reply, Role, StateDelta,
    WorkerAddress,
};
pub use registry::{ClassroomUnit, Registry, RegistryCounts, Reservation, UnitKind, UnitStatus};
pub use replication::{DeltaSink, InMemoryDeltaSink, NullDeltaSink, ReplicationStream};
