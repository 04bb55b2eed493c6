//! Error types for allocation, routing and failover.

use std::time::Duration;

use thiserror::Error;

use crate::core::message::FailureKind;

/// Errors produced by the allocation engine.
///
/// A resource shortfall is not an error: it is reported through
/// `AllocationResponse::unavailable`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocationError {
    /// Malformed request or unknown faculty/program. Never retried.
    #[error("validation error: {0}")]
    Validation(String),
    /// The registry lock was not acquired in time.
    #[error("registry lock not acquired within {0:?}")]
    LockTimeout(Duration),
    /// The search gate was closed or not acquired in time.
    #[error("allocation gate closed")]
    GateClosed,
    /// A delta or snapshot did not match the registry.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Registry integrity violations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// Two units share an id.
    #[error("duplicate unit id: {0}")]
    DuplicateUnit(String),
    /// A delta referenced an id that is not in the registry.
    #[error("unknown unit id: {0}")]
    UnknownUnit(String),
    /// A conversion named a unit that is not an available room.
    #[error("unit {0} is not an available room")]
    NotConvertible(String),
}

/// Errors surfaced by the broker handle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// The pending queue reached its configured depth.
    #[error("pending queue full ({0} envelopes)")]
    QueueFull(usize),
    /// The broker is draining and no longer accepts requests.
    #[error("broker shutting down")]
    ShuttingDown,
    /// The broker control loop has stopped.
    #[error("broker channel closed")]
    Closed,
}

/// Failures between a gateway and the broker.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// No reply arrived within the reply timeout.
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    /// The broker or reply channel went away.
    #[error("broker disconnected")]
    Disconnected,
    /// A reply arrived that could not be decoded.
    #[error("malformed reply: {0}")]
    MalformedReply(String),
    /// Every attempt failed.
    #[error("gave up after {attempts} attempts")]
    RetriesExhausted {
        /// Attempts made, including the first.
        attempts: u32,
    },
}

/// Errors returned to the gateway's caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// Rejected as invalid, locally or by the worker. Never retried.
    #[error("request rejected: {0}")]
    Rejected(String),
    /// The broker or worker answered with a terminal failure.
    #[error("request failed ({kind:?}): {reason}")]
    Failed {
        /// Failure category.
        kind: FailureKind,
        /// Reason given in the reply.
        reason: String,
    },
    /// Terminal communication failure after retries.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Errors from snapshot persistence.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// Underlying file I/O failed.
    #[error("snapshot io: {0}")]
    Io(#[from] std::io::Error),
    /// A record line could not be decoded.
    #[error("snapshot line {line}: {reason}")]
    Parse {
        /// 1-based line number.
        line: usize,
        /// What was wrong with it.
        reason: String,
    },
    /// The decoded units violated registry integrity.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Errors from worker node control.
#[derive(Debug, Error)]
pub enum NodeError {
    /// The node task has stopped.
    #[error("node channel closed")]
    Closed,
    /// The command needs an ACTIVE node.
    #[error("node is not active")]
    NotActive,
    /// The engine refused the operation.
    #[error(transparent)]
    Allocation(#[from] AllocationError),
    /// Snapshot persistence failed.
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
