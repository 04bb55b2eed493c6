//! Tests for error types

use std::time::Duration;

use classroom_broker::core::{
    AllocationError, BrokerError, FailureKind, GatewayError, NodeError, RegistryError,
    SnapshotError, TransportError,
};

#[test]
fn test_validation_error() {
    let err = AllocationError::Validation("rooms must be >= 0, got -1".into());
    assert_eq!(err.to_string(), "validation error: rooms must be >= 0, got -1");
}

#[test]
fn test_lock_timeout_error() {
    let err = AllocationError::LockTimeout(Duration::from_millis(500));
    assert_eq!(err.to_string(), "registry lock not acquired within 500ms");
}

#[test]
fn test_registry_error_is_transparent() {
    let err: AllocationError = RegistryError::UnknownUnit("R099".into()).into();
    assert_eq!(err.to_string(), "unknown unit id: R099");
    assert_eq!(err, AllocationError::Registry(RegistryError::UnknownUnit("R099".into())));
}

#[test]
fn test_broker_errors() {
    assert_eq!(BrokerError::QueueFull(8).to_string(), "pending queue full (8 envelopes)");
    assert_eq!(BrokerError::ShuttingDown.to_string(), "broker shutting down");
    assert_eq!(BrokerError::Closed.to_string(), "broker channel closed");
}

#[test]
fn test_retries_exhausted_error() {
    let err = GatewayError::from(TransportError::RetriesExhausted { attempts: 4 });
    assert_eq!(err.to_string(), "gave up after 4 attempts");
}

#[test]
fn test_failed_reply_error() {
    let err = GatewayError::Failed {
        kind: FailureKind::Eviction,
        reason: "worker lost twice".into(),
    };
    assert_eq!(err.to_string(), "request failed (Eviction): worker lost twice");
}

#[test]
fn test_snapshot_parse_error() {
    let err = SnapshotError::Parse {
        line: 3,
        reason: "unknown kind `hall`".into(),
    };
    assert_eq!(err.to_string(), "snapshot line 3: unknown kind `hall`");
}

#[test]
fn test_node_error_wraps_allocation() {
    let err = NodeError::from(AllocationError::GateClosed);
    assert!(matches!(err, NodeError::Allocation(AllocationError::GateClosed)));
    assert_eq!(err.to_string(), "allocation gate closed");
    assert_eq!(NodeError::NotActive.to_string(), "node is not active");
}
