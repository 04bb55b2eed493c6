//! Tests for configuration validation

use classroom_broker::config::{
    BrokerConfig, EngineConfig, GatewayConfig, InventoryConfig, NodeConfig, SystemConfig,
};
use classroom_broker::core::{ClassroomUnit, RegistryError};

#[test]
fn test_broker_config_validation() {
    assert!(BrokerConfig::default().validate().is_ok());
    let no_queue = BrokerConfig {
        max_pending: 0,
        ..BrokerConfig::default()
    };
    assert!(no_queue.validate().is_err());
    let slow_sweep = BrokerConfig {
        sweep_interval_ms: 6_000,
        ..BrokerConfig::default()
    };
    assert!(slow_sweep.validate().is_err());
}

#[test]
fn test_node_config_zero_slots() {
    let node = NodeConfig {
        handler_slots: 0,
        ..NodeConfig::default()
    };
    assert_eq!(node.validate().unwrap_err(), "handler_slots must be greater than 0");
}

#[test]
fn test_engine_config_ledger_needs_capacity() {
    let engine = EngineConfig {
        ledger_capacity: 0,
        ..EngineConfig::default()
    };
    assert!(engine.validate().is_err());
    let no_dedup = EngineConfig {
        dedup: false,
        ..engine
    };
    assert!(no_dedup.validate().is_ok());
}

#[test]
fn test_gateway_config_delay_bounds() {
    let gateway = GatewayConfig {
        retry_base_delay_ms: 1_000,
        retry_max_delay_ms: 10,
        ..GatewayConfig::default()
    };
    assert!(gateway.validate().is_err());
}

#[test]
fn test_ping_must_beat_liveness() {
    let mut cfg = SystemConfig::default();
    cfg.node.broker_ping_interval_ms = cfg.broker.liveness_timeout_ms;
    assert!(cfg.validate().unwrap_err().contains("broker_ping_interval_ms"));
}

#[test]
fn test_lock_wait_must_stay_under_heartbeat_timeout() {
    let mut cfg = SystemConfig::default();
    cfg.node.heartbeat_timeout_ms = 800;
    cfg.engine.lock_timeout_ms = 401;
    assert!(cfg.validate().unwrap_err().contains("lock_timeout_ms"));

    cfg.engine.lock_timeout_ms = 400;
    assert!(cfg.validate().is_ok());
}

#[test]
fn test_slots_cannot_outnumber_search_permits() {
    let mut cfg = SystemConfig::default();
    cfg.engine.search_permits = 4;
    cfg.node.handler_slots = 5;
    assert!(cfg.validate().unwrap_err().contains("handler_slots"));

    cfg.node.handler_slots = 4;
    assert!(cfg.validate().is_ok());
}

#[test]
fn test_faculty_without_programs() {
    let err = SystemConfig::from_json_str(r#"{"faculties":{"Law":[]}}"#).unwrap_err();
    assert_eq!(err, "faculty `Law` lists no programs");
}

#[test]
fn test_malformed_json() {
    let err = SystemConfig::from_json_str("{not json").unwrap_err();
    assert!(err.starts_with("parse error"));
}

#[test]
fn test_explicit_inventory_replaces_generated() {
    let cfg = SystemConfig::from_json_str(
        r#"{"inventory":{"units":[
            {"id":"A101","kind":"ROOM","capacity":60},
            {"id":"B201","kind":"LAB","capacity":24}
        ]}}"#,
    )
    .unwrap();
    let ids: Vec<_> = cfg.inventory.units().into_iter().map(|u| u.id).collect();
    assert_eq!(ids, vec!["A101", "B201"]);
}

#[test]
fn test_inventory_rejects_reserved_or_duplicate_units() {
    let mut reserved = ClassroomUnit::room("R001", 40);
    reserved.reservation = Some(classroom_broker::core::Reservation {
        faculty: "Engineering".into(),
        program: "Systems".into(),
        requested_at: 1,
        assigned_at: 2,
    });
    let inventory = InventoryConfig {
        units: vec![reserved],
        ..InventoryConfig::default()
    };
    assert!(inventory.validate().is_err());

    let duplicate = InventoryConfig {
        units: vec![ClassroomUnit::room("R001", 40), ClassroomUnit::lab("R001", 30)],
        ..InventoryConfig::default()
    };
    assert_eq!(
        duplicate.build_registry().unwrap_err(),
        RegistryError::DuplicateUnit("R001".into())
    );
}

#[test]
fn test_empty_inventory_is_invalid() {
    let inventory = InventoryConfig {
        room_count: 0,
        lab_count: 0,
        ..InventoryConfig::default()
    };
    assert!(inventory.validate().is_err());
}

#[test]
fn test_env_snapshot_path_and_timeouts() {
    let cfg = SystemConfig::from_vars([
        ("CLASSROOM_SNAPSHOT_PATH".to_string(), "/var/lib/classrooms".to_string()),
        ("CLASSROOM_HEARTBEAT_INTERVAL_MS".to_string(), "250".to_string()),
        ("CLASSROOM_HEARTBEAT_TIMEOUT_MS".to_string(), "1000".to_string()),
    ])
    .unwrap();
    assert_eq!(
        cfg.node.snapshot_path.as_deref(),
        Some(std::path::Path::new("/var/lib/classrooms"))
    );
    assert_eq!(cfg.node.heartbeat_timeout().as_millis(), 1000);
}

#[test]
fn test_env_override_result_is_validated() {
    let err = SystemConfig::from_vars([(
        "CLASSROOM_HEARTBEAT_TIMEOUT_MS".to_string(),
        "10".to_string(),
    )])
    .unwrap_err();
    assert!(err.starts_with("node invalid"));
}
