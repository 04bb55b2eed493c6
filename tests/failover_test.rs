//! Full deployments: broker, ACTIVE/STANDBY pair and faculty gateways.
//!
//! This test validates:
//! 1. Requests flow end to end and the STANDBY mirrors every commit
//! 2. Killing the ACTIVE node promotes the STANDBY within the timeout
//! 3. A healed partition demotes the stale ACTIVE and resyncs it
//! 4. Snapshots persist across restarts

use std::future::Future;
use std::time::{Duration, Instant};

use classroom_broker::builders::Deployment;
use classroom_broker::config::{
    BrokerConfig, EngineConfig, GatewayConfig, NodeConfig, SystemConfig,
};
use classroom_broker::core::{AllocationRequest, GatewayError, NodeError, Role};
use classroom_broker::runtime::{NodeHandle, NodeStatus};

const HEARTBEAT_TIMEOUT: Duration = Duration::from_millis(300);
const WAIT: Duration = Duration::from_secs(5);

fn fast_config() -> SystemConfig {
    let mut faculties = std::collections::BTreeMap::new();
    faculties.insert(
        "Engineering".to_string(),
        vec!["Systems".to_string(), "Civil".to_string()],
    );
    faculties.insert("Medicine".to_string(), vec!["Nursing".to_string()]);
    SystemConfig {
        broker: BrokerConfig {
            liveness_timeout_ms: 400,
            sweep_interval_ms: 25,
            ..BrokerConfig::default()
        },
        node: NodeConfig {
            heartbeat_interval_ms: 50,
            heartbeat_timeout_ms: u64::try_from(HEARTBEAT_TIMEOUT.as_millis()).unwrap(),
            snapshot_interval_ms: 150,
            handler_slots: 2,
            broker_ping_interval_ms: 50,
            snapshot_path: None,
        },
        engine: EngineConfig {
            lock_timeout_ms: 100,
            ..EngineConfig::default()
        },
        gateway: GatewayConfig {
            reply_timeout_ms: 700,
            max_retries: 4,
            retry_base_delay_ms: 50,
            retry_max_delay_ms: 200,
        },
        faculties,
        ..SystemConfig::default()
    }
}

fn systems(rooms: i64, labs: i64) -> AllocationRequest {
    AllocationRequest::new("Engineering", "Systems", 4, rooms, labs, 30)
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + WAIT;
    while !check().await {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn status(node: &NodeHandle) -> NodeStatus {
    node.status().await.expect("node is running")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_end_to_end_allocation_is_mirrored() {
    let deployment = Deployment::launch(fast_config()).unwrap();
    let mut gateway = deployment.gateway("Engineering").unwrap();

    let response = gateway.request(&systems(8, 3)).await.unwrap();
    assert_eq!(response.room_ids.len(), 8);
    assert_eq!(response.room_ids[0], "R001");
    assert_eq!(response.lab_ids, vec!["L001", "L002", "L003"]);

    let backup = deployment.backup().clone();
    eventually("standby to mirror the reservation", || {
        let backup = backup.clone();
        async move { status(&backup).await.counts.reserved == 11 }
    })
    .await;

    let primary = status(deployment.primary()).await;
    assert_eq!(primary.role, Role::Active);
    assert_eq!(primary.registered_slots, 2);
    assert_eq!(primary.stats.allocations, 1);
    let mirror = status(&backup).await;
    assert_eq!(mirror.role, Role::Standby);
    assert_eq!(mirror.registered_slots, 0);
    assert_eq!(mirror.counts, primary.counts);

    deployment.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_gateway_rejects_unknown_program_locally() {
    let deployment = Deployment::launch(fast_config()).unwrap();
    let mut gateway = deployment.gateway("Engineering").unwrap();

    let result = gateway
        .request(&AllocationRequest::new("Engineering", "Nursing", 2, 1, 0, 0))
        .await;
    assert!(matches!(result, Err(GatewayError::Rejected(_))), "{result:?}");

    let result = gateway
        .request(&AllocationRequest::new("Medicine", "Nursing", 2, 1, 0, 0))
        .await;
    assert!(matches!(result, Err(GatewayError::Rejected(_))), "{result:?}");

    assert_eq!(status(deployment.primary()).await.stats.allocations, 0);
    deployment.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shortfall_is_not_an_error() {
    let deployment = Deployment::launch(fast_config()).unwrap();
    let mut gateway = deployment.gateway("Engineering").unwrap();

    let response = gateway.request(&systems(11, 0)).await.unwrap();

    assert!(response.unavailable);
    assert!(response.room_ids.is_empty());
    assert_eq!(status(deployment.primary()).await.counts.reserved, 0);
    deployment.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_killed_active_is_replaced_within_timeout() {
    let deployment = Deployment::launch(fast_config()).unwrap();
    let mut gateway = deployment.gateway("Engineering").unwrap();
    gateway.request(&systems(2, 0)).await.unwrap();

    let backup = deployment.backup().clone();
    eventually("standby to mirror the reservation", || {
        let backup = backup.clone();
        async move { status(&backup).await.counts.reserved == 2 }
    })
    .await;

    let killed_at = Instant::now();
    deployment.primary().kill();
    eventually("standby promotion", || {
        let backup = backup.clone();
        async move { status(&backup).await.role == Role::Active }
    })
    .await;
    let elapsed = killed_at.elapsed();
    assert!(
        elapsed < HEARTBEAT_TIMEOUT + Duration::from_millis(700),
        "promotion took {elapsed:?}"
    );

    let promoted = status(&backup).await;
    assert_eq!(promoted.generation, 1);
    assert_eq!(promoted.registered_slots, 2);

    let response = gateway.request(&systems(2, 1)).await.unwrap();
    assert_eq!(response.room_ids, vec!["R003", "R004"]);
    assert_eq!(response.lab_ids, vec!["L001"]);
    assert!(deployment.primary().status().await.is_err());

    deployment.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_healed_partition_demotes_stale_active() {
    let deployment = Deployment::launch(fast_config()).unwrap();
    let mut gateway = deployment.gateway("Engineering").unwrap();
    gateway.request(&systems(2, 0)).await.unwrap();

    let primary = deployment.primary().clone();
    let backup = deployment.backup().clone();
    eventually("standby to mirror the reservation", || {
        let backup = backup.clone();
        async move { status(&backup).await.counts.reserved == 2 }
    })
    .await;

    primary.partition(true).await.unwrap();
    eventually("standby promotion during partition", || {
        let backup = backup.clone();
        async move { status(&backup).await.role == Role::Active }
    })
    .await;
    assert_eq!(status(&primary).await.role, Role::Active);

    // Diverge the isolated node so the resync is observable.
    let freed = primary.release("Engineering", "Systems").await.unwrap();
    assert_eq!(freed.len(), 2);
    assert_eq!(status(&primary).await.counts.reserved, 0);

    primary.partition(false).await.unwrap();
    eventually("stale active to yield", || {
        let primary = primary.clone();
        async move { status(&primary).await.role == Role::Standby }
    })
    .await;
    eventually("stale active to resync", || {
        let primary = primary.clone();
        async move { status(&primary).await.counts.reserved == 2 }
    })
    .await;

    let demoted = status(&primary).await;
    assert_eq!(demoted.generation, 1);
    assert_eq!(demoted.registered_slots, 0);
    let active = deployment.active_node().await.expect("exactly one active node");
    assert_eq!(active.node_id(), backup.node_id());

    assert!(matches!(primary.cleanup().await, Err(NodeError::NotActive)));
    assert_eq!(backup.cleanup().await.unwrap(), 2);
    eventually("reset to reach the standby", || {
        let primary = primary.clone();
        async move { status(&primary).await.counts.reserved == 0 }
    })
    .await;

    deployment.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_snapshot_restores_registry_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = fast_config();
    config.node.snapshot_path = Some(dir.path().to_path_buf());

    let deployment = Deployment::launch(config.clone()).unwrap();
    let mut gateway = deployment.gateway("Engineering").unwrap();
    gateway.request(&systems(0, 4)).await.unwrap();
    let backup_file = dir.path().join("backup.snapshot");
    eventually("standby snapshot on disk", || {
        let path = backup_file.clone();
        async move {
            std::fs::read_to_string(&path).is_ok_and(|text| text.contains("mobile"))
        }
    })
    .await;
    drop(gateway);
    deployment.shutdown().await.unwrap();
    assert!(dir.path().join("primary.snapshot").exists());

    let restarted = Deployment::launch(config).unwrap();
    let counts = status(restarted.primary()).await.counts;
    assert_eq!(counts.reserved, 4);
    assert_eq!(counts.converted, 1);

    let mut gateway = restarted.gateway("Engineering").unwrap();
    let response = gateway.request(&systems(1, 0)).await.unwrap();
    assert_eq!(response.room_ids, vec!["R002"]);
    restarted.shutdown().await.unwrap();
}
