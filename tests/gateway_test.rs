//! Gateway retry behaviour against a broker with hand-driven workers.

use std::time::Duration;

use classroom_broker::config::{BrokerConfig, GatewayConfig};
use classroom_broker::core::{
    AllocationRequest, AllocationResponse, Envelope, ErrorReply, FailureKind, GatewayError,
    TransportError, WorkerAddress,
};
use classroom_broker::runtime::{BrokerService, GatewayClient, WorkerLink};
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(3);

fn quick_gateway() -> GatewayConfig {
    GatewayConfig {
        reply_timeout_ms: 150,
        max_retries: 2,
        retry_base_delay_ms: 10,
        retry_max_delay_ms: 40,
    }
}

fn endpoint(link: &WorkerLink, name: &str) -> (WorkerAddress, mpsc::UnboundedReceiver<Envelope>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let address = WorkerAddress(name.to_string());
    link.ready(address.clone(), tx).unwrap();
    (address, rx)
}

async fn next_dispatch(rx: &mut mpsc::UnboundedReceiver<Envelope>) -> Envelope {
    timeout(WAIT, rx.recv()).await.unwrap().unwrap()
}

fn request() -> AllocationRequest {
    AllocationRequest::new("Engineering", "Systems", 2, 1, 0, 0)
}

fn answer(envelope: &Envelope) -> Vec<u8> {
    let req = AllocationRequest::from_payload(&envelope.payload).unwrap();
    serde_json::to_vec(&AllocationResponse {
        faculty: req.faculty,
        program: req.program,
        semester: req.semester,
        room_ids: vec!["R001".into()],
        lab_ids: Vec::new(),
        notice: None,
        unavailable: false,
    })
    .unwrap()
}

#[tokio::test]
async fn test_retry_reuses_correlation_id() {
    let (broker, _task) = BrokerService::spawn(BrokerConfig::default());
    let link = broker.worker_link();
    let (_, mut silent) = endpoint(&link, "a-silent");
    let (helpful, mut helpful_rx) = endpoint(&link, "b-helpful");
    let mut gateway = GatewayClient::connect("Engineering", &broker, &quick_gateway()).unwrap();

    let worker = tokio::spawn(async move {
        let first = next_dispatch(&mut silent).await;
        let second = next_dispatch(&mut helpful_rx).await;
        assert_eq!(first.correlation_id, second.correlation_id);
        let stamped = AllocationRequest::from_payload(&second.payload).unwrap();
        assert!(stamped.requested_at.is_some());
        link.reply(helpful, second.reply_with(answer(&second))).unwrap();
        silent
    });

    let response = gateway.request(&request()).await.unwrap();
    assert_eq!(response.room_ids, vec!["R001"]);
    worker.await.unwrap();
}

#[tokio::test]
async fn test_malformed_reply_is_retried() {
    let (broker, _task) = BrokerService::spawn(BrokerConfig::default());
    let link = broker.worker_link();
    let (worker, mut rx) = endpoint(&link, "flaky");
    let mut gateway = GatewayClient::connect("Engineering", &broker, &quick_gateway()).unwrap();

    let driver = tokio::spawn(async move {
        let first = next_dispatch(&mut rx).await;
        link.reply(worker.clone(), first.reply_with(b"not json".to_vec()))
            .unwrap();
        let second = next_dispatch(&mut rx).await;
        link.reply(worker, second.reply_with(answer(&second))).unwrap();
    });

    let response = gateway.request(&request()).await.unwrap();
    assert_eq!(response.program, "Systems");
    driver.await.unwrap();
}

#[tokio::test]
async fn test_no_worker_exhausts_retries() {
    let (broker, _task) = BrokerService::spawn(BrokerConfig::default());
    let mut gateway = GatewayClient::connect("Engineering", &broker, &quick_gateway()).unwrap();

    let result = gateway.request(&request()).await;

    assert_eq!(
        result,
        Err(GatewayError::Transport(TransportError::RetriesExhausted {
            attempts: 3
        }))
    );
}

#[tokio::test]
async fn test_terminal_error_reply_is_not_retried() {
    let (broker, _task) = BrokerService::spawn(BrokerConfig::default());
    let link = broker.worker_link();
    let (worker, mut rx) = endpoint(&link, "strict");
    let mut gateway = GatewayClient::connect("Engineering", &broker, &quick_gateway()).unwrap();

    let driver = tokio::spawn(async move {
        let first = next_dispatch(&mut rx).await;
        let refusal = ErrorReply::new(FailureKind::Internal, "engine busy").to_payload();
        link.reply(worker, first.reply_with(refusal)).unwrap();
        assert!(timeout(Duration::from_millis(300), rx.recv()).await.is_err());
    });

    let result = gateway.request(&request()).await;
    assert_eq!(
        result,
        Err(GatewayError::Failed {
            kind: FailureKind::Internal,
            reason: "engine busy".into()
        })
    );
    driver.await.unwrap();
}

#[tokio::test]
async fn test_worker_validation_error_maps_to_rejected() {
    let (broker, _task) = BrokerService::spawn(BrokerConfig::default());
    let link = broker.worker_link();
    let (worker, mut rx) = endpoint(&link, "validator");
    let mut gateway = GatewayClient::connect("Engineering", &broker, &quick_gateway()).unwrap();

    let driver = tokio::spawn(async move {
        let first = next_dispatch(&mut rx).await;
        let refusal = ErrorReply::new(FailureKind::Validation, "unknown program").to_payload();
        link.reply(worker, first.reply_with(refusal)).unwrap();
    });

    let result = gateway.request(&request()).await;
    assert_eq!(result, Err(GatewayError::Rejected("unknown program".into())));
    driver.await.unwrap();
}

#[tokio::test]
async fn test_local_validation_skips_the_broker() {
    let (broker, _task) = BrokerService::spawn(BrokerConfig::default());
    let mut gateway = GatewayClient::connect("Engineering", &broker, &quick_gateway()).unwrap();

    let negative = AllocationRequest::new("Engineering", "Systems", 2, -1, 0, 0);
    assert!(matches!(
        gateway.request(&negative).await,
        Err(GatewayError::Rejected(_))
    ));
    let foreign = AllocationRequest::new("Medicine", "Nursing", 2, 1, 0, 0);
    assert!(matches!(
        gateway.request(&foreign).await,
        Err(GatewayError::Rejected(_))
    ));
    assert_eq!(broker.status().await.unwrap().pending_requests, 0);
}

#[tokio::test]
async fn test_stopped_broker_is_disconnected() {
    let (broker, task) = BrokerService::spawn(BrokerConfig::default());
    let mut gateway = GatewayClient::connect("Engineering", &broker, &quick_gateway()).unwrap();
    broker.shutdown().await.unwrap();
    task.await.unwrap();

    let result = gateway.request(&request()).await;

    assert_eq!(
        result,
        Err(GatewayError::Transport(TransportError::Disconnected))
    );
    assert!(GatewayClient::connect("Engineering", &broker, &quick_gateway()).is_err());
}
