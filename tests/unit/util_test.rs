//! Tests for utility functions

use std::time::Duration;

use classroom_broker::config::GatewayConfig;
use classroom_broker::util::{now_ms, RetryPolicy};

#[test]
fn test_default_policy() {
    let policy = RetryPolicy::default();
    assert_eq!(policy.attempts(), 4);
    assert_eq!(policy.delay_for(1), Duration::from_millis(500));
    assert_eq!(policy.delay_for(2), Duration::from_secs(1));
}

#[test]
fn test_gateway_config_builds_policy() {
    let policy = GatewayConfig {
        max_retries: 2,
        retry_base_delay_ms: 40,
        retry_max_delay_ms: 60,
        ..GatewayConfig::default()
    }
    .retry_policy();
    assert_eq!(policy.attempts(), 3);
    assert_eq!(policy.delay_for(0), Duration::ZERO);
    assert_eq!(policy.delay_for(1), Duration::from_millis(40));
    assert_eq!(policy.delay_for(2), Duration::from_millis(60));
}

#[test]
fn test_huge_attempt_stays_capped() {
    let policy = RetryPolicy::new(u32::MAX);
    assert_eq!(policy.attempts(), u32::MAX);
    assert_eq!(policy.delay_for(u32::MAX), policy.max_delay);
}

#[test]
fn test_now_ms_is_after_2020() {
    assert!(now_ms() > 1_577_836_800_000);
}
