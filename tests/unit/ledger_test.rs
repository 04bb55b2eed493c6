//! Tests for the in-memory reply ledger

use classroom_broker::core::{AllocationResponse, ReplyLedger};
use classroom_broker::infra::InMemoryReplyLedger;

fn reply(program: &str, room: &str) -> AllocationResponse {
    AllocationResponse {
        faculty: "Engineering".into(),
        program: program.into(),
        semester: 2,
        room_ids: vec![room.into()],
        lab_ids: Vec::new(),
        notice: None,
        unavailable: false,
    }
}

#[test]
fn test_lookup_returns_recorded_reply() {
    let mut ledger = InMemoryReplyLedger::new(4);
    ledger.record("c1".into(), reply("Systems", "R001"));

    assert_eq!(ledger.lookup("c1"), Some(reply("Systems", "R001")));
    assert!(ledger.lookup("c2").is_none());
}

#[test]
fn test_rerecording_keeps_single_entry() {
    let mut ledger = InMemoryReplyLedger::new(2);
    ledger.record("c1".into(), reply("Systems", "R001"));
    ledger.record("c1".into(), reply("Systems", "R002"));
    ledger.record("c2".into(), reply("Civil", "R003"));

    assert_eq!(ledger.len(), 2);
    assert_eq!(ledger.lookup("c1").unwrap().room_ids, vec!["R002"]);
}

#[test]
fn test_forget_pair_and_clear() {
    let mut ledger = InMemoryReplyLedger::new(8);
    ledger.record("a".into(), reply("Systems", "R001"));
    ledger.record("b".into(), reply("Civil", "R002"));
    ledger.record("c".into(), reply("Systems", "R003"));

    ledger.forget_pair("Engineering", "Systems");
    assert_eq!(ledger.len(), 1);
    assert!(ledger.lookup("b").is_some());

    ledger.clear();
    assert!(ledger.is_empty());
}

#[test]
fn test_zero_capacity_still_keeps_latest() {
    let mut ledger = InMemoryReplyLedger::new(0);
    ledger.record("a".into(), reply("Systems", "R001"));
    ledger.record("b".into(), reply("Systems", "R002"));

    assert_eq!(ledger.len(), 1);
    assert!(ledger.lookup("b").is_some());
}
