//! Tests for file-backed snapshot storage

use classroom_broker::config::InventoryConfig;
use classroom_broker::core::{ClassroomUnit, Reservation, SnapshotError, UnitKind};
use classroom_broker::infra::{FileSnapshotStore, SnapshotStore};

fn reserved_units() -> Vec<ClassroomUnit> {
    let mut units = InventoryConfig::default().units();
    units[0].reservation = Some(Reservation {
        faculty: "Arts, Design".into(),
        program: "Illustration".into(),
        requested_at: 1_700_000_000_000,
        assigned_at: 1_700_000_000_050,
    });
    units[1].kind = UnitKind::Lab;
    units[1].converted = true;
    units
}

#[test]
fn test_save_then_load() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileSnapshotStore::new(dir.path().join("nested").join("node.snapshot"));

    store.save(&reserved_units()).unwrap();
    let registry = store.load().unwrap().expect("snapshot present");

    let mut expected = reserved_units();
    expected.sort_by(|a, b| a.id.cmp(&b.id));
    assert_eq!(registry.units(), expected);
    assert_eq!(registry.get("R001").unwrap().reservation.as_ref().unwrap().faculty, "Arts, Design");
    assert!(!dir.path().join("nested").join("node.tmp").exists());
}

#[test]
fn test_save_replaces_previous() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileSnapshotStore::new(dir.path().join("node.snapshot"));

    store.save(&reserved_units()).unwrap();
    store.save(&[ClassroomUnit::room("R001", 40)]).unwrap();

    assert_eq!(store.load().unwrap().unwrap().len(), 1);
}

#[test]
fn test_missing_file_loads_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileSnapshotStore::new(dir.path().join("absent.snapshot"));

    assert!(store.load().unwrap().is_none());
}

#[test]
fn test_corrupt_file_names_line() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.snapshot");
    std::fs::write(
        &path,
        "id,kind,status,capacity,faculty,program,requestedAt,assignedAt\n\
         R001,room,available,40,,,,\n\
         R002,hall,available,40,,,,\n",
    )
    .unwrap();

    let err = FileSnapshotStore::new(&path).load().unwrap_err();
    assert!(matches!(err, SnapshotError::Parse { line: 3, .. }), "{err}");
}

#[test]
fn test_duplicate_ids_rejected_on_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dup.snapshot");
    std::fs::write(&path, "R001,room,available,40,,,,\nR001,lab,available,30,,,,\n").unwrap();

    let err = FileSnapshotStore::new(&path).load().unwrap_err();
    assert!(matches!(err, SnapshotError::Registry(_)), "{err}");
}
