//! Classroom registry: the table of rooms and labs every worker mirrors.
//!
//! Units are kept in a `BTreeMap` keyed by id so every scan visits them in
//! ascending id order, which is the allocation tie-break.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::message::{DeltaOp, StateDelta};
use crate::core::RegistryError;

/// Kind of a classroom unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UnitKind {
    /// Lecture room.
    Room,
    /// Laboratory.
    Lab,
}

/// Reservation status of a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UnitStatus {
    /// Free to allocate.
    Available,
    /// Held by a faculty/program.
    Reserved,
}

/// Who holds a reserved unit and since when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reservation {
    /// Holding faculty.
    pub faculty: String,
    /// Holding program.
    pub program: String,
    /// When the request was issued (epoch ms).
    pub requested_at: u64,
    /// When the unit was committed (epoch ms).
    pub assigned_at: u64,
}

/// One registry entry.
///
/// The reservation fields are present exactly when the unit is reserved, so
/// the status is derived rather than stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassroomUnit {
    /// Stable unique id.
    pub id: String,
    /// Current kind.
    pub kind: UnitKind,
    /// Seats.
    pub capacity: u32,
    /// `true` when this lab is a room converted to meet lab demand.
    #[serde(default)]
    pub converted: bool,
    /// Present while reserved.
    #[serde(default)]
    pub reservation: Option<Reservation>,
}

impl ClassroomUnit {
    /// An available room.
    pub fn room(id: impl Into<String>, capacity: u32) -> Self {
        Self::new(id, UnitKind::Room, capacity)
    }

    /// An available lab.
    pub fn lab(id: impl Into<String>, capacity: u32) -> Self {
        Self::new(id, UnitKind::Lab, capacity)
    }

    /// An available unit of the given kind.
    pub fn new(id: impl Into<String>, kind: UnitKind, capacity: u32) -> Self {
        Self {
            id: id.into(),
            kind,
            capacity,
            converted: false,
            reservation: None,
        }
    }

    /// Derived status.
    #[must_use]
    pub const fn status(&self) -> UnitStatus {
        if self.reservation.is_some() {
            UnitStatus::Reserved
        } else {
            UnitStatus::Available
        }
    }

    /// Available, of `kind`, and at least `min_capacity` seats.
    #[must_use]
    pub fn fits(&self, kind: UnitKind, min_capacity: u32) -> bool {
        self.reservation.is_none() && self.kind == kind && self.capacity >= min_capacity
    }

    /// Drop the reservation and undo a mobile conversion.
    ///
    /// Returns `true` if anything changed.
    pub fn clear(&mut self) -> bool {
        let changed = self.reservation.is_some() || self.converted;
        self.reservation = None;
        if self.converted {
            self.kind = UnitKind::Room;
            self.converted = false;
        }
        changed
    }
}

/// Aggregate counts for status reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryCounts {
    /// Units currently of kind ROOM.
    pub rooms: usize,
    /// Units currently of kind LAB (native and converted).
    pub labs: usize,
    /// Available rooms.
    pub available_rooms: usize,
    /// Available labs.
    pub available_labs: usize,
    /// Reserved units of any kind.
    pub reserved: usize,
    /// Rooms currently converted to labs.
    pub converted: usize,
}

/// In-memory table of classroom units.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Registry {
    units: BTreeMap<String, ClassroomUnit>,
}

impl Registry {
    /// Build from a unit list, rejecting duplicate ids.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::DuplicateUnit` if two units share an id.
    pub fn from_units(units: impl IntoIterator<Item = ClassroomUnit>) -> Result<Self, RegistryError> {
        let mut map = BTreeMap::new();
        for unit in units {
            let id = unit.id.clone();
            if map.insert(id.clone(), unit).is_some() {
                return Err(RegistryError::DuplicateUnit(id));
            }
        }
        Ok(Self { units: map })
    }

    /// Number of units.
    #[must_use]
    pub fn len(&self) -> usize {
        self.units.len()
    }

    /// `true` if there are no units.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Look up a unit.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&ClassroomUnit> {
        self.units.get(id)
    }

    pub(crate) fn get_mut(&mut self, id: &str) -> Option<&mut ClassroomUnit> {
        self.units.get_mut(id)
    }

    /// Units in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = &ClassroomUnit> {
        self.units.values()
    }

    /// Cloned units in ascending id order.
    #[must_use]
    pub fn units(&self) -> Vec<ClassroomUnit> {
        self.units.values().cloned().collect()
    }

    /// Replace the whole table, e.g. from a peer snapshot.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::DuplicateUnit` and leaves the table untouched if
    /// the snapshot repeats an id.
    pub fn replace_all(&mut self, units: Vec<ClassroomUnit>) -> Result<(), RegistryError> {
        *self = Self::from_units(units)?;
        Ok(())
    }

    /// Return every unit to its baseline. Returns how many changed.
    pub fn reset_all(&mut self) -> usize {
        self.units
            .values_mut()
            .map(ClassroomUnit::clear)
            .filter(|changed| *changed)
            .count()
    }

    /// Ids reserved by a faculty/program pair.
    #[must_use]
    pub fn held_by(&self, faculty: &str, program: &str) -> Vec<String> {
        self.units
            .values()
            .filter(|u| {
                u.reservation
                    .as_ref()
                    .is_some_and(|r| r.faculty == faculty && r.program == program)
            })
            .map(|u| u.id.clone())
            .collect()
    }

    /// Aggregate counts.
    #[must_use]
    pub fn counts(&self) -> RegistryCounts {
        let mut counts = RegistryCounts::default();
        for unit in self.units.values() {
            let available = unit.reservation.is_none();
            match unit.kind {
                UnitKind::Room => {
                    counts.rooms += 1;
                    if available {
                        counts.available_rooms += 1;
                    }
                }
                UnitKind::Lab => {
                    counts.labs += 1;
                    if available {
                        counts.available_labs += 1;
                    }
                }
            }
            if !available {
                counts.reserved += 1;
            }
            if unit.converted {
                counts.converted += 1;
            }
        }
        counts
    }

    /// Apply a replicated mutation.
    ///
    /// Every referenced id is checked before anything changes, so a bad delta
    /// leaves the table as it was.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::UnknownUnit` for an id not in the table and
    /// `RegistryError::NotConvertible` when a conversion names anything but
    /// an available room.
    pub fn apply_delta(&mut self, delta: &StateDelta) -> Result<(), RegistryError> {
        if let Some(missing) = delta.unit_ids.iter().find(|id| !self.units.contains_key(*id)) {
            return Err(RegistryError::UnknownUnit(missing.clone()));
        }
        if delta.op == DeltaOp::Convert {
            let refused = delta
                .unit_ids
                .iter()
                .find(|id| self.units.get(*id).is_some_and(|u| !u.fits(UnitKind::Room, 0)));
            if let Some(id) = refused {
                return Err(RegistryError::NotConvertible(id.clone()));
            }
        }
        match delta.op {
            DeltaOp::Reset => {
                if delta.unit_ids.is_empty() {
                    self.reset_all();
                } else {
                    self.clear_ids(&delta.unit_ids);
                }
            }
            DeltaOp::Release => self.clear_ids(&delta.unit_ids),
            DeltaOp::Convert => {
                for id in &delta.unit_ids {
                    if let Some(unit) = self.units.get_mut(id) {
                        unit.kind = UnitKind::Lab;
                        unit.converted = true;
                    }
                }
            }
            DeltaOp::Assign => {
                let fields = &delta.fields;
                for id in &delta.unit_ids {
                    if let Some(unit) = self.units.get_mut(id) {
                        unit.reservation = Some(Reservation {
                            faculty: fields.faculty.clone().unwrap_or_default(),
                            program: fields.program.clone().unwrap_or_default(),
                            requested_at: fields.requested_at.unwrap_or_default(),
                            assigned_at: fields.assigned_at.unwrap_or_default(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    fn clear_ids(&mut self, ids: &[String]) {
        for id in ids {
            if let Some(unit) = self.units.get_mut(id) {
                unit.clear();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::DeltaFields;

    fn sample() -> Registry {
        Registry::from_units(vec![
            ClassroomUnit::room("R002", 40),
            ClassroomUnit::room("R001", 40),
            ClassroomUnit::lab("L001", 30),
        ])
        .unwrap()
    }

    #[test]
    fn test_iteration_is_ascending_by_id() {
        let ids: Vec<_> = sample().iter().map(|u| u.id.clone()).collect();
        assert_eq!(ids, vec!["L001", "R001", "R002"]);
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let err = Registry::from_units(vec![
            ClassroomUnit::room("R001", 40),
            ClassroomUnit::lab("R001", 30),
        ])
        .unwrap_err();
        assert_eq!(err, RegistryError::DuplicateUnit("R001".into()));
    }

    #[test]
    fn test_assign_then_release_delta() {
        let mut registry = sample();
        let assign = StateDelta {
            op: DeltaOp::Assign,
            unit_ids: vec!["R001".into()],
            fields: DeltaFields {
                faculty: Some("Engineering".into()),
                program: Some("Systems".into()),
                requested_at: Some(10),
                assigned_at: Some(11),
                ..DeltaFields::default()
            },
        };
        registry.apply_delta(&assign).unwrap();
        assert_eq!(registry.get("R001").unwrap().status(), UnitStatus::Reserved);
        assert_eq!(registry.held_by("Engineering", "Systems"), vec!["R001"]);

        let release = StateDelta::new(DeltaOp::Release, vec!["R001".into()]);
        registry.apply_delta(&release).unwrap();
        assert_eq!(registry.get("R001").unwrap().status(), UnitStatus::Available);
    }

    #[test]
    fn test_unknown_unit_leaves_registry_untouched() {
        let mut registry = sample();
        let before = registry.clone();
        let delta = StateDelta::new(DeltaOp::Convert, vec!["R001".into(), "R999".into()]);
        assert_eq!(
            registry.apply_delta(&delta).unwrap_err(),
            RegistryError::UnknownUnit("R999".into())
        );
        assert_eq!(registry, before);
    }

    #[test]
    fn test_conversion_needs_an_available_room() {
        let mut registry = sample();
        let assign = StateDelta {
            op: DeltaOp::Assign,
            unit_ids: vec!["R002".into()],
            fields: DeltaFields {
                faculty: Some("Engineering".into()),
                program: Some("Systems".into()),
                ..DeltaFields::default()
            },
        };
        registry.apply_delta(&assign).unwrap();
        let before = registry.clone();

        let reserved = StateDelta::new(DeltaOp::Convert, vec!["R001".into(), "R002".into()]);
        assert_eq!(
            registry.apply_delta(&reserved).unwrap_err(),
            RegistryError::NotConvertible("R002".into())
        );
        let lab = StateDelta::new(DeltaOp::Convert, vec!["L001".into()]);
        assert_eq!(
            registry.apply_delta(&lab).unwrap_err(),
            RegistryError::NotConvertible("L001".into())
        );
        assert_eq!(registry, before);
    }

    #[test]
    fn test_reset_reverts_conversion() {
        let mut registry = sample();
        registry
            .apply_delta(&StateDelta::new(DeltaOp::Convert, vec!["R002".into()]))
            .unwrap();
        assert_eq!(registry.counts().converted, 1);
        assert_eq!(registry.counts().labs, 2);

        assert_eq!(registry.reset_all(), 1);
        let unit = registry.get("R002").unwrap();
        assert_eq!(unit.kind, UnitKind::Room);
        assert!(!unit.converted);
    }

    #[test]
    fn test_counts() {
        let counts = sample().counts();
        assert_eq!(counts.rooms, 2);
        assert_eq!(counts.labs, 1);
        assert_eq!(counts.available_rooms, 2);
        assert_eq!(counts.reserved, 0);
    }
}
