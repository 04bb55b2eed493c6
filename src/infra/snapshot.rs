//! Registry snapshot persistence.
//!
//! One header line followed by one line per unit:
//! `id,kind,status,capacity,faculty,program,requestedAt,assignedAt`.
//! `kind` is `room`, `lab`, or `mobile` (a room converted to a lab).
//! Fields holding commas or quotes are double-quoted with quotes doubled.

use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::core::{ClassroomUnit, Registry, Reservation, SnapshotError, UnitKind};

/// Header line of every snapshot.
pub const SNAPSHOT_HEADER: &str = "id,kind,status,capacity,faculty,program,requestedAt,assignedAt";

/// Storage for registry snapshots.
pub trait SnapshotStore: Send + Sync {
    /// Persist `units`, replacing any previous snapshot.
    ///
    /// # Errors
    ///
    /// Returns `SnapshotError::Io` if the write fails.
    fn save(&self, units: &[ClassroomUnit]) -> Result<(), SnapshotError>;

    /// Load the last snapshot, or `None` if there is none.
    ///
    /// # Errors
    ///
    /// Returns `Io` on read failure, `Parse` for a bad line, `Registry` for
    /// duplicate ids.
    fn load(&self) -> Result<Option<Registry>, SnapshotError>;
}

/// Snapshot in a single file, replaced atomically through a temp file.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    path: PathBuf,
}

impl FileSnapshotStore {
    /// Store writing to `path`.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Target file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn save(&self, units: &[ClassroomUnit]) -> Result<(), SnapshotError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, encode_units(units))?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn load(&self) -> Result<Option<Registry>, SnapshotError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&self.path)?;
        let units = decode_units(&text)?;
        Ok(Some(Registry::from_units(units)?))
    }
}

/// Snapshot kept in memory, for tests.
#[derive(Debug, Default)]
pub struct InMemorySnapshotStore {
    text: Mutex<Option<String>>,
}

impl InMemorySnapshotStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw text of the last save.
    #[must_use]
    pub fn contents(&self) -> Option<String> {
        self.text.lock().clone()
    }
}

impl SnapshotStore for InMemorySnapshotStore {
    fn save(&self, units: &[ClassroomUnit]) -> Result<(), SnapshotError> {
        *self.text.lock() = Some(encode_units(units));
        Ok(())
    }

    fn load(&self) -> Result<Option<Registry>, SnapshotError> {
        let Some(text) = self.text.lock().clone() else {
            return Ok(None);
        };
        Ok(Some(Registry::from_units(decode_units(&text)?)?))
    }
}

/// Render units as snapshot text, header included.
#[must_use]
pub fn encode_units(units: &[ClassroomUnit]) -> String {
    let mut out = String::with_capacity(64 * (units.len() + 1));
    out.push_str(SNAPSHOT_HEADER);
    out.push('\n');
    for unit in units {
        let kind = match (unit.kind, unit.converted) {
            (UnitKind::Lab, true) => "mobile",
            (UnitKind::Lab, false) => "lab",
            (UnitKind::Room, _) => "room",
        };
        let (status, faculty, program, requested, assigned) = match &unit.reservation {
            Some(r) => (
                "reserved",
                r.faculty.as_str(),
                r.program.as_str(),
                r.requested_at.to_string(),
                r.assigned_at.to_string(),
            ),
            None => ("available", "", "", String::new(), String::new()),
        };
        let fields = [
            quote(&unit.id),
            kind.to_string(),
            status.to_string(),
            unit.capacity.to_string(),
            quote(faculty),
            quote(program),
            requested,
            assigned,
        ];
        out.push_str(&fields.join(","));
        out.push('\n');
    }
    out
}

/// Parse snapshot text produced by [`encode_units`].
///
/// # Errors
///
/// Returns `SnapshotError::Parse` naming the first bad line.
pub fn decode_units(text: &str) -> Result<Vec<ClassroomUnit>, SnapshotError> {
    let mut units = Vec::new();
    for (index, line) in text.lines().enumerate() {
        let line_no = index + 1;
        if line.trim().is_empty() || (index == 0 && line.trim() == SNAPSHOT_HEADER) {
            continue;
        }
        let parse_err = |reason: String| SnapshotError::Parse {
            line: line_no,
            reason,
        };
        let fields = split_record(line).map_err(parse_err)?;
        let [id, kind, status, capacity, faculty, program, requested, assigned]: [String; 8] =
            fields
                .try_into()
                .map_err(|f: Vec<String>| parse_err(format!("expected 8 fields, found {}", f.len())))?;

        let (kind, converted) = match kind.as_str() {
            "room" => (UnitKind::Room, false),
            "lab" => (UnitKind::Lab, false),
            "mobile" => (UnitKind::Lab, true),
            other => return Err(parse_err(format!("unknown kind `{other}`"))),
        };
        let capacity: u32 = capacity
            .parse()
            .map_err(|_| parse_err(format!("bad capacity `{capacity}`")))?;
        let reservation = match status.as_str() {
            "available" => None,
            "reserved" => {
                if faculty.is_empty() || program.is_empty() {
                    return Err(parse_err("reserved unit without faculty/program".into()));
                }
                let stamp = |value: &str| {
                    value
                        .parse::<u64>()
                        .map_err(|_| parse_err(format!("bad timestamp `{value}`")))
                };
                Some(Reservation {
                    requested_at: stamp(&requested)?,
                    assigned_at: stamp(&assigned)?,
                    faculty,
                    program,
                })
            }
            other => return Err(parse_err(format!("unknown status `{other}`"))),
        };
        units.push(ClassroomUnit {
            id,
            kind,
            capacity,
            converted,
            reservation,
        });
    }
    Ok(units)
}

fn quote(field: &str) -> String {
    if field.contains([',', '"', '\n']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn split_record(line: &str) -> Result<Vec<String>, String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut chars = line.chars().peekable();
    let mut quoted = false;
    while let Some(c) = chars.next() {
        match (c, quoted) {
            ('"', true) if chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            ('"', true) => quoted = false,
            ('"', false) if current.is_empty() => quoted = true,
            (',', false) => fields.push(std::mem::take(&mut current)),
            (c, _) => current.push(c),
        }
    }
    if quoted {
        return Err("unterminated quote".into());
    }
    fields.push(current);
    Ok(fields)
}
