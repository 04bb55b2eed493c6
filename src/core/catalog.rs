//! Faculty and program catalog used to reject unknown requesters.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::core::AllocationError;

/// Known faculties and the programs each one runs.
///
/// An empty catalog accepts any non-empty faculty/program.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FacultyCatalog {
    faculties: BTreeMap<String, BTreeSet<String>>,
}

impl FacultyCatalog {
    /// Catalog from `(faculty, programs)` pairs.
    pub fn new<F, P, I>(entries: impl IntoIterator<Item = (F, I)>) -> Self
    where
        F: Into<String>,
        P: Into<String>,
        I: IntoIterator<Item = P>,
    {
        let faculties = entries
            .into_iter()
            .map(|(faculty, programs)| {
                (faculty.into(), programs.into_iter().map(Into::into).collect())
            })
            .collect();
        Self { faculties }
    }

    /// Parse `Faculty, Program1, Program2` lines. Lines without at least one
    /// program are skipped.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        let mut faculties: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for line in text.lines() {
            let mut parts = line.split(',').map(str::trim).filter(|p| !p.is_empty());
            let Some(faculty) = parts.next() else {
                continue;
            };
            let programs: BTreeSet<String> = parts.map(str::to_string).collect();
            if programs.is_empty() {
                continue;
            }
            faculties.entry(faculty.to_string()).or_default().extend(programs);
        }
        Self { faculties }
    }

    /// `true` when no faculty is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.faculties.is_empty()
    }

    /// Number of faculties.
    #[must_use]
    pub fn len(&self) -> usize {
        self.faculties.len()
    }

    /// Faculties with their programs, in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &BTreeSet<String>)> {
        self.faculties.iter()
    }

    /// Programs of a faculty.
    #[must_use]
    pub fn programs(&self, faculty: &str) -> Option<&BTreeSet<String>> {
        self.faculties.get(faculty)
    }

    /// Check a faculty/program pair.
    ///
    /// # Errors
    ///
    /// Returns `AllocationError::Validation` for empty names, or names the
    /// catalog does not know when it is non-empty.
    pub fn check(&self, faculty: &str, program: &str) -> Result<(), AllocationError> {
        if faculty.trim().is_empty() {
            return Err(AllocationError::Validation("faculty is empty".into()));
        }
        if program.trim().is_empty() {
            return Err(AllocationError::Validation("program is empty".into()));
        }
        if self.is_empty() {
            return Ok(());
        }
        let programs = self
            .faculties
            .get(faculty)
            .ok_or_else(|| AllocationError::Validation(format!("unknown faculty `{faculty}`")))?;
        if !programs.contains(program) {
            return Err(AllocationError::Validation(format!(
                "unknown program `{program}` for faculty `{faculty}`"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_lines() {
        let catalog = FacultyCatalog::parse(
            "Engineering, Systems, Civil\nMedicine, Nursing\nOrphan\n\n",
        );
        assert_eq!(catalog.len(), 2);
        assert!(catalog.programs("Engineering").unwrap().contains("Civil"));
        assert!(catalog.programs("Orphan").is_none());
    }

    #[test]
    fn test_check_known_and_unknown() {
        let catalog = FacultyCatalog::new([("Engineering", ["Systems"])]);
        assert!(catalog.check("Engineering", "Systems").is_ok());
        assert!(matches!(
            catalog.check("Arts", "Music"),
            Err(AllocationError::Validation(_))
        ));
        assert!(matches!(
            catalog.check("Engineering", "Music"),
            Err(AllocationError::Validation(_))
        ));
    }

    #[test]
    fn test_empty_catalog_only_rejects_blank_names() {
        let catalog = FacultyCatalog::default();
        assert!(catalog.check("Anything", "Goes").is_ok());
        assert!(catalog.check(" ", "Goes").is_err());
        assert!(catalog.check("Anything", "").is_err());
    }
}
