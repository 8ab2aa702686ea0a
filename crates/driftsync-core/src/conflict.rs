//! Conflict detection and conflict-rename path construction.
//!
//! An identity conflict is two distinct underlying files or folders whose
//! paths collide only once case-folded into an id. Path conflicts (a
//! different document already occupying a destination) are resolved by
//! renaming one contender with a `-conflict-<timestamp>` suffix.

use crate::metadata::{Metadata, SideName};
use chrono::{DateTime, SecondsFormat, Utc};
use std::fmt;

/// Longest base name kept when building a conflict path, so renamed paths
/// stay within platform limits.
pub const MAX_CONFLICT_BASE_LEN: usize = 180;

/// Two distinct underlying entries mapping to the same id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdConflict {
    pub side: SideName,
    pub existing_path: String,
    pub incoming_path: String,
}

impl fmt::Display for IdConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} \"{}\" cannot coexist with \"{}\": paths only differ by case",
            self.side, self.incoming_path, self.existing_path
        )
    }
}

/// Detect an identity conflict between an incoming document and the ledger
/// entry its id resolves to.
///
/// The paths must actually differ (same raw path is a normal update), and the
/// two documents must not share the side's underlying identity: the same
/// remote id seen again, or the same inode, is a case-rename of one entry,
/// not a collision between two.
pub fn detect_id_conflict(
    side: SideName,
    doc: &Metadata,
    existing: Option<&Metadata>,
) -> Option<IdConflict> {
    let existing = existing?;
    if doc.path == existing.path {
        return None;
    }
    let same_identity = match side {
        SideName::Remote => match (&doc.remote, &existing.remote) {
            (Some(a), Some(b)) => a.id == b.id,
            _ => false,
        },
        SideName::Local => match (doc.ino, existing.ino) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        },
    };
    if same_identity {
        return None;
    }
    Some(IdConflict {
        side,
        existing_path: existing.path.clone(),
        incoming_path: doc.path.clone(),
    })
}

/// Build the renamed path for a conflicting document.
///
/// The suffix goes before the extension and the base name is truncated to
/// [`MAX_CONFLICT_BASE_LEN`] characters.
pub fn conflict_path(path: &str, at: DateTime<Utc>) -> String {
    let (dir, name) = match path.rfind('/') {
        Some(pos) => (&path[..pos + 1], &path[pos + 1..]),
        None => ("", path),
    };
    let (base, ext) = match name.rfind('.') {
        Some(pos) if pos > 0 => (&name[..pos], &name[pos..]),
        _ => (name, ""),
    };
    let base: String = base.chars().take(MAX_CONFLICT_BASE_LEN).collect();
    let stamp = at
        .to_rfc3339_opts(SecondsFormat::Millis, true)
        .replace(':', "-");
    format!("{dir}{base}-conflict-{stamp}{ext}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::RemoteRef;
    use chrono::Utc;

    fn ts() -> DateTime<Utc> {
        "2024-03-01T10:20:30.456Z".parse().unwrap()
    }

    fn file(path: &str) -> Metadata {
        Metadata::new_file(path, "c0ffee", 3, ts())
    }

    #[test]
    fn test_conflict_path_inserts_suffix_before_extension() {
        let renamed = conflict_path("docs/report.txt", ts());
        assert_eq!(
            renamed,
            "docs/report-conflict-2024-03-01T10-20-30.456Z.txt"
        );
    }

    #[test]
    fn test_conflict_path_without_extension() {
        let renamed = conflict_path("docs/Makefile", ts());
        assert_eq!(renamed, "docs/Makefile-conflict-2024-03-01T10-20-30.456Z");
    }

    #[test]
    fn test_conflict_path_keeps_hidden_file_name_whole() {
        let renamed = conflict_path(".env", ts());
        assert_eq!(renamed, ".env-conflict-2024-03-01T10-20-30.456Z");
    }

    #[test]
    fn test_conflict_path_truncates_long_base_names() {
        let long = "x".repeat(300);
        let renamed = conflict_path(&format!("dir/{long}.txt"), ts());
        let name = renamed.rsplit('/').next().unwrap();
        let base = name.split("-conflict-").next().unwrap();
        assert_eq!(base.chars().count(), MAX_CONFLICT_BASE_LEN);
        assert!(name.ends_with(".txt"));
    }

    #[test]
    fn test_detect_id_conflict_on_case_collision() {
        let existing = file("Readme.md");
        let incoming = file("README.md");
        let found = detect_id_conflict(SideName::Local, &incoming, Some(&existing));
        assert!(found.is_some());
        assert_eq!(found.unwrap().existing_path, "Readme.md");
    }

    #[test]
    fn test_detect_id_conflict_ignores_same_identity() {
        // A case-only rename of one entry keeps its inode or remote id and is
        // not a collision between two entries.
        let mut existing = file("Readme.md");
        existing.ino = Some(7);
        let mut incoming = file("README.md");
        incoming.ino = Some(7);
        assert!(detect_id_conflict(SideName::Local, &incoming, Some(&existing)).is_none());

        let mut existing = file("Readme.md");
        existing.remote = Some(RemoteRef {
            id: "r1".into(),
            rev: 2,
        });
        let mut incoming = file("README.md");
        incoming.remote = Some(RemoteRef {
            id: "r1".into(),
            rev: 3,
        });
        assert!(detect_id_conflict(SideName::Remote, &incoming, Some(&existing)).is_none());
    }

    #[test]
    fn test_detect_id_conflict_same_path_is_update() {
        let existing = file("notes.txt");
        let incoming = file("notes.txt");
        assert!(detect_id_conflict(SideName::Local, &incoming, Some(&existing)).is_none());
    }
}
