//! Metadata documents: one per synchronized path.
//!
//! A document's `id` is its case-folded path, its `sides` carry the per-side
//! revision counters that decide which side owns a pending change, and `rev`
//! is the ledger's optimistic-concurrency token. The free functions in this
//! module implement the comparison and bookkeeping rules the merge and sync
//! components share.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One of the two synchronized endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SideName {
    Local,
    Remote,
}

impl SideName {
    /// The opposite endpoint.
    pub fn other(self) -> SideName {
        match self {
            SideName::Local => SideName::Remote,
            SideName::Remote => SideName::Local,
        }
    }
}

impl fmt::Display for SideName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SideName::Local => write!(f, "local"),
            SideName::Remote => write!(f, "remote"),
        }
    }
}

/// Kind of filesystem entry a document describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocType {
    File,
    Folder,
}

/// Per-side last-synced revision counters.
///
/// A side's counter is incremented only when that side's physical state
/// matches the document; the side with the higher counter owns the pending
/// change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SideRevs {
    pub local: Option<u64>,
    pub remote: Option<u64>,
}

impl SideRevs {
    pub fn get(&self, side: SideName) -> Option<u64> {
        match side {
            SideName::Local => self.local,
            SideName::Remote => self.remote,
        }
    }

    pub fn set(&mut self, side: SideName, rev: u64) {
        match side {
            SideName::Local => self.local = Some(rev),
            SideName::Remote => self.remote = Some(rev),
        }
    }

    pub fn clear(&mut self, side: SideName) {
        match side {
            SideName::Local => self.local = None,
            SideName::Remote => self.remote = None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.local.is_none() && self.remote.is_none()
    }
}

/// Remote-store identity of a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRef {
    pub id: String,
    pub rev: u64,
}

/// A platform-naming problem found on a path component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformIncompatibility {
    /// Path up to and including the offending component.
    pub path: String,
    /// The offending component itself.
    pub name: String,
    pub issue: NameIssue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NameIssue {
    ReservedCharacters,
    ReservedName,
    TrailingDotOrSpace,
}

/// Metadata document for one synchronized path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    /// Stable identifier: the case-folded path.
    pub id: String,
    /// Display path, original casing, `/`-separated.
    pub path: String,
    pub doc_type: DocType,
    #[serde(default)]
    pub sides: SideRevs,
    /// Ledger revision token; 0 means "never stored".
    #[serde(default)]
    pub rev: u64,
    /// Content checksum (files only). Two documents are the same binary iff
    /// checksums and sizes are both present and equal.
    #[serde(default)]
    pub checksum: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub class: Option<String>,
    #[serde(default)]
    pub mime: Option<String>,
    #[serde(default)]
    pub executable: bool,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Local file identity, used for move detection.
    #[serde(default)]
    pub ino: Option<u64>,
    #[serde(default)]
    pub remote: Option<RemoteRef>,
    /// Prior document while a move is being applied; cleared after replay.
    #[serde(default)]
    pub move_from: Option<Box<Metadata>>,
    /// On a move source: the destination id.
    #[serde(default)]
    pub move_to: Option<String>,
    /// This document was relocated as part of a bulk ancestor move.
    #[serde(default)]
    pub child_move: bool,
    /// Document superseded by a move onto this path; cleared after replay.
    #[serde(default)]
    pub overwrite: Option<Box<Metadata>>,
    #[serde(default)]
    pub trashed: bool,
    /// Retry counter for the sync loop's error budget.
    #[serde(default)]
    pub errors: u32,
    #[serde(default)]
    pub incompatibilities: Vec<PlatformIncompatibility>,
    /// Tombstone flag; the entry remains only for change-feed propagation.
    #[serde(default)]
    pub deleted: bool,
}

impl Metadata {
    /// A fresh file document as a watcher would report it.
    pub fn new_file(
        path: &str,
        checksum: impl Into<String>,
        size: u64,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Metadata {
            id: id_from_path(path),
            path: path.trim_matches('/').to_string(),
            doc_type: DocType::File,
            sides: SideRevs::default(),
            rev: 0,
            checksum: Some(checksum.into()),
            size: Some(size),
            class: None,
            mime: None,
            executable: false,
            updated_at,
            tags: Vec::new(),
            ino: None,
            remote: None,
            move_from: None,
            move_to: None,
            child_move: false,
            overwrite: None,
            trashed: false,
            errors: 0,
            incompatibilities: Vec::new(),
            deleted: false,
        }
    }

    /// A fresh folder document.
    pub fn new_folder(path: &str, updated_at: DateTime<Utc>) -> Self {
        Metadata {
            doc_type: DocType::Folder,
            checksum: None,
            size: None,
            ..Metadata::new_file(path, "", 0, updated_at)
        }
    }

    pub fn is_file(&self) -> bool {
        self.doc_type == DocType::File
    }

    pub fn is_folder(&self) -> bool {
        self.doc_type == DocType::Folder
    }
}

/// Case-folded identifier for a display path.
///
/// Collisions between distinct paths that fold to the same id are how
/// identity conflicts are detected.
pub fn id_from_path(path: &str) -> String {
    path.trim_matches('/').to_lowercase()
}

/// Parent of an id, `None` at the synchronized root.
pub fn parent_id(id: &str) -> Option<&str> {
    match id.rfind('/') {
        Some(pos) if pos > 0 => Some(&id[..pos]),
        _ => None,
    }
}

/// Parent of a display path, `None` at the synchronized root.
pub fn parent_path(path: &str) -> Option<&str> {
    parent_id(path)
}

/// Record that `side` has produced a new version of `doc`.
///
/// The side's counter moves one past the revision it was based on, so the
/// side with the higher counter owns the pending change.
pub fn mark_side(side: SideName, doc: &mut Metadata, prev: Option<&Metadata>) {
    let rev = prev.map_or(0, |p| p.rev);
    if doc.sides.is_empty() {
        if let Some(prev) = prev {
            doc.sides = prev.sides;
        }
    }
    doc.sides.set(side, rev + 1);
}

/// Whether `side` has already seen the stored revision of `doc`.
pub fn is_up_to_date(side: SideName, doc: &Metadata) -> bool {
    doc.sides.get(side).unwrap_or(0) == doc.rev
}

/// Same binary content: checksums and sizes both present and equal.
pub fn same_binary(one: &Metadata, two: &Metadata) -> bool {
    match (&one.checksum, &two.checksum) {
        (Some(a), Some(b)) => a == b && one.size.is_some() && one.size == two.size,
        _ => false,
    }
}

/// Keep the most recent modification date when folding an older document in.
pub fn assign_max_date(doc: &mut Metadata, prev: Option<&Metadata>) {
    if let Some(prev) = prev {
        if prev.updated_at > doc.updated_at {
            doc.updated_at = prev.updated_at;
        }
    }
}

fn same_ino(one: &Metadata, two: &Metadata) -> bool {
    match (one.ino, two.ino) {
        (Some(a), Some(b)) => a == b,
        _ => true,
    }
}

/// Full file equality; a second merge of an equal document is a no-op.
pub fn same_file(one: &Metadata, two: &Metadata) -> bool {
    one.id == two.id
        && one.path == two.path
        && one.checksum == two.checksum
        && one.size == two.size
        && one.executable == two.executable
        && one.updated_at == two.updated_at
        && one.tags == two.tags
        && one.trashed == two.trashed
        && one.remote == two.remote
        && same_ino(one, two)
}

/// File equality ignoring the remote revision and the modification date.
///
/// Used to recognize timestamp-only changes that need no transfer at all.
pub fn same_file_ignore_rev(one: &Metadata, two: &Metadata) -> bool {
    let remote_id_matches = match (&one.remote, &two.remote) {
        (Some(a), Some(b)) => a.id == b.id,
        (None, None) => true,
        _ => false,
    };
    one.id == two.id
        && one.path == two.path
        && one.checksum == two.checksum
        && one.size == two.size
        && one.executable == two.executable
        && one.tags == two.tags
        && one.trashed == two.trashed
        && remote_id_matches
        && same_ino(one, two)
}

/// Folder equality; modification dates are deliberately ignored.
pub fn same_folder(one: &Metadata, two: &Metadata) -> bool {
    one.id == two.id
        && one.path == two.path
        && one.tags == two.tags
        && one.trashed == two.trashed
        && one.remote == two.remote
        && same_ino(one, two)
}

/// Break the link between `doc` and `side` so the other side's version is
/// treated as authoritative without deleting the document.
pub fn dissociate(doc: &mut Metadata, side: SideName) {
    doc.sides.clear(side);
    match side {
        SideName::Remote => doc.remote = None,
        SideName::Local => doc.ino = None,
    }
}

const RESERVED_CHARS: &[char] = &['<', '>', ':', '"', '\\', '|', '?', '*'];

const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Scan every component of `path` for names that cannot be written on all
/// supported platforms.
pub fn detect_platform_incompatibilities(path: &str) -> Vec<PlatformIncompatibility> {
    let mut found = Vec::new();
    let mut prefix = String::new();
    for name in path.trim_matches('/').split('/') {
        if !prefix.is_empty() {
            prefix.push('/');
        }
        prefix.push_str(name);
        let issue = if name.contains(RESERVED_CHARS) {
            Some(NameIssue::ReservedCharacters)
        } else if RESERVED_NAMES.contains(&component_stem(name).to_uppercase().as_str()) {
            Some(NameIssue::ReservedName)
        } else if name.ends_with('.') || name.ends_with(' ') {
            Some(NameIssue::TrailingDotOrSpace)
        } else {
            None
        };
        if let Some(issue) = issue {
            found.push(PlatformIncompatibility {
                path: prefix.clone(),
                name: name.to_string(),
                issue,
            });
        }
    }
    found
}

/// Component name without its extension; reserved names match regardless of
/// extension.
fn component_stem(name: &str) -> &str {
    match name.find('.') {
        Some(pos) if pos > 0 => &name[..pos],
        _ => name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts() -> DateTime<Utc> {
        "2024-03-01T10:00:00Z".parse().unwrap()
    }

    #[test]
    fn test_id_from_path_folds_case() {
        assert_eq!(id_from_path("Photos/Été/IMG.jpg"), "photos/été/img.jpg");
        assert_eq!(id_from_path("/notes/Readme.md/"), "notes/readme.md");
    }

    #[test]
    fn test_parent_id() {
        assert_eq!(parent_id("a/b/c"), Some("a/b"));
        assert_eq!(parent_id("a/b"), Some("a"));
        assert_eq!(parent_id("a"), None);
        assert_eq!(parent_id(""), None);
    }

    #[test]
    fn test_mark_side_and_up_to_date() {
        let mut doc = Metadata::new_file("a.txt", "c0ffee", 3, ts());
        mark_side(SideName::Local, &mut doc, None);
        assert_eq!(doc.sides.local, Some(1));
        assert_eq!(doc.sides.remote, None);

        // Simulate the ledger storing it, then a remote change on top.
        doc.rev = 1;
        let prev = doc.clone();
        let mut next = Metadata::new_file("a.txt", "facade", 4, ts());
        mark_side(SideName::Remote, &mut next, Some(&prev));
        assert_eq!(next.sides.local, Some(1));
        assert_eq!(next.sides.remote, Some(2));

        assert!(is_up_to_date(SideName::Local, &prev));
        assert!(!is_up_to_date(SideName::Remote, &prev));
    }

    #[test]
    fn test_same_binary_needs_checksum_and_size() {
        let a = Metadata::new_file("a.txt", "c0ffee", 3, ts());
        let mut b = Metadata::new_file("b.txt", "c0ffee", 3, ts());
        assert!(same_binary(&a, &b));
        b.size = Some(4);
        assert!(!same_binary(&a, &b));
        b.size = Some(3);
        b.checksum = None;
        assert!(!same_binary(&a, &b));

        let f = Metadata::new_folder("dir", ts());
        assert!(!same_binary(&a, &f));
    }

    #[test]
    fn test_same_file_ignore_rev_skips_timestamps() {
        let a = Metadata::new_file("a.txt", "c0ffee", 3, ts());
        let mut b = a.clone();
        b.updated_at = "2024-03-02T10:00:00Z".parse().unwrap();
        assert!(!same_file(&a, &b));
        assert!(same_file_ignore_rev(&a, &b));
    }

    #[test]
    fn test_dissociate_clears_side_identity() {
        let mut doc = Metadata::new_file("a.txt", "c0ffee", 3, ts());
        doc.sides.set(SideName::Remote, 2);
        doc.remote = Some(RemoteRef {
            id: "r1".into(),
            rev: 5,
        });
        doc.ino = Some(42);
        dissociate(&mut doc, SideName::Remote);
        assert_eq!(doc.sides.remote, None);
        assert!(doc.remote.is_none());
        assert_eq!(doc.ino, Some(42));
    }

    #[test]
    fn test_detect_platform_incompatibilities() {
        assert!(detect_platform_incompatibilities("docs/notes.txt").is_empty());

        let found = detect_platform_incompatibilities("docs/a:b/NUL.txt/name. ");
        assert_eq!(found.len(), 3);
        assert_eq!(found[0].name, "a:b");
        assert_eq!(found[0].issue, NameIssue::ReservedCharacters);
        assert_eq!(found[1].name, "NUL.txt");
        assert_eq!(found[1].issue, NameIssue::ReservedName);
        assert_eq!(found[2].issue, NameIssue::TrailingDotOrSpace);
        assert_eq!(found[0].path, "docs/a:b");
    }
}
