//! Ignore rules consulted before replaying a change.
//!
//! Ignored documents are never synced to either side. Rules are deliberately
//! simple: hidden entries (any dot-prefixed component) and user-provided
//! patterns matching a whole component or a path prefix.

use crate::metadata::Metadata;

#[derive(Debug, Clone)]
pub struct Ignore {
    patterns: Vec<String>,
    ignore_hidden: bool,
}

impl Default for Ignore {
    fn default() -> Self {
        Ignore {
            patterns: Vec::new(),
            ignore_hidden: true,
        }
    }
}

impl Ignore {
    pub fn new(patterns: Vec<String>) -> Self {
        Ignore {
            patterns,
            ..Ignore::default()
        }
    }

    pub fn with_hidden_synced(mut self) -> Self {
        self.ignore_hidden = false;
        self
    }

    pub fn is_ignored(&self, doc: &Metadata) -> bool {
        let path = doc.path.as_str();
        if self.ignore_hidden && path.split('/').any(|name| name.starts_with('.')) {
            return true;
        }
        self.patterns.iter().any(|pattern| {
            let pattern = pattern.trim_matches('/');
            path == pattern
                || path.starts_with(&format!("{pattern}/"))
                || path.split('/').any(|name| name == pattern)
        })
    }
}
