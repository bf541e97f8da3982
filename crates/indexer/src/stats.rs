use serde::{Deserialize, Serialize};

/// Statistics about one index run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStats {
    /// Files detected as new or modified
    pub files_changed: usize,

    /// Source files removed from the database (gone from disk or outside every folder)
    pub files_deleted: usize,

    /// Files handed to the tagger
    pub files_tagged: usize,

    /// Files skipped because they could not be read
    pub files_skipped: usize,

    /// Tags written to the database
    pub tags_added: usize,

    /// Tagger output lines that could not be parsed
    pub malformed_lines: usize,

    /// Time taken in milliseconds
    pub time_ms: u64,
}

impl IndexStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_noop(&self) -> bool {
        self.files_changed == 0 && self.files_deleted == 0
    }
}
