use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// One extracted symbol occurrence, as written by `add_tag`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub name: String,
    pub path: PathBuf,
    pub line: i64,
    pub kind: Option<String>,
    pub context: Option<String>,
    pub language: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    pub id: i64,
    pub path: PathBuf,
    /// Modification time (ns since the Unix epoch) observed when the file was last tagged.
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Folder {
    pub id: i64,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    pub id: i64,
    pub pattern: String,
    pub language: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub folders: i64,
    pub filters: i64,
    pub source_files: i64,
    pub tags: i64,
    pub kinds: i64,
    pub contexts: i64,
    pub languages: i64,
}

/// Text form of a path as stored in the database.
pub fn path_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
