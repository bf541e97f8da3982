//! # Tagdex Store
//!
//! SQLite-backed tag database: source files, interned kinds/contexts/languages, tags, the
//! trigram full-text index, configured folders and filters, and preferences.
//!
//! Each connection lives on its own thread and is driven through promises on a
//! [`tagdex_runtime::Scheduler`]. [`TagStore`] owns the single writer.

mod connection;
mod error;
mod memo;
pub mod schema;
mod store;
mod types;

pub use connection::{DbConnection, RowStream};
pub use error::{Result, StoreError};
pub use memo::{Memo, DEFAULT_MEMO_CAPACITY};
pub use store::TagStore;
pub use types::{path_key, Filter, Folder, SourceFile, StoreStats, Tag};
