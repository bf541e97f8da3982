//! # tagdex indexer
//!
//! Incremental tagging of the configured folders.
//!
//! ## Pipeline
//!
//! ```text
//! Folders + Filters
//!     │
//!     ├──> Change Detector (walkdir + globset)
//!     │      └─> deletions, then new/modified files
//!     │
//!     ├──> Tag Generator (ctags --filter subprocess)
//!     │      └─> tag lines
//!     │
//!     └──> Tag-line parser
//!            └─> Tag Store
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use tagdex_indexer::{IndexerConfig, ProjectIndexer};
//! use tagdex_runtime::Scheduler;
//! use tagdex_store::TagStore;
//!
//! fn main() -> anyhow::Result<()> {
//!     let scheduler = Scheduler::new();
//!     let config = IndexerConfig::default();
//!     let store = TagStore::open(&scheduler, &config.database_path(None))?;
//!     let indexer = ProjectIndexer::new(&store, config);
//!     let stats = scheduler.wait(&indexer.run())?;
//!
//!     println!("Tagged {} files, {} tags", stats.files_tagged, stats.tags_added);
//!     Ok(())
//! }
//! ```

mod changes;
mod config;
mod error;
mod generator;
mod indexer;
mod source;
mod stats;
mod tagline;

pub use changes::{build_filter_set, Change, ChangeDetector, ChangeStream};
pub use config::{IndexerConfig, TaggerConfig, CONFIG_FILE_NAME, DATABASE_ENV};
pub use error::{GeneratorError, IndexerError, Result};
pub use generator::{GeneratorRun, TagGenerator};
pub use indexer::ProjectIndexer;
pub use source::{decode_text, load_source, modified_nanos, read_source_text};
pub use stats::IndexStats;
pub use tagline::{parse_tag_line, MalformedTagLine};
