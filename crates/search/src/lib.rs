//! # tagdex search
//!
//! Streaming queries over the tag database: tag names, file names and file contents.
//!
//! Each [`SearchSession`] owns a read-only connection, so searches run alongside an index
//! run. Results reach the observer as they arrive; a new search supersedes the previous one.

mod content;
mod error;
mod query;
mod session;

pub use content::{LineMatch, LineScanner, MAX_CONTEXT_LINE_CHARS};
pub use error::{Result, SearchError};
pub use query::{
    content_query, escape_glob, full_text_query, required_literals, MIN_LITERAL_CHARS,
    PREFIX_MATCH_LIMIT,
};
pub use session::{
    is_update_point, SearchEvent, SearchHit, SearchMode, SearchReport, SearchSession,
    SearchStatus,
};
