use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, IndexerError>;

#[derive(Error, Debug)]
pub enum IndexerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Store error: {0}")]
    StoreError(#[from] tagdex_store::StoreError),

    #[error("Invalid filter pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: globset::Error,
    },

    #[error("Invalid config {path}: {message}")]
    InvalidConfig { path: PathBuf, message: String },

    #[error("Generator error: {0}")]
    Generator(#[from] GeneratorError),
}

#[derive(Error, Debug)]
pub enum GeneratorError {
    #[error("Failed to launch tagger {program:?}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Tagger exited unsuccessfully ({})", exit_label(.code))]
    TaggerFailed { code: Option<i32> },

    #[error("Tagger pipe error: {0}")]
    Pipe(#[from] std::io::Error),

    #[error("Tagger stdin already closed")]
    StdinClosed,
}

impl From<IndexerError> for tagdex_runtime::TaskError {
    fn from(err: IndexerError) -> Self {
        tagdex_runtime::TaskError::failed(err)
    }
}

impl From<GeneratorError> for tagdex_runtime::TaskError {
    fn from(err: GeneratorError) -> Self {
        tagdex_runtime::TaskError::failed(err)
    }
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "terminated by signal".to_string(),
    }
}
