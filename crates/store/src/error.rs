use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Database connection closed")]
    ConnectionClosed,
}

impl From<StoreError> for tagdex_runtime::TaskError {
    fn from(err: StoreError) -> Self {
        tagdex_runtime::TaskError::failed(err)
    }
}
