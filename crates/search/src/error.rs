use thiserror::Error;

pub type Result<T> = std::result::Result<T, SearchError>;

#[derive(Error, Debug)]
pub enum SearchError {
    #[error("Store error: {0}")]
    StoreError(#[from] tagdex_store::StoreError),
}

impl From<SearchError> for tagdex_runtime::TaskError {
    fn from(err: SearchError) -> Self {
        tagdex_runtime::TaskError::failed(err)
    }
}
