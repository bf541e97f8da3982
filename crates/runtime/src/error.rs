use std::fmt::{Debug, Display};
use std::sync::Arc;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TaskError>;

/// Terminal failure of a [`Promise`](crate::Promise).
///
/// Cloneable so every observer of a settled promise sees the same error. Domain errors travel
/// inside [`TaskError::Failed`] and can be recovered with [`TaskError::downcast_ref`].
#[derive(Error, Debug, Clone)]
pub enum TaskError {
    #[error("operation canceled")]
    Canceled,

    #[error("queue closed")]
    QueueClosed,

    #[error("scheduler stalled: nothing left that could settle the awaited promise")]
    Stalled,

    #[error("worker thread panicked")]
    WorkerPanicked,

    #[error("{0:#}")]
    Failed(Arc<anyhow::Error>),
}

impl TaskError {
    pub fn failed(err: impl Into<anyhow::Error>) -> Self {
        Self::Failed(Arc::new(err.into()))
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }

    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: Display + Debug + Send + Sync + 'static,
    {
        match self {
            Self::Failed(err) => err.downcast_ref::<E>(),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for TaskError {
    fn from(err: anyhow::Error) -> Self {
        Self::Failed(Arc::new(err))
    }
}
