//! Harness error type.

use mcmalloc_membrane::MallocError;

#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("engine error: {0}")]
    Engine(#[from] MallocError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("worker thread panicked: {0}")]
    WorkerPanicked(String),
    #[error("invalid stress configuration: {0}")]
    InvalidConfig(&'static str),
}
