use thiserror::Error;

/// Errors surfaced by dataset loading, checkpointing and tensor plumbing.
#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("checkpoint serialization failed: {0}")]
    Checkpoint(#[from] serde_json::Error),

    #[error("incompatible tensor shape: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[error("dataset error: {0}")]
    Data(String),
}

pub type Result<T> = std::result::Result<T, Error>;
