use std::io;
use thiserror::Error;

/// Central error type for the petrel engine.
#[derive(Debug, Error)]
pub enum PetrelError {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Listener or reactor setup failed before the loop started.
    #[error("setup failed: {0}")]
    Setup(String),
    /// A construction parameter that must be positive was zero.
    #[error("invalid {what}: must be positive")]
    InvalidParameter { what: &'static str },
}

pub type PetrelResult<T> = Result<T, PetrelError>;
