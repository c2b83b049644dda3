//! Error types for the secmgr core crate.

use thiserror::Error;

use crate::session::SessionError;

/// Top-level error type for all secmgr core operations.
#[derive(Debug, Error)]
pub enum SecmgrError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("authentication error: {0}")]
    Auth(String),

    #[error("session error: {0}")]
    Session(#[from] SessionError),
}

/// A convenience Result alias that defaults to [`SecmgrError`].
pub type Result<T> = std::result::Result<T, SecmgrError>;
