//! Error types for the pool crate: usage refresh and facade operations.

use thiserror::Error;

/// Errors from the usage refresher and load balancer facade.
#[derive(Debug, Error)]
pub enum Error {
    #[error("store error: {0}")]
    Store(#[from] store::Error),

    #[error("auth error: {0}")]
    Auth(#[from] auth::Error),

    #[error("provider error: {0}")]
    Provider(#[from] provider::Error),

    #[error("usage fetch failed: {0}")]
    UsageFetch(String),

    #[error("account not found: {0}")]
    NotFound(String),
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
