//! Error types for the core crate.

use thiserror::Error;

/// Errors raised while parsing or normalizing connection descriptors.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid conninfo JSON: {0}")]
    InvalidConnInfo(#[from] serde_json::Error),

    #[error("conninfo missing required field `name`")]
    MissingName,

    #[error("conninfo port out of range: {0}")]
    InvalidPort(i64),

    #[error("malformed wire frame: {0}")]
    MalformedFrame(&'static str),

    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(u32),
}
