//! Errors raised while parsing identifiers.

use thiserror::Error;

/// Parse failures for typed identifiers and pod keys.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("ID cannot be empty")]
    Empty,

    #[error("invalid ID prefix: expected '{expected}', got '{actual}'")]
    InvalidPrefix {
        expected: &'static str,
        actual: String,
    },

    #[error("ID missing underscore separator")]
    MissingSeparator,

    #[error("invalid ULID: {0}")]
    InvalidUlid(String),

    /// A pod key was not of the form `namespace/name`.
    #[error("invalid pod key {0:?}: expected namespace/name")]
    InvalidPodKey(String),
}
