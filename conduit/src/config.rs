//! Configuration validation shared by loops and messaging.

use thiserror::Error;

/// A configuration field holds an unusable value.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid config field `{field}`: {reason}")]
pub struct ConfigError {
    pub field: &'static str,
    pub reason: &'static str,
}

impl ConfigError {
    #[must_use]
    pub const fn new(field: &'static str, reason: &'static str) -> Self {
        Self { field, reason }
    }
}
