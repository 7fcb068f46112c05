//! Shared error model for cross-crate APIs.

use thiserror::Error;

/// Unified result type used by all public interfaces in `coral`.
pub type ProxyResult<T> = Result<T, ProxyError>;

/// High-level error categories surfaced by the proxy engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProxyError {
    /// Configuration is invalid for the requested operation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// Runtime state does not allow this operation.
    #[error("invalid runtime state: {0}")]
    InvalidState(&'static str),

    /// Client or backend payload is malformed or semantically invalid.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Socket or filesystem I/O failed.
    #[error("io error: {0}")]
    Io(String),

    /// The engine received its shutdown signal and is draining.
    #[error("engine is going to be shutdown")]
    EngineShutdown,

    /// A shutdown was requested while another shutdown is already in progress.
    #[error("engine is already in shutdown")]
    EngineInShutdown,
}

#[cfg(test)]
mod tests {
    use super::ProxyError;
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn display_carries_category_prefix() {
        let error = ProxyError::Protocol("bad frame".to_owned());
        assert_that!(error.to_string(), eq("protocol error: bad frame"));
    }
}
