//! Error types for the session layer
//!
//! None of these reach end users from the guard: lookup failures resolve to
//! a login redirect. User-visible callback failures live in
//! `callback::CallbackError`.

/// Errors from session configuration and lookup.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("session cookie is malformed: {0}")]
    MalformedCookie(String),

    #[error("session lookup failed: {0}")]
    SessionLookupFailed(String),
}

/// Result alias for session operations.
pub type Result<T> = std::result::Result<T, Error>;
