//! Service-specific error types

use thiserror::Error;

/// Startup wiring errors: everything that can stop the gateway from serving.
///
/// Per-request failures (upstream timeouts, provider rejections during
/// sign-in) are answered directly as HTTP responses and never propagate
/// as Rust errors.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] common::Error),

    #[error("Invalid auth settings: {0}")]
    Session(#[from] auth_session::Error),

    #[error("Identity provider setup failed: {0}")]
    Provider(#[from] identity::ProviderError),

    #[error("HTTP client setup failed: {0}")]
    HttpClient(#[from] reqwest::Error),
}

/// Result alias using service Error
pub type Result<T> = std::result::Result<T, Error>;
