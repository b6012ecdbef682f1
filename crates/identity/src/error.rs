//! Error types for identity provider calls

/// Errors from identity provider operations.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("identity provider configuration error: {0}")]
    Config(String),

    #[error("HTTP request failed: {0}")]
    Http(String),

    /// The provider answered and refused the request. `message` is the
    /// provider's own wording and is shown to users verbatim.
    #[error("{message}")]
    Rejected { status: u16, message: String },

    #[error("invalid provider response: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    /// Whether the provider itself refused the credentials, as opposed to a
    /// transport or decoding failure.
    pub fn is_rejection(&self) -> bool {
        matches!(self, ProviderError::Rejected { .. })
    }
}

/// Result alias for provider operations.
pub type Result<T> = std::result::Result<T, ProviderError>;
