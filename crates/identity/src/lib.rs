//! Identity provider abstraction
//!
//! Credential verification is delegated to a hosted identity provider. This
//! crate defines the `IdentityProvider` trait the session layer talks to, the
//! `Session` it hands back, PKCE helpers for the magic-link flow, and
//! `HostedProvider`, the HTTP client for the hosted auth REST API.
//!
//! The provider is always injected (`Arc<dyn IdentityProvider>`) so tests can
//! substitute a fake without process-wide state.

pub mod endpoints;
pub mod error;
pub mod hosted;
pub mod pkce;
pub mod session;

pub use error::{ProviderError, Result};
pub use hosted::HostedProvider;
pub use pkce::{compute_challenge, generate_verifier};
pub use session::{Session, unix_now};

use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by provider operations.
pub type ProviderFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Parameters for a passwordless sign-in email.
#[derive(Debug, Clone)]
pub struct MagicLinkRequest {
    pub email: String,
    /// Absolute callback URL the link in the email points back to.
    pub redirect_to: String,
    /// S256 PKCE challenge; the matching verifier stays in the browser's cookies.
    pub code_challenge: String,
}

/// Operations the session layer needs from the identity provider.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility (`Arc<dyn IdentityProvider>`).
pub trait IdentityProvider: Send + Sync {
    /// Identifier for logging (e.g. "hosted")
    fn id(&self) -> &str;

    /// Exchange a one-time authorization code (plus PKCE verifier, when the
    /// flow started with a challenge) for a session.
    fn exchange_code<'a>(
        &'a self,
        code: &'a str,
        code_verifier: Option<&'a str>,
    ) -> ProviderFuture<'a, Session>;

    /// Trade a refresh token for a new session. A rejected refresh token is
    /// reported as `ProviderError::Rejected`.
    fn refresh_session<'a>(&'a self, refresh_token: &'a str) -> ProviderFuture<'a, Session>;

    /// Build a session from tokens delivered in a URL fragment. Only provider
    /// bookkeeping (looking up the subject) happens here; no code exchange.
    fn session_from_tokens<'a>(
        &'a self,
        access_token: &'a str,
        refresh_token: &'a str,
    ) -> ProviderFuture<'a, Session>;

    /// Ask the provider to email a sign-in link.
    fn send_magic_link<'a>(&'a self, request: &'a MagicLinkRequest) -> ProviderFuture<'a, ()>;

    /// Revoke the session server-side.
    fn sign_out<'a>(&'a self, access_token: &'a str) -> ProviderFuture<'a, ()>;
}
