//! In-process identity provider for tests
//!
//! Enabled for this crate's own tests and, through the `testing` feature, for
//! downstream crates. Nothing here talks to the network.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use common::Secret;
use identity::{
    IdentityProvider, MagicLinkRequest, ProviderError, ProviderFuture, Session, unix_now,
};

/// Build a session for `subject` with the given refresh token and expiry.
pub fn session_for(subject: &str, refresh_token: &str, expires_at: u64) -> Session {
    Session {
        subject_id: subject.to_owned(),
        email: Some(format!("{subject}@example.com")),
        access_token: Secret::new(format!("at_{subject}_{expires_at}")),
        refresh_token: Secret::from(refresh_token),
        expires_at,
    }
}

/// Scripted identity provider.
///
/// - codes registered with `accept_code` exchange to their session; others
///   are rejected the way the hosted provider rejects a used link
/// - refresh tokens registered with `accept_refresh` refresh; others are
///   rejected, except `UNREACHABLE`, which fails like a network error
/// - fragment tokens become a session for subject `fragment-user`, unless the
///   access token is `REJECTED_ACCESS_TOKEN`
#[derive(Default)]
pub struct FakeProvider {
    codes: HashMap<String, Session>,
    refreshes: HashMap<String, Session>,
    delay: Option<Duration>,
    exchange_calls: AtomicUsize,
    refresh_calls: AtomicUsize,
    sign_out_calls: AtomicUsize,
    verifiers: Mutex<Vec<Option<String>>>,
    magic_links: Mutex<Vec<MagicLinkRequest>>,
}

impl FakeProvider {
    /// Refresh token that simulates an unreachable provider.
    pub const UNREACHABLE: &'static str = "rt_unreachable";
    /// Fragment access token the provider refuses.
    pub const REJECTED_ACCESS_TOKEN: &'static str = "at_rejected";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn accept_code(mut self, code: &str, session: Session) -> Self {
        self.codes.insert(code.to_owned(), session);
        self
    }

    pub fn accept_refresh(mut self, refresh_token: &str, session: Session) -> Self {
        self.refreshes.insert(refresh_token.to_owned(), session);
        self
    }

    /// Delay every code exchange and fragment lookup.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn exchange_calls(&self) -> usize {
        self.exchange_calls.load(Ordering::Relaxed)
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::Relaxed)
    }

    pub fn sign_out_calls(&self) -> usize {
        self.sign_out_calls.load(Ordering::Relaxed)
    }

    /// PKCE verifiers received by `exchange_code`, in call order.
    pub fn verifiers(&self) -> Vec<Option<String>> {
        self.verifiers.lock().map(|v| v.clone()).unwrap_or_default()
    }

    pub fn magic_links(&self) -> Vec<MagicLinkRequest> {
        self.magic_links.lock().map(|v| v.clone()).unwrap_or_default()
    }

    async fn pause(&self) {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }
}

fn rejected(message: &str) -> ProviderError {
    ProviderError::Rejected {
        status: 400,
        message: message.to_owned(),
    }
}

impl IdentityProvider for FakeProvider {
    fn id(&self) -> &str {
        "fake"
    }

    fn exchange_code<'a>(
        &'a self,
        code: &'a str,
        code_verifier: Option<&'a str>,
    ) -> ProviderFuture<'a, Session> {
        Box::pin(async move {
            self.exchange_calls.fetch_add(1, Ordering::Relaxed);
            if let Ok(mut verifiers) = self.verifiers.lock() {
                verifiers.push(code_verifier.map(str::to_owned));
            }
            self.pause().await;
            self.codes
                .get(code)
                .cloned()
                .ok_or_else(|| rejected("Email link is invalid or has expired"))
        })
    }

    fn refresh_session<'a>(&'a self, refresh_token: &'a str) -> ProviderFuture<'a, Session> {
        Box::pin(async move {
            self.refresh_calls.fetch_add(1, Ordering::Relaxed);
            if refresh_token == Self::UNREACHABLE {
                return Err(ProviderError::Http("connection refused".into()));
            }
            self.refreshes
                .get(refresh_token)
                .cloned()
                .ok_or_else(|| rejected("Invalid Refresh Token: Refresh Token Not Found"))
        })
    }

    fn session_from_tokens<'a>(
        &'a self,
        access_token: &'a str,
        refresh_token: &'a str,
    ) -> ProviderFuture<'a, Session> {
        Box::pin(async move {
            self.exchange_calls.fetch_add(1, Ordering::Relaxed);
            self.pause().await;
            if access_token == Self::REJECTED_ACCESS_TOKEN {
                return Err(ProviderError::Rejected {
                    status: 401,
                    message: "invalid JWT".into(),
                });
            }
            Ok(Session {
                subject_id: "fragment-user".into(),
                email: Some("fragment-user@example.com".into()),
                access_token: Secret::from(access_token),
                refresh_token: Secret::from(refresh_token),
                expires_at: unix_now() + 3600,
            })
        })
    }

    fn send_magic_link<'a>(&'a self, request: &'a MagicLinkRequest) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            if request.email.contains('@') {
                if let Ok(mut links) = self.magic_links.lock() {
                    links.push(request.clone());
                }
                Ok(())
            } else {
                Err(ProviderError::Rejected {
                    status: 422,
                    message: "Unable to validate email address: invalid format".into(),
                })
            }
        })
    }

    fn sign_out<'a>(&'a self, _access_token: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.sign_out_calls.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
    }
}
