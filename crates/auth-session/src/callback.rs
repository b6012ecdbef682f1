//! Callback credential exchange
//!
//! The identity provider sends the browser back to the callback URL with one
//! of three payloads:
//!
//! 1. `?code=...` (magic link / PKCE): exchanged for a session
//! 2. `#access_token=...&refresh_token=...` (implicit): installed directly
//! 3. `?error=...` or `#error=...`: surfaced to the user
//!
//! `CallbackExchanger` drives one visit through `Idle -> Working -> Done |
//! Error`. Transitions are computed by `transition()`, a pure function, so
//! the state machine is testable without a provider. A cancelled exchanger
//! (the visitor navigated away) drops every further transition.
//!
//! Ordering on success: the session is persisted and read back before the
//! visible URL is rewritten, so the one-time credential is never removed
//! from the address bar before the session exists.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use identity::Session;
use tracing::{info, instrument, warn};
use url::Url;
use url::form_urlencoded;

use crate::manager::SessionManager;
use crate::redirect::{RedirectSanitizer, RedirectTarget};
use crate::store::SessionStore;
use crate::telemetry;

/// How long the error view stays up before sending the user back to login.
pub const ERROR_REDIRECT_DELAY: Duration = Duration::from_secs(3);

/// Upper bound on a provider exchange.
pub const DEFAULT_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(10);

/// Message shown when the callback URL carries nothing usable.
pub const MISSING_CREDENTIALS_MESSAGE: &str =
    "No authentication parameters found in the callback URL";

/// User-visible callback failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallbackError {
    #[error("{}", MISSING_CREDENTIALS_MESSAGE)]
    MissingCredentials,

    /// The provider call failed or timed out, or the session did not persist.
    #[error("{0}")]
    ExchangeFailed(String),

    /// The provider reported an error in the callback URL.
    #[error("{0}")]
    ProviderDenied(String),
}

impl CallbackError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MissingCredentials => "missing_credentials",
            Self::ExchangeFailed(_) => "exchange_failed",
            Self::ProviderDenied(_) => "provider_denied",
        }
    }
}

/// What the callback URL carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialPayload {
    AuthorizationCode {
        code: String,
    },
    ImplicitTokens {
        access_token: String,
        refresh_token: String,
    },
    ProviderError {
        code: String,
        description: String,
    },
    None,
}

impl CredentialPayload {
    /// Classify a callback URL.
    ///
    /// An `error` parameter in either the query or the fragment wins over any
    /// credential. Fragment tokens require both tokens; an access token alone
    /// is reported as an `invalid_request` provider error.
    pub fn classify(url: &Url) -> Self {
        let query: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        let fragment: Vec<(String, String)> = url
            .fragment()
            .map(|f| form_urlencoded::parse(f.as_bytes()).into_owned().collect())
            .unwrap_or_default();

        for pairs in [&query, &fragment] {
            if let Some(code) = param(pairs, "error") {
                return Self::ProviderError {
                    code,
                    description: param(pairs, "error_description").unwrap_or_default(),
                };
            }
        }

        if let Some(access_token) = non_empty(param(&fragment, "access_token")) {
            return match non_empty(param(&fragment, "refresh_token")) {
                Some(refresh_token) => Self::ImplicitTokens {
                    access_token,
                    refresh_token,
                },
                None => Self::ProviderError {
                    code: "invalid_request".into(),
                    description: "The sign-in link is missing its refresh token".into(),
                },
            };
        }

        match non_empty(param(&query, "code")) {
            Some(code) => Self::AuthorizationCode { code },
            None => Self::None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::AuthorizationCode { .. } => "code",
            Self::ImplicitTokens { .. } => "implicit",
            Self::ProviderError { .. } => "provider_error",
            Self::None => "none",
        }
    }
}

fn param(pairs: &[(String, String)], name: &str) -> Option<String> {
    pairs
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.clone())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ExchangeState {
    #[default]
    Idle,
    Working,
    Done(RedirectTarget),
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeEvent {
    Started,
    Succeeded(RedirectTarget),
    Failed(String),
}

/// Pure state transition. Events that make no sense in the current state
/// leave it unchanged; a finished exchange can be started again.
pub fn transition(state: ExchangeState, event: ExchangeEvent) -> ExchangeState {
    match (state, event) {
        (_, ExchangeEvent::Started) => ExchangeState::Working,
        (ExchangeState::Working, ExchangeEvent::Succeeded(destination)) => {
            ExchangeState::Done(destination)
        }
        (ExchangeState::Working, ExchangeEvent::Failed(message)) => ExchangeState::Error(message),
        (state, _) => state,
    }
}

/// Shared flag set when the visitor abandons the callback.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Result of one callback visit.
#[derive(Debug)]
pub enum CallbackOutcome {
    Done {
        destination: RedirectTarget,
        /// The callback URL with its one-time credential removed.
        visible_url: Url,
        session: Session,
    },
    Error {
        error: CallbackError,
    },
    /// Cancelled mid-flight; nothing further should be rendered.
    Cancelled,
}

/// Drives one callback visit.
pub struct CallbackExchanger {
    sessions: SessionManager,
    sanitizer: RedirectSanitizer,
    timeout: Duration,
    state: ExchangeState,
    cancel: CancelToken,
}

impl CallbackExchanger {
    pub fn new(sessions: SessionManager, sanitizer: RedirectSanitizer) -> Self {
        Self {
            sessions,
            sanitizer,
            timeout: DEFAULT_EXCHANGE_TIMEOUT,
            state: ExchangeState::Idle,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> &ExchangeState {
        &self.state
    }

    fn apply(&mut self, event: ExchangeEvent) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        self.state = transition(std::mem::take(&mut self.state), event);
        true
    }

    /// Establish a session from `current_url` and pick where to go next.
    ///
    /// `destination_hint` is untrusted and always sanitized.
    #[instrument(skip_all, fields(path = %current_url.path()))]
    pub async fn handle_callback(
        &mut self,
        current_url: &Url,
        destination_hint: Option<&str>,
        store: &dyn SessionStore,
    ) -> CallbackOutcome {
        if !self.apply(ExchangeEvent::Started) {
            return self.cancelled();
        }

        let payload = CredentialPayload::classify(current_url);
        let kind = payload.kind();
        let result = self.establish(payload, current_url, store).await;
        if self.cancel.is_cancelled() {
            return self.cancelled();
        }

        match result {
            Ok((session, visible_url)) => {
                let destination = self.sanitizer.sanitize(destination_hint);
                self.apply(ExchangeEvent::Succeeded(destination.clone()));
                telemetry::record_callback("ok");
                info!(
                    subject = %session.subject_id,
                    payload = kind,
                    %destination,
                    "callback established session"
                );
                CallbackOutcome::Done {
                    destination,
                    visible_url,
                    session,
                }
            }
            Err(error) => {
                self.apply(ExchangeEvent::Failed(error.to_string()));
                telemetry::record_callback(error.kind());
                warn!(payload = kind, error = %error, "callback failed");
                CallbackOutcome::Error { error }
            }
        }
    }

    fn cancelled(&self) -> CallbackOutcome {
        telemetry::record_callback("cancelled");
        info!("callback cancelled");
        CallbackOutcome::Cancelled
    }

    async fn establish(
        &self,
        payload: CredentialPayload,
        current_url: &Url,
        store: &dyn SessionStore,
    ) -> Result<(Session, Url), CallbackError> {
        let provider = self.sessions.provider();
        match payload {
            CredentialPayload::ProviderError { code, description } => {
                Err(CallbackError::ProviderDenied(if description.is_empty() {
                    code
                } else {
                    description
                }))
            }
            CredentialPayload::ImplicitTokens {
                access_token,
                refresh_token,
            } => {
                let session = self
                    .bounded(provider.session_from_tokens(&access_token, &refresh_token))
                    .await?;
                self.persist_confirmed(store, &session)?;
                Ok((session, strip_credentials(current_url)))
            }
            CredentialPayload::AuthorizationCode { code } => {
                let verifier = self.sessions.codec().read_verifier(&store.load_all());
                let session = self
                    .bounded(provider.exchange_code(&code, verifier.as_deref()))
                    .await?;
                self.persist_confirmed(store, &session)?;
                if verifier.is_some() {
                    store.persist(vec![self.sessions.codec().verifier_removal()]);
                }
                Ok((session, strip_credentials(current_url)))
            }
            CredentialPayload::None => Err(CallbackError::MissingCredentials),
        }
    }

    async fn bounded<F>(&self, exchange: F) -> Result<Session, CallbackError>
    where
        F: Future<Output = identity::Result<Session>>,
    {
        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(Ok(session)) => Ok(session),
            Ok(Err(e)) => Err(CallbackError::ExchangeFailed(e.to_string())),
            Err(_) => Err(CallbackError::ExchangeFailed(format!(
                "The identity provider did not respond within {}s",
                self.timeout.as_secs()
            ))),
        }
    }

    /// Write the session, then read it back before reporting success.
    fn persist_confirmed(
        &self,
        store: &dyn SessionStore,
        session: &Session,
    ) -> Result<(), CallbackError> {
        if self.cancel.is_cancelled() {
            return Err(CallbackError::ExchangeFailed("cancelled".into()));
        }
        self.sessions.establish(store, session);
        match self.sessions.codec().decode(&store.load_all()) {
            Ok(Some(stored)) if stored.subject_id == session.subject_id => Ok(()),
            _ => Err(CallbackError::ExchangeFailed(
                "The session could not be saved".into(),
            )),
        }
    }
}

/// The callback URL without `code`/`state` and without a fragment.
fn strip_credentials(url: &Url) -> Url {
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| key != "code" && key != "state")
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    let mut cleaned = url.clone();
    cleaned.set_fragment(None);
    if kept.is_empty() {
        cleaned.set_query(None);
    } else {
        cleaned.query_pairs_mut().clear().extend_pairs(kept.iter());
    }
    cleaned
}
