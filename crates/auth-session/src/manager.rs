//! Session lookup, refresh, and sign-out over a `SessionStore`

use std::sync::Arc;

use identity::{IdentityProvider, Session};
use tracing::{debug, info, instrument, warn};

use crate::codec::SessionCodec;
use crate::cookie::CookieRecord;
use crate::error::{Error, Result};
use crate::store::SessionStore;
use crate::telemetry;

/// Refresh this many seconds before expiry by default.
pub const DEFAULT_REFRESH_MARGIN_SECS: u64 = 60;

/// Result of a session lookup.
#[derive(Debug, Default)]
pub struct SessionLookup {
    /// The usable session, if any.
    pub session: Option<Session>,
    /// Cookies written during the lookup (refreshed tokens or removals).
    /// These must reach the client with the response.
    pub written: Vec<CookieRecord>,
}

impl SessionLookup {
    pub fn absent() -> Self {
        Self::default()
    }

    fn current(session: Session) -> Self {
        Self {
            session: Some(session),
            written: Vec::new(),
        }
    }
}

/// Reads and maintains the session stored in cookies.
#[derive(Clone)]
pub struct SessionManager {
    provider: Arc<dyn IdentityProvider>,
    codec: SessionCodec,
    refresh_margin: u64,
}

impl SessionManager {
    pub fn new(provider: Arc<dyn IdentityProvider>, codec: SessionCodec) -> Self {
        Self {
            provider,
            codec,
            refresh_margin: DEFAULT_REFRESH_MARGIN_SECS,
        }
    }

    pub fn with_refresh_margin(mut self, seconds: u64) -> Self {
        self.refresh_margin = seconds;
        self
    }

    pub fn codec(&self) -> &SessionCodec {
        &self.codec
    }

    pub fn provider(&self) -> &Arc<dyn IdentityProvider> {
        &self.provider
    }

    /// Load the session, refreshing it at most once if it is near expiry.
    ///
    /// - near expiry, refresh succeeds: new tokens are persisted and returned
    /// - refresh fails while the token is still valid: current session kept
    /// - expired and the provider rejects the refresh token: cookies cleared
    /// - expired and the provider is unreachable: absent, cookies kept
    ///
    /// Errors only when the stored cookie cannot be decoded.
    #[instrument(skip_all, fields(provider = %self.provider.id()))]
    pub async fn load(&self, store: &dyn SessionStore, now: u64) -> Result<SessionLookup> {
        let records = store.load_all();
        let session = self
            .codec
            .decode(&records)
            .map_err(|e| Error::SessionLookupFailed(e.to_string()))?;
        let Some(session) = session else {
            return Ok(SessionLookup::absent());
        };

        if !session.expires_within(now, self.refresh_margin) {
            return Ok(SessionLookup::current(session));
        }

        debug!(
            subject = %session.subject_id,
            expires_at = session.expires_at,
            "session near expiry, refreshing"
        );
        match self
            .provider
            .refresh_session(session.refresh_token.expose())
            .await
        {
            Ok(refreshed) => {
                let written = self.codec.encode(&refreshed, &records);
                store.persist(written.clone());
                telemetry::record_refresh("ok");
                info!(
                    subject = %refreshed.subject_id,
                    expires_at = refreshed.expires_at,
                    "session refreshed"
                );
                Ok(SessionLookup {
                    session: Some(refreshed),
                    written,
                })
            }
            Err(e) if session.is_valid_at(now) => {
                telemetry::record_refresh("deferred");
                warn!(error = %e, "proactive refresh failed, keeping current session");
                Ok(SessionLookup::current(session))
            }
            Err(e) if e.is_rejection() => {
                telemetry::record_refresh("rejected");
                warn!(
                    error = %e,
                    subject = %session.subject_id,
                    "refresh token rejected, clearing session"
                );
                let written = self.codec.clear(&records);
                store.persist(written.clone());
                Ok(SessionLookup {
                    session: None,
                    written,
                })
            }
            Err(e) => {
                telemetry::record_refresh("error");
                warn!(error = %e, "refresh failed on expired session");
                Ok(SessionLookup::absent())
            }
        }
    }

    /// Persist a freshly established session, replacing any previous one.
    pub fn establish(&self, store: &dyn SessionStore, session: &Session) -> Vec<CookieRecord> {
        let written = self.codec.encode(session, &store.load_all());
        store.persist(written.clone());
        written
    }

    /// Remove every session cookie without consulting the provider, e.g. when
    /// the stored value cannot be decoded.
    pub fn discard(&self, store: &dyn SessionStore) -> Vec<CookieRecord> {
        let written = self.codec.clear(&store.load_all());
        if !written.is_empty() {
            store.persist(written.clone());
        }
        written
    }

    /// Revoke the session with the provider (best effort) and clear cookies.
    #[instrument(skip_all)]
    pub async fn sign_out(&self, store: &dyn SessionStore) -> Vec<CookieRecord> {
        let records = store.load_all();
        match self.codec.decode(&records) {
            Ok(Some(session)) => {
                if let Err(e) = self.provider.sign_out(session.access_token.expose()).await {
                    warn!(error = %e, "provider sign-out failed, clearing cookies anyway");
                }
                info!(subject = %session.subject_id, "signed out");
            }
            Ok(None) => debug!("sign-out without a session"),
            Err(e) => debug!(error = %e, "clearing unreadable session cookie"),
        }

        let mut written = self.codec.clear(&records);
        if self.codec.read_verifier(&records).is_some() {
            written.push(self.codec.verifier_removal());
        }
        store.persist(written.clone());
        written
    }

    /// Store the PKCE verifier for an outstanding magic link.
    pub fn remember_verifier(&self, store: &dyn SessionStore, verifier: &str) {
        store.persist(vec![self.codec.verifier_record(verifier)]);
    }

    /// Read and remove the PKCE verifier.
    pub fn take_verifier(&self, store: &dyn SessionStore) -> Option<String> {
        let verifier = self.codec.read_verifier(&store.load_all())?;
        store.persist(vec![self.codec.verifier_removal()]);
        Some(verifier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cookie::CookieOptions;
    use crate::store::MemoryStore;
    use crate::testing::{FakeProvider, session_for};

    const NOW: u64 = 1_700_000_000;

    fn manager(provider: Arc<FakeProvider>) -> SessionManager {
        SessionManager::new(provider, SessionCodec::new("sb-test", CookieOptions::session(false)))
    }

    fn store_with(manager: &SessionManager, session: &Session) -> MemoryStore {
        let store = MemoryStore::new();
        manager.establish(&store, session);
        store
    }

    #[tokio::test]
    async fn no_cookie_is_absent() {
        let provider = Arc::new(FakeProvider::new());
        let lookup = manager(provider.clone()).load(&MemoryStore::new(), NOW).await.unwrap();
        assert!(lookup.session.is_none());
        assert!(lookup.written.is_empty());
        assert_eq!(provider.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn fresh_session_is_not_refreshed() {
        let provider = Arc::new(FakeProvider::new());
        let manager = manager(provider.clone());
        let session = session_for("user-1", "rt_1", NOW + 3600);
        let store = store_with(&manager, &session);

        let lookup = manager.load(&store, NOW).await.unwrap();
        assert_eq!(lookup.session, Some(session));
        assert!(lookup.written.is_empty());
        assert_eq!(provider.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn near_expiry_refreshes_exactly_once() {
        let refreshed = session_for("user-1", "rt_2", NOW + 3600);
        let provider = Arc::new(FakeProvider::new().accept_refresh("rt_1", refreshed.clone()));
        let manager = manager(provider.clone());
        let store = store_with(&manager, &session_for("user-1", "rt_1", NOW + 30));

        let lookup = manager.load(&store, NOW).await.unwrap();
        assert_eq!(lookup.session, Some(refreshed.clone()));
        assert!(!lookup.written.is_empty());
        assert_eq!(provider.refresh_calls(), 1);

        // The refreshed cookies are what the next request sees
        let again = manager.load(&store, NOW).await.unwrap();
        assert_eq!(again.session, Some(refreshed));
        assert_eq!(provider.refresh_calls(), 1);
    }

    #[tokio::test]
    async fn failed_proactive_refresh_keeps_valid_session() {
        let provider = Arc::new(FakeProvider::new());
        let manager = manager(provider.clone());
        let session = session_for("user-1", "rt_unknown", NOW + 30);
        let store = store_with(&manager, &session);

        let lookup = manager.load(&store, NOW).await.unwrap();
        assert_eq!(lookup.session, Some(session));
        assert!(lookup.written.is_empty());
        assert_eq!(provider.refresh_calls(), 1);
    }

    #[tokio::test]
    async fn rejected_refresh_of_expired_session_clears_cookies() {
        let provider = Arc::new(FakeProvider::new());
        let manager = manager(provider.clone());
        let store = store_with(&manager, &session_for("user-1", "rt_revoked", NOW - 10));

        let lookup = manager.load(&store, NOW).await.unwrap();
        assert!(lookup.session.is_none());
        assert!(lookup.written.iter().all(CookieRecord::is_removal));
        assert!(!lookup.written.is_empty());
        assert!(store.load_all().is_empty());
        assert_eq!(provider.refresh_calls(), 1);
    }

    #[tokio::test]
    async fn unreachable_provider_on_expired_session_keeps_cookies() {
        let provider = Arc::new(FakeProvider::new());
        let manager = manager(provider.clone());
        let store =
            store_with(&manager, &session_for("user-1", FakeProvider::UNREACHABLE, NOW - 10));

        let lookup = manager.load(&store, NOW).await.unwrap();
        assert!(lookup.session.is_none());
        assert!(lookup.written.is_empty());
        assert!(!store.load_all().is_empty());
        assert_eq!(provider.refresh_calls(), 1);
    }

    #[tokio::test]
    async fn corrupt_cookie_is_lookup_failure() {
        let provider = Arc::new(FakeProvider::new());
        let store =
            MemoryStore::with_records(vec![CookieRecord::new("sb-test-auth-token", "base64-%%%")]);

        let result = manager(provider.clone()).load(&store, NOW).await;
        assert!(matches!(result, Err(Error::SessionLookupFailed(_))));
        assert_eq!(provider.refresh_calls(), 0);
    }

    #[test]
    fn discard_removes_only_session_cookies() {
        let manager = manager(Arc::new(FakeProvider::new()));
        let store = MemoryStore::with_records(vec![
            CookieRecord::new("sb-test-auth-token.0", "base64-%%%"),
            CookieRecord::new("sb-test-auth-token.1", "garbage"),
            CookieRecord::new("theme", "dark"),
        ]);

        let written = manager.discard(&store);
        assert_eq!(written.len(), 2);
        assert!(written.iter().all(CookieRecord::is_removal));
        assert_eq!(store.names(), vec!["theme".to_owned()]);

        assert!(manager.discard(&store).is_empty());
    }

    #[tokio::test]
    async fn sign_out_revokes_and_clears() {
        let provider = Arc::new(FakeProvider::new());
        let manager = manager(provider.clone());
        let store = store_with(&manager, &session_for("user-1", "rt_1", NOW + 3600));
        manager.remember_verifier(&store, "verifier");
        store.persist(vec![CookieRecord::new("theme", "dark")]);

        let written = manager.sign_out(&store).await;
        assert!(written.iter().all(CookieRecord::is_removal));
        assert_eq!(store.names(), vec!["theme".to_owned()]);
        assert_eq!(provider.sign_out_calls(), 1);
    }

    #[tokio::test]
    async fn sign_out_without_session_skips_provider() {
        let provider = Arc::new(FakeProvider::new());
        let written = manager(provider.clone()).sign_out(&MemoryStore::new()).await;
        assert!(written.is_empty());
        assert_eq!(provider.sign_out_calls(), 0);
    }

    #[test]
    fn verifier_is_taken_once() {
        let manager = manager(Arc::new(FakeProvider::new()));
        let store = MemoryStore::new();
        manager.remember_verifier(&store, "v1");

        assert_eq!(manager.take_verifier(&store).as_deref(), Some("v1"));
        assert_eq!(manager.take_verifier(&store), None);
    }
}
