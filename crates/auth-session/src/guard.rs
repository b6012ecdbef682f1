//! Per-request access decision
//!
//! | path kind  | session | action                               |
//! |------------|---------|--------------------------------------|
//! | protected  | absent  | redirect to login, remembering path  |
//! | protected  | present | forward                              |
//! | login page | present | redirect to the default destination  |
//! | login page | absent  | forward                              |
//! | callback   | any     | forward (never gated)                |
//! | public     | any     | forward                              |
//!
//! Paths are classified in canonical form only. A request whose path still
//! has dot segments or repeated slashes is redirected to the canonical path
//! first, so the path that was checked is the path the upstream serves.
//!
//! Lookup failures count as "absent" so a broken cookie can never open a
//! protected page. Cookies written while loading the session (refreshed
//! tokens, removals) travel with the outcome and must reach the client on
//! whichever response is sent.

use identity::{Session, unix_now};
use tracing::{debug, instrument, warn};
use url::Url;

use crate::cookie::CookieRecord;
use crate::error::{Error, Result};
use crate::manager::{SessionLookup, SessionManager};
use crate::redirect::RedirectSanitizer;
use crate::store::SessionStore;
use crate::telemetry;

/// Query parameter carrying the originally requested path to the login page.
pub const REDIRECTED_FROM_PARAM: &str = "redirectedFrom";

/// Throwaway base for resolving request paths; only the path is kept.
const CANONICAL_BASE: &str = "http://gateway.invalid";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    Public,
    Protected,
    /// The login page (and anything below it)
    AuthPage,
    Callback,
}

impl PathKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Protected => "protected",
            Self::AuthPage => "auth_page",
            Self::Callback => "callback",
        }
    }
}

/// Which paths need a session and where the auth pages live.
#[derive(Debug, Clone)]
pub struct RouteTable {
    protected: Vec<String>,
    login_path: String,
    callback_path: String,
}

impl RouteTable {
    pub fn new(protected: Vec<String>, login_path: &str, callback_path: &str) -> Result<Self> {
        for path in protected.iter().map(String::as_str).chain([login_path, callback_path]) {
            if !path.starts_with('/') || path == "/" {
                return Err(Error::Config(format!("route {path:?} must be a path below /")));
            }
        }
        let login_path = login_path.trim_end_matches('/').to_owned();
        let callback_path = callback_path.trim_end_matches('/').to_owned();
        if let Some(clash) = protected
            .iter()
            .find(|p| login_path.starts_with(p.as_str()) || callback_path.starts_with(p.as_str()))
        {
            return Err(Error::Config(format!(
                "protected prefix {clash:?} covers an auth page"
            )));
        }
        Ok(Self {
            protected,
            login_path,
            callback_path,
        })
    }

    pub fn login_path(&self) -> &str {
        &self.login_path
    }

    pub fn callback_path(&self) -> &str {
        &self.callback_path
    }

    /// Pages a post-login redirect must never land on.
    pub fn auth_pages(&self) -> [&str; 2] {
        [&self.login_path, &self.callback_path]
    }

    /// Protected prefixes match by plain prefix (`/dashboard` also covers
    /// `/dashboard-old`); auth pages match by whole segment.
    pub fn classify(&self, path: &str) -> PathKind {
        if segment_match(path, &self.callback_path) {
            PathKind::Callback
        } else if segment_match(path, &self.login_path) {
            PathKind::AuthPage
        } else if self.protected.iter().any(|p| path.starts_with(p.as_str())) {
            PathKind::Protected
        } else {
            PathKind::Public
        }
    }

    /// The path as a URL parser reads it: dot segments (including `%2e`
    /// forms) resolved, repeated slashes collapsed. `None` when `path` is
    /// already canonical.
    pub fn canonicalize(path: &str) -> Option<String> {
        let resolved = Url::parse(&format!("{CANONICAL_BASE}{path}"))
            .ok()
            .filter(|url| url.host_str() == Some("gateway.invalid"))
            .map(|url| url.path().to_owned())
            .unwrap_or_else(|| "/".to_owned());
        let mut canonical = String::with_capacity(resolved.len());
        for c in resolved.chars() {
            if !(c == '/' && canonical.ends_with('/')) {
                canonical.push(c);
            }
        }
        (canonical != path).then_some(canonical)
    }

    /// Strip a leading route-group segment such as `/(authed)`, which is
    /// a source-tree artifact and never a real URL.
    pub fn strip_route_group(path: &str) -> Option<String> {
        let rest = path.strip_prefix("/(")?;
        let close = rest.find(')')?;
        let group = &rest[..close];
        if group.is_empty() || group.contains('/') {
            return None;
        }
        match &rest[close + 1..] {
            "" => Some("/".to_owned()),
            after if after.starts_with('/') => Some(after.to_owned()),
            _ => None,
        }
    }
}

fn segment_match(path: &str, page: &str) -> bool {
    path == page
        || path
            .strip_prefix(page)
            .is_some_and(|rest| rest.starts_with('/'))
}

#[derive(Debug)]
pub enum GuardAction {
    /// Let the request through. `session` is the signed-in subject, if any.
    Forward { session: Option<Session> },
    /// Answer with a redirect to `location` (a same-origin relative URL).
    Redirect { location: String },
}

#[derive(Debug)]
pub struct GuardOutcome {
    pub action: GuardAction,
    /// Cookies to attach to the response regardless of the action.
    pub refreshed_cookies: Vec<CookieRecord>,
}

impl GuardOutcome {
    fn forward(session: Option<Session>, refreshed_cookies: Vec<CookieRecord>) -> Self {
        Self {
            action: GuardAction::Forward { session },
            refreshed_cookies,
        }
    }

    fn redirect(location: String, refreshed_cookies: Vec<CookieRecord>) -> Self {
        Self {
            action: GuardAction::Redirect { location },
            refreshed_cookies,
        }
    }

    fn action_name(&self) -> &'static str {
        match self.action {
            GuardAction::Forward { .. } => "forward",
            GuardAction::Redirect { .. } => "redirect",
        }
    }
}

/// Decides, per request, whether to forward or redirect.
#[derive(Clone)]
pub struct RouteGuard {
    routes: RouteTable,
    sanitizer: RedirectSanitizer,
    sessions: SessionManager,
}

impl RouteGuard {
    pub fn new(routes: RouteTable, sanitizer: RedirectSanitizer, sessions: SessionManager) -> Self {
        Self {
            routes,
            sanitizer,
            sessions,
        }
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    /// Decide for `path_and_query` (e.g. `/dashboard/settings?x=1`).
    pub async fn guard(&self, path_and_query: &str, store: &dyn SessionStore) -> GuardOutcome {
        self.guard_at(path_and_query, store, unix_now()).await
    }

    #[instrument(skip_all, fields(path = %path_and_query))]
    pub async fn guard_at(
        &self,
        path_and_query: &str,
        store: &dyn SessionStore,
        now: u64,
    ) -> GuardOutcome {
        let (path, query) = match path_and_query.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (path_and_query, None),
        };

        let normalized =
            RouteTable::canonicalize(path).or_else(|| RouteTable::strip_route_group(path));
        if let Some(normalized) = normalized {
            let location = match query {
                Some(query) => format!("{normalized}?{query}"),
                None => normalized,
            };
            debug!(%location, "redirecting to canonical path");
            telemetry::record_guard_decision("normalize");
            return GuardOutcome::redirect(location, Vec::new());
        }

        let kind = self.routes.classify(path);
        if kind == PathKind::Callback {
            telemetry::record_guard_decision("forward");
            return GuardOutcome::forward(None, Vec::new());
        }

        let SessionLookup { session, written } = match self.sessions.load(store, now).await {
            Ok(lookup) => lookup,
            Err(e) => {
                warn!(
                    error = %e,
                    "session lookup failed, clearing cookie and treating as signed out"
                );
                SessionLookup {
                    session: None,
                    written: self.sessions.discard(store),
                }
            }
        };

        let outcome = match (kind, session) {
            (PathKind::Protected, None) => {
                telemetry::record_guard_decision("login_redirect");
                GuardOutcome::redirect(self.login_location(path_and_query), written)
            }
            (PathKind::AuthPage, Some(session)) => {
                debug!(subject = %session.subject_id, "signed-in user on login page");
                telemetry::record_guard_decision("signed_in_redirect");
                GuardOutcome::redirect(self.sanitizer.default_target().into_string(), written)
            }
            (_, session) => {
                telemetry::record_guard_decision("forward");
                GuardOutcome::forward(session, written)
            }
        };
        debug!(kind = kind.as_str(), action = outcome.action_name(), "guard decision");
        outcome
    }

    /// `<login>?redirectedFrom=<sanitized path>`
    pub fn login_location(&self, path_and_query: &str) -> String {
        let from = self.sanitizer.sanitize(Some(path_and_query));
        format!(
            "{}?{REDIRECTED_FROM_PARAM}={}",
            self.routes.login_path(),
            urlencoding::encode(from.as_str())
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::SessionCodec;
    use crate::cookie::CookieOptions;
    use crate::store::MemoryStore;
    use crate::testing::{FakeProvider, session_for};
    use std::sync::Arc;

    const NOW: u64 = 1_700_000_000;

    fn routes() -> RouteTable {
        RouteTable::new(vec!["/dashboard".into(), "/account".into()], "/login", "/auth/callback")
            .unwrap()
    }

    fn guard_with(provider: Arc<FakeProvider>) -> RouteGuard {
        let routes = routes();
        let sanitizer = RedirectSanitizer::new(
            "https://catalog.example.com",
            "/dashboard",
            &routes.auth_pages(),
        )
        .unwrap();
        let codec = SessionCodec::new("sb-test", CookieOptions::session(false));
        RouteGuard::new(routes, sanitizer, SessionManager::new(provider, codec))
    }

    fn signed_in_store(guard: &RouteGuard, session: &Session) -> MemoryStore {
        let store = MemoryStore::new();
        guard.sessions.establish(&store, session);
        store
    }

    fn location(outcome: &GuardOutcome) -> &str {
        match &outcome.action {
            GuardAction::Redirect { location } => location,
            GuardAction::Forward { .. } => panic!("expected redirect, got forward"),
        }
    }

    #[test]
    fn classifies_paths() {
        let routes = routes();
        assert_eq!(routes.classify("/dashboard"), PathKind::Protected);
        assert_eq!(routes.classify("/dashboard/settings"), PathKind::Protected);
        assert_eq!(routes.classify("/account"), PathKind::Protected);
        assert_eq!(routes.classify("/login"), PathKind::AuthPage);
        assert_eq!(routes.classify("/login/"), PathKind::AuthPage);
        assert_eq!(routes.classify("/loginx"), PathKind::Public);
        assert_eq!(routes.classify("/auth/callback"), PathKind::Callback);
        assert_eq!(routes.classify("/"), PathKind::Public);
        assert_eq!(routes.classify("/library"), PathKind::Public);
    }

    #[test]
    fn route_table_rejects_bad_config() {
        assert!(RouteTable::new(vec!["dashboard".into()], "/login", "/auth/callback").is_err());
        assert!(RouteTable::new(vec!["/".into()], "/login", "/auth/callback").is_err());
        assert!(RouteTable::new(vec!["/log".into()], "/login", "/auth/callback").is_err());
        assert!(RouteTable::new(vec![], "login", "/auth/callback").is_err());
    }

    #[test]
    fn strips_route_groups() {
        assert_eq!(
            RouteTable::strip_route_group("/(authed)/dashboard").as_deref(),
            Some("/dashboard")
        );
        assert_eq!(RouteTable::strip_route_group("/(authed)").as_deref(), Some("/"));
        assert_eq!(RouteTable::strip_route_group("/dashboard"), None);
        assert_eq!(RouteTable::strip_route_group("/()/x"), None);
        assert_eq!(RouteTable::strip_route_group("/(authed)x"), None);
        assert_eq!(RouteTable::strip_route_group("/(a/b)/x"), None);
    }

    #[tokio::test]
    async fn unauthenticated_protected_path_redirects_to_login() {
        let guard = guard_with(Arc::new(FakeProvider::new()));
        let outcome = guard
            .guard_at("/dashboard/settings?x=1", &MemoryStore::new(), NOW)
            .await;
        assert_eq!(
            location(&outcome),
            "/login?redirectedFrom=%2Fdashboard%2Fsettings%3Fx%3D1"
        );
        assert!(outcome.refreshed_cookies.is_empty());
    }

    #[tokio::test]
    async fn authenticated_protected_path_forwards_session() {
        let guard = guard_with(Arc::new(FakeProvider::new()));
        let session = session_for("user-1", "rt_1", NOW + 3600);
        let store = signed_in_store(&guard, &session);

        let outcome = guard.guard_at("/dashboard", &store, NOW).await;
        match outcome.action {
            GuardAction::Forward { session: Some(s) } => assert_eq!(s, session),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn signed_in_user_leaves_login_page() {
        let guard = guard_with(Arc::new(FakeProvider::new()));
        let store = signed_in_store(&guard, &session_for("user-1", "rt_1", NOW + 3600));

        let outcome = guard.guard_at("/login?redirectedFrom=%2Fx", &store, NOW).await;
        assert_eq!(location(&outcome), "/dashboard");
    }

    #[tokio::test]
    async fn signed_out_user_sees_login_page() {
        let guard = guard_with(Arc::new(FakeProvider::new()));
        let outcome = guard.guard_at("/login", &MemoryStore::new(), NOW).await;
        assert!(matches!(outcome.action, GuardAction::Forward { session: None }));
    }

    #[tokio::test]
    async fn callback_is_never_gated_and_skips_lookup() {
        let provider = Arc::new(FakeProvider::new());
        let guard = guard_with(provider.clone());
        // Expired session whose refresh would be attempted on any other path
        let store = signed_in_store(&guard, &session_for("user-1", "rt_1", NOW - 10));

        let outcome = guard.guard_at("/auth/callback?code=abc", &store, NOW).await;
        assert!(matches!(outcome.action, GuardAction::Forward { session: None }));
        assert_eq!(provider.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn public_path_forwards_with_or_without_session() {
        let guard = guard_with(Arc::new(FakeProvider::new()));
        let outcome = guard.guard_at("/library", &MemoryStore::new(), NOW).await;
        assert!(matches!(outcome.action, GuardAction::Forward { session: None }));

        let store = signed_in_store(&guard, &session_for("user-1", "rt_1", NOW + 3600));
        let outcome = guard.guard_at("/library", &store, NOW).await;
        assert!(matches!(outcome.action, GuardAction::Forward { session: Some(_) }));
    }

    #[tokio::test]
    async fn refreshed_cookies_ride_along() {
        let refreshed = session_for("user-1", "rt_2", NOW + 3600);
        let provider = Arc::new(FakeProvider::new().accept_refresh("rt_1", refreshed.clone()));
        let guard = guard_with(provider.clone());
        let store = signed_in_store(&guard, &session_for("user-1", "rt_1", NOW + 5));

        let outcome = guard.guard_at("/dashboard", &store, NOW).await;
        assert!(!outcome.refreshed_cookies.is_empty());
        assert!(outcome.refreshed_cookies.iter().all(|r| !r.is_removal()));
        match outcome.action {
            GuardAction::Forward { session: Some(s) } => assert_eq!(s, refreshed),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(provider.refresh_calls(), 1);
    }

    #[tokio::test]
    async fn rejected_refresh_redirects_and_clears() {
        let guard = guard_with(Arc::new(FakeProvider::new()));
        let store = signed_in_store(&guard, &session_for("user-1", "rt_revoked", NOW - 1));

        let outcome = guard.guard_at("/account", &store, NOW).await;
        assert_eq!(location(&outcome), "/login?redirectedFrom=%2Faccount");
        assert!(!outcome.refreshed_cookies.is_empty());
        assert!(outcome.refreshed_cookies.iter().all(CookieRecord::is_removal));
    }

    #[tokio::test]
    async fn corrupt_cookie_fails_closed_and_is_cleared() {
        let provider = Arc::new(FakeProvider::new());
        let guard = guard_with(provider.clone());
        let store = MemoryStore::with_records(vec![
            CookieRecord::new("sb-test-auth-token", "base64-@@"),
            CookieRecord::new("theme", "dark"),
        ]);

        let outcome = guard.guard_at("/dashboard", &store, NOW).await;
        assert_eq!(location(&outcome), "/login?redirectedFrom=%2Fdashboard");
        assert_eq!(outcome.refreshed_cookies.len(), 1);
        assert_eq!(outcome.refreshed_cookies[0].name, "sb-test-auth-token");
        assert!(outcome.refreshed_cookies[0].is_removal());
        assert_eq!(store.names(), vec!["theme".to_owned()]);
        assert_eq!(provider.refresh_calls(), 0);

        // The next request carries no session cookie and is a plain sign-out state.
        let outcome = guard.guard_at("/dashboard", &store, NOW).await;
        assert!(outcome.refreshed_cookies.is_empty());
    }

    #[tokio::test]
    async fn refresh_cookies_ride_along_on_redirect() {
        let refreshed = session_for("user-1", "rt_2", NOW + 3600);
        let provider = Arc::new(FakeProvider::new().accept_refresh("rt_1", refreshed));
        let guard = guard_with(provider.clone());
        let store = signed_in_store(&guard, &session_for("user-1", "rt_1", NOW + 5));

        let outcome = guard.guard_at("/login", &store, NOW).await;
        assert_eq!(location(&outcome), "/dashboard");
        assert!(!outcome.refreshed_cookies.is_empty());
        assert!(outcome.refreshed_cookies.iter().all(|r| !r.is_removal()));
        assert!(
            outcome
                .refreshed_cookies
                .iter()
                .all(|r| r.value.starts_with("base64-"))
        );
        assert_eq!(provider.refresh_calls(), 1);
    }

    #[tokio::test]
    async fn route_group_prefix_is_normalized() {
        let provider = Arc::new(FakeProvider::new());
        let guard = guard_with(provider.clone());
        let outcome = guard
            .guard_at("/(authed)/dashboard?tab=1", &MemoryStore::new(), NOW)
            .await;
        assert_eq!(location(&outcome), "/dashboard?tab=1");
        assert_eq!(provider.refresh_calls(), 0);
    }

    #[test]
    fn login_redirect_never_points_at_auth_pages() {
        let guard = guard_with(Arc::new(FakeProvider::new()));
        // Resolves onto the login page, so it sanitizes to the default destination
        assert_eq!(
            guard.login_location("/dashboard/../login"),
            "/login?redirectedFrom=%2Fdashboard"
        );
    }

    #[test]
    fn canonicalizes_paths() {
        let cases = [
            ("/x/../dashboard", "/dashboard"),
            ("/./upload", "/upload"),
            ("/login/../dashboard", "/dashboard"),
            ("/auth/callback/../../dashboard", "/dashboard"),
            ("/%2e%2e/dashboard", "/dashboard"),
            ("/x/%2E%2E/account", "/account"),
            ("/../../dashboard", "/dashboard"),
            ("//evil.example/x", "/evil.example/x"),
            ("/library//shelf", "/library/shelf"),
        ];
        for (raw, expected) in cases {
            assert_eq!(RouteTable::canonicalize(raw).as_deref(), Some(expected), "{raw}");
            assert_eq!(RouteTable::canonicalize(expected), None, "{expected}");
        }
        assert_eq!(RouteTable::canonicalize("/dashboard"), None);
        assert_eq!(RouteTable::canonicalize("/"), None);
        assert_eq!(RouteTable::canonicalize("/(authed)/dashboard"), None);
    }

    #[tokio::test]
    async fn dot_segments_redirect_to_canonical_path_before_any_check() {
        let provider = Arc::new(FakeProvider::new());
        let guard = guard_with(provider.clone());
        // An expired session would trigger a refresh if the lookup ran
        let store = signed_in_store(&guard, &session_for("user-1", "rt_1", NOW - 10));

        for (raw, expected) in [
            ("/x/../dashboard", "/dashboard"),
            ("/./upload", "/upload"),
            ("/login/../dashboard", "/dashboard"),
            ("/auth/callback/../../dashboard", "/dashboard"),
            ("/x/../dashboard?tab=2", "/dashboard?tab=2"),
        ] {
            let outcome = guard.guard_at(raw, &store, NOW).await;
            assert_eq!(location(&outcome), expected, "{raw}");
            assert!(outcome.refreshed_cookies.is_empty());
        }
        assert_eq!(provider.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn canonical_path_is_then_gated() {
        let guard = guard_with(Arc::new(FakeProvider::new()));
        let store = MemoryStore::new();

        let first = guard.guard_at("/login/../dashboard", &store, NOW).await;
        let second = guard.guard_at(location(&first), &store, NOW).await;
        assert_eq!(location(&second), "/login?redirectedFrom=%2Fdashboard");
    }
}
