//! Session wiring for the HTTP layer
//!
//! `guard_requests` runs in front of every page and forwarded request:
//! 1. Builds a per-request `HeaderStore` from the `Cookie` header
//! 2. Runs the route guard; a redirect short-circuits the handler
//! 3. Otherwise hands the store and the session to the handler via extensions
//! 4. Renders every queued cookie write as `Set-Cookie` on the response,
//!    whichever response that is

use std::sync::Arc;
use std::time::Duration;

use auth_session::{
    CallbackExchanger, CookieOptions, GuardAction, HeaderStore, RedirectSanitizer, RouteGuard,
    RouteTable, SessionCodec, SessionManager,
};
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Redirect, Response};
use identity::{IdentityProvider, Session};
use tracing::debug;

use crate::AppState;
use crate::config::Config;

/// Everything the auth routes and the guard need.
#[derive(Clone)]
pub struct AuthState {
    pub guard: RouteGuard,
    pub sessions: SessionManager,
    pub sanitizer: RedirectSanitizer,
    pub routes: RouteTable,
    pub exchange_timeout: Duration,
}

impl AuthState {
    pub fn from_config(
        config: &Config,
        provider: Arc<dyn IdentityProvider>,
    ) -> auth_session::Result<Self> {
        let routes = RouteTable::new(
            config.routes.protected.clone(),
            &config.routes.login_path,
            &config.routes.callback_path,
        )?;
        let sanitizer = RedirectSanitizer::new(
            config.site.origin(),
            &config.site.default_destination,
            &routes.auth_pages(),
        )?;
        let codec = SessionCodec::new(
            &config.session.cookie_prefix,
            CookieOptions::session(config.session.secure),
        );
        let sessions = SessionManager::new(provider, codec)
            .with_refresh_margin(config.session.refresh_margin_secs);

        Ok(Self {
            guard: RouteGuard::new(routes.clone(), sanitizer.clone(), sessions.clone()),
            sessions,
            sanitizer,
            routes,
            exchange_timeout: Duration::from_secs(config.identity.timeout_secs),
        })
    }

    /// A fresh exchanger for one callback visit.
    pub fn exchanger(&self) -> CallbackExchanger {
        CallbackExchanger::new(self.sessions.clone(), self.sanitizer.clone())
            .with_timeout(self.exchange_timeout)
    }
}

/// The signed-in subject for this request, as resolved by the guard.
#[derive(Clone, Debug)]
pub struct CurrentSession(pub Option<Session>);

/// Cookie store for this request; writes end up as `Set-Cookie`.
#[derive(Clone)]
pub struct RequestCookies(pub Arc<HeaderStore>);

/// Guard middleware, applied with `from_fn_with_state`.
pub async fn guard_requests(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let store = Arc::new(HeaderStore::from_headers(request.headers()));
    let path_and_query = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_owned())
        .unwrap_or_else(|| request.uri().path().to_owned());

    let outcome = state.auth.guard.guard(&path_and_query, store.as_ref()).await;
    if !outcome.refreshed_cookies.is_empty() {
        debug!(
            cookies = outcome.refreshed_cookies.len(),
            "session cookies rewritten during lookup"
        );
    }

    let mut response = match outcome.action {
        GuardAction::Redirect { location } => Redirect::to(&location).into_response(),
        GuardAction::Forward { session } => {
            request.extensions_mut().insert(CurrentSession(session));
            request.extensions_mut().insert(RequestCookies(store.clone()));
            next.run(request).await
        }
    };
    store.apply_to(response.headers_mut());
    response
}
