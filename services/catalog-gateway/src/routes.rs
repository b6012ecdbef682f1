//! Login, callback, logout and session-debug handlers
//!
//! All of these sit behind `guard_requests`, so the login page is already
//! unreachable for signed-in users and cookie writes made here through
//! `RequestCookies` are rendered onto the response by the middleware.

use auth_session::callback::ERROR_REDIRECT_DELAY;
use auth_session::guard::REDIRECTED_FROM_PARAM;
use auth_session::{CallbackOutcome, HeaderStore, RedirectTarget, SessionStore};
use axum::Json;
use axum::extract::{Extension, Form, Query, State};
use axum::http::{StatusCode, Uri};
use axum::response::{Html, IntoResponse, Redirect, Response};
use identity::{MagicLinkRequest, ProviderError, compute_challenge, generate_verifier};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};
use url::Url;
use url::form_urlencoded;

use crate::AppState;
use crate::auth::{CurrentSession, RequestCookies};
use crate::pages::{self, LoginNotice};

/// Legacy name for the destination hint on the callback URL.
const LEGACY_REDIRECT_PARAM: &str = "redirect";

/// Shown for an `error` code the gateway did not issue.
const GENERIC_LOGIN_ERROR: &str = "Sign-in failed. Please try again.";

/// Why a magic-link request bounced back to the login page. Only the code
/// travels in the URL; the page text is fixed per code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoginError {
    MissingEmail,
    InvalidEmail,
    RateLimited,
    SendFailed,
}

impl LoginError {
    const ALL: [Self; 4] = [
        Self::MissingEmail,
        Self::InvalidEmail,
        Self::RateLimited,
        Self::SendFailed,
    ];

    fn code(self) -> &'static str {
        match self {
            Self::MissingEmail => "missing_email",
            Self::InvalidEmail => "invalid_email",
            Self::RateLimited => "rate_limited",
            Self::SendFailed => "send_failed",
        }
    }

    fn from_code(code: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|e| e.code() == code)
    }

    fn message(self) -> &'static str {
        match self {
            Self::MissingEmail => "Enter your email address.",
            Self::InvalidEmail => "That email address was not accepted. Check it and try again.",
            Self::RateLimited => "Too many sign-in requests. Wait a minute and try again.",
            Self::SendFailed => "Could not send the sign-in link. Please try again.",
        }
    }

    fn from_provider(error: &ProviderError) -> Self {
        match error {
            ProviderError::Rejected { status: 429, .. } => Self::RateLimited,
            ProviderError::Rejected { .. } => Self::InvalidEmail,
            _ => Self::SendFailed,
        }
    }
}

/// Page text for an `error` query value; never the value itself.
fn login_error_message(code: &str) -> &'static str {
    LoginError::from_code(code).map_or(GENERIC_LOGIN_ERROR, LoginError::message)
}

#[derive(Debug, Default, Deserialize)]
pub struct LoginQuery {
    #[serde(rename = "redirectedFrom")]
    redirected_from: Option<String>,
    sent: Option<String>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LoginForm {
    #[serde(default)]
    email: String,
    #[serde(default)]
    redirected_from: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CallbackForm {
    #[serde(default)]
    fragment: String,
}

/// `GET /login`
pub async fn login_page(
    State(state): State<AppState>,
    Query(query): Query<LoginQuery>,
) -> Response {
    let destination = state.auth.sanitizer.sanitize(query.redirected_from.as_deref());
    let notice = match (&query.error, &query.sent) {
        (Some(code), _) => LoginNotice::Error(login_error_message(code)),
        (None, Some(_)) => LoginNotice::LinkSent,
        (None, None) => LoginNotice::None,
    };
    Html(pages::login(
        state.auth.routes.login_path(),
        destination.as_str(),
        notice,
    ))
    .into_response()
}

/// `POST /login`: email a magic link whose callback carries the destination.
#[instrument(skip_all)]
pub async fn request_magic_link(
    State(state): State<AppState>,
    Extension(RequestCookies(store)): Extension<RequestCookies>,
    Form(form): Form<LoginForm>,
) -> Response {
    let auth = &state.auth;
    let destination = auth.sanitizer.sanitize(form.redirected_from.as_deref());
    let email = form.email.trim();
    if email.is_empty() {
        return back_to_login(&state, &destination, &[("error", LoginError::MissingEmail.code())]);
    }

    let callback = format!(
        "{}?{REDIRECTED_FROM_PARAM}={}",
        auth.routes.callback_path(),
        urlencoding::encode(destination.as_str())
    );
    let redirect_to = match auth.sanitizer.absolute(&callback) {
        Ok(url) => url,
        Err(e) => {
            error!(error = %e, "cannot build callback url");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let verifier = generate_verifier();
    let request = MagicLinkRequest {
        email: email.to_owned(),
        redirect_to: redirect_to.to_string(),
        code_challenge: compute_challenge(&verifier),
    };
    match auth.sessions.provider().send_magic_link(&request).await {
        Ok(()) => {
            auth.sessions.remember_verifier(store.as_ref(), &verifier);
            info!(%destination, "magic link sent");
            back_to_login(&state, &destination, &[("sent", "1")])
        }
        Err(e) => {
            let reason = LoginError::from_provider(&e);
            warn!(error = %e, code = reason.code(), "magic link request failed");
            back_to_login(&state, &destination, &[("error", reason.code())])
        }
    }
}

fn back_to_login(
    state: &AppState,
    destination: &RedirectTarget,
    extra: &[(&str, &str)],
) -> Response {
    let mut query = form_urlencoded::Serializer::new(String::new());
    query.append_pair(REDIRECTED_FROM_PARAM, destination.as_str());
    query.extend_pairs(extra);
    Redirect::to(&format!("{}?{}", state.auth.routes.login_path(), query.finish())).into_response()
}

/// `GET <callback>`: exchange `?code=` / report `?error=`; anything else may
/// be in the fragment, which only the browser can see.
pub async fn callback_get(
    State(state): State<AppState>,
    Extension(RequestCookies(store)): Extension<RequestCookies>,
    uri: Uri,
) -> Response {
    let has_payload = form_urlencoded::parse(uri.query().unwrap_or("").as_bytes())
        .any(|(key, _)| key == "code" || key == "error");
    if !has_payload {
        let action = uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or(state.auth.routes.callback_path());
        return Html(pages::callback_bridge(action)).into_response();
    }
    exchange(&state, &store, &uri, None).await
}

/// `POST <callback>`: the bridge page posting the fragment back.
pub async fn callback_post(
    State(state): State<AppState>,
    Extension(RequestCookies(store)): Extension<RequestCookies>,
    uri: Uri,
    Form(form): Form<CallbackForm>,
) -> Response {
    exchange(&state, &store, &uri, Some(&form.fragment)).await
}

async fn exchange(
    state: &AppState,
    store: &HeaderStore,
    uri: &Uri,
    fragment: Option<&str>,
) -> Response {
    let login_path = state.auth.routes.login_path();
    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let mut url = match state.auth.sanitizer.absolute(path_and_query) {
        Ok(url) => url,
        Err(e) => {
            warn!(error = %e, "unparseable callback url");
            return Redirect::to(login_path).into_response();
        }
    };
    if let Some(fragment) = fragment.filter(|f| !f.is_empty()) {
        url.set_fragment(Some(fragment));
    }

    let hint = destination_hint(&url);
    let mut exchanger = state.auth.exchanger();
    match exchanger.handle_callback(&url, hint.as_deref(), store).await {
        CallbackOutcome::Done {
            destination,
            visible_url,
            ..
        } => {
            debug!(visible_url = %visible_url.path(), "credentials consumed");
            Redirect::to(destination.as_str()).into_response()
        }
        CallbackOutcome::Error { error } => (
            StatusCode::UNAUTHORIZED,
            Html(pages::callback_error(
                &error.to_string(),
                login_path,
                ERROR_REDIRECT_DELAY,
            )),
        )
            .into_response(),
        CallbackOutcome::Cancelled => StatusCode::NO_CONTENT.into_response(),
    }
}

/// `redirectedFrom`, else the legacy `redirect` parameter.
fn destination_hint(url: &Url) -> Option<String> {
    let mut legacy = None;
    for (key, value) in url.query_pairs() {
        if key == REDIRECTED_FROM_PARAM {
            return Some(value.into_owned());
        }
        if key == LEGACY_REDIRECT_PARAM && legacy.is_none() {
            legacy = Some(value.into_owned());
        }
    }
    legacy
}

/// `GET|POST /logout`
pub async fn logout(
    State(state): State<AppState>,
    Extension(RequestCookies(store)): Extension<RequestCookies>,
) -> Response {
    let cleared = state.auth.sessions.sign_out(store.as_ref()).await;
    debug!(cookies = cleared.len(), "session cookies cleared");
    Redirect::to(state.auth.routes.login_path()).into_response()
}

/// `GET /session`: who the gateway thinks you are. Cookie names only, never values.
pub async fn session_info(
    Extension(CurrentSession(session)): Extension<CurrentSession>,
    Extension(RequestCookies(store)): Extension<RequestCookies>,
) -> impl IntoResponse {
    let cookies: Vec<String> = store.load_all().into_iter().map(|r| r.name).collect();
    Json(json!({
        "authenticated": session.is_some(),
        "subject": session.as_ref().map(|s| s.subject_id.clone()),
        "email": session.as_ref().and_then(|s| s.email.clone()),
        "expires_at": session.as_ref().map(|s| s.expires_at),
        "cookies": cookies,
    }))
}
