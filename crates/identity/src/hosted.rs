//! HTTP client for the hosted auth REST API
//!
//! Four interactions:
//! 1. Code exchange (`grant_type=pkce`) when a magic link lands on the callback
//! 2. Refresh (`grant_type=refresh_token`) when a session nears expiry
//! 3. User lookup for tokens delivered in a URL fragment
//! 4. Magic-link request and sign-out
//!
//! Construction validates the base URL and anon key, so a misconfigured
//! deployment fails at startup instead of on first use.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use common::Secret;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, instrument};
use url::Url;

use crate::endpoints::{API_KEY_HEADER, LOGOUT_PATH, OTP_PATH, TOKEN_PATH, USER_PATH};
use crate::error::{ProviderError, Result};
use crate::session::{Session, unix_now};
use crate::{IdentityProvider, MagicLinkRequest, ProviderFuture};

/// Token endpoint response for both exchange and refresh.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    /// Seconds until the access token expires (delta)
    #[serde(default)]
    expires_in: Option<u64>,
    /// Absolute expiry in unix seconds, preferred when present
    #[serde(default)]
    expires_at: Option<u64>,
    #[serde(default)]
    user: Option<UserResponse>,
}

#[derive(Debug, Deserialize)]
struct UserResponse {
    id: String,
    #[serde(default)]
    email: Option<String>,
}

impl TokenResponse {
    fn into_session(self, now: u64) -> Result<Session> {
        let expires_at = self
            .expires_at
            .or_else(|| self.expires_in.map(|delta| now.saturating_add(delta)))
            .ok_or_else(|| ProviderError::InvalidResponse("token response has no expiry".into()))?;
        let user = self
            .user
            .ok_or_else(|| ProviderError::InvalidResponse("token response has no user".into()))?;

        Ok(Session {
            subject_id: user.id,
            email: user.email,
            access_token: Secret::new(self.access_token),
            refresh_token: Secret::new(self.refresh_token),
            expires_at,
        })
    }
}

/// Identity provider backed by the hosted auth REST API.
pub struct HostedProvider {
    base_url: String,
    anon_key: Secret<String>,
    http: reqwest::Client,
}

impl HostedProvider {
    /// Create a client for the provider at `base_url`.
    ///
    /// Fails with `ProviderError::Config` when the URL is not http(s) or the
    /// anon key is blank.
    pub fn new(base_url: &str, anon_key: Secret<String>) -> Result<Self> {
        let parsed = Url::parse(base_url)
            .map_err(|e| ProviderError::Config(format!("identity url {base_url:?}: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ProviderError::Config(format!(
                "identity url must use http or https, got: {base_url}"
            )));
        }
        if anon_key.expose().trim().is_empty() {
            return Err(ProviderError::Config("anon key must not be empty".into()));
        }

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            anon_key,
            http: reqwest::Client::new(),
        })
    }

    /// Use a custom HTTP client (timeouts, connection pool reuse).
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }

    fn endpoint(&self, path: &str, query: &[(&str, &str)]) -> Result<Url> {
        let mut url = Url::parse(&format!("{}/{path}", self.base_url))
            .map_err(|e| ProviderError::Config(format!("building {path} url: {e}")))?;
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url)
    }

    async fn token_grant(&self, grant_type: &str, body: serde_json::Value) -> Result<Session> {
        let url = self.endpoint(TOKEN_PATH, &[("grant_type", grant_type)])?;
        let response = self
            .http
            .post(url)
            .header(API_KEY_HEADER, self.anon_key.expose().as_str())
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Http(format!("{grant_type} grant request failed: {e}")))?;

        let response = ensure_success(response).await?;
        let token = response
            .json::<TokenResponse>()
            .await
            .map_err(|e| ProviderError::InvalidResponse(format!("token response: {e}")))?;
        token.into_session(unix_now())
    }

    async fn fetch_user(&self, access_token: &str) -> Result<UserResponse> {
        let response = self
            .http
            .get(self.endpoint(USER_PATH, &[])?)
            .header(API_KEY_HEADER, self.anon_key.expose().as_str())
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| ProviderError::Http(format!("user request failed: {e}")))?;

        let response = ensure_success(response).await?;
        response
            .json::<UserResponse>()
            .await
            .map_err(|e| ProviderError::InvalidResponse(format!("user response: {e}")))
    }

    #[instrument(skip_all)]
    async fn tokens_to_session(&self, access_token: &str, refresh_token: &str) -> Result<Session> {
        let expires_at = jwt_expiry(access_token).ok_or_else(|| {
            ProviderError::InvalidResponse("access token carries no exp claim".into())
        })?;

        if expires_at <= unix_now() {
            debug!("fragment access token already expired, refreshing");
            return self.refresh(refresh_token).await;
        }

        let user = self.fetch_user(access_token).await?;
        Ok(Session {
            subject_id: user.id,
            email: user.email,
            access_token: Secret::from(access_token),
            refresh_token: Secret::from(refresh_token),
            expires_at,
        })
    }

    async fn refresh(&self, refresh_token: &str) -> Result<Session> {
        self.token_grant("refresh_token", json!({ "refresh_token": refresh_token }))
            .await
    }
}

impl IdentityProvider for HostedProvider {
    fn id(&self) -> &str {
        "hosted"
    }

    fn exchange_code<'a>(
        &'a self,
        code: &'a str,
        code_verifier: Option<&'a str>,
    ) -> ProviderFuture<'a, Session> {
        Box::pin(async move {
            let mut body = json!({ "auth_code": code });
            if let Some(verifier) = code_verifier {
                body["code_verifier"] = json!(verifier);
            }
            self.token_grant("pkce", body).await
        })
    }

    fn refresh_session<'a>(&'a self, refresh_token: &'a str) -> ProviderFuture<'a, Session> {
        Box::pin(self.refresh(refresh_token))
    }

    fn session_from_tokens<'a>(
        &'a self,
        access_token: &'a str,
        refresh_token: &'a str,
    ) -> ProviderFuture<'a, Session> {
        Box::pin(self.tokens_to_session(access_token, refresh_token))
    }

    fn send_magic_link<'a>(&'a self, request: &'a MagicLinkRequest) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            let url = self.endpoint(OTP_PATH, &[("redirect_to", request.redirect_to.as_str())])?;
            let response = self
                .http
                .post(url)
                .header(API_KEY_HEADER, self.anon_key.expose().as_str())
                .json(&json!({
                    "email": request.email,
                    "create_user": true,
                    "code_challenge": request.code_challenge,
                    "code_challenge_method": "s256",
                }))
                .send()
                .await
                .map_err(|e| ProviderError::Http(format!("magic link request failed: {e}")))?;
            ensure_success(response).await?;
            Ok(())
        })
    }

    fn sign_out<'a>(&'a self, access_token: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            let url = self.endpoint(LOGOUT_PATH, &[("scope", "local")])?;
            let response = self
                .http
                .post(url)
                .header(API_KEY_HEADER, self.anon_key.expose().as_str())
                .bearer_auth(access_token)
                .send()
                .await
                .map_err(|e| ProviderError::Http(format!("sign-out request failed: {e}")))?;

            // Already revoked or expired: nothing left to sign out
            if matches!(response.status().as_u16(), 401 | 403 | 404) {
                return Ok(());
            }
            ensure_success(response).await?;
            Ok(())
        })
    }
}

/// Map non-success responses to `Rejected` (4xx) or `Http` (everything else).
async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| String::from("<no body>"));
    let message = provider_message(&body);

    if status.is_client_error() {
        return Err(ProviderError::Rejected {
            status: status.as_u16(),
            message,
        });
    }
    Err(ProviderError::Http(format!(
        "identity provider returned {status}: {message}"
    )))
}

/// Pull the human-readable message out of a provider error body.
fn provider_message(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        for key in ["error_description", "msg", "message", "error"] {
            if let Some(text) = value.get(key).and_then(|v| v.as_str()) {
                return text.to_owned();
            }
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        String::from("<no body>")
    } else {
        trimmed.to_owned()
    }
}

/// Read the `exp` claim from a JWT without verifying it. Verification is the
/// provider's job; this only decides when to refresh.
fn jwt_expiry(token: &str) -> Option<u64> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    claims.get("exp")?.as_u64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Query;
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::{IntoResponse, Response};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use std::collections::HashMap;

    fn jwt_with_exp(exp: u64) -> String {
        let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"sub":"user-1","exp":{exp}}}"#));
        format!("eyJhbGciOiJIUzI1NiJ9.{payload}.signature")
    }

    fn token_body(access: &str, refresh: &str) -> serde_json::Value {
        json!({
            "access_token": access,
            "refresh_token": refresh,
            "expires_in": 3600,
            "token_type": "bearer",
            "user": { "id": "user-1", "email": "a@example.com" }
        })
    }

    async fn token(
        Query(query): Query<HashMap<String, String>>,
        headers: HeaderMap,
        Json(body): Json<serde_json::Value>,
    ) -> Response {
        if headers.get("apikey").is_none() {
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "message": "No API key found in request" })),
            )
                .into_response();
        }
        match query.get("grant_type").map(String::as_str) {
            Some("pkce")
                if body["auth_code"] == "good-code" && body["code_verifier"] == "verifier-1" =>
            {
                Json(token_body("at_new", "rt_new")).into_response()
            }
            Some("refresh_token") if body["refresh_token"] == "rt_valid" => {
                Json(token_body("at_refreshed", "rt_rotated")).into_response()
            }
            Some("refresh_token") => (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "error": "invalid_grant",
                    "error_description": "Invalid Refresh Token: Refresh Token Not Found",
                })),
            )
                .into_response(),
            _ => (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "code": 400,
                    "msg": "invalid flow state, no valid flow state found",
                })),
            )
                .into_response(),
        }
    }

    async fn user(headers: HeaderMap) -> Response {
        match headers.get("authorization").and_then(|v| v.to_str().ok()) {
            Some(auth) if auth.starts_with("Bearer ") => {
                Json(json!({ "id": "user-1", "email": "a@example.com" })).into_response()
            }
            _ => StatusCode::UNAUTHORIZED.into_response(),
        }
    }

    /// Start a local stand-in for the hosted auth API.
    async fn start_mock_provider() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new()
            .route("/auth/v1/token", post(token))
            .route("/auth/v1/user", get(user))
            .route(
                "/auth/v1/otp",
                post(|Query(q): Query<HashMap<String, String>>| async move {
                    if q.contains_key("redirect_to") {
                        StatusCode::OK
                    } else {
                        StatusCode::UNPROCESSABLE_ENTITY
                    }
                }),
            )
            .route("/auth/v1/logout", post(|| async { StatusCode::NOT_FOUND }));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn provider(base_url: &str) -> HostedProvider {
        HostedProvider::new(base_url, Secret::from("anon-key")).unwrap()
    }

    #[test]
    fn new_rejects_bad_configuration() {
        assert!(HostedProvider::new("not a url", Secret::from("k")).is_err());
        assert!(HostedProvider::new("ftp://auth.example.com", Secret::from("k")).is_err());
        assert!(HostedProvider::new("https://auth.example.com", Secret::from("  ")).is_err());
        assert!(HostedProvider::new("https://auth.example.com/", Secret::from("k")).is_ok());
    }

    #[test]
    fn endpoint_joins_base_and_path() {
        let p = provider("https://auth.example.com/");
        let url = p.endpoint(TOKEN_PATH, &[("grant_type", "pkce")]).unwrap();
        assert_eq!(
            url.as_str(),
            "https://auth.example.com/auth/v1/token?grant_type=pkce"
        );
    }

    #[test]
    fn token_response_prefers_absolute_expiry() {
        let token: TokenResponse = serde_json::from_value(json!({
            "access_token": "at", "refresh_token": "rt",
            "expires_in": 3600, "expires_at": 42,
            "user": { "id": "u" }
        }))
        .unwrap();
        let session = token.into_session(1_000).unwrap();
        assert_eq!(session.expires_at, 42);
        assert_eq!(session.email, None);
    }

    #[test]
    fn token_response_without_user_is_invalid() {
        let token: TokenResponse = serde_json::from_value(json!({
            "access_token": "at", "refresh_token": "rt", "expires_in": 60
        }))
        .unwrap();
        assert!(matches!(
            token.into_session(0),
            Err(ProviderError::InvalidResponse(_))
        ));
    }

    #[test]
    fn provider_message_extraction() {
        assert_eq!(
            provider_message(r#"{"error":"invalid_grant","error_description":"Bad code"}"#),
            "Bad code"
        );
        assert_eq!(provider_message(r#"{"code":400,"msg":"flow state"}"#), "flow state");
        assert_eq!(provider_message("plain failure\n"), "plain failure");
        assert_eq!(provider_message(""), "<no body>");
    }

    #[test]
    fn jwt_expiry_reads_exp_claim() {
        assert_eq!(jwt_expiry(&jwt_with_exp(1_900_000_000)), Some(1_900_000_000));
        assert_eq!(jwt_expiry("opaque-token"), None);
        assert_eq!(jwt_expiry("a.!!!.c"), None);
    }

    #[tokio::test]
    async fn exchange_code_returns_session() {
        let base = start_mock_provider().await;
        let session = provider(&base)
            .exchange_code("good-code", Some("verifier-1"))
            .await
            .unwrap();
        assert_eq!(session.subject_id, "user-1");
        assert_eq!(session.email.as_deref(), Some("a@example.com"));
        assert_eq!(session.access_token.expose(), "at_new");
        assert!(session.is_valid_at(unix_now()));
    }

    #[tokio::test]
    async fn exchange_code_rejection_carries_provider_message() {
        let base = start_mock_provider().await;
        let err = provider(&base)
            .exchange_code("bad-code", Some("verifier-1"))
            .await
            .unwrap_err();
        assert!(err.is_rejection());
        assert_eq!(err.to_string(), "invalid flow state, no valid flow state found");
    }

    #[tokio::test]
    async fn refresh_rotates_tokens() {
        let base = start_mock_provider().await;
        let session = provider(&base).refresh_session("rt_valid").await.unwrap();
        assert_eq!(session.refresh_token.expose(), "rt_rotated");

        let err = provider(&base).refresh_session("rt_revoked").await.unwrap_err();
        assert!(err.is_rejection(), "revoked refresh token must be a rejection: {err}");
    }

    #[tokio::test]
    async fn fragment_tokens_resolve_subject() {
        let base = start_mock_provider().await;
        let access = jwt_with_exp(unix_now() + 3600);
        let session = provider(&base)
            .session_from_tokens(&access, "rt_fragment")
            .await
            .unwrap();
        assert_eq!(session.subject_id, "user-1");
        assert_eq!(session.refresh_token.expose(), "rt_fragment");
        assert_eq!(session.expires_at, jwt_expiry(&access).unwrap());
    }

    #[tokio::test]
    async fn expired_fragment_tokens_are_refreshed() {
        let base = start_mock_provider().await;
        let access = jwt_with_exp(unix_now() - 10);
        let session = provider(&base)
            .session_from_tokens(&access, "rt_valid")
            .await
            .unwrap();
        assert_eq!(session.access_token.expose(), "at_refreshed");
    }

    #[tokio::test]
    async fn magic_link_and_sign_out() {
        let base = start_mock_provider().await;
        let p = provider(&base);
        let request = MagicLinkRequest {
            email: "a@example.com".into(),
            redirect_to: "http://localhost:3000/auth/callback".into(),
            code_challenge: crate::compute_challenge("verifier-1"),
        };
        p.send_magic_link(&request).await.unwrap();
        // Logout endpoint answers 404: already signed out counts as success
        p.sign_out("at_gone").await.unwrap();
    }

    #[tokio::test]
    async fn unreachable_provider_is_transport_error() {
        let err = provider("http://127.0.0.1:1")
            .refresh_session("rt_valid")
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Http(_)), "got: {err:?}");
    }
}
