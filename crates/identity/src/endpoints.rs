//! Hosted auth REST API paths
//!
//! Relative to the provider base URL. The public anon key is sent as the
//! `apikey` header on every call; user-scoped calls add the user's bearer token.

/// Token endpoint for code exchange (`grant_type=pkce`) and refresh
/// (`grant_type=refresh_token`)
pub const TOKEN_PATH: &str = "auth/v1/token";

/// Returns the user owning the bearer access token
pub const USER_PATH: &str = "auth/v1/user";

/// Sends a one-time sign-in link by email
pub const OTP_PATH: &str = "auth/v1/otp";

/// Revokes the session owning the bearer access token
pub const LOGOUT_PATH: &str = "auth/v1/logout";

/// Header carrying the public anon key
pub const API_KEY_HEADER: &str = "apikey";
