//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The identity anon key is loaded from IDENTITY_ANON_KEY or anon_key_file,
//! never stored in the TOML directly to avoid leaking secrets.

use common::Secret;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use url::Url;

/// Used when neither SITE_URL, `[site].origin` nor VERCEL_URL is set.
pub const FALLBACK_ORIGIN: &str = "http://localhost:3000";

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default)]
    pub routes: RoutesConfig,
    pub identity: IdentityConfig,
    #[serde(default)]
    pub session: SessionConfig,
    pub catalog: CatalogConfig,
}

/// HTTP listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Public site settings
#[derive(Debug, Deserialize)]
pub struct SiteConfig {
    /// Canonical origin, e.g. `https://catalog.example.com`
    #[serde(default)]
    pub origin: Option<String>,
    /// Where users land after sign-in when no valid destination was requested
    #[serde(default = "default_destination")]
    pub default_destination: String,
    /// Origin after env overlay; see `resolve_origin`
    #[serde(skip)]
    resolved_origin: String,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            origin: None,
            default_destination: default_destination(),
            resolved_origin: String::new(),
        }
    }
}

impl SiteConfig {
    pub fn origin(&self) -> &str {
        &self.resolved_origin
    }
}

/// Which paths are gated and where the auth pages live
#[derive(Debug, Deserialize)]
pub struct RoutesConfig {
    #[serde(default = "default_protected")]
    pub protected: Vec<String>,
    #[serde(default = "default_login_path")]
    pub login_path: String,
    #[serde(default = "default_callback_path")]
    pub callback_path: String,
}

impl Default for RoutesConfig {
    fn default() -> Self {
        Self {
            protected: default_protected(),
            login_path: default_login_path(),
            callback_path: default_callback_path(),
        }
    }
}

/// Hosted identity provider
#[derive(Debug, Deserialize)]
pub struct IdentityConfig {
    pub url: String,
    #[serde(skip)]
    pub anon_key: Option<Secret<String>>,
    /// Path to a file containing the anon key (alternative to IDENTITY_ANON_KEY)
    #[serde(default)]
    pub anon_key_file: Option<PathBuf>,
    /// Bound on each provider call, including the callback exchange
    #[serde(default = "default_identity_timeout")]
    pub timeout_secs: u64,
}

/// Session cookie settings
#[derive(Debug, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_cookie_prefix")]
    pub cookie_prefix: String,
    /// Set the `Secure` cookie attribute. Disable only for plain-http development.
    #[serde(default = "default_secure")]
    pub secure: bool,
    #[serde(default = "default_refresh_margin")]
    pub refresh_margin_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_prefix: default_cookie_prefix(),
            secure: default_secure(),
            refresh_margin_secs: default_refresh_margin(),
        }
    }
}

/// Catalog application the gateway fronts
#[derive(Debug, Deserialize)]
pub struct CatalogConfig {
    pub upstream_url: String,
    #[serde(default = "default_catalog_timeout")]
    pub timeout_secs: u64,
}

fn default_max_connections() -> usize {
    1000
}

fn default_destination() -> String {
    "/dashboard".into()
}

fn default_protected() -> Vec<String> {
    vec!["/dashboard".into(), "/upload".into()]
}

fn default_login_path() -> String {
    "/login".into()
}

fn default_callback_path() -> String {
    "/auth/callback".into()
}

fn default_identity_timeout() -> u64 {
    10
}

fn default_cookie_prefix() -> String {
    "sb-catalog".into()
}

fn default_secure() -> bool {
    true
}

fn default_refresh_margin() -> u64 {
    60
}

fn default_catalog_timeout() -> u64 {
    60
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Anon key resolution order:
    /// 1. IDENTITY_ANON_KEY env var
    /// 2. anon_key_file path from config
    ///
    /// A missing anon key is an error: the gateway cannot verify anyone without it.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml(&contents)?;

        config.site.resolved_origin = resolve_origin(
            config.site.origin.as_deref(),
            non_empty_env("SITE_URL"),
            non_empty_env("VERCEL_URL"),
        );
        validate_origin(config.site.origin())?;

        if let Some(key) = non_empty_env("IDENTITY_ANON_KEY") {
            config.identity.anon_key = Some(Secret::new(key));
        } else if let Some(ref key_file) = config.identity.anon_key_file {
            let key = std::fs::read_to_string(key_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read anon_key_file {}: {e}",
                    key_file.display()
                ))
            })?;
            let key = key.trim().to_owned();
            if !key.is_empty() {
                config.identity.anon_key = Some(Secret::new(key));
            }
        }
        if config.identity.anon_key.is_none() {
            return Err(common::Error::Config(
                "identity anon key missing: set IDENTITY_ANON_KEY or identity.anon_key_file".into(),
            ));
        }

        Ok(config)
    }

    /// Parse and validate TOML without consulting the environment.
    pub fn from_toml(contents: &str) -> common::Result<Self> {
        let mut config: Config = toml::from_str(contents)?;
        config.site.resolved_origin = resolve_origin(config.site.origin.as_deref(), None, None);
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        validate_http_url("catalog.upstream_url", &self.catalog.upstream_url)?;
        validate_http_url("identity.url", &self.identity.url)?;
        validate_origin(self.site.origin())?;

        if self.catalog.timeout_secs == 0 || self.identity.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }

        if self.server.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        let prefix = &self.session.cookie_prefix;
        if prefix.is_empty()
            || !prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(common::Error::Config(format!(
                "cookie_prefix must be non-empty and contain only [A-Za-z0-9_-], got: {prefix:?}"
            )));
        }

        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("catalog-gateway.toml")
    }
}

/// Site origin precedence: SITE_URL env > `[site].origin` > `https://$VERCEL_URL`
/// > `FALLBACK_ORIGIN`.
pub fn resolve_origin(
    configured: Option<&str>,
    site_url: Option<String>,
    vercel_url: Option<String>,
) -> String {
    let origin = site_url
        .or_else(|| configured.map(str::to_owned))
        .or_else(|| vercel_url.map(|host| format!("https://{host}")))
        .unwrap_or_else(|| FALLBACK_ORIGIN.to_owned());
    origin.trim_end_matches('/').to_owned()
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn validate_http_url(field: &'static str, value: &str) -> common::Result<()> {
    let url = Url::parse(value).map_err(|e| common::Error::invalid_url(field, e))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(common::Error::Config(format!(
            "{field} must start with http:// or https://, got: {value}"
        )));
    }
    Ok(())
}

fn validate_origin(origin: &str) -> common::Result<()> {
    validate_http_url("site.origin", origin)
}
