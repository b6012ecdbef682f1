//! Cookie records exchanged with the session store
//!
//! A record is a name, a value, and the attributes the browser should store
//! it with. Removal is a record with an empty value and `Max-Age=0`.

use axum::http::HeaderMap;
use axum::http::header::COOKIE;
use axum_extra::extract::cookie::{Cookie, SameSite};

/// `SameSite` attribute for session cookies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SameSitePolicy {
    #[default]
    Lax,
    Strict,
    None,
}

impl From<SameSitePolicy> for SameSite {
    fn from(policy: SameSitePolicy) -> Self {
        match policy {
            SameSitePolicy::Lax => SameSite::Lax,
            SameSitePolicy::Strict => SameSite::Strict,
            SameSitePolicy::None => SameSite::None,
        }
    }
}

/// Attributes attached to a cookie write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CookieOptions {
    pub path: Option<String>,
    pub domain: Option<String>,
    /// Seconds; `Some(0)` deletes the cookie.
    pub max_age: Option<i64>,
    pub same_site: Option<SameSitePolicy>,
    pub secure: bool,
    pub http_only: bool,
}

impl CookieOptions {
    /// Defaults for session cookies: site-wide, `HttpOnly`, `SameSite=Lax`,
    /// one year (the refresh token decides the real lifetime).
    pub fn session(secure: bool) -> Self {
        Self {
            path: Some("/".into()),
            domain: None,
            max_age: Some(60 * 60 * 24 * 365),
            same_site: Some(SameSitePolicy::Lax),
            secure,
            http_only: true,
        }
    }

    pub fn with_max_age(mut self, seconds: i64) -> Self {
        self.max_age = Some(seconds);
        self
    }
}

/// One cookie to read or write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookieRecord {
    pub name: String,
    pub value: String,
    pub options: CookieOptions,
}

impl CookieRecord {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            options: CookieOptions::default(),
        }
    }

    pub fn with_options(mut self, options: CookieOptions) -> Self {
        self.options = options;
        self
    }

    /// A record that deletes `name`. Path and domain must match the original
    /// write or the browser keeps the old cookie.
    pub fn removal(name: impl Into<String>, options: CookieOptions) -> Self {
        Self {
            name: name.into(),
            value: String::new(),
            options: options.with_max_age(0),
        }
    }

    pub fn is_removal(&self) -> bool {
        self.options.max_age == Some(0)
    }

    /// Render as a `Set-Cookie` header value.
    pub fn to_set_cookie(&self) -> String {
        let mut builder = Cookie::build((self.name.clone(), self.value.clone()))
            .secure(self.options.secure)
            .http_only(self.options.http_only);
        if let Some(path) = &self.options.path {
            builder = builder.path(path.clone());
        }
        if let Some(domain) = &self.options.domain {
            builder = builder.domain(domain.clone());
        }
        if let Some(max_age) = self.options.max_age {
            builder = builder.max_age(time::Duration::seconds(max_age));
        }
        if let Some(same_site) = self.options.same_site {
            builder = builder.same_site(same_site.into());
        }
        builder.build().to_string()
    }
}

/// All cookies sent on a request, in header order. Unparseable pairs are skipped.
pub fn parse_cookie_header(headers: &HeaderMap) -> Vec<CookieRecord> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| {
            Cookie::split_parse(value.to_owned())
                .filter_map(|cookie| cookie.ok())
                .map(|cookie| CookieRecord::new(cookie.name(), cookie.value()))
                .collect::<Vec<_>>()
        })
        .collect()
}
