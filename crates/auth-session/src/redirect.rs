//! Post-login destination sanitizing
//!
//! "Continue to" values arrive from query strings and are attacker
//! controlled. Every value is resolved against the site origin; anything that
//! leaves the origin, fails to parse, or would send the user back into the
//! login/callback pages is replaced by the default destination.
//!
//! The result is always a path (plus optional query and fragment) starting
//! with `/`, and sanitizing a sanitized value returns it unchanged.

use std::fmt;

use tracing::debug;
use url::Url;

use crate::error::{Error, Result};

/// A same-origin, non-auth-page path. Only `RedirectSanitizer` creates these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectTarget(String);

impl RedirectTarget {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for RedirectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RedirectTarget {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Why a candidate was replaced by the default. Internal signal only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectRejected {
    Missing,
    Malformed,
    CrossOrigin,
    /// Root or an auth page; following it would loop back into sign-in.
    LoopRisk,
}

#[derive(Debug, Clone)]
pub struct RedirectSanitizer {
    origin: Url,
    default_target: RedirectTarget,
    auth_pages: Vec<String>,
}

impl RedirectSanitizer {
    /// Build a sanitizer for `origin`.
    ///
    /// `default_path` must itself survive sanitizing (same-origin path, not
    /// `/`, not an auth page), otherwise construction fails.
    pub fn new(origin: &str, default_path: &str, auth_pages: &[&str]) -> Result<Self> {
        let mut origin_url = Url::parse(origin)
            .map_err(|e| Error::Config(format!("site origin {origin:?}: {e}")))?;
        if !matches!(origin_url.scheme(), "http" | "https") || origin_url.host().is_none() {
            return Err(Error::Config(format!(
                "site origin {origin:?} must be an http(s) URL with a host"
            )));
        }
        origin_url.set_path("/");
        origin_url.set_query(None);
        origin_url.set_fragment(None);

        let mut pages = Vec::with_capacity(auth_pages.len());
        for page in auth_pages {
            if !page.starts_with('/') || *page == "/" {
                return Err(Error::Config(format!(
                    "auth page {page:?} must be a path below /"
                )));
            }
            pages.push(page.trim_end_matches('/').to_owned());
        }

        let mut sanitizer = Self {
            origin: origin_url,
            default_target: RedirectTarget(String::new()),
            auth_pages: pages,
        };
        sanitizer.default_target = match sanitizer.check(Some(default_path)) {
            Ok(target) if target.as_str() == default_path => target,
            Ok(target) => {
                return Err(Error::Config(format!(
                    "default destination {default_path:?} is not canonical (use {target:?})"
                )));
            }
            Err(reason) => {
                return Err(Error::Config(format!(
                    "default destination {default_path:?} is not allowed ({reason:?})"
                )));
            }
        };
        Ok(sanitizer)
    }

    pub fn origin(&self) -> &Url {
        &self.origin
    }

    pub fn default_target(&self) -> RedirectTarget {
        self.default_target.clone()
    }

    /// Resolve `path` against the origin, e.g. for the magic-link callback.
    pub fn absolute(&self, path: &str) -> Result<Url> {
        self.origin
            .join(path)
            .map_err(|e| Error::Config(format!("cannot resolve {path:?}: {e}")))
    }

    /// Segment-aware: `/login` and `/login/x` match, `/loginx` does not.
    pub fn is_auth_page(&self, path: &str) -> bool {
        self.auth_pages.iter().any(|page| {
            path == page
                || path
                    .strip_prefix(page.as_str())
                    .is_some_and(|rest| rest.starts_with('/'))
        })
    }

    /// Sanitized destination, falling back to the default.
    pub fn sanitize(&self, candidate: Option<&str>) -> RedirectTarget {
        match self.check(candidate) {
            Ok(target) => target,
            Err(reason) => {
                debug!(?reason, "redirect candidate replaced by default");
                self.default_target()
            }
        }
    }

    /// Sanitized destination, or why the candidate was rejected.
    pub fn check(
        &self,
        candidate: Option<&str>,
    ) -> std::result::Result<RedirectTarget, RedirectRejected> {
        let raw = candidate
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(RedirectRejected::Missing)?;
        let resolved = self.origin.join(raw).map_err(|_| RedirectRejected::Malformed)?;
        if resolved.origin() != self.origin.origin() {
            return Err(RedirectRejected::CrossOrigin);
        }

        let path = resolved.path();
        // Dot segments can collapse into `//host`, which browsers treat as
        // protocol-relative
        if path.starts_with("//") {
            return Err(RedirectRejected::Malformed);
        }
        if path == "/" || self.is_auth_page(path) {
            return Err(RedirectRejected::LoopRisk);
        }

        let mut target = path.to_owned();
        if let Some(query) = resolved.query() {
            target.push('?');
            target.push_str(query);
        }
        if let Some(fragment) = resolved.fragment() {
            target.push('#');
            target.push_str(fragment);
        }
        Ok(RedirectTarget(target))
    }
}
