//! Session store adapters
//!
//! The session lives in cookies. A store is the read/write surface for those
//! cookies during one unit of work:
//!
//! - `HeaderStore`: one server request. Reads come from the `Cookie` header,
//!   writes are queued and rendered as `Set-Cookie` on the response.
//! - `MemoryStore`: a long-lived cookie jar (client side, tests).
//! - `ObservedStore`: wraps another store and publishes auth-state changes
//!   after every write.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use axum::http::header::SET_COOKIE;
use axum::http::{HeaderMap, HeaderValue};
use tracing::warn;

use crate::codec::SessionCodec;
use crate::cookie::{CookieRecord, parse_cookie_header};
use crate::observe::AuthStateObserver;

/// Read/write access to the cookies backing a session.
///
/// Writes made through `persist` are visible to later `load_all` calls on the
/// same store.
pub trait SessionStore: Send + Sync {
    /// Every cookie currently visible, removals excluded.
    fn load_all(&self) -> Vec<CookieRecord>;

    /// Apply writes in order. A removal record deletes the cookie.
    fn persist(&self, records: Vec<CookieRecord>);
}

impl<T: SessionStore + ?Sized> SessionStore for Arc<T> {
    fn load_all(&self) -> Vec<CookieRecord> {
        (**self).load_all()
    }

    fn persist(&self, records: Vec<CookieRecord>) {
        (**self).persist(records)
    }
}

#[derive(Debug, Default)]
struct HeaderStoreInner {
    request: Vec<CookieRecord>,
    pending: Vec<CookieRecord>,
}

/// Store for a single HTTP request/response pair.
#[derive(Debug, Default)]
pub struct HeaderStore {
    inner: Mutex<HeaderStoreInner>,
}

impl HeaderStore {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        Self {
            inner: Mutex::new(HeaderStoreInner {
                request: parse_cookie_header(headers),
                pending: Vec::new(),
            }),
        }
    }

    /// Writes queued for the response, one per cookie name (last write wins).
    pub fn pending(&self) -> Vec<CookieRecord> {
        self.lock().pending.clone()
    }

    /// Append a `Set-Cookie` header per pending write.
    pub fn apply_to(&self, headers: &mut HeaderMap) {
        for record in self.pending() {
            match HeaderValue::from_str(&record.to_set_cookie()) {
                Ok(value) => {
                    headers.append(SET_COOKIE, value);
                }
                Err(e) => warn!(cookie = %record.name, error = %e, "dropping unrenderable cookie"),
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HeaderStoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SessionStore for HeaderStore {
    fn load_all(&self) -> Vec<CookieRecord> {
        let inner = self.lock();
        let mut visible: Vec<CookieRecord> = inner
            .request
            .iter()
            .filter(|r| !inner.pending.iter().any(|p| p.name == r.name))
            .cloned()
            .collect();
        visible.extend(inner.pending.iter().filter(|p| !p.is_removal()).cloned());
        visible
    }

    fn persist(&self, records: Vec<CookieRecord>) {
        let mut inner = self.lock();
        for record in records {
            inner.pending.retain(|p| p.name != record.name);
            inner.pending.push(record);
        }
    }
}

/// In-memory cookie jar.
#[derive(Debug, Default)]
pub struct MemoryStore {
    jar: Mutex<BTreeMap<String, CookieRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<CookieRecord>) -> Self {
        let store = Self::new();
        store.persist(records);
        store
    }

    pub fn names(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, CookieRecord>> {
        self.jar.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SessionStore for MemoryStore {
    fn load_all(&self) -> Vec<CookieRecord> {
        self.lock().values().cloned().collect()
    }

    fn persist(&self, records: Vec<CookieRecord>) {
        let mut jar = self.lock();
        for record in records {
            if record.is_removal() {
                jar.remove(&record.name);
            } else {
                jar.insert(record.name.clone(), record);
            }
        }
    }
}

/// Store that re-derives the auth snapshot after each write and hands it to
/// an observer. Subscribers see a change only when the subject changes.
pub struct ObservedStore<S> {
    inner: S,
    codec: SessionCodec,
    observer: AuthStateObserver,
}

impl<S: SessionStore> ObservedStore<S> {
    /// Wrap `inner`, publishing its current state immediately.
    pub fn new(inner: S, codec: SessionCodec, observer: AuthStateObserver) -> Self {
        let store = Self {
            inner,
            codec,
            observer,
        };
        store.publish();
        store
    }

    pub fn observer(&self) -> &AuthStateObserver {
        &self.observer
    }

    fn publish(&self) {
        self.observer
            .observe_records(&self.codec, &self.inner.load_all());
    }
}

impl<S: SessionStore> SessionStore for ObservedStore<S> {
    fn load_all(&self) -> Vec<CookieRecord> {
        self.inner.load_all()
    }

    fn persist(&self, records: Vec<CookieRecord>) {
        self.inner.persist(records);
        self.publish();
    }
}
