//! Auth-state notifications
//!
//! UI code (navigation bars, sign-out buttons) needs "is anyone signed in,
//! and who". Subscribers get the current state on subscribe, then one call
//! per change. A token refresh that keeps the same subject is not a change.

use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use identity::Session;
use tracing::{debug, warn};

use crate::codec::SessionCodec;
use crate::cookie::CookieRecord;

/// Who, if anyone, is signed in.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AuthSnapshot {
    #[default]
    SignedOut,
    SignedIn {
        subject_id: String,
        email: Option<String>,
    },
}

impl AuthSnapshot {
    pub fn from_session(session: Option<&Session>) -> Self {
        match session {
            Some(s) => Self::SignedIn {
                subject_id: s.subject_id.clone(),
                email: s.email.clone(),
            },
            None => Self::SignedOut,
        }
    }

    pub fn is_signed_in(&self) -> bool {
        matches!(self, Self::SignedIn { .. })
    }

    pub fn email(&self) -> Option<&str> {
        match self {
            Self::SignedIn { email, .. } => email.as_deref(),
            Self::SignedOut => None,
        }
    }
}

type Listener = Arc<dyn Fn(bool, Option<&str>) + Send + Sync>;

#[derive(Default)]
struct Registry {
    current: AuthSnapshot,
    listeners: BTreeMap<u64, Listener>,
    next_id: u64,
}

/// Publishes auth-state changes to subscribers. Clones share state.
#[derive(Clone, Default)]
pub struct AuthStateObserver {
    registry: Arc<Mutex<Registry>>,
}

impl AuthStateObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> AuthSnapshot {
        self.lock().current.clone()
    }

    /// Register `on_change(is_signed_in, email)`; it is called immediately
    /// with the current state. Dropping the returned `Subscription`
    /// unsubscribes.
    pub fn subscribe<F>(&self, on_change: F) -> Subscription
    where
        F: Fn(bool, Option<&str>) + Send + Sync + 'static,
    {
        let listener: Listener = Arc::new(on_change);
        let (id, current) = {
            let mut registry = self.lock();
            let id = registry.next_id;
            registry.next_id += 1;
            registry.listeners.insert(id, listener.clone());
            (id, registry.current.clone())
        };
        notify(&listener, &current);
        Subscription {
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Publish `snapshot`; subscribers are called only if it differs from
    /// the current state.
    pub fn publish(&self, snapshot: AuthSnapshot) {
        let listeners: Vec<Listener> = {
            let mut registry = self.lock();
            if registry.current == snapshot {
                return;
            }
            registry.current = snapshot.clone();
            registry.listeners.values().cloned().collect()
        };
        debug!(
            signed_in = snapshot.is_signed_in(),
            subscribers = listeners.len(),
            "auth state changed"
        );
        for listener in &listeners {
            notify(listener, &snapshot);
        }
    }

    pub fn publish_session(&self, session: Option<&Session>) {
        self.publish(AuthSnapshot::from_session(session));
    }

    /// Derive the state from stored cookies. Unreadable cookies mean signed out.
    pub fn observe_records(&self, codec: &SessionCodec, records: &[CookieRecord]) {
        match codec.decode(records) {
            Ok(session) => self.publish_session(session.as_ref()),
            Err(e) => {
                debug!(error = %e, "unreadable session cookie, publishing signed-out");
                self.publish(AuthSnapshot::SignedOut);
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().listeners.len()
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A panicking subscriber is logged and skipped; the others still run.
fn notify(listener: &Listener, snapshot: &AuthSnapshot) {
    let call = AssertUnwindSafe(|| listener(snapshot.is_signed_in(), snapshot.email()));
    if catch_unwind(call).is_err() {
        warn!("auth state subscriber panicked");
    }
}

/// Live subscription; unsubscribes on drop.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .listeners
                .remove(&self.id);
        }
    }
}
