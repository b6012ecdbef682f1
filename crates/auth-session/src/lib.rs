//! Authentication session lifecycle
//!
//! Four cooperating pieces plus a thin observable:
//!
//! - `redirect` - turns untrusted "continue to" values into same-origin paths
//!   that never re-enter the login/callback pages
//! - `store` / `cookie` / `codec` - the session store adapter: cookie records
//!   attached to a request/response, and the session encoding inside them
//! - `manager` - loads the session from the store, refreshing it at most once
//! - `guard` - per-request decision: forward or redirect
//! - `callback` - turns a credential payload on the callback URL into a
//!   persisted session
//! - `observe` - "is anyone signed in" notifications for UI code
//!
//! Request flow:
//! 1. `RouteGuard::guard()` classifies the path and loads the session
//! 2. Unauthenticated requests for protected paths go to `/login?redirectedFrom=...`
//! 3. The identity provider sends the user back to the callback URL
//! 4. `CallbackExchanger::handle_callback()` persists the session and picks
//!    the sanitized destination
//! 5. Later requests pass the guard with the refreshed cookies attached

pub mod callback;
pub mod codec;
pub mod cookie;
pub mod error;
pub mod guard;
pub mod manager;
pub mod observe;
pub mod redirect;
pub mod store;
mod telemetry;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use callback::{
    CallbackError, CallbackExchanger, CallbackOutcome, CancelToken, CredentialPayload,
    ExchangeEvent, ExchangeState,
};
pub use codec::SessionCodec;
pub use cookie::{CookieOptions, CookieRecord, SameSitePolicy};
pub use error::{Error, Result};
pub use guard::{GuardAction, GuardOutcome, PathKind, RouteGuard, RouteTable};
pub use manager::{SessionLookup, SessionManager};
pub use observe::{AuthSnapshot, AuthStateObserver, Subscription};
pub use redirect::{RedirectRejected, RedirectSanitizer, RedirectTarget};
pub use store::{HeaderStore, MemoryStore, ObservedStore, SessionStore};
