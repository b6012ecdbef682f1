//! The authenticated subject as currently believed by one request

use common::Secret;

/// One authenticated subject.
///
/// `expires_at` is an absolute unix timestamp in seconds. Providers report
/// `expires_in` deltas; those are converted at construction time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Opaque identity-provider subject id
    pub subject_id: String,
    pub email: Option<String>,
    pub access_token: Secret<String>,
    pub refresh_token: Secret<String>,
    pub expires_at: u64,
}

impl Session {
    /// Valid iff the expiry is strictly in the future.
    pub fn is_valid_at(&self, now: u64) -> bool {
        self.expires_at > now
    }

    /// Whether the access token expires within `margin_secs` of `now`.
    pub fn expires_within(&self, now: u64, margin_secs: u64) -> bool {
        self.expires_at <= now.saturating_add(margin_secs)
    }
}

/// Current unix time in seconds.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
