//! Session <-> cookie encoding
//!
//! The session is stored as JSON, base64url-encoded with a `base64-` marker,
//! under `<prefix>-auth-token`. Browsers cap a cookie at roughly 4KB, so
//! values longer than `CHUNK_SIZE` are split across `<name>.0`, `<name>.1`, ...
//! Every write also removes cookies from the previous layout (single vs
//! chunked, or more chunks than now needed) so a stale chunk never survives.
//!
//! The PKCE verifier for an in-flight magic link sits next to it in
//! `<prefix>-auth-token-code-verifier`.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use common::Secret;
use identity::Session;
use serde::{Deserialize, Serialize};

use crate::cookie::{CookieOptions, CookieRecord};
use crate::error::{Error, Result};

/// Longest value stored in a single cookie before chunking.
pub const CHUNK_SIZE: usize = 3180;

/// Lifetime of the code-verifier cookie; long enough to open the email.
pub const VERIFIER_MAX_AGE_SECS: i64 = 600;

const BASE64_MARKER: &str = "base64-";

#[derive(Debug, Serialize, Deserialize)]
struct StoredSession {
    access_token: String,
    refresh_token: String,
    expires_at: u64,
    user: StoredUser,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredUser {
    id: String,
    #[serde(default)]
    email: Option<String>,
}

/// Encodes sessions into cookie records and back.
#[derive(Debug, Clone)]
pub struct SessionCodec {
    cookie_name: String,
    options: CookieOptions,
}

impl SessionCodec {
    pub fn new(cookie_prefix: &str, options: CookieOptions) -> Self {
        Self {
            cookie_name: format!("{cookie_prefix}-auth-token"),
            options,
        }
    }

    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    pub fn verifier_cookie_name(&self) -> String {
        format!("{}-code-verifier", self.cookie_name)
    }

    /// Whether `name` is the session cookie or one of its chunks.
    pub fn owns(&self, name: &str) -> bool {
        name == self.cookie_name || self.chunk_index(name).is_some()
    }

    fn chunk_index(&self, name: &str) -> Option<usize> {
        name.strip_prefix(self.cookie_name.as_str())?
            .strip_prefix('.')?
            .parse()
            .ok()
    }

    fn chunk_name(&self, index: usize) -> String {
        format!("{}.{index}", self.cookie_name)
    }

    /// Records that store `session`, replacing whatever layout `existing` has.
    pub fn encode(&self, session: &Session, existing: &[CookieRecord]) -> Vec<CookieRecord> {
        let stored = StoredSession {
            access_token: session.access_token.expose().clone(),
            refresh_token: session.refresh_token.expose().clone(),
            expires_at: session.expires_at,
            user: StoredUser {
                id: session.subject_id.clone(),
                email: session.email.clone(),
            },
        };
        // Serializing plain strings and integers cannot fail
        let json = serde_json::to_vec(&stored).unwrap_or_default();
        let value = format!("{BASE64_MARKER}{}", URL_SAFE_NO_PAD.encode(json));

        let mut records = Vec::new();
        let written: Vec<String> = if value.len() <= CHUNK_SIZE {
            records.push(self.record(self.cookie_name.clone(), value));
            vec![self.cookie_name.clone()]
        } else {
            // Base64 output is ASCII, so byte offsets are char boundaries
            (0..value.len())
                .step_by(CHUNK_SIZE)
                .enumerate()
                .map(|(index, start)| {
                    let end = (start + CHUNK_SIZE).min(value.len());
                    let name = self.chunk_name(index);
                    records.push(self.record(name.clone(), value[start..end].to_owned()));
                    name
                })
                .collect()
        };

        for stale in existing
            .iter()
            .filter(|r| self.owns(&r.name) && !written.contains(&r.name))
        {
            records.push(CookieRecord::removal(stale.name.clone(), self.options.clone()));
        }
        records
    }

    /// Removal records for every session cookie present in `existing`.
    pub fn clear(&self, existing: &[CookieRecord]) -> Vec<CookieRecord> {
        existing
            .iter()
            .filter(|r| self.owns(&r.name))
            .map(|r| CookieRecord::removal(r.name.clone(), self.options.clone()))
            .collect()
    }

    /// Reassemble the session from `records`.
    ///
    /// `Ok(None)` when no session cookie is present (or the chunk sequence
    /// does not start at `.0`); `Err` when a value is present but unreadable.
    pub fn decode(&self, records: &[CookieRecord]) -> Result<Option<Session>> {
        let raw = match records.iter().find(|r| r.name == self.cookie_name) {
            Some(single) => single.value.clone(),
            None => {
                let mut joined = String::new();
                let mut index = 0;
                while let Some(chunk) = records.iter().find(|r| r.name == self.chunk_name(index)) {
                    joined.push_str(&chunk.value);
                    index += 1;
                }
                joined
            }
        };
        if raw.is_empty() {
            return Ok(None);
        }

        let json = match raw.strip_prefix(BASE64_MARKER) {
            Some(encoded) => URL_SAFE_NO_PAD
                .decode(encoded)
                .map_err(|e| Error::MalformedCookie(format!("base64: {e}")))?,
            // Older writers stored raw JSON
            None => raw.into_bytes(),
        };
        let stored: StoredSession = serde_json::from_slice(&json)
            .map_err(|e| Error::MalformedCookie(format!("json: {e}")))?;

        Ok(Some(Session {
            subject_id: stored.user.id,
            email: stored.user.email,
            access_token: Secret::new(stored.access_token),
            refresh_token: Secret::new(stored.refresh_token),
            expires_at: stored.expires_at,
        }))
    }

    /// Cookie holding the PKCE verifier while a magic link is outstanding.
    pub fn verifier_record(&self, verifier: &str) -> CookieRecord {
        CookieRecord::new(self.verifier_cookie_name(), verifier)
            .with_options(self.options.clone().with_max_age(VERIFIER_MAX_AGE_SECS))
    }

    pub fn verifier_removal(&self) -> CookieRecord {
        CookieRecord::removal(self.verifier_cookie_name(), self.options.clone())
    }

    pub fn read_verifier(&self, records: &[CookieRecord]) -> Option<String> {
        let name = self.verifier_cookie_name();
        records
            .iter()
            .find(|r| r.name == name && !r.value.is_empty())
            .map(|r| r.value.clone())
    }

    fn record(&self, name: String, value: String) -> CookieRecord {
        CookieRecord::new(name, value).with_options(self.options.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, SessionStore};

    fn codec() -> SessionCodec {
        SessionCodec::new("sb-test", CookieOptions::session(false))
    }

    fn session_with_token(access_token: String) -> Session {
        Session {
            subject_id: "user-1".into(),
            email: Some("reader@example.com".into()),
            access_token: Secret::new(access_token),
            refresh_token: Secret::from("rt_1"),
            expires_at: 1_700_000_000,
        }
    }

    #[test]
    fn cookie_names() {
        let codec = codec();
        assert_eq!(codec.cookie_name(), "sb-test-auth-token");
        assert_eq!(codec.verifier_cookie_name(), "sb-test-auth-token-code-verifier");
        assert!(codec.owns("sb-test-auth-token"));
        assert!(codec.owns("sb-test-auth-token.3"));
        assert!(!codec.owns("sb-test-auth-token-code-verifier"));
        assert!(!codec.owns("sb-test-auth-token.x"));
        assert!(!codec.owns("other"));
    }

    #[test]
    fn small_session_is_one_cookie() {
        let codec = codec();
        let session = session_with_token("at_small".into());
        let records = codec.encode(&session, &[]);

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "sb-test-auth-token");
        assert!(records[0].value.starts_with("base64-"));
        assert_eq!(codec.decode(&records).unwrap(), Some(session));
    }

    #[test]
    fn large_session_is_chunked() {
        let codec = codec();
        let session = session_with_token("a".repeat(5_000));
        let records = codec.encode(&session, &[]);

        assert!(records.len() >= 2);
        assert_eq!(records[0].name, "sb-test-auth-token.0");
        assert!(records.iter().all(|r| r.value.len() <= CHUNK_SIZE));
        assert_eq!(codec.decode(&records).unwrap(), Some(session));
    }

    #[test]
    fn rewrite_removes_stale_layout() {
        let codec = codec();
        let store = MemoryStore::new();
        store.persist(codec.encode(&session_with_token("a".repeat(5_000)), &[]));
        assert!(store.names().iter().any(|n| n.ends_with(".1")));

        let small = session_with_token("at_small".into());
        store.persist(codec.encode(&small, &store.load_all()));

        assert_eq!(store.names(), vec!["sb-test-auth-token".to_owned()]);
        assert_eq!(codec.decode(&store.load_all()).unwrap(), Some(small));
    }

    #[test]
    fn clear_removes_only_session_cookies() {
        let codec = codec();
        let store = MemoryStore::new();
        store.persist(codec.encode(&session_with_token("a".repeat(5_000)), &[]));
        store.persist(vec![CookieRecord::new("theme", "dark")]);

        store.persist(codec.clear(&store.load_all()));

        assert_eq!(store.names(), vec!["theme".to_owned()]);
    }

    #[test]
    fn missing_cookie_decodes_to_none() {
        assert_eq!(codec().decode(&[]).unwrap(), None);
        // A chunk sequence must start at .0
        let orphan = vec![CookieRecord::new("sb-test-auth-token.1", "base64-xyz")];
        assert_eq!(codec().decode(&orphan).unwrap(), None);
    }

    #[test]
    fn garbage_is_malformed() {
        let records = vec![CookieRecord::new("sb-test-auth-token", "base64-!!!")];
        assert!(matches!(codec().decode(&records), Err(Error::MalformedCookie(_))));

        let records = vec![CookieRecord::new("sb-test-auth-token", "{not json")];
        assert!(matches!(codec().decode(&records), Err(Error::MalformedCookie(_))));
    }

    #[test]
    fn raw_json_is_accepted() {
        let raw = r#"{"access_token":"at","refresh_token":"rt","expires_at":5,"user":{"id":"u"}}"#;
        let records = vec![CookieRecord::new("sb-test-auth-token", raw)];
        let session = codec().decode(&records).unwrap().unwrap();
        assert_eq!(session.subject_id, "u");
        assert_eq!(session.email, None);
        assert_eq!(session.expires_at, 5);
    }

    #[test]
    fn verifier_round_trip() {
        let codec = codec();
        let record = codec.verifier_record("v123");
        assert_eq!(record.options.max_age, Some(VERIFIER_MAX_AGE_SECS));
        assert_eq!(codec.read_verifier(&[record]).as_deref(), Some("v123"));
        assert!(codec.verifier_removal().is_removal());
        assert_eq!(codec.read_verifier(&[]), None);
    }
}
