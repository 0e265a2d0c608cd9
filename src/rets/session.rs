//! RETS session state and its on-disk cache.
//!
//! A session is the concatenated cookie pair list plus the capability-URL
//! table returned at login. The cache file lets every loop in the process
//! (and successive process runs) share one server-side session until expiry.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::RetsError;

/// Sessions are reused for one hour before a fresh login is forced.
pub const SESSION_TTL_MINUTES: i64 = 60;

/// File name of the session/capability cache inside the cache directory.
pub const SESSION_CACHE_FILE: &str = "rets-capabilities.json";

/// An authenticated RETS session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// `Cookie` header value: every login `Set-Cookie` name=value joined by `; `.
    pub session_id: String,
    pub session_expires: DateTime<Utc>,
    /// Capability name (Login, Search, GetObject, GetMetadata, Logout) to URL,
    /// absolute or server-relative.
    pub capabilities: HashMap<String, String>,
}

impl Session {
    pub fn new(session_id: String, capabilities: HashMap<String, String>) -> Self {
        Self {
            session_id,
            session_expires: Utc::now() + Duration::minutes(SESSION_TTL_MINUTES),
            capabilities,
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.session_expires
    }

    /// Look up a capability URL by name.
    pub fn capability(&self, name: &str) -> Result<&str, RetsError> {
        self.capabilities
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| RetsError::CapabilityMissing(name.to_string()))
    }
}

/// Disk-backed session cache at `<cache_dir>/rets-capabilities.json`.
#[derive(Debug, Clone)]
pub struct SessionCache {
    path: PathBuf,
}

impl SessionCache {
    pub fn new(cache_dir: &Path) -> Self {
        Self {
            path: cache_dir.join(SESSION_CACHE_FILE),
        }
    }

    /// Returns the cached session when present and unexpired.
    pub fn load(&self) -> Option<Session> {
        let raw = fs::read_to_string(&self.path).ok()?;
        match serde_json::from_str::<Session>(&raw) {
            Ok(session) if !session.is_expired() => {
                debug!(expires = %session.session_expires, "reusing cached RETS session");
                Some(session)
            }
            Ok(_) => None,
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "ignoring unreadable session cache");
                None
            }
        }
    }

    pub fn store(&self, session: &Session) -> Result<(), RetsError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_string_pretty(session)?)?;
        Ok(())
    }

    /// Removes the cache file. Missing file is not an error.
    pub fn clear(&self) -> Result<(), RetsError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capabilities() -> HashMap<String, String> {
        HashMap::from([
            ("Search".to_string(), "/rets/search".to_string()),
            ("Logout".to_string(), "/rets/logout".to_string()),
        ])
    }

    #[test]
    fn fresh_session_is_not_expired() {
        let session = Session::new("RETS-Session-ID=abc".into(), capabilities());
        assert!(!session.is_expired());
    }

    #[test]
    fn missing_capability_is_an_error() {
        let session = Session::new("RETS-Session-ID=abc".into(), capabilities());
        assert!(session.capability("Search").is_ok());
        assert!(matches!(
            session.capability("GetObject"),
            Err(RetsError::CapabilityMissing(name)) if name == "GetObject"
        ));
    }

    #[test]
    fn cache_round_trip_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SessionCache::new(dir.path());
        assert!(cache.load().is_none());

        let session = Session::new("RETS-Session-ID=abc".into(), capabilities());
        cache.store(&session).unwrap();

        let loaded = cache.load().unwrap();
        assert_eq!(loaded.session_id, session.session_id);
        assert_eq!(loaded.capabilities, session.capabilities);

        cache.clear().unwrap();
        assert!(cache.load().is_none());
        // Clearing twice stays quiet.
        cache.clear().unwrap();
    }

    #[test]
    fn expired_session_is_not_returned() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SessionCache::new(dir.path());

        let mut session = Session::new("RETS-Session-ID=abc".into(), capabilities());
        session.session_expires = Utc::now() - Duration::minutes(5);
        cache.store(&session).unwrap();

        assert!(cache.load().is_none());
    }
}
