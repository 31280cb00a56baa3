//! In-memory cache of installation access tokens.

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;

use super::InstallationId;

/// An installation access token and the time it stops being valid.
#[derive(Clone, PartialEq, Eq)]
pub struct TokenRecord {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl TokenRecord {
    pub fn new(token: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            token: token.into(),
            expires_at,
        }
    }
}

impl fmt::Debug for TokenRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenRecord")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Tokens keyed by installation id.
///
/// Entries are overwritten on every mint and never removed. A token whose
/// remaining lifetime has dropped below the renewal threshold is treated as
/// missing.
#[derive(Debug)]
pub struct TokenCache {
    entries: RwLock<HashMap<InstallationId, TokenRecord>>,
    renewal_threshold: Duration,
}

impl TokenCache {
    pub fn new(renewal_threshold: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            renewal_threshold,
        }
    }

    pub fn renewal_threshold(&self) -> Duration {
        self.renewal_threshold
    }

    /// Get a token that is still usable right now.
    pub fn get(&self, installation_id: InstallationId) -> Option<TokenRecord> {
        self.get_at(installation_id, Utc::now())
    }

    /// Get a token that is still usable at `now`.
    pub fn get_at(&self, installation_id: InstallationId, now: DateTime<Utc>) -> Option<TokenRecord> {
        let entries = self.entries.read();
        let entry = entries.get(&installation_id)?;

        // too close to expiry to hand out
        if entry.expires_at - now < self.renewal_threshold {
            return None;
        }

        Some(entry.clone())
    }

    /// Store a token, replacing whatever was there.
    pub fn set(&self, installation_id: InstallationId, record: TokenRecord) {
        self.entries.write().insert(installation_id, record);
    }

    /// Number of entries, usable or not.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
