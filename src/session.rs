//! Credential-scoped session state
//!
//! A [`SessionState`] carries the rate, quota and access-control data for one
//! credential. Sessions are resolved per request, cached in a process-local
//! TTL map keyed by key hash, and rewritten by the policy merge on every
//! resolution.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Sentinel meaning "unlimited" on `quota_max` and `rate`; a finite policy
/// value must never overwrite it.
pub const UNLIMITED: i64 = -1;

/// Per-credential session record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionState {
    pub org_id: String,
    pub is_inactive: bool,
    /// Hard credential expiry timestamp; 0 = never
    pub expires: i64,

    // Top-level allowances; per-API entries inherit these when a partition
    // never touched them.
    pub rate: f64,
    pub per: f64,
    pub throttle_interval: f64,
    pub throttle_retry_limit: i32,
    pub quota_max: i64,
    pub quota_renews: i64,
    pub quota_renewal_rate: i64,

    pub access_rights: HashMap<String, AccessRight>,

    pub hmac_enabled: bool,
    pub hmac_secret: String,

    /// Ordered policy list applied on every resolution
    pub apply_policies: Vec<String>,
    /// Legacy single-policy field, honoured when `apply_policies` is empty
    pub apply_policy_id: String,

    pub tags: Vec<String>,
    pub alias: String,
    /// Session TTL in seconds; 0 defers to the spec's session lifetime
    pub session_lifetime: i64,
    /// Organisation data expiry timestamp
    pub data_expires: i64,
    pub last_updated: String,

    /// Hash of the credential this session was resolved under; never persisted
    #[serde(skip)]
    pub key_hash: String,
}

impl SessionState {
    /// Ordered policy ids, falling back to the legacy single-policy field
    pub fn policy_ids(&self) -> Vec<String> {
        if !self.apply_policies.is_empty() {
            self.apply_policies.clone()
        } else if !self.apply_policy_id.is_empty() {
            vec![self.apply_policy_id.clone()]
        } else {
            Vec::new()
        }
    }

    /// Storage TTL for this session: its own lifetime, else the spec fallback,
    /// else no expiry.
    pub fn lifetime(&self, fallback: i64) -> i64 {
        if self.session_lifetime > 0 {
            self.session_lifetime
        } else if fallback > 0 {
            fallback
        } else {
            0
        }
    }

    pub fn key_hash(&self) -> &str {
        &self.key_hash
    }

    pub fn set_key_hash(&mut self, hash: impl Into<String>) {
        self.key_hash = hash.into();
    }
}

/// Access granted to one API
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessRight {
    pub api_name: String,
    pub api_id: String,
    pub versions: Vec<String>,
    pub allowed_urls: Vec<AccessSpec>,
    pub limit: Option<ApiLimit>,
    /// Id owning this entry's rate-limit counters when several policies
    /// attribute limits to different APIs
    pub allowance_scope: String,
}

/// URL pattern plus the methods allowed on it
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessSpec {
    pub url: String,
    pub methods: Vec<String>,
}

/// Rate and quota ceilings for one API entry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiLimit {
    pub rate: f64,
    pub per: f64,
    pub throttle_interval: f64,
    pub throttle_retry_limit: i32,
    pub quota_max: i64,
    pub quota_renews: i64,
    pub quota_renewal_rate: i64,
    /// Policy or API id that wrote this limit; internal marker, cleared
    /// before the session is exposed
    #[serde(skip)]
    pub set_by: String,
}

impl ApiLimit {
    /// True when no field was ever populated
    pub fn is_empty(&self) -> bool {
        *self == ApiLimit::default()
    }
}

/// Process-local TTL cache
///
/// Entries expire lazily on read; a default TTL applies unless the writer
/// supplies its own.
pub struct TtlCache<V> {
    entries: DashMap<String, CacheEntry<V>>,
    default_ttl: Duration,
}

struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            default_ttl,
        }
    }

    /// Fetch a live entry, evicting it when expired
    pub fn get(&self, key: &str) -> Option<V> {
        let hit = self.entries.get(key)?;
        if hit.expires_at <= Instant::now() {
            drop(hit);
            self.entries.remove(key);
            return None;
        }
        Some(hit.value.clone())
    }

    /// Insert with the cache-wide default expiration
    pub fn set(&self, key: impl Into<String>, value: V) {
        self.set_with_ttl(key, value, self.default_ttl);
    }

    pub fn set_with_ttl(&self, key: impl Into<String>, value: V, ttl: Duration) {
        self.entries.insert(
            key.into(),
            CacheEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    pub fn remove(&self, key: &str) {
        self.entries.remove(key);
    }

    /// Live entry count; expired-but-unread entries are swept first
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.retain(|_, e| e.expires_at > now);
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Cache of resolved sessions keyed by key hash
pub type SessionCache = TtlCache<SessionState>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_ids_fall_back_to_legacy_field() {
        let mut session = SessionState::default();
        assert!(session.policy_ids().is_empty());

        session.apply_policy_id = "p-legacy".to_string();
        assert_eq!(session.policy_ids(), vec!["p-legacy".to_string()]);

        session.apply_policies = vec!["p1".to_string(), "p2".to_string()];
        assert_eq!(
            session.policy_ids(),
            vec!["p1".to_string(), "p2".to_string()]
        );
    }

    #[test]
    fn lifetime_prefers_session_over_spec() {
        let mut session = SessionState::default();
        assert_eq!(session.lifetime(120), 120);
        session.session_lifetime = 60;
        assert_eq!(session.lifetime(120), 60);
        session.session_lifetime = 0;
        assert_eq!(session.lifetime(0), 0);
    }

    #[test]
    fn api_limit_emptiness() {
        assert!(ApiLimit::default().is_empty());
        let limit = ApiLimit {
            rate: 10.0,
            ..Default::default()
        };
        assert!(!limit.is_empty());
    }

    #[test]
    fn ttl_cache_round_trip() {
        let cache: SessionCache = TtlCache::new(Duration::from_secs(5));
        let mut session = SessionState {
            org_id: "org-1".to_string(),
            quota_max: 100,
            ..Default::default()
        };
        session.set_key_hash("abc123");

        cache.set("abc123", session.clone());
        let read = cache.get("abc123").unwrap();
        assert_eq!(read, session);
    }

    #[test]
    fn ttl_cache_expires_entries() {
        let cache: TtlCache<u32> = TtlCache::new(Duration::from_millis(10));
        cache.set("k", 1);
        assert_eq!(cache.get("k"), Some(1));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cache.get("k"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn key_hash_is_not_serialised() {
        let mut session = SessionState::default();
        session.set_key_hash("secret-hash");
        let json = serde_json::to_string(&session).unwrap();
        assert!(!json.contains("secret-hash"));
        let back: SessionState = serde_json::from_str(&json).unwrap();
        assert_eq!(back.key_hash(), "");
    }
}
