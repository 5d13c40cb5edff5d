//! Storage contracts and the in-process key-value store
//!
//! Every durable lookup the gateway makes goes through [`StorageHandler`]:
//! session records, credential registrations, org records, quota counters.
//! The primary implementation is an in-process map; RPC- and LDAP-backed
//! handlers are injected behind the same trait, selected per spec by the
//! provider's `storage_engine` string.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use sha2::{Digest, Sha256};

use crate::session::SessionState;

/// Engine selection string for LDAP-backed auth storage
pub const LDAP_STORAGE_ENGINE: &str = "ldap";
/// Engine selection string for RPC-backed storage
pub const RPC_STORAGE_ENGINE: &str = "rpc";

/// Key-value storage contract
#[async_trait]
pub trait StorageHandler: Send + Sync {
    async fn get_key(&self, key: &str) -> Option<String>;
    /// Store a value; `ttl_secs` of 0 means no expiry
    async fn set_key(&self, key: &str, value: &str, ttl_secs: i64);
    async fn delete_key(&self, key: &str) -> bool;
    /// Atomically increment a counter key, returning the new value
    async fn incr_key(&self, key: &str) -> i64;
}

/// In-process storage backed by a concurrent map with lazy expiry
pub struct InMemoryStore {
    key_prefix: String,
    entries: DashMap<String, StoredValue>,
}

struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

impl InMemoryStore {
    pub fn new(key_prefix: impl Into<String>) -> Self {
        Self {
            key_prefix: key_prefix.into(),
            entries: DashMap::new(),
        }
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    fn live(&self, full_key: &str) -> Option<String> {
        let hit = self.entries.get(full_key)?;
        if let Some(deadline) = hit.expires_at {
            if deadline <= Instant::now() {
                drop(hit);
                self.entries.remove(full_key);
                return None;
            }
        }
        Some(hit.value.clone())
    }
}

#[async_trait]
impl StorageHandler for InMemoryStore {
    async fn get_key(&self, key: &str) -> Option<String> {
        self.live(&self.full_key(key))
    }

    async fn set_key(&self, key: &str, value: &str, ttl_secs: i64) {
        let expires_at = if ttl_secs > 0 {
            Some(Instant::now() + Duration::from_secs(ttl_secs as u64))
        } else {
            None
        };
        self.entries.insert(
            self.full_key(key),
            StoredValue {
                value: value.to_string(),
                expires_at,
            },
        );
    }

    async fn delete_key(&self, key: &str) -> bool {
        self.entries.remove(&self.full_key(key)).is_some()
    }

    async fn incr_key(&self, key: &str) -> i64 {
        let mut entry = self.entries.entry(self.full_key(key)).or_insert(StoredValue {
            value: "0".to_string(),
            expires_at: None,
        });
        let next = entry.value.parse::<i64>().unwrap_or(0) + 1;
        entry.value = next.to_string();
        next
    }
}

/// Builds an LDAP-backed handler from a provider's metadata block
pub trait LdapStoreBuilder: Send + Sync {
    fn build(&self, meta: &serde_json::Value) -> anyhow::Result<Arc<dyn StorageHandler>>;
}

/// The storage handles every pipeline is built against
#[derive(Clone)]
pub struct GeneralStores {
    /// Primary credential/session store
    pub primary_store: Arc<dyn StorageHandler>,
    /// Organisation records
    pub org_store: Arc<dyn StorageHandler>,
    /// Uptime/health bookkeeping
    pub health_store: Arc<dyn StorageHandler>,
    /// RPC-backed auth storage
    pub rpc_auth_store: Arc<dyn StorageHandler>,
    /// RPC-backed org storage
    pub rpc_org_store: Arc<dyn StorageHandler>,
    /// Injected LDAP handler factory, when deployed
    pub ldap_builder: Option<Arc<dyn LdapStoreBuilder>>,
}

impl GeneralStores {
    /// Default in-process wiring; production deployments inject RPC/LDAP
    /// handlers behind the same contract.
    pub fn in_memory() -> Self {
        Self {
            primary_store: Arc::new(InMemoryStore::new("apikey-")),
            org_store: Arc::new(InMemoryStore::new("orgkey.")),
            health_store: Arc::new(InMemoryStore::new("apihealth.")),
            rpc_auth_store: Arc::new(InMemoryStore::new("apikey-")),
            rpc_org_store: Arc::new(InMemoryStore::new("orgkey.")),
            ldap_builder: None,
        }
    }
}

/// Hash a credential for cache keys and storage
pub fn hash_str(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    // 12 bytes of digest is plenty for a storage key
    digest[..12].iter().map(|b| format!("{b:02x}")).collect()
}

/// Hash only when key hashing is enabled process-wide
pub fn hash_key(key: &str, hash_keys: bool) -> String {
    if hash_keys {
        hash_str(key)
    } else {
        key.to_string()
    }
}

/// Keys never appear in logs in full
pub fn obfuscate_key(key: &str) -> String {
    if key.len() > 4 {
        format!("****{}", &key[key.len() - 4..])
    } else {
        "--".to_string()
    }
}

/// Session persistence over a storage handler
pub struct SessionManager {
    store: Arc<dyn StorageHandler>,
    hash_keys: bool,
}

impl SessionManager {
    pub fn new(store: Arc<dyn StorageHandler>, hash_keys: bool) -> Self {
        Self { store, hash_keys }
    }

    /// Fetch a session record; `hashed` marks the key as already hashed
    pub async fn session_detail(&self, key: &str, hashed: bool) -> Option<SessionState> {
        let storage_key = if hashed {
            key.to_string()
        } else {
            hash_key(key, self.hash_keys)
        };
        let raw = self.store.get_key(&storage_key).await?;
        match serde_json::from_str(&raw) {
            Ok(session) => Some(session),
            Err(e) => {
                tracing::warn!(key = %obfuscate_key(key), "Corrupt session record: {}", e);
                None
            }
        }
    }

    /// Write a session record back with the given TTL in seconds
    pub async fn update_session(
        &self,
        key: &str,
        session: &SessionState,
        lifetime: i64,
        hashed: bool,
    ) -> anyhow::Result<()> {
        let storage_key = if hashed {
            key.to_string()
        } else {
            hash_key(key, self.hash_keys)
        };
        let raw = serde_json::to_string(session)?;
        self.store.set_key(&storage_key, &raw, lifetime).await;
        Ok(())
    }

    pub async fn remove_session(&self, key: &str, hashed: bool) -> bool {
        let storage_key = if hashed {
            key.to_string()
        } else {
            hash_key(key, self.hash_keys)
        };
        self.store.delete_key(&storage_key).await
    }
}

/// Credential registry: the authority a key falls back to when it has no
/// session record yet
#[async_trait]
pub trait KeyRegistry: Send + Sync {
    async fn key_authorised(&self, key: &str) -> Option<SessionState>;
}

/// Registry reading registered credentials from a storage handler
pub struct StoreBackedKeyRegistry {
    sessions: SessionManager,
}

impl StoreBackedKeyRegistry {
    pub fn new(store: Arc<dyn StorageHandler>, hash_keys: bool) -> Self {
        Self {
            sessions: SessionManager::new(store, hash_keys),
        }
    }
}

#[async_trait]
impl KeyRegistry for StoreBackedKeyRegistry {
    async fn key_authorised(&self, key: &str) -> Option<SessionState> {
        self.sessions.session_detail(key, false).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn store_round_trip_with_prefix() {
        let store = InMemoryStore::new("apikey-");
        store.set_key("abc", "v1", 0).await;
        assert_eq!(store.get_key("abc").await, Some("v1".to_string()));
        assert!(store.delete_key("abc").await);
        assert_eq!(store.get_key("abc").await, None);
    }

    #[tokio::test]
    async fn store_expires_keys() {
        let store = InMemoryStore::new("");
        store.set_key("short", "v", 1).await;
        assert!(store.get_key("short").await.is_some());
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(store.get_key("short").await, None);
    }

    #[tokio::test]
    async fn incr_counts_up() {
        let store = InMemoryStore::new("quota-");
        assert_eq!(store.incr_key("k").await, 1);
        assert_eq!(store.incr_key("k").await, 2);
        assert_eq!(store.incr_key("k").await, 3);
    }

    #[test]
    fn hashing_is_stable_and_gated() {
        assert_eq!(hash_str("token-1"), hash_str("token-1"));
        assert_ne!(hash_str("token-1"), hash_str("token-2"));
        assert_eq!(hash_key("token-1", false), "token-1");
        assert_eq!(hash_key("token-1", true), hash_str("token-1"));
    }

    #[test]
    fn keys_are_obfuscated_for_logs() {
        assert_eq!(obfuscate_key("abcdef123456"), "****3456");
        assert_eq!(obfuscate_key("ab"), "--");
    }

    #[tokio::test]
    async fn session_manager_round_trip() {
        let store: Arc<dyn StorageHandler> = Arc::new(InMemoryStore::new("apikey-"));
        let manager = SessionManager::new(store, true);

        let session = SessionState {
            org_id: "org-1".to_string(),
            quota_max: 50,
            ..Default::default()
        };
        manager
            .update_session("my-token-123", &session, 60, false)
            .await
            .unwrap();

        let read = manager.session_detail("my-token-123", false).await.unwrap();
        assert_eq!(read.org_id, "org-1");
        assert_eq!(read.quota_max, 50);

        // the hashed form is addressable directly
        let hashed = hash_str("my-token-123");
        assert!(manager.session_detail(&hashed, true).await.is_some());
    }

    #[tokio::test]
    async fn key_registry_reads_registered_credentials() {
        let store: Arc<dyn StorageHandler> = Arc::new(InMemoryStore::new("apikey-"));
        let manager = SessionManager::new(store.clone(), false);
        manager
            .update_session("reg-key-1", &SessionState::default(), 0, false)
            .await
            .unwrap();

        let registry = StoreBackedKeyRegistry::new(store, false);
        assert!(registry.key_authorised("reg-key-1").await.is_some());
        assert!(registry.key_authorised("unknown").await.is_none());
    }
}
