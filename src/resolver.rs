//! Session resolution and organisation expiry lookups
//!
//! [`SessionResolver`] turns a request credential into a session: local TTL
//! cache first, then the session store, then the credential registry, with
//! the policy merge applied on every tier. [`OrgExpiryCache`] answers
//! organisation data-expiry queries with single-flight deduplication so a
//! burst of requests for one org costs one storage round trip.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::OnceCell;
use tracing::{debug, error, info};

use crate::config::GatewayConfig;
use crate::context::RequestContext;
use crate::policy::{apply_policies, PolicyStore};
use crate::session::{SessionCache, SessionState, TtlCache};
use crate::storage::{hash_str, obfuscate_key, KeyRegistry, SessionManager};

/// Fallback org expiry when the lookup fails outright: one week, in seconds
pub const ORG_EXPIRY_FALLBACK: i64 = 604_800;

/// Resolves sessions for one API spec's storage wiring
pub struct SessionResolver {
    config: Arc<GatewayConfig>,
    /// Org of the spec in scope; policy merges reject foreign policies
    spec_org: Option<String>,
    session_cache: Arc<SessionCache>,
    sessions: Arc<SessionManager>,
    key_registry: Arc<dyn KeyRegistry>,
    policies: Arc<PolicyStore>,
}

impl SessionResolver {
    pub fn new(
        config: Arc<GatewayConfig>,
        spec_org: Option<String>,
        session_cache: Arc<SessionCache>,
        sessions: Arc<SessionManager>,
        key_registry: Arc<dyn KeyRegistry>,
        policies: Arc<PolicyStore>,
    ) -> Self {
        Self {
            config,
            spec_org,
            session_cache,
            sessions,
            key_registry,
            policies,
        }
    }

    fn merge(&self, session: &mut SessionState) -> bool {
        match apply_policies(session, self.spec_org.as_deref(), &self.policies) {
            Ok(()) => true,
            Err(e) => {
                error!("{}", e);
                false
            }
        }
    }

    /// Resolve a credential to a session.
    ///
    /// Returns `(session, false)` when the key is unknown, too short, or its
    /// policy merge failed; downstream stages reject the request on `false`.
    pub async fn resolve(&self, key: &str, ctx: &mut RequestContext) -> (SessionState, bool) {
        if key.len() <= self.config.effective_min_token_length() {
            return (
                SessionState {
                    is_inactive: true,
                    ..Default::default()
                },
                false,
            );
        }

        let cache_key = if self.config.hash_keys {
            hash_str(key)
        } else {
            key.to_string()
        };

        let cache_enabled = !self.config.local_session_cache.disable_cached_session_state;

        // Tier 1: process-local cache
        if cache_enabled {
            if let Some(mut session) = self.session_cache.get(&cache_key) {
                debug!("Key found in local cache");
                let ok = self.merge(&mut session);
                return (session, ok);
            }
        }

        // Tier 2: session store
        debug!("Querying keystore");
        if let Some(mut session) = self.sessions.session_detail(key, false).await {
            session.set_key_hash(cache_key.clone());
            if cache_enabled {
                self.session_cache.set(cache_key, session.clone());
            }
            let ok = self.merge(&mut session);
            if ok {
                debug!("Got key");
            }
            return (session, ok);
        }

        // Tier 3: credential registry; a hit means the session record was
        // lost and must be recreated with a fresh TTL.
        debug!("Querying keystore authority");
        if let Some(mut session) = self.key_registry.key_authorised(key).await {
            session.set_key_hash(cache_key.clone());
            info!("Recreating session for key: {}", obfuscate_key(key));
            if cache_enabled {
                self.session_cache.set(cache_key, session.clone());
            }
            let ok = self.merge(&mut session);
            if !ok {
                return (session, false);
            }
            ctx.update_session = true;
            return (session, true);
        }

        (SessionState::default(), false)
    }
}

/// Outcome shared between the waiters of one in-flight expiry lookup
#[derive(Debug, Clone, Copy)]
enum ExpiryOutcome {
    Found(i64),
    Missing,
}

/// Organisation expiry lookups with a TTL cache and single-flight collapse
pub struct OrgExpiryCache {
    config: Arc<GatewayConfig>,
    expiry_cache: TtlCache<i64>,
    in_flight: DashMap<String, Arc<OnceCell<ExpiryOutcome>>>,
    org_sessions: Arc<SessionManager>,
}

impl OrgExpiryCache {
    pub fn new(
        config: Arc<GatewayConfig>,
        org_sessions: Arc<SessionManager>,
        cache_ttl: std::time::Duration,
    ) -> Self {
        Self {
            config,
            expiry_cache: TtlCache::new(cache_ttl),
            in_flight: DashMap::new(),
            org_sessions,
        }
    }

    /// Fetch the org session directly, caching its expiry when data-age
    /// enforcement is on.
    pub async fn org_session(&self, org_id: &str) -> Option<SessionState> {
        let session = self.org_sessions.session_detail(org_id, false).await?;
        if self.config.enforce_org_data_age {
            debug!(org_id = %session.org_id, "Setting data expiry");
            self.expiry_cache.set(org_id.to_string(), session.data_expires);
        }
        Some(session)
    }

    pub fn set_org_expiry(&self, org_id: &str, expiry: i64) {
        self.expiry_cache.set(org_id.to_string(), expiry);
    }

    /// Expiry timestamp for an organisation.
    ///
    /// Concurrent callers for the same org share one underlying query; a miss
    /// is shared with every waiter of the current flight and forgotten once
    /// the flight ends. A failed lookup answers with the one-week fallback.
    pub async fn org_expiry(&self, org_id: &str) -> i64 {
        debug!(org_id, "Checking org expiry");

        let cell = self
            .in_flight
            .entry(org_id.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let outcome = *cell
            .get_or_init(|| async {
                if let Some(cached) = self.expiry_cache.get(org_id) {
                    return ExpiryOutcome::Found(cached);
                }
                match self.org_sessions.session_detail(org_id, false).await {
                    Some(session) if self.config.enforce_org_data_age => {
                        self.expiry_cache
                            .set(org_id.to_string(), session.data_expires);
                        ExpiryOutcome::Found(session.data_expires)
                    }
                    _ => ExpiryOutcome::Missing,
                }
            })
            .await;

        // Close this flight window; only the generation we joined is removed.
        self.in_flight
            .remove_if(org_id, |_, v| Arc::ptr_eq(v, &cell));

        match outcome {
            ExpiryOutcome::Found(expiry) => expiry,
            ExpiryOutcome::Missing => {
                debug!("No cached entry found, returning 7 days");
                ORG_EXPIRY_FALLBACK
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Policy;
    use crate::storage::{InMemoryStore, StorageHandler, StoreBackedKeyRegistry};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn test_config() -> Arc<GatewayConfig> {
        Arc::new(GatewayConfig {
            hash_keys: true,
            enforce_org_data_age: true,
            ..Default::default()
        })
    }

    fn resolver_with(
        config: Arc<GatewayConfig>,
        store: Arc<dyn StorageHandler>,
        registry_store: Arc<dyn StorageHandler>,
        policies: Arc<PolicyStore>,
    ) -> SessionResolver {
        SessionResolver::new(
            config.clone(),
            None,
            Arc::new(TtlCache::new(Duration::from_secs(5))),
            Arc::new(SessionManager::new(store, config.hash_keys)),
            Arc::new(StoreBackedKeyRegistry::new(registry_store, config.hash_keys)),
            policies,
        )
    }

    #[tokio::test]
    async fn short_keys_are_rejected_inactive() {
        let config = test_config();
        let store: Arc<dyn StorageHandler> = Arc::new(InMemoryStore::new(""));
        let resolver = resolver_with(config, store.clone(), store, Arc::new(PolicyStore::new()));

        let mut ctx = RequestContext::default();
        let (session, found) = resolver.resolve("abc", &mut ctx).await;
        assert!(!found);
        assert!(session.is_inactive);
    }

    #[tokio::test]
    async fn store_hit_applies_policies_and_caches() {
        let config = test_config();
        let store: Arc<dyn StorageHandler> = Arc::new(InMemoryStore::new(""));
        let registry: Arc<dyn StorageHandler> = Arc::new(InMemoryStore::new("reg-"));

        let policies = Arc::new(PolicyStore::new());
        policies.insert(Policy {
            id: "p1".into(),
            rate: 10.0,
            per: 1.0,
            quota_max: 100,
            ..Default::default()
        });

        let manager = SessionManager::new(store.clone(), true);
        let session = SessionState {
            apply_policies: vec!["p1".into()],
            ..Default::default()
        };
        manager
            .update_session("valid-token-1", &session, 0, false)
            .await
            .unwrap();

        let resolver = resolver_with(config, store, registry, policies);
        let mut ctx = RequestContext::default();
        let (resolved, found) = resolver.resolve("valid-token-1", &mut ctx).await;

        assert!(found);
        assert_eq!(resolved.rate, 10.0);
        assert_eq!(resolved.quota_max, 100);
        assert_eq!(resolved.key_hash(), hash_str("valid-token-1"));
        // no update scheduled on the store tier
        assert!(!ctx.update_session);
    }

    #[tokio::test]
    async fn registry_fallback_schedules_session_update() {
        let config = test_config();
        let store: Arc<dyn StorageHandler> = Arc::new(InMemoryStore::new(""));
        let registry_store: Arc<dyn StorageHandler> = Arc::new(InMemoryStore::new(""));

        // credential registered with the authority but absent from the
        // session store, forcing the registry tier
        let registry_sessions = SessionManager::new(registry_store.clone(), true);
        registry_sessions
            .update_session("registered-key", &SessionState::default(), 0, false)
            .await
            .unwrap();

        let resolver = resolver_with(
            config,
            store,
            registry_store,
            Arc::new(PolicyStore::new()),
        );
        let mut ctx = RequestContext::default();
        let (_, found) = resolver.resolve("registered-key", &mut ctx).await;

        assert!(found);
        assert!(ctx.update_session);
    }

    #[tokio::test]
    async fn unknown_key_not_found() {
        let config = test_config();
        let store: Arc<dyn StorageHandler> = Arc::new(InMemoryStore::new(""));
        let resolver = resolver_with(config, store.clone(), store, Arc::new(PolicyStore::new()));

        let mut ctx = RequestContext::default();
        let (_, found) = resolver.resolve("completely-unknown", &mut ctx).await;
        assert!(!found);
    }

    #[tokio::test]
    async fn failed_merge_returns_not_found() {
        let config = test_config();
        let store: Arc<dyn StorageHandler> = Arc::new(InMemoryStore::new(""));

        let manager = SessionManager::new(store.clone(), true);
        let session = SessionState {
            apply_policies: vec!["missing-policy".into()],
            ..Default::default()
        };
        manager
            .update_session("broken-token", &session, 0, false)
            .await
            .unwrap();

        let resolver = resolver_with(config, store.clone(), store, Arc::new(PolicyStore::new()));
        let mut ctx = RequestContext::default();
        let (_, found) = resolver.resolve("broken-token", &mut ctx).await;
        assert!(!found);
    }

    /// Storage handler that counts reads and answers slowly, so concurrent
    /// expiry lookups overlap.
    struct SlowCountingStore {
        inner: InMemoryStore,
        reads: AtomicUsize,
    }

    #[async_trait]
    impl StorageHandler for SlowCountingStore {
        async fn get_key(&self, key: &str) -> Option<String> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.inner.get_key(key).await
        }
        async fn set_key(&self, key: &str, value: &str, ttl_secs: i64) {
            self.inner.set_key(key, value, ttl_secs).await;
        }
        async fn delete_key(&self, key: &str) -> bool {
            self.inner.delete_key(key).await
        }
        async fn incr_key(&self, key: &str) -> i64 {
            self.inner.incr_key(key).await
        }
    }

    #[tokio::test]
    async fn org_expiry_single_flight_collapses_lookups() {
        let config = test_config();
        let store = Arc::new(SlowCountingStore {
            inner: InMemoryStore::new(""),
            reads: AtomicUsize::new(0),
        });

        let sessions = SessionManager::new(store.clone(), false);
        let org = SessionState {
            org_id: "org-1".into(),
            data_expires: 9_999,
            ..Default::default()
        };
        sessions.update_session("org-1", &org, 0, false).await.unwrap();

        let cache = Arc::new(OrgExpiryCache::new(
            config,
            Arc::new(SessionManager::new(store.clone(), false)),
            Duration::from_secs(60),
        ));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            handles.push(tokio::spawn(
                async move { cache.org_expiry("org-1").await },
            ));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), 9_999);
        }

        // one storage read for the whole burst
        assert_eq!(store.reads.load(Ordering::SeqCst), 1);

        // after the flight, the TTL cache answers without touching storage
        assert_eq!(cache.org_expiry("org-1").await, 9_999);
        assert_eq!(store.reads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn org_expiry_falls_back_to_one_week() {
        let config = test_config();
        let store: Arc<dyn StorageHandler> = Arc::new(InMemoryStore::new(""));
        let cache = OrgExpiryCache::new(
            config,
            Arc::new(SessionManager::new(store, false)),
            Duration::from_secs(60),
        );
        assert_eq!(cache.org_expiry("no-such-org").await, ORG_EXPIRY_FALLBACK);
    }

    #[tokio::test]
    async fn org_expiry_misses_are_not_cached_across_flights() {
        let config = test_config();
        let store = Arc::new(SlowCountingStore {
            inner: InMemoryStore::new(""),
            reads: AtomicUsize::new(0),
        });
        let cache = OrgExpiryCache::new(
            config,
            Arc::new(SessionManager::new(store.clone(), false)),
            Duration::from_secs(60),
        );

        assert_eq!(cache.org_expiry("org-x").await, ORG_EXPIRY_FALLBACK);
        assert_eq!(cache.org_expiry("org-x").await, ORG_EXPIRY_FALLBACK);
        // each flight performed its own lookup; failure was not cached
        assert_eq!(store.reads.load(Ordering::SeqCst), 2);
    }
}
