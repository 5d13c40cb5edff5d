//! Policies and the session policy merge
//!
//! A policy is a shared template that overwrites session state on every
//! resolution. Policies come in three shapes: master policies (empty access
//! rights, applied to the session's top-level fields), partitioned policies
//! (only the named partitions of quota / rate-limit / ACL may be written) and
//! per-API policies (different limits per API, exclusive with partitioning).
//!
//! The merge is order-sensitive: the first policy seeds the inactive flag,
//! later policies can only escalate it, and partition bookkeeping decides
//! which fields each subsequent policy may touch.

use std::collections::{BTreeSet, HashMap, HashSet};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::errors::GatewayError;
use crate::session::{AccessRight, ApiLimit, SessionState, UNLIMITED};

/// Shared policy template
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Policy {
    pub id: String,
    pub org_id: String,
    pub rate: f64,
    pub per: f64,
    pub throttle_interval: f64,
    pub throttle_retry_limit: i32,
    pub quota_max: i64,
    pub quota_renewal_rate: i64,
    /// Empty map makes this a master policy
    pub access_rights: HashMap<String, AccessRight>,
    pub partitions: PolicyPartitions,
    pub tags: Vec<String>,
    pub is_inactive: bool,
    pub hmac_enabled: bool,
}

/// Field subsets a policy is allowed to write
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyPartitions {
    pub quota: bool,
    pub rate_limit: bool,
    pub acl: bool,
    /// Per-API mode: different limits per API id; exclusive with the above
    pub per_api: bool,
}

/// Process-wide policy registry; read-mostly, reloads replace the whole map
#[derive(Default)]
pub struct PolicyStore {
    policies: RwLock<HashMap<String, Policy>>,
}

impl PolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<Policy> {
        self.policies.read().get(id).cloned()
    }

    pub fn insert(&self, policy: Policy) {
        self.policies.write().insert(policy.id.clone(), policy);
    }

    /// Replace the whole registry in one write
    pub fn replace_all(&self, policies: HashMap<String, Policy>) {
        *self.policies.write() = policies;
    }

    pub fn len(&self) -> usize {
        self.policies.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.read().is_empty()
    }

    /// Load a policy document: a JSON object keyed by policy id. An entry's
    /// `id` field is filled in from its key when absent.
    pub fn load_from_json(&self, doc: &str) -> anyhow::Result<usize> {
        let parsed: HashMap<String, Policy> = serde_json::from_str(doc)?;
        let mut policies = HashMap::with_capacity(parsed.len());
        for (key, mut policy) in parsed {
            if policy.id.is_empty() {
                policy.id = key.clone();
            }
            policies.insert(key, policy);
        }
        let count = policies.len();
        self.replace_all(policies);
        Ok(count)
    }
}

/// Apply the session's policies in order, rewriting its access-rights map
/// under the partition rules.
///
/// `spec_org` is the organisation of the API in scope; a policy owned by a
/// different organisation is rejected so a key can never be rewritten by a
/// foreign org's template.
pub fn apply_policies(
    session: &mut SessionState,
    spec_org: Option<&str>,
    store: &PolicyStore,
) -> Result<(), GatewayError> {
    let mut rights: HashMap<String, AccessRight> = HashMap::new();
    let mut tags: BTreeSet<String> = BTreeSet::new();
    let mut did_quota: HashSet<String> = HashSet::new();
    let mut did_rate: HashSet<String> = HashSet::new();
    let mut did_acl: HashSet<String> = HashSet::new();
    // APIs claimed by a per-API policy; partitioned policies may not touch
    // them, in either order
    let mut did_per_api: HashSet<String> = HashSet::new();

    for (i, policy_id) in session.policy_ids().iter().enumerate() {
        let policy = match store.get(policy_id) {
            Some(p) => p,
            None => {
                let err = GatewayError::PolicyNotFound(policy_id.clone());
                error!("{}", err);
                return Err(err);
            }
        };

        // Policy org owner must match the API's org, otherwise a session key
        // could be overwritten by a policy from a different organisation.
        if let Some(org) = spec_org {
            if policy.org_id != org {
                let err = GatewayError::PolicyCrossOrg;
                error!("{}", err);
                return Err(err);
            }
        }

        if policy.partitions.per_api
            && (policy.partitions.quota || policy.partitions.rate_limit || policy.partitions.acl)
        {
            let err = GatewayError::PolicyPartitionConflict(policy.id.clone());
            error!("{}", err);
            return Err(err);
        }

        if policy.partitions.per_api {
            for (api_id, policy_rights) in &policy.access_rights {
                // No other partitions allowed to have touched this API
                if did_quota.contains(api_id)
                    || did_rate.contains(api_id)
                    || did_acl.contains(api_id)
                {
                    let err = GatewayError::PolicyMixedModes;
                    error!("{}", err);
                    return Err(err);
                }

                let mut entry = policy_rights.clone();

                // Limit absent or zero-valued at the API level: populate it
                // from the policy's top-level fields.
                if entry.limit.as_ref().is_none_or(ApiLimit::is_empty) {
                    entry.limit = Some(ApiLimit {
                        quota_max: policy.quota_max,
                        quota_renewal_rate: policy.quota_renewal_rate,
                        rate: policy.rate,
                        per: policy.per,
                        throttle_interval: policy.throttle_interval,
                        throttle_retry_limit: policy.throttle_retry_limit,
                        ..Default::default()
                    });
                }

                // Respect the current quota window on a pre-existing entry
                if let Some(existing) = session.access_rights.get(api_id) {
                    if let Some(existing_limit) = &existing.limit {
                        if let Some(limit) = entry.limit.as_mut() {
                            limit.quota_renews = existing_limit.quota_renews;
                        }
                    }
                }

                entry.allowance_scope = api_id.clone();
                if let Some(limit) = entry.limit.as_mut() {
                    limit.set_by = api_id.clone();
                }

                rights.insert(api_id.clone(), entry);

                did_acl.insert(api_id.clone());
                did_quota.insert(api_id.clone());
                did_rate.insert(api_id.clone());
                did_per_api.insert(api_id.clone());
            }
        } else {
            let use_partitions = policy.partitions.quota
                || policy.partitions.rate_limit
                || policy.partitions.acl;

            for (api_id, v) in &policy.access_rights {
                if did_per_api.contains(api_id) {
                    let err = GatewayError::PolicyMixedModes;
                    error!("{}", err);
                    return Err(err);
                }

                let mut entry = v.clone();
                if entry.limit.is_none() {
                    entry.limit = Some(ApiLimit::default());
                }

                if !use_partitions || policy.partitions.acl {
                    did_acl.insert(api_id.clone());

                    // Merge ACLs for the same API: concatenate versions,
                    // extend the method list of a known URL, append unknown
                    // URLs exactly once.
                    if let Some(existing) = rights.get(api_id) {
                        let mut merged = existing.clone();
                        merged.versions.extend(v.versions.iter().cloned());
                        for url in &v.allowed_urls {
                            match merged.allowed_urls.iter_mut().find(|au| au.url == url.url) {
                                Some(known) => {
                                    known.methods.extend(url.methods.iter().cloned());
                                }
                                None => merged.allowed_urls.push(url.clone()),
                            }
                        }
                        if merged.limit.is_none() {
                            merged.limit = Some(ApiLimit::default());
                        }
                        entry = merged;
                    }

                    if let Some(limit) = entry.limit.as_mut() {
                        limit.set_by = policy.id.clone();
                    }
                }

                if !use_partitions || policy.partitions.quota {
                    did_quota.insert(api_id.clone());

                    if let Some(limit) = entry.limit.as_mut() {
                        // -1 is the special "unlimited" case, never overwritten
                        if limit.quota_max != UNLIMITED && policy.quota_max > limit.quota_max {
                            limit.quota_max = policy.quota_max;
                        }
                        if policy.quota_renewal_rate > limit.quota_renewal_rate {
                            limit.quota_renewal_rate = policy.quota_renewal_rate;
                        }
                    }
                }

                if !use_partitions || policy.partitions.rate_limit {
                    did_rate.insert(api_id.clone());

                    if let Some(limit) = entry.limit.as_mut() {
                        if limit.rate != UNLIMITED as f64 && policy.rate > limit.rate {
                            limit.rate = policy.rate;
                        }
                        if policy.per > limit.per {
                            limit.per = policy.per;
                        }
                        if policy.throttle_interval > limit.throttle_interval {
                            limit.throttle_interval = policy.throttle_interval;
                        }
                        if policy.throttle_retry_limit > limit.throttle_retry_limit {
                            limit.throttle_retry_limit = policy.throttle_retry_limit;
                        }
                    }
                }

                // Respect the existing quota window
                if let Some(existing) = session.access_rights.get(api_id) {
                    if let Some(existing_limit) = &existing.limit {
                        if let Some(limit) = entry.limit.as_mut() {
                            limit.quota_renews = existing_limit.quota_renews;
                        }
                    }
                }

                rights.insert(api_id.clone(), entry);
            }

            // Master policy: no access rights, update the session top level
            if policy.access_rights.is_empty() {
                if !use_partitions || policy.partitions.rate_limit {
                    session.rate = policy.rate;
                    session.per = policy.per;
                    session.throttle_interval = policy.throttle_interval;
                    session.throttle_retry_limit = policy.throttle_retry_limit;
                }
                if !use_partitions || policy.partitions.quota {
                    session.quota_max = policy.quota_max;
                    session.quota_renewal_rate = policy.quota_renewal_rate;
                }
            }

            if !session.hmac_enabled {
                session.hmac_enabled = policy.hmac_enabled;
            }
        }

        // First policy seeds the inactive flag; later ones only escalate
        if i == 0 {
            session.is_inactive = policy.is_inactive;
        } else if policy.is_inactive {
            session.is_inactive = true;
        }

        for tag in &policy.tags {
            tags.insert(tag.clone());
        }
    }

    for tag in &session.tags {
        tags.insert(tag.clone());
    }
    session.tags = tags.into_iter().collect();

    let distinct_acl: HashSet<&str> = rights
        .values()
        .filter_map(|v| v.limit.as_ref())
        .filter(|l| !l.set_by.is_empty())
        .map(|l| l.set_by.as_str())
        .collect();
    let multiple_acl_owners = distinct_acl.len() > 1;

    // APIs that only had some partitions touched inherit the rest from the
    // session top level.
    for (api_id, v) in rights.iter_mut() {
        let limit = v.limit.get_or_insert_with(ApiLimit::default);

        if !did_rate.contains(api_id) {
            limit.rate = session.rate;
            limit.per = session.per;
            limit.throttle_interval = session.throttle_interval;
            limit.throttle_retry_limit = session.throttle_retry_limit;
        }

        if !did_quota.contains(api_id) {
            limit.quota_max = session.quota_max;
            limit.quota_renewal_rate = session.quota_renewal_rate;
            limit.quota_renews = session.quota_renews;
        }

        if multiple_acl_owners && v.allowance_scope.is_empty() && !limit.set_by.is_empty() {
            v.allowance_scope = limit.set_by.clone();
        }

        limit.set_by.clear();
    }

    // Policies defined rules for exactly one API: mirror that API's limits
    // onto the session root fields (legacy single-API sessions).
    if did_quota.len() == 1 && did_rate.len() == 1 {
        if let Some(limit) = did_rate
            .iter()
            .next()
            .and_then(|api_id| rights.get(api_id))
            .and_then(|v| v.limit.as_ref())
        {
            session.rate = limit.rate;
            session.per = limit.per;
        }
        if let Some(limit) = did_quota
            .iter()
            .next()
            .and_then(|api_id| rights.get(api_id))
            .and_then(|v| v.limit.as_ref())
        {
            session.quota_max = limit.quota_max;
            session.quota_renews = limit.quota_renews;
            session.quota_renewal_rate = limit.quota_renewal_rate;
        }
    }

    // Override the session ACL when at least one policy defined it
    if !did_acl.is_empty() {
        session.access_rights = rights;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::AccessSpec;

    fn store_with(policies: Vec<Policy>) -> PolicyStore {
        let store = PolicyStore::new();
        for p in policies {
            store.insert(p);
        }
        store
    }

    fn session_with_policies(ids: &[&str]) -> SessionState {
        SessionState {
            apply_policies: ids.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn acl_entry(api_id: &str) -> AccessRight {
        AccessRight {
            api_id: api_id.to_string(),
            versions: vec!["Default".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn master_policy_sets_top_level_fields() {
        let store = store_with(vec![Policy {
            id: "master".into(),
            quota_max: 100,
            rate: 5.0,
            per: 1.0,
            ..Default::default()
        }]);
        let mut session = session_with_policies(&["master"]);

        apply_policies(&mut session, None, &store).unwrap();

        assert_eq!(session.quota_max, 100);
        assert_eq!(session.rate, 5.0);
        assert_eq!(session.per, 1.0);
        assert!(session.access_rights.is_empty());
    }

    #[test]
    fn partitioned_policies_on_disjoint_apis_inherit_the_rest() {
        let mut p1 = Policy {
            id: "quota-a".into(),
            quota_max: 10,
            ..Default::default()
        };
        p1.partitions.quota = true;
        p1.partitions.acl = true;
        p1.access_rights.insert("api-a".into(), acl_entry("api-a"));

        let mut p2 = Policy {
            id: "rate-b".into(),
            rate: 20.0,
            per: 1.0,
            ..Default::default()
        };
        p2.partitions.rate_limit = true;
        p2.partitions.acl = true;
        p2.access_rights.insert("api-b".into(), acl_entry("api-b"));

        let store = store_with(vec![p1, p2]);
        let mut session = session_with_policies(&["quota-a", "rate-b"]);
        session.rate = 3.0;
        session.per = 2.0;
        session.quota_max = 77;

        apply_policies(&mut session, None, &store).unwrap();

        let a = session.access_rights["api-a"].limit.as_ref().unwrap();
        let b = session.access_rights["api-b"].limit.as_ref().unwrap();
        assert_eq!(a.quota_max, 10);
        assert_eq!(b.rate, 20.0);
        // api-a had no rate partition: inherits session top-level rate
        assert_eq!(a.rate, 3.0);
        assert_eq!(a.per, 2.0);
        // api-b had no quota partition: inherits session top-level quota
        assert_eq!(b.quota_max, 77);
    }

    #[test]
    fn mixed_modes_rejected() {
        let mut per_api = Policy {
            id: "per-api".into(),
            quota_max: 50,
            ..Default::default()
        };
        per_api.partitions.per_api = true;
        per_api.access_rights.insert("api-a".into(), acl_entry("api-a"));

        let mut partitioned = Policy {
            id: "acl-a".into(),
            ..Default::default()
        };
        partitioned.partitions.acl = true;
        partitioned
            .access_rights
            .insert("api-a".into(), acl_entry("api-a"));

        let store = store_with(vec![per_api, partitioned]);
        let mut session = session_with_policies(&["per-api", "acl-a"]);

        let err = apply_policies(&mut session, None, &store).unwrap_err();
        assert_eq!(err, GatewayError::PolicyMixedModes);
    }

    #[test]
    fn unlimited_quota_is_never_overwritten() {
        let mut policy = Policy {
            id: "quota".into(),
            quota_max: 1000,
            ..Default::default()
        };
        policy.partitions.quota = true;
        policy.partitions.acl = true;
        let mut entry = acl_entry("api-a");
        entry.limit = Some(ApiLimit {
            quota_max: UNLIMITED,
            ..Default::default()
        });
        policy.access_rights.insert("api-a".into(), entry);

        let store = store_with(vec![policy]);
        let mut session = session_with_policies(&["quota"]);

        apply_policies(&mut session, None, &store).unwrap();

        let limit = session.access_rights["api-a"].limit.as_ref().unwrap();
        assert_eq!(limit.quota_max, UNLIMITED);
    }

    #[test]
    fn missing_policy_fails() {
        let store = PolicyStore::new();
        let mut session = session_with_policies(&["ghost"]);
        let err = apply_policies(&mut session, None, &store).unwrap_err();
        assert_eq!(err, GatewayError::PolicyNotFound("ghost".into()));
    }

    #[test]
    fn cross_org_policy_rejected() {
        let store = store_with(vec![Policy {
            id: "foreign".into(),
            org_id: "org-b".into(),
            ..Default::default()
        }]);
        let mut session = session_with_policies(&["foreign"]);
        let err = apply_policies(&mut session, Some("org-a"), &store).unwrap_err();
        assert_eq!(err, GatewayError::PolicyCrossOrg);
    }

    #[test]
    fn per_api_with_partition_flags_rejected() {
        let mut policy = Policy {
            id: "broken".into(),
            ..Default::default()
        };
        policy.partitions.per_api = true;
        policy.partitions.quota = true;

        let store = store_with(vec![policy]);
        let mut session = session_with_policies(&["broken"]);
        let err = apply_policies(&mut session, None, &store).unwrap_err();
        assert_eq!(err, GatewayError::PolicyPartitionConflict("broken".into()));
    }

    #[test]
    fn per_api_synthesises_limit_and_scope() {
        let mut policy = Policy {
            id: "per-api".into(),
            quota_max: 40,
            rate: 8.0,
            per: 1.0,
            ..Default::default()
        };
        policy.partitions.per_api = true;
        policy.access_rights.insert("api-a".into(), acl_entry("api-a"));

        let store = store_with(vec![policy]);
        let mut session = session_with_policies(&["per-api"]);
        // pre-existing entry carries a live quota window
        let mut existing = acl_entry("api-a");
        existing.limit = Some(ApiLimit {
            quota_renews: 4242,
            ..Default::default()
        });
        session.access_rights.insert("api-a".into(), existing);

        apply_policies(&mut session, None, &store).unwrap();

        let right = &session.access_rights["api-a"];
        assert_eq!(right.allowance_scope, "api-a");
        let limit = right.limit.as_ref().unwrap();
        assert_eq!(limit.quota_max, 40);
        assert_eq!(limit.rate, 8.0);
        // window preserved from the pre-existing session entry
        assert_eq!(limit.quota_renews, 4242);
        // internal marker cleared before exposure
        assert_eq!(limit.set_by, "");
    }

    #[test]
    fn acl_merge_appends_urls_once() {
        let mut p1 = Policy {
            id: "acl-1".into(),
            ..Default::default()
        };
        p1.partitions.acl = true;
        let mut e1 = acl_entry("api-a");
        e1.allowed_urls = vec![AccessSpec {
            url: "/users".into(),
            methods: vec!["GET".into()],
        }];
        p1.access_rights.insert("api-a".into(), e1);

        let mut p2 = Policy {
            id: "acl-2".into(),
            ..Default::default()
        };
        p2.partitions.acl = true;
        let mut e2 = acl_entry("api-a");
        e2.allowed_urls = vec![
            AccessSpec {
                url: "/users".into(),
                methods: vec!["POST".into()],
            },
            AccessSpec {
                url: "/orders".into(),
                methods: vec!["GET".into()],
            },
        ];
        p2.access_rights.insert("api-a".into(), e2);

        let store = store_with(vec![p1, p2]);
        let mut session = session_with_policies(&["acl-1", "acl-2"]);

        apply_policies(&mut session, None, &store).unwrap();

        let urls = &session.access_rights["api-a"].allowed_urls;
        assert_eq!(urls.len(), 2);
        let users = urls.iter().find(|u| u.url == "/users").unwrap();
        assert_eq!(users.methods, vec!["GET".to_string(), "POST".to_string()]);
        assert!(urls.iter().any(|u| u.url == "/orders"));
    }

    #[test]
    fn inactive_seeded_by_first_and_escalated_by_later() {
        let active = Policy {
            id: "active".into(),
            ..Default::default()
        };
        let inactive = Policy {
            id: "inactive".into(),
            is_inactive: true,
            ..Default::default()
        };
        let store = store_with(vec![active.clone(), inactive]);

        let mut session = session_with_policies(&["active", "inactive"]);
        apply_policies(&mut session, None, &store).unwrap();
        assert!(session.is_inactive);

        // an earlier inactive state is reset by the first policy's value
        let store = store_with(vec![active]);
        let mut session = session_with_policies(&["active"]);
        session.is_inactive = true;
        apply_policies(&mut session, None, &store).unwrap();
        assert!(!session.is_inactive);
    }

    #[test]
    fn tags_are_deduplicated() {
        let p1 = Policy {
            id: "t1".into(),
            tags: vec!["gold".into(), "eu".into()],
            ..Default::default()
        };
        let p2 = Policy {
            id: "t2".into(),
            tags: vec!["gold".into(), "beta".into()],
            ..Default::default()
        };
        let store = store_with(vec![p1, p2]);
        let mut session = session_with_policies(&["t1", "t2"]);
        session.tags = vec!["eu".into(), "internal".into()];

        apply_policies(&mut session, None, &store).unwrap();

        let mut expected = vec!["beta", "eu", "gold", "internal"];
        expected.sort_unstable();
        assert_eq!(session.tags, expected);
    }

    #[test]
    fn allowance_scope_backfilled_with_multiple_acl_owners() {
        let mut p1 = Policy {
            id: "acl-a".into(),
            ..Default::default()
        };
        p1.partitions.acl = true;
        p1.access_rights.insert("api-a".into(), acl_entry("api-a"));

        let mut p2 = Policy {
            id: "acl-b".into(),
            ..Default::default()
        };
        p2.partitions.acl = true;
        p2.access_rights.insert("api-b".into(), acl_entry("api-b"));

        let store = store_with(vec![p1, p2]);
        let mut session = session_with_policies(&["acl-a", "acl-b"]);

        apply_policies(&mut session, None, &store).unwrap();

        assert_eq!(session.access_rights["api-a"].allowance_scope, "acl-a");
        assert_eq!(session.access_rights["api-b"].allowance_scope, "acl-b");
        for right in session.access_rights.values() {
            assert_eq!(right.limit.as_ref().unwrap().set_by, "");
        }
    }

    #[test]
    fn single_api_limits_collapse_to_session_root() {
        let mut policy = Policy {
            id: "one-api".into(),
            quota_max: 60,
            quota_renewal_rate: 3600,
            rate: 12.0,
            per: 2.0,
            ..Default::default()
        };
        policy.partitions.per_api = true;
        policy.access_rights.insert("api-a".into(), acl_entry("api-a"));

        let store = store_with(vec![policy]);
        let mut session = session_with_policies(&["one-api"]);

        apply_policies(&mut session, None, &store).unwrap();

        assert_eq!(session.rate, 12.0);
        assert_eq!(session.per, 2.0);
        assert_eq!(session.quota_max, 60);
        assert_eq!(session.quota_renewal_rate, 3600);
    }

    #[test]
    fn merge_is_idempotent() {
        let mut p1 = Policy {
            id: "quota-a".into(),
            quota_max: 10,
            ..Default::default()
        };
        p1.partitions.quota = true;
        p1.access_rights.insert("api-a".into(), acl_entry("api-a"));
        let p2 = Policy {
            id: "master".into(),
            rate: 4.0,
            per: 1.0,
            quota_max: 99,
            tags: vec!["tier-1".into()],
            ..Default::default()
        };

        let store = store_with(vec![p1, p2]);
        let mut session = session_with_policies(&["master", "quota-a"]);

        apply_policies(&mut session, None, &store).unwrap();
        let once = session.clone();
        apply_policies(&mut session, None, &store).unwrap();
        assert_eq!(session, once);
    }

    #[test]
    fn hmac_enabled_escalates_and_never_downgrades() {
        let hmac = Policy {
            id: "hmac".into(),
            hmac_enabled: true,
            ..Default::default()
        };
        let plain = Policy {
            id: "plain".into(),
            ..Default::default()
        };
        let store = store_with(vec![hmac, plain]);

        let mut session = session_with_policies(&["hmac", "plain"]);
        apply_policies(&mut session, None, &store).unwrap();
        assert!(session.hmac_enabled);
    }

    #[test]
    fn load_from_json_fills_missing_ids() {
        let store = PolicyStore::new();
        let count = store
            .load_from_json(r#"{"p1": {"rate": 10.0, "per": 1.0}, "p2": {"id": "p2"}}"#)
            .unwrap();
        assert_eq!(count, 2);
        assert_eq!(store.get("p1").unwrap().id, "p1");
        assert_eq!(store.get("p2").unwrap().id, "p2");
    }
}
