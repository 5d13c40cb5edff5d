//! The API registry
//!
//! Concurrent mapping from API id and listen path to compiled pipelines.
//! A configuration load builds a complete new snapshot and swaps it in
//! atomically: in-flight requests finish on the pipeline they started with,
//! new requests see the new generation, and no request crosses snapshots.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use arc_swap::ArcSwap;
use axum::body::Body;
use axum::http::{header, Request, Response, StatusCode};
use tracing::{debug, info};

use crate::apidef::ApiSpec;
use crate::context::{ctx_mut, ctx_set_orig_request_uri};
use crate::middleware::{error_response, parse_form, GatewayServices};
use crate::pipeline::{count_apis_by_listen_hash, process_spec, Pipeline};

/// One immutable registry generation
#[derive(Default)]
pub struct RegistrySnapshot {
    pub by_id: HashMap<String, Arc<Pipeline>>,
    /// Mounted HTTP pipelines, longest listen path first so `/foo` does not
    /// shadow `/foo-bar`
    pub by_listen: Vec<Arc<Pipeline>>,
}

/// Atomically swapped pipeline registry
pub struct Registry {
    snapshot: ArcSwap<RegistrySnapshot>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// How an inbound path resolved against the registry
pub enum RouteMatch {
    /// The pipeline's main chain
    Main(Arc<Pipeline>),
    /// The rate-limit inspection sub-chain
    RateLimits(Arc<Pipeline>),
}

impl Registry {
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(RegistrySnapshot::default()),
        }
    }

    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.snapshot.load_full()
    }

    pub fn get_by_id(&self, api_id: &str) -> Option<Arc<Pipeline>> {
        self.snapshot.load().by_id.get(api_id).cloned()
    }

    /// Compile every spec and swap in the new generation. The build completes
    /// fully before the swap; a failed spec is compiled as `skip` and never
    /// mounted.
    pub async fn load_apps(&self, mut specs: Vec<ApiSpec>, services: &Arc<GatewayServices>) {
        info!("Loading API configurations");

        let previous = self.snapshot();
        let owned_before = |spec: &ApiSpec| {
            previous
                .by_id
                .get(&spec.api_id)
                .is_some_and(|p| p.spec.proxy.listen_path == spec.proxy.listen_path)
        };

        // Longest listen path first; previous owners of a contested path win
        // the tie so reloads keep paths stable.
        specs.sort_by(|a, b| {
            b.proxy
                .listen_path
                .len()
                .cmp(&a.proxy.listen_path.len())
                .then_with(|| owned_before(b).cmp(&owned_before(a)))
        });

        let counts = count_apis_by_listen_hash(&specs);
        let mut assigned = HashSet::new();
        let mut by_id = HashMap::new();
        let mut by_listen = Vec::new();

        for spec in specs {
            if spec.listen_port != 0 {
                info!(api_id = %spec.api_id, port = spec.listen_port, "API bind on custom port");
            }
            let http = spec.protocol.is_http();
            let pipeline = Arc::new(process_spec(spec, &counts, &mut assigned, services).await);
            by_id.insert(pipeline.spec.api_id.clone(), pipeline.clone());
            if http && !pipeline.skip {
                by_listen.push(pipeline);
            }
        }

        by_listen.sort_by(|a, b| {
            b.spec
                .proxy
                .listen_path
                .len()
                .cmp(&a.spec.proxy.listen_path.len())
        });

        self.snapshot.store(Arc::new(RegistrySnapshot { by_id, by_listen }));

        if !services.config.get().uptime_tests.disable {
            debug!("Checker host list refreshed");
        }
        info!("Initialised API definitions");
    }

    /// Loop-target lookup: by API id, by internal object id, or by sanitised
    /// name (non-alphanumerics stripped, category suffix trimmed).
    pub fn fuzzy_find(&self, search: &str) -> Option<Arc<Pipeline>> {
        if search.is_empty() {
            return None;
        }
        let snapshot = self.snapshot.load();
        snapshot
            .by_id
            .values()
            .find(|p| {
                p.spec.api_id == search
                    || p.spec.id == search
                    // URI hosts arrive case-folded
                    || replace_non_alphanumeric(trim_categories(&p.spec.name))
                        .eq_ignore_ascii_case(search)
            })
            .cloned()
    }

    /// Match an inbound request by domain, then listen-path prefix. Domain-
    /// bound pipelines take precedence over wildcard ones.
    pub fn match_request(
        &self,
        host: &str,
        path: &str,
        enable_custom_domains: bool,
    ) -> Option<RouteMatch> {
        let snapshot = self.snapshot.load();
        let host = host.split(':').next().unwrap_or(host);

        let find = |domain_bound: bool| -> Option<RouteMatch> {
            for pipeline in &snapshot.by_listen {
                let has_domain = !pipeline.domain.is_empty() && enable_custom_domains;
                if has_domain != domain_bound {
                    continue;
                }
                if has_domain && pipeline.domain != host {
                    continue;
                }
                if !pipeline.open
                    && !pipeline.rate_limit_path.is_empty()
                    && path.starts_with(&pipeline.rate_limit_path)
                {
                    return Some(RouteMatch::RateLimits(pipeline.clone()));
                }
                if path.starts_with(&pipeline.spec.proxy.listen_path) {
                    return Some(RouteMatch::Main(pipeline.clone()));
                }
            }
            None
        };

        find(true).or_else(|| find(false))
    }

    /// Top-level request entry: route, stash the original URI for loop
    /// dispatch, tee form bodies, then run the pipeline.
    pub async fn serve(
        self: &Arc<Self>,
        enable_custom_domains: bool,
        mut req: Request<Body>,
    ) -> Response<Body> {
        let host = req
            .headers()
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let path = req.uri().path().to_string();

        let matched = match self.match_request(&host, &path, enable_custom_domains) {
            Some(m) => m,
            None => return error_response(StatusCode::NOT_FOUND, "no API found for request"),
        };

        let orig_uri = req.uri().clone();
        ctx_set_orig_request_uri(&mut req, Some(orig_uri));
        // downstream consumers still see the full body bytes
        let _ = parse_form(&mut req).await;

        match matched {
            RouteMatch::Main(pipeline) => pipeline.handle(self, req).await,
            RouteMatch::RateLimits(pipeline) => pipeline.handle_rate_limits(req).await,
        }
    }

    /// Record the peer address on the request context
    pub fn attach_peer(req: &mut Request<Body>, peer: std::net::IpAddr) {
        ctx_mut(req).client_ip = Some(peer);
    }
}

/// Drop the ` #category` suffix of an API name
pub fn trim_categories(name: &str) -> &str {
    match name.find('#') {
        Some(idx) => name[..idx].trim_end(),
        None => name,
    }
}

/// Sanitised form used for loop-target matching
pub fn replace_non_alphanumeric(name: &str) -> String {
    name.chars().filter(|c| c.is_alphanumeric()).collect()
}
