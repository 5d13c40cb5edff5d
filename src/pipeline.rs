//! Pipeline compilation
//!
//! Turns one [`ApiSpec`] into an executable [`Pipeline`]: validation,
//! listen-path collision resolution, storage binding, custom hook loading,
//! proxy construction and the fixed stage order. Compilation happens at
//! configuration-reload time; serving never mutates a pipeline.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, Response, StatusCode, Uri};
use http_body_util::BodyExt;
use tracing::{debug, error, info, warn, Instrument};

use crate::apidef::{ApiSpec, CustomMiddleware, MiddlewareDefinition, MiddlewareDriver};
use crate::context::{ctx, ctx_get_session};
use crate::errors::GatewayError;
use crate::middleware::{
    append_enabled, error_response, run_stage, AuthKind, BaseStage, BuiltStage, GatewayServices,
    ResponseProcessor, SessionLimiter, SpecServices, StageFlow,
};
use crate::plugins::{load_custom_middleware, HookKind, PluginRuntime};
use crate::proxy::{MultiTargetProxy, SingleHostProxy, UpstreamHandler};
use crate::registry::Registry;
use crate::resolver::SessionResolver;
use crate::stages::{
    user_rates_response, AccessRightsStage, AuthKeyStage, CacheStage, CertCheckStage,
    ContextVarsStage, CorsStage, GranularAccessStage, IpFilterStage, KeyExpiredStage,
    OrgMonitorStage, PluginAuthStage, PluginStage, ProviderAuthStage, RateCheckStage,
    RateLimitAndQuotaStage, RateLimitForApiStage, RequestSizeLimitStage, TrackEndpointStage,
    TransformKind, TransformStage, ValidateJsonStage, VersionCheckStage, VirtualEndpointStage,
};
use crate::storage::{
    InMemoryStore, SessionManager, StoreBackedKeyRegistry, LDAP_STORAGE_ENGINE,
    RPC_STORAGE_ENGINE,
};

/// Mount suffix of the rate inspection sub-chain
pub const RATE_LIMIT_ENDPOINT: &str = "tyk/rate-limits/";

/// A compiled, immutable per-API middleware chain
pub struct Pipeline {
    pub spec: Arc<ApiSpec>,
    pub base: BaseStage,
    stages: Vec<BuiltStage>,
    rate_limit_chain: Vec<BuiltStage>,
    /// Mount path of the rate inspection sub-chain; empty for open pipelines
    pub rate_limit_path: String,
    /// Listen pattern: `<listen_path>{rest:.*}`
    pub listen_on: String,
    pub domain: String,
    /// Keyless pipelines skip the whole authenticated segment
    pub open: bool,
    /// Invalid or internal specs compile but are never mounted
    pub skip: bool,
    pub listen_port: u16,
    proxy: Arc<dyn UpstreamHandler>,
    response_processors: Vec<Arc<dyn ResponseProcessor>>,
}

impl Pipeline {
    /// Run the full stage chain, ending in the terminal proxy handler
    pub async fn handle(&self, registry: &Registry, req: Request<Body>) -> Response<Body> {
        if self.base.config.tracing_enabled {
            let span = tracing::info_span!("api", api_name = %self.spec.name);
            return self.run_chain(registry, req).instrument(span).await;
        }
        self.run_chain(registry, req).await
    }

    async fn run_chain(&self, registry: &Registry, mut req: Request<Body>) -> Response<Body> {
        for built in &self.stages {
            match run_stage(built, &mut req).await {
                StageFlow::Continue => {}
                StageFlow::Done(resp) => return resp,
            }
        }
        crate::loopback::serve_terminal(self, registry, req).await
    }

    /// Run the rate inspection sub-chain
    pub async fn handle_rate_limits(&self, mut req: Request<Body>) -> Response<Body> {
        for built in &self.rate_limit_chain {
            match run_stage(built, &mut req).await {
                StageFlow::Continue => {}
                StageFlow::Done(resp) => return resp,
            }
        }
        user_rates_response(&req)
    }

    /// Names of the assembled stages, in order
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|b| b.stage.name()).collect()
    }

    pub fn rate_limit_stage_names(&self) -> Vec<&'static str> {
        self.rate_limit_chain.iter().map(|b| b.stage.name()).collect()
    }

    /// Forward to the upstream and walk the response processors
    pub(crate) async fn success(&self, req: Request<Body>) -> Response<Body> {
        let session = ctx_get_session(&req).cloned();
        let cache_key = ctx(&req).and_then(|c| c.context_vars.get("cache_key").cloned());

        let mut resp = self.proxy.serve(req).await;

        for processor in &self.response_processors {
            if let Err(e) = processor.handle_response(&mut resp, session.as_ref()).await {
                // a failing custom response hook aborts the exchange
                if processor.name() == "CustomMiddlewareResponseHook" {
                    return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
                }
                warn!(processor = processor.name(), "Response processor failed: {}", e);
            }
        }

        if let Some(key) = cache_key {
            if resp.status().is_success() {
                resp = self.store_cached_response(key, resp).await;
            }
        }

        resp
    }

    async fn store_cached_response(&self, key: String, resp: Response<Body>) -> Response<Body> {
        let (parts, body) = resp.into_parts();
        let bytes = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(_) => bytes::Bytes::new(),
        };
        if let Ok(text) = std::str::from_utf8(&bytes) {
            let ttl = self.spec.cache_options.cache_timeout as i64;
            self.base.svc.cache_store.set_key(&key, text, ttl).await;
        }
        Response::from_parts(parts, Body::from(bytes))
    }
}

/// Skip criteria: empty or space-carrying listen paths, unparseable targets
pub fn skip_spec_because_invalid(spec: &ApiSpec) -> bool {
    if spec.protocol.is_http() {
        if spec.proxy.listen_path.is_empty() {
            error!(api_id = %spec.api_id, "Listen path is empty");
            return true;
        }
        if spec.proxy.listen_path.contains(' ') {
            error!(api_id = %spec.api_id, "Listen path contains spaces, is invalid");
            return true;
        }
        if spec.proxy.target_url.parse::<Uri>().is_err() {
            error!(api_id = %spec.api_id, "Couldn't parse target URL");
            return true;
        }
    }
    false
}

/// Count `(domain, listen_path)` occurrences across the spec set
pub fn count_apis_by_listen_hash(specs: &[ApiSpec]) -> HashMap<String, usize> {
    let mut count: HashMap<String, usize> = HashMap::with_capacity(specs.len());
    for spec in specs {
        let hash = spec.domain_path_hash();
        if !count.contains_key(&hash) {
            let domain = if spec.domain.is_empty() {
                "(no host)"
            } else {
                &spec.domain
            };
            info!(api_name = %spec.name, domain, "Tracking hostname");
        }
        *count.entry(hash).or_insert(0) += 1;
    }
    count
}

/// Resolve a `(domain, listen_path)` collision by renaming the listen path:
/// first `-<api_id>`, then `_` characters until the path is free. The first
/// claimant of a contested path keeps it; the load pass orders previous
/// owners first so reloads are stable.
fn resolve_listen_path(
    spec: &mut ApiSpec,
    apis_by_listen: &HashMap<String, usize>,
    assigned: &mut HashSet<String>,
) {
    let contested = apis_by_listen
        .get(&spec.domain_path_hash())
        .copied()
        .unwrap_or(0)
        >= 2;
    let mut path_modified = false;
    while assigned.contains(&spec.domain_path_hash()) {
        if !path_modified {
            spec.proxy.listen_path = format!("{}-{}", spec.proxy.listen_path, spec.api_id);
            path_modified = true;
        } else {
            spec.proxy.listen_path.push('_');
        }
    }
    if path_modified {
        error!(
            api_id = %spec.api_id,
            "Listen path collision, changed to {}",
            spec.proxy.listen_path
        );
    } else if contested {
        debug!(api_id = %spec.api_id, "Contested listen path kept by first claimant");
    }
    assigned.insert(spec.domain_path_hash());
}

/// Injects and removes response headers per the processor options:
/// `{"add_headers": {"name": "value"}, "remove_headers": ["name"]}`
struct HeaderInjector {
    options: serde_json::Value,
}

#[async_trait::async_trait]
impl ResponseProcessor for HeaderInjector {
    fn name(&self) -> &'static str {
        "header_injector"
    }

    async fn handle_response(
        &self,
        resp: &mut Response<Body>,
        _session: Option<&crate::session::SessionState>,
    ) -> anyhow::Result<()> {
        if let Some(add) = self.options.get("add_headers").and_then(|v| v.as_object()) {
            for (name, value) in add {
                let Some(value) = value.as_str() else { continue };
                if let (Ok(name), Ok(value)) = (
                    name.parse::<axum::http::HeaderName>(),
                    value.parse::<axum::http::HeaderValue>(),
                ) {
                    resp.headers_mut().insert(name, value);
                }
            }
        }
        if let Some(remove) = self.options.get("remove_headers").and_then(|v| v.as_array()) {
            for name in remove.iter().filter_map(|v| v.as_str()) {
                if let Ok(name) = name.parse::<axum::http::HeaderName>() {
                    resp.headers_mut().remove(name);
                }
            }
        }
        Ok(())
    }
}

/// Resolve a response processor by its configured name
fn response_processor_by_name(
    def: &crate::apidef::ResponseProcessorDef,
    services: &Arc<GatewayServices>,
    hooks: &CustomMiddleware,
) -> Option<Arc<dyn ResponseProcessor>> {
    match def.name.as_str() {
        "header_injector" | "header_transform" => Some(Arc::new(HeaderInjector {
            options: def.options.clone(),
        })),
        "custom_mw_res_hook" => {
            let runtime = services.plugin_runtime.as_ref()?;
            let definition = hooks.response.first().cloned().unwrap_or_default();
            Some(Arc::new(PluginResponseHook {
                runtime: runtime.clone(),
                driver: hooks.driver,
                definition,
            }))
        }
        _ => None,
    }
}

/// Response processor backed by a plugin response hook
struct PluginResponseHook {
    runtime: Arc<dyn PluginRuntime>,
    driver: MiddlewareDriver,
    definition: MiddlewareDefinition,
}

#[async_trait::async_trait]
impl ResponseProcessor for PluginResponseHook {
    fn name(&self) -> &'static str {
        "CustomMiddlewareResponseHook"
    }

    async fn handle_response(
        &self,
        resp: &mut Response<Body>,
        _session: Option<&crate::session::SessionState>,
    ) -> anyhow::Result<()> {
        self.runtime
            .dispatch_response(self.driver, &self.definition, resp)
            .await
    }
}

/// Compile one spec into a pipeline.
///
/// `assigned` accumulates claimed `(domain, listen_path)` hashes across one
/// load pass.
pub async fn process_spec(
    mut spec: ApiSpec,
    apis_by_listen: &HashMap<String, usize>,
    assigned: &mut HashSet<String>,
    services: &Arc<GatewayServices>,
) -> Pipeline {
    info!(org_id = %spec.org_id, api_id = %spec.api_id, api_name = %spec.name, "Initializing API");

    // Headers marked for tagging are matched lowercase
    for header in &mut spec.tag_headers {
        *header = header.to_lowercase();
    }

    let mut skip = false;
    if skip_spec_because_invalid(&spec) {
        warn!(api_id = %spec.api_id, "Spec not valid, skipped!");
        skip = true;
    }

    // Internal APIs compile but are only reachable through loop dispatch
    if spec.internal {
        skip = true;
    }

    if !skip {
        resolve_listen_path(&mut spec, apis_by_listen, assigned);
    }

    // Bind storage per provider selection. RPC-backed storage implies org
    // data-age enforcement process-wide.
    let mut auth_store = services.stores.primary_store.clone();
    match spec.auth_provider.storage_engine.as_str() {
        LDAP_STORAGE_ENGINE => match &services.stores.ldap_builder {
            Some(builder) => match builder.build(&spec.auth_provider.meta) {
                Ok(store) => auth_store = store,
                Err(e) => error!(api_id = %spec.api_id, "LDAP storage bind failed: {}", e),
            },
            None => error!(api_id = %spec.api_id, "LDAP storage engine selected but not deployed"),
        },
        RPC_STORAGE_ENGINE => {
            auth_store = services.stores.rpc_auth_store.clone();
            services.config.force_enforce_org_data_age();
        }
        _ => {}
    }
    let session_store = match spec.session_provider.storage_engine.as_str() {
        RPC_STORAGE_ENGINE => services.stores.rpc_auth_store.clone(),
        _ => services.stores.primary_store.clone(),
    };

    // Custom middleware hooks: inline definitions plus the loaded bundle
    let hooks = load_custom_middleware(&spec, services.bundle_loader.as_deref()).await;
    let config = services.config.get();
    if !spec.custom_middleware_bundle.is_empty() {
        let unpack = crate::plugins::bundle_path(
            &config.middleware_path,
            &spec.api_id,
            &spec.custom_middleware_bundle,
        );
        debug!(api_id = %spec.api_id, "Bundle unpack location: {:?}", unpack);
    }
    if config.enable_jsvm && hooks.driver == MiddlewareDriver::ScriptVm {
        debug!(api_id = %spec.api_id, "Script VM hooks registered");
    }

    let spec = Arc::new(spec);

    // Proxy handler: multi-target when any version overrides the upstream
    let timeout = Duration::from_millis(config.upstream.timeout_ms);
    let make_proxy = |target: &str| -> Option<SingleHostProxy> {
        target.parse::<Uri>().ok().map(|uri| {
            SingleHostProxy::new(
                uri,
                spec.proxy.listen_path.clone(),
                spec.proxy.strip_listen_path,
                services.http_client.clone(),
                timeout,
            )
        })
    };
    let proxy: Arc<dyn UpstreamHandler> = if spec.has_target_overrides() {
        info!(api_id = %spec.api_id, "Multi target enabled");
        let default = make_proxy(&spec.proxy.target_url);
        let mut version_targets = HashMap::new();
        for (name, version) in &spec.version_data.versions {
            if !version.override_target.is_empty() {
                if let Some(p) = make_proxy(&version.override_target) {
                    version_targets.insert(name.clone(), p);
                }
            }
        }
        match default {
            Some(default) => Arc::new(MultiTargetProxy::new(default, version_targets)),
            None => Arc::new(crate::proxy::StaticUpstream::new(
                StatusCode::BAD_GATEWAY,
                "no upstream target",
            )),
        }
    } else {
        match make_proxy(&spec.proxy.target_url) {
            Some(p) => Arc::new(p),
            None => Arc::new(crate::proxy::StaticUpstream::new(
                StatusCode::BAD_GATEWAY,
                "no upstream target",
            )),
        }
    };

    // Per-spec services: resolver over the bound stores, response cache,
    // session rate limiter
    let sessions = Arc::new(SessionManager::new(session_store, config.hash_keys));
    let spec_org = Some(spec.org_id.clone()).filter(|o| !o.is_empty());
    let svc = Arc::new(SpecServices {
        resolver: SessionResolver::new(
            config.clone(),
            spec_org,
            services.session_cache.clone(),
            sessions.clone(),
            Arc::new(StoreBackedKeyRegistry::new(auth_store, config.hash_keys)),
            services.policies.clone(),
        ),
        sessions,
        cache_store: Arc::new(InMemoryStore::new(format!("cache-{}-", spec.api_id))),
        limiter: SessionLimiter::new(),
    });

    let base = BaseStage {
        spec: spec.clone(),
        config: config.clone(),
        gw: services.clone(),
        svc,
    };

    let open = spec.use_keyless_access;
    if open {
        info!(api_id = %spec.api_id, "Checking security policy: Open");
    }

    let build = assemble_chain(&base, &hooks, open);
    let (stages, rate_limit_chain) = match build {
        Ok(chains) => chains,
        Err(e) => {
            error!(api_id = %spec.api_id, "Pipeline build failed: {}", e);
            skip = true;
            (Vec::new(), Vec::new())
        }
    };

    // Response processors: named ones first, then the spec's response hooks
    let mut response_processors: Vec<Arc<dyn ResponseProcessor>> = Vec::new();
    for def in &spec.response_processors {
        match response_processor_by_name(def, services, &hooks) {
            Some(processor) => response_processors.push(processor),
            None => warn!(api_id = %spec.api_id, "Unknown response processor: {}", def.name),
        }
    }
    if let Some(runtime) = &services.plugin_runtime {
        for def in &hooks.response {
            if !def.is_empty() {
                response_processors.push(Arc::new(PluginResponseHook {
                    runtime: runtime.clone(),
                    driver: hooks.driver,
                    definition: def.clone(),
                }));
            }
        }
    }

    let rate_limit_path = if open {
        String::new()
    } else {
        format!("{}{}", spec.proxy.listen_path, RATE_LIMIT_ENDPOINT)
    };
    if !rate_limit_path.is_empty() {
        debug!("Rate limit endpoint is: {}", rate_limit_path);
    }

    let listen_on = format!("{}{{rest:.*}}", spec.proxy.listen_path);
    debug!(api_id = %spec.api_id, "Setting listen path: {}", spec.proxy.listen_path);

    let listen_port = if spec.listen_port != 0 {
        spec.listen_port
    } else {
        config.server.listen_port
    };

    info!(api_id = %spec.api_id, "API loaded");

    Pipeline {
        domain: spec.domain.clone(),
        listen_on,
        listen_port,
        open,
        skip,
        rate_limit_path,
        rate_limit_chain,
        response_processors,
        proxy,
        stages,
        base,
        spec,
    }
}

type Chains = (Vec<BuiltStage>, Vec<BuiltStage>);

/// The fixed chain order. Stages join iff enabled for the spec; a config
/// failure aborts the whole build.
fn assemble_chain(
    base: &BaseStage,
    hooks: &CustomMiddleware,
    open: bool,
) -> Result<Chains, GatewayError> {
    let mut chain: Vec<BuiltStage> = Vec::new();

    append_enabled(&mut chain, Arc::new(CorsStage { base: base.clone() }))?;

    for def in &hooks.pre {
        append_enabled(
            &mut chain,
            Arc::new(PluginStage {
                base: base.clone(),
                hook: HookKind::Pre,
                definition: def.clone(),
            }),
        )?;
    }

    append_enabled(&mut chain, Arc::new(RateCheckStage { base: base.clone() }))?;
    append_enabled(
        &mut chain,
        Arc::new(IpFilterStage {
            base: base.clone(),
            deny: false,
        }),
    )?;
    append_enabled(
        &mut chain,
        Arc::new(IpFilterStage {
            base: base.clone(),
            deny: true,
        }),
    )?;
    append_enabled(&mut chain, Arc::new(CertCheckStage { base: base.clone() }))?;
    append_enabled(&mut chain, Arc::new(OrgMonitorStage { base: base.clone() }))?;
    append_enabled(&mut chain, Arc::new(VersionCheckStage { base: base.clone() }))?;
    append_enabled(
        &mut chain,
        Arc::new(RequestSizeLimitStage { base: base.clone() }),
    )?;
    append_enabled(&mut chain, Arc::new(ContextVarsStage { base: base.clone() }))?;
    append_enabled(
        &mut chain,
        Arc::new(TrackEndpointStage { base: base.clone() }),
    )?;

    let mut rate_limit_chain: Vec<BuiltStage> = Vec::new();

    if !open {
        let auth_chain = build_auth_stages(base, hooks)?;
        chain.extend(auth_chain);

        for def in &hooks.post_key_auth {
            append_enabled(
                &mut chain,
                Arc::new(PluginStage {
                    base: base.clone(),
                    hook: HookKind::PostAuth,
                    definition: def.clone(),
                }),
            )?;
        }

        append_enabled(&mut chain, Arc::new(crate::stages::StripAuthStage { base: base.clone() }))?;
        append_enabled(&mut chain, Arc::new(KeyExpiredStage { base: base.clone() }))?;
        append_enabled(
            &mut chain,
            Arc::new(AccessRightsStage { base: base.clone() }),
        )?;
        append_enabled(
            &mut chain,
            Arc::new(GranularAccessStage { base: base.clone() }),
        )?;
        append_enabled(
            &mut chain,
            Arc::new(RateLimitAndQuotaStage { base: base.clone() }),
        )?;

        // The parallel inspection sub-chain mounted under the rate-limit path
        append_enabled(
            &mut rate_limit_chain,
            Arc::new(IpFilterStage {
                base: base.clone(),
                deny: false,
            }),
        )?;
        append_enabled(
            &mut rate_limit_chain,
            Arc::new(IpFilterStage {
                base: base.clone(),
                deny: true,
            }),
        )?;
        append_enabled(
            &mut rate_limit_chain,
            Arc::new(OrgMonitorStage { base: base.clone() }),
        )?;
        append_enabled(
            &mut rate_limit_chain,
            Arc::new(VersionCheckStage { base: base.clone() }),
        )?;
        rate_limit_chain.extend(build_auth_stages(base, hooks)?);
        append_enabled(
            &mut rate_limit_chain,
            Arc::new(KeyExpiredStage { base: base.clone() }),
        )?;
        append_enabled(
            &mut rate_limit_chain,
            Arc::new(AccessRightsStage { base: base.clone() }),
        )?;
    }

    append_enabled(
        &mut chain,
        Arc::new(RateLimitForApiStage { base: base.clone() }),
    )?;
    append_enabled(
        &mut chain,
        Arc::new(ValidateJsonStage { base: base.clone() }),
    )?;
    for kind in [
        TransformKind::Body,
        TransformKind::BodyJq,
        TransformKind::Headers,
        TransformKind::UrlRewrite,
        TransformKind::Method,
    ] {
        append_enabled(
            &mut chain,
            Arc::new(TransformStage {
                base: base.clone(),
                kind,
            }),
        )?;
    }
    append_enabled(&mut chain, Arc::new(CacheStage { base: base.clone() }))?;
    append_enabled(
        &mut chain,
        Arc::new(VirtualEndpointStage { base: base.clone() }),
    )?;
    append_enabled(
        &mut chain,
        Arc::new(crate::stages::RequestSigningStage { base: base.clone() }),
    )?;

    for def in &hooks.post {
        append_enabled(
            &mut chain,
            Arc::new(PluginStage {
                base: base.clone(),
                hook: HookKind::Post,
                definition: def.clone(),
            }),
        )?;
    }

    Ok((chain, rate_limit_chain))
}

/// Auth method selection, in the fixed candidate order. The token-key stage
/// joins when standard auth is requested or nothing else qualified.
fn build_auth_stages(
    base: &BaseStage,
    hooks: &CustomMiddleware,
) -> Result<Vec<BuiltStage>, GatewayError> {
    let mut auth: Vec<BuiltStage> = Vec::new();

    for kind in [
        AuthKind::OAuth2,
        AuthKind::Basic,
        AuthKind::Hmac,
        AuthKind::Jwt,
        AuthKind::OpenId,
    ] {
        if append_enabled(
            &mut auth,
            Arc::new(ProviderAuthStage {
                base: base.clone(),
                kind,
            }),
        )? {
            info!(api_id = %base.spec.api_id, "Checking security policy: {}", kind.as_str());
        }
    }

    if append_enabled(
        &mut auth,
        Arc::new(PluginAuthStage {
            base: base.clone(),
            definition: hooks.auth_check.clone(),
        }),
    )? {
        info!(api_id = %base.spec.api_id, "Checking security policy: custom plugin");
    }

    if base.spec.use_standard_auth || auth.is_empty() {
        info!(api_id = %base.spec.api_id, "Checking security policy: Token");
        append_enabled(&mut auth, Arc::new(AuthKeyStage { base: base.clone() }))?;
    }

    Ok(auth)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apidef::ProxyDef;
    use crate::config::{ConfigManager, GatewayConfig};

    fn services() -> Arc<GatewayServices> {
        let manager = Arc::new(ConfigManager::from_config(GatewayConfig::default()));
        Arc::new(GatewayServices::with_defaults(manager))
    }

    fn spec(api_id: &str, listen_path: &str, keyless: bool) -> ApiSpec {
        ApiSpec {
            api_id: api_id.to_string(),
            name: format!("API {api_id}"),
            proxy: ProxyDef {
                listen_path: listen_path.to_string(),
                target_url: "http://upstream.internal:8000".to_string(),
                ..Default::default()
            },
            use_keyless_access: keyless,
            ..Default::default()
        }
    }

    async fn build(spec: ApiSpec) -> Pipeline {
        let services = services();
        let specs = vec![spec];
        let counts = count_apis_by_listen_hash(&specs);
        let mut assigned = HashSet::new();
        process_spec(
            specs.into_iter().next().unwrap(),
            &counts,
            &mut assigned,
            &services,
        )
        .await
    }

    #[tokio::test]
    async fn keyless_pipeline_is_open_and_skips_auth_segment() {
        let pipeline = build(spec("a1", "/open/", true)).await;
        assert!(pipeline.open);
        assert!(!pipeline.skip);
        assert!(pipeline.rate_limit_path.is_empty());
        let names = pipeline.stage_names();
        assert!(names.contains(&"RateCheck"));
        assert!(names.contains(&"VersionCheck"));
        assert!(!names.contains(&"AuthKey"));
        assert!(!names.contains(&"KeyExpired"));
        assert!(!names.contains(&"RateLimitAndQuota"));
    }

    #[tokio::test]
    async fn authenticated_pipeline_gets_token_auth_and_subchain() {
        let pipeline = build(spec("a2", "/secure/", false)).await;
        assert!(!pipeline.open);
        assert_eq!(pipeline.rate_limit_path, "/secure/tyk/rate-limits/");
        assert_eq!(pipeline.listen_on, "/secure/{rest:.*}");

        let names = pipeline.stage_names();
        // fixed relative order of the authenticated segment
        let auth = names.iter().position(|n| *n == "AuthKey").unwrap();
        let expired = names.iter().position(|n| *n == "KeyExpired").unwrap();
        let rights = names.iter().position(|n| *n == "AccessRights").unwrap();
        let granular = names.iter().position(|n| *n == "GranularAccess").unwrap();
        let limits = names.iter().position(|n| *n == "RateLimitAndQuota").unwrap();
        assert!(auth < expired && expired < rights && rights < granular && granular < limits);

        let sub = pipeline.rate_limit_stage_names();
        assert_eq!(
            sub,
            vec!["VersionCheck", "AuthKey", "KeyExpired", "AccessRights"]
        );
    }

    #[tokio::test]
    async fn invalid_listen_path_marks_skip() {
        let pipeline = build(spec("a3", "/bad path/", false)).await;
        assert!(pipeline.skip);

        let pipeline = build(spec("a4", "", false)).await;
        assert!(pipeline.skip);
    }

    #[tokio::test]
    async fn internal_specs_compile_but_skip_mounting() {
        let mut internal = spec("a5", "/internal/", true);
        internal.internal = true;
        let pipeline = build(internal).await;
        assert!(pipeline.skip);
        // the chain still exists for loop dispatch
        assert!(!pipeline.stage_names().is_empty());
    }

    #[tokio::test]
    async fn listen_path_collisions_are_resolved_uniquely() {
        let services = services();
        let specs = vec![
            spec("id1", "/foo/", true),
            spec("id2", "/foo/", true),
            spec("id3", "/foo/", true),
        ];
        let counts = count_apis_by_listen_hash(&specs);
        let mut assigned = HashSet::new();

        let mut paths = Vec::new();
        for s in specs {
            let pipeline = process_spec(s, &counts, &mut assigned, &services).await;
            paths.push(pipeline.spec.proxy.listen_path.clone());
        }

        // first claimant keeps the path, the rest get unique suffixes
        assert_eq!(paths[0], "/foo/");
        assert_eq!(paths[1], "/foo/-id2");
        assert_eq!(paths[2], "/foo/-id3");
        let distinct: HashSet<_> = paths.iter().collect();
        assert_eq!(distinct.len(), 3);
    }

    #[tokio::test]
    async fn same_api_id_collisions_fall_back_to_underscores() {
        let services = services();
        let specs = vec![
            spec("dup", "/foo/", true),
            spec("dup", "/foo/", true),
            spec("dup", "/foo/", true),
        ];
        let counts = count_apis_by_listen_hash(&specs);
        let mut assigned = HashSet::new();

        let mut paths = Vec::new();
        for s in specs {
            let pipeline = process_spec(s, &counts, &mut assigned, &services).await;
            paths.push(pipeline.spec.proxy.listen_path.clone());
        }

        assert_eq!(paths[0], "/foo/");
        assert_eq!(paths[1], "/foo/-dup");
        assert_eq!(paths[2], "/foo/-dup_");
        let distinct: HashSet<_> = paths.iter().collect();
        assert_eq!(distinct.len(), 3);
    }

    #[tokio::test]
    async fn tag_headers_are_lowercased() {
        let mut tagged = spec("a6", "/tags/", true);
        tagged.tag_headers = vec!["X-Team".to_string(), "X-REGION".to_string()];
        let pipeline = build(tagged).await;
        assert_eq!(
            pipeline.spec.tag_headers,
            vec!["x-team".to_string(), "x-region".to_string()]
        );
    }

    #[tokio::test]
    async fn provider_auth_without_validator_is_fatal_for_the_pipeline() {
        let mut jwt_spec = spec("a7", "/jwt/", false);
        jwt_spec.enable_jwt = true;
        // no JWT validator deployed in the default wiring
        let pipeline = build(jwt_spec).await;
        assert!(pipeline.skip);
    }

    #[tokio::test]
    async fn rpc_storage_engine_forces_org_data_age() {
        let services = services();
        assert!(!services.config.get().enforce_org_data_age);

        let mut rpc_spec = spec("a8", "/rpc/", true);
        rpc_spec.auth_provider.storage_engine = RPC_STORAGE_ENGINE.to_string();

        let specs = vec![rpc_spec];
        let counts = count_apis_by_listen_hash(&specs);
        let mut assigned = HashSet::new();
        let _ = process_spec(
            specs.into_iter().next().unwrap(),
            &counts,
            &mut assigned,
            &services,
        )
        .await;

        assert!(services.config.get().enforce_org_data_age);
    }
}
