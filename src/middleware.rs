//! The stage contract and per-stage dispatch
//!
//! Every pipeline stage implements [`Stage`]. The dispatch wrapper
//! ([`run_stage`]) owns the cross-cutting behaviour: the tracing span, the
//! instrumentation timer, the OPTIONS passthrough bypass, error rendering
//! through the JSON envelope, and the scheduled session write-back when a
//! stage terminates the chain with its own response.

use std::any::Any;
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Method, Request, Response, StatusCode, Uri};
use dashmap::DashMap;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use http_body_util::BodyExt;
use tracing::{debug, debug_span, error, Instrument};

use crate::apidef::ApiSpec;
use crate::config::{ConfigManager, GatewayConfig};
use crate::context::{
    ctx_disable_session_update, ctx_get_auth_token, ctx_get_session, ctx_session_update_scheduled,
};
use crate::errors::GatewayError;
use crate::metrics::{GlobalRateCounter, Instrumentation};
use crate::plugins::{BundleLoader, PluginRuntime};
use crate::policy::PolicyStore;
use crate::proxy::ProxyClient;
use crate::resolver::{OrgExpiryCache, SessionResolver};
use crate::session::{SessionCache, SessionState, TtlCache};
use crate::storage::{GeneralStores, SessionManager, StorageHandler};

/// Internal sentinel on the plugin wire contract: the hook wrote the
/// response itself. Mapped to [`StageVerdict::Responded`] immediately; never
/// emitted on the wire.
pub const STATUS_RESPOND: u16 = 666;

/// What a stage decided about the request
pub enum StageVerdict {
    /// Hand over to the next stage
    Continue,
    /// The stage produced the response; skip the remainder of the chain
    Responded(Response<Body>),
}

/// Stage failure surfaced through the error handler
#[derive(Debug)]
pub struct StageError {
    pub status: StatusCode,
    pub message: String,
    /// Plugin stages may have already written their own response
    pub stage_owns_response: bool,
}

impl StageError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            stage_owns_response: false,
        }
    }
}

impl From<GatewayError> for StageError {
    fn from(err: GatewayError) -> Self {
        Self::new(err.status(), err.to_string())
    }
}

pub type StageResult = Result<StageVerdict, StageError>;

/// Opaque per-stage configuration resolved once at build time
#[derive(Clone, Default)]
pub struct StageConfig(Option<Arc<dyn Any + Send + Sync>>);

impl StageConfig {
    pub fn none() -> Self {
        Self(None)
    }

    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Some(Arc::new(value)))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.as_deref().and_then(|v| v.downcast_ref())
    }
}

/// Common contract every pipeline stage implements
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    fn base(&self) -> &BaseStage;

    /// Idempotent one-time setup
    fn init(&self) {}

    /// Static predicate: include this stage in the chain for its spec?
    fn enabled(&self) -> bool {
        true
    }

    /// Resolve the stage's configuration; a failure is fatal for the
    /// pipeline at build time.
    fn config(&self) -> Result<StageConfig, GatewayError> {
        Ok(StageConfig::none())
    }

    async fn process(&self, req: &mut Request<Body>, cfg: &StageConfig) -> StageResult;

    /// Plugin stages write their own error responses
    fn owns_error_response(&self) -> bool {
        false
    }

    /// Span requests are processed under for this stage
    fn logger(&self) -> tracing::Span {
        debug_span!("mw", mw = self.name(), api_id = %self.base().spec.api_id)
    }
}

/// Auth methods that delegate credential validation to a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthKind {
    OAuth2,
    Basic,
    Hmac,
    Jwt,
    OpenId,
}

impl AuthKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AuthKind::OAuth2 => "OAuth",
            AuthKind::Basic => "Basic",
            AuthKind::Hmac => "HMAC",
            AuthKind::Jwt => "JWT",
            AuthKind::OpenId => "OpenID",
        }
    }
}

/// External credential validator for one auth method.
///
/// On success returns the resolved session and the credential it was
/// resolved under; the wrapper commits both to the request context.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn authenticate(
        &self,
        req: &Request<Body>,
        spec: &ApiSpec,
    ) -> Result<(SessionState, String), StageError>;
}

/// External body/header/URL transformer for the transform stage family
#[async_trait]
pub trait RequestTransformer: Send + Sync {
    async fn transform(
        &self,
        kind: &'static str,
        req: &mut Request<Body>,
        spec: &ApiSpec,
    ) -> Result<(), StageError>;
}

/// Named processor applied to the upstream response
#[async_trait]
pub trait ResponseProcessor: Send + Sync {
    fn name(&self) -> &'static str;
    async fn handle_response(
        &self,
        resp: &mut Response<Body>,
        session: Option<&SessionState>,
    ) -> anyhow::Result<()>;
}

/// Process-wide services injected into every pipeline at build time
pub struct GatewayServices {
    pub config: Arc<ConfigManager>,
    pub stores: GeneralStores,
    pub policies: Arc<PolicyStore>,
    pub session_cache: Arc<SessionCache>,
    pub org_expiry: Arc<OrgExpiryCache>,
    pub global_rate: Arc<GlobalRateCounter>,
    pub instrumentation: Arc<Instrumentation>,
    pub http_client: ProxyClient,
    pub plugin_runtime: Option<Arc<dyn PluginRuntime>>,
    pub bundle_loader: Option<Arc<dyn BundleLoader>>,
    pub auth_providers: HashMap<AuthKind, Arc<dyn AuthProvider>>,
    pub transformer: Option<Arc<dyn RequestTransformer>>,
}

impl GatewayServices {
    /// Default wiring over in-process storage
    pub fn with_defaults(config: Arc<ConfigManager>) -> Self {
        let snapshot = config.get();
        let stores = GeneralStores::in_memory();
        let session_cache = Arc::new(TtlCache::new(Duration::from_secs(
            snapshot.local_session_cache.cached_session_timeout,
        )));
        let org_expiry = Arc::new(OrgExpiryCache::new(
            snapshot.clone(),
            Arc::new(SessionManager::new(stores.org_store.clone(), false)),
            Duration::from_secs(60),
        ));
        Self {
            config,
            stores,
            policies: Arc::new(PolicyStore::new()),
            session_cache,
            org_expiry,
            global_rate: Arc::new(GlobalRateCounter::new()),
            instrumentation: Arc::new(Instrumentation::new()),
            http_client: crate::proxy::build_proxy_client(&snapshot.upstream),
            plugin_runtime: None,
            bundle_loader: None,
            auth_providers: HashMap::new(),
            transformer: None,
        }
    }
}

/// Per-spec services the builder binds: the spec's storage wiring, its
/// session resolver and its rate limiter.
pub struct SpecServices {
    pub resolver: SessionResolver,
    pub sessions: Arc<SessionManager>,
    pub cache_store: Arc<dyn StorageHandler>,
    pub limiter: SessionLimiter,
}

/// Spec and services every stage is constructed around
#[derive(Clone)]
pub struct BaseStage {
    pub spec: Arc<ApiSpec>,
    pub config: Arc<GatewayConfig>,
    pub gw: Arc<GatewayServices>,
    pub svc: Arc<SpecServices>,
}

/// Per-key direct rate limiters, materialised lazily per (key, rate, per)
pub struct SessionLimiter {
    limiters: DashMap<String, Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>>,
}

impl Default for SessionLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionLimiter {
    pub fn new() -> Self {
        Self {
            limiters: DashMap::new(),
        }
    }

    /// Check one request against `rate` per `per` seconds for this key.
    /// Non-positive rates are unlimited.
    pub fn allow(&self, key: &str, rate: f64, per: f64) -> bool {
        if rate <= 0.0 || per <= 0.0 {
            return true;
        }
        let cache_key = format!("{key}:{rate}:{per}");
        let limiter = self
            .limiters
            .entry(cache_key)
            .or_insert_with(|| {
                let burst =
                    NonZeroU32::new(rate.ceil() as u32).unwrap_or(NonZeroU32::new(1).unwrap());
                let period = Duration::from_secs_f64(per / rate);
                let quota = Quota::with_period(period)
                    .unwrap_or_else(|| Quota::per_second(NonZeroU32::new(1).unwrap()))
                    .allow_burst(burst);
                Arc::new(RateLimiter::direct(quota))
            })
            .clone();
        limiter.check().is_ok()
    }
}

/// A stage vetted at build time: enabled, initialised, config resolved
pub struct BuiltStage {
    pub stage: Arc<dyn Stage>,
    pub cfg: StageConfig,
}

/// Append the stage to the chain iff it is enabled for its spec. A config
/// failure is fatal for the whole pipeline.
pub fn append_enabled(
    chain: &mut Vec<BuiltStage>,
    stage: Arc<dyn Stage>,
) -> Result<bool, GatewayError> {
    if !stage.enabled() {
        return Ok(false);
    }
    stage.init();
    let cfg = stage.config().map_err(|e| {
        error!(mw = stage.name(), "Middleware configuration load failed");
        e
    })?;
    chain.push(BuiltStage { stage, cfg });
    Ok(true)
}

/// Outcome of dispatching one stage
pub enum StageFlow {
    Continue,
    Done(Response<Body>),
}

/// Dispatch one stage: span, timer, OPTIONS bypass, error rendering and the
/// session write-back side-channel.
pub async fn run_stage(built: &BuiltStage, req: &mut Request<Body>) -> StageFlow {
    let stage = &built.stage;
    let base = stage.base();

    // OPTIONS passthrough skips every stage; the chain falls through to the
    // terminal proxy handler.
    if base.spec.cors.options_passthrough && req.method() == Method::OPTIONS {
        return StageFlow::Continue;
    }

    let span = stage.logger();
    let started = Instant::now();
    debug!(mw = stage.name(), "Started");
    if !base.config.new_relic.app_name.is_empty() {
        debug!(
            app = %base.config.new_relic.app_name,
            segment = stage.name(),
            "APM segment started"
        );
    }

    let result = stage.process(req, &built.cfg).instrument(span).await;
    let elapsed = started.elapsed();

    match result {
        Ok(StageVerdict::Continue) => {
            base.gw.instrumentation.record(stage.name(), elapsed, false);
            debug!(mw = stage.name(), ns = elapsed.as_nanos() as u64, "Finished");
            StageFlow::Continue
        }
        Ok(StageVerdict::Responded(resp)) => {
            base.gw.instrumentation.record(stage.name(), elapsed, false);
            debug!(
                mw = stage.name(),
                code = resp.status().as_u16(),
                ns = elapsed.as_nanos() as u64,
                "Finished"
            );
            // The chain stops here, but a scheduled session write still lands.
            update_request_session(base, req).await;
            StageFlow::Done(resp)
        }
        Err(err) => {
            base.gw.instrumentation.record(stage.name(), elapsed, true);
            debug!(
                mw = stage.name(),
                code = err.status.as_u16(),
                ns = elapsed.as_nanos() as u64,
                "Finished with error: {}",
                err.message
            );
            let resp = if stage.owns_error_response() || err.stage_owns_response {
                Response::builder()
                    .status(err.status)
                    .body(Body::empty())
                    .expect("empty error response")
            } else {
                error_response(err.status, &err.message)
            };
            StageFlow::Done(resp)
        }
    }
}

/// The JSON error envelope every framework-rendered failure uses
pub fn error_response(status: StatusCode, message: &str) -> Response<Body> {
    let body = serde_json::json!({ "error": message }).to_string();
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .expect("error response")
}

/// Flush a scheduled session write-back: store TTL from the session's own
/// lifetime (falling back to the spec's), then write through the local cache
/// unless it is disabled.
pub async fn update_request_session(base: &BaseStage, req: &mut Request<Body>) -> bool {
    let token = match ctx_get_auth_token(req) {
        Some(t) => t.to_string(),
        None => return false,
    };
    let session = match ctx_get_session(req) {
        Some(s) => s.clone(),
        None => return false,
    };
    if !ctx_session_update_scheduled(req) {
        return false;
    }

    let lifetime = session.lifetime(base.spec.session_lifetime);
    if let Err(e) = base
        .svc
        .sessions
        .update_session(&token, &session, lifetime, false)
        .await
    {
        error!("Can't update session: {}", e);
        return false;
    }

    ctx_disable_session_update(req);

    if !base.config.local_session_cache.disable_cached_session_state {
        base.gw
            .session_cache
            .set(session.key_hash().to_string(), session);
    }

    true
}

/// Parse a form body, buffering it so downstream consumers still see the
/// full byte stream.
pub async fn parse_form(req: &mut Request<Body>) -> Vec<(String, String)> {
    let is_form = req
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/x-www-form-urlencoded"));
    if !is_form {
        return Vec::new();
    }

    let body = std::mem::replace(req.body_mut(), Body::empty());
    let bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => bytes::Bytes::new(),
    };
    let pairs = form_urlencoded::parse(&bytes).into_owned().collect();
    // reinstate the buffered body
    *req.body_mut() = Body::from(bytes);
    pairs
}

/// Decoded query pairs of a request URI
pub fn query_pairs(uri: &Uri) -> Vec<(String, String)> {
    uri.query()
        .map(|q| form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_config_downcasts() {
        #[derive(Debug, PartialEq)]
        struct MyCfg {
            limit: u64,
        }
        let cfg = StageConfig::new(MyCfg { limit: 9 });
        assert_eq!(cfg.downcast_ref::<MyCfg>(), Some(&MyCfg { limit: 9 }));
        assert!(cfg.downcast_ref::<String>().is_none());
        assert!(StageConfig::none().downcast_ref::<MyCfg>().is_none());
    }

    #[test]
    fn session_limiter_allows_within_rate() {
        let limiter = SessionLimiter::new();
        // burst of 5 per second
        assert!(limiter.allow("k", 5.0, 1.0));
        assert!(limiter.allow("k", 5.0, 1.0));
        assert!(limiter.allow("k", 5.0, 1.0));
        assert!(limiter.allow("k", 5.0, 1.0));
        assert!(limiter.allow("k", 5.0, 1.0));
        assert!(!limiter.allow("k", 5.0, 1.0));
        // a different key has its own budget
        assert!(limiter.allow("other", 5.0, 1.0));
    }

    #[test]
    fn session_limiter_treats_nonpositive_as_unlimited() {
        let limiter = SessionLimiter::new();
        for _ in 0..1000 {
            assert!(limiter.allow("k", -1.0, 1.0));
            assert!(limiter.allow("k", 0.0, 0.0));
        }
    }

    #[tokio::test]
    async fn parse_form_reinstates_body() {
        let mut req = Request::builder()
            .method(Method::POST)
            .uri("/submit")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from("a=1&b=two%20words"))
            .unwrap();

        let pairs = parse_form(&mut req).await;
        assert_eq!(
            pairs,
            vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "two words".to_string())
            ]
        );

        // the body is still fully readable afterwards
        let body = std::mem::replace(req.body_mut(), Body::empty());
        let bytes = body.collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"a=1&b=two%20words");
    }

    #[tokio::test]
    async fn parse_form_ignores_other_content_types() {
        let mut req = Request::builder()
            .method(Method::POST)
            .uri("/submit")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{}"))
            .unwrap();
        assert!(parse_form(&mut req).await.is_empty());
    }

    #[test]
    fn query_pairs_decode() {
        let uri: Uri = "/x?method=POST&loop_limit=3&check_limits=true"
            .parse()
            .unwrap();
        let pairs = query_pairs(&uri);
        assert!(pairs.contains(&("method".to_string(), "POST".to_string())));
        assert!(pairs.contains(&("loop_limit".to_string(), "3".to_string())));
    }

    #[test]
    fn error_envelope_is_json() {
        let resp = error_response(StatusCode::FORBIDDEN, "Access to this API has been disallowed");
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
    }
}
