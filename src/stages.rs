//! The concrete pipeline stages
//!
//! Each stage owns one request-processing concern and decides for itself
//! whether it belongs in a given spec's chain. Heavy credential validation
//! (OAuth introspection, JWT/HMAC verification, basic auth) is delegated to
//! injected [`AuthProvider`] collaborators; the stages here own the gateway
//! semantics around them: session commitment, expiry, access rights, rate
//! and quota enforcement.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Method, Request, Response, StatusCode, Uri};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use http_body_util::BodyExt;
use sha2::Sha256;
use tracing::debug;

use crate::apidef::{EndpointMeta, MiddlewareDefinition, VersionInfo};
use crate::context::{
    ctx, ctx_check_loop_limits, ctx_get_session, ctx_mut, ctx_set_session,
};
use crate::errors::GatewayError;
use crate::middleware::{
    error_response, query_pairs, AuthKind, BaseStage, Stage, StageConfig, StageError, StageResult,
    StageVerdict,
};
use crate::plugins::{HookKind, PluginAction};
use crate::policy::apply_policies;
use crate::resolver::ORG_EXPIRY_FALLBACK;
use crate::session::UNLIMITED;

fn forbidden(message: &str) -> StageError {
    StageError::new(StatusCode::FORBIDDEN, message)
}

fn unauthorized(message: &str) -> StageError {
    StageError::new(StatusCode::UNAUTHORIZED, message)
}

// ============================================================================
// EDGE STAGES
// ============================================================================

/// CORS preflight handling; response headers ride on the response processors
pub struct CorsStage {
    pub base: BaseStage,
}

#[async_trait]
impl Stage for CorsStage {
    fn name(&self) -> &'static str {
        "CORS"
    }
    fn base(&self) -> &BaseStage {
        &self.base
    }
    fn enabled(&self) -> bool {
        self.base.spec.cors.enable
    }

    async fn process(&self, req: &mut Request<Body>, _cfg: &StageConfig) -> StageResult {
        if req.method() != Method::OPTIONS {
            return Ok(StageVerdict::Continue);
        }
        let cors = &self.base.spec.cors;
        let mut builder = Response::builder().status(StatusCode::NO_CONTENT);
        if !cors.allowed_origins.is_empty() {
            builder = builder.header(
                header::ACCESS_CONTROL_ALLOW_ORIGIN,
                cors.allowed_origins.join(", "),
            );
        }
        if !cors.allowed_methods.is_empty() {
            builder = builder.header(
                header::ACCESS_CONTROL_ALLOW_METHODS,
                cors.allowed_methods.join(", "),
            );
        }
        if !cors.allowed_headers.is_empty() {
            builder = builder.header(
                header::ACCESS_CONTROL_ALLOW_HEADERS,
                cors.allowed_headers.join(", "),
            );
        }
        let resp = builder.body(Body::empty()).expect("preflight response");
        Ok(StageVerdict::Responded(resp))
    }
}

/// Ticks the gateway-wide throughput counter
pub struct RateCheckStage {
    pub base: BaseStage,
}

#[async_trait]
impl Stage for RateCheckStage {
    fn name(&self) -> &'static str {
        "RateCheck"
    }
    fn base(&self) -> &BaseStage {
        &self.base
    }

    async fn process(&self, _req: &mut Request<Body>, _cfg: &StageConfig) -> StageResult {
        self.base.gw.global_rate.incr(1);
        Ok(StageVerdict::Continue)
    }
}

/// IP allow/deny filtering; the two directions are the same stage with the
/// polarity flipped.
pub struct IpFilterStage {
    pub base: BaseStage,
    pub deny: bool,
}

impl IpFilterStage {
    fn list(&self) -> &[String] {
        if self.deny {
            &self.base.spec.blacklisted_ips
        } else {
            &self.base.spec.allowed_ips
        }
    }

    fn matches(entry: &str, ip: &std::net::IpAddr) -> bool {
        if let Ok(parsed) = entry.parse::<std::net::IpAddr>() {
            return parsed == *ip;
        }
        // textual prefix entries ("10.0." style) cover simple ranges
        entry.ends_with('.') && ip.to_string().starts_with(entry)
    }
}

#[async_trait]
impl Stage for IpFilterStage {
    fn name(&self) -> &'static str {
        if self.deny {
            "IPDenyList"
        } else {
            "IPAllowList"
        }
    }
    fn base(&self) -> &BaseStage {
        &self.base
    }
    fn enabled(&self) -> bool {
        if self.deny {
            self.base.spec.enable_ip_blacklisting && !self.base.spec.blacklisted_ips.is_empty()
        } else {
            self.base.spec.enable_ip_whitelisting && !self.base.spec.allowed_ips.is_empty()
        }
    }

    async fn process(&self, req: &mut Request<Body>, _cfg: &StageConfig) -> StageResult {
        let ip = ctx(req).and_then(|c| c.client_ip);
        let ip = match ip {
            Some(ip) => ip,
            // without a peer address an allow list cannot pass the request
            None if !self.deny => {
                return Err(forbidden("access from this IP has been disallowed"))
            }
            None => return Ok(StageVerdict::Continue),
        };

        let listed = self.list().iter().any(|entry| Self::matches(entry, &ip));
        let blocked = if self.deny { listed } else { !listed };
        if blocked {
            return Err(forbidden("access from this IP has been disallowed"));
        }
        Ok(StageVerdict::Continue)
    }
}

/// Client certificate gate for mutual-TLS APIs; verification itself happens
/// at the TLS edge, the outcome rides on the request context.
pub struct CertCheckStage {
    pub base: BaseStage,
}

#[async_trait]
impl Stage for CertCheckStage {
    fn name(&self) -> &'static str {
        "CertCheck"
    }
    fn base(&self) -> &BaseStage {
        &self.base
    }
    fn enabled(&self) -> bool {
        self.base.spec.use_mutual_tls_auth
    }

    async fn process(&self, req: &mut Request<Body>, _cfg: &StageConfig) -> StageResult {
        match ctx(req).and_then(|c| c.client_cert_verified) {
            Some(true) => Ok(StageVerdict::Continue),
            _ => Err(forbidden("certificate verification failed")),
        }
    }
}

/// Blocks requests for organisations whose data access has expired
pub struct OrgMonitorStage {
    pub base: BaseStage,
}

#[async_trait]
impl Stage for OrgMonitorStage {
    fn name(&self) -> &'static str {
        "OrgMonitor"
    }
    fn base(&self) -> &BaseStage {
        &self.base
    }
    fn enabled(&self) -> bool {
        self.base.config.enforce_org_data_age && !self.base.spec.org_id.is_empty()
    }

    async fn process(&self, _req: &mut Request<Body>, _cfg: &StageConfig) -> StageResult {
        let expiry = self
            .base
            .gw
            .org_expiry
            .org_expiry(&self.base.spec.org_id)
            .await;
        // the fallback answer means "no org record"; only a real timestamp
        // in the past blocks the request
        if expiry > 0 && expiry != ORG_EXPIRY_FALLBACK && Utc::now().timestamp() > expiry {
            return Err(forbidden("organisation access has expired"));
        }
        Ok(StageVerdict::Continue)
    }
}

/// Resolves the request's API version and rejects expired or unknown ones
pub struct VersionCheckStage {
    pub base: BaseStage,
}

impl VersionCheckStage {
    fn requested_version(&self, req: &Request<Body>) -> String {
        let vd = &self.base.spec.version_data;
        if vd.not_versioned {
            return vd.default_version.clone();
        }
        if let Some(v) = req
            .headers()
            .get("x-api-version")
            .and_then(|v| v.to_str().ok())
        {
            return v.to_string();
        }
        if let Some((_, v)) = query_pairs(req.uri()).into_iter().find(|(k, _)| k == "v") {
            return v;
        }
        vd.default_version.clone()
    }

    fn expired(version: &VersionInfo) -> bool {
        if version.expires.is_empty() {
            return false;
        }
        match version.expires.parse::<DateTime<Utc>>() {
            Ok(expiry) => Utc::now() > expiry,
            Err(_) => false,
        }
    }
}

#[async_trait]
impl Stage for VersionCheckStage {
    fn name(&self) -> &'static str {
        "VersionCheck"
    }
    fn base(&self) -> &BaseStage {
        &self.base
    }

    async fn process(&self, req: &mut Request<Body>, _cfg: &StageConfig) -> StageResult {
        let name = self.requested_version(req);
        let version = match self.base.spec.version_data.versions.get(&name) {
            Some(v) => v,
            None => return Err(forbidden("version information not found")),
        };
        if Self::expired(version) {
            return Err(forbidden("this API version has expired"));
        }
        ctx_mut(req).version_name = Some(name);
        Ok(StageVerdict::Continue)
    }
}

/// Caps the request body per the resolved version
pub struct RequestSizeLimitStage {
    pub base: BaseStage,
}

#[async_trait]
impl Stage for RequestSizeLimitStage {
    fn name(&self) -> &'static str {
        "RequestSizeLimit"
    }
    fn base(&self) -> &BaseStage {
        &self.base
    }
    fn enabled(&self) -> bool {
        self.base
            .spec
            .version_data
            .versions
            .values()
            .any(|v| v.size_limit > 0)
    }

    async fn process(&self, req: &mut Request<Body>, _cfg: &StageConfig) -> StageResult {
        let version_name = ctx(req).and_then(|c| c.version_name.clone());
        let limit = version_name
            .as_deref()
            .and_then(|n| self.base.spec.version_data.versions.get(n))
            .map_or(0, |v| v.size_limit);
        if limit == 0 {
            return Ok(StageVerdict::Continue);
        }
        let length = req
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        if length > limit {
            return Err(StageError::new(
                StatusCode::PAYLOAD_TOO_LARGE,
                "request is too large",
            ));
        }
        Ok(StageVerdict::Continue)
    }
}

/// Captures request metadata for downstream transforms
pub struct ContextVarsStage {
    pub base: BaseStage,
}

#[async_trait]
impl Stage for ContextVarsStage {
    fn name(&self) -> &'static str {
        "ContextVars"
    }
    fn base(&self) -> &BaseStage {
        &self.base
    }
    fn enabled(&self) -> bool {
        self.base.spec.enable_context_vars
    }

    async fn process(&self, req: &mut Request<Body>, _cfg: &StageConfig) -> StageResult {
        let method = req.method().to_string();
        let path = req.uri().path().to_string();
        let remote = ctx(req)
            .and_then(|c| c.client_ip)
            .map(|ip| ip.to_string())
            .unwrap_or_default();
        let vars = &mut ctx_mut(req).context_vars;
        vars.insert("request_method".to_string(), method);
        vars.insert("request_path".to_string(), path);
        vars.insert("remote_addr".to_string(), remote);
        Ok(StageVerdict::Continue)
    }
}

/// Marks endpoints that are explicitly tracked for analytics
pub struct TrackEndpointStage {
    pub base: BaseStage,
}

#[async_trait]
impl Stage for TrackEndpointStage {
    fn name(&self) -> &'static str {
        "TrackEndpoint"
    }
    fn base(&self) -> &BaseStage {
        &self.base
    }
    fn enabled(&self) -> bool {
        !self.base.spec.do_not_track
            && self
                .base
                .spec
                .version_data
                .versions
                .values()
                .any(|v| !v.extended_paths.track_endpoints.is_empty())
    }

    async fn process(&self, req: &mut Request<Body>, _cfg: &StageConfig) -> StageResult {
        let path = req.uri().path().to_string();
        let tracked = self
            .base
            .spec
            .version_data
            .versions
            .values()
            .flat_map(|v| &v.extended_paths.track_endpoints)
            .any(|meta| path.starts_with(&meta.path));
        if tracked {
            ctx_mut(req)
                .context_vars
                .insert("tracked_path".to_string(), path);
        }
        Ok(StageVerdict::Continue)
    }
}

// ============================================================================
// AUTH STAGES
// ============================================================================

/// Auth method backed by an injected credential validator
pub struct ProviderAuthStage {
    pub base: BaseStage,
    pub kind: AuthKind,
}

#[async_trait]
impl Stage for ProviderAuthStage {
    fn name(&self) -> &'static str {
        match self.kind {
            AuthKind::OAuth2 => "Oauth2KeyExists",
            AuthKind::Basic => "BasicAuthKeyIsValid",
            AuthKind::Hmac => "HMACCheck",
            AuthKind::Jwt => "JWTCheck",
            AuthKind::OpenId => "OpenIDCheck",
        }
    }
    fn base(&self) -> &BaseStage {
        &self.base
    }
    fn enabled(&self) -> bool {
        let spec = &self.base.spec;
        match self.kind {
            AuthKind::OAuth2 => spec.use_oauth2,
            AuthKind::Basic => spec.use_basic_auth,
            AuthKind::Hmac => spec.enable_signature_checking,
            AuthKind::Jwt => spec.enable_jwt,
            AuthKind::OpenId => spec.use_openid,
        }
    }

    /// The validator must be deployed for the method the spec enables
    fn config(&self) -> Result<StageConfig, GatewayError> {
        if self.base.gw.auth_providers.contains_key(&self.kind) {
            Ok(StageConfig::none())
        } else {
            Err(GatewayError::ConfigLoad(format!(
                "no credential validator deployed for {}",
                self.kind.as_str()
            )))
        }
    }

    async fn process(&self, req: &mut Request<Body>, _cfg: &StageConfig) -> StageResult {
        let provider = self
            .base
            .gw
            .auth_providers
            .get(&self.kind)
            .expect("provider presence vetted at build time");

        let (mut session, token) = provider.authenticate(req, &self.base.spec).await?;
        if apply_policies(
            &mut session,
            Some(self.base.spec.org_id.as_str()).filter(|o| !o.is_empty()),
            &self.base.gw.policies,
        )
        .is_err()
        {
            return Err(forbidden("access to this API has been disallowed"));
        }
        ctx_set_session(req, session, &token, false);
        Ok(StageVerdict::Continue)
    }
}

/// Custom auth hook dispatched through the plugin runtime
pub struct PluginAuthStage {
    pub base: BaseStage,
    pub definition: MiddlewareDefinition,
}

#[async_trait]
impl Stage for PluginAuthStage {
    fn name(&self) -> &'static str {
        "CustomPluginAuth"
    }
    fn base(&self) -> &BaseStage {
        &self.base
    }
    fn enabled(&self) -> bool {
        self.base.spec.enable_plugin_auth
            && !self.definition.is_empty()
            && self.base.gw.plugin_runtime.is_some()
    }
    fn owns_error_response(&self) -> bool {
        self.base.spec.custom_middleware.driver == crate::apidef::MiddlewareDriver::Native
    }

    async fn process(&self, req: &mut Request<Body>, _cfg: &StageConfig) -> StageResult {
        let runtime = self
            .base
            .gw
            .plugin_runtime
            .as_ref()
            .expect("runtime presence vetted by enabled()");

        let action = runtime
            .dispatch(
                self.base.spec.custom_middleware.driver,
                HookKind::CustomAuth,
                &self.definition,
                req,
            )
            .await
            .map_err(|e| StageError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

        match action {
            PluginAction::Continue => {
                // the hook is responsible for committing a session
                if ctx_get_session(req).is_none() {
                    return Err(forbidden("access to this API has been disallowed"));
                }
                Ok(StageVerdict::Continue)
            }
            PluginAction::Responded { status, body } => {
                let status =
                    StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                Ok(StageVerdict::Responded(
                    Response::builder()
                        .status(status)
                        .body(Body::from(body))
                        .expect("plugin response"),
                ))
            }
            PluginAction::Abort { status, message } => Err(StageError::new(
                StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                message,
            )),
        }
    }
}

/// Standard token auth: extract the credential and resolve its session
pub struct AuthKeyStage {
    pub base: BaseStage,
}

impl AuthKeyStage {
    fn extract_token(&self, req: &Request<Body>) -> Option<String> {
        let auth = &self.base.spec.auth;
        let header_name = self.base.spec.auth_header_name().to_string();

        if let Some(value) = req
            .headers()
            .get(&header_name)
            .and_then(|v| v.to_str().ok())
        {
            let value = value.strip_prefix("Bearer ").unwrap_or(value).trim();
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }

        if auth.use_param {
            let param = if auth.param_name.is_empty() {
                &header_name
            } else {
                &auth.param_name
            };
            if let Some((_, v)) = query_pairs(req.uri())
                .into_iter()
                .find(|(k, _)| k == param)
            {
                return Some(v);
            }
        }

        if auth.use_cookie {
            let cookie_name = if auth.cookie_name.is_empty() {
                &header_name
            } else {
                &auth.cookie_name
            };
            if let Some(cookies) = req.headers().get(header::COOKIE).and_then(|v| v.to_str().ok())
            {
                for pair in cookies.split(';') {
                    if let Some((name, value)) = pair.trim().split_once('=') {
                        if name == cookie_name {
                            return Some(value.to_string());
                        }
                    }
                }
            }
        }

        None
    }
}

#[async_trait]
impl Stage for AuthKeyStage {
    fn name(&self) -> &'static str {
        "AuthKey"
    }
    fn base(&self) -> &BaseStage {
        &self.base
    }

    async fn process(&self, req: &mut Request<Body>, _cfg: &StageConfig) -> StageResult {
        let token = match self.extract_token(req) {
            Some(t) => t,
            None => return Err(unauthorized("authorization field missing")),
        };

        let mut rc = ctx_mut(req).clone();
        let (session, found) = self.base.svc.resolver.resolve(&token, &mut rc).await;
        *ctx_mut(req) = rc;

        if !found {
            return Err(forbidden("access to this API has been disallowed"));
        }

        debug!("Session found for key");
        ctx_set_session(req, session, &token, false);
        Ok(StageVerdict::Continue)
    }
}

/// Removes the credential before the request reaches the upstream
pub struct StripAuthStage {
    pub base: BaseStage,
}

#[async_trait]
impl Stage for StripAuthStage {
    fn name(&self) -> &'static str {
        "StripAuth"
    }
    fn base(&self) -> &BaseStage {
        &self.base
    }
    fn enabled(&self) -> bool {
        self.base.spec.strip_auth_data
    }

    async fn process(&self, req: &mut Request<Body>, _cfg: &StageConfig) -> StageResult {
        let header_name = self.base.spec.auth_header_name().to_string();
        req.headers_mut().remove(&header_name);

        let auth = &self.base.spec.auth;
        if auth.use_param {
            let param = if auth.param_name.is_empty() {
                header_name.clone()
            } else {
                auth.param_name.clone()
            };
            let remaining: Vec<(String, String)> = query_pairs(req.uri())
                .into_iter()
                .filter(|(k, _)| *k != param)
                .collect();
            let query: String = form_urlencoded::Serializer::new(String::new())
                .extend_pairs(remaining)
                .finish();
            let path = req.uri().path();
            let path_and_query = if query.is_empty() {
                path.to_string()
            } else {
                format!("{path}?{query}")
            };
            if let Ok(uri) = path_and_query.parse::<Uri>() {
                *req.uri_mut() = uri;
            }
        }
        Ok(StageVerdict::Continue)
    }
}

/// Rejects inactive and expired credentials
pub struct KeyExpiredStage {
    pub base: BaseStage,
}

#[async_trait]
impl Stage for KeyExpiredStage {
    fn name(&self) -> &'static str {
        "KeyExpired"
    }
    fn base(&self) -> &BaseStage {
        &self.base
    }

    async fn process(&self, req: &mut Request<Body>, _cfg: &StageConfig) -> StageResult {
        let session = match ctx_get_session(req) {
            Some(s) => s,
            None => return Err(unauthorized("session state is missing or unset")),
        };
        if session.is_inactive {
            return Err(forbidden("key is inactive, please renew"));
        }
        if session.expires > 0 && session.expires < Utc::now().timestamp() {
            return Err(unauthorized("key has expired, please renew"));
        }
        Ok(StageVerdict::Continue)
    }
}

/// Checks the session's access-rights map grants this API (and version)
pub struct AccessRightsStage {
    pub base: BaseStage,
}

#[async_trait]
impl Stage for AccessRightsStage {
    fn name(&self) -> &'static str {
        "AccessRights"
    }
    fn base(&self) -> &BaseStage {
        &self.base
    }

    async fn process(&self, req: &mut Request<Body>, _cfg: &StageConfig) -> StageResult {
        let session = match ctx_get_session(req) {
            Some(s) => s,
            None => return Err(unauthorized("session state is missing or unset")),
        };
        // an empty rights map is an unscoped key
        if session.access_rights.is_empty() {
            return Ok(StageVerdict::Continue);
        }
        let right = match session.access_rights.get(&self.base.spec.api_id) {
            Some(r) => r,
            None => return Err(forbidden("access to this API has been disallowed")),
        };
        if !right.versions.is_empty() {
            if let Some(version) = ctx(req).and_then(|c| c.version_name.as_deref()) {
                if !right.versions.iter().any(|v| v == version) {
                    return Err(forbidden("access to this API has been disallowed"));
                }
            }
        }
        Ok(StageVerdict::Continue)
    }
}

/// Enforces per-URL method grants when the session carries them
pub struct GranularAccessStage {
    pub base: BaseStage,
}

#[async_trait]
impl Stage for GranularAccessStage {
    fn name(&self) -> &'static str {
        "GranularAccess"
    }
    fn base(&self) -> &BaseStage {
        &self.base
    }

    async fn process(&self, req: &mut Request<Body>, _cfg: &StageConfig) -> StageResult {
        let session = match ctx_get_session(req) {
            Some(s) => s,
            None => return Err(unauthorized("session state is missing or unset")),
        };
        let urls = match session.access_rights.get(&self.base.spec.api_id) {
            Some(right) if !right.allowed_urls.is_empty() => &right.allowed_urls,
            _ => return Ok(StageVerdict::Continue),
        };

        let path = req.uri().path();
        let method = req.method().as_str();
        let allowed = urls.iter().any(|spec| {
            path.starts_with(spec.url.trim_end_matches('$'))
                && spec.methods.iter().any(|m| m == method)
        });
        if !allowed {
            return Err(forbidden("access to this resource has been disallowed"));
        }
        Ok(StageVerdict::Continue)
    }
}

/// Session-scoped rate and quota enforcement.
///
/// The allowance scope on the API's access entry owns the counters when
/// several policies attribute limits to different APIs.
pub struct RateLimitAndQuotaStage {
    pub base: BaseStage,
}

#[async_trait]
impl Stage for RateLimitAndQuotaStage {
    fn name(&self) -> &'static str {
        "RateLimitAndQuota"
    }
    fn base(&self) -> &BaseStage {
        &self.base
    }
    fn enabled(&self) -> bool {
        !(self.base.spec.disable_rate_limit && self.base.spec.disable_quota)
    }

    async fn process(&self, req: &mut Request<Body>, _cfg: &StageConfig) -> StageResult {
        if !ctx_check_loop_limits(req) {
            return Ok(StageVerdict::Continue);
        }

        let session = match ctx_get_session(req) {
            Some(s) => s.clone(),
            None => return Err(unauthorized("session state is missing or unset")),
        };

        let spec = &self.base.spec;
        let right = session.access_rights.get(&spec.api_id);
        let limit = right.and_then(|r| r.limit.clone()).unwrap_or_default();
        let (rate, per, quota_max) = if limit.rate != 0.0 || limit.quota_max != 0 {
            (limit.rate, limit.per, limit.quota_max)
        } else {
            (session.rate, session.per, session.quota_max)
        };

        let scope = right
            .map(|r| r.allowance_scope.as_str())
            .filter(|s| !s.is_empty())
            .unwrap_or(&spec.api_id);
        let counter_key = format!("{}.{}", session.key_hash(), scope);

        if !spec.disable_rate_limit
            && rate != UNLIMITED as f64
            && !self.base.svc.limiter.allow(&counter_key, rate, per)
        {
            return Err(StageError::new(
                StatusCode::TOO_MANY_REQUESTS,
                "rate limit exceeded",
            ));
        }

        if !spec.disable_quota && quota_max > 0 {
            let used = self
                .base
                .gw
                .stores
                .primary_store
                .incr_key(&format!("quota-{counter_key}"))
                .await;
            if used > quota_max {
                return Err(forbidden("quota exceeded"));
            }
        }

        Ok(StageVerdict::Continue)
    }
}

/// Flat per-API rate limit shared by all consumers
pub struct RateLimitForApiStage {
    pub base: BaseStage,
}

#[async_trait]
impl Stage for RateLimitForApiStage {
    fn name(&self) -> &'static str {
        "RateLimitForAPI"
    }
    fn base(&self) -> &BaseStage {
        &self.base
    }
    fn enabled(&self) -> bool {
        self.base.spec.global_rate_limit.is_enabled()
    }

    async fn process(&self, _req: &mut Request<Body>, _cfg: &StageConfig) -> StageResult {
        let grl = &self.base.spec.global_rate_limit;
        let key = format!("apilimiter.{}", self.base.spec.api_id);
        if !self.base.svc.limiter.allow(&key, grl.rate, grl.per) {
            return Err(StageError::new(
                StatusCode::TOO_MANY_REQUESTS,
                "rate limit exceeded",
            ));
        }
        Ok(StageVerdict::Continue)
    }
}

// ============================================================================
// SHAPING STAGES
// ============================================================================

fn any_version_has(base: &BaseStage, pick: impl Fn(&VersionInfo) -> &Vec<EndpointMeta>) -> bool {
    base.spec
        .version_data
        .versions
        .values()
        .any(|v| !pick(v).is_empty())
}

/// Rejects endpoints whose body must be valid JSON but is not
pub struct ValidateJsonStage {
    pub base: BaseStage,
}

#[async_trait]
impl Stage for ValidateJsonStage {
    fn name(&self) -> &'static str {
        "ValidateJSON"
    }
    fn base(&self) -> &BaseStage {
        &self.base
    }
    fn enabled(&self) -> bool {
        any_version_has(&self.base, |v| &v.extended_paths.validate_json)
    }

    async fn process(&self, req: &mut Request<Body>, _cfg: &StageConfig) -> StageResult {
        let path = req.uri().path().to_string();
        let applies = self
            .base
            .spec
            .version_data
            .versions
            .values()
            .flat_map(|v| &v.extended_paths.validate_json)
            .any(|meta| path.starts_with(&meta.path));
        if !applies {
            return Ok(StageVerdict::Continue);
        }

        let body = std::mem::replace(req.body_mut(), Body::empty());
        let bytes = body
            .collect()
            .await
            .map(|c| c.to_bytes())
            .unwrap_or_default();
        let valid = bytes.is_empty() || serde_json::from_slice::<serde_json::Value>(&bytes).is_ok();
        *req.body_mut() = Body::from(bytes);

        if !valid {
            return Err(StageError::new(
                StatusCode::BAD_REQUEST,
                "request body is not valid JSON",
            ));
        }
        Ok(StageVerdict::Continue)
    }
}

/// The transform family: one stage kind per concern, bodies supplied by the
/// injected transformer collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformKind {
    Body,
    BodyJq,
    Headers,
    UrlRewrite,
    Method,
}

pub struct TransformStage {
    pub base: BaseStage,
    pub kind: TransformKind,
}

#[async_trait]
impl Stage for TransformStage {
    fn name(&self) -> &'static str {
        match self.kind {
            TransformKind::Body => "TransformBody",
            TransformKind::BodyJq => "TransformBodyJQ",
            TransformKind::Headers => "TransformHeaders",
            TransformKind::UrlRewrite => "URLRewrite",
            TransformKind::Method => "TransformMethod",
        }
    }
    fn base(&self) -> &BaseStage {
        &self.base
    }
    fn enabled(&self) -> bool {
        fn pick<'a>(kind: &TransformKind, v: &'a VersionInfo) -> &'a Vec<EndpointMeta> {
            match kind {
                TransformKind::Body => &v.extended_paths.transform,
                TransformKind::BodyJq => &v.extended_paths.transform_jq,
                TransformKind::Headers => &v.extended_paths.transform_headers,
                TransformKind::UrlRewrite => &v.extended_paths.url_rewrites,
                TransformKind::Method => &v.extended_paths.method_transforms,
            }
        }
        self.base
            .spec
            .version_data
            .versions
            .values()
            .any(|v| !pick(&self.kind, v).is_empty())
    }

    async fn process(&self, req: &mut Request<Body>, _cfg: &StageConfig) -> StageResult {
        if let Some(transformer) = &self.base.gw.transformer {
            transformer.transform(self.name(), req, &self.base.spec).await?;
        }
        Ok(StageVerdict::Continue)
    }
}

/// Answers safe requests from the response cache
pub struct CacheStage {
    pub base: BaseStage,
}

impl CacheStage {
    pub fn cache_key(method: &Method, uri: &Uri) -> String {
        format!("{}:{}", method, uri)
    }
}

#[async_trait]
impl Stage for CacheStage {
    fn name(&self) -> &'static str {
        "Cache"
    }
    fn base(&self) -> &BaseStage {
        &self.base
    }
    fn enabled(&self) -> bool {
        self.base.spec.cache_options.enable_cache
    }

    async fn process(&self, req: &mut Request<Body>, _cfg: &StageConfig) -> StageResult {
        let opts = &self.base.spec.cache_options;
        let path = req.uri().path().to_string();
        let cacheable = if opts.cache_all_safe_requests {
            matches!(*req.method(), Method::GET | Method::HEAD | Method::OPTIONS)
        } else {
            *req.method() == Method::GET
                && self
                    .base
                    .spec
                    .version_data
                    .versions
                    .values()
                    .flat_map(|v| &v.extended_paths.cache)
                    .any(|p| path.starts_with(p.as_str()))
        };
        if !cacheable {
            return Ok(StageVerdict::Continue);
        }

        let key = Self::cache_key(req.method(), req.uri());
        if let Some(cached) = self.base.svc.cache_store.get_key(&key).await {
            let resp = Response::builder()
                .status(StatusCode::OK)
                .header("x-gateway-cache", "HIT")
                .body(Body::from(cached))
                .expect("cached response");
            return Ok(StageVerdict::Responded(resp));
        }

        // the response path stores the upstream answer under this key
        ctx_mut(req)
            .context_vars
            .insert("cache_key".to_string(), key);
        Ok(StageVerdict::Continue)
    }
}

/// Script-backed endpoint answering in place of the upstream
pub struct VirtualEndpointStage {
    pub base: BaseStage,
}

#[async_trait]
impl Stage for VirtualEndpointStage {
    fn name(&self) -> &'static str {
        "VirtualEndpoint"
    }
    fn base(&self) -> &BaseStage {
        &self.base
    }
    fn enabled(&self) -> bool {
        self.base.gw.plugin_runtime.is_some()
            && any_version_has(&self.base, |v| &v.extended_paths.virtual_endpoints)
    }

    async fn process(&self, req: &mut Request<Body>, _cfg: &StageConfig) -> StageResult {
        let path = req.uri().path().to_string();
        let target = self
            .base
            .spec
            .version_data
            .versions
            .values()
            .flat_map(|v| &v.extended_paths.virtual_endpoints)
            .find(|meta| path.starts_with(&meta.path))
            .cloned();
        let meta = match target {
            Some(m) => m,
            None => return Ok(StageVerdict::Continue),
        };

        let runtime = self
            .base
            .gw
            .plugin_runtime
            .as_ref()
            .expect("runtime presence vetted by enabled()");
        let definition = MiddlewareDefinition {
            name: meta.path,
            ..Default::default()
        };
        let action = runtime
            .dispatch(
                self.base.spec.custom_middleware.driver,
                HookKind::Virtual,
                &definition,
                req,
            )
            .await
            .map_err(|e| StageError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

        match action {
            PluginAction::Responded { status, body } => Ok(StageVerdict::Responded(
                Response::builder()
                    .status(StatusCode::from_u16(status).unwrap_or(StatusCode::OK))
                    .body(Body::from(body))
                    .expect("virtual endpoint response"),
            )),
            PluginAction::Continue => Ok(StageVerdict::Continue),
            PluginAction::Abort { status, message } => Err(StageError::new(
                StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                message,
            )),
        }
    }
}

/// Signs the upstream request so the backend can verify the gateway sent it
pub struct RequestSigningStage {
    pub base: BaseStage,
}

#[async_trait]
impl Stage for RequestSigningStage {
    fn name(&self) -> &'static str {
        "RequestSigning"
    }
    fn base(&self) -> &BaseStage {
        &self.base
    }
    fn enabled(&self) -> bool {
        let signing = &self.base.spec.request_signing;
        signing.is_enabled && !signing.secret.is_empty()
    }

    async fn process(&self, req: &mut Request<Body>, _cfg: &StageConfig) -> StageResult {
        let signing = &self.base.spec.request_signing;
        let date = Utc::now().to_rfc2822();
        let signing_string = format!(
            "(request-target): {} {}\ndate: {}",
            req.method().as_str().to_lowercase(),
            req.uri().path(),
            date
        );

        let mut mac = Hmac::<Sha256>::new_from_slice(signing.secret.as_bytes())
            .map_err(|_| StageError::new(StatusCode::INTERNAL_SERVER_ERROR, "invalid signing key"))?;
        mac.update(signing_string.as_bytes());
        let signature: String = mac
            .finalize()
            .into_bytes()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect();

        let header_value = format!(
            "Signature keyId=\"{}\",algorithm=\"hmac-sha256\",signature=\"{}\"",
            signing.key_id, signature
        );
        req.headers_mut().insert(
            header::DATE,
            date.parse()
                .map_err(|_| StageError::new(StatusCode::INTERNAL_SERVER_ERROR, "bad date"))?,
        );
        req.headers_mut().insert(
            header::AUTHORIZATION,
            header_value
                .parse()
                .map_err(|_| StageError::new(StatusCode::INTERNAL_SERVER_ERROR, "bad signature"))?,
        );
        Ok(StageVerdict::Continue)
    }
}

// ============================================================================
// PLUGIN HOOK STAGES
// ============================================================================

/// One user-supplied hook at a fixed insertion point
pub struct PluginStage {
    pub base: BaseStage,
    pub hook: HookKind,
    pub definition: MiddlewareDefinition,
}

#[async_trait]
impl Stage for PluginStage {
    fn name(&self) -> &'static str {
        match self.hook {
            HookKind::Pre => "PreHook",
            HookKind::PostAuth => "PostAuthHook",
            HookKind::Post => "PostHook",
            _ => "Hook",
        }
    }
    fn base(&self) -> &BaseStage {
        &self.base
    }
    fn enabled(&self) -> bool {
        !self.definition.is_empty() && self.base.gw.plugin_runtime.is_some()
    }
    fn owns_error_response(&self) -> bool {
        self.base.spec.custom_middleware.driver == crate::apidef::MiddlewareDriver::Native
    }

    async fn process(&self, req: &mut Request<Body>, _cfg: &StageConfig) -> StageResult {
        if self.definition.require_session && ctx_get_session(req).is_none() {
            return Ok(StageVerdict::Continue);
        }

        let runtime = self
            .base
            .gw
            .plugin_runtime
            .as_ref()
            .expect("runtime presence vetted by enabled()");
        let action = runtime
            .dispatch(
                self.base.spec.custom_middleware.driver,
                self.hook,
                &self.definition,
                req,
            )
            .await
            .map_err(|e| StageError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

        match action {
            PluginAction::Continue => Ok(StageVerdict::Continue),
            PluginAction::Responded { status, body } => {
                // the hook signalled it wrote the response; stop the chain
                let status = if status == crate::middleware::STATUS_RESPOND {
                    StatusCode::OK
                } else {
                    StatusCode::from_u16(status).unwrap_or(StatusCode::OK)
                };
                Ok(StageVerdict::Responded(
                    Response::builder()
                        .status(status)
                        .body(Body::from(body))
                        .expect("hook response"),
                ))
            }
            PluginAction::Abort { status, message } => Err(StageError::new(
                StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                message,
            )),
        }
    }
}

/// Serves the per-key rate inspection endpoint at the end of the rate-limit
/// sub-chain.
pub fn user_rates_response(req: &Request<Body>) -> Response<Body> {
    match ctx_get_session(req) {
        Some(session) => {
            let body = serde_json::json!({
                "quota_max": session.quota_max,
                "quota_renews": session.quota_renews,
                "quota_renewal_rate": session.quota_renewal_rate,
                "rate": session.rate,
                "per": session.per,
            })
            .to_string();
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body))
                .expect("rates response")
        }
        None => error_response(StatusCode::FORBIDDEN, "session state is missing or unset"),
    }
}
