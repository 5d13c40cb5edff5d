//! Per-request context
//!
//! State that follows a request through the stage chain: the extracted
//! credential, the resolved session, the scheduled session write-back flag
//! and the loop-dispatch counters. Carried in the request's extensions so
//! every stage and the terminal handler see the same record.

use axum::body::Body;
use axum::http::{Request, Uri};

use crate::session::SessionState;

/// Mutable request-scoped state
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Credential extracted by an auth stage
    pub auth_token: String,
    /// Session resolved for the credential
    pub session: Option<SessionState>,
    /// A post-auth stage must write the session back to the store
    pub update_session: bool,
    /// Current loop-dispatch depth
    pub loop_level: u32,
    /// Loop depth limit carried from the `loop_limit` query parameter
    pub loop_level_limit: u32,
    /// Re-check rate limits when re-entering through a loop
    pub check_loop_limits: bool,
    /// Original request URI stashed on gateway entry, restored on loop dispatch
    pub orig_request_uri: Option<Uri>,
    /// Version resolved by the version-check stage
    pub version_name: Option<String>,
    /// Peer address recorded by the listener
    pub client_ip: Option<std::net::IpAddr>,
    /// Client certificate verification outcome, when mutual TLS terminated
    /// upstream of the gateway supplied one
    pub client_cert_verified: Option<bool>,
    /// Variables captured for downstream transforms
    pub context_vars: std::collections::HashMap<String, String>,
}

/// Fetch the context, inserting a default one on first access
pub fn ctx_mut(req: &mut Request<Body>) -> &mut RequestContext {
    if req.extensions().get::<RequestContext>().is_none() {
        req.extensions_mut().insert(RequestContext::default());
    }
    req.extensions_mut()
        .get_mut::<RequestContext>()
        .expect("request context just inserted")
}

pub fn ctx(req: &Request<Body>) -> Option<&RequestContext> {
    req.extensions().get::<RequestContext>()
}

pub fn ctx_get_session(req: &Request<Body>) -> Option<&SessionState> {
    ctx(req).and_then(|c| c.session.as_ref())
}

pub fn ctx_get_auth_token(req: &Request<Body>) -> Option<&str> {
    ctx(req)
        .map(|c| c.auth_token.as_str())
        .filter(|t| !t.is_empty())
}

/// Record the resolved session and its credential on the request
pub fn ctx_set_session(
    req: &mut Request<Body>,
    session: SessionState,
    token: &str,
    schedule_update: bool,
) {
    let ctx = ctx_mut(req);
    ctx.session = Some(session);
    ctx.auth_token = token.to_string();
    if schedule_update {
        ctx.update_session = true;
    }
}

pub fn ctx_session_update_scheduled(req: &Request<Body>) -> bool {
    ctx(req).is_some_and(|c| c.update_session)
}

pub fn ctx_disable_session_update(req: &mut Request<Body>) {
    ctx_mut(req).update_session = false;
}

pub fn ctx_loop_level(req: &Request<Body>) -> u32 {
    ctx(req).map_or(0, |c| c.loop_level)
}

pub fn ctx_loop_level_limit(req: &Request<Body>) -> u32 {
    ctx(req).map_or(0, |c| c.loop_level_limit)
}

/// Step one level deeper, adopting a new limit when the loop URL carried one
pub fn ctx_inc_loop_level(req: &mut Request<Body>, limit: u32) {
    let ctx = ctx_mut(req);
    ctx.loop_level += 1;
    if limit > 0 {
        ctx.loop_level_limit = limit;
    }
}

pub fn ctx_set_check_loop_limits(req: &mut Request<Body>, check: bool) {
    ctx_mut(req).check_loop_limits = check;
}

pub fn ctx_check_loop_limits(req: &Request<Body>) -> bool {
    // Loop re-entries skip limit enforcement unless explicitly requested
    if ctx_loop_level(req) == 0 {
        return true;
    }
    ctx(req).is_some_and(|c| c.check_loop_limits)
}

pub fn ctx_get_orig_request_uri(req: &Request<Body>) -> Option<Uri> {
    ctx(req).and_then(|c| c.orig_request_uri.clone())
}

pub fn ctx_set_orig_request_uri(req: &mut Request<Body>, uri: Option<Uri>) {
    ctx_mut(req).orig_request_uri = uri;
}
