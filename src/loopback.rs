//! Self-referential ("loop") dispatch
//!
//! The terminal handler recognises `tyk://` URLs as loops back into the
//! gateway: host `self` re-enters the current API, any other host is a fuzzy
//! reference to another API. Recursion is bounded by a per-request counter;
//! targets are resolved through the registry at dispatch time so a pipeline
//! never holds a reference to itself or a stale generation.

use axum::body::Body;
use axum::http::{Method, Request, Response, Uri};
use tracing::debug;

use crate::context::{
    ctx_get_orig_request_uri, ctx_inc_loop_level, ctx_loop_level, ctx_loop_level_limit, ctx_mut,
    ctx_set_check_loop_limits, ctx_set_orig_request_uri,
};
use crate::errors::GatewayError;
use crate::middleware::{error_response, query_pairs};
use crate::pipeline::Pipeline;
use crate::registry::Registry;

/// URL scheme marking a self-loop
pub const LOOP_SCHEME: &str = "tyk";

/// Loop depth cap when the request does not carry `loop_limit`
pub const DEFAULT_LOOP_LEVEL_LIMIT: u32 = 5;

/// Check whether the request is a loop, failing when it is one level too deep
pub fn is_loop(req: &Request<Body>) -> Result<bool, GatewayError> {
    if req.uri().scheme_str() != Some(LOOP_SCHEME) {
        return Ok(false);
    }
    let mut limit = ctx_loop_level_limit(req);
    if limit == 0 {
        limit = DEFAULT_LOOP_LEVEL_LIMIT;
    }
    // the limit is the number of dispatches a request may consume
    if ctx_loop_level(req) >= limit {
        return Err(GatewayError::LoopTooDeep(limit));
    }
    Ok(true)
}

/// Terminal handler: loop back into the gateway or forward upstream
pub async fn serve_terminal(
    pipeline: &Pipeline,
    registry: &Registry,
    mut req: Request<Body>,
) -> Response<Body> {
    match is_loop(&req) {
        Ok(false) => pipeline.success(req).await,
        Err(e) => error_response(e.status(), &e.to_string()),
        Ok(true) => {
            let host = req.uri().host().unwrap_or("").to_string();

            let target = if host == "self" {
                registry.get_by_id(&pipeline.spec.api_id)
            } else {
                // crossing into another API invalidates the resolved version
                ctx_mut(&mut req).version_name = None;
                registry.fuzzy_find(&host)
            };
            let target = match target {
                Some(t) => t,
                None => {
                    let e = GatewayError::LoopUnknownTarget;
                    return error_response(e.status(), &e.to_string());
                }
            };

            let pairs = query_pairs(req.uri());
            let lookup = |key: &str| {
                pairs
                    .iter()
                    .find(|(k, _)| k == key)
                    .map(|(_, v)| v.clone())
            };

            if let Some(method) = lookup("method") {
                if let Ok(method) = method.parse::<Method>() {
                    *req.method_mut() = method;
                }
            }
            // parse failures leave the limit at 0, meaning "use the default"
            let loop_limit = lookup("loop_limit")
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or(0);
            let check_limits = lookup("check_limits").as_deref() == Some("true");
            ctx_set_check_loop_limits(&mut req, check_limits);

            let orig = ctx_get_orig_request_uri(&req);
            let rewritten = rewrite_loop_uri(req.uri(), orig.as_ref());
            *req.uri_mut() = rewritten;
            ctx_set_orig_request_uri(&mut req, None);

            ctx_inc_loop_level(&mut req, loop_limit);
            debug!(
                target = %target.spec.api_id,
                level = ctx_loop_level(&req),
                "Loop dispatch"
            );

            // recursion bottoms out at the loop depth limit
            Box::pin(target.handle(registry, req)).await
        }
    }
}

/// Rewrite a `tyk://` URI for re-entry: scheme becomes `http`, and the host
/// and raw query stashed on gateway entry are restored.
fn rewrite_loop_uri(current: &Uri, orig: Option<&Uri>) -> Uri {
    let path = current.path();
    let query = orig
        .and_then(Uri::query)
        .or_else(|| current.query());
    let authority = orig
        .and_then(|u| u.authority().map(|a| a.as_str()))
        .or_else(|| current.authority().map(|a| a.as_str()));

    let path_and_query = match query {
        Some(q) if !q.is_empty() => format!("{path}?{q}"),
        _ => path.to_string(),
    };

    let mut builder = Uri::builder().scheme("http");
    if let Some(authority) = authority {
        builder = builder.authority(authority);
    }
    builder
        .path_and_query(path_and_query)
        .build()
        .unwrap_or_else(|_| current.clone())
}
