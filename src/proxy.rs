//! Upstream proxying
//!
//! The terminal handler of every pipeline: forwards the (by now fully
//! processed) request to the spec's upstream target over a shared pooled
//! client. Multi-target proxying routes per resolved version when any
//! version overrides the upstream URL.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tracing::{debug, warn};

use crate::config::UpstreamConfig;
use crate::context;

/// Pooled client shared by every pipeline
pub type ProxyClient = Client<HttpConnector, Body>;

pub fn build_proxy_client(config: &UpstreamConfig) -> ProxyClient {
    Client::builder(TokioExecutor::new())
        .pool_max_idle_per_host(config.max_idle_per_host)
        .pool_idle_timeout(Duration::from_secs(config.idle_timeout_secs))
        .build_http()
}

/// Terminal request handler a pipeline forwards into
#[async_trait]
pub trait UpstreamHandler: Send + Sync {
    async fn serve(&self, req: Request<Body>) -> Response<Body>;
}

/// Reverse proxy onto a single upstream base URL
pub struct SingleHostProxy {
    target: Uri,
    listen_path: String,
    strip_listen_path: bool,
    client: ProxyClient,
    timeout: Duration,
}

impl SingleHostProxy {
    pub fn new(
        target: Uri,
        listen_path: String,
        strip_listen_path: bool,
        client: ProxyClient,
        timeout: Duration,
    ) -> Self {
        Self {
            target,
            listen_path,
            strip_listen_path,
            client,
            timeout,
        }
    }

    /// Rebase the request URI onto the upstream target
    fn upstream_uri(&self, req_uri: &Uri) -> anyhow::Result<Uri> {
        let mut path = req_uri.path().to_string();
        if self.strip_listen_path && path.starts_with(&self.listen_path) {
            let rest = path[self.listen_path.len()..].trim_start_matches('/');
            path = format!("/{rest}");
        }

        let base_path = self.target.path().trim_end_matches('/');
        let path_and_query = match req_uri.query() {
            Some(q) => format!("{base_path}{path}?{q}"),
            None => format!("{base_path}{path}"),
        };

        let mut builder = Uri::builder();
        if let Some(scheme) = self.target.scheme() {
            builder = builder.scheme(scheme.clone());
        }
        if let Some(authority) = self.target.authority() {
            builder = builder.authority(authority.clone());
        }
        Ok(builder.path_and_query(path_and_query).build()?)
    }

    async fn forward(&self, mut req: Request<Body>) -> Response<Body> {
        let upstream = match self.upstream_uri(req.uri()) {
            Ok(uri) => uri,
            Err(e) => {
                warn!("Failed to build upstream URI: {}", e);
                return bad_gateway("upstream URI invalid");
            }
        };

        debug!(%upstream, "Proxying upstream");
        *req.uri_mut() = upstream;

        // upstream sees its own host, not the gateway's
        if let Some(authority) = self.target.authority() {
            if let Ok(value) = authority.as_str().parse() {
                req.headers_mut().insert(header::HOST, value);
            }
        }

        match tokio::time::timeout(self.timeout, self.client.request(req)).await {
            Ok(Ok(response)) => response.map(Body::new),
            Ok(Err(e)) => {
                warn!("Upstream request failed: {}", e);
                bad_gateway("upstream request failed")
            }
            Err(_) => {
                warn!("Upstream request timed out after {:?}", self.timeout);
                gateway_timeout()
            }
        }
    }
}

#[async_trait]
impl UpstreamHandler for SingleHostProxy {
    async fn serve(&self, req: Request<Body>) -> Response<Body> {
        self.forward(req).await
    }
}

/// Version-aware proxy: any version with an upstream override routes there,
/// everything else falls through to the default target.
pub struct MultiTargetProxy {
    default: SingleHostProxy,
    version_targets: HashMap<String, SingleHostProxy>,
}

impl MultiTargetProxy {
    pub fn new(
        default: SingleHostProxy,
        version_targets: HashMap<String, SingleHostProxy>,
    ) -> Self {
        Self {
            default,
            version_targets,
        }
    }
}

#[async_trait]
impl UpstreamHandler for MultiTargetProxy {
    async fn serve(&self, req: Request<Body>) -> Response<Body> {
        let version = context::ctx(&req).and_then(|c| c.version_name.clone());
        let proxy = version
            .as_deref()
            .and_then(|v| self.version_targets.get(v))
            .unwrap_or(&self.default);
        proxy.serve(req).await
    }
}

/// Upstream that answers from memory; used by loop-only internal APIs with
/// no real upstream and by tests.
pub struct StaticUpstream {
    pub status: StatusCode,
    pub body: &'static str,
    pub hits: Arc<std::sync::atomic::AtomicUsize>,
}

impl StaticUpstream {
    pub fn new(status: StatusCode, body: &'static str) -> Self {
        Self {
            status,
            body,
            hits: Arc::new(std::sync::atomic::AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl UpstreamHandler for StaticUpstream {
    async fn serve(&self, _req: Request<Body>) -> Response<Body> {
        self.hits
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Response::builder()
            .status(self.status)
            .body(Body::from(self.body))
            .expect("static upstream response")
    }
}

fn bad_gateway(message: &str) -> Response<Body> {
    json_error(StatusCode::BAD_GATEWAY, message)
}

fn gateway_timeout() -> Response<Body> {
    json_error(StatusCode::GATEWAY_TIMEOUT, "upstream timed out")
}

fn json_error(status: StatusCode, message: &str) -> Response<Body> {
    let body = serde_json::json!({ "error": message }).to_string();
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .expect("error response")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proxy(target: &str, listen_path: &str, strip: bool) -> SingleHostProxy {
        SingleHostProxy::new(
            target.parse().unwrap(),
            listen_path.to_string(),
            strip,
            build_proxy_client(&UpstreamConfig::default()),
            Duration::from_secs(5),
        )
    }

    #[test]
    fn upstream_uri_strips_listen_path() {
        let p = proxy("http://backend:8000", "/payments/", true);
        let uri = p
            .upstream_uri(&"/payments/charge?id=5".parse().unwrap())
            .unwrap();
        assert_eq!(uri.to_string(), "http://backend:8000/charge?id=5");
    }

    #[test]
    fn upstream_uri_keeps_listen_path_when_not_stripping() {
        let p = proxy("http://backend:8000", "/payments/", false);
        let uri = p.upstream_uri(&"/payments/charge".parse().unwrap()).unwrap();
        assert_eq!(uri.to_string(), "http://backend:8000/payments/charge");
    }

    #[test]
    fn upstream_uri_respects_target_base_path() {
        let p = proxy("http://backend:8000/api/v1/", "/pay/", true);
        let uri = p.upstream_uri(&"/pay/charge".parse().unwrap()).unwrap();
        assert_eq!(uri.to_string(), "http://backend:8000/api/v1/charge");
    }

    #[tokio::test]
    async fn static_upstream_counts_hits() {
        let upstream = StaticUpstream::new(StatusCode::OK, "upstream reply");
        let hits = upstream.hits.clone();
        let req = Request::builder().uri("/x").body(Body::empty()).unwrap();
        let resp = upstream.serve(req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
