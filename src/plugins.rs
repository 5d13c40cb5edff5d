//! Custom middleware plugins
//!
//! Three mutually exclusive execution drivers exist for user-supplied hooks:
//! an embedded script VM, out-of-process dispatch, and in-process native
//! plugins. The runtime itself is an external collaborator behind
//! [`PluginRuntime`]; this module owns hook resolution (inline spec hooks
//! merged with a loaded bundle) and the wire contract for hook outcomes.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::Request;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use crate::apidef::{ApiSpec, CustomMiddleware, MiddlewareDefinition, MiddlewareDriver};

/// Insertion points a hook can attach to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    Pre,
    PostAuth,
    Post,
    Response,
    CustomAuth,
    /// Script-backed endpoint that answers in place of the upstream
    Virtual,
}

impl HookKind {
    pub fn as_str(self) -> &'static str {
        match self {
            HookKind::Pre => "pre",
            HookKind::PostAuth => "post_key_auth",
            HookKind::Post => "post",
            HookKind::Response => "response",
            HookKind::CustomAuth => "auth_check",
            HookKind::Virtual => "virtual",
        }
    }
}

/// Hook outcome on the plugin wire contract.
///
/// A hook that wrote the response itself reports the internal sentinel
/// status; the plugin stage maps it to a terminal verdict and it never
/// reaches the wire.
#[derive(Debug)]
pub enum PluginAction {
    /// Carry on down the chain
    Continue,
    /// The hook produced the full response
    Responded { status: u16, body: Vec<u8> },
    /// Abort with an error surfaced through the error handler
    Abort { status: u16, message: String },
}

/// External plugin execution runtime
#[async_trait]
pub trait PluginRuntime: Send + Sync {
    async fn dispatch(
        &self,
        driver: MiddlewareDriver,
        hook: HookKind,
        definition: &MiddlewareDefinition,
        req: &mut Request<Body>,
    ) -> anyhow::Result<PluginAction>;

    /// Run a response hook against the upstream answer
    async fn dispatch_response(
        &self,
        _driver: MiddlewareDriver,
        _definition: &MiddlewareDefinition,
        _resp: &mut axum::http::Response<Body>,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// External bundle fetcher/unpacker
#[async_trait]
pub trait BundleLoader: Send + Sync {
    /// Fetch and unpack the spec's bundle, returning its hook manifest
    async fn load(&self, spec: &ApiSpec) -> anyhow::Result<CustomMiddleware>;
}

/// On-disk location for an unpacked bundle: `<middleware_path>/bundles/<api_id>_<hash>`
pub fn bundle_path(middleware_path: &Path, api_id: &str, bundle_name: &str) -> PathBuf {
    let digest = Sha256::digest(bundle_name.as_bytes());
    let short: String = digest[..8].iter().map(|b| format!("{b:02x}")).collect();
    middleware_path
        .join("bundles")
        .join(format!("{api_id}_{short}"))
}

/// Hooks resolved for one spec: inline definitions merged with the bundle's
/// manifest when one is referenced.
pub async fn load_custom_middleware(
    spec: &ApiSpec,
    bundle_loader: Option<&dyn BundleLoader>,
) -> CustomMiddleware {
    let mut hooks = spec.custom_middleware.clone();

    if !spec.custom_middleware_bundle.is_empty() {
        match bundle_loader {
            Some(loader) => match loader.load(spec).await {
                Ok(bundle) => {
                    hooks.pre.extend(bundle.pre);
                    hooks.post.extend(bundle.post);
                    hooks.post_key_auth.extend(bundle.post_key_auth);
                    hooks.response.extend(bundle.response);
                    if hooks.auth_check.is_empty() {
                        hooks.auth_check = bundle.auth_check;
                    }
                    hooks.driver = bundle.driver;
                }
                Err(e) => {
                    tracing::error!(api_id = %spec.api_id, "Couldn't load bundle: {}", e);
                }
            },
            None => {
                tracing::error!(
                    api_id = %spec.api_id,
                    "Spec references bundle {} but no bundle loader is deployed",
                    spec.custom_middleware_bundle
                );
            }
        }
    }

    hooks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundle_paths_are_stable_per_name() {
        let base = Path::new("/var/gateway/middleware");
        let a = bundle_path(base, "api-1", "bundle-v1.zip");
        let b = bundle_path(base, "api-1", "bundle-v1.zip");
        let c = bundle_path(base, "api-1", "bundle-v2.zip");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("/var/gateway/middleware/bundles"));
        assert!(a.file_name().unwrap().to_str().unwrap().starts_with("api-1_"));
    }

    #[tokio::test]
    async fn inline_hooks_survive_without_bundle() {
        let mut spec = ApiSpec::default();
        spec.custom_middleware.pre.push(MiddlewareDefinition {
            name: "checkHeaders".to_string(),
            ..Default::default()
        });

        let hooks = load_custom_middleware(&spec, None).await;
        assert_eq!(hooks.pre.len(), 1);
        assert!(hooks.auth_check.is_empty());
    }

    struct StaticBundle;

    #[async_trait]
    impl BundleLoader for StaticBundle {
        async fn load(&self, _spec: &ApiSpec) -> anyhow::Result<CustomMiddleware> {
            let mut bundle = CustomMiddleware {
                driver: MiddlewareDriver::Subprocess,
                ..Default::default()
            };
            bundle.post.push(MiddlewareDefinition {
                name: "auditTrail".to_string(),
                ..Default::default()
            });
            bundle.auth_check = MiddlewareDefinition {
                name: "customAuth".to_string(),
                ..Default::default()
            };
            Ok(bundle)
        }
    }

    #[tokio::test]
    async fn bundle_hooks_merge_with_inline() {
        let mut spec = ApiSpec::default();
        spec.custom_middleware_bundle = "bundle-v1.zip".to_string();
        spec.custom_middleware.post.push(MiddlewareDefinition {
            name: "inlinePost".to_string(),
            ..Default::default()
        });

        let hooks = load_custom_middleware(&spec, Some(&StaticBundle)).await;
        assert_eq!(hooks.post.len(), 2);
        assert_eq!(hooks.auth_check.name, "customAuth");
        assert_eq!(hooks.driver, MiddlewareDriver::Subprocess);
    }
}
