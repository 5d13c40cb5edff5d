//! Declarative API definitions
//!
//! An [`ApiSpec`] is the unit of configuration the gateway compiles into a
//! pipeline: listen path and upstream target, the enabled auth methods,
//! versioning data, CORS behaviour, storage provider selection and custom
//! middleware hooks. Specs are JSON documents loaded from the apps directory.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Wire protocol an API is served over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Http,
    Https,
    Tcp,
    Tls,
}

impl Protocol {
    /// HTTP-family protocols are mounted on the request mux
    pub fn is_http(self) -> bool {
        matches!(self, Protocol::Http | Protocol::Https)
    }
}

/// A single API definition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiSpec {
    /// Unique API identifier
    pub api_id: String,
    /// Internal object identifier (datastore key)
    pub id: String,
    /// Human-readable name; used by loop-target fuzzy matching
    pub name: String,
    /// Owning organisation
    pub org_id: String,
    /// Custom domain; empty means any host
    pub domain: String,
    pub protocol: Protocol,
    /// Per-API listen port; 0 uses the global listen port
    pub listen_port: u16,
    /// Internal APIs are reachable only through loop dispatch, never mounted
    pub internal: bool,
    pub proxy: ProxyDef,

    // Auth method flags; evaluated in a fixed order at build time
    pub use_keyless_access: bool,
    pub use_oauth2: bool,
    pub use_basic_auth: bool,
    pub enable_signature_checking: bool,
    pub enable_jwt: bool,
    pub use_openid: bool,
    pub use_standard_auth: bool,
    pub enable_plugin_auth: bool,
    pub auth: AuthDef,

    pub version_data: VersionData,
    pub cors: CorsDef,

    /// Session TTL in seconds applied on write-back; 0 falls back to -1 (no expiry)
    pub session_lifetime: i64,

    pub auth_provider: ProviderDef,
    pub session_provider: ProviderDef,

    pub custom_middleware: CustomMiddleware,
    /// Remote bundle reference; non-empty triggers the bundle loader
    pub custom_middleware_bundle: String,

    /// Named processors applied to the upstream response, in order
    pub response_processors: Vec<ResponseProcessorDef>,

    /// Request headers copied into session tags (normalised to lowercase at build)
    pub tag_headers: Vec<String>,

    pub global_rate_limit: GlobalRateLimitDef,
    pub cache_options: CacheOptionsDef,
    pub request_signing: RequestSigningDef,

    pub enable_ip_whitelisting: bool,
    pub allowed_ips: Vec<String>,
    pub enable_ip_blacklisting: bool,
    pub blacklisted_ips: Vec<String>,
    pub enable_context_vars: bool,
    pub use_mutual_tls_auth: bool,
    pub strip_auth_data: bool,
    pub disable_rate_limit: bool,
    pub disable_quota: bool,
    pub do_not_track: bool,
}

impl Default for ApiSpec {
    fn default() -> Self {
        Self {
            api_id: String::new(),
            id: String::new(),
            name: String::new(),
            org_id: String::new(),
            domain: String::new(),
            protocol: Protocol::Http,
            listen_port: 0,
            internal: false,
            proxy: ProxyDef::default(),
            use_keyless_access: false,
            use_oauth2: false,
            use_basic_auth: false,
            enable_signature_checking: false,
            enable_jwt: false,
            use_openid: false,
            use_standard_auth: false,
            enable_plugin_auth: false,
            auth: AuthDef::default(),
            version_data: VersionData::default(),
            cors: CorsDef::default(),
            session_lifetime: 0,
            auth_provider: ProviderDef::default(),
            session_provider: ProviderDef::default(),
            custom_middleware: CustomMiddleware::default(),
            custom_middleware_bundle: String::new(),
            response_processors: Vec::new(),
            tag_headers: Vec::new(),
            global_rate_limit: GlobalRateLimitDef::default(),
            cache_options: CacheOptionsDef::default(),
            request_signing: RequestSigningDef::default(),
            enable_ip_whitelisting: false,
            allowed_ips: Vec::new(),
            enable_ip_blacklisting: false,
            blacklisted_ips: Vec::new(),
            enable_context_vars: false,
            use_mutual_tls_auth: false,
            strip_auth_data: false,
            disable_rate_limit: false,
            disable_quota: false,
            do_not_track: false,
        }
    }
}

impl ApiSpec {
    /// True when any version redirects to its own upstream target
    pub fn has_target_overrides(&self) -> bool {
        self.version_data
            .versions
            .values()
            .any(|v| !v.override_target.is_empty())
    }

    /// Header the credential is read from
    pub fn auth_header_name(&self) -> &str {
        if self.auth.auth_header_name.is_empty() {
            "Authorization"
        } else {
            &self.auth.auth_header_name
        }
    }

    /// Key used to detect `(domain, listen_path)` collisions
    pub fn domain_path_hash(&self) -> String {
        generate_domain_path(&self.domain, &self.proxy.listen_path)
    }
}

/// Compose the collision-detection key for a `(domain, listen_path)` pair
pub fn generate_domain_path(hostname: &str, listen_path: &str) -> String {
    format!("{hostname}{listen_path}")
}

/// Upstream proxying block
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyDef {
    /// Path prefix this API answers on; must be non-empty for HTTP protocols
    pub listen_path: String,
    /// Upstream base URL
    pub target_url: String,
    /// Strip the listen path before forwarding upstream
    pub strip_listen_path: bool,
    pub enable_load_balancing: bool,
    /// Load-balancing target list
    pub targets: Vec<String>,
}

impl Default for ProxyDef {
    fn default() -> Self {
        Self {
            listen_path: String::new(),
            target_url: String::new(),
            strip_listen_path: true,
            enable_load_balancing: false,
            targets: Vec::new(),
        }
    }
}

/// Credential extraction configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthDef {
    pub auth_header_name: String,
    pub use_param: bool,
    pub param_name: String,
    pub use_cookie: bool,
    pub cookie_name: String,
}

/// Versioning data for a spec
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VersionData {
    pub not_versioned: bool,
    /// Version selected when the request carries none
    pub default_version: String,
    pub versions: HashMap<String, VersionInfo>,
}

impl Default for VersionData {
    fn default() -> Self {
        let mut versions = HashMap::new();
        versions.insert("Default".to_string(), VersionInfo::default());
        Self {
            not_versioned: true,
            default_version: "Default".to_string(),
            versions,
        }
    }
}

/// A single named version of an API
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VersionInfo {
    pub name: String,
    /// RFC 3339 expiry; empty means never
    pub expires: String,
    /// Upstream target override for this version
    pub override_target: String,
    /// Request body size cap in bytes; 0 disables the check
    pub size_limit: u64,
    pub extended_paths: ExtendedPaths,
}

/// Per-endpoint metadata driving the conditional stages
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtendedPaths {
    pub transform: Vec<EndpointMeta>,
    pub transform_jq: Vec<EndpointMeta>,
    pub transform_headers: Vec<EndpointMeta>,
    pub url_rewrites: Vec<EndpointMeta>,
    pub method_transforms: Vec<EndpointMeta>,
    pub virtual_endpoints: Vec<EndpointMeta>,
    pub validate_json: Vec<EndpointMeta>,
    pub track_endpoints: Vec<EndpointMeta>,
    pub cache: Vec<String>,
}

/// Endpoint pattern an extended-path entry applies to
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointMeta {
    pub path: String,
    pub method: String,
}

/// CORS behaviour
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CorsDef {
    pub enable: bool,
    /// Forward OPTIONS requests straight to the upstream, skipping the chain
    pub options_passthrough: bool,
    pub allowed_origins: Vec<String>,
    pub allowed_methods: Vec<String>,
    pub allowed_headers: Vec<String>,
}

/// Storage provider selection for auth or session data
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderDef {
    /// Engine selection string: "ldap", "rpc", anything else = primary store
    pub storage_engine: String,
    /// Engine-specific settings
    pub meta: serde_json::Value,
}

/// Custom middleware hooks declared inline on the spec
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CustomMiddleware {
    pub pre: Vec<MiddlewareDefinition>,
    pub post: Vec<MiddlewareDefinition>,
    pub post_key_auth: Vec<MiddlewareDefinition>,
    pub auth_check: MiddlewareDefinition,
    pub response: Vec<MiddlewareDefinition>,
    pub driver: MiddlewareDriver,
}

/// One custom middleware hook
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MiddlewareDefinition {
    pub name: String,
    pub path: String,
    pub require_session: bool,
    pub raw_body_only: bool,
}

impl MiddlewareDefinition {
    pub fn is_empty(&self) -> bool {
        self.name.is_empty()
    }
}

/// One named response processor and its options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponseProcessorDef {
    pub name: String,
    pub options: serde_json::Value,
}

/// Mutually exclusive plugin execution drivers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MiddlewareDriver {
    /// Embedded script VM
    #[default]
    ScriptVm,
    /// Out-of-process hook dispatch
    Subprocess,
    /// In-process native plugin
    Native,
}

/// Flat per-API rate limit applied to all consumers
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalRateLimitDef {
    pub rate: f64,
    pub per: f64,
}

impl GlobalRateLimitDef {
    pub fn is_enabled(&self) -> bool {
        self.rate > 0.0 && self.per > 0.0
    }
}

/// Response caching options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheOptionsDef {
    pub enable_cache: bool,
    pub cache_timeout: u64,
    pub cache_all_safe_requests: bool,
}

/// Upstream request signing options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestSigningDef {
    pub is_enabled: bool,
    pub secret: String,
    pub key_id: String,
    pub algorithm: String,
}
