//! Gateway configuration with TOML parsing and hot-reload support
//!
//! All process-wide knobs live here: listen ports, key hashing, session cache
//! behaviour, org data-age enforcement, plugin paths. Supports hot-reload of
//! the config file without a process restart; consumers read through an
//! atomically swapped snapshot.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Global configuration container with hot-reload support
pub struct ConfigManager {
    /// Current active configuration (atomic swap for hot-reload)
    config: ArcSwap<GatewayConfig>,
    /// File watcher for hot-reload
    watcher: RwLock<Option<RecommendedWatcher>>,
    /// Channel to notify config changes
    reload_tx: mpsc::Sender<ConfigReloadEvent>,
    /// Configuration file path
    config_path: PathBuf,
}

/// Events emitted on configuration changes
#[derive(Debug, Clone)]
pub enum ConfigReloadEvent {
    /// Full configuration reload
    ConfigReloaded(Arc<GatewayConfig>),
    /// Reload failed with error
    ReloadFailed(String),
}

/// Main gateway configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Server bind configuration
    pub server: ServerConfig,
    /// Hash credential keys before they touch storage or caches
    pub hash_keys: bool,
    /// Keys at or below this length are rejected outright (0 = built-in default)
    pub min_token_length: usize,
    /// Enforce organisation data-age expiry on sessions
    pub enforce_org_data_age: bool,
    /// Local session cache behaviour
    pub local_session_cache: LocalSessionCacheConfig,
    /// Uptime test configuration
    pub uptime_tests: UptimeTestsConfig,
    /// Enable the embedded script VM for plugin middleware
    pub enable_jsvm: bool,
    /// APM integration
    pub new_relic: NewRelicConfig,
    /// Filesystem path for custom middleware bundles
    pub middleware_path: PathBuf,
    /// Directory of API definition documents (JSON)
    pub apps_path: PathBuf,
    /// Policy document path (JSON)
    pub policies_path: PathBuf,
    /// Distributed tracing toggle
    pub tracing_enabled: bool,
    /// Upstream client behaviour
    pub upstream: UpstreamConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            hash_keys: true,
            min_token_length: 0,
            enforce_org_data_age: false,
            local_session_cache: LocalSessionCacheConfig::default(),
            uptime_tests: UptimeTestsConfig::default(),
            enable_jsvm: false,
            new_relic: NewRelicConfig::default(),
            middleware_path: PathBuf::from("middleware"),
            apps_path: PathBuf::from("apps"),
            policies_path: PathBuf::from("policies/policies.json"),
            tracing_enabled: false,
            upstream: UpstreamConfig::default(),
        }
    }
}

/// Keys at or below 3 bytes are never valid credentials
pub const DEFAULT_MIN_TOKEN_LENGTH: usize = 3;

impl GatewayConfig {
    /// Effective minimum token length; zero in the file means "use the default"
    pub fn effective_min_token_length(&self) -> usize {
        if self.min_token_length == 0 {
            DEFAULT_MIN_TOKEN_LENGTH
        } else {
            self.min_token_length
        }
    }

    /// Validate configuration consistency
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.listen_port == 0 {
            anyhow::bail!("server.listen_port must be non-zero");
        }
        if self.server.control_api_port != 0
            && self.server.control_api_port == self.server.listen_port
        {
            anyhow::bail!("control_api_port must differ from listen_port when set");
        }
        Ok(())
    }
}

/// Server bind configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind
    pub bind_address: String,
    /// Main proxy listen port
    pub listen_port: u16,
    /// Control API port (0 = share the main router)
    pub control_api_port: u16,
    /// Hostname the gateway itself answers on
    pub host_name: String,
    /// Route per-API custom domains
    pub enable_custom_domains: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            listen_port: 8080,
            control_api_port: 0,
            host_name: String::new(),
            enable_custom_domains: false,
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> anyhow::Result<std::net::SocketAddr> {
        Ok(format!("{}:{}", self.bind_address, self.listen_port).parse()?)
    }
}

/// Local session cache behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalSessionCacheConfig {
    /// Disable the in-process session state cache entirely
    pub disable_cached_session_state: bool,
    /// Cache entry lifetime in seconds
    pub cached_session_timeout: u64,
}

impl Default for LocalSessionCacheConfig {
    fn default() -> Self {
        Self {
            disable_cached_session_state: false,
            cached_session_timeout: 5,
        }
    }
}

/// Uptime test configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UptimeTestsConfig {
    /// Disable host uptime checking
    pub disable: bool,
}

/// APM integration configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NewRelicConfig {
    /// Application name; empty disables the agent
    pub app_name: String,
}

/// Upstream client behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Per-request upstream timeout in milliseconds
    pub timeout_ms: u64,
    /// Idle keep-alive connections per host
    pub max_idle_per_host: usize,
    /// Idle connection timeout in seconds
    pub idle_timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            max_idle_per_host: 100,
            idle_timeout_secs: 90,
        }
    }
}

impl ConfigManager {
    /// Load configuration from file and create the manager
    pub async fn new(
        config_path: &Path,
    ) -> anyhow::Result<(Self, mpsc::Receiver<ConfigReloadEvent>)> {
        let config = Self::load_config(config_path)?;
        let (reload_tx, reload_rx) = mpsc::channel(16);

        let manager = Self {
            config: ArcSwap::from_pointee(config),
            watcher: RwLock::new(None),
            reload_tx,
            config_path: config_path.to_path_buf(),
        };

        Ok((manager, reload_rx))
    }

    /// Build a manager around an already-constructed configuration (tests, embedding)
    pub fn from_config(config: GatewayConfig) -> Self {
        let (reload_tx, _) = mpsc::channel(16);
        Self {
            config: ArcSwap::from_pointee(config),
            watcher: RwLock::new(None),
            reload_tx,
            config_path: PathBuf::new(),
        }
    }

    /// Get the current configuration snapshot
    pub fn get(&self) -> Arc<GatewayConfig> {
        self.config.load_full()
    }

    /// Parse a configuration file
    fn load_config(path: &Path) -> anyhow::Result<GatewayConfig> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read config file {:?}: {}", path, e))?;
        let config: GatewayConfig = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("failed to parse config file {:?}: {}", path, e))?;
        config.validate()?;
        Ok(config)
    }

    /// Reload configuration from disk and swap the snapshot
    pub fn reload(&self) -> anyhow::Result<Arc<GatewayConfig>> {
        let new_config = Arc::new(Self::load_config(&self.config_path)?);
        self.config.store(new_config.clone());
        info!("Configuration reloaded");
        Ok(new_config)
    }

    /// Binding an RPC-backed storage engine requires org data-age enforcement
    /// process-wide; swap in a snapshot with the flag raised.
    pub fn force_enforce_org_data_age(&self) {
        let current = self.config.load();
        if current.enforce_org_data_age {
            return;
        }
        let mut updated = (**current).clone();
        updated.enforce_org_data_age = true;
        self.config.store(Arc::new(updated));
        debug!("enforce_org_data_age raised by storage engine binding");
    }

    /// Start watching the configuration file for changes
    pub fn start_watching(&self) -> anyhow::Result<()> {
        let config_path = self.config_path.clone();
        let reload_tx = self.reload_tx.clone();
        let watch_dir = config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let path_for_events = config_path;
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            match res {
                Ok(event) => {
                    let relevant = event
                        .paths
                        .iter()
                        .any(|p| p.file_name() == path_for_events.file_name());
                    if relevant && (event.kind.is_modify() || event.kind.is_create()) {
                        debug!("Config file change detected: {:?}", event.kind);
                        match Self::load_config(&path_for_events) {
                            Ok(config) => {
                                let _ = reload_tx
                                    .try_send(ConfigReloadEvent::ConfigReloaded(Arc::new(config)));
                            }
                            Err(e) => {
                                warn!("Config reload failed: {}", e);
                                let _ = reload_tx
                                    .try_send(ConfigReloadEvent::ReloadFailed(e.to_string()));
                            }
                        }
                    }
                }
                Err(e) => error!("Config watch error: {}", e),
            }
        })?;

        watcher.watch(&watch_dir, RecursiveMode::NonRecursive)?;
        *self.watcher.write() = Some(watcher);
        info!("Watching configuration file {:?}", self.config_path);
        Ok(())
    }

    /// Stop watching the configuration file
    pub fn stop_watching(&self) {
        *self.watcher.write() = None;
    }

    /// Apply a config snapshot produced by the watcher
    pub fn apply(&self, config: Arc<GatewayConfig>) {
        self.config.store(config);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = GatewayConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.hash_keys);
        assert_eq!(config.effective_min_token_length(), 3);
        assert!(!config.local_session_cache.disable_cached_session_state);
    }

    #[test]
    fn min_token_length_override() {
        let config = GatewayConfig {
            min_token_length: 24,
            ..Default::default()
        };
        assert_eq!(config.effective_min_token_length(), 24);
    }

    #[test]
    fn parse_minimal_toml() {
        let toml_content = r#"
hash_keys = false
enforce_org_data_age = true

[server]
listen_port = 9090
host_name = "gw.internal"
"#;
        let config: GatewayConfig = toml::from_str(toml_content).unwrap();
        assert_eq!(config.server.listen_port, 9090);
        assert_eq!(config.server.host_name, "gw.internal");
        assert!(!config.hash_keys);
        assert!(config.enforce_org_data_age);
        // untouched sections keep their defaults
        assert_eq!(config.upstream.timeout_ms, 30_000);
    }

    #[test]
    fn force_org_data_age_swaps_snapshot() {
        let manager = ConfigManager::from_config(GatewayConfig::default());
        assert!(!manager.get().enforce_org_data_age);
        manager.force_enforce_org_data_age();
        assert!(manager.get().enforce_org_data_age);
        // idempotent
        manager.force_enforce_org_data_age();
        assert!(manager.get().enforce_org_data_age);
    }

    #[test]
    fn control_port_collision_rejected() {
        let config = GatewayConfig {
            server: ServerConfig {
                listen_port: 8080,
                control_api_port: 8080,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
