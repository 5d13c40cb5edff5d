//! Portcullis Gateway - API gateway core
//!
//! Loads the gateway configuration, API definitions and policies, compiles
//! every API into a middleware pipeline, and serves them behind one listener
//! with hot-reload on config changes and SIGHUP.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{Request, Response};
use axum::Router;
use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use portcullis_gateway::apidef::ApiSpec;
use portcullis_gateway::config::{ConfigManager, ConfigReloadEvent};
use portcullis_gateway::middleware::GatewayServices;
use portcullis_gateway::registry::Registry;

/// Portcullis Gateway - API gateway core
#[derive(Parser, Debug)]
#[command(name = "portcullis-gateway")]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(
        short,
        long,
        default_value = "/etc/portcullis/gateway.toml",
        env = "PORTCULLIS_CONFIG"
    )]
    config: PathBuf,

    /// Override the proxy listen port
    #[arg(long, env = "PORTCULLIS_LISTEN_PORT")]
    listen_port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "PORTCULLIS_LOG_LEVEL")]
    log_level: String,

    /// Enable JSON log format
    #[arg(long, env = "PORTCULLIS_JSON_LOGS")]
    json_logs: bool,

    /// Enable configuration file watching for hot-reload
    #[arg(long, default_value = "true")]
    watch_config: bool,

    /// Run configuration validation only (don't start the gateway)
    #[arg(long)]
    validate: bool,
}

#[derive(Clone)]
struct AppState {
    registry: Arc<Registry>,
    services: Arc<GatewayServices>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level, args.json_logs)?;

    info!("Starting Portcullis Gateway v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration file: {:?}", args.config);

    // Load configuration
    let (config_manager, mut reload_rx) = ConfigManager::new(&args.config).await?;
    let config_manager = Arc::new(config_manager);

    // Apply CLI overrides
    if let Some(port) = args.listen_port {
        let mut config = (*config_manager.get()).clone();
        config.server.listen_port = port;
        config.validate()?;
        config_manager.apply(Arc::new(config));
        info!("Listen port overridden to: {}", port);
    }

    let config = config_manager.get();
    config.validate()?;
    info!("Configuration validated successfully");

    if args.validate {
        info!("Configuration validation successful, exiting");
        return Ok(());
    }

    // Process-wide services and the pipeline registry
    let services = Arc::new(GatewayServices::with_defaults(config_manager.clone()));
    let registry = Arc::new(Registry::new());

    // Load policies, then API definitions
    match load_policies(&config.policies_path, &services) {
        Ok(count) => info!("Loaded {} policies", count),
        Err(e) => warn!("No policies loaded: {}", e),
    }
    let specs = match load_api_specs(&config.apps_path) {
        Ok(specs) => specs,
        Err(e) => {
            warn!("No API definitions loaded: {}", e);
            Vec::new()
        }
    };
    info!("Loaded {} API definitions", specs.len());
    registry.load_apps(specs, &services).await;

    // Start configuration file watching
    if args.watch_config {
        config_manager.start_watching()?;
        info!("Configuration file watching enabled");
    }

    // Config reload handler: apply the snapshot and recompile every pipeline
    let reload_registry = registry.clone();
    let reload_services = services.clone();
    let reload_manager = config_manager.clone();
    tokio::spawn(async move {
        while let Some(event) = reload_rx.recv().await {
            match event {
                ConfigReloadEvent::ConfigReloaded(new_config) => {
                    info!("Configuration reloaded - rebuilding pipelines");
                    reload_manager.apply(new_config.clone());
                    reload_all(&reload_registry, &reload_services, &new_config.apps_path).await;
                }
                ConfigReloadEvent::ReloadFailed(err) => {
                    error!("Configuration reload failed: {}", err);
                }
            }
        }
    });

    // SIGHUP recompiles pipelines from the current definition files
    #[cfg(unix)]
    {
        let hup_registry = registry.clone();
        let hup_services = services.clone();
        let hup_manager = config_manager.clone();
        tokio::spawn(async move {
            let mut hup = match signal::unix::signal(signal::unix::SignalKind::hangup()) {
                Ok(s) => s,
                Err(e) => {
                    error!("Failed to install SIGHUP handler: {}", e);
                    return;
                }
            };
            while hup.recv().await.is_some() {
                info!("Received SIGHUP, reloading API definitions");
                let config = hup_manager.get();
                if let Err(e) = load_policies(&config.policies_path, &hup_services) {
                    warn!("Policy reload failed: {}", e);
                }
                reload_all(&hup_registry, &hup_services, &config.apps_path).await;
            }
        });
    }

    let state = AppState {
        registry: registry.clone(),
        services: services.clone(),
    };
    let app = Router::new().fallback(gateway_entry).with_state(state);

    let addr = config.server.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;

    info!("═══════════════════════════════════════════════════════════════");
    info!("  Portcullis Gateway v{}", env!("CARGO_PKG_VERSION"));
    info!("═══════════════════════════════════════════════════════════════");
    info!("  Listen:        {}", addr);
    if !config.server.host_name.is_empty() {
        info!("  Host name:     {}", config.server.host_name);
    }
    info!("  Key hashing:   {}", config.hash_keys);
    info!("  Custom domains: {}", config.server.enable_custom_domains);
    for pipeline in registry.snapshot().by_listen.iter() {
        info!(
            "    - {} {} -> {}",
            pipeline.spec.name, pipeline.spec.proxy.listen_path, pipeline.spec.proxy.target_url
        );
    }
    info!("═══════════════════════════════════════════════════════════════");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    config_manager.stop_watching();
    info!("Portcullis Gateway shutdown complete");
    Ok(())
}

/// Every inbound request funnels through the registry
async fn gateway_entry(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    mut req: Request<Body>,
) -> Response<Body> {
    Registry::attach_peer(&mut req, addr.ip());
    let enable_custom_domains = state.services.config.get().server.enable_custom_domains;
    state.registry.serve(enable_custom_domains, req).await
}

/// Recompile every pipeline from the definitions on disk and swap
async fn reload_all(registry: &Arc<Registry>, services: &Arc<GatewayServices>, apps_path: &Path) {
    match load_api_specs(apps_path) {
        Ok(specs) => {
            info!("Reloading {} API definitions", specs.len());
            registry.load_apps(specs, services).await;
        }
        Err(e) => error!("API definition reload failed: {}", e),
    }
}

/// Read every JSON API definition in the apps directory
fn load_api_specs(path: &Path) -> anyhow::Result<Vec<ApiSpec>> {
    let mut specs = Vec::new();
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let file = entry.path();
        if file.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let content = std::fs::read_to_string(&file)?;
        match serde_json::from_str::<ApiSpec>(&content) {
            Ok(spec) => specs.push(spec),
            Err(e) => warn!("Skipping malformed API definition {:?}: {}", file, e),
        }
    }
    Ok(specs)
}

/// Load the policy document into the shared registry
fn load_policies(path: &Path, services: &Arc<GatewayServices>) -> anyhow::Result<usize> {
    let content = std::fs::read_to_string(path)?;
    services.policies.load_from_json(&content)
}

/// Initialize logging
fn init_logging(level: &str, json: bool) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(true))
            .init();
    }

    Ok(())
}

/// Wait for an OS shutdown signal
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
                return;
            }
        };
        tokio::select! {
            _ = signal::ctrl_c() => info!("Received Ctrl+C, initiating graceful shutdown..."),
            _ = sigterm.recv() => info!("Received SIGTERM, initiating graceful shutdown..."),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
        info!("Received Ctrl+C, initiating graceful shutdown...");
    }
}
