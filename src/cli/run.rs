use super::config::{default_config_path, CourierConfig, LoggingConfig};
use courier::bridge::{
    Bridge, InitAppserviceBot, ResendBridgeInfo, UserCache, WarmUserCache,
};
use courier::matrix::AppserviceTransport;
use courier::service::HttpConnectorFactory;
use courier::store::SqliteUserStore;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Run the bridge
///
/// Loads the config (`--config`, else `<data dir>/courier/config.toml`). When
/// no config exists yet a default one is written and the command exits so the
/// operator can fill it in and generate a registration.
///
/// Runs until Ctrl+C or SIGTERM. A handshake rejected by the homeserver ends
/// the command with a [`courier::bridge::BridgeError`] whose exit code is
/// [`courier::bridge::FATAL_HANDSHAKE_EXIT_CODE`].
pub async fn execute(config_path: Option<String>) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = config_path
        .map(PathBuf::from)
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        CourierConfig::create_default(&config_path)?;
        println!("📝 No config file found. Created default configuration:");
        println!("   {}", config_path.display());
        println!();
        println!("Edit it, then run `courier generate-registration` and install the");
        println!("registration file in your homeserver before starting the bridge.");
        return Ok(());
    }

    let config = CourierConfig::load(&config_path)?;
    if config.appservice.as_token.is_empty() || config.appservice.hs_token.is_empty() {
        return Err(format!(
            "No appservice tokens in '{}'. Run `courier generate-registration` first.",
            config_path.display()
        )
        .into());
    }

    init_logging(&config.logging)?;
    info!(config = %config_path.display(), "Starting Courier {}", env!("CARGO_PKG_VERSION"));

    let mut bridge = build_bridge(&config).await?;

    if let Err(e) = bridge.start().await {
        if !e.is_fatal_handshake() {
            bridge.stop().await;
        }
        return Err(e.into());
    }

    shutdown_signal().await;
    bridge.stop().await;
    Ok(())
}

async fn build_bridge(config: &CourierConfig) -> Result<Bridge, Box<dyn std::error::Error>> {
    let ghosts = config.ghost_namespace()?;
    let store = SqliteUserStore::connect(&config.appservice.database).await?;
    let connectors = HttpConnectorFactory::new(&config.service.api_url, config.request_timeout())?;
    let transport = AppserviceTransport::new(config.appservice_config())?;

    let cache = Arc::new(UserCache::new(
        Arc::new(store),
        Arc::new(connectors),
        ghosts,
    ));

    let mut bridge = Bridge::new(
        Arc::new(transport),
        cache,
        config.listen_addr()?,
        config.reconnect,
    )
    .with_hook(WarmUserCache::new(config.bridge.connect_on_startup))
    .with_hook(InitAppserviceBot);
    if config.bridge.resend_bridge_info {
        bridge = bridge.with_hook(ResendBridgeInfo::default());
    }
    Ok(bridge)
}

/// Set up `tracing`: `RUST_LOG` wins over `logging.level`.
fn init_logging(logging: &LoggingConfig) -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))?;
    let registry = tracing_subscriber::registry().with(filter);

    match &logging.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| format!("Failed to open log file '{}': {}", path.display(), e))?;
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(Mutex::new(file)),
                )
                .try_init()?;
        }
        None => registry.with(tracing_subscriber::fmt::layer()).try_init()?,
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received terminate signal, shutting down"),
    }
}
