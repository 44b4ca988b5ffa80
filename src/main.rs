use dat_gateway::cache::ResourceCache;
use dat_gateway::config::{diagnostics_enabled, log_filter, Config};
use dat_gateway::peer::PeerOpener;
use dat_gateway::pool::ConnectionPool;
use dat_gateway::resolver::NameResolver;
use dat_gateway::router::GatewayRouter;
use dat_gateway::server::GatewayServer;
use dat_gateway::{PKG_NAME, VERSION};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    let rust_log = std::env::var("RUST_LOG").ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_new(log_filter(
            rust_log.as_deref(),
            diagnostics_enabled(),
        ))?)
        .init();

    // Load configuration
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = match &config_path {
        Some(path) => {
            let config = Config::load(path).map_err(|e| {
                error!(path = %path.display(), error = %e, "Failed to load configuration");
                e
            })?;
            info!(path = %path.display(), "Configuration loaded");
            config
        }
        None => {
            let config = Config::default();
            config.validate()?;
            info!("No configuration file given, using defaults");
            config
        }
    };

    print_startup_banner(&config);

    std::fs::create_dir_all(&config.cache.dir).map_err(|e| {
        anyhow::anyhow!(
            "Failed to create cache directory '{}': {}",
            config.cache.dir.display(),
            e
        )
    })?;

    let pool = Arc::new(ConnectionPool::new(config.pool_config()));
    let opener = PeerOpener::new(pool, config.peer_config());
    let cache = ResourceCache::new(opener, config.cache_config());
    let router = GatewayRouter::new(
        NameResolver::new(&config.names),
        cache,
        Arc::new(config.short_name_table()),
        config.router_config(),
    );
    let server = GatewayServer::new(router);

    let addr = server
        .listen(config.server.port, &config.server.bind)
        .await
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Failed to start gateway");
            e
        })?;
    info!(addr = %addr, "Gateway ready");

    wait_for_shutdown().await?;

    server.close().await;

    info!("Shutdown complete");
    Ok(())
}

async fn wait_for_shutdown() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting gateway");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        sentinel = %config.server.sentinel,
        short_token_len = config.server.short_token_len,
        short_name_capacity = config.server.short_name_capacity,
        "Server configuration"
    );
    info!(
        dir = %config.cache.dir.display(),
        max = config.cache.max,
        max_age_secs = config.cache.max_age_secs,
        open_timeout_secs = config.cache.open_timeout_secs,
        "Session cache settings"
    );
    info!(
        origin = %config.peer.origin,
        sync_path = %config.peer.sync_path,
        pool_max_idle = config.peer.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.peer.pool_idle_timeout_secs,
        "Peer settings"
    );
    info!(
        name_count = config.names.len(),
        names = ?config.names.keys().collect::<Vec<_>>(),
        "Configured names"
    );
}
