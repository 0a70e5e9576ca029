//! Rolelink server binary.
//!
//! Registers the metadata schema, then serves the linked-role endpoints and
//! runs the role-change watcher until interrupted.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use rolelink_api::Services;
use rolelink_api::config::ApiConfig;
use rolelink_core::platform::PlatformApi;
use rolelink_core::platform::discord::{DEFAULT_API_BASE, DEFAULT_TIMEOUT, DiscordClient, DiscordSettings};
use rolelink_core::role_map::RoleMap;
use rolelink_core::secrets::TokenCipher;
use rolelink_core::tokens::{MemoryTokenStore, PgTokenStore, TokenStore};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// CLI arguments; every flag falls back to its environment variable.
#[derive(Parser, Debug)]
#[command(name = "rolelink_server", about = "Rolelink linked-roles server")]
struct Args {
    /// Address to listen on (overrides `BIND_ADDR`).
    #[arg(long)]
    bind: Option<String>,

    /// Discord API base URL.
    #[arg(long, env = "DISCORD_API_BASE", default_value = DEFAULT_API_BASE)]
    api_base: String,

    /// Timeout for platform requests, in seconds.
    #[arg(long, default_value_t = DEFAULT_TIMEOUT.as_secs())]
    platform_timeout: u64,

    /// Maximum number of database connections in the pool.
    #[arg(long, default_value_t = 5)]
    max_connections: u32,

    /// Do not register the metadata schema on startup.
    #[arg(long, default_value_t = false)]
    skip_register: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .or_else(|_| {
                    tracing_subscriber::EnvFilter::try_new(
                        "info,rolelink_api=debug,rolelink_core=debug",
                    )
                })?,
        )
        .init();

    let args = Args::parse();
    let mut config = ApiConfig::from_env()?;
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }

    let role_map = match &config.role_map_path {
        Some(path) => RoleMap::load(path)?,
        None => RoleMap::builtin(),
    };
    info!(
        mappings = role_map.mappings().len(),
        keys = role_map.target_keys().len(),
        "role map loaded"
    );

    let platform: Arc<dyn PlatformApi> = Arc::new(DiscordClient::new(DiscordSettings {
        api_base: args.api_base,
        client_id: config.client_id.clone(),
        client_secret: config.client_secret.clone(),
        bot_token: config.bot_token.clone(),
        timeout: Duration::from_secs(args.platform_timeout),
    })?);

    let store: Arc<dyn TokenStore> = match (&config.database_url, &config.token_encryption_key) {
        (Some(url), Some(key)) => {
            info!(max_connections = args.max_connections, "using PostgreSQL token store");
            let pool = PgPoolOptions::new()
                .max_connections(args.max_connections)
                .acquire_timeout(Duration::from_secs(30))
                .connect(url)
                .await?;
            info!("running database migrations");
            rolelink_core::migrate::migrate(&pool).await?;
            Arc::new(PgTokenStore::new(pool, TokenCipher::new(key)?))
        }
        _ => {
            warn!("DATABASE_URL not set, tokens are kept in memory only");
            Arc::new(MemoryTokenStore::new())
        }
    };

    let services = Services::build(config.clone(), store, platform, Arc::new(role_map));

    if args.skip_register {
        info!("skipping metadata registration");
    } else if let Err(e) = services.state.pusher.register_schema().await {
        // Pushes are rejected until a registration succeeds.
        error!(error = %e, "metadata registration failed");
    }

    let cancel = CancellationToken::new();
    let cleanup = services.state.oauth.states().spawn_cleanup_task();
    let watcher = tokio::spawn(
        services
            .watcher
            .clone()
            .run(services.role_events, cancel.clone()),
    );

    let app = rolelink_api::router(services.state);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!(addr = %listener.local_addr()?, "rolelink listening");

    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for shutdown signal");
            }
            info!("shutting down");
            shutdown.cancel();
        })
        .await?;

    cancel.cancel();
    cleanup.abort();
    if let Err(e) = watcher.await {
        error!(error = %e, "role-change watcher task failed");
    }

    Ok(())
}
