//! Tile Summoner server.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use tile_summoner::catalog::{LayerCatalog, LayerSource, PgLayerSource};
use tile_summoner::config::{Args, Config};
use tile_summoner::executor::TileExecutor;
use tile_summoner::server::{router, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    let subscriber = fmt().with_env_filter(filter).with_target(true);
    if args.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    let config = Config::from_args(&args).context("Failed to load configuration")?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        url_base = %config.url_base(),
        "starting tile-summoner"
    );

    // Connections are opened on demand, so an unreachable database does not
    // keep the server from starting.
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.query_timeout())
        .connect_lazy(&config.database_url)
        .context("Invalid database URL")?;

    let layers: Arc<dyn LayerSource> =
        Arc::new(PgLayerSource::new(pool.clone(), config.query_timeout()));
    let catalog = Arc::new(LayerCatalog::new());
    if catalog.refresh(layers.as_ref()).await.is_err() {
        warn!("starting with an empty catalog; it will be reloaded on the next refresh");
    }

    if let Some(period) = config.catalog_refresh() {
        catalog.spawn_refresh_task(Arc::clone(&layers), period);
    }

    let listen_addr = config.listen_addr();
    let state = AppState {
        catalog,
        layers,
        tiles: Arc::new(TileExecutor::new(pool.clone(), config.query_timeout())),
        config: Arc::new(config),
    };

    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", listen_addr))?;
    info!("listening on {}", listen_addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("shutting down");
        })
        .await
        .context("Server failed")?;

    pool.close().await;
    Ok(())
}
