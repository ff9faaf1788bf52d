use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};

mod api;
mod config;
mod db;
mod engine;
mod error;
mod live_scores;
mod odds;
mod refresh;

use api::AppState;
use config::Config;
use db::Database;
use live_scores::{ConsensusGameSource, GameStateSource, TheSportsDB, WebSocketFeed};
use odds::{OddsApiClient, ProjectionClient};
use refresh::coordinator::Sources;
use refresh::RefreshCoordinator;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise tracing / logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    config.validate()?;

    // Open database
    let db = Database::open(&config.database_path)?;
    info!("Database opened: {}", config.database_path);

    // Game-state providers, polled concurrently and reconciled by consensus.
    let mut game_providers: Vec<Arc<dyn GameStateSource>> = vec![Arc::new(TheSportsDB::new(
        config.live_scores_api_key.as_deref(),
        Some(config.live_scores_api_url.as_str()),
    )?)];
    if let Some(url) = &config.sports_ws_url {
        game_providers.push(Arc::new(WebSocketFeed::polymarket_sports(url)));
    }
    info!("Configured {} game-state provider(s)", game_providers.len());

    let odds = OddsApiClient::new(&config.odds_api_url, &config.odds_api_key)?
        .with_sport(&config.odds_sport)
        .with_markets(config.odds_markets.clone());
    let projections = ProjectionClient::new(&config.projections_api_url)?;

    let sources = Sources {
        games: Arc::new(ConsensusGameSource::new(
            game_providers,
            config.provider_timeout(),
        )),
        odds: Arc::new(odds),
        projections: Arc::new(projections),
    };

    let coordinator = RefreshCoordinator::new(
        sources,
        config.refresh_settings(),
        config.momentum_settings(),
        Some(db.clone()),
    );
    coordinator.warm_from(&db)?;
    let settings = coordinator.settings();
    info!(
        "Refresh: poll {:?}, stale after {:?}, min edge {}pp",
        settings.poll_interval, settings.stale_after, settings.min_edge_pct
    );

    // Startup subscriptions live as long as the process.
    let _tracked: Vec<_> = config
        .track_games
        .iter()
        .map(|game_id| coordinator.subscribe(game_id.trim()))
        .collect();
    info!("Tracking {} game(s) from startup", config.track_games.len());

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let scheduler = tokio::spawn(coordinator.clone().run(shutdown_rx));

    // Start the read API
    let app = api::router(AppState { feed: coordinator });
    let addr: SocketAddr = config.api_addr.parse()?;
    info!("Read API listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Run API server (blocks until shutdown)
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for ctrl-c: {}", e);
            }
            info!("Shutdown requested");
        })
        .await?;

    let _ = shutdown_tx.send(());
    if let Err(e) = scheduler.await {
        error!("Refresh scheduler task failed: {}", e);
    }

    Ok(())
}
