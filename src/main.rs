use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod config;
mod db;
mod error;
mod live_scores;
mod monitor;
mod notify;

use config::Config;
use db::Database;
use live_scores::api_football::shootout_probe_at;
use live_scores::{ApiFootball, ApiFootballDecoder, MatchFeed, ResilientFetcher};
use monitor::{EventDetector, Pipeline, Scheduler, SnapshotStore};
use notify::Dispatcher;

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

    let teams = config.load_teams()?;
    info!(
        "Following {} team(s): {}",
        teams.len(),
        teams.iter().map(|t| t.name.as_str()).collect::<Vec<_>>().join(", ")
    );

    // Open database
    let db = Database::open(&config.database_path)?;
    info!("Database opened: {}", config.database_path);

    let cancel = CancellationToken::new();

    // Provider stack
    let api_key = config.api_key.clone().unwrap_or_default();
    let provider = Arc::new(ApiFootball::new(
        &api_key,
        &config.api_base_url,
        config.request_timeout(),
    )?);
    let fetcher = Arc::new(ResilientFetcher::new(
        provider,
        config.retry_policy(),
        config.breaker_policy(),
        config.daily_quota,
        cancel.clone(),
    ));
    let decoder = Arc::new(ApiFootballDecoder::new(shootout_probe_at(&config.shootout_path)));
    let feed = MatchFeed::new(fetcher, decoder);

    // Notification channels
    let channels = notify::channels::build_channels(&config)?;
    if channels.is_empty() {
        warn!("No notification channel configured; events will only be logged");
    }
    let dispatcher = Arc::new(Dispatcher::new(
        channels,
        config.dispatch_policy(),
        Some(db.clone()),
    ));
    info!("Notification channels, in order: {:?}", dispatcher.channel_names());
    dispatcher.prune(Utc::now() - chrono::Duration::days(config.retention_days));

    // Resume from the last run
    let restored = db.load_snapshots()?;
    let store = Arc::new(SnapshotStore::new(Some(db.clone())));
    store.restore(restored.clone());
    if !store.is_empty() {
        info!("Resuming {} tracked match(es)", store.len());
    }

    let pipeline = Arc::new(Pipeline::new(
        feed,
        store.clone(),
        EventDetector::new(config.detector_config()),
        dispatcher,
    ));
    let mut scheduler = Scheduler::new(config.scheduler_settings(), teams, pipeline, store);
    scheduler.restore(&restored, Utc::now());

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            shutdown.cancel();
        }
    });

    if let Err(e) = scheduler.run(cancel).await {
        error!("Monitor stopped: {:#}", e);
        return Err(e);
    }
    info!("Monitor stopped");
    Ok(())
}
