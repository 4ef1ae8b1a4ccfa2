//! Binary entrypoint: wires config, store, registry, classifier, scheduler
//! and the HTTP surface together, then serves.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use healthfeed::api::AppState;
use healthfeed::classify::{ClassifierEngine, ClassifierHandle};
use healthfeed::config::{AppConfig, SourcesFile};
use healthfeed::ingest::fetch::Fetcher;
use healthfeed::ingest::scheduler::{SchedulerCfg, ScrapeScheduler};
use healthfeed::ingest::Pipeline;
use healthfeed::registry::SourceRegistry;
use healthfeed::search::SearchEngine;
use healthfeed::store::Store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env in local/dev; no-op elsewhere.
    let _ = dotenvy::dotenv();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("healthfeed=info,warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .init();

    let cfg = AppConfig::load()?;
    let sources = SourcesFile::load()?;

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "sqlite:healthfeed.db?mode=rwc".to_string());
    let store = Arc::new(Store::new(&database_url).await?);
    store.initialize().await?;

    let registry = Arc::new(SourceRegistry::new(&store, cfg.blacklist_threshold));
    registry.sync_sources(&sources.sources).await?;
    info!(count = sources.sources.len(), "sources synced");

    let classifier = ClassifierHandle::new(ClassifierEngine::from_toml()?);
    let fetcher = Fetcher::new(cfg.retry_policy())?;
    let pipeline = Arc::new(Pipeline::new(
        store.clone(),
        registry.clone(),
        classifier.clone(),
        fetcher,
        cfg.fetch_concurrency,
    ));
    let stats = pipeline.stats().clone();

    let scheduler = ScrapeScheduler::new(pipeline);
    scheduler.spawn_intervals(SchedulerCfg {
        quick_interval: Duration::from_secs(cfg.quick_interval_secs),
        full_interval: Duration::from_secs(cfg.full_interval_secs),
        startup_delay: Duration::from_secs(cfg.startup_delay_secs),
        retention_days: cfg.retention_days,
    });

    let search = Arc::new(SearchEngine::new(store.clone(), classifier.clone()));

    let state = AppState {
        store,
        registry,
        search,
        scheduler,
        classifier,
        stats,
    };
    let router = healthfeed::create_router(state);

    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr).await?;
    info!(addr = %cfg.bind_addr, "listening");
    axum::serve(listener, router).await?;

    Ok(())
}
