use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use moxon_worker::analysis::{AnalysisService, LlmValuationModel};
use moxon_worker::config;
use moxon_worker::db;
use moxon_worker::dispatch::{DispatchSettings, Dispatcher};
use moxon_worker::llm::LlmClient;
use moxon_worker::queue::SqliteQueue;
use moxon_worker::storage::FsObjectStore;
use moxon_worker::vision::HttpSegmenter;
use moxon_worker::worker::ImageWorker;

#[derive(Debug, Parser)]
#[command(author, version, about = "Image processing and analysis worker")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let store = Arc::new(FsObjectStore::new(&cfg.storage.root));
    let queue = SqliteQueue::new(pool.clone(), cfg.app.visibility_timeout_seconds);
    let segmenter = Arc::new(HttpSegmenter::from_config(&cfg.vision)?);
    let llm = LlmClient::from_config(&cfg.llm)?;

    let worker = ImageWorker::new(pool.clone(), store.clone(), segmenter, (&cfg.processing).into());
    let analysis = AnalysisService::new(
        pool.clone(),
        store,
        Arc::new(LlmValuationModel::new(llm, cfg.analysis.model.clone())),
        Arc::new(queue.clone()),
        (&cfg.analysis).into(),
    );
    // Abandon a job before its message becomes visible again.
    let visibility = cfg.app.visibility_timeout_seconds;
    let settings = DispatchSettings {
        max_attempts: cfg.app.max_attempts,
        max_backoff_secs: cfg.app.max_backoff_seconds as i64,
        job_timeout: Duration::from_secs(visibility.saturating_sub(visibility / 10).max(1)),
    };
    let dispatcher = Dispatcher::new(queue, worker, analysis, settings);

    info!(
        models = ?cfg.processing.models,
        poll_ms = cfg.app.poll_interval_ms,
        "starting worker"
    );
    let poll = Duration::from_millis(cfg.app.poll_interval_ms);
    tokio::select! {
        _ = dispatcher.run(poll) => {}
        res = tokio::signal::ctrl_c() => {
            res?;
            info!("shutdown requested");
        }
    }
    Ok(())
}
