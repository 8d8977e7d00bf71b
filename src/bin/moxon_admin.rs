use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use moxon_worker::admin;
use moxon_worker::analysis::{AnalysisService, LlmValuationModel};
use moxon_worker::config::{self, Config};
use moxon_worker::db::{self, Pool};
use moxon_worker::garbage::{GarbageDetector, LlmGarbageClassifier};
use moxon_worker::ingest::{Ingestor, ProcessScope};
use moxon_worker::llm::LlmClient;
use moxon_worker::model::ProcessingOptions;
use moxon_worker::queue::SqliteQueue;
use moxon_worker::storage::FsObjectStore;
use moxon_worker::tracker::{JobTracker, PollOutcome};

#[derive(Debug, Parser)]
#[command(author, version, about = "Operator commands for books, images and jobs")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create a book and print its id
    AddBook {
        #[arg(long)]
        title: String,
        #[arg(long)]
        author: Option<String>,
    },
    /// Import scraped listing images (storage keys) into a book
    Import {
        #[arg(long)]
        book_id: i64,
        /// Storage key of a listing image; repeat for several
        #[arg(long = "key", required = true)]
        keys: Vec<String>,
        #[arg(long, value_enum, default_value = "primary")]
        scope: ProcessScope,
    },
    /// Queue background removal for one image
    EnqueueImage {
        #[arg(long)]
        book_id: i64,
        #[arg(long)]
        image_id: i64,
    },
    /// Re-send jobs whose enqueue failed
    RetryQueueFailed,
    /// Classify a book's images and report (or apply) garbage flags
    DetectGarbage {
        #[arg(long)]
        book_id: i64,
        #[arg(long)]
        apply: bool,
    },
    /// Start a valuation analysis
    Analyze {
        #[arg(long)]
        book_id: i64,
        /// Poll until the job finishes
        #[arg(long)]
        wait: bool,
        #[arg(long, default_value = "2000")]
        interval_ms: u64,
        /// Give up waiting after this many seconds (default: staleness threshold)
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Show the latest analysis job and stored valuation
    Status {
        #[arg(long)]
        book_id: i64,
    },
    /// Move an image to another book
    ReassignImage {
        #[arg(long)]
        image_id: i64,
        #[arg(long)]
        to_book: i64,
    },
    /// Remove stored objects without an image row
    CleanupOrphans {
        #[arg(long)]
        dry_run: bool,
    },
    /// List dead-lettered messages
    DeadLetters,
    /// Move dead letters back onto the queue
    Redrive {
        /// Dead letter id; repeat for several. All when omitted.
        #[arg(long = "id")]
        ids: Vec<i64>,
    },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

struct Ctx {
    cfg: Config,
    pool: Pool,
    store: Arc<FsObjectStore>,
    queue: SqliteQueue,
}

impl Ctx {
    fn ingestor(&self) -> Ingestor {
        Ingestor::new(
            self.pool.clone(),
            self.store.clone(),
            Arc::new(self.queue.clone()),
            ProcessingOptions {
                models: self.cfg.processing.models.clone(),
                max_dimension: self.cfg.processing.max_dimension,
            },
            self.cfg.processing.thumbnail_max_dimension,
        )
    }

    fn analysis(&self) -> Result<AnalysisService> {
        let llm = LlmClient::from_config(&self.cfg.llm)?;
        Ok(AnalysisService::new(
            self.pool.clone(),
            self.store.clone(),
            Arc::new(LlmValuationModel::new(llm, self.cfg.analysis.model.clone())),
            Arc::new(self.queue.clone()),
            (&self.cfg.analysis).into(),
        ))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;
    let ctx = Ctx {
        store: Arc::new(FsObjectStore::new(&cfg.storage.root)),
        queue: SqliteQueue::new(pool.clone(), cfg.app.visibility_timeout_seconds),
        pool,
        cfg,
    };

    match args.command {
        Command::AddBook { title, author } => {
            let id = db::insert_book(&ctx.pool, &title, author.as_deref()).await?;
            info!(id, "book created");
            println!("{}", id);
        }
        Command::Import { book_id, keys, scope } => {
            let report = ctx.ingestor().import_listing_images(book_id, &keys, scope).await?;
            print_json(&report)?;
        }
        Command::EnqueueImage { book_id, image_id } => {
            let enqueued = ctx.ingestor().enqueue_image(book_id, image_id).await?;
            print_json(&enqueued)?;
        }
        Command::RetryQueueFailed => {
            let report = ctx.ingestor().retry_queue_failed().await?;
            print_json(&report)?;
        }
        Command::DetectGarbage { book_id, apply } => {
            let llm = LlmClient::from_config(&ctx.cfg.llm)?;
            let detector = GarbageDetector::new(
                ctx.pool.clone(),
                ctx.store.clone(),
                Arc::new(LlmGarbageClassifier::new(llm, ctx.cfg.garbage.model.clone())),
                (&ctx.cfg.garbage).into(),
            );
            let report = detector.detect(book_id, apply).await?;
            print_json(&report)?;
        }
        Command::Analyze {
            book_id,
            wait,
            interval_ms,
            timeout_secs,
        } => {
            let service = ctx.analysis()?;
            let job = service.trigger(book_id).await?;
            if !wait {
                print_json(&job)?;
                return Ok(());
            }
            let timeout = Duration::from_secs(
                timeout_secs.unwrap_or(ctx.cfg.analysis.stale_after_minutes as u64 * 60),
            );
            let tracker = JobTracker::new();
            let svc = &service;
            let outcome = tracker
                .poll_until_terminal(book_id, job.id, Duration::from_millis(interval_ms), timeout, || async move {
                    Ok::<_, anyhow::Error>(svc.status(book_id).await?.job)
                })
                .await?;
            match outcome {
                PollOutcome::Completed(_) => print_json(&service.status(book_id).await?)?,
                PollOutcome::Failed(job) => {
                    print_json(&job)?;
                    return Err(anyhow!(
                        "analysis job {} failed: {}",
                        job.id,
                        job.error_message.as_deref().unwrap_or("unknown error")
                    ));
                }
                PollOutcome::TimedOut => {
                    return Err(anyhow!("gave up waiting for analysis job {}", job.id));
                }
            }
        }
        Command::Status { book_id } => {
            let view = ctx.analysis()?.status(book_id).await?;
            print_json(&view)?;
        }
        Command::ReassignImage { image_id, to_book } => {
            let image = admin::reassign_image(&ctx.pool, image_id, to_book).await?;
            print_json(&image)?;
        }
        Command::CleanupOrphans { dry_run } => {
            let report = admin::cleanup_orphans(&ctx.pool, ctx.store.as_ref(), dry_run).await?;
            print_json(&report)?;
        }
        Command::DeadLetters => {
            for letter in ctx.queue.dead_letters().await? {
                println!(
                    "{}\t{}\tattempts={}\t{}\t{}",
                    letter.id,
                    letter.kind,
                    letter.attempts,
                    letter.failed_at.to_rfc3339(),
                    letter.last_error
                );
            }
        }
        Command::Redrive { ids } => {
            let ids = (!ids.is_empty()).then_some(ids);
            let n = ctx.queue.redrive(ids.as_deref(), chrono::Utc::now()).await?;
            println!("{}", n);
        }
    }
    Ok(())
}
