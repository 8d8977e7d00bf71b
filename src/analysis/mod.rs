//! Book valuation analysis: job lifecycle, report generation and parsing.
//!
//! Jobs move pending -> running -> completed | failed. A job left pending or
//! running past the staleness threshold is failed the next time its book is
//! read or re-triggered; nothing sweeps in the background.

pub mod generator;
pub mod parser;

pub use generator::{LlmValuationModel, ValuationModel, ValuationRequest};
pub use parser::{missing_sections, parse_valuation};

use crate::config::Analysis;
use crate::db::{self, Pool};
use crate::llm::ImageInput;
use crate::model::{AnalysisJob, BookAnalysis, QueueKind, RunAnalysisMessage};
use crate::queue::MessageQueue;
use crate::storage::ObjectStore;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

#[derive(Debug, Clone)]
pub struct AnalysisSettings {
    pub max_tokens: u32,
    pub stale_after_minutes: i64,
    pub required_sections: Vec<String>,
    pub max_images: usize,
}

impl From<&Analysis> for AnalysisSettings {
    fn from(a: &Analysis) -> Self {
        Self {
            max_tokens: a.max_tokens,
            stale_after_minutes: a.stale_after_minutes,
            required_sections: a.required_sections.clone(),
            max_images: a.max_images,
        }
    }
}

/// What a status read returns: the latest job and the stored valuation.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisView {
    pub job: Option<AnalysisJob>,
    pub analysis: Option<BookAnalysis>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed { truncated: bool },
    Failed(String),
    Skipped(String),
}

pub struct AnalysisService {
    pool: Pool,
    store: Arc<dyn ObjectStore>,
    model: Arc<dyn ValuationModel>,
    queue: Arc<dyn MessageQueue>,
    settings: AnalysisSettings,
}

impl AnalysisService {
    pub fn new(
        pool: Pool,
        store: Arc<dyn ObjectStore>,
        model: Arc<dyn ValuationModel>,
        queue: Arc<dyn MessageQueue>,
        settings: AnalysisSettings,
    ) -> Self {
        Self {
            pool,
            store,
            model,
            queue,
            settings,
        }
    }

    fn stale_message(&self) -> String {
        format!(
            "analysis job timed out after {} minutes",
            self.settings.stale_after_minutes
        )
    }

    async fn fail_stale(&self, book_id: i64, now: DateTime<Utc>) -> Result<u64> {
        let cutoff = now - Duration::minutes(self.settings.stale_after_minutes);
        let n = db::fail_stale_analysis_jobs(&self.pool, book_id, cutoff, &self.stale_message(), now)
            .await?;
        if n > 0 {
            warn!(book_id, count = n, "failed stale analysis jobs");
        }
        Ok(n)
    }

    /// Start an analysis for a book, or return the one already in flight.
    #[instrument(skip(self))]
    pub async fn trigger(&self, book_id: i64) -> Result<AnalysisJob> {
        let now = Utc::now();
        db::get_book(&self.pool, book_id)
            .await?
            .ok_or_else(|| anyhow!("book {} not found", book_id))?;
        self.fail_stale(book_id, now).await?;

        if let Some(job) = db::active_analysis_job(&self.pool, book_id).await? {
            info!(job_id = job.id, status = job.status.as_str(), "analysis already in progress");
            return Ok(job);
        }

        let job = match db::create_analysis_job(&self.pool, book_id, self.model.model_id(), now).await {
            Ok(job) => job,
            // Lost a race against a concurrent trigger; the unique index kept
            // the other one.
            Err(err) => match db::active_analysis_job(&self.pool, book_id).await? {
                Some(job) => return Ok(job),
                None => return Err(err),
            },
        };

        let payload = serde_json::to_value(RunAnalysisMessage {
            job_id: job.id,
            book_id,
        })?;
        if let Err(err) = self.queue.send(QueueKind::RunAnalysis, payload).await {
            let message = format!("failed to enqueue analysis: {:#}", err);
            db::mark_analysis_failed(&self.pool, job.id, &message, Utc::now()).await?;
            return Err(err.context(format!("analysis job {} could not be queued", job.id)));
        }
        info!(job_id = job.id, "analysis queued");
        Ok(job)
    }

    /// Latest job and valuation for a book, after failing stale jobs.
    #[instrument(skip(self))]
    pub async fn status(&self, book_id: i64) -> Result<AnalysisView> {
        self.fail_stale(book_id, Utc::now()).await?;
        Ok(AnalysisView {
            job: db::latest_analysis_job(&self.pool, book_id).await?,
            analysis: db::get_book_analysis(&self.pool, book_id).await?,
        })
    }

    /// Execute a queued job. Generation errors fail the job and are not
    /// retried; only database errors are returned.
    #[instrument(skip(self))]
    pub async fn run(&self, job_id: i64) -> Result<RunOutcome> {
        if !db::mark_analysis_running(&self.pool, job_id, Utc::now()).await? {
            let reason = match db::get_analysis_job(&self.pool, job_id).await? {
                Some(job) => format!("analysis job {} is {}", job_id, job.status.as_str()),
                None => format!("analysis job {} no longer exists", job_id),
            };
            info!(%reason, "skipping analysis");
            return Ok(RunOutcome::Skipped(reason));
        }
        let job = db::get_analysis_job(&self.pool, job_id)
            .await?
            .ok_or_else(|| anyhow!("analysis job {} vanished", job_id))?;

        let (analysis, issue) = match self.generate(&job).await {
            Ok(res) => res,
            Err(err) => {
                error!(job_id, error = ?err, "analysis failed");
                let message = format!("{:#}", err);
                db::mark_analysis_failed(&self.pool, job_id, &message, Utc::now()).await?;
                return Ok(RunOutcome::Failed(message));
            }
        };

        let truncated = analysis.truncated;
        if !db::complete_analysis(&self.pool, job_id, &analysis, issue.as_deref(), Utc::now()).await? {
            return Ok(RunOutcome::Skipped(format!(
                "analysis job {} stopped running before completion",
                job_id
            )));
        }
        info!(job_id, truncated, "analysis completed");
        Ok(RunOutcome::Completed { truncated })
    }

    async fn generate(&self, job: &AnalysisJob) -> Result<(BookAnalysis, Option<String>)> {
        let book = db::get_book(&self.pool, job.book_id)
            .await?
            .ok_or_else(|| anyhow!("book {} not found", job.book_id))?;
        let images = db::list_analysis_images(&self.pool, job.book_id).await?;
        let mut inputs = Vec::new();
        for img in images.iter().take(self.settings.max_images) {
            let data = self
                .store
                .get(&img.s3_key)
                .await
                .with_context(|| format!("failed to load {}", img.s3_key))?;
            inputs.push(ImageInput::from_key(&img.s3_key, data));
        }

        let request = ValuationRequest {
            book,
            images: inputs,
            max_tokens: self.settings.max_tokens,
            required_sections: self.settings.required_sections.clone(),
        };
        let completion = self.model.generate(&request).await?;

        let missing = missing_sections(&completion.text, &self.settings.required_sections);
        let mut issues = Vec::new();
        if completion.hit_token_limit() {
            issues.push("generation stopped at the token limit".to_string());
        }
        if !missing.is_empty() {
            issues.push(format!("report is missing sections: {}", missing.join(", ")));
        }
        let truncated = !issues.is_empty();
        let valuation = parse_valuation(&completion.text);
        if valuation.is_empty() {
            issues.push("no valuation figures found in report".to_string());
        }
        if !issues.is_empty() {
            warn!(job_id = job.id, ?issues, "analysis completed with issues");
        }

        let analysis = BookAnalysis {
            book_id: job.book_id,
            report: completion.text,
            valuation,
            model_id: self.model.model_id().to_string(),
            truncated,
            updated_at: Utc::now(),
        };
        let issue = (!issues.is_empty()).then(|| issues.join("; "));
        Ok((analysis, issue))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Completion;
    use crate::model::AnalysisStatus;
    use crate::storage::FsObjectStore;
    use async_trait::async_trait;
    use serde_json::Value;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::sync::Mutex;

    struct FakeModel {
        reply: std::result::Result<Completion, String>,
        seen_images: Mutex<Vec<usize>>,
    }

    impl FakeModel {
        fn replying(text: &str, stop: &str) -> Self {
            Self {
                reply: Ok(Completion {
                    text: text.to_string(),
                    stop_reason: Some(stop.to_string()),
                }),
                seen_images: Mutex::new(Vec::new()),
            }
        }

        fn failing(msg: &str) -> Self {
            Self {
                reply: Err(msg.to_string()),
                seen_images: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ValuationModel for FakeModel {
        fn model_id(&self) -> &str {
            "fake-model"
        }

        async fn generate(&self, request: &ValuationRequest) -> Result<Completion> {
            self.seen_images.lock().unwrap().push(request.images.len());
            match &self.reply {
                Ok(c) => Ok(c.clone()),
                Err(msg) => Err(anyhow!("{}", msg)),
            }
        }
    }

    #[derive(Default)]
    struct RecordingQueue {
        sent: Mutex<Vec<(QueueKind, Value)>>,
        fail: bool,
    }

    #[async_trait]
    impl MessageQueue for RecordingQueue {
        async fn send(&self, kind: QueueKind, payload: Value) -> Result<i64> {
            if self.fail {
                return Err(anyhow!("queue unavailable"));
            }
            let mut sent = self.sent.lock().unwrap();
            sent.push((kind, payload));
            Ok(sent.len() as i64)
        }
    }

    async fn setup_pool() -> Pool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        db::run_migrations(&pool).await.unwrap();
        pool
    }

    fn settings() -> AnalysisSettings {
        AnalysisSettings {
            max_tokens: 1000,
            stale_after_minutes: 15,
            required_sections: vec!["Recommendations".to_string()],
            max_images: 2,
        }
    }

    struct Harness {
        pool: Pool,
        service: AnalysisService,
        queue: Arc<RecordingQueue>,
        model: Arc<FakeModel>,
        book_id: i64,
        _dir: tempfile::TempDir,
    }

    async fn harness(model: FakeModel, queue: RecordingQueue) -> Harness {
        let pool = setup_pool().await;
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FsObjectStore::new(dir.path()));
        let book_id = db::insert_book(&pool, "Walden", Some("Thoreau")).await.unwrap();
        for i in 0..3 {
            let key = format!("books/{}/img{}.jpg", book_id, i);
            store.put(&key, b"jpeg").await.unwrap();
            db::insert_original_image(&pool, book_id, &key).await.unwrap();
        }
        let model = Arc::new(model);
        let queue = Arc::new(queue);
        let service = AnalysisService::new(
            pool.clone(),
            store,
            model.clone(),
            queue.clone(),
            settings(),
        );
        Harness {
            pool,
            service,
            queue,
            model,
            book_id,
            _dir: dir,
        }
    }

    const REPORT: &str = "## Condition\nFine.\n## Recommendations\nInsure it.\n**Low:** $1,000\n**Mid:** $1,500\n**High:** $2,000\n";

    #[tokio::test]
    async fn trigger_enqueues_once_and_run_completes() {
        let h = harness(FakeModel::replying(REPORT, "end_turn"), RecordingQueue::default()).await;
        let job = h.service.trigger(h.book_id).await.unwrap();
        let again = h.service.trigger(h.book_id).await.unwrap();
        assert_eq!(job.id, again.id);
        assert_eq!(h.queue.sent.lock().unwrap().len(), 1);

        let outcome = h.service.run(job.id).await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed { truncated: false });
        assert_eq!(*h.model.seen_images.lock().unwrap(), vec![2]);

        let view = h.service.status(h.book_id).await.unwrap();
        let job = view.job.unwrap();
        assert_eq!(job.status, AnalysisStatus::Completed);
        assert!(job.error_message.is_none());
        let analysis = view.analysis.unwrap();
        assert_eq!(analysis.valuation.low, Some(1000.0));
        assert_eq!(analysis.valuation.mid, Some(1500.0));
        assert_eq!(analysis.valuation.high, Some(2000.0));
        assert_eq!(analysis.model_id, "fake-model");
    }

    #[tokio::test]
    async fn truncated_report_completes_with_issue() {
        let h = harness(
            FakeModel::replying("## Condition\nLow: $10\nMid: $20\n", "max_tokens"),
            RecordingQueue::default(),
        )
        .await;
        let job = h.service.trigger(h.book_id).await.unwrap();
        let outcome = h.service.run(job.id).await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed { truncated: true });

        let job = db::get_analysis_job(&h.pool, job.id).await.unwrap().unwrap();
        assert_eq!(job.status, AnalysisStatus::Completed);
        assert!(job.truncated);
        let issue = job.issue.unwrap();
        assert!(issue.contains("token limit"));
        assert!(issue.contains("Recommendations"));
        let analysis = db::get_book_analysis(&h.pool, h.book_id).await.unwrap().unwrap();
        assert_eq!(analysis.valuation.mid, Some(20.0));
        assert!(analysis.valuation.high.is_none());
    }

    #[tokio::test]
    async fn generation_error_fails_job_with_message() {
        let h = harness(FakeModel::failing("upstream exploded"), RecordingQueue::default()).await;
        let job = h.service.trigger(h.book_id).await.unwrap();
        let outcome = h.service.run(job.id).await.unwrap();
        assert!(matches!(outcome, RunOutcome::Failed(ref m) if m.contains("upstream exploded")));

        let job = db::get_analysis_job(&h.pool, job.id).await.unwrap().unwrap();
        assert_eq!(job.status, AnalysisStatus::Failed);
        assert!(job.error_message.unwrap().contains("upstream exploded"));
        assert!(job.completed_at.is_some());

        // A failed job does not block a new trigger.
        let next = h.service.trigger(h.book_id).await.unwrap();
        assert_ne!(next.id, job.id);
    }

    #[tokio::test]
    async fn stale_running_job_reads_back_failed() {
        let h = harness(FakeModel::replying(REPORT, "end_turn"), RecordingQueue::default()).await;
        let then = Utc::now() - Duration::minutes(16);
        let job = db::create_analysis_job(&h.pool, h.book_id, "fake-model", then).await.unwrap();
        assert!(db::mark_analysis_running(&h.pool, job.id, then).await.unwrap());

        let view = h.service.status(h.book_id).await.unwrap();
        let job = view.job.unwrap();
        assert_eq!(job.status, AnalysisStatus::Failed);
        assert_eq!(
            job.error_message.as_deref(),
            Some("analysis job timed out after 15 minutes")
        );
        assert!(job.completed_at.is_some());

        // A late run of the stale job does nothing.
        let outcome = h.service.run(job.id).await.unwrap();
        assert!(matches!(outcome, RunOutcome::Skipped(_)));
    }

    #[tokio::test]
    async fn enqueue_failure_fails_the_new_job() {
        let h = harness(
            FakeModel::replying(REPORT, "end_turn"),
            RecordingQueue {
                fail: true,
                ..Default::default()
            },
        )
        .await;
        assert!(h.service.trigger(h.book_id).await.is_err());
        let job = db::latest_analysis_job(&h.pool, h.book_id).await.unwrap().unwrap();
        assert_eq!(job.status, AnalysisStatus::Failed);
        assert!(job.error_message.unwrap().contains("queue unavailable"));
    }
}
