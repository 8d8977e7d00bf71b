//! Import of scraped listing images and creation of processing jobs.
//!
//! A job row is written before its queue message. When the send fails the job
//! is left `queue_failed` so `retry_queue_failed` can pick it up later; the
//! import itself still succeeds.
use crate::db::{self, Pool};
use crate::model::{BookImage, ImageJob, ImageJobStatus, ProcessImageMessage, ProcessingOptions, QueueKind};
use crate::queue::MessageQueue;
use crate::storage::{self, ObjectStore};
use crate::thumbnail;
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use clap::ValueEnum;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Which imported images get a processing job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ProcessScope {
    /// Only the book's primary image.
    Primary,
    All,
    None,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "error", rename_all = "snake_case")]
pub enum EnqueueStatus {
    Queued,
    /// An active job already exists and has a message in flight.
    AlreadyActive,
    QueueFailed(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct Enqueued {
    pub job: ImageJob,
    pub status: EnqueueStatus,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportReport {
    pub book_id: i64,
    pub images: Vec<BookImage>,
    pub jobs: Vec<Enqueued>,
    /// Source keys that could not be imported, with the reason.
    pub failures: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RetryReport {
    pub requeued: Vec<i64>,
    pub still_failed: Vec<i64>,
}

pub struct Ingestor {
    pool: Pool,
    store: Arc<dyn ObjectStore>,
    queue: Arc<dyn MessageQueue>,
    options: ProcessingOptions,
    thumbnail_max_dimension: u32,
}

impl Ingestor {
    pub fn new(
        pool: Pool,
        store: Arc<dyn ObjectStore>,
        queue: Arc<dyn MessageQueue>,
        options: ProcessingOptions,
        thumbnail_max_dimension: u32,
    ) -> Self {
        Self {
            pool,
            store,
            queue,
            options,
            thumbnail_max_dimension,
        }
    }

    /// Copy listing images to permanent book keys, record them, and queue
    /// processing for the requested scope.
    #[instrument(skip(self, source_keys), fields(count = source_keys.len()))]
    pub async fn import_listing_images(
        &self,
        book_id: i64,
        source_keys: &[String],
        scope: ProcessScope,
    ) -> Result<ImportReport> {
        db::get_book(&self.pool, book_id)
            .await?
            .ok_or_else(|| anyhow!("book {} not found", book_id))?;

        let mut report = ImportReport {
            book_id,
            ..Default::default()
        };
        for source in source_keys {
            match self.import_one(book_id, source).await {
                Ok(image) => report.images.push(image),
                Err(err) => {
                    warn!(%source, error = ?err, "failed to import listing image");
                    report.failures.push((source.clone(), format!("{:#}", err)));
                }
            }
        }

        let targets: Vec<&BookImage> = match scope {
            ProcessScope::None => Vec::new(),
            ProcessScope::All => report.images.iter().collect(),
            ProcessScope::Primary => report.images.iter().filter(|i| i.is_primary).collect(),
        };
        let mut jobs = Vec::with_capacity(targets.len());
        for image in targets {
            jobs.push(self.enqueue(image).await?);
        }
        report.jobs = jobs;
        info!(
            imported = report.images.len(),
            queued = report.jobs.len(),
            failed = report.failures.len(),
            "listing import finished"
        );
        Ok(report)
    }

    async fn import_one(&self, book_id: i64, source: &str) -> Result<BookImage> {
        let bytes = self
            .store
            .get(source)
            .await
            .with_context(|| format!("failed to read listing image {}", source))?;
        let ext = thumbnail::key_extension(source).unwrap_or("jpg");
        let key = storage::original_key(book_id, ext);
        self.store.put(&key, &bytes).await?;

        let max_dim = self.thumbnail_max_dimension;
        let thumb_source = key.clone();
        let thumb = tokio::task::spawn_blocking(move || {
            thumbnail::generate_thumbnail(&bytes, max_dim, &thumb_source)
        })
        .await?;
        match thumb {
            Ok((thumb_key, thumb_bytes)) => self.store.put(&thumb_key, &thumb_bytes).await?,
            // The original is still usable without a thumbnail.
            Err(err) => warn!(%key, error = ?err, "thumbnail generation failed"),
        }

        db::insert_original_image(&self.pool, book_id, &key).await
    }

    /// Create (or reuse) a processing job for an existing image and queue it.
    #[instrument(skip(self))]
    pub async fn enqueue_image(&self, book_id: i64, image_id: i64) -> Result<Enqueued> {
        let image = db::get_image(&self.pool, image_id)
            .await?
            .ok_or_else(|| anyhow!("image {} not found", image_id))?;
        if image.book_id != book_id {
            return Err(anyhow!("image {} belongs to book {}, not {}", image_id, image.book_id, book_id));
        }
        self.enqueue(&image).await
    }

    async fn enqueue(&self, image: &BookImage) -> Result<Enqueued> {
        let (job, created) = db::create_image_job(&self.pool, image.book_id, image.id, Utc::now()).await?;
        if !created && job.status != ImageJobStatus::QueueFailed {
            return Ok(Enqueued {
                job,
                status: EnqueueStatus::AlreadyActive,
            });
        }
        let status = self.send(&job, &image.s3_key).await?;
        let job = db::get_image_job(&self.pool, job.id).await?.unwrap_or(job);
        Ok(Enqueued { job, status })
    }

    /// Send the message for a `queued` or `queue_failed` job and record the
    /// outcome on the row.
    async fn send(&self, job: &ImageJob, source_key: &str) -> Result<EnqueueStatus> {
        let message = ProcessImageMessage {
            job_id: job.id,
            book_id: job.book_id,
            image_id: job.image_id,
            source_key: source_key.to_string(),
            options: self.options.clone(),
        };
        let payload = serde_json::to_value(&message)?;
        match self.queue.send(QueueKind::ProcessImage, payload).await {
            Ok(_) => {
                if job.status == ImageJobStatus::QueueFailed {
                    db::mark_requeued(&self.pool, job.id, Utc::now()).await?;
                }
                Ok(EnqueueStatus::Queued)
            }
            Err(err) => {
                let reason = format!("failed to enqueue: {:#}", err);
                warn!(job_id = job.id, error = ?err, "enqueue failed; job left queue_failed");
                db::mark_queue_failed(&self.pool, job.id, &reason, Utc::now()).await?;
                Ok(EnqueueStatus::QueueFailed(reason))
            }
        }
    }

    /// Re-send every job whose original enqueue failed.
    #[instrument(skip(self))]
    pub async fn retry_queue_failed(&self) -> Result<RetryReport> {
        let mut report = RetryReport::default();
        for job in db::list_queue_failed(&self.pool).await? {
            let Some(image) = db::get_image(&self.pool, job.image_id).await? else {
                warn!(job_id = job.id, "image for queue_failed job is gone");
                report.still_failed.push(job.id);
                continue;
            };
            match self.send(&job, &image.s3_key).await? {
                EnqueueStatus::Queued => report.requeued.push(job.id),
                _ => report.still_failed.push(job.id),
            }
        }
        info!(
            requeued = report.requeued.len(),
            still_failed = report.still_failed.len(),
            "retried queue_failed jobs"
        );
        Ok(report)
    }
}
