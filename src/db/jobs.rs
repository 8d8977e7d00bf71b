use super::model::{image_from_row, image_job_from_row, IMAGE_COLUMNS, IMAGE_JOB_COLUMNS};
use super::repo::count_images_tx;
use super::Pool;
use crate::model::{BookImage, ImageJob, ImageJobStatus, ImageVariant};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use sqlx::{Sqlite, Transaction};
use tracing::instrument;

/// Result of trying to take ownership of a job before processing it.
#[derive(Debug)]
pub enum ClaimOutcome {
    Claimed(ImageJob),
    /// Already completed by an earlier delivery.
    AlreadyCompleted(ImageJob),
    /// Failed earlier; a redelivery must not resurrect it.
    Failed(ImageJob),
    Missing,
}

#[derive(Debug)]
pub struct FinalizedImage {
    pub image: BookImage,
    /// False when an earlier run already produced the processed row.
    pub created: bool,
}

async fn fetch_job_tx(tx: &mut Transaction<'_, Sqlite>, job_id: i64) -> Result<Option<ImageJob>> {
    let row = sqlx::query(&format!(
        "SELECT {IMAGE_JOB_COLUMNS} FROM image_processing_jobs WHERE id = ?"
    ))
    .bind(job_id)
    .fetch_optional(&mut **tx)
    .await?;
    row.as_ref().map(image_job_from_row).transpose()
}

/// Create a queued job for an image, or return the job already active for it.
/// The boolean is true when a new row was inserted.
#[instrument(skip_all)]
pub async fn create_image_job(
    pool: &Pool,
    book_id: i64,
    image_id: i64,
    now: DateTime<Utc>,
) -> Result<(ImageJob, bool)> {
    let mut tx = pool.begin().await?;
    let existing = sqlx::query(&format!(
        "SELECT {IMAGE_JOB_COLUMNS} FROM image_processing_jobs \
         WHERE image_id = ? AND status IN ('queued', 'queue_failed', 'processing')"
    ))
    .bind(image_id)
    .fetch_optional(&mut *tx)
    .await?;
    if let Some(row) = existing {
        let job = image_job_from_row(&row)?;
        tx.commit().await?;
        return Ok((job, false));
    }
    let row = sqlx::query(&format!(
        "INSERT INTO image_processing_jobs (book_id, image_id, status, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?) RETURNING {IMAGE_JOB_COLUMNS}"
    ))
    .bind(book_id)
    .bind(image_id)
    .bind(ImageJobStatus::Queued.as_str())
    .bind(now)
    .bind(now)
    .fetch_one(&mut *tx)
    .await?;
    let job = image_job_from_row(&row)?;
    tx.commit().await?;
    Ok((job, true))
}

#[instrument(skip_all)]
pub async fn get_image_job(pool: &Pool, job_id: i64) -> Result<Option<ImageJob>> {
    let row = sqlx::query(&format!(
        "SELECT {IMAGE_JOB_COLUMNS} FROM image_processing_jobs WHERE id = ?"
    ))
    .bind(job_id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(image_job_from_row).transpose()
}

/// Record that the job row exists but its queue message could not be sent.
#[instrument(skip_all)]
pub async fn mark_queue_failed(pool: &Pool, job_id: i64, message: &str, now: DateTime<Utc>) -> Result<()> {
    sqlx::query(
        "UPDATE image_processing_jobs SET status = 'queue_failed', error_message = ?, updated_at = ? \
         WHERE id = ? AND status = 'queued'",
    )
    .bind(message)
    .bind(now)
    .bind(job_id)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn list_queue_failed(pool: &Pool) -> Result<Vec<ImageJob>> {
    let rows = sqlx::query(&format!(
        "SELECT {IMAGE_JOB_COLUMNS} FROM image_processing_jobs WHERE status = 'queue_failed' ORDER BY id"
    ))
    .fetch_all(pool)
    .await?;
    rows.iter().map(image_job_from_row).collect()
}

/// Move a `queue_failed` job back to `queued` after its message was sent.
#[instrument(skip_all)]
pub async fn mark_requeued(pool: &Pool, job_id: i64, now: DateTime<Utc>) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE image_processing_jobs SET status = 'queued', error_message = NULL, updated_at = ? \
         WHERE id = ? AND status = 'queue_failed'",
    )
    .bind(now)
    .bind(job_id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() > 0)
}

/// Take the job for processing. The UPDATE runs first so the transaction holds
/// the write lock while the current state is read back.
#[instrument(skip_all)]
pub async fn claim_image_job(pool: &Pool, job_id: i64, now: DateTime<Utc>) -> Result<ClaimOutcome> {
    let mut tx = pool.begin().await?;
    let updated = sqlx::query(
        "UPDATE image_processing_jobs \
         SET status = 'processing', attempt = attempt + 1, error_message = NULL, \
             started_at = ?, updated_at = ? \
         WHERE id = ? AND status IN ('queued', 'queue_failed', 'processing')",
    )
    .bind(now)
    .bind(now)
    .bind(job_id)
    .execute(&mut *tx)
    .await?
    .rows_affected();
    let job = fetch_job_tx(&mut tx, job_id).await?;
    tx.commit().await?;

    Ok(match job {
        None => ClaimOutcome::Missing,
        Some(job) if updated > 0 => ClaimOutcome::Claimed(job),
        Some(job) if job.status == ImageJobStatus::Completed => ClaimOutcome::AlreadyCompleted(job),
        Some(job) => ClaimOutcome::Failed(job),
    })
}

/// Terminal failure: status, message and completion time are written together.
#[instrument(skip_all)]
pub async fn fail_image_job(pool: &Pool, job_id: i64, message: &str, now: DateTime<Utc>) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE image_processing_jobs \
         SET status = 'failed', error_message = ?, completed_at = ?, updated_at = ? \
         WHERE id = ? AND status <> 'completed'",
    )
    .bind(message)
    .bind(now)
    .bind(now)
    .bind(job_id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() > 0)
}

/// Insert the processed variant of `source` and complete the job, at most once
/// per source image.
///
/// The job row is touched first to take the write lock, then the existing
/// processed row (if any) is looked up. A retry that lost the race, or a
/// second job for the same image, completes against the existing row instead
/// of inserting a duplicate. The display order is the book's current image
/// count. The source row is re-read under the lock: the processed image lands
/// in the source's current book and takes over its current primary and
/// garbage flags.
#[instrument(skip_all)]
pub async fn finalize_processed_image(
    pool: &Pool,
    job_id: i64,
    source: &BookImage,
    processed_key: &str,
    model_used: &str,
    now: DateTime<Utc>,
) -> Result<FinalizedImage> {
    let mut tx = pool.begin().await?;
    let locked = sqlx::query("UPDATE image_processing_jobs SET updated_at = ? WHERE id = ?")
        .bind(now)
        .bind(job_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    if locked == 0 {
        return Err(anyhow!("image job {} not found", job_id));
    }

    let existing = sqlx::query(&format!(
        "SELECT {IMAGE_COLUMNS} FROM book_images WHERE source_image_id = ?"
    ))
    .bind(source.id)
    .fetch_optional(&mut *tx)
    .await?;

    let (image, created) = match existing {
        Some(row) => (image_from_row(&row)?, false),
        None => {
            let current = sqlx::query(&format!("SELECT {IMAGE_COLUMNS} FROM book_images WHERE id = ?"))
                .bind(source.id)
                .fetch_optional(&mut *tx)
                .await?;
            let source = match current {
                Some(row) => image_from_row(&row)?,
                None => return Err(anyhow!("source image {} no longer exists", source.id)),
            };
            let display_order = count_images_tx(&mut tx, source.book_id).await?;
            let row = sqlx::query(&format!(
                "INSERT INTO book_images \
                 (book_id, s3_key, display_order, is_primary, is_garbage, variant, source_image_id, created_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?) RETURNING {IMAGE_COLUMNS}"
            ))
            .bind(source.book_id)
            .bind(processed_key)
            .bind(display_order)
            .bind(source.is_primary)
            .bind(source.is_garbage)
            .bind(ImageVariant::Processed.as_str())
            .bind(source.id)
            .bind(now)
            .fetch_one(&mut *tx)
            .await?;
            if source.is_primary {
                sqlx::query("UPDATE book_images SET is_primary = 0 WHERE id = ?")
                    .bind(source.id)
                    .execute(&mut *tx)
                    .await?;
            }
            (image_from_row(&row)?, true)
        }
    };

    sqlx::query(
        "UPDATE image_processing_jobs \
         SET status = 'completed', processed_image_id = ?, model_used = ?, error_message = NULL, \
             completed_at = ?, updated_at = ? \
         WHERE id = ?",
    )
    .bind(image.id)
    .bind(model_used)
    .bind(now)
    .bind(now)
    .bind(job_id)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(FinalizedImage { image, created })
}
