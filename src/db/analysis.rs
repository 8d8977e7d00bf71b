use super::model::{analysis_job_from_row, book_analysis_from_row, ANALYSIS_JOB_COLUMNS};
use super::Pool;
use crate::model::{AnalysisJob, AnalysisStatus, BookAnalysis};
use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{instrument, warn};

#[instrument(skip_all)]
pub async fn create_analysis_job(
    pool: &Pool,
    book_id: i64,
    model_id: &str,
    now: DateTime<Utc>,
) -> Result<AnalysisJob> {
    let row = sqlx::query(&format!(
        "INSERT INTO analysis_jobs (book_id, status, model_id, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?) RETURNING {ANALYSIS_JOB_COLUMNS}"
    ))
    .bind(book_id)
    .bind(AnalysisStatus::Pending.as_str())
    .bind(model_id)
    .bind(now)
    .bind(now)
    .fetch_one(pool)
    .await?;
    analysis_job_from_row(&row)
}

#[instrument(skip_all)]
pub async fn get_analysis_job(pool: &Pool, job_id: i64) -> Result<Option<AnalysisJob>> {
    let row = sqlx::query(&format!(
        "SELECT {ANALYSIS_JOB_COLUMNS} FROM analysis_jobs WHERE id = ?"
    ))
    .bind(job_id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(analysis_job_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn latest_analysis_job(pool: &Pool, book_id: i64) -> Result<Option<AnalysisJob>> {
    let row = sqlx::query(&format!(
        "SELECT {ANALYSIS_JOB_COLUMNS} FROM analysis_jobs WHERE book_id = ? ORDER BY id DESC LIMIT 1"
    ))
    .bind(book_id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(analysis_job_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn active_analysis_job(pool: &Pool, book_id: i64) -> Result<Option<AnalysisJob>> {
    let row = sqlx::query(&format!(
        "SELECT {ANALYSIS_JOB_COLUMNS} FROM analysis_jobs \
         WHERE book_id = ? AND status IN ('pending', 'running') ORDER BY id DESC LIMIT 1"
    ))
    .bind(book_id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(analysis_job_from_row).transpose()
}

/// pending -> running. False when the job is not pending.
#[instrument(skip_all)]
pub async fn mark_analysis_running(pool: &Pool, job_id: i64, now: DateTime<Utc>) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE analysis_jobs SET status = 'running', started_at = ?, updated_at = ? \
         WHERE id = ? AND status = 'pending'",
    )
    .bind(now)
    .bind(now)
    .bind(job_id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() > 0)
}

/// {pending, running} -> failed. Status, message and completion time are one
/// statement so no reader sees a message on a job that is still running.
#[instrument(skip_all)]
pub async fn mark_analysis_failed(
    pool: &Pool,
    job_id: i64,
    message: &str,
    now: DateTime<Utc>,
) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE analysis_jobs SET status = 'failed', error_message = ?, completed_at = ?, updated_at = ? \
         WHERE id = ? AND status IN ('pending', 'running')",
    )
    .bind(message)
    .bind(now)
    .bind(now)
    .bind(job_id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() > 0)
}

/// running -> completed, storing the valuation in the same transaction.
#[instrument(skip_all)]
pub async fn complete_analysis(
    pool: &Pool,
    job_id: i64,
    analysis: &BookAnalysis,
    issue: Option<&str>,
    now: DateTime<Utc>,
) -> Result<bool> {
    let mut tx = pool.begin().await?;
    let res = sqlx::query(
        "UPDATE analysis_jobs SET status = 'completed', truncated = ?, issue = ?, completed_at = ?, updated_at = ? \
         WHERE id = ? AND status = 'running'",
    )
    .bind(analysis.truncated)
    .bind(issue)
    .bind(now)
    .bind(now)
    .bind(job_id)
    .execute(&mut *tx)
    .await?;
    if res.rows_affected() == 0 {
        // Failed as stale while the model was still generating.
        warn!(job_id, "analysis job no longer running; discarding result");
        return Ok(false);
    }
    sqlx::query(
        "INSERT INTO book_analyses (book_id, report, value_low, value_mid, value_high, model_id, truncated, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(book_id) DO UPDATE SET report = excluded.report, value_low = excluded.value_low, \
             value_mid = excluded.value_mid, value_high = excluded.value_high, \
             model_id = excluded.model_id, truncated = excluded.truncated, updated_at = excluded.updated_at",
    )
    .bind(analysis.book_id)
    .bind(&analysis.report)
    .bind(analysis.valuation.low)
    .bind(analysis.valuation.mid)
    .bind(analysis.valuation.high)
    .bind(&analysis.model_id)
    .bind(analysis.truncated)
    .bind(analysis.updated_at)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(true)
}

/// Fail jobs of a book that have been pending or running since before
/// `cutoff`. Returns the number of jobs failed.
#[instrument(skip_all)]
pub async fn fail_stale_analysis_jobs(
    pool: &Pool,
    book_id: i64,
    cutoff: DateTime<Utc>,
    message: &str,
    now: DateTime<Utc>,
) -> Result<u64> {
    let res = sqlx::query(
        "UPDATE analysis_jobs SET status = 'failed', error_message = ?, completed_at = ?, updated_at = ? \
         WHERE book_id = ? AND status IN ('pending', 'running') \
           AND julianday(COALESCE(started_at, created_at)) < julianday(?)",
    )
    .bind(message)
    .bind(now)
    .bind(now)
    .bind(book_id)
    .bind(cutoff)
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}

#[instrument(skip_all)]
pub async fn get_book_analysis(pool: &Pool, book_id: i64) -> Result<Option<BookAnalysis>> {
    let row = sqlx::query(
        "SELECT book_id, report, value_low, value_mid, value_high, model_id, truncated, updated_at \
         FROM book_analyses WHERE book_id = ?",
    )
    .bind(book_id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(book_analysis_from_row).transpose()
}
