//! Row mapping for the entities in `crate::model`.
//!
//! Status columns are stored as text; an unknown value is a hard error rather
//! than a silent default.

use crate::model::{
    AnalysisJob, AnalysisStatus, Book, BookAnalysis, BookImage, ImageJob, ImageJobStatus,
    ImageVariant, Valuation,
};
use anyhow::{anyhow, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

pub(crate) const BOOK_COLUMNS: &str = "id, title, author, created_at";

pub(crate) const IMAGE_COLUMNS: &str =
    "id, book_id, s3_key, display_order, is_primary, is_garbage, variant, source_image_id, created_at";

pub(crate) const IMAGE_JOB_COLUMNS: &str = "id, book_id, image_id, status, attempt, model_used, \
     processed_image_id, error_message, created_at, updated_at, started_at, completed_at";

pub(crate) const ANALYSIS_JOB_COLUMNS: &str = "id, book_id, status, model_id, error_message, \
     truncated, issue, created_at, updated_at, started_at, completed_at";

pub(crate) fn book_from_row(row: &SqliteRow) -> Result<Book> {
    Ok(Book {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        author: row.try_get("author")?,
        created_at: row.try_get("created_at")?,
    })
}

pub(crate) fn image_from_row(row: &SqliteRow) -> Result<BookImage> {
    let variant: String = row.try_get("variant")?;
    Ok(BookImage {
        id: row.try_get("id")?,
        book_id: row.try_get("book_id")?,
        s3_key: row.try_get("s3_key")?,
        display_order: row.try_get("display_order")?,
        is_primary: row.try_get("is_primary")?,
        is_garbage: row.try_get("is_garbage")?,
        variant: ImageVariant::parse(&variant)
            .ok_or_else(|| anyhow!("unknown image variant {}", variant))?,
        source_image_id: row.try_get("source_image_id")?,
        created_at: row.try_get("created_at")?,
    })
}

pub(crate) fn image_job_from_row(row: &SqliteRow) -> Result<ImageJob> {
    let status: String = row.try_get("status")?;
    Ok(ImageJob {
        id: row.try_get("id")?,
        book_id: row.try_get("book_id")?,
        image_id: row.try_get("image_id")?,
        status: ImageJobStatus::parse(&status)
            .ok_or_else(|| anyhow!("unknown image job status {}", status))?,
        attempt: row.try_get("attempt")?,
        model_used: row.try_get("model_used")?,
        processed_image_id: row.try_get("processed_image_id")?,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

pub(crate) fn analysis_job_from_row(row: &SqliteRow) -> Result<AnalysisJob> {
    let status: String = row.try_get("status")?;
    Ok(AnalysisJob {
        id: row.try_get("id")?,
        book_id: row.try_get("book_id")?,
        status: AnalysisStatus::parse(&status)
            .ok_or_else(|| anyhow!("unknown analysis status {}", status))?,
        model_id: row.try_get("model_id")?,
        error_message: row.try_get("error_message")?,
        truncated: row.try_get("truncated")?,
        issue: row.try_get("issue")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

pub(crate) fn book_analysis_from_row(row: &SqliteRow) -> Result<BookAnalysis> {
    Ok(BookAnalysis {
        book_id: row.try_get("book_id")?,
        report: row.try_get("report")?,
        valuation: Valuation {
            low: row.try_get("value_low")?,
            mid: row.try_get("value_mid")?,
            high: row.try_get("value_high")?,
        },
        model_id: row.try_get("model_id")?,
        truncated: row.try_get("truncated")?,
        updated_at: row.try_get("updated_at")?,
    })
}
