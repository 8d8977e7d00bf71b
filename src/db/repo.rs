use super::model::{book_from_row, image_from_row, BOOK_COLUMNS, IMAGE_COLUMNS};
use super::Pool;
use crate::model::{Book, BookImage, ImageVariant};
use anyhow::{anyhow, Result};
use chrono::Utc;
use sqlx::{Sqlite, Transaction};
use std::collections::HashSet;
use tracing::instrument;

#[instrument(skip_all)]
pub async fn insert_book(pool: &Pool, title: &str, author: Option<&str>) -> Result<i64> {
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO books (title, author, created_at) VALUES (?, ?, ?) RETURNING id",
    )
    .bind(title)
    .bind(author)
    .bind(Utc::now())
    .fetch_one(pool)
    .await?;
    Ok(id)
}

#[instrument(skip_all)]
pub async fn get_book(pool: &Pool, book_id: i64) -> Result<Option<Book>> {
    let row = sqlx::query(&format!("SELECT {BOOK_COLUMNS} FROM books WHERE id = ?"))
        .bind(book_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(book_from_row).transpose()
}

/// Number of image rows for a book, garbage included. Used as the next
/// display order.
pub async fn count_images(pool: &Pool, book_id: i64) -> Result<i64> {
    let cnt: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM book_images WHERE book_id = ?")
        .bind(book_id)
        .fetch_one(pool)
        .await?;
    Ok(cnt)
}

pub(crate) async fn count_images_tx(tx: &mut Transaction<'_, Sqlite>, book_id: i64) -> Result<i64> {
    let cnt: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM book_images WHERE book_id = ?")
        .bind(book_id)
        .fetch_one(&mut **tx)
        .await?;
    Ok(cnt)
}

/// Insert an original image at the end of the book's display order. The first
/// image of a book without a primary becomes primary.
#[instrument(skip_all)]
pub async fn insert_original_image(pool: &Pool, book_id: i64, s3_key: &str) -> Result<BookImage> {
    let mut tx = pool.begin().await?;
    let display_order = count_images_tx(&mut tx, book_id).await?;
    let has_primary: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM book_images WHERE book_id = ? AND is_primary = 1)",
    )
    .bind(book_id)
    .fetch_one(&mut *tx)
    .await?;
    let row = sqlx::query(&format!(
        "INSERT INTO book_images (book_id, s3_key, display_order, is_primary, variant, created_at) \
         VALUES (?, ?, ?, ?, ?, ?) RETURNING {IMAGE_COLUMNS}"
    ))
    .bind(book_id)
    .bind(s3_key)
    .bind(display_order)
    .bind(!has_primary)
    .bind(ImageVariant::Original.as_str())
    .bind(Utc::now())
    .fetch_one(&mut *tx)
    .await?;
    let image = image_from_row(&row)?;
    tx.commit().await?;
    Ok(image)
}

#[instrument(skip_all)]
pub async fn get_image(pool: &Pool, image_id: i64) -> Result<Option<BookImage>> {
    let row = sqlx::query(&format!("SELECT {IMAGE_COLUMNS} FROM book_images WHERE id = ?"))
        .bind(image_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(image_from_row).transpose()
}

/// All images of a book in display order.
#[instrument(skip_all)]
pub async fn list_images(pool: &Pool, book_id: i64) -> Result<Vec<BookImage>> {
    let rows = sqlx::query(&format!(
        "SELECT {IMAGE_COLUMNS} FROM book_images WHERE book_id = ? ORDER BY display_order, id"
    ))
    .bind(book_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(image_from_row).collect()
}

/// The image set shown to vision models, in display order. Garbage is
/// excluded, and an original is replaced by its processed variant while that
/// variant is visible in the same book. Indices returned by a model refer to
/// positions in this list.
#[instrument(skip_all)]
pub async fn list_analysis_images(pool: &Pool, book_id: i64) -> Result<Vec<BookImage>> {
    let rows = sqlx::query(&format!(
        "SELECT {IMAGE_COLUMNS} FROM book_images src WHERE src.book_id = ? AND src.is_garbage = 0 \
         AND NOT EXISTS (SELECT 1 FROM book_images p \
             WHERE p.source_image_id = src.id AND p.book_id = src.book_id AND p.is_garbage = 0) \
         ORDER BY display_order, id"
    ))
    .bind(book_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(image_from_row).collect()
}

#[instrument(skip_all)]
pub async fn mark_garbage(pool: &Pool, image_ids: &[i64]) -> Result<u64> {
    let mut tx = pool.begin().await?;
    let mut changed = 0;
    for id in image_ids {
        changed += sqlx::query("UPDATE book_images SET is_garbage = 1, is_primary = 0 WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
    }
    tx.commit().await?;
    Ok(changed)
}

#[instrument(skip_all)]
pub async fn delete_image(pool: &Pool, image_id: i64) -> Result<bool> {
    let res = sqlx::query("DELETE FROM book_images WHERE id = ?")
        .bind(image_id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() > 0)
}

/// Move an image to another book, appended after the target's images and
/// never primary there.
#[instrument(skip_all)]
pub async fn reassign_image(pool: &Pool, image_id: i64, target_book_id: i64) -> Result<BookImage> {
    let mut tx = pool.begin().await?;
    let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM books WHERE id = ?)")
        .bind(target_book_id)
        .fetch_one(&mut *tx)
        .await?;
    if !exists {
        return Err(anyhow!("book {} not found", target_book_id));
    }
    let display_order = count_images_tx(&mut tx, target_book_id).await?;
    let row = sqlx::query(&format!(
        "UPDATE book_images SET book_id = ?, display_order = ?, is_primary = 0 \
         WHERE id = ? RETURNING {IMAGE_COLUMNS}"
    ))
    .bind(target_book_id)
    .bind(display_order)
    .bind(image_id)
    .fetch_optional(&mut *tx)
    .await?;
    let Some(row) = row else {
        return Err(anyhow!("image {} not found", image_id));
    };
    let image = image_from_row(&row)?;
    sqlx::query(
        "UPDATE image_processing_jobs SET book_id = ? WHERE image_id = ? OR processed_image_id = ?",
    )
    .bind(target_book_id)
    .bind(image_id)
    .bind(image_id)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(image)
}

/// Every storage key referenced by an image row.
pub async fn all_image_keys(pool: &Pool) -> Result<HashSet<String>> {
    let keys: Vec<String> = sqlx::query_scalar("SELECT s3_key FROM book_images")
        .fetch_all(pool)
        .await?;
    Ok(keys.into_iter().collect())
}
