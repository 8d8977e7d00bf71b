//! Operator maintenance: moving misfiled images and removing orphaned objects.
use crate::db::{self, Pool};
use crate::model::BookImage;
use crate::storage::ObjectStore;
use crate::thumbnail;
use anyhow::Result;
use serde::Serialize;
use tracing::{info, instrument, warn};

/// Root under which every book-owned object is stored.
pub const BOOKS_PREFIX: &str = "books/";

#[instrument(skip(pool))]
pub async fn reassign_image(pool: &Pool, image_id: i64, target_book_id: i64) -> Result<BookImage> {
    let before = db::get_image(pool, image_id).await?;
    let image = db::reassign_image(pool, image_id, target_book_id).await?;
    info!(
        from = before.map(|b| b.book_id),
        to = target_book_id,
        display_order = image.display_order,
        "image reassigned"
    );
    Ok(image)
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct OrphanReport {
    pub scanned: usize,
    pub orphans: Vec<String>,
    pub deleted: Vec<String>,
    pub failures: Vec<String>,
    pub dry_run: bool,
}

/// Find stored objects that no image row refers to. A thumbnail counts as
/// referenced when its source image is. Deletes them unless `dry_run`.
#[instrument(skip(pool, store))]
pub async fn cleanup_orphans(pool: &Pool, store: &dyn ObjectStore, dry_run: bool) -> Result<OrphanReport> {
    let known = db::all_image_keys(pool).await?;
    let keys = store.list(BOOKS_PREFIX).await?;
    let mut report = OrphanReport {
        scanned: keys.len(),
        dry_run,
        ..Default::default()
    };
    for key in keys {
        let source = thumbnail::source_key_for_thumbnail(&key).unwrap_or_else(|| key.clone());
        if known.contains(&source) {
            continue;
        }
        report.orphans.push(key.clone());
        if dry_run {
            continue;
        }
        match store.delete(&key).await {
            Ok(()) => report.deleted.push(key),
            Err(err) => {
                warn!(?err, %key, "failed to delete orphan");
                report.failures.push(key);
            }
        }
    }
    info!(
        scanned = report.scanned,
        orphans = report.orphans.len(),
        deleted = report.deleted.len(),
        dry_run,
        "orphan scan finished"
    );
    Ok(report)
}
