//! Detection of images that do not show the book (seller banners, shipping
//! labels, unrelated objects, other books).
//!
//! The detector's precision is not trusted: on sets of at least
//! `min_examined_for_guard` images, a result flagging more than
//! `max_flagged_fraction` of them is reported but not applied.
use crate::config::Garbage;
use crate::db::{self, Pool};
use crate::llm::{ImageInput, LlmClient};
use crate::model::{Book, BookImage};
use crate::storage::ObjectStore;
use crate::thumbnail::thumbnail_key;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Classifies the given images; returns zero-based positions into `images`.
#[async_trait]
pub trait GarbageClassifier: Send + Sync {
    async fn classify(&self, book: &Book, images: &[ImageInput]) -> Result<Vec<i64>>;
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GarbageReport {
    pub book_id: i64,
    /// Size of the image set shown to the detector.
    pub examined: usize,
    pub flagged_image_ids: Vec<i64>,
    /// Raw indices that fell outside the examined set.
    pub rejected_indices: Vec<i64>,
    pub deleted_image_ids: Vec<i64>,
    /// Storage keys whose deletion failed (e.g. missing delete permission).
    pub delete_failures: Vec<String>,
    /// Too many images flagged; nothing was applied.
    pub suspicious: bool,
    pub applied: bool,
}

#[derive(Debug, Clone)]
pub struct GarbageSettings {
    pub delete_flagged: bool,
    pub max_flagged_fraction: f64,
    pub min_examined_for_guard: usize,
}

impl From<&Garbage> for GarbageSettings {
    fn from(g: &Garbage) -> Self {
        Self {
            delete_flagged: g.delete_flagged,
            max_flagged_fraction: g.max_flagged_fraction,
            min_examined_for_guard: g.min_examined_for_guard,
        }
    }
}

static FENCED: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)```(?:json)?\s*(.*?)```").unwrap());
static JSON_ARRAY: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[[\d\s,]*\]").unwrap());

/// Pull garbage indices out of a model reply. Accepts `{"garbage_indices": [..]}`,
/// a bare array, or either inside a code fence.
pub fn parse_garbage_indices(text: &str) -> Result<Vec<i64>> {
    let body = FENCED
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or(text)
        .trim();

    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        let list = match &value {
            serde_json::Value::Array(_) => Some(&value),
            serde_json::Value::Object(map) => map.get("garbage_indices"),
            _ => None,
        };
        if let Some(serde_json::Value::Array(items)) = list {
            return Ok(items.iter().filter_map(|v| v.as_i64()).collect());
        }
    }

    let array = JSON_ARRAY
        .find(body)
        .ok_or_else(|| anyhow!("no index list in detector reply"))?;
    let items: Vec<i64> = serde_json::from_str(array.as_str()).context("malformed index list")?;
    Ok(items)
}

/// Split raw indices into valid positions of a list of length `len` and the
/// rejected remainder. Valid positions are deduplicated and sorted.
pub fn partition_indices(raw: &[i64], len: usize) -> (Vec<usize>, Vec<i64>) {
    let mut valid = BTreeSet::new();
    let mut rejected = Vec::new();
    for &i in raw {
        if i >= 0 && (i as usize) < len {
            valid.insert(i as usize);
        } else {
            rejected.push(i);
        }
    }
    (valid.into_iter().collect(), rejected)
}

pub struct GarbageDetector {
    pool: Pool,
    store: Arc<dyn ObjectStore>,
    classifier: Arc<dyn GarbageClassifier>,
    settings: GarbageSettings,
}

impl GarbageDetector {
    pub fn new(
        pool: Pool,
        store: Arc<dyn ObjectStore>,
        classifier: Arc<dyn GarbageClassifier>,
        settings: GarbageSettings,
    ) -> Self {
        Self {
            pool,
            store,
            classifier,
            settings,
        }
    }

    fn over_flagged(&self, flagged: usize, examined: usize) -> bool {
        examined >= self.settings.min_examined_for_guard
            && flagged as f64 / examined as f64 > self.settings.max_flagged_fraction
    }

    /// Classify the book's visible images and, when `apply` is set, flag (and
    /// optionally delete) the ones judged unrelated.
    #[instrument(skip(self))]
    pub async fn detect(&self, book_id: i64, apply: bool) -> Result<GarbageReport> {
        let book = db::get_book(&self.pool, book_id)
            .await?
            .ok_or_else(|| anyhow!("book {} not found", book_id))?;
        // The filtered set is both what the model sees and what its indices
        // refer to.
        let images = db::list_analysis_images(&self.pool, book_id).await?;
        let mut report = GarbageReport {
            book_id,
            examined: images.len(),
            ..Default::default()
        };
        if images.is_empty() {
            return Ok(report);
        }

        let mut inputs = Vec::with_capacity(images.len());
        for img in &images {
            let data = self
                .store
                .get(&img.s3_key)
                .await
                .with_context(|| format!("failed to load {}", img.s3_key))?;
            inputs.push(ImageInput::from_key(&img.s3_key, data));
        }

        let raw = self.classifier.classify(&book, &inputs).await?;
        let (valid, rejected) = partition_indices(&raw, images.len());
        if !rejected.is_empty() {
            warn!(?rejected, examined = images.len(), "detector returned out-of-range indices");
        }
        report.rejected_indices = rejected;
        let flagged: Vec<&BookImage> = valid.iter().map(|&i| &images[i]).collect();
        report.flagged_image_ids = flagged.iter().map(|img| img.id).collect();

        if self.over_flagged(flagged.len(), images.len()) {
            warn!(
                flagged = flagged.len(),
                examined = images.len(),
                "detector flagged an implausible share of images; not applying"
            );
            report.suspicious = true;
            return Ok(report);
        }
        if !apply || flagged.is_empty() {
            return Ok(report);
        }

        db::mark_garbage(&self.pool, &report.flagged_image_ids).await?;
        report.applied = true;
        info!(count = flagged.len(), "flagged garbage images");

        if self.settings.delete_flagged {
            for img in flagged {
                let mut ok = true;
                for key in [img.s3_key.clone(), thumbnail_key(&img.s3_key)] {
                    if let Err(err) = self.store.delete(&key).await {
                        warn!(?err, %key, "failed to delete garbage object");
                        report.delete_failures.push(key);
                        ok = false;
                    }
                }
                // Keep the row while its object still exists so orphan cleanup
                // can find it later.
                if ok && db::delete_image(&self.pool, img.id).await? {
                    report.deleted_image_ids.push(img.id);
                }
            }
        }
        Ok(report)
    }
}

const GARBAGE_PROMPT: &str = "The images above were attached to a listing for the book described below. \
Identify every image that does NOT show this book: seller logos or banners, shipping labels, packaging, \
unrelated objects, or a different book. Images are numbered from 0 in the order given. \
When in doubt, keep the image. Reply with JSON only: {\"garbage_indices\": [..]}.";

/// Garbage detection backed by the messages API.
pub struct LlmGarbageClassifier {
    client: LlmClient,
    model: String,
}

impl LlmGarbageClassifier {
    pub fn new(client: LlmClient, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }
}

#[async_trait]
impl GarbageClassifier for LlmGarbageClassifier {
    async fn classify(&self, book: &Book, images: &[ImageInput]) -> Result<Vec<i64>> {
        let prompt = format!(
            "{}\n\nTitle: {}\nAuthor: {}\nImage count: {}",
            GARBAGE_PROMPT,
            book.title,
            book.author.as_deref().unwrap_or("unknown"),
            images.len()
        );
        let completion = self
            .client
            .complete(&self.model, 1024, None, &prompt, images)
            .await?;
        parse_garbage_indices(&completion.text)
    }
}
