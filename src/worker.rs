//! Image processing worker: background removal, compositing, thumbnails.
use crate::config::Processing;
use crate::db::{self, ClaimOutcome, Pool};
use crate::error::PipelineError;
use crate::imaging::{self, Bounds, MaskLimits};
use crate::model::ProcessImageMessage;
use crate::storage::ObjectStore;
use crate::thumbnail;
use crate::vision::Segmenter;
use anyhow::{Context, Result};
use chrono::Utc;
use image::{DynamicImage, GenericImageView, RgbaImage};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessingSettings {
    pub models: Vec<String>,
    pub max_dimension: u32,
    pub min_output_dimension: u32,
    pub thumbnail_max_dimension: u32,
    pub limits: MaskLimits,
    pub brightness_threshold: f64,
}

impl From<&Processing> for ProcessingSettings {
    fn from(p: &Processing) -> Self {
        Self {
            models: p.models.clone(),
            max_dimension: p.max_dimension,
            min_output_dimension: p.min_output_dimension,
            thumbnail_max_dimension: p.thumbnail_max_dimension,
            limits: MaskLimits {
                min_subject_area_ratio: p.min_subject_area_ratio,
                max_aspect_ratio_drift: p.max_aspect_ratio_drift,
            },
            brightness_threshold: p.brightness_threshold,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Processed { image_id: i64, model: String },
    /// An earlier delivery or another job already produced the processed row.
    AlreadyProcessed { image_id: Option<i64> },
    Skipped(String),
}

/// Output of the CPU-bound steps, ready for upload.
struct Rendered {
    processed_png: Vec<u8>,
    thumb_key: String,
    thumb_bytes: Vec<u8>,
}

pub struct ImageWorker {
    pool: Pool,
    store: Arc<dyn ObjectStore>,
    segmenter: Arc<dyn Segmenter>,
    settings: ProcessingSettings,
}

impl ImageWorker {
    pub fn new(
        pool: Pool,
        store: Arc<dyn ObjectStore>,
        segmenter: Arc<dyn Segmenter>,
        settings: ProcessingSettings,
    ) -> Self {
        Self {
            pool,
            store,
            segmenter,
            settings,
        }
    }

    #[instrument(skip_all, fields(job_id = msg.job_id, book_id = msg.book_id))]
    pub async fn process(&self, msg: &ProcessImageMessage) -> Result<ProcessOutcome> {
        let job = match db::claim_image_job(&self.pool, msg.job_id, Utc::now()).await? {
            ClaimOutcome::Claimed(job) => job,
            ClaimOutcome::AlreadyCompleted(job) => {
                info!("job already completed; skipping redelivery");
                return Ok(ProcessOutcome::AlreadyProcessed {
                    image_id: job.processed_image_id,
                });
            }
            ClaimOutcome::Failed(_) => {
                return Ok(ProcessOutcome::Skipped(format!("job {} already failed", msg.job_id)));
            }
            ClaimOutcome::Missing => {
                return Ok(ProcessOutcome::Skipped(format!("job {} no longer exists", msg.job_id)));
            }
        };

        let source = db::get_image(&self.pool, job.image_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("image {}", job.image_id)))?;
        if source.s3_key != msg.source_key {
            warn!(message_key = %msg.source_key, stored_key = %source.s3_key, "message key differs from stored key; using stored key");
        }

        let bytes = self
            .store
            .get(&source.s3_key)
            .await
            .with_context(|| format!("failed to fetch source image {}", source.s3_key))?;

        let max_dim = if msg.options.max_dimension > 0 {
            msg.options.max_dimension.min(self.settings.max_dimension)
        } else {
            self.settings.max_dimension
        };
        let (input_png, dims) = tokio::task::spawn_blocking(move || -> Result<(Vec<u8>, (u32, u32))> {
            let img = image::load_from_memory(&bytes)
                .map_err(|e| PipelineError::Invalid(format!("source image is not decodable: {}", e)))?;
            let img = imaging::fit_within(img, max_dim);
            let dims = img.dimensions();
            Ok((imaging::encode_png(&img)?, dims))
        })
        .await??;

        let models = if msg.options.models.is_empty() {
            &self.settings.models
        } else {
            &msg.options.models
        };
        let (model, mask, bounds) = self.segment_with_fallback(&input_png, dims, models).await?;

        let processed_key = thumbnail::processed_key(&source.s3_key);
        let rendered = {
            let processed_key = processed_key.clone();
            let threshold = self.settings.brightness_threshold;
            let thumb_dim = self.settings.thumbnail_max_dimension;
            tokio::task::spawn_blocking(move || render(mask, bounds, threshold, thumb_dim, &processed_key))
                .await??
        };

        futures::try_join!(
            self.store.put(&processed_key, &rendered.processed_png),
            self.store.put(&rendered.thumb_key, &rendered.thumb_bytes),
        )
        .context("failed to upload processed image")?;

        let finalized =
            db::finalize_processed_image(&self.pool, job.id, &source, &processed_key, &model, Utc::now())
                .await?;
        if !finalized.created {
            info!(image_id = finalized.image.id, "processed image already recorded");
            return Ok(ProcessOutcome::AlreadyProcessed {
                image_id: Some(finalized.image.id),
            });
        }
        info!(image_id = finalized.image.id, %model, key = %processed_key, "image processed");
        Ok(ProcessOutcome::Processed {
            image_id: finalized.image.id,
            model,
        })
    }

    /// Try each model in order; the first mask that passes validation wins.
    /// Service errors propagate so the dispatcher can classify them; only
    /// quality rejections move on to the next model.
    async fn segment_with_fallback(
        &self,
        input_png: &[u8],
        dims: (u32, u32),
        models: &[String],
    ) -> Result<(String, RgbaImage, Bounds)> {
        let mut rejections = Vec::new();
        for model in models {
            let output = self
                .segmenter
                .remove_background(model, input_png)
                .await
                .with_context(|| format!("segmentation with {} failed", model))?;

            let limits = self.settings.limits;
            let min_dim = self.settings.min_output_dimension;
            let checked = tokio::task::spawn_blocking(move || -> Result<(RgbaImage, Bounds), String> {
                let rgba = image::load_from_memory(&output)
                    .map_err(|e| format!("undecodable output: {}", e))?
                    .to_rgba8();
                let bounds = imaging::validate_mask(dims, &rgba, &limits).map_err(|i| i.to_string())?;
                imaging::validate_dimensions(bounds.width, bounds.height, min_dim)?;
                Ok((rgba, bounds))
            })
            .await?;

            match checked {
                Ok((rgba, bounds)) => return Ok((model.clone(), rgba, bounds)),
                Err(reason) => {
                    warn!(%model, %reason, "segmentation output rejected; trying next model");
                    rejections.push(format!("{}: {}", model, reason));
                }
            }
        }
        Err(PipelineError::OutputQuality(format!(
            "no segmentation model produced a usable result ({})",
            rejections.join("; ")
        ))
        .into())
    }

    /// Terminal failure: record it on the job and log the full error chain.
    pub async fn fail(&self, job_id: i64, err: &anyhow::Error) -> Result<()> {
        error!(job_id, error = ?err, "image processing failed");
        db::fail_image_job(&self.pool, job_id, &format!("{:#}", err), Utc::now()).await?;
        Ok(())
    }
}

fn render(
    mask: RgbaImage,
    bounds: Bounds,
    brightness_threshold: f64,
    thumb_dim: u32,
    processed_key: &str,
) -> Result<Rendered> {
    let brightness = imaging::subject_brightness(&mask).unwrap_or(brightness_threshold);
    let background = imaging::choose_background(brightness, brightness_threshold);
    let flat = DynamicImage::ImageRgb8(imaging::composite(&mask, bounds, background));
    let processed_png = imaging::encode_png(&flat)?;
    let thumb_key = thumbnail::thumbnail_key(processed_key);
    let thumb_bytes = thumbnail::render_thumbnail(&flat, thumb_dim, &thumb_key)?;
    Ok(Rendered {
        processed_png,
        thumb_key,
        thumb_bytes,
    })
}
