//! Background-removal (segmentation) service client.
use crate::config::Vision;
use crate::error::{classify_status, PipelineError};
use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Produces an RGBA image whose alpha channel is the subject mask.
#[async_trait]
pub trait Segmenter: Send + Sync {
    async fn remove_background(&self, model: &str, image_png: &[u8]) -> Result<Vec<u8>>;
}

#[derive(Serialize)]
struct SegmentRequest<'a> {
    model: &'a str,
    image: String,
}

#[derive(Deserialize)]
struct SegmentResponse {
    image: String,
}

#[derive(Clone)]
pub struct HttpSegmenter {
    http: Client,
    base_url: Url,
}

impl fmt::Debug for HttpSegmenter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpSegmenter")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl HttpSegmenter {
    pub fn from_config(cfg: &Vision) -> Result<Self> {
        let base_url = Url::parse(&cfg.base_url).context("invalid vision.base_url")?;
        let http = Client::builder()
            .user_agent("moxon-worker/0.1")
            .timeout(Duration::from_secs(cfg.timeout_seconds))
            .build()
            .context("failed to build segmentation http client")?;
        Ok(Self { http, base_url })
    }
}

#[async_trait]
impl Segmenter for HttpSegmenter {
    #[instrument(skip(self, image_png), fields(len = image_png.len()))]
    async fn remove_background(&self, model: &str, image_png: &[u8]) -> Result<Vec<u8>> {
        let endpoint = self
            .base_url
            .join("v1/remove-background")
            .context("invalid segmentation endpoint")?;
        let body = SegmentRequest {
            model,
            image: STANDARD.encode(image_png),
        };
        let res = self
            .http
            .post(endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    anyhow::Error::from(PipelineError::Transient(format!(
                        "segmentation request failed: {}",
                        e
                    )))
                } else {
                    anyhow::Error::new(e).context("segmentation request failed")
                }
            })?;

        let status = res.status();
        if !status.is_success() {
            let text = res.text().await.unwrap_or_default();
            warn!(%status, model, "segmentation service error");
            return Err(classify_status(status, &text).into());
        }
        let payload: SegmentResponse = res
            .json()
            .await
            .context("invalid segmentation response")?;
        let bytes = STANDARD
            .decode(payload.image.as_bytes())
            .map_err(|e| PipelineError::Invalid(format!("segmentation image not base64: {}", e)))?;
        debug!(model, len = bytes.len(), "segmentation complete");
        Ok(bytes)
    }
}
