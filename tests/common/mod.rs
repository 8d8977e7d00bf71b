#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use image::{DynamicImage, Rgb, RgbImage, Rgba, RgbaImage};
use moxon_worker::db::{self, Pool};
use moxon_worker::error::PipelineError;
use moxon_worker::imaging;
use moxon_worker::model::QueueKind;
use moxon_worker::queue::MessageQueue;
use moxon_worker::vision::Segmenter;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

pub async fn setup_pool() -> Pool {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    db::run_migrations(&pool).await.unwrap();
    pool
}

/// A solid-colour PNG of the given size.
pub fn png(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_pixel(width, height, Rgb([200, 180, 150]));
    imaging::encode_png(&DynamicImage::ImageRgb8(img)).unwrap()
}

#[derive(Debug, Clone, Copy)]
pub enum Behavior {
    /// Opaque dark subject covering the central 80% of the frame.
    Subject,
    /// Fully transparent output.
    Empty,
    Transient,
    Denied,
}

#[derive(Default)]
pub struct MockSegmenter {
    behaviors: HashMap<String, Behavior>,
    pub calls: Mutex<Vec<String>>,
}

impl MockSegmenter {
    pub fn new(behaviors: &[(&str, Behavior)]) -> Self {
        Self {
            behaviors: behaviors
                .iter()
                .map(|(m, b)| (m.to_string(), *b))
                .collect(),
            calls: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Segmenter for MockSegmenter {
    async fn remove_background(&self, model: &str, image_png: &[u8]) -> Result<Vec<u8>> {
        self.calls.lock().await.push(model.to_string());
        let input = image::load_from_memory(image_png)?;
        let (w, h) = (input.width(), input.height());
        let behavior = self
            .behaviors
            .get(model)
            .copied()
            .ok_or_else(|| anyhow!("unknown model {}", model))?;
        let mask = match behavior {
            Behavior::Subject => RgbaImage::from_fn(w, h, |x, y| {
                let inside = x >= w / 10 && x < w - w / 10 && y >= h / 10 && y < h - h / 10;
                if inside {
                    Rgba([30, 30, 30, 255])
                } else {
                    Rgba([0, 0, 0, 0])
                }
            }),
            Behavior::Empty => RgbaImage::new(w, h),
            Behavior::Transient => {
                return Err(PipelineError::Transient("HTTP 503 Service Unavailable".into()).into())
            }
            Behavior::Denied => return Err(PipelineError::AccessDenied("HTTP 403 Forbidden".into()).into()),
        };
        imaging::encode_png(&DynamicImage::ImageRgba8(mask))
    }
}

/// Queue producer that can be switched into a failing state.
#[derive(Default)]
pub struct FlakyQueue {
    pub failing: AtomicBool,
    pub sent: Mutex<Vec<(QueueKind, Value)>>,
}

impl FlakyQueue {
    pub fn failing() -> Arc<Self> {
        let q = Self::default();
        q.failing.store(true, Ordering::SeqCst);
        Arc::new(q)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl MessageQueue for FlakyQueue {
    async fn send(&self, kind: QueueKind, payload: Value) -> Result<i64> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(anyhow!("queue endpoint unreachable"));
        }
        let mut sent = self.sent.lock().await;
        sent.push((kind, payload));
        Ok(sent.len() as i64)
    }
}
