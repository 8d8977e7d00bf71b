mod common;

use anyhow::Result;
use async_trait::async_trait;
use common::{png, setup_pool, Behavior, MockSegmenter};
use image::GenericImageView;
use moxon_worker::analysis::{AnalysisService, AnalysisSettings, ValuationModel, ValuationRequest};
use moxon_worker::db::{self, Pool};
use moxon_worker::dispatch::{DispatchSettings, Dispatcher};
use moxon_worker::imaging::MaskLimits;
use moxon_worker::llm::Completion;
use moxon_worker::model::{
    AnalysisStatus, BookImage, ImageJobStatus, ImageVariant, ProcessImageMessage, ProcessingOptions, QueueKind,
};
use moxon_worker::queue::SqliteQueue;
use moxon_worker::storage::{FsObjectStore, ObjectStore};
use moxon_worker::thumbnail;
use moxon_worker::worker::{ImageWorker, ProcessOutcome, ProcessingSettings};
use std::sync::Arc;
use std::time::Duration;

fn settings() -> ProcessingSettings {
    ProcessingSettings {
        models: vec!["birefnet-general".into(), "u2net".into()],
        max_dimension: 2048,
        min_output_dimension: 100,
        thumbnail_max_dimension: 64,
        limits: MaskLimits {
            min_subject_area_ratio: 0.05,
            max_aspect_ratio_drift: 0.5,
        },
        brightness_threshold: 128.0,
    }
}

struct Fixture {
    pool: Pool,
    store: Arc<FsObjectStore>,
    book_id: i64,
    source: BookImage,
    _dir: tempfile::TempDir,
}

async fn fixture() -> Fixture {
    let pool = setup_pool().await;
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FsObjectStore::new(dir.path()));
    let book_id = db::insert_book(&pool, "The Hobbit", Some("Tolkien")).await.unwrap();
    let key = format!("books/{}/cover.png", book_id);
    store.put(&key, &png(200, 300)).await.unwrap();
    let source = db::insert_original_image(&pool, book_id, &key).await.unwrap();
    Fixture {
        pool,
        store,
        book_id,
        source,
        _dir: dir,
    }
}

impl Fixture {
    fn worker(&self, segmenter: Arc<MockSegmenter>) -> ImageWorker {
        ImageWorker::new(self.pool.clone(), self.store.clone(), segmenter, settings())
    }

    async fn message(&self) -> ProcessImageMessage {
        let (job, created) = db::create_image_job(&self.pool, self.book_id, self.source.id, chrono::Utc::now())
            .await
            .unwrap();
        assert!(created);
        ProcessImageMessage {
            job_id: job.id,
            book_id: self.book_id,
            image_id: self.source.id,
            source_key: self.source.s3_key.clone(),
            options: ProcessingOptions {
                models: Vec::new(),
                max_dimension: 2048,
            },
        }
    }
}

#[tokio::test]
async fn falls_back_to_next_model_and_transfers_primary() {
    let fx = fixture().await;
    let segmenter = Arc::new(MockSegmenter::new(&[
        ("birefnet-general", Behavior::Empty),
        ("u2net", Behavior::Subject),
    ]));
    let worker = fx.worker(segmenter.clone());
    let msg = fx.message().await;

    let outcome = worker.process(&msg).await.unwrap();
    let image_id = match outcome {
        ProcessOutcome::Processed { image_id, model } => {
            assert_eq!(model, "u2net");
            image_id
        }
        other => panic!("unexpected outcome {:?}", other),
    };
    assert_eq!(*segmenter.calls.lock().await, vec!["birefnet-general", "u2net"]);

    let images = db::list_images(&fx.pool, fx.book_id).await.unwrap();
    assert_eq!(images.len(), 2);
    let source = images.iter().find(|i| i.id == fx.source.id).unwrap();
    let processed = images.iter().find(|i| i.id == image_id).unwrap();
    assert!(!source.is_primary);
    assert!(processed.is_primary);
    assert_eq!(processed.variant, ImageVariant::Processed);
    assert_eq!(processed.source_image_id, Some(fx.source.id));
    assert_eq!(processed.display_order, 1);

    let key = thumbnail::processed_key(&fx.source.s3_key);
    assert_eq!(processed.s3_key, key);
    let bytes = fx.store.get(&key).await.unwrap();
    let out = image::load_from_memory(&bytes).unwrap();
    // Cropped to the subject: the central 80% of 200x300.
    assert_eq!(out.dimensions(), (160, 240));
    assert!(fx.store.exists(&thumbnail::thumbnail_key(&key)).await.unwrap());

    let job = db::get_image_job(&fx.pool, msg.job_id).await.unwrap().unwrap();
    assert_eq!(job.status, ImageJobStatus::Completed);
    assert_eq!(job.model_used.as_deref(), Some("u2net"));
    assert_eq!(job.processed_image_id, Some(image_id));
    assert_eq!(job.attempt, 1);
}

#[tokio::test]
async fn redelivery_and_second_job_reuse_processed_row() {
    let fx = fixture().await;
    let segmenter = Arc::new(MockSegmenter::new(&[("birefnet-general", Behavior::Subject)]));
    let worker = fx.worker(segmenter.clone());

    let first = fx.message().await;
    let ProcessOutcome::Processed { image_id, .. } = worker.process(&first).await.unwrap() else {
        panic!("first delivery should process");
    };

    // Same message delivered again.
    assert_eq!(
        worker.process(&first).await.unwrap(),
        ProcessOutcome::AlreadyProcessed {
            image_id: Some(image_id)
        }
    );

    // A brand-new job for the same source image.
    let second = fx.message().await;
    assert_ne!(second.job_id, first.job_id);
    assert_eq!(
        worker.process(&second).await.unwrap(),
        ProcessOutcome::AlreadyProcessed {
            image_id: Some(image_id)
        }
    );

    let processed: Vec<_> = db::list_images(&fx.pool, fx.book_id)
        .await
        .unwrap()
        .into_iter()
        .filter(|i| i.source_image_id == Some(fx.source.id))
        .collect();
    assert_eq!(processed.len(), 1);
    let job = db::get_image_job(&fx.pool, second.job_id).await.unwrap().unwrap();
    assert_eq!(job.status, ImageJobStatus::Completed);
    assert_eq!(job.processed_image_id, Some(image_id));
}

struct StaticModel;

#[async_trait]
impl ValuationModel for StaticModel {
    fn model_id(&self) -> &str {
        "static"
    }

    async fn generate(&self, _request: &ValuationRequest) -> Result<Completion> {
        Ok(Completion {
            text: "## Recommendations\nKeep.\n- **Low**: $100\n- **Mid**: $150\n- **High**: $200\n".into(),
            stop_reason: Some("end_turn".into()),
        })
    }
}

fn dispatcher(fx: &Fixture, segmenter: Arc<MockSegmenter>, max_attempts: u32) -> (Dispatcher, SqliteQueue, AnalysisService) {
    let queue = SqliteQueue::new(fx.pool.clone(), 900);
    let make_analysis = || {
        AnalysisService::new(
            fx.pool.clone(),
            fx.store.clone(),
            Arc::new(StaticModel),
            Arc::new(queue.clone()),
            AnalysisSettings {
                max_tokens: 1000,
                stale_after_minutes: 15,
                required_sections: vec!["Recommendations".into()],
                max_images: 5,
            },
        )
    };
    let d = Dispatcher::new(
        queue.clone(),
        fx.worker(segmenter),
        make_analysis(),
        DispatchSettings {
            max_attempts,
            max_backoff_secs: 300,
            job_timeout: Duration::from_secs(60),
        },
    );
    let analysis = make_analysis();
    (d, queue, analysis)
}

async fn enqueue(queue: &SqliteQueue, msg: &ProcessImageMessage) {
    queue.send_json(QueueKind::ProcessImage, msg).await.unwrap();
}

#[tokio::test]
async fn quality_rejection_fails_job_and_acks() {
    let fx = fixture().await;
    let segmenter = Arc::new(MockSegmenter::new(&[
        ("birefnet-general", Behavior::Empty),
        ("u2net", Behavior::Empty),
    ]));
    let (d, queue, _) = dispatcher(&fx, segmenter, 5);
    let msg = fx.message().await;
    enqueue(&queue, &msg).await;

    assert!(d.process_next().await.unwrap());
    let job = db::get_image_job(&fx.pool, msg.job_id).await.unwrap().unwrap();
    assert_eq!(job.status, ImageJobStatus::Failed);
    let err = job.error_message.unwrap();
    assert!(err.contains("no segmentation model produced a usable result"), "{}", err);
    assert!(job.completed_at.is_some());
    assert_eq!(queue.depth().await.unwrap(), 0);
    assert!(queue.dead_letters().await.unwrap().is_empty());
}

#[tokio::test]
async fn access_denied_is_not_retried() {
    let fx = fixture().await;
    let segmenter = Arc::new(MockSegmenter::new(&[("birefnet-general", Behavior::Denied)]));
    let (d, queue, _) = dispatcher(&fx, segmenter.clone(), 5);
    let msg = fx.message().await;
    enqueue(&queue, &msg).await;

    assert!(d.process_next().await.unwrap());
    let job = db::get_image_job(&fx.pool, msg.job_id).await.unwrap().unwrap();
    assert_eq!(job.status, ImageJobStatus::Failed);
    assert!(job.error_message.unwrap().contains("access denied"));
    // Service errors do not fall through to the next model.
    assert_eq!(*segmenter.calls.lock().await, vec!["birefnet-general"]);
    assert_eq!(queue.depth().await.unwrap(), 0);
}

#[tokio::test]
async fn transient_failure_backs_off_then_dead_letters() {
    let fx = fixture().await;
    let segmenter = Arc::new(MockSegmenter::new(&[("birefnet-general", Behavior::Transient)]));

    let (d, queue, _) = dispatcher(&fx, segmenter.clone(), 3);
    let msg = fx.message().await;
    enqueue(&queue, &msg).await;
    assert!(d.process_next().await.unwrap());
    let job = db::get_image_job(&fx.pool, msg.job_id).await.unwrap().unwrap();
    assert_eq!(job.status, ImageJobStatus::Processing);
    assert!(job.error_message.is_none());
    // Still queued, but not due until the backoff passes.
    assert_eq!(queue.depth().await.unwrap(), 1);
    assert!(!d.process_next().await.unwrap());

    // With a single allowed attempt the message goes straight to the DLQ.
    let fx = fixture().await;
    let (d, queue, _) = dispatcher(&fx, segmenter, 1);
    let msg = fx.message().await;
    enqueue(&queue, &msg).await;
    assert!(d.process_next().await.unwrap());
    let job = db::get_image_job(&fx.pool, msg.job_id).await.unwrap().unwrap();
    assert_eq!(job.status, ImageJobStatus::Failed);
    assert!(job.error_message.unwrap().contains("503"));
    assert_eq!(queue.depth().await.unwrap(), 0);
    let letters = queue.dead_letters().await.unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].kind, "process_image");
}

#[tokio::test]
async fn analysis_messages_run_through_dispatcher() {
    let fx = fixture().await;
    let segmenter = Arc::new(MockSegmenter::new(&[]));
    let (d, queue, analysis) = dispatcher(&fx, segmenter, 3);

    let job = analysis.trigger(fx.book_id).await.unwrap();
    assert_eq!(job.status, AnalysisStatus::Pending);
    assert_eq!(queue.depth().await.unwrap(), 1);

    assert!(d.process_next().await.unwrap());
    let view = analysis.status(fx.book_id).await.unwrap();
    let job = view.job.unwrap();
    assert_eq!(job.status, AnalysisStatus::Completed);
    assert!(!job.truncated);
    assert_eq!(view.analysis.unwrap().valuation.high, Some(200.0));
    assert_eq!(queue.depth().await.unwrap(), 0);
}
