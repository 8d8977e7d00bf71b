mod common;

use common::{png, setup_pool, FlakyQueue};
use moxon_worker::db;
use moxon_worker::ingest::{EnqueueStatus, Ingestor, ProcessScope};
use moxon_worker::model::{ImageJobStatus, ProcessImageMessage, ProcessingOptions, QueueKind};
use moxon_worker::storage::{FsObjectStore, ObjectStore};
use moxon_worker::thumbnail;
use std::sync::Arc;

fn options() -> ProcessingOptions {
    ProcessingOptions {
        models: vec!["birefnet-general".into()],
        max_dimension: 1024,
    }
}

async fn listing(store: &FsObjectStore, n: usize) -> Vec<String> {
    let mut keys = Vec::new();
    for i in 0..n {
        let key = format!("listings/ebay-123/{}.png", i);
        store.put(&key, &png(120, 160)).await.unwrap();
        keys.push(key);
    }
    keys
}

#[tokio::test]
async fn import_copies_images_and_queues_primary_only() {
    let pool = setup_pool().await;
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FsObjectStore::new(dir.path()));
    let queue = Arc::new(FlakyQueue::default());
    let ingestor = Ingestor::new(pool.clone(), store.clone(), queue.clone(), options(), 64);
    let book_id = db::insert_book(&pool, "Dune", None).await.unwrap();

    let mut keys = listing(&store, 3).await;
    keys.push("listings/ebay-123/missing.png".into());
    let report = ingestor
        .import_listing_images(book_id, &keys, ProcessScope::Primary)
        .await
        .unwrap();

    assert_eq!(report.images.len(), 3);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].0, "listings/ebay-123/missing.png");
    let orders: Vec<i64> = report.images.iter().map(|i| i.display_order).collect();
    assert_eq!(orders, vec![0, 1, 2]);
    assert!(report.images[0].is_primary);
    assert!(report.images[1..].iter().all(|i| !i.is_primary));
    for image in &report.images {
        assert!(image.s3_key.starts_with(&format!("books/{}/", book_id)));
        assert!(store.exists(&image.s3_key).await.unwrap());
        assert!(store.exists(&thumbnail::thumbnail_key(&image.s3_key)).await.unwrap());
    }

    assert_eq!(report.jobs.len(), 1);
    assert_eq!(report.jobs[0].status, EnqueueStatus::Queued);
    let sent = queue.sent.lock().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, QueueKind::ProcessImage);
    let msg: ProcessImageMessage = serde_json::from_value(sent[0].1.clone()).unwrap();
    assert_eq!(msg.image_id, report.images[0].id);
    assert_eq!(msg.source_key, report.images[0].s3_key);
    assert_eq!(msg.options, options());
}

#[tokio::test]
async fn failed_enqueue_is_recorded_and_retried() {
    let pool = setup_pool().await;
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FsObjectStore::new(dir.path()));
    let queue = FlakyQueue::failing();
    let ingestor = Ingestor::new(pool.clone(), store.clone(), queue.clone(), options(), 64);
    let book_id = db::insert_book(&pool, "Emma", Some("Austen")).await.unwrap();

    let keys = listing(&store, 2).await;
    let report = ingestor
        .import_listing_images(book_id, &keys, ProcessScope::All)
        .await
        .unwrap();
    assert_eq!(report.jobs.len(), 2);
    for enqueued in &report.jobs {
        assert!(matches!(enqueued.status, EnqueueStatus::QueueFailed(ref m) if m.contains("unreachable")));
        assert_eq!(enqueued.job.status, ImageJobStatus::QueueFailed);
        assert!(enqueued.job.error_message.is_some());
    }
    assert_eq!(db::list_queue_failed(&pool).await.unwrap().len(), 2);

    // Still down: nothing moves.
    let retry = ingestor.retry_queue_failed().await.unwrap();
    assert!(retry.requeued.is_empty());
    assert_eq!(retry.still_failed.len(), 2);

    queue.set_failing(false);
    let retry = ingestor.retry_queue_failed().await.unwrap();
    assert_eq!(retry.requeued.len(), 2);
    assert!(db::list_queue_failed(&pool).await.unwrap().is_empty());
    for id in retry.requeued {
        let job = db::get_image_job(&pool, id).await.unwrap().unwrap();
        assert_eq!(job.status, ImageJobStatus::Queued);
        assert!(job.error_message.is_none());
    }
    assert_eq!(queue.sent.lock().await.len(), 2);
}

#[tokio::test]
async fn enqueue_image_reuses_active_job() {
    let pool = setup_pool().await;
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FsObjectStore::new(dir.path()));
    let queue = Arc::new(FlakyQueue::default());
    let ingestor = Ingestor::new(pool.clone(), store.clone(), queue.clone(), options(), 64);
    let book_id = db::insert_book(&pool, "Ulysses", None).await.unwrap();
    let other_book = db::insert_book(&pool, "Dubliners", None).await.unwrap();
    let keys = listing(&store, 1).await;
    let report = ingestor
        .import_listing_images(book_id, &keys, ProcessScope::None)
        .await
        .unwrap();
    assert!(report.jobs.is_empty());
    let image_id = report.images[0].id;

    let first = ingestor.enqueue_image(book_id, image_id).await.unwrap();
    assert_eq!(first.status, EnqueueStatus::Queued);
    let second = ingestor.enqueue_image(book_id, image_id).await.unwrap();
    assert_eq!(second.status, EnqueueStatus::AlreadyActive);
    assert_eq!(second.job.id, first.job.id);
    assert_eq!(queue.sent.lock().await.len(), 1);

    assert!(ingestor.enqueue_image(other_book, image_id).await.is_err());
}

#[tokio::test]
async fn dotted_listing_directory_keeps_key_flat() {
    let pool = setup_pool().await;
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FsObjectStore::new(dir.path()));
    let queue = Arc::new(FlakyQueue::default());
    let ingestor = Ingestor::new(pool.clone(), store.clone(), queue, options(), 64);
    let book_id = db::insert_book(&pool, "Kim", Some("Kipling")).await.unwrap();

    let keys = vec!["listings/ebay.com/123/photo".to_string(), "listings/ebay.com/123/back.PNG".to_string()];
    for key in &keys {
        store.put(key, &png(120, 160)).await.unwrap();
    }
    let report = ingestor
        .import_listing_images(book_id, &keys, ProcessScope::None)
        .await
        .unwrap();
    assert!(report.failures.is_empty());

    let prefix = format!("books/{}/", book_id);
    for image in &report.images {
        let name = image.s3_key.strip_prefix(&prefix).unwrap();
        assert!(!name.contains('/'), "{}", image.s3_key);
        assert!(store.exists(&thumbnail::thumbnail_key(&image.s3_key)).await.unwrap());
    }
    assert!(report.images[0].s3_key.ends_with(".jpg"));
    assert!(report.images[1].s3_key.ends_with(".png"));
}
