mod common;

use anyhow::Result;
use async_trait::async_trait;
use common::setup_pool;
use moxon_worker::db::{self, Pool};
use moxon_worker::garbage::{GarbageClassifier, GarbageDetector, GarbageSettings};
use moxon_worker::llm::ImageInput;
use moxon_worker::model::{Book, BookImage};
use moxon_worker::storage::{FsObjectStore, ObjectStore};
use moxon_worker::thumbnail;
use std::sync::Arc;
use tokio::sync::Mutex;

struct FixedClassifier {
    indices: Vec<i64>,
    seen: Mutex<Vec<usize>>,
}

impl FixedClassifier {
    fn new(indices: &[i64]) -> Arc<Self> {
        Arc::new(Self {
            indices: indices.to_vec(),
            seen: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl GarbageClassifier for FixedClassifier {
    async fn classify(&self, _book: &Book, images: &[ImageInput]) -> Result<Vec<i64>> {
        self.seen.lock().await.push(images.len());
        Ok(self.indices.clone())
    }
}

struct Fixture {
    pool: Pool,
    store: Arc<FsObjectStore>,
    book_id: i64,
    images: Vec<BookImage>,
    _dir: tempfile::TempDir,
}

/// Five images; the second is already flagged, so the detector sees four.
async fn fixture() -> Fixture {
    let pool = setup_pool().await;
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FsObjectStore::new(dir.path()));
    let book_id = db::insert_book(&pool, "Ulysses", Some("Joyce")).await.unwrap();
    let mut images = Vec::new();
    for i in 0..5 {
        let key = format!("books/{}/img{}.jpg", book_id, i);
        store.put(&key, b"jpeg").await.unwrap();
        store.put(&thumbnail::thumbnail_key(&key), b"thumb").await.unwrap();
        images.push(db::insert_original_image(&pool, book_id, &key).await.unwrap());
    }
    db::mark_garbage(&pool, &[images[1].id]).await.unwrap();
    Fixture {
        pool,
        store,
        book_id,
        images,
        _dir: dir,
    }
}

fn detector(fx: &Fixture, classifier: Arc<FixedClassifier>, delete_flagged: bool) -> GarbageDetector {
    GarbageDetector::new(
        fx.pool.clone(),
        fx.store.clone(),
        classifier,
        GarbageSettings {
            delete_flagged,
            max_flagged_fraction: 0.5,
            min_examined_for_guard: 4,
        },
    )
}

#[tokio::test]
async fn indices_refer_to_filtered_set_and_out_of_range_are_dropped() {
    let fx = fixture().await;
    let classifier = FixedClassifier::new(&[0, 3, 4, 7]);
    let report = detector(&fx, classifier.clone(), false)
        .detect(fx.book_id, true)
        .await
        .unwrap();

    assert_eq!(*classifier.seen.lock().await, vec![4]);
    assert_eq!(report.examined, 4);
    assert_eq!(report.rejected_indices, vec![4, 7]);
    // Filtered set is [img0, img2, img3, img4]; index 3 is img4, not img3.
    assert_eq!(report.flagged_image_ids, vec![fx.images[0].id, fx.images[4].id]);
    assert!(report.applied);
    assert!(!report.suspicious);

    let after = db::list_images(&fx.pool, fx.book_id).await.unwrap();
    let flagged: Vec<i64> = after.iter().filter(|i| i.is_garbage).map(|i| i.id).collect();
    assert_eq!(flagged, vec![fx.images[0].id, fx.images[1].id, fx.images[4].id]);
    assert!(after.iter().all(|i| !i.is_primary));
}

#[tokio::test]
async fn implausible_result_is_reported_but_not_applied() {
    let fx = fixture().await;
    let report = detector(&fx, FixedClassifier::new(&[0, 1, 2]), false)
        .detect(fx.book_id, true)
        .await
        .unwrap();
    assert!(report.suspicious);
    assert!(!report.applied);
    assert_eq!(report.flagged_image_ids.len(), 3);
    let garbage = db::list_images(&fx.pool, fx.book_id)
        .await
        .unwrap()
        .into_iter()
        .filter(|i| i.is_garbage)
        .count();
    assert_eq!(garbage, 1);
}

#[tokio::test]
async fn report_only_run_changes_nothing() {
    let fx = fixture().await;
    let report = detector(&fx, FixedClassifier::new(&[2]), true)
        .detect(fx.book_id, false)
        .await
        .unwrap();
    assert_eq!(report.flagged_image_ids, vec![fx.images[3].id]);
    assert!(!report.applied);
    assert!(report.deleted_image_ids.is_empty());
    assert!(fx.store.exists(&fx.images[3].s3_key).await.unwrap());
}

#[tokio::test]
async fn delete_flagged_removes_objects_and_rows() {
    let fx = fixture().await;
    let report = detector(&fx, FixedClassifier::new(&[1]), true)
        .detect(fx.book_id, true)
        .await
        .unwrap();
    let target = &fx.images[2];
    assert_eq!(report.deleted_image_ids, vec![target.id]);
    assert!(report.delete_failures.is_empty());
    assert!(!fx.store.exists(&target.s3_key).await.unwrap());
    assert!(!fx.store.exists(&thumbnail::thumbnail_key(&target.s3_key)).await.unwrap());
    assert!(db::get_image(&fx.pool, target.id).await.unwrap().is_none());
    assert_eq!(db::list_images(&fx.pool, fx.book_id).await.unwrap().len(), 4);
}

#[tokio::test]
async fn small_sets_apply_majority_results() {
    let pool = setup_pool().await;
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FsObjectStore::new(dir.path()));
    let book_id = db::insert_book(&pool, "Persuasion", Some("Austen")).await.unwrap();
    let mut ids = Vec::new();
    for i in 0..3 {
        let key = format!("books/{}/img{}.jpg", book_id, i);
        store.put(&key, b"jpeg").await.unwrap();
        ids.push(db::insert_original_image(&pool, book_id, &key).await.unwrap().id);
    }
    let detector = GarbageDetector::new(
        pool.clone(),
        store,
        FixedClassifier::new(&[1, 2]),
        GarbageSettings {
            delete_flagged: false,
            max_flagged_fraction: 0.5,
            min_examined_for_guard: 4,
        },
    );

    let report = detector.detect(book_id, true).await.unwrap();
    assert_eq!(report.examined, 3);
    assert!(!report.suspicious);
    assert!(report.applied);
    assert_eq!(report.flagged_image_ids, vec![ids[1], ids[2]]);
    let visible = db::list_analysis_images(&pool, book_id).await.unwrap();
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].id, ids[0]);
}
