mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use common::*;
use imrag::Error;
use imrag::search::SearchFilter;
use imrag::vector::{IndexError, VectorIndex};

#[tokio::test]
async fn test_ingest_writes_both_stores() {
    let h = Harness::new().await;
    let record = h.rag.create_record("猫", Some("橘猫")).await.unwrap();

    let image = h.rag.add_image(record.id, &h.image("cat", axis(0))).await.unwrap();

    assert_eq!(image.record_id, record.id);
    assert!(image.filename.ends_with("_cat.jpg"));
    assert!(h.index.contains(&image.vector_id).await);
    assert_eq!(h.rag.get_record(record.id).await.unwrap().images, vec![image.clone()]);
    assert_eq!(h.rag.read_image(image.id).await.unwrap().1, b"bytes of cat");
    assert_eq!(uuid::Uuid::parse_str(&image.vector_id).unwrap().get_version_num(), 4);
}

#[tokio::test]
async fn test_metadata_failure_compensates_vector() {
    let h = Harness::new().await;
    let record = h.rag.create_record("r", None).await.unwrap();
    h.store.fail_insert_image.store(true, Ordering::SeqCst);

    let err = h.rag.add_image(record.id, &h.image("a", axis(0))).await.unwrap_err();

    assert!(matches!(err, Error::MetadataWrite { .. }), "{err}");
    assert_eq!(h.index.len().await, 0);
    assert_eq!(h.index.deletes.load(Ordering::SeqCst), 1);
    assert_eq!(h.store.image_count().await, 0);
    assert_eq!(h.uploaded_files(), 0);
}

#[tokio::test]
async fn test_failed_compensation_keeps_primary_error() {
    let h = Harness::new().await;
    let record = h.rag.create_record("r", None).await.unwrap();
    h.store.fail_insert_image.store(true, Ordering::SeqCst);
    h.index.fail_delete.store(true, Ordering::SeqCst);

    let err = h.rag.add_image(record.id, &h.image("a", axis(0))).await.unwrap_err();
    assert!(matches!(err, Error::MetadataWrite { .. }), "{err}");

    // 孤儿向量留在索引中，但不会出现在搜索结果里
    assert_eq!(h.index.len().await, 1);
    h.index.fail_delete.store(false, Ordering::SeqCst);
    let result = h.rag.search_by_vector(&axis(0), 10, &SearchFilter::default(), None).await.unwrap();
    assert!(result.is_empty());
}

#[tokio::test]
async fn test_index_failure_writes_nothing() {
    let h = Harness::new().await;
    let record = h.rag.create_record("r", None).await.unwrap();
    h.index.fail_insert.store(true, Ordering::SeqCst);

    let err = h.rag.add_image(record.id, &h.image("a", axis(0))).await.unwrap_err();

    assert!(matches!(err, Error::IndexWrite { .. }), "{err}");
    assert!(err.is_retryable());
    assert_eq!(h.store.image_count().await, 0);
    assert_eq!(h.uploaded_files(), 0);
}

#[tokio::test]
async fn test_index_timeout_rolls_back_landed_vector() {
    let h = Harness::new().await;
    let record = h.rag.create_record("r", None).await.unwrap();
    // 写入已生效，但响应超过了索引超时时间
    *h.index.insert_delay.lock().unwrap() = Some(Duration::from_millis(1500));

    let err = h.rag.add_image(record.id, &h.image("a", axis(0))).await.unwrap_err();

    let Error::IndexWrite { vector_id, source: IndexError::Timeout(_) } = &err else {
        panic!("unexpected error: {err}");
    };
    assert!(err.is_retryable());
    assert!(!h.index.contains(vector_id).await);
    assert_eq!(h.index.len().await, 0);
    assert_eq!(h.index.deletes.load(Ordering::SeqCst), 1);
    assert_eq!(h.store.image_count().await, 0);
    assert_eq!(h.uploaded_files(), 0);
}

#[tokio::test]
async fn test_dropped_during_index_write_removes_file() {
    let h = Harness::new().await;
    let record = h.rag.create_record("r", None).await.unwrap();
    *h.index.insert_delay.lock().unwrap() = Some(Duration::from_millis(300));

    let input = h.image("a", axis(0));
    let result =
        tokio::time::timeout(Duration::from_millis(100), h.rag.add_image(record.id, &input)).await;
    assert!(result.is_err());

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(h.index.len().await, 0);
    assert_eq!(h.uploaded_files(), 0);
    assert_eq!(h.store.image_count().await, 0);
}

#[tokio::test]
async fn test_dimension_mismatch_checked_before_storage() {
    let h = Harness::new().await;
    let record = h.rag.create_record("r", None).await.unwrap();
    h.embedder.set(b"short", vec![1.0, 0.0]);

    let input = imrag::ImageInput::new("short.png", b"short".to_vec());
    let err = h.rag.add_image(record.id, &input).await.unwrap_err();

    assert!(matches!(err, Error::DimensionMismatch { expected: DIM, actual: 2 }), "{err}");
    assert_eq!(h.index.len().await, 0);
    assert_eq!(h.uploaded_files(), 0);
}

#[tokio::test]
async fn test_embedding_failure_is_not_retryable() {
    let h = Harness::new().await;
    let record = h.rag.create_record("r", None).await.unwrap();
    let input = h.image("bad", axis(0));
    h.embedder.fail_on(&input.data);

    let err = h.rag.add_image(record.id, &input).await.unwrap_err();

    assert!(matches!(err, Error::Embedding(_)), "{err}");
    assert!(!err.is_retryable());
    assert_eq!(h.index.len().await, 0);
}

#[tokio::test]
async fn test_rejects_unknown_record_and_format() {
    let h = Harness::new().await;

    let err = h.rag.add_image(42, &h.image("a", axis(0))).await.unwrap_err();
    assert!(err.is_not_found(), "{err}");

    let record = h.rag.create_record("r", None).await.unwrap();
    let input = imrag::ImageInput::new("a.gif", b"gif".to_vec());
    let err = h.rag.add_image(record.id, &input).await.unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)), "{err}");
    assert_eq!(h.embedder.calls(), 0);
}

#[tokio::test]
async fn test_create_record_requires_name() {
    let h = Harness::new().await;
    let err = h.rag.create_record("   ", None).await.unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
}

#[tokio::test]
async fn test_delete_image_twice() {
    let h = Harness::new().await;
    let record = h.rag.create_record("r", None).await.unwrap();
    let image = h.rag.add_image(record.id, &h.image("a", axis(0))).await.unwrap();
    let other = h.rag.add_image(record.id, &h.image("b", axis(1))).await.unwrap();

    h.rag.delete_image(image.id).await.unwrap();
    assert!(!h.index.contains(&image.vector_id).await);
    assert_eq!(h.uploaded_files(), 1);

    let deletes = h.index.deletes.load(Ordering::SeqCst);
    let err = h.rag.delete_image(image.id).await.unwrap_err();
    assert!(err.is_not_found(), "{err}");
    assert_eq!(h.index.deletes.load(Ordering::SeqCst), deletes);
    assert!(h.index.contains(&other.vector_id).await);
    assert_eq!(h.index.len().await, 1);
}

#[tokio::test]
async fn test_delete_image_succeeds_when_vector_delete_fails() {
    let h = Harness::new().await;
    let record = h.rag.create_record("r", None).await.unwrap();
    let image = h.rag.add_image(record.id, &h.image("a", axis(0))).await.unwrap();
    h.index.fail_delete.store(true, Ordering::SeqCst);

    let deleted = h.rag.delete_image(image.id).await.unwrap();

    assert_eq!(deleted.id, image.id);
    assert!(h.index.contains(&image.vector_id).await);
    assert!(h.rag.get_image(image.id).await.unwrap_err().is_not_found());
    let result = h.rag.search_by_vector(&axis(0), 10, &SearchFilter::default(), None).await.unwrap();
    assert!(result.is_empty());
}

#[tokio::test]
async fn test_delete_record_removes_vectors() {
    let h = Harness::new().await;
    let record = h.rag.create_record("r", None).await.unwrap();
    let keep = h.rag.create_record("keep", None).await.unwrap();
    let a = h.rag.add_image(record.id, &h.image("a", axis(0))).await.unwrap();
    let b = h.rag.add_image(record.id, &h.image("b", axis(1))).await.unwrap();
    let c = h.rag.add_image(keep.id, &h.image("c", axis(2))).await.unwrap();

    let detail = h.rag.delete_record(record.id).await.unwrap();

    assert_eq!(detail.images.len(), 2);
    assert!(!h.index.contains(&a.vector_id).await);
    assert!(!h.index.contains(&b.vector_id).await);
    assert!(h.index.contains(&c.vector_id).await);
    assert_eq!(h.uploaded_files(), 1);
    assert!(h.rag.get_record(record.id).await.unwrap_err().is_not_found());
    assert!(h.rag.delete_record(record.id).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_dropped_ingest_stays_consistent() {
    let h = Harness::new().await;
    let record = h.rag.create_record("r", None).await.unwrap();
    *h.store.insert_delay.lock().unwrap() = Some(Duration::from_millis(200));

    let input = h.image("a", axis(0));
    let result =
        tokio::time::timeout(Duration::from_millis(50), h.rag.add_image(record.id, &input)).await;
    assert!(result.is_err());

    // 向量写入后，元数据写入或补偿删除仍会在后台完成
    tokio::time::sleep(Duration::from_millis(500)).await;
    let images = h.rag.get_record(record.id).await.unwrap().images;
    assert_eq!(images.len() as u64, h.index.len().await);
    for image in &images {
        assert!(h.index.contains(&image.vector_id).await);
    }
}

#[tokio::test]
async fn test_update_and_list_records() {
    let h = Harness::new().await;
    for name in ["a", "b", "c"] {
        h.rag.create_record(name, None).await.unwrap();
    }
    let page = h.rag.list_records(Some(1), Some(2)).await.unwrap();
    assert_eq!(page.total, 3);
    assert_eq!(page.records.len(), 2);
    assert_eq!(page.records[0].name, "c");
    let newest = page.records[0].id;

    let page = h.rag.list_records(Some(2), Some(500)).await.unwrap();
    assert_eq!(page.limit, 10);
    assert!(page.records.is_empty());

    let page = h.rag.list_records(Some(i64::MAX), Some(100)).await.unwrap();
    assert_eq!(page.page, i64::MAX);
    assert_eq!(page.total, 3);
    assert!(page.records.is_empty());

    let update = imrag::db::RecordUpdate { name: None, description: Some("描述".into()) };
    let updated = h.rag.update_record(newest, &update).await.unwrap();
    assert_eq!(updated.description.as_deref(), Some("描述"));

    let err = h.rag.update_record(999, &update).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_stats_and_health() {
    let h = Harness::new().await;
    let record = h.rag.create_record("r", None).await.unwrap();
    h.rag.add_image(record.id, &h.image("a", axis(0))).await.unwrap();

    let stats = h.rag.stats().await.unwrap();
    assert_eq!(stats.dashboard.total_records, 1);
    assert_eq!(stats.dashboard.total_images, 1);
    assert_eq!(stats.total_vectors, 1);
    assert_eq!(h.index.count().await.unwrap(), 1);

    assert!(h.rag.health().await.is_healthy());
}
