#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use imrag::config::{DataDir, Timeouts};
use imrag::db::*;
use imrag::embedding::{Embedder, EmbeddingError, ImageFormat};
use imrag::vector::{IndexError, LocalIndex, SearchCandidate, VectorIndex};
use imrag::{ImageInput, ImageRag, ImageRagBuilder};
use tempfile::{TempDir, tempdir};

pub const DIM: usize = 4;

/// 按图片内容返回预设向量的向量生成服务
#[derive(Default)]
pub struct FakeEmbedder {
    vectors: Mutex<HashMap<Vec<u8>, Vec<f32>>>,
    failing: Mutex<HashSet<Vec<u8>>>,
    delay: Mutex<Option<Duration>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    calls: AtomicUsize,
}

impl FakeEmbedder {
    pub fn set(&self, image: &[u8], vector: Vec<f32>) {
        self.vectors.lock().unwrap().insert(image.to_vec(), vector);
    }

    pub fn fail_on(&self, image: &[u8]) {
        self.failing.lock().unwrap().insert(image.to_vec());
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Embedder for FakeEmbedder {
    async fn embed(&self, image: &[u8], _format: ImageFormat) -> Result<Vec<f32>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.failing.lock().unwrap().contains(image) {
            return Err(EmbeddingError::Rejected("无法识别的图片".into()));
        }
        self.vectors
            .lock()
            .unwrap()
            .get(image)
            .cloned()
            .ok_or_else(|| EmbeddingError::Rejected("未知图片".into()))
    }

    fn name(&self) -> &'static str {
        "fake"
    }
}

/// 可以注入故障的内存索引
pub struct FaultyIndex {
    inner: LocalIndex,
    pub fail_insert: AtomicBool,
    pub fail_delete: AtomicBool,
    pub fail_search: AtomicBool,
    /// 写入生效后再等待的时间
    pub insert_delay: Mutex<Option<Duration>>,
    pub deletes: AtomicUsize,
}

impl FaultyIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            inner: LocalIndex::in_memory(dimension),
            fail_insert: AtomicBool::new(false),
            fail_delete: AtomicBool::new(false),
            fail_search: AtomicBool::new(false),
            insert_delay: Mutex::new(None),
            deletes: AtomicUsize::new(0),
        }
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.inner.get(id).await.unwrap().is_some()
    }

    pub async fn len(&self) -> u64 {
        self.inner.count().await.unwrap()
    }
}

#[async_trait]
impl VectorIndex for FaultyIndex {
    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    async fn insert(&self, id: &str, vector: &[f32]) -> Result<(), IndexError> {
        if self.fail_insert.load(Ordering::SeqCst) {
            return Err(IndexError::Unavailable("注入的写入故障".into()));
        }
        self.inner.insert(id, vector).await?;
        let delay = *self.insert_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), IndexError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(IndexError::Unavailable("注入的删除故障".into()));
        }
        self.inner.delete(id).await
    }

    async fn search(&self, vector: &[f32], k: usize) -> Result<Vec<SearchCandidate>, IndexError> {
        if self.fail_search.load(Ordering::SeqCst) {
            return Err(IndexError::Unavailable("注入的检索故障".into()));
        }
        self.inner.search(vector, k).await
    }

    async fn get(&self, id: &str) -> Result<Option<Vec<f32>>, IndexError> {
        self.inner.get(id).await
    }

    async fn count(&self) -> Result<u64, IndexError> {
        self.inner.count().await
    }

    async fn ping(&self) -> Result<(), IndexError> {
        self.inner.ping().await
    }

    fn name(&self) -> &'static str {
        "faulty"
    }
}

/// 可以注入故障的 SQLite 存储
pub struct FaultyStore {
    inner: SqliteStore,
    pub fail_insert_image: AtomicBool,
    pub insert_delay: Mutex<Option<Duration>>,
}

impl FaultyStore {
    pub fn new(inner: SqliteStore) -> Self {
        Self { inner, fail_insert_image: AtomicBool::new(false), insert_delay: Mutex::new(None) }
    }

    pub async fn image_count(&self) -> i64 {
        self.inner.stats().await.unwrap().total_images
    }
}

#[async_trait]
impl MetadataStore for FaultyStore {
    async fn create_record(&self, name: &str, description: Option<&str>) -> StoreResult<Record> {
        self.inner.create_record(name, description).await
    }

    async fn get_record(&self, id: i64) -> StoreResult<Record> {
        self.inner.get_record(id).await
    }

    async fn list_records(&self, limit: i64, offset: i64) -> StoreResult<(Vec<Record>, i64)> {
        self.inner.list_records(limit, offset).await
    }

    async fn update_record(&self, id: i64, update: &RecordUpdate) -> StoreResult<Record> {
        self.inner.update_record(id, update).await
    }

    async fn delete_record(&self, id: i64) -> StoreResult<()> {
        self.inner.delete_record(id).await
    }

    async fn insert_image(&self, image: &NewImage) -> StoreResult<Image> {
        let delay = *self.insert_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_insert_image.load(Ordering::SeqCst) {
            return Err(StoreError::Database(sqlx::Error::PoolClosed));
        }
        self.inner.insert_image(image).await
    }

    async fn get_image(&self, id: i64) -> StoreResult<Image> {
        self.inner.get_image(id).await
    }

    async fn list_images(&self, record_id: i64) -> StoreResult<Vec<Image>> {
        self.inner.list_images(record_id).await
    }

    async fn delete_image(&self, id: i64) -> StoreResult<()> {
        self.inner.delete_image(id).await
    }

    async fn resolve_vector(&self, vector_id: &str) -> StoreResult<Option<(Image, Record)>> {
        self.inner.resolve_vector(vector_id).await
    }

    async fn stats(&self) -> StoreResult<DashboardStats> {
        self.inner.stats().await
    }

    async fn ping(&self) -> StoreResult<()> {
        self.inner.ping().await
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub rag: ImageRag,
    pub embedder: Arc<FakeEmbedder>,
    pub index: Arc<FaultyIndex>,
    pub store: Arc<FaultyStore>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_concurrency(4).await
    }

    pub async fn with_concurrency(max_concurrency: usize) -> Self {
        let dir = tempdir().unwrap();
        let data_dir = DataDir::new(dir.path());
        let store = Arc::new(FaultyStore::new(SqliteStore::open(data_dir.database()).await.unwrap()));
        let index = Arc::new(FaultyIndex::new(DIM));
        let embedder = Arc::new(FakeEmbedder::default());
        let timeouts = Timeouts {
            embed: Duration::from_secs(5),
            index: Duration::from_secs(1),
            store: Duration::from_secs(2),
            compensation: Duration::from_secs(1),
        };
        let rag = ImageRagBuilder::new(data_dir)
            .dimension(DIM)
            .timeouts(timeouts)
            .max_concurrency(max_concurrency)
            .store(store.clone())
            .index(index.clone())
            .embedder(embedder.clone())
            .open()
            .await
            .unwrap();
        Self { dir, rag, embedder, index, store }
    }

    /// 注册一张图片及其向量，返回可用于入库的输入
    pub fn image(&self, name: &str, vector: [f32; DIM]) -> ImageInput {
        let data = format!("bytes of {name}").into_bytes();
        self.embedder.set(&data, vector.to_vec());
        ImageInput::new(format!("{name}.jpg"), data)
    }

    pub fn uploaded_files(&self) -> usize {
        match std::fs::read_dir(self.dir.path().join("uploads")) {
            Ok(entries) => entries.count(),
            Err(_) => 0,
        }
    }
}

/// 第 i 个坐标轴上的单位向量
pub fn axis(i: usize) -> [f32; DIM] {
    let mut v = [0.0; DIM];
    v[i % DIM] = 1.0;
    v
}
