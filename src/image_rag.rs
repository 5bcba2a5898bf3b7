use std::sync::Arc;

use anyhow::Context;
use log::{info, warn};
use serde::Serialize;
use tokio::time::Instant;
use utoipa::ToSchema;

use crate::batch::{BatchIngestor, BatchOutcome};
use crate::config::{DataDir, EmbeddingOptions, IndexBackend, IndexOptions, Opts, Timeouts};
use crate::db::*;
use crate::deadline::bounded;
use crate::embedding::{DoubaoEmbedder, Embedder, ImageFormat};
use crate::error::{Error, Result};
use crate::ingest::{ImageInput, Ingestor};
use crate::search::{RankedMatch, SearchFilter, Searcher};
use crate::storage::FileStore;
use crate::vector::{IndexError, LocalIndex, MilvusIndex, VectorIndex};

pub const DEFAULT_PAGE_SIZE: i64 = 10;
pub const MAX_PAGE_SIZE: i64 = 100;

/// 分页参数：页码从 1 开始，每页数量不在 [1, 100] 内时使用 10
pub fn normalize_page(page: Option<i64>, limit: Option<i64>) -> (i64, i64) {
    let page = page.filter(|&p| p >= 1).unwrap_or(1);
    let limit = limit.filter(|l| (1..=MAX_PAGE_SIZE).contains(l)).unwrap_or(DEFAULT_PAGE_SIZE);
    (page, limit)
}

/// 分页偏移量，页码过大时取 `i64::MAX`
pub fn page_offset(page: i64, limit: i64) -> i64 {
    (page - 1).saturating_mul(limit)
}

/// 一页记录
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct RecordPage {
    pub records: Vec<Record>,
    pub total: i64,
    pub page: i64,
    pub limit: i64,
}

/// 统计信息
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct Stats {
    #[serde(flatten)]
    pub dashboard: DashboardStats,
    /// 索引中的向量总数
    pub total_vectors: u64,
}

/// 各依赖服务的健康状态
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct Health {
    pub database: bool,
    pub vector_index: bool,
    pub embedder: bool,
}

impl Health {
    pub fn is_healthy(&self) -> bool {
        self.database && self.vector_index && self.embedder
    }
}

/// 图片检索服务，持有所有外部依赖并对外提供完整的操作
#[derive(Clone)]
pub struct ImageRag {
    store: Arc<dyn MetadataStore>,
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn Embedder>,
    files: FileStore,
    ingestor: Ingestor,
    batch: BatchIngestor,
    searcher: Searcher,
    timeouts: Timeouts,
}

impl ImageRag {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn Embedder>,
        files: FileStore,
        timeouts: Timeouts,
        max_concurrency: usize,
    ) -> Self {
        let ingestor = Ingestor::new(
            embedder.clone(),
            index.clone(),
            store.clone(),
            files.clone(),
            timeouts,
        );
        let batch = BatchIngestor::new(ingestor.clone(), max_concurrency);
        let searcher = Searcher::new(embedder.clone(), index.clone(), store.clone(), timeouts);
        Self { store, index, embedder, files, ingestor, batch, searcher, timeouts }
    }

    pub fn searcher(&self) -> &Searcher {
        &self.searcher
    }

    pub fn files(&self) -> &FileStore {
        &self.files
    }

    pub async fn create_record(&self, name: &str, description: Option<&str>) -> Result<Record> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::InvalidInput("记录名称不能为空".into()));
        }
        let description = description.filter(|d| !d.is_empty());
        let record = self
            .store_call(self.store.create_record(name, description))
            .await
            .map_err(|e| Error::metadata_write(format!("新记录 {name}"), e))?;
        info!("已创建记录 {} ({})", record.id, record.name);
        Ok(record)
    }

    /// 创建记录并加入多张图片
    ///
    /// 结果与 `inputs` 一一对应，不支持的格式在对应位置报告为失败。
    pub async fn create_record_with_images(
        &self,
        name: &str,
        description: Option<&str>,
        inputs: Vec<ImageInput>,
        deadline: Option<Instant>,
    ) -> Result<(Record, BatchOutcome)> {
        let record = self.create_record(name, description).await?;
        let outcome = self.batch.ingest_batch(record.id, inputs, deadline).await;
        Ok((record, outcome))
    }

    pub async fn get_record(&self, id: i64) -> Result<RecordDetail> {
        let context = || format!("记录 {id}");
        let record = self
            .store_call(self.store.get_record(id))
            .await
            .map_err(|e| Error::metadata_read(context(), e))?;
        let images = self
            .store_call(self.store.list_images(id))
            .await
            .map_err(|e| Error::metadata_read(context(), e))?;
        Ok(RecordDetail { record, images })
    }

    pub async fn list_records(&self, page: Option<i64>, limit: Option<i64>) -> Result<RecordPage> {
        let (page, limit) = normalize_page(page, limit);
        let (records, total) = self
            .store_call(self.store.list_records(limit, page_offset(page, limit)))
            .await
            .map_err(|e| Error::metadata_read("记录列表", e))?;
        Ok(RecordPage { records, total, page, limit })
    }

    /// 更新记录，空名称会被忽略，空描述会清除原有描述
    pub async fn update_record(&self, id: i64, update: &RecordUpdate) -> Result<Record> {
        self.store_call(self.store.update_record(id, update)).await.map_err(|e| {
            let context = format!("记录 {id}");
            if e.is_not_found() {
                Error::metadata_read(context, e)
            } else {
                Error::metadata_write(context, e)
            }
        })
    }

    pub async fn delete_record(&self, id: i64) -> Result<RecordDetail> {
        self.ingestor.delete_record(id).await
    }

    pub async fn add_image(&self, record_id: i64, input: &ImageInput) -> Result<Image> {
        self.ingestor.ingest(record_id, input, None).await
    }

    pub async fn add_images(
        &self,
        record_id: i64,
        inputs: Vec<ImageInput>,
        deadline: Option<Instant>,
    ) -> BatchOutcome {
        self.batch.ingest_batch(record_id, inputs, deadline).await
    }

    pub async fn get_image(&self, id: i64) -> Result<Image> {
        self.store_call(self.store.get_image(id))
            .await
            .map_err(|e| Error::metadata_read(format!("图片 {id}"), e))
    }

    /// 读取图片文件内容
    pub async fn read_image(&self, id: i64) -> Result<(Image, Vec<u8>)> {
        let image = self.get_image(id).await?;
        let data = self.files.read(&image.path).await?;
        Ok((image, data))
    }

    pub async fn delete_image(&self, id: i64) -> Result<Image> {
        self.ingestor.delete_image(id).await
    }

    pub async fn search(
        &self,
        image: &[u8],
        format: ImageFormat,
        top_k: usize,
        filter: &SearchFilter,
        deadline: Option<Instant>,
    ) -> Result<Vec<RankedMatch>> {
        self.searcher.search(image, format, top_k, filter, deadline).await
    }

    pub async fn search_by_vector(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: &SearchFilter,
        deadline: Option<Instant>,
    ) -> Result<Vec<RankedMatch>> {
        self.searcher.search_by_vector(vector, top_k, filter, deadline).await
    }

    pub async fn find_similar(
        &self,
        image_id: i64,
        top_k: usize,
        filter: &SearchFilter,
        deadline: Option<Instant>,
    ) -> Result<Vec<RankedMatch>> {
        self.searcher.find_similar(image_id, top_k, filter, deadline).await
    }

    /// 返回与图片最相似的记录及其所有图片
    pub async fn best_record(
        &self,
        image: &[u8],
        format: ImageFormat,
        deadline: Option<Instant>,
    ) -> Result<Option<(RankedMatch, RecordDetail)>> {
        let Some(best) = self.searcher.best_match(image, format, deadline).await? else {
            return Ok(None);
        };
        let detail = self.get_record(best.record_id).await?;
        Ok(Some((best, detail)))
    }

    pub async fn lookup_vector(&self, vector_id: &str) -> Result<(Image, Record)> {
        self.searcher.lookup_vector(vector_id).await
    }

    pub async fn stats(&self) -> Result<Stats> {
        let dashboard = self
            .store_call(self.store.stats())
            .await
            .map_err(|e| Error::metadata_read("统计信息", e))?;
        let total_vectors = bounded(self.index.count(), self.timeouts.index, None, IndexError::Timeout)
            .await
            .map_err(Error::IndexSearch)?;
        Ok(Stats { dashboard, total_vectors })
    }

    pub async fn health(&self) -> Health {
        let database = match self.store_call(self.store.ping()).await {
            Ok(()) => true,
            Err(e) => {
                warn!("数据库不可用: {e}");
                false
            }
        };
        let vector_index =
            match bounded(self.index.ping(), self.timeouts.index, None, IndexError::Timeout).await {
                Ok(()) => true,
                Err(e) => {
                    warn!("向量索引 {} 不可用: {e}", self.index.name());
                    false
                }
            };
        Health { database, vector_index, embedder: self.embedder.is_configured() }
    }

    async fn store_call<T>(
        &self,
        fut: impl Future<Output = StoreResult<T>>,
    ) -> StoreResult<T> {
        bounded(fut, self.timeouts.store, None, StoreError::Timeout).await
    }
}

/// 根据配置构建 [`ImageRag`]，也可以直接注入各个依赖
pub struct ImageRagBuilder {
    data_dir: DataDir,
    embedding: Option<EmbeddingOptions>,
    index_opts: Option<IndexOptions>,
    timeouts: Timeouts,
    max_concurrency: usize,
    dimension: usize,
    store: Option<Arc<dyn MetadataStore>>,
    index: Option<Arc<dyn VectorIndex>>,
    embedder: Option<Arc<dyn Embedder>>,
}

impl ImageRagBuilder {
    pub fn new(data_dir: DataDir) -> Self {
        Self {
            data_dir,
            embedding: None,
            index_opts: None,
            timeouts: Timeouts::default(),
            max_concurrency: 4,
            dimension: 1024,
            store: None,
            index: None,
            embedder: None,
        }
    }

    /// 使用命令行参数中的全部配置
    pub fn from_opts(opts: &Opts) -> Self {
        Self::new(opts.data_dir.clone())
            .embedding(opts.embedding.clone())
            .index_options(opts.index.clone())
            .timeouts(Timeouts::from(&opts.runtime))
            .max_concurrency(opts.runtime.max_concurrency as usize)
    }

    pub fn embedding(mut self, opts: EmbeddingOptions) -> Self {
        self.dimension = opts.dimension;
        self.embedding = Some(opts);
        self
    }

    pub fn index_options(mut self, opts: IndexOptions) -> Self {
        self.index_opts = Some(opts);
        self
    }

    pub fn timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn dimension(mut self, dimension: usize) -> Self {
        self.dimension = dimension;
        self
    }

    pub fn store(mut self, store: Arc<dyn MetadataStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn index(mut self, index: Arc<dyn VectorIndex>) -> Self {
        self.index = Some(index);
        self
    }

    pub fn embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub async fn open(self) -> anyhow::Result<ImageRag> {
        tokio::fs::create_dir_all(self.data_dir.path())
            .await
            .with_context(|| format!("无法创建数据目录 {}", self.data_dir.path().display()))?;

        let store = match self.store {
            Some(store) => store,
            None => Arc::new(SqliteStore::open(self.data_dir.database()).await?),
        };

        let index: Arc<dyn VectorIndex> = match self.index {
            Some(index) => index,
            None => {
                let opts = self.index_opts.context("未指定向量索引配置")?;
                match opts.index {
                    IndexBackend::Local => {
                        Arc::new(LocalIndex::open(self.data_dir.index(), self.dimension)?)
                    }
                    IndexBackend::Milvus => Arc::new(
                        MilvusIndex::connect(&opts, self.dimension, self.timeouts.index).await?,
                    ),
                }
            }
        };
        anyhow::ensure!(
            index.dimension() == self.dimension,
            "向量索引维度 {} 与配置的维度 {} 不一致",
            index.dimension(),
            self.dimension
        );

        let embedder: Arc<dyn Embedder> = match self.embedder {
            Some(embedder) => embedder,
            None => {
                let opts = self.embedding.context("未指定向量生成配置")?;
                Arc::new(DoubaoEmbedder::new(&opts, self.timeouts.embed)?)
            }
        };
        if !embedder.is_configured() {
            warn!("向量生成服务 {} 未配置，添加图片和搜索将会失败", embedder.name());
        }

        info!("使用向量索引: {}，维度: {}", index.name(), index.dimension());
        Ok(ImageRag::new(
            store,
            index,
            embedder,
            FileStore::new(self.data_dir.uploads()),
            self.timeouts,
            self.max_concurrency,
        ))
    }
}
