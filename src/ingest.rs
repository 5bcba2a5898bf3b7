use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::time::Instant;

use crate::config::Timeouts;
use crate::db::{Image, MetadataStore, NewImage, Record, RecordDetail, StoreError};
use crate::deadline::{bounded, expired};
use crate::embedding::{Embedder, EmbeddingError, ImageFormat};
use crate::error::{CompensationFailed, Error, Result};
use crate::metrics;
use crate::storage::FileStore;
use crate::vector::{IndexError, VectorIndex, new_vector_id};

/// 待入库的图片
#[derive(Debug, Clone)]
pub struct ImageInput {
    /// 原始文件名，用于确定图片格式
    pub filename: String,
    pub data: Vec<u8>,
}

impl ImageInput {
    pub fn new(filename: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self { filename: filename.into(), data: data.into() }
    }

    pub fn format(&self) -> Result<ImageFormat> {
        ImageFormat::from_filename(&self.filename).ok_or_else(|| {
            Error::InvalidInput(format!(
                "不支持的图片格式: {}，仅支持 jpg、jpeg、png、webp",
                self.filename
            ))
        })
    }
}

/// 单张图片入库所处的阶段
///
/// `VectorWritten` 之后，要么写入元数据进入 `MetadataWritten`，要么补偿删除向量回到起点。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestState {
    Started,
    EmbeddingDone,
    VectorWritten,
    MetadataWritten,
}

impl IngestState {
    fn advance(self, next: IngestState, filename: &str) -> IngestState {
        debug!("入库 {filename}: {self:?} -> {next:?}");
        next
    }
}

/// 生成向量并让 SQLite 和向量索引保持一致
#[derive(Clone)]
pub struct Ingestor {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    store: Arc<dyn MetadataStore>,
    files: FileStore,
    timeouts: Timeouts,
}

impl Ingestor {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        store: Arc<dyn MetadataStore>,
        files: FileStore,
        timeouts: Timeouts,
    ) -> Self {
        Self { embedder, index, store, files, timeouts }
    }

    /// 将一张图片加入记录，返回保存后的图片
    ///
    /// `deadline` 只约束写入向量之前的步骤；向量写入后，元数据写入或补偿删除总会执行完毕，
    /// 即使调用方已放弃等待。
    pub async fn ingest(
        &self,
        record_id: i64,
        input: &ImageInput,
        deadline: Option<Instant>,
    ) -> Result<Image> {
        let result = self.run(record_id, input, deadline).await;
        match &result {
            Ok(image) => {
                info!("图片 {} 已加入记录 {record_id}，向量 {}", image.id, image.vector_id);
                metrics::inc_ingest("ok");
            }
            Err(e) => {
                warn!("图片 {} 加入记录 {record_id} 失败: {e}", input.filename);
                metrics::inc_ingest(e.kind());
            }
        }
        result
    }

    async fn run(
        &self,
        record_id: i64,
        input: &ImageInput,
        deadline: Option<Instant>,
    ) -> Result<Image> {
        let format = input.format()?;
        if expired(deadline) {
            return Err(Error::DeadlineExceeded);
        }
        let mut state = IngestState::Started;

        bounded(self.store.get_record(record_id), self.timeouts.store, deadline, StoreError::Timeout)
            .await
            .map_err(|e| Error::metadata_read(format!("记录 {record_id}"), e))?;

        let vector = embed_checked(
            self.embedder.as_ref(),
            self.index.dimension(),
            &input.data,
            format,
            self.timeouts.embed,
            deadline,
        )
        .await?;
        state = state.advance(IngestState::EmbeddingDone, &input.filename);

        let vector_id = new_vector_id();
        if expired(deadline) {
            return Err(Error::DeadlineExceeded);
        }
        let file = self.files.save(&input.filename, &input.data).await?;

        let pending = PendingImage::new(
            self.index.clone(),
            self.files.clone(),
            vector_id.clone(),
            file.path.clone(),
            self.timeouts.compensation,
        );
        let inserted = bounded(
            self.index.insert(&vector_id, &vector),
            self.timeouts.index,
            deadline,
            IndexError::Timeout,
        )
        .await;
        if let Err(source) = inserted {
            // 超时的写入可能已经在索引端生效
            let pending =
                if matches!(source, IndexError::Timeout(_)) { pending } else { pending.file_only() };
            let _ = pending.rollback().await;
            return Err(Error::IndexWrite { vector_id, source });
        }
        state = state.advance(IngestState::VectorWritten, &input.filename);

        let new_image = NewImage { record_id, filename: file.filename, path: file.path, vector_id };
        let commit = tokio::spawn(commit_metadata(
            self.store.clone(),
            new_image,
            pending,
            self.timeouts.store,
        ));
        let image = match commit.await {
            Ok(result) => result?,
            Err(e) => {
                return Err(Error::metadata_write(
                    format!("记录 {record_id}"),
                    StoreError::Interrupted(e.to_string()),
                ));
            }
        };
        state.advance(IngestState::MetadataWritten, &input.filename);

        Ok(image)
    }

    /// 删除图片：先删除数据库中的行，再删除向量和文件
    ///
    /// 删除向量失败时只记录孤儿向量，不影响删除结果。
    pub async fn delete_image(&self, image_id: i64) -> Result<Image> {
        let context = || format!("图片 {image_id}");
        let image =
            bounded(self.store.get_image(image_id), self.timeouts.store, None, StoreError::Timeout)
                .await
                .map_err(|e| Error::metadata_read(context(), e))?;

        bounded(self.store.delete_image(image_id), self.timeouts.store, None, StoreError::Timeout)
            .await
            .map_err(|e| write_error(context(), e))?;

        self.cleanup(vec![image.clone()]).await;
        info!("已删除图片 {image_id}，向量 {}", image.vector_id);
        Ok(image)
    }

    /// 删除记录，数据库级联删除图片后逐个删除向量和文件
    pub async fn delete_record(&self, record_id: i64) -> Result<RecordDetail> {
        let context = || format!("记录 {record_id}");
        let record: Record =
            bounded(self.store.get_record(record_id), self.timeouts.store, None, StoreError::Timeout)
                .await
                .map_err(|e| Error::metadata_read(context(), e))?;
        let images =
            bounded(self.store.list_images(record_id), self.timeouts.store, None, StoreError::Timeout)
                .await
                .map_err(|e| Error::metadata_read(context(), e))?;

        bounded(self.store.delete_record(record_id), self.timeouts.store, None, StoreError::Timeout)
            .await
            .map_err(|e| write_error(context(), e))?;

        self.cleanup(images.clone()).await;
        info!("已删除记录 {record_id} 及其 {} 张图片", images.len());
        Ok(RecordDetail { record, images })
    }

    /// 删除已无数据库行引用的向量和文件，在独立任务中执行完毕
    async fn cleanup(&self, images: Vec<Image>) {
        let task = tokio::spawn(remove_image_data(
            self.index.clone(),
            self.files.clone(),
            images,
            self.timeouts.compensation,
        ));
        if let Err(e) = task.await {
            error!("清理向量的任务异常退出: {e}");
        }
    }
}

/// 生成向量并检查维度
pub(crate) async fn embed_checked(
    embedder: &dyn Embedder,
    dimension: usize,
    data: &[u8],
    format: ImageFormat,
    timeout: Duration,
    deadline: Option<Instant>,
) -> Result<Vec<f32>> {
    let vector = bounded(embedder.embed(data, format), timeout, deadline, EmbeddingError::Timeout)
        .await?;
    check_dimension(dimension, vector.len())?;
    Ok(vector)
}

pub(crate) fn check_dimension(expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(Error::DimensionMismatch { expected, actual });
    }
    Ok(())
}

fn write_error(context: String, source: StoreError) -> Error {
    if source.is_not_found() {
        Error::metadata_read(context, source)
    } else {
        Error::metadata_write(context, source)
    }
}

async fn commit_metadata(
    store: Arc<dyn MetadataStore>,
    image: NewImage,
    pending: PendingImage,
    timeout: Duration,
) -> Result<Image> {
    match bounded(store.insert_image(&image), timeout, None, StoreError::Timeout).await {
        Ok(saved) => {
            pending.disarm();
            Ok(saved)
        }
        Err(source) => {
            warn!("写入图片元数据失败，回滚向量 {}: {source}", image.vector_id);
            let _ = pending.rollback().await;
            Err(Error::metadata_write(
                format!("记录 {} 的图片，向量 {}", image.record_id, image.vector_id),
                source,
            ))
        }
    }
}

async fn remove_image_data(
    index: Arc<dyn VectorIndex>,
    files: FileStore,
    images: Vec<Image>,
    timeout: Duration,
) {
    for image in images {
        let deleted =
            bounded(index.delete(&image.vector_id), timeout, None, IndexError::Timeout).await;
        if let Err(source) = deleted {
            let err = Error::IndexDelete { vector_id: image.vector_id, source };
            error!("图片 {} 的数据库行已删除，但{err}，该向量已成为孤儿", image.id);
            metrics::inc_orphan_vector("delete");
        }
        files.remove(&image.path).await;
    }
}

/// 已写入索引和文件存储、尚未被数据库行引用的图片数据
///
/// 未确认也未回滚就被丢弃时，在后台补偿删除向量和文件。
struct PendingImage {
    index: Arc<dyn VectorIndex>,
    files: FileStore,
    vector_id: Option<String>,
    path: Option<String>,
    timeout: Duration,
}

impl PendingImage {
    fn new(
        index: Arc<dyn VectorIndex>,
        files: FileStore,
        vector_id: String,
        path: String,
        timeout: Duration,
    ) -> Self {
        Self { index, files, vector_id: Some(vector_id), path: Some(path), timeout }
    }

    /// 向量确定没有写入，回滚时只删除文件
    fn file_only(mut self) -> Self {
        self.vector_id = None;
        self
    }

    fn disarm(mut self) {
        self.vector_id = None;
        self.path = None;
    }

    async fn rollback(mut self) -> std::result::Result<(), CompensationFailed> {
        let vector_id = self.vector_id.take();
        let path = self.path.take();
        let result = match vector_id {
            Some(vector_id) => compensate(self.index.as_ref(), &vector_id, self.timeout).await,
            None => Ok(()),
        };
        if let Some(path) = path {
            self.files.remove(&path).await;
        }
        result
    }
}

impl Drop for PendingImage {
    fn drop(&mut self) {
        let (vector_id, path) = (self.vector_id.take(), self.path.take());
        if vector_id.is_none() && path.is_none() {
            return;
        }
        let index = self.index.clone();
        let files = self.files.clone();
        let timeout = self.timeout;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Some(vector_id) = vector_id {
                        let _ = compensate(index.as_ref(), &vector_id, timeout).await;
                    }
                    if let Some(path) = path {
                        files.remove(&path).await;
                    }
                });
            }
            Err(_) => {
                if let Some(vector_id) = vector_id {
                    error!("无法补偿删除向量 {vector_id}: 没有可用的运行时，该向量已成为孤儿");
                    metrics::inc_orphan_vector("ingest");
                }
            }
        }
    }
}

/// 补偿删除向量，使用独立的超时时间
async fn compensate(
    index: &dyn VectorIndex,
    vector_id: &str,
    timeout: Duration,
) -> std::result::Result<(), CompensationFailed> {
    match bounded(index.delete(vector_id), timeout, None, IndexError::Timeout).await {
        Ok(()) => {
            warn!("已补偿删除向量 {vector_id}");
            metrics::inc_compensation(true);
            Ok(())
        }
        Err(source) => {
            let err = CompensationFailed { vector_id: vector_id.to_string(), source };
            error!("{err}");
            metrics::inc_compensation(false);
            metrics::inc_orphan_vector("ingest");
            Err(err)
        }
    }
}
