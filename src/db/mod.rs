use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use log::info;
use sqlx::{SqlitePool, sqlite::*};
use thiserror::Error;

pub mod crud;
pub mod model;

pub use model::*;

pub type Database = SqlitePool;

pub async fn init_db(filename: impl AsRef<Path>) -> Result<Database, sqlx::Error> {
    let filename = filename.as_ref();
    info!("初始化数据库连接: {}", filename.display());

    let options = SqliteConnectOptions::new()
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true)
        .filename(filename)
        .create_if_missing(true);

    let pool = SqlitePool::connect_with(options).await?;

    info!("检查数据库迁移");
    sqlx::migrate!().run(&pool).await?;

    Ok(pool)
}

/// 元数据存储的错误
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} 不存在")]
    NotFound(String),

    #[error("数据库操作超时 ({0:?})")]
    Timeout(Duration),

    #[error("数据库操作被中断: {0}")]
    Interrupted(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Interrupted(_) => true,
            Self::Database(e) => {
                matches!(e, sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed)
            }
            Self::NotFound(_) => false,
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// 关系型元数据存储
///
/// 删除记录时必须级联删除其图片；`vector_id` 上需要有索引以支持反查。
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn create_record(&self, name: &str, description: Option<&str>) -> StoreResult<Record>;

    async fn get_record(&self, id: i64) -> StoreResult<Record>;

    /// 返回一页记录和记录总数
    async fn list_records(&self, limit: i64, offset: i64) -> StoreResult<(Vec<Record>, i64)>;

    async fn update_record(&self, id: i64, update: &RecordUpdate) -> StoreResult<Record>;

    async fn delete_record(&self, id: i64) -> StoreResult<()>;

    async fn insert_image(&self, image: &NewImage) -> StoreResult<Image>;

    async fn get_image(&self, id: i64) -> StoreResult<Image>;

    async fn list_images(&self, record_id: i64) -> StoreResult<Vec<Image>>;

    async fn delete_image(&self, id: i64) -> StoreResult<()>;

    /// 根据向量 ID 反查图片和记录
    async fn resolve_vector(&self, vector_id: &str) -> StoreResult<Option<(Image, Record)>>;

    async fn stats(&self) -> StoreResult<DashboardStats>;

    async fn ping(&self) -> StoreResult<()>;
}

/// 基于 SQLite 的元数据存储
#[derive(Clone)]
pub struct SqliteStore {
    pool: Database,
}

impl SqliteStore {
    pub fn new(pool: Database) -> Self {
        Self { pool }
    }

    pub async fn open(filename: impl AsRef<Path>) -> Result<Self, sqlx::Error> {
        Ok(Self::new(init_db(filename).await?))
    }

    pub fn pool(&self) -> &Database {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn create_record(&self, name: &str, description: Option<&str>) -> StoreResult<Record> {
        Ok(crud::add_record(&self.pool, name, description).await?)
    }

    async fn get_record(&self, id: i64) -> StoreResult<Record> {
        crud::get_record(&self.pool, id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("记录 {id}")))
    }

    async fn list_records(&self, limit: i64, offset: i64) -> StoreResult<(Vec<Record>, i64)> {
        let total = crud::count_records(&self.pool).await?;
        let records = crud::get_records(&self.pool, limit, offset).await?;
        Ok((records, total))
    }

    async fn update_record(&self, id: i64, update: &RecordUpdate) -> StoreResult<Record> {
        let name = update.name.as_deref().map(str::trim).filter(|name| !name.is_empty());
        let description =
            update.description.as_deref().map(|desc| Some(desc).filter(|d| !d.is_empty()));
        crud::update_record(&self.pool, id, name, description)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("记录 {id}")))
    }

    async fn delete_record(&self, id: i64) -> StoreResult<()> {
        match crud::delete_record(&self.pool, id).await? {
            true => Ok(()),
            false => Err(StoreError::NotFound(format!("记录 {id}"))),
        }
    }

    async fn insert_image(&self, image: &NewImage) -> StoreResult<Image> {
        Ok(crud::add_image(&self.pool, image).await?)
    }

    async fn get_image(&self, id: i64) -> StoreResult<Image> {
        crud::get_image(&self.pool, id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("图片 {id}")))
    }

    async fn list_images(&self, record_id: i64) -> StoreResult<Vec<Image>> {
        Ok(crud::get_images_by_record(&self.pool, record_id).await?)
    }

    async fn delete_image(&self, id: i64) -> StoreResult<()> {
        match crud::delete_image(&self.pool, id).await? {
            true => Ok(()),
            false => Err(StoreError::NotFound(format!("图片 {id}"))),
        }
    }

    async fn resolve_vector(&self, vector_id: &str) -> StoreResult<Option<(Image, Record)>> {
        let row = crud::get_image_record_by_vector_id(&self.pool, vector_id).await?;
        Ok(row.map(ImageRecordRow::split))
    }

    async fn stats(&self) -> StoreResult<DashboardStats> {
        Ok(crud::get_stats(&self.pool).await?)
    }

    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::{TempDir, tempdir};

    use super::*;

    async fn open_store() -> (TempDir, SqliteStore) {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("test.db")).await.unwrap();
        (dir, store)
    }

    fn new_image(record_id: i64, vector_id: &str) -> NewImage {
        NewImage {
            record_id,
            filename: format!("{vector_id}.jpg"),
            path: format!("uploads/{vector_id}.jpg"),
            vector_id: vector_id.to_string(),
        }
    }

    #[tokio::test]
    async fn test_record_crud() {
        let (_dir, store) = open_store().await;

        let record = store.create_record("猫", Some("一只猫")).await.unwrap();
        assert_eq!(store.get_record(record.id).await.unwrap(), record);

        let updated = store
            .update_record(record.id, &RecordUpdate { name: Some(String::new()), description: None })
            .await
            .unwrap();
        assert_eq!(updated.name, "猫");
        assert_eq!(updated.description.as_deref(), Some("一只猫"));

        let updated = store
            .update_record(
                record.id,
                &RecordUpdate { name: Some("狗".into()), description: Some(String::new()) },
            )
            .await
            .unwrap();
        assert_eq!(updated.name, "狗");
        assert_eq!(updated.description, None);

        store.delete_record(record.id).await.unwrap();
        assert!(store.get_record(record.id).await.unwrap_err().is_not_found());
        assert!(store.delete_record(record.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_empty_name_rejected_by_schema() {
        let (_dir, store) = open_store().await;
        assert!(store.create_record("", None).await.is_err());
    }

    #[tokio::test]
    async fn test_list_records_newest_first() {
        let (_dir, store) = open_store().await;
        for name in ["a", "b", "c"] {
            store.create_record(name, None).await.unwrap();
        }
        let (records, total) = store.list_records(2, 0).await.unwrap();
        assert_eq!(total, 3);
        assert_eq!(records.iter().map(|r| r.name.as_str()).collect::<Vec<_>>(), ["c", "b"]);
        let (records, _) = store.list_records(2, 2).await.unwrap();
        assert_eq!(records[0].name, "a");
    }

    #[tokio::test]
    async fn test_cascade_delete_and_resolve() {
        let (_dir, store) = open_store().await;
        let record = store.create_record("r", None).await.unwrap();
        let first = store.insert_image(&new_image(record.id, "v1")).await.unwrap();
        store.insert_image(&new_image(record.id, "v2")).await.unwrap();

        let images = store.list_images(record.id).await.unwrap();
        assert_eq!(images.len(), 2);
        assert_eq!(images[0], first);

        let (image, resolved) = store.resolve_vector("v1").await.unwrap().unwrap();
        assert_eq!(image.id, first.id);
        assert_eq!(resolved.id, record.id);
        assert!(store.resolve_vector("missing").await.unwrap().is_none());

        store.delete_record(record.id).await.unwrap();
        assert!(store.resolve_vector("v1").await.unwrap().is_none());
        assert!(store.get_image(first.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_image_requires_existing_record() {
        let (_dir, store) = open_store().await;
        assert!(store.insert_image(&new_image(42, "v1")).await.is_err());
    }

    #[tokio::test]
    async fn test_stats() {
        let (_dir, store) = open_store().await;
        let record = store.create_record("r", None).await.unwrap();
        store.insert_image(&new_image(record.id, "v1")).await.unwrap();
        let stats = store.stats().await.unwrap();
        assert_eq!(
            stats,
            DashboardStats { total_records: 1, total_images: 1, today_records: 1, today_images: 1 }
        );
    }
}
