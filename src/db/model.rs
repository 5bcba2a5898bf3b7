use chrono::{DateTime, Utc};
use serde::Serialize;
use utoipa::ToSchema;

/// 记录
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow, ToSchema)]
pub struct Record {
    /// 记录 ID
    pub id: i64,
    /// 名称，不能为空
    pub name: String,
    /// 描述
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 图片记录
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow, ToSchema)]
pub struct Image {
    /// 图片 ID
    pub id: i64,
    /// 所属记录 ID，创建后不可修改
    pub record_id: i64,
    /// 存储的文件名
    pub filename: String,
    /// 文件路径
    pub path: String,
    /// 向量索引中对应向量的 ID
    pub vector_id: String,
    pub created_at: DateTime<Utc>,
}

/// 记录及其全部图片，图片按创建顺序排列
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct RecordDetail {
    #[serde(flatten)]
    pub record: Record,
    pub images: Vec<Image>,
}

/// 待插入的图片
#[derive(Debug, Clone)]
pub struct NewImage {
    pub record_id: i64,
    pub filename: String,
    pub path: String,
    pub vector_id: String,
}

/// 记录更新，`name` 为空时保持不变，`description` 为空字符串时清除
#[derive(Debug, Clone, Default)]
pub struct RecordUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
}

/// 仪表盘统计
#[derive(Debug, Clone, Default, PartialEq, Serialize, ToSchema)]
pub struct DashboardStats {
    pub total_records: i64,
    pub total_images: i64,
    pub today_records: i64,
    pub today_images: i64,
}

/// 图片与记录的联表查询结果
#[derive(sqlx::FromRow)]
pub(super) struct ImageRecordRow {
    pub image_id: i64,
    pub record_id: i64,
    pub filename: String,
    pub path: String,
    pub vector_id: String,
    pub image_created_at: DateTime<Utc>,
    pub name: String,
    pub description: Option<String>,
    pub record_created_at: DateTime<Utc>,
    pub record_updated_at: DateTime<Utc>,
}

impl ImageRecordRow {
    pub fn split(self) -> (Image, Record) {
        let image = Image {
            id: self.image_id,
            record_id: self.record_id,
            filename: self.filename,
            path: self.path,
            vector_id: self.vector_id,
            created_at: self.image_created_at,
        };
        let record = Record {
            id: self.record_id,
            name: self.name,
            description: self.description,
            created_at: self.record_created_at,
            updated_at: self.record_updated_at,
        };
        (image, record)
    }
}
