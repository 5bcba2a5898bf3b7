mod local;
mod milvus;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

pub use self::local::LocalIndex;
pub use self::milvus::MilvusIndex;

/// 向量索引的错误
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("索引服务不可用: {0}")]
    Unavailable(String),

    #[error("索引请求超时 ({0:?})")]
    Timeout(Duration),

    #[error("索引拒绝请求: {0}")]
    Rejected(String),

    #[error("索引响应格式错误: {0}")]
    InvalidResponse(String),

    #[error("索引 IO 错误: {0}")]
    Io(#[from] std::io::Error),
}

impl IndexError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }
}

/// 索引返回的单个候选结果，距离越小越相似
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchCandidate {
    pub vector_id: String,
    pub distance: f32,
}

/// 向量相似度索引
///
/// 距离度量（L2）和维度在启动时校验一次，调用时不再检查。
/// `search` 的结果必须按距离升序排列。
#[async_trait]
pub trait VectorIndex: Send + Sync {
    fn dimension(&self) -> usize;

    async fn insert(&self, id: &str, vector: &[f32]) -> Result<(), IndexError>;

    /// 删除不存在的 ID 不视为错误
    async fn delete(&self, id: &str) -> Result<(), IndexError>;

    async fn search(&self, vector: &[f32], k: usize) -> Result<Vec<SearchCandidate>, IndexError>;

    /// 读取已存储的向量
    async fn get(&self, id: &str) -> Result<Option<Vec<f32>>, IndexError>;

    async fn count(&self) -> Result<u64, IndexError>;

    async fn ping(&self) -> Result<(), IndexError>;

    fn name(&self) -> &'static str;
}

/// 平方 L2 距离，与 Milvus 的 L2 度量一致
pub fn l2_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// 新的全局唯一向量 ID
pub fn new_vector_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
