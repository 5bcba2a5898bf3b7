use thiserror::Error;

use crate::db::StoreError;
use crate::embedding::EmbeddingError;
use crate::vector::IndexError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// 编排层错误
///
/// 每个变体对应一个失败的步骤，并携带足以定位跨存储不一致的上下文（步骤、ID）。
#[derive(Debug, Error)]
pub enum Error {
    #[error("生成向量失败: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("向量维度不匹配: 期望 {expected}，实际 {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("写入向量 {vector_id} 失败: {source}")]
    IndexWrite {
        vector_id: String,
        #[source]
        source: IndexError,
    },

    #[error("向量检索失败: {0}")]
    IndexSearch(#[source] IndexError),

    #[error("删除向量 {vector_id} 失败: {source}")]
    IndexDelete {
        vector_id: String,
        #[source]
        source: IndexError,
    },

    #[error("写入元数据失败 ({context}): {source}")]
    MetadataWrite {
        context: String,
        #[source]
        source: StoreError,
    },

    #[error("读取元数据失败 ({context}): {source}")]
    MetadataRead {
        context: String,
        #[source]
        source: StoreError,
    },

    #[error("图片文件读写失败: {0}")]
    FileStorage(#[from] std::io::Error),

    #[error("无效输入: {0}")]
    InvalidInput(String),

    #[error("已超过截止时间，任务未执行")]
    DeadlineExceeded,

    #[error("任务异常退出: {0}")]
    TaskFailed(String),
}

impl Error {
    pub(crate) fn metadata_read(context: impl Into<String>, source: StoreError) -> Self {
        Self::MetadataRead { context: context.into(), source }
    }

    pub(crate) fn metadata_write(context: impl Into<String>, source: StoreError) -> Self {
        Self::MetadataWrite { context: context.into(), source }
    }

    /// 是否为"未找到"类错误
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::MetadataRead { source, .. } if source.is_not_found())
    }

    /// 失败步骤的简短标识，用于日志和指标标签
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Embedding(_) => "embedding",
            Self::DimensionMismatch { .. } => "dimension_mismatch",
            Self::IndexWrite { .. } => "index_write",
            Self::IndexSearch(_) => "index_search",
            Self::IndexDelete { .. } => "index_delete",
            Self::MetadataWrite { .. } => "metadata_write",
            Self::MetadataRead { .. } => "metadata_read",
            Self::FileStorage(_) => "file_storage",
            Self::InvalidInput(_) => "invalid_input",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::TaskFailed(_) => "task_failed",
        }
    }

    /// 调用方重试是否有意义，核心层自身从不重试
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Embedding(e) => e.is_retryable(),
            Self::IndexWrite { source, .. }
            | Self::IndexDelete { source, .. }
            | Self::IndexSearch(source) => source.is_retryable(),
            Self::MetadataWrite { source, .. } | Self::MetadataRead { source, .. } => {
                source.is_retryable()
            }
            Self::DeadlineExceeded => true,
            Self::DimensionMismatch { .. }
            | Self::FileStorage(_)
            | Self::InvalidInput(_)
            | Self::TaskFailed(_) => false,
        }
    }
}

/// 补偿删除失败，仅记录日志，不会覆盖原始错误
#[derive(Debug, Error)]
#[error("补偿删除向量 {vector_id} 失败，该向量已成为孤儿: {source}")]
pub struct CompensationFailed {
    pub vector_id: String,
    #[source]
    pub source: IndexError,
}
