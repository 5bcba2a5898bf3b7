mod doubao;

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use self::doubao::DoubaoEmbedder;

/// 向量生成服务的错误，区分可重试与不可重试两类
#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("服务不可用: {0}")]
    Unavailable(String),

    #[error("请求超时 ({0:?})")]
    Timeout(Duration),

    #[error("请求被限流: {0}")]
    RateLimited(String),

    #[error("输入被拒绝: {0}")]
    Rejected(String),

    #[error("响应格式错误: {0}")]
    InvalidResponse(String),
}

impl EmbeddingError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_) | Self::RateLimited(_))
    }
}

/// 支持的图片格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Jpeg,
    Png,
    Webp,
}

impl ImageFormat {
    /// 根据扩展名判断格式，不支持的扩展名返回 None
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Some(Self::Jpeg),
            "png" => Some(Self::Png),
            "webp" => Some(Self::Webp),
            _ => None,
        }
    }

    pub fn from_filename(filename: &str) -> Option<Self> {
        Path::new(filename).extension().and_then(|ext| Self::from_extension(&ext.to_string_lossy()))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Jpeg => "jpeg",
            Self::Png => "png",
            Self::Webp => "webp",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::Webp => "image/webp",
        }
    }
}

impl FromStr for ImageFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_extension(s).ok_or_else(|| format!("不支持的图片格式: {s}"))
    }
}

/// 图片向量生成服务
///
/// 实现应当是无状态的，开销较大的资源放在内部的 Arc 中。
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, image: &[u8], format: ImageFormat) -> Result<Vec<f32>, EmbeddingError>;

    /// 服务是否已正确配置，用于健康检查
    fn is_configured(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str;
}
