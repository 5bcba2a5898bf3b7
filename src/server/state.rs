use std::sync::Arc;

use crate::ImageRag;

/// 应用状态
pub struct AppState {
    /// 图片检索服务
    pub rag: ImageRag,
}

impl AppState {
    /// 创建新的应用状态
    pub fn new(rag: ImageRag) -> Arc<Self> {
        Arc::new(AppState { rag })
    }
}
