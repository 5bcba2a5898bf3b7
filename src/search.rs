use std::sync::Arc;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use utoipa::ToSchema;

use crate::config::Timeouts;
use crate::db::{Image, MetadataStore, Record, StoreError};
use crate::deadline::{bounded, expired};
use crate::embedding::{Embedder, ImageFormat};
use crate::error::{Error, Result};
use crate::ingest::{check_dimension, embed_checked};
use crate::metrics;
use crate::vector::{IndexError, SearchCandidate, VectorIndex};

pub const DEFAULT_TOP_K: usize = 10;
pub const MAX_TOP_K: usize = 100;

/// 将请求的 top_k 限制在 [1, 100]，未指定时为 10
pub fn clamp_top_k(top_k: Option<i64>) -> usize {
    match top_k {
        None => DEFAULT_TOP_K,
        Some(k) => k.clamp(1, MAX_TOP_K as i64) as usize,
    }
}

/// 元数据解析之后应用的过滤条件
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct SearchFilter {
    /// 在记录名称和描述中查找的文本，不区分大小写
    pub text: Option<String>,
    /// 在记录名称中查找的文本，不区分大小写
    pub record_name: Option<String>,
    pub min_distance: Option<f32>,
    pub max_distance: Option<f32>,
}

impl SearchFilter {
    pub fn is_empty(&self) -> bool {
        self.text.as_deref().is_none_or(str::is_empty)
            && self.record_name.as_deref().is_none_or(str::is_empty)
            && self.min_distance.is_none()
            && self.max_distance.is_none()
    }

    pub fn matches(&self, record: &Record, distance: f32) -> bool {
        if self.min_distance.is_some_and(|min| distance < min) {
            return false;
        }
        if self.max_distance.is_some_and(|max| distance > max) {
            return false;
        }
        if let Some(text) = self.text.as_deref().filter(|s| !s.is_empty()) {
            let in_name = contains_ignore_case(&record.name, text);
            let in_desc = record.description.as_deref().is_some_and(|d| contains_ignore_case(d, text));
            if !in_name && !in_desc {
                return false;
            }
        }
        if let Some(name) = self.record_name.as_deref().filter(|s| !s.is_empty()) {
            if !contains_ignore_case(&record.name, name) {
                return false;
            }
        }
        true
    }
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

/// 一条搜索结果，按距离从近到远排列
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct RankedMatch {
    pub record_id: i64,
    pub record_name: String,
    pub description: Option<String>,
    pub image_id: i64,
    pub filename: String,
    /// 平方 L2 距离，越小越相似
    pub distance: f32,
}

impl RankedMatch {
    fn new(image: &Image, record: Record, distance: f32) -> Self {
        Self {
            record_id: record.id,
            record_name: record.name,
            description: record.description,
            image_id: image.id,
            filename: image.filename.clone(),
            distance,
        }
    }
}

/// 以图搜图：生成向量、查询索引、回查元数据
#[derive(Clone)]
pub struct Searcher {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    store: Arc<dyn MetadataStore>,
    timeouts: Timeouts,
}

impl Searcher {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        store: Arc<dyn MetadataStore>,
        timeouts: Timeouts,
    ) -> Self {
        Self { embedder, index, store, timeouts }
    }

    /// 搜索与图片最相似的记录
    ///
    /// `deadline` 约束整个搜索过程中的每一次外部调用。
    pub async fn search(
        &self,
        image: &[u8],
        format: ImageFormat,
        top_k: usize,
        filter: &SearchFilter,
        deadline: Option<Instant>,
    ) -> Result<Vec<RankedMatch>> {
        if expired(deadline) {
            return Err(Error::DeadlineExceeded);
        }
        let start = Instant::now();
        let vector = embed_checked(
            self.embedder.as_ref(),
            self.index.dimension(),
            image,
            format,
            self.timeouts.embed,
            deadline,
        )
        .await?;
        debug!("查询向量生成耗时 {:.2}s", start.elapsed().as_secs_f32());

        let result = self.ranked(&vector, top_k, filter, deadline).await?;
        metrics::observe_search_duration("image", start.elapsed().as_secs_f32());
        info!("搜索完成，返回 {} 条结果，耗时 {:.2}s", result.len(), start.elapsed().as_secs_f32());
        Ok(result)
    }

    /// 使用已有的向量搜索
    pub async fn search_by_vector(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: &SearchFilter,
        deadline: Option<Instant>,
    ) -> Result<Vec<RankedMatch>> {
        check_dimension(self.index.dimension(), vector.len())?;
        if expired(deadline) {
            return Err(Error::DeadlineExceeded);
        }
        let start = Instant::now();
        let result = self.ranked(vector, top_k, filter, deadline).await?;
        metrics::observe_search_duration("vector", start.elapsed().as_secs_f32());
        Ok(result)
    }

    /// 搜索与已有图片相似的图片，使用索引中保存的向量，因此原图以距离 0 排在首位
    pub async fn find_similar(
        &self,
        image_id: i64,
        top_k: usize,
        filter: &SearchFilter,
        deadline: Option<Instant>,
    ) -> Result<Vec<RankedMatch>> {
        if expired(deadline) {
            return Err(Error::DeadlineExceeded);
        }
        let start = Instant::now();
        let image =
            bounded(self.store.get_image(image_id), self.timeouts.store, deadline, StoreError::Timeout)
                .await
                .map_err(|e| Error::metadata_read(format!("图片 {image_id}"), e))?;

        let vector =
            bounded(self.index.get(&image.vector_id), self.timeouts.index, deadline, IndexError::Timeout)
                .await
                .map_err(Error::IndexSearch)?
                .ok_or_else(|| {
                    Error::IndexSearch(IndexError::Rejected(format!(
                        "图片 {image_id} 的向量 {} 不在索引中",
                        image.vector_id
                    )))
                })?;

        let result = self.ranked(&vector, top_k, filter, deadline).await?;
        metrics::observe_search_duration("similar", start.elapsed().as_secs_f32());
        Ok(result)
    }

    /// 返回最相似的一条结果
    pub async fn best_match(
        &self,
        image: &[u8],
        format: ImageFormat,
        deadline: Option<Instant>,
    ) -> Result<Option<RankedMatch>> {
        let result = self.search(image, format, 1, &SearchFilter::default(), deadline).await?;
        Ok(result.into_iter().next())
    }

    /// 根据向量 ID 查找图片和记录
    pub async fn lookup_vector(&self, vector_id: &str) -> Result<(Image, Record)> {
        let context = || format!("向量 {vector_id}");
        bounded(self.store.resolve_vector(vector_id), self.timeouts.store, None, StoreError::Timeout)
            .await
            .map_err(|e| Error::metadata_read(context(), e))?
            .ok_or_else(|| Error::metadata_read(context(), StoreError::NotFound(context())))
    }

    /// 查询索引并回查元数据，保持索引给出的顺序
    async fn ranked(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: &SearchFilter,
        deadline: Option<Instant>,
    ) -> Result<Vec<RankedMatch>> {
        let mut candidates = bounded(
            self.index.search(vector, top_k),
            self.timeouts.index,
            deadline,
            IndexError::Timeout,
        )
        .await
        .map_err(Error::IndexSearch)?;
        candidates.truncate(top_k);

        let mut result = Vec::with_capacity(candidates.len());
        let (mut orphans, mut filtered) = (0, 0);
        for SearchCandidate { vector_id, distance } in candidates {
            let resolved = bounded(
                self.store.resolve_vector(&vector_id),
                self.timeouts.store,
                deadline,
                StoreError::Timeout,
            )
            .await
            .map_err(|e| Error::metadata_read(format!("向量 {vector_id}"), e))?;

            let Some((image, record)) = resolved else {
                debug!("丢弃无法解析的向量 {vector_id}");
                orphans += 1;
                continue;
            };
            if !filter.matches(&record, distance) {
                filtered += 1;
                continue;
            }
            result.push(RankedMatch::new(&image, record, distance));
        }

        if orphans > 0 {
            warn!("搜索结果中有 {orphans} 个向量没有对应的图片");
        }
        metrics::inc_search_dropped("orphan", orphans);
        metrics::inc_search_dropped("filtered", filtered);
        metrics::observe_search_results(result.len());
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use rstest::rstest;

    use super::*;

    fn record(name: &str, description: Option<&str>) -> Record {
        Record {
            id: 1,
            name: name.to_string(),
            description: description.map(str::to_string),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[rstest]
    #[case(None, 10)]
    #[case(Some(0), 1)]
    #[case(Some(-5), 1)]
    #[case(Some(42), 42)]
    #[case(Some(1000), 100)]
    fn test_clamp_top_k(#[case] input: Option<i64>, #[case] expected: usize) {
        assert_eq!(clamp_top_k(input), expected);
    }

    #[test]
    fn test_filter_text() {
        let cat = record("Orange Cat", Some("sleeps on the sofa"));
        let filter = SearchFilter { text: Some("SOFA".into()), ..Default::default() };
        assert!(filter.matches(&cat, 0.0));
        let filter = SearchFilter { text: Some("dog".into()), ..Default::default() };
        assert!(!filter.matches(&cat, 0.0));
        let filter = SearchFilter { record_name: Some("sofa".into()), ..Default::default() };
        assert!(!filter.matches(&cat, 0.0));
        let filter = SearchFilter { record_name: Some("cat".into()), ..Default::default() };
        assert!(filter.matches(&cat, 0.0));
    }

    #[test]
    fn test_filter_distance() {
        let cat = record("cat", None);
        let filter =
            SearchFilter { min_distance: Some(0.1), max_distance: Some(0.5), ..Default::default() };
        assert!(!filter.is_empty());
        assert!(!filter.matches(&cat, 0.05));
        assert!(filter.matches(&cat, 0.1));
        assert!(filter.matches(&cat, 0.5));
        assert!(!filter.matches(&cat, 0.6));
        assert!(SearchFilter::default().is_empty());
        assert!(SearchFilter::default().matches(&cat, f32::MAX));
    }
}
