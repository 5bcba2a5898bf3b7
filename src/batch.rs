use std::fmt;
use std::sync::Arc;

use log::info;
use tokio::sync::Semaphore;
use tokio::time::Instant;

use crate::db::Image;
use crate::deadline::expired;
use crate::error::Error;
use crate::ingest::{ImageInput, Ingestor};

/// 批量入库中单张图片的失败
#[derive(Debug)]
pub struct BatchFailure {
    /// 在输入中的位置
    pub index: usize,
    pub filename: String,
    pub error: Error,
}

/// 批量入库中失败图片的汇总
#[derive(Debug)]
pub struct BatchError {
    pub total: usize,
    pub failures: Vec<BatchFailure>,
}

impl fmt::Display for BatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} 张图片中有 {} 张入库失败", self.total, self.failures.len())?;
        for failure in &self.failures {
            write!(f, "\n  [{}] {}: {}", failure.index, failure.filename, failure.error)?;
        }
        Ok(())
    }
}

impl std::error::Error for BatchError {}

impl BatchError {
    pub fn indices(&self) -> Vec<usize> {
        self.failures.iter().map(|failure| failure.index).collect()
    }
}

/// 批量入库的结果
///
/// `results` 与输入一一对应，失败的位置为 `None`。
#[derive(Debug)]
pub struct BatchOutcome {
    pub results: Vec<Option<Image>>,
    pub error: Option<BatchError>,
}

impl BatchOutcome {
    pub fn succeeded(&self) -> impl Iterator<Item = &Image> {
        self.results.iter().flatten()
    }

    pub fn is_complete(&self) -> bool {
        self.error.is_none()
    }
}

/// 限制并发数地将多张图片加入同一条记录
#[derive(Clone)]
pub struct BatchIngestor {
    ingestor: Ingestor,
    max_concurrency: usize,
}

impl BatchIngestor {
    pub fn new(ingestor: Ingestor, max_concurrency: usize) -> Self {
        Self { ingestor, max_concurrency: max_concurrency.max(1) }
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// 每张图片独立入库，单张失败不影响其他图片
    ///
    /// 截止时间过后尚未开始的图片不再处理，直接记为 `DeadlineExceeded`。
    pub async fn ingest_batch(
        &self,
        record_id: i64,
        inputs: Vec<ImageInput>,
        deadline: Option<Instant>,
    ) -> BatchOutcome {
        let total = inputs.len();
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));

        let tasks = inputs
            .into_iter()
            .map(|input| {
                let filename = input.filename.clone();
                let semaphore = semaphore.clone();
                let ingestor = self.ingestor.clone();
                let handle = tokio::spawn(async move {
                    // 信号量不会被关闭
                    let Ok(_permit) = semaphore.acquire_owned().await else {
                        return Err(Error::DeadlineExceeded);
                    };
                    if expired(deadline) {
                        return Err(Error::DeadlineExceeded);
                    }
                    ingestor.ingest(record_id, &input, deadline).await
                });
                (filename, handle)
            })
            .collect::<Vec<_>>();

        let mut results = Vec::with_capacity(total);
        let mut failures = vec![];
        for (index, (filename, handle)) in tasks.into_iter().enumerate() {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => Err(Error::TaskFailed(e.to_string())),
            };
            match result {
                Ok(image) => results.push(Some(image)),
                Err(error) => {
                    results.push(None);
                    failures.push(BatchFailure { index, filename, error });
                }
            }
        }

        info!(
            "记录 {record_id} 批量入库完成: 成功 {}，失败 {}",
            total - failures.len(),
            failures.len()
        );

        let error = (!failures.is_empty()).then_some(BatchError { total, failures });
        BatchOutcome { results, error }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_error_display() {
        let err = BatchError {
            total: 3,
            failures: vec![BatchFailure {
                index: 1,
                filename: "b.gif".into(),
                error: Error::InvalidInput("不支持的图片格式".into()),
            }],
        };
        assert_eq!(err.indices(), [1]);
        let text = err.to_string();
        assert!(text.starts_with("3 张图片中有 1 张入库失败"));
        assert!(text.contains("[1] b.gif"));
    }
}
