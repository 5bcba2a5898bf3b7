use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::{IndexError, SearchCandidate, VectorIndex, l2_distance};

#[derive(Default, Serialize, Deserialize)]
struct Snapshot {
    dimension: usize,
    vectors: HashMap<String, Vec<f32>>,
}

/// 进程内暴力检索索引
///
/// 指定快照路径时，每次写入后都会把全部向量写入快照文件（先写临时文件再重命名）。
pub struct LocalIndex {
    dimension: usize,
    vectors: RwLock<HashMap<String, Vec<f32>>>,
    snapshot: Option<PathBuf>,
}

impl LocalIndex {
    /// 仅存在于内存中的索引
    pub fn in_memory(dimension: usize) -> Self {
        Self { dimension, vectors: RwLock::new(HashMap::new()), snapshot: None }
    }

    /// 打开快照文件，不存在时创建一个空索引
    pub fn open(path: impl AsRef<Path>, dimension: usize) -> Result<Self> {
        let path = path.as_ref();
        let vectors = if path.exists() {
            let data = std::fs::read(path)?;
            let snapshot: Snapshot = bincode::deserialize(&data)?;
            if snapshot.dimension != dimension {
                bail!(
                    "索引文件 {} 的维度为 {}，与配置的 {} 不一致",
                    path.display(),
                    snapshot.dimension,
                    dimension
                );
            }
            info!("从 {} 加载了 {} 个向量", path.display(), snapshot.vectors.len());
            snapshot.vectors
        } else {
            HashMap::new()
        };
        Ok(Self { dimension, vectors: RwLock::new(vectors), snapshot: Some(path.to_path_buf()) })
    }

    async fn persist(&self, vectors: &HashMap<String, Vec<f32>>) -> Result<(), IndexError> {
        let Some(path) = &self.snapshot else {
            return Ok(());
        };
        let snapshot = SnapshotRef { dimension: self.dimension, vectors };
        let data =
            bincode::serialize(&snapshot).map_err(|e| IndexError::Rejected(e.to_string()))?;

        let mut tmp_file = path.clone();
        tmp_file.set_extension("tmp");
        tokio::fs::write(&tmp_file, data).await?;
        tokio::fs::rename(&tmp_file, path).await?;
        Ok(())
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<(), IndexError> {
        if vector.len() != self.dimension {
            return Err(IndexError::Rejected(format!(
                "向量维度应为 {}，实际为 {}",
                self.dimension,
                vector.len()
            )));
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct SnapshotRef<'a> {
    dimension: usize,
    vectors: &'a HashMap<String, Vec<f32>>,
}

#[async_trait]
impl VectorIndex for LocalIndex {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn insert(&self, id: &str, vector: &[f32]) -> Result<(), IndexError> {
        self.check_dimension(vector)?;
        let mut vectors = self.vectors.write().await;
        if vectors.contains_key(id) {
            return Err(IndexError::Rejected(format!("向量 ID 已存在: {id}")));
        }
        vectors.insert(id.to_owned(), vector.to_vec());
        if let Err(e) = self.persist(&vectors).await {
            // 快照写入失败时回滚，保证内存与磁盘一致
            vectors.remove(id);
            return Err(e);
        }
        debug!("插入向量 {id}");
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), IndexError> {
        let mut vectors = self.vectors.write().await;
        let Some(old) = vectors.remove(id) else {
            return Ok(());
        };
        if let Err(e) = self.persist(&vectors).await {
            vectors.insert(id.to_owned(), old);
            return Err(e);
        }
        debug!("删除向量 {id}");
        Ok(())
    }

    async fn search(&self, vector: &[f32], k: usize) -> Result<Vec<SearchCandidate>, IndexError> {
        self.check_dimension(vector)?;
        let vectors = self.vectors.read().await;
        let mut candidates = vectors
            .iter()
            .map(|(id, v)| SearchCandidate { vector_id: id.clone(), distance: l2_distance(vector, v) })
            .collect::<Vec<_>>();
        candidates.sort_by(|a, b| {
            a.distance.total_cmp(&b.distance).then_with(|| a.vector_id.cmp(&b.vector_id))
        });
        candidates.truncate(k);
        Ok(candidates)
    }

    async fn get(&self, id: &str) -> Result<Option<Vec<f32>>, IndexError> {
        Ok(self.vectors.read().await.get(id).cloned())
    }

    async fn count(&self) -> Result<u64, IndexError> {
        Ok(self.vectors.read().await.len() as u64)
    }

    async fn ping(&self) -> Result<(), IndexError> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "local"
    }
}
