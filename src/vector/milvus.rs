use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use log::{debug, info};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use super::{IndexError, SearchCandidate, VectorIndex};
use crate::config::IndexOptions;

const ID_FIELD: &str = "image_id";
const VECTOR_FIELD: &str = "embedding";

/// Milvus RESTful (v2) 客户端
pub struct MilvusIndex {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
    database: String,
    collection: String,
    dimension: usize,
    timeout: Duration,
}

#[derive(Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
    data: Option<T>,
}

#[derive(Deserialize)]
struct HasCollection {
    has: bool,
}

#[derive(Deserialize)]
struct CollectionStats {
    #[serde(rename = "rowCount")]
    row_count: u64,
}

#[derive(Deserialize)]
struct DescribeCollection {
    fields: Vec<FieldSchema>,
}

#[derive(Deserialize)]
struct FieldSchema {
    name: String,
    #[serde(default)]
    params: Vec<FieldParam>,
}

#[derive(Deserialize)]
struct FieldParam {
    key: String,
    value: Value,
}

#[derive(Deserialize)]
struct SearchHit {
    distance: f32,
    image_id: String,
}

#[derive(Deserialize)]
struct QueryHit {
    embedding: Vec<f32>,
}

impl MilvusIndex {
    /// 连接 Milvus，集合不存在时创建，存在时校验向量维度，最后加载集合
    pub async fn connect(opts: &IndexOptions, dimension: usize, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let index = Self {
            client,
            url: opts.milvus_url.trim_end_matches('/').to_string(),
            token: opts.milvus_token.clone(),
            database: opts.milvus_database.clone(),
            collection: opts.milvus_collection.clone(),
            dimension,
            timeout,
        };

        let has: HasCollection = index
            .post("/v2/vectordb/collections/has", json!({}))
            .await
            .context("检查 Milvus 集合失败")?;
        if has.has {
            let dim = index.collection_dimension().await?;
            if dim != dimension {
                bail!("Milvus 集合 {} 的维度为 {dim}，与配置的 {dimension} 不一致", index.collection);
            }
        } else {
            info!("创建 Milvus 集合 {}", index.collection);
            index.create_collection().await.context("创建 Milvus 集合失败")?;
        }

        index
            .post::<Value>("/v2/vectordb/collections/load", json!({}))
            .await
            .context("加载 Milvus 集合失败")?;
        Ok(index)
    }

    async fn collection_dimension(&self) -> Result<usize> {
        let desc: DescribeCollection =
            self.post("/v2/vectordb/collections/describe", json!({})).await?;
        let field = desc
            .fields
            .iter()
            .find(|f| f.name == VECTOR_FIELD)
            .with_context(|| format!("集合中没有 {VECTOR_FIELD} 字段"))?;
        let dim = field
            .params
            .iter()
            .find(|p| p.key == "dim")
            .context("向量字段缺少 dim 参数")?;
        match &dim.value {
            Value::String(s) => Ok(s.parse()?),
            Value::Number(n) => n.as_u64().map(|n| n as usize).context("无效的 dim 参数"),
            other => bail!("无效的 dim 参数: {other}"),
        }
    }

    async fn create_collection(&self) -> Result<(), IndexError> {
        let body = json!({
            "schema": {
                "autoId": true,
                "enabledDynamicField": false,
                "fields": [
                    { "fieldName": "id", "dataType": "Int64", "isPrimary": true },
                    {
                        "fieldName": ID_FIELD,
                        "dataType": "VarChar",
                        "elementTypeParams": { "max_length": 100 }
                    },
                    {
                        "fieldName": VECTOR_FIELD,
                        "dataType": "FloatVector",
                        "elementTypeParams": { "dim": self.dimension.to_string() }
                    }
                ]
            },
            "indexParams": [{
                "fieldName": VECTOR_FIELD,
                "indexName": VECTOR_FIELD,
                "metricType": "L2",
                "indexType": "IVF_FLAT",
                "params": { "nlist": 1024 }
            }]
        });
        self.post::<Value>("/v2/vectordb/collections/create", body).await?;
        Ok(())
    }

    /// 发送请求，自动附加数据库和集合名称，并解析统一的响应格式
    async fn post<T: DeserializeOwned>(&self, path: &str, mut body: Value) -> Result<T, IndexError> {
        if let Value::Object(map) = &mut body {
            map.insert("dbName".into(), json!(self.database));
            map.insert("collectionName".into(), json!(self.collection));
        }

        let mut request = self.client.post(format!("{}{}", self.url, path)).json(&body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let resp = request.send().await.map_err(|e| {
            if e.is_timeout() {
                IndexError::Timeout(self.timeout)
            } else {
                IndexError::Unavailable(e.to_string())
            }
        })?;
        let status = resp.status();
        if status.is_server_error() {
            return Err(IndexError::Unavailable(format!("HTTP {status}")));
        }
        if !status.is_success() {
            return Err(IndexError::Rejected(format!("HTTP {status}")));
        }

        let envelope: Envelope<T> =
            resp.json().await.map_err(|e| IndexError::InvalidResponse(e.to_string()))?;
        parse_envelope(envelope)
    }
}

fn parse_envelope<T: DeserializeOwned>(envelope: Envelope<T>) -> Result<T, IndexError> {
    if envelope.code != 0 {
        return Err(IndexError::Rejected(format!("[{}] {}", envelope.code, envelope.message)));
    }
    match envelope.data {
        Some(data) => Ok(data),
        // 部分接口成功时不返回 data，此时尝试用 null 解析
        None => serde_json::from_value(Value::Null)
            .map_err(|_| IndexError::InvalidResponse("响应缺少 data 字段".to_string())),
    }
}

/// 构造过滤表达式，ID 只允许由字母、数字、`-` 和 `_` 组成
fn id_filter(id: &str) -> Result<String, IndexError> {
    if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return Err(IndexError::Rejected(format!("非法的向量 ID: {id:?}")));
    }
    Ok(format!(r#"{ID_FIELD} == "{id}""#))
}

#[async_trait]
impl VectorIndex for MilvusIndex {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn insert(&self, id: &str, vector: &[f32]) -> Result<(), IndexError> {
        id_filter(id)?;
        let body = json!({ "data": [{ ID_FIELD: id, VECTOR_FIELD: vector }] });
        self.post::<Value>("/v2/vectordb/entities/insert", body).await?;
        debug!("插入向量 {id}");
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), IndexError> {
        let body = json!({ "filter": id_filter(id)? });
        self.post::<Value>("/v2/vectordb/entities/delete", body).await?;
        debug!("删除向量 {id}");
        Ok(())
    }

    async fn search(&self, vector: &[f32], k: usize) -> Result<Vec<SearchCandidate>, IndexError> {
        let body = json!({
            "data": [vector],
            "annsField": VECTOR_FIELD,
            "limit": k,
            "outputFields": [ID_FIELD],
            "searchParams": { "metricType": "L2", "params": { "nprobe": 10 } }
        });
        let hits: Vec<SearchHit> = self.post("/v2/vectordb/entities/search", body).await?;
        Ok(hits
            .into_iter()
            .map(|hit| SearchCandidate { vector_id: hit.image_id, distance: hit.distance })
            .collect())
    }

    async fn get(&self, id: &str) -> Result<Option<Vec<f32>>, IndexError> {
        let body = json!({
            "filter": id_filter(id)?,
            "outputFields": [VECTOR_FIELD],
            "limit": 1
        });
        let hits: Vec<QueryHit> = self.post("/v2/vectordb/entities/query", body).await?;
        Ok(hits.into_iter().next().map(|hit| hit.embedding))
    }

    async fn count(&self) -> Result<u64, IndexError> {
        let stats: CollectionStats =
            self.post("/v2/vectordb/collections/get_stats", json!({})).await?;
        Ok(stats.row_count)
    }

    async fn ping(&self) -> Result<(), IndexError> {
        self.count().await.map(|_| ())
    }

    fn name(&self) -> &'static str {
        "milvus"
    }
}
