use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use log::debug;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use super::{Embedder, EmbeddingError, ImageFormat};
use crate::config::EmbeddingOptions;

/// 豆包多模态向量接口客户端
#[derive(Clone)]
pub struct DoubaoEmbedder {
    client: reqwest::Client,
    api_key: String,
    model: String,
    url: String,
    timeout: std::time::Duration,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: EmbeddingInput<'a>,
}

#[derive(Serialize)]
struct EmbeddingInput<'a> {
    images: Vec<ImageData<'a>>,
}

#[derive(Serialize)]
struct ImageData<'a> {
    data: String,
    format: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

impl DoubaoEmbedder {
    pub fn new(opts: &EmbeddingOptions, timeout: std::time::Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_key: opts.doubao_api_key.clone().unwrap_or_default(),
            model: opts.doubao_model.clone(),
            url: opts.doubao_url.clone(),
            timeout,
        })
    }

    fn map_send_error(&self, err: reqwest::Error) -> EmbeddingError {
        if err.is_timeout() {
            EmbeddingError::Timeout(self.timeout)
        } else {
            EmbeddingError::Unavailable(err.to_string())
        }
    }
}

#[async_trait]
impl Embedder for DoubaoEmbedder {
    async fn embed(&self, image: &[u8], format: ImageFormat) -> Result<Vec<f32>, EmbeddingError> {
        if self.api_key.is_empty() {
            return Err(EmbeddingError::Unavailable("未配置 DOUBAO_API_KEY".to_string()));
        }

        let request = EmbeddingRequest {
            model: &self.model,
            input: EmbeddingInput {
                images: vec![ImageData { data: STANDARD.encode(image), format: format.as_str() }],
            },
        };

        debug!("请求向量: {} 字节, 格式 {}", image.len(), format.as_str());
        let resp = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, body));
        }

        let response: EmbeddingResponse =
            resp.json().await.map_err(|e| EmbeddingError::InvalidResponse(e.to_string()))?;
        response
            .data
            .into_iter()
            .next()
            .map(|data| data.embedding)
            .ok_or_else(|| EmbeddingError::InvalidResponse("响应中没有向量数据".to_string()))
    }

    fn is_configured(&self) -> bool {
        !self.api_key.is_empty()
    }

    fn name(&self) -> &'static str {
        "doubao"
    }
}

fn classify_status(status: StatusCode, body: String) -> EmbeddingError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => EmbeddingError::RateLimited(body),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
            EmbeddingError::Unavailable(format!("{status}: {body}"))
        }
        s if s.is_server_error() => EmbeddingError::Unavailable(format!("{status}: {body}")),
        _ => EmbeddingError::Rejected(format!("{status}: {body}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status() {
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, String::new()).is_retryable());
        assert!(classify_status(StatusCode::BAD_GATEWAY, String::new()).is_retryable());
        assert!(!classify_status(StatusCode::BAD_REQUEST, String::new()).is_retryable());
        assert!(!classify_status(StatusCode::UNAUTHORIZED, String::new()).is_retryable());
    }

    #[test]
    fn test_request_body() {
        let request = EmbeddingRequest {
            model: "m",
            input: EmbeddingInput {
                images: vec![ImageData { data: STANDARD.encode([1u8, 2, 3]), format: "png" }],
            },
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "model": "m",
                "input": { "images": [{ "data": "AQID", "format": "png" }] }
            })
        );
    }
}
