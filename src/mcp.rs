//! 基于标准输入输出的 MCP 工具服务
//!
//! 每行一条 JSON-RPC 消息，stdout 只用于输出协议消息，日志写到 stderr。

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

use crate::embedding::ImageFormat;
use crate::image_rag::ImageRag;

/// 图片检索工具名称
pub const TOOL_NAME: &str = "image-rag-retrive";
pub const PROTOCOL_VERSION: &str = "2024-11-05";

pub const PARSE_ERROR: i64 = -32700;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;

#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    /// 通知没有 id
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    jsonrpc: &'static str,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Serialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
}

impl JsonRpcResponse {
    fn success(id: Value, result: Value) -> Self {
        Self { jsonrpc: "2.0", id, result: Some(result), error: None }
    }

    fn error(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(JsonRpcError { code, message: message.into() }),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RetrieveArgs {
    image_path: PathBuf,
}

/// 提供图片检索工具的 MCP 服务
#[derive(Clone)]
pub struct McpServer {
    rag: ImageRag,
    timeout: Duration,
}

impl McpServer {
    /// `timeout` 为单次检索的截止时间
    pub fn new(rag: ImageRag, timeout: Duration) -> Self {
        Self { rag, timeout }
    }

    /// 逐行读取请求并写回响应，直到输入结束
    pub async fn serve<R, W>(&self, reader: R, mut writer: W) -> anyhow::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = reader.lines();
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let response = match serde_json::from_str::<JsonRpcRequest>(line) {
                Ok(request) => self.handle(request).await,
                Err(e) => {
                    warn!("无法解析 MCP 请求: {e}");
                    let message = format!("无法解析请求: {e}");
                    Some(JsonRpcResponse::error(Value::Null, PARSE_ERROR, message))
                }
            };
            if let Some(response) = response {
                let mut body = serde_json::to_vec(&response)?;
                body.push(b'\n');
                writer.write_all(&body).await?;
                writer.flush().await?;
            }
        }
        info!("输入已结束，MCP 服务退出");
        Ok(())
    }

    /// 处理一条请求，通知返回 `None`
    pub async fn handle(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        debug!("MCP 请求: {}", request.method);
        let id = request.id?;
        let response = match request.method.as_str() {
            "initialize" => JsonRpcResponse::success(id, initialize_result()),
            "ping" => JsonRpcResponse::success(id, json!({})),
            "tools/list" => JsonRpcResponse::success(id, json!({ "tools": [tool_definition()] })),
            "tools/call" => self.call_tool(id, request.params).await,
            method => JsonRpcResponse::error(id, METHOD_NOT_FOUND, format!("未知的方法: {method}")),
        };
        Some(response)
    }

    async fn call_tool(&self, id: Value, params: Value) -> JsonRpcResponse {
        let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
        if name != TOOL_NAME {
            return JsonRpcResponse::error(id, INVALID_PARAMS, format!("未知的工具: {name}"));
        }
        let args = params.get("arguments").cloned().unwrap_or(Value::Null);
        let args: RetrieveArgs = match serde_json::from_value(args) {
            Ok(args) => args,
            Err(e) => return JsonRpcResponse::error(id, INVALID_PARAMS, format!("参数错误: {e}")),
        };

        let (text, is_error) = match self.retrieve(&args.image_path).await {
            Ok(text) => (text, false),
            Err(e) => {
                warn!("检索图片 {} 失败: {e:#}", args.image_path.display());
                (format!("查询图片信息失败: {e:#}"), true)
            }
        };
        JsonRpcResponse::success(
            id,
            json!({
                "content": [{ "type": "text", "text": text }],
                "isError": is_error,
            }),
        )
    }

    /// 查找与图片最相似的记录，返回记录的名称和描述
    pub async fn retrieve(&self, path: &Path) -> anyhow::Result<String> {
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("无法读取图片 {}", path.display()))?;
        let format =
            ImageFormat::from_filename(&path.to_string_lossy()).unwrap_or(ImageFormat::Jpeg);
        let deadline = Instant::now() + self.timeout;
        let Some((best, detail)) = self.rag.best_record(&data, format, Some(deadline)).await? else {
            bail!("没有找到相似的记录");
        };
        debug!("图片 {} 最相似的记录为 {}，距离 {}", path.display(), best.record_id, best.distance);
        let record = detail.record;
        Ok(format!(
            "图片名 \"{}\", 图片描述: \"{}\"",
            record.name,
            record.description.unwrap_or_default()
        ))
    }
}

fn initialize_result() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": { "tools": { "listChanged": false } },
        "serverInfo": { "name": "imrag", "version": env!("CARGO_PKG_VERSION") },
    })
}

fn tool_definition() -> Value {
    json!({
        "name": TOOL_NAME,
        "description": "根据输入图片文件路径进行向量搜索，返回最相似记录的名称和描述，用于后续的图片内容解析和问答。",
        "inputSchema": {
            "type": "object",
            "properties": {
                "image_path": { "type": "string", "description": "输入图片文件路径" }
            },
            "required": ["image_path"],
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_without_id_is_notification() {
        let request: JsonRpcRequest =
            serde_json::from_str(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
                .unwrap();
        assert!(request.id.is_none());
        assert_eq!(request.params, Value::Null);
    }

    #[test]
    fn test_response_serialization() {
        let ok = serde_json::to_value(JsonRpcResponse::success(json!(1), json!({}))).unwrap();
        assert_eq!(ok, json!({ "jsonrpc": "2.0", "id": 1, "result": {} }));

        let err = serde_json::to_value(JsonRpcResponse::error(json!("a"), METHOD_NOT_FOUND, "x"))
            .unwrap();
        assert_eq!(err["error"]["code"], METHOD_NOT_FOUND);
        assert!(err.get("result").is_none());
    }
}
