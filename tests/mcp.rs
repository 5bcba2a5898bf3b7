mod common;

use std::time::Duration;

use common::*;
use imrag::mcp::{JsonRpcRequest, McpServer, METHOD_NOT_FOUND, TOOL_NAME};
use serde_json::{Value, json};

fn server(h: &Harness) -> McpServer {
    McpServer::new(h.rag.clone(), Duration::from_secs(5))
}

fn request(value: Value) -> JsonRpcRequest {
    serde_json::from_value(value).unwrap()
}

fn call(id: i64, image_path: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "tools/call",
        "params": { "name": TOOL_NAME, "arguments": { "image_path": image_path } },
    })
}

#[tokio::test]
async fn test_lists_retrieve_tool() {
    let h = Harness::new().await;
    let server = server(&h);

    let init = server
        .handle(request(json!({ "jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {} })))
        .await
        .unwrap();
    assert!(init.result.unwrap()["capabilities"]["tools"].is_object());

    let list = server
        .handle(request(json!({ "jsonrpc": "2.0", "id": 2, "method": "tools/list" })))
        .await
        .unwrap();
    let tools = list.result.unwrap()["tools"].clone();
    assert_eq!(tools[0]["name"], TOOL_NAME);
    assert_eq!(tools[0]["inputSchema"]["required"], json!(["image_path"]));

    let notification =
        request(json!({ "jsonrpc": "2.0", "method": "notifications/initialized" }));
    assert!(server.handle(notification).await.is_none());
}

#[tokio::test]
async fn test_retrieve_returns_best_record() {
    let h = Harness::new().await;
    let cat = h.rag.create_record("猫", Some("一只橘猫")).await.unwrap();
    let dog = h.rag.create_record("狗", None).await.unwrap();
    let input = h.image("cat", axis(0));
    h.rag.add_image(cat.id, &input).await.unwrap();
    h.rag.add_image(dog.id, &h.image("dog", axis(1))).await.unwrap();

    let query = h.dir.path().join("query.jpg");
    std::fs::write(&query, &input.data).unwrap();

    let response = server(&h).handle(request(call(3, &query.to_string_lossy()))).await.unwrap();
    let result = response.result.unwrap();
    assert_eq!(result["isError"], false);
    assert_eq!(result["content"][0]["text"], "图片名 \"猫\", 图片描述: \"一只橘猫\"");
}

#[tokio::test]
async fn test_serve_reports_errors_per_line() {
    let h = Harness::new().await;
    let missing = h.dir.path().join("missing.jpg");
    let input = [
        json!({ "jsonrpc": "2.0", "id": 1, "method": "ping" }).to_string(),
        json!({ "jsonrpc": "2.0", "method": "notifications/initialized" }).to_string(),
        String::new(),
        call(2, &missing.to_string_lossy()).to_string(),
        json!({ "jsonrpc": "2.0", "id": 3, "method": "resources/list" }).to_string(),
        "not json".to_string(),
    ]
    .join("\n");

    let mut output = Vec::new();
    server(&h).serve(input.as_bytes(), &mut output).await.unwrap();

    let responses = String::from_utf8(output)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str::<Value>(line).unwrap())
        .collect::<Vec<_>>();
    assert_eq!(responses.len(), 4);
    assert_eq!(responses[0]["id"], 1);
    assert_eq!(responses[1]["id"], 2);
    assert_eq!(responses[1]["result"]["isError"], true);
    assert_eq!(responses[2]["error"]["code"], METHOD_NOT_FOUND);
    assert!(responses[3]["error"].is_object());
    assert_eq!(responses[3]["id"], Value::Null);
}

#[tokio::test]
async fn test_retrieve_without_records_is_error() {
    let h = Harness::new().await;
    let input = h.image("a", axis(0));
    let query = h.dir.path().join("a.jpg");
    std::fs::write(&query, &input.data).unwrap();

    let err = server(&h).retrieve(&query).await.unwrap_err();
    assert!(err.to_string().contains("没有找到相似的记录"));
}
