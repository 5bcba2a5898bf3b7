use std::sync::Arc;
use std::time::Instant;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum_typed_multipart::{FieldData, TypedMultipart};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use log::info;
use serde_json::{Value, json};

use super::error::{AppError, Result};
use super::state::AppState;
use super::types::*;
use crate::Error;
use crate::db::{Image, Record, RecordDetail, StoreError};
use crate::embedding::ImageFormat;
use crate::image_rag::{Health, RecordPage, Stats};
use crate::search::{SearchFilter, clamp_top_k};

/// 创建记录，同时可以上传多张图片
#[utoipa::path(
    post,
    path = "/api/v1/records",
    request_body(content = CreateRecordForm, content_type = "multipart/form-data"),
    responses(
        (status = 201, body = CreateRecordResponse),
        (status = 400, body = ErrorResponse),
    )
)]
pub async fn create_record_handler(
    State(state): State<Arc<AppState>>,
    TypedMultipart(data): TypedMultipart<CreateRecordRequest>,
) -> Result<(StatusCode, Json<CreateRecordResponse>)> {
    let inputs = image_inputs(data.images);
    let (record, outcome) = state
        .rag
        .create_record_with_images(&data.name, data.description.as_deref(), inputs, None)
        .await?;
    let ImagesResponse { images, failures } = outcome.into();
    Ok((StatusCode::CREATED, Json(CreateRecordResponse { record, images, failures })))
}

/// 分页列出记录，按创建时间倒序
#[utoipa::path(
    get,
    path = "/api/v1/records",
    params(PageQuery),
    responses(
        (status = 200, body = RecordPage),
    )
)]
pub async fn list_records_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PageQuery>,
) -> Result<Json<RecordPage>> {
    Ok(Json(state.rag.list_records(query.page, query.limit).await?))
}

/// 获取记录及其图片
#[utoipa::path(
    get,
    path = "/api/v1/records/{id}",
    params(("id" = i64, Path, description = "记录 ID")),
    responses(
        (status = 200, body = RecordDetail),
        (status = 404, body = ErrorResponse),
    )
)]
pub async fn get_record_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<RecordDetail>> {
    Ok(Json(state.rag.get_record(id).await?))
}

/// 更新记录名称或描述
#[utoipa::path(
    put,
    path = "/api/v1/records/{id}",
    params(("id" = i64, Path, description = "记录 ID")),
    request_body = UpdateRecordRequest,
    responses(
        (status = 200, body = Record),
        (status = 404, body = ErrorResponse),
    )
)]
pub async fn update_record_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(data): Json<UpdateRecordRequest>,
) -> Result<Json<Record>> {
    Ok(Json(state.rag.update_record(id, &data.into()).await?))
}

/// 删除记录及其所有图片
#[utoipa::path(
    delete,
    path = "/api/v1/records/{id}",
    params(("id" = i64, Path, description = "记录 ID")),
    responses(
        (status = 200, body = RecordDetail),
        (status = 404, body = ErrorResponse),
    )
)]
pub async fn delete_record_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<RecordDetail>> {
    Ok(Json(state.rag.delete_record(id).await?))
}

/// 向记录添加图片
#[utoipa::path(
    post,
    path = "/api/v1/records/{id}/images",
    params(("id" = i64, Path, description = "记录 ID")),
    request_body(content = AddImagesForm, content_type = "multipart/form-data"),
    responses(
        (status = 200, body = ImagesResponse),
        (status = 404, body = ErrorResponse),
    )
)]
pub async fn add_images_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    TypedMultipart(data): TypedMultipart<AddImagesRequest>,
) -> Result<Json<ImagesResponse>> {
    let inputs = image_inputs(data.images);
    if inputs.is_empty() {
        return Err(AppError::bad_request("没有上传图片"));
    }
    // 先确认记录存在，避免每张图片都返回相同的错误
    state.rag.get_record(id).await?;

    let mut outcome = state.rag.add_images(id, inputs, None).await;
    if outcome.succeeded().next().is_none() {
        if let Some(failure) = outcome.error.as_mut().and_then(|err| err.failures.pop()) {
            return Err(failure.error.into());
        }
    }
    Ok(Json(outcome.into()))
}

/// 删除图片
#[utoipa::path(
    delete,
    path = "/api/v1/images/{image_id}",
    params(("image_id" = i64, Path, description = "图片 ID")),
    responses(
        (status = 200, body = Image),
        (status = 404, body = ErrorResponse),
    )
)]
pub async fn delete_image_handler(
    State(state): State<Arc<AppState>>,
    Path(image_id): Path<i64>,
) -> Result<Json<Image>> {
    Ok(Json(state.rag.delete_image(image_id).await?))
}

/// 查看图片
#[utoipa::path(
    get,
    path = "/api/v1/images/{id}/preview",
    params(("id" = i64, Path, description = "图片 ID")),
    responses(
        (status = 200, content_type = "image/*", body = Vec<u8>),
        (status = 404, body = ErrorResponse),
    )
)]
pub async fn preview_image_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse> {
    let (image, data) = state.rag.read_image(id).await?;
    let content_type = ImageFormat::from_filename(&image.filename)
        .map(|format| format.content_type())
        .unwrap_or("application/octet-stream");
    Ok(([(header::CONTENT_TYPE, content_type)], data))
}

/// 搜索与上传图片相似的记录
#[utoipa::path(
    post,
    path = "/api/v1/search",
    request_body(content = SearchForm, content_type = "multipart/form-data"),
    responses(
        (status = 200, body = SearchResponse),
    )
)]
pub async fn search_handler(
    State(state): State<Arc<AppState>>,
    TypedMultipart(data): TypedMultipart<SearchRequest>,
) -> Result<Json<SearchResponse>> {
    search_upload(&state, data.file, data.top_k, &SearchFilter::default()).await
}

/// 带过滤条件的搜索
#[utoipa::path(
    post,
    path = "/api/v1/search/advanced",
    request_body(content = AdvancedSearchForm, content_type = "multipart/form-data"),
    responses(
        (status = 200, body = SearchResponse),
    )
)]
pub async fn advanced_search_handler(
    State(state): State<Arc<AppState>>,
    TypedMultipart(data): TypedMultipart<AdvancedSearchRequest>,
) -> Result<Json<SearchResponse>> {
    let filter = data.filter();
    search_upload(&state, data.file, data.top_k, &filter).await
}

async fn search_upload(
    state: &AppState,
    file: FieldData<Bytes>,
    top_k: Option<i64>,
    filter: &SearchFilter,
) -> Result<Json<SearchResponse>> {
    let format = upload_format(&file)?;
    info!("正在搜索上传图片 {:?}", file.metadata.file_name);

    let start = Instant::now();
    let results = state.rag.search(&file.contents, format, clamp_top_k(top_k), filter, None).await?;
    Ok(Json(SearchResponse { time: start.elapsed().as_millis() as u64, results }))
}

/// 搜索与已有图片相似的图片，原图会以距离 0 出现在结果中
#[utoipa::path(
    get,
    path = "/api/v1/search/similar/{id}",
    params(("id" = i64, Path, description = "图片 ID"), TopKQuery),
    responses(
        (status = 200, body = SearchResponse),
        (status = 404, body = ErrorResponse),
    )
)]
pub async fn similar_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(query): Query<TopKQuery>,
) -> Result<Json<SearchResponse>> {
    let start = Instant::now();
    let results =
        state.rag.find_similar(id, clamp_top_k(query.top_k), &SearchFilter::default(), None).await?;
    Ok(Json(SearchResponse { time: start.elapsed().as_millis() as u64, results }))
}

/// 根据向量 ID 查询图片和记录
#[utoipa::path(
    get,
    path = "/api/v1/search/by-vector/{vector_id}",
    params(("vector_id" = String, Path, description = "向量 ID")),
    responses(
        (status = 200, body = VectorLookupResponse),
        (status = 404, body = ErrorResponse),
    )
)]
pub async fn by_vector_handler(
    State(state): State<Arc<AppState>>,
    Path(vector_id): Path<String>,
) -> Result<Json<VectorLookupResponse>> {
    let (image, record) = state.rag.lookup_vector(&vector_id).await?;
    Ok(Json(VectorLookupResponse { image, record }))
}

/// 使用 base64 编码的图片搜索
#[utoipa::path(
    post,
    path = "/api/v1/search/base64",
    request_body = Base64SearchRequest,
    responses(
        (status = 200, body = SearchResponse),
        (status = 400, body = ErrorResponse),
    )
)]
pub async fn base64_search_handler(
    State(state): State<Arc<AppState>>,
    Json(data): Json<Base64SearchRequest>,
) -> Result<Json<SearchResponse>> {
    let (format, image) = decode_base64_image(&data.image, data.format)?;
    let start = Instant::now();
    let results = state
        .rag
        .search(&image, format, clamp_top_k(data.top_k), &SearchFilter::default(), None)
        .await?;
    Ok(Json(SearchResponse { time: start.elapsed().as_millis() as u64, results }))
}

/// 查找与图片最相似的记录
#[utoipa::path(
    post,
    path = "/api/v1/search/record-by-image",
    request_body(content = SearchForm, content_type = "multipart/form-data"),
    responses(
        (status = 200, body = RecordMatchResponse),
        (status = 404, body = ErrorResponse),
    )
)]
pub async fn record_by_image_handler(
    State(state): State<Arc<AppState>>,
    TypedMultipart(data): TypedMultipart<RecordByImageRequest>,
) -> Result<Json<RecordMatchResponse>> {
    let format = upload_format(&data.file)?;
    match state.rag.best_record(&data.file.contents, format, None).await? {
        Some((best, record)) => Ok(Json(RecordMatchResponse {
            distance: best.distance,
            matched_image_id: best.image_id,
            record,
        })),
        None => {
            Err(Error::metadata_read("相似记录", StoreError::NotFound("相似记录".into())).into())
        }
    }
}

/// 统计信息
#[utoipa::path(
    get,
    path = "/api/v1/stats",
    responses(
        (status = 200, body = Stats),
    )
)]
pub async fn stats_handler(State(state): State<Arc<AppState>>) -> Result<Json<Stats>> {
    Ok(Json(state.rag.stats().await?))
}

/// 健康检查
#[utoipa::path(
    get,
    path = "/api/v1/health",
    responses(
        (status = 200, body = Health),
        (status = 503, body = Health),
    )
)]
pub async fn health_handler(State(state): State<Arc<AppState>>) -> (StatusCode, Json<Health>) {
    let health = state.rag.health().await;
    let status =
        if health.is_healthy() { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(health))
}

/// 数据库和向量索引都可用时才可以接收请求
#[utoipa::path(get, path = "/api/v1/health/ready")]
pub async fn ready_handler(State(state): State<Arc<AppState>>) -> (StatusCode, Json<Value>) {
    let health = state.rag.health().await;
    if health.database && health.vector_index {
        (StatusCode::OK, Json(json!({ "status": "ready" })))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "status": "not ready" })))
    }
}

#[utoipa::path(get, path = "/api/v1/health/live")]
pub async fn live_handler() -> Json<Value> {
    Json(json!({ "status": "alive" }))
}

/// prometheus 指标
pub async fn metrics_handler() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], crate::metrics::gather_text())
}

fn upload_format(file: &FieldData<Bytes>) -> Result<ImageFormat> {
    let filename = file.metadata.file_name.as_deref().unwrap_or_default();
    ImageFormat::from_filename(filename).ok_or_else(|| {
        AppError::bad_request(format!("不支持的图片格式: {filename}，仅支持 jpg、jpeg、png、webp"))
    })
}

/// 解码 base64 图片，支持 data URL 前缀
fn decode_base64_image(
    payload: &str,
    format: Option<ImageFormat>,
) -> Result<(ImageFormat, Vec<u8>)> {
    let (prefix_format, encoded) = match payload.split_once(";base64,") {
        Some((prefix, encoded)) => {
            let format = prefix
                .strip_prefix("data:image/")
                .and_then(ImageFormat::from_extension);
            (format, encoded)
        }
        None => (None, payload),
    };
    let data = STANDARD
        .decode(encoded.trim())
        .map_err(|e| AppError::bad_request(format!("base64 解码失败: {e}")))?;
    if data.is_empty() {
        return Err(AppError::bad_request("图片内容为空"));
    }
    Ok((format.or(prefix_format).unwrap_or(ImageFormat::Jpeg), data))
}
