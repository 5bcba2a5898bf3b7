use axum::body::Bytes;
use axum_typed_multipart::{FieldData, TryFromMultipart};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::batch::BatchOutcome;
use crate::db::{Image, Record, RecordDetail, RecordUpdate};
use crate::embedding::ImageFormat;
use crate::ingest::ImageInput;
use crate::search::{RankedMatch, SearchFilter};

/// 转换上传的文件，保持上传顺序
///
/// 没有文件名的文件无法确定格式，入库时会在对应位置报告为失败。
pub fn image_inputs(files: Vec<FieldData<Bytes>>) -> Vec<ImageInput> {
    files
        .into_iter()
        .map(|file| {
            let filename = file.metadata.file_name.unwrap_or_default();
            ImageInput::new(filename, file.contents.to_vec())
        })
        .collect()
}

/// 创建记录的请求
#[derive(TryFromMultipart)]
pub struct CreateRecordRequest {
    pub name: String,
    pub description: Option<String>,
    #[form_data(field_name = "images", limit = "unlimited")]
    pub images: Vec<FieldData<Bytes>>,
}

/// 创建记录的表单（用于API文档）
#[derive(Debug, ToSchema)]
#[allow(unused)]
pub struct CreateRecordForm {
    /// 记录名称
    pub name: String,
    /// 记录描述
    pub description: Option<String>,
    /// 图片文件，可以上传多张，支持 jpg、jpeg、png、webp
    #[schema(format = Binary, content_media_type = "application/octet-stream")]
    pub images: Option<Vec<String>>,
}

/// 添加图片的请求
#[derive(TryFromMultipart)]
pub struct AddImagesRequest {
    #[form_data(field_name = "images", limit = "unlimited")]
    pub images: Vec<FieldData<Bytes>>,
}

/// 添加图片的表单（用于API文档）
#[derive(Debug, ToSchema)]
#[allow(unused)]
pub struct AddImagesForm {
    /// 图片文件，可以上传多张
    #[schema(format = Binary, content_media_type = "application/octet-stream")]
    pub images: Vec<String>,
}

/// 单张图片入库失败的原因
#[derive(Debug, Serialize, ToSchema)]
pub struct ImageFailure {
    pub index: usize,
    pub filename: String,
    pub error: String,
}

/// 批量添加图片的结果
#[derive(Debug, Serialize, ToSchema)]
pub struct ImagesResponse {
    pub images: Vec<Image>,
    pub failures: Vec<ImageFailure>,
}

impl From<BatchOutcome> for ImagesResponse {
    fn from(outcome: BatchOutcome) -> Self {
        let failures = outcome
            .error
            .map(|err| {
                err.failures
                    .into_iter()
                    .map(|f| ImageFailure {
                        index: f.index,
                        filename: f.filename,
                        error: f.error.to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Self { images: outcome.results.into_iter().flatten().collect(), failures }
    }
}

/// 创建记录的结果
#[derive(Debug, Serialize, ToSchema)]
pub struct CreateRecordResponse {
    #[serde(flatten)]
    pub record: Record,
    pub images: Vec<Image>,
    pub failures: Vec<ImageFailure>,
}

/// 分页参数
#[derive(Debug, Deserialize, IntoParams)]
pub struct PageQuery {
    /// 页码，从 1 开始
    pub page: Option<i64>,
    /// 每页数量，范围 1-100，默认 10
    pub limit: Option<i64>,
}

/// 更新记录的请求，未提供的字段保持不变
#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateRecordRequest {
    /// 新名称，空字符串会被忽略
    pub name: Option<String>,
    /// 新描述，空字符串会清除描述
    pub description: Option<String>,
}

impl From<UpdateRecordRequest> for RecordUpdate {
    fn from(req: UpdateRecordRequest) -> Self {
        Self { name: req.name, description: req.description }
    }
}

/// 搜索请求
#[derive(TryFromMultipart)]
pub struct SearchRequest {
    #[form_data(limit = "unlimited")]
    pub file: FieldData<Bytes>,
    pub top_k: Option<i64>,
}

/// 搜索表单（用于API文档）
#[derive(Debug, ToSchema)]
#[allow(unused)]
pub struct SearchForm {
    /// 被搜索的图片
    #[schema(format = Binary, content_media_type = "application/octet-stream")]
    pub file: String,
    /// 返回结果数量，范围 1-100，默认 10
    pub top_k: Option<i64>,
}

/// 高级搜索请求
#[derive(TryFromMultipart)]
pub struct AdvancedSearchRequest {
    #[form_data(limit = "unlimited")]
    pub file: FieldData<Bytes>,
    pub top_k: Option<i64>,
    pub q: Option<String>,
    pub record_name: Option<String>,
    pub min_distance: Option<f32>,
    pub max_distance: Option<f32>,
}

impl AdvancedSearchRequest {
    pub fn filter(&self) -> SearchFilter {
        SearchFilter {
            text: self.q.clone(),
            record_name: self.record_name.clone(),
            min_distance: self.min_distance,
            max_distance: self.max_distance,
        }
    }
}

/// 高级搜索表单（用于API文档）
#[derive(Debug, ToSchema)]
#[allow(unused)]
pub struct AdvancedSearchForm {
    /// 被搜索的图片
    #[schema(format = Binary, content_media_type = "application/octet-stream")]
    pub file: String,
    /// 返回结果数量，范围 1-100，默认 10
    pub top_k: Option<i64>,
    /// 在记录名称和描述中查找的文本
    pub q: Option<String>,
    /// 在记录名称中查找的文本
    pub record_name: Option<String>,
    /// 最小距离
    pub min_distance: Option<f32>,
    /// 最大距离
    pub max_distance: Option<f32>,
}

/// 以图搜记录的请求
#[derive(TryFromMultipart)]
pub struct RecordByImageRequest {
    #[form_data(limit = "unlimited")]
    pub file: FieldData<Bytes>,
}

/// 相似图片搜索参数
#[derive(Debug, Deserialize, IntoParams)]
pub struct TopKQuery {
    /// 返回结果数量，范围 1-100，默认 10
    pub top_k: Option<i64>,
}

/// base64 图片搜索请求
#[derive(Debug, Deserialize, ToSchema)]
pub struct Base64SearchRequest {
    /// base64 编码的图片，可以带有 `data:image/png;base64,` 前缀
    pub image: String,
    /// 图片格式，未指定时从前缀推断，默认为 jpeg
    pub format: Option<ImageFormat>,
    pub top_k: Option<i64>,
}

/// 搜索结果
#[derive(Debug, Serialize, ToSchema)]
pub struct SearchResponse {
    /// 搜索耗时，单位为毫秒
    pub time: u64,
    pub results: Vec<RankedMatch>,
}

/// 以图搜记录的结果
#[derive(Debug, Serialize, ToSchema)]
pub struct RecordMatchResponse {
    pub distance: f32,
    pub matched_image_id: i64,
    pub record: RecordDetail,
}

/// 根据向量 ID 查询的结果
#[derive(Debug, Serialize, ToSchema)]
pub struct VectorLookupResponse {
    pub image: Image,
    pub record: Record,
}

/// 错误响应
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    /// 失败步骤
    pub kind: String,
    pub error: String,
}
