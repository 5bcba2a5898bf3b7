mod api;
mod error;
mod state;
mod types;

use std::sync::Arc;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use tower_http::limit::RequestBodyLimitLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

pub use self::state::*;

#[derive(OpenApi)]
#[openapi(
    paths(
        api::create_record_handler,
        api::list_records_handler,
        api::get_record_handler,
        api::update_record_handler,
        api::delete_record_handler,
        api::add_images_handler,
        api::delete_image_handler,
        api::preview_image_handler,
        api::search_handler,
        api::advanced_search_handler,
        api::similar_handler,
        api::by_vector_handler,
        api::base64_search_handler,
        api::record_by_image_handler,
        api::stats_handler,
        api::health_handler,
        api::ready_handler,
        api::live_handler,
    ),
    components(schemas(
        types::CreateRecordForm,
        types::AddImagesForm,
        types::SearchForm,
        types::AdvancedSearchForm,
        types::ErrorResponse,
    ))
)]
pub struct ApiDoc;

/// 构建API服务器
///
/// `upload_limit` 为请求体大小上限，单位为字节。
pub fn create_app(state: Arc<AppState>, upload_limit: usize) -> Router {
    let api = Router::new()
        .route("/records", post(api::create_record_handler).get(api::list_records_handler))
        .route(
            "/records/{id}",
            get(api::get_record_handler)
                .put(api::update_record_handler)
                .delete(api::delete_record_handler),
        )
        .route("/records/{id}/images", post(api::add_images_handler))
        .route("/images/{image_id}", axum::routing::delete(api::delete_image_handler))
        .route("/images/{id}/preview", get(api::preview_image_handler))
        .route("/search", post(api::search_handler))
        .route("/search/advanced", post(api::advanced_search_handler))
        .route("/search/similar/{id}", get(api::similar_handler))
        .route("/search/by-vector/{vector_id}", get(api::by_vector_handler))
        .route("/search/base64", post(api::base64_search_handler))
        .route("/search/record-by-image", post(api::record_by_image_handler))
        .route("/stats", get(api::stats_handler))
        .route("/health", get(api::health_handler))
        .route("/health/ready", get(api::ready_handler))
        .route("/health/live", get(api::live_handler));

    Router::new()
        .nest("/api/v1", api)
        .route("/metrics", get(api::metrics_handler))
        .merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(upload_limit))
        .with_state(state)
}
