pub mod api;
pub mod config;
pub mod entities;
pub mod infrastructure;
pub mod services;
pub mod utils;

use crate::config::AppConfig;
use crate::services::ingress::IngressService;
use crate::services::worker::WorkerStats;
use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware::from_fn,
    routing::{get, post},
};
use sea_orm::DatabaseConnection;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        api::handlers::health::health_check,
        api::handlers::files::upload_file,
    ),
    components(
        schemas(
            api::handlers::health::HealthResponse,
            api::handlers::files::UploadForm,
            services::worker::WorkerStatsSnapshot,
            services::metadata::FileMetadataRecord,
        )
    ),
    tags(
        (name = "system", description = "Service status"),
        (name = "files", description = "Upload and processing round trip")
    )
)]
pub struct ApiDoc;

#[derive(Clone)]
pub struct AppState {
    pub db: DatabaseConnection,
    pub ingress: Arc<IngressService>,
    pub config: AppConfig,
    /// Set when the processing worker runs in this process
    pub worker_stats: Option<Arc<WorkerStats>>,
}

pub fn create_app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([
            axum::http::header::CONTENT_DISPOSITION,
            axum::http::HeaderName::from_static(api::handlers::files::FILE_ID_HEADER),
        ]);

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .route("/health", get(api::handlers::health::health_check))
        .route(
            "/files/upload_file",
            post(api::handlers::files::upload_file).layer(DefaultBodyLimit::max(
                state.config.server.max_upload_size + 10 * 1024 * 1024, // multipart overhead
            )),
        )
        .layer(from_fn(api::middleware::metrics::metrics_middleware))
        .layer(from_fn(api::middleware::request_id::request_id_middleware))
        .layer(cors)
        .with_state(state)
}
