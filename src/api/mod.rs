pub mod instance;
pub mod task;

use axum::{
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use serde_json::json;
use sqlx::MySqlPool;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::services::QueryTaskService;
use crate::utils::crypto::CredentialCipher;
use crate::utils::error::AppError;

/// 路由共享状态
#[derive(Clone)]
pub struct AppState {
    pub pool: MySqlPool,
    pub cipher: Arc<CredentialCipher>,
    pub tasks: Arc<QueryTaskService>,
}

/// Health check endpoint
async fn health_check() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "service": "query-task-runner"
    }))
}

/// 创建 API 路由
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/api/health", get(health_check))

        // 数据库实例路由
        .route("/api/instances/test", post(instance::test_instance))
        .route(
            "/api/instances",
            post(instance::save_instance).get(instance::list_instances),
        )
        .route(
            "/api/instances/:id",
            put(instance::update_instance).delete(instance::delete_instance),
        )

        // 查询任务路由
        .route(
            "/api/query-tasks",
            post(task::create_task).get(task::list_tasks),
        )
        .route(
            "/api/query-tasks/:id",
            get(task::get_task).delete(task::delete_task),
        )
        .route("/api/query-tasks/:id/execute", post(task::execute_task))
        .route("/api/query-tasks/:id/cancel", post(task::cancel_task))
        .route("/api/query-tasks/:id/retry", post(task::retry_task))
        .route("/api/query-tasks/:id/results", get(task::get_results))
        .route("/api/query-tasks/:id/favorite", put(task::set_favorite))

        // CORS 配置
        .layer(CorsLayer::permissive())

        // 共享状态
        .with_state(state)
}

/// Axum 错误处理
pub struct ApiError(AppError);

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::InvalidInput(_) | AppError::InvalidTransition { .. } => {
                StatusCode::BAD_REQUEST
            }
            AppError::CorruptTaskData { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self.0);
        }

        let body = Json(json!({
            "error": self.0.to_string(),
        }));

        (status, body).into_response()
    }
}

impl<E> From<E> for ApiError
where
    E: Into<AppError>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
