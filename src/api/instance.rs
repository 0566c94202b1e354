use axum::{
    extract::{Path, State},
    Json,
};
use serde_json::json;

use super::{ApiError, AppState};
use crate::db::InstanceRepository;
use crate::models::{
    ConnectionTestResult, CreateInstanceRequest, DatabaseInstance, TestConnectionRequest,
};
use crate::services::ConnectionService;

/// 测试连接
pub async fn test_instance(
    Json(request): Json<TestConnectionRequest>,
) -> Result<Json<ConnectionTestResult>, ApiError> {
    let result = ConnectionService::test_connection(&request).await?;
    Ok(Json(result))
}

/// 保存数据库实例
pub async fn save_instance(
    State(state): State<AppState>,
    Json(request): Json<CreateInstanceRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let repo = InstanceRepository::new(&state.pool, &state.cipher);
    let id = repo.save(request).await?;
    Ok(Json(json!({ "id": id })))
}

/// 获取所有实例
pub async fn list_instances(
    State(state): State<AppState>,
) -> Result<Json<Vec<DatabaseInstance>>, ApiError> {
    let repo = InstanceRepository::new(&state.pool, &state.cipher);
    let instances = repo.find_all().await?;
    Ok(Json(instances))
}

/// 更新实例
pub async fn update_instance(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(request): Json<CreateInstanceRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let repo = InstanceRepository::new(&state.pool, &state.cipher);
    repo.update(id, request).await?;
    Ok(Json(json!({ "success": true })))
}

/// 删除实例
pub async fn delete_instance(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let repo = InstanceRepository::new(&state.pool, &state.cipher);
    repo.delete(id).await?;
    Ok(Json(json!({ "success": true })))
}
