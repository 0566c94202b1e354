use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use serde_json::json;

use super::{ApiError, AppState};
use crate::models::{
    CreateQueryTaskRequest, FavoriteRequest, HistoryQuery, QueryTask, StatementResult,
    TaskSummary,
};

#[derive(Debug, Default, Deserialize)]
pub struct RetryParams {
    /// 只创建重试任务，不立即执行
    #[serde(default)]
    pub defer: bool,
}

/// 创建查询任务
pub async fn create_task(
    State(state): State<AppState>,
    Json(request): Json<CreateQueryTaskRequest>,
) -> Result<Json<QueryTask>, ApiError> {
    let task = state.tasks.submit(request).await?;
    Ok(Json(task))
}

/// 获取任务列表
pub async fn list_tasks(
    State(state): State<AppState>,
    Query(params): Query<HistoryQuery>,
) -> Result<Json<Vec<TaskSummary>>, ApiError> {
    let tasks = state.tasks.list(&params).await?;
    Ok(Json(tasks))
}

/// 获取任务当前状态
pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<QueryTask>, ApiError> {
    let task = state.tasks.status(id).await?;
    Ok(Json(task))
}

/// 删除任务
pub async fn delete_task(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.tasks.delete(id).await?;
    Ok(Json(json!({ "success": true })))
}

/// 执行待执行的任务
pub async fn execute_task(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<QueryTask>, ApiError> {
    let task = state.tasks.execute(id).await?;
    Ok(Json(task))
}

/// 取消任务
pub async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<QueryTask>, ApiError> {
    let task = state.tasks.cancel(id)?;
    Ok(Json(task))
}

/// 重试失败的目标和语句
pub async fn retry_task(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(params): Query<RetryParams>,
) -> Result<Json<QueryTask>, ApiError> {
    let task = state.tasks.retry_failed(id, params.defer).await?;
    Ok(Json(task))
}

/// 获取逐条执行结果
pub async fn get_results(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Vec<StatementResult>>, ApiError> {
    let results = state.tasks.results(id).await?;
    Ok(Json(results))
}

/// 收藏 / 取消收藏
pub async fn set_favorite(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(request): Json<FavoriteRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.tasks.set_favorite(id, request.is_favorite).await?;
    Ok(Json(json!({ "success": true })))
}
