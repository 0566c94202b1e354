use async_trait::async_trait;

use crate::models::{HistoryQuery, QueryTask, StatementResult, TaskSummary};
use crate::utils::error::Result;

/// 任务持久化接口
///
/// 执行引擎只通过该接口读写任务记录；软删除的任务对 `load` / `list` 不可见。
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// 插入新任务及其语句，返回任务 ID
    async fn create(&self, task: &QueryTask) -> Result<i64>;

    /// 条件迁移 Pending → Running，同时写入总数和开始时间。
    ///
    /// 持久化状态已不是 `Pending` 时返回 `InvalidTransition`，同一任务只会被启动一次。
    async fn start(&self, task: &QueryTask) -> Result<()>;

    /// 写回状态、计数器和时间戳
    async fn save(&self, task: &QueryTask) -> Result<()>;

    /// 读取任务。目标列表无法解码时返回 `CorruptTaskData`。
    async fn load(&self, task_id: i64) -> Result<QueryTask>;

    /// 将待执行任务标记为已拒绝，不需要解码目标列表
    async fn mark_rejected(&self, task_id: i64, reason: &str) -> Result<()>;

    async fn append_results(&self, task_id: i64, results: &[StatementResult]) -> Result<()>;

    async fn load_results(&self, task_id: i64) -> Result<Vec<StatementResult>>;

    async fn list(&self, query: &HistoryQuery) -> Result<Vec<TaskSummary>>;

    async fn set_favorite(&self, task_id: i64, is_favorite: bool) -> Result<()>;

    async fn soft_delete(&self, task_id: i64) -> Result<()>;
}
