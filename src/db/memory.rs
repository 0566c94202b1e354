use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::BTreeMap;

use crate::db::TaskStore;
use crate::models::{
    HistoryQuery, QueryTask, StatementResult, TaskDatabases, TaskStatus, TaskSummary,
};
use crate::utils::error::{AppError, Result};

#[derive(Debug, Clone)]
struct StoredTask {
    /// 不含目标列表的任务记录
    task: QueryTask,
    /// 目标列表的持久化文本，与 MySQL 实现一致
    databases: String,
    deleted: bool,
    results: Vec<StatementResult>,
}

/// 内存任务存储
///
/// 用于测试和无数据库环境，目标列表同样以 JSON 文本保存并在读取时解码。
#[derive(Debug, Default)]
pub struct MemoryTaskStore {
    inner: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: i64,
    tasks: BTreeMap<i64, StoredTask>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 直接覆盖持久化的目标列表文本
    pub fn overwrite_databases(&self, task_id: i64, raw: &str) -> Result<()> {
        let mut state = self.inner.lock();
        let stored = state
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| AppError::NotFound(format!("Task with id {} not found", task_id)))?;
        stored.databases = raw.to_string();
        Ok(())
    }
}

fn live<'a>(state: &'a mut MemoryState, task_id: i64) -> Result<&'a mut StoredTask> {
    state
        .tasks
        .get_mut(&task_id)
        .filter(|t| !t.deleted)
        .ok_or_else(|| AppError::NotFound(format!("Task with id {} not found", task_id)))
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn create(&self, task: &QueryTask) -> Result<i64> {
        let databases = task.databases.encode()?;
        let mut state = self.inner.lock();
        state.next_id += 1;
        let id = state.next_id;

        let mut stored = task.clone();
        stored.id = id;
        stored.databases = TaskDatabases::default();
        state.tasks.insert(
            id,
            StoredTask {
                task: stored,
                databases,
                deleted: false,
                results: Vec::new(),
            },
        );

        Ok(id)
    }

    async fn start(&self, task: &QueryTask) -> Result<()> {
        let mut state = self.inner.lock();
        let stored = live(&mut state, task.id)?;
        if stored.task.status != TaskStatus::Pending {
            return Err(AppError::InvalidTransition {
                from: stored.task.status.to_string(),
                to: TaskStatus::Running.to_string(),
            });
        }
        let record = &mut stored.task;
        record.status = TaskStatus::Running;
        record.counters = task.counters;
        record.started_at = task.started_at;
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn save(&self, task: &QueryTask) -> Result<()> {
        let mut state = self.inner.lock();
        let stored = live(&mut state, task.id)?;
        let record = &mut stored.task;
        record.status = task.status;
        record.counters = task.counters;
        record.started_at = task.started_at;
        record.completed_at = task.completed_at;
        record.error_message = task.error_message.clone();
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn load(&self, task_id: i64) -> Result<QueryTask> {
        let mut state = self.inner.lock();
        let stored = live(&mut state, task_id)?;
        let mut task = stored.task.clone();
        task.databases = TaskDatabases::decode(task_id, &stored.databases)?;
        Ok(task)
    }

    async fn mark_rejected(&self, task_id: i64, reason: &str) -> Result<()> {
        let mut state = self.inner.lock();
        let stored = live(&mut state, task_id)?;
        if stored.task.status != TaskStatus::Pending {
            return Err(AppError::NotFound(format!(
                "Pending task with id {} not found",
                task_id
            )));
        }
        let now = Utc::now();
        stored.task.status = TaskStatus::Rejected;
        stored.task.error_message = Some(reason.to_string());
        stored.task.completed_at = Some(now);
        stored.task.updated_at = now;
        Ok(())
    }

    async fn append_results(&self, task_id: i64, results: &[StatementResult]) -> Result<()> {
        let mut state = self.inner.lock();
        let stored = live(&mut state, task_id)?;
        stored.results.extend_from_slice(results);
        Ok(())
    }

    async fn load_results(&self, task_id: i64) -> Result<Vec<StatementResult>> {
        let mut state = self.inner.lock();
        let stored = live(&mut state, task_id)?;
        let mut results = stored.results.clone();
        results.sort_by_key(|r| (r.target_index, r.position));
        Ok(results)
    }

    async fn list(&self, query: &HistoryQuery) -> Result<Vec<TaskSummary>> {
        let status = query.status_filter()?;
        let state = self.inner.lock();

        Ok(state
            .tasks
            .values()
            .rev()
            .filter(|t| !t.deleted)
            .filter(|t| status.map_or(true, |s| t.task.status == s))
            .filter(|t| query.favorite.map_or(true, |f| t.task.is_favorite == f))
            .skip(query.offset() as usize)
            .take(query.limit() as usize)
            .map(|t| TaskSummary::from(&t.task))
            .collect())
    }

    async fn set_favorite(&self, task_id: i64, is_favorite: bool) -> Result<()> {
        let mut state = self.inner.lock();
        live(&mut state, task_id)?.task.is_favorite = is_favorite;
        Ok(())
    }

    async fn soft_delete(&self, task_id: i64) -> Result<()> {
        let mut state = self.inner.lock();
        live(&mut state, task_id)?.deleted = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Statement, TargetDescriptor};

    fn task(name: &str) -> QueryTask {
        let dbs = TaskDatabases::new(vec![TargetDescriptor {
            instance_id: 1,
            database_name: "app".into(),
            instance_name: "primary".into(),
        }])
        .unwrap();
        QueryTask::new_pending(
            name.into(),
            String::new(),
            false,
            dbs,
            Statement::from_texts(["SELECT 1"]).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_create_and_load() {
        let store = MemoryTaskStore::new();
        let id = store.create(&task("a")).await.unwrap();

        let loaded = store.load(id).await.unwrap();
        assert_eq!(loaded.id, id);
        assert_eq!(loaded.databases.len(), 1);
        assert_eq!(loaded.statements.len(), 1);
        assert_eq!(loaded.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_corrupt_databases_surface_on_load() {
        let store = MemoryTaskStore::new();
        let id = store.create(&task("a")).await.unwrap();
        store.overwrite_databases(id, "{broken").unwrap();

        assert!(matches!(
            store.load(id).await,
            Err(AppError::CorruptTaskData { task_id, .. }) if task_id == id
        ));

        store.mark_rejected(id, "corrupt").await.unwrap();
        let summary = store.list(&HistoryQuery::default()).await.unwrap();
        assert_eq!(summary[0].status, TaskStatus::Rejected);
    }

    #[tokio::test]
    async fn test_start_claims_a_pending_task_once() {
        let store = MemoryTaskStore::new();
        let mut running = task("a");
        running.id = store.create(&running).await.unwrap();
        running.status = TaskStatus::Running;

        store.start(&running).await.unwrap();
        assert_eq!(store.load(running.id).await.unwrap().status, TaskStatus::Running);
        assert!(matches!(
            store.start(&running).await,
            Err(AppError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_soft_deleted_tasks_are_invisible() {
        let store = MemoryTaskStore::new();
        let id = store.create(&task("a")).await.unwrap();
        store.create(&task("b")).await.unwrap();

        store.soft_delete(id).await.unwrap();

        assert!(matches!(store.load(id).await, Err(AppError::NotFound(_))));
        let listed = store.list(&HistoryQuery::default()).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].task_name, "b");
    }

    #[tokio::test]
    async fn test_list_filters() {
        let store = MemoryTaskStore::new();
        let a = store.create(&task("a")).await.unwrap();
        store.create(&task("b")).await.unwrap();
        store.set_favorite(a, true).await.unwrap();

        let favorites = store
            .list(&HistoryQuery {
                favorite: Some(true),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(favorites.len(), 1);
        assert_eq!(favorites[0].id, a);

        let bad = store
            .list(&HistoryQuery {
                status: Some("unknown".into()),
                ..Default::default()
            })
            .await;
        assert!(matches!(bad, Err(AppError::InvalidInput(_))));
    }
}
