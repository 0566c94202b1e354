use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::db::TaskStore;
use crate::models::{
    CreateQueryTaskRequest, HistoryQuery, QueryTask, Statement, StatementResult, TaskDatabases,
    TaskStatus, TaskSummary,
};
use crate::services::connection_service::ConnectionFactory;
use crate::services::coordinator::{ExecutionCoordinator, TaskRun};
use crate::utils::error::{AppError, Result};

const MAX_TASK_NAME_CHARS: usize = 100;

/// 查询任务服务
///
/// 负责任务的提交、启动、取消和重试。正在执行的任务登记在 `running` 中，
/// 状态查询优先读取内存快照。终态写入失败的任务暂存在 `unsaved` 中，
/// 之后每次访问都会重新尝试写入。
pub struct QueryTaskService {
    store: Arc<dyn TaskStore>,
    coordinator: ExecutionCoordinator,
    running: DashMap<i64, Arc<TaskRun>>,
    unsaved: DashMap<i64, QueryTask>,
}

impl QueryTaskService {
    pub fn new(
        store: Arc<dyn TaskStore>,
        factory: Arc<dyn ConnectionFactory>,
        config: EngineConfig,
    ) -> Self {
        Self {
            coordinator: ExecutionCoordinator::new(Arc::clone(&store), factory, config),
            store,
            running: DashMap::new(),
            unsaved: DashMap::new(),
        }
    }

    /// 创建任务，除非 `defer` 为真，否则立即在后台执行
    pub async fn submit(self: &Arc<Self>, req: CreateQueryTaskRequest) -> Result<QueryTask> {
        let defer = req.defer;
        let mut task = validate_request(req)?;

        task.id = self.store.create(&task).await?;
        tracing::info!(
            "Created query task {} '{}' ({} databases, {} statements)",
            task.id,
            task.task_name,
            task.databases.len(),
            task.statements.len()
        );

        if !defer {
            self.execute(task.id).await?;
        }

        Ok(task)
    }

    /// 启动一个待执行任务，立即返回 `Running` 快照
    pub async fn execute(self: &Arc<Self>, task_id: i64) -> Result<QueryTask> {
        let (run, task) = self.start(task_id).await?;
        let snapshot = task.clone();

        let service = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = service.drive(run, task).await {
                tracing::error!("Query task {} did not finish cleanly: {}", task_id, e);
            }
        });

        Ok(snapshot)
    }

    /// 启动并等待任务结束
    pub async fn run_to_completion(&self, task_id: i64) -> Result<QueryTask> {
        let (run, task) = self.start(task_id).await?;
        self.drive(run, task).await
    }

    /// 登记运行并在存储中认领任务，认领失败时撤销登记
    async fn start(&self, task_id: i64) -> Result<(Arc<TaskRun>, QueryTask)> {
        let run = self.prepare(task_id).await?;
        match self.coordinator.begin(&run).await {
            Ok(task) => Ok((run, task)),
            Err(e) => {
                self.running.remove_if(&task_id, |_, r| Arc::ptr_eq(r, &run));
                Err(e)
            }
        }
    }

    /// 加载任务并登记到运行表；设置错误会把任务标记为 `Rejected`
    async fn prepare(&self, task_id: i64) -> Result<Arc<TaskRun>> {
        if self.running.contains_key(&task_id) {
            return Err(already_running());
        }
        if let Some(finished) = self.settle(task_id).await {
            return Err(AppError::InvalidTransition {
                from: finished.status.to_string(),
                to: TaskStatus::Running.to_string(),
            });
        }

        let task = match self.store.load(task_id).await {
            Ok(task) => task,
            Err(AppError::CorruptTaskData { task_id, reason }) => {
                tracing::error!("Rejecting query task {}: {}", task_id, reason);
                if let Err(e) = self.store.mark_rejected(task_id, &reason).await {
                    tracing::warn!("Query task {} was not marked rejected: {}", task_id, e);
                }
                return Err(AppError::CorruptTaskData { task_id, reason });
            }
            Err(e) => return Err(e),
        };

        if task.status != TaskStatus::Pending {
            return Err(AppError::InvalidTransition {
                from: task.status.to_string(),
                to: TaskStatus::Running.to_string(),
            });
        }

        if task.databases.is_empty() || task.statements.is_empty() {
            let reason = "task has no target databases or no statements".to_string();
            tracing::error!("Rejecting query task {}: {}", task_id, reason);
            self.store.mark_rejected(task_id, &reason).await?;
            return Err(AppError::InvalidInput(reason));
        }

        match self.running.entry(task_id) {
            Entry::Occupied(_) => Err(already_running()),
            Entry::Vacant(slot) => {
                let run = Arc::new(TaskRun::new(task));
                slot.insert(Arc::clone(&run));
                Ok(run)
            }
        }
    }

    async fn drive(&self, run: Arc<TaskRun>, task: QueryTask) -> Result<QueryTask> {
        let task_id = run.task_id();
        let result = self.coordinator.dispatch(Arc::clone(&run), task).await;

        if let Err(e) = &result {
            let snapshot = run.snapshot();
            if snapshot.status.is_terminal() {
                tracing::error!(
                    "Query task {} finished as {} but its final state was not saved: {}",
                    task_id,
                    snapshot.status,
                    e
                );
                self.unsaved.insert(task_id, snapshot);
            }
        }
        self.running.remove_if(&task_id, |_, r| Arc::ptr_eq(r, &run));

        result
    }

    /// 重新写入未保存的终态；仍然失败时返回内存中的终态快照
    async fn settle(&self, task_id: i64) -> Option<QueryTask> {
        let finished = self.unsaved.get(&task_id).map(|t| t.value().clone())?;
        match self.store.save(&finished).await {
            Ok(()) => {
                self.unsaved.remove(&task_id);
                tracing::info!("Query task {}: final state saved", task_id);
                None
            }
            Err(e) => {
                tracing::warn!("Query task {}: final state still not saved: {}", task_id, e);
                Some(finished)
            }
        }
    }

    /// 当前状态：执行中读内存快照，否则读持久化记录
    pub async fn status(&self, task_id: i64) -> Result<QueryTask> {
        let live = self.running.get(&task_id).map(|r| Arc::clone(r.value()));
        if let Some(run) = live {
            return Ok(run.snapshot());
        }
        match self.settle(task_id).await {
            Some(finished) => Ok(finished),
            None => self.store.load(task_id).await,
        }
    }

    pub fn cancel(&self, task_id: i64) -> Result<QueryTask> {
        let run = self
            .running
            .get(&task_id)
            .map(|r| Arc::clone(r.value()))
            .ok_or_else(|| {
                AppError::NotFound(format!("Running task with id {} not found", task_id))
            })?;

        tracing::info!("Cancelling query task {}", task_id);
        run.cancel();
        Ok(run.snapshot())
    }

    /// 针对失败的目标和失败的语句创建新任务
    pub async fn retry_failed(self: &Arc<Self>, task_id: i64, defer: bool) -> Result<QueryTask> {
        if self.running.contains_key(&task_id) {
            return Err(already_running());
        }

        let task = match self.settle(task_id).await {
            Some(finished) => finished,
            None => self.store.load(task_id).await?,
        };
        if task.status != TaskStatus::Failed {
            return Err(AppError::InvalidInput(format!(
                "Task {} is {}, only failed tasks can be retried",
                task_id, task.status
            )));
        }

        let results = self.store.load_results(task_id).await?;
        let expected = task.counters.total_sqls as usize;
        if results.len() < expected {
            return Err(AppError::InvalidInput(format!(
                "Task {} has {} of {} statement results recorded, cannot determine what to retry",
                task_id,
                results.len(),
                expected
            )));
        }

        let (targets, positions) = failed_work(&results);
        if targets.is_empty() {
            return Err(AppError::InvalidInput(format!(
                "Task {} has no failed statements to retry",
                task_id
            )));
        }

        let req = CreateQueryTaskRequest {
            task_name: format!("Retry of {}", task.task_name)
                .chars()
                .take(MAX_TASK_NAME_CHARS)
                .collect(),
            description: format!("Retry of failed work from task #{}", task_id),
            is_favorite: false,
            targets: task
                .databases
                .iter()
                .enumerate()
                .filter(|(index, _)| targets.contains(&(*index as u32)))
                .map(|(_, target)| target.clone())
                .collect(),
            statements: task
                .statements
                .iter()
                .filter(|s| positions.contains(&s.position))
                .map(|s| s.sql.clone())
                .collect(),
            defer,
        };

        tracing::info!(
            "Retrying task {}: {} databases, {} statements",
            task_id,
            req.targets.len(),
            req.statements.len()
        );
        self.submit(req).await
    }

    pub async fn results(&self, task_id: i64) -> Result<Vec<StatementResult>> {
        self.store.load_results(task_id).await
    }

    pub async fn list(&self, query: &HistoryQuery) -> Result<Vec<TaskSummary>> {
        self.store.list(query).await
    }

    pub async fn set_favorite(&self, task_id: i64, is_favorite: bool) -> Result<()> {
        self.store.set_favorite(task_id, is_favorite).await
    }

    pub async fn delete(&self, task_id: i64) -> Result<()> {
        if self.running.contains_key(&task_id) {
            return Err(AppError::InvalidTransition {
                from: TaskStatus::Running.to_string(),
                to: "deleted".to_string(),
            });
        }
        self.settle(task_id).await;
        self.store.soft_delete(task_id).await?;
        self.unsaved.remove(&task_id);
        tracing::info!("Deleted query task {}", task_id);
        Ok(())
    }
}

fn already_running() -> AppError {
    AppError::InvalidTransition {
        from: TaskStatus::Running.to_string(),
        to: TaskStatus::Running.to_string(),
    }
}

fn validate_request(req: CreateQueryTaskRequest) -> Result<QueryTask> {
    let task_name = req.task_name.trim().to_string();
    if task_name.is_empty() {
        return Err(AppError::InvalidInput("Task name is required".to_string()));
    }
    if task_name.chars().count() > MAX_TASK_NAME_CHARS {
        return Err(AppError::InvalidInput(format!(
            "Task name must be at most {} characters",
            MAX_TASK_NAME_CHARS
        )));
    }
    if req.targets.is_empty() {
        return Err(AppError::InvalidInput(
            "At least one target database is required".to_string(),
        ));
    }
    if req.statements.is_empty() {
        return Err(AppError::InvalidInput(
            "At least one statement is required".to_string(),
        ));
    }

    let databases = TaskDatabases::new(req.targets)?;
    let statements = Statement::from_texts(req.statements)?;

    Ok(QueryTask::new_pending(
        task_name,
        req.description,
        req.is_favorite,
        databases,
        statements,
    ))
}

/// 失败的目标下标和失败的语句位置
fn failed_work(results: &[StatementResult]) -> (BTreeSet<u32>, BTreeSet<u32>) {
    results
        .iter()
        .filter(|r| !r.is_success())
        .fold((BTreeSet::new(), BTreeSet::new()), |(mut t, mut p), r| {
            t.insert(r.target_index);
            p.insert(r.position);
            (t, p)
        })
}
