use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::db::TaskStore;
use crate::models::{ExecError, QueryTask, Statement, TaskStatus};
use crate::services::connection_service::ConnectionFactory;
use crate::services::executor::DatabaseExecutor;
use crate::services::progress::ProgressAggregator;
use crate::services::state_machine;
use crate::utils::error::{AppError, Result};

const TERMINAL_SAVE_ATTEMPTS: u32 = 3;

/// 一次任务执行的共享状态
///
/// 任务记录只由协调器写入；状态查询通过 `snapshot` 读取。
pub struct TaskRun {
    task_id: i64,
    record: Mutex<QueryTask>,
    progress: ProgressAggregator,
    cancel: CancellationToken,
}

impl TaskRun {
    pub fn new(task: QueryTask) -> Self {
        let progress = ProgressAggregator::new(task.databases.len(), task.statements.len());
        Self {
            task_id: task.id,
            record: Mutex::new(task),
            progress,
            cancel: CancellationToken::new(),
        }
    }

    pub fn task_id(&self) -> i64 {
        self.task_id
    }

    /// 请求取消：未启动的目标被跳过，已启动的目标自然结束
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// 当前任务快照，计数器取自聚合器
    pub fn snapshot(&self) -> QueryTask {
        let mut task = self.record.lock().clone();
        if task.status == TaskStatus::Running {
            task.counters = self.progress.snapshot();
        }
        task
    }
}

/// 执行协调器
///
/// 为每个目标数据库派发一个 `DatabaseExecutor`，并发数受 `max_parallel_targets`
/// 限制；所有执行器结束后计算终态并写回任务记录。
pub struct ExecutionCoordinator {
    store: Arc<dyn TaskStore>,
    factory: Arc<dyn ConnectionFactory>,
    config: EngineConfig,
}

impl ExecutionCoordinator {
    pub fn new(
        store: Arc<dyn TaskStore>,
        factory: Arc<dyn ConnectionFactory>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            factory,
            config,
        }
    }

    /// 启动并等待任务结束
    pub async fn run(&self, run: Arc<TaskRun>) -> Result<QueryTask> {
        let task = self.begin(&run).await?;
        self.dispatch(run, task).await
    }

    /// 校验任务并在存储中完成 Pending → Running 的条件迁移。
    ///
    /// 存储拒绝迁移时内存记录保持不变。
    pub async fn begin(&self, run: &TaskRun) -> Result<QueryTask> {
        let mut task = run.record.lock().clone();
        if task.databases.is_empty() {
            return Err(AppError::InvalidInput(format!(
                "Task {} has no target databases",
                task.id
            )));
        }
        if task.statements.is_empty() {
            return Err(AppError::InvalidInput(format!(
                "Task {} has no statements",
                task.id
            )));
        }

        state_machine::start(&mut task, Utc::now())?;
        self.store.start(&task).await?;
        *run.record.lock() = task.clone();

        Ok(task)
    }

    /// 派发所有目标并等待结束，写回终态
    pub async fn dispatch(&self, run: Arc<TaskRun>, task: QueryTask) -> Result<QueryTask> {
        tracing::info!(
            "Task {} running: {} databases x {} statements, max {} in parallel",
            task.id,
            task.counters.total_dbs,
            task.statements.len(),
            self.config.max_parallel_targets
        );

        let statements: Arc<[Statement]> = task.statements.clone().into();
        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel_targets));
        let stop_on_cancel = self.config.stop_running_targets_on_cancel;
        let mut workers = JoinSet::new();

        for (index, target) in task.databases.iter().enumerate() {
            let executor = DatabaseExecutor::new(
                index,
                target.clone(),
                Arc::clone(&statements),
                Arc::clone(&self.factory),
                self.config.connect_timeout(),
            );
            let run = Arc::clone(&run);
            let semaphore = Arc::clone(&semaphore);

            workers.spawn(async move {
                let permit = tokio::select! {
                    biased;
                    _ = run.cancel.cancelled() => None,
                    permit = semaphore.acquire_owned() => permit.ok(),
                };

                let results = match permit {
                    Some(_permit) if !run.cancel.is_cancelled() => {
                        executor.run(&run.progress, &run.cancel, stop_on_cancel).await
                    }
                    _ => {
                        tracing::info!(
                            "Task {} cancelled, skipping target {}",
                            run.task_id,
                            executor.target()
                        );
                        executor.skip(ExecError::Cancelled, &run.progress)
                    }
                };

                (index, results)
            });
        }

        let mut fatal: Option<String> = None;
        let mut unsaved_targets = 0usize;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((index, Ok(results))) => {
                    if let Err(e) = self.store.append_results(task.id, &results).await {
                        tracing::error!(
                            "Task {}: failed to persist results of target #{}: {}",
                            task.id,
                            index,
                            e
                        );
                        unsaved_targets += 1;
                    }
                    self.flush_progress(&run).await;
                }
                Ok((index, Err(e))) => {
                    tracing::error!("Task {}: target #{} aborted: {}", task.id, index, e);
                    fatal.get_or_insert_with(|| e.to_string());
                }
                Err(e) => {
                    tracing::error!("Task {}: executor panicked: {}", task.id, e);
                    fatal.get_or_insert_with(|| format!("executor panicked: {}", e));
                }
            }
        }

        if fatal.is_none() && !run.progress.is_complete() {
            tracing::error!("Task {}: some statements produced no outcome", task.id);
            fatal = Some("some statements produced no outcome".to_string());
        }

        let counters = run.progress.snapshot();
        let cancelled = run.is_cancelled();
        let status = if fatal.is_some() {
            TaskStatus::Failed
        } else {
            state_machine::evaluate_terminal(&counters, cancelled)
        };

        let mut notes: Vec<String> = fatal.into_iter().collect();
        if cancelled {
            notes.push("cancelled by user".to_string());
        }
        if unsaved_targets > 0 {
            notes.push(format!(
                "results of {} target(s) could not be persisted",
                unsaved_targets
            ));
        }
        let error_message = (!notes.is_empty()).then(|| notes.join("; "));

        let finished = {
            let mut record = run.record.lock();
            state_machine::finish(&mut record, counters, status, error_message, Utc::now())?;
            record.clone()
        };

        self.save_terminal(&finished).await?;

        tracing::info!(
            "Task {} {}: dbs {}/{} ok, {} failed; sqls {}/{} ok, {} failed",
            finished.id,
            finished.status,
            counters.completed_dbs,
            counters.total_dbs,
            counters.failed_dbs,
            counters.completed_sqls,
            counters.total_sqls,
            counters.failed_sqls
        );

        Ok(finished)
    }

    /// 终态写入失败时按递增间隔重试
    async fn save_terminal(&self, task: &QueryTask) -> Result<()> {
        let mut attempt = 1;
        loop {
            match self.store.save(task).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < TERMINAL_SAVE_ATTEMPTS => {
                    tracing::warn!(
                        "Task {}: saving final state failed (attempt {}): {}",
                        task.id,
                        attempt,
                        e
                    );
                    tokio::time::sleep(Duration::from_millis(100 * attempt as u64)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// 目标完成时写回进度，失败只记录日志
    async fn flush_progress(&self, run: &TaskRun) {
        let snapshot = run.snapshot();
        if let Err(e) = self.store.save(&snapshot).await {
            tracing::warn!("Task {}: failed to save progress: {}", snapshot.id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryTaskStore;
    use crate::models::{ExecutionOutcome, TargetDescriptor, TaskCounters, TaskDatabases};
    use crate::services::testing::{FlakyStore, ScriptedFactory};

    fn targets(ids: &[i64]) -> TaskDatabases {
        TaskDatabases::new(
            ids.iter()
                .map(|&id| TargetDescriptor {
                    instance_id: id,
                    database_name: "app".into(),
                    instance_name: format!("db-{}", id),
                })
                .collect(),
        )
        .unwrap()
    }

    async fn create_run(
        store: &Arc<MemoryTaskStore>,
        ids: &[i64],
        sqls: &[&str],
    ) -> Arc<TaskRun> {
        let mut task = QueryTask::new_pending(
            "batch fix".into(),
            String::new(),
            false,
            targets(ids),
            Statement::from_texts(sqls.iter().copied()).unwrap(),
        );
        task.id = store.create(&task).await.unwrap();
        Arc::new(TaskRun::new(task))
    }

    fn coordinator(
        store: &Arc<MemoryTaskStore>,
        factory: &Arc<ScriptedFactory>,
        max_parallel_targets: usize,
    ) -> ExecutionCoordinator {
        ExecutionCoordinator::new(
            store.clone(),
            factory.clone(),
            EngineConfig {
                max_parallel_targets,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_all_targets_succeed() {
        let store = Arc::new(MemoryTaskStore::new());
        let factory = Arc::new(ScriptedFactory::default());
        let sqls = ["SELECT 1", "SELECT 2", "SELECT 3", "SELECT 4"];
        let run = create_run(&store, &[1, 2, 3], &sqls).await;

        let task = coordinator(&store, &factory, 2).run(run).await.unwrap();

        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(
            task.counters,
            TaskCounters {
                total_dbs: 3,
                completed_dbs: 3,
                failed_dbs: 0,
                total_sqls: 12,
                completed_sqls: 12,
                failed_sqls: 0,
            }
        );
        assert!(task.started_at.is_some());
        assert!(task.completed_at.is_some());
        assert!(task.error_message.is_none());

        let persisted = store.load(task.id).await.unwrap();
        assert_eq!(persisted.status, TaskStatus::Completed);
        assert_eq!(persisted.counters, task.counters);
        assert_eq!(store.load_results(task.id).await.unwrap().len(), 12);
    }

    #[tokio::test]
    async fn test_unreachable_target_fails_without_executing() {
        let store = Arc::new(MemoryTaskStore::new());
        let factory = Arc::new(ScriptedFactory::default().unreachable(2));
        let run = create_run(&store, &[1, 2, 3], &["SELECT 1", "SELECT 2"]).await;

        let task = coordinator(&store, &factory, 3).run(run).await.unwrap();

        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.counters.failed_dbs, 1);
        assert_eq!(task.counters.completed_dbs, 2);
        assert_eq!(task.counters.failed_sqls, 2);
        assert_eq!(task.counters.completed_sqls, 4);
        assert!(factory.executed().iter().all(|(id, _)| *id != 2));

        let results = store.load_results(task.id).await.unwrap();
        let target_two: Vec<_> = results.iter().filter(|r| r.target.instance_id == 2).collect();
        assert_eq!(target_two.len(), 2);
        assert!(target_two.iter().all(|r| matches!(
            r.outcome,
            ExecutionOutcome::Failed {
                error: ExecError::Connection(_)
            }
        )));
    }

    #[tokio::test]
    async fn test_single_statement_failure_fails_task_but_target_continues() {
        let store = Arc::new(MemoryTaskStore::new());
        let factory = Arc::new(ScriptedFactory::default().failing_on(2, "UPDATE t SET a = 1"));
        let run = create_run(
            &store,
            &[1, 2],
            &["SELECT 1", "UPDATE t SET a = 1", "SELECT 3"],
        )
        .await;

        let task = coordinator(&store, &factory, 2).run(run).await.unwrap();

        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.counters.failed_dbs, 1);
        assert_eq!(task.counters.completed_dbs, 1);
        assert_eq!(task.counters.failed_sqls, 1);
        assert_eq!(task.counters.completed_sqls, 5);

        let on_two: Vec<String> = factory
            .executed()
            .into_iter()
            .filter(|(id, _)| *id == 2)
            .map(|(_, sql)| sql)
            .collect();
        assert_eq!(on_two, vec!["SELECT 1", "UPDATE t SET a = 1", "SELECT 3"]);
    }

    #[tokio::test]
    async fn test_parallelism_does_not_change_counters() {
        let sqls = ["SELECT 1", "BAD", "SELECT 3"];
        let ids = [1, 2, 3, 4, 5, 6];
        let mut finals = Vec::new();

        for parallel in [1, 6] {
            let store = Arc::new(MemoryTaskStore::new());
            let factory = Arc::new(
                ScriptedFactory::default()
                    .unreachable(4)
                    .failing_on(2, "BAD")
                    .failing_on(5, "BAD")
                    .with_delay(Duration::from_millis(2)),
            );
            let run = create_run(&store, &ids, &sqls).await;
            let task = coordinator(&store, &factory, parallel).run(run).await.unwrap();
            assert!(factory.max_active() <= parallel);
            finals.push((task.status, task.counters));
        }

        assert_eq!(finals[0], finals[1]);
        assert_eq!(finals[0].1.failed_dbs, 3);
        assert_eq!(finals[0].1.failed_sqls, 5);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let store = Arc::new(MemoryTaskStore::new());
        let factory = Arc::new(ScriptedFactory::default().with_delay(Duration::from_millis(5)));
        let ids = [1, 2, 3, 4, 5, 6, 7, 8];
        let run = create_run(&store, &ids, &["SELECT 1", "SELECT 2"]).await;

        let task = coordinator(&store, &factory, 3).run(run).await.unwrap();

        assert_eq!(task.status, TaskStatus::Completed);
        assert!(factory.max_active() <= 3);
        assert_eq!(factory.connects(), 8);
        assert_eq!(factory.closed(), 8);
    }

    #[tokio::test]
    async fn test_cancel_skips_unstarted_targets() {
        let store = Arc::new(MemoryTaskStore::new());
        let (factory, gate) = ScriptedFactory::default().gated(1);
        let factory = Arc::new(factory);
        let run = create_run(&store, &[1, 2, 3], &["SELECT 1", "SELECT 2"]).await;

        let coordinator = coordinator(&store, &factory, 1);
        let handle = {
            let run = Arc::clone(&run);
            tokio::spawn(async move { coordinator.run(run).await })
        };

        gate.entered.notified().await;
        let live = run.snapshot();
        assert_eq!(live.status, TaskStatus::Running);
        assert_eq!(live.counters.total_sqls, 6);

        run.cancel();
        gate.release.notify_one();

        let task = handle.await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.counters.completed_dbs, 1);
        assert_eq!(task.counters.completed_sqls, 2);
        assert_eq!(task.counters.failed_dbs, 2);
        assert_eq!(task.counters.failed_sqls, 4);
        assert!(task.counters.is_consistent());
        assert_eq!(task.error_message.as_deref(), Some("cancelled by user"));
        assert_eq!(factory.connects(), 1);

        let cancelled = store
            .load_results(task.id)
            .await
            .unwrap()
            .into_iter()
            .filter(|r| {
                matches!(
                    r.outcome,
                    ExecutionOutcome::Failed {
                        error: ExecError::Cancelled
                    }
                )
            })
            .count();
        assert_eq!(cancelled, 4);
    }

    #[tokio::test]
    async fn test_task_without_targets_is_not_dispatched() {
        let store = Arc::new(MemoryTaskStore::new());
        let factory = Arc::new(ScriptedFactory::default());
        let mut task = QueryTask::new_pending(
            "empty".into(),
            String::new(),
            false,
            TaskDatabases::default(),
            Statement::from_texts(["SELECT 1"]).unwrap(),
        );
        task.id = store.create(&task).await.unwrap();

        let err = coordinator(&store, &factory, 1)
            .run(Arc::new(TaskRun::new(task.clone())))
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::InvalidInput(_)));
        assert_eq!(store.load(task.id).await.unwrap().status, TaskStatus::Pending);
        assert_eq!(factory.connects(), 0);
    }

    #[tokio::test]
    async fn test_finished_run_cannot_restart() {
        let store = Arc::new(MemoryTaskStore::new());
        let factory = Arc::new(ScriptedFactory::default());
        let run = create_run(&store, &[1], &["SELECT 1"]).await;
        let coordinator = coordinator(&store, &factory, 1);

        coordinator.run(Arc::clone(&run)).await.unwrap();
        let err = coordinator.run(run).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_stop_on_cancel_cancels_remaining_statements_of_running_target() {
        let store = Arc::new(MemoryTaskStore::new());
        let (factory, gate) = ScriptedFactory::default().gated(1);
        let factory = Arc::new(factory);
        let run = create_run(&store, &[1], &["UPDATE a", "UPDATE b", "UPDATE c"]).await;

        let coordinator = ExecutionCoordinator::new(
            store.clone(),
            factory.clone(),
            EngineConfig {
                max_parallel_targets: 1,
                stop_running_targets_on_cancel: true,
                ..Default::default()
            },
        );
        let handle = {
            let run = Arc::clone(&run);
            tokio::spawn(async move { coordinator.run(run).await })
        };

        gate.entered.notified().await;
        run.cancel();
        gate.release.notify_one();

        let task = handle.await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.counters.completed_sqls, 1);
        assert_eq!(task.counters.failed_sqls, 2);
        assert_eq!(task.counters.completed_dbs, 0);
        assert_eq!(task.counters.failed_dbs, 1);
        assert!(task.counters.is_consistent());
        assert_eq!(factory.executed(), vec![(1, "UPDATE a".to_string())]);
        assert_eq!(factory.closed(), 1);

        let results = store.load_results(task.id).await.unwrap();
        assert_eq!(results.len(), 3);
        assert!(results[0].is_success());
        assert!(results[1..].iter().all(|r| matches!(
            r.outcome,
            ExecutionOutcome::Failed {
                error: ExecError::Cancelled
            }
        )));
    }

    #[tokio::test]
    async fn test_lost_results_are_reported_on_the_task() {
        let store = Arc::new(FlakyStore::default().losing_results_of(1));
        let factory = Arc::new(ScriptedFactory::default());
        let mut task = QueryTask::new_pending(
            "lost".into(),
            String::new(),
            false,
            targets(&[1, 2]),
            Statement::from_texts(["SELECT 1"]).unwrap(),
        );
        task.id = store.create(&task).await.unwrap();

        let coordinator =
            ExecutionCoordinator::new(store.clone(), factory, EngineConfig::default());
        let finished = coordinator.run(Arc::new(TaskRun::new(task))).await.unwrap();

        assert_eq!(finished.status, TaskStatus::Completed);
        assert_eq!(
            finished.error_message.as_deref(),
            Some("results of 1 target(s) could not be persisted")
        );
        assert_eq!(store.load_results(finished.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_final_save_is_retried() {
        let store = Arc::new(FlakyStore::default().failing_terminal_saves(2));
        let factory = Arc::new(ScriptedFactory::default());
        let mut task = QueryTask::new_pending(
            "retry save".into(),
            String::new(),
            false,
            targets(&[1]),
            Statement::from_texts(["SELECT 1"]).unwrap(),
        );
        task.id = store.create(&task).await.unwrap();

        let coordinator =
            ExecutionCoordinator::new(store.clone(), factory, EngineConfig::default());
        let finished = coordinator.run(Arc::new(TaskRun::new(task))).await.unwrap();

        let persisted = store.load(finished.id).await.unwrap();
        assert_eq!(persisted.status, TaskStatus::Completed);
        assert!(persisted.completed_at.is_some());
    }
}
