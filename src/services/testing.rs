//! 测试用的脚本化连接工厂和可注入故障的任务存储

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use crate::db::{MemoryTaskStore, TaskStore};
use crate::models::{HistoryQuery, QueryTask, StatementResult, TargetDescriptor, TaskSummary};
use crate::services::connection_service::{ConnectionFactory, TargetConnection};
use crate::utils::error::{AppError, Result};

#[derive(Debug, Default)]
struct Journal {
    executed: Vec<(i64, String)>,
    connects: usize,
    closed: usize,
    active: usize,
    max_active: usize,
}

/// 在指定实例的第一条语句处暂停，直到测试放行
#[derive(Clone)]
pub struct Gate {
    instance_id: i64,
    pub entered: Arc<Notify>,
    pub release: Arc<Notify>,
}

#[derive(Default)]
pub struct ScriptedFactory {
    unreachable: HashSet<i64>,
    failing: Arc<HashSet<(Option<i64>, String)>>,
    delay: Option<Duration>,
    gate: Mutex<Option<Gate>>,
    journal: Arc<Mutex<Journal>>,
}

impl ScriptedFactory {
    /// 该实例无法连接
    pub fn unreachable(mut self, instance_id: i64) -> Self {
        self.unreachable.insert(instance_id);
        self
    }

    /// 在任意实例上执行该 SQL 时返回错误
    pub fn failing_sql(mut self, sql: &str) -> Self {
        Arc::make_mut(&mut self.failing).insert((None, sql.to_string()));
        self
    }

    /// 只在指定实例上执行该 SQL 时返回错误
    pub fn failing_on(mut self, instance_id: i64, sql: &str) -> Self {
        Arc::make_mut(&mut self.failing).insert((Some(instance_id), sql.to_string()));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn gated(self, instance_id: i64) -> (Self, Gate) {
        let gate = Gate {
            instance_id,
            entered: Arc::new(Notify::new()),
            release: Arc::new(Notify::new()),
        };
        *self.gate.lock() = Some(gate.clone());
        (self, gate)
    }

    pub fn executed(&self) -> Vec<(i64, String)> {
        self.journal.lock().executed.clone()
    }

    pub fn connects(&self) -> usize {
        self.journal.lock().connects
    }

    pub fn closed(&self) -> usize {
        self.journal.lock().closed
    }

    pub fn max_active(&self) -> usize {
        self.journal.lock().max_active
    }
}

#[async_trait]
impl ConnectionFactory for ScriptedFactory {
    async fn connect(
        &self,
        target: &TargetDescriptor,
    ) -> std::result::Result<Box<dyn TargetConnection>, String> {
        if self.unreachable.contains(&target.instance_id) {
            return Err(format!("instance {} refused connection", target.instance_id));
        }

        let gate = {
            let mut slot = self.gate.lock();
            match slot.as_ref() {
                Some(g) if g.instance_id == target.instance_id => slot.take(),
                _ => None,
            }
        };

        {
            let mut journal = self.journal.lock();
            journal.connects += 1;
            journal.active += 1;
            journal.max_active = journal.max_active.max(journal.active);
        }

        Ok(Box::new(ScriptedConnection {
            instance_id: target.instance_id,
            failing: Arc::clone(&self.failing),
            delay: self.delay,
            gate,
            journal: Arc::clone(&self.journal),
            released: false,
        }))
    }
}

struct ScriptedConnection {
    instance_id: i64,
    failing: Arc<HashSet<(Option<i64>, String)>>,
    delay: Option<Duration>,
    gate: Option<Gate>,
    journal: Arc<Mutex<Journal>>,
    released: bool,
}

impl ScriptedConnection {
    fn release(&mut self) {
        if !self.released {
            self.released = true;
            let mut journal = self.journal.lock();
            journal.closed += 1;
            journal.active -= 1;
        }
    }
}

#[async_trait]
impl TargetConnection for ScriptedConnection {
    async fn execute(&mut self, sql: &str) -> std::result::Result<u64, String> {
        if let Some(gate) = self.gate.take() {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        self.journal
            .lock()
            .executed
            .push((self.instance_id, sql.to_string()));

        let sql = sql.to_string();
        if self.failing.contains(&(None, sql.clone()))
            || self.failing.contains(&(Some(self.instance_id), sql.clone()))
        {
            Err(format!("You have an error in your SQL syntax near '{}'", sql))
        } else {
            Ok(1)
        }
    }

    async fn close(mut self: Box<Self>) {
        self.release();
    }
}

impl Drop for ScriptedConnection {
    fn drop(&mut self) {
        self.release();
    }
}

/// 包装 `MemoryTaskStore`，按脚本延迟读取或让写入失败
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryTaskStore,
    load_delays: Mutex<VecDeque<Duration>>,
    terminal_save_failures: Mutex<usize>,
    lost_targets: HashSet<u32>,
}

impl FlakyStore {
    /// 依次作用于之后的 `load`：先读取，再等待后返回
    pub fn with_load_delays<I: IntoIterator<Item = Duration>>(self, delays: I) -> Self {
        self.load_delays.lock().extend(delays);
        self
    }

    /// 前 `n` 次写入终态的 `save` 失败
    pub fn failing_terminal_saves(self, n: usize) -> Self {
        *self.terminal_save_failures.lock() = n;
        self
    }

    /// 该目标下标的结果写入失败
    pub fn losing_results_of(mut self, target_index: u32) -> Self {
        self.lost_targets.insert(target_index);
        self
    }

    pub fn inner(&self) -> &MemoryTaskStore {
        &self.inner
    }
}

fn store_down() -> AppError {
    AppError::Connection("store down".to_string())
}

#[async_trait]
impl TaskStore for FlakyStore {
    async fn create(&self, task: &QueryTask) -> Result<i64> {
        self.inner.create(task).await
    }

    async fn start(&self, task: &QueryTask) -> Result<()> {
        self.inner.start(task).await
    }

    async fn save(&self, task: &QueryTask) -> Result<()> {
        if task.status.is_terminal() {
            let mut failures = self.terminal_save_failures.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(store_down());
            }
        }
        self.inner.save(task).await
    }

    async fn load(&self, task_id: i64) -> Result<QueryTask> {
        let loaded = self.inner.load(task_id).await;
        let delay = self.load_delays.lock().pop_front();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        loaded
    }

    async fn mark_rejected(&self, task_id: i64, reason: &str) -> Result<()> {
        self.inner.mark_rejected(task_id, reason).await
    }

    async fn append_results(&self, task_id: i64, results: &[StatementResult]) -> Result<()> {
        if results
            .iter()
            .any(|r| self.lost_targets.contains(&r.target_index))
        {
            return Err(store_down());
        }
        self.inner.append_results(task_id, results).await
    }

    async fn load_results(&self, task_id: i64) -> Result<Vec<StatementResult>> {
        self.inner.load_results(task_id).await
    }

    async fn list(&self, query: &HistoryQuery) -> Result<Vec<TaskSummary>> {
        self.inner.list(query).await
    }

    async fn set_favorite(&self, task_id: i64, is_favorite: bool) -> Result<()> {
        self.inner.set_favorite(task_id, is_favorite).await
    }

    async fn soft_delete(&self, task_id: i64) -> Result<()> {
        self.inner.soft_delete(task_id).await
    }
}
