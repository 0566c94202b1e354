use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::models::{ExecError, ExecutionOutcome, Statement, StatementResult, TargetDescriptor};
use crate::services::connection_service::ConnectionFactory;
use crate::services::progress::ProgressAggregator;
use crate::utils::error::Result;

/// 单个目标数据库的执行器
///
/// 持有该目标的一个连接，按顺序执行全部语句，每条语句恰好产生一个结果并
/// 在继续下一条之前同步写入进度聚合器。执行层面的错误都转换为结果，
/// 只有聚合器的不变量被破坏时才返回 `Err`。
pub struct DatabaseExecutor {
    target_index: usize,
    target: TargetDescriptor,
    statements: Arc<[Statement]>,
    factory: Arc<dyn ConnectionFactory>,
    connect_timeout: Duration,
}

impl DatabaseExecutor {
    pub fn new(
        target_index: usize,
        target: TargetDescriptor,
        statements: Arc<[Statement]>,
        factory: Arc<dyn ConnectionFactory>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            target_index,
            target,
            statements,
            factory,
            connect_timeout,
        }
    }

    pub fn target(&self) -> &TargetDescriptor {
        &self.target
    }

    /// 连接目标并顺序执行所有语句。
    ///
    /// `stop_on_cancel` 为 true 时，在语句之间检查取消信号，剩余语句记为
    /// `Cancelled`；正在执行的语句总是自然结束。
    pub async fn run(
        &self,
        progress: &ProgressAggregator,
        cancel: &CancellationToken,
        stop_on_cancel: bool,
    ) -> Result<Vec<StatementResult>> {
        let mut results = Vec::with_capacity(self.statements.len());

        let connected =
            tokio::time::timeout(self.connect_timeout, self.factory.connect(&self.target)).await;
        let mut conn = match connected {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                tracing::warn!("Cannot connect to target {}: {}", self.target, e);
                self.fail_remaining(0, ExecError::Connection(e), progress, &mut results)?;
                return Ok(results);
            }
            Err(_) => {
                let e = format!("connection timed out after {:?}", self.connect_timeout);
                tracing::warn!("Cannot connect to target {}: {}", self.target, e);
                self.fail_remaining(0, ExecError::Connection(e), progress, &mut results)?;
                return Ok(results);
            }
        };

        tracing::debug!(
            "Connected to target {}, executing {} statements",
            self.target,
            self.statements.len()
        );

        for (index, statement) in self.statements.iter().enumerate() {
            if stop_on_cancel && cancel.is_cancelled() {
                tracing::info!(
                    "Target {} cancelled before statement #{}",
                    self.target,
                    statement.position
                );
                // `?` 提前返回时 conn 随 drop 释放
                self.fail_remaining(index, ExecError::Cancelled, progress, &mut results)?;
                conn.close().await;
                return Ok(results);
            }

            let started = Instant::now();
            let outcome = match conn.execute(&statement.sql).await {
                Ok(rows_affected) => ExecutionOutcome::Success {
                    rows_affected,
                    duration_ms: started.elapsed().as_millis() as u64,
                },
                Err(e) => {
                    tracing::warn!(
                        "Statement #{} failed on {}: {}",
                        statement.position,
                        self.target,
                        e
                    );
                    ExecutionOutcome::failed(ExecError::Execution(e))
                }
            };

            self.record(statement, outcome, progress, &mut results)?;
        }

        conn.close().await;

        Ok(results)
    }

    /// 不连接目标，将全部语句记为失败（用于取消后未启动的目标）
    pub fn skip(
        &self,
        error: ExecError,
        progress: &ProgressAggregator,
    ) -> Result<Vec<StatementResult>> {
        let mut results = Vec::with_capacity(self.statements.len());
        self.fail_remaining(0, error, progress, &mut results)?;
        Ok(results)
    }

    fn fail_remaining(
        &self,
        from: usize,
        error: ExecError,
        progress: &ProgressAggregator,
        results: &mut Vec<StatementResult>,
    ) -> Result<()> {
        for statement in &self.statements[from..] {
            self.record(
                statement,
                ExecutionOutcome::failed(error.clone()),
                progress,
                results,
            )?;
        }
        Ok(())
    }

    fn record(
        &self,
        statement: &Statement,
        outcome: ExecutionOutcome,
        progress: &ProgressAggregator,
        results: &mut Vec<StatementResult>,
    ) -> Result<()> {
        progress.record(self.target_index, statement.position as usize, &outcome)?;
        results.push(StatementResult {
            target_index: self.target_index as u32,
            target: self.target.clone(),
            position: statement.position,
            outcome,
            executed_at: Utc::now(),
        });
        Ok(())
    }
}
