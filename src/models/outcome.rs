use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::TargetDescriptor;

/// 单条语句在单个目标上的失败原因
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum ExecError {
    /// 目标不可达或认证失败，该目标剩余语句全部记为失败
    #[error("connection error: {0}")]
    Connection(String),

    /// 语句执行失败，目标继续执行后续语句
    #[error("execution error: {0}")]
    Execution(String),

    /// 任务被取消，语句未执行
    #[error("cancelled")]
    Cancelled,
}

/// 每个 (目标, 语句) 恰好产生一次
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Success { rows_affected: u64, duration_ms: u64 },
    Failed { error: ExecError },
}

impl ExecutionOutcome {
    pub fn failed(error: ExecError) -> Self {
        ExecutionOutcome::Failed { error }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionOutcome::Success { .. })
    }

    /// 持久化用的结果类型
    pub fn kind(&self) -> OutcomeKind {
        match self {
            ExecutionOutcome::Success { .. } => OutcomeKind::Success,
            ExecutionOutcome::Failed { error } => match error {
                ExecError::Connection(_) => OutcomeKind::ConnectionError,
                ExecError::Execution(_) => OutcomeKind::ExecutionError,
                ExecError::Cancelled => OutcomeKind::Cancelled,
            },
        }
    }
}

/// 执行结果类型（存储于 query_task_results.outcome）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Success,
    ConnectionError,
    ExecutionError,
    Cancelled,
}

impl OutcomeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeKind::Success => "success",
            OutcomeKind::ConnectionError => "connection_error",
            OutcomeKind::ExecutionError => "execution_error",
            OutcomeKind::Cancelled => "cancelled",
        }
    }
}

impl TryFrom<String> for OutcomeKind {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.as_str() {
            "success" => Ok(OutcomeKind::Success),
            "connection_error" => Ok(OutcomeKind::ConnectionError),
            "execution_error" => Ok(OutcomeKind::ExecutionError),
            "cancelled" => Ok(OutcomeKind::Cancelled),
            _ => Err(format!("Unknown outcome kind: {}", s)),
        }
    }
}

/// 一条语句在一个目标上的执行记录
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatementResult {
    /// 目标在任务目标列表中的下标
    pub target_index: u32,
    pub target: TargetDescriptor,
    pub position: u32,
    pub outcome: ExecutionOutcome,
    pub executed_at: DateTime<Utc>,
}

impl StatementResult {
    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }
}
