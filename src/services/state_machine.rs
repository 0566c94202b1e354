//! 任务状态机
//!
//! `Pending → Running → {Completed, Failed}`，以及启动前设置错误的 `Pending → Rejected`。
//! 终态不可再变更，重新执行只能创建新任务。

use chrono::{DateTime, Utc};

use crate::models::{QueryTask, TaskCounters, TaskStatus};
use crate::utils::error::{AppError, Result};

/// 校验状态迁移是否合法
pub fn transition(from: TaskStatus, to: TaskStatus) -> Result<TaskStatus> {
    let allowed = matches!(
        (from, to),
        (TaskStatus::Pending, TaskStatus::Running)
            | (TaskStatus::Pending, TaskStatus::Rejected)
            | (TaskStatus::Running, TaskStatus::Completed)
            | (TaskStatus::Running, TaskStatus::Failed)
    );

    if allowed {
        Ok(to)
    } else {
        Err(AppError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

/// 所有目标结束后的终态判定。
///
/// 严格策略：任一数据库失败或任务被取消即为 `Failed`。是否允许按比例容忍部分失败
/// 尚待确认，目前只实现零容忍。
pub fn evaluate_terminal(counters: &TaskCounters, cancelled: bool) -> TaskStatus {
    if cancelled || counters.failed_dbs > 0 {
        TaskStatus::Failed
    } else {
        TaskStatus::Completed
    }
}

/// Pending → Running：设置开始时间和总数
pub fn start(task: &mut QueryTask, now: DateTime<Utc>) -> Result<()> {
    task.status = transition(task.status, TaskStatus::Running)?;
    task.counters = TaskCounters::with_totals(
        task.databases.len() as u32,
        task.statements.len() as u32,
    );
    task.started_at = Some(now);
    task.updated_at = now;
    Ok(())
}

/// Running → 终态：写入最终计数和完成时间
pub fn finish(
    task: &mut QueryTask,
    counters: TaskCounters,
    status: TaskStatus,
    error_message: Option<String>,
    now: DateTime<Utc>,
) -> Result<()> {
    if !status.is_terminal() {
        return Err(AppError::InvalidTransition {
            from: task.status.to_string(),
            to: status.to_string(),
        });
    }
    task.status = transition(task.status, status)?;
    task.counters = counters;
    task.completed_at = Some(now);
    task.updated_at = now;
    task.error_message = error_message;
    Ok(())
}

/// Pending → Rejected：任务无法启动
pub fn reject(task: &mut QueryTask, reason: String, now: DateTime<Utc>) -> Result<()> {
    task.status = transition(task.status, TaskStatus::Rejected)?;
    task.completed_at = Some(now);
    task.updated_at = now;
    task.error_message = Some(reason);
    Ok(())
}
