use parking_lot::Mutex;

use crate::models::{ExecutionOutcome, TaskCounters};
use crate::utils::error::{AppError, Result};

/// 记录一条结果后目标的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetVerdict {
    /// 该目标还有语句未记录
    InProgress,
    /// 最后一条语句已记录，且全部成功
    Completed,
    /// 最后一条语句已记录，至少一条失败
    Failed,
}

#[derive(Debug)]
struct TargetProgress {
    recorded: Vec<bool>,
    remaining: usize,
    failed: bool,
}

#[derive(Debug)]
struct ProgressState {
    counters: TaskCounters,
    targets: Vec<TargetProgress>,
}

/// 进度聚合器
///
/// 一个任务的所有执行器共享同一个实例。所有计数更新都在同一把锁内完成，
/// 读取方拿到的快照不会出现部分更新。
#[derive(Debug)]
pub struct ProgressAggregator {
    state: Mutex<ProgressState>,
}

impl ProgressAggregator {
    pub fn new(target_count: usize, statements_per_target: usize) -> Self {
        let targets = (0..target_count)
            .map(|_| TargetProgress {
                recorded: vec![false; statements_per_target],
                remaining: statements_per_target,
                failed: false,
            })
            .collect();

        Self {
            state: Mutex::new(ProgressState {
                counters: TaskCounters::with_totals(
                    target_count as u32,
                    statements_per_target as u32,
                ),
                targets,
            }),
        }
    }

    /// 记录一条执行结果。
    ///
    /// 每个 (目标, 语句) 只能记录一次，重复或越界会返回 `ProgressInvariant`，
    /// 计数器保持不变。
    pub fn record(
        &self,
        target_index: usize,
        position: usize,
        outcome: &ExecutionOutcome,
    ) -> Result<TargetVerdict> {
        let mut state = self.state.lock();

        let target = state.targets.get_mut(target_index).ok_or_else(|| {
            AppError::ProgressInvariant(format!("unknown target index {}", target_index))
        })?;

        match target.recorded.get_mut(position) {
            None => {
                return Err(AppError::ProgressInvariant(format!(
                    "statement position {} out of range for target {}",
                    position, target_index
                )));
            }
            Some(seen) if *seen => {
                return Err(AppError::ProgressInvariant(format!(
                    "outcome for target {} statement {} recorded twice",
                    target_index, position
                )));
            }
            Some(seen) => *seen = true,
        }

        target.remaining -= 1;
        let success = outcome.is_success();
        if !success {
            target.failed = true;
        }

        let verdict = match (target.remaining, target.failed) {
            (0, false) => TargetVerdict::Completed,
            (0, true) => TargetVerdict::Failed,
            _ => TargetVerdict::InProgress,
        };

        let counters = &mut state.counters;
        if success {
            counters.completed_sqls += 1;
        } else {
            counters.failed_sqls += 1;
        }
        match verdict {
            TargetVerdict::Completed => counters.completed_dbs += 1,
            TargetVerdict::Failed => counters.failed_dbs += 1,
            TargetVerdict::InProgress => {}
        }

        debug_assert!(counters.is_consistent());

        Ok(verdict)
    }

    /// 一致的计数快照
    pub fn snapshot(&self) -> TaskCounters {
        self.state.lock().counters
    }

    /// 是否所有 (目标, 语句) 都已记录
    pub fn is_complete(&self) -> bool {
        let counters = self.snapshot();
        counters.finished_dbs() == counters.total_dbs
            && counters.finished_sqls() == counters.total_sqls
    }
}
