use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Statement, TargetDescriptor, TaskDatabases};

/// 任务状态：0-待执行，1-执行中，2-已完成，3-失败，4-已拒绝
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "running")]
    Running,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "failed")]
    Failed,
    /// 启动前的设置错误（如目标列表损坏），任务从未派发
    #[serde(rename = "rejected")]
    Rejected,
}

// 数据库中以 TINYINT 存储
impl TryFrom<i8> for TaskStatus {
    type Error = String;

    fn try_from(value: i8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(TaskStatus::Pending),
            1 => Ok(TaskStatus::Running),
            2 => Ok(TaskStatus::Completed),
            3 => Ok(TaskStatus::Failed),
            4 => Ok(TaskStatus::Rejected),
            _ => Err(format!("Unknown task status: {}", value)),
        }
    }
}

impl TaskStatus {
    pub fn as_i8(&self) -> i8 {
        match self {
            TaskStatus::Pending => 0,
            TaskStatus::Running => 1,
            TaskStatus::Completed => 2,
            TaskStatus::Failed => 3,
            TaskStatus::Rejected => 4,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Rejected => "rejected",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(TaskStatus::Pending),
            "running" => Some(TaskStatus::Running),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            "rejected" => Some(TaskStatus::Rejected),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Rejected
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 任务进度计数器
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskCounters {
    pub total_dbs: u32,
    pub completed_dbs: u32,
    pub failed_dbs: u32,
    pub total_sqls: u32,
    pub completed_sqls: u32,
    pub failed_sqls: u32,
}

impl TaskCounters {
    pub fn with_totals(total_dbs: u32, statements_per_db: u32) -> Self {
        Self {
            total_dbs,
            total_sqls: total_dbs * statements_per_db,
            ..Default::default()
        }
    }

    /// completed + failed 不超过 total
    pub fn is_consistent(&self) -> bool {
        self.completed_dbs + self.failed_dbs <= self.total_dbs
            && self.completed_sqls + self.failed_sqls <= self.total_sqls
    }

    pub fn finished_dbs(&self) -> u32 {
        self.completed_dbs + self.failed_dbs
    }

    pub fn finished_sqls(&self) -> u32 {
        self.completed_sqls + self.failed_sqls
    }
}

/// 查询任务
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryTask {
    pub id: i64,
    pub task_name: String,
    pub description: String,
    pub is_favorite: bool,
    pub databases: TaskDatabases,
    pub statements: Vec<Statement>,
    pub status: TaskStatus,
    #[serde(flatten)]
    pub counters: TaskCounters,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueryTask {
    /// 新建待执行任务（尚未持久化，id 为 0）
    pub fn new_pending(
        task_name: String,
        description: String,
        is_favorite: bool,
        databases: TaskDatabases,
        statements: Vec<Statement>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            task_name,
            description,
            is_favorite,
            databases,
            statements,
            status: TaskStatus::Pending,
            counters: TaskCounters::default(),
            started_at: None,
            completed_at: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// 任务列表项（不解析目标列表）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSummary {
    pub id: i64,
    pub task_name: String,
    pub description: String,
    pub is_favorite: bool,
    pub status: TaskStatus,
    #[serde(flatten)]
    pub counters: TaskCounters,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<&QueryTask> for TaskSummary {
    fn from(task: &QueryTask) -> Self {
        Self {
            id: task.id,
            task_name: task.task_name.clone(),
            description: task.description.clone(),
            is_favorite: task.is_favorite,
            status: task.status,
            counters: task.counters,
            started_at: task.started_at,
            completed_at: task.completed_at,
            created_at: task.created_at,
        }
    }
}

/// 创建任务的请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateQueryTaskRequest {
    pub task_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub is_favorite: bool,
    pub targets: Vec<TargetDescriptor>,
    pub statements: Vec<String>,
    /// 只创建不执行
    #[serde(default)]
    pub defer: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryQuery {
    pub status: Option<String>,
    pub favorite: Option<bool>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl HistoryQuery {
    /// 无法识别的状态字符串视为输入错误
    pub fn status_filter(&self) -> crate::utils::error::Result<Option<TaskStatus>> {
        match &self.status {
            None => Ok(None),
            Some(s) => TaskStatus::from_str(s).map(Some).ok_or_else(|| {
                crate::utils::error::AppError::InvalidInput(format!("Unknown task status: {}", s))
            }),
        }
    }

    pub fn limit(&self) -> i64 {
        self.limit.unwrap_or(50).clamp(1, 500)
    }

    pub fn offset(&self) -> i64 {
        self.offset.unwrap_or(0).max(0)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FavoriteRequest {
    pub is_favorite: bool,
}
