use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{MySql, MySqlPool, QueryBuilder};

use crate::db::TaskStore;
use crate::models::{
    CreateInstanceRequest, DatabaseInstance, DbType, ExecError, ExecutionOutcome, HistoryQuery,
    OutcomeKind, QueryTask, Statement, StatementResult, TargetDescriptor, TaskCounters,
    TaskDatabases, TaskStatus, TaskSummary,
};
use crate::utils::crypto::CredentialCipher;
use crate::utils::error::{AppError, Result};

const TASK_COLUMNS: &str = "id, task_name, `databases`, status, total_dbs, completed_dbs, failed_dbs, \
     total_sqls, completed_sqls, failed_sqls, started_at, completed_at, description, is_favorite, \
     error_message, created_at, updated_at";

const SUMMARY_COLUMNS: &str = "id, task_name, status, total_dbs, completed_dbs, failed_dbs, \
     total_sqls, completed_sqls, failed_sqls, started_at, completed_at, description, is_favorite, \
     created_at";

/// 数据库实例仓库
pub struct InstanceRepository<'a> {
    pool: &'a MySqlPool,
    cipher: &'a CredentialCipher,
}

impl<'a> InstanceRepository<'a> {
    pub fn new(pool: &'a MySqlPool, cipher: &'a CredentialCipher) -> Self {
        Self { pool, cipher }
    }

    /// 保存实例配置
    pub async fn save(&self, req: CreateInstanceRequest) -> Result<i64> {
        let encrypted_password = self.cipher.encrypt(&req.password)?;

        let result = sqlx::query(
            r#"
            INSERT INTO database_instances (name, db_type, host, port, username, password)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&req.name)
        .bind(req.db_type.as_str())
        .bind(&req.host)
        .bind(req.port as i32)
        .bind(&req.username)
        .bind(&encrypted_password)
        .execute(self.pool)
        .await?;

        Ok(result.last_insert_id() as i64)
    }

    /// 获取所有实例
    pub async fn find_all(&self) -> Result<Vec<DatabaseInstance>> {
        let rows: Vec<_> = sqlx::query_as::<_, InstanceRow>(
            "SELECT id, name, db_type, host, port, username, password, created_at, updated_at FROM database_instances ORDER BY created_at DESC",
        )
        .fetch_all(self.pool)
        .await?;

        rows.into_iter().map(|row| row.decrypt(self.cipher)).collect()
    }

    /// 根据 ID 获取实例
    pub async fn find_by_id(&self, id: i64) -> Result<DatabaseInstance> {
        let row = sqlx::query_as::<_, InstanceRow>(
            "SELECT id, name, db_type, host, port, username, password, created_at, updated_at FROM database_instances WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Instance with id {} not found", id)))?;

        row.decrypt(self.cipher)
    }

    /// 更新实例
    pub async fn update(&self, id: i64, req: CreateInstanceRequest) -> Result<()> {
        let encrypted_password = self.cipher.encrypt(&req.password)?;

        let result = sqlx::query(
            r#"
            UPDATE database_instances
            SET name = ?, db_type = ?, host = ?, port = ?, username = ?, password = ?, updated_at = CURRENT_TIMESTAMP
            WHERE id = ?
            "#,
        )
        .bind(&req.name)
        .bind(req.db_type.as_str())
        .bind(&req.host)
        .bind(req.port as i32)
        .bind(&req.username)
        .bind(&encrypted_password)
        .bind(id)
        .execute(self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("Instance with id {} not found", id)));
        }
        Ok(())
    }

    /// 删除实例
    pub async fn delete(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM database_instances WHERE id = ?")
            .bind(id)
            .execute(self.pool)
            .await?;
        Ok(())
    }
}

/// 任务仓库（MySQL 实现）
#[derive(Clone)]
pub struct TaskRepository {
    pool: MySqlPool,
}

impl TaskRepository {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }

    async fn load_statements(&self, task_id: i64) -> Result<Vec<Statement>> {
        let rows: Vec<(u32, String)> = sqlx::query_as(
            "SELECT position, sql_text FROM query_task_sqls WHERE task_id = ? ORDER BY position ASC",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(position, sql)| Statement { position, sql })
            .collect())
    }
}

#[async_trait]
impl TaskStore for TaskRepository {
    async fn create(&self, task: &QueryTask) -> Result<i64> {
        let databases = task.databases.encode()?;
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            INSERT INTO query_task_tasks (task_name, `databases`, status, description, is_favorite)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&task.task_name)
        .bind(&databases)
        .bind(task.status.as_i8())
        .bind(&task.description)
        .bind(task.is_favorite)
        .execute(&mut *tx)
        .await?;

        let task_id = result.last_insert_id() as i64;

        for statement in &task.statements {
            sqlx::query(
                "INSERT INTO query_task_sqls (task_id, position, sql_text) VALUES (?, ?, ?)",
            )
            .bind(task_id)
            .bind(statement.position)
            .bind(&statement.sql)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        Ok(task_id)
    }

    async fn start(&self, task: &QueryTask) -> Result<()> {
        let c = &task.counters;
        let result = sqlx::query(
            r#"
            UPDATE query_task_tasks
            SET status = ?, total_dbs = ?, completed_dbs = 0, failed_dbs = 0,
                total_sqls = ?, completed_sqls = 0, failed_sqls = 0,
                started_at = ?, updated_at = CURRENT_TIMESTAMP
            WHERE id = ? AND status = ? AND deleted_at IS NULL
            "#,
        )
        .bind(TaskStatus::Running.as_i8())
        .bind(c.total_dbs)
        .bind(c.total_sqls)
        .bind(task.started_at)
        .bind(task.id)
        .bind(TaskStatus::Pending.as_i8())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        // 没有命中：任务不存在，或已被其他调用启动
        let current: Option<i8> = sqlx::query_scalar(
            "SELECT status FROM query_task_tasks WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(task.id)
        .fetch_optional(&self.pool)
        .await?;

        match current {
            None => Err(AppError::NotFound(format!("Task with id {} not found", task.id))),
            Some(raw) => Err(AppError::InvalidTransition {
                from: decode_status(task.id, raw)?.to_string(),
                to: TaskStatus::Running.to_string(),
            }),
        }
    }

    async fn save(&self, task: &QueryTask) -> Result<()> {
        let c = &task.counters;
        let result = sqlx::query(
            r#"
            UPDATE query_task_tasks
            SET status = ?, total_dbs = ?, completed_dbs = ?, failed_dbs = ?,
                total_sqls = ?, completed_sqls = ?, failed_sqls = ?,
                started_at = ?, completed_at = ?, error_message = ?, updated_at = CURRENT_TIMESTAMP
            WHERE id = ? AND deleted_at IS NULL
            "#,
        )
        .bind(task.status.as_i8())
        .bind(c.total_dbs)
        .bind(c.completed_dbs)
        .bind(c.failed_dbs)
        .bind(c.total_sqls)
        .bind(c.completed_sqls)
        .bind(c.failed_sqls)
        .bind(task.started_at)
        .bind(task.completed_at)
        .bind(&task.error_message)
        .bind(task.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("Task with id {} not found", task.id)));
        }
        Ok(())
    }

    async fn load(&self, task_id: i64) -> Result<QueryTask> {
        let row = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {} FROM query_task_tasks WHERE id = ? AND deleted_at IS NULL",
            TASK_COLUMNS
        ))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Task with id {} not found", task_id)))?;

        let statements = self.load_statements(task_id).await?;
        row.into_task(statements)
    }

    async fn mark_rejected(&self, task_id: i64, reason: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE query_task_tasks
            SET status = ?, error_message = ?, completed_at = ?, updated_at = CURRENT_TIMESTAMP
            WHERE id = ? AND status = ? AND deleted_at IS NULL
            "#,
        )
        .bind(TaskStatus::Rejected.as_i8())
        .bind(reason)
        .bind(Utc::now())
        .bind(task_id)
        .bind(TaskStatus::Pending.as_i8())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!(
                "Pending task with id {} not found",
                task_id
            )));
        }
        Ok(())
    }

    async fn append_results(&self, task_id: i64, results: &[StatementResult]) -> Result<()> {
        if results.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for r in results {
            let (error_message, rows_affected, duration_ms) = match &r.outcome {
                ExecutionOutcome::Success {
                    rows_affected,
                    duration_ms,
                } => (None, *rows_affected, *duration_ms),
                ExecutionOutcome::Failed { error } => (error_detail(error), 0, 0),
            };

            sqlx::query(
                r#"
                INSERT INTO query_task_results (
                    task_id, target_index, instance_id, instance_name, database_name,
                    position, outcome, error_message, rows_affected, duration_ms, executed_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(task_id)
            .bind(r.target_index)
            .bind(r.target.instance_id)
            .bind(&r.target.instance_name)
            .bind(&r.target.database_name)
            .bind(r.position)
            .bind(r.outcome.kind().as_str())
            .bind(error_message)
            .bind(rows_affected)
            .bind(duration_ms)
            .bind(r.executed_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(())
    }

    async fn load_results(&self, task_id: i64) -> Result<Vec<StatementResult>> {
        let rows = sqlx::query_as::<_, ResultRow>(
            r#"
            SELECT target_index, instance_id, instance_name, database_name, position, outcome,
                   error_message, rows_affected, duration_ms, executed_at
            FROM query_task_results
            WHERE task_id = ?
            ORDER BY target_index ASC, position ASC
            "#,
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(StatementResult::try_from).collect()
    }

    async fn list(&self, query: &HistoryQuery) -> Result<Vec<TaskSummary>> {
        let status = query.status_filter()?;

        let mut qb: QueryBuilder<MySql> = QueryBuilder::new(format!(
            "SELECT {} FROM query_task_tasks WHERE deleted_at IS NULL",
            SUMMARY_COLUMNS
        ));
        if let Some(status) = status {
            qb.push(" AND status = ").push_bind(status.as_i8());
        }
        if let Some(favorite) = query.favorite {
            qb.push(" AND is_favorite = ").push_bind(favorite);
        }
        qb.push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(query.limit())
            .push(" OFFSET ")
            .push_bind(query.offset());

        let rows = qb
            .build_query_as::<SummaryRow>()
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(TaskSummary::try_from).collect()
    }

    async fn set_favorite(&self, task_id: i64, is_favorite: bool) -> Result<()> {
        let result = sqlx::query(
            "UPDATE query_task_tasks SET is_favorite = ? WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(is_favorite)
        .bind(task_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("Task with id {} not found", task_id)));
        }
        Ok(())
    }

    async fn soft_delete(&self, task_id: i64) -> Result<()> {
        let result = sqlx::query(
            "UPDATE query_task_tasks SET deleted_at = CURRENT_TIMESTAMP WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(task_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("Task with id {} not found", task_id)));
        }
        Ok(())
    }
}

fn error_detail(error: &ExecError) -> Option<String> {
    match error {
        ExecError::Connection(msg) | ExecError::Execution(msg) => Some(msg.clone()),
        ExecError::Cancelled => None,
    }
}

fn decode_status(task_id: i64, raw: i8) -> Result<TaskStatus> {
    TaskStatus::try_from(raw).map_err(|reason| AppError::CorruptTaskData { task_id, reason })
}

// 辅助结构用于从数据库读取
#[derive(sqlx::FromRow)]
struct InstanceRow {
    id: i64,
    name: String,
    db_type: String,
    host: String,
    port: i32,
    username: String,
    password: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl InstanceRow {
    fn decrypt(self, cipher: &CredentialCipher) -> Result<DatabaseInstance> {
        let db_type = DbType::from_str(&self.db_type)
            .ok_or_else(|| AppError::Config(format!("Invalid db_type: {}", self.db_type)))?;

        let password = cipher.decrypt(&self.password)?;

        Ok(DatabaseInstance {
            id: self.id,
            name: self.name,
            db_type,
            host: self.host,
            port: self.port as u16,
            username: self.username,
            password,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: i64,
    task_name: String,
    databases: String,
    status: i8,
    total_dbs: u32,
    completed_dbs: u32,
    failed_dbs: u32,
    total_sqls: u32,
    completed_sqls: u32,
    failed_sqls: u32,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    description: Option<String>,
    is_favorite: bool,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TaskRow {
    fn into_task(self, statements: Vec<Statement>) -> Result<QueryTask> {
        let databases = TaskDatabases::decode(self.id, &self.databases)?;
        let status = decode_status(self.id, self.status)?;

        Ok(QueryTask {
            id: self.id,
            task_name: self.task_name,
            description: self.description.unwrap_or_default(),
            is_favorite: self.is_favorite,
            databases,
            statements,
            status,
            counters: TaskCounters {
                total_dbs: self.total_dbs,
                completed_dbs: self.completed_dbs,
                failed_dbs: self.failed_dbs,
                total_sqls: self.total_sqls,
                completed_sqls: self.completed_sqls,
                failed_sqls: self.failed_sqls,
            },
            started_at: self.started_at,
            completed_at: self.completed_at,
            error_message: self.error_message,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SummaryRow {
    id: i64,
    task_name: String,
    status: i8,
    total_dbs: u32,
    completed_dbs: u32,
    failed_dbs: u32,
    total_sqls: u32,
    completed_sqls: u32,
    failed_sqls: u32,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    description: Option<String>,
    is_favorite: bool,
    created_at: DateTime<Utc>,
}

impl TryFrom<SummaryRow> for TaskSummary {
    type Error = AppError;

    fn try_from(row: SummaryRow) -> Result<Self> {
        Ok(TaskSummary {
            id: row.id,
            task_name: row.task_name,
            description: row.description.unwrap_or_default(),
            is_favorite: row.is_favorite,
            status: decode_status(row.id, row.status)?,
            counters: TaskCounters {
                total_dbs: row.total_dbs,
                completed_dbs: row.completed_dbs,
                failed_dbs: row.failed_dbs,
                total_sqls: row.total_sqls,
                completed_sqls: row.completed_sqls,
                failed_sqls: row.failed_sqls,
            },
            started_at: row.started_at,
            completed_at: row.completed_at,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ResultRow {
    target_index: u32,
    instance_id: i64,
    instance_name: String,
    database_name: String,
    position: u32,
    outcome: String,
    error_message: Option<String>,
    rows_affected: u64,
    duration_ms: u64,
    executed_at: DateTime<Utc>,
}

impl TryFrom<ResultRow> for StatementResult {
    type Error = AppError;

    fn try_from(row: ResultRow) -> Result<Self> {
        let kind = OutcomeKind::try_from(row.outcome).map_err(AppError::InvalidInput)?;
        let message = row.error_message.unwrap_or_default();
        let outcome = match kind {
            OutcomeKind::Success => ExecutionOutcome::Success {
                rows_affected: row.rows_affected,
                duration_ms: row.duration_ms,
            },
            OutcomeKind::ConnectionError => {
                ExecutionOutcome::failed(ExecError::Connection(message))
            }
            OutcomeKind::ExecutionError => {
                ExecutionOutcome::failed(ExecError::Execution(message))
            }
            OutcomeKind::Cancelled => ExecutionOutcome::failed(ExecError::Cancelled),
        };

        Ok(StatementResult {
            target_index: row.target_index,
            target: TargetDescriptor {
                instance_id: row.instance_id,
                database_name: row.database_name,
                instance_name: row.instance_name,
            },
            position: row.position,
            outcome,
            executed_at: row.executed_at,
        })
    }
}
