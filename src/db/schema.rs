/// 数据库实例表的 CREATE TABLE 语句 (MySQL 8)
pub const CREATE_DATABASE_INSTANCES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS database_instances (
    id BIGINT AUTO_INCREMENT PRIMARY KEY,
    name VARCHAR(255) NOT NULL UNIQUE,
    db_type VARCHAR(50) NOT NULL,
    host VARCHAR(255) NOT NULL,
    port INT NOT NULL,
    username VARCHAR(255) NOT NULL,
    password TEXT NOT NULL,
    created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
    updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP ON UPDATE CURRENT_TIMESTAMP
) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_unicode_ci;
"#;

/// 查询任务表的 CREATE TABLE 语句 (MySQL 8)
pub const CREATE_QUERY_TASKS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS query_task_tasks (
    id BIGINT AUTO_INCREMENT PRIMARY KEY,
    created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
    updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP ON UPDATE CURRENT_TIMESTAMP,
    deleted_at TIMESTAMP NULL,
    task_name VARCHAR(100) NOT NULL COMMENT '任务名称',
    `databases` TEXT NOT NULL COMMENT '目标数据库列表(JSON格式，包含instance_id和database_name)',
    status TINYINT NOT NULL DEFAULT 0 COMMENT '任务状态：0-待执行，1-执行中，2-已完成，3-失败，4-已拒绝',
    total_dbs INT UNSIGNED NOT NULL DEFAULT 0,
    completed_dbs INT UNSIGNED NOT NULL DEFAULT 0,
    failed_dbs INT UNSIGNED NOT NULL DEFAULT 0,
    total_sqls INT UNSIGNED NOT NULL DEFAULT 0,
    completed_sqls INT UNSIGNED NOT NULL DEFAULT 0,
    failed_sqls INT UNSIGNED NOT NULL DEFAULT 0,
    started_at TIMESTAMP NULL,
    completed_at TIMESTAMP NULL,
    description TEXT,
    is_favorite BOOLEAN NOT NULL DEFAULT FALSE,
    error_message TEXT,
    INDEX idx_deleted_at (deleted_at),
    INDEX idx_status (status)
) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_unicode_ci;
"#;

/// 任务 SQL 语句表
pub const CREATE_QUERY_TASK_SQLS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS query_task_sqls (
    id BIGINT AUTO_INCREMENT PRIMARY KEY,
    task_id BIGINT NOT NULL,
    position INT UNSIGNED NOT NULL,
    sql_text MEDIUMTEXT NOT NULL,
    FOREIGN KEY (task_id) REFERENCES query_task_tasks(id) ON DELETE CASCADE,
    UNIQUE KEY uk_task_position (task_id, position)
) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_unicode_ci;
"#;

/// 执行结果表，每个 (目标, 语句) 一行
pub const CREATE_QUERY_TASK_RESULTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS query_task_results (
    id BIGINT AUTO_INCREMENT PRIMARY KEY,
    task_id BIGINT NOT NULL,
    target_index INT UNSIGNED NOT NULL,
    instance_id BIGINT NOT NULL,
    instance_name VARCHAR(255) NOT NULL,
    database_name VARCHAR(255) NOT NULL,
    position INT UNSIGNED NOT NULL,
    outcome VARCHAR(32) NOT NULL,
    error_message TEXT,
    rows_affected BIGINT UNSIGNED NOT NULL DEFAULT 0,
    duration_ms BIGINT UNSIGNED NOT NULL DEFAULT 0,
    executed_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
    FOREIGN KEY (task_id) REFERENCES query_task_tasks(id) ON DELETE CASCADE,
    UNIQUE KEY uk_task_target_position (task_id, target_index, position)
) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_unicode_ci;
"#;
