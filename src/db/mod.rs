pub mod memory;
pub mod repository;
pub mod schema;
pub mod store;

use crate::config::DatabaseSettings;
use crate::utils::error::Result;
use sqlx::{mysql::MySqlPoolOptions, MySqlPool};

pub use memory::*;
pub use repository::*;
pub use store::*;

/// 初始化数据库
pub async fn init_database(settings: &DatabaseSettings) -> Result<MySqlPool> {
    tracing::info!("Initializing database at: {}", mask_password(&settings.url));

    // 创建连接池
    let pool = MySqlPoolOptions::new()
        .max_connections(settings.max_connections)
        .connect(&settings.url)
        .await?;

    // 运行迁移
    run_migrations(&pool).await?;

    Ok(pool)
}

/// 运行数据库迁移
async fn run_migrations(pool: &MySqlPool) -> Result<()> {
    tracing::info!("Running database migrations");

    for ddl in [
        schema::CREATE_DATABASE_INSTANCES_TABLE,
        schema::CREATE_QUERY_TASKS_TABLE,
        schema::CREATE_QUERY_TASK_SQLS_TABLE,
        schema::CREATE_QUERY_TASK_RESULTS_TABLE,
    ] {
        sqlx::query(ddl).execute(pool).await?;
    }

    tracing::info!("Database migrations completed");

    Ok(())
}

/// 隐藏密码用于日志输出
fn mask_password(url: &str) -> String {
    if let Some(at_pos) = url.find('@') {
        if let Some(colon_pos) = url[..at_pos].rfind(':') {
            let mut masked = url.to_string();
            masked.replace_range(colon_pos + 1..at_pos, "****");
            return masked;
        }
    }
    url.to_string()
}
