use async_trait::async_trait;
use sqlx::{
    mysql::{MySqlConnectOptions, MySqlSslMode},
    postgres::{PgConnectOptions, PgSslMode},
    Connection, MySqlConnection, MySqlPool, PgConnection,
};
use std::sync::Arc;

use crate::db::InstanceRepository;
use crate::models::{
    ConnectionTestResult, DatabaseInstance, DbType, TargetDescriptor, TestConnectionRequest,
};
use crate::utils::crypto::CredentialCipher;
use crate::utils::error::Result;

/// 单个目标数据库上的会话，语句按顺序执行
#[async_trait]
pub trait TargetConnection: Send {
    /// 执行一条语句，返回影响行数
    async fn execute(&mut self, sql: &str) -> std::result::Result<u64, String>;

    /// 关闭会话。未调用时丢弃连接同样会释放底层 socket。
    async fn close(self: Box<Self>);
}

/// 按目标创建连接
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(
        &self,
        target: &TargetDescriptor,
    ) -> std::result::Result<Box<dyn TargetConnection>, String>;
}

struct MySqlTargetConnection(MySqlConnection);

#[async_trait]
impl TargetConnection for MySqlTargetConnection {
    async fn execute(&mut self, sql: &str) -> std::result::Result<u64, String> {
        let conn = &mut self.0;
        sqlx::Executor::execute(conn, sqlx::raw_sql(sql))
            .await
            .map(|r| r.rows_affected())
            .map_err(|e| e.to_string())
    }

    async fn close(self: Box<Self>) {
        let MySqlTargetConnection(conn) = *self;
        if let Err(e) = conn.close().await {
            tracing::debug!("Error closing MySQL connection: {}", e);
        }
    }
}

struct PgTargetConnection(PgConnection);

#[async_trait]
impl TargetConnection for PgTargetConnection {
    async fn execute(&mut self, sql: &str) -> std::result::Result<u64, String> {
        let conn = &mut self.0;
        sqlx::Executor::execute(conn, sqlx::raw_sql(sql))
            .await
            .map(|r| r.rows_affected())
            .map_err(|e| e.to_string())
    }

    async fn close(self: Box<Self>) {
        let PgTargetConnection(conn) = *self;
        if let Err(e) = conn.close().await {
            tracing::debug!("Error closing PostgreSQL connection: {}", e);
        }
    }
}

/// 基于实例配置表的连接工厂
pub struct SqlConnectionFactory {
    app_db: MySqlPool,
    cipher: Arc<CredentialCipher>,
}

impl SqlConnectionFactory {
    pub fn new(app_db: MySqlPool, cipher: Arc<CredentialCipher>) -> Self {
        Self { app_db, cipher }
    }

    async fn open(
        &self,
        instance: &DatabaseInstance,
        database: &str,
    ) -> std::result::Result<Box<dyn TargetConnection>, String> {
        let connected = match instance.db_type {
            DbType::MySQL => {
                let opts = ConnectionService::build_mysql_options_from_instance(instance, database);
                MySqlConnection::connect_with(&opts)
                    .await
                    .map(|c| Box::new(MySqlTargetConnection(c)) as Box<dyn TargetConnection>)
            }
            DbType::PostgreSQL => {
                let opts =
                    ConnectionService::build_postgres_options_from_instance(instance, database);
                PgConnection::connect_with(&opts)
                    .await
                    .map(|c| Box::new(PgTargetConnection(c)) as Box<dyn TargetConnection>)
            }
        };

        connected.map_err(|e| {
            format!(
                "{}:{} ({}) connection failed: {}",
                instance.host, instance.port, instance.name, e
            )
        })
    }
}

#[async_trait]
impl ConnectionFactory for SqlConnectionFactory {
    async fn connect(
        &self,
        target: &TargetDescriptor,
    ) -> std::result::Result<Box<dyn TargetConnection>, String> {
        let repo = InstanceRepository::new(&self.app_db, &self.cipher);
        let instance = repo
            .find_by_id(target.instance_id)
            .await
            .map_err(|e| format!("cannot resolve instance {}: {}", target.instance_id, e))?;

        tracing::debug!(
            "Connecting to {} {}:{} database {}",
            instance.db_type.as_str(),
            instance.host,
            instance.port,
            target.database_name
        );

        self.open(&instance, &target.database_name).await
    }
}

/// 连接服务
pub struct ConnectionService;

impl ConnectionService {
    /// 测试连接（未保存的实例）
    pub async fn test_connection(req: &TestConnectionRequest) -> Result<ConnectionTestResult> {
        tracing::info!(
            "Testing {} connection to {}:{}",
            req.db_type.as_str(),
            req.host,
            req.port
        );

        let result = match req.db_type {
            DbType::MySQL => {
                let opts = Self::build_mysql_options(req);
                match MySqlConnection::connect_with(&opts).await {
                    Ok(mut conn) => {
                        let check = sqlx::query("SELECT 1").execute(&mut conn).await;
                        let _ = conn.close().await;
                        check.map(|_| ()).map_err(|e| format!("Query test failed: {}", e))
                    }
                    Err(e) => Err(format!("MySQL connection failed: {}", e)),
                }
            }
            DbType::PostgreSQL => {
                let opts = Self::build_postgres_options(req);
                match PgConnection::connect_with(&opts).await {
                    Ok(mut conn) => {
                        let check = sqlx::query("SELECT 1").execute(&mut conn).await;
                        let _ = conn.close().await;
                        check.map(|_| ()).map_err(|e| format!("Query test failed: {}", e))
                    }
                    Err(e) => Err(format!("PostgreSQL connection failed: {}", e)),
                }
            }
        };

        match result {
            Ok(()) => {
                tracing::info!("Connection test successful");
                Ok(ConnectionTestResult::success())
            }
            Err(e) => {
                tracing::error!("{}", e);
                Ok(ConnectionTestResult::failure(e))
            }
        }
    }

    /// 构建 MySQL 连接选项（避免密码特殊字符问题）
    fn build_mysql_options(req: &TestConnectionRequest) -> MySqlConnectOptions {
        let mut opts = MySqlConnectOptions::new()
            .host(&req.host)
            .port(req.port)
            .username(&req.username)
            .password(&req.password)
            .ssl_mode(MySqlSslMode::Preferred);

        if let Some(db) = &req.database_name {
            opts = opts.database(db);
        }

        opts
    }

    /// 构建 PostgreSQL 连接选项（避免密码特殊字符问题）
    fn build_postgres_options(req: &TestConnectionRequest) -> PgConnectOptions {
        let database = req.database_name.as_deref().unwrap_or("postgres");

        PgConnectOptions::new()
            .host(&req.host)
            .port(req.port)
            .username(&req.username)
            .password(&req.password)
            .database(database)
            .ssl_mode(PgSslMode::Prefer)
    }

    /// 从实例配置构建 MySQL 连接选项，连接到目标库
    pub fn build_mysql_options_from_instance(
        instance: &DatabaseInstance,
        database: &str,
    ) -> MySqlConnectOptions {
        MySqlConnectOptions::new()
            .host(&instance.host)
            .port(instance.port)
            .username(&instance.username)
            .password(&instance.password)
            .database(database)
            .charset("utf8mb4")
            .ssl_mode(MySqlSslMode::Preferred)
    }

    /// 从实例配置构建 PostgreSQL 连接选项，连接到目标库
    pub fn build_postgres_options_from_instance(
        instance: &DatabaseInstance,
        database: &str,
    ) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&instance.host)
            .port(instance.port)
            .username(&instance.username)
            .password(&instance.password)
            .database(database)
            .ssl_mode(PgSslMode::Prefer)
    }
}
