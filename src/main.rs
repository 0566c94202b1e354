//! Query Task Runner
//! Web API Server

use anyhow::Context;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use query_task_runner::api::{self, AppState};
use query_task_runner::config::Settings;
use query_task_runner::db::{self, TaskRepository};
use query_task_runner::services::{QueryTaskService, SqlConnectionFactory};
use query_task_runner::utils::crypto::CredentialCipher;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "query_task_runner=debug,tower_http=debug,axum=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Query Task Runner...");

    let settings = Settings::load().context("Failed to load configuration")?;

    // 初始化数据库
    let pool = db::init_database(&settings.database)
        .await
        .context("Failed to initialize database")?;

    tracing::info!("Database initialized successfully");

    let cipher = Arc::new(
        CredentialCipher::from_key(&settings.security.encryption_key)
            .context("Invalid encryption key")?,
    );
    let factory = Arc::new(SqlConnectionFactory::new(pool.clone(), Arc::clone(&cipher)));
    let store = Arc::new(TaskRepository::new(pool.clone()));
    let tasks = Arc::new(QueryTaskService::new(store, factory, settings.engine.clone()));

    tracing::info!(
        "Engine: max {} targets in parallel, connect timeout {}s",
        settings.engine.max_parallel_targets,
        settings.engine.connect_timeout_secs
    );

    // 创建 API 路由
    let app = Router::new()
        .merge(api::create_router(AppState {
            pool,
            cipher,
            tasks,
        }))
        // 请求追踪
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.server.port));

    tracing::info!("Server listening on {}", addr);
    tracing::info!("API available at http://{}/api", addr);

    // 启动服务器
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}
