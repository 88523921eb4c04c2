//! 订单积分结算服务入口

use std::sync::Arc;

use anyhow::{Context, Result};
use loyalty_shared::{config::AppConfig, database::Database, observability};
use tokio_util::sync::CancellationToken;
use tracing::info;

use accrual_worker::shutdown::shutdown_signal;
use accrual_worker::{AccrualEngine, HttpAccrualClient, PgOrderLedger, ledger::MIGRATOR};

#[tokio::main]
async fn main() -> Result<()> {
    // 本地开发时从 .env 读取，文件不存在不算错误
    let _ = dotenvy::dotenv();

    // 1. 加载配置，非法配置直接退出
    let config = AppConfig::load("accrual-worker").context("加载配置失败")?;
    config.validate().context("配置校验失败")?;

    // 2. 可观测性
    let obs_config = config
        .observability
        .clone()
        .with_service_name(&config.service_name);
    let _guard = observability::init(&obs_config).await?;

    info!(
        environment = %config.environment,
        accrual_enabled = config.accrual.enabled,
        "Starting accrual-worker..."
    );

    // 3. 数据库与迁移
    let db = Database::connect(&config.database).await?;
    db.health_check().await.context("数据库健康检查失败")?;
    db.run_migrations(&MIGRATOR).await?;
    info!("Database connection established");

    // 4. 组装引擎
    let ledger = Arc::new(PgOrderLedger::new(db.pool().clone()));
    let client = Arc::new(HttpAccrualClient::new(&config.accrual)?);
    let engine =
        AccrualEngine::new(config.accrual.clone(), ledger, client).start(CancellationToken::new());

    // 5. 等待 Ctrl+C / SIGTERM，随后取消并等待后台任务退出
    engine.shutdown_on(shutdown_signal()).await;

    // 后台任务全部退出后才关闭连接池
    db.close().await;
    info!("accrual-worker stopped");

    Ok(())
}
