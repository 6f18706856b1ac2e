use std::time::Duration;

use sync_server::{BackgroundTasks, InventoryStore, SyncScheduler, TaskKind, setup_environment};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. 设置环境 (dotenv, 工作目录, 日志)
    let (config, _log_guard) = setup_environment()?;

    tracing::info!(
        work_dir = %config.work_dir.display(),
        source_dir = %config.source_dir.display(),
        "Inventory sync server starting..."
    );

    // 2. 打开数据库
    let store = InventoryStore::open(config.database_path())?;

    // 3. 启动定时同步
    let mut tasks = BackgroundTasks::new();
    let shutdown = tasks.shutdown_token();
    let scheduler = SyncScheduler::new(&config, store, shutdown.clone());
    tasks.spawn(
        "sync_scheduler",
        TaskKind::Periodic,
        scheduler.run(shutdown.clone()),
    );

    // 4. 等待 Ctrl-C
    tokio::signal::ctrl_c().await?;
    tracing::info!("Ctrl-C received, shutting down");

    // 5. 优雅关闭：取消进行中的同步尝试 (事务要么已提交，要么未开始)
    tasks.shutdown(SHUTDOWN_GRACE).await;
    Ok(())
}
