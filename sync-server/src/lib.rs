//! Inventory Sync Server - 资源清单双时态同步引擎
//!
//! # 架构概述
//!
//! 周期性拉取外部资源的当前状态，记录当前快照和完整变更历史：
//!
//! - **存储** (`store`): redb 快照表与同步状态
//! - **历史账本** (`ledger`): 有效时间区间 + 哈希链
//! - **同步** (`sync`): 变更检测、整批事务写入、过期实体清理
//! - **编排** (`orchestrator`): 超时、指数退避重试、心跳、scope 组合
//! - **限流** (`rate_limit`): 共享令牌桶
//! - **数据源** (`adapters`): JSON 导出文件适配器
//!
//! # 模块结构
//!
//! ```text
//! sync-server/src/
//! ├── core/          # 配置、后台任务、定时调度
//! ├── store/         # redb 存储
//! ├── ledger/        # 历史账本
//! ├── sync/          # 同步引擎
//! ├── orchestrator/  # 重试编排
//! ├── adapters/      # 资源适配器
//! └── utils/         # 日志
//! ```

pub mod adapters;
pub mod core;
pub mod ledger;
pub mod orchestrator;
pub mod rate_limit;
pub mod store;
pub mod sync;
pub mod utils;

// Re-export 公共类型
pub use crate::core::{BackgroundTasks, Config, SyncScheduler, TaskKind};
pub use ledger::HistoryLedger;
pub use orchestrator::{Orchestrator, OrchestratorConfig, RetryPolicy, SyncJob};
pub use rate_limit::RateLimiter;
pub use store::{EntityRef, InventoryStore, StorageError};
pub use sync::{SyncEngine, SyncError, SyncReport};

pub use utils::logger::{init_logger, init_logger_with_file};

// Integrity logging macro - 数据完整性故障，与普通瞬时错误分开记录
#[macro_export]
macro_rules! integrity_log {
    ($event:expr, $($key:ident = $value:expr),*) => {
        tracing::error!(
            target: "integrity",
            event = $event,
            $($key = $value),*
        );
    };
}

/// 设置运行环境：加载 .env、创建工作目录、初始化日志
///
/// 返回的 guard 需在进程生命周期内保持存活 (文件日志刷新)。
pub fn setup_environment() -> std::io::Result<(Config, Option<tracing_appender::non_blocking::WorkerGuard>)> {
    dotenv::dotenv().ok();

    let config = Config::from_env();
    std::fs::create_dir_all(&config.work_dir)?;

    let guard = init_logger_with_file(
        Some(&config.log_level),
        config.log_json,
        config.log_dir.as_deref(),
    );
    Ok((config, guard))
}
