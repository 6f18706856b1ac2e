//! 核心模块 - 配置、后台任务、定时调度
//!
//! - [`Config`] - 服务配置 (环境变量)
//! - [`BackgroundTasks`] - 后台任务注册与关闭
//! - [`SyncScheduler`] - 周期同步

pub mod config;
pub mod scheduler;
pub mod tasks;

pub use config::Config;
pub use scheduler::{RoundSummary, SyncScheduler};
pub use tasks::{BackgroundTasks, TaskKind};
