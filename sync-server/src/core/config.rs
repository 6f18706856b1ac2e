use std::path::PathBuf;
use std::time::Duration;

use crate::adapters::json_file::{DEFAULT_CHILD_FIELD, DEFAULT_KEY_FIELD, DEFAULT_PAGE_SIZE};
use crate::orchestrator::{OrchestratorConfig, RetryPolicy};

/// 同步服务配置
///
/// # 环境变量
///
/// 所有配置项都可以通过环境变量覆盖：
///
/// | 环境变量 | 默认值 | 说明 |
/// |----------|--------|------|
/// | WORK_DIR | /var/lib/inventory | 工作目录 |
/// | DATABASE_FILE | inventory.redb | 数据库文件 (相对 WORK_DIR) |
/// | LOG_LEVEL | info | 日志级别 |
/// | LOG_JSON | false | JSON 格式日志 |
/// | LOG_DIR | (无) | 日志文件目录，按天滚动 |
/// | SOURCE_DIR | WORK_DIR/sources | 导出数据目录 `<scope>/<kind>.json` |
/// | KEY_FIELD | id | 实体主键字段 |
/// | CHILD_FIELDS | labels | 子集合字段 (逗号分隔) |
/// | PAGE_SIZE | 500 | 每页条目数 |
/// | SYNC_INTERVAL_SECS | 300 | 同步周期 (秒) |
/// | RETRY_INITIAL_MS | 1000 | 首次重试间隔 (毫秒) |
/// | RETRY_MULTIPLIER | 2.0 | 退避倍数 |
/// | RETRY_MAX_MS | 60000 | 最大重试间隔 (毫秒) |
/// | RETRY_MAX_ATTEMPTS | 5 | 单任务最大尝试次数 |
/// | SCOPE_RETRY_MAX_ATTEMPTS | 3 | scope 级最大尝试次数 |
/// | ATTEMPT_TIMEOUT_SECS | 600 | 单次尝试超时 (秒) |
/// | HEARTBEAT_TIMEOUT_SECS | 120 | 心跳超时 (秒) |
/// | RATE_LIMIT_PER_SEC | 10 | 每秒补充令牌数 |
/// | RATE_LIMIT_BURST | 20 | 令牌桶容量 |
///
/// # 示例
///
/// ```ignore
/// WORK_DIR=/data/inventory SYNC_INTERVAL_SECS=60 cargo run
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// 工作目录，存储数据库、日志等文件
    pub work_dir: PathBuf,
    pub database_file: String,
    pub log_level: String,
    pub log_json: bool,
    pub log_dir: Option<PathBuf>,

    // === 数据源 ===
    pub source_dir: PathBuf,
    pub key_field: String,
    pub child_fields: Vec<String>,
    pub page_size: usize,
    pub sync_interval: Duration,

    // === 重试与限流 ===
    pub retry: RetryPolicy,
    pub scope_retry_max_attempts: u32,
    pub attempt_timeout: Duration,
    pub heartbeat_timeout: Duration,
    pub rate_limit_per_sec: f64,
    pub rate_limit_burst: u32,
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// 从环境变量加载配置
    ///
    /// 如果环境变量未设置或无法解析，使用默认值
    pub fn from_env() -> Self {
        let work_dir: PathBuf = std::env::var("WORK_DIR")
            .unwrap_or_else(|_| "/var/lib/inventory".into())
            .into();
        let source_dir = std::env::var("SOURCE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| work_dir.join("sources"));

        Self {
            database_file: std::env::var("DATABASE_FILE")
                .unwrap_or_else(|_| "inventory.redb".into()),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()),
            log_json: env_or("LOG_JSON", false),
            log_dir: std::env::var("LOG_DIR").ok().map(PathBuf::from),

            source_dir,
            key_field: std::env::var("KEY_FIELD").unwrap_or_else(|_| DEFAULT_KEY_FIELD.into()),
            child_fields: parse_list(
                &std::env::var("CHILD_FIELDS").unwrap_or_else(|_| DEFAULT_CHILD_FIELD.into()),
            ),
            page_size: env_or("PAGE_SIZE", DEFAULT_PAGE_SIZE).max(1),
            sync_interval: Duration::from_secs(env_or("SYNC_INTERVAL_SECS", 300).max(1)),

            retry: RetryPolicy {
                initial_interval: Duration::from_millis(env_or("RETRY_INITIAL_MS", 1_000)),
                multiplier: env_or("RETRY_MULTIPLIER", 2.0),
                max_interval: Duration::from_millis(env_or("RETRY_MAX_MS", 60_000)),
                max_attempts: env_or("RETRY_MAX_ATTEMPTS", 5).max(1),
            },
            scope_retry_max_attempts: env_or("SCOPE_RETRY_MAX_ATTEMPTS", 3).max(1),
            attempt_timeout: Duration::from_secs(env_or("ATTEMPT_TIMEOUT_SECS", 600)),
            heartbeat_timeout: Duration::from_secs(env_or("HEARTBEAT_TIMEOUT_SECS", 120)),
            rate_limit_per_sec: env_or("RATE_LIMIT_PER_SEC", 10.0),
            rate_limit_burst: env_or("RATE_LIMIT_BURST", 20),

            work_dir,
        }
    }

    /// 数据库文件完整路径
    pub fn database_path(&self) -> PathBuf {
        self.work_dir.join(&self.database_file)
    }

    /// 编排器配置；scope 级重试沿用任务级退避参数
    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            retry: self.retry,
            scope_retry: RetryPolicy {
                max_attempts: self.scope_retry_max_attempts,
                ..self.retry
            },
            attempt_timeout: self.attempt_timeout,
            heartbeat_timeout: self.heartbeat_timeout,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
