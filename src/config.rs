//! 配置管理模块
//! 加载并解析多路复用器配置，支持TOML/YAML格式

use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

use crate::reactor::AutoRemove;
use crate::transfer::default_user_agent;

/// 就绪等待上限的默认值(毫秒)
pub const DEFAULT_WAIT_CEILING_MS: u64 = 1000;
/// 无描述符时回退休眠的默认值(毫秒)
pub const DEFAULT_FALLBACK_WAIT_MS: u64 = 100;

/// 多路复用器配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReactorConfig {
    /// 单次就绪等待上限(毫秒)
    pub wait_ceiling_ms: u64,

    /// 引擎没有待等待描述符时的休眠时长(毫秒)
    pub fallback_wait_ms: u64,

    /// 自动移除策略
    pub auto_remove: AutoRemove,

    /// 引擎调用失败时是否抛出
    pub throw_setup_errors: bool,

    /// 原型中的传输错误抛出开关
    pub throw_transfer_errors: bool,

    /// 协议原型中的 User-Agent
    pub user_agent: Option<String>,

    /// 日志配置
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LogConfig {
    /// 日志级别，`RUST_LOG` 存在时以其为准
    pub level: String,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            wait_ceiling_ms: DEFAULT_WAIT_CEILING_MS,
            fallback_wait_ms: DEFAULT_FALLBACK_WAIT_MS,
            auto_remove: AutoRemove::None,
            throw_setup_errors: true,
            throw_transfer_errors: true,
            user_agent: Some(default_user_agent()),
            log: LogConfig::default(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl ReactorConfig {
    pub fn wait_ceiling(&self) -> Duration {
        Duration::from_millis(self.wait_ceiling_ms)
    }

    pub fn fallback_wait(&self) -> Duration {
        Duration::from_millis(self.fallback_wait_ms)
    }
}

/// 加载配置文件
pub fn load(config_path: &str) -> Result<ReactorConfig, ConfigError> {
    Config::builder()
        // 从文件加载基础配置
        .add_source(File::with_name(config_path))
        // 从环境变量覆盖配置 (TRANSFER_MUX_前缀)
        .add_source(Environment::with_prefix("TRANSFER_MUX").separator("__"))
        .build()?
        .try_deserialize()
}
