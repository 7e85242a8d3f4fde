//! 传输多路复用核心库
//! 在单线程、单个就绪驱动循环上复用大量出站传输，每个传输拥有独立的生命周期回调、错误策略与缓冲区归属

#![allow(clippy::module_inception)]

// 配置模块
pub mod config;

// 传输引擎协作方
pub mod engine;

// 传输句柄与缓冲区
pub mod transfer;

// 多路复用器
pub mod reactor;

// 公共组件
pub mod common;

use tracing_subscriber::EnvFilter;

pub use common::error::{
    message, CallbackError, ErrorCode, ErrorDomain, HookError, ProtocolError, ReactorError,
    Result, SetupError, TransferError,
};
pub use common::stats::ReactorStats;
pub use config::{LogConfig, ReactorConfig};
pub use engine::{
    EngineCode, PollWaiter, Script, ScriptedEngine, TransferCode, TransferId, TransportEngine,
    Waiter,
};
pub use reactor::{AutoRemove, Reactor, RequestManager};
pub use transfer::{
    Method, NullBuffer, Payload, ProtocolPrototype, Prototype, ReadSource, SharedTransfer,
    Strategy, TransferHandle, TransferState, WriteSink,
};

/// 初始化日志；`RUST_LOG` 优先，否则使用配置中的级别。重复调用无副作用
pub fn init_logging(config: &LogConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
