//! 公共组件：错误类型与统计

pub mod error;
pub mod stats;

pub use error::{
    message, CallbackError, EngineCode, ErrorCode, ErrorDomain, HookError, ProtocolError,
    ReactorError, Result, SetupError, TransferCode, TransferError,
};
pub use stats::ReactorStats;
