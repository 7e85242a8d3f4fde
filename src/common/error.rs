//! 错误处理模块
//! 定义统一错误类型、错误码以及 (错误域, 错误码) -> 描述文本 的纯函数映射

use std::fmt;
use std::io::Error as IoError;
use thiserror::Error;

use crate::engine::TransferId;

/// 数据通路钩子中产生的用户错误
pub type HookError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// 错误域
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorDomain {
    /// 单个传输的完成码
    Transfer,
    /// 传输引擎（多路复用上下文）错误码
    Engine,
    /// 跨传输共享缓存错误码
    Share,
    /// 协议层状态码
    Http,
}

impl fmt::Display for ErrorDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorDomain::Transfer => "transfer",
            ErrorDomain::Engine => "engine",
            ErrorDomain::Share => "share",
            ErrorDomain::Http => "http",
        };
        f.write_str(name)
    }
}

/// 带错误域的错误码，相当于一个轻量的值类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorCode {
    /// 错误域
    pub domain: ErrorDomain,
    /// 原始数值
    pub value: i32,
}

impl ErrorCode {
    /// 创建错误码
    pub const fn new(domain: ErrorDomain, value: i32) -> Self {
        Self { domain, value }
    }

    /// 错误描述文本
    pub fn message(&self) -> &'static str {
        message(self.domain, self.value)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} ({})", self.domain, self.value, self.message())
    }
}

/// 传输完成码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferCode {
    /// 成功
    Ok,
    /// 不支持的协议
    UnsupportedProtocol,
    /// URL 格式错误
    UrlMalformat,
    /// 无法解析主机
    CouldntResolveHost,
    /// 无法连接
    CouldntConnect,
    /// 对端返回错误
    HttpReturnedError,
    /// 写入接收缓冲区失败（含写钩子中止）
    WriteError,
    /// 读取发送缓冲区失败
    ReadError,
    /// 内存不足
    OutOfMemory,
    /// 操作超时
    OperationTimedOut,
    /// TLS 握手失败
    SslConnectError,
    /// 被回调中止
    AbortedByCallback,
    /// 对端未返回任何数据
    GotNothing,
    /// 发送失败
    SendError,
    /// 接收失败
    RecvError,
    /// 其他引擎码
    Other(i32),
}

impl TransferCode {
    /// 从原始数值还原
    pub fn from_raw(value: i32) -> Self {
        match value {
            0 => TransferCode::Ok,
            1 => TransferCode::UnsupportedProtocol,
            3 => TransferCode::UrlMalformat,
            6 => TransferCode::CouldntResolveHost,
            7 => TransferCode::CouldntConnect,
            22 => TransferCode::HttpReturnedError,
            23 => TransferCode::WriteError,
            26 => TransferCode::ReadError,
            27 => TransferCode::OutOfMemory,
            28 => TransferCode::OperationTimedOut,
            35 => TransferCode::SslConnectError,
            42 => TransferCode::AbortedByCallback,
            52 => TransferCode::GotNothing,
            55 => TransferCode::SendError,
            56 => TransferCode::RecvError,
            other => TransferCode::Other(other),
        }
    }

    /// 原始数值
    pub fn raw(&self) -> i32 {
        match self {
            TransferCode::Ok => 0,
            TransferCode::UnsupportedProtocol => 1,
            TransferCode::UrlMalformat => 3,
            TransferCode::CouldntResolveHost => 6,
            TransferCode::CouldntConnect => 7,
            TransferCode::HttpReturnedError => 22,
            TransferCode::WriteError => 23,
            TransferCode::ReadError => 26,
            TransferCode::OutOfMemory => 27,
            TransferCode::OperationTimedOut => 28,
            TransferCode::SslConnectError => 35,
            TransferCode::AbortedByCallback => 42,
            TransferCode::GotNothing => 52,
            TransferCode::SendError => 55,
            TransferCode::RecvError => 56,
            TransferCode::Other(value) => *value,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, TransferCode::Ok)
    }

    /// 超时码只路由到超时钩子
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransferCode::OperationTimedOut)
    }

    pub fn code(&self) -> ErrorCode {
        ErrorCode::new(ErrorDomain::Transfer, self.raw())
    }
}

impl fmt::Display for TransferCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.code(), f)
    }
}

/// 传输引擎错误码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineCode {
    /// 无效的引擎句柄
    BadHandle,
    /// 无效的传输标识
    BadTransfer,
    /// 内存不足
    OutOfMemory,
    /// 引擎内部错误
    InternalError,
    /// 无效的套接字
    BadSocket,
    /// 未知选项
    UnknownOption,
    /// 传输已经加入
    AddedAlready,
    /// 在回调中递归调用引擎
    RecursiveApiCall,
    /// 其他引擎码
    Other(i32),
}

impl EngineCode {
    pub fn from_raw(value: i32) -> Self {
        match value {
            1 => EngineCode::BadHandle,
            2 => EngineCode::BadTransfer,
            3 => EngineCode::OutOfMemory,
            4 => EngineCode::InternalError,
            5 => EngineCode::BadSocket,
            6 => EngineCode::UnknownOption,
            7 => EngineCode::AddedAlready,
            8 => EngineCode::RecursiveApiCall,
            other => EngineCode::Other(other),
        }
    }

    pub fn raw(&self) -> i32 {
        match self {
            EngineCode::BadHandle => 1,
            EngineCode::BadTransfer => 2,
            EngineCode::OutOfMemory => 3,
            EngineCode::InternalError => 4,
            EngineCode::BadSocket => 5,
            EngineCode::UnknownOption => 6,
            EngineCode::AddedAlready => 7,
            EngineCode::RecursiveApiCall => 8,
            EngineCode::Other(value) => *value,
        }
    }

    pub fn code(&self) -> ErrorCode {
        ErrorCode::new(ErrorDomain::Engine, self.raw())
    }
}

impl fmt::Display for EngineCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.code(), f)
    }
}

/// 由 (错误域, 错误码) 得到描述文本，无任何共享可变状态
pub fn message(domain: ErrorDomain, value: i32) -> &'static str {
    match domain {
        ErrorDomain::Transfer => transfer_message(TransferCode::from_raw(value)),
        ErrorDomain::Engine => engine_message(value),
        ErrorDomain::Share => share_message(value),
        ErrorDomain::Http => http_reason(value),
    }
}

fn transfer_message(code: TransferCode) -> &'static str {
    match code {
        TransferCode::Ok => "No error",
        TransferCode::UnsupportedProtocol => "Unsupported protocol",
        TransferCode::UrlMalformat => "URL using bad/illegal format or missing URL",
        TransferCode::CouldntResolveHost => "Couldn't resolve host name",
        TransferCode::CouldntConnect => "Couldn't connect to server",
        TransferCode::HttpReturnedError => "HTTP response code said error",
        TransferCode::WriteError => "Failed writing received data to disk/application",
        TransferCode::ReadError => "Failed to open/read local data from file/application",
        TransferCode::OutOfMemory => "Out of memory",
        TransferCode::OperationTimedOut => "Timeout was reached",
        TransferCode::SslConnectError => "SSL connect error",
        TransferCode::AbortedByCallback => "Operation was aborted by an application callback",
        TransferCode::GotNothing => "Server returned nothing (no headers, no data)",
        TransferCode::SendError => "Failed sending data to the peer",
        TransferCode::RecvError => "Failure when receiving data from the peer",
        TransferCode::Other(_) => "Unknown error",
    }
}

fn engine_message(value: i32) -> &'static str {
    match value {
        0 => "No error",
        1 => "Invalid multi handle",
        2 => "Invalid easy handle",
        3 => "Out of memory",
        4 => "Internal error",
        5 => "Invalid socket argument",
        6 => "Unknown option",
        7 => "The easy handle is already added to a multi handle",
        8 => "API function called from within callback",
        _ => "Unknown error",
    }
}

fn share_message(value: i32) -> &'static str {
    match value {
        0 => "No error",
        1 => "Unknown share option",
        2 => "Share currently in use",
        3 => "Invalid share handle",
        4 => "Out of memory",
        5 => "Feature not enabled in this library",
        _ => "Unknown error",
    }
}

fn http_reason(value: i32) -> &'static str {
    match value {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        408 => "Request Timeout",
        409 => "Conflict",
        410 => "Gone",
        411 => "Length Required",
        413 => "Payload Too Large",
        415 => "Unsupported Media Type",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        _ => "Unknown status code",
    }
}

/// 引擎级订阅 / 配置 / 拆除失败
#[derive(Debug, Clone, Error)]
#[error("engine call `{operation}` failed: {code}")]
pub struct SetupError {
    /// 失败的引擎调用
    pub operation: &'static str,
    /// 引擎错误码
    pub code: ErrorCode,
}

impl SetupError {
    pub fn new(operation: &'static str, code: EngineCode) -> Self {
        Self {
            operation,
            code: code.code(),
        }
    }
}

/// 单个传输的非成功完成
#[derive(Debug, Clone, Error)]
#[error("transfer {transfer} failed: {result}")]
pub struct TransferError {
    /// 传输标识
    pub transfer: TransferId,
    /// 完成码
    pub result: TransferCode,
}

impl TransferError {
    pub fn new(transfer: TransferId, result: TransferCode) -> Self {
        Self { transfer, result }
    }

    pub fn code(&self) -> ErrorCode {
        self.result.code()
    }

    pub fn is_timeout(&self) -> bool {
        self.result.is_timeout()
    }
}

/// 数据通路钩子中抛出的错误，在引擎调用边界被捕获后延迟重抛
#[derive(Debug, Error)]
#[error("callback raised an error in transfer {transfer}: {source}")]
pub struct CallbackError {
    /// 传输标识
    pub transfer: TransferId,
    /// 钩子抛出的原始错误
    #[source]
    pub source: HookError,
}

impl CallbackError {
    /// 取回钩子抛出的原始错误
    pub fn into_source(self) -> HookError {
        self.source
    }
}

/// 协议层错误状态码 (4xx / 5xx)
#[derive(Debug, Clone, Error)]
#[error("transfer {transfer} finished with status {code}")]
pub struct ProtocolError {
    /// 传输标识
    pub transfer: TransferId,
    /// 状态码
    pub status: u16,
    /// 带错误域的状态码
    pub code: ErrorCode,
}

impl ProtocolError {
    pub fn new(transfer: TransferId, status: u16) -> Self {
        Self {
            transfer,
            status,
            code: ErrorCode::new(ErrorDomain::Http, i32::from(status)),
        }
    }
}

/// 全局错误类型
#[derive(Debug, Error)]
pub enum ReactorError {
    /// 引擎错误
    #[error("setup error: {0}")]
    Setup(#[from] SetupError),

    /// 传输错误
    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),

    /// 回调异常
    #[error("callback exception: {0}")]
    Callback(#[from] CallbackError),

    /// 协议错误
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// 就绪等待失败
    #[error("readiness wait failed: {0}")]
    Wait(#[from] IoError),
}

/// 简化错误类型定义
pub type Result<T> = std::result::Result<T, ReactorError>;
