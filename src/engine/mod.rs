//! 传输引擎协作方契约
//! 引擎负责实际的套接字 I/O，多路复用器只通过本模块的 trait 驱动它

pub mod scripted;
pub mod wait;

use std::collections::BTreeMap;
use std::fmt;
use std::io::SeekFrom;
use std::os::fd::RawFd;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use crate::common::error::{EngineCode, TransferCode};
pub use scripted::{Script, ScriptedEngine};
pub use wait::{PollWaiter, Waiter};

/// 引擎级传输标识（不透明）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransferId(Uuid);

impl TransferId {
    /// 生成新的传输标识
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TransferId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0.simple(), f)
    }
}

/// 在 Init 阶段下发给引擎的传输选项
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOption {
    /// 目标地址
    Url(String),
    /// User-Agent
    UserAgent(String),
    /// 请求头
    Header { name: String, value: String },
    /// 自定义请求方法
    Method(String),
    /// 上传模式，附带已知的上传大小
    Upload { size: Option<u64> },
    /// 不接收响应体
    NoBody,
    /// 跟随重定向
    FollowRedirects(bool),
    /// 整体超时
    Timeout(Duration),
    /// 连接超时
    ConnectTimeout(Duration),
    /// 调试输出
    Verbose(bool),
    /// 引擎特有选项
    Custom { name: String, value: String },
}

/// 完成事件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionEvent {
    /// 传输标识
    pub id: TransferId,
    /// 完成码
    pub code: TransferCode,
}

/// 引擎在完成后报告的可观察信息
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferInfo {
    /// 重定向后的最终地址
    pub effective_url: Option<String>,
    /// 协议状态码
    pub status: Option<u16>,
}

/// 就绪描述符集合
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadinessSets {
    /// 等待可读
    pub read: Vec<RawFd>,
    /// 等待可写
    pub write: Vec<RawFd>,
    /// 等待异常
    pub except: Vec<RawFd>,
}

impl ReadinessSets {
    pub fn is_empty(&self) -> bool {
        self.read.is_empty() && self.write.is_empty() && self.except.is_empty()
    }

    /// 最大描述符，空集合返回 None
    pub fn max_fd(&self) -> Option<RawFd> {
        self.read
            .iter()
            .chain(&self.write)
            .chain(&self.except)
            .copied()
            .max()
    }

    /// 合并为 poll(2) 的描述符数组
    pub(crate) fn to_pollfds(&self) -> Vec<libc::pollfd> {
        let mut merged: BTreeMap<RawFd, libc::c_short> = BTreeMap::new();
        for fd in &self.read {
            *merged.entry(*fd).or_default() |= libc::POLLIN;
        }
        for fd in &self.write {
            *merged.entry(*fd).or_default() |= libc::POLLOUT;
        }
        for fd in &self.except {
            *merged.entry(*fd).or_default() |= libc::POLLPRI;
        }
        merged
            .into_iter()
            .map(|(fd, events)| libc::pollfd {
                fd,
                events,
                revents: 0,
            })
            .collect()
    }
}

/// 数据通路钩子的返回值；`Abort` 是区别于任何合法字节数的中止哨兵
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// 已处理的字节数
    Proceed(usize),
    /// 请求中止传输
    Abort,
}

/// 定位钩子的返回值
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekFlow {
    Ok,
    /// 定位失败，传输应失败
    Fail,
    /// 不支持定位，引擎可自行回退
    CantSeek,
}

/// 引擎在 `step` 期间回调数据通路的接口
///
/// 实现方不得让任何错误或 panic 穿过这些方法，必须在内部捕获并返回中止哨兵。
pub trait DataPath {
    /// 收到响应体数据
    fn receive(&mut self, id: TransferId, chunk: &[u8]) -> Flow;
    /// 收到一行响应头
    fn receive_header(&mut self, id: TransferId, line: &[u8]) -> Flow;
    /// 引擎需要上传数据，写入 `out` 并返回字节数，0 表示结束
    fn transmit(&mut self, id: TransferId, out: &mut [u8]) -> Flow;
    /// 引擎需要重新定位上传数据
    fn seek(&mut self, id: TransferId, pos: SeekFrom) -> SeekFlow;
}

/// 传输引擎
pub trait TransportEngine {
    /// 订阅一个传输
    fn add_transfer(&mut self, id: TransferId) -> Result<(), EngineCode>;
    /// 取消订阅一个传输；未订阅的标识视为成功
    fn remove_transfer(&mut self, id: TransferId) -> Result<(), EngineCode>;
    /// 下发传输选项
    fn configure(&mut self, id: TransferId, options: &[TransferOption]) -> Result<(), EngineCode>;
    /// 非阻塞推进一次，返回仍活跃的传输数
    fn step(&mut self, io: &mut dyn DataPath) -> Result<usize, EngineCode>;
    /// 引擎期望的最长等待时间，`None` 表示无偏好
    fn max_wait(&self) -> Result<Option<Duration>, EngineCode>;
    /// 当前需要等待的描述符
    fn readiness_sets(&self) -> Result<ReadinessSets, EngineCode>;
    /// 取出所有已完成事件，按引擎报告顺序
    fn drain_completion_events(&mut self) -> Vec<CompletionEvent>;
    /// 查询传输完成后的信息
    fn transfer_info(&self, id: TransferId) -> Option<TransferInfo>;
}
