//! 统计信息模块
//! 跟踪驱动循环与传输完成情况

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::engine::TransferCode;

/// 多路复用器统计
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReactorStats {
    /// 累计注册数
    pub registered: u64,
    /// 累计注销数（含自动移除）
    pub removed: u64,
    /// 自动移除数
    pub auto_removed: u64,
    /// 驱动循环执行次数
    pub runs: u64,
    /// 已分发的完成事件数
    pub completed: u64,
    /// 成功完成数
    pub succeeded: u64,
    /// 失败完成数（不含超时）
    pub failed: u64,
    /// 超时完成数
    pub timed_out: u64,
    /// 回调异常数
    pub callback_exceptions: u64,
    /// 总接收字节数
    pub bytes_received: u64,
    /// 总发送字节数
    pub bytes_sent: u64,
    /// 最近一次驱动开始时间
    pub last_run_started: Option<DateTime<Utc>>,
    /// 最近一次驱动结束时间
    pub last_run_finished: Option<DateTime<Utc>>,
}

impl ReactorStats {
    pub(crate) fn run_started(&mut self) {
        self.runs += 1;
        self.last_run_started = Some(Utc::now());
    }

    pub(crate) fn run_finished(&mut self) {
        self.last_run_finished = Some(Utc::now());
    }

    /// 记录一次完成事件
    pub(crate) fn record_completion(&mut self, code: TransferCode) {
        self.completed += 1;
        if code.is_ok() {
            self.succeeded += 1;
        } else if code.is_timeout() {
            self.timed_out += 1;
        } else {
            self.failed += 1;
        }
    }

    pub(crate) fn record_bytes(&mut self, received: u64, sent: u64) {
        self.bytes_received += received;
        self.bytes_sent += sent;
    }

    /// 导出为 JSON
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// 重置统计
    pub fn reset(&mut self) {
        *self = Self::default();
        info!("Statistics reset");
    }
}
