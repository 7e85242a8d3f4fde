//! 单个传输句柄
//! 持有生命周期回调、缓冲区引用、最近完成码以及延迟异常槽

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::io::SeekFrom;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use tracing::{debug, warn};

use super::buffer::{addr, SharedRx, SharedTx};
use super::strategy::Strategy;
use crate::common::error::{HookError, ProtocolError, TransferError};
use crate::engine::{
    EngineCode, Flow, SeekFlow, TransferCode, TransferId, TransferInfo, TransferOption,
    TransportEngine,
};

/// 共享的传输句柄，注册表与调用方共同持有
pub type SharedTransfer = Rc<RefCell<TransferHandle>>;

/// 完成 / 超时回调
pub type DoneCallback = Rc<dyn Fn()>;
/// 句柄级错误回调
pub type ErrorCallback = Rc<dyn Fn(&TransferError)>;
/// 数据观察钩子，返回 `Ok(false)` 中止传输
pub type DataHook = Rc<dyn Fn(&[u8]) -> Result<bool, HookError>>;
/// 状态码钩子，返回 `false` 中止传输
pub type StatusCallback = Rc<dyn Fn(u16) -> bool>;
/// 协议错误回调
pub type ProtocolErrorCallback = Rc<dyn Fn(&ProtocolError)>;

/// 默认 User-Agent
pub fn default_user_agent() -> String {
    format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}

/// 完成结果分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

/// 句柄状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Idle,
    Initialized,
    Running,
    Completed(Outcome),
    Removed,
}

/// 协议层设置，由协议原型覆盖
#[derive(Clone)]
pub struct ProtocolSettings {
    pub user_agent: Option<String>,
    pub status_callback: Option<StatusCallback>,
    pub error_callback: Option<ProtocolErrorCallback>,
    /// 4xx / 5xx 状态码是否作为错误抛出
    pub throw_protocol_errors: bool,
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            user_agent: Some(default_user_agent()),
            status_callback: None,
            error_callback: None,
            throw_protocol_errors: true,
        }
    }
}

/// 钩子中捕获的延迟异常
pub(crate) enum Fault {
    Error(HookError),
    Panic(Box<dyn Any + Send + 'static>),
}

/// 传输句柄
pub struct TransferHandle {
    id: TransferId,
    state: TransferState,
    /// 目标地址
    pub url: String,
    /// 句柄自身的额外引擎选项，最后下发
    pub options: Vec<TransferOption>,
    /// 请求头
    pub headers: Vec<(String, String)>,
    /// 原型提供的默认选项，最先下发
    pub default_options: Vec<TransferOption>,
    pub done_callback: Option<DoneCallback>,
    pub timeout_callback: Option<DoneCallback>,
    pub error_callback: Option<ErrorCallback>,
    /// 非成功完成码是否作为错误抛出（超时除外）
    pub throw_transfer_errors: bool,
    pub on_receive: Option<DataHook>,
    pub on_transmit: Option<DataHook>,
    pub protocol: ProtocolSettings,
    strategy: Strategy,
    rx: Option<SharedRx>,
    tx: Option<SharedTx>,
    last_result: Option<TransferCode>,
    fault: Option<Fault>,
    response_headers: Vec<String>,
    header_block: String,
    status: Option<u16>,
    effective_url: Option<String>,
    bytes_received: u64,
    bytes_sent: u64,
}

impl TransferHandle {
    /// 创建句柄，同时分配新的传输标识
    pub fn new(strategy: Strategy) -> Self {
        Self {
            id: TransferId::new(),
            state: TransferState::Idle,
            url: String::new(),
            options: Vec::new(),
            headers: Vec::new(),
            default_options: Vec::new(),
            done_callback: None,
            timeout_callback: None,
            error_callback: None,
            throw_transfer_errors: true,
            on_receive: None,
            on_transmit: None,
            protocol: ProtocolSettings::default(),
            strategy,
            rx: None,
            tx: None,
            last_result: None,
            fault: None,
            response_headers: Vec::new(),
            header_block: String::new(),
            status: None,
            effective_url: None,
            bytes_received: 0,
            bytes_sent: 0,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// 转为共享句柄
    pub fn into_shared(self) -> SharedTransfer {
        Rc::new(RefCell::new(self))
    }

    pub fn id(&self) -> TransferId {
        self.id
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: TransferState) {
        self.state = state;
    }

    pub fn strategy(&self) -> &Strategy {
        &self.strategy
    }

    /// 设置接收缓冲区，注册期间地址必须保持不变
    pub fn set_receive(&mut self, rx: SharedRx) {
        self.rx = Some(rx);
    }

    /// 设置发送缓冲区，注册期间地址必须保持不变
    pub fn set_transmit(&mut self, tx: SharedTx) {
        self.tx = Some(tx);
    }

    pub fn receive_buffer(&self) -> Option<&SharedRx> {
        self.rx.as_ref()
    }

    pub fn transmit_buffer(&self) -> Option<&SharedTx> {
        self.tx.as_ref()
    }

    pub(crate) fn rx_addr(&self) -> Option<*const ()> {
        self.rx.as_ref().map(addr)
    }

    pub(crate) fn tx_addr(&self) -> Option<*const ()> {
        self.tx.as_ref().map(addr)
    }

    /// 发送缓冲区的已知大小
    pub fn transmit_size(&self) -> Option<u64> {
        let tx = self.tx.as_ref()?;
        let size = tx.try_borrow().ok()?.size();
        size
    }

    /// 最近一次完成码
    pub fn last_result(&self) -> Option<TransferCode> {
        self.last_result
    }

    /// 最近一次响应的状态码
    pub fn status(&self) -> Option<u16> {
        self.status
    }

    /// 重定向后的最终地址
    pub fn effective_url(&self) -> Option<&str> {
        self.effective_url.as_deref()
    }

    /// 已结束的响应头块，每个重定向一块
    pub fn response_headers(&self) -> &[String] {
        &self.response_headers
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// 是否存有延迟异常
    pub fn has_fault(&self) -> bool {
        self.fault.is_some()
    }

    pub(crate) fn take_fault(&mut self) -> Option<Fault> {
        self.fault.take()
    }

    /// 组装下发给引擎的选项：默认选项、地址、UA、请求头、策略选项、句柄选项
    pub fn build_options(&self) -> Vec<TransferOption> {
        let mut opts = self.default_options.clone();
        if !self.url.is_empty() {
            opts.push(TransferOption::Url(self.url.clone()));
        }
        if let Some(agent) = &self.protocol.user_agent {
            opts.push(TransferOption::UserAgent(agent.clone()));
        }
        for (name, value) in &self.headers {
            opts.push(TransferOption::Header {
                name: name.clone(),
                value: value.clone(),
            });
        }
        self.strategy.init(self, &mut opts);
        opts.extend(self.options.iter().cloned());
        opts
    }

    /// Init：清空上次运行的痕迹并下发选项，可重复调用
    pub fn init<E: TransportEngine + ?Sized>(&mut self, engine: &mut E) -> Result<(), EngineCode> {
        self.fault = None;
        self.last_result = None;
        self.status = None;
        self.effective_url = None;
        self.response_headers.clear();
        self.header_block.clear();
        self.bytes_received = 0;
        self.bytes_sent = 0;

        let opts = self.build_options();
        engine.configure(self.id, &opts)?;
        self.state = TransferState::Initialized;
        debug!(transfer = %self.id, options = opts.len(), "Transfer initialized");
        Ok(())
    }

    /// Exit：写入最终状态，触发完成或超时回调，再检查协议状态码
    ///
    /// 回调在释放句柄借用之后调用，回调内部可以再次借用同一个句柄。
    pub(crate) fn exit(
        this: &SharedTransfer,
        code: TransferCode,
        info: Option<TransferInfo>,
    ) -> Result<(), ProtocolError> {
        let exit_hook = {
            let mut handle = this.borrow_mut();
            handle.last_result = Some(code);
            if let Some(info) = info {
                handle.effective_url = info.effective_url;
                if info.status.is_some() {
                    handle.status = info.status;
                }
            }
            handle.state = TransferState::Completed(if code.is_ok() {
                Outcome::Success
            } else {
                Outcome::Failure
            });
            handle.strategy.exit_hook()
        };

        if let Some(exit) = exit_hook {
            exit(&mut *this.borrow_mut());
        }

        let (id, status, done, timeout, protocol) = {
            let handle = this.borrow();
            (
                handle.id,
                handle.status,
                handle.done_callback.clone(),
                handle.timeout_callback.clone(),
                handle.protocol.clone(),
            )
        };

        if code.is_ok() {
            if let Some(done) = done {
                done();
            }
        } else if code.is_timeout() {
            if let Some(timeout) = timeout {
                timeout();
            }
        }

        match status {
            Some(status) if code.is_ok() && status >= 400 => {
                let err = ProtocolError::new(id, status);
                warn!(transfer = %id, status, "Transfer finished with error status");
                if let Some(callback) = protocol.error_callback {
                    callback(&err);
                }
                if protocol.throw_protocol_errors {
                    return Err(err);
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// 以失败结束本轮，不触发任何回调
    pub(crate) fn abandon(&mut self, code: TransferCode) {
        self.last_result = Some(code);
        self.state = TransferState::Completed(Outcome::Failure);
    }

    /// 回到 Idle：清空回调与设置，保留标识、策略与缓冲区
    pub fn reset(&mut self) {
        self.state = TransferState::Idle;
        self.url.clear();
        self.options.clear();
        self.headers.clear();
        self.default_options.clear();
        self.done_callback = None;
        self.timeout_callback = None;
        self.error_callback = None;
        self.throw_transfer_errors = true;
        self.on_receive = None;
        self.on_transmit = None;
        self.protocol = ProtocolSettings::default();
        self.last_result = None;
        self.fault = None;
        self.response_headers.clear();
        self.header_block.clear();
        self.status = None;
        self.effective_url = None;
        self.bytes_received = 0;
        self.bytes_sent = 0;
    }

    /// 引擎投递响应体
    pub(crate) fn deliver(&mut self, chunk: &[u8]) -> Flow {
        self.guarded(Flow::Abort, |h| {
            if let Some(hook) = h.on_receive.clone() {
                if !hook(chunk)? {
                    return Ok(Flow::Abort);
                }
            }
            let written = match &h.rx {
                Some(rx) => rx.try_borrow_mut()?.write_chunk(chunk)?,
                None => chunk.len(),
            };
            h.bytes_received += written as u64;
            Ok(Flow::Proceed(written))
        })
    }

    /// 引擎投递一行响应头
    pub(crate) fn deliver_header(&mut self, line: &[u8]) -> Flow {
        self.guarded(Flow::Abort, |h| {
            let text = String::from_utf8_lossy(line);
            if text == "\r\n" || text == "\n" {
                let block = std::mem::take(&mut h.header_block);
                h.response_headers.push(block);
                return Ok(Flow::Proceed(line.len()));
            }

            if let Some(status) = parse_status_line(&text) {
                h.status = Some(status);
                if let Some(callback) = h.protocol.status_callback.clone() {
                    if !callback(status) {
                        debug!(transfer = %h.id, status, "Status callback aborted transfer");
                        return Ok(Flow::Abort);
                    }
                }
            }
            h.header_block.push_str(&text);
            Ok(Flow::Proceed(line.len()))
        })
    }

    /// 引擎拉取上传数据
    pub(crate) fn supply(&mut self, out: &mut [u8]) -> Flow {
        self.guarded(Flow::Abort, |h| {
            let read = match &h.tx {
                Some(tx) => tx.try_borrow_mut()?.read_chunk(out)?,
                None => 0,
            };
            let read = read.min(out.len());
            if let Some(hook) = h.on_transmit.clone() {
                if !hook(&out[..read])? {
                    return Ok(Flow::Abort);
                }
            }
            h.bytes_sent += read as u64;
            Ok(Flow::Proceed(read))
        })
    }

    /// 引擎请求重新定位上传数据
    pub(crate) fn seek(&mut self, pos: SeekFrom) -> SeekFlow {
        self.guarded(SeekFlow::Fail, |h| {
            let flow = match &h.tx {
                Some(tx) => tx.try_borrow_mut()?.seek_to(pos)?,
                None => SeekFlow::CantSeek,
            };
            Ok(flow)
        })
    }

    /// 在引擎调用边界执行钩子：错误与 panic 都被截获存入延迟异常槽，向引擎返回中止值
    fn guarded<T>(&mut self, abort: T, f: impl FnOnce(&mut Self) -> Result<T, HookError>) -> T {
        match panic::catch_unwind(AssertUnwindSafe(|| f(&mut *self))) {
            Ok(Ok(value)) => value,
            Ok(Err(err)) => {
                warn!(transfer = %self.id, error = %err, "Callback raised an error");
                self.capture(Fault::Error(err));
                abort
            }
            Err(payload) => {
                warn!(transfer = %self.id, "Callback panicked");
                self.capture(Fault::Panic(payload));
                abort
            }
        }
    }

    /// 只保留第一个异常
    fn capture(&mut self, fault: Fault) {
        if self.fault.is_none() {
            self.fault = Some(fault);
        }
    }
}

impl fmt::Debug for TransferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferHandle")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("url", &self.url)
            .field("strategy", &self.strategy)
            .field("last_result", &self.last_result)
            .field("status", &self.status)
            .field("has_fault", &self.fault.is_some())
            .finish()
    }
}

impl Default for TransferHandle {
    fn default() -> Self {
        Self::new(Strategy::default())
    }
}

/// 解析 `HTTP/x y reason` 形式的状态行
fn parse_status_line(line: &str) -> Option<u16> {
    if !line.starts_with("HTTP/") {
        return None;
    }
    line.split_whitespace().nth(1)?.parse().ok()
}
