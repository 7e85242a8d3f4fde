//! 请求管理器
//! 在多路复用器之上持有类型擦除的缓冲区与托管句柄，它们的生命周期与注册一一对应

use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use tracing::debug;

use super::multiplexer::{CompletionCallback, Reactor};
use crate::common::error::Result;
use crate::config::ReactorConfig;
use crate::engine::{PollWaiter, TransportEngine, Waiter};
use crate::transfer::buffer::{addr, ReceiveBuffer, SharedRx, SharedTx, TransmitBuffer};
use crate::transfer::handle::{SharedTransfer, TransferHandle};
use crate::transfer::prototype::ProtocolPrototype;
use crate::transfer::strategy::{Method, Strategy};

/// 请求管理器
pub struct RequestManager<E: TransportEngine, W: Waiter = PollWaiter> {
    reactor: Reactor<E, W>,
    /// 构造句柄后、注册前应用的协议原型
    pub protocol_prototype: ProtocolPrototype,
    /// 托管的接收缓冲区
    rx_buffers: Vec<SharedRx>,
    /// 托管的发送缓冲区
    tx_buffers: Vec<SharedTx>,
    /// 托管句柄
    handles: Vec<SharedTransfer>,
}

impl<E: TransportEngine> RequestManager<E, PollWaiter> {
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> E + 'static,
    {
        Self::with_waiter(factory, PollWaiter)
    }
}

impl<E: TransportEngine, W: Waiter> RequestManager<E, W> {
    pub fn with_waiter<F>(factory: F, waiter: W) -> Self
    where
        F: Fn() -> E + 'static,
    {
        let mut reactor = Reactor::with_waiter(factory, waiter);
        reactor.track_auto_removed(true);
        Self {
            reactor,
            protocol_prototype: ProtocolPrototype::default(),
            rx_buffers: Vec::new(),
            tx_buffers: Vec::new(),
            handles: Vec::new(),
        }
    }

    /// 应用配置
    pub fn with_config(mut self, config: &ReactorConfig) -> Self {
        self.reactor = self.reactor.with_config(config);
        self.protocol_prototype.user_agent = config.user_agent.clone();
        self
    }

    pub fn reactor(&self) -> &Reactor<E, W> {
        &self.reactor
    }

    pub fn reactor_mut(&mut self) -> &mut Reactor<E, W> {
        &mut self.reactor
    }

    /// 创建托管的接收缓冲区，在所属句柄被移除前一直有效
    pub fn make_rx_buffer<T: ReceiveBuffer + 'static>(&mut self, value: T) -> Rc<RefCell<T>> {
        let buffer = Rc::new(RefCell::new(value));
        self.rx_buffers.push(buffer.clone());
        buffer
    }

    /// 创建托管的发送缓冲区，在所属句柄被移除前一直有效
    pub fn make_tx_buffer<T: TransmitBuffer + 'static>(&mut self, value: T) -> Rc<RefCell<T>> {
        let buffer = Rc::new(RefCell::new(value));
        self.tx_buffers.push(buffer.clone());
        buffer
    }

    pub fn register(&mut self, handle: &SharedTransfer) -> Result<()> {
        self.reactor.register(handle)
    }

    pub fn register_with_callback<F>(&mut self, handle: &SharedTransfer, callback: F) -> Result<()>
    where
        F: Fn(&SharedTransfer) + 'static,
    {
        self.reactor.register_with_callback(handle, callback)
    }

    /// 注销句柄并释放其托管资源
    pub fn remove(&mut self, handle: &SharedTransfer) -> Result<bool> {
        let removed = self.reactor.remove(handle)?;
        self.release(handle);
        Ok(removed)
    }

    /// 释放托管句柄，以及地址与句柄缓冲区一致的托管缓冲区（每个集合至多一个）
    fn release(&mut self, handle: &SharedTransfer) {
        if let Some(pos) = self.handles.iter().position(|h| Rc::ptr_eq(h, handle)) {
            self.handles.remove(pos);
        }

        let (id, rx, tx) = {
            let h = handle.borrow();
            (h.id(), h.rx_addr(), h.tx_addr())
        };
        if let Some(rx) = rx {
            if let Some(pos) = self.rx_buffers.iter().position(|b| addr(b) == rx) {
                self.rx_buffers.remove(pos);
                debug!(transfer = %id, "Managed receive buffer released");
            }
        }
        if let Some(tx) = tx {
            if let Some(pos) = self.tx_buffers.iter().position(|b| addr(b) == tx) {
                self.tx_buffers.remove(pos);
                debug!(transfer = %id, "Managed transmit buffer released");
            }
        }
    }

    /// 执行驱动循环，随后释放被自动移除句柄的托管资源
    ///
    /// 钩子中的 panic 在释放完成后原样继续传播。
    pub fn run(&mut self) -> Result<()> {
        let reactor = &mut self.reactor;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| reactor.run()));
        for handle in self.reactor.drain_auto_removed() {
            self.release(&handle);
        }
        match outcome {
            Ok(result) => result,
            Err(payload) => panic::resume_unwind(payload),
        }
    }

    /// 重置多路复用器并丢弃所有托管资源
    pub fn reset(&mut self) {
        self.reactor.reset();
        self.handles.clear();
        self.rx_buffers.clear();
        self.tx_buffers.clear();
        self.protocol_prototype = ProtocolPrototype::default();
    }

    pub fn reuse(&mut self, handle: &SharedTransfer) -> Result<()> {
        self.reactor.reuse(handle)
    }

    pub fn reuse_all(&mut self) -> Result<()> {
        self.reactor.reuse_all()
    }

    /// 构造、注册并托管一个请求
    pub fn request(
        &mut self,
        method: Method,
        url: impl Into<String>,
        rx: Option<SharedRx>,
        tx: Option<SharedTx>,
    ) -> Result<SharedTransfer> {
        self.submit(method, url.into(), rx, tx, None)
    }

    /// 同 `request`，附带该次注册专属的完成回调
    pub fn request_with_callback<F>(
        &mut self,
        method: Method,
        url: impl Into<String>,
        rx: Option<SharedRx>,
        tx: Option<SharedTx>,
        callback: F,
    ) -> Result<SharedTransfer>
    where
        F: Fn(&SharedTransfer) + 'static,
    {
        self.submit(method, url.into(), rx, tx, Some(Rc::new(callback)))
    }

    fn submit(
        &mut self,
        method: Method,
        url: String,
        rx: Option<SharedRx>,
        tx: Option<SharedTx>,
        on_complete: Option<CompletionCallback>,
    ) -> Result<SharedTransfer> {
        let mut handle = TransferHandle::new(Strategy::for_method(method)).with_url(url);
        if let Some(rx) = rx {
            handle.set_receive(rx);
        }
        if let Some(tx) = tx {
            handle.set_transmit(tx);
        }
        self.protocol_prototype.apply(&mut handle);

        let shared = handle.into_shared();
        if let Err(err) = self.reactor.register_entry(&shared, on_complete) {
            // 注册失败时一并释放为它创建的托管缓冲区
            self.release(&shared);
            return Err(err);
        }
        self.handles.push(shared.clone());
        Ok(shared)
    }

    pub fn get(&mut self, url: impl Into<String>, rx: SharedRx) -> Result<SharedTransfer> {
        self.request(Method::Get, url, Some(rx), None)
    }

    pub fn head(&mut self, url: impl Into<String>) -> Result<SharedTransfer> {
        self.request(Method::Head, url, None, None)
    }

    pub fn post(
        &mut self,
        url: impl Into<String>,
        rx: SharedRx,
        tx: SharedTx,
    ) -> Result<SharedTransfer> {
        self.request(Method::Post, url, Some(rx), Some(tx))
    }

    pub fn put(
        &mut self,
        url: impl Into<String>,
        rx: SharedRx,
        tx: SharedTx,
    ) -> Result<SharedTransfer> {
        self.request(Method::Put, url, Some(rx), Some(tx))
    }

    pub fn patch(
        &mut self,
        url: impl Into<String>,
        rx: SharedRx,
        tx: SharedTx,
    ) -> Result<SharedTransfer> {
        self.request(Method::Patch, url, Some(rx), Some(tx))
    }

    pub fn delete(&mut self, url: impl Into<String>, rx: SharedRx) -> Result<SharedTransfer> {
        self.request(Method::Delete, url, Some(rx), None)
    }

    pub fn options(&mut self, url: impl Into<String>, rx: SharedRx) -> Result<SharedTransfer> {
        self.request(Method::Options, url, Some(rx), None)
    }

    pub fn trace(&mut self, url: impl Into<String>, rx: SharedRx) -> Result<SharedTransfer> {
        self.request(Method::Trace, url, Some(rx), None)
    }

    /// 托管的接收缓冲区数
    pub fn rx_buffer_count(&self) -> usize {
        self.rx_buffers.len()
    }

    /// 托管的发送缓冲区数
    pub fn tx_buffer_count(&self) -> usize {
        self.tx_buffers.len()
    }

    /// 托管句柄数
    pub fn managed_count(&self) -> usize {
        self.handles.len()
    }

    /// 已注册的传输数
    pub fn len(&self) -> usize {
        self.reactor.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reactor.is_empty()
    }
}
