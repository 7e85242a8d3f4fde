//! 多路复用器
//! 持有引擎上下文与注册表，执行阻塞驱动循环，分发完成事件并执行自动移除策略

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io::SeekFrom;
use std::mem;
use std::panic;
use std::rc::Rc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace, warn};

use crate::common::error::{
    CallbackError, EngineCode, ErrorCode, Result, SetupError, TransferError,
};
use crate::common::stats::ReactorStats;
use crate::config::{ReactorConfig, DEFAULT_FALLBACK_WAIT_MS, DEFAULT_WAIT_CEILING_MS};
use crate::engine::{
    CompletionEvent, DataPath, Flow, PollWaiter, SeekFlow, TransferId, TransportEngine, Waiter,
};
use crate::transfer::handle::{Fault, SharedTransfer, TransferHandle, TransferState};
use crate::transfer::prototype::Prototype;

/// 全局错误回调，引擎错误与传输错误都会经过这里
pub type GlobalErrorCallback = Rc<dyn Fn(&ErrorCode)>;
/// 完成回调，收到的是共享句柄本身，回调内可以再次借用
pub type CompletionCallback = Rc<dyn Fn(&SharedTransfer)>;

/// 自动移除策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AutoRemove {
    /// 保持注册
    #[default]
    #[serde(rename = "none")]
    None,
    /// 失败时移除
    #[serde(rename = "remove_failed")]
    RemoveOnFailure,
    /// 成功时移除
    #[serde(rename = "remove_success")]
    RemoveOnSuccess,
    /// 总是移除
    #[serde(rename = "remove_all")]
    RemoveAll,
}

impl AutoRemove {
    /// 按完成分类判断是否移除
    pub fn should_remove(&self, failed: bool) -> bool {
        match self {
            AutoRemove::None => false,
            AutoRemove::RemoveAll => true,
            AutoRemove::RemoveOnFailure => failed,
            AutoRemove::RemoveOnSuccess => !failed,
        }
    }
}

/// 注册表条目
struct Registration {
    handle: SharedTransfer,
    on_complete: Option<CompletionCallback>,
}

/// 引擎推进期间的数据通路分发器，按传输标识把回调路由到句柄
struct Dispatch<'a> {
    registry: &'a HashMap<TransferId, Registration>,
}

impl Dispatch<'_> {
    fn route<T>(&self, id: TransferId, abort: T, f: impl FnOnce(&mut TransferHandle) -> T) -> T {
        let entry = match self.registry.get(&id) {
            Some(entry) => entry,
            None => {
                trace!(transfer = %id, "Data path call for unregistered transfer");
                return abort;
            }
        };
        match entry.handle.try_borrow_mut() {
            Ok(mut handle) => f(&mut *handle),
            Err(_) => {
                warn!(transfer = %id, "Transfer handle busy during engine step");
                abort
            }
        }
    }
}

impl DataPath for Dispatch<'_> {
    fn receive(&mut self, id: TransferId, chunk: &[u8]) -> Flow {
        self.route(id, Flow::Abort, |h| h.deliver(chunk))
    }

    fn receive_header(&mut self, id: TransferId, line: &[u8]) -> Flow {
        self.route(id, Flow::Abort, |h| h.deliver_header(line))
    }

    fn transmit(&mut self, id: TransferId, out: &mut [u8]) -> Flow {
        self.route(id, Flow::Abort, |h| h.supply(out))
    }

    fn seek(&mut self, id: TransferId, pos: SeekFrom) -> SeekFlow {
        self.route(id, SeekFlow::Fail, |h| h.seek(pos))
    }
}

/// 多路复用器
pub struct Reactor<E: TransportEngine, W: Waiter = PollWaiter> {
    engine: E,
    factory: Box<dyn Fn() -> E>,
    waiter: W,
    registry: HashMap<TransferId, Registration>,
    /// 注册顺序，Init 按此顺序执行
    order: Vec<TransferId>,
    /// 已从引擎取出、尚未分发的完成事件
    pending: VecDeque<CompletionEvent>,
    /// 本轮被自动移除的句柄，仅在 `track_auto_removed` 打开时记录
    auto_removed: Vec<SharedTransfer>,
    track_auto_removed: bool,
    /// 注册时应用的原型
    pub prototype: Prototype,
    /// 全局错误回调
    pub error_callback: Option<GlobalErrorCallback>,
    /// 全局完成回调
    pub done_callback: Option<CompletionCallback>,
    /// 自动移除策略
    pub auto_remove: AutoRemove,
    /// 引擎错误是否抛出
    pub throw_setup_errors: bool,
    wait_ceiling: Duration,
    fallback_wait: Duration,
    stats: ReactorStats,
}

impl<E: TransportEngine> Reactor<E, PollWaiter> {
    /// 创建多路复用器，`factory` 在创建和 `reset` 时生成新的引擎上下文
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> E + 'static,
    {
        Self::with_waiter(factory, PollWaiter)
    }
}

impl<E: TransportEngine, W: Waiter> Reactor<E, W> {
    /// 使用自定义的就绪等待
    pub fn with_waiter<F>(factory: F, waiter: W) -> Self
    where
        F: Fn() -> E + 'static,
    {
        let engine = factory();
        Self {
            engine,
            factory: Box::new(factory),
            waiter,
            registry: HashMap::new(),
            order: Vec::new(),
            pending: VecDeque::new(),
            auto_removed: Vec::new(),
            track_auto_removed: false,
            prototype: Prototype::default(),
            error_callback: None,
            done_callback: None,
            auto_remove: AutoRemove::None,
            throw_setup_errors: true,
            wait_ceiling: Duration::from_millis(DEFAULT_WAIT_CEILING_MS),
            fallback_wait: Duration::from_millis(DEFAULT_FALLBACK_WAIT_MS),
            stats: ReactorStats::default(),
        }
    }

    /// 应用配置
    pub fn with_config(mut self, config: &ReactorConfig) -> Self {
        self.wait_ceiling = config.wait_ceiling();
        self.fallback_wait = config.fallback_wait();
        self.auto_remove = config.auto_remove;
        self.throw_setup_errors = config.throw_setup_errors;
        self.prototype.throw_transfer_errors = config.throw_transfer_errors;
        self
    }

    pub fn wait_ceiling(&self) -> Duration {
        self.wait_ceiling
    }

    pub fn set_wait_ceiling(&mut self, ceiling: Duration) {
        self.wait_ceiling = ceiling;
    }

    pub fn fallback_wait(&self) -> Duration {
        self.fallback_wait
    }

    pub fn set_fallback_wait(&mut self, wait: Duration) {
        self.fallback_wait = wait;
    }

    /// 注册传输
    pub fn register(&mut self, handle: &SharedTransfer) -> Result<()> {
        self.register_entry(handle, None)
    }

    /// 注册传输并附带该次注册专属的完成回调
    pub fn register_with_callback<F>(&mut self, handle: &SharedTransfer, callback: F) -> Result<()>
    where
        F: Fn(&SharedTransfer) + 'static,
    {
        self.register_entry(handle, Some(Rc::new(callback)))
    }

    pub(crate) fn register_entry(
        &mut self,
        handle: &SharedTransfer,
        on_complete: Option<CompletionCallback>,
    ) -> Result<()> {
        let id = handle.borrow().id();
        let added = if self.registry.contains_key(&id) {
            Err(EngineCode::AddedAlready)
        } else {
            self.engine.add_transfer(id)
        };

        // 订阅失败总是抛出
        if let Err(code) = added {
            let err = SetupError::new("add_transfer", code);
            warn!(transfer = %id, code = %err.code, "Engine rejected transfer");
            self.report(&err.code);
            return Err(err.into());
        }

        {
            let mut handle = handle.borrow_mut();
            self.prototype.apply(&mut handle);
            handle.set_state(TransferState::Idle);
        }
        self.registry.insert(
            id,
            Registration {
                handle: handle.clone(),
                on_complete,
            },
        );
        self.order.push(id);
        self.stats.registered += 1;
        info!(transfer = %id, "Transfer registered");
        Ok(())
    }

    /// 注销传输，未注册时什么也不做；返回是否确实移除了条目
    pub fn remove(&mut self, handle: &SharedTransfer) -> Result<bool> {
        let id = handle.borrow().id();
        Ok(self.remove_id(id)?.is_some())
    }

    pub(crate) fn remove_id(&mut self, id: TransferId) -> Result<Option<SharedTransfer>> {
        if !self.registry.contains_key(&id) {
            return Ok(None);
        }

        let result = self.engine.remove_transfer(id);
        self.check("remove_transfer", result)?;

        let entry = match self.registry.remove(&id) {
            Some(entry) => entry,
            None => return Ok(None),
        };
        self.order.retain(|other| *other != id);
        self.pending.retain(|event| event.id != id);
        if let Ok(mut handle) = entry.handle.try_borrow_mut() {
            handle.set_state(TransferState::Removed);
        }
        self.stats.removed += 1;
        info!(transfer = %id, "Transfer removed");
        Ok(Some(entry.handle))
    }

    /// 阻塞驱动循环，直到没有活跃传输
    pub fn run(&mut self) -> Result<()> {
        self.auto_removed.clear();
        self.stats.run_started();
        info!(transfers = self.registry.len(), "Drive loop started");

        let result = self.drive();

        self.stats.run_finished();
        match &result {
            Ok(()) => info!("Drive loop finished"),
            Err(err) => warn!(error = %err, "Drive loop aborted"),
        }
        result
    }

    fn drive(&mut self) -> Result<()> {
        self.init_all()?;

        // 首次推进失败且不抛出时，按全部注册传输仍然活跃处理
        let mut active = self.step_engine(self.registry.len())?;
        self.process_events()?;

        while active > 0 {
            let timeout = self.next_timeout()?;
            let sets = {
                let result = self.engine.readiness_sets();
                self.check("readiness_sets", result)?.unwrap_or_default()
            };

            let ready = if sets.is_empty() {
                self.waiter.wait(&sets, self.fallback_wait)?
            } else {
                self.waiter.wait(&sets, timeout)?
            };
            trace!(ready, active, "Readiness wait returned");

            active = self.step_engine(active)?;
            self.process_events()?;
        }
        Ok(())
    }

    /// 对所有注册的句柄执行 Init
    fn init_all(&mut self) -> Result<()> {
        for id in self.order.clone() {
            let handle = match self.registry.get(&id) {
                Some(entry) => entry.handle.clone(),
                None => continue,
            };
            let result = handle.borrow_mut().init(&mut self.engine);
            if self.check("configure", result)?.is_some() {
                handle.borrow_mut().set_state(TransferState::Running);
            }
        }
        Ok(())
    }

    fn step_engine(&mut self, previous: usize) -> Result<usize> {
        let result = {
            let mut io = Dispatch {
                registry: &self.registry,
            };
            self.engine.step(&mut io)
        };
        Ok(self.check("step", result)?.unwrap_or(previous))
    }

    /// 本轮等待时长：引擎期望值与上限取小
    fn next_timeout(&mut self) -> Result<Duration> {
        let result = self.engine.max_wait();
        let wanted = self.check("max_wait", result)?.flatten();
        Ok(match wanted {
            Some(wait) => wait.min(self.wait_ceiling),
            None => self.wait_ceiling,
        })
    }

    /// 取出完成事件逐个分发；分发中途抛出时，剩余事件留到下一次驱动
    fn process_events(&mut self) -> Result<()> {
        let drained = self.engine.drain_completion_events();
        self.pending.extend(drained);
        while let Some(event) = self.pending.pop_front() {
            self.dispatch(event)?;
        }
        Ok(())
    }

    fn dispatch(&mut self, event: CompletionEvent) -> Result<()> {
        let CompletionEvent { id, code } = event;
        let (handle, on_complete) = match self.registry.get(&id) {
            Some(entry) => (entry.handle.clone(), entry.on_complete.clone()),
            None => {
                debug!(transfer = %id, "Completion for unregistered transfer ignored");
                return Ok(());
            }
        };

        self.stats.record_completion(code);
        let fault = {
            let mut h = handle.borrow_mut();
            self.stats.record_bytes(h.bytes_received(), h.bytes_sent());
            h.take_fault()
        };
        debug!(transfer = %id, %code, "Transfer completed");

        // 钩子异常优先于完成码
        if let Some(fault) = fault {
            self.stats.callback_exceptions += 1;
            handle.borrow_mut().abandon(code);
            self.apply_auto_remove(id, true)?;
            match fault {
                Fault::Error(source) => {
                    return Err(CallbackError {
                        transfer: id,
                        source,
                    }
                    .into())
                }
                Fault::Panic(payload) => panic::resume_unwind(payload),
            }
        }

        let failed = !code.is_ok();

        // 超时只走超时回调
        if failed && !code.is_timeout() {
            let err = TransferError::new(id, code);
            warn!(transfer = %id, %code, "Transfer failed");
            let (local, throw) = {
                let h = handle.borrow();
                (h.error_callback.clone(), h.throw_transfer_errors)
            };
            if let Some(callback) = local {
                callback(&err);
            }
            self.report(&err.code());
            if throw {
                handle.borrow_mut().abandon(code);
                self.apply_auto_remove(id, true)?;
                return Err(err.into());
            }
        }

        let info = self.engine.transfer_info(id);
        if let Err(err) = TransferHandle::exit(&handle, code, info) {
            self.apply_auto_remove(id, true)?;
            return Err(err.into());
        }

        // 回调期间不持有句柄借用
        if let Some(callback) = on_complete {
            callback(&handle);
        }
        if let Some(callback) = self.done_callback.clone() {
            callback(&handle);
        }

        self.apply_auto_remove(id, failed)
    }

    fn apply_auto_remove(&mut self, id: TransferId, failed: bool) -> Result<()> {
        if !self.auto_remove.should_remove(failed) {
            return Ok(());
        }
        if let Some(handle) = self.remove_id(id)? {
            debug!(transfer = %id, failed, "Transfer auto-removed");
            self.stats.auto_removed += 1;
            if self.track_auto_removed {
                self.auto_removed.push(handle);
            }
        }
        Ok(())
    }

    /// 记录被自动移除的句柄，供上层释放其托管资源
    pub(crate) fn track_auto_removed(&mut self, on: bool) {
        self.track_auto_removed = on;
        if !on {
            self.auto_removed.clear();
        }
    }

    /// 取走最近一次驱动中被自动移除的句柄
    pub(crate) fn drain_auto_removed(&mut self) -> Vec<SharedTransfer> {
        mem::take(&mut self.auto_removed)
    }

    /// 移除所有传输，换用新的引擎上下文，并恢复原型、回调、策略与抛出开关
    pub fn reset(&mut self) {
        for id in self.order.clone() {
            if let Err(err) = self.remove_id(id) {
                warn!(transfer = %id, error = %err, "Removal failed during reset");
            }
        }
        for (_, entry) in self.registry.drain() {
            if let Ok(mut handle) = entry.handle.try_borrow_mut() {
                handle.set_state(TransferState::Removed);
            }
        }
        self.order.clear();
        self.pending.clear();
        self.auto_removed.clear();

        self.engine = (self.factory)();
        self.prototype = Prototype::default();
        self.error_callback = None;
        self.done_callback = None;
        self.auto_remove = AutoRemove::None;
        self.throw_setup_errors = true;
        info!("Reactor reset");
    }

    /// 在引擎层重新订阅单个传输，不改动注册表
    pub fn reuse(&mut self, handle: &SharedTransfer) -> Result<()> {
        let id = handle.borrow().id();
        self.reattach(id)
    }

    /// 在引擎层重新订阅所有已注册的传输
    pub fn reuse_all(&mut self) -> Result<()> {
        for id in self.order.clone() {
            self.reattach(id)?;
        }
        Ok(())
    }

    fn reattach(&mut self, id: TransferId) -> Result<()> {
        let result = self.engine.remove_transfer(id);
        self.check("remove_transfer", result)?;
        let result = self.engine.add_transfer(id);
        self.check("add_transfer", result)?;
        debug!(transfer = %id, "Transfer reattached");
        Ok(())
    }

    /// 引擎调用检查：先回调，再按开关决定是否抛出
    fn check<T>(
        &self,
        operation: &'static str,
        result: std::result::Result<T, EngineCode>,
    ) -> Result<Option<T>> {
        match result {
            Ok(value) => Ok(Some(value)),
            Err(code) => {
                let err = SetupError::new(operation, code);
                error!(operation, code = %err.code, "Engine call failed");
                self.report(&err.code);
                if self.throw_setup_errors {
                    Err(err.into())
                } else {
                    Ok(None)
                }
            }
        }
    }

    fn report(&self, code: &ErrorCode) {
        if let Some(callback) = self.error_callback.clone() {
            callback(code);
        }
    }

    /// 已注册的传输数
    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    pub fn contains(&self, handle: &SharedTransfer) -> bool {
        self.contains_id(handle.borrow().id())
    }

    pub fn contains_id(&self, id: TransferId) -> bool {
        self.registry.contains_key(&id)
    }

    /// 按注册顺序列出已注册的句柄
    pub fn handles(&self) -> Vec<SharedTransfer> {
        self.order
            .iter()
            .filter_map(|id| self.registry.get(id))
            .map(|entry| entry.handle.clone())
            .collect()
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    pub fn stats(&self) -> &ReactorStats {
        &self.stats
    }

    pub fn stats_mut(&mut self) -> &mut ReactorStats {
        &mut self.stats
    }
}

impl<E: TransportEngine, W: Waiter> fmt::Debug for Reactor<E, W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reactor")
            .field("registered", &self.registry.len())
            .field("pending", &self.pending.len())
            .field("auto_remove", &self.auto_remove)
            .field("throw_setup_errors", &self.throw_setup_errors)
            .field("wait_ceiling", &self.wait_ceiling)
            .field("fallback_wait", &self.fallback_wait)
            .finish()
    }
}
