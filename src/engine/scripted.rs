//! 脚本化传输引擎
//! 不做真实网络 I/O，按预先设定的脚本回放每个传输的数据通路与完成码，
//! 用于演练多路复用器的驱动循环与测试

use std::collections::{HashMap, HashSet, VecDeque};
use std::io::SeekFrom;
use std::time::Duration;

use tracing::{debug, trace};

use super::{
    CompletionEvent, DataPath, EngineCode, Flow, ReadinessSets, SeekFlow, TransferCode,
    TransferId, TransferInfo, TransferOption, TransportEngine,
};
use crate::common::error::{message, ErrorDomain};

/// 脚本中的单个动作，每次 `step` 执行一个
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// 投递一行响应头
    Header(Vec<u8>),
    /// 投递一段响应体
    Body(Vec<u8>),
    /// 按块从发送缓冲区拉取数据直到读完
    Upload { chunk: usize },
    /// 请求重新定位上传数据
    Seek(SeekFrom),
    /// 本轮不做任何事，保持活跃
    Idle,
}

/// 单个传输的脚本
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    steps: VecDeque<Step>,
    result: TransferCode,
    status: Option<u16>,
    effective_url: Option<String>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            steps: VecDeque::new(),
            result: TransferCode::Ok,
            status: None,
            effective_url: None,
        }
    }
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    /// 立即成功
    pub fn success() -> Self {
        Self::default()
    }

    /// 立即以给定完成码失败
    pub fn failure(code: TransferCode) -> Self {
        Self::default().finish(code)
    }

    /// 立即超时
    pub fn timeout() -> Self {
        Self::failure(TransferCode::OperationTimedOut)
    }

    pub fn header(mut self, line: impl Into<Vec<u8>>) -> Self {
        self.steps.push_back(Step::Header(line.into()));
        self
    }

    /// 投递状态行，并让引擎在完成信息中报告该状态码
    pub fn status_line(mut self, status: u16) -> Self {
        let reason = message(ErrorDomain::Http, i32::from(status));
        self.status = Some(status);
        self.header(format!("HTTP/1.1 {} {}\r\n", status, reason))
    }

    /// 结束当前响应头块
    pub fn end_headers(self) -> Self {
        self.header(&b"\r\n"[..])
    }

    pub fn body(mut self, chunk: impl Into<Vec<u8>>) -> Self {
        self.steps.push_back(Step::Body(chunk.into()));
        self
    }

    pub fn upload(mut self, chunk: usize) -> Self {
        self.steps.push_back(Step::Upload { chunk });
        self
    }

    pub fn seek(mut self, pos: SeekFrom) -> Self {
        self.steps.push_back(Step::Seek(pos));
        self
    }

    pub fn idle(mut self, ticks: usize) -> Self {
        self.steps.extend(std::iter::repeat(Step::Idle).take(ticks));
        self
    }

    /// 设置最终完成码
    pub fn finish(mut self, code: TransferCode) -> Self {
        self.result = code;
        self
    }

    /// 设置重定向后的最终地址
    pub fn redirect_to(mut self, url: impl Into<String>) -> Self {
        self.effective_url = Some(url.into());
        self
    }
}

enum Phase {
    Pending,
    Running(Script),
    Done,
}

struct Attached {
    id: TransferId,
    phase: Phase,
}

/// 脚本化引擎
#[derive(Default)]
pub struct ScriptedEngine {
    scripts: HashMap<TransferId, Script>,
    attached: Vec<Attached>,
    completed: VecDeque<CompletionEvent>,
    info: HashMap<TransferId, TransferInfo>,
    configured: HashMap<TransferId, Vec<TransferOption>>,
    uploaded: HashMap<TransferId, Vec<u8>>,
    rejected_adds: HashSet<TransferId>,
    rejected_configures: HashSet<TransferId>,
    rejected_removes: HashSet<TransferId>,
    failing_steps: usize,
    descriptors: ReadinessSets,
    max_wait: Option<Duration>,
    steps: usize,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为传输设置脚本；未设置脚本的传输在首次推进时立即成功
    pub fn script(&mut self, id: TransferId, script: Script) {
        self.scripts.insert(id, script);
    }

    /// 拒绝该传输的订阅
    pub fn reject_add(&mut self, id: TransferId) {
        self.rejected_adds.insert(id);
    }

    /// 拒绝该传输的选项下发
    pub fn reject_configure(&mut self, id: TransferId) {
        self.rejected_configures.insert(id);
    }

    /// 拒绝该传输的退订
    pub fn reject_remove(&mut self, id: TransferId) {
        self.rejected_removes.insert(id);
    }

    /// 让接下来的 n 次推进失败
    pub fn fail_next_steps(&mut self, n: usize) {
        self.failing_steps = n;
    }

    pub fn set_descriptors(&mut self, sets: ReadinessSets) {
        self.descriptors = sets;
    }

    pub fn set_max_wait(&mut self, wait: Option<Duration>) {
        self.max_wait = wait;
    }

    /// 最近一次下发给该传输的选项
    pub fn options(&self, id: TransferId) -> Option<&[TransferOption]> {
        self.configured.get(&id).map(Vec::as_slice)
    }

    /// 该传输已上传的数据
    pub fn uploaded(&self, id: TransferId) -> Option<&[u8]> {
        self.uploaded.get(&id).map(Vec::as_slice)
    }

    pub fn is_attached(&self, id: TransferId) -> bool {
        self.attached.iter().any(|a| a.id == id)
    }

    /// 已执行的推进次数
    pub fn step_count(&self) -> usize {
        self.steps
    }

    fn configured_url(&self, id: TransferId) -> Option<String> {
        self.configured.get(&id)?.iter().rev().find_map(|opt| match opt {
            TransferOption::Url(url) => Some(url.clone()),
            _ => None,
        })
    }
}

/// 执行脚本的下一个动作，返回 Some 表示传输结束
fn advance(
    id: TransferId,
    script: &mut Script,
    io: &mut dyn DataPath,
    uploaded: &mut Vec<u8>,
) -> Option<TransferCode> {
    let step = match script.steps.pop_front() {
        Some(step) => step,
        None => return Some(script.result),
    };

    match step {
        Step::Idle => None,
        Step::Header(line) => match io.receive_header(id, &line) {
            Flow::Proceed(n) if n == line.len() => None,
            _ => Some(TransferCode::WriteError),
        },
        Step::Body(chunk) => match io.receive(id, &chunk) {
            Flow::Proceed(n) if n == chunk.len() => None,
            _ => Some(TransferCode::WriteError),
        },
        Step::Upload { chunk } => {
            let mut buf = vec![0u8; chunk.max(1)];
            loop {
                match io.transmit(id, &mut buf) {
                    Flow::Proceed(0) => break None,
                    Flow::Proceed(n) => uploaded.extend_from_slice(&buf[..n.min(buf.len())]),
                    Flow::Abort => break Some(TransferCode::AbortedByCallback),
                }
            }
        }
        Step::Seek(pos) => match io.seek(id, pos) {
            SeekFlow::Ok | SeekFlow::CantSeek => None,
            SeekFlow::Fail => Some(TransferCode::ReadError),
        },
    }
}

impl TransportEngine for ScriptedEngine {
    fn add_transfer(&mut self, id: TransferId) -> Result<(), EngineCode> {
        if self.rejected_adds.contains(&id) {
            return Err(EngineCode::BadTransfer);
        }
        if self.is_attached(id) {
            return Err(EngineCode::AddedAlready);
        }
        self.attached.push(Attached {
            id,
            phase: Phase::Pending,
        });
        Ok(())
    }

    fn remove_transfer(&mut self, id: TransferId) -> Result<(), EngineCode> {
        if self.rejected_removes.contains(&id) {
            return Err(EngineCode::BadTransfer);
        }
        self.attached.retain(|a| a.id != id);
        // 已报告但未取走的完成事件随之丢弃
        self.completed.retain(|e| e.id != id);
        Ok(())
    }

    fn configure(&mut self, id: TransferId, options: &[TransferOption]) -> Result<(), EngineCode> {
        if self.rejected_configures.contains(&id) {
            return Err(EngineCode::UnknownOption);
        }
        self.configured.insert(id, options.to_vec());
        Ok(())
    }

    fn step(&mut self, io: &mut dyn DataPath) -> Result<usize, EngineCode> {
        self.steps += 1;
        if self.failing_steps > 0 {
            self.failing_steps -= 1;
            return Err(EngineCode::InternalError);
        }

        let mut finished = Vec::new();
        for slot in &mut self.attached {
            if let Phase::Pending = slot.phase {
                let script = self.scripts.get(&slot.id).cloned().unwrap_or_default();
                slot.phase = Phase::Running(script);
            }

            if let Phase::Running(script) = &mut slot.phase {
                let sink = self.uploaded.entry(slot.id).or_default();
                if let Some(code) = advance(slot.id, script, io, sink) {
                    trace!(transfer = %slot.id, %code, "Scripted transfer finished");
                    finished.push((slot.id, code, script.status, script.effective_url.take()));
                    slot.phase = Phase::Done;
                }
            }
        }

        for (id, code, status, effective_url) in finished {
            let effective_url = effective_url.or_else(|| self.configured_url(id));
            self.info.insert(id, TransferInfo { effective_url, status });
            self.completed.push_back(CompletionEvent { id, code });
        }

        let active = self
            .attached
            .iter()
            .filter(|a| !matches!(a.phase, Phase::Done))
            .count();
        debug!(active, "Scripted engine stepped");
        Ok(active)
    }

    fn max_wait(&self) -> Result<Option<Duration>, EngineCode> {
        Ok(self.max_wait)
    }

    fn readiness_sets(&self) -> Result<ReadinessSets, EngineCode> {
        Ok(self.descriptors.clone())
    }

    fn drain_completion_events(&mut self) -> Vec<CompletionEvent> {
        self.completed.drain(..).collect()
    }

    fn transfer_info(&self, id: TransferId) -> Option<TransferInfo> {
        self.info.get(&id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 记录所有回调的数据通路
    #[derive(Default)]
    struct Recorder {
        body: Vec<u8>,
        headers: Vec<Vec<u8>>,
        outgoing: Vec<u8>,
        abort_body: bool,
    }

    impl DataPath for Recorder {
        fn receive(&mut self, _id: TransferId, chunk: &[u8]) -> Flow {
            if self.abort_body {
                return Flow::Abort;
            }
            self.body.extend_from_slice(chunk);
            Flow::Proceed(chunk.len())
        }

        fn receive_header(&mut self, _id: TransferId, line: &[u8]) -> Flow {
            self.headers.push(line.to_vec());
            Flow::Proceed(line.len())
        }

        fn transmit(&mut self, _id: TransferId, out: &mut [u8]) -> Flow {
            let n = self.outgoing.len().min(out.len());
            out[..n].copy_from_slice(&self.outgoing[..n]);
            self.outgoing.drain(..n);
            Flow::Proceed(n)
        }

        fn seek(&mut self, _id: TransferId, _pos: SeekFrom) -> SeekFlow {
            SeekFlow::Fail
        }
    }

    #[test]
    fn test_unscripted_transfer_succeeds_on_first_step() {
        let mut engine = ScriptedEngine::new();
        let id = TransferId::new();
        engine.add_transfer(id).unwrap();

        let active = engine.step(&mut Recorder::default()).unwrap();
        assert_eq!(active, 0);
        assert_eq!(
            engine.drain_completion_events(),
            vec![CompletionEvent { id, code: TransferCode::Ok }]
        );
    }

    #[test]
    fn test_script_replays_data_path() {
        let mut engine = ScriptedEngine::new();
        let id = TransferId::new();
        engine.script(
            id,
            Script::new()
                .status_line(200)
                .end_headers()
                .body("hello ")
                .body("world")
                .upload(3)
                .redirect_to("https://example.net/final"),
        );
        engine.add_transfer(id).unwrap();

        let mut io = Recorder {
            outgoing: b"abcdefg".to_vec(),
            ..Recorder::default()
        };
        let mut rounds = 0;
        while engine.step(&mut io).unwrap() > 0 {
            rounds += 1;
        }

        assert_eq!(rounds, 5);
        assert_eq!(io.body, b"hello world");
        assert_eq!(io.headers.len(), 2);
        assert_eq!(engine.uploaded(id), Some(&b"abcdefg"[..]));
        let info = engine.transfer_info(id).unwrap();
        assert_eq!(info.status, Some(200));
        assert_eq!(info.effective_url.as_deref(), Some("https://example.net/final"));
    }

    #[test]
    fn test_abort_maps_to_write_error() {
        let mut engine = ScriptedEngine::new();
        let id = TransferId::new();
        engine.script(id, Script::new().body("x"));
        engine.add_transfer(id).unwrap();

        let mut io = Recorder {
            abort_body: true,
            ..Recorder::default()
        };
        engine.step(&mut io).unwrap();
        let events = engine.drain_completion_events();
        assert_eq!(events[0].code, TransferCode::WriteError);
    }

    #[test]
    fn test_failed_seek_fails_transfer() {
        let mut engine = ScriptedEngine::new();
        let id = TransferId::new();
        engine.script(id, Script::new().seek(SeekFrom::Start(0)));
        engine.add_transfer(id).unwrap();

        engine.step(&mut Recorder::default()).unwrap();
        assert_eq!(engine.drain_completion_events()[0].code, TransferCode::ReadError);
    }

    #[test]
    fn test_duplicate_and_rejected_adds() {
        let mut engine = ScriptedEngine::new();
        let id = TransferId::new();
        engine.add_transfer(id).unwrap();
        assert_eq!(engine.add_transfer(id), Err(EngineCode::AddedAlready));

        let other = TransferId::new();
        engine.reject_add(other);
        assert_eq!(engine.add_transfer(other), Err(EngineCode::BadTransfer));
    }

    #[test]
    fn test_remove_drops_pending_events() {
        let mut engine = ScriptedEngine::new();
        let id = TransferId::new();
        engine.add_transfer(id).unwrap();
        engine.step(&mut Recorder::default()).unwrap();

        engine.remove_transfer(id).unwrap();
        assert!(engine.drain_completion_events().is_empty());
        assert!(!engine.is_attached(id));
        // 未订阅的移除视为成功
        assert!(engine.remove_transfer(id).is_ok());
    }

    #[test]
    fn test_rejected_remove_keeps_transfer_attached() {
        let mut engine = ScriptedEngine::new();
        let id = TransferId::new();
        engine.add_transfer(id).unwrap();
        engine.reject_remove(id);

        assert_eq!(engine.remove_transfer(id), Err(EngineCode::BadTransfer));
        assert!(engine.is_attached(id));
    }

    #[test]
    fn test_url_falls_back_to_configured() {
        let mut engine = ScriptedEngine::new();
        let id = TransferId::new();
        engine.add_transfer(id).unwrap();
        engine
            .configure(id, &[TransferOption::Url("https://a.example/".into())])
            .unwrap();
        engine.step(&mut Recorder::default()).unwrap();

        let info = engine.transfer_info(id).unwrap();
        assert_eq!(info.effective_url.as_deref(), Some("https://a.example/"));
        assert_eq!(info.status, None);
    }
}
