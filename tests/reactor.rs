use std::cell::{Cell, RefCell};
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::time::Duration;

use transfer_mux::engine::TransferOption;
use transfer_mux::transfer::Outcome;
use transfer_mux::{
    AutoRemove, EngineCode, ErrorCode, ErrorDomain, HookError, Method, ProtocolError, Reactor,
    ReactorError, Script, ScriptedEngine, SharedTransfer, Strategy, TransferCode, TransferError,
    TransferHandle, TransferState,
};

#[derive(Debug, thiserror::Error, PartialEq)]
#[error("disk full")]
struct DiskFull;

#[derive(Debug, PartialEq)]
struct Marker(u32);

fn reactor() -> Reactor<ScriptedEngine> {
    let mut reactor = Reactor::new(ScriptedEngine::new);
    reactor.set_fallback_wait(Duration::from_millis(1));
    reactor
}

fn get(url: &str) -> SharedTransfer {
    TransferHandle::new(Strategy::for_method(Method::Get))
        .with_url(url)
        .into_shared()
}

fn scripted(reactor: &mut Reactor<ScriptedEngine>, url: &str, script: Script) -> SharedTransfer {
    let handle = get(url);
    let id = handle.borrow().id();
    reactor.engine_mut().script(id, script);
    handle
}

fn counter() -> Rc<Cell<usize>> {
    Rc::new(Cell::new(0))
}

#[test]
fn test_every_completion_fires_once() {
    let mut reactor = reactor();
    let fired = counter();
    let handles: Vec<_> = (0..5).map(|i| get(&format!("https://example.org/{}", i))).collect();
    for handle in &handles {
        let fired = fired.clone();
        reactor
            .register_with_callback(handle, move |_| fired.set(fired.get() + 1))
            .unwrap();
    }

    reactor.run().unwrap();
    assert_eq!(fired.get(), 5);
    assert_eq!(reactor.stats().completed, 5);
    assert_eq!(reactor.stats().succeeded, 5);
    assert_eq!(reactor.len(), 5);
    for handle in &handles {
        assert_eq!(
            handle.borrow().state(),
            TransferState::Completed(Outcome::Success)
        );
    }
}

#[test]
fn test_remove_all_empties_registry() {
    let mut reactor = reactor();
    reactor.auto_remove = AutoRemove::RemoveAll;
    reactor.prototype.throw_transfer_errors = false;

    let handles = vec![
        scripted(&mut reactor, "https://a.example/", Script::success()),
        scripted(&mut reactor, "https://b.example/", Script::failure(TransferCode::CouldntConnect)),
        scripted(&mut reactor, "https://c.example/", Script::timeout()),
        scripted(&mut reactor, "https://d.example/", Script::new().idle(2).body("late")),
    ];
    for handle in &handles {
        reactor.register(handle).unwrap();
    }

    reactor.run().unwrap();
    assert!(reactor.is_empty());
    assert_eq!(reactor.stats().auto_removed, 4);
    for handle in &handles {
        assert_eq!(handle.borrow().state(), TransferState::Removed);
    }
}

#[test]
fn test_remove_on_failure_keeps_successes() {
    let mut reactor = reactor();
    reactor.auto_remove = AutoRemove::RemoveOnFailure;
    reactor.prototype.throw_transfer_errors = false;

    let ok = scripted(&mut reactor, "https://ok.example/", Script::success());
    let bad = scripted(
        &mut reactor,
        "https://bad.example/",
        Script::failure(TransferCode::CouldntResolveHost),
    );
    reactor.register(&ok).unwrap();
    reactor.register(&bad).unwrap();

    reactor.run().unwrap();
    assert!(reactor.contains(&ok));
    assert!(!reactor.contains(&bad));
}

#[test]
fn test_remove_on_success_is_mirror_image() {
    let mut reactor = reactor();
    reactor.auto_remove = AutoRemove::RemoveOnSuccess;
    reactor.prototype.throw_transfer_errors = false;

    let ok = scripted(&mut reactor, "https://ok.example/", Script::success());
    let bad = scripted(
        &mut reactor,
        "https://bad.example/",
        Script::failure(TransferCode::RecvError),
    );
    reactor.register(&ok).unwrap();
    reactor.register(&bad).unwrap();

    reactor.run().unwrap();
    assert!(!reactor.contains(&ok));
    assert!(reactor.contains(&bad));
}

#[test]
fn test_hook_error_rethrown_after_auto_removal() {
    let mut reactor = reactor();
    reactor.auto_remove = AutoRemove::RemoveOnFailure;
    let completions = counter();
    let global = counter();
    let g = global.clone();
    reactor.done_callback = Some(Rc::new(move |_: &SharedTransfer| g.set(g.get() + 1)));

    let handle = scripted(&mut reactor, "https://example.org/", Script::new().body("chunk"));
    handle.borrow_mut().on_receive = Some(Rc::new(|_: &[u8]| -> Result<bool, HookError> {
        Err(DiskFull.into())
    }));
    let c = completions.clone();
    reactor
        .register_with_callback(&handle, move |_| c.set(c.get() + 1))
        .unwrap();

    let err = reactor.run().unwrap_err();
    let source = match err {
        ReactorError::Callback(err) => err.into_source(),
        other => panic!("unexpected error: {}", other),
    };
    assert_eq!(*source.downcast::<DiskFull>().unwrap(), DiskFull);

    assert_eq!(reactor.stats().auto_removed, 1);
    assert_eq!(reactor.stats().callback_exceptions, 1);
    assert!(!reactor.contains(&handle));
    assert_eq!(completions.get(), 0);
    assert_eq!(global.get(), 0);
}

#[test]
fn test_hook_panic_resumes_with_same_payload() {
    let mut reactor = reactor();
    reactor.auto_remove = AutoRemove::RemoveAll;
    let completions = counter();

    let handle = scripted(&mut reactor, "https://example.org/", Script::new().body("chunk"));
    handle.borrow_mut().on_receive = Some(Rc::new(|_: &[u8]| -> Result<bool, HookError> {
        panic::panic_any(Marker(7))
    }));
    let c = completions.clone();
    reactor
        .register_with_callback(&handle, move |_| c.set(c.get() + 1))
        .unwrap();

    let payload = panic::catch_unwind(AssertUnwindSafe(|| reactor.run())).unwrap_err();
    assert_eq!(payload.downcast_ref::<Marker>(), Some(&Marker(7)));
    assert_eq!(reactor.stats().auto_removed, 1);
    assert!(reactor.is_empty());
    assert_eq!(completions.get(), 0);
}

#[test]
fn test_hook_error_wins_over_result_code() {
    let mut reactor = reactor();
    let errors = counter();
    let e = errors.clone();
    reactor.prototype.error_callback = Some(Rc::new(move |_: &TransferError| e.set(e.get() + 1)));

    let upload = TransferHandle::new(Strategy::for_method(Method::Put))
        .with_url("https://example.org/put")
        .into_shared();
    let id = upload.borrow().id();
    reactor
        .engine_mut()
        .script(id, Script::new().upload(8).finish(TransferCode::SendError));
    upload.borrow_mut().on_transmit = Some(Rc::new(|_: &[u8]| -> Result<bool, HookError> {
        Err("quota exceeded".into())
    }));
    reactor.register(&upload).unwrap();

    assert!(matches!(reactor.run(), Err(ReactorError::Callback(_))));
    assert_eq!(errors.get(), 0);
}

#[test]
fn test_pending_events_survive_callback_exception() {
    let mut reactor = reactor();
    let completions = counter();

    let failing = scripted(&mut reactor, "https://a.example/", Script::new().body("x"));
    failing.borrow_mut().on_receive = Some(Rc::new(|_: &[u8]| -> Result<bool, HookError> {
        Err("rejected".into())
    }));
    let healthy = scripted(&mut reactor, "https://b.example/", Script::success());
    reactor.register(&failing).unwrap();
    let c = completions.clone();
    reactor
        .register_with_callback(&healthy, move |_| c.set(c.get() + 1))
        .unwrap();

    assert!(reactor.run().is_err());
    assert_eq!(completions.get(), 0);

    // 剩余事件在下一次驱动时分发
    reactor.run().unwrap();
    assert_eq!(completions.get(), 1);
}

#[test]
fn test_timeout_routes_to_timeout_hook_only() {
    for throw in [true, false] {
        let mut reactor = reactor();
        let errors = counter();
        let global_errors = counter();
        let timeouts = counter();

        let handle = scripted(
            &mut reactor,
            "https://slow.example/",
            Script::new().idle(1).finish(TransferCode::OperationTimedOut),
        );
        reactor.register(&handle).unwrap();
        {
            let mut h = handle.borrow_mut();
            h.throw_transfer_errors = throw;
            let e = errors.clone();
            h.error_callback = Some(Rc::new(move |_: &TransferError| e.set(e.get() + 1)));
            let t = timeouts.clone();
            h.timeout_callback = Some(Rc::new(move || t.set(t.get() + 1)));
        }
        let g = global_errors.clone();
        reactor.error_callback = Some(Rc::new(move |_: &ErrorCode| g.set(g.get() + 1)));

        reactor.run().unwrap();
        assert_eq!(errors.get(), 0);
        assert_eq!(global_errors.get(), 0);
        assert_eq!(timeouts.get(), 1);
        assert_eq!(reactor.stats().timed_out, 1);
    }
}

#[test]
fn test_transfer_error_raised_when_throw_flag_set() {
    let mut reactor = reactor();
    reactor.auto_remove = AutoRemove::RemoveOnFailure;
    let local = counter();
    let global = Rc::new(RefCell::new(Vec::new()));

    let handle = scripted(
        &mut reactor,
        "https://down.example/",
        Script::failure(TransferCode::CouldntConnect),
    );
    reactor.register(&handle).unwrap();
    let l = local.clone();
    handle.borrow_mut().error_callback = Some(Rc::new(move |_: &TransferError| l.set(l.get() + 1)));
    let g = global.clone();
    reactor.error_callback = Some(Rc::new(move |code: &ErrorCode| g.borrow_mut().push(*code)));

    let err = match reactor.run() {
        Err(ReactorError::Transfer(err)) => err,
        other => panic!("unexpected result: {:?}", other),
    };
    assert_eq!(err.result, TransferCode::CouldntConnect);
    assert_eq!(local.get(), 1);
    assert_eq!(*global.borrow(), vec![TransferCode::CouldntConnect.code()]);
    assert!(!reactor.contains(&handle));
}

#[test]
fn test_reset_restores_defaults() {
    let mut reactor = reactor();
    let handles: Vec<_> = (0..3).map(|i| get(&format!("https://example.org/{}", i))).collect();
    for handle in &handles {
        reactor.register(handle).unwrap();
    }
    reactor.run().unwrap();
    assert!(reactor.engine().step_count() > 0);

    reactor.auto_remove = AutoRemove::RemoveAll;
    reactor.throw_setup_errors = false;
    reactor.prototype.throw_transfer_errors = false;
    reactor.error_callback = Some(Rc::new(|_: &ErrorCode| {}));
    reactor.engine_mut().set_max_wait(Some(Duration::from_millis(3)));

    reactor.reset();
    assert!(reactor.is_empty());
    assert_eq!(reactor.auto_remove, AutoRemove::None);
    assert!(reactor.throw_setup_errors);
    assert!(reactor.prototype.throw_transfer_errors);
    assert!(reactor.error_callback.is_none());
    // 新的引擎上下文
    assert_eq!(reactor.engine().step_count(), 0);
    for handle in &handles {
        assert_eq!(handle.borrow().state(), TransferState::Removed);
    }
}

#[test]
fn test_mixed_batch_dispatch_order() {
    let mut reactor = reactor();
    let log = Rc::new(RefCell::new(Vec::new()));

    let slow = scripted(&mut reactor, "https://slow.example/", Script::new().idle(2));
    let fast = scripted(&mut reactor, "https://fast.example/", Script::success());
    let broken = scripted(
        &mut reactor,
        "https://broken.example/",
        Script::failure(TransferCode::CouldntConnect),
    );

    for (name, handle) in [("slow", &slow), ("fast", &fast), ("broken", &broken)] {
        reactor.register(handle).unwrap();
        let mut h = handle.borrow_mut();
        let done_log = log.clone();
        h.done_callback = Some(Rc::new(move || {
            done_log.borrow_mut().push(format!("done:{}", name))
        }));
        let error_log = log.clone();
        h.error_callback = Some(Rc::new(move |_: &TransferError| {
            error_log.borrow_mut().push(format!("error:{}", name))
        }));
    }
    broken.borrow_mut().throw_transfer_errors = false;

    reactor.run().unwrap();
    assert_eq!(
        *log.borrow(),
        vec!["done:fast", "error:broken", "done:slow"]
    );
}

#[test]
fn test_register_rejections_always_fail() {
    let mut reactor = reactor();
    reactor.throw_setup_errors = false;
    let reported = Rc::new(RefCell::new(Vec::new()));
    let r = reported.clone();
    reactor.error_callback = Some(Rc::new(move |code: &ErrorCode| r.borrow_mut().push(*code)));

    let rejected = get("https://example.org/");
    let id = rejected.borrow().id();
    reactor.engine_mut().reject_add(id);
    assert!(matches!(reactor.register(&rejected), Err(ReactorError::Setup(_))));

    let handle = get("https://example.org/");
    reactor.register(&handle).unwrap();
    assert!(matches!(reactor.register(&handle), Err(ReactorError::Setup(_))));

    assert_eq!(
        *reported.borrow(),
        vec![EngineCode::BadTransfer.code(), EngineCode::AddedAlready.code()]
    );
    assert_eq!(reactor.len(), 1);
}

#[test]
fn test_step_failure_reported_then_loop_continues() {
    let mut reactor = reactor();
    reactor.throw_setup_errors = false;
    let reported = counter();
    let r = reported.clone();
    reactor.error_callback = Some(Rc::new(move |code: &ErrorCode| {
        assert_eq!(code.domain, ErrorDomain::Engine);
        r.set(r.get() + 1);
    }));

    let done = counter();
    let handle = get("https://example.org/");
    let d = done.clone();
    reactor
        .register_with_callback(&handle, move |_| d.set(d.get() + 1))
        .unwrap();
    reactor.engine_mut().fail_next_steps(1);

    reactor.run().unwrap();
    assert_eq!(reported.get(), 1);
    assert_eq!(done.get(), 1);
}

#[test]
fn test_step_failure_raised_when_throw_flag_set() {
    let mut reactor = reactor();
    let handle = get("https://example.org/");
    reactor.register(&handle).unwrap();
    reactor.engine_mut().fail_next_steps(1);

    match reactor.run() {
        Err(ReactorError::Setup(err)) => {
            assert_eq!(err.operation, "step");
            assert_eq!(err.code, EngineCode::InternalError.code());
        }
        other => panic!("unexpected result: {:?}", other),
    }
}

#[test]
fn test_settings_changed_after_register_still_apply() {
    let mut reactor = reactor();
    reactor.prototype.default_options = vec![TransferOption::Timeout(Duration::from_secs(3))];
    let handle = get("https://example.org/");
    reactor.register(&handle).unwrap();

    // 原型在注册后修改不影响句柄，句柄自身的修改在驱动时生效
    reactor.prototype.default_options.clear();
    handle.borrow_mut().url = "https://example.org/changed".into();

    reactor.run().unwrap();
    let id = handle.borrow().id();
    let options = reactor.engine().options(id).unwrap();
    assert!(options.contains(&TransferOption::Timeout(Duration::from_secs(3))));
    assert!(options.contains(&TransferOption::Url("https://example.org/changed".into())));
    assert_eq!(
        handle.borrow().effective_url(),
        Some("https://example.org/changed")
    );
}

#[test]
fn test_protocol_error_status() {
    let mut reactor = reactor();
    let handle = scripted(
        &mut reactor,
        "https://example.org/missing",
        Script::new().status_line(404).end_headers().body("not here"),
    );
    reactor.register(&handle).unwrap();

    match reactor.run() {
        Err(ReactorError::Protocol(err)) => assert_eq!(err.status, 404),
        other => panic!("unexpected result: {:?}", other),
    }

    let reported = counter();
    let r = reported.clone();
    {
        let mut h = handle.borrow_mut();
        h.protocol.throw_protocol_errors = false;
        h.protocol.error_callback = Some(Rc::new(move |_: &ProtocolError| r.set(r.get() + 1)));
    }
    let id = handle.borrow().id();
    reactor
        .engine_mut()
        .script(id, Script::new().status_line(503).end_headers());
    reactor.reuse(&handle).unwrap();
    reactor.run().unwrap();
    assert_eq!(reported.get(), 1);
    assert_eq!(handle.borrow().status(), Some(503));
}

#[test]
fn test_status_callback_can_abort() {
    let mut reactor = reactor();
    reactor.prototype.throw_transfer_errors = false;
    let handle = scripted(
        &mut reactor,
        "https://example.org/",
        Script::new().status_line(500).body("ignored"),
    );
    reactor.register(&handle).unwrap();
    handle.borrow_mut().protocol.status_callback = Some(Rc::new(|status: u16| status < 500));

    reactor.run().unwrap();
    assert_eq!(handle.borrow().last_result(), Some(TransferCode::WriteError));
    assert_eq!(reactor.stats().failed, 1);
}

#[test]
fn test_download_and_upload_through_buffers() {
    let mut reactor = reactor();
    let rx = Rc::new(RefCell::new(Vec::<u8>::new()));
    let tx = Rc::new(RefCell::new(transfer_mux::Payload::new(b"request body".to_vec())));

    let mut handle = TransferHandle::new(Strategy::for_method(Method::Post))
        .with_url("https://example.org/echo");
    handle.set_receive(rx.clone());
    handle.set_transmit(tx.clone());
    let handle = handle.into_shared();
    let id = handle.borrow().id();
    reactor.engine_mut().script(
        id,
        Script::new()
            .upload(5)
            .status_line(200)
            .end_headers()
            .body("echo: ")
            .body("request body")
            .redirect_to("https://example.org/echo/final"),
    );
    reactor.register(&handle).unwrap();

    reactor.run().unwrap();
    assert_eq!(*rx.borrow(), b"echo: request body");
    assert_eq!(reactor.engine().uploaded(id), Some(&b"request body"[..]));
    assert!(reactor
        .engine()
        .options(id)
        .unwrap()
        .contains(&TransferOption::Upload { size: Some(12) }));

    let h = handle.borrow();
    assert_eq!(h.effective_url(), Some("https://example.org/echo/final"));
    assert_eq!(h.status(), Some(200));
    assert_eq!(h.bytes_sent(), 12);
    assert_eq!(h.bytes_received(), 18);
    assert_eq!(reactor.stats().bytes_received, 18);
}

#[test]
fn test_reuse_runs_transfer_again() {
    let mut reactor = reactor();
    let done = counter();
    let handle = get("https://example.org/");
    let d = done.clone();
    reactor
        .register_with_callback(&handle, move |_| d.set(d.get() + 1))
        .unwrap();

    reactor.run().unwrap();
    // 已完成且未重新订阅的传输不会再次完成
    reactor.run().unwrap();
    assert_eq!(done.get(), 1);

    reactor.reuse_all().unwrap();
    reactor.run().unwrap();
    assert_eq!(done.get(), 2);
    assert_eq!(reactor.stats().runs, 3);
}

#[test]
fn test_remove_is_idempotent() {
    let mut reactor = reactor();
    let handle = get("https://example.org/");
    reactor.register(&handle).unwrap();

    assert!(reactor.remove(&handle).unwrap());
    assert!(!reactor.remove(&handle).unwrap());
    assert!(!reactor.engine().is_attached(handle.borrow().id()));
    assert_eq!(handle.borrow().state(), TransferState::Removed);

    let stranger = get("https://example.org/other");
    assert!(!reactor.remove(&stranger).unwrap());
}

#[test]
fn test_completion_callbacks_can_update_their_handle() {
    let mut reactor = reactor();
    reactor.done_callback = Some(Rc::new(|h: &SharedTransfer| {
        h.borrow_mut().options.clear();
    }));

    let handle = get("https://example.org/first");
    reactor
        .register_with_callback(&handle, |h| {
            h.borrow_mut().url = "https://example.org/second".into();
        })
        .unwrap();
    handle.borrow_mut().options.push(TransferOption::Verbose(true));

    reactor.run().unwrap();
    assert_eq!(handle.borrow().url, "https://example.org/second");
    assert!(handle.borrow().options.is_empty());

    // 回调中改写的设置在下一次驱动时生效
    reactor.reuse(&handle).unwrap();
    reactor.run().unwrap();
    let id = handle.borrow().id();
    let options = reactor.engine().options(id).unwrap();
    assert!(options.contains(&TransferOption::Url("https://example.org/second".into())));
    assert!(!options.contains(&TransferOption::Verbose(true)));
}

#[test]
fn test_remove_refusal_follows_throw_flag() {
    for throw in [true, false] {
        let mut reactor = reactor();
        reactor.throw_setup_errors = throw;
        let reported = counter();
        let r = reported.clone();
        reactor.error_callback = Some(Rc::new(move |code: &ErrorCode| {
            assert_eq!(*code, EngineCode::BadTransfer.code());
            r.set(r.get() + 1);
        }));

        let handle = get("https://example.org/");
        reactor.register(&handle).unwrap();
        let id = handle.borrow().id();
        reactor.engine_mut().reject_remove(id);

        let result = reactor.remove(&handle);
        assert_eq!(reported.get(), 1);
        if throw {
            assert!(matches!(
                result,
                Err(ReactorError::Setup(ref err)) if err.operation == "remove_transfer"
            ));
            assert!(reactor.contains(&handle));
            assert_eq!(handle.borrow().state(), TransferState::Idle);
        } else {
            assert!(result.unwrap());
            assert!(!reactor.contains(&handle));
            assert_eq!(handle.borrow().state(), TransferState::Removed);
        }
    }
}

#[test]
fn test_configure_rejection_raised_when_throw_flag_set() {
    let mut reactor = reactor();
    let reported = counter();
    let r = reported.clone();
    reactor.error_callback = Some(Rc::new(move |_: &ErrorCode| r.set(r.get() + 1)));

    let handle = get("https://example.org/");
    reactor.register(&handle).unwrap();
    let id = handle.borrow().id();
    reactor.engine_mut().reject_configure(id);

    match reactor.run() {
        Err(ReactorError::Setup(err)) => {
            assert_eq!(err.operation, "configure");
            assert_eq!(err.code, EngineCode::UnknownOption.code());
        }
        other => panic!("unexpected result: {:?}", other),
    }
    assert_eq!(reported.get(), 1);
    assert_eq!(handle.borrow().state(), TransferState::Idle);
    assert_eq!(reactor.engine().step_count(), 0);
}

#[test]
fn test_configure_rejection_reported_then_loop_continues() {
    let mut reactor = reactor();
    reactor.throw_setup_errors = false;
    let reported = counter();
    let r = reported.clone();
    reactor.error_callback = Some(Rc::new(move |code: &ErrorCode| {
        assert_eq!(code.domain, ErrorDomain::Engine);
        r.set(r.get() + 1);
    }));

    let done = counter();
    let handle = get("https://example.org/");
    let d = done.clone();
    reactor
        .register_with_callback(&handle, move |_| d.set(d.get() + 1))
        .unwrap();
    let id = handle.borrow().id();
    reactor.engine_mut().reject_configure(id);

    reactor.run().unwrap();
    assert_eq!(reported.get(), 1);
    assert_eq!(done.get(), 1);
    assert!(reactor.engine().options(id).is_none());
}

#[test]
fn test_stats_snapshot_serializes() {
    let mut reactor = reactor();
    let handle = get("https://example.org/");
    reactor.register(&handle).unwrap();
    reactor.run().unwrap();

    let json: serde_json::Value =
        serde_json::from_str(&reactor.stats().to_json().unwrap()).unwrap();
    assert_eq!(json["registered"], 1);
    assert_eq!(json["succeeded"], 1);
    assert!(json["last_run_finished"].is_string());
}
