#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use remi_session::{
    ParamKind, RemoteMethod, RemoteParameter, RemoteInfo, RemoteRef, RemoteThrowable, Session,
    SessionConfig, Skeleton, StackFrame, Value,
};

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn config(name: &str) -> SessionConfig {
    SessionConfig {
        name: name.to_string(),
        dgc_interval: Duration::from_millis(50),
        ..SessionConfig::default()
    }
}

pub fn pair() -> (Session, Session) {
    Session::local_pair(config("client"), config("server")).expect("Cannot build the session pair")
}

/// Shared state of the test service, observed by the assertions.
#[derive(Default)]
pub struct EchoState {
    pub notified: Mutex<Vec<i32>>,
    pub slow_done: AtomicBool,
}

/// The metadata of the test service used across the scenarios.
pub fn echo_info() -> RemoteInfo {
    RemoteInfo::new("EchoService")
        .method(
            RemoteMethod::new("echo")
                .param(RemoteParameter::of(ParamKind::Str))
                .returns(RemoteParameter::of(ParamKind::Str)),
        )
        .method(
            RemoteMethod::new("fail")
                .param(RemoteParameter::of(ParamKind::Str))
                .returns(RemoteParameter::of(ParamKind::Str))
                .throws("IllegalState"),
        )
        .method(
            RemoteMethod::new("notify")
                .param(RemoteParameter::of(ParamKind::Int))
                .asynchronous(),
        )
        .method(
            RemoteMethod::new("total")
                .returns(RemoteParameter::of(ParamKind::Long))
                .asynchronous(),
        )
        .method(RemoteMethod::new("slow_once").returns(RemoteParameter::of(ParamKind::Boolean)))
        .method(
            RemoteMethod::new("relay")
                .param(RemoteParameter::of(ParamKind::Remote))
                .param(RemoteParameter::of(ParamKind::Str))
                .returns(RemoteParameter::of(ParamKind::Str)),
        )
}

/// The dispatch table of the test service.
pub fn echo_skeleton(state: Arc<EchoState>) -> Skeleton {
    let mut skeleton = Skeleton::new(echo_info());

    skeleton
        .handle("echo", |mut args| Ok(args.remove(0)))
        .unwrap();

    skeleton
        .handle("fail", |args| {
            let message = match args.first() {
                Some(Value::Str(s)) => s.clone(),
                _ => "fail".to_string(),
            };
            let mut thrown = RemoteThrowable::new("IllegalState", message);
            thrown.push_frame(StackFrame::new("server.EchoService", "fail").at("echo_service.rs", 7));
            Err(thrown)
        })
        .unwrap();

    let notify_state = state.clone();
    skeleton
        .handle_async("notify", move |args| {
            match args.first() {
                Some(Value::Int(n)) if *n >= 0 => {
                    notify_state.notified.lock().unwrap().push(*n);
                    Ok(())
                }
                Some(Value::Int(n)) => Err(RemoteThrowable::new(
                    "NegativeNotification",
                    format!("refusing {}", n),
                )),
                _ => Ok(()),
            }
        })
        .unwrap();

    let total_state = state.clone();
    skeleton
        .handle_deferred("total", move |_| {
            std::thread::sleep(Duration::from_millis(20));
            let total: i64 = total_state.notified.lock().unwrap().iter().map(|n| *n as i64).sum();
            Ok(Value::Long(total))
        })
        .unwrap();

    let slow_state = state;
    skeleton
        .handle("slow_once", move |_| {
            if !slow_state.slow_done.swap(true, Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(500));
            }
            Ok(Value::Boolean(true))
        })
        .unwrap();

    skeleton
        .handle("relay", |mut args| {
            let text = args.pop();
            let callback = args.pop();
            match (callback, text) {
                (Some(Value::Remote(RemoteRef::Stub(stub))), Some(text)) => stub
                    .invoke("echo", vec![text])
                    .map_err(|e| RemoteThrowable::new("RelayFailure", e.to_string())),
                _ => Err(RemoteThrowable::new("BadArgument", "relay takes a callback and a string")),
            }
        })
        .unwrap();

    skeleton
}

/// Poll a condition for up to `timeout`.
pub fn eventually<F: FnMut() -> bool>(timeout: Duration, mut probe: F) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if probe() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}
