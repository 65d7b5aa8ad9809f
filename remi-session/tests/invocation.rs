mod common;

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use remi_session::{
    InvocationChannel, ObjectCodec, RpcError, Session, SessionConfig, SessionServer, Skeleton,
    Value, WireError,
};

use common::{config, echo_info, echo_skeleton, eventually, init_logger, pair, EchoState};

fn exported_root(session: &Session) -> remi_session::Export {
    let export = session
        .export(echo_skeleton(Arc::new(EchoState::default())))
        .expect("Cannot export the echo service");
    session.set_root(&export);
    export
}

#[test]
fn test_echo_roundtrip() {
    init_logger();
    let (client, server) = pair();
    let _export = exported_root(&server);

    let stub = client.remote_root().unwrap().expect("No root announced");
    let reply = stub
        .invoke("echo", vec![Value::Str("héllo 𝄞".to_string())])
        .unwrap();
    assert_eq!(reply, Value::Str("héllo 𝄞".to_string()));

    // a null string travels as null, not as an empty string
    let reply = stub.invoke("echo", vec![Value::Null]).unwrap();
    assert_eq!(reply, Value::Null);

    client.close();
    server.close();
}

#[test]
fn test_echo_over_tcp() {
    init_logger();
    let mut listener = SessionServer::bind("127.0.0.1:0", config("tcp server")).unwrap();
    let addr = listener.local_addr().unwrap();

    let server_thread = std::thread::spawn(move || {
        let session = listener.next().expect("No inbound session");
        let _export = exported_root(&session);
        // hold the session until the client is done with it
        assert!(eventually(Duration::from_secs(10), || session.is_closed()));
    });

    let client = Session::tcp_connect(&addr, config("tcp client")).unwrap();
    assert!(client.remote_address_string().is_some());
    let stub = client.remote_root().unwrap().expect("No root announced");
    let reply = stub
        .invoke("echo", vec![Value::Str("over the wire".to_string())])
        .unwrap();
    assert_eq!(reply, Value::Str("over the wire".to_string()));

    client.close();
    server_thread.join().unwrap();
}

#[test]
fn test_remote_throw_reconstructs_the_chain() {
    init_logger();
    let (client, server) = pair();
    let _export = exported_root(&server);
    let stub = client.remote_root().unwrap().unwrap();

    let err = stub
        .invoke("fail", vec![Value::Str("bad".to_string())])
        .unwrap_err();
    let thrown = match err {
        RpcError::Remote(thrown) => thrown,
        other => panic!("expected a remote failure, got {:?}", other),
    };
    assert_eq!(thrown.class_name(), "IllegalState");
    assert_eq!(thrown.message(), Some("bad"));
    // the remote frame comes first, the stitched local call site after it
    assert!(thrown.frames().len() >= 2);
    assert_eq!(thrown.frames()[0].class_name, "server.EchoService");
    assert_eq!(thrown.frames().last().unwrap().class_name, "EchoService");
    assert!(thrown
        .frames()
        .last()
        .unwrap()
        .file_name
        .as_deref()
        .unwrap()
        .ends_with("invocation.rs"));

    // the channel survived the failure and serves the next call
    let reply = stub
        .invoke("echo", vec![Value::Str("still alive".to_string())])
        .unwrap();
    assert_eq!(reply, Value::Str("still alive".to_string()));

    client.close();
    server.close();
}

#[test]
fn test_async_notify_runs_exactly_once() {
    init_logger();
    let (client, server) = pair();
    let state = Arc::new(EchoState::default());
    let export = server.export(echo_skeleton(state.clone())).unwrap();
    server.set_root(&export);
    let stub = client.remote_root().unwrap().unwrap();

    stub.invoke_async("notify", vec![Value::Int(42)]).unwrap();

    // the channel is back in the pool as soon as the request is flushed
    assert_eq!(client.status().pooled_channels, 1);
    assert!(eventually(Duration::from_secs(2), || {
        state.notified.lock().unwrap().as_slice() == [42]
    }));
    // give a late duplicate a chance to show up
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(state.notified.lock().unwrap().as_slice(), [42]);

    client.close();
    server.close();
}

#[test]
fn test_async_failure_reaches_the_error_sink() {
    init_logger();
    let (client, server) = pair();
    let state = Arc::new(EchoState::default());
    let export = server.export(echo_skeleton(state)).unwrap();
    server.set_root(&export);

    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink_seen = seen.clone();
    server.set_error_sink(move |error| {
        sink_seen.lock().unwrap().push(error.to_string());
    });

    let stub = client.remote_root().unwrap().unwrap();
    // the failure never travels back on the invocation channel
    stub.invoke_async("notify", vec![Value::Int(-5)]).unwrap();

    assert!(eventually(Duration::from_secs(2), || {
        !seen.lock().unwrap().is_empty()
    }));
    assert!(seen.lock().unwrap()[0].contains("notify"));

    client.close();
    server.close();
}

#[test]
fn test_deferred_reply() {
    init_logger();
    let (client, server) = pair();
    let state = Arc::new(EchoState::default());
    let export = server.export(echo_skeleton(state.clone())).unwrap();
    server.set_root(&export);
    let stub = client.remote_root().unwrap().unwrap();

    stub.invoke_async("notify", vec![Value::Int(40)]).unwrap();
    assert!(eventually(Duration::from_secs(2), || {
        !state.notified.lock().unwrap().is_empty()
    }));
    let pending = stub.invoke_deferred("total", vec![]).unwrap();
    stub.invoke_async("notify", vec![Value::Int(2)]).unwrap();
    let total = pending.wait().unwrap();
    assert!(matches!(total, Value::Long(n) if n == 40 || n == 42));

    client.close();
    server.close();
}

#[test]
fn test_channel_recycling_bounds_the_pool() {
    init_logger();
    let (client, server) = pair();
    let _export = exported_root(&server);
    let stub = client.remote_root().unwrap().unwrap();

    for i in 0..1000 {
        let text = format!("call {}", i);
        let reply = stub.invoke("echo", vec![Value::Str(text.clone())]).unwrap();
        assert_eq!(reply, Value::Str(text));
    }
    let status = client.status();
    assert!(
        status.channels_opened <= 8,
        "sequential calls opened {} channels",
        status.channels_opened
    );
    assert!(status.pooled_channels >= 1);

    client.close();
    server.close();
}

#[test]
fn test_unimplemented_method_is_a_clean_wire_fault() {
    init_logger();
    let (client, server) = pair();
    // an implementation older than the interface it publishes
    let mut partial = Skeleton::new(echo_info());
    partial.handle("echo", |mut args| Ok(args.remove(0))).unwrap();
    assert!(!partial.missing_handlers().is_empty());
    let export = server.export(partial).unwrap();
    server.set_root(&export);
    let stub = client.remote_root().unwrap().unwrap();

    let err = stub
        .invoke("fail", vec![Value::Str("skewed".to_string())])
        .unwrap_err();
    assert!(matches!(err, RpcError::UnimplementedMethod(_)), "got {:?}", err);

    // the request was fully consumed, so the same channel serves the next
    // invocation
    let reply = stub
        .invoke("echo", vec![Value::Str("still here".to_string())])
        .unwrap();
    assert_eq!(reply, Value::Str("still here".to_string()));
    assert!(client.status().channels_opened <= 2);

    client.close();
    server.close();
}

#[test]
fn test_stub_identity_is_shared() {
    init_logger();
    let (client, server) = pair();
    let _export = exported_root(&server);

    let a = client.remote_root().unwrap().unwrap();
    let b = client.remote_root().unwrap().unwrap();
    assert_eq!(a, b);
    assert_eq!(a.target(), b.target());

    client.close();
    server.close();
}

#[test]
fn test_callback_reference_invokes_the_exporter() {
    init_logger();
    let (client, server) = pair();
    let _server_export = exported_root(&server);
    let stub = client.remote_root().unwrap().unwrap();

    // the client passes its own export; the server invokes it back
    let callback = client
        .export(echo_skeleton(Arc::new(EchoState::default())))
        .unwrap();
    let reply = stub
        .invoke(
            "relay",
            vec![callback.to_value(), Value::Str("ping pong".to_string())],
        )
        .unwrap();
    assert_eq!(reply, Value::Str("ping pong".to_string()));

    client.close();
    server.close();
}

#[test]
fn test_both_sides_invoke_concurrently() {
    init_logger();
    let (client, server) = pair();
    let _client_export = exported_root(&client);
    let _server_export = exported_root(&server);

    let towards_server = client.remote_root().unwrap().unwrap();
    let towards_client = server.remote_root().unwrap().unwrap();

    let forward = std::thread::spawn(move || {
        for i in 0..100 {
            let text = format!("forward {}", i);
            let reply = towards_server
                .invoke("echo", vec![Value::Str(text.clone())])
                .unwrap();
            assert_eq!(reply, Value::Str(text));
        }
    });
    for i in 0..100 {
        let text = format!("backward {}", i);
        let reply = towards_client
            .invoke("echo", vec![Value::Str(text.clone())])
            .unwrap();
        assert_eq!(reply, Value::Str(text));
    }
    forward.join().unwrap();

    client.close();
    server.close();
}

#[test]
fn test_read_timeout_kills_the_call_not_the_session() {
    init_logger();
    let mut client_config = config("timeout client");
    client_config.read_timeout = Some(Duration::from_millis(100));
    let (client, server) =
        Session::local_pair(client_config, config("timeout server")).unwrap();
    let _export = exported_root(&server);
    let stub = client.remote_root().unwrap().unwrap();

    // the first call sleeps past the deadline
    let err = stub.invoke("slow_once", vec![]).unwrap_err();
    assert!(matches!(err, RpcError::Timeout), "got {:?}", err);

    // the session is fine; the second call is fast and succeeds
    assert!(eventually(Duration::from_secs(2), || {
        matches!(stub.invoke("slow_once", vec![]), Ok(Value::Boolean(true)))
    }));

    client.close();
    server.close();
}

#[test]
fn test_graceful_shutdown_converges() {
    init_logger();
    let (client, server) = pair();
    let _export = exported_root(&server);
    let stub = client.remote_root().unwrap().unwrap();
    stub.invoke("echo", vec![Value::Str("warm".to_string())])
        .unwrap();

    client.close();
    assert!(client.is_closed());
    assert!(matches!(
        stub.invoke("echo", vec![Value::Null]),
        Err(RpcError::BrokerClosed)
    ));

    // the detach notice (or the dying wire) closes the peer too
    assert!(eventually(Duration::from_secs(2), || server.is_closed()));
    assert!(matches!(
        server.export(echo_skeleton(Arc::new(EchoState::default()))),
        Err(RpcError::BrokerClosed)
    ));
}

#[test]
fn test_unconnected_channel_fails_every_operation() {
    init_logger();
    let chan = InvocationChannel::unconnected(ObjectCodec::Bincode);
    let mut input = chan.reader();
    match input.read_identifier() {
        Err(WireError::Io(e)) => assert_eq!(e.kind(), std::io::ErrorKind::NotConnected),
        other => panic!("expected a not-connected failure, got {:?}", other),
    }
    let mut out = chan.writer();
    assert!(out.write_int(7).is_err());
    assert!(chan.local_address_string().is_none());
}

#[test]
fn test_codec_mismatch_refuses_the_session() {
    init_logger();
    let mut json_config = config("json side");
    json_config.codec = ObjectCodec::Json;
    let result = Session::local_pair(json_config, config("bincode side"));
    assert!(result.is_err());
}

#[test]
fn test_session_config_defaults() {
    let config = SessionConfig::default();
    assert_eq!(config.channel_capacity, 8);
    assert_eq!(config.codec, ObjectCodec::Bincode);
    assert!(config.read_timeout.is_none());
}
