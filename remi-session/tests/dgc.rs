mod common;

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use remi_session::{RpcError, Value};

use common::{echo_skeleton, eventually, init_logger, pair, EchoState};

#[test]
fn test_unreferenced_export_is_reclaimed() {
    init_logger();
    let (client, server) = pair();
    let export = server
        .export(echo_skeleton(Arc::new(EchoState::default())))
        .unwrap();
    server.set_root(&export);
    let id = export.id();
    assert_eq!(server.exported_version(id), Some(0));

    let stub = client.remote_root().unwrap().unwrap();
    assert_eq!(stub.target(), id);
    stub.invoke("echo", vec![Value::Str("in use".to_string())])
        .unwrap();

    // while the stub lives, rounds come and go without reclaiming
    std::thread::sleep(Duration::from_millis(200));
    assert!(server.is_exported(id));

    drop(stub);
    assert!(
        eventually(Duration::from_secs(5), || !server.is_exported(id)),
        "the collector never reclaimed the export"
    );

    client.close();
    server.close();
}

#[test]
fn test_live_clone_prevents_reclamation() {
    init_logger();
    let (client, server) = pair();
    let export = server
        .export(echo_skeleton(Arc::new(EchoState::default())))
        .unwrap();
    server.set_root(&export);
    let id = export.id();

    let stub = client.remote_root().unwrap().unwrap();
    let clone = stub.clone();
    drop(stub);
    std::thread::sleep(Duration::from_millis(300));
    assert!(server.is_exported(id));

    drop(clone);
    assert!(eventually(Duration::from_secs(5), || !server.is_exported(id)));

    client.close();
    server.close();
}

#[test]
fn test_reexport_bumps_the_generation_and_revives_the_identity() {
    init_logger();
    let (client, server) = pair();
    let export = server
        .export(echo_skeleton(Arc::new(EchoState::default())))
        .unwrap();
    server.set_root(&export);
    let id = export.id();

    let stub = client.remote_root().unwrap().unwrap();
    drop(stub);
    assert!(eventually(Duration::from_secs(5), || !server.is_exported(id)));

    // same object, same identifier, next generation
    let handle = export.re_export().unwrap();
    assert_eq!(handle.object, id);
    assert_eq!(server.exported_version(id), Some(1));

    let fresh = client.remote_root().unwrap().unwrap();
    assert_eq!(fresh.target(), id);
    let reply = fresh
        .invoke("echo", vec![Value::Str("back again".to_string())])
        .unwrap();
    assert_eq!(reply, Value::Str("back again".to_string()));

    client.close();
    server.close();
}

#[test]
fn test_vanished_root_fails_cleanly_and_the_session_survives() {
    init_logger();
    let (client, server) = pair();
    let export = server
        .export(echo_skeleton(Arc::new(EchoState::default())))
        .unwrap();
    server.set_root(&export);
    let id = export.id();

    let stub = client.remote_root().unwrap().unwrap();
    drop(stub);
    assert!(eventually(Duration::from_secs(5), || !server.is_exported(id)));

    // the root points at a reclaimed export: the bootstrap call fails with
    // a reconstructed failure, not a dead session
    let err = client.remote_root().unwrap_err();
    match err {
        RpcError::Remote(thrown) => assert_eq!(thrown.class_name(), "MarshalFailure"),
        other => panic!("expected a remote failure, got {:?}", other),
    }

    export.re_export().unwrap();
    let fresh = client.remote_root().unwrap().unwrap();
    let reply = fresh
        .invoke("echo", vec![Value::Str("recovered".to_string())])
        .unwrap();
    assert_eq!(reply, Value::Str("recovered".to_string()));

    client.close();
    server.close();
}

#[test]
fn test_imports_are_counted_and_pruned() {
    init_logger();
    let (client, server) = pair();
    let export = server
        .export(echo_skeleton(Arc::new(EchoState::default())))
        .unwrap();
    server.set_root(&export);

    let stub = client.remote_root().unwrap().unwrap();
    assert_eq!(client.status().imported, 1);

    drop(stub);
    assert!(eventually(Duration::from_secs(5), || {
        client.status().imported == 0
    }));

    client.close();
    server.close();
}
