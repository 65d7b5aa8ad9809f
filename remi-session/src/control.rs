//! The in-band control protocol of a session.
//!
//! Each session exports one control object under well-known reserved
//! identifiers; its methods ride the ordinary invocation machinery, so the
//! control plane exercises the same channels, marshalling and dispatch as
//! user traffic. Both sides build identical control metadata locally, so
//! it never has to travel.
//!
//! The control methods are:
//!
//! - `type_info` is the bootstrap lookup: when a marshalled reference
//!   arrives without its type metadata and the type is unknown, the
//!   receiver asks the peer for the [`RemoteInfo`] by type identifier.
//! - `reference_update` is the garbage-collection diff: newly held
//!   imports and dropped imports, each at the export generation it was
//!   last observed at.
//! - `detach` is the graceful-shutdown notice; the receiver closes its
//!   side of the wire.
//! - `root` is the bootstrap object: the peer's optional entry-point
//!   export, from which every other reference is usually reached.
//!
//! Identifiers at or below [`remi_wire::RESERVED_MAX`] are never minted
//! for user objects, so the control endpoints can never collide with them.

use std::sync::{Arc, Weak};

use remi_wire::{Identifier, RemoteThrowable};
use serde::{Deserialize, Serialize};

use crate::info::{ParamKind, RemoteInfo, RemoteMethod, RemoteParameter, RemoteRef, Value};
use crate::session::SessionInner;
use crate::skeleton::Skeleton;
use crate::stub::Stub;
use crate::RpcError;

/// Identifier of every session's control object.
pub(crate) const CONTROL_OBJECT_ID: Identifier = Identifier::reserved(0x01);
/// Type identifier of the control metadata.
pub(crate) const CONTROL_TYPE_ID: Identifier = Identifier::reserved(0x02);

const METHOD_TYPE_INFO: Identifier = Identifier::reserved(0x10);
const METHOD_REFERENCE_UPDATE: Identifier = Identifier::reserved(0x11);
const METHOD_DETACH: Identifier = Identifier::reserved(0x12);
const METHOD_ROOT: Identifier = Identifier::reserved(0x13);

/// Throwable class name of the reply to a call on an unknown object.
pub(crate) const FAULT_NO_SUCH_OBJECT: &str = "NoSuchObject";
/// Throwable class name of the reply to an unknown method identifier.
pub(crate) const FAULT_NO_SUCH_METHOD: &str = "NoSuchMethod";
/// Throwable class name of the reply to a declared method the exporter's
/// dispatch table does not implement (the callee is older than the
/// interface it published).
pub(crate) const FAULT_UNIMPLEMENTED_METHOD: &str = "UnimplementedMethod";

/// The live-reference diff exchanged by the garbage collectors. Each entry
/// carries the export generation the reference was last observed at, so a
/// drop that raced with a re-export is recognizably stale.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ReferenceUpdate {
    /// Imports this side started holding since the last round.
    pub added: Vec<(Identifier, u32)>,
    /// Imports this side dropped since the last round.
    pub removed: Vec<(Identifier, u32)>,
}

impl ReferenceUpdate {
    pub(crate) fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// The control metadata, identical on both sides by construction.
pub(crate) fn control_info() -> RemoteInfo {
    let mut info = RemoteInfo::new("SessionControl")
        .method(
            RemoteMethod::new("type_info")
                .param(RemoteParameter::of(ParamKind::Long).named("type id bits"))
                .returns(RemoteParameter::of(ParamKind::Object).named("remote info")),
        )
        .method(
            RemoteMethod::new("reference_update")
                .param(RemoteParameter::of(ParamKind::Object).named("reference diff"))
                .asynchronous(),
        )
        .method(RemoteMethod::new("detach").asynchronous())
        .method(RemoteMethod::new("root").returns(RemoteParameter::of(ParamKind::Remote)));
    info.id = CONTROL_TYPE_ID;
    let ids = [
        METHOD_TYPE_INFO,
        METHOD_REFERENCE_UPDATE,
        METHOD_DETACH,
        METHOD_ROOT,
    ];
    for (method, id) in info.methods.iter_mut().zip(ids) {
        method.id = id;
    }
    info
}

/// The control dispatcher, bound to its session through a weak reference
/// so the control plane never keeps a session alive.
pub(crate) fn control_skeleton(session: Weak<SessionInner>) -> Skeleton {
    let mut skeleton = Skeleton::new(control_info());

    let weak = session.clone();
    skeleton
        .handle("type_info", move |args| {
            let session = upgrade(&weak)?;
            let bits = match args.first() {
                Some(Value::Long(bits)) => *bits as u64,
                _ => return Err(RemoteThrowable::new("BadArgument", "type_info takes the id bits")),
            };
            let info = session
                .registry
                .cached_info(Identifier::from_bits(bits));
            trace!(
                "peer asked for type {:016x}, known: {}",
                bits,
                info.is_some()
            );
            Value::object(session.codec(), &info.as_deref())
                .map_err(|e| RemoteThrowable::new("MarshalFailure", e.to_string()))
        })
        .expect("control metadata out of step with its handlers");

    let weak = session.clone();
    skeleton
        .handle_async("reference_update", move |args| {
            let session = upgrade(&weak)?;
            let update: ReferenceUpdate = match args.first() {
                Some(value) => value
                    .decode(session.codec())
                    .map_err(|e| RemoteThrowable::new("BadArgument", e.to_string()))?,
                None => return Err(RemoteThrowable::new("BadArgument", "missing reference diff")),
            };
            session.apply_reference_update(update);
            Ok(())
        })
        .expect("control metadata out of step with its handlers");

    let weak = session.clone();
    skeleton
        .handle_async("detach", move |_| {
            let session = upgrade(&weak)?;
            session.peer_detached();
            Ok(())
        })
        .expect("control metadata out of step with its handlers");

    let weak = session;
    skeleton
        .handle("root", move |_| {
            let session = upgrade(&weak)?;
            let root = *session.root.lock().expect("Cannot lock session root");
            Ok(match root {
                Some(handle) => Value::Remote(RemoteRef::Export(handle)),
                None => Value::Null,
            })
        })
        .expect("control metadata out of step with its handlers");

    skeleton
}

fn upgrade(weak: &Weak<SessionInner>) -> Result<Arc<SessionInner>, RemoteThrowable> {
    weak.upgrade()
        .ok_or_else(|| RemoteThrowable::new("SessionClosed", "the session is gone"))
}

/// The local proxy for the peer's control object.
pub(crate) fn control_stub(session: Weak<SessionInner>) -> Stub {
    Stub::new_internal(CONTROL_OBJECT_ID, Arc::new(control_info()), session)
}

/// Ask the peer for the metadata of a type it exported.
pub(crate) fn request_type_info(
    session: &Arc<SessionInner>,
    type_id: Identifier,
) -> Result<Option<RemoteInfo>, RpcError> {
    let reply = session
        .control
        .invoke("type_info", vec![Value::Long(type_id.to_bits() as i64)])?;
    match reply {
        Value::Object(bytes) => Ok(session.codec().decode(&bytes)?),
        Value::Null => Ok(None),
        other => Err(RpcError::Corrupted(format!(
            "type_info replied with a {} value",
            other.kind_name()
        ))),
    }
}

/// Send one garbage-collection diff, fire-and-forget.
pub(crate) fn send_reference_update(
    session: &Arc<SessionInner>,
    update: &ReferenceUpdate,
) -> Result<(), RpcError> {
    session.control.invoke_async(
        "reference_update",
        vec![Value::object(session.codec(), update)?],
    )
}

/// Tell the peer this session is going away, fire-and-forget.
pub(crate) fn send_detach(session: &Arc<SessionInner>) -> Result<(), RpcError> {
    session.control.invoke_async("detach", Vec::new())
}

/// Fetch the peer's bootstrap object, when it announced one.
pub(crate) fn request_root(session: &Arc<SessionInner>) -> Result<Option<Stub>, RpcError> {
    match session.control.invoke("root", Vec::new())? {
        Value::Remote(RemoteRef::Stub(stub)) => Ok(Some(stub)),
        Value::Remote(RemoteRef::Export(handle)) => Err(RpcError::Corrupted(format!(
            "the peer claims our own export {} as its root",
            handle.object
        ))),
        Value::Null => Ok(None),
        other => Err(RpcError::Corrupted(format!(
            "root replied with a {} value",
            other.kind_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_control_info_is_deterministic() {
        let a = control_info();
        let b = control_info();
        assert_eq!(a, b);
        assert_eq!(a.id, CONTROL_TYPE_ID);
        for method in &a.methods {
            assert!(method.id.is_reserved());
        }
    }

    #[test]
    fn test_control_skeleton_is_complete() {
        let skeleton = control_skeleton(Weak::new());
        assert!(skeleton.missing_handlers().is_empty());
    }
}
