//! Declared-kind-driven marshalling of dispatch values.
//!
//! Every parameter and result travels according to its
//! [`RemoteParameter`] descriptor: primitives by their fixed encodings
//! (boxed ones behind a presence byte), strings compactly, user objects
//! through the codec in or out of the sharing scope, and remote-kind
//! values as a marshalled reference carrying the object identity, the
//! type identity, and the type metadata on its first transmission in the
//! session.

use std::io::{Read, Write};
use std::sync::Arc;

use remi_wire::{InvocationInput, InvocationOutput, RemoteThrowable, VersionedIdentifier};

use crate::info::{ParamKind, RemoteInfo, RemoteParameter, RemoteRef, Value};
use crate::session::SessionInner;
use crate::RpcError;

fn mismatch(param: &RemoteParameter, value: &Value) -> RpcError {
    RpcError::NonSerializable(format!(
        "parameter of type {} cannot carry a {} value",
        param.type_name,
        value.kind_name()
    ))
}

/// Write one value according to its declared descriptor.
pub(crate) fn write_param<W: Write>(
    out: &mut InvocationOutput<W>,
    session: &Arc<SessionInner>,
    param: &RemoteParameter,
    value: &Value,
) -> Result<(), RpcError> {
    if param.kind.is_primitive() && !param.boxed && matches!(value, Value::Null) {
        return Err(RpcError::NonSerializable(format!(
            "null for the unboxed primitive parameter of type {}",
            param.type_name
        )));
    }
    match (param.kind, value) {
        (ParamKind::Boolean, Value::Boolean(v)) if param.boxed => out.write_boxed_boolean(Some(*v))?,
        (ParamKind::Boolean, Value::Boolean(v)) => out.write_boolean(*v)?,
        (ParamKind::Boolean, Value::Null) => out.write_boxed_boolean(None)?,
        (ParamKind::Byte, Value::Byte(v)) if param.boxed => out.write_boxed_byte(Some(*v))?,
        (ParamKind::Byte, Value::Byte(v)) => out.write_byte(*v)?,
        (ParamKind::Byte, Value::Null) => out.write_boxed_byte(None)?,
        (ParamKind::Char, Value::Char(v)) if param.boxed => out.write_boxed_char(Some(*v))?,
        (ParamKind::Char, Value::Char(v)) => out.write_char(*v)?,
        (ParamKind::Char, Value::Null) => out.write_boxed_char(None)?,
        (ParamKind::Int, Value::Int(v)) if param.boxed => out.write_boxed_int(Some(*v))?,
        (ParamKind::Int, Value::Int(v)) => out.write_int(*v)?,
        (ParamKind::Int, Value::Null) => out.write_boxed_int(None)?,
        (ParamKind::Long, Value::Long(v)) if param.boxed => out.write_boxed_long(Some(*v))?,
        (ParamKind::Long, Value::Long(v)) => out.write_long(*v)?,
        (ParamKind::Long, Value::Null) => out.write_boxed_long(None)?,
        (ParamKind::Float, Value::Float(v)) if param.boxed => out.write_boxed_float(Some(*v))?,
        (ParamKind::Float, Value::Float(v)) => out.write_float(*v)?,
        (ParamKind::Float, Value::Null) => out.write_boxed_float(None)?,
        (ParamKind::Double, Value::Double(v)) if param.boxed => out.write_boxed_double(Some(*v))?,
        (ParamKind::Double, Value::Double(v)) => out.write_double(*v)?,
        (ParamKind::Double, Value::Null) => out.write_boxed_double(None)?,
        (ParamKind::Str, Value::Str(s)) if param.unshared => {
            out.write_unshared_string(Some(s.as_str()))?
        }
        (ParamKind::Str, Value::Str(s)) => out.write_string(Some(s.as_str()))?,
        (ParamKind::Str, Value::Null) => out.write_string(None)?,
        (ParamKind::Object, Value::Object(bytes)) if param.unshared => {
            out.write_unshared_bytes(Some(bytes.as_slice()))?
        }
        (ParamKind::Object, Value::Object(bytes)) => out.write_shared_bytes(Some(bytes.as_slice()))?,
        (ParamKind::Object, Value::Null) => out.write_shared_bytes(None)?,
        (ParamKind::Remote, Value::Remote(rref)) => write_remote(out, session, rref)?,
        (ParamKind::Remote, Value::Null) => out.write_boolean(false)?,
        (_, value) => return Err(mismatch(param, value)),
    }
    Ok(())
}

/// Read one value according to its declared descriptor.
pub(crate) fn read_param<R: Read>(
    input: &mut InvocationInput<R>,
    session: &Arc<SessionInner>,
    param: &RemoteParameter,
) -> Result<Value, RpcError> {
    fn option<T>(value: Option<T>, wrap: impl FnOnce(T) -> Value) -> Value {
        value.map_or(Value::Null, wrap)
    }
    Ok(match param.kind {
        ParamKind::Boolean if param.boxed => option(input.read_boxed_boolean()?, Value::Boolean),
        ParamKind::Boolean => Value::Boolean(input.read_boolean()?),
        ParamKind::Byte if param.boxed => option(input.read_boxed_byte()?, Value::Byte),
        ParamKind::Byte => Value::Byte(input.read_byte()?),
        ParamKind::Char if param.boxed => option(input.read_boxed_char()?, Value::Char),
        ParamKind::Char => Value::Char(input.read_char()?),
        ParamKind::Int if param.boxed => option(input.read_boxed_int()?, Value::Int),
        ParamKind::Int => Value::Int(input.read_int()?),
        ParamKind::Long if param.boxed => option(input.read_boxed_long()?, Value::Long),
        ParamKind::Long => Value::Long(input.read_long()?),
        ParamKind::Float if param.boxed => option(input.read_boxed_float()?, Value::Float),
        ParamKind::Float => Value::Float(input.read_float()?),
        ParamKind::Double if param.boxed => option(input.read_boxed_double()?, Value::Double),
        ParamKind::Double => Value::Double(input.read_double()?),
        ParamKind::Str => option(input.read_string()?, Value::Str),
        ParamKind::Object if param.unshared => option(input.read_unshared_bytes()?, Value::Object),
        ParamKind::Object => option(input.read_shared_bytes()?, Value::Object),
        ParamKind::Remote => read_remote(input, session)?,
    })
}

/// Marshal a reference: a presence byte, the object's versioned identity,
/// the type's identity, and the metadata when this session has not sent
/// the type before.
fn write_remote<W: Write>(
    out: &mut InvocationOutput<W>,
    session: &Arc<SessionInner>,
    rref: &RemoteRef,
) -> Result<(), RpcError> {
    match rref {
        RemoteRef::Export(handle) => {
            let (vid, info) = session
                .registry
                .export_info(handle.object)
                .ok_or(RpcError::NoSuchObject(handle.object))?;
            out.write_boolean(true)?;
            out.write_versioned(&vid)?;
            out.write_versioned(&VersionedIdentifier::new(info.id))?;
            if session.registry.mark_type_sent(info.id) {
                out.write_shared(Some(&*info))?;
            } else {
                out.write_shared(None::<&RemoteInfo>)?;
            }
        }
        RemoteRef::Stub(stub) => {
            // the peer owns both the object and the type, echo the identity
            let (version, info) = session
                .registry
                .import_info(stub.target())
                .unwrap_or_else(|| (0, stub.info().clone()));
            out.write_boolean(true)?;
            out.write_versioned(&VersionedIdentifier {
                id: stub.target(),
                local_version: version,
                remote_version: 0,
            })?;
            out.write_versioned(&VersionedIdentifier::new(info.id))?;
            out.write_shared(None::<&RemoteInfo>)?;
        }
    }
    Ok(())
}

/// Unmarshal a reference into a local export handle or a shared stub,
/// resolving the type through the cache, the carried metadata, or a
/// bootstrap request to the peer.
fn read_remote<R: Read>(
    input: &mut InvocationInput<R>,
    session: &Arc<SessionInner>,
) -> Result<Value, RpcError> {
    if !input.read_boolean()? {
        return Ok(Value::Null);
    }
    let (object, version) = input.read_versioned()?;
    let (type_id, _) = input.read_versioned()?;
    let info: Option<RemoteInfo> = input.read_shared()?;
    let rref = session.import_remote(object, version, type_id, info)?;
    Ok(Value::Remote(rref))
}

/// The portable form of a marshalling failure, for replies that die while
/// being written.
pub(crate) fn marshal_failure(error: &RpcError) -> RemoteThrowable {
    RemoteThrowable::new("MarshalFailure", error.to_string())
}
