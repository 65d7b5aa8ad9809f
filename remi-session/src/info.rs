use std::collections::HashMap;

use remi_wire::{Identifier, ObjectCodec};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::RpcError;

/// Marshalling kind of a declared parameter or result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParamKind {
    /// A boolean, one byte.
    Boolean,
    /// A signed byte.
    Byte,
    /// A Unicode scalar, four bytes.
    Char,
    /// A 32-bit signed integer.
    Int,
    /// A 64-bit signed integer.
    Long,
    /// A 32-bit float.
    Float,
    /// A 64-bit float.
    Double,
    /// A compact-encoded string, nullable.
    Str,
    /// A codec-encoded user object, nullable.
    Object,
    /// A reference to an exported object, marshalled by identity.
    Remote,
}

impl ParamKind {
    fn default_type_name(self) -> &'static str {
        match self {
            ParamKind::Boolean => "boolean",
            ParamKind::Byte => "byte",
            ParamKind::Char => "char",
            ParamKind::Int => "int",
            ParamKind::Long => "long",
            ParamKind::Float => "float",
            ParamKind::Double => "double",
            ParamKind::Str => "string",
            ParamKind::Object => "object",
            ParamKind::Remote => "remote",
        }
    }

    /// Whether this kind is one of the seven primitives.
    pub fn is_primitive(self) -> bool {
        !matches!(self, ParamKind::Str | ParamKind::Object | ParamKind::Remote)
    }
}

/// A serializable descriptor of one declared parameter or result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteParameter {
    /// The declared type name, informational.
    pub type_name: String,
    /// How the value is marshalled.
    pub kind: ParamKind,
    /// For primitives: travel on the boxed path with a presence byte, so
    /// null is representable.
    pub boxed: bool,
    /// Marshal outside the sharing scope, forcing single-use encoding.
    pub unshared: bool,
}

impl RemoteParameter {
    /// A plain descriptor of the given kind.
    pub fn of(kind: ParamKind) -> RemoteParameter {
        RemoteParameter {
            type_name: kind.default_type_name().to_string(),
            kind,
            boxed: false,
            unshared: false,
        }
    }

    /// Set the declared type name.
    pub fn named<S: Into<String>>(mut self, type_name: S) -> RemoteParameter {
        self.type_name = type_name.into();
        self
    }

    /// Use the boxed (nullable) path. Meaningful for primitives only.
    pub fn boxed(mut self) -> RemoteParameter {
        self.boxed = true;
        self
    }

    /// Marshal outside the sharing scope.
    pub fn unshared(mut self) -> RemoteParameter {
        self.unshared = true;
        self
    }
}

/// Declared metadata of one remote method.
///
/// The method identifier doubles as the wire ordinal: it is minted when
/// the metadata is built, transmitted inside [`RemoteInfo`], and stays
/// stable for the lifetime of every session that saw it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteMethod {
    /// The method name, unique within its interface.
    pub name: String,
    /// The stable identifier written on the wire for each call.
    pub id: Identifier,
    /// Declared parameters, in call order.
    pub params: Vec<RemoteParameter>,
    /// The declared result, or `None` for void.
    pub returns: Option<RemoteParameter>,
    /// Fire-and-forget (or future-reply) flavor: the caller does not wait.
    pub asynchronous: bool,
    /// The call opens a user-controlled bidirectional pipe after dispatch.
    pub pipe: bool,
    /// Names of the failure types the method declares it may raise.
    pub throws: Vec<String>,
    /// The declared remote-failure type wrapping transport faults.
    pub failure: Option<String>,
    /// Whether `failure` was declared explicitly rather than defaulted.
    pub failure_declared: bool,
}

impl RemoteMethod {
    /// New void, synchronous method metadata with a fresh identifier.
    pub fn new<S: Into<String>>(name: S) -> RemoteMethod {
        RemoteMethod {
            name: name.into(),
            id: Identifier::random(),
            params: Vec::new(),
            returns: None,
            asynchronous: false,
            pipe: false,
            throws: Vec::new(),
            failure: None,
            failure_declared: false,
        }
    }

    /// Append a declared parameter.
    pub fn param(mut self, param: RemoteParameter) -> RemoteMethod {
        self.params.push(param);
        self
    }

    /// Declare the result.
    pub fn returns(mut self, param: RemoteParameter) -> RemoteMethod {
        self.returns = Some(param);
        self
    }

    /// Mark the method asynchronous.
    pub fn asynchronous(mut self) -> RemoteMethod {
        self.asynchronous = true;
        self
    }

    /// Mark the method as opening a pipe after dispatch.
    pub fn pipe(mut self) -> RemoteMethod {
        self.pipe = true;
        self
    }

    /// Declare a failure type the method may raise.
    pub fn throws<S: Into<String>>(mut self, type_name: S) -> RemoteMethod {
        self.throws.push(type_name.into());
        self
    }

    /// Declare the remote-failure type explicitly.
    pub fn failure<S: Into<String>>(mut self, type_name: S) -> RemoteMethod {
        self.failure = Some(type_name.into());
        self.failure_declared = true;
        self
    }
}

/// Reflected metadata of a remote-capable interface: its stable type
/// identifier and the ordered method list.
///
/// The metadata travels to the peer on the first transmission of a
/// reference of this type, and is cached there for the session lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteInfo {
    /// The interface name, informational.
    pub name: String,
    /// The stable type identifier.
    pub id: Identifier,
    /// The methods, in declaration order; the position is the ordinal.
    pub methods: Vec<RemoteMethod>,
}

impl RemoteInfo {
    /// New empty metadata with a fresh type identifier.
    pub fn new<S: Into<String>>(name: S) -> RemoteInfo {
        RemoteInfo {
            name: name.into(),
            id: Identifier::random(),
            methods: Vec::new(),
        }
    }

    /// Append a method.
    pub fn method(mut self, method: RemoteMethod) -> RemoteInfo {
        self.methods.push(method);
        self
    }

    /// Find a method and its ordinal by name.
    pub fn find(&self, name: &str) -> Option<(usize, &RemoteMethod)> {
        self.methods
            .iter()
            .enumerate()
            .find(|(_, m)| m.name == name)
    }

    /// The id-to-ordinal dispatch index.
    pub(crate) fn ordinals(&self) -> HashMap<Identifier, usize> {
        self.methods
            .iter()
            .enumerate()
            .map(|(ordinal, m)| (m.id, ordinal))
            .collect()
    }
}

/// A value crossing the dispatch boundary, mirroring [`ParamKind`].
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Null, valid for boxed primitives, strings, objects and remotes.
    Null,
    /// A boolean.
    Boolean(bool),
    /// A signed byte.
    Byte(i8),
    /// A Unicode scalar.
    Char(char),
    /// A 32-bit signed integer.
    Int(i32),
    /// A 64-bit signed integer.
    Long(i64),
    /// A 32-bit float.
    Float(f32),
    /// A 64-bit float.
    Double(f64),
    /// A string.
    Str(String),
    /// A codec-encoded user object.
    Object(Vec<u8>),
    /// A reference to an object of either registry.
    Remote(RemoteRef),
}

/// A by-identity reference to an object living in a session registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteHandle {
    /// Identifier of the referenced object.
    pub object: Identifier,
}

/// A remote-kind value: either an object this session exported, or the
/// stub proxying an object the peer exported. Received stubs arrive
/// strong, so they stay invocable for as long as the value lives.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteRef {
    /// A reference to an object exported by this session.
    Export(RemoteHandle),
    /// The proxy for an object exported by the peer.
    Stub(crate::stub::Stub),
}

impl RemoteRef {
    /// The identifier of the referenced object.
    pub fn object(&self) -> Identifier {
        match self {
            RemoteRef::Export(handle) => handle.object,
            RemoteRef::Stub(stub) => stub.target(),
        }
    }

    /// The stub, when this reference points at a peer object.
    pub fn as_stub(&self) -> Option<&crate::stub::Stub> {
        match self {
            RemoteRef::Stub(stub) => Some(stub),
            RemoteRef::Export(_) => None,
        }
    }
}

impl From<crate::stub::Stub> for Value {
    fn from(stub: crate::stub::Stub) -> Value {
        Value::Remote(RemoteRef::Stub(stub))
    }
}

impl Value {
    /// Encode a user value into an object payload.
    pub fn object<T: Serialize>(codec: ObjectCodec, value: &T) -> Result<Value, RpcError> {
        Ok(Value::Object(codec.encode(value)?))
    }

    /// Decode an object payload back into a user value.
    pub fn decode<T: DeserializeOwned>(&self, codec: ObjectCodec) -> Result<T, RpcError> {
        match self {
            Value::Object(bytes) => Ok(codec.decode(bytes)?),
            other => Err(RpcError::NonSerializable(format!(
                "expected an object value, got {}",
                other.kind_name()
            ))),
        }
    }

    /// The string payload, when this is a string value.
    pub fn into_string(self) -> Option<String> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// A short name of the value's kind, for diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Boolean(_) => "boolean",
            Value::Byte(_) => "byte",
            Value::Char(_) => "char",
            Value::Int(_) => "int",
            Value::Long(_) => "long",
            Value::Float(_) => "float",
            Value::Double(_) => "double",
            Value::Str(_) => "string",
            Value::Object(_) => "object",
            Value::Remote(_) => "remote",
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn calculator() -> RemoteInfo {
        RemoteInfo::new("Calculator")
            .method(
                RemoteMethod::new("add")
                    .param(RemoteParameter::of(ParamKind::Int))
                    .param(RemoteParameter::of(ParamKind::Int))
                    .returns(RemoteParameter::of(ParamKind::Int)),
            )
            .method(RemoteMethod::new("reset").asynchronous())
    }

    #[test]
    fn test_find_and_ordinals() {
        let info = calculator();
        let (ordinal, add) = info.find("add").unwrap();
        assert_eq!(ordinal, 0);
        assert_eq!(add.params.len(), 2);
        assert!(info.find("divide").is_none());
        let ordinals = info.ordinals();
        assert_eq!(ordinals[&info.methods[1].id], 1);
    }

    #[test]
    fn test_metadata_roundtrips_through_codec() {
        let info = calculator();
        let bytes = ObjectCodec::Bincode.encode(&info).unwrap();
        let back: RemoteInfo = ObjectCodec::Bincode.decode(&bytes).unwrap();
        assert_eq!(back, info);
    }

    #[test]
    fn test_method_ids_are_distinct() {
        let info = calculator();
        assert_ne!(info.methods[0].id, info.methods[1].id);
        assert_ne!(info.id, info.methods[0].id);
    }

    #[test]
    fn test_object_value_roundtrip() {
        let value = Value::object(ObjectCodec::Bincode, &vec![1u32, 2, 3]).unwrap();
        let back: Vec<u32> = value.decode(ObjectCodec::Bincode).unwrap();
        assert_eq!(back, vec![1, 2, 3]);
        assert!(Value::Null.decode::<u32>(ObjectCodec::Bincode).is_err());
    }
}
