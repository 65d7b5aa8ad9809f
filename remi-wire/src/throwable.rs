//! Portable failure chains.
//!
//! A failure on the callee travels as metadata only: for every element of
//! its cause chain the type name, the message and the stack frames are
//! serialized through the object codec, so the caller can always rebuild a
//! meaningful error even when it knows nothing about the callee's error
//! types. A typed payload may ride along on the terminal element for
//! callers that want to recover structured data.

use std::error::Error;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{ObjectCodec, WireError};

/// One execution stack frame of a failure that happened on the peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackFrame {
    /// The type or module the frame belongs to.
    pub class_name: String,
    /// The method or function name.
    pub method_name: String,
    /// The source file, when known.
    pub file_name: Option<String>,
    /// The line number, when known.
    pub line: Option<u32>,
}

impl StackFrame {
    /// A frame with the location part left unknown.
    pub fn new<C: Into<String>, M: Into<String>>(class_name: C, method_name: M) -> StackFrame {
        StackFrame {
            class_name: class_name.into(),
            method_name: method_name.into(),
            file_name: None,
            line: None,
        }
    }

    /// Attach the source location.
    pub fn at<F: Into<String>>(mut self, file_name: F, line: u32) -> StackFrame {
        self.file_name = Some(file_name.into());
        self.line = Some(line);
        self
    }
}

impl fmt::Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "at {}::{}", self.class_name, self.method_name)?;
        match (&self.file_name, self.line) {
            (Some(file), Some(line)) => write!(f, " ({}:{})", file, line),
            (Some(file), None) => write!(f, " ({})", file),
            _ => Ok(()),
        }
    }
}

/// The portable metadata of one element of a failure's cause chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrowableInfo {
    /// Name of the error type.
    pub class_name: String,
    /// The message, when the error carried one.
    pub message: Option<String>,
    /// The stack of the failure, outermost frame first.
    pub frames: Vec<StackFrame>,
}

/// A typed payload attached to the terminal element of a chain, for
/// callers that want to decode the original error value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrowablePayload {
    /// Name of the encoded type, informational only.
    pub type_name: String,
    /// The codec-encoded value.
    pub bytes: Vec<u8>,
}

/// A failure raised on the peer, rebuilt locally.
///
/// The outermost element is the error that was thrown; `source()` walks
/// down to the root cause. After the reply has been read the caller's own
/// call site is stitched onto the outermost frame list, so the rendered
/// stack reads remote-first, local-second.
#[derive(Debug, Clone)]
pub struct RemoteThrowable {
    info: ThrowableInfo,
    cause: Option<Box<RemoteThrowable>>,
    payload: Option<ThrowablePayload>,
}

impl RemoteThrowable {
    /// A new chain of one element.
    pub fn new<C: Into<String>, M: Into<String>>(class_name: C, message: M) -> RemoteThrowable {
        RemoteThrowable {
            info: ThrowableInfo {
                class_name: class_name.into(),
                message: Some(message.into()),
                frames: Vec::new(),
            },
            cause: None,
            payload: None,
        }
    }

    /// Build the chain from any error, walking its `source()` chain into
    /// portable elements. Type names are not recoverable from `dyn Error`,
    /// so each element is classed by the error's rendering.
    pub fn from_error(err: &(dyn Error + 'static)) -> RemoteThrowable {
        let mut chain = Vec::new();
        let mut current: Option<&(dyn Error + 'static)> = Some(err);
        while let Some(e) = current {
            chain.push(ThrowableInfo {
                class_name: "Error".to_string(),
                message: Some(e.to_string()),
                frames: Vec::new(),
            });
            current = e.source();
        }
        // wire order is root first
        chain.reverse();
        RemoteThrowable::from_chain(chain, None)
    }

    /// Rebuild the nested chain from its wire order (root cause first, the
    /// thrown element last). An empty chain collapses to a placeholder so
    /// the caller always observes a non-null cause.
    pub fn from_chain(
        chain: Vec<ThrowableInfo>,
        payload: Option<ThrowablePayload>,
    ) -> RemoteThrowable {
        let mut result: Option<RemoteThrowable> = None;
        for info in chain {
            result = Some(RemoteThrowable {
                info,
                cause: result.map(Box::new),
                payload: None,
            });
        }
        let mut outermost = result.unwrap_or_else(|| {
            RemoteThrowable::new("UnknownFailure", "the peer sent an empty failure chain")
        });
        outermost.payload = payload;
        outermost
    }

    /// Append a frame to this element's stack.
    pub fn push_frame(&mut self, frame: StackFrame) {
        self.info.frames.push(frame);
    }

    /// Attach a cause below the deepest element of this chain.
    pub fn caused_by(mut self, cause: RemoteThrowable) -> RemoteThrowable {
        self.cause = Some(Box::new(match self.cause {
            Some(existing) => (*existing).caused_by(cause),
            None => cause,
        }));
        self
    }

    /// Attach a typed payload for the caller to decode.
    pub fn with_payload<T: Serialize>(
        mut self,
        codec: ObjectCodec,
        value: &T,
    ) -> Result<RemoteThrowable, WireError> {
        self.payload = Some(ThrowablePayload {
            type_name: std::any::type_name::<T>().to_string(),
            bytes: codec.encode(value)?,
        });
        Ok(self)
    }

    /// Name of this element's error type.
    pub fn class_name(&self) -> &str {
        &self.info.class_name
    }

    /// Message of this element, when present.
    pub fn message(&self) -> Option<&str> {
        self.info.message.as_deref()
    }

    /// Stack frames of this element, outermost first.
    pub fn frames(&self) -> &[StackFrame] {
        &self.info.frames
    }

    /// The next element down the chain.
    pub fn cause(&self) -> Option<&RemoteThrowable> {
        self.cause.as_deref()
    }

    /// The deepest element of the chain.
    pub fn root_cause(&self) -> &RemoteThrowable {
        let mut current = self;
        while let Some(cause) = current.cause.as_deref() {
            current = cause;
        }
        current
    }

    /// The typed payload, when the thrower attached one.
    pub fn payload(&self) -> Option<&ThrowablePayload> {
        self.payload.as_ref()
    }

    /// Decode the attached payload, when present.
    pub fn decode_as<T: DeserializeOwned>(
        &self,
        codec: ObjectCodec,
    ) -> Result<Option<T>, WireError> {
        match &self.payload {
            Some(p) => Ok(Some(codec.decode(&p.bytes)?)),
            None => Ok(None),
        }
    }

    /// The chain in wire order: root cause first, this element last.
    pub fn chain_root_first(&self) -> Vec<&ThrowableInfo> {
        let mut chain = Vec::new();
        let mut current = Some(self);
        while let Some(t) = current {
            chain.push(&t.info);
            current = t.cause.as_deref();
        }
        chain.reverse();
        chain
    }

    /// Append the caller's frames after the remote ones.
    pub fn stitch<I: IntoIterator<Item = StackFrame>>(&mut self, local_frames: I) {
        self.info.frames.extend(local_frames);
    }

    /// Render the chain with its stacks, one line per element and frame.
    pub fn render_stack(&self) -> String {
        let mut text = String::new();
        let mut current = Some(self);
        let mut first = true;
        while let Some(t) = current {
            if !first {
                text.push_str("caused by: ");
            }
            first = false;
            text.push_str(&t.to_string());
            text.push('\n');
            for frame in &t.info.frames {
                text.push_str(&format!("    {}\n", frame));
            }
            current = t.cause.as_deref();
        }
        text
    }
}

impl fmt::Display for RemoteThrowable {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.info.message {
            Some(message) => write!(f, "{}: {}", self.info.class_name, message),
            None => write!(f, "{}", self.info.class_name),
        }
    }
}

impl Error for RemoteThrowable {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.cause.as_deref().map(|c| c as &(dyn Error + 'static))
    }
}

impl From<anyhow::Error> for RemoteThrowable {
    fn from(err: anyhow::Error) -> RemoteThrowable {
        let mut chain: Vec<ThrowableInfo> = err
            .chain()
            .map(|e| ThrowableInfo {
                class_name: "Error".to_string(),
                message: Some(e.to_string()),
                frames: Vec::new(),
            })
            .collect();
        chain.reverse();
        RemoteThrowable::from_chain(chain, None)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::{InvocationInput, InvocationOutput, ReplyStatus};

    use super::*;

    fn sample() -> RemoteThrowable {
        let mut outer = RemoteThrowable::new("IllegalState", "bad");
        outer.push_frame(StackFrame::new("server.Echo", "echo").at("echo.rs", 42));
        let mut root = RemoteThrowable::new("Io", "connection reset");
        root.push_frame(StackFrame::new("server.Socket", "read"));
        outer.caused_by(root)
    }

    #[test]
    fn test_chain_order_is_root_first() {
        let t = sample();
        let chain = t.chain_root_first();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].class_name, "Io");
        assert_eq!(chain[1].class_name, "IllegalState");
        assert_eq!(t.root_cause().class_name(), "Io");
    }

    #[test]
    fn test_wire_roundtrip() {
        let t = sample()
            .with_payload(ObjectCodec::Bincode, &("extra", 7u32))
            .unwrap();
        let mut buf = Vec::new();
        let mut out = InvocationOutput::new(&mut buf, ObjectCodec::Bincode);
        out.write_throwable(&t).unwrap();
        drop(out);

        let mut input = InvocationInput::new(&buf[..], ObjectCodec::Bincode);
        assert_eq!(input.read_status().unwrap(), ReplyStatus::NotOk);
        let back = input.read_throwable().unwrap();
        assert_eq!(back.class_name(), "IllegalState");
        assert_eq!(back.message(), Some("bad"));
        assert_eq!(back.frames()[0].class_name, "server.Echo");
        assert_eq!(back.cause().unwrap().class_name(), "Io");
        let payload: Option<(String, u32)> = back.decode_as(ObjectCodec::Bincode).unwrap();
        assert_eq!(payload, Some(("extra".to_string(), 7)));
    }

    #[test]
    fn test_stitch_appends_local_frames() {
        let mut t = sample();
        t.stitch([StackFrame::new("client.Caller", "run").at("caller.rs", 7)]);
        let frames = t.frames();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].class_name, "server.Echo");
        assert_eq!(frames[1].class_name, "client.Caller");
    }

    #[test]
    fn test_from_error_walks_sources() {
        let err = anyhow::anyhow!("root problem").context("while replying");
        let t = RemoteThrowable::from(err);
        assert_eq!(t.message(), Some("while replying"));
        assert_eq!(t.root_cause().message(), Some("root problem"));
    }

    #[test]
    fn test_empty_chain_has_placeholder() {
        let t = RemoteThrowable::from_chain(Vec::new(), None);
        assert_eq!(t.class_name(), "UnknownFailure");
    }
}
