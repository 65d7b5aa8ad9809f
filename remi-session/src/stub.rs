use std::fmt;
use std::panic::Location;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;

use remi_wire::{Identifier, ReplyStatus, StackFrame};

use crate::channel::{InvocationChannel, InvocationPipe};
use crate::control::{FAULT_NO_SUCH_METHOD, FAULT_NO_SUCH_OBJECT, FAULT_UNIMPLEMENTED_METHOD};
use crate::info::{ParamKind, RemoteHandle, RemoteInfo, RemoteMethod, Value};
use crate::marshal;
use crate::session::SessionInner;
use crate::RpcError;

/// The local proxy for an object exported by the peer.
///
/// Stubs are cheap to clone and shared per target identifier within a
/// session, so two stubs for the same remote object always compare equal.
/// A stub holds no session resources: dropping the last clone is what
/// eventually lets the peer reclaim the export, through the periodic
/// reference exchange.
#[derive(Clone)]
pub struct Stub {
    inner: Arc<StubInner>,
}

pub(crate) struct StubInner {
    pub(crate) id: Identifier,
    pub(crate) info: Arc<RemoteInfo>,
    pub(crate) session: Weak<SessionInner>,
}

impl Stub {
    pub(crate) fn from_inner(inner: Arc<StubInner>) -> Stub {
        Stub { inner }
    }

    pub(crate) fn new_internal(
        id: Identifier,
        info: Arc<RemoteInfo>,
        session: Weak<SessionInner>,
    ) -> Stub {
        Stub {
            inner: Arc::new(StubInner { id, info, session }),
        }
    }

    /// The identifier of the remote object.
    pub fn target(&self) -> Identifier {
        self.inner.id
    }

    /// The plain by-identity handle for this stub's target.
    pub fn handle(&self) -> RemoteHandle {
        RemoteHandle {
            object: self.inner.id,
        }
    }

    /// The metadata of the remote type.
    pub fn info(&self) -> &Arc<RemoteInfo> {
        &self.inner.info
    }

    fn session(&self) -> Result<Arc<SessionInner>, RpcError> {
        self.inner.session.upgrade().ok_or(RpcError::BrokerClosed)
    }

    fn lookup(&self, method: &str) -> Result<(usize, RemoteMethod), RpcError> {
        self.inner
            .info
            .find(method)
            .map(|(ordinal, m)| (ordinal, m.clone()))
            .ok_or_else(|| RpcError::UnimplementedMethod(method.to_string()))
    }

    /// Invoke a synchronous method and wait for its reply.
    #[track_caller]
    pub fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        let caller = Location::caller();
        let session = self.session()?;
        let (_, m) = self.lookup(method)?;
        if m.pipe {
            return Err(RpcError::UnimplementedMethod(format!(
                "{} opens a pipe, call open_pipe",
                method
            )));
        }
        if m.asynchronous {
            return Err(RpcError::UnimplementedMethod(format!(
                "{} is asynchronous, call invoke_async or invoke_deferred",
                method
            )));
        }
        self.call_and_wait(&session, &m, args, caller)
    }

    /// Invoke an asynchronous void method: returns as soon as the request
    /// is flushed, and the channel is immediately reusable.
    #[track_caller]
    pub fn invoke_async(&self, method: &str, args: Vec<Value>) -> Result<(), RpcError> {
        let session = self.session()?;
        let (_, m) = self.lookup(method)?;
        if !m.asynchronous || m.pipe {
            return Err(RpcError::UnimplementedMethod(format!(
                "{} is not an asynchronous method",
                method
            )));
        }
        if m.returns.is_some() {
            return Err(RpcError::UnimplementedMethod(format!(
                "{} declares a result, call invoke_deferred",
                method
            )));
        }
        let chan = session.broker.connect()?;
        match self.write_request(&session, &chan, &m, args) {
            Ok(()) => {
                session.broker.recycle(chan);
                Ok(())
            }
            Err(e) => {
                Self::give_back_after_send_failure(&session, chan);
                Err(e)
            }
        }
    }

    /// Invoke an asynchronous method that declares a result. The request
    /// is flushed before returning; the reply is collected later through
    /// the returned [`PendingReply`].
    #[track_caller]
    pub fn invoke_deferred(&self, method: &str, args: Vec<Value>) -> Result<PendingReply, RpcError> {
        let caller = Location::caller();
        let session = self.session()?;
        let (ordinal, m) = self.lookup(method)?;
        if !m.asynchronous || m.pipe || m.returns.is_none() {
            return Err(RpcError::UnimplementedMethod(format!(
                "{} does not defer a result",
                method
            )));
        }
        let chan = session.broker.connect()?;
        match self.write_request(&session, &chan, &m, args) {
            Ok(()) => Ok(PendingReply {
                stub: self.clone(),
                ordinal,
                chan: Some(chan),
                caller,
            }),
            Err(e) => {
                Self::give_back_after_send_failure(&session, chan);
                Err(e)
            }
        }
    }

    /// Invoke a pipe method: the declared parameters are flushed, then the
    /// channel itself is handed over as a user-controlled byte pipe.
    #[track_caller]
    pub fn open_pipe(&self, method: &str, args: Vec<Value>) -> Result<InvocationPipe, RpcError> {
        let session = self.session()?;
        let (_, m) = self.lookup(method)?;
        if !m.pipe {
            return Err(RpcError::UnimplementedMethod(format!(
                "{} does not open a pipe",
                method
            )));
        }
        let chan = session.broker.connect()?;
        match self.write_request(&session, &chan, &m, args) {
            Ok(()) => Ok(InvocationPipe::new(chan, Some(session.broker.clone()))),
            Err(e) => {
                Self::give_back_after_send_failure(&session, chan);
                Err(e)
            }
        }
    }

    fn call_and_wait(
        &self,
        session: &Arc<SessionInner>,
        m: &RemoteMethod,
        args: Vec<Value>,
        caller: &'static Location<'static>,
    ) -> Result<Value, RpcError> {
        let chan = session.broker.connect()?;
        if let Err(e) = self.write_request(session, &chan, m, args) {
            Self::give_back_after_send_failure(session, chan);
            return Err(e);
        }
        let result = self.read_reply(session, &chan, m, caller);
        match &result {
            // application failures and the interface-skew fault leave the
            // channel clean
            Ok(_) | Err(RpcError::Remote(_) | RpcError::UnimplementedMethod(_)) => {
                session.broker.recycle(chan)
            }
            Err(_) => {
                chan.poison();
                session.broker.discard(chan);
            }
        }
        result
    }

    /// A channel whose request failed mid-way is only reusable when no
    /// byte reached the wire.
    fn give_back_after_send_failure(session: &Arc<SessionInner>, chan: InvocationChannel) {
        if chan.is_dirty() {
            chan.poison();
            session.broker.discard(chan);
        } else {
            session.broker.recycle(chan);
        }
    }

    fn write_request(
        &self,
        session: &Arc<SessionInner>,
        chan: &InvocationChannel,
        m: &RemoteMethod,
        args: Vec<Value>,
    ) -> Result<(), RpcError> {
        if args.len() != m.params.len() {
            return Err(RpcError::NonSerializable(format!(
                "{} declares {} parameters, got {} arguments",
                m.name,
                m.params.len(),
                args.len()
            )));
        }
        trace!("invoking {}.{} on {}", self.inner.info.name, m.name, self.inner.id);
        let mut out = chan.writer();
        out.write_identifier(self.inner.id)?;
        out.write_identifier(m.id)?;
        for (param, value) in m.params.iter().zip(args.iter()) {
            marshal::write_param(&mut out, session, param, value)?;
        }
        out.flush()?;
        Ok(())
    }

    fn read_reply(
        &self,
        session: &Arc<SessionInner>,
        chan: &InvocationChannel,
        m: &RemoteMethod,
        caller: &'static Location<'static>,
    ) -> Result<Value, RpcError> {
        let mut input = chan.reader();
        let status = input.read_status().map_err(RpcError::from)?;
        match status {
            ReplyStatus::NotOk => {
                let mut throwable = input.read_throwable()?;
                match throwable.class_name() {
                    FAULT_NO_SUCH_OBJECT => return Err(RpcError::NoSuchObject(self.inner.id)),
                    FAULT_NO_SUCH_METHOD => return Err(RpcError::NoSuchMethod(m.id)),
                    FAULT_UNIMPLEMENTED_METHOD => {
                        return Err(RpcError::UnimplementedMethod(m.name.clone()));
                    }
                    _ => {}
                }
                throwable.stitch([StackFrame::new(
                    self.inner.info.name.clone(),
                    m.name.clone(),
                )
                .at(caller.file(), caller.line())]);
                Err(RpcError::Remote(throwable))
            }
            _ => match &m.returns {
                None => Ok(Value::Null),
                Some(r) if r.kind == ParamKind::Boolean && !r.boxed => {
                    Ok(Value::Boolean(status == ReplyStatus::OkTrue))
                }
                Some(r) => marshal::read_param(&mut input, session, r),
            },
        }
    }
}

impl PartialEq for Stub {
    fn eq(&self, other: &Stub) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Stub {}

impl fmt::Debug for Stub {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Stub({} -> {})", self.inner.info.name, self.inner.id)
    }
}

/// The outstanding reply of a deferred asynchronous invocation.
///
/// The channel stays bound to the invocation until the reply is collected;
/// abandoning the pending reply discards the channel, since the reply
/// bytes may still arrive on it.
pub struct PendingReply {
    stub: Stub,
    ordinal: usize,
    chan: Option<InvocationChannel>,
    caller: &'static Location<'static>,
}

impl PendingReply {
    /// Block until the reply arrives and produce the result.
    pub fn wait(mut self) -> Result<Value, RpcError> {
        let chan = self.chan.take().expect("pending reply already collected");
        let session = match self.stub.session() {
            Ok(session) => session,
            Err(e) => return Err(e),
        };
        let info = self.stub.info().clone();
        let m = &info.methods[self.ordinal];
        let result = self.stub.read_reply(&session, &chan, m, self.caller);
        match &result {
            Ok(_) | Err(RpcError::Remote(_) | RpcError::UnimplementedMethod(_)) => {
                session.broker.recycle(chan)
            }
            Err(_) => {
                chan.poison();
                session.broker.discard(chan);
            }
        }
        result
    }

    /// Like [`wait`](PendingReply::wait), bounding the wait with a read
    /// deadline on the channel.
    pub fn wait_timeout(self, timeout: Duration) -> Result<Value, RpcError> {
        if let Some(chan) = &self.chan {
            chan.set_read_timeout(Some(timeout));
        }
        self.wait()
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        if let Some(chan) = self.chan.take() {
            chan.poison();
            if let Some(session) = self.stub.inner.session.upgrade() {
                if !session.closing.load(Ordering::SeqCst) {
                    session.broker.discard(chan);
                }
            }
        }
    }
}
