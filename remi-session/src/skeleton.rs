use std::collections::HashMap;
use std::sync::Arc;

use remi_wire::{Identifier, RemoteThrowable};

use crate::channel::InvocationPipe;
use crate::info::{RemoteInfo, Value};
use crate::RpcError;

/// A synchronous method body: consumes the arguments, produces the result
/// or the failure that travels back to the caller.
pub type SyncHandler = Box<dyn Fn(Vec<Value>) -> Result<Value, RemoteThrowable> + Send + Sync>;

/// An asynchronous method body. A failure never travels over the
/// invocation channel: it is routed to the session's error sink.
pub type AsyncHandler = Box<dyn Fn(Vec<Value>) -> Result<(), RemoteThrowable> + Send + Sync>;

/// A pipe method body: consumes the arguments, then owns the pipe.
pub type PipeHandler =
    Box<dyn Fn(Vec<Value>, InvocationPipe) -> Result<(), RemoteThrowable> + Send + Sync>;

pub(crate) enum MethodHandler {
    Sync(SyncHandler),
    Async(AsyncHandler),
    Pipe(PipeHandler),
}

/// The server-side dispatcher for one exported object.
///
/// A skeleton is a dispatch table built at registration time: one handler
/// per declared method, indexed by ordinal, with the method identifiers
/// mapping onto ordinals for the wire. Handlers must match the declared
/// flavor, and every method needs one before the skeleton can be
/// exported. The table travels nowhere; only the [`RemoteInfo`] does.
pub struct Skeleton {
    info: Arc<RemoteInfo>,
    handlers: Vec<Option<MethodHandler>>,
    ordinals: HashMap<Identifier, usize>,
}

impl Skeleton {
    /// A dispatch table for the given metadata, with no handlers yet.
    pub fn new(info: RemoteInfo) -> Skeleton {
        let ordinals = info.ordinals();
        let handlers = info.methods.iter().map(|_| None).collect();
        Skeleton {
            info: Arc::new(info),
            handlers,
            ordinals,
        }
    }

    /// The metadata this skeleton dispatches for.
    pub fn info(&self) -> &Arc<RemoteInfo> {
        &self.info
    }

    fn slot(&mut self, name: &str, flavor: &str) -> Result<&mut Option<MethodHandler>, RpcError> {
        let (ordinal, method) = self
            .info
            .find(name)
            .ok_or_else(|| RpcError::UnimplementedMethod(name.to_string()))?;
        let actual = if method.pipe {
            "pipe"
        } else if method.asynchronous {
            "asynchronous"
        } else {
            "synchronous"
        };
        if actual != flavor {
            return Err(RpcError::UnimplementedMethod(format!(
                "{} is declared {}, not {}",
                name, actual, flavor
            )));
        }
        Ok(&mut self.handlers[ordinal])
    }

    /// Install the body of a synchronous method.
    pub fn handle<F>(&mut self, name: &str, body: F) -> Result<(), RpcError>
    where
        F: Fn(Vec<Value>) -> Result<Value, RemoteThrowable> + Send + Sync + 'static,
    {
        *self.slot(name, "synchronous")? = Some(MethodHandler::Sync(Box::new(body)));
        Ok(())
    }

    /// Install the body of an asynchronous method.
    pub fn handle_async<F>(&mut self, name: &str, body: F) -> Result<(), RpcError>
    where
        F: Fn(Vec<Value>) -> Result<(), RemoteThrowable> + Send + Sync + 'static,
    {
        let method = self
            .info
            .find(name)
            .map(|(_, m)| m.clone())
            .ok_or_else(|| RpcError::UnimplementedMethod(name.to_string()))?;
        if method.returns.is_some() {
            // a future-reply method carries a result and dispatches like a
            // synchronous one; only the caller side differs
            return Err(RpcError::UnimplementedMethod(format!(
                "{} declares a result, install a synchronous handler",
                name
            )));
        }
        *self.slot(name, "asynchronous")? = Some(MethodHandler::Async(Box::new(body)));
        Ok(())
    }

    /// Install the body of an asynchronous method that declares a result.
    /// The callee dispatches it like a synchronous call; only the caller
    /// defers collecting the reply.
    pub fn handle_deferred<F>(&mut self, name: &str, body: F) -> Result<(), RpcError>
    where
        F: Fn(Vec<Value>) -> Result<Value, RemoteThrowable> + Send + Sync + 'static,
    {
        let declares_result = self
            .info
            .find(name)
            .map_or(false, |(_, m)| m.returns.is_some());
        if !declares_result {
            return Err(RpcError::UnimplementedMethod(format!(
                "{} declares no result, install an asynchronous handler",
                name
            )));
        }
        let slot = self.slot(name, "asynchronous")?;
        *slot = Some(MethodHandler::Sync(Box::new(body)));
        Ok(())
    }

    /// Install the body of a pipe method.
    pub fn handle_pipe<F>(&mut self, name: &str, body: F) -> Result<(), RpcError>
    where
        F: Fn(Vec<Value>, InvocationPipe) -> Result<(), RemoteThrowable> + Send + Sync + 'static,
    {
        *self.slot(name, "pipe")? = Some(MethodHandler::Pipe(Box::new(body)));
        Ok(())
    }

    /// The ordinal behind a wire method identifier.
    pub(crate) fn ordinal_of(&self, id: Identifier) -> Option<usize> {
        self.ordinals.get(&id).copied()
    }

    /// The handler at an ordinal, when installed.
    pub(crate) fn handler(&self, ordinal: usize) -> Option<&MethodHandler> {
        self.handlers.get(ordinal).and_then(|h| h.as_ref())
    }

    /// Names of declared methods that have no handler installed. Such
    /// methods export fine: an implementation may be older than the
    /// interface it publishes, and a call on one of them is answered with
    /// the interface-skew fault instead of a result.
    pub fn missing_handlers(&self) -> Vec<&str> {
        self.info
            .methods
            .iter()
            .zip(&self.handlers)
            .filter(|(_, handler)| handler.is_none())
            .map(|(method, _)| method.name.as_str())
            .collect()
    }
}
