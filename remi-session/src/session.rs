//! Session lifecycle and invocation dispatch.
//!
//! A session is created by connecting or accepting one [`Wire`] and lives
//! until either peer detaches or the wire dies. It owns the multiplexer
//! pump, the channel broker, the registry, the control plane, the accept
//! loop handing inbound channels to invocation workers, and the reference
//! collector.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use remi_wire::{Identifier, ObjectCodec, RemoteThrowable, WireError};

use crate::broker::Broker;
use crate::channel::{InvocationChannel, InvocationPipe};
use crate::control::{
    self, ReferenceUpdate, FAULT_NO_SUCH_METHOD, FAULT_NO_SUCH_OBJECT,
    FAULT_UNIMPLEMENTED_METHOD,
};
use crate::dgc;
use crate::info::{ParamKind, RemoteHandle, RemoteInfo, RemoteMethod, RemoteRef, Value};
use crate::marshal;
use crate::mux::{Multiplexer, Wire, WireReader, WireWriter};
use crate::registry::Registry;
use crate::skeleton::{MethodHandler, Skeleton};
use crate::stub::Stub;
use crate::RpcError;

/// First bytes of every session handshake.
const HANDSHAKE_MAGIC: u32 = 0x5245_4d49;
/// Version of the invocation protocol spoken by this build.
const PROTOCOL_VERSION: u8 = 1;

/// Tunables of a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Label used in thread names and log lines.
    pub name: String,
    /// Serialization format for user objects. Checked at handshake; both
    /// peers must agree.
    pub codec: ObjectCodec,
    /// Outbound invocation channels open at once; `connect` blocks past
    /// this.
    pub channel_capacity: usize,
    /// Pooled channels idle longer than this are closed.
    pub channel_idle_timeout: Duration,
    /// Default read deadline applied to every channel.
    pub read_timeout: Option<Duration>,
    /// Default write deadline applied to every channel.
    pub write_timeout: Option<Duration>,
    /// Period of the reference-exchange rounds.
    pub dgc_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> SessionConfig {
        SessionConfig {
            name: "session".to_string(),
            codec: ObjectCodec::default(),
            channel_capacity: 8,
            channel_idle_timeout: Duration::from_secs(60),
            read_timeout: None,
            write_timeout: None,
            dgc_interval: Duration::from_secs(1),
        }
    }
}

/// A point-in-time snapshot of a session's registries and channel pool.
#[derive(Debug, Clone)]
pub struct SessionStatus {
    /// Exported objects, the control object included.
    pub exported: usize,
    /// Imported objects with live stubs or pending reference reports.
    pub imported: usize,
    /// Idle channels waiting in the pool.
    pub pooled_channels: usize,
    /// Virtual channels opened on the wire so far, both directions.
    pub channels_opened: u64,
    /// Whether the session is shut down.
    pub closed: bool,
}

pub(crate) struct SessionInner {
    pub(crate) config: SessionConfig,
    pub(crate) broker: Arc<Broker>,
    pub(crate) registry: Registry,
    pub(crate) control: Stub,
    pub(crate) root: Mutex<Option<RemoteHandle>>,
    pub(crate) closing: AtomicBool,
    error_sink: Mutex<Option<Arc<dyn Fn(&RpcError) + Send + Sync>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    weak_self: Weak<SessionInner>,
}

impl SessionInner {
    pub(crate) fn codec(&self) -> ObjectCodec {
        self.config.codec
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Resolve an unmarshalled reference: our own export comes back as a
    /// handle, a peer export becomes the shared stub, fetching the type
    /// metadata through the cache, the carried copy, or the peer's
    /// bootstrap lookup.
    pub(crate) fn import_remote(
        self: &Arc<SessionInner>,
        object: Identifier,
        version: u32,
        type_id: Identifier,
        info: Option<RemoteInfo>,
    ) -> Result<RemoteRef, RpcError> {
        if self.registry.is_exported(object) {
            return Ok(RemoteRef::Export(RemoteHandle { object }));
        }
        let info = match self.registry.cached_info(type_id) {
            Some(cached) => cached,
            None => {
                let fresh = match info {
                    Some(info) => info,
                    None => control::request_type_info(self, type_id)?.ok_or_else(|| {
                        RpcError::Corrupted(format!("the peer cannot describe type {}", type_id))
                    })?,
                };
                if fresh.id != type_id {
                    return Err(RpcError::Corrupted(format!(
                        "type metadata {} arrived under identifier {}",
                        fresh.id, type_id
                    )));
                }
                self.registry.cache_info(fresh)
            }
        };
        Ok(RemoteRef::Stub(self.registry.import(
            self.weak_self.clone(),
            object,
            version,
            info,
        )))
    }

    /// Apply one reference diff received from the peer.
    pub(crate) fn apply_reference_update(&self, update: ReferenceUpdate) {
        for (id, version) in update.added {
            self.registry.note_observed(id, version);
        }
        for (id, version) in update.removed {
            self.registry.drop_export(id, version);
        }
    }

    /// The peer announced a graceful shutdown: converge on the same path
    /// as a local close, without joining (we are on a worker thread).
    pub(crate) fn peer_detached(&self) {
        info!("{}: peer detached", self.config.name);
        self.closing.store(true, Ordering::SeqCst);
        self.broker.close();
    }

    /// Route an asynchronous-invocation failure to the error sink.
    pub(crate) fn report_async_failure(&self, method: &str, cause: RemoteThrowable) {
        let error = RpcError::AsynchronousInvocation {
            method: method.to_string(),
            cause,
        };
        let sink = self
            .error_sink
            .lock()
            .expect("Cannot lock error sink")
            .clone();
        match sink {
            Some(sink) => sink(&error),
            None => error!("{}: {}", self.config.name, error),
        }
    }
}

/// One end of the invocation bond between two processes.
///
/// Both ends are symmetric: each may export objects, obtain stubs for the
/// peer's exports, and invoke in both directions concurrently. Dropping
/// the session closes it; so does a `detach` from the peer or the death
/// of the wire.
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Establish a session over a wire this side initiated.
    pub fn connect(wire: Wire, config: SessionConfig) -> Result<Session, RpcError> {
        Session::establish(wire, config, true)
    }

    /// Establish a session over a wire this side accepted.
    pub fn accept(wire: Wire, config: SessionConfig) -> Result<Session, RpcError> {
        Session::establish(wire, config, false)
    }

    /// Dial a TCP peer and establish a session.
    pub fn tcp_connect<A: ToSocketAddrs>(
        addr: A,
        config: SessionConfig,
    ) -> Result<Session, RpcError> {
        let stream = TcpStream::connect(addr)
            .map_err(|e| RpcError::RemoteFailure(format!("cannot connect: {}", e)))?;
        let _ = stream.set_nodelay(true);
        Session::connect(Wire::Tcp(stream), config)
    }

    /// An in-process pair of connected sessions, mostly useful in tests
    /// and for wiring two components of one process through the full
    /// protocol.
    pub fn local_pair(
        connect_config: SessionConfig,
        accept_config: SessionConfig,
    ) -> Result<(Session, Session), RpcError> {
        let (connect_wire, accept_wire) = Wire::local_pair();
        let acceptor = std::thread::Builder::new()
            .name("local session acceptor".to_string())
            .spawn(move || Session::accept(accept_wire, accept_config))
            .expect("Failed to spawn local session acceptor");
        let connected = Session::connect(connect_wire, connect_config);
        let accepted = acceptor
            .join()
            .map_err(|_| RpcError::RemoteFailure("local session acceptor panicked".to_string()))?;
        Ok((connected?, accepted?))
    }

    fn establish(wire: Wire, config: SessionConfig, initiator: bool) -> Result<Session, RpcError> {
        let addresses = wire.address_strings();
        let (mut reader, mut writer) = wire
            .split()
            .map_err(|e| RpcError::RemoteFailure(format!("cannot split the wire: {}", e)))?;
        handshake(&mut reader, &mut writer, &config)?;
        let (mux, accept_rx, pump) = Multiplexer::start(
            config.name.clone(),
            reader,
            writer,
            initiator,
            addresses,
        );
        let broker = Arc::new(Broker::new(
            mux,
            accept_rx,
            config.codec,
            config.channel_capacity,
            config.channel_idle_timeout,
            config.read_timeout,
            config.write_timeout,
        ));
        let name = config.name.clone();
        let inner = Arc::new_cyclic(|weak: &Weak<SessionInner>| SessionInner {
            config,
            broker,
            registry: Registry::new(),
            control: control::control_stub(weak.clone()),
            root: Mutex::new(None),
            closing: AtomicBool::new(false),
            error_sink: Mutex::new(None),
            threads: Mutex::new(Vec::new()),
            weak_self: weak.clone(),
        });
        inner.registry.export_reserved(
            control::CONTROL_OBJECT_ID,
            Arc::new(control::control_skeleton(Arc::downgrade(&inner))),
        );

        let accept_inner = inner.clone();
        let accept = std::thread::Builder::new()
            .name(format!("{} accept loop", name))
            .spawn(move || accept_loop(accept_inner))
            .expect("Failed to spawn session accept loop");
        let collector_inner = inner.clone();
        let collector = std::thread::Builder::new()
            .name(format!("{} reference collector", name))
            .spawn(move || dgc::collector_loop(collector_inner))
            .expect("Failed to spawn reference collector");
        inner
            .threads
            .lock()
            .expect("Cannot lock session threads")
            .extend([pump, accept, collector]);
        info!(
            "{}: session established as {}",
            name,
            if initiator { "initiator" } else { "acceptor" }
        );
        Ok(Session { inner })
    }

    pub(crate) fn inner(&self) -> &Arc<SessionInner> {
        &self.inner
    }

    /// Export a local object. The registry keeps the dispatch table alive
    /// until the peer's collector acknowledges dropping every reference to
    /// it. A declared method with no installed handler exports too and
    /// answers the interface-skew fault when the peer calls it.
    pub fn export(&self, skeleton: Skeleton) -> Result<Export, RpcError> {
        if self.inner.broker.is_closed() {
            return Err(RpcError::BrokerClosed);
        }
        let missing = skeleton.missing_handlers();
        if !missing.is_empty() {
            debug!(
                "{}: exporting {} with unimplemented methods: {}",
                self.inner.config.name,
                skeleton.info().name,
                missing.join(", ")
            );
        }
        let skeleton = Arc::new(skeleton);
        let vid = self.inner.registry.export(skeleton.clone());
        Ok(Export {
            id: vid.id,
            skeleton,
            session: Arc::downgrade(&self.inner),
        })
    }

    /// Announce an export as this session's bootstrap object, for the
    /// peer's [`remote_root`](Session::remote_root).
    pub fn set_root(&self, export: &Export) {
        *self.inner.root.lock().expect("Cannot lock session root") = Some(export.handle());
    }

    /// Fetch the peer's bootstrap object, when it announced one.
    pub fn remote_root(&self) -> Result<Option<Stub>, RpcError> {
        control::request_root(&self.inner)
    }

    /// The codec user objects travel with on this session.
    pub fn codec(&self) -> ObjectCodec {
        self.inner.codec()
    }

    /// Route asynchronous-invocation failures (and nothing else) to this
    /// callback instead of the log.
    pub fn set_error_sink<F>(&self, sink: F)
    where
        F: Fn(&RpcError) + Send + Sync + 'static,
    {
        *self.inner.error_sink.lock().expect("Cannot lock error sink") = Some(Arc::new(sink));
    }

    /// Whether an identifier is currently exported by this session.
    pub fn is_exported(&self, id: Identifier) -> bool {
        self.inner.registry.is_exported(id)
    }

    /// The export generation of an identifier, when currently exported.
    /// Diagnostic surface for tests and tooling.
    pub fn exported_version(&self, id: Identifier) -> Option<u32> {
        self.inner.registry.export_version(id)
    }

    /// A snapshot of the session's registries and channel pool.
    pub fn status(&self) -> SessionStatus {
        let (exported, imported) = self.inner.registry.counts();
        SessionStatus {
            exported,
            imported,
            pooled_channels: self.inner.broker.pooled(),
            channels_opened: self.inner.broker.opened_total(),
            closed: self.inner.broker.is_closed(),
        }
    }

    /// Informational local address of the wire, when it has one.
    pub fn local_address_string(&self) -> Option<String> {
        self.inner.broker.addresses().0
    }

    /// Informational peer address of the wire, when it has one.
    pub fn remote_address_string(&self) -> Option<String> {
        self.inner.broker.addresses().1
    }

    /// Whether the session is shut down.
    pub fn is_closed(&self) -> bool {
        self.inner.broker.is_closed()
    }

    /// Graceful shutdown: notify the peer, close the broker and the wire,
    /// join the session threads. Idempotent; every operation afterwards
    /// fails with [`RpcError::BrokerClosed`].
    pub fn close(&self) {
        let first = !self.inner.closing.swap(true, Ordering::SeqCst);
        if first && !self.inner.broker.is_closed() {
            if let Err(e) = control::send_detach(&self.inner) {
                debug!("{}: detach notice failed: {}", self.inner.config.name, e);
            }
        }
        self.inner.broker.close();
        let handles: Vec<JoinHandle<()>> = self
            .inner
            .threads
            .lock()
            .expect("Cannot lock session threads")
            .drain(..)
            .collect();
        let current = std::thread::current().id();
        for handle in handles {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
        if first {
            info!("{}: session closed", self.inner.config.name);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

/// The handle of an exported object.
///
/// Dropping the handle does not unexport: reclamation is driven by the
/// peer's reference collector. The handle is what a re-export needs after
/// a reclamation, and what [`Session::set_root`] and remote-kind
/// parameters take.
pub struct Export {
    id: Identifier,
    skeleton: Arc<Skeleton>,
    session: Weak<SessionInner>,
}

impl Export {
    /// The exported identifier.
    pub fn id(&self) -> Identifier {
        self.id
    }

    /// The plain by-identity handle.
    pub fn handle(&self) -> RemoteHandle {
        RemoteHandle { object: self.id }
    }

    /// This export as a remote-kind dispatch value.
    pub fn to_value(&self) -> Value {
        Value::Remote(RemoteRef::Export(self.handle()))
    }

    /// Export the same object again after the collector reclaimed it. The
    /// identifier is stable; the generation is bumped past everything the
    /// peer may still hold.
    pub fn re_export(&self) -> Result<RemoteHandle, RpcError> {
        let session = self.session.upgrade().ok_or(RpcError::BrokerClosed)?;
        if session.broker.is_closed() {
            return Err(RpcError::BrokerClosed);
        }
        let vid = session.registry.export(self.skeleton.clone());
        Ok(RemoteHandle { object: vid.id })
    }
}

/// A listener yielding one accepted session per inbound TCP connection.
/// Connections that fail the handshake are skipped with a warning.
pub struct SessionServer {
    listener: TcpListener,
    config: SessionConfig,
}

impl SessionServer {
    /// Bind a TCP socket for inbound sessions.
    pub fn bind<A: ToSocketAddrs>(addr: A, config: SessionConfig) -> Result<SessionServer, RpcError> {
        let listener = TcpListener::bind(addr)
            .map_err(|e| RpcError::RemoteFailure(format!("cannot bind: {}", e)))?;
        Ok(SessionServer { listener, config })
    }

    /// The bound local address.
    pub fn local_addr(&self) -> Option<String> {
        self.listener.local_addr().ok().map(|a| a.to_string())
    }
}

impl Iterator for SessionServer {
    type Item = Session;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let stream = match self.listener.incoming().next() {
                Some(Ok(stream)) => stream,
                Some(Err(e)) => {
                    warn!("inbound connection failed: {}", e);
                    continue;
                }
                None => return None,
            };
            let peer = stream
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "unknown".to_string());
            let _ = stream.set_nodelay(true);
            match Session::accept(Wire::Tcp(stream), self.config.clone()) {
                Ok(session) => {
                    info!("accepted a session from {}", peer);
                    return Some(session);
                }
                Err(e) => {
                    warn!("handshake with {} failed: {}", peer, e);
                    continue;
                }
            }
        }
    }
}

/// Exchange and verify the fixed-size hello before the pump starts.
fn handshake(
    reader: &mut WireReader,
    writer: &mut WireWriter,
    config: &SessionConfig,
) -> Result<(), RpcError> {
    let mut hello = [0u8; 6];
    hello[..4].copy_from_slice(&HANDSHAKE_MAGIC.to_be_bytes());
    hello[4] = PROTOCOL_VERSION;
    hello[5] = config.codec.wire_id();
    writer
        .write_all(&hello)
        .and_then(|_| writer.flush())
        .map_err(|e| RpcError::RemoteFailure(format!("cannot send the handshake: {}", e)))?;

    let mut peer = [0u8; 6];
    reader.read_exact(&mut peer).map_err(|e| {
        RpcError::RemoteFailure(format!("the peer hung up during the handshake: {}", e))
    })?;
    if peer[..4] != HANDSHAKE_MAGIC.to_be_bytes() {
        return Err(RpcError::Corrupted(
            "the peer is not a session endpoint".to_string(),
        ));
    }
    if peer[4] != PROTOCOL_VERSION {
        return Err(RpcError::RemoteFailure(format!(
            "protocol version mismatch: ours {}, peer {}",
            PROTOCOL_VERSION, peer[4]
        )));
    }
    if peer[5] != config.codec.wire_id() {
        return Err(RpcError::RemoteFailure(format!(
            "object codec mismatch: ours {:?}, peer id {}",
            config.codec, peer[5]
        )));
    }
    Ok(())
}

/// Accept inbound channels until the broker closes, spawning one
/// invocation worker per channel.
fn accept_loop(session: Arc<SessionInner>) {
    let mut worker_id = 0usize;
    while let Ok(chan) = session.broker.accept() {
        worker_id += 1;
        let name = format!("{} invocation worker {}", session.config.name, worker_id);
        let worker_session = session.clone();
        if let Err(e) = std::thread::Builder::new()
            .name(name)
            .spawn(move || serve_channel(worker_session, chan))
        {
            error!("{}: cannot spawn an invocation worker: {}", session.config.name, e);
        }
    }
    debug!("{}: accept loop ended", session.config.name);
}

/// Serve invocations arriving on one channel until the peer retires it,
/// the session closes, or a protocol fault poisons it.
fn serve_channel(session: Arc<SessionInner>, chan: InvocationChannel) {
    loop {
        // the target prefix; a clean end-of-stream here is the peer
        // retiring an idle channel
        let mut input = chan.reader();
        let target = match input.read_identifier() {
            Ok(id) => id,
            Err(WireError::UnexpectedEof) => break,
            Err(e) => {
                if !session.is_closing() {
                    debug!("{}: channel died between invocations: {}", session.config.name, e);
                }
                break;
            }
        };
        let skeleton = match session.registry.lookup_local(target) {
            Ok(skeleton) => skeleton,
            Err(_) => {
                drop(input);
                warn!("{}: call on unknown object {}", session.config.name, target);
                // the parameters cannot be parsed without the metadata, so
                // reply and retire the channel
                fault_reply(
                    &chan,
                    &RemoteThrowable::new(
                        FAULT_NO_SUCH_OBJECT,
                        format!("no exported object {}", target),
                    ),
                );
                break;
            }
        };
        let method_id = match input.read_identifier() {
            Ok(id) => id,
            Err(_) => break,
        };
        let ordinal = match skeleton.ordinal_of(method_id) {
            Some(ordinal) => ordinal,
            None => {
                drop(input);
                warn!(
                    "{}: no method {} on {}",
                    session.config.name,
                    method_id,
                    skeleton.info().name
                );
                fault_reply(
                    &chan,
                    &RemoteThrowable::new(
                        FAULT_NO_SUCH_METHOD,
                        format!("no method {} on {}", method_id, skeleton.info().name),
                    ),
                );
                break;
            }
        };
        let method = skeleton.info().methods[ordinal].clone();
        let mut args = Vec::with_capacity(method.params.len());
        let mut read_failure = None;
        for param in &method.params {
            match marshal::read_param(&mut input, &session, param) {
                Ok(value) => args.push(value),
                Err(e) => {
                    read_failure = Some(e);
                    break;
                }
            }
        }
        drop(input);
        if let Some(e) = read_failure {
            warn!(
                "{}: cannot read the arguments of {}.{}: {}",
                session.config.name,
                skeleton.info().name,
                method.name,
                e
            );
            fault_reply(&chan, &marshal::marshal_failure(&e));
            break;
        }
        trace!(
            "{}: dispatching {}.{}",
            session.config.name,
            skeleton.info().name,
            method.name
        );
        match skeleton.handler(ordinal) {
            Some(MethodHandler::Sync(body)) => {
                let result = body(args);
                if !write_sync_reply(&session, &chan, &method, result) {
                    break;
                }
            }
            Some(MethodHandler::Async(body)) => {
                // nothing travels back on the channel, it is already free
                if let Err(cause) = body(args) {
                    session.report_async_failure(&method.name, cause);
                }
            }
            Some(MethodHandler::Pipe(body)) => {
                let pipe = InvocationPipe::new(chan, None);
                if let Err(cause) = body(args, pipe) {
                    session.report_async_failure(&method.name, cause);
                }
                return;
            }
            None => {
                // declared by the interface, absent from the dispatch
                // table: the implementation is older than the metadata it
                // serves, and the full request was already consumed
                warn!(
                    "{}: {}.{} is declared but not implemented",
                    session.config.name,
                    skeleton.info().name,
                    method.name
                );
                if method.pipe {
                    // nothing can be replied on a pipe, the caller
                    // observes end-of-stream
                    break;
                }
                let fault = RemoteThrowable::new(
                    FAULT_UNIMPLEMENTED_METHOD,
                    format!(
                        "{}.{} is declared but not implemented",
                        skeleton.info().name,
                        method.name
                    ),
                );
                if method.asynchronous && method.returns.is_none() {
                    session.report_async_failure(&method.name, fault);
                } else if !fault_reply(&chan, &fault) {
                    break;
                }
            }
        }
    }
    trace!("{}: invocation worker exiting", session.config.name);
}

/// Write a synchronous reply. Returns false when the channel is no longer
/// usable.
fn write_sync_reply(
    session: &Arc<SessionInner>,
    chan: &InvocationChannel,
    method: &RemoteMethod,
    result: Result<Value, RemoteThrowable>,
) -> bool {
    chan.clear_dirty();
    match try_write_sync_reply(session, chan, method, result) {
        Ok(()) => true,
        Err(e) => {
            warn!(
                "{}: cannot write the reply of {}: {}",
                session.config.name, method.name, e
            );
            // when nothing was flushed yet the channel is still clean and
            // a fault reply can take the place of the broken one
            !chan.is_dirty() && fault_reply(chan, &marshal::marshal_failure(&e))
        }
    }
}

fn try_write_sync_reply(
    session: &Arc<SessionInner>,
    chan: &InvocationChannel,
    method: &RemoteMethod,
    result: Result<Value, RemoteThrowable>,
) -> Result<(), RpcError> {
    let mut out = chan.writer();
    match result {
        Ok(value) => match &method.returns {
            None => out.write_ok(true)?,
            Some(r) if r.kind == ParamKind::Boolean && !r.boxed => match value {
                Value::Boolean(b) => out.write_ok(b)?,
                other => {
                    return Err(RpcError::NonSerializable(format!(
                        "{} must produce a boolean, got {}",
                        method.name,
                        other.kind_name()
                    )));
                }
            },
            Some(r) => {
                out.write_ok(true)?;
                marshal::write_param(&mut out, session, r, &value)?;
            }
        },
        Err(throwable) => out.write_throwable(&throwable)?,
    }
    out.flush()?;
    Ok(())
}

/// Best-effort failure reply; true when it reached the wire.
fn fault_reply(chan: &InvocationChannel, throwable: &RemoteThrowable) -> bool {
    let mut out = chan.writer();
    let sent = out
        .write_throwable(throwable)
        .and_then(|_| out.flush())
        .is_ok();
    if !sent {
        trace!("fault reply did not reach the peer");
    }
    sent
}
