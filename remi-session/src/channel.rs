use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use remi_wire::{InvocationInput, InvocationOutput, ObjectCodec};

use crate::broker::Broker;
use crate::mux::{MuxChannel, MuxInbox, MuxPort};

/// Flush the write buffer once it grows past this size.
const WRITE_BUFFER_LIMIT: usize = 64 * 1024;

/// One full-duplex invocation channel drawn from the broker.
///
/// A channel carries at most one invocation at a time; exclusivity is
/// enforced by ownership, since a channel is moved into the invocation
/// that uses it and only returns to the pool through the broker. Reads
/// and writes honor independent timeouts that may be adjusted while I/O
/// is in flight on another thread. Dropping a channel without recycling
/// it closes it.
pub struct InvocationChannel {
    kind: ChannelKind,
    codec: ObjectCodec,
    read_timeout: Mutex<Option<Duration>>,
    write_timeout: Mutex<Option<Duration>>,
    /// A poisoned channel must never return to the pool.
    poisoned: AtomicBool,
    /// Whether any byte reached the wire since the last recycle.
    dirty: AtomicBool,
}

enum ChannelKind {
    /// A live virtual channel of the session's multiplexer.
    Mux {
        port: MuxPort,
        inbox: Mutex<MuxInbox>,
    },
    /// The placeholder channel: every operation fails as not connected.
    Unconnected,
}

impl InvocationChannel {
    pub(crate) fn from_mux(
        channel: MuxChannel,
        codec: ObjectCodec,
        read_timeout: Option<Duration>,
        write_timeout: Option<Duration>,
    ) -> InvocationChannel {
        InvocationChannel {
            kind: ChannelKind::Mux {
                port: channel.port,
                inbox: Mutex::new(channel.inbox),
            },
            codec,
            read_timeout: Mutex::new(read_timeout),
            write_timeout: Mutex::new(write_timeout),
            poisoned: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
        }
    }

    /// The placeholder channel that is connected to nothing.
    pub fn unconnected(codec: ObjectCodec) -> InvocationChannel {
        InvocationChannel {
            kind: ChannelKind::Unconnected,
            codec,
            read_timeout: Mutex::new(None),
            write_timeout: Mutex::new(None),
            poisoned: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
        }
    }

    /// The codec this channel's streams encode user objects with.
    pub fn codec(&self) -> ObjectCodec {
        self.codec
    }

    /// An invocation input bound to this channel. The input owns the read
    /// half for its lifetime and is also one sharing scope.
    pub fn reader(&self) -> InvocationInput<ChannelReader<'_>> {
        let guard = match &self.kind {
            ChannelKind::Mux { inbox, .. } => {
                Some(inbox.lock().expect("Cannot lock channel read half"))
            }
            ChannelKind::Unconnected => None,
        };
        InvocationInput::new(ChannelReader { chan: self, guard }, self.codec)
    }

    /// An invocation output bound to this channel, buffering until flushed
    /// and forming one sharing scope. Bytes left unflushed when the output
    /// drops are discarded.
    pub fn writer(&self) -> InvocationOutput<ChannelWriter<'_>> {
        InvocationOutput::new(
            ChannelWriter {
                chan: self,
                buf: Vec::new(),
            },
            self.codec,
        )
    }

    /// The read deadline applied to each blocking read.
    pub fn read_timeout(&self) -> Option<Duration> {
        *self.read_timeout.lock().expect("Cannot lock read timeout")
    }

    /// Set the read deadline; safe while another thread is reading.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) {
        *self.read_timeout.lock().expect("Cannot lock read timeout") = timeout;
    }

    /// The write deadline applied to each flush.
    pub fn write_timeout(&self) -> Option<Duration> {
        *self.write_timeout.lock().expect("Cannot lock write timeout")
    }

    /// Set the write deadline; safe while another thread is writing.
    pub fn set_write_timeout(&self, timeout: Option<Duration>) {
        *self.write_timeout.lock().expect("Cannot lock write timeout") = timeout;
    }

    /// Close the channel, releasing its transport slot immediately. Any
    /// in-flight read fails with the closed error. Idempotent.
    pub fn close(&self) {
        if let ChannelKind::Mux { port, .. } = &self.kind {
            port.close();
        }
    }

    /// Whether this end closed the channel.
    pub fn is_closed(&self) -> bool {
        match &self.kind {
            ChannelKind::Mux { port, .. } => port.is_closed(),
            ChannelKind::Unconnected => false,
        }
    }

    /// Informational local address, when the transport has one.
    pub fn local_address_string(&self) -> Option<String> {
        match &self.kind {
            ChannelKind::Mux { port, .. } => port.addresses().0,
            ChannelKind::Unconnected => None,
        }
    }

    /// Informational peer address, when the transport has one.
    pub fn remote_address_string(&self) -> Option<String> {
        match &self.kind {
            ChannelKind::Mux { port, .. } => port.addresses().1,
            ChannelKind::Unconnected => None,
        }
    }

    /// Mark the channel unfit for the pool.
    pub(crate) fn poison(&self) {
        self.poisoned.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::SeqCst)
    }

    /// Whether any byte reached the wire since the last recycle.
    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    pub(crate) fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::SeqCst);
    }
}

impl Drop for InvocationChannel {
    fn drop(&mut self) {
        self.close();
    }
}

/// The exclusive read half of a channel for the duration of one input.
pub struct ChannelReader<'a> {
    chan: &'a InvocationChannel,
    guard: Option<MutexGuard<'a, MuxInbox>>,
}

impl Read for ChannelReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.guard {
            Some(inbox) => {
                let timeout = self.chan.read_timeout();
                inbox.read(buf, timeout)
            }
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "channel is not connected",
            )),
        }
    }
}

/// The buffering write half of a channel for the duration of one output.
pub struct ChannelWriter<'a> {
    chan: &'a InvocationChannel,
    buf: Vec<u8>,
}

impl ChannelWriter<'_> {
    fn flush_buf(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        match &self.chan.kind {
            ChannelKind::Mux { port, .. } => {
                let timeout = self.chan.write_timeout();
                port.write(&self.buf, timeout)?;
                self.chan.dirty.store(true, Ordering::SeqCst);
                self.buf.clear();
                Ok(())
            }
            ChannelKind::Unconnected => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "channel is not connected",
            )),
        }
    }
}

impl Write for ChannelWriter<'_> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if matches!(self.chan.kind, ChannelKind::Unconnected) {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "channel is not connected",
            ));
        }
        self.buf.extend_from_slice(data);
        if self.buf.len() >= WRITE_BUFFER_LIMIT {
            self.flush_buf()?;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_buf()
    }
}

/// A user-controlled bidirectional byte pipe opened by a pipe-flavored
/// method, once its declared parameters have been consumed.
///
/// Both ends read and write through the usual invocation streams; the
/// underlying channel never returns to the pool and closes when the pipe
/// drops. This is the extension point for streaming parameters and
/// results: the protocol ends where the pipe begins, and the two method
/// implementations own the framing from there on.
pub struct InvocationPipe {
    chan: Option<InvocationChannel>,
    /// Present on the calling side, where the channel counts against the
    /// broker's capacity and must be given back on drop.
    broker: Option<Arc<Broker>>,
}

impl InvocationPipe {
    pub(crate) fn new(chan: InvocationChannel, broker: Option<Arc<Broker>>) -> InvocationPipe {
        InvocationPipe {
            chan: Some(chan),
            broker,
        }
    }

    fn chan(&self) -> &InvocationChannel {
        self.chan.as_ref().expect("pipe channel taken")
    }

    /// A typed input over the pipe. Each call starts a fresh sharing
    /// scope.
    pub fn input(&self) -> InvocationInput<ChannelReader<'_>> {
        self.chan().reader()
    }

    /// A typed output over the pipe. Each call starts a fresh sharing
    /// scope; remember to flush.
    pub fn output(&self) -> InvocationOutput<ChannelWriter<'_>> {
        self.chan().writer()
    }

    /// Set the read deadline of the underlying channel.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) {
        self.chan().set_read_timeout(timeout);
    }

    /// Set the write deadline of the underlying channel.
    pub fn set_write_timeout(&self, timeout: Option<Duration>) {
        self.chan().set_write_timeout(timeout);
    }

    /// Informational local address, when the transport has one.
    pub fn local_address_string(&self) -> Option<String> {
        self.chan().local_address_string()
    }

    /// Informational peer address, when the transport has one.
    pub fn remote_address_string(&self) -> Option<String> {
        self.chan().remote_address_string()
    }

    /// Close the pipe. Equivalent to dropping it.
    pub fn close(self) {}
}

impl Drop for InvocationPipe {
    fn drop(&mut self) {
        if let Some(chan) = self.chan.take() {
            chan.poison();
            match &self.broker {
                Some(broker) => broker.discard(chan),
                None => drop(chan),
            }
        }
    }
}
