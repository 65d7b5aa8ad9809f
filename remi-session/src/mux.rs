//! Virtual-channel multiplexing over one byte transport.
//!
//! A session owns exactly one [`Wire`] to its peer. The [`Multiplexer`]
//! frames that wire into any number of virtual full-duplex channels, so
//! concurrent invocations never contend for the transport itself:
//!
//! - every frame is `channel id (u32) | opcode (u8) | length (u32) |
//!   payload`, big-endian;
//! - `OPEN` announces a channel the peer just created, `DATA` carries
//!   payload bytes, `CLOSE` retires a channel;
//! - a single pump thread reads frames and routes payloads into
//!   per-channel inboxes; newly opened inbound channels are queued for the
//!   broker's accept loop;
//! - the side that initiated the session allocates odd channel ids, the
//!   accepting side even ones, so the two ends never collide.
//!
//! The mux envelope is transport territory: the invocation encodings of
//! `remi-wire` only ever appear inside `DATA` payloads.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use crate::RpcError;

/// Frame opcode: the sender just created this channel.
const OPEN: u8 = 1;
/// Frame opcode: payload bytes for an existing channel.
const DATA: u8 = 2;
/// Frame opcode: the sender retired this channel.
const CLOSE: u8 = 3;

/// Largest payload carried by a single DATA frame; writers chunk, readers
/// treat anything bigger as a corrupted wire.
const FRAME_LIMIT: usize = 1 << 20;

/// One byte transport owned by a session.
pub enum Wire {
    /// A TCP connection to the peer.
    Tcp(TcpStream),
    /// An in-memory duplex to a peer in the same process.
    Local(LocalDuplex),
}

/// The in-memory transport; create connected pairs with
/// [`Wire::local_pair`].
pub struct LocalDuplex {
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
    /// Sender feeding our own receiver, used to inject the end-of-stream
    /// sentinel on shutdown.
    wake: Sender<Vec<u8>>,
}

impl Wire {
    /// Make a connected pair of in-memory wires.
    pub fn local_pair() -> (Wire, Wire) {
        let (a_tx, b_rx) = unbounded();
        let (b_tx, a_rx) = unbounded();
        let a = LocalDuplex {
            tx: a_tx.clone(),
            rx: a_rx,
            wake: b_tx.clone(),
        };
        let b = LocalDuplex {
            tx: b_tx,
            rx: b_rx,
            wake: a_tx,
        };
        (Wire::Local(a), Wire::Local(b))
    }

    /// Informational address strings: `(local, peer)`.
    pub fn address_strings(&self) -> (Option<String>, Option<String>) {
        match self {
            Wire::Tcp(stream) => (
                stream.local_addr().ok().map(|a| a.to_string()),
                stream.peer_addr().ok().map(|a| a.to_string()),
            ),
            Wire::Local(_) => (None, None),
        }
    }

    /// Split into independently owned reading and writing halves.
    pub(crate) fn split(self) -> io::Result<(WireReader, WireWriter)> {
        match self {
            Wire::Tcp(stream) => {
                let reader = stream.try_clone()?;
                Ok((WireReader::Tcp(reader), WireWriter::Tcp(stream)))
            }
            Wire::Local(duplex) => Ok((
                WireReader::Local {
                    rx: duplex.rx,
                    carry: Vec::new(),
                    pos: 0,
                },
                WireWriter::Local {
                    tx: duplex.tx,
                    wake: duplex.wake,
                },
            )),
        }
    }
}

/// The reading half of a wire.
pub(crate) enum WireReader {
    /// Clone of the TCP stream, read side.
    Tcp(TcpStream),
    /// In-memory chunks; an empty chunk is the end-of-stream sentinel.
    Local {
        rx: Receiver<Vec<u8>>,
        carry: Vec<u8>,
        pos: usize,
    },
}

impl Read for WireReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            WireReader::Tcp(stream) => stream.read(buf),
            WireReader::Local { rx, carry, pos } => {
                while *pos >= carry.len() {
                    match rx.recv() {
                        Ok(chunk) if chunk.is_empty() => return Ok(0),
                        Ok(chunk) => {
                            *carry = chunk;
                            *pos = 0;
                        }
                        Err(_) => return Ok(0),
                    }
                }
                let n = buf.len().min(carry.len() - *pos);
                buf[..n].copy_from_slice(&carry[*pos..*pos + n]);
                *pos += n;
                Ok(n)
            }
        }
    }
}

/// The writing half of a wire.
pub(crate) enum WireWriter {
    /// The TCP stream, write side.
    Tcp(TcpStream),
    /// In-memory chunks to the peer plus the self-wake sender.
    Local {
        tx: Sender<Vec<u8>>,
        wake: Sender<Vec<u8>>,
    },
    /// The wire has been shut down.
    Closed,
}

impl WireWriter {
    fn set_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            WireWriter::Tcp(stream) => stream.set_write_timeout(timeout),
            _ => Ok(()),
        }
    }

    /// Release the transport, waking both pumps.
    fn shutdown(self) {
        match self {
            WireWriter::Tcp(stream) => {
                let _ = stream.shutdown(Shutdown::Both);
            }
            WireWriter::Local { tx, wake } => {
                // end-of-stream for the peer (sender drop) and for us
                let _ = wake.send(Vec::new());
                drop(tx);
            }
            WireWriter::Closed => {}
        }
    }
}

impl Write for WireWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            WireWriter::Tcp(stream) => stream.write(buf),
            WireWriter::Local { tx, .. } => tx
                .send(buf.to_vec())
                .map(|_| buf.len())
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer wire is gone")),
            WireWriter::Closed => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "wire is shut down",
            )),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            WireWriter::Tcp(stream) => stream.flush(),
            _ => Ok(()),
        }
    }
}

/// The shared state of one multiplexed wire.
pub(crate) struct Multiplexer {
    label: String,
    writer: Mutex<WireWriter>,
    /// Routing table: channel id to its inbox sender.
    channels: Mutex<HashMap<u32, Sender<Vec<u8>>>>,
    next_id: AtomicU32,
    closed: AtomicBool,
    /// Virtual channels opened from either side over the session lifetime.
    opened_total: AtomicU64,
    local_addr: Option<String>,
    peer_addr: Option<String>,
}

impl Multiplexer {
    /// Wrap a split wire and spawn the pump thread. Returns the shared
    /// handle, the queue of peer-opened channels, and the pump join
    /// handle.
    pub(crate) fn start(
        label: String,
        reader: WireReader,
        writer: WireWriter,
        initiator: bool,
        addresses: (Option<String>, Option<String>),
    ) -> (Arc<Multiplexer>, Receiver<MuxChannel>, JoinHandle<()>) {
        let mux = Arc::new(Multiplexer {
            label: label.clone(),
            writer: Mutex::new(writer),
            channels: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(if initiator { 1 } else { 2 }),
            closed: AtomicBool::new(false),
            opened_total: AtomicU64::new(0),
            local_addr: addresses.0,
            peer_addr: addresses.1,
        });
        let (accept_tx, accept_rx) = unbounded();
        let pump_mux = mux.clone();
        let pump = std::thread::Builder::new()
            .name(format!("{} multiplexer pump", label))
            .spawn(move || pump_mux.pump(reader, accept_tx))
            .expect("Failed to spawn multiplexer pump");
        (mux, accept_rx, pump)
    }

    /// Open a new outbound virtual channel.
    pub(crate) fn open(self: &Arc<Multiplexer>) -> Result<MuxChannel, RpcError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RpcError::BrokerClosed);
        }
        let id = self.next_id.fetch_add(2, Ordering::SeqCst);
        let (tx, rx) = unbounded();
        self.channels
            .lock()
            .expect("Cannot lock multiplexer routing table")
            .insert(id, tx);
        if let Err(e) = self.write_frame(id, OPEN, &[], None) {
            self.channels
                .lock()
                .expect("Cannot lock multiplexer routing table")
                .remove(&id);
            return Err(RpcError::RemoteFailure(format!(
                "cannot open channel {}: {}",
                id, e
            )));
        }
        self.opened_total.fetch_add(1, Ordering::Relaxed);
        trace!("{}: opened channel {}", self.label, id);
        Ok(MuxChannel::new(id, self, rx))
    }

    /// Virtual channels opened from either side so far.
    pub(crate) fn opened_total(&self) -> u64 {
        self.opened_total.load(Ordering::Relaxed)
    }

    /// Informational addresses: `(local, peer)`.
    pub(crate) fn addresses(&self) -> (Option<String>, Option<String>) {
        (self.local_addr.clone(), self.peer_addr.clone())
    }

    /// Shut the wire down: every channel EOFs, both pumps wake up and
    /// exit, and further opens fail.
    pub(crate) fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("{}: shutting down the wire", self.label);
        let writer = std::mem::replace(
            &mut *self.writer.lock().expect("Cannot lock wire writer"),
            WireWriter::Closed,
        );
        writer.shutdown();
        self.channels
            .lock()
            .expect("Cannot lock multiplexer routing table")
            .clear();
    }

    fn write_frame(
        &self,
        id: u32,
        opcode: u8,
        payload: &[u8],
        timeout: Option<Duration>,
    ) -> io::Result<()> {
        let mut writer = self.writer.lock().expect("Cannot lock wire writer");
        writer.set_timeout(timeout)?;
        let mut header = [0u8; 9];
        header[..4].copy_from_slice(&id.to_be_bytes());
        header[4] = opcode;
        header[5..].copy_from_slice(&(payload.len() as u32).to_be_bytes());
        writer.write_all(&header)?;
        writer.write_all(payload)?;
        writer.flush()
    }

    /// Send payload bytes on a channel, chunked to the frame limit.
    fn write_data(&self, id: u32, payload: &[u8], timeout: Option<Duration>) -> io::Result<()> {
        for chunk in payload.chunks(FRAME_LIMIT) {
            self.write_frame(id, DATA, chunk, timeout)?;
        }
        Ok(())
    }

    /// Retire a channel: stop routing to it and tell the peer.
    fn close_channel(&self, id: u32) {
        self.channels
            .lock()
            .expect("Cannot lock multiplexer routing table")
            .remove(&id);
        if !self.closed.load(Ordering::SeqCst) {
            if let Err(e) = self.write_frame(id, CLOSE, &[], None) {
                trace!("{}: cannot send CLOSE for channel {}: {}", self.label, id, e);
            }
        }
        trace!("{}: closed channel {}", self.label, id);
    }

    /// Pump body: route frames until the wire dies, then tear down.
    fn pump(self: Arc<Multiplexer>, mut reader: WireReader, accept_tx: Sender<MuxChannel>) {
        loop {
            let mut header = [0u8; 9];
            if let Err(e) = reader.read_exact(&mut header) {
                if e.kind() != io::ErrorKind::UnexpectedEof {
                    debug!("{}: wire read failed: {}", self.label, e);
                }
                break;
            }
            let id = u32::from_be_bytes(header[..4].try_into().expect("bad header slice"));
            let opcode = header[4];
            let len = u32::from_be_bytes(header[5..].try_into().expect("bad header slice")) as usize;
            if len > FRAME_LIMIT {
                error!("{}: oversized frame of {} bytes, dropping the wire", self.label, len);
                break;
            }
            let mut payload = vec![0u8; len];
            if reader.read_exact(&mut payload).is_err() {
                break;
            }
            match opcode {
                OPEN => {
                    let (tx, rx) = unbounded();
                    self.channels
                        .lock()
                        .expect("Cannot lock multiplexer routing table")
                        .insert(id, tx);
                    self.opened_total.fetch_add(1, Ordering::Relaxed);
                    trace!("{}: peer opened channel {}", self.label, id);
                    if accept_tx.send(MuxChannel::new(id, &self, rx)).is_err() {
                        // nobody accepting anymore
                        break;
                    }
                }
                DATA => {
                    let sender = self
                        .channels
                        .lock()
                        .expect("Cannot lock multiplexer routing table")
                        .get(&id)
                        .cloned();
                    match sender {
                        // receiver may be gone mid-close, that is fine
                        Some(tx) => drop(tx.send(payload)),
                        None => trace!("{}: data for unknown channel {}", self.label, id),
                    }
                }
                CLOSE => {
                    self.channels
                        .lock()
                        .expect("Cannot lock multiplexer routing table")
                        .remove(&id);
                    trace!("{}: peer closed channel {}", self.label, id);
                }
                _ => {
                    error!("{}: invalid frame opcode {}, dropping the wire", self.label, opcode);
                    break;
                }
            }
        }
        self.shutdown();
        debug!("{}: multiplexer pump exiting", self.label);
    }
}

/// A freshly opened or accepted virtual channel: the shared port for
/// writing and closing, and the exclusive inbox for reading.
pub(crate) struct MuxChannel {
    pub(crate) port: MuxPort,
    pub(crate) inbox: MuxInbox,
}

impl MuxChannel {
    fn new(id: u32, mux: &Arc<Multiplexer>, rx: Receiver<Vec<u8>>) -> MuxChannel {
        let closed = Arc::new(AtomicBool::new(false));
        MuxChannel {
            port: MuxPort {
                id,
                mux: mux.clone(),
                closed: closed.clone(),
            },
            inbox: MuxInbox {
                rx,
                carry: Vec::new(),
                pos: 0,
                closed,
            },
        }
    }
}

/// Cheap handle for the write/close side of a virtual channel.
#[derive(Clone)]
pub(crate) struct MuxPort {
    id: u32,
    mux: Arc<Multiplexer>,
    closed: Arc<AtomicBool>,
}

impl MuxPort {
    /// Send payload bytes to the peer end of this channel.
    pub(crate) fn write(&self, payload: &[u8], timeout: Option<Duration>) -> io::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "channel is closed",
            ));
        }
        self.mux.write_data(self.id, payload, timeout)
    }

    /// Retire the channel. Idempotent; any in-flight read observes
    /// end-of-stream or the closed error.
    pub(crate) fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.mux.close_channel(self.id);
        }
    }

    /// Whether this end closed the channel.
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Informational addresses of the underlying wire: `(local, peer)`.
    pub(crate) fn addresses(&self) -> (Option<String>, Option<String>) {
        self.mux.addresses()
    }
}

/// The exclusive read side of a virtual channel.
pub(crate) struct MuxInbox {
    rx: Receiver<Vec<u8>>,
    carry: Vec<u8>,
    pos: usize,
    closed: Arc<AtomicBool>,
}

impl MuxInbox {
    /// Read available payload bytes, waiting up to `timeout` (forever when
    /// `None`). Returns 0 at end-of-stream.
    pub(crate) fn read(&mut self, buf: &mut [u8], timeout: Option<Duration>) -> io::Result<usize> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "channel is closed",
            ));
        }
        while self.pos >= self.carry.len() {
            let chunk = match timeout {
                Some(t) => match self.rx.recv_timeout(t) {
                    Ok(chunk) => Ok(chunk),
                    Err(RecvTimeoutError::Timeout) => {
                        return Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "channel read timed out",
                        ));
                    }
                    Err(RecvTimeoutError::Disconnected) => Err(()),
                },
                None => self.rx.recv().map_err(|_| ()),
            };
            match chunk {
                Ok(chunk) => {
                    self.carry = chunk;
                    self.pos = 0;
                }
                Err(()) => return Ok(0),
            }
        }
        let n = buf.len().min(self.carry.len() - self.pos);
        buf[..n].copy_from_slice(&self.carry[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}
