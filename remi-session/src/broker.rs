use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use remi_wire::ObjectCodec;

use crate::channel::InvocationChannel;
use crate::mux::{MuxChannel, Multiplexer};
use crate::RpcError;

/// How often a blocked `connect` re-checks for shutdown.
const CONNECT_WAIT_SLICE: Duration = Duration::from_millis(100);

/// The pool of invocation channels over one multiplexed wire.
///
/// `connect` prefers a recycled idle channel and opens a fresh virtual
/// channel otherwise, blocking when the configured capacity of
/// concurrently open outbound channels is reached. `accept` yields the
/// channels the peer opened. Recycling returns a clean channel to the
/// pool; poisoned or surplus channels are closed instead. Closing the
/// broker is terminal: the pool is drained and every later operation
/// fails with [`RpcError::BrokerClosed`].
pub(crate) struct Broker {
    mux: Arc<Multiplexer>,
    accept_rx: Receiver<MuxChannel>,
    pool: Mutex<PoolState>,
    available: Condvar,
    codec: ObjectCodec,
    capacity: usize,
    idle_timeout: Duration,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    closed: AtomicBool,
}

struct PoolState {
    /// Idle outbound channels, oldest first.
    idle: VecDeque<(InvocationChannel, Instant)>,
    /// Outbound channels currently open (idle or in use).
    open: usize,
}

impl Broker {
    pub(crate) fn new(
        mux: Arc<Multiplexer>,
        accept_rx: Receiver<MuxChannel>,
        codec: ObjectCodec,
        capacity: usize,
        idle_timeout: Duration,
        read_timeout: Option<Duration>,
        write_timeout: Option<Duration>,
    ) -> Broker {
        Broker {
            mux,
            accept_rx,
            pool: Mutex::new(PoolState {
                idle: VecDeque::new(),
                open: 0,
            }),
            available: Condvar::new(),
            codec,
            capacity: capacity.max(1),
            idle_timeout,
            read_timeout,
            write_timeout,
            closed: AtomicBool::new(false),
        }
    }

    /// A channel ready for a new outbound invocation.
    pub(crate) fn connect(&self) -> Result<InvocationChannel, RpcError> {
        let mut pool = self.pool.lock().expect("Cannot lock channel pool");
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(RpcError::BrokerClosed);
            }
            // retire channels that sat idle past the timeout
            while pool
                .idle
                .front()
                .map_or(false, |(_, since)| since.elapsed() >= self.idle_timeout)
            {
                let (chan, _) = pool.idle.pop_front().expect("idle pool emptied under us");
                pool.open -= 1;
                trace!("closing idle channel after {:?}", self.idle_timeout);
                drop(chan);
            }
            // most recently recycled first, it is the least likely to be
            // half-way through an idle retirement on the peer
            if let Some((chan, _)) = pool.idle.pop_back() {
                return Ok(chan);
            }
            if pool.open < self.capacity {
                pool.open += 1;
                drop(pool);
                return match self.mux.open() {
                    Ok(channel) => Ok(InvocationChannel::from_mux(
                        channel,
                        self.codec,
                        self.read_timeout,
                        self.write_timeout,
                    )),
                    Err(e) => {
                        self.pool.lock().expect("Cannot lock channel pool").open -= 1;
                        self.available.notify_one();
                        Err(e)
                    }
                };
            }
            let (restored, _timeout) = self
                .available
                .wait_timeout(pool, CONNECT_WAIT_SLICE)
                .expect("Cannot wait on channel pool");
            pool = restored;
        }
    }

    /// Block until the peer opens a channel with an incoming invocation.
    pub(crate) fn accept(&self) -> Result<InvocationChannel, RpcError> {
        let channel = self.accept_rx.recv().map_err(|_| RpcError::BrokerClosed)?;
        Ok(InvocationChannel::from_mux(
            channel,
            self.codec,
            self.read_timeout,
            self.write_timeout,
        ))
    }

    /// Return a channel to the pool for future outbound reuse. A poisoned
    /// or already closed channel is discarded instead, so a dropped
    /// channel can never reappear in the pool.
    pub(crate) fn recycle(&self, chan: InvocationChannel) {
        let unfit = chan.is_poisoned() || chan.is_closed() || self.closed.load(Ordering::SeqCst);
        let mut pool = self.pool.lock().expect("Cannot lock channel pool");
        if unfit {
            pool.open -= 1;
            drop(chan);
        } else {
            chan.clear_dirty();
            pool.idle.push_back((chan, Instant::now()));
        }
        drop(pool);
        self.available.notify_one();
    }

    /// Give up an outbound channel for good, freeing its capacity slot.
    pub(crate) fn discard(&self, chan: InvocationChannel) {
        self.pool.lock().expect("Cannot lock channel pool").open -= 1;
        drop(chan);
        self.available.notify_one();
    }

    /// Terminal shutdown: close the wire and every pooled channel.
    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("closing the broker");
        self.mux.shutdown();
        let mut pool = self.pool.lock().expect("Cannot lock channel pool");
        while let Some((chan, _)) = pool.idle.pop_front() {
            pool.open -= 1;
            drop(chan);
        }
        drop(pool);
        self.available.notify_all();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Idle channels currently pooled.
    pub(crate) fn pooled(&self) -> usize {
        self.pool.lock().expect("Cannot lock channel pool").idle.len()
    }

    /// Virtual channels opened on this wire so far, both directions.
    pub(crate) fn opened_total(&self) -> u64 {
        self.mux.opened_total()
    }

    /// Informational addresses of the wire: `(local, peer)`.
    pub(crate) fn addresses(&self) -> (Option<String>, Option<String>) {
        self.mux.addresses()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::mux::Wire;

    use super::*;

    fn broker_pair(capacity: usize, idle: Duration) -> (Broker, Broker, Vec<std::thread::JoinHandle<()>>) {
        let (wa, wb) = Wire::local_pair();
        let (ra, wa_w) = wa.split().unwrap();
        let (rb, wb_w) = wb.split().unwrap();
        let (mux_a, accept_a, pump_a) =
            Multiplexer::start("a".into(), ra, wa_w, true, (None, None));
        let (mux_b, accept_b, pump_b) =
            Multiplexer::start("b".into(), rb, wb_w, false, (None, None));
        let a = Broker::new(mux_a, accept_a, ObjectCodec::Bincode, capacity, idle, None, None);
        let b = Broker::new(mux_b, accept_b, ObjectCodec::Bincode, capacity, idle, None, None);
        (a, b, vec![pump_a, pump_b])
    }

    #[test]
    fn test_connect_prefers_the_pool() {
        let (a, b, pumps) = broker_pair(8, Duration::from_secs(60));
        let chan = a.connect().unwrap();
        a.recycle(chan);
        assert_eq!(a.pooled(), 1);
        let _again = a.connect().unwrap();
        assert_eq!(a.pooled(), 0);
        assert_eq!(a.opened_total(), 1);
        a.close();
        b.close();
        for p in pumps {
            p.join().unwrap();
        }
    }

    #[test]
    fn test_poisoned_channel_never_returns() {
        let (a, b, pumps) = broker_pair(8, Duration::from_secs(60));
        let chan = a.connect().unwrap();
        chan.poison();
        a.recycle(chan);
        assert_eq!(a.pooled(), 0);
        // the slot was freed, a new channel can be opened
        let _fresh = a.connect().unwrap();
        assert_eq!(a.opened_total(), 2);
        a.close();
        b.close();
        for p in pumps {
            p.join().unwrap();
        }
    }

    #[test]
    fn test_capacity_blocks_until_recycle() {
        let (a, b, pumps) = broker_pair(1, Duration::from_secs(60));
        let a = Arc::new(a);
        let chan = a.connect().unwrap();
        let a2 = a.clone();
        let waiter = std::thread::spawn(move || a2.connect().map(|c| a2.recycle(c)));
        std::thread::sleep(Duration::from_millis(50));
        a.recycle(chan);
        waiter.join().unwrap().unwrap();
        a.close();
        b.close();
        for p in pumps {
            p.join().unwrap();
        }
    }

    #[test]
    fn test_closed_broker_rejects_everything() {
        let (a, b, pumps) = broker_pair(8, Duration::from_secs(60));
        a.close();
        assert!(matches!(a.connect(), Err(RpcError::BrokerClosed)));
        assert!(matches!(a.accept(), Err(RpcError::BrokerClosed)));
        b.close();
        for p in pumps {
            p.join().unwrap();
        }
    }

    #[test]
    fn test_idle_channels_are_retired() {
        let (a, b, pumps) = broker_pair(8, Duration::from_millis(10));
        let chan = a.connect().unwrap();
        a.recycle(chan);
        std::thread::sleep(Duration::from_millis(30));
        let _fresh = a.connect().unwrap();
        // the idle channel was pruned, a second one had to be opened
        assert_eq!(a.opened_total(), 2);
        a.close();
        b.close();
        for p in pumps {
            p.join().unwrap();
        }
    }
}
