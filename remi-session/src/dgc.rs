//! The distributed garbage collector.
//!
//! Each side periodically walks its imported map: stubs that appeared
//! since the last round are announced, stubs that died are reported as
//! removals at the export generation they were last seen. The peer
//! reclaims an export only when a removal's generation has caught up with
//! the current one, so a drop racing a re-export is recognizably stale and
//! ignored.

use std::sync::Arc;
use std::time::Duration;

use crate::control;
use crate::session::SessionInner;
use crate::RpcError;

/// Slice the configured interval so shutdown is noticed promptly.
const WAIT_SLICE: Duration = Duration::from_millis(50);

/// Body of the per-session collector thread.
pub(crate) fn collector_loop(session: Arc<SessionInner>) {
    let interval = session.config.dgc_interval;
    loop {
        let mut waited = Duration::ZERO;
        while waited < interval {
            if session.is_closing() {
                return;
            }
            let step = WAIT_SLICE.min(interval - waited);
            std::thread::sleep(step);
            waited += step;
        }
        if session.is_closing() {
            return;
        }
        let update = session.registry.reference_round();
        if update.is_empty() {
            continue;
        }
        debug!(
            "{}: reference round, {} added, {} removed",
            session.config.name,
            update.added.len(),
            update.removed.len()
        );
        match control::send_reference_update(&session, &update) {
            Ok(()) => {}
            Err(RpcError::BrokerClosed) => return,
            // a dead channel is not fatal: requeue the diff so the next
            // round carries it again
            Err(e) => {
                warn!("{}: cannot send the reference update: {}", session.config.name, e);
                session.registry.requeue(update);
            }
        }
    }
}
