//! Blocking calls: send a request, park the caller on a per-call semaphore,
//! and return whichever outcome wakes it first.

use crate::error::{Result, RpcError};
use crate::Core::alloc::RxBuffer;
use crate::Core::stats::LinkStats;
use crate::Core::sync::Semaphore;
use crate::RPC::correlation::Correlator;
use crate::RPC::header::{CallHeader, Opcode, Tsn, CALL_HEADER_SIZE};
use parking_lot::Mutex;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Lifecycle of one call. `Completed`, `Cancelled` and `TimedOut` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Issued,
    Waiting,
    Completed,
    Cancelled,
    TimedOut,
}

impl CallState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CallState::Completed | CallState::Cancelled | CallState::TimedOut
        )
    }
}

struct CallSlot {
    state: CallState,
    response: Option<RxBuffer>,
}

/// Pending-call record: lives in the correlation table while outstanding,
/// and is dropped once the caller has its outcome.
pub(crate) struct PendingCall {
    tsn: Tsn,
    sem: Semaphore,
    slot: Mutex<CallSlot>,
}

impl PendingCall {
    pub fn new(tsn: Tsn) -> Self {
        Self {
            tsn,
            sem: Semaphore::new(0),
            slot: Mutex::new(CallSlot {
                state: CallState::Issued,
                response: None,
            }),
        }
    }

    pub fn tsn(&self) -> Tsn {
        self.tsn
    }

    #[cfg(test)]
    pub fn state(&self) -> CallState {
        self.slot.lock().state
    }

    fn mark_waiting(&self) {
        let mut slot = self.slot.lock();
        // the response may already have landed
        if slot.state == CallState::Issued {
            slot.state = CallState::Waiting;
        }
    }

    /// Called by the correlator after removing the record from the table.
    pub fn complete(&self, packet: RxBuffer) {
        {
            let mut slot = self.slot.lock();
            if slot.state.is_terminal() {
                return;
            }
            slot.state = CallState::Completed;
            slot.response = Some(packet);
        }
        self.sem.give();
    }

    /// Called by the correlator after removing the record from the table.
    pub fn cancel(&self) {
        {
            let mut slot = self.slot.lock();
            if slot.state.is_terminal() {
                return;
            }
            slot.state = CallState::Cancelled;
        }
        self.sem.give();
    }

    fn time_out(&self) {
        self.slot.lock().state = CallState::TimedOut;
    }

    fn outcome(&self) -> Result<Response> {
        let mut slot = self.slot.lock();
        match slot.state {
            CallState::Completed => slot
                .response
                .take()
                .map(|packet| Response { packet })
                .ok_or(RpcError::Internal("completed call without a response")),
            CallState::Cancelled => Err(RpcError::PeerReset),
            CallState::TimedOut => Err(RpcError::Timeout),
            CallState::Issued | CallState::Waiting => {
                Err(RpcError::Internal("call woken without an outcome"))
            }
        }
    }
}

/// A response payload, still in the peer's outbound band.
///
/// Dropping it releases the buffer back to the peer.
pub struct Response {
    packet: RxBuffer,
}

impl Response {
    pub fn payload(&self) -> &[u8] {
        &self.packet[CALL_HEADER_SIZE..]
    }

    pub fn opcode(&self) -> Opcode {
        // decoded once already on the receive path
        CallHeader::decode(&self.packet).map_or(0, |h| h.opcode)
    }

    /// Release the shared buffer now.
    pub fn release(self) {
        drop(self);
    }
}

impl Deref for Response {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.payload()
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("opcode", &self.opcode())
            .field("len", &self.payload().len())
            .finish()
    }
}

impl Correlator {
    /// Issue a request and block until its response, a reset, or `timeout`.
    ///
    /// `None` waits indefinitely; a reset still unblocks it, including while
    /// the call is waiting for outbound blocks or for a free id.
    pub fn call(
        &self,
        opcode: Opcode,
        payload: &[u8],
        timeout: Option<Duration>,
    ) -> Result<Response> {
        let transport = self.transport();
        if !transport.is_ready() {
            return Err(RpcError::InvalidState("call before init"));
        }
        let total = CALL_HEADER_SIZE + payload.len();
        if total > transport.pool().max_payload() {
            return Err(RpcError::InvalidArgument(
                "payload larger than the outbound region",
            ));
        }
        let deadline = timeout.map(|limit| Instant::now() + limit);

        // blocks first, the id is only taken once the request can go out
        let epoch = self.table.lock().epoch;
        let reset = || self.table.lock().epoch != epoch || !transport.is_ready();
        let expired = || deadline.is_some_and(|d| Instant::now() >= d);
        let Some(mut buffer) = transport.pool().alloc_unless(total, || reset() || expired()) else {
            if reset() {
                return Err(RpcError::PeerReset);
            }
            LinkStats::bump(&self.stats.calls_timed_out);
            return Err(RpcError::Timeout);
        };
        buffer.as_mut_slice()[CALL_HEADER_SIZE..total].copy_from_slice(payload);

        let record = {
            let mut table = self.table.lock();
            let tsn = loop {
                if table.epoch != epoch {
                    return Err(RpcError::PeerReset);
                }
                if let Some(tsn) = table.allocate() {
                    break tsn;
                }
                // every id is outstanding until one retires
                match deadline {
                    None => self.tsn_freed.wait(&mut table),
                    Some(deadline) => {
                        if self.tsn_freed.wait_until(&mut table, deadline).timed_out() {
                            LinkStats::bump(&self.stats.calls_timed_out);
                            return Err(RpcError::Timeout);
                        }
                    }
                }
            };
            CallHeader::request(opcode, tsn).encode(&mut buffer.as_mut_slice()[..CALL_HEADER_SIZE]);
            let record = Arc::new(PendingCall::new(tsn));
            table.records.insert(tsn, record.clone());
            if let Err(e) = transport.send(buffer, total) {
                table.records.remove(&tsn);
                self.tsn_freed.notify_one();
                return Err(e);
            }
            record
        };
        LinkStats::bump(&self.stats.calls_issued);
        record.mark_waiting();
        tracing::trace!(opcode, tsn = record.tsn(), "call issued");

        let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        self.wait(&record, remaining)
    }

    fn wait(&self, record: &Arc<PendingCall>, timeout: Option<Duration>) -> Result<Response> {
        let woken = match timeout {
            None => {
                record.sem.take();
                true
            }
            Some(limit) => record.sem.take_timeout(limit),
        };

        if !woken {
            if self.retire(record) {
                // id is out of the table, a late response will be dropped as stale
                record.time_out();
                LinkStats::bump(&self.stats.calls_timed_out);
                tracing::debug!(tsn = record.tsn(), "call timed out");
                return Err(RpcError::Timeout);
            }
            // completion or reset claimed the record first; its give is imminent
            record.sem.take();
        }
        record.outcome()
    }
}
