//! Request/response correlation.
//!
//! Every outgoing request gets a transaction id (tsn) and a pending-call
//! record in a table owned by this [`Correlator`]. Inbound packets are split
//! by the header's kind: responses complete the record carrying their tsn,
//! requests are routed by opcode to a registered handler.
//!
//! Ids are scoped to the issuing core. The kind field tells a peer request
//! apart from a response to one of ours, so both sides may have the same
//! numeric tsn outstanding at once.
//!
//! The table mutex covers id allocation, the insert and the non-blocking
//! send of a new request, so a reset can never slip between numbering a
//! request and putting it on the wire. It is never held while a handler
//! runs or a waiter is woken.

use crate::error::{Result, RpcError};
use crate::Core::alloc::RxBuffer;
use crate::Core::stats::LinkStats;
use crate::Core::sync::{fatal, RpcMutex};
use crate::RPC::call::PendingCall;
use crate::RPC::header::{CallHeader, Kind, Opcode, Tsn, CALL_HEADER_SIZE, FIRST_TSN};
use crate::RPC::transport::{PacketSink, Transport};
use crate::RPC::worker::{Job, RequestHandler, RequestWorker};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Where peer-initiated requests run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dispatch {
    /// On the delivery path itself. For single-threaded builds; handlers
    /// must not block and must not issue nested calls.
    Inline,
    /// On a dedicated request worker thread.
    #[default]
    Worker,
}

pub(crate) struct PendingTable {
    next_tsn: Tsn,
    /// Bumped by every restart. A call started under an older epoch
    /// must not be numbered.
    pub(crate) epoch: u64,
    pub(crate) records: HashMap<Tsn, Arc<PendingCall>>,
}

impl PendingTable {
    fn new() -> Self {
        Self {
            next_tsn: FIRST_TSN,
            epoch: 0,
            records: HashMap::new(),
        }
    }

    /// Next id not currently outstanding. Wraps, never yields 0.
    pub(crate) fn allocate(&mut self) -> Option<Tsn> {
        for _ in 0..=Tsn::MAX {
            let tsn = self.next_tsn;
            self.next_tsn = match self.next_tsn.wrapping_add(1) {
                0 => FIRST_TSN,
                n => n,
            };
            if tsn != 0 && !self.records.contains_key(&tsn) {
                return Some(tsn);
            }
        }
        None
    }

    /// Take every record and restart the id counter.
    fn restart(&mut self) -> Vec<Arc<PendingCall>> {
        self.next_tsn = FIRST_TSN;
        self.epoch = self.epoch.wrapping_add(1);
        self.records.drain().map(|(_, record)| record).collect()
    }
}

pub struct Correlator {
    transport: Arc<Transport>,
    pub(crate) table: RpcMutex<PendingTable>,
    /// Signalled whenever an id leaves the table.
    pub(crate) tsn_freed: Condvar,
    handlers: RwLock<HashMap<Opcode, Arc<RequestHandler>>>,
    dispatch: Dispatch,
    worker: Mutex<Option<RequestWorker>>,
    pub(crate) stats: Arc<LinkStats>,
}

impl Correlator {
    pub fn new(
        transport: Arc<Transport>,
        dispatch: Dispatch,
        stats: Arc<LinkStats>,
    ) -> Result<Arc<Self>> {
        let correlator = Arc::new(Self {
            transport,
            table: RpcMutex::new(PendingTable::new()),
            tsn_freed: Condvar::new(),
            handlers: RwLock::new(HashMap::new()),
            dispatch,
            worker: Mutex::new(None),
            stats,
        });

        if dispatch == Dispatch::Worker {
            let weak = Arc::downgrade(&correlator);
            let name = format!("xrpc-req-{:?}", correlator.transport.local()).to_lowercase();
            let worker = RequestWorker::spawn(name, move |job| {
                if let Some(correlator) = weak.upgrade() {
                    correlator.serve(job);
                }
            })?;
            *correlator.worker.lock() = Some(worker);
        }
        Ok(correlator)
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    /// Route requests carrying `opcode` to `handler`. Replaces any earlier one.
    ///
    /// Returning `Some(bytes)` sends `bytes` back as the response; `None`
    /// sends nothing.
    pub fn register_handler<F>(&self, opcode: Opcode, handler: F)
    where
        F: Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync + 'static,
    {
        self.handlers.write().insert(opcode, Arc::new(handler));
    }

    pub fn unregister_handler(&self, opcode: Opcode) -> bool {
        self.handlers.write().remove(&opcode).is_some()
    }

    /// Number of calls currently waiting for a response.
    pub fn outstanding(&self) -> usize {
        self.table.lock().records.len()
    }

    /// Remove `record` from the table if it is still there.
    /// `false` means a completion or reset already claimed it.
    pub(crate) fn retire(&self, record: &Arc<PendingCall>) -> bool {
        let mut table = self.table.lock();
        match table.records.get(&record.tsn()) {
            Some(current) if Arc::ptr_eq(current, record) => {
                table.records.remove(&record.tsn());
                self.tsn_freed.notify_one();
                true
            }
            _ => false,
        }
    }

    /// Unblock every waiting call with a reset error and restart the id space.
    ///
    /// Calls still waiting for outbound blocks or for a free id give up
    /// with the same error.
    pub fn cancel_all(&self, why: &str) -> usize {
        let cancelled = {
            let mut table = self.table.lock();
            let cancelled = table.restart();
            self.tsn_freed.notify_all();
            cancelled
        };
        self.transport.pool().wake_waiters();
        let count = cancelled.len();
        if count > 0 {
            tracing::debug!(core = ?self.transport.local(), count, why, "cancelling outstanding calls");
        }
        for record in cancelled {
            record.cancel();
        }
        count
    }

    fn complete(&self, tsn: Tsn, packet: RxBuffer) {
        let record = {
            let mut table = self.table.lock();
            let record = table.records.remove(&tsn);
            if record.is_some() {
                self.tsn_freed.notify_one();
            }
            record
        };
        match record {
            Some(record) => record.complete(packet),
            None => {
                LinkStats::bump(&self.stats.stale_responses);
                tracing::warn!(core = ?self.transport.local(), tsn, "discarding response with no pending call");
            }
        }
    }

    fn route(&self, header: CallHeader, request: RxBuffer) {
        let handler = self.handlers.read().get(&header.opcode).cloned();
        let Some(handler) = handler else {
            LinkStats::bump(&self.stats.unknown_opcodes);
            tracing::warn!(
                core = ?self.transport.local(),
                opcode = header.opcode,
                tsn = header.tsn,
                "discarding request for unregistered opcode"
            );
            return;
        };

        let job = Job {
            handler,
            header,
            request,
        };
        match self.dispatch {
            Dispatch::Inline => self.serve(job),
            Dispatch::Worker => match self.worker.lock().as_ref() {
                Some(worker) => worker.submit(job),
                None => tracing::debug!(tsn = header.tsn, "request worker stopped, dropping request"),
            },
        }
    }

    /// Run a handler and send its response, if any.
    pub(crate) fn serve(&self, job: Job) {
        let Job {
            handler,
            header,
            request,
        } = job;
        let reply = match panic::catch_unwind(AssertUnwindSafe(|| {
            handler(&request[CALL_HEADER_SIZE..])
        })) {
            Ok(reply) => reply,
            Err(_) => {
                LinkStats::bump(&self.stats.handler_panics);
                tracing::error!(
                    core = ?self.transport.local(),
                    opcode = header.opcode,
                    tsn = header.tsn,
                    "request handler panicked, dropping request"
                );
                None
            }
        };
        // give the request blocks back before claiming response blocks
        drop(request);

        if let Some(body) = reply {
            if let Err(e) = self.respond(&header, &body) {
                tracing::warn!(tsn = header.tsn, error = %e, "failed to send response");
            }
        }
    }

    fn respond(&self, request: &CallHeader, body: &[u8]) -> Result<()> {
        let pool = self.transport.pool();
        let total = CALL_HEADER_SIZE + body.len();
        if total > pool.max_payload() {
            return Err(RpcError::InvalidArgument("response larger than outbound region"));
        }

        let mut buffer = match self.dispatch {
            Dispatch::Worker => pool.alloc(total),
            // the delivery context cannot wait for the peer to release blocks
            Dispatch::Inline => match pool.try_alloc(total) {
                Ok(buffer) => buffer,
                Err(_) => fatal("no outbound buffer for a response in the delivery context"),
            },
        };
        let bytes = buffer.as_mut_slice();
        CallHeader::response_to(request).encode(&mut bytes[..CALL_HEADER_SIZE]);
        bytes[CALL_HEADER_SIZE..total].copy_from_slice(body);
        self.transport.send(buffer, total)
    }

    /// Fail every waiting call, stop the request worker and drop all handlers.
    ///
    /// Shut the transport down first so a handler still running cannot
    /// issue a fresh call that nobody will answer.
    pub fn shutdown(&self) {
        self.cancel_all("shutdown");
        let worker = self.worker.lock().take();
        if let Some(mut worker) = worker {
            worker.stop();
        }
        // handlers may capture an endpoint that owns this correlator
        self.handlers.write().clear();
    }
}

impl PacketSink for Correlator {
    fn on_packet(&self, packet: RxBuffer) {
        let Some(header) = CallHeader::decode(&packet) else {
            LinkStats::bump(&self.stats.malformed_packets);
            tracing::warn!(core = ?self.transport.local(), len = packet.len(), "discarding packet without call header");
            return;
        };
        match header.kind {
            Kind::Response => self.complete(header.tsn, packet),
            Kind::Request => self.route(header, packet),
        }
    }

    fn on_peer_reset(&self) {
        self.cancel_all("peer reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tsn_skips_outstanding_and_zero() {
        let mut table = PendingTable::new();
        let a = table.allocate().unwrap();
        assert_eq!(a, FIRST_TSN);
        table.records.insert(a, Arc::new(PendingCall::new(a)));
        table.records.insert(a + 1, Arc::new(PendingCall::new(a + 1)));
        table.next_tsn = a;
        // both 1 and 2 are outstanding
        assert_eq!(table.allocate(), Some(3));
    }

    #[test]
    fn tsn_wraps_past_max() {
        let mut table = PendingTable::new();
        table.next_tsn = Tsn::MAX;
        assert_eq!(table.allocate(), Some(Tsn::MAX));
        assert_eq!(table.allocate(), Some(FIRST_TSN));
    }

    #[test]
    fn restart_drains_and_rewinds() {
        let mut table = PendingTable::new();
        for _ in 0..5 {
            let tsn = table.allocate().unwrap();
            table.records.insert(tsn, Arc::new(PendingCall::new(tsn)));
        }
        let drained = table.restart();
        assert_eq!(drained.len(), 5);
        assert!(table.records.is_empty());
        assert_eq!(table.epoch, 1);
        assert_eq!(table.allocate(), Some(FIRST_TSN));
    }

    #[test]
    fn exhausted_id_space_is_reported() {
        let mut table = PendingTable::new();
        for tsn in 1..=Tsn::MAX {
            table.records.insert(tsn, Arc::new(PendingCall::new(tsn)));
        }
        assert_eq!(table.allocate(), None);
    }
}
