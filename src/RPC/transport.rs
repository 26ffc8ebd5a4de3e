//! Packet transport over the buffer pool and doorbell.
//!
//! `send` hands a filled [`TxBuffer`] to the peer; on the receiving side every
//! queued packet is delivered, in order, to the installed [`PacketSink`] as an
//! owned [`RxBuffer`]. A sink that drops the handle frees the buffer right
//! away; one that keeps it holds the blocks until it releases them.

use crate::error::{Result, RpcError};
use crate::Core::alloc::{BufferPool, CoreId, RxBuffer, TxBuffer, Window};
use crate::Core::signal::{Reasons, SignalChannel};
use crate::Core::stats::LinkStats;
use crate::Core::sync::fatal;
use crate::RPC::Buffer::PacketRef;
use crate::RPC::Structs::{PacketHeader, PACKET_HEADER_SIZE};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

const STATE_UNINIT: u8 = 0;
const STATE_INITIALIZING: u8 = 1;
const STATE_READY: u8 = 2;
const STATE_CLOSED: u8 = 3;

/// Receiver of inbound packets.
///
/// Runs in the delivery context (dispatcher thread or `poll` caller) and
/// must return promptly.
pub trait PacketSink: Send + Sync {
    fn on_packet(&self, packet: RxBuffer);

    /// The peer announced a restart.
    fn on_peer_reset(&self) {}
}

impl<F> PacketSink for F
where
    F: Fn(RxBuffer) + Send + Sync,
{
    fn on_packet(&self, packet: RxBuffer) {
        self(packet)
    }
}

pub struct Transport {
    window: Arc<Window>,
    local: CoreId,
    pool: BufferPool,
    signal: Arc<SignalChannel>,
    state: AtomicU8,
    sink: RwLock<Option<Arc<dyn PacketSink>>>,
    // serializes delivery so packets reach the sink in lane order
    rx_lock: Mutex<()>,
    tx_seq: AtomicU32,
    stats: Arc<LinkStats>,
}

impl Transport {
    pub fn new(
        window: Arc<Window>,
        local: CoreId,
        signal: Arc<SignalChannel>,
        stats: Arc<LinkStats>,
    ) -> Self {
        Self {
            pool: BufferPool::new(window.clone(), local, stats.clone()),
            window,
            local,
            signal,
            state: AtomicU8::new(STATE_UNINIT),
            sink: RwLock::new(None),
            rx_lock: Mutex::new(()),
            tx_seq: AtomicU32::new(0),
            stats,
        }
    }

    /// One-time setup: install the sink and hook the doorbell.
    pub fn init(self: &Arc<Self>, sink: Arc<dyn PacketSink>) -> Result<()> {
        match self.state.compare_exchange(
            STATE_UNINIT,
            STATE_INITIALIZING,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {}
            Err(STATE_INITIALIZING) => return Err(RpcError::Busy),
            Err(STATE_CLOSED) => return Err(RpcError::InvalidState("transport shut down")),
            Err(_) => return Err(RpcError::InvalidState("transport already initialized")),
        }

        *self.sink.write() = Some(sink);

        // weak: the channel must not keep the transport alive
        let weak = Arc::downgrade(self);
        self.signal.set_handler(move |reasons| {
            if let Some(transport) = weak.upgrade() {
                transport.on_signal(reasons);
            }
        });

        self.state.store(STATE_READY, Ordering::Release);
        tracing::debug!(core = ?self.local, "transport ready");

        // anything the peer queued before we were listening
        self.drain();
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_READY
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn signal_channel(&self) -> &Arc<SignalChannel> {
        &self.signal
    }

    pub fn local(&self) -> CoreId {
        self.local
    }

    /// Hand `buffer` to the peer with a `len`-byte payload.
    ///
    /// Never fails on transient conditions; those were absorbed by `alloc`.
    pub fn send(&self, mut buffer: TxBuffer, len: usize) -> Result<()> {
        if !self.is_ready() {
            return Err(RpcError::InvalidState("send before init"));
        }
        if !buffer.belongs_to(&self.window, self.local.outbound_lane()) {
            return Err(RpcError::InvalidArgument("buffer not owned by this transport"));
        }
        if len > buffer.capacity() {
            return Err(RpcError::InvalidArgument("length exceeds allocation"));
        }

        let seq = self.tx_seq.fetch_add(1, Ordering::Relaxed);
        *buffer.header_mut() = PacketHeader {
            len: len as u32,
            seq,
        }
        .to_bytes();

        let packet = buffer.into_packet(len);
        if !self.window.ring(self.local.outbound_lane()).enqueue(packet) {
            fatal("descriptor ring overflow");
        }
        LinkStats::bump(&self.stats.packets_sent);
        tracing::trace!(core = ?self.local, seq, len, "packet sent");

        self.signal.signal(Reasons::DATA);
        Ok(())
    }

    /// Announce a local restart to the peer.
    pub fn reset(&self) {
        tracing::debug!(core = ?self.local, "signalling reset to peer");
        self.signal.signal(Reasons::RESET);
    }

    fn current_sink(&self) -> Option<Arc<dyn PacketSink>> {
        self.sink.read().clone()
    }

    /// Doorbell handler.
    pub(crate) fn on_signal(&self, reasons: Reasons) {
        if reasons.contains(Reasons::RESET) {
            LinkStats::bump(&self.stats.resets_received);
            tracing::debug!(core = ?self.local, "peer reset observed");
            if let Some(sink) = self.current_sink() {
                sink.on_peer_reset();
            }
        }
        if reasons.contains(Reasons::DATA) {
            self.drain();
        }
    }

    /// Deliver every packet currently queued on the inbound lane.
    fn drain(&self) {
        let Some(sink) = self.current_sink() else {
            return;
        };
        let _guard = self.rx_lock.lock();
        let lane = self.local.inbound_lane();
        let ring = self.window.ring(lane);
        while let Some(packet) = ring.dequeue() {
            if !self.descriptor_in_bounds(packet) {
                // cannot trust the block range, so the run is not released
                LinkStats::bump(&self.stats.malformed_packets);
                tracing::warn!(core = ?self.local, ?packet, "descriptor outside inbound band");
                continue;
            }
            let rx = RxBuffer::from_packet(self.window.clone(), lane, packet);
            let header = PacketHeader::from_bytes(rx.header());
            if header.len != packet.len {
                LinkStats::bump(&self.stats.malformed_packets);
                tracing::warn!(
                    core = ?self.local,
                    header_len = header.len,
                    descriptor_len = packet.len,
                    "dropping malformed packet"
                );
                continue;
            }
            LinkStats::bump(&self.stats.packets_received);
            tracing::trace!(core = ?self.local, seq = header.seq, len = header.len, "packet received");
            sink.on_packet(rx);
        }
    }

    fn descriptor_in_bounds(&self, packet: PacketRef) -> bool {
        let blocks = self.window.block_count() as u64;
        let end = packet.first_block as u64 + packet.block_count as u64;
        packet.block_count > 0
            && end <= blocks
            && packet.len as usize + PACKET_HEADER_SIZE
                <= packet.block_count as usize * self.window.block_size()
    }

    /// Detach from the doorbell. Queued packets stay in the window.
    pub fn shutdown(&self) {
        self.state.store(STATE_CLOSED, Ordering::Release);
        self.signal.clear_handler();
        *self.sink.write() = None;
    }
}

const _: () = assert!(PACKET_HEADER_SIZE == 8);
