use crate::error::{Result, RpcError};
use crate::Core::futex::{futex_wait, futex_wake_all};
use crate::Core::stats::LinkStats;
use crate::Core::sync::{atomic_get, atomic_or, fatal, lowest_set_bit};
use crate::Core::SharedMemory::{align_up, SharedMemoryBackend, WINDOW_ALIGN};
use crate::RPC::Buffer::layout::{
    Doorbell, GlobalHeader, LaneHeader, BLOCK_ALIGN, LANES, LAYOUT_VERSION, MAGIC_NUMBER,
    MAX_BLOCKS,
};
use crate::RPC::Buffer::{DescriptorRing, PacketRef};
use crate::RPC::Structs::PACKET_HEADER_SIZE;
use std::ops::Deref;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
mod debug;
mod getters;

/// Upper bound on one futex sleep while waiting for blocks; the loop re-checks after it.
const ALLOC_WAIT_SLICE: Duration = Duration::from_millis(50);

/// Which side of the link an endpoint is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoreId {
    /// Creates and initialises the window.
    Primary = 0,
    /// Attaches to an initialised window.
    Secondary = 1,
}

impl CoreId {
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    #[inline]
    pub fn peer(self) -> CoreId {
        match self {
            CoreId::Primary => CoreId::Secondary,
            CoreId::Secondary => CoreId::Primary,
        }
    }

    /// Lane this core writes.
    #[inline]
    pub fn outbound_lane(self) -> usize {
        self.index()
    }

    /// Lane this core reads.
    #[inline]
    pub fn inbound_lane(self) -> usize {
        self.peer().index()
    }
}

#[inline]
fn run_mask(first: u32, count: u32) -> u64 {
    let bits = if count >= 64 { u64::MAX } else { (1u64 << count) - 1 };
    bits << first
}

/// First index at which `count` consecutive bits of `map` are set, within `total` bits.
pub(crate) fn find_free_run(map: u64, count: u32, total: u32) -> Option<u32> {
    if count == 0 || count > total {
        return None;
    }
    let mut candidates = map;
    while let Some(start) = lowest_set_bit(candidates) {
        if start + count > total {
            return None;
        }
        let want = run_mask(start, count);
        if map & want == want {
            return Some(start);
        }
        // skip past the hole that broke this run
        let hole = lowest_set_bit(!map & want).unwrap_or(start);
        candidates &= !run_mask(0, hole + 1);
    }
    None
}

/// The mapped cross-core window: global header, two lanes, two data bands.
pub struct Window {
    shm: Box<dyn SharedMemoryBackend>,
    header: *mut GlobalHeader,
    block_size: usize,
    block_count: usize,
}

// Shared state is only touched through atomics or under the ownership
// discipline enforced by TxBuffer/RxBuffer.
unsafe impl Send for Window {}
unsafe impl Sync for Window {}

impl Window {
    /// Bytes needed for a window with this geometry.
    pub fn required_size(block_size: usize, block_count: usize) -> usize {
        align_up(std::mem::size_of::<GlobalHeader>()) + LANES * align_up(block_size * block_count)
    }

    fn check_geometry(block_size: usize, block_count: usize) -> Result<()> {
        if block_count == 0 || block_count > MAX_BLOCKS || !block_count.is_power_of_two() {
            return Err(RpcError::InvalidArgument(
                "block count must be a power of two in 1..=64",
            ));
        }
        if block_size < BLOCK_ALIGN || block_size % BLOCK_ALIGN != 0 || block_size > u32::MAX as usize
        {
            return Err(RpcError::InvalidArgument(
                "block size must be a non-zero multiple of 64",
            ));
        }
        Ok(())
    }

    /// Lay out a fresh window over `shm`. Done once, by the primary core.
    pub fn create(
        shm: Box<dyn SharedMemoryBackend>,
        block_size: usize,
        block_count: usize,
    ) -> Result<Self> {
        Self::check_geometry(block_size, block_count)?;

        let needed = Self::required_size(block_size, block_count);
        if shm.size() < needed {
            return Err(RpcError::InvalidArgument("shared memory too small for geometry"));
        }

        let header = shm.as_ptr() as *mut GlobalHeader;
        if (header as usize) % WINDOW_ALIGN != 0 {
            return Err(RpcError::Internal("shared memory not properly aligned"));
        }

        let band_len = align_up(block_size * block_count);
        let control_size = align_up(std::mem::size_of::<GlobalHeader>());

        // Zeroed bytes are a valid GlobalHeader: atomics at 0, counters at 0.
        unsafe {
            std::ptr::write_bytes(header as *mut u8, 0, control_size);
            (*header).version = LAYOUT_VERSION;
            (*header).block_size = block_size as u32;
            (*header).block_count = block_count as u32;
            for lane in 0..LANES {
                let lh = &mut (*header).lanes[lane];
                lh.band_offset = (control_size + lane * band_len) as u64;
                lh.free_map.store(run_mask(0, block_count as u32), Ordering::Relaxed);
                DescriptorRing::new(lh, block_count).init();
            }
        }

        // Publish: an attaching core trusts the geometry once it sees the magic.
        std::sync::atomic::fence(Ordering::Release);
        unsafe { std::ptr::write_volatile(std::ptr::addr_of_mut!((*header).magic), MAGIC_NUMBER) };

        tracing::debug!(block_size, block_count, size = shm.size(), "shared window created");

        Ok(Self {
            shm,
            header,
            block_size,
            block_count,
        })
    }

    /// Map a window the primary core already laid out.
    pub fn attach(shm: Box<dyn SharedMemoryBackend>) -> Result<Self> {
        let header = shm.as_ptr() as *mut GlobalHeader;
        if (header as usize) % WINDOW_ALIGN != 0 {
            return Err(RpcError::Internal("shared memory not properly aligned"));
        }
        if shm.size() < std::mem::size_of::<GlobalHeader>() {
            return Err(RpcError::InvalidArgument("shared memory too small for header"));
        }

        let (magic, version, block_size, block_count) = unsafe {
            let magic = std::ptr::read_volatile(std::ptr::addr_of!((*header).magic));
            std::sync::atomic::fence(Ordering::Acquire);
            (
                magic,
                (*header).version,
                (*header).block_size as usize,
                (*header).block_count as usize,
            )
        };
        if magic != MAGIC_NUMBER {
            return Err(RpcError::InvalidState(
                "invalid magic number - window not initialized",
            ));
        }
        if version != LAYOUT_VERSION {
            return Err(RpcError::NotSupported);
        }
        Self::check_geometry(block_size, block_count)?;
        if shm.size() < Self::required_size(block_size, block_count) {
            return Err(RpcError::InvalidArgument("shared memory smaller than its header claims"));
        }

        tracing::debug!(block_size, block_count, "attached to shared window");

        Ok(Self {
            shm,
            header,
            block_size,
            block_count,
        })
    }

    #[inline]
    pub(crate) fn lane(&self, lane: usize) -> &LaneHeader {
        unsafe { &(*self.header).lanes[lane] }
    }

    #[inline]
    pub(crate) fn doorbell(&self, core: CoreId) -> &Doorbell {
        unsafe { &(*self.header).doorbells[core.index()] }
    }

    pub(crate) fn ring(&self, lane: usize) -> DescriptorRing {
        unsafe { DescriptorRing::new(self.lane(lane), self.block_count) }
    }

    #[inline]
    pub(crate) fn block_ptr(&self, lane: usize, block: u32) -> *mut u8 {
        let offset = self.lane(lane).band_offset as usize + block as usize * self.block_size;
        unsafe { self.shm.as_ptr().add(offset) }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn block_count(&self) -> usize {
        self.block_count
    }

    /// Return a run of blocks to the lane's free-map and wake blocked allocators.
    pub(crate) fn release_blocks(&self, lane: usize, first: u32, count: u32) {
        let lh = self.lane(lane);
        let mask = run_mask(first, count);
        let previous = atomic_or(&*lh.free_map, mask);
        if previous & mask != 0 {
            fatal("block released twice");
        }
        lh.release_epoch.fetch_add(1, Ordering::Release);
        futex_wake_all(&lh.release_epoch);
    }
}

/// Allocator over one core's outbound band.
#[derive(Clone)]
pub struct BufferPool {
    window: Arc<Window>,
    lane: usize,
    stats: Arc<LinkStats>,
}

impl BufferPool {
    pub fn new(window: Arc<Window>, core: CoreId, stats: Arc<LinkStats>) -> Self {
        Self {
            window,
            lane: core.outbound_lane(),
            stats,
        }
    }

    /// Largest payload a single buffer can carry.
    pub fn max_payload(&self) -> usize {
        self.window.block_count * self.window.block_size - PACKET_HEADER_SIZE
    }

    /// Blocks a payload of `len` bytes occupies, header included.
    pub fn blocks_for(&self, len: usize) -> u32 {
        (len + PACKET_HEADER_SIZE).div_ceil(self.window.block_size).max(1) as u32
    }

    fn check_len(&self, len: usize) -> u32 {
        if len > self.max_payload() {
            fatal("allocation larger than the outbound region");
        }
        self.blocks_for(len)
    }

    fn claim(&self, count: u32) -> Option<TxBuffer> {
        let free_map = &*self.window.lane(self.lane).free_map;
        let total = self.window.block_count as u32;
        let mut map = atomic_get(free_map);
        loop {
            let first = find_free_run(map, count, total)?;
            let want = run_mask(first, count);
            match free_map.compare_exchange_weak(
                map,
                map & !want,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(TxBuffer {
                        window: self.window.clone(),
                        lane: self.lane,
                        first,
                        blocks: count,
                        armed: true,
                    })
                }
                Err(current) => map = current,
            }
        }
    }

    /// Reserve room for a `len`-byte payload without blocking.
    ///
    /// Requests that could never fit are fatal; a momentarily full pool
    /// yields [`RpcError::NoMemory`].
    pub fn try_alloc(&self, len: usize) -> Result<TxBuffer> {
        let count = self.check_len(len);
        self.claim(count).ok_or(RpcError::NoMemory)
    }

    /// Reserve room for a `len`-byte payload, blocking until the peer
    /// releases enough contiguous blocks.
    pub fn alloc(&self, len: usize) -> TxBuffer {
        match self.alloc_unless(len, || false) {
            Some(buf) => buf,
            None => fatal("allocation abandoned without an abort condition"),
        }
    }

    /// Like [`alloc`](Self::alloc), but gives up with `None` once `abort`
    /// returns `true`. `abort` is checked before every sleep and after
    /// [`wake_waiters`](Self::wake_waiters).
    pub fn alloc_unless(&self, len: usize, mut abort: impl FnMut() -> bool) -> Option<TxBuffer> {
        let count = self.check_len(len);
        let epoch_word = &self.window.lane(self.lane).release_epoch;
        let mut waited = false;
        loop {
            let epoch = epoch_word.load(Ordering::Acquire);
            if let Some(buf) = self.claim(count) {
                return Some(buf);
            }
            if abort() {
                tracing::trace!(blocks = count, "allocation abandoned");
                return None;
            }
            if !waited {
                waited = true;
                LinkStats::bump(&self.stats.alloc_waits);
                tracing::trace!(blocks = count, "outbound region exhausted, waiting");
            }
            futex_wait(epoch_word, epoch, Some(ALLOC_WAIT_SLICE));
        }
    }

    /// Kick every thread sleeping in [`alloc`](Self::alloc) so it re-checks
    /// its abort condition.
    pub fn wake_waiters(&self) {
        futex_wake_all(&self.window.lane(self.lane).release_epoch);
    }

    /// Give back a buffer that will not be sent (error paths).
    pub fn free(&self, buffer: TxBuffer) {
        drop(buffer);
    }

    pub fn free_blocks(&self) -> u32 {
        atomic_get(&*self.window.lane(self.lane).free_map).count_ones()
    }

    pub fn block_count(&self) -> usize {
        self.window.block_count
    }

    pub fn block_size(&self) -> usize {
        self.window.block_size
    }

    pub(crate) fn lane_index(&self) -> usize {
        self.lane
    }
}

/// An allocated, not yet sent, outbound buffer.
///
/// Move-only. Sending consumes it; dropping it returns the blocks.
pub struct TxBuffer {
    window: Arc<Window>,
    lane: usize,
    first: u32,
    blocks: u32,
    armed: bool,
}

impl TxBuffer {
    /// Payload bytes available in this buffer.
    pub fn capacity(&self) -> usize {
        self.blocks as usize * self.window.block_size - PACKET_HEADER_SIZE
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // The run is exclusively ours until sent or dropped.
        unsafe {
            std::slice::from_raw_parts_mut(
                self.window.block_ptr(self.lane, self.first).add(PACKET_HEADER_SIZE),
                self.capacity(),
            )
        }
    }

    pub(crate) fn header_mut(&mut self) -> &mut [u8; PACKET_HEADER_SIZE] {
        unsafe { &mut *(self.window.block_ptr(self.lane, self.first) as *mut [u8; PACKET_HEADER_SIZE]) }
    }

    pub(crate) fn belongs_to(&self, window: &Arc<Window>, lane: usize) -> bool {
        Arc::ptr_eq(&self.window, window) && self.lane == lane
    }

    /// Give up ownership for the hand-off to the peer.
    pub(crate) fn into_packet(mut self, len: usize) -> PacketRef {
        self.armed = false;
        PacketRef {
            first_block: self.first,
            block_count: self.blocks,
            len: len as u32,
        }
    }
}

impl Drop for TxBuffer {
    fn drop(&mut self) {
        if self.armed {
            self.window.release_blocks(self.lane, self.first, self.blocks);
        }
    }
}

/// A received packet, borrowed from the peer's outbound band.
///
/// Move-only; releasing (explicitly or by drop) returns the blocks to the
/// sender exactly once.
pub struct RxBuffer {
    window: Arc<Window>,
    lane: usize,
    first: u32,
    blocks: u32,
    len: usize,
}

impl RxBuffer {
    pub(crate) fn from_packet(window: Arc<Window>, lane: usize, packet: PacketRef) -> Self {
        Self {
            window,
            lane,
            first: packet.first_block,
            blocks: packet.block_count,
            len: packet.len as usize,
        }
    }

    pub(crate) fn header(&self) -> &[u8; PACKET_HEADER_SIZE] {
        unsafe { &*(self.window.block_ptr(self.lane, self.first) as *const [u8; PACKET_HEADER_SIZE]) }
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts(
                self.window.block_ptr(self.lane, self.first).add(PACKET_HEADER_SIZE),
                self.len,
            )
        }
    }

    /// Hand the blocks back to the sender.
    pub fn release(self) {
        drop(self);
    }
}

impl Deref for RxBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl Drop for RxBuffer {
    fn drop(&mut self) {
        self.window.release_blocks(self.lane, self.first, self.blocks);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_search_finds_first_fit() {
        assert_eq!(find_free_run(0b1111, 2, 4), Some(0));
        assert_eq!(find_free_run(0b1110, 2, 4), Some(1));
        assert_eq!(find_free_run(0b1101, 2, 4), Some(2));
        assert_eq!(find_free_run(0b0101, 2, 4), None);
        assert_eq!(find_free_run(0, 1, 4), None);
        assert_eq!(find_free_run(u64::MAX, 64, 64), Some(0));
        assert_eq!(find_free_run(0b1111, 5, 4), None);
    }

    #[test]
    fn run_search_respects_total() {
        // bits above `total` are never handed out
        assert_eq!(find_free_run(0b1_1000, 2, 4), None);
        assert_eq!(find_free_run(0b1_1000, 1, 4), Some(3));
    }

    #[test]
    fn run_mask_edges() {
        assert_eq!(run_mask(0, 1), 1);
        assert_eq!(run_mask(3, 2), 0b11000);
        assert_eq!(run_mask(0, 64), u64::MAX);
    }

    #[test]
    fn core_lanes_cross() {
        assert_eq!(CoreId::Primary.outbound_lane(), CoreId::Secondary.inbound_lane());
        assert_eq!(CoreId::Secondary.outbound_lane(), CoreId::Primary.inbound_lane());
        assert_eq!(CoreId::Primary.peer(), CoreId::Secondary);
    }
}
