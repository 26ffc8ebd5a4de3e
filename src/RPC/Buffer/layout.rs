use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicU32, AtomicU64};

/// "DMXP_RPC"
pub const MAGIC_NUMBER: u64 = 0x444D_5850_5F52_5043;

pub const LAYOUT_VERSION: u32 = 1;

/// Upper bound on blocks per lane; the free-map is one `u64`.
pub const MAX_BLOCKS: usize = 64;

/// Block sizes must be a multiple of this so payloads stay cache-line aligned.
pub const BLOCK_ALIGN: usize = 64;

/// Lane 0 carries primary -> secondary, lane 1 secondary -> primary.
pub const LANES: usize = 2;

/// One entry of a lane's descriptor ring.
///
/// Same sequence protocol as the DMXP slot ring: a producer claims `tail`,
/// waits for `sequence == tail`, fills the entry, then stores `tail + 1`.
/// The consumer takes `head` once `sequence == head + 1` and hands the entry
/// back by storing `head + capacity`.
#[repr(C)]
pub struct Descriptor {
    pub sequence: AtomicU64,
    /// First block of the packet within the lane's band.
    pub first_block: u32,
    /// Number of contiguous blocks the packet occupies.
    pub block_count: u32,
    /// Payload length, excluding the packet header.
    pub len: u32,
    pub _reserved: u32,
}

/// Control block for one direction of traffic.
///
/// Only the writing core claims blocks (clears free-map bits); only the
/// reading core returns them (sets bits) and bumps `release_epoch`.
#[repr(C, align(128))]
pub struct LaneHeader {
    /// Bit `n` set means block `n` is free.
    pub free_map: CachePadded<AtomicU64>,

    /// Futex word bumped on every release, so blocked allocators can sleep.
    pub release_epoch: CachePadded<AtomicU32>,

    /// Byte offset from the start of the window to this lane's data band.
    pub band_offset: u64,

    /// Producer cursor of the descriptor ring.
    pub tail: CachePadded<AtomicU64>,

    /// Consumer cursor of the descriptor ring.
    pub head: CachePadded<AtomicU64>,

    pub ring: [Descriptor; MAX_BLOCKS],
}

/// Notification word owned by the core that receives the signal.
#[repr(C, align(128))]
pub struct Doorbell {
    /// One bit per pending reason.
    pub pending: AtomicU32,
    /// Futex word, bumped on every signal.
    pub wake: AtomicU32,
}

/// The header at the very beginning of the shared window.
#[repr(C, align(128))]
pub struct GlobalHeader {
    pub magic: u64,
    pub version: u32,
    pub block_size: u32,
    pub block_count: u32,
    pub reserved: u32,
    pub lanes: [LaneHeader; LANES],
    /// Indexed by the receiving core.
    pub doorbells: [Doorbell; 2],
}
