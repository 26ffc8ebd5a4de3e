use crate::Core::alloc::{BufferPool, Window};
use crate::RPC::Buffer::DescriptorRing;
use std::fmt;

/// Debug function for Window
///
/// Provides a safe debug representation that shows:
/// - Header pointer location
/// - Block geometry
/// - Opaque reference to shared memory
/// - Initialization status
pub fn debug_window(window: &Window, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Window")
        .field("shm", &"<opaque>")
        .field("header", &format_args!("{:p}", window.header_ptr()))
        .field("block_size", &window.block_size())
        .field("block_count", &window.block_count())
        .field("initialized", &window.is_initialized())
        .finish()
}

/// Debug function for BufferPool
///
/// Shows the outbound lane and how many of its blocks are free right now.
pub fn debug_buffer_pool(pool: &BufferPool, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("BufferPool")
        .field("lane", &pool.lane_index())
        .field("free_blocks", &pool.free_blocks())
        .field("block_count", &pool.block_count())
        .finish()
}

/// Debug function for TxBuffer / RxBuffer
///
/// Describes the block run without touching its bytes.
pub fn debug_buffer_run(
    name: &str,
    lane: usize,
    first: u32,
    blocks: u32,
    len: usize,
    f: &mut fmt::Formatter<'_>,
) -> fmt::Result {
    f.debug_struct(name)
        .field("lane", &lane)
        .field("blocks", &format_args!("{}..{}", first, first + blocks))
        .field("len", &len)
        .finish()
}

/// Debug function for DescriptorRing
///
/// Safely displays the ring's location without dereferencing
pub fn debug_descriptor_ring(ring: &DescriptorRing, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("DescriptorRing")
        .field("lane", &format_args!("0x{:x}", ring.lane as usize))
        .field("capacity", &ring.capacity)
        .finish_non_exhaustive()
}
