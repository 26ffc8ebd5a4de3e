// Descriptor ring for one lane of the shared window.

use super::layout::LaneHeader;

/// A view over a lane's descriptor ring.
///
/// This struct is NOT stored in shared memory. It is a transient view that
/// holds a pointer to the lane header inside the mapped window.
///
/// ### Concurrency Design:
/// - **Senders (Enqueue)**: any thread of the writing core claims a
///   descriptor by advancing `tail`, then publishes with a release store of
///   the descriptor's `sequence`.
/// - **Receiver (Dequeue)**: the reading core's delivery context advances
///   `head` once the sequence says the entry is published.
///
/// Capacity equals the lane's block count. Every queued packet holds at
/// least one block, so the ring cannot fill while a block can be allocated.
pub struct DescriptorRing {
    /// Pointer to the lane header in the control area.
    pub(crate) lane: *const LaneHeader,

    /// The capacity of the ring (number of descriptors).
    pub(crate) capacity: usize,

    /// `capacity - 1`, used to wrap sequence numbers.
    pub(crate) mask: usize,
}

/// A dequeued descriptor, copied out of shared memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketRef {
    pub first_block: u32,
    pub block_count: u32,
    pub len: u32,
}

unsafe impl Send for DescriptorRing {}
unsafe impl Sync for DescriptorRing {}
