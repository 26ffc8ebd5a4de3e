use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release};

use super::layout::{Descriptor, LaneHeader, MAX_BLOCKS};
use super::Ring::{DescriptorRing, PacketRef};

impl DescriptorRing {
    /// Create a ring view over an existing lane header.
    ///
    /// # Safety
    /// `lane` must point to a lane header inside a live mapping, and
    /// `capacity` must be a power of two no larger than `MAX_BLOCKS`.
    pub unsafe fn new(lane: *const LaneHeader, capacity: usize) -> Self {
        debug_assert!(capacity.is_power_of_two() && capacity <= MAX_BLOCKS);
        Self {
            lane,
            capacity,
            mask: capacity - 1,
        }
    }

    /// Initialize per-descriptor sequence numbers to k for k in 0..capacity
    /// and reset both cursors. Only the core that creates the window does this.
    ///
    /// # Safety
    /// No other party may be using the ring.
    pub unsafe fn init(&self) {
        let lane = &*self.lane;
        for k in 0..self.capacity {
            lane.ring[k].sequence.store(k as u64, Relaxed);
        }
        lane.tail.store(0, Relaxed);
        lane.head.store(0, Release);
    }

    #[inline]
    fn entry(&self, index: usize) -> *mut Descriptor {
        // The descriptor fields other than `sequence` are written through this
        // pointer by whichever sender owns the entry.
        unsafe { std::ptr::addr_of!((*self.lane).ring[index]) as *mut Descriptor }
    }

    /// Publish a packet descriptor. Returns `false` if the ring is full.
    pub fn enqueue(&self, packet: PacketRef) -> bool {
        let tail_atomic = unsafe { &(*self.lane).tail };

        loop {
            let tail = tail_atomic.load(Relaxed);
            let entry = self.entry((tail as usize) & self.mask);
            let seq = unsafe { &(*entry).sequence }.load(Acquire);
            let dif = seq as i64 - tail as i64;

            if dif == 0 {
                if tail_atomic
                    .compare_exchange_weak(tail, tail + 1, AcqRel, Relaxed)
                    .is_ok()
                {
                    unsafe {
                        (*entry).first_block = packet.first_block;
                        (*entry).block_count = packet.block_count;
                        (*entry).len = packet.len;
                        (&(*entry).sequence).store(tail + 1, Release);
                    }
                    return true;
                }
            } else if dif < 0 {
                // full
                return false;
            } else {
                // another sender claimed this entry first
                std::hint::spin_loop();
            }
        }
    }

    /// Take the oldest published descriptor, if any.
    pub fn dequeue(&self) -> Option<PacketRef> {
        let head_atomic = unsafe { &(*self.lane).head };

        loop {
            let head = head_atomic.load(Relaxed);
            let entry = self.entry((head as usize) & self.mask);
            let seq = unsafe { &(*entry).sequence }.load(Acquire);
            let dif = seq as i64 - (head as i64 + 1);

            if dif == 0 {
                if head_atomic
                    .compare_exchange_weak(head, head + 1, AcqRel, Relaxed)
                    .is_ok()
                {
                    let packet = unsafe {
                        PacketRef {
                            first_block: (*entry).first_block,
                            block_count: (*entry).block_count,
                            len: (*entry).len,
                        }
                    };
                    // hand the entry back to senders
                    unsafe {
                        (&(*entry).sequence).store(head + self.capacity as u64, Release);
                    }
                    return Some(packet);
                }
            } else if dif < 0 {
                // empty, or the next entry is claimed but not yet published
                return None;
            } else {
                std::hint::spin_loop();
            }
        }
    }

    /// Number of published-but-undelivered descriptors (approximate under contention).
    pub fn len(&self) -> usize {
        let lane = unsafe { &*self.lane };
        let tail = lane.tail.load(Acquire);
        let head = lane.head.load(Acquire);
        tail.saturating_sub(head) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
