use super::*;

/// Getter methods for Window
///
/// These expose the private fields of Window for debugging and monitoring.
impl Window {
    /// Get a reference to the underlying shared memory backend
    ///
    /// # Safety
    /// Writing through the backend's pointer bypasses the buffer ownership
    /// discipline; callers may only read.
    pub unsafe fn shm(&self) -> &dyn SharedMemoryBackend {
        &*self.shm
    }

    /// Get the raw pointer to the GlobalHeader
    pub fn header_ptr(&self) -> *const GlobalHeader {
        self.header
    }

    /// Check if the window carries a valid header
    ///
    /// Returns true if the magic number in the header matches the expected value.
    pub fn is_initialized(&self) -> bool {
        unsafe {
            !self.header.is_null()
                && std::ptr::read_volatile(std::ptr::addr_of!((*self.header).magic)) == MAGIC_NUMBER
        }
    }

    /// Raw free-map of a lane (bit set = block free). Loaded with relaxed
    /// ordering since this is only used for monitoring.
    pub fn free_map(&self, lane: usize) -> u64 {
        self.lane(lane).free_map.load(Ordering::Relaxed)
    }

    /// Descriptors queued on a lane and not yet delivered.
    pub fn queued(&self, lane: usize) -> usize {
        self.ring(lane).len()
    }
}
