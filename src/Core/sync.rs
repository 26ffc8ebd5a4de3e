// Host implementation of the primitives the RPC core needs from its environment:
// mutex, counting semaphore, atomic read-modify-write, yield, fatal abort, bit scans.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// The shim mutex. Init is `Mutex::new`, lock/unlock follow the guard lifetime.
pub type RpcMutex<T> = Mutex<T>;

/// Counting semaphore used as the per-call wait primitive.
pub struct Semaphore {
    count: Mutex<u32>,
    cond: Condvar,
}

impl Semaphore {
    pub const fn new(initial: u32) -> Self {
        Self {
            count: parking_lot::const_mutex(initial),
            cond: Condvar::new(),
        }
    }

    /// Block until a unit is available.
    pub fn take(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            self.cond.wait(&mut count);
        }
        *count -= 1;
    }

    /// Block until a unit is available or `timeout` elapses.
    /// Returns `false` on timeout.
    pub fn take_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock();
        while *count == 0 {
            if self.cond.wait_until(&mut count, deadline).timed_out() {
                if *count == 0 {
                    return false;
                }
                break;
            }
        }
        *count -= 1;
        true
    }

    /// Non-blocking take.
    pub fn try_take(&self) -> bool {
        let mut count = self.count.lock();
        if *count == 0 {
            return false;
        }
        *count -= 1;
        true
    }

    /// Release one unit. Never blocks beyond the internal lock.
    pub fn give(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_add(1);
        self.cond.notify_one();
    }

    pub fn available(&self) -> u32 {
        *self.count.lock()
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new(0)
    }
}

/// Word-sized atomics the shared header is built from.
pub trait AtomicWord {
    type Value: Copy;
    fn or(&self, bits: Self::Value) -> Self::Value;
    fn and(&self, mask: Self::Value) -> Self::Value;
    fn get(&self) -> Self::Value;
}

impl AtomicWord for AtomicU32 {
    type Value = u32;
    fn or(&self, bits: u32) -> u32 {
        self.fetch_or(bits, Ordering::AcqRel)
    }
    fn and(&self, mask: u32) -> u32 {
        self.fetch_and(mask, Ordering::AcqRel)
    }
    fn get(&self) -> u32 {
        self.load(Ordering::Acquire)
    }
}

impl AtomicWord for AtomicU64 {
    type Value = u64;
    fn or(&self, bits: u64) -> u64 {
        self.fetch_or(bits, Ordering::AcqRel)
    }
    fn and(&self, mask: u64) -> u64 {
        self.fetch_and(mask, Ordering::AcqRel)
    }
    fn get(&self) -> u64 {
        self.load(Ordering::Acquire)
    }
}

/// Atomically OR `bits` in, returning the previous value.
#[inline]
pub fn atomic_or<A: AtomicWord>(word: &A, bits: A::Value) -> A::Value {
    word.or(bits)
}

/// Atomically AND with `mask`, returning the previous value.
#[inline]
pub fn atomic_and<A: AtomicWord>(word: &A, mask: A::Value) -> A::Value {
    word.and(mask)
}

#[inline]
pub fn atomic_get<A: AtomicWord>(word: &A) -> A::Value {
    word.get()
}

#[inline]
pub fn yield_now() {
    std::thread::yield_now();
}

/// Protocol invariant violated. Logged, then the thread panics.
#[cold]
#[track_caller]
pub fn fatal(msg: &str) -> ! {
    tracing::error!(target: "dmxp_xrpc", "fatal: {msg}");
    panic!("dmxp_xrpc fatal: {msg}");
}

/// Index of the most significant set bit (leading-zero count based).
#[inline]
pub fn highest_set_bit(word: u32) -> Option<u32> {
    if word == 0 {
        None
    } else {
        Some(31 - word.leading_zeros())
    }
}

/// Index of the least significant set bit.
#[inline]
pub fn lowest_set_bit(word: u64) -> Option<u32> {
    if word == 0 {
        None
    } else {
        Some(word.trailing_zeros())
    }
}
