use std::sync::atomic::{AtomicU64, Ordering};

/// Per-endpoint counters. Relaxed: these are diagnostics, not synchronization.
#[derive(Debug, Default)]
pub struct LinkStats {
    pub packets_sent: AtomicU64,
    pub packets_received: AtomicU64,
    pub calls_issued: AtomicU64,
    pub calls_timed_out: AtomicU64,
    pub stale_responses: AtomicU64,
    pub unknown_opcodes: AtomicU64,
    pub handler_panics: AtomicU64,
    pub malformed_packets: AtomicU64,
    pub resets_received: AtomicU64,
    pub alloc_waits: AtomicU64,
}

/// Point-in-time copy of [`LinkStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkSnapshot {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub calls_issued: u64,
    pub calls_timed_out: u64,
    pub stale_responses: u64,
    pub unknown_opcodes: u64,
    pub handler_panics: u64,
    pub malformed_packets: u64,
    pub resets_received: u64,
    pub alloc_waits: u64,
}

impl LinkStats {
    #[inline]
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> LinkSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        LinkSnapshot {
            packets_sent: get(&self.packets_sent),
            packets_received: get(&self.packets_received),
            calls_issued: get(&self.calls_issued),
            calls_timed_out: get(&self.calls_timed_out),
            stale_responses: get(&self.stale_responses),
            unknown_opcodes: get(&self.unknown_opcodes),
            handler_panics: get(&self.handler_panics),
            malformed_packets: get(&self.malformed_packets),
            resets_received: get(&self.resets_received),
            alloc_waits: get(&self.alloc_waits),
        }
    }
}
