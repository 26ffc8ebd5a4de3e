// Doorbell signaling between the two cores.
//
// Each core owns a doorbell in the window header: a pending-reasons word the
// peer ORs bits into, and a wake word used as the futex the receiving side
// sleeps on. `IrqLine` is the host stand-in for the interrupt line: a thread
// that sleeps on the doorbell and runs the installed handler.

use crate::Core::alloc::{CoreId, Window};
use crate::Core::futex::{futex_wait, futex_wake_all};
use crate::Core::sync::{atomic_and, atomic_get, atomic_or, highest_set_bit};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{fence, AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Set of reasons carried by one doorbell, one bit each.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Reasons(u32);

impl Reasons {
    pub const NONE: Reasons = Reasons(0);
    /// New packets are queued on the lane towards the receiver.
    pub const DATA: Reasons = Reasons(1 << 0);
    /// The sender restarted; everything it had outstanding is void.
    pub const RESET: Reasons = Reasons(1 << 1);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn from_bits(bits: u32) -> Self {
        Reasons(bits)
    }

    pub const fn contains(self, other: Reasons) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Iterate the set bits, highest first.
    pub fn iter(self) -> impl Iterator<Item = Reasons> {
        let mut rest = self.0;
        std::iter::from_fn(move || {
            let bit = highest_set_bit(rest)?;
            rest &= !(1 << bit);
            Some(Reasons(1 << bit))
        })
    }
}

impl std::ops::BitOr for Reasons {
    type Output = Reasons;
    fn bitor(self, rhs: Reasons) -> Reasons {
        Reasons(self.0 | rhs.0)
    }
}

impl fmt::Debug for Reasons {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_set();
        for r in self.iter() {
            match r {
                Reasons::DATA => list.entry(&"DATA"),
                Reasons::RESET => list.entry(&"RESET"),
                other => list.entry(&format_args!("0x{:x}", other.0)),
            };
        }
        list.finish()
    }
}

pub type SignalHandler = Arc<dyn Fn(Reasons) + Send + Sync>;

/// One core's end of the doorbell pair.
pub struct SignalChannel {
    window: Arc<Window>,
    local: CoreId,
    handler: Mutex<Option<SignalHandler>>,
}

impl SignalChannel {
    pub fn new(window: Arc<Window>, local: CoreId) -> Self {
        Self {
            window,
            local,
            handler: Mutex::new(None),
        }
    }

    pub fn local(&self) -> CoreId {
        self.local
    }

    /// Ring the peer's doorbell.
    ///
    /// Callable from any context. Repeated signals before the peer drains
    /// collapse into one, since the peer rescans everything queued.
    pub fn signal(&self, reasons: Reasons) {
        // every payload and descriptor write must be visible before the bit is
        fence(Ordering::SeqCst);
        let bell = self.window.doorbell(self.local.peer());
        atomic_or(&bell.pending, reasons.bits());
        bell.wake.fetch_add(1, Ordering::Release);
        futex_wake_all(&bell.wake);
    }

    /// Install the handler run when this core observes a signal.
    /// Only during setup or teardown.
    pub fn set_handler<F>(&self, handler: F)
    where
        F: Fn(Reasons) + Send + Sync + 'static,
    {
        *self.handler.lock() = Some(Arc::new(handler));
    }

    pub fn clear_handler(&self) {
        *self.handler.lock() = None;
    }

    pub fn has_handler(&self) -> bool {
        self.handler.lock().is_some()
    }

    /// Atomically take and clear this core's pending reasons.
    pub fn take_pending(&self) -> Reasons {
        let bits = atomic_and(&self.window.doorbell(self.local).pending, 0);
        fence(Ordering::Acquire);
        Reasons(bits)
    }

    /// Pending reasons without clearing them.
    pub fn pending(&self) -> Reasons {
        Reasons(atomic_get(&self.window.doorbell(self.local).pending))
    }

    /// Drain the doorbell once and run the handler with what was pending.
    /// Returns whether anything was pending.
    pub fn poll(&self) -> bool {
        let reasons = self.take_pending();
        if reasons.is_empty() {
            return false;
        }
        // clone out so the handler runs without the lock held
        let handler = self.handler.lock().clone();
        match handler {
            Some(h) => h(reasons),
            None => {
                // nobody to deliver to yet; keep the bits for the next poll
                atomic_or(&self.window.doorbell(self.local).pending, reasons.bits());
                return false;
            }
        }
        true
    }

    /// Sleep until this core's doorbell rings or `timeout` passes.
    pub fn wait(&self, timeout: Option<Duration>) {
        let bell = self.window.doorbell(self.local);
        let seen = bell.wake.load(Ordering::Acquire);
        if bell.pending.load(Ordering::Acquire) != 0 {
            return;
        }
        futex_wait(&bell.wake, seen, timeout);
    }

    /// Wake a local waiter without setting any reason.
    pub(crate) fn nudge(&self) {
        let bell = self.window.doorbell(self.local);
        bell.wake.fetch_add(1, Ordering::Release);
        futex_wake_all(&bell.wake);
    }
}

impl fmt::Debug for SignalChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalChannel")
            .field("local", &self.local)
            .field("pending", &self.pending())
            .field("has_handler", &self.has_handler())
            .finish()
    }
}

/// Re-check interval for the dispatcher's stop flag.
const IRQ_WAIT_SLICE: Duration = Duration::from_millis(100);

/// Dispatcher thread standing in for the interrupt line.
pub struct IrqLine {
    channel: Arc<SignalChannel>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl IrqLine {
    pub fn spawn(channel: Arc<SignalChannel>) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let thread = {
            let channel = channel.clone();
            let stop = stop.clone();
            thread::Builder::new()
                .name(format!("xrpc-irq-{:?}", channel.local()).to_lowercase())
                .spawn(move || {
                    tracing::debug!(core = ?channel.local(), "irq line started");
                    while !stop.load(Ordering::Acquire) {
                        if !channel.poll() {
                            channel.wait(Some(IRQ_WAIT_SLICE));
                        }
                    }
                    tracing::debug!(core = ?channel.local(), "irq line stopped");
                })?
        };
        Ok(Self {
            channel,
            stop,
            thread: Some(thread),
        })
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.channel.nudge();
        if let Some(handle) = self.thread.take() {
            // the last owner may be dropped from inside the handler itself
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for IrqLine {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reasons_iterate_highest_first() {
        let both = Reasons::DATA | Reasons::RESET;
        let seen: Vec<Reasons> = both.iter().collect();
        assert_eq!(seen, vec![Reasons::RESET, Reasons::DATA]);
        assert!(both.contains(Reasons::DATA));
        assert!(!Reasons::DATA.contains(Reasons::RESET));
        assert!(!Reasons::DATA.contains(Reasons::NONE));
        assert!(Reasons::NONE.is_empty());
    }

    #[test]
    fn reasons_debug_names_bits() {
        let s = format!("{:?}", Reasons::DATA | Reasons::RESET);
        assert!(s.contains("DATA") && s.contains("RESET"));
    }
}
