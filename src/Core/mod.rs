pub mod SharedMemory;
pub mod alloc;
pub mod futex;
pub mod signal;
pub mod stats;
pub mod sync;

pub use SharedMemory::{
    attach_shared_memory, create_shared_memory, unlink_shared_memory, HeapSharedMemory, RawHandle,
    SharedMemoryBackend,
};
pub use alloc::{BufferPool, CoreId, RxBuffer, TxBuffer, Window};
pub use signal::{IrqLine, Reasons, SignalChannel};
pub use stats::{LinkSnapshot, LinkStats};
