use std::io;
use thiserror::Error;

/// Errors surfaced by the RPC core.
///
/// Callers of the blocking call API only ever observe `Timeout`,
/// `PeerReset`, `InvalidArgument` or `InvalidState`; the remaining variants
/// come from setup paths (window creation, init) and the non-blocking pool.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RpcError {
    /// No buffer available and the caller cannot block.
    #[error("no shared buffer available")]
    NoMemory,

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("operation not supported")]
    NotSupported,

    #[error("internal error: {0}")]
    Internal(&'static str),

    /// Propagated from the OS layer (mmap, /dev/shm, futex).
    #[error("os error ({kind:?}): {message}")]
    Os { kind: io::ErrorKind, message: String },

    /// e.g. `call()` issued before `init()`.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// Re-entrant init.
    #[error("busy")]
    Busy,

    #[error("call timed out")]
    Timeout,

    #[error("peer reset")]
    PeerReset,
}

pub type Result<T> = std::result::Result<T, RpcError>;

// Status codes shared with the C surface
pub const XRPC_SUCCESS: i32 = 0;
pub const XRPC_ERROR_NO_MEMORY: i32 = -1;
pub const XRPC_ERROR_INVALID_ARG: i32 = -2;
pub const XRPC_ERROR_NOT_SUPPORTED: i32 = -3;
pub const XRPC_ERROR_INTERNAL: i32 = -4;
pub const XRPC_ERROR_OS: i32 = -5;
pub const XRPC_ERROR_INVALID_STATE: i32 = -6;
pub const XRPC_ERROR_BUSY: i32 = -7;
pub const XRPC_ERROR_TIMEOUT: i32 = -8;
pub const XRPC_ERROR_PEER_RESET: i32 = -9;

impl RpcError {
    /// Stable numeric status for the C ABI.
    pub fn code(&self) -> i32 {
        match self {
            Self::NoMemory => XRPC_ERROR_NO_MEMORY,
            Self::InvalidArgument(_) => XRPC_ERROR_INVALID_ARG,
            Self::NotSupported => XRPC_ERROR_NOT_SUPPORTED,
            Self::Internal(_) => XRPC_ERROR_INTERNAL,
            Self::Os { .. } => XRPC_ERROR_OS,
            Self::InvalidState(_) => XRPC_ERROR_INVALID_STATE,
            Self::Busy => XRPC_ERROR_BUSY,
            Self::Timeout => XRPC_ERROR_TIMEOUT,
            Self::PeerReset => XRPC_ERROR_PEER_RESET,
        }
    }
}

impl From<io::Error> for RpcError {
    fn from(e: io::Error) -> Self {
        Self::Os {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}
