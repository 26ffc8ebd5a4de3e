use crate::error::{XRPC_ERROR_INVALID_ARG, XRPC_SUCCESS};
use crate::RPC::{Endpoint, EndpointBuilder};
use std::ptr;
use std::time::Duration;

const XRPC_ERROR_NULL_POINTER: i32 = -10;

/// Side selector for the pair API.
pub const XRPC_SIDE_PRIMARY: u32 = 0;
pub const XRPC_SIDE_SECONDARY: u32 = 1;

/// Handle to both ends of an in-process link (opaque pointer)
pub struct PairHandle {
    primary: Endpoint,
    secondary: Endpoint,
}

impl PairHandle {
    fn side(&self, side: u32) -> Option<&Endpoint> {
        match side {
            XRPC_SIDE_PRIMARY => Some(&self.primary),
            XRPC_SIDE_SECONDARY => Some(&self.secondary),
            _ => None,
        }
    }
}

// -----------------------------------------------------------------------------
// Lifecycle
// -----------------------------------------------------------------------------

/// Create both endpoints over one heap window.
///
/// # Arguments
/// * `block_size` - Bytes per block (multiple of 64).
/// * `block_count` - Blocks per lane (power of 2, at most 64).
///
/// # Returns
/// * Pointer to `PairHandle`, or NULL on failure.
#[no_mangle]
pub extern "C" fn dmxp_xrpc_pair_new(block_size: u32, block_count: u32) -> *mut PairHandle {
    match EndpointBuilder::new()
        .with_block_size(block_size as usize)
        .with_block_count(block_count as usize)
        .build_pair()
    {
        Ok((primary, secondary)) => Box::into_raw(Box::new(PairHandle { primary, secondary })),
        Err(e) => {
            tracing::error!(error = %e, "ffi: failed to build endpoint pair");
            ptr::null_mut()
        }
    }
}

/// Free a pair handle. Outstanding calls on either side fail with PEER_RESET.
#[no_mangle]
pub extern "C" fn dmxp_xrpc_pair_free(handle: *mut PairHandle) {
    if !handle.is_null() {
        unsafe {
            let _ = Box::from_raw(handle); // Dropped automatically
        }
    }
}

// -----------------------------------------------------------------------------
// Calls
// -----------------------------------------------------------------------------

/// Serve `opcode` on `side` by echoing the request payload back.
#[no_mangle]
pub extern "C" fn dmxp_xrpc_register_echo(handle: *mut PairHandle, side: u32, opcode: u16) -> i32 {
    if handle.is_null() {
        return XRPC_ERROR_NULL_POINTER;
    }
    let pair = unsafe { &*handle };
    match pair.side(side) {
        Some(endpoint) => {
            endpoint.register(opcode, |req| Some(req.to_vec()));
            XRPC_SUCCESS
        }
        None => XRPC_ERROR_INVALID_ARG,
    }
}

/// Call the opposite side from `side`.
///
/// # Arguments
/// * `req`/`req_len` - Request payload; `req` may be NULL when `req_len` is 0.
/// * `resp`/`resp_cap` - Buffer the response is copied into.
/// * `resp_len_out` - Set to the response length, also when `resp` is too small.
/// * `timeout_ms` - 0 uses the endpoint's default timeout.
///
/// # Returns
/// * 0 on success, negative error code otherwise.
///
/// # Safety
/// `req` must be valid for `req_len` bytes and `resp` for `resp_cap` bytes.
#[no_mangle]
pub unsafe extern "C" fn dmxp_xrpc_call(
    handle: *mut PairHandle,
    side: u32,
    opcode: u16,
    req: *const u8,
    req_len: usize,
    resp: *mut u8,
    resp_cap: usize,
    resp_len_out: *mut usize,
    timeout_ms: u32,
) -> i32 {
    if handle.is_null() || resp_len_out.is_null() || (req.is_null() && req_len != 0) {
        return XRPC_ERROR_NULL_POINTER;
    }
    let pair = &*handle;
    let Some(endpoint) = pair.side(side) else {
        return XRPC_ERROR_INVALID_ARG;
    };
    let request = if req_len == 0 {
        &[][..]
    } else {
        std::slice::from_raw_parts(req, req_len)
    };

    let result = if timeout_ms == 0 {
        endpoint.call(opcode, request)
    } else {
        endpoint.call_timeout(
            opcode,
            request,
            Some(Duration::from_millis(timeout_ms as u64)),
        )
    };

    match result {
        Ok(response) => {
            let payload = response.payload();
            *resp_len_out = payload.len();
            if payload.len() > resp_cap {
                return XRPC_ERROR_INVALID_ARG; // Buffer too small
            }
            if !payload.is_empty() {
                if resp.is_null() {
                    return XRPC_ERROR_NULL_POINTER;
                }
                ptr::copy_nonoverlapping(payload.as_ptr(), resp, payload.len());
            }
            XRPC_SUCCESS
        }
        Err(e) => e.code(),
    }
}

/// Announce a restart from `side`: its own waiters and the peer's fail with PEER_RESET.
#[no_mangle]
pub extern "C" fn dmxp_xrpc_reset(handle: *mut PairHandle, side: u32) -> i32 {
    if handle.is_null() {
        return XRPC_ERROR_NULL_POINTER;
    }
    let pair = unsafe { &*handle };
    match pair.side(side) {
        Some(endpoint) => {
            endpoint.reset();
            XRPC_SUCCESS
        }
        None => XRPC_ERROR_INVALID_ARG,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::XRPC_ERROR_TIMEOUT;

    #[test]
    fn echo_round_trip_through_c_surface() {
        let handle = dmxp_xrpc_pair_new(128, 8);
        assert!(!handle.is_null());
        assert_eq!(dmxp_xrpc_register_echo(handle, XRPC_SIDE_SECONDARY, 7), XRPC_SUCCESS);

        let req = b"hello";
        let mut resp = [0u8; 16];
        let mut len = 0usize;
        let rc = unsafe {
            dmxp_xrpc_call(
                handle,
                XRPC_SIDE_PRIMARY,
                7,
                req.as_ptr(),
                req.len(),
                resp.as_mut_ptr(),
                resp.len(),
                &mut len,
                1000,
            )
        };
        assert_eq!(rc, XRPC_SUCCESS);
        assert_eq!(&resp[..len], b"hello");

        dmxp_xrpc_pair_free(handle);
    }

    #[test]
    fn small_response_buffer_reports_length() {
        let handle = dmxp_xrpc_pair_new(128, 8);
        dmxp_xrpc_register_echo(handle, XRPC_SIDE_PRIMARY, 1);
        let req = [0xabu8; 32];
        let mut resp = [0u8; 4];
        let mut len = 0usize;
        let rc = unsafe {
            dmxp_xrpc_call(
                handle,
                XRPC_SIDE_SECONDARY,
                1,
                req.as_ptr(),
                req.len(),
                resp.as_mut_ptr(),
                resp.len(),
                &mut len,
                1000,
            )
        };
        assert_eq!(rc, XRPC_ERROR_INVALID_ARG);
        assert_eq!(len, 32);
        dmxp_xrpc_pair_free(handle);
    }

    #[test]
    fn unserved_opcode_times_out() {
        let handle = dmxp_xrpc_pair_new(128, 8);
        let mut len = 0usize;
        let rc = unsafe {
            dmxp_xrpc_call(
                handle,
                XRPC_SIDE_PRIMARY,
                99,
                ptr::null(),
                0,
                ptr::null_mut(),
                0,
                &mut len,
                20,
            )
        };
        assert_eq!(rc, XRPC_ERROR_TIMEOUT);
        dmxp_xrpc_pair_free(handle);
    }

    #[test]
    fn null_and_bad_side() {
        assert_eq!(dmxp_xrpc_reset(ptr::null_mut(), 0), XRPC_ERROR_NULL_POINTER);
        let handle = dmxp_xrpc_pair_new(64, 4);
        assert_eq!(dmxp_xrpc_reset(handle, 5), XRPC_ERROR_INVALID_ARG);
        assert!(dmxp_xrpc_pair_new(100, 4).is_null());
        dmxp_xrpc_pair_free(handle);
    }
}
