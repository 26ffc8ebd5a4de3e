// End-to-end call scenarios over an in-process endpoint pair.
// Run with: RUST_LOG=dmxp_xrpc=trace cargo test --test rpc_calls -- --nocapture
use dmxp_xrpc::RPC::{Delivery, Dispatch, Endpoint, EndpointBuilder};
use dmxp_xrpc::RpcError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

const PING1: u16 = 0x0101;
const PING2: u16 = 0x0102;
const SLOW: u16 = 0x0200;
const SILENT: u16 = 0x0300;
const OUTER: u16 = 0x0400;
const INNER: u16 = 0x0401;
const FAULTY: u16 = 0x0500;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn pair() -> (Arc<Endpoint>, Arc<Endpoint>) {
    init_tracing();
    let (primary, secondary) = EndpointBuilder::new()
        .with_block_size(128)
        .with_block_count(16)
        .build_pair()
        .unwrap();
    (Arc::new(primary), Arc::new(secondary))
}

fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_ping_both_directions() {
    let (primary, secondary) = pair();
    secondary.register(PING1, |req| Some([&b"pong1:"[..], req].concat()));
    primary.register(PING2, |req| Some([&b"pong2:"[..], req].concat()));

    let resp = primary.call(PING1, b"hi").unwrap();
    assert_eq!(&resp[..], b"pong1:hi");
    assert_eq!(resp.opcode(), PING1);

    let resp2 = secondary.call(PING2, b"there").unwrap();
    assert_eq!(resp2.payload(), b"pong2:there");

    // responses still sit in the responder's band until released
    assert!(secondary.pool().free_blocks() < 16);
    resp.release();
    drop(resp2);
    assert_eq!(secondary.pool().free_blocks(), 16);
    assert_eq!(primary.pool().free_blocks(), 16);
    assert_eq!(primary.outstanding_calls(), 0);
}

#[test]
fn test_empty_request_and_response() {
    let (primary, secondary) = pair();
    secondary.register(PING1, |req| {
        assert!(req.is_empty());
        Some(Vec::new())
    });
    let resp = primary.call(PING1, &[]).unwrap();
    assert!(resp.is_empty());
}

#[test]
fn test_concurrent_calls_are_correlated() {
    let (primary, secondary) = pair();
    secondary.register(PING1, |req| {
        // vary completion order
        thread::sleep(Duration::from_micros(fastrand::u64(0..500)));
        Some(req.iter().rev().copied().collect())
    });

    let start = Arc::new(Barrier::new(8));
    let handles: Vec<_> = (0..8u8)
        .map(|t| {
            let primary = primary.clone();
            let start = start.clone();
            thread::spawn(move || {
                start.wait();
                for i in 0..50u8 {
                    let req = [t, i, 0xEE];
                    let resp = primary
                        .call_timeout(PING1, &req, Some(Duration::from_secs(5)))
                        .unwrap();
                    assert_eq!(&resp[..], &[0xEE, i, t]);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let stats = primary.stats();
    assert_eq!(stats.calls_issued, 400);
    assert_eq!(stats.stale_responses, 0);
    assert_eq!(primary.outstanding_calls(), 0);
}

#[test]
fn test_timeout_then_stale_response_is_dropped() {
    let (primary, secondary) = pair();
    secondary.register(SLOW, |req| {
        thread::sleep(Duration::from_millis(200));
        Some(req.to_vec())
    });
    secondary.register(PING1, |req| Some(req.to_vec()));

    let start = Instant::now();
    let err = primary
        .call_timeout(SLOW, b"late", Some(Duration::from_millis(50)))
        .unwrap_err();
    assert_eq!(err, RpcError::Timeout);
    assert!(start.elapsed() < Duration::from_millis(200));
    // the id was retired before returning
    assert_eq!(primary.outstanding_calls(), 0);

    // the stale response is released, not leaked
    wait_until("stale response", || {
        primary.stats().stale_responses == 1 && secondary.pool().free_blocks() == 16
    });
    assert_eq!(primary.stats().calls_timed_out, 1);

    let resp = primary.call(PING1, b"fresh").unwrap();
    assert_eq!(&resp[..], b"fresh");
}

#[test]
fn test_peer_reset_unblocks_all_waiters() {
    let (primary, secondary) = pair();
    // served but never answered
    let seen = Arc::new(AtomicUsize::new(0));
    {
        let seen = seen.clone();
        secondary.register(SILENT, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            None
        });
    }

    const WAITERS: usize = 6;
    let handles: Vec<_> = (0..WAITERS)
        .map(|_| {
            let primary = primary.clone();
            thread::spawn(move || {
                let start = Instant::now();
                let result = primary.call_timeout(SILENT, b"?", None);
                (result.map(|r| r.to_vec()), start.elapsed())
            })
        })
        .collect();

    wait_until("all calls outstanding", || {
        primary.outstanding_calls() == WAITERS && seen.load(Ordering::SeqCst) == WAITERS
    });
    secondary.reset();

    for h in handles {
        let (result, _) = h.join().unwrap();
        assert_eq!(result.unwrap_err(), RpcError::PeerReset);
    }
    assert_eq!(primary.outstanding_calls(), 0);
    assert_eq!(primary.stats().resets_received, 1);

    // the link keeps working after the reset
    secondary.register(PING1, |req| Some(req.to_vec()));
    assert_eq!(&primary.call(PING1, b"again").unwrap()[..], b"again");
}

#[test]
fn test_local_reset_fails_own_waiters() {
    let (primary, secondary) = pair();
    secondary.register(SILENT, |_| None);

    let waiter = {
        let primary = primary.clone();
        thread::spawn(move || primary.call_timeout(SILENT, b"", None).map(|_| ()))
    };
    wait_until("call outstanding", || primary.outstanding_calls() == 1);
    primary.reset();

    assert_eq!(waiter.join().unwrap(), Err(RpcError::PeerReset));
    wait_until("peer saw reset", || secondary.stats().resets_received == 1);
}

#[test]
fn test_nested_call_from_handler() {
    let (primary, secondary) = pair();
    primary.register(INNER, |req| Some([&b"inner("[..], req, &b")"[..]].concat()));

    let weak = Arc::downgrade(&secondary);
    secondary.register(OUTER, move |req| {
        let endpoint = weak.upgrade()?;
        let inner = endpoint.call(INNER, req).ok()?;
        Some([&b"outer("[..], &inner[..], &b")"[..]].concat())
    });

    let resp = primary.call(OUTER, b"x").unwrap();
    assert_eq!(&resp[..], b"outer(inner(x))");
}

#[test]
fn test_unknown_opcode_is_dropped() {
    let (primary, secondary) = pair();
    let err = primary
        .call_timeout(0x7777, b"nobody", Some(Duration::from_millis(30)))
        .unwrap_err();
    assert_eq!(err, RpcError::Timeout);
    wait_until("request dropped", || {
        secondary.stats().unknown_opcodes == 1 && primary.pool().free_blocks() == 16
    });
}

#[test]
fn test_argument_and_state_errors() {
    let (primary, secondary) = pair();
    let too_big = vec![0u8; primary.pool().max_payload()];
    assert!(matches!(
        primary.call(PING1, &too_big),
        Err(RpcError::InvalidArgument(_))
    ));

    secondary.shutdown();
    assert!(matches!(
        secondary.call(PING1, b""),
        Err(RpcError::InvalidState(_))
    ));
    // shutdown is idempotent
    secondary.shutdown();
}

#[test]
fn test_shutdown_fails_pending_calls() {
    let (primary, secondary) = pair();
    secondary.register(SILENT, |_| None);
    let waiter = {
        let primary = primary.clone();
        thread::spawn(move || primary.call_timeout(SILENT, b"", None).map(|_| ()))
    };
    wait_until("call outstanding", || primary.outstanding_calls() == 1);
    primary.shutdown();
    assert_eq!(waiter.join().unwrap(), Err(RpcError::PeerReset));
}

#[test]
fn test_reset_abandons_call_waiting_for_blocks() {
    init_tracing();
    let (primary, secondary) = EndpointBuilder::new()
        .with_block_size(64)
        .with_block_count(2)
        .build_pair()
        .unwrap();
    let (primary, secondary) = (Arc::new(primary), Arc::new(secondary));
    secondary.register(PING1, |req| Some(req.to_vec()));

    let mut held = Vec::new();
    while let Ok(buf) = primary.pool().try_alloc(1) {
        held.push(buf);
    }
    assert_eq!(held.len(), 2);

    let old = {
        let primary = primary.clone();
        thread::spawn(move || primary.call_timeout(PING1, b"OLD", None).map(|r| r.to_vec()))
    };
    wait_until("call waiting for blocks", || primary.stats().alloc_waits == 1);
    primary.reset();
    // returns while the outbound region is still full
    wait_until("abandoned call", || old.is_finished());
    assert_eq!(old.join().unwrap(), Err(RpcError::PeerReset));
    assert_eq!(primary.stats().calls_issued, 0);

    drop(held);
    let resp = primary.call(PING1, b"NEW").unwrap();
    assert_eq!(&resp[..], b"NEW");
    // the abandoned request never reached the peer
    assert_eq!(secondary.stats().packets_received, 1);
}

#[test]
fn test_panicking_handler_keeps_worker_alive() {
    let (primary, secondary) = pair();
    secondary.register(FAULTY, |_| panic!("handler bug"));
    secondary.register(PING1, |req| Some(req.to_vec()));

    let err = primary
        .call_timeout(FAULTY, b"boom", Some(Duration::from_millis(50)))
        .unwrap_err();
    assert_eq!(err, RpcError::Timeout);
    wait_until("panic recorded", || {
        secondary.stats().handler_panics == 1 && primary.pool().free_blocks() == 16
    });

    let resp = primary.call(PING1, b"still here").unwrap();
    assert_eq!(&resp[..], b"still here");
}

#[test]
fn test_polled_inline_deployment() {
    init_tracing();
    let (primary, secondary) = EndpointBuilder::new()
        .with_block_size(64)
        .with_block_count(8)
        .with_dispatch(Dispatch::Inline)
        .with_delivery(Delivery::Polled)
        .build_pair()
        .unwrap();
    let (primary, secondary) = (Arc::new(primary), Arc::new(secondary));
    secondary.register(PING1, |req| Some(req.to_ascii_uppercase()));

    let caller = {
        let primary = primary.clone();
        thread::spawn(move || {
            (0..20)
                .map(|i| primary.call(PING1, format!("call {i}").as_bytes()).map(|r| r.to_vec()))
                .collect::<Vec<_>>()
        })
    };
    // a single loop services both doorbells
    while !caller.is_finished() {
        secondary.poll();
        primary.poll();
        thread::yield_now();
    }
    let results = caller.join().unwrap();
    for (i, r) in results.into_iter().enumerate() {
        assert_eq!(r.unwrap(), format!("CALL {i}").into_bytes());
    }
}

#[test]
fn test_stats_track_traffic() {
    let (primary, secondary) = pair();
    secondary.register(PING1, |req| Some(req.to_vec()));
    for _ in 0..5 {
        primary.call(PING1, b"s").unwrap();
    }
    let p = primary.stats();
    let s = secondary.stats();
    assert_eq!(p.calls_issued, 5);
    assert_eq!(p.packets_sent, 5);
    assert_eq!(p.packets_received, 5);
    assert_eq!(s.packets_received, 5);
    assert_eq!(s.packets_sent, 5);
    assert_eq!(s.calls_issued, 0);
}
