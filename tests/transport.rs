// Transport-level tests with polled delivery: each side's doorbell is
// serviced explicitly from the test thread, so ordering is deterministic.
use dmxp_xrpc::Core::{CoreId, HeapSharedMemory, LinkStats, RxBuffer, SignalChannel, Window};
use dmxp_xrpc::RPC::{PacketSink, Transport};
use dmxp_xrpc::RpcError;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct Side {
    transport: Arc<Transport>,
    signal: Arc<SignalChannel>,
    stats: Arc<LinkStats>,
}

fn side(window: &Arc<Window>, core: CoreId) -> Side {
    let stats = Arc::new(LinkStats::default());
    let signal = Arc::new(SignalChannel::new(window.clone(), core));
    let transport = Arc::new(Transport::new(
        window.clone(),
        core,
        signal.clone(),
        stats.clone(),
    ));
    Side {
        transport,
        signal,
        stats,
    }
}

fn link(block_size: usize, block_count: usize) -> (Arc<Window>, Side, Side) {
    let shm = HeapSharedMemory::new(Window::required_size(block_size, block_count)).unwrap();
    let window = Arc::new(Window::create(Box::new(shm), block_size, block_count).unwrap());
    let primary = side(&window, CoreId::Primary);
    let secondary = side(&window, CoreId::Secondary);
    (window, primary, secondary)
}

fn send_bytes(from: &Side, payload: &[u8]) {
    let mut buf = from.transport.pool().try_alloc(payload.len()).unwrap();
    buf.as_mut_slice()[..payload.len()].copy_from_slice(payload);
    from.transport.send(buf, payload.len()).unwrap();
}

/// Sink that copies payloads out and drops the buffer (auto-free).
fn collecting_sink() -> (Arc<Mutex<Vec<Vec<u8>>>>, Arc<dyn PacketSink>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink: Arc<dyn PacketSink> = {
        let seen = seen.clone();
        Arc::new(move |rx: RxBuffer| seen.lock().push(rx.to_vec()))
    };
    (seen, sink)
}

#[test]
fn test_send_requires_init() {
    let (_w, primary, _secondary) = link(64, 4);
    let buf = primary.transport.pool().try_alloc(4).unwrap();
    assert!(matches!(
        primary.transport.send(buf, 4),
        Err(RpcError::InvalidState(_))
    ));
    // the rejected buffer went back to the pool
    assert_eq!(primary.transport.pool().free_blocks(), 4);
}

#[test]
fn test_second_init_is_rejected() {
    let (_w, primary, _secondary) = link(64, 4);
    let (_, sink) = collecting_sink();
    primary.transport.init(sink.clone()).unwrap();
    assert!(primary.transport.is_ready());
    assert!(matches!(
        primary.transport.init(sink),
        Err(RpcError::InvalidState(_))
    ));
}

#[test]
fn test_packets_arrive_in_order() {
    let (_w, primary, secondary) = link(64, 8);
    let (seen, sink) = collecting_sink();
    let (_, unused) = collecting_sink();
    primary.transport.init(unused).unwrap();
    secondary.transport.init(sink).unwrap();

    let mut rng = fastrand::Rng::with_seed(7);
    let mut expected = Vec::new();
    for i in 0..60u32 {
        let mut payload = i.to_le_bytes().to_vec();
        payload.resize(rng.usize(4..=100), i as u8);
        send_bytes(&primary, &payload);
        expected.push(payload);
        if i % 3 == 2 {
            assert!(secondary.signal.poll());
        }
    }
    secondary.signal.poll();

    assert_eq!(*seen.lock(), expected);
    // every buffer was dropped inside the sink
    assert_eq!(primary.transport.pool().free_blocks(), 8);
    assert_eq!(secondary.stats.snapshot().packets_received, 60);
    assert_eq!(primary.stats.snapshot().packets_sent, 60);
}

#[test]
fn test_retained_buffers_hold_blocks() {
    let (_w, primary, secondary) = link(64, 8);
    let kept: Arc<Mutex<Vec<RxBuffer>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let kept = kept.clone();
        secondary
            .transport
            .init(Arc::new(move |rx: RxBuffer| kept.lock().push(rx)))
            .unwrap();
    }
    let (_, unused) = collecting_sink();
    primary.transport.init(unused).unwrap();

    send_bytes(&primary, &[1; 10]);
    send_bytes(&primary, &[2; 100]);
    secondary.signal.poll();

    let pool = primary.transport.pool();
    assert_eq!(pool.free_blocks(), 8 - 3);
    {
        let kept = kept.lock();
        assert_eq!(&kept[0][..], &[1; 10]);
        assert_eq!(kept[1].len(), 100);
    }

    let first = kept.lock().remove(0);
    first.release();
    assert_eq!(pool.free_blocks(), 8 - 2);
    kept.lock().clear();
    assert_eq!(pool.free_blocks(), 8);
}

#[test]
fn test_foreign_buffer_is_rejected() {
    let (_w, primary, secondary) = link(64, 4);
    let (_, a) = collecting_sink();
    let (_, b) = collecting_sink();
    primary.transport.init(a).unwrap();
    secondary.transport.init(b).unwrap();

    // a buffer from the other direction's lane
    let wrong_lane = secondary.transport.pool().try_alloc(4).unwrap();
    assert!(matches!(
        primary.transport.send(wrong_lane, 4),
        Err(RpcError::InvalidArgument(_))
    ));

    // a buffer from another window entirely
    let (_w2, other, _) = link(64, 4);
    let foreign = other.transport.pool().try_alloc(4).unwrap();
    assert!(matches!(
        primary.transport.send(foreign, 4),
        Err(RpcError::InvalidArgument(_))
    ));

    let small = primary.transport.pool().try_alloc(4).unwrap();
    let too_long = small.capacity() + 1;
    assert!(matches!(
        primary.transport.send(small, too_long),
        Err(RpcError::InvalidArgument(_))
    ));
    assert_eq!(primary.transport.pool().free_blocks(), 4);
}

#[test]
fn test_packets_queued_before_init_are_delivered() {
    let (_w, primary, secondary) = link(64, 4);
    let (_, unused) = collecting_sink();
    primary.transport.init(unused).unwrap();

    send_bytes(&primary, b"early");
    let (seen, sink) = collecting_sink();
    secondary.transport.init(sink).unwrap();
    assert_eq!(seen.lock().as_slice(), &[b"early".to_vec()]);
}

struct ResetCounter(AtomicUsize);

impl PacketSink for ResetCounter {
    fn on_packet(&self, _packet: RxBuffer) {}

    fn on_peer_reset(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_reset_reaches_peer_sink() {
    let (_w, primary, secondary) = link(64, 4);
    let counter = Arc::new(ResetCounter(AtomicUsize::new(0)));
    secondary.transport.init(counter.clone()).unwrap();
    let (_, unused) = collecting_sink();
    primary.transport.init(unused).unwrap();

    primary.transport.reset();
    primary.transport.reset();
    assert!(secondary.signal.poll());
    // repeated signals before the drain collapse into one
    assert!(!secondary.signal.poll());
    assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    assert_eq!(secondary.stats.snapshot().resets_received, 1);
}

#[test]
fn test_shutdown_closes_transport() {
    let (_w, primary, _secondary) = link(64, 4);
    let (_, sink) = collecting_sink();
    primary.transport.init(sink.clone()).unwrap();
    primary.transport.shutdown();
    assert!(!primary.transport.is_ready());
    assert!(!primary.signal.has_handler());
    assert!(matches!(
        primary.transport.init(sink),
        Err(RpcError::InvalidState(_))
    ));
}
