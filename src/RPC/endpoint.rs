use super::builder::{Delivery, RpcConfig};
use super::call::Response;
use super::correlation::Correlator;
use super::header::Opcode;
use super::transport::Transport;
use crate::error::Result;
use crate::Core::alloc::{BufferPool, CoreId, Window};
use crate::Core::signal::{IrqLine, SignalChannel};
use crate::Core::stats::{LinkSnapshot, LinkStats};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// One core's end of the link.
///
/// Owns the signal channel, transport and correlator for `core`, plus the
/// dispatcher thread when delivery is threaded. Dropping it shuts all of
/// them down; the window itself lives as long as any buffer still refers to it.
pub struct Endpoint {
    core: CoreId,
    window: Arc<Window>,
    signal: Arc<SignalChannel>,
    transport: Arc<Transport>,
    correlator: Arc<Correlator>,
    irq: Mutex<Option<IrqLine>>,
    stats: Arc<LinkStats>,
    config: RpcConfig,
}

impl Endpoint {
    pub(crate) fn start(window: Arc<Window>, core: CoreId, config: &RpcConfig) -> Result<Self> {
        let stats = Arc::new(LinkStats::default());
        let signal = Arc::new(SignalChannel::new(window.clone(), core));
        let transport = Arc::new(Transport::new(
            window.clone(),
            core,
            signal.clone(),
            stats.clone(),
        ));
        let correlator = Correlator::new(transport.clone(), config.dispatch, stats.clone())?;

        if let Err(e) = transport.init(correlator.clone()) {
            correlator.shutdown();
            return Err(e);
        }

        let irq = match config.delivery {
            Delivery::Thread => match IrqLine::spawn(signal.clone()) {
                Ok(line) => Some(line),
                Err(e) => {
                    transport.shutdown();
                    correlator.shutdown();
                    return Err(e.into());
                }
            },
            Delivery::Polled => None,
        };

        tracing::debug!(
            ?core,
            dispatch = ?config.dispatch,
            delivery = ?config.delivery,
            "endpoint started"
        );

        Ok(Self {
            core,
            window,
            signal,
            transport,
            correlator,
            irq: Mutex::new(irq),
            stats,
            config: config.clone(),
        })
    }

    /// Serve requests for `opcode` with `handler`.
    pub fn register<F>(&self, opcode: Opcode, handler: F)
    where
        F: Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync + 'static,
    {
        self.correlator.register_handler(opcode, handler);
    }

    pub fn unregister(&self, opcode: Opcode) -> bool {
        self.correlator.unregister_handler(opcode)
    }

    /// Call the peer with the configured default timeout.
    pub fn call(&self, opcode: Opcode, payload: &[u8]) -> Result<Response> {
        self.correlator.call(opcode, payload, self.config.call_timeout)
    }

    /// Call the peer with an explicit timeout; `None` waits until a
    /// response or a reset arrives.
    pub fn call_timeout(
        &self,
        opcode: Opcode,
        payload: &[u8],
        timeout: Option<Duration>,
    ) -> Result<Response> {
        self.correlator.call(opcode, payload, timeout)
    }

    /// Service the doorbell once from the calling thread.
    /// Only meaningful with [`Delivery::Polled`].
    pub fn poll(&self) -> bool {
        self.signal.poll()
    }

    /// Restart this side of the link: fail local waiters and tell the peer
    /// to fail its own.
    pub fn reset(&self) {
        self.correlator.cancel_all("local reset");
        self.transport.reset();
    }

    pub fn stats(&self) -> LinkSnapshot {
        self.stats.snapshot()
    }

    pub fn pool(&self) -> &BufferPool {
        self.transport.pool()
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub fn correlator(&self) -> &Arc<Correlator> {
        &self.correlator
    }

    pub fn outstanding_calls(&self) -> usize {
        self.correlator.outstanding()
    }

    pub fn core(&self) -> CoreId {
        self.core
    }

    pub fn window(&self) -> &Arc<Window> {
        &self.window
    }

    pub fn config(&self) -> &RpcConfig {
        &self.config
    }

    /// Stop delivery, fail outstanding calls and release handlers. Idempotent.
    pub fn shutdown(&self) {
        let irq = self.irq.lock().take();
        if let Some(mut irq) = irq {
            irq.stop();
        }
        // closes the transport before the correlator so no new call slips in
        self.transport.shutdown();
        self.correlator.shutdown();
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.shutdown();
        tracing::debug!(core = ?self.core, "endpoint dropped");
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("core", &self.core)
            .field("ready", &self.transport.is_ready())
            .field("outstanding", &self.outstanding_calls())
            .field("pool", self.pool())
            .finish_non_exhaustive()
    }
}
