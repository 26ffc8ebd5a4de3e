use super::correlation::Dispatch;
use super::endpoint::Endpoint;
use crate::error::Result;
use crate::Core::alloc::{CoreId, Window};
use crate::Core::SharedMemory::{attach_shared_memory, create_shared_memory, HeapSharedMemory};
use crate::RPC::Buffer::layout::GlobalHeader;
use std::sync::Arc;
use std::time::Duration;

/// How doorbell signals reach the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Delivery {
    /// A dispatcher thread sleeps on the doorbell.
    #[default]
    Thread,
    /// The owner calls [`Endpoint::poll`].
    Polled,
}

#[derive(Debug, Clone)]
pub struct RpcConfig {
    pub block_size: usize,
    pub block_count: usize,
    pub call_timeout: Option<Duration>,
    pub dispatch: Dispatch,
    pub delivery: Delivery,
    /// Name under /dev/shm for cross-process windows.
    pub shm_name: String,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            block_size: 256,
            block_count: 32,
            call_timeout: Some(Duration::from_secs(1)),
            dispatch: Dispatch::Worker,
            delivery: Delivery::Thread,
            shm_name: "dmxp_xrpc".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EndpointBuilder {
    config: RpcConfig,
}

impl EndpointBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: RpcConfig) -> Self {
        Self { config }
    }

    pub fn with_block_size(mut self, size: usize) -> Self {
        self.config.block_size = size;
        self
    }

    pub fn with_block_count(mut self, count: usize) -> Self {
        self.config.block_count = count;
        self
    }

    pub fn with_shm_name(mut self, name: impl Into<String>) -> Self {
        self.config.shm_name = name.into();
        self
    }

    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.call_timeout = timeout;
        self
    }

    pub fn with_dispatch(mut self, dispatch: Dispatch) -> Self {
        self.config.dispatch = dispatch;
        self
    }

    pub fn with_delivery(mut self, delivery: Delivery) -> Self {
        self.config.delivery = delivery;
        self
    }

    pub fn config(&self) -> &RpcConfig {
        &self.config
    }

    /// Both cores in this process over one heap window: `(primary, secondary)`.
    pub fn build_pair(self) -> Result<(Endpoint, Endpoint)> {
        let size = Window::required_size(self.config.block_size, self.config.block_count);
        let shm = HeapSharedMemory::new(size)?;
        let window = Arc::new(Window::create(
            Box::new(shm),
            self.config.block_size,
            self.config.block_count,
        )?);
        let primary = Endpoint::start(window.clone(), CoreId::Primary, &self.config)?;
        let secondary = Endpoint::start(window, CoreId::Secondary, &self.config)?;
        Ok((primary, secondary))
    }

    /// Create and lay out `/dev/shm/<shm_name>`, then start the primary core on it.
    pub fn build_primary(self) -> Result<Endpoint> {
        let size = Window::required_size(self.config.block_size, self.config.block_count);
        let shm = create_shared_memory(size, &self.config.shm_name)?;
        let window = Arc::new(Window::create(
            shm,
            self.config.block_size,
            self.config.block_count,
        )?);
        Endpoint::start(window, CoreId::Primary, &self.config)
    }

    /// Attach to a window the primary already created. Geometry comes from
    /// the window header; the builder's block settings are ignored.
    pub fn build_secondary(self) -> Result<Endpoint> {
        let shm = attach_shared_memory(&self.config.shm_name, std::mem::size_of::<GlobalHeader>())?;
        let window = Arc::new(Window::attach(shm)?);
        Endpoint::start(window, CoreId::Secondary, &self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = RpcConfig::default();
        assert_eq!(config.block_size, 256);
        assert_eq!(config.block_count, 32);
        assert_eq!(config.call_timeout, Some(Duration::from_secs(1)));
        assert_eq!(config.dispatch, Dispatch::Worker);
        assert_eq!(config.delivery, Delivery::Thread);
    }

    #[test]
    fn bad_geometry_is_rejected() {
        let err = EndpointBuilder::new()
            .with_block_count(3)
            .build_pair()
            .unwrap_err();
        assert!(matches!(err, crate::error::RpcError::InvalidArgument(_)));

        let err = EndpointBuilder::new()
            .with_block_size(100)
            .build_pair()
            .unwrap_err();
        assert!(matches!(err, crate::error::RpcError::InvalidArgument(_)));
    }
}
