//! Hash backends behind one capability trait.
//!
//! The set is closed: a software SHA-256 running locally, and an offload
//! variant that ships the data to the peer core and lets it compute the
//! digest. Which one [`Backend::configured`] picks is fixed by the
//! `hash-offload` cargo feature.

use crate::error::{Result, RpcError};
use crate::RPC::{Endpoint, Opcode, CALL_HEADER_SIZE};
use sha2::{Digest as _, Sha256};
use std::sync::Arc;

/// Opcode the peer serves digests on.
pub const OP_SHA256: Opcode = 0xC001;

pub const DIGEST_LEN: usize = 32;

pub type Digest = [u8; DIGEST_LEN];

pub trait HashBackend {
    type Context;

    fn name(&self) -> &'static str;

    fn init(&self) -> Self::Context;

    fn update(&self, ctx: &mut Self::Context, data: &[u8]) -> Result<()>;

    fn finish(&self, ctx: Self::Context) -> Result<Digest>;

    /// One-shot convenience over init/update/finish.
    fn digest(&self, data: &[u8]) -> Result<Digest> {
        let mut ctx = self.init();
        self.update(&mut ctx, data)?;
        self.finish(ctx)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SoftwareSha256;

impl HashBackend for SoftwareSha256 {
    type Context = Sha256;

    fn name(&self) -> &'static str {
        "sha256-software"
    }

    fn init(&self) -> Sha256 {
        Sha256::new()
    }

    fn update(&self, ctx: &mut Sha256, data: &[u8]) -> Result<()> {
        ctx.update(data);
        Ok(())
    }

    fn finish(&self, ctx: Sha256) -> Result<Digest> {
        Ok(ctx.finalize().into())
    }
}

/// Input gathered locally until `finish` sends it to the peer in one call.
#[derive(Debug, Default, Clone)]
pub struct OffloadContext {
    buf: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct OffloadSha256 {
    endpoint: Arc<Endpoint>,
}

impl OffloadSha256 {
    pub fn new(endpoint: Arc<Endpoint>) -> Self {
        Self { endpoint }
    }

    /// Largest input one offloaded digest can cover.
    pub fn max_input(&self) -> usize {
        self.endpoint.pool().max_payload() - CALL_HEADER_SIZE
    }
}

impl HashBackend for OffloadSha256 {
    type Context = OffloadContext;

    fn name(&self) -> &'static str {
        "sha256-offload"
    }

    fn init(&self) -> OffloadContext {
        OffloadContext::default()
    }

    fn update(&self, ctx: &mut OffloadContext, data: &[u8]) -> Result<()> {
        if ctx.buf.len() + data.len() > self.max_input() {
            return Err(RpcError::InvalidArgument(
                "offloaded input larger than one request",
            ));
        }
        ctx.buf.extend_from_slice(data);
        Ok(())
    }

    fn finish(&self, ctx: OffloadContext) -> Result<Digest> {
        let response = self.endpoint.call(OP_SHA256, &ctx.buf)?;
        let digest: Digest = response
            .payload()
            .try_into()
            .map_err(|_| RpcError::Internal("peer returned a malformed digest"))?;
        Ok(digest)
    }
}

/// Register the digest service on `endpoint` so its peer can offload to it.
pub fn serve_sha256(endpoint: &Endpoint) {
    endpoint.register(OP_SHA256, |data| Some(Sha256::digest(data).to_vec()));
}

/// Per-operation state for whichever variant is active.
#[derive(Debug, Clone)]
pub enum BackendContext {
    Software(Sha256),
    Offload(OffloadContext),
}

const fn max(a: usize, b: usize) -> usize {
    if a > b {
        a
    } else {
        b
    }
}

/// Bytes of per-operation state needed by the largest compiled-in backend.
pub const CONTEXT_CAPACITY: usize = max(
    std::mem::size_of::<Sha256>(),
    std::mem::size_of::<OffloadContext>(),
);

const _: () = assert!(CONTEXT_CAPACITY >= std::mem::size_of::<Sha256>());
const _: () = assert!(CONTEXT_CAPACITY >= std::mem::size_of::<OffloadContext>());

#[derive(Debug, Clone)]
pub enum Backend {
    Software(SoftwareSha256),
    Offload(OffloadSha256),
}

#[cfg(not(feature = "hash-offload"))]
pub type DefaultBackend = SoftwareSha256;
#[cfg(feature = "hash-offload")]
pub type DefaultBackend = OffloadSha256;

impl Backend {
    /// The build's default variant. Offload needs an endpoint to the peer.
    #[cfg(not(feature = "hash-offload"))]
    pub fn configured(_endpoint: Option<Arc<Endpoint>>) -> Result<Backend> {
        Ok(Backend::Software(SoftwareSha256))
    }

    /// The build's default variant. Offload needs an endpoint to the peer.
    #[cfg(feature = "hash-offload")]
    pub fn configured(endpoint: Option<Arc<Endpoint>>) -> Result<Backend> {
        endpoint
            .map(|ep| Backend::Offload(OffloadSha256::new(ep)))
            .ok_or(RpcError::InvalidArgument("offload backend needs an endpoint"))
    }
}

impl HashBackend for Backend {
    type Context = BackendContext;

    fn name(&self) -> &'static str {
        match self {
            Backend::Software(b) => b.name(),
            Backend::Offload(b) => b.name(),
        }
    }

    fn init(&self) -> BackendContext {
        match self {
            Backend::Software(b) => BackendContext::Software(b.init()),
            Backend::Offload(b) => BackendContext::Offload(b.init()),
        }
    }

    fn update(&self, ctx: &mut BackendContext, data: &[u8]) -> Result<()> {
        match (self, ctx) {
            (Backend::Software(b), BackendContext::Software(c)) => b.update(c, data),
            (Backend::Offload(b), BackendContext::Offload(c)) => b.update(c, data),
            _ => Err(RpcError::InvalidArgument("context from another backend")),
        }
    }

    fn finish(&self, ctx: BackendContext) -> Result<Digest> {
        match (self, ctx) {
            (Backend::Software(b), BackendContext::Software(c)) => b.finish(c),
            (Backend::Offload(b), BackendContext::Offload(c)) => b.finish(c),
            _ => Err(RpcError::InvalidArgument("context from another backend")),
        }
    }
}
