#[allow(non_snake_case)]
pub mod Core;
#[allow(non_snake_case)]
pub mod RPC;
#[allow(non_snake_case)]
pub mod Backend;
#[allow(non_snake_case)]
pub mod Debug {
    pub mod StructDebug;
}

pub mod error;
pub mod ffi;

pub use error::{Result, RpcError};
pub use Core::{CoreId, LinkSnapshot, RxBuffer, TxBuffer};
pub use RPC::{Delivery, Dispatch, Endpoint, EndpointBuilder, Response, RpcConfig};
