mod builder;
mod call;
mod correlation;
mod endpoint;
pub mod header;
pub mod transport;
mod worker;

pub use builder::{Delivery, EndpointBuilder, RpcConfig};
pub use call::{CallState, Response};
pub use correlation::{Correlator, Dispatch};
pub use endpoint::Endpoint;
pub use header::{CallHeader, Kind, Opcode, Tsn, CALL_HEADER_SIZE, FIRST_TSN};
pub use transport::{PacketSink, Transport};
pub use worker::RequestHandler;

pub mod Buffer {
    pub mod layout;
    pub mod Ring;
    pub mod Ring_impl;
    pub use Ring::{DescriptorRing, PacketRef}; // re-export for stable path
}

pub mod Structs {
    pub mod Packet_Structs;
    pub use Packet_Structs::{PacketHeader, PACKET_HEADER_SIZE}; // re-export for stable path
}
