// Transport header written at the start of every packet's first block.
// Plain integral fields only; all fields little-endian.

/// Header the transport places before the caller's payload.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PacketHeader {
    /// Payload length in bytes.
    pub len: u32,
    /// Per-lane send sequence, for ordering diagnostics.
    pub seq: u32,
}

pub const PACKET_HEADER_SIZE: usize = std::mem::size_of::<PacketHeader>();

impl PacketHeader {
    pub fn to_bytes(self) -> [u8; PACKET_HEADER_SIZE] {
        let mut out = [0u8; PACKET_HEADER_SIZE];
        out[..4].copy_from_slice(&self.len.to_le_bytes());
        out[4..].copy_from_slice(&self.seq.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8; PACKET_HEADER_SIZE]) -> Self {
        Self {
            len: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            seq: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }
}
