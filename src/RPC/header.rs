// Correlation header: first bytes of every transport payload.
//
//   0      1      2..4        4..6      6..8
//  +------+------+-----------+---------+----------+
//  | kind | stat | opcode LE | tsn LE  | reserved |
//  +------+------+-----------+---------+----------+

/// Transaction sequence number; scoped to the core that issued the request.
pub type Tsn = u16;

/// Opcode space is owned by whoever registers handlers; the core only routes on it.
pub type Opcode = u16;

pub const CALL_HEADER_SIZE: usize = 8;

/// First id issued, and the value the counter restarts at after a reset.
pub const FIRST_TSN: Tsn = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Kind {
    Request = 1,
    Response = 2,
}

impl Kind {
    fn from_u8(v: u8) -> Option<Kind> {
        match v {
            1 => Some(Kind::Request),
            2 => Some(Kind::Response),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallHeader {
    pub kind: Kind,
    pub opcode: Opcode,
    pub tsn: Tsn,
}

impl CallHeader {
    pub fn request(opcode: Opcode, tsn: Tsn) -> Self {
        Self {
            kind: Kind::Request,
            opcode,
            tsn,
        }
    }

    /// Response header echoing a request's opcode and tsn.
    pub fn response_to(request: &CallHeader) -> Self {
        Self {
            kind: Kind::Response,
            opcode: request.opcode,
            tsn: request.tsn,
        }
    }

    pub fn encode(&self, out: &mut [u8]) {
        out[0] = self.kind as u8;
        // status byte is unused and written as 0
        out[1] = 0;
        out[2..4].copy_from_slice(&self.opcode.to_le_bytes());
        out[4..6].copy_from_slice(&self.tsn.to_le_bytes());
        out[6..8].copy_from_slice(&[0, 0]);
    }

    /// `None` for short packets or an unknown kind byte.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < CALL_HEADER_SIZE {
            return None;
        }
        Some(Self {
            kind: Kind::from_u8(bytes[0])?,
            opcode: u16::from_le_bytes([bytes[2], bytes[3]]),
            tsn: u16::from_le_bytes([bytes[4], bytes[5]]),
        })
    }
}
