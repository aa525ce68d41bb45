//! Base types of the 1394 bus model.

/// A 32-bit big-endian bus word. Kept in host order everywhere; byte order
/// is fixed at the DMA/MMIO boundary.
pub type Quadlet = u32;

/// 16-bit node address: 10-bit bus number + 6-bit physical ID.
pub type NodeId = u16;

/// The local bus number (0x3ff) in the upper ten bits of a NodeId.
pub const LOCAL_BUS: NodeId = 0xffc0;

/// Node number 63 is the broadcast address, never a real node.
pub const BROADCAST_NODE_NUMBER: u8 = 63;

/// Maximum nodes on one bus.
pub const MAX_NODES: usize = 63;

/// TLabel is a 6-bit field, so 64 transactions can be in flight at once.
pub const TLABEL_COUNT: usize = 64;

pub fn node_number(id: NodeId) -> u8 {
    (id & 0x3f) as u8
}

/// Transfer speeds. The wire encoding is the exponent of the 100 Mbit/s
/// multiplier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Speed {
    S100 = 0,
    S200 = 1,
    S400 = 2,
    /// 1394b beta mode. Capped to S400 by the topology builder until beta
    /// speed codes are handled.
    Beta = 3,
}

impl Speed {
    pub fn from_wire(raw: u8) -> Speed {
        match raw & 3 {
            0 => Speed::S100,
            1 => Speed::S200,
            2 => Speed::S400,
            _ => Speed::Beta,
        }
    }

    /// Largest asynchronous payload at this speed, in bytes.
    pub fn max_payload(self) -> usize {
        1 << (self as usize + 9)
    }
}

/// 1394 transaction codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TCode {
    WriteQuadletRequest = 0x0,
    WriteBlockRequest = 0x1,
    WriteResponse = 0x2,
    ReadQuadletRequest = 0x4,
    ReadBlockRequest = 0x5,
    ReadQuadletResponse = 0x6,
    ReadBlockResponse = 0x7,
    CycleStart = 0x8,
    LockRequest = 0x9,
    WriteStream = 0xa,
    LockResponse = 0xb,
    /// OHCI-internal code used for transmitted PHY packets and received
    /// bus-reset markers.
    WritePhy = 0xe,
}

impl TCode {
    pub fn from_wire(raw: u8) -> Option<TCode> {
        Some(match raw & 0xf {
            0x0 => TCode::WriteQuadletRequest,
            0x1 => TCode::WriteBlockRequest,
            0x2 => TCode::WriteResponse,
            0x4 => TCode::ReadQuadletRequest,
            0x5 => TCode::ReadBlockRequest,
            0x6 => TCode::ReadQuadletResponse,
            0x7 => TCode::ReadBlockResponse,
            0x8 => TCode::CycleStart,
            0x9 => TCode::LockRequest,
            0xa => TCode::WriteStream,
            0xb => TCode::LockResponse,
            0xe => TCode::WritePhy,
            _ => return None,
        })
    }

    pub fn is_request(self) -> bool {
        matches!(
            self,
            TCode::WriteQuadletRequest
                | TCode::WriteBlockRequest
                | TCode::ReadQuadletRequest
                | TCode::ReadBlockRequest
                | TCode::LockRequest
                | TCode::WriteStream
                | TCode::WritePhy
        )
    }

    /// The response code answering this request. Write-family requests share
    /// one response code; the rest follow the tcode+2 rule.
    pub fn response_code(self) -> Option<TCode> {
        Some(match self {
            TCode::WriteQuadletRequest | TCode::WriteBlockRequest => TCode::WriteResponse,
            TCode::ReadQuadletRequest => TCode::ReadQuadletResponse,
            TCode::ReadBlockRequest => TCode::ReadBlockResponse,
            TCode::LockRequest => TCode::LockResponse,
            _ => return None,
        })
    }

    /// True when a packet of this tcode carries a data block after the
    /// header.
    pub fn has_payload(self) -> bool {
        matches!(
            self,
            TCode::WriteBlockRequest
                | TCode::LockRequest
                | TCode::ReadBlockResponse
                | TCode::LockResponse
                | TCode::WriteStream
        )
    }
}

/// Lock-transaction extended codes.
pub const EXTCODE_MASK_SWAP: u16 = 0x1;
pub const EXTCODE_COMPARE_SWAP: u16 = 0x2;
pub const EXTCODE_FETCH_ADD: u16 = 0x3;

/// Acknowledge codes. The first group is the 1394 wire encoding; the second
/// group never crosses the bus and reports link-local outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    Complete,
    Pending,
    BusyX,
    BusyA,
    BusyB,
    Tardy,
    ConflictError,
    DataError,
    TypeError,
    AddressError,
    /// No ack received (subaction gap or ack parity error).
    Missing,
    /// Packet flushed out of the FIFO by a bus reset.
    Generation,
    /// Response packet expired in the FIFO.
    Timeout,
    /// Submitter cancelled before transmission.
    Cancelled,
    /// Unknown OHCI event code.
    Other,
}

impl Ack {
    pub fn from_wire(raw: u8) -> Ack {
        match raw {
            0x1 => Ack::Complete,
            0x2 => Ack::Pending,
            0x4 => Ack::BusyX,
            0x5 => Ack::BusyA,
            0x6 => Ack::BusyB,
            0xb => Ack::Tardy,
            0xc => Ack::ConflictError,
            0xd => Ack::DataError,
            0xe => Ack::TypeError,
            0xf => Ack::AddressError,
            _ => Ack::Other,
        }
    }

    /// Terminal disposition of an ack that ends a transaction.
    pub fn to_rcode(self) -> RCode {
        match self {
            Ack::Complete => RCode::Complete,
            Ack::BusyX | Ack::BusyA | Ack::BusyB | Ack::Tardy => RCode::Busy,
            Ack::ConflictError => RCode::ConflictError,
            Ack::DataError => RCode::DataError,
            Ack::TypeError => RCode::TypeError,
            Ack::AddressError => RCode::AddressError,
            Ack::Missing => RCode::Missing,
            Ack::Generation => RCode::Generation,
            Ack::Timeout => RCode::Timeout,
            Ack::Cancelled => RCode::Cancelled,
            Ack::Pending | Ack::Other => RCode::SendError,
        }
    }
}

/// Response codes. The first five are the 1394 wire encoding; the rest are
/// link-local outcomes surfaced through the same completion path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RCode {
    Complete,
    ConflictError,
    DataError,
    TypeError,
    AddressError,
    Busy,
    Generation,
    Cancelled,
    Missing,
    SendError,
    Timeout,
}

impl RCode {
    pub fn from_wire(raw: u8) -> RCode {
        match raw & 0xf {
            0x0 => RCode::Complete,
            0x4 => RCode::ConflictError,
            0x5 => RCode::DataError,
            0x6 => RCode::TypeError,
            0x7 => RCode::AddressError,
            // Reserved wire codes surface as a data error.
            _ => RCode::DataError,
        }
    }

    /// Wire encoding for codes that can appear in a response header.
    pub fn to_wire(self) -> u8 {
        match self {
            RCode::Complete => 0x0,
            RCode::ConflictError => 0x4,
            RCode::DataError => 0x5,
            RCode::TypeError => 0x6,
            RCode::AddressError => 0x7,
            // Link-local codes never go on the bus; map them to the nearest
            // protocol code if a caller insists.
            RCode::Busy => 0x4,
            _ => 0x5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_to_rcode_table() {
        assert_eq!(Ack::Complete.to_rcode(), RCode::Complete);
        assert_eq!(Ack::BusyX.to_rcode(), RCode::Busy);
        assert_eq!(Ack::BusyA.to_rcode(), RCode::Busy);
        assert_eq!(Ack::BusyB.to_rcode(), RCode::Busy);
        assert_eq!(Ack::DataError.to_rcode(), RCode::DataError);
        assert_eq!(Ack::TypeError.to_rcode(), RCode::TypeError);
        assert_eq!(Ack::Missing.to_rcode(), RCode::Missing);
        assert_eq!(Ack::Generation.to_rcode(), RCode::Generation);
        assert_eq!(Ack::Timeout.to_rcode(), RCode::Timeout);
    }

    #[test]
    fn response_code_rule() {
        assert_eq!(
            TCode::WriteBlockRequest.response_code(),
            Some(TCode::WriteResponse)
        );
        assert_eq!(
            TCode::ReadQuadletRequest.response_code(),
            Some(TCode::ReadQuadletResponse)
        );
        assert_eq!(TCode::LockRequest.response_code(), Some(TCode::LockResponse));
        assert_eq!(TCode::WriteResponse.response_code(), None);
    }

    #[test]
    fn speed_payload_limits() {
        assert_eq!(Speed::S100.max_payload(), 512);
        assert_eq!(Speed::S400.max_payload(), 2048);
    }
}
