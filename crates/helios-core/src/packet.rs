//! The asynchronous packet model and its wire encoding.
//!
//! Headers are three or four 32-bit words. Transmitted packets put the
//! speed/tlabel/tcode word first with the destination in word 1; received
//! packets carry the destination in word 0 and the source in word 1. The
//! payload stays a byte block; quadlet operations use the inline quadlet.

use alloc::vec::Vec;

use crate::error::{HeliosError, Result};
use crate::types::{Ack, NodeId, Quadlet, RCode, Speed, TCode};

/// Retry code placed in every transmitted header.
pub const RETRY_X: u8 = 1;

#[derive(Debug, Clone)]
pub struct Packet {
    pub dest_id: NodeId,
    pub source_id: NodeId,
    pub tcode: TCode,
    pub ext_tcode: u16,
    pub tlabel: u8,
    pub retry: u8,
    pub speed: Speed,
    /// Bus generation this packet belongs to.
    pub generation: u8,
    /// 48-bit destination offset.
    pub offset: u64,
    pub header: [Quadlet; 4],
    /// Header length in bytes (8, 12 or 16).
    pub header_len: u8,
    pub quadlet_data: Quadlet,
    /// Block length for read-block requests and lock/block transfers.
    pub data_length: u16,
    pub payload: Vec<u8>,
    pub ack: Option<Ack>,
    pub rcode: Option<RCode>,
    /// 16-bit cycle-timer timestamp (3 bits seconds + 13 bits cycles).
    pub timestamp: u16,
}

impl Packet {
    pub fn new(tcode: TCode) -> Self {
        Packet {
            dest_id: 0,
            source_id: 0,
            tcode,
            ext_tcode: 0,
            tlabel: 0,
            retry: RETRY_X,
            speed: Speed::S100,
            generation: 0,
            offset: 0,
            header: [0; 4],
            header_len: 0,
            quadlet_data: 0,
            data_length: 0,
            payload: Vec::new(),
            ack: None,
            rcode: None,
            timestamp: 0,
        }
    }

    pub fn read_quadlet(speed: Speed, offset: u64) -> Self {
        let mut p = Packet::new(TCode::ReadQuadletRequest);
        p.speed = speed;
        p.offset = offset;
        p
    }

    pub fn read_block(speed: Speed, offset: u64, length: u16) -> Self {
        let mut p = Packet::new(TCode::ReadBlockRequest);
        p.speed = speed;
        p.offset = offset;
        p.data_length = length;
        p
    }

    pub fn write_quadlet(speed: Speed, offset: u64, data: Quadlet) -> Self {
        let mut p = Packet::new(TCode::WriteQuadletRequest);
        p.speed = speed;
        p.offset = offset;
        p.quadlet_data = data;
        p
    }

    pub fn write_block(speed: Speed, offset: u64, payload: Vec<u8>) -> Self {
        let mut p = Packet::new(TCode::WriteBlockRequest);
        p.speed = speed;
        p.offset = offset;
        p.data_length = payload.len() as u16;
        p.payload = payload;
        p
    }

    pub fn lock(speed: Speed, offset: u64, ext_tcode: u16, payload: Vec<u8>) -> Self {
        let mut p = Packet::new(TCode::LockRequest);
        p.speed = speed;
        p.offset = offset;
        p.ext_tcode = ext_tcode;
        p.data_length = payload.len() as u16;
        p.payload = payload;
        p
    }

    /// Encode the transmit header words for a request packet.
    pub fn encode_request(&mut self) -> Result<()> {
        self.header[0] = (self.speed as u32) << 16
            | (self.tlabel as u32 & 0x3f) << 10
            | (self.retry as u32 & 0xf) << 8
            | (self.tcode as u32) << 4;
        self.header[1] = (self.dest_id as u32) << 16 | ((self.offset >> 32) as u32 & 0xffff);
        self.header[2] = self.offset as u32;

        match self.tcode {
            TCode::ReadQuadletRequest => {
                self.header_len = 12;
            }
            TCode::WriteQuadletRequest => {
                self.header[3] = self.quadlet_data;
                self.header_len = 16;
            }
            TCode::ReadBlockRequest | TCode::WriteBlockRequest => {
                self.header[3] = (self.data_length as u32) << 16;
                self.header_len = 16;
            }
            TCode::LockRequest => {
                self.header[3] = (self.data_length as u32) << 16 | self.ext_tcode as u32;
                self.header_len = 16;
            }
            _ => return Err(HeliosError::BadCall),
        }
        Ok(())
    }

    pub fn header_quadlets(&self) -> &[Quadlet] {
        &self.header[..self.header_len as usize / 4]
    }

    /// Decode a received packet from its header words (and trailing payload
    /// words, for block tcodes). Returns the packet and the number of
    /// quadlets consumed, excluding the status trailer.
    pub fn parse(words: &[Quadlet]) -> Result<(Packet, usize)> {
        if words.len() < 3 {
            return Err(HeliosError::BadCall);
        }
        let h0 = words[0];
        let tcode = TCode::from_wire((h0 >> 4) as u8).ok_or(HeliosError::BadCall)?;

        let mut p = Packet::new(tcode);
        p.header[0] = h0;
        p.header[1] = words[1];
        p.header[2] = words[2];
        p.tlabel = ((h0 >> 10) & 0x3f) as u8;
        p.retry = ((h0 >> 8) & 0xf) as u8;
        p.dest_id = (h0 >> 16) as NodeId;
        p.source_id = (words[1] >> 16) as NodeId;

        let (header_quadlets, payload_quadlets) = match tcode {
            TCode::ReadQuadletRequest | TCode::WriteResponse | TCode::WritePhy => (3, 0),
            TCode::WriteQuadletRequest | TCode::ReadBlockRequest => (4, 0),
            TCode::ReadQuadletResponse => (4, 0),
            TCode::WriteBlockRequest
            | TCode::LockRequest
            | TCode::ReadBlockResponse
            | TCode::LockResponse => {
                if words.len() < 4 {
                    return Err(HeliosError::BadCall);
                }
                let len = (words[3] >> 16) as usize;
                (4, (len + 3) / 4)
            }
            _ => return Err(HeliosError::BadCall),
        };

        if words.len() < header_quadlets + payload_quadlets {
            return Err(HeliosError::BadCall);
        }

        if header_quadlets == 4 {
            p.header[3] = words[3];
        }
        p.header_len = (header_quadlets * 4) as u8;

        match tcode {
            TCode::ReadQuadletRequest | TCode::WriteQuadletRequest | TCode::ReadBlockRequest
            | TCode::WriteBlockRequest | TCode::LockRequest => {
                p.offset = ((words[1] as u64 & 0xffff) << 32) | words[2] as u64;
            }
            TCode::ReadQuadletResponse
            | TCode::ReadBlockResponse
            | TCode::WriteResponse
            | TCode::LockResponse => {
                p.rcode = Some(RCode::from_wire((words[1] >> 12) as u8));
            }
            _ => {}
        }

        match tcode {
            TCode::WriteQuadletRequest | TCode::ReadQuadletResponse => {
                p.quadlet_data = words[3];
            }
            TCode::ReadBlockRequest => {
                p.data_length = (words[3] >> 16) as u16;
            }
            TCode::WriteBlockRequest
            | TCode::LockRequest
            | TCode::ReadBlockResponse
            | TCode::LockResponse => {
                p.data_length = (words[3] >> 16) as u16;
                p.ext_tcode = words[3] as u16;
                let mut payload = Vec::with_capacity(p.data_length as usize);
                for &w in &words[4..4 + payload_quadlets] {
                    payload.extend_from_slice(&w.to_le_bytes());
                }
                payload.truncate(p.data_length as usize);
                p.payload = payload;
            }
            _ => {}
        }

        Ok((p, header_quadlets + payload_quadlets))
    }
}

/// Build a PHY configuration packet quadlet.
pub fn phy_config_quadlet(root_phy_id: Option<u8>, gap_count: Option<u8>) -> Quadlet {
    let mut q = 0u32; // PHY packet identifier 0 = configuration
    if let Some(root) = root_phy_id {
        q |= (root as u32 & 0x3f) << 24 | 1 << 23;
    }
    if let Some(gap) = gap_count {
        q |= (gap as u32 & 0x3f) << 16 | 1 << 22;
    }
    q
}

/// Response timestamp: request timestamp plus `offset_cycles` bus cycles
/// (125 µs each), with carry from the 13-bit cycle field into the seconds
/// field.
pub fn compute_response_timestamp(req_timestamp: u16, offset_cycles: u16) -> u16 {
    let mut cycles = (req_timestamp & 0x1fff) + offset_cycles;
    let mut seconds = req_timestamp & !0x1fff;
    if cycles >= 8000 {
        cycles -= 8000;
        seconds = seconds.wrapping_add(0x2000);
    }
    seconds | cycles
}
