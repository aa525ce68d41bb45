//! Self-ID DMA buffer and stream validation.
//!
//! The controller writes the self-ID burst into a 2 KiB-aligned buffer:
//! one header quadlet carrying the generation, then each packet quadlet
//! followed by its bitwise inverse. Multiple bus resets can overlap the
//! capture, so the count register's generation is sampled before and after
//! the body is read; a mismatch invalidates the snapshot.

use alloc::vec::Vec;

use helios_core::error::{HeliosError, Result};
use helios_core::platform::{DmaAllocator, DmaBuffer, PciBoard};
use helios_core::topology::SelfIdStream;

use crate::regs::{selfid_count, Registers, SELFID_COUNT};

pub const SELFID_BUFFER_SIZE: usize = 2048;

pub struct SelfIdBuffer {
    dma: DmaBuffer,
}

impl SelfIdBuffer {
    pub fn new(board: &dyn PciBoard) -> Result<SelfIdBuffer> {
        let dma = board.dma().alloc(SELFID_BUFFER_SIZE, SELFID_BUFFER_SIZE)?;
        Ok(SelfIdBuffer { dma })
    }

    pub fn bus_addr(&self) -> u32 {
        self.dma.bus_addr()
    }

    fn quadlet(&self, index: usize) -> u32 {
        self.dma.read_u32_le(index * 4)
    }

    /// Validate the captured stream against the count register and the
    /// inverse-quadlet rule. `local_node_id` is the already-checked node
    /// number from the NodeID register.
    pub fn validate(&self, regs: &Registers, local_node_id: u8) -> Result<SelfIdStream> {
        let count = regs.read(SELFID_COUNT);
        if count & selfid_count::ERROR != 0 {
            return Err(HeliosError::SelfIdInconsistent);
        }

        // Two quadlets per packet after the header quadlet.
        let quadlets = selfid_count::size_quadlets(count) as usize;
        if quadlets < 3 {
            return Err(HeliosError::SelfIdInconsistent);
        }
        let packet_count = (quadlets - 1) / 2;

        // Step 1: generation from the stream header.
        let generation = (self.quadlet(0) >> 16 & 0xff) as u8;

        // Step 2: packet quadlets, each paired with its inverse.
        let mut packets = Vec::with_capacity(packet_count);
        for i in 0..packet_count {
            let value = self.quadlet(1 + 2 * i);
            let inverse = self.quadlet(2 + 2 * i);
            if value != !inverse {
                log_error_packet(i, value, inverse);
                return Err(HeliosError::SelfIdInconsistent);
            }
            packets.push(value);
        }

        // Step 3: the capture is only coherent if no further reset landed
        // while we read it.
        let recheck = regs.read(SELFID_COUNT);
        if selfid_count::generation(recheck) != generation {
            return Err(HeliosError::SelfIdInconsistent);
        }

        Ok(SelfIdStream {
            generation,
            local_node_id,
            packets,
        })
    }
}

fn log_error_packet(index: usize, value: u32, inverse: u32) {
    helios_core::log_error!(
        "self-ID packet {}: {:08x} not mirrored by {:08x}",
        index,
        value,
        inverse
    );
}
