//! Asynchronous transmit contexts.
//!
//! Each context owns a bounded pool of transmit buffers inside one
//! DMA-visible block. A buffer is a descriptor triple: an immediate
//! descriptor carrying the 3–4 header quadlets, an optional payload
//! pointer, and the terminator bits on whichever descriptor comes last.
//! Buffers are appended to the running DMA program FIFO-style; the
//! controller may acknowledge them out of order, so the completion handler
//! harvests the acknowledged prefix and keeps CommandPtr at the oldest
//! un-acknowledged block.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use helios_core::error::{HeliosError, Result};
use helios_core::packet::Packet;
use helios_core::{log_error, log_warn};
use helios_core::platform::{DmaAllocator, DmaBuffer, PciBoard, TimeSource};
use helios_core::types::{Ack, TCode};

use crate::descriptor::{
    descriptor_at, Descriptor, BRANCH_ALWAYS, EVT_FLUSHED, EVT_MISSING_ACK, EVT_TIMEOUT,
    IRQ_ALWAYS, KEY_IMMEDIATE, OUTPUT_LAST, STATUS,
};
use crate::regs::{ctx, ctx_command_ptr, ctx_control_clear, ctx_control_set, Registers};

/// One buffer = four descriptor slots (immediate descriptor, its header
/// data, payload descriptor, spare), so a 64 KiB pool carries 1024 packets.
pub const AT_BUFFER_STRIDE: usize = 64;
pub const AT_POOL_BYTES: usize = 64 * 1024;
pub const AT_BUFFER_COUNT: usize = AT_POOL_BYTES / AT_BUFFER_STRIDE;

const STOP_POLL_MS: u32 = 25;

pub type AckFn = Box<dyn FnOnce(Ack, u16) + Send>;

/// Per-packet metadata shared between the submitter and the completion
/// handler. Taking the sink is the cancellation sentinel: whoever takes it
/// first delivers (or suppresses) the one and only ack callback.
pub struct AtData {
    sink: Mutex<Option<AckFn>>,
}

impl AtData {
    pub fn new(sink: AckFn) -> Arc<AtData> {
        Arc::new(AtData {
            sink: Mutex::new(Some(sink)),
        })
    }

    pub fn complete(&self, ack: Ack, timestamp: u16) {
        let sink = self.sink.lock().take();
        if let Some(sink) = sink {
            sink(ack, timestamp);
        }
    }

    /// Suppress the ack callback. Idempotent.
    pub fn cancel(&self) {
        drop(self.sink.lock().take());
    }

    pub fn is_armed(&self) -> bool {
        self.sink.lock().is_some()
    }
}

struct BufMeta {
    atd: Option<Arc<AtData>>,
    /// Keeps payload memory alive (and DMA-visible) until the ack.
    payload: Option<Vec<u8>>,
    /// Descriptor count encoded in branch Z fields.
    z: u8,
    /// Slot index of the descriptor carrying status.
    last_slot: u8,
}

struct AtShared {
    free: VecDeque<usize>,
    inflight: VecDeque<usize>,
    meta: Vec<BufMeta>,
    /// Bus address | Z of the oldest un-acknowledged block, 0 when no
    /// program is live.
    command_ptr: u32,
    /// Tail of the DMA program; retained after completion so its branch
    /// word can still be patched by the next append.
    last_buffer: Option<usize>,
}

pub struct AtContext {
    name: &'static str,
    regs: Registers,
    reg_base: usize,
    time: Arc<dyn TimeSource>,
    board: Arc<dyn PciBoard>,
    dma: DmaBuffer,
    shared: Mutex<AtShared>,
}

impl AtContext {
    pub fn new(
        name: &'static str,
        regs: Registers,
        reg_base: usize,
        time: Arc<dyn TimeSource>,
        board: Arc<dyn PciBoard>,
    ) -> Result<AtContext> {
        let dma = board.dma().alloc(AT_POOL_BYTES, 16)?;
        let mut meta = Vec::with_capacity(AT_BUFFER_COUNT);
        let mut free = VecDeque::with_capacity(AT_BUFFER_COUNT);
        for i in 0..AT_BUFFER_COUNT {
            meta.push(BufMeta {
                atd: None,
                payload: None,
                z: 0,
                last_slot: 0,
            });
            free.push_back(i);
        }
        Ok(AtContext {
            name,
            regs,
            reg_base,
            time,
            board,
            dma,
            shared: Mutex::new(AtShared {
                free,
                inflight: VecDeque::new(),
                meta,
                command_ptr: 0,
                last_buffer: None,
            }),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn bus_of(&self, index: usize) -> u32 {
        self.dma.bus_addr() + (index * AT_BUFFER_STRIDE) as u32
    }

    fn index_of_bus(&self, bus: u32) -> Option<usize> {
        let base = self.dma.bus_addr();
        if bus < base {
            return None;
        }
        let index = ((bus - base) as usize) / AT_BUFFER_STRIDE;
        (index < AT_BUFFER_COUNT).then_some(index)
    }

    /// # Safety criteria: slot access is serialized by `shared`.
    fn desc(&self, index: usize, slot: usize) -> &mut Descriptor {
        unsafe {
            descriptor_at(
                self.dma
                    .as_ptr()
                    .add(index * AT_BUFFER_STRIDE + slot * 16),
            )
        }
    }

    pub fn pending(&self) -> usize {
        self.shared.lock().inflight.len()
    }

    pub fn free_buffers(&self) -> usize {
        self.shared.lock().free.len()
    }

    /// Queue one packet. `payload` must already be the exact block to send;
    /// the context keeps it alive until the ack arrives. For request tcodes
    /// the tlabel is spliced into header word 0.
    pub fn submit(
        &self,
        packet: &Packet,
        payload: Option<Vec<u8>>,
        atd: Arc<AtData>,
        tlabel: u8,
        timestamp: u16,
    ) -> Result<()> {
        let tcode = packet.tcode;

        let index = {
            let mut shared = self.shared.lock();
            match shared.free.pop_front() {
                Some(i) => i,
                None => {
                    log_warn!("{}: out of transmit buffers", self.name);
                    return Err(HeliosError::Busy);
                }
            }
        };

        let header = packet.header_quadlets();
        let header_len = header.len() * 4;
        let with_payload = payload.as_ref().map_or(false, |p| !p.is_empty());
        let z: u8 = if with_payload { 3 } else { 2 };
        let last_slot: u8 = if with_payload { 2 } else { 0 };

        let d0 = self.desc(index, 0);
        d0.clear();
        d0.set_control(KEY_IMMEDIATE);
        d0.set_req_count(header_len as u16);
        if !tcode.is_request() {
            // Response packets carry their expiry timestamp.
            d0.set_timestamp(timestamp);
        }

        for (i, &word) in header.iter().enumerate() {
            let word = if i == 0
                && tcode.is_request()
                && tcode != TCode::WritePhy
                && tcode != TCode::WriteStream
            {
                (word & !(0x3f << 10)) | (tlabel as u32 & 0x3f) << 10
            } else {
                word
            };
            self.dma
                .write_u32_le(index * AT_BUFFER_STRIDE + 16 + i * 4, word);
        }
        // Unused header words stay zeroed.
        for i in header.len()..4 {
            self.dma.write_u32_le(index * AT_BUFFER_STRIDE + 16 + i * 4, 0);
        }

        if let Some(data) = payload.as_ref() {
            let d2 = self.desc(index, 2);
            d2.clear();
            d2.set_req_count(data.len() as u16);
            d2.set_data_address(self.board.dma_phys(data.as_ptr()));
        }

        let last = self.desc(index, last_slot as usize);
        last.or_control(OUTPUT_LAST | STATUS | IRQ_ALWAYS | BRANCH_ALWAYS);
        last.set_branch_address(0);

        let mut shared = self.shared.lock();
        let slot = &mut shared.meta[index];
        slot.atd = Some(atd);
        slot.payload = payload;
        slot.z = z;
        slot.last_slot = last_slot;

        self.append_locked(&mut shared, index, z);
        self.run_locked(&shared);
        Ok(())
    }

    /// Link a filled buffer onto the DMA program and nudge the controller.
    fn append_locked(&self, shared: &mut AtShared, index: usize, z: u8) {
        if let Some(prev) = shared.last_buffer {
            let prev_slot = shared.meta[prev].last_slot as usize;
            self.desc(prev, prev_slot)
                .set_branch_address(self.bus_of(index) | z as u32);
            if shared.command_ptr == 0 {
                // The old program had finished; its retained tail is free
                // now that the branch word served its purpose.
                shared.free.push_back(prev);
            }
        }
        if shared.command_ptr == 0 {
            shared.command_ptr = self.bus_of(index) | z as u32;
        }
        shared.last_buffer = Some(index);
        shared.inflight.push_back(index);

        self.regs
            .write(ctx_control_set(self.reg_base), ctx::WAKE);
    }

    /// CommandPtr may only be written while the context is neither running
    /// nor active; otherwise the WAKE from the append suffices.
    fn run_locked(&self, shared: &AtShared) {
        let ctrl = self.regs.read(ctx_control_set(self.reg_base));
        if ctrl & (ctx::RUN | ctx::ACTIVE) == 0 && shared.command_ptr != 0 {
            self.regs
                .write(ctx_command_ptr(self.reg_base), shared.command_ptr);
            self.regs.write(ctx_control_clear(self.reg_base), !0);
            self.regs.write(ctx_control_set(self.reg_base), ctx::RUN);
        }
    }

    /// Stop the DMA program: clear RUN, then poll ACTIVE away.
    pub fn stop(&self) -> bool {
        self.regs.write(ctx_control_clear(self.reg_base), ctx::RUN);
        for _ in 0..3 {
            if self.regs.read(ctx_control_set(self.reg_base)) & ctx::ACTIVE == 0 {
                return true;
            }
            self.time.delay_ms(STOP_POLL_MS);
        }
        log_error!("{}: still active after stop request", self.name);
        false
    }

    /// Translate a transfer-status event into the 1394 ack the upper layers
    /// understand.
    fn ack_from_event(event: u8) -> Ack {
        match event {
            EVT_MISSING_ACK => Ack::Missing,
            EVT_FLUSHED => Ack::Generation,
            EVT_TIMEOUT => Ack::Timeout,
            0x10..=0x1f => Ack::from_wire(event - 0x10),
            _ => Ack::Other,
        }
    }

    /// Completion handler: harvest acknowledged buffers, recover a dead
    /// context, dispatch acks. Returns true when the context was found
    /// dead (the caller clears the unit's unrecoverable latch).
    pub fn service(&self) -> bool {
        let mut ready: Vec<(Arc<AtData>, Ack, u16)> = Vec::new();
        let dead;
        {
            let mut shared = self.shared.lock();
            let ctrl = self.regs.read(ctx_control_set(self.reg_base));
            dead = ctrl & ctx::DEAD != 0;

            // On a dead context the controller parks CommandPtr on the
            // fetched-but-unacknowledged block.
            let fetched = if dead {
                let ptr = self.regs.read(ctx_command_ptr(self.reg_base));
                self.index_of_bus(ptr & !0xf)
            } else {
                None
            };

            let mut harvested: Vec<usize> = Vec::new();
            for &index in shared.inflight.iter() {
                let last_slot = shared.meta[index].last_slot as usize;
                let status = self.desc(index, last_slot).transfer_status();
                if status != 0 {
                    harvested.push(index);
                } else if dead {
                    // Unacknowledged head of a dead program: synthesize a
                    // missing-ack and restart behind it.
                    self.desc(index, last_slot)
                        .set_transfer_status(EVT_MISSING_ACK as u16);
                    harvested.push(index);
                    if Some(index) == fetched {
                        break;
                    }
                } else {
                    break;
                }
            }

            for &index in &harvested {
                shared.inflight.retain(|&i| i != index);
            }

            // Reseed CommandPtr at the next not-yet-processed block.
            shared.command_ptr = match shared.inflight.front() {
                Some(&next) => self.bus_of(next) | shared.meta[next].z as u32,
                None => 0,
            };

            if dead {
                self.regs.write(ctx_control_clear(self.reg_base), !0);
                if shared.command_ptr != 0 {
                    self.regs
                        .write(ctx_command_ptr(self.reg_base), shared.command_ptr);
                }
                self.regs.write(ctx_control_set(self.reg_base), ctx::RUN);
                log_warn!("{}: dead context recovered", self.name);
            }

            for index in harvested {
                let last_slot = shared.meta[index].last_slot as usize;
                let desc = self.desc(index, last_slot);
                let ack = Self::ack_from_event(desc.event());
                let ts = desc.timestamp();
                desc.set_transfer_status(0);

                let slot = &mut shared.meta[index];
                let atd = slot.atd.take();
                slot.payload = None;
                if Some(index) != shared.last_buffer {
                    shared.free.push_back(index);
                }
                if let Some(atd) = atd {
                    ready.push((atd, ack, ts));
                }
            }
        }

        // Callbacks run without the context lock held.
        for (atd, ack, ts) in ready {
            atd.complete(ack, ts);
        }
        dead
    }
}

#[cfg(test)]
impl AtContext {
    /// Emulate the controller acknowledging the nth in-flight buffer.
    pub(crate) fn complete_nth(&self, nth: usize, status: u16, timestamp: u16) -> bool {
        let shared = self.shared.lock();
        match shared.inflight.get(nth).copied() {
            Some(index) => {
                let slot = shared.meta[index].last_slot as usize;
                let d = self.desc(index, slot);
                d.set_transfer_status(status);
                d.set_timestamp(timestamp);
                true
            }
            None => false,
        }
    }

    /// Header quadlets of every in-flight buffer, oldest first.
    pub(crate) fn inflight_headers(&self) -> Vec<[u32; 4]> {
        let shared = self.shared.lock();
        shared
            .inflight
            .iter()
            .map(|&index| {
                let base = index * AT_BUFFER_STRIDE + 16;
                [
                    self.dma.read_u32_le(base),
                    self.dma.read_u32_le(base + 4),
                    self.dma.read_u32_le(base + 8),
                    self.dma.read_u32_le(base + 12),
                ]
            })
            .collect()
    }

    /// Bus address | Z of the nth in-flight buffer.
    pub(crate) fn nth_bus_z(&self, nth: usize) -> Option<u32> {
        let shared = self.shared.lock();
        shared
            .inflight
            .get(nth)
            .map(|&index| self.bus_of(index) | shared.meta[index].z as u32)
    }
}
