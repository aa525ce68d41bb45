//! Asynchronous receive contexts.
//!
//! Each context runs a circular chain of INPUT_MORE descriptors over a
//! contiguous block of pages in buffer-fill mode. A page is larger than any
//! single packet, so a packet can only be split where the ring wraps from
//! the last page back to the first; the worker reassembles that one case in
//! the just-emptied page before parsing. Each received packet ends with a
//! status quadlet carrying timestamp, event code and speed.

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use helios_core::error::Result;
use helios_core::log_warn;
use helios_core::packet::Packet;
use helios_core::platform::{DmaAllocator, DmaBuffer, PciBoard, TimeSource};
use helios_core::types::{Ack, Speed, TCode};

use crate::descriptor::{
    descriptor_at, Descriptor, BRANCH_ALWAYS, EVT_BUS_RESET, INPUT_MORE, STATUS,
};
use crate::regs::{ctx, ctx_command_ptr, ctx_control_clear, ctx_control_set, Registers};

/// A page must exceed the largest packet (S400 block: 16-byte header +
/// 2048-byte payload + trailer), so one wrap split is the worst case.
pub const AR_PAGE_SIZE: usize = 16 * 1024;
pub const AR_PAGE_COUNT: usize = 8;

const STOP_POLL_MS: u32 = 25;

/// Where the worker routes parsed packets. The generation pair gates stale
/// packets: everything received after a bus-reset marker with a generation
/// that is not the current one is dropped.
pub trait ArSink {
    fn ar_request(&self, packet: Packet);
    fn ar_response(&self, packet: Packet);
    fn ar_phy_packet(&self, quadlet: u32);
    /// A synthesized bus-reset packet carrying the new generation.
    fn ar_bus_reset_packet(&self, generation: u8);
    /// (generation of the last bus-reset packet, current self-ID
    /// generation).
    fn ar_generations(&self) -> (u8, u8);
}

struct ArState {
    /// Page the read cursor lives in.
    first_page: usize,
    /// Tail of the DMA ring (its descriptor has Z=0).
    last_page: usize,
    /// Absolute byte offset of the read cursor inside the pages block.
    cursor: usize,
    #[cfg(test)]
    fill: usize,
}

pub struct ArContext {
    name: &'static str,
    regs: Registers,
    reg_base: usize,
    time: Arc<dyn TimeSource>,
    descriptors: DmaBuffer,
    pages: DmaBuffer,
    is_request: bool,
    state: Mutex<ArState>,
}

impl ArContext {
    pub fn new(
        name: &'static str,
        regs: Registers,
        reg_base: usize,
        time: Arc<dyn TimeSource>,
        board: Arc<dyn PciBoard>,
        is_request: bool,
    ) -> Result<ArContext> {
        let descriptors = board.dma().alloc(AR_PAGE_COUNT * 16, 16)?;
        let pages = board.dma().alloc(AR_PAGE_COUNT * AR_PAGE_SIZE, 16)?;
        let ctx = ArContext {
            name,
            regs,
            reg_base,
            time,
            descriptors,
            pages,
            is_request,
            state: Mutex::new(ArState {
                first_page: 0,
                last_page: AR_PAGE_COUNT - 1,
                cursor: 0,
                #[cfg(test)]
                fill: 0,
            }),
        };
        ctx.reset_ring(&mut ctx.state.lock());
        Ok(ctx)
    }

    fn desc(&self, index: usize) -> &mut Descriptor {
        unsafe { descriptor_at(self.descriptors.as_ptr().add(index * 16)) }
    }

    fn desc_bus(&self, index: usize) -> u32 {
        self.descriptors.bus_addr() + (index * 16) as u32
    }

    fn page_bus(&self, index: usize) -> u32 {
        self.pages.bus_addr() + (index * AR_PAGE_SIZE) as u32
    }

    fn setup_page(&self, index: usize, next: usize, z: u32) {
        let d = self.desc(index);
        d.clear();
        d.set_control(INPUT_MORE | STATUS | BRANCH_ALWAYS);
        d.set_req_count(AR_PAGE_SIZE as u16);
        d.set_res_count(AR_PAGE_SIZE as u16);
        d.set_data_address(self.page_bus(index));
        d.set_branch_address(self.desc_bus(next) | z);
    }

    /// Rebuild the whole ring in its initial state.
    fn reset_ring(&self, state: &mut ArState) {
        for i in 0..AR_PAGE_COUNT {
            let (next, z) = if i + 1 < AR_PAGE_COUNT {
                (i + 1, 1)
            } else {
                (0, 0)
            };
            self.setup_page(i, next, z);
        }
        state.first_page = 0;
        state.last_page = AR_PAGE_COUNT - 1;
        state.cursor = 0;
        #[cfg(test)]
        {
            state.fill = 0;
        }
    }

    /// Start (or restart) reception from the current first page.
    pub fn start(&self) {
        let state = self.state.lock();
        let ctrl = self.regs.read(ctx_control_set(self.reg_base));
        if ctrl & ctx::RUN != 0 {
            return;
        }
        self.regs.write(
            ctx_command_ptr(self.reg_base),
            self.desc_bus(state.first_page) | 1,
        );
        self.regs.write(ctx_control_clear(self.reg_base), !0);
        self.regs.write(ctx_control_set(self.reg_base), ctx::RUN);
    }

    pub fn stop(&self) -> bool {
        self.regs.write(ctx_control_clear(self.reg_base), ctx::RUN);
        for _ in 0..3 {
            if self.regs.read(ctx_control_set(self.reg_base)) & ctx::ACTIVE == 0 {
                return true;
            }
            self.time.delay_ms(STOP_POLL_MS);
        }
        false
    }

    /// Parse and dispatch everything the controller has written since the
    /// last wake.
    pub fn service(&self, sink: &dyn ArSink) {
        let mut state = self.state.lock();

        let page = state.first_page;
        let page_start = page * AR_PAGE_SIZE;
        let res_count = self.desc(page).res_count() as usize;
        let already_read = state.cursor - page_start;
        let mut len = AR_PAGE_SIZE - res_count - already_read;
        let mut range_start = state.cursor;

        if res_count == 0 {
            // First page is full: recycle it and maybe concatenate the
            // split across the wrap.
            let at_end = page == AR_PAGE_COUNT - 1;
            let next = if at_end { 0 } else { page + 1 };

            self.desc(page).set_res_count(AR_PAGE_SIZE as u16);
            self.desc(page).set_transfer_status(0);
            state.first_page = next;

            if self.desc(next).transfer_status() != 0 {
                let mut rest = AR_PAGE_SIZE - self.desc(next).res_count() as usize;
                state.cursor = next * AR_PAGE_SIZE + rest;

                if at_end {
                    // Use the page we just emptied as the reassembly
                    // buffer: it fits at least one whole packet, so no
                    // second split can occur in the rebuilt range.
                    rest = rest.min(AR_PAGE_SIZE - len);
                    let src = next * AR_PAGE_SIZE;
                    unsafe {
                        let bytes = self.pages.bytes();
                        bytes.copy_within(range_start..range_start + len, page_start);
                        for i in 0..rest {
                            bytes[page_start + len + i] = bytes[src + i];
                        }
                    }
                    range_start = page_start;
                }
                len += rest;
            } else {
                state.cursor = next * AR_PAGE_SIZE;
            }

            self.parse_range(range_start, len, sink);

            // The recycled page becomes the new ring tail: unclamp the old
            // tail, clamp this one, tell the controller.
            let old_last = state.last_page;
            let branch = self.desc(old_last).branch_address();
            self.desc(old_last).set_branch_address(branch | 1);
            let branch = self.desc(page).branch_address();
            self.desc(page).set_branch_address(branch & !0xf);
            state.last_page = page;

            let ctrl = self.regs.read(ctx_control_set(self.reg_base));
            if ctrl & ctx::ACTIVE == 0 {
                // Whole ring consumed while we were away: start over.
                self.reset_ring(&mut state);
                drop(state);
                self.regs.write(ctx_control_clear(self.reg_base), ctx::RUN);
                self.start();
                return;
            }
            self.regs.write(ctx_control_set(self.reg_base), ctx::WAKE);
        } else if len > 0 {
            self.parse_range(range_start, len, sink);
            state.cursor += len;
        }
    }

    fn parse_range(&self, start: usize, len: usize, sink: &dyn ArSink) {
        let words: Vec<u32> = (0..len / 4)
            .map(|i| self.pages.read_u32_le(start + i * 4))
            .collect();
        let mut pos = 0;
        while pos < words.len() {
            match self.parse_one(&words[pos..], sink) {
                Some(consumed) => pos += consumed,
                None => {
                    // Receive error: the rest of this range is garbage.
                    log_warn!("{}: dropping {} quadlets", self.name, words.len() - pos);
                    break;
                }
            }
        }
    }

    /// Parse one packet (header, payload, trailer). Returns the quadlets
    /// consumed, or None to drop the remainder of the range.
    fn parse_one(&self, words: &[u32], sink: &dyn ArSink) -> Option<usize> {
        let (mut packet, consumed) = Packet::parse(words).ok()?;
        let trailer = *words.get(consumed)?;

        packet.timestamp = trailer as u16;
        let event = (trailer >> 16 & 0x1f) as u8;
        packet.speed = Speed::from_wire((trailer >> 21) as u8);

        if event == EVT_BUS_RESET {
            sink.ar_bus_reset_packet((packet.header[2] >> 16) as u8);
            return Some(consumed + 1);
        }
        if packet.tcode == TCode::WritePhy {
            sink.ar_phy_packet(packet.header[1]);
            return Some(consumed + 1);
        }
        if event < 0x10 {
            // evt_long_packet and friends: no usable packet boundary left.
            return None;
        }
        packet.ack = Some(Ack::from_wire(event - 0x10));

        // Drop packets that predate the current generation.
        let (br_generation, current) = sink.ar_generations();
        if br_generation != current {
            return Some(consumed + 1);
        }
        packet.generation = current;

        if self.is_request {
            sink.ar_request(packet);
        } else {
            sink.ar_response(packet);
        }
        Some(consumed + 1)
    }

    /// Test shim: emulate the controller writing a packet into the ring.
    #[cfg(test)]
    pub(crate) fn inject_raw(&self, words: &[u32]) {
        let mut state = self.state.lock();
        for &word in words {
            let fill = state.fill;
            let page = fill / AR_PAGE_SIZE;
            self.pages.write_u32_le(fill, word);
            let d = self.desc(page);
            d.set_res_count(d.res_count() - 4);
            d.set_transfer_status(0x0011);
            state.fill = (fill + 4) % (AR_PAGE_COUNT * AR_PAGE_SIZE);
        }
    }

    #[cfg(test)]
    pub(crate) fn fill_position(&self) -> usize {
        self.state.lock().fill
    }

    /// Test shim: pad the ring with zero quadlets (which parse as a
    /// dropped range) up to `target`, page-filling along the way.
    #[cfg(test)]
    pub(crate) fn pad_fill_to(&self, target: usize) {
        let mut state = self.state.lock();
        while state.fill != target {
            let fill = state.fill;
            let page = fill / AR_PAGE_SIZE;
            self.pages.write_u32_le(fill, 0);
            let d = self.desc(page);
            d.set_res_count(d.res_count() - 4);
            d.set_transfer_status(0x0011);
            state.fill = (fill + 4) % (AR_PAGE_COUNT * AR_PAGE_SIZE);
        }
    }
}
