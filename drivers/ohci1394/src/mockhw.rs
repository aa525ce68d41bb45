//! An in-memory OHCI register file for the driver tests: set/clear register
//! pairs, instant PHY and CSR compare-swap completion, and context-control
//! RUN/ACTIVE coupling. Paired with the core crate's mock DMA arena it lets
//! the whole driver run against scripted hardware.

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use helios_core::platform::mock::{MockBoard, MockDma};
use helios_core::platform::Mmio;

use crate::regs::*;

#[derive(Default)]
struct CtxRegs {
    control: u32,
    command_ptr: u32,
}

struct MockState {
    storage: [u32; 512],
    hc_control: u32,
    int_event: u32,
    int_mask: u32,
    iso_xmit_mask: u32,
    iso_recv_mask: u32,
    link_control: u32,
    phy: [u8; 16],
    phy_control: u32,
    csr_values: [u32; 4],
    csr_compare: u32,
    csr_swap: u32,
    csr_old: u32,
    csr_control: u32,
    at_request: CtxRegs,
    at_response: CtxRegs,
    ar_request: CtxRegs,
    ar_response: CtxRegs,
    short_resets: u32,
    long_resets: u32,
    order_log: Vec<&'static str>,
}

pub struct MockOhci {
    state: Mutex<MockState>,
}

impl MockOhci {
    pub fn new() -> Arc<MockOhci> {
        let mut storage = [0u32; 512];
        storage[VERSION / 4] = OHCI_VERSION_1_1;
        storage[VENDOR_ID / 4] = 0x0000_a0b1;
        storage[BUS_OPTIONS / 4] = 0x0000_a002;
        storage[GUID_HI / 4] = 0x00a0_b1ff;
        storage[GUID_LO / 4] = 0x1122_3344;
        storage[NODE_ID / 4] = node_id::ID_VALID; // node 0, valid
        storage[ISOCHRONOUS_CYCLE_TIMER / 4] = 0x0000_3000;
        Arc::new(MockOhci {
            state: Mutex::new(MockState {
                storage,
                hc_control: 0,
                int_event: 0,
                int_mask: 0,
                iso_xmit_mask: 0,
                iso_recv_mask: 0,
                link_control: 0,
                phy: [0; 16],
                phy_control: 0,
                csr_values: [0x3f, 0x1333, !0, !0],
                csr_compare: 0,
                csr_swap: 0,
                csr_old: 0,
                csr_control: 0,
                at_request: CtxRegs::default(),
                at_response: CtxRegs::default(),
                ar_request: CtxRegs::default(),
                ar_response: CtxRegs::default(),
                short_resets: 0,
                long_resets: 0,
                order_log: Vec::new(),
            }),
        })
    }

    /// Direct register poke for test setup.
    pub fn poke(&self, offset: usize, value: u32) {
        self.state.lock().storage[offset / 4] = value;
    }

    pub fn peek(&self, offset: usize) -> u32 {
        self.state.lock().storage[offset / 4]
    }

    /// Assert interrupt event bits, as the link would.
    pub fn raise_event(&self, bits: u32) {
        self.state.lock().int_event |= bits;
    }

    pub fn int_event(&self) -> u32 {
        self.state.lock().int_event
    }

    pub fn int_mask(&self) -> u32 {
        self.state.lock().int_mask
    }

    pub fn phy_register(&self, index: usize) -> u8 {
        self.state.lock().phy[index]
    }

    pub fn short_resets(&self) -> u32 {
        self.state.lock().short_resets
    }

    pub fn long_resets(&self) -> u32 {
        self.state.lock().long_resets
    }

    pub fn csr_value(&self, sel: usize) -> u32 {
        self.state.lock().csr_values[sel]
    }

    pub fn set_csr_value(&self, sel: usize, value: u32) {
        self.state.lock().csr_values[sel] = value;
    }

    pub fn at_request_command_ptr(&self) -> u32 {
        self.state.lock().at_request.command_ptr
    }

    pub fn at_request_control(&self) -> u32 {
        self.state.lock().at_request.control
    }

    pub fn ar_request_control(&self) -> u32 {
        self.state.lock().ar_request.control
    }

    /// Mark a context dead, as the controller does on a fatal descriptor
    /// error. The command pointer is left where the test put it.
    pub fn kill_context(&self, base: usize, fetched_command_ptr: u32) {
        let mut state = self.state.lock();
        let ctx = match base {
            AT_REQUEST_BASE => &mut state.at_request,
            AT_RESPONSE_BASE => &mut state.at_response,
            AR_REQUEST_BASE => &mut state.ar_request,
            _ => &mut state.ar_response,
        };
        ctx.control |= ctx::DEAD;
        ctx.command_ptr = fetched_command_ptr;
    }

    pub fn order_log(&self) -> Vec<&'static str> {
        self.state.lock().order_log.clone()
    }

    fn ctx_of(state: &mut MockState, base: usize) -> &mut CtxRegs {
        match base {
            AT_REQUEST_BASE => &mut state.at_request,
            AT_RESPONSE_BASE => &mut state.at_response,
            AR_REQUEST_BASE => &mut state.ar_request,
            AR_RESPONSE_BASE => &mut state.ar_response,
            _ => unreachable!(),
        }
    }

    fn is_ctx_reg(offset: usize) -> Option<(usize, usize)> {
        for base in [AT_REQUEST_BASE, AT_RESPONSE_BASE, AR_REQUEST_BASE, AR_RESPONSE_BASE] {
            if (base..base + 16).contains(&offset) {
                return Some((base, offset - base));
            }
        }
        None
    }
}

impl Mmio for MockOhci {
    fn read32(&self, offset: usize) -> u32 {
        let mut state = self.state.lock();
        if let Some((base, rel)) = Self::is_ctx_reg(offset) {
            let ctx = Self::ctx_of(&mut state, base);
            return match rel {
                0 | 4 => ctx.control,
                0xc => ctx.command_ptr,
                _ => 0,
            };
        }
        match offset {
            HC_CONTROL => state.hc_control,
            INT_EVENT_SET => state.int_event,
            INT_EVENT_CLEAR => state.int_event & state.int_mask,
            INT_MASK_SET => state.int_mask,
            ISO_XMIT_INT_MASK_SET => state.iso_xmit_mask,
            ISO_RECV_INT_MASK_SET => state.iso_recv_mask,
            LINK_CONTROL_SET => state.link_control,
            PHY_CONTROL => state.phy_control,
            CSR_READ_DATA => state.csr_old,
            CSR_CONTROL => state.csr_control,
            _ => state.storage[offset / 4],
        }
    }

    fn write32(&self, offset: usize, value: u32) {
        let mut state = self.state.lock();
        if let Some((base, rel)) = Self::is_ctx_reg(offset) {
            match rel {
                0 => {
                    // Control set: RUN implies ACTIVE in this model.
                    let ctx = Self::ctx_of(&mut state, base);
                    let bits = value & !ctx::WAKE;
                    ctx.control |= bits;
                    if value & ctx::RUN != 0 {
                        ctx.control |= ctx::ACTIVE;
                    }
                }
                4 => {
                    let ctx = Self::ctx_of(&mut state, base);
                    ctx.control &= !value;
                    if value & ctx::RUN != 0 {
                        ctx.control &= !ctx::ACTIVE;
                        if base == AT_REQUEST_BASE {
                            state.order_log.push("at-request-stop");
                        } else if base == AT_RESPONSE_BASE {
                            state.order_log.push("at-response-stop");
                        }
                    }
                }
                0xc => Self::ctx_of(&mut state, base).command_ptr = value,
                _ => {}
            }
            return;
        }
        match offset {
            HC_CONTROL_SET => {
                // Soft reset completes instantly in this model.
                state.hc_control |= value & !hcc::SOFT_RESET;
            }
            HC_CONTROL_CLEAR => state.hc_control &= !value,
            INT_EVENT_SET => state.int_event |= value,
            INT_EVENT_CLEAR => {
                if value & state.int_event & intr::BUS_RESET != 0 {
                    state.order_log.push("busreset-event-cleared");
                }
                state.int_event &= !value;
            }
            INT_MASK_SET => state.int_mask |= value,
            INT_MASK_CLEAR => state.int_mask &= !value,
            ISO_XMIT_INT_MASK_SET => state.iso_xmit_mask |= value,
            ISO_XMIT_INT_MASK_CLEAR => state.iso_xmit_mask &= !value,
            ISO_RECV_INT_MASK_SET => state.iso_recv_mask |= value,
            ISO_RECV_INT_MASK_CLEAR => state.iso_recv_mask &= !value,
            LINK_CONTROL_SET => state.link_control |= value,
            LINK_CONTROL_CLEAR => state.link_control &= !value,
            PHY_CONTROL => {
                if value & phy_control::RD_REG != 0 {
                    let addr = (value >> 8 & 0xf) as usize;
                    state.phy_control = phy_control::RD_DONE
                        | (addr as u32) << 24
                        | (state.phy[addr] as u32) << 16;
                } else if value & phy_control::WR_REG != 0 {
                    let addr = (value >> 8 & 0xf) as usize;
                    let data = (value & 0xff) as u8;
                    if addr == 1 && data & phy_reg::BUS_RESET != 0 {
                        state.long_resets += 1;
                        state.phy[addr] = data & !phy_reg::BUS_RESET;
                    } else if addr == 5 && data & phy_reg::SHORT_BUS_RESET != 0 {
                        state.short_resets += 1;
                        state.phy[addr] = data & !phy_reg::SHORT_BUS_RESET;
                    } else {
                        state.phy[addr] = data;
                    }
                    state.phy_control = 0;
                }
            }
            CSR_WRITE_DATA => state.csr_swap = value,
            CSR_COMPARE_DATA => state.csr_compare = value,
            CSR_CONTROL => {
                let sel = (value & 3) as usize;
                let old = state.csr_values[sel];
                if old == state.csr_compare {
                    state.csr_values[sel] = state.csr_swap;
                }
                state.csr_old = old;
                state.csr_control = value | CSR_CONTROL_DONE;
            }
            _ => state.storage[offset / 4] = value,
        }
    }
}

/// Assembled mock rig: register file, DMA arena and board.
pub struct Rig {
    pub mmio: Arc<MockOhci>,
    pub dma: Arc<MockDma>,
    pub board: Arc<MockBoard>,
}

impl Rig {
    pub fn new() -> Rig {
        let mmio = MockOhci::new();
        let dma = MockDma::new();
        let board = MockBoard::new(mmio.clone(), dma.clone());
        Rig { mmio, dma, board }
    }
}
