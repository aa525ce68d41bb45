//! Isochronous context framework.
//!
//! Only the context bookkeeping is implemented: probing how many contexts
//! the controller provides, claiming/releasing a context slot, and the
//! start/stop register discipline for receive contexts. The data path
//! (packet shaping, buffer chains) is not part of this stack and returns a
//! typed error.

use spin::Mutex;

use helios_core::error::{HeliosError, Result};

use crate::regs::{
    ctx, ctx_control_clear, ctx_control_set, ir_ctx_base, it_ctx_base, Registers,
    ISO_RECV_INT_MASK_CLEAR, ISO_RECV_INT_MASK_SET, ISO_XMIT_INT_MASK_CLEAR,
    ISO_XMIT_INT_MASK_SET,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsoKind {
    Transmit,
    Receive,
}

struct IsoState {
    transmit_mask: u32,
    receive_mask: u32,
    transmit_used: u32,
    receive_used: u32,
}

pub struct IsoContexts {
    regs: Registers,
    state: Mutex<IsoState>,
}

impl IsoContexts {
    /// Probe the implemented contexts by writing all-ones to the interrupt
    /// masks and reading back which bits stick.
    pub fn probe(regs: Registers) -> IsoContexts {
        regs.write(ISO_XMIT_INT_MASK_SET, !0);
        let transmit_mask = regs.read(ISO_XMIT_INT_MASK_SET);
        regs.write(ISO_XMIT_INT_MASK_CLEAR, !0);

        regs.write(ISO_RECV_INT_MASK_SET, !0);
        let receive_mask = regs.read(ISO_RECV_INT_MASK_SET);
        regs.write(ISO_RECV_INT_MASK_CLEAR, !0);

        IsoContexts {
            regs,
            state: Mutex::new(IsoState {
                transmit_mask,
                receive_mask,
                transmit_used: 0,
                receive_used: 0,
            }),
        }
    }

    pub fn transmit_count(&self) -> u32 {
        self.state.lock().transmit_mask.count_ones()
    }

    pub fn receive_count(&self) -> u32 {
        self.state.lock().receive_mask.count_ones()
    }

    /// Claim a context slot: a specific index, or the lowest free one.
    pub fn allocate(&self, kind: IsoKind, index: Option<u32>) -> Result<u32> {
        let mut state = self.state.lock();
        let (mask, used) = match kind {
            IsoKind::Transmit => (state.transmit_mask, &mut state.transmit_used),
            IsoKind::Receive => (state.receive_mask, &mut state.receive_used),
        };
        let candidates = mask & !*used;
        let index = match index {
            Some(i) => {
                if candidates & 1 << i == 0 {
                    return Err(HeliosError::Busy);
                }
                i
            }
            None => {
                if candidates == 0 {
                    return Err(HeliosError::Busy);
                }
                candidates.trailing_zeros()
            }
        };
        *used |= 1 << index;
        Ok(index)
    }

    pub fn release(&self, kind: IsoKind, index: u32) {
        let mut state = self.state.lock();
        match kind {
            IsoKind::Transmit => state.transmit_used &= !(1 << index),
            IsoKind::Receive => state.receive_used &= !(1 << index),
        }
    }

    /// Start a receive context on the given channel. The context match
    /// register and buffer program belong to the (absent) data path, so
    /// this only flips RUN.
    pub fn start_receive(&self, index: u32, _channel: u8) -> Result<()> {
        let base = ir_ctx_base(index as usize);
        self.regs.write(ctx_control_clear(base), !0);
        self.regs.write(ctx_control_set(base), ctx::RUN);
        Ok(())
    }

    pub fn stop_receive(&self, index: u32) {
        let base = ir_ctx_base(index as usize);
        self.regs.write(ctx_control_clear(base), ctx::RUN);
    }

    pub fn stop_transmit(&self, index: u32) {
        let base = it_ctx_base(index as usize);
        self.regs.write(ctx_control_clear(base), ctx::RUN);
    }

    /// The isochronous data path is out of scope for this stack.
    pub fn queue_receive_buffer(&self, _index: u32) -> Result<()> {
        Err(HeliosError::NotSupported)
    }

    pub fn queue_transmit_packet(&self, _index: u32) -> Result<()> {
        Err(HeliosError::NotSupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use helios_core::platform::Mmio;
    use spin::Mutex as SpinMutex;

    struct MaskMmio {
        xmit: SpinMutex<u32>,
        recv: SpinMutex<u32>,
    }

    impl Mmio for MaskMmio {
        fn read32(&self, offset: usize) -> u32 {
            match offset {
                ISO_XMIT_INT_MASK_SET => *self.xmit.lock() & 0xff,
                ISO_RECV_INT_MASK_SET => *self.recv.lock() & 0xf,
                _ => 0,
            }
        }

        fn write32(&self, offset: usize, value: u32) {
            match offset {
                ISO_XMIT_INT_MASK_SET => *self.xmit.lock() |= value,
                ISO_XMIT_INT_MASK_CLEAR => *self.xmit.lock() &= !value,
                ISO_RECV_INT_MASK_SET => *self.recv.lock() |= value,
                ISO_RECV_INT_MASK_CLEAR => *self.recv.lock() &= !value,
                _ => {}
            }
        }
    }

    #[test]
    fn probe_counts_implemented_contexts() {
        let mmio = Arc::new(MaskMmio {
            xmit: SpinMutex::new(0),
            recv: SpinMutex::new(0),
        });
        let iso = IsoContexts::probe(Registers::new(mmio));
        assert_eq!(iso.transmit_count(), 8);
        assert_eq!(iso.receive_count(), 4);
    }

    #[test]
    fn allocate_and_release_slots() {
        let mmio = Arc::new(MaskMmio {
            xmit: SpinMutex::new(0),
            recv: SpinMutex::new(0),
        });
        let iso = IsoContexts::probe(Registers::new(mmio));

        let a = iso.allocate(IsoKind::Receive, None).unwrap();
        assert_eq!(a, 0);
        let b = iso.allocate(IsoKind::Receive, None).unwrap();
        assert_eq!(b, 1);
        assert!(iso.allocate(IsoKind::Receive, Some(1)).is_err());
        iso.release(IsoKind::Receive, 1);
        assert_eq!(iso.allocate(IsoKind::Receive, Some(1)).unwrap(), 1);

        // Only four receive contexts exist.
        iso.allocate(IsoKind::Receive, Some(2)).unwrap();
        iso.allocate(IsoKind::Receive, Some(3)).unwrap();
        assert_eq!(iso.allocate(IsoKind::Receive, None), Err(HeliosError::Busy));

        assert_eq!(iso.queue_receive_buffer(0), Err(HeliosError::NotSupported));
    }
}
