//! Platform contracts.
//!
//! Everything the stack needs from the host environment goes through these
//! traits: PCI board access, MMIO register space, DMA-visible memory with
//! bus-address translation, and time. The `mock` module (feature `mock`)
//! provides in-memory implementations for host-side tests.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ptr::NonNull;

use crate::error::Result;

/// PCI class triple of an OHCI 1394 host controller.
pub const PCI_CLASS_SERIAL_BUS: u8 = 0x0c;
pub const PCI_SUBCLASS_FIREWIRE: u8 = 0x00;
pub const PCI_PROGIF_OHCI: u8 = 0x10;

/// Config-space word offsets the driver touches.
pub const PCI_CONFIG_COMMAND: u16 = 0x04;
pub const PCI_CONFIG_POWER_MGMT: u16 = 0x54;

/// A 32-bit register window. Implementations fix the byte order so callers
/// always see host-order values (OHCI registers are little-endian on the
/// bus).
pub trait Mmio: Send + Sync {
    fn read32(&self, offset: usize) -> u32;
    fn write32(&self, offset: usize, value: u32);
}

/// A chunk of DMA-visible memory with its bus address.
///
/// The buffer is plain shared memory between CPU and device; all access
/// goes through raw pointers and the owning context's lock.
pub struct DmaBuffer {
    cpu: NonNull<u8>,
    bus: u32,
    len: usize,
}

unsafe impl Send for DmaBuffer {}
unsafe impl Sync for DmaBuffer {}

impl DmaBuffer {
    /// # Safety
    /// `cpu` must point to `len` bytes of DMA-visible memory mapped at bus
    /// address `bus` for the device's lifetime.
    pub unsafe fn new(cpu: NonNull<u8>, bus: u32, len: usize) -> Self {
        DmaBuffer { cpu, bus, len }
    }

    pub fn bus_addr(&self) -> u32 {
        self.bus
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.cpu.as_ptr()
    }

    /// View as bytes. Caller serializes against the device.
    ///
    /// # Safety
    /// No other CPU reference may alias mutably, and device writes must be
    /// quiesced or tolerated by the caller.
    pub unsafe fn bytes(&self) -> &mut [u8] {
        core::slice::from_raw_parts_mut(self.cpu.as_ptr(), self.len)
    }

    pub fn read_u32_le(&self, offset: usize) -> u32 {
        debug_assert!(offset + 4 <= self.len);
        let mut raw = [0u8; 4];
        unsafe {
            core::ptr::copy_nonoverlapping(self.cpu.as_ptr().add(offset), raw.as_mut_ptr(), 4);
        }
        u32::from_le_bytes(raw)
    }

    pub fn write_u32_le(&self, offset: usize, value: u32) {
        debug_assert!(offset + 4 <= self.len);
        let raw = value.to_le_bytes();
        unsafe {
            core::ptr::copy_nonoverlapping(raw.as_ptr(), self.cpu.as_ptr().add(offset), 4);
        }
    }
}

pub trait DmaAllocator: Send + Sync {
    /// Allocate zeroed DMA-visible memory with the given alignment.
    fn alloc(&self, len: usize, align: usize) -> Result<DmaBuffer>;
    fn free(&self, buf: DmaBuffer);
}

pub trait TimeSource: Send + Sync {
    fn now_ms(&self) -> u64;
    /// Coarse sleep used by polling loops; never called from interrupt
    /// context.
    fn delay_ms(&self, ms: u32);
}

pub type IrqHandlerFn = Box<dyn Fn() + Send + Sync>;

/// One claimable PCI board.
pub trait PciBoard: Send + Sync {
    /// Try to take cooperative ownership. Fails when another owner holds
    /// the board.
    fn attempt_claim(&self, owner: &'static str) -> bool;
    fn release_claim(&self);
    /// Drop the recorded owner so another stack may claim the board.
    fn clear_owner(&self);

    fn config_read16(&self, offset: u16) -> u16;
    fn config_write16(&self, offset: u16, value: u16);

    fn bar_base(&self, index: u8) -> usize;
    fn bar_size(&self, index: u8) -> usize;
    /// Register window over the given BAR.
    fn mmio(&self, index: u8) -> Arc<dyn Mmio>;

    fn dma(&self) -> Arc<dyn DmaAllocator>;
    /// CPU → bus address translation for memory outside the DMA allocator
    /// (payload buffers handed in by callers).
    fn dma_phys(&self, cpu: *const u8) -> u32;

    fn irq_install(&self, handler: IrqHandlerFn) -> Result<()>;
    fn irq_remove(&self);
}

pub trait PciAccessor: Send + Sync {
    /// Boards matching the serial-bus/FireWire/OHCI class triple that are
    /// not already owned.
    fn find_boards(&self) -> Vec<Arc<dyn PciBoard>>;
}

#[cfg(any(test, feature = "mock"))]
pub mod mock {
    //! In-memory platform for host-side tests: a DMA arena with fake bus
    //! addresses, virtual time, and a PCI board wrapping any register-file
    //! `Mmio` implementation the test supplies.

    use alloc::alloc::{alloc_zeroed, dealloc, Layout};
    use alloc::sync::Arc;
    use alloc::vec::Vec;
    use core::ptr::NonNull;
    use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    use spin::Mutex;

    use super::*;
    use crate::error::{HeliosError, Result};

    pub struct MockTime {
        now: AtomicU64,
    }

    impl MockTime {
        pub fn new() -> Arc<Self> {
            Arc::new(MockTime {
                now: AtomicU64::new(0),
            })
        }
    }

    impl TimeSource for MockTime {
        fn now_ms(&self) -> u64 {
            self.now.load(Ordering::Relaxed)
        }

        fn delay_ms(&self, ms: u32) {
            // Virtual time: sleeping just advances the clock.
            self.now.fetch_add(ms as u64, Ordering::Relaxed);
        }
    }

    struct Allocation {
        ptr: usize,
        layout: Layout,
        bus: u32,
    }

    /// Arena handing out real heap memory tagged with synthetic bus
    /// addresses starting at 0x1000_0000.
    pub struct MockDma {
        allocations: Mutex<Vec<Allocation>>,
        next_bus: AtomicU64,
    }

    impl MockDma {
        pub fn new() -> Arc<Self> {
            Arc::new(MockDma {
                allocations: Mutex::new(Vec::new()),
                next_bus: AtomicU64::new(0x1000_0000),
            })
        }

        /// Reverse translation for test assertions.
        pub fn cpu_at(&self, bus: u32) -> Option<*mut u8> {
            let allocations = self.allocations.lock();
            for a in allocations.iter() {
                let size = a.layout.size() as u32;
                if bus >= a.bus && bus < a.bus + size {
                    return Some((a.ptr + (bus - a.bus) as usize) as *mut u8);
                }
            }
            None
        }

        pub fn phys_of(&self, cpu: *const u8) -> Option<u32> {
            let allocations = self.allocations.lock();
            for a in allocations.iter() {
                let start = a.ptr;
                let end = start + a.layout.size();
                if (cpu as usize) >= start && (cpu as usize) < end {
                    return Some(a.bus + (cpu as usize - start) as u32);
                }
            }
            None
        }
    }

    impl DmaAllocator for MockDma {
        fn alloc(&self, len: usize, align: usize) -> Result<DmaBuffer> {
            let layout =
                Layout::from_size_align(len.max(1), align.max(1)).map_err(|_| HeliosError::BadCall)?;
            let ptr = unsafe { alloc_zeroed(layout) };
            let ptr = NonNull::new(ptr).ok_or(HeliosError::NoMemory)?;
            // Keep synthetic bus ranges aligned like the CPU side.
            let bus = {
                let raw = self.next_bus.load(Ordering::Relaxed);
                let aligned = (raw + align as u64 - 1) & !(align as u64 - 1);
                self.next_bus.store(aligned + len as u64, Ordering::Relaxed);
                aligned as u32
            };
            self.allocations.lock().push(Allocation {
                ptr: ptr.as_ptr() as usize,
                layout,
                bus,
            });
            Ok(unsafe { DmaBuffer::new(ptr, bus, len) })
        }

        fn free(&self, buf: DmaBuffer) {
            let mut allocations = self.allocations.lock();
            if let Some(pos) = allocations
                .iter()
                .position(|a| a.ptr == buf.as_ptr() as usize)
            {
                let a = allocations.swap_remove(pos);
                unsafe { dealloc(a.ptr as *mut u8, a.layout) };
            }
        }
    }

    pub struct MockBoard {
        mmio: Arc<dyn Mmio>,
        dma: Arc<MockDma>,
        config: Mutex<[u16; 128]>,
        owner: Mutex<Option<&'static str>>,
        claimed: AtomicBool,
        irq: Mutex<Option<IrqHandlerFn>>,
        bar_size: usize,
    }

    impl MockBoard {
        pub fn new(mmio: Arc<dyn Mmio>, dma: Arc<MockDma>) -> Arc<Self> {
            Arc::new(MockBoard {
                mmio,
                dma,
                config: Mutex::new([0; 128]),
                owner: Mutex::new(None),
                claimed: AtomicBool::new(false),
                irq: Mutex::new(None),
                bar_size: 2048,
            })
        }

        pub fn dma_arena(&self) -> Arc<MockDma> {
            self.dma.clone()
        }

        /// Fire the installed interrupt handler, as the ISR would.
        pub fn trigger_irq(&self) -> bool {
            let irq = self.irq.lock();
            match irq.as_ref() {
                Some(handler) => {
                    handler();
                    true
                }
                None => false,
            }
        }

        pub fn owner(&self) -> Option<&'static str> {
            *self.owner.lock()
        }
    }

    impl PciBoard for MockBoard {
        fn attempt_claim(&self, owner: &'static str) -> bool {
            if self
                .claimed
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return false;
            }
            let mut slot = self.owner.lock();
            match *slot {
                Some(existing) if existing != owner => {
                    self.claimed.store(false, Ordering::Release);
                    false
                }
                _ => {
                    *slot = Some(owner);
                    true
                }
            }
        }

        fn release_claim(&self) {
            self.claimed.store(false, Ordering::Release);
        }

        fn clear_owner(&self) {
            *self.owner.lock() = None;
        }

        fn config_read16(&self, offset: u16) -> u16 {
            self.config.lock()[(offset as usize / 2) % 128]
        }

        fn config_write16(&self, offset: u16, value: u16) {
            self.config.lock()[(offset as usize / 2) % 128] = value;
        }

        fn bar_base(&self, _index: u8) -> usize {
            0
        }

        fn bar_size(&self, _index: u8) -> usize {
            self.bar_size
        }

        fn mmio(&self, _index: u8) -> Arc<dyn Mmio> {
            self.mmio.clone()
        }

        fn dma(&self) -> Arc<dyn DmaAllocator> {
            self.dma.clone()
        }

        fn dma_phys(&self, cpu: *const u8) -> u32 {
            // Fall back to an identity-ish mapping for memory the arena
            // doesn't know (caller payloads on the test heap).
            self.dma.phys_of(cpu).unwrap_or(cpu as usize as u32)
        }

        fn irq_install(&self, handler: IrqHandlerFn) -> Result<()> {
            *self.irq.lock() = Some(handler);
            Ok(())
        }

        fn irq_remove(&self) {
            *self.irq.lock() = None;
        }
    }

    pub struct MockPci {
        boards: Mutex<Vec<Arc<MockBoard>>>,
    }

    impl MockPci {
        pub fn new() -> Arc<Self> {
            Arc::new(MockPci {
                boards: Mutex::new(Vec::new()),
            })
        }

        pub fn add_board(&self, board: Arc<MockBoard>) {
            self.boards.lock().push(board);
        }
    }

    impl PciAccessor for MockPci {
        fn find_boards(&self) -> Vec<Arc<dyn PciBoard>> {
            self.boards
                .lock()
                .iter()
                .filter(|b| b.owner().is_none())
                .map(|b| b.clone() as Arc<dyn PciBoard>)
                .collect()
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        struct NullMmio;
        impl Mmio for NullMmio {
            fn read32(&self, _offset: usize) -> u32 {
                0
            }
            fn write32(&self, _offset: usize, _value: u32) {}
        }

        #[test]
        fn dma_arena_translates_both_ways() {
            let dma = MockDma::new();
            let buf = dma.alloc(64, 16).unwrap();
            assert_eq!(buf.bus_addr() % 16, 0);
            let bus = dma.phys_of(buf.as_ptr()).unwrap();
            assert_eq!(bus, buf.bus_addr());
            assert_eq!(dma.cpu_at(bus).unwrap(), buf.as_ptr());
            dma.free(buf);
        }

        #[test]
        fn board_claim_is_exclusive() {
            let board = MockBoard::new(Arc::new(NullMmio), MockDma::new());
            assert!(board.attempt_claim("helios"));
            board.release_claim();
            // Same owner may re-claim, another owner may not.
            assert!(board.attempt_claim("helios"));
            board.release_claim();
            assert!(!board.attempt_claim("other"));
        }
    }
}
