//! OHCI 1394 host controller driver for the Helios stack.
//!
//! One `OhciUnit` drives one controller: it owns the four asynchronous DMA
//! contexts, the self-ID capture buffer, the transaction layer and the
//! local Configuration ROM, and it implements the `BusAdapter` contract the
//! `helios-core` hardware supervisor runs on. The interrupt handler only
//! decodes events and signals workers; all real work happens in the
//! `service_*` entries the embedding kernel pumps.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arcontext;
pub mod atcontext;
pub mod busreset;
pub mod descriptor;
pub mod isoctx;
pub mod phy;
pub mod regs;
pub mod selfid;
pub mod transaction;

#[cfg(test)]
mod mockhw;
#[cfg(test)]
mod tests;

use alloc::boxed::Box;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use spin::RwLock;

use helios_core::csr;
use helios_core::error::{HeliosError, Result};
use helios_core::event::EventListenerList;
use helios_core::hardware::{BusAdapter, BusIo};
use helios_core::packet::{compute_response_timestamp, Packet};
use helios_core::platform::{
    DmaAllocator, DmaBuffer, PciAccessor, PciBoard, TimeSource, PCI_CONFIG_COMMAND,
    PCI_CONFIG_POWER_MGMT,
};
use helios_core::rom::build_default_rom;
use helios_core::topology::SelfIdStream;
use helios_core::types::{Ack, NodeId, Quadlet, RCode, Speed, TCode};
use helios_core::worker::Worker;
use helios_core::{log_debug, log_error, log_info, log_warn};

use arcontext::{ArContext, ArSink};
use atcontext::{AtContext, AtData};
use isoctx::IsoContexts;
use phy::Phy;
use regs::{hcc, intr, link, Registers};
use selfid::SelfIdBuffer;
use transaction::{HandlerResponse, TransactionHandle, TransactionLayer, TxCallback};

/// Owner string recorded on claimed PCI boards.
pub const PCI_OWNER: &str = "helios";

/// Offset added to a request's timestamp for its response: 4000 µs in
/// 125 µs bus cycles.
const RESPONSE_TS_CYCLES: u16 = 32;

const SOFT_RESET_POLL_MS: u32 = 10;
const LPS_POLL_MS: u32 = 50;
const CSR_LOCK_POLL_MS: u32 = 5;

/// The live (or staged) Configuration ROM: the canonical quadlets plus the
/// DMA copy the controller serves.
struct RomImage {
    data: Vec<Quadlet>,
    dma: DmaBuffer,
}

struct UnitState {
    enabled: bool,
    version: u32,
    vendor_id: u32,
    bus_options: u32,
    guid: u64,
    last_generation: u8,
    /// Generation carried by the most recent bus-reset packet seen in the
    /// AR stream; packets are dropped while this trails the self-ID
    /// generation.
    last_br_generation: u8,
    local_node_id: Option<NodeId>,
    rom: Option<RomImage>,
    next_rom: Option<RomImage>,
    stream: Option<SelfIdStream>,
}

pub struct OhciUnit {
    unit_no: u32,
    pub(crate) board: Arc<dyn PciBoard>,
    pub(crate) time: Arc<dyn TimeSource>,
    pub(crate) regs: Registers,
    pub(crate) phy: Phy,
    pub(crate) listeners: EventListenerList,
    pub(crate) state: RwLock<UnitState>,
    unrecoverable: AtomicBool,
    bus_seconds: AtomicU32,
    pub tlayer: TransactionLayer,
    pub(crate) at_request: AtContext,
    pub(crate) at_response: AtContext,
    pub(crate) ar_request: ArContext,
    pub(crate) ar_response: ArContext,
    pub(crate) selfid: SelfIdBuffer,
    pub iso: IsoContexts,
    pub busreset_worker: Worker,
    pub split_worker: Worker,
    pub at_request_worker: Worker,
    pub at_response_worker: Worker,
    pub ar_request_worker: Worker,
    pub ar_response_worker: Worker,
}

impl OhciUnit {
    /// Claim and bring up every OHCI board the accessor knows about.
    pub fn scan(accessor: &dyn PciAccessor, time: Arc<dyn TimeSource>) -> Vec<Arc<OhciUnit>> {
        let mut units = Vec::new();
        for board in accessor.find_boards() {
            let unit_no = units.len() as u32;
            match OhciUnit::open(unit_no, board, time.clone()) {
                Ok(unit) => units.push(unit),
                Err(e) => log_error!("ohci-{}: bring-up failed: {}", unit_no, e),
            }
        }
        units
    }

    /// Claim one board and initialize the controller on it.
    pub fn open(
        unit_no: u32,
        board: Arc<dyn PciBoard>,
        time: Arc<dyn TimeSource>,
    ) -> Result<Arc<OhciUnit>> {
        if !board.attempt_claim(PCI_OWNER) {
            return Err(HeliosError::Busy);
        }

        // Power the function up and enable memory + bus-master access.
        let pm = board.config_read16(PCI_CONFIG_POWER_MGMT);
        board.config_write16(PCI_CONFIG_POWER_MGMT, pm & !3);
        let command = board.config_read16(PCI_CONFIG_COMMAND);
        if command & 7 == 0 {
            board.config_write16(PCI_CONFIG_COMMAND, 7);
        }

        if board.bar_size(0) < regs::REGISTER_SPACE_SIZE
            || board.bar_base(0) % regs::REGISTER_SPACE_SIZE != 0
        {
            board.clear_owner();
            board.release_claim();
            return Err(HeliosError::BadCall);
        }

        let registers = Registers::new(board.mmio(0));
        let build = || -> Result<OhciUnit> {
            Ok(OhciUnit {
                unit_no,
                board: board.clone(),
                time: time.clone(),
                regs: registers.clone(),
                phy: Phy::new(registers.clone(), time.clone()),
                listeners: EventListenerList::new(),
                state: RwLock::new(UnitState {
                    enabled: false,
                    version: 0,
                    vendor_id: 0,
                    bus_options: 0,
                    guid: 0,
                    last_generation: 0,
                    last_br_generation: 0,
                    local_node_id: None,
                    rom: None,
                    next_rom: None,
                    stream: None,
                }),
                unrecoverable: AtomicBool::new(false),
                bus_seconds: AtomicU32::new(0),
                tlayer: TransactionLayer::new(time.clone()),
                at_request: AtContext::new(
                    "at-request",
                    registers.clone(),
                    regs::AT_REQUEST_BASE,
                    time.clone(),
                    board.clone(),
                )?,
                at_response: AtContext::new(
                    "at-response",
                    registers.clone(),
                    regs::AT_RESPONSE_BASE,
                    time.clone(),
                    board.clone(),
                )?,
                ar_request: ArContext::new(
                    "ar-request",
                    registers.clone(),
                    regs::AR_REQUEST_BASE,
                    time.clone(),
                    board.clone(),
                    true,
                )?,
                ar_response: ArContext::new(
                    "ar-response",
                    registers.clone(),
                    regs::AR_RESPONSE_BASE,
                    time.clone(),
                    board.clone(),
                    false,
                )?,
                selfid: SelfIdBuffer::new(board.as_ref())?,
                iso: IsoContexts::probe(registers.clone()),
                busreset_worker: Worker::new(),
                split_worker: Worker::new(),
                at_request_worker: Worker::new(),
                at_response_worker: Worker::new(),
                ar_request_worker: Worker::new(),
                ar_response_worker: Worker::new(),
            })
        };

        let unit = match build() {
            Ok(u) => Arc::new(u),
            Err(e) => {
                board.clear_owner();
                board.release_claim();
                return Err(e);
            }
        };

        if let Err(e) = unit.init() {
            board.clear_owner();
            board.release_claim();
            return Err(e);
        }
        Ok(unit)
    }

    pub fn unit_no(&self) -> u32 {
        self.unit_no
    }

    pub fn listeners(&self) -> &EventListenerList {
        &self.listeners
    }

    pub fn is_enabled(&self) -> bool {
        self.state.read().enabled
    }

    pub fn is_unrecoverable(&self) -> bool {
        self.unrecoverable.load(Ordering::Acquire)
    }

    /// OHCI protocol version the controller implements.
    pub fn ohci_version(&self) -> u32 {
        self.state.read().version
    }

    pub fn bus_seconds(&self) -> u32 {
        self.bus_seconds.load(Ordering::Relaxed)
    }

    /// Cycle-timer derived timestamp.
    pub fn timestamp(&self) -> u16 {
        self.regs.timestamp()
    }

    pub(crate) fn flag_unrecoverable(&self, reason: &str) {
        log_error!("ohci-{}: unrecoverable: {}", self.unit_no, reason);
        self.unrecoverable.store(true, Ordering::Release);
    }

    fn soft_reset(&self) -> Result<()> {
        self.regs.write(regs::HC_CONTROL_SET, hcc::SOFT_RESET);
        for _ in 0..100 {
            if self.regs.read(regs::HC_CONTROL) & hcc::SOFT_RESET == 0 {
                return Ok(());
            }
            self.time.delay_ms(SOFT_RESET_POLL_MS);
        }
        Err(HeliosError::Timeout)
    }

    /// Controller bring-up, in the order the OHCI specification wants it:
    /// reset, version gate, static data capture, self-ID buffer, link
    /// power, link control, PHY presence bits, ROM, link enable, IRQ.
    fn init(self: &Arc<Self>) -> Result<()> {
        self.soft_reset()?;

        let version = self.regs.read(regs::VERSION) & 0x00ff_00ff;
        if version != regs::OHCI_VERSION_1_0 && version != regs::OHCI_VERSION_1_1 {
            log_error!("ohci-{}: unsupported OHCI version {:08x}", self.unit_no, version);
            return Err(HeliosError::NotSupported);
        }

        let vendor_id = self.regs.read(regs::VENDOR_ID);
        let bus_options = self.regs.read(regs::BUS_OPTIONS);
        let guid = (self.regs.read(regs::GUID_HI) as u64) << 32
            | self.regs.read(regs::GUID_LO) as u64;
        log_info!(
            "ohci-{}: version {:08x}, GUID {:016x}, {} IT / {} IR contexts",
            self.unit_no,
            version,
            guid,
            self.iso.transmit_count(),
            self.iso.receive_count()
        );

        self.regs.write(regs::SELFID_BUFFER, self.selfid.bus_addr());
        self.regs.write(regs::PHYSICAL_UPPER_BOUND, 0);
        self.regs.write(regs::AT_RETRIES, regs::AT_RETRIES_VALUE);

        // Incoming and outgoing data pass the little-endian PCI bus;
        // enable the controller's byte swap only on big-endian hosts.
        if cfg!(target_endian = "big") {
            self.regs
                .write(regs::HC_CONTROL_CLEAR, hcc::NO_BYTE_SWAP_DATA);
        } else {
            self.regs.write(regs::HC_CONTROL_SET, hcc::NO_BYTE_SWAP_DATA);
        }
        self.regs
            .write(regs::HC_CONTROL_CLEAR, hcc::POSTED_WRITE_ENABLE);

        self.regs.write(regs::HC_CONTROL_SET, hcc::LPS);
        let mut lps = false;
        for _ in 0..3 {
            self.time.delay_ms(LPS_POLL_MS);
            lps = self.regs.read(regs::HC_CONTROL) & hcc::LPS != 0;
            if lps {
                break;
            }
        }
        if !lps {
            log_error!("ohci-{}: link power did not come up", self.unit_no);
            return Err(HeliosError::Unrecoverable);
        }

        self.regs.write(
            regs::LINK_CONTROL_SET,
            link::RCV_SELF_ID | link::RCV_PHY_PKT | link::CYCLE_TIMER_ENABLE | link::CYCLE_MASTER,
        );
        self.regs.write(regs::INT_EVENT_CLEAR, !0);

        // Advertise an active link and contend for IRM in our self-ID
        // packets.
        self.phy
            .update(4, 0, regs::phy_reg::LINK_ACTIVE | regs::phy_reg::CONTENDER)?;

        let rom = build_default_rom(guid, bus_options, vendor_id);
        let image = self.make_rom_image(rom)?;
        self.regs.write(regs::CONFIG_ROM_MAP, image.dma.bus_addr());
        self.regs.write(regs::CONFIG_ROM_HDR, image.data[0]);
        self.regs.write(regs::BUS_OPTIONS, image.data[2]);

        self.regs.write(regs::ASYNC_REQ_FILTER_HI_SET, 0x8000_0000);

        {
            let mut state = self.state.write();
            state.version = version;
            state.vendor_id = vendor_id;
            state.bus_options = bus_options;
            state.guid = guid;
            state.rom = Some(image);
        }

        self.regs.write(
            regs::HC_CONTROL_SET,
            hcc::LINK_ENABLE | hcc::BIB_IMAGE_VALID,
        );

        let weak: Weak<OhciUnit> = Arc::downgrade(self);
        self.board.irq_install(Box::new(move || {
            if let Some(unit) = weak.upgrade() {
                unit.handle_interrupt();
            }
        }))?;

        log_info!("ohci-{}: initialized", self.unit_no);
        Ok(())
    }

    fn make_rom_image(&self, data: Vec<Quadlet>) -> Result<RomImage> {
        let bytes = csr::CONFIG_ROM_QUADLETS * 4;
        let dma = self.board.dma().alloc(bytes, 1024)?;
        for (i, &q) in data.iter().enumerate().take(csr::CONFIG_ROM_QUADLETS) {
            dma.write_u32_le(i * 4, q);
        }
        Ok(RomImage { data, dma })
    }

    fn free_rom_image(&self, image: RomImage) {
        self.board.dma().free(image.dma);
    }

    /// Stage a new Configuration ROM (or the default image when `None`).
    /// The controller latches it on the next bus reset; call
    /// `raise_bus_reset` to make it live.
    pub fn set_rom(&self, data: Option<Vec<Quadlet>>) -> Result<()> {
        let (guid, bus_options, vendor_id) = {
            let state = self.state.read();
            (state.guid, state.bus_options, state.vendor_id)
        };
        let mut data = data.unwrap_or_else(|| build_default_rom(guid, bus_options, vendor_id));
        data.resize(csr::CONFIG_ROM_QUADLETS, 0);
        let image = self.make_rom_image(data)?;
        self.regs.write(regs::CONFIG_ROM_MAP, image.dma.bus_addr());

        let mut state = self.state.write();
        if let Some(old) = state.next_rom.take() {
            drop(state);
            self.free_rom_image(old);
            state = self.state.write();
        }
        state.next_rom = Some(image);
        Ok(())
    }

    /// Quadlets of the ROM the controller currently serves.
    pub fn rom_quadlets(&self) -> Vec<Quadlet> {
        self.state
            .read()
            .rom
            .as_ref()
            .map(|r| r.data.clone())
            .unwrap_or_default()
    }

    fn enable_interrupts(&self) {
        self.regs.write(
            regs::INT_MASK_SET,
            intr::MASTER_INT_ENABLE
                | intr::SELF_ID_COMPLETE
                | intr::SELF_ID_COMPLETE2
                | intr::REG_ACCESS_FAIL
                | intr::UNRECOVERABLE_ERROR
                | intr::CYCLE_64_SECONDS
                | intr::CYCLE_TOO_LONG
                | intr::CYCLE_INCONSISTENT
                | intr::POSTED_WRITE_ERR
                | intr::RQ_PKT
                | intr::RS_PKT
                | intr::REQ_TX_COMPLETE
                | intr::RESP_TX_COMPLETE
                | intr::ISOCH_TX
                | intr::ISOCH_RX,
        );
    }

    fn disable_interrupts(&self) {
        self.regs.write(regs::INT_MASK_CLEAR, !0);
    }

    /// Enable the unit: unmask interrupts, start reception, and force a
    /// short bus reset so the first topology is built.
    pub fn enable(&self) -> Result<()> {
        if self.state.read().enabled {
            return Ok(());
        }
        self.enable_interrupts();
        self.ar_request.start();
        self.ar_response.start();
        self.raise_bus_reset_internal(true)?;
        self.state.write().enabled = true;
        Ok(())
    }

    /// Disable: mask interrupts, stop every DMA program, flush the
    /// transaction layer.
    pub fn disable(&self) {
        if !self.state.read().enabled {
            return;
        }
        self.disable_interrupts();
        self.at_request.stop();
        self.at_response.stop();
        self.ar_request.stop();
        self.ar_response.stop();
        self.tlayer.flush_all();
        self.state.write().enabled = false;
    }

    /// Tear the unit down and release the board.
    pub fn close(&self) {
        self.disable();
        self.board.irq_remove();
        let _ = self.soft_reset();
        self.busreset_worker.kill();
        self.split_worker.kill();
        self.at_request_worker.kill();
        self.at_response_worker.kill();
        self.ar_request_worker.kill();
        self.ar_response_worker.kill();
        self.board.clear_owner();
        self.board.release_claim();
    }

    /// Full reset after an unrecoverable error.
    pub fn reset_unit(self: &Arc<Self>) -> Result<()> {
        self.disable();
        self.unrecoverable.store(false, Ordering::Release);
        self.init()?;
        self.enable()
    }

    pub(crate) fn raise_bus_reset_internal(&self, short: bool) -> Result<()> {
        if short {
            self.phy.update(5, 0, regs::phy_reg::SHORT_BUS_RESET)
        } else {
            self.phy.update(1, 0, regs::phy_reg::BUS_RESET)
        }
    }

    /// Interrupt service routine. Reads and clears the masked events
    /// (leaving BUSRESET for the bus-reset worker), updates the bus-seconds
    /// counter, and signals the per-context workers. Nothing here blocks
    /// or allocates.
    pub fn handle_interrupt(&self) -> bool {
        let events = self.regs.read(regs::INT_EVENT_CLEAR);
        if events == 0 || events == !0 {
            return false; // spurious or shared line
        }
        self.regs
            .write(regs::INT_EVENT_CLEAR, events & !intr::BUS_RESET);

        if events & intr::CYCLE_64_SECONDS != 0 {
            let timer = self.regs.read(regs::ISOCHRONOUS_CYCLE_TIMER);
            if timer & 0x8000_0000 == 0 {
                self.bus_seconds.fetch_add(1, Ordering::Relaxed);
            }
        }
        if events & intr::CYCLE_TOO_LONG != 0 {
            // The cycle master bit is cleared by the controller on this
            // error; re-arm it.
            self.regs.write(regs::LINK_CONTROL_SET, link::CYCLE_MASTER);
        }
        if events & intr::UNRECOVERABLE_ERROR != 0 {
            self.unrecoverable.store(true, Ordering::Release);
        }

        if events & intr::SELF_ID_COMPLETE != 0 {
            self.busreset_worker.signal(1);
        }
        if events & intr::REQ_TX_COMPLETE != 0 {
            self.at_request_worker.signal(1);
        }
        if events & intr::RESP_TX_COMPLETE != 0 {
            self.at_response_worker.signal(1);
        }
        if events & intr::RQ_PKT != 0 {
            self.ar_request_worker.signal(1);
        }
        if events & intr::RS_PKT != 0 {
            self.ar_response_worker.signal(1);
        }
        true
    }

    // --- worker service entries -----------------------------------------

    pub fn service_busreset(&self) -> bool {
        if !self.busreset_worker.drain_control() {
            return false;
        }
        if self.busreset_worker.take_signals() != 0 {
            self.handle_self_id_complete();
        }
        true
    }

    pub fn service_at_request(&self) -> bool {
        if !self.at_request_worker.drain_control() {
            return false;
        }
        self.at_request_worker.take_signals();
        if self.at_request.service() {
            self.unrecoverable.store(false, Ordering::Release);
        }
        true
    }

    pub fn service_at_response(&self) -> bool {
        if !self.at_response_worker.drain_control() {
            return false;
        }
        self.at_response_worker.take_signals();
        if self.at_response.service() {
            self.unrecoverable.store(false, Ordering::Release);
        }
        true
    }

    pub fn service_ar_request(self: &Arc<Self>) -> bool {
        if !self.ar_request_worker.drain_control() {
            return false;
        }
        self.ar_request_worker.take_signals();
        self.ar_request.service(&ArBridge { unit: self });
        true
    }

    pub fn service_ar_response(self: &Arc<Self>) -> bool {
        if !self.ar_response_worker.drain_control() {
            return false;
        }
        self.ar_response_worker.take_signals();
        self.ar_response.service(&ArBridge { unit: self });
        true
    }

    pub fn service_split_timeout(&self) -> bool {
        if !self.split_worker.drain_control() {
            return false;
        }
        self.split_worker.take_signals();
        self.tlayer.tick(self.time.now_ms());
        true
    }

    /// Pump every worker once; used by the synchronous helpers and tests.
    pub fn service_all(self: &Arc<Self>) {
        self.service_busreset();
        self.service_at_request();
        self.service_at_response();
        self.service_ar_request();
        self.service_ar_response();
        self.service_split_timeout();
    }

    // --- transmit paths --------------------------------------------------

    pub fn generation(&self) -> u8 {
        self.state.read().last_generation
    }

    fn generation_ok(&self, generation: u8) -> bool {
        self.state.read().last_generation == generation
    }

    pub fn local_node_id(&self) -> Option<NodeId> {
        self.state.read().local_node_id
    }

    /// Submit an asynchronous request. The callback fires exactly once
    /// with the terminal result code; for reads the payload carries the
    /// data in bus byte order.
    #[allow(clippy::too_many_arguments)]
    pub fn send_request(
        self: &Arc<Self>,
        destination: NodeId,
        speed: Speed,
        generation: u8,
        tcode: TCode,
        ext_code: u16,
        offset: u64,
        payload: Vec<u8>,
        length: u16,
        callback: TxCallback,
    ) -> Result<TransactionHandle> {
        if self.is_unrecoverable() {
            return Err(HeliosError::Unrecoverable);
        }
        if !self.state.read().enabled {
            return Err(HeliosError::Disabled);
        }

        let mut packet = Packet::new(tcode);
        packet.dest_id = destination;
        packet.speed = speed;
        packet.generation = generation;
        packet.ext_tcode = ext_code;
        packet.offset = offset;
        packet.data_length = if tcode == TCode::ReadBlockRequest {
            length
        } else {
            payload.len() as u16
        };
        if tcode == TCode::WriteQuadletRequest {
            if payload.len() < 4 {
                return Err(HeliosError::BadCall);
            }
            packet.quadlet_data = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        }

        // The ack sink learns its transaction handle right after
        // allocation.
        let handle_cell: Arc<spin::Mutex<Option<TransactionHandle>>> =
            Arc::new(spin::Mutex::new(None));
        let sink_cell = handle_cell.clone();
        let weak = Arc::downgrade(self);
        let atd = AtData::new(Box::new(move |ack, timestamp| {
            let handle = *sink_cell.lock();
            if let (Some(unit), Some(handle)) = (weak.upgrade(), handle) {
                unit.tlayer.handle_at_ack(handle, ack, timestamp);
            }
        }));

        let handle = self
            .tlayer
            .allocate(destination, tcode, atd.clone(), callback)?;
        *handle_cell.lock() = Some(handle);
        packet.tlabel = handle.tlabel;
        packet.encode_request()?;

        // Local destination: never touches the AT FIFO.
        if Some(destination) == self.local_node_id() {
            if !self.generation_ok(generation) {
                atd.complete(Ack::Generation, self.timestamp());
                return Ok(handle);
            }
            let response = self.handle_local_request(&mut packet);
            // Same reception path the AR-response worker uses.
            self.tlayer.handle_response(&response);
            return Ok(handle);
        }

        // Bus reset pending: the FIFO would flush this packet anyway.
        if self.regs.read(regs::INT_EVENT_SET) & intr::BUS_RESET != 0 {
            atd.complete(Ack::Generation, self.timestamp());
            return Ok(handle);
        }
        if !self.generation_ok(generation) {
            atd.complete(Ack::Generation, self.timestamp());
            return Ok(handle);
        }

        let at_payload = if tcode.has_payload() && !payload.is_empty() {
            Some(payload)
        } else {
            None
        };
        if let Err(e) = self
            .at_request
            .submit(&packet, at_payload, atd.clone(), handle.tlabel, 0)
        {
            atd.cancel();
            self.tlayer.cancel(handle);
            return Err(e);
        }
        Ok(handle)
    }

    pub fn cancel_request(&self, handle: TransactionHandle) {
        self.tlayer.cancel(handle);
    }

    /// Submit a request and get a future resolving with the terminal
    /// (rcode, payload) pair; for async embedders.
    #[allow(clippy::too_many_arguments)]
    pub fn submit_async(
        self: &Arc<Self>,
        destination: NodeId,
        speed: Speed,
        generation: u8,
        tcode: TCode,
        ext_code: u16,
        offset: u64,
        payload: Vec<u8>,
        length: u16,
    ) -> Result<(TransactionHandle, transaction::TransactionFuture)> {
        let completion = transaction::Completion::new();
        let cell = completion.clone();
        let handle = self.send_request(
            destination,
            speed,
            generation,
            tcode,
            ext_code,
            offset,
            payload,
            length,
            Box::new(move |rcode, data| cell.complete(rcode, data)),
        )?;
        Ok((handle, transaction::TransactionFuture::new(completion)))
    }

    /// Synchronous request helper: submits, pumps the workers and waits
    /// for the terminal callback.
    #[allow(clippy::too_many_arguments)]
    pub fn do_request(
        self: &Arc<Self>,
        destination: NodeId,
        speed: Speed,
        generation: u8,
        tcode: TCode,
        ext_code: u16,
        offset: u64,
        payload: Vec<u8>,
        length: u16,
    ) -> Result<Vec<u8>> {
        let cell: Arc<spin::Mutex<Option<(RCode, Vec<u8>)>>> = Arc::new(spin::Mutex::new(None));
        let cell_cb = cell.clone();
        let handle = self.send_request(
            destination,
            speed,
            generation,
            tcode,
            ext_code,
            offset,
            payload,
            length,
            Box::new(move |rcode, data| {
                *cell_cb.lock() = Some((rcode, data.to_vec()));
            }),
        )?;

        let budget_ms =
            csr::split_timeout_ms(self.tlayer.split_timeout_csr()) as u64 * 4 + 100;
        let mut waited = 0u64;
        let mut cancelled = false;
        loop {
            if let Some((rcode, data)) = cell.lock().take() {
                return match rcode {
                    RCode::Complete => Ok(data),
                    other => Err(HeliosError::from(other)),
                };
            }
            self.service_all();
            self.time.delay_ms(1);
            waited += 1;
            if waited > budget_ms && !cancelled {
                self.tlayer.cancel(handle);
                cancelled = true;
            }
        }
    }

    /// Transmit a PHY packet (quadlet and its inverse, S100). The optional
    /// sink observes the ack.
    pub fn send_phy_packet(&self, quadlet: Quadlet, atd: Option<Arc<AtData>>) -> Result<()> {
        let mut packet = Packet::new(TCode::WritePhy);
        packet.header[0] = (Speed::S100 as u32) << 16 | (TCode::WritePhy as u32) << 4;
        packet.header[1] = quadlet;
        packet.header[2] = !quadlet;
        packet.header_len = 12;
        let atd = atd.unwrap_or_else(|| AtData::new(Box::new(|_, _| {})));
        self.at_request.submit(&packet, None, atd, 0, 0)
    }

    /// Synchronous PHY packet transmit: waits for the ack.
    pub fn do_phy_packet(self: &Arc<Self>, quadlet: Quadlet) -> Result<()> {
        let cell: Arc<spin::Mutex<Option<Ack>>> = Arc::new(spin::Mutex::new(None));
        let cell_cb = cell.clone();
        let atd = AtData::new(Box::new(move |ack, _| {
            *cell_cb.lock() = Some(ack);
        }));
        self.send_phy_packet(quadlet, Some(atd.clone()))?;

        let mut waited = 0u32;
        loop {
            if let Some(ack) = cell.lock().take() {
                return match ack {
                    Ack::Complete | Ack::Pending => Ok(()),
                    Ack::Generation => Err(HeliosError::Generation),
                    other => Err(HeliosError::from(other.to_rcode())),
                };
            }
            self.service_all();
            self.time.delay_ms(1);
            waited += 1;
            if waited > 500 {
                atd.cancel();
                return Err(HeliosError::Timeout);
            }
        }
    }

    // --- local request handling ------------------------------------------

    /// Serve a request addressed to the local node, entirely off the bus.
    /// The response packet is shaped exactly like one received from the
    /// AR-response context.
    pub(crate) fn handle_local_request(&self, request: &mut Packet) -> Packet {
        request.ack = Some(Ack::Complete);
        request.timestamp = self.timestamp();

        let response_tcode = request.tcode.response_code();
        let mut response = Packet::new(response_tcode.unwrap_or(TCode::WriteResponse));
        response.tlabel = request.tlabel;
        response.speed = request.speed;
        response.generation = request.generation;
        // The responder is the request's destination.
        response.source_id = request.dest_id;
        response.dest_id = request.source_id;

        let rcode = if response_tcode.is_none() {
            RCode::TypeError
        } else if request.offset >= csr::CSR_BASE && request.offset < csr::CSR_END {
            let csr_offset = request.offset - csr::CSR_BASE;
            if (csr::CONFIG_ROM_OFFSET..csr::CONFIG_ROM_END).contains(&csr_offset) {
                self.local_rom_request(csr_offset, request, &mut response)
            } else {
                match csr_offset {
                    csr::CSR_BUS_MANAGER_ID
                    | csr::CSR_BANDWIDTH_AVAILABLE
                    | csr::CSR_CHANNELS_AVAILABLE_HI
                    | csr::CSR_CHANNELS_AVAILABLE_LO => {
                        self.local_csr_lock(csr_offset, request, &mut response)
                    }
                    _ => {
                        log_warn!("local request in unsupported CSR space: {:x}", csr_offset);
                        RCode::AddressError
                    }
                }
            }
        } else {
            // Outside the CSR core: consult the request-handler registry.
            match self.tlayer.dispatch_request(request) {
                Some(handler_response) => {
                    response.data_length = handler_response.payload.len() as u16;
                    if request.tcode == TCode::ReadQuadletRequest {
                        if handler_response.payload.len() >= 4 {
                            response.quadlet_data = u32::from_be_bytes([
                                handler_response.payload[0],
                                handler_response.payload[1],
                                handler_response.payload[2],
                                handler_response.payload[3],
                            ]);
                        }
                    } else {
                        response.payload = handler_response.payload;
                    }
                    handler_response.rcode
                }
                None => RCode::AddressError,
            }
        };

        response.rcode = Some(rcode);
        response.ack = Some(Ack::Complete);
        response.timestamp = compute_response_timestamp(request.timestamp, RESPONSE_TS_CYCLES);
        response
    }

    /// Reads from the local Configuration ROM window.
    fn local_rom_request(&self, csr_offset: u64, request: &Packet, response: &mut Packet) -> RCode {
        let index = ((csr_offset - csr::CONFIG_ROM_OFFSET) / 4) as usize;
        let state = self.state.read();
        let rom = match state.rom.as_ref() {
            Some(rom) => &rom.data,
            None => return RCode::AddressError,
        };
        match request.tcode {
            TCode::ReadQuadletRequest => {
                response.quadlet_data = rom.get(index).copied().unwrap_or(0);
                RCode::Complete
            }
            TCode::ReadBlockRequest => {
                let end = rom.len().min(index + (request.data_length as usize + 3) / 4);
                let mut payload = Vec::new();
                for &q in &rom[index.min(end)..end] {
                    payload.extend_from_slice(&q.to_be_bytes());
                }
                payload.truncate(request.data_length as usize);
                response.data_length = payload.len() as u16;
                response.payload = payload;
                RCode::Complete
            }
            _ => RCode::TypeError,
        }
    }

    /// Serialized lock access to the controller's bus-management CSRs
    /// through the compare-swap registers.
    fn local_csr_lock(&self, csr_offset: u64, request: &Packet, response: &mut Packet) -> RCode {
        response.ext_tcode = request.ext_tcode;

        let (compare, swap) = match request.tcode {
            TCode::LockRequest if request.ext_tcode == helios_core::types::EXTCODE_COMPARE_SWAP => {
                if request.payload.len() != 8 {
                    return RCode::DataError;
                }
                let compare = u32::from_be_bytes([
                    request.payload[0],
                    request.payload[1],
                    request.payload[2],
                    request.payload[3],
                ]);
                let swap = u32::from_be_bytes([
                    request.payload[4],
                    request.payload[5],
                    request.payload[6],
                    request.payload[7],
                ]);
                (compare, swap)
            }
            TCode::ReadQuadletRequest => (0, 0),
            _ => return RCode::TypeError,
        };

        let (compare, swap) = match csr_offset {
            csr::CSR_BUS_MANAGER_ID => (compare & 0x3f, swap & 0x3f),
            csr::CSR_BANDWIDTH_AVAILABLE => (compare & 0x1fff, swap & 0x1fff),
            _ => (compare, swap),
        };

        self.regs.write(regs::CSR_WRITE_DATA, swap);
        self.regs.write(regs::CSR_COMPARE_DATA, compare);
        self.regs.write(
            regs::CSR_CONTROL,
            ((csr_offset - csr::CSR_BUS_MANAGER_ID) / 4) as u32,
        );
        let mut budget = 100;
        while self.regs.read(regs::CSR_CONTROL) & regs::CSR_CONTROL_DONE == 0 {
            if budget == 0 {
                return RCode::DataError;
            }
            budget -= 1;
            self.time.delay_ms(CSR_LOCK_POLL_MS);
        }
        let old = self.regs.read(regs::CSR_READ_DATA);

        if request.tcode == TCode::ReadQuadletRequest {
            response.quadlet_data = old;
        } else {
            response.payload = old.to_be_bytes().to_vec();
            response.data_length = 4;
        }
        RCode::Complete
    }

    // --- inbound requests -------------------------------------------------

    /// Inbound request from the AR-request worker: consult the handler
    /// registry and answer. Broadcast and unified transactions get no
    /// response.
    fn handle_inbound_request(self: &Arc<Self>, request: Packet) {
        match request.ack {
            Some(Ack::Pending) | Some(Ack::Complete) => {}
            _ => return,
        }

        let response = self
            .tlayer
            .dispatch_request(&request)
            .unwrap_or_else(|| {
                log_warn!(
                    "no handler for request at {:012x} from {:04x}",
                    request.offset,
                    request.source_id
                );
                HandlerResponse::error(RCode::AddressError)
            });
        self.send_response(&request, response);
    }

    /// Build and queue the response packet for an inbound request, reusing
    /// its tlabel and deriving the transmit deadline from its timestamp.
    pub(crate) fn send_response(self: &Arc<Self>, request: &Packet, response: HandlerResponse) {
        if request.ack != Some(Ack::Pending) || request.dest_id & 0x3f == 0x3f {
            // Unified or broadcast transaction: the payload is dropped
            // here, which is all the "free callback" has to do.
            return;
        }

        let tcode = match request.tcode.response_code() {
            Some(t) => t,
            None => {
                log_warn!("request tcode {:?} cannot be answered", request.tcode);
                return;
            }
        };

        let mut packet = Packet::new(tcode);
        packet.tlabel = request.tlabel;
        packet.speed = request.speed;
        packet.header[0] = (request.speed as u32) << 16
            | (request.tlabel as u32) << 10
            | (helios_core::packet::RETRY_X as u32) << 8
            | (tcode as u32) << 4;
        packet.header[1] = (request.source_id as u32) << 16 | (response.rcode.to_wire() as u32) << 12;
        packet.header[2] = 0;

        let mut payload = response.payload;
        match tcode {
            TCode::WriteResponse => {
                packet.header_len = 12;
                payload.clear();
            }
            TCode::ReadQuadletResponse => {
                let mut quadlet = [0u8; 4];
                for (i, b) in payload.iter().take(4).enumerate() {
                    quadlet[i] = *b;
                }
                packet.header[3] = u32::from_be_bytes(quadlet);
                packet.header_len = 16;
                payload.clear();
            }
            TCode::ReadBlockResponse => {
                packet.header[3] = (payload.len() as u32) << 16;
                packet.header_len = 16;
            }
            TCode::LockResponse => {
                packet.header[3] = (payload.len() as u32) << 16 | request.ext_tcode as u32;
                packet.header_len = 16;
            }
            _ => return,
        }

        let timestamp = compute_response_timestamp(request.timestamp, RESPONSE_TS_CYCLES);
        let atd = AtData::new(Box::new(|ack, _| {
            if ack != Ack::Complete && ack != Ack::Pending {
                log_debug!("response transmit ack {:?}", ack);
            }
        }));
        let at_payload = (!payload.is_empty()).then_some(payload);
        if let Err(e) = self
            .at_response
            .submit(&packet, at_payload, atd, request.tlabel, timestamp)
        {
            log_warn!("response transmit failed: {}", e);
        }
    }
}

/// Routes AR traffic into the unit.
struct ArBridge<'a> {
    unit: &'a Arc<OhciUnit>,
}

impl ArSink for ArBridge<'_> {
    fn ar_request(&self, packet: Packet) {
        self.unit.handle_inbound_request(packet);
    }

    fn ar_response(&self, packet: Packet) {
        self.unit.tlayer.handle_response(&packet);
    }

    fn ar_phy_packet(&self, quadlet: u32) {
        log_debug!("PHY packet received: {:08x}", quadlet);
    }

    fn ar_bus_reset_packet(&self, generation: u8) {
        self.unit.state.write().last_br_generation = generation;
    }

    fn ar_generations(&self) -> (u8, u8) {
        let state = self.unit.state.read();
        (state.last_br_generation, state.last_generation)
    }
}

// --- supervisor contract --------------------------------------------------

impl BusIo for OhciUnitAdapter {
    fn read_quadlet(
        &self,
        node: NodeId,
        generation: u8,
        speed: Speed,
        offset: u64,
    ) -> Result<Quadlet> {
        let data = self.unit.do_request(
            node,
            speed,
            generation,
            TCode::ReadQuadletRequest,
            0,
            offset,
            Vec::new(),
            4,
        )?;
        if data.len() < 4 {
            return Err(HeliosError::Response(RCode::DataError));
        }
        Ok(u32::from_be_bytes([data[0], data[1], data[2], data[3]]))
    }

    fn write_quadlet(
        &self,
        node: NodeId,
        generation: u8,
        speed: Speed,
        offset: u64,
        data: Quadlet,
    ) -> Result<()> {
        self.unit
            .do_request(
                node,
                speed,
                generation,
                TCode::WriteQuadletRequest,
                0,
                offset,
                data.to_be_bytes().to_vec(),
                4,
            )
            .map(|_| ())
    }

    fn lock_compare_swap(
        &self,
        node: NodeId,
        generation: u8,
        offset: u64,
        compare: Quadlet,
        swap: Quadlet,
    ) -> Result<Quadlet> {
        let mut payload = Vec::with_capacity(8);
        payload.extend_from_slice(&compare.to_be_bytes());
        payload.extend_from_slice(&swap.to_be_bytes());
        let data = self.unit.do_request(
            node,
            Speed::S100,
            generation,
            TCode::LockRequest,
            helios_core::types::EXTCODE_COMPARE_SWAP,
            offset,
            payload,
            8,
        )?;
        if data.len() < 4 {
            return Err(HeliosError::Response(RCode::DataError));
        }
        Ok(u32::from_be_bytes([data[0], data[1], data[2], data[3]]))
    }

    fn send_phy_packet(&self, quadlet: Quadlet) -> Result<()> {
        self.unit.do_phy_packet(quadlet)
    }

    fn raise_bus_reset(&self, short: bool) -> Result<()> {
        self.unit.raise_bus_reset_internal(short)
    }

    fn delay_ms(&self, ms: u32) {
        self.unit.time.delay_ms(ms);
    }
}

/// `BusAdapter` wrapper handing an `OhciUnit` to the hardware supervisor.
pub struct OhciUnitAdapter {
    unit: Arc<OhciUnit>,
}

impl OhciUnitAdapter {
    pub fn new(unit: Arc<OhciUnit>) -> Arc<OhciUnitAdapter> {
        Arc::new(OhciUnitAdapter { unit })
    }

    pub fn unit(&self) -> &Arc<OhciUnit> {
        &self.unit
    }
}

impl BusAdapter for OhciUnitAdapter {
    fn io(&self) -> &dyn BusIo {
        self
    }

    fn listeners(&self) -> &EventListenerList {
        &self.unit.listeners
    }

    fn self_id_stream(&self) -> Option<SelfIdStream> {
        self.unit.state.read().stream.clone()
    }

    fn generation(&self) -> u8 {
        self.unit.generation()
    }

    fn local_node_id(&self) -> Option<NodeId> {
        self.unit.local_node_id()
    }

    fn guid(&self) -> u64 {
        self.unit.state.read().guid
    }
}
