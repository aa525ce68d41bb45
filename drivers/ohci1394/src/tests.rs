//! Driver tests against the mock register file and DMA arena: bring-up,
//! local short-circuit, AT/AR state machines, split timeouts, bus-reset
//! flush and the full stack with the hardware supervisor on top.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use spin::Mutex;

use helios_core::csr;
use helios_core::error::HeliosError;
use helios_core::hardware::{BusAdapter, Hardware};
use helios_core::platform::mock::MockTime;
use helios_core::platform::{PciBoard, TimeSource};
use helios_core::types::{NodeId, RCode, Speed, TCode, LOCAL_BUS};

use crate::atcontext::AtData;
use crate::mockhw::Rig;
use crate::regs::{self, intr, node_id, SELFID_BUFFER, SELFID_COUNT};
use crate::transaction::HandlerResponse;
use crate::{OhciUnit, OhciUnitAdapter};

const REMOTE: NodeId = LOCAL_BUS | 1;

// --- self-ID stream scripting --------------------------------------------

const P_NCONN: u32 = 0x1;
const P_PARENT: u32 = 0x2;
const P_CHILD: u32 = 0x3;

fn self_id_packet(phy: u8, gap: u8, contender: bool, ports: [u32; 3]) -> u32 {
    let mut q = 0x8000_0000u32 | (phy as u32) << 24 | 1 << 22 | (gap as u32 & 0x3f) << 16;
    q |= 2 << 14; // S400 phy
    if contender {
        q |= 1 << 11;
    }
    q | ports[0] << 6 | ports[1] << 4 | ports[2] << 2
}

fn single_node_stream(gap: u8) -> Vec<u32> {
    vec![self_id_packet(0, gap, true, [P_NCONN, P_NCONN, P_NCONN])]
}

fn chain3_stream(gap: u8) -> Vec<u32> {
    vec![
        self_id_packet(0, gap, false, [P_PARENT, P_NCONN, P_NCONN]),
        self_id_packet(1, gap, false, [P_CHILD, P_PARENT, P_NCONN]),
        self_id_packet(2, gap, true, [P_CHILD, P_NCONN, P_NCONN]),
    ]
}

fn write_self_id_stream(rig: &Rig, generation: u8, packets: &[u32], corrupt: bool) {
    let bus = rig.mmio.peek(SELFID_BUFFER);
    let cpu = rig.dma.cpu_at(bus).expect("self-ID buffer mapped");
    let mut write = |index: usize, value: u32| unsafe {
        core::ptr::copy_nonoverlapping(value.to_le_bytes().as_ptr(), cpu.add(index * 4), 4);
    };
    write(0, (generation as u32) << 16);
    for (i, &packet) in packets.iter().enumerate() {
        write(1 + 2 * i, packet);
        let inverse = if corrupt && i == packets.len() - 1 {
            packet // deliberately not the bitwise inverse
        } else {
            !packet
        };
        write(2 + 2 * i, inverse);
    }
    let quadlets = (1 + 2 * packets.len()) as u32;
    rig.mmio
        .poke(SELFID_COUNT, quadlets << 2 | (generation as u32) << 16);
}

/// Run a complete bus reset: stream capture, interrupt, worker service.
fn complete_bus_reset(rig: &Rig, unit: &Arc<OhciUnit>, generation: u8, local: u8, packets: &[u32]) {
    write_self_id_stream(rig, generation, packets, false);
    rig.mmio.poke(regs::NODE_ID, node_id::ID_VALID | local as u32);
    rig.mmio.raise_event(intr::BUS_RESET | intr::SELF_ID_COMPLETE);
    assert!(rig.board.trigger_irq());
    assert!(unit.service_busreset());
}

fn bring_up() -> (Rig, Arc<MockTime>, Arc<OhciUnit>) {
    let rig = Rig::new();
    let time = MockTime::new();
    let unit = OhciUnit::open(0, rig.board.clone() as Arc<dyn PciBoard>, time.clone())
        .expect("bring-up");
    unit.enable().expect("enable");
    (rig, time, unit)
}

fn bring_up_with_bus() -> (Rig, Arc<MockTime>, Arc<OhciUnit>) {
    let (rig, time, unit) = bring_up();
    complete_bus_reset(&rig, &unit, 1, 0, &single_node_stream(63));
    (rig, time, unit)
}

/// Collects one terminal result.
fn result_cell() -> (
    Arc<Mutex<Option<(RCode, Vec<u8>)>>>,
    crate::transaction::TxCallback,
) {
    let cell: Arc<Mutex<Option<(RCode, Vec<u8>)>>> = Arc::new(Mutex::new(None));
    let cb_cell = cell.clone();
    (
        cell,
        Box::new(move |rcode, data| {
            *cb_cell.lock() = Some((rcode, data.to_vec()));
        }),
    )
}

// --- bring-up -------------------------------------------------------------

#[test]
fn init_programs_the_controller() {
    let rig = Rig::new();
    let time = MockTime::new();
    let unit =
        OhciUnit::open(0, rig.board.clone() as Arc<dyn PciBoard>, time).expect("bring-up");

    assert_eq!(rig.board.owner(), Some(crate::PCI_OWNER));
    assert_ne!(rig.mmio.peek(SELFID_BUFFER), 0);
    // Link enabled with a valid ROM image.
    let hcc = helios_core::platform::Mmio::read32(&*rig.mmio, regs::HC_CONTROL);
    assert_ne!(hcc & regs::hcc::LINK_ENABLE, 0);
    assert_ne!(hcc & regs::hcc::BIB_IMAGE_VALID, 0);
    let rom = unit.rom_quadlets();
    assert_eq!(rom[1], 0x3133_3934);
    assert_eq!(rig.mmio.peek(regs::CONFIG_ROM_HDR), rom[0]);
    // PHY advertises link-active + contender.
    assert_eq!(
        rig.mmio.phy_register(4),
        regs::phy_reg::LINK_ACTIVE | regs::phy_reg::CONTENDER
    );
    assert!(!unit.is_enabled());

    unit.enable().unwrap();
    assert!(unit.is_enabled());
    // Enable forces a short bus reset to bootstrap the topology.
    assert_eq!(rig.mmio.short_resets(), 1);
    assert_ne!(rig.mmio.int_mask() & intr::SELF_ID_COMPLETE, 0);
    assert_ne!(rig.mmio.ar_request_control() & regs::ctx::RUN, 0);
}

#[test]
fn second_stack_cannot_claim_the_board() {
    let rig = Rig::new();
    let time = MockTime::new();
    let _unit =
        OhciUnit::open(0, rig.board.clone() as Arc<dyn PciBoard>, time.clone()).expect("bring-up");
    assert!(matches!(
        OhciUnit::open(1, rig.board.clone() as Arc<dyn PciBoard>, time),
        Err(HeliosError::Busy)
    ));
}

#[test]
fn bus_reset_publishes_generation_and_node_id() {
    let (rig, _time, unit) = bring_up();
    complete_bus_reset(&rig, &unit, 7, 0, &single_node_stream(63));
    assert_eq!(unit.generation(), 7);
    assert_eq!(unit.local_node_id(), Some(LOCAL_BUS));
    let adapter = OhciUnitAdapter::new(unit.clone());
    let stream = adapter.self_id_stream().unwrap();
    assert_eq!(stream.generation, 7);
    assert_eq!(stream.packets.len(), 1);
}

// --- S2: stream validation -------------------------------------------------

#[test]
fn corrupt_self_id_stream_requests_short_reset() {
    let (rig, _time, unit) = bring_up();
    let resets_before = rig.mmio.short_resets();

    write_self_id_stream(&rig, 3, &single_node_stream(63), true);
    rig.mmio.poke(regs::NODE_ID, node_id::ID_VALID);
    rig.mmio.raise_event(intr::BUS_RESET | intr::SELF_ID_COMPLETE);
    rig.board.trigger_irq();
    unit.service_busreset();

    assert_eq!(rig.mmio.short_resets(), resets_before + 1);
    // The bad stream was never published.
    assert_eq!(unit.generation(), 0);
}

// --- S1: local ROM read ----------------------------------------------------

#[test]
fn local_quadlet_read_hits_installed_rom() {
    let (rig, _time, unit) = bring_up();

    // Stage a ROM whose quadlet at byte offset 0x14 carries the vendor-id
    // entry, then make it live with a bus reset.
    let mut rom = vec![0u32; csr::CONFIG_ROM_QUADLETS];
    rom[0] = 4 << 24 | 4 << 16;
    rom[1] = 0x3133_3934;
    rom[5] = 0x0300_a0b1;
    rom[6] = 0x0011_2233; // model entry used by the block-read check below
    unit.set_rom(Some(rom)).unwrap();
    complete_bus_reset(&rig, &unit, 1, 0, &single_node_stream(63));

    let local = unit.local_node_id().unwrap();
    let data = unit
        .do_request(
            local,
            Speed::S100,
            unit.generation(),
            TCode::ReadQuadletRequest,
            0,
            0xffff_f000_0400 + 0x14,
            Vec::new(),
            4,
        )
        .expect("local read completes");
    assert_eq!(data, 0x0300_a0b1u32.to_be_bytes().to_vec());

    // Block reads come from the same image.
    let data = unit
        .do_request(
            local,
            Speed::S100,
            unit.generation(),
            TCode::ReadBlockRequest,
            0,
            0xffff_f000_0400 + 0x14,
            Vec::new(),
            8,
        )
        .unwrap();
    assert_eq!(data.len(), 8);
    assert_eq!(&data[0..4], &0x0300_a0b1u32.to_be_bytes());
    assert_eq!(&data[4..8], &0x0011_2233u32.to_be_bytes());
}

#[test]
fn local_write_to_rom_window_is_a_type_error() {
    let (_rig, _time, unit) = bring_up_with_bus();
    let local = unit.local_node_id().unwrap();
    let err = unit
        .do_request(
            local,
            Speed::S100,
            unit.generation(),
            TCode::WriteQuadletRequest,
            0,
            0xffff_f000_0400,
            vec![0, 0, 0, 1],
            4,
        )
        .unwrap_err();
    assert_eq!(err, HeliosError::Response(RCode::TypeError));
}

// --- local CSR lock region -------------------------------------------------

#[test]
fn local_bus_manager_lock_swaps_once() {
    let (rig, _time, unit) = bring_up_with_bus();
    let local = unit.local_node_id().unwrap();
    let offset = csr::CSR_BASE + csr::CSR_BUS_MANAGER_ID;

    let mut payload = Vec::new();
    payload.extend_from_slice(&0x3fu32.to_be_bytes());
    payload.extend_from_slice(&0x01u32.to_be_bytes());
    let old = unit
        .do_request(
            local,
            Speed::S100,
            unit.generation(),
            TCode::LockRequest,
            helios_core::types::EXTCODE_COMPARE_SWAP,
            offset,
            payload.clone(),
            8,
        )
        .unwrap();
    assert_eq!(old, 0x3fu32.to_be_bytes().to_vec());
    assert_eq!(rig.mmio.csr_value(0), 1);

    // Second compare against 0x3f loses.
    let old = unit
        .do_request(
            local,
            Speed::S100,
            unit.generation(),
            TCode::LockRequest,
            helios_core::types::EXTCODE_COMPARE_SWAP,
            offset,
            payload,
            8,
        )
        .unwrap();
    assert_eq!(old, 0x01u32.to_be_bytes().to_vec());
    assert_eq!(rig.mmio.csr_value(0), 1);
}

// --- invariant 1: generation gate -------------------------------------------

#[test]
fn pending_bus_reset_gates_submission_without_touching_the_fifo() {
    let (rig, _time, unit) = bring_up_with_bus();

    rig.mmio.raise_event(intr::BUS_RESET);
    let (cell, cb) = result_cell();
    unit.send_request(
        REMOTE,
        Speed::S400,
        unit.generation(),
        TCode::ReadQuadletRequest,
        0,
        0xffff_f000_0400,
        Vec::new(),
        4,
        cb,
    )
    .unwrap();

    assert_eq!(cell.lock().take().unwrap().0, RCode::Generation);
    assert_eq!(unit.at_request.pending(), 0);
    assert_eq!(unit.tlayer.pending_count(), 0);
}

#[test]
fn stale_generation_is_rejected_before_submission() {
    let (_rig, _time, unit) = bring_up_with_bus();
    let (cell, cb) = result_cell();
    unit.send_request(
        REMOTE,
        Speed::S400,
        unit.generation().wrapping_add(1),
        TCode::ReadQuadletRequest,
        0,
        0xffff_f000_0400,
        Vec::new(),
        4,
        cb,
    )
    .unwrap();
    assert_eq!(cell.lock().take().unwrap().0, RCode::Generation);
    assert_eq!(unit.at_request.pending(), 0);
}

// --- AT ack decoding (invariant 6) ------------------------------------------

#[test]
fn at_events_map_to_result_codes() {
    let table: &[(u16, RCode)] = &[
        (0x11, RCode::Complete),      // ack_complete
        (0x14, RCode::Busy),          // ack_busy_X
        (0x15, RCode::Busy),          // ack_busy_A
        (0x16, RCode::Busy),          // ack_busy_B
        (0x1d, RCode::DataError),     // ack_data_error
        (0x1e, RCode::TypeError),     // ack_type_error
        (0x03, RCode::Missing),       // evt_missing_ack
        (0x0f, RCode::Generation),    // evt_flushed
        (0x0a, RCode::Timeout),       // evt_timeout
    ];
    for &(status, expected) in table {
        let (_rig, _time, unit) = bring_up_with_bus();
        let (cell, cb) = result_cell();
        unit.send_request(
            REMOTE,
            Speed::S400,
            unit.generation(),
            TCode::WriteBlockRequest,
            0,
            0x100,
            vec![1, 2, 3, 4],
            4,
            cb,
        )
        .unwrap();
        assert_eq!(unit.at_request.pending(), 1);
        assert!(unit.at_request.complete_nth(0, status, 0x40));
        unit.service_at_request();
        assert_eq!(cell.lock().take().unwrap().0, expected, "status {status:#x}");
        assert_eq!(unit.tlayer.pending_count(), 0);
    }
}

// --- S4: split timeout ------------------------------------------------------

#[test]
fn split_timeout_fires_and_frees_the_tlabel() {
    let (_rig, time, unit) = bring_up_with_bus();
    let (cell, cb) = result_cell();
    let handle = unit
        .send_request(
            REMOTE,
            Speed::S400,
            unit.generation(),
            TCode::ReadBlockRequest,
            0,
            0xffff_f000_0400,
            Vec::new(),
            16,
            cb,
        )
        .unwrap();

    // The remote acks pending and then never answers.
    assert!(unit.at_request.complete_nth(0, 0x12, 0x40));
    unit.service_at_request();
    assert!(cell.lock().is_none());
    assert_eq!(unit.tlayer.pending_count(), 1);

    // Default SPLIT-TIMEOUT is 100 ms.
    time.delay_ms(99);
    unit.service_split_timeout();
    assert!(cell.lock().is_none());

    time.delay_ms(2);
    unit.service_split_timeout();
    assert_eq!(cell.lock().take().unwrap().0, RCode::Timeout);
    assert_eq!(unit.tlayer.tlabel_bitmap() & 1 << handle.tlabel, 0);
    assert_eq!(unit.tlayer.pending_count(), 0);
}

// --- S5: bus-reset flush ----------------------------------------------------

#[test]
fn bus_reset_flushes_all_transactions() {
    let (rig, _time, unit) = bring_up_with_bus();

    let fired = Arc::new(AtomicUsize::new(0));
    let cancelled = Arc::new(AtomicUsize::new(0));
    for _ in 0..10 {
        let fired = fired.clone();
        let cancelled = cancelled.clone();
        unit.send_request(
            REMOTE,
            Speed::S400,
            unit.generation(),
            TCode::ReadBlockRequest,
            0,
            0xffff_f000_0400,
            Vec::new(),
            16,
            Box::new(move |rcode, _| {
                fired.fetch_add(1, Ordering::Relaxed);
                if rcode == RCode::Cancelled {
                    cancelled.fetch_add(1, Ordering::Relaxed);
                }
            }),
        )
        .unwrap();
    }
    assert_eq!(unit.at_request.pending(), 10);
    assert_eq!(unit.tlayer.pending_count(), 10);

    complete_bus_reset(&rig, &unit, 2, 0, &single_node_stream(63));

    assert_eq!(fired.load(Ordering::Relaxed), 10);
    assert_eq!(cancelled.load(Ordering::Relaxed), 10);
    assert_eq!(unit.tlayer.tlabel_bitmap(), 0);

    // AT contexts were stopped before the BUSRESET event bit was cleared.
    let log = rig.mmio.order_log();
    let last = &log[log.len() - 3..];
    assert_eq!(
        last,
        ["at-request-stop", "at-response-stop", "busreset-event-cleared"]
    );

    // The controller flushes the FIFO; every callback already ran, so the
    // late acks release the buffers without firing anything twice.
    for i in 0..10 {
        unit.at_request.complete_nth(i, 0x0f, 0);
    }
    unit.service_at_request();
    assert_eq!(unit.at_request.pending(), 0);
    assert_eq!(fired.load(Ordering::Relaxed), 10);
}

// --- invariant 8: cancel is idempotent --------------------------------------

#[test]
fn cancel_is_idempotent_and_single_shot() {
    let (_rig, _time, unit) = bring_up_with_bus();
    let fired = Arc::new(AtomicUsize::new(0));
    let fired_cb = fired.clone();
    let handle = unit
        .send_request(
            REMOTE,
            Speed::S400,
            unit.generation(),
            TCode::ReadQuadletRequest,
            0,
            0xffff_f000_0400,
            Vec::new(),
            4,
            Box::new(move |rcode, _| {
                assert_eq!(rcode, RCode::Cancelled);
                fired_cb.fetch_add(1, Ordering::Relaxed);
            }),
        )
        .unwrap();

    unit.cancel_request(handle);
    unit.cancel_request(handle);
    assert_eq!(fired.load(Ordering::Relaxed), 1);

    // A late ack for the cancelled packet is suppressed too.
    unit.at_request.complete_nth(0, 0x11, 0);
    unit.service_at_request();
    assert_eq!(fired.load(Ordering::Relaxed), 1);
}

// --- dead context recovery --------------------------------------------------

#[test]
fn dead_at_context_synthesizes_missing_ack_and_restarts() {
    let (rig, _time, unit) = bring_up_with_bus();
    let (cell_a, cb_a) = result_cell();
    let (cell_b, cb_b) = result_cell();
    unit.send_request(
        REMOTE,
        Speed::S400,
        unit.generation(),
        TCode::WriteQuadletRequest,
        0,
        0x200,
        vec![0, 0, 0, 5],
        4,
        cb_a,
    )
    .unwrap();
    unit.send_request(
        REMOTE,
        Speed::S400,
        unit.generation(),
        TCode::WriteQuadletRequest,
        0,
        0x204,
        vec![0, 0, 0, 6],
        4,
        cb_b,
    )
    .unwrap();

    // First packet acked, second fetched when the context died.
    unit.at_request.complete_nth(0, 0x11, 0);
    let second = unit.at_request.nth_bus_z(1).unwrap();
    rig.mmio.kill_context(regs::AT_REQUEST_BASE, second);

    unit.service_at_request();

    assert_eq!(cell_a.lock().take().unwrap().0, RCode::Complete);
    assert_eq!(cell_b.lock().take().unwrap().0, RCode::Missing);
    assert_eq!(unit.at_request.pending(), 0);
    // Context control was cleared and re-run.
    assert_ne!(rig.mmio.at_request_control() & regs::ctx::RUN, 0);
    assert_eq!(rig.mmio.at_request_control() & regs::ctx::DEAD, 0);
}

// --- AR reception -----------------------------------------------------------

fn inject_bus_reset_marker(unit: &Arc<OhciUnit>, generation: u8) {
    let words = [
        (TCode::WritePhy as u32) << 4,
        0,
        (generation as u32) << 16,
        (crate::descriptor::EVT_BUS_RESET as u32) << 16,
    ];
    unit.ar_request.inject_raw(&words);
    unit.service_ar_request();
}

#[test]
fn remote_read_completes_through_the_ar_response_path() {
    let (_rig, _time, unit) = bring_up_with_bus();
    inject_bus_reset_marker(&unit, 1);

    let (cell, cb) = result_cell();
    let handle = unit
        .send_request(
            REMOTE,
            Speed::S400,
            unit.generation(),
            TCode::ReadQuadletRequest,
            0,
            0xffff_f000_0414,
            Vec::new(),
            4,
            cb,
        )
        .unwrap();

    unit.at_request.complete_nth(0, 0x12, 0x30); // ack_pending
    unit.service_at_request();

    // The response arrives from the remote node.
    let words = [
        (LOCAL_BUS as u32) << 16
            | (handle.tlabel as u32) << 10
            | (TCode::ReadQuadletResponse as u32) << 4,
        (REMOTE as u32) << 16, // source, rcode complete
        0,
        0xcafe_babe,
        0x0011_0000 | 0x77, // trailer: ack_complete, timestamp
    ];
    unit.ar_response.inject_raw(&words);
    unit.service_ar_response();

    let (rcode, data) = cell.lock().take().unwrap();
    assert_eq!(rcode, RCode::Complete);
    assert_eq!(data, 0xcafe_babeu32.to_be_bytes().to_vec());
    assert_eq!(unit.tlayer.pending_count(), 0);
}

#[test]
fn response_from_wrong_source_is_dropped_as_stale() {
    let (_rig, _time, unit) = bring_up_with_bus();
    inject_bus_reset_marker(&unit, 1);

    let (cell, cb) = result_cell();
    let handle = unit
        .send_request(
            REMOTE,
            Speed::S400,
            unit.generation(),
            TCode::ReadQuadletRequest,
            0,
            0xffff_f000_0414,
            Vec::new(),
            4,
            cb,
        )
        .unwrap();
    unit.at_request.complete_nth(0, 0x12, 0);
    unit.service_at_request();

    let imposter = LOCAL_BUS | 5;
    let words = [
        (LOCAL_BUS as u32) << 16
            | (handle.tlabel as u32) << 10
            | (TCode::ReadQuadletResponse as u32) << 4,
        (imposter as u32) << 16,
        0,
        0xdead_beef,
        0x0011_0000,
    ];
    unit.ar_response.inject_raw(&words);
    unit.service_ar_response();

    // Still waiting for the real node.
    assert!(cell.lock().is_none());
    assert_eq!(unit.tlayer.pending_count(), 1);
}

#[test]
fn inbound_request_is_answered_from_the_handler_registry() {
    let (_rig, _time, unit) = bring_up_with_bus();
    inject_bus_reset_marker(&unit, 1);

    let value = Arc::new(AtomicU32::new(0x1234_5678));
    let value_cb = value.clone();
    let (_, start) = unit
        .tlayer
        .add_request_handler(
            0xf000_0000,
            0xf000_1000,
            0x100,
            Arc::new(move |packet| match packet.tcode {
                TCode::ReadQuadletRequest => HandlerResponse {
                    rcode: RCode::Complete,
                    payload: value_cb.load(Ordering::Relaxed).to_be_bytes().to_vec(),
                },
                _ => HandlerResponse::error(RCode::TypeError),
            }),
        )
        .unwrap();
    assert_eq!(start, 0xf000_0000);

    let requester = LOCAL_BUS | 5;
    let words = [
        (LOCAL_BUS as u32) << 16 | 9 << 10 | (TCode::ReadQuadletRequest as u32) << 4,
        (requester as u32) << 16, // source + offset high
        start as u32,
        0x0012_0000 | 0x20, // trailer: ack_pending
    ];
    unit.ar_request.inject_raw(&words);
    unit.service_ar_request();

    // A read-quadlet response went out on the AT response context with the
    // requester's tlabel and our value.
    assert_eq!(unit.at_response.pending(), 1);
    let headers = unit.at_response.inflight_headers();
    assert_eq!(headers[0][0] >> 10 & 0x3f, 9);
    assert_eq!(headers[0][0] >> 4 & 0xf, TCode::ReadQuadletResponse as u32);
    assert_eq!(headers[0][1] >> 16, requester as u32);
    assert_eq!(headers[0][1] >> 12 & 0xf, 0); // rcode complete
    assert_eq!(headers[0][3], 0x1234_5678);
}

#[test]
fn unknown_request_address_gets_an_address_error() {
    let (_rig, _time, unit) = bring_up_with_bus();
    inject_bus_reset_marker(&unit, 1);

    let requester = LOCAL_BUS | 3;
    let words = [
        (LOCAL_BUS as u32) << 16 | 11 << 10 | (TCode::ReadQuadletRequest as u32) << 4,
        (requester as u32) << 16,
        0x4000_0000,
        0x0012_0000,
    ];
    unit.ar_request.inject_raw(&words);
    unit.service_ar_request();

    assert_eq!(unit.at_response.pending(), 1);
    let headers = unit.at_response.inflight_headers();
    assert_eq!(
        headers[0][1] >> 12 & 0xf,
        RCode::AddressError.to_wire() as u32
    );
}

#[test]
fn broadcast_requests_are_not_answered() {
    let (_rig, _time, unit) = bring_up_with_bus();
    inject_bus_reset_marker(&unit, 1);

    let broadcast = LOCAL_BUS | 63;
    let words = [
        (broadcast as u32) << 16 | 4 << 10 | (TCode::ReadQuadletRequest as u32) << 4,
        ((LOCAL_BUS | 2) as u32) << 16,
        0x4000_0000,
        0x0012_0000,
    ];
    unit.ar_request.inject_raw(&words);
    unit.service_ar_request();
    assert_eq!(unit.at_response.pending(), 0);
}

#[test]
fn stale_ar_packets_before_the_reset_marker_are_dropped() {
    let (_rig, _time, unit) = bring_up_with_bus();
    // No marker injected: the last bus-reset generation is still 0, the
    // self-ID generation is 1.
    let words = [
        (LOCAL_BUS as u32) << 16 | 4 << 10 | (TCode::ReadQuadletRequest as u32) << 4,
        ((LOCAL_BUS | 2) as u32) << 16,
        0x4000_0000,
        0x0012_0000,
    ];
    unit.ar_request.inject_raw(&words);
    unit.service_ar_request();
    assert_eq!(unit.at_response.pending(), 0);
}

#[test]
fn split_packet_across_the_ring_wrap_is_reassembled() {
    use crate::arcontext::{AR_PAGE_COUNT, AR_PAGE_SIZE};

    let (_rig, _time, unit) = bring_up_with_bus();
    inject_bus_reset_marker(&unit, 1);

    // Fill the ring with padding until 8 bytes remain in the last page,
    // consuming it page by page as the worker would.
    let target = (AR_PAGE_COUNT - 1) * AR_PAGE_SIZE + AR_PAGE_SIZE - 8;
    unit.ar_request.pad_fill_to(target);
    for _ in 0..AR_PAGE_COUNT + 4 {
        unit.service_ar_request();
    }
    assert_eq!(unit.ar_request.fill_position(), target);

    // A read-quadlet request split across the wrap: two header words at
    // the very end of the ring, the rest at its start.
    let requester = LOCAL_BUS | 4;
    let words = [
        (LOCAL_BUS as u32) << 16 | 21 << 10 | (TCode::ReadQuadletRequest as u32) << 4,
        (requester as u32) << 16,
        0x4000_0000,
        0x0012_0000,
    ];
    unit.ar_request.inject_raw(&words);
    assert_eq!(unit.ar_request.fill_position(), 8);

    unit.service_ar_request();

    // The packet was parsed whole: an address-error response went out.
    assert_eq!(unit.at_response.pending(), 1);
    let headers = unit.at_response.inflight_headers();
    assert_eq!(headers[0][0] >> 10 & 0x3f, 21);
}

// --- request-handler registry ------------------------------------------------

#[test]
fn handler_windows_allocate_without_overlap() {
    let (_rig, _time, unit) = bring_up_with_bus();
    let noop: crate::transaction::RequestCallback =
        Arc::new(|_| HandlerResponse::error(RCode::AddressError));

    let (id_a, start_a) = unit
        .tlayer
        .add_request_handler(0x1000, 0x4000, 0x1000, noop.clone())
        .unwrap();
    let (_id_b, start_b) = unit
        .tlayer
        .add_request_handler(0x1000, 0x4000, 0x1000, noop.clone())
        .unwrap();
    let (_id_c, start_c) = unit
        .tlayer
        .add_request_handler(0x1000, 0x4000, 0x1000, noop.clone())
        .unwrap();
    assert_eq!((start_a, start_b, start_c), (0x1000, 0x2000, 0x3000));

    // Window exhausted.
    assert_eq!(
        unit.tlayer
            .add_request_handler(0x1000, 0x4000, 0x1000, noop.clone())
            .unwrap_err(),
        HeliosError::Busy
    );

    unit.tlayer.remove_request_handler(id_a);
    let (_, start_d) = unit
        .tlayer
        .add_request_handler(0x1000, 0x4000, 0x1000, noop.clone())
        .unwrap();
    assert_eq!(start_d, 0x1000);

    // Misaligned or empty windows are rejected outright.
    assert_eq!(
        unit.tlayer
            .add_request_handler(0x1001, 0x2000, 4, noop.clone())
            .unwrap_err(),
        HeliosError::BadCall
    );
    assert_eq!(
        unit.tlayer
            .add_request_handler(0x1000, 0x1000, 4, noop)
            .unwrap_err(),
        HeliosError::BadCall
    );
}

// --- invariant 7: local round trip -------------------------------------------

#[test]
fn local_read_back_returns_last_write() {
    let (_rig, _time, unit) = bring_up_with_bus();
    let store = Arc::new(AtomicU32::new(0));
    let store_cb = store.clone();
    unit.tlayer
        .add_request_handler(
            0x2_0000_0000,
            0x2_0000_1000,
            0x10,
            Arc::new(move |packet| match packet.tcode {
                TCode::WriteQuadletRequest => {
                    store_cb.store(packet.quadlet_data, Ordering::Relaxed);
                    HandlerResponse {
                        rcode: RCode::Complete,
                        payload: Vec::new(),
                    }
                }
                TCode::ReadQuadletRequest => HandlerResponse {
                    rcode: RCode::Complete,
                    payload: store_cb.load(Ordering::Relaxed).to_be_bytes().to_vec(),
                },
                _ => HandlerResponse::error(RCode::TypeError),
            }),
        )
        .unwrap();

    let local = unit.local_node_id().unwrap();
    for value in [0x1111_2222u32, 0xdead_c0de, 0] {
        unit.do_request(
            local,
            Speed::S100,
            unit.generation(),
            TCode::WriteQuadletRequest,
            0,
            0x2_0000_0000,
            value.to_be_bytes().to_vec(),
            4,
        )
        .unwrap();
        let read = unit
            .do_request(
                local,
                Speed::S100,
                unit.generation(),
                TCode::ReadQuadletRequest,
                0,
                0x2_0000_0000,
                Vec::new(),
                4,
            )
            .unwrap();
        assert_eq!(read, value.to_be_bytes().to_vec());
    }
}

// --- invariant 3: tlabel bitmap vs slots --------------------------------------

#[test]
fn tlabel_bitmap_and_slots_agree_under_stress() {
    let (_rig, _time, unit) = bring_up_with_bus();
    let mut live: Vec<crate::transaction::TransactionHandle> = Vec::new();
    // Deterministic small LCG drives allocate/complete interleaving.
    let mut rng: u32 = 0x1234_5678;
    let mut step = || {
        rng = rng.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        rng >> 16
    };

    for _ in 0..2000 {
        if step() % 3 != 0 && live.len() < 64 {
            let atd = AtData::new(Box::new(|_, _| {}));
            let handle = unit
                .tlayer
                .allocate(REMOTE, TCode::ReadQuadletRequest, atd, Box::new(|_, _| {}))
                .unwrap();
            live.push(handle);
        } else if !live.is_empty() {
            let victim = step() as usize % live.len();
            let handle = live.swap_remove(victim);
            unit.tlayer
                .handle_at_ack(handle, helios_core::types::Ack::Complete, 0);
        }
        assert_eq!(unit.tlayer.pending_count(), live.len());
        let bitmap = unit.tlayer.tlabel_bitmap();
        for handle in &live {
            assert_ne!(bitmap & 1 << handle.tlabel, 0);
        }
        assert_eq!(bitmap.count_ones() as usize, live.len());
    }

    // Exhaust the pool: the 65th allocation reports busy.
    while live.len() < 64 {
        let atd = AtData::new(Box::new(|_, _| {}));
        live.push(
            unit.tlayer
                .allocate(REMOTE, TCode::ReadQuadletRequest, atd, Box::new(|_, _| {}))
                .unwrap(),
        );
    }
    let atd = AtData::new(Box::new(|_, _| {}));
    assert_eq!(
        unit.tlayer
            .allocate(REMOTE, TCode::ReadQuadletRequest, atd, Box::new(|_, _| {}))
            .map(|h| h.tlabel)
            .unwrap_err(),
        HeliosError::Busy
    );
}

// --- async submit surface -----------------------------------------------------

fn noop_waker() -> core::task::Waker {
    use core::task::{RawWaker, RawWakerVTable, Waker};
    fn clone(_: *const ()) -> RawWaker {
        RawWaker::new(core::ptr::null(), &VTABLE)
    }
    fn noop(_: *const ()) {}
    static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, noop, noop, noop);
    unsafe { Waker::from_raw(RawWaker::new(core::ptr::null(), &VTABLE)) }
}

#[test]
fn transaction_future_resolves_on_completion() {
    use core::future::Future;
    use core::pin::Pin;
    use core::task::{Context, Poll};

    let (_rig, _time, unit) = bring_up_with_bus();
    let (handle, mut future) = unit
        .submit_async(
            REMOTE,
            Speed::S400,
            unit.generation(),
            TCode::ReadQuadletRequest,
            0,
            0xffff_f000_0414,
            Vec::new(),
            4,
        )
        .unwrap();

    let waker = noop_waker();
    let mut cx = Context::from_waker(&waker);
    assert!(matches!(
        Pin::new(&mut future).poll(&mut cx),
        Poll::Pending
    ));

    unit.cancel_request(handle);
    match Pin::new(&mut future).poll(&mut cx) {
        Poll::Ready((rcode, _)) => assert_eq!(rcode, RCode::Cancelled),
        Poll::Pending => panic!("future did not resolve"),
    }
}

// --- ISR housekeeping ---------------------------------------------------------

#[test]
fn cycle64_interrupt_counts_bus_seconds() {
    let (rig, _time, unit) = bring_up_with_bus();
    assert_eq!(unit.bus_seconds(), 0);
    rig.mmio.raise_event(intr::CYCLE_64_SECONDS);
    rig.board.trigger_irq();
    assert_eq!(unit.bus_seconds(), 1);
}

#[test]
fn spurious_interrupts_are_ignored() {
    let (_rig, _time, unit) = bring_up_with_bus();
    // No events raised.
    assert!(!unit.handle_interrupt());
}

// --- full stack: supervisor on top of the driver ------------------------------

#[test]
fn supervisor_discovers_the_local_node() {
    let (rig, _time, unit) = bring_up();
    let adapter = OhciUnitAdapter::new(unit.clone());
    let hw = Hardware::new(adapter.clone() as Arc<dyn BusAdapter>);

    complete_bus_reset(&rig, &unit, 1, 0, &single_node_stream(63));
    assert!(hw.service());

    let topo = hw.topology().expect("topology");
    assert_eq!(topo.node_count, 1);
    assert_eq!(topo.root_node_id, 0);
    assert_eq!(topo.gap_count, 63);

    // The local node's ROM was read through the short-circuit path and a
    // device was created for it.
    assert_eq!(hw.devices.live_count(), 1);
    let guid = (rig.mmio.peek(regs::GUID_HI) as u64) << 32 | rig.mmio.peek(regs::GUID_LO) as u64;
    assert!(hw.devices.lookup(guid).is_some());

    // Gap count 63 matches the table for zero hops: the bus is stable, no
    // further reset beyond the enable-time one.
    assert_eq!(rig.mmio.short_resets(), 1);
    // We won the bus-manager lock at our own IRM register.
    assert_eq!(rig.mmio.csr_value(0), 0);
}

#[test]
fn supervisor_builds_chain_topology_and_retunes_gap_count() {
    let (rig, _time, unit) = bring_up();
    let adapter = OhciUnitAdapter::new(unit.clone());
    let hw = Hardware::new(adapter.clone() as Arc<dyn BusAdapter>);

    // Three-node chain with a wrong gap count; the remote nodes never
    // answer ROM reads, so only the local device appears. max_hops at the
    // root is 2, so the table wants gap count 7.
    complete_bus_reset(&rig, &unit, 1, 0, &chain3_stream(30));
    assert!(hw.service());

    let topo = hw.topology().expect("topology");
    assert_eq!(topo.node_count, 3);
    assert_eq!(topo.root_node_id, 2);
    assert_eq!(topo.local_node_id, 0);
    assert_eq!(topo.node(2).unwrap().max_hops, 2);
    assert_eq!(hw.devices.live_count(), 1);

    // The BM could not reach the remote IRM, elected itself root and
    // pushed a PHY config + short reset.
    assert_eq!(rig.mmio.short_resets(), 2);
}
