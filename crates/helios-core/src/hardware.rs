//! The hardware supervisor.
//!
//! One `Hardware` sits on top of each controller driver. It listens for the
//! driver's `HW_SELFID` events and, per event: rebuilds the topology,
//! reconciles the device registry against it, scans node ROMs, regenerates
//! units, and runs the bus-manager policy (root election and gap-count
//! optimisation through the IRM's `BUS_MANAGER_ID` register).

use alloc::format;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crossbeam_queue::SegQueue;
use spin::RwLock;

use crate::base::helios_base;
use crate::csr;
use crate::device::{DeviceOrigin, DeviceRegistry};
use crate::error::{HeliosError, Result};
use crate::event::{self, EventListenerList, EventMsg, ListenerMode};
use crate::packet::phy_config_quadlet;
use crate::report::ReportSeverity;
use crate::rom;
use crate::topology::{compare_topologies, NodeChange, SelfIdStream, Topology};
use crate::types::{NodeId, Quadlet, Speed, LOCAL_BUS};
use crate::worker::Worker;

/// Synchronous bus I/O offered by a controller driver. All calls carry the
/// generation they were planned against and fail with
/// `HeliosError::Generation` when the bus has moved on.
pub trait BusIo: Send + Sync {
    fn read_quadlet(&self, node: NodeId, generation: u8, speed: Speed, offset: u64)
        -> Result<Quadlet>;

    fn write_quadlet(
        &self,
        node: NodeId,
        generation: u8,
        speed: Speed,
        offset: u64,
        data: Quadlet,
    ) -> Result<()>;

    /// Compare-and-swap lock at a CSR address. Returns the old value.
    fn lock_compare_swap(
        &self,
        node: NodeId,
        generation: u8,
        offset: u64,
        compare: Quadlet,
        swap: Quadlet,
    ) -> Result<Quadlet>;

    /// Transmit a PHY configuration packet (quadlet + inverse, S100).
    fn send_phy_packet(&self, quadlet: Quadlet) -> Result<()>;

    fn raise_bus_reset(&self, short: bool) -> Result<()>;

    fn delay_ms(&self, ms: u32);
}

/// The full contract between a controller driver and the supervisor.
pub trait BusAdapter: Send + Sync {
    fn io(&self) -> &dyn BusIo;

    /// The driver's event list (`HW_BUSRESET`, `HW_SELFID`, `HW_TOPOLOGY`).
    fn listeners(&self) -> &EventListenerList;

    /// Snapshot of the last validated self-ID stream.
    fn self_id_stream(&self) -> Option<SelfIdStream>;

    fn generation(&self) -> u8;

    fn local_node_id(&self) -> Option<NodeId>;

    fn guid(&self) -> u64;
}

/// Hop-count indexed gap counts (IEEE 1394a table E-1).
const GAP_COUNT_TABLE: [u8; 16] = [63, 5, 7, 8, 10, 13, 16, 18, 21, 24, 26, 29, 32, 35, 37, 40];

/// PHY-config rounds allowed per topology before the BM accepts what it
/// sees.
const BM_CONFIG_BUDGET: u8 = 5;
const BM_GENERATION_RETRIES: u8 = 5;

/// The 1394 spec demands a settle delay between bus reset and ROM scans.
const SCAN_SETTLE_MS: u32 = 1000;

struct HwState {
    topology: Option<Topology>,
    bm_retry: u8,
}

pub struct Hardware {
    adapter: Arc<dyn BusAdapter>,
    pub devices: DeviceRegistry,
    pub worker: Worker,
    state: RwLock<HwState>,
    inbox: Arc<SegQueue<EventMsg>>,
}

impl Hardware {
    pub fn new(adapter: Arc<dyn BusAdapter>) -> Arc<Hardware> {
        let inbox = Arc::new(SegQueue::new());
        adapter
            .listeners()
            .add(event::HW_SELFID, ListenerMode::Queued, inbox.clone());
        Arc::new(Hardware {
            adapter,
            devices: DeviceRegistry::new(),
            worker: Worker::new(),
            state: RwLock::new(HwState {
                topology: None,
                bm_retry: 0,
            }),
            inbox,
        })
    }

    pub fn adapter(&self) -> &Arc<dyn BusAdapter> {
        &self.adapter
    }

    pub fn topology(&self) -> Option<Topology> {
        self.state.read().topology.clone()
    }

    pub fn bus_reset(&self, short: bool) -> Result<()> {
        self.adapter.io().raise_bus_reset(short)
    }

    /// Service entry, pumped by the embedding kernel whenever the worker is
    /// signalled. Returns false once the worker was killed.
    pub fn service(&self) -> bool {
        if !self.worker.drain_control() {
            return false;
        }
        self.worker.take_signals();
        while let Some(msg) = self.inbox.pop() {
            if msg.event == event::HW_SELFID {
                self.on_self_id(msg.result as u8);
            }
        }
        true
    }

    /// Teardown: every device is disconnected and the dead list reclaimed.
    pub fn shutdown(&self) {
        self.worker.kill();
        self.devices.clear();
        self.state.write().topology = None;
    }

    fn on_self_id(&self, generation: u8) {
        let stream = match self.adapter.self_id_stream() {
            Some(s) => s,
            None => return,
        };
        if stream.generation != generation {
            // Superseded by a newer reset; its own event follows.
            return;
        }

        let mut topo = match Topology::build(&stream) {
            Ok(t) => t,
            Err(_) => {
                log_error!("topology build failed, requesting short bus reset");
                let _ = self.adapter.io().raise_bus_reset(true);
                return;
            }
        };

        // Diff against the previous tree: updated nodes keep their device
        // links, vanished subtrees park their devices on the dead list.
        let previous = self.state.read().topology.clone();
        if let Some(prev) = previous {
            for change in compare_topologies(&mut topo, &prev) {
                match change {
                    NodeChange::Removed {
                        device_guid: Some(guid),
                        ..
                    } => {
                        self.devices.disconnect(guid);
                    }
                    NodeChange::Updated {
                        phy_id,
                        device_guid: Some(guid),
                    } => {
                        if let Some(dev) = self.devices.lookup(guid) {
                            let node = &topo.nodes[phy_id as usize];
                            dev.connect(
                                LOCAL_BUS | phy_id as NodeId,
                                phy_id,
                                topo.generation,
                                node.max_speed,
                            );
                            dev.listeners.send(event::DEVICE_UPDATED, topo.generation as u32);
                        }
                    }
                    _ => {}
                }
            }
        }

        log_info!(
            "topology gen={} nodes={} root={} irm={} gap={}",
            topo.generation,
            topo.node_count,
            topo.root_node_id,
            topo.irm_node_id,
            topo.gap_count
        );

        {
            let mut state = self.state.write();
            state.topology = Some(topo);
            state.bm_retry = 0;
        }
        self.adapter
            .listeners()
            .send(event::HW_TOPOLOGY, generation as u32);

        // Nodes get a grace period after the reset before their ROMs are
        // read.
        self.adapter.io().delay_ms(SCAN_SETTLE_MS);
        if self.scan_nodes(generation).is_err() {
            // Bus moved on mid-scan; the next self-ID event redoes it all.
            return;
        }

        self.process_bm(generation);
    }

    /// Read every linked node's ROM and reconcile the device registry.
    fn scan_nodes(&self, generation: u8) -> Result<()> {
        let phys: Vec<u8> = {
            let state = self.state.read();
            let topo = match &state.topology {
                Some(t) => t,
                None => return Ok(()),
            };
            topo.nodes
                .iter()
                .filter(|n| n.link_on)
                .map(|n| n.phy_id)
                .collect()
        };

        for phy in phys {
            if self.adapter.generation() != generation {
                return Err(HeliosError::Generation);
            }
            self.scan_node(phy, generation)?;
        }
        Ok(())
    }

    fn scan_node(&self, phy: u8, generation: u8) -> Result<()> {
        let (node_id, max_speed, old_guid) = {
            let state = self.state.read();
            let node = match state.topology.as_ref().and_then(|t| t.node(phy)) {
                Some(n) => n.clone(),
                None => return Ok(()),
            };
            (
                LOCAL_BUS | phy as NodeId,
                node.max_speed,
                node.device_guid,
            )
        };

        let mut storage = [0u32; csr::CONFIG_ROM_QUADLETS];
        let read = rom::read_remote_rom(
            self.adapter.io(),
            node_id,
            generation,
            max_speed,
            &mut storage,
        );

        let (rom_len, guid) = match read {
            Ok(len) if len >= 5 => {
                let guid = ((storage[3] as u64) << 32) | storage[4] as u64;
                (len, guid)
            }
            Ok(_) => (0, 0),
            Err(HeliosError::Generation) => return Err(HeliosError::Generation),
            Err(_) => (0, 0),
        };

        if guid == 0 {
            // Unreadable or GUID-less node: whatever device was here is
            // gone.
            if let Some(old) = old_guid {
                if let Some(dev) = self.devices.lookup(old) {
                    dev.listeners.send(event::DEVICE_DEAD, phy as u32);
                }
                self.devices.disconnect(old);
                self.set_node_device(phy, None);
            }
            return Ok(());
        }

        if let Some(old) = old_guid {
            if old != guid {
                log_warn!("node {} changed GUID {:016x} -> {:016x}", phy, old, guid);
                self.devices.disconnect(old);
            }
        }

        let (dev, origin) =
            self.devices
                .connect(guid, node_id, phy, generation, max_speed);
        self.set_node_device(phy, Some(guid));

        if origin == DeviceOrigin::Promoted {
            dev.listeners.send(event::DEVICE_UPDATED, generation as u32);
        }

        let changed = dev.update_rom(&storage[..rom_len]);
        if changed {
            self.report_device_name(&dev.state().rom);
            let units = dev.rebuild_units();
            for unit in &units {
                dev.listeners
                    .send(event::DEVICE_NEW_UNIT, unit.unit_no());
            }
        }
        dev.bind_units(&helios_base().classes);
        dev.listeners.send(event::DEVICE_SCANNED, generation as u32);
        Ok(())
    }

    fn set_node_device(&self, phy: u8, guid: Option<u64>) {
        let mut state = self.state.write();
        if let Some(topo) = state.topology.as_mut() {
            if let Some(node) = topo.nodes.get_mut(phy as usize) {
                node.device_guid = guid;
            }
        }
    }

    fn report_device_name(&self, rom_data: &[Quadlet]) {
        if rom_data.len() <= csr::ROM_ROOT_DIR_INDEX {
            return;
        }
        let iter = match rom::RomIterator::new(rom_data, csr::ROM_ROOT_DIR_INDEX) {
            Some(i) => i,
            None => return,
        };
        let mut pos = iter.position();
        for (key, value) in iter {
            if key == csr::ENTRY_TEXTUAL_LEAF {
                let leaf = rom::resolve_offset(pos, value);
                let mut text = [0u8; 60];
                if let Ok(n) = rom::read_textual_descriptor(rom_data, leaf, &mut text) {
                    if let Ok(name) = core::str::from_utf8(&text[..n]) {
                        helios_base().report(
                            ReportSeverity::Info,
                            "Device",
                            format!("ROM says '{}'", name),
                        );
                    }
                }
                return;
            }
            pos += 1;
        }
    }

    /// Bus-manager policy for the current topology. Returns true when the
    /// bus is stable (no new reset was requested).
    fn process_bm(&self, generation: u8) -> bool {
        let io = self.adapter.io();
        let mut generation_retries = BM_GENERATION_RETRIES;

        loop {
            let topo = match self.topology() {
                Some(t) if t.generation == generation => t,
                _ => return false,
            };
            let local = topo.local_node_id;

            // An IRM that advertises itself but has no active link cannot
            // serve; claim the root for ourselves.
            let irm_valid = topo.irm_node_id >= 0
                && topo
                    .node(topo.irm_node_id as u8)
                    .map_or(false, |n| n.link_on);

            let new_root;
            if !irm_valid {
                log_info!("no usable IRM, electing local node as root");
                new_root = local;
            } else {
                let irm = topo.irm_node_id as u8;
                match io.lock_compare_swap(
                    LOCAL_BUS | irm as NodeId,
                    generation,
                    csr::CSR_BASE + csr::CSR_BUS_MANAGER_ID,
                    csr::NO_BUS_MANAGER,
                    local as u32,
                ) {
                    Ok(old) if old == csr::NO_BUS_MANAGER => {
                        // We are the bus manager: pick the root and tune
                        // the gap count below.
                        let root_linked = topo
                            .node(topo.root_node_id)
                            .map_or(false, |n| n.link_on);
                        new_root = if root_linked { topo.root_node_id } else { local };
                    }
                    Ok(_other) => {
                        // Someone else won; we act as plain IRM at most.
                        // Broadcast-channel ownership is not taken here.
                        return true;
                    }
                    Err(HeliosError::Generation) => {
                        if generation_retries == 0 {
                            return false;
                        }
                        generation_retries -= 1;
                        io.delay_ms(125);
                        continue;
                    }
                    Err(_) => {
                        new_root = local;
                    }
                }
            }

            let max_hops = topo
                .node(topo.root_node_id)
                .map(|n| n.max_hops as usize)
                .unwrap_or(0);
            let gap_count = GAP_COUNT_TABLE[if max_hops < GAP_COUNT_TABLE.len() {
                max_hops
            } else {
                0
            }];

            let retry = {
                let mut state = self.state.write();
                let r = state.bm_retry;
                state.bm_retry = r.saturating_add(1);
                r
            };

            if retry < BM_CONFIG_BUDGET
                && (gap_count != topo.gap_count || new_root != topo.root_node_id)
            {
                helios_base().report(
                    ReportSeverity::Info,
                    "BusManager",
                    format!("PHY config: root={} gap={}", new_root, gap_count),
                );
                let _ = io.send_phy_packet(phy_config_quadlet(Some(new_root), Some(gap_count)));
                let _ = io.raise_bus_reset(true);
                return false;
            }
            self.state.write().bm_retry = 0;
            return true;
        }
    }
}

impl crate::object::SharedObject for Hardware {
    fn object_type(&self) -> crate::object::ObjectType {
        crate::object::ObjectType::Hardware
    }

    fn listeners(&self) -> Option<&EventListenerList> {
        Some(self.adapter.listeners())
    }

    fn get_attr(&self, attr: crate::object::Attr) -> Option<crate::object::AttrValue> {
        use crate::object::{Attr, AttrValue};
        match attr {
            Attr::NodeId => self.adapter.local_node_id().map(AttrValue::NodeId),
            Attr::Generation => Some(AttrValue::U32(self.adapter.generation() as u32)),
            Attr::Guid => Some(AttrValue::U64(self.adapter.guid())),
            Attr::GuidHi => Some(AttrValue::U32((self.adapter.guid() >> 32) as u32)),
            Attr::GuidLo => Some(AttrValue::U32(self.adapter.guid() as u32)),
            _ => None,
        }
    }
}

/// Helpers mirroring the attribute surface of the original library.
impl Hardware {
    pub fn local_node_id(&self) -> Option<NodeId> {
        self.adapter.local_node_id()
    }

    pub fn generation(&self) -> u8 {
        self.adapter.generation()
    }

    pub fn guid(&self) -> u64 {
        self.adapter.guid()
    }

    pub fn describe(&self) -> String {
        format!(
            "guid={:016x} gen={} devices={} dead={}",
            self.guid(),
            self.generation(),
            self.devices.live_count(),
            self.devices.dead_count()
        )
    }
}
