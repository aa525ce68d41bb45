//! Devices: the persistent per-GUID records behind topology nodes.
//!
//! A device survives bus resets. While its node is present it sits on the
//! live list; when the node disappears it moves to the dead list, keeping
//! its GUID, ROM and listeners so a later reconnect (matched by GUID)
//! preserves application bindings. Dead records are reclaimed on hardware
//! teardown or an explicit flush.

use alloc::sync::Arc;
use alloc::vec::Vec;

use hashbrown::HashMap;
use spin::RwLock;

use crate::class::ClassRegistry;
use crate::csr;
use crate::error::Result;
use crate::event::{self, EventListenerList};
use crate::object::{Attr, AttrValue, ObjectType, SharedObject};
use crate::rom::RomIterator;
use crate::types::{NodeId, Quadlet, Speed};
use crate::unit::{self, Unit, UnitIds};

pub struct DeviceState {
    pub node_id: Option<NodeId>,
    pub phy_id: Option<u8>,
    /// Topology generation the device was last seen in; 0 while detached.
    pub generation: u8,
    pub max_speed: Speed,
    pub rom: Vec<Quadlet>,
    pub units: Vec<Arc<Unit>>,
    /// Set when the ROM changed and the unit list needs a rebuild.
    pub unit_scan: bool,
    pub ids: UnitIds,
}

pub struct Device {
    guid: u64,
    pub listeners: EventListenerList,
    state: RwLock<DeviceState>,
}

impl Device {
    pub fn new(guid: u64) -> Arc<Device> {
        Arc::new(Device {
            guid,
            listeners: EventListenerList::new(),
            state: RwLock::new(DeviceState {
                node_id: None,
                phy_id: None,
                generation: 0,
                max_speed: Speed::S100,
                rom: Vec::new(),
                units: Vec::new(),
                unit_scan: false,
                ids: [0; 4],
            }),
        })
    }

    pub fn guid(&self) -> u64 {
        self.guid
    }

    pub fn state(&self) -> spin::RwLockReadGuard<'_, DeviceState> {
        self.state.read()
    }

    pub fn generation(&self) -> u8 {
        self.state.read().generation
    }

    pub fn node_id(&self) -> Option<NodeId> {
        self.state.read().node_id
    }

    pub fn is_detached(&self) -> bool {
        self.guid == 0 || self.state.read().generation == 0
    }

    pub fn units(&self) -> Vec<Arc<Unit>> {
        self.state.read().units.clone()
    }

    /// (Re-)link the device to a node on the current topology.
    pub(crate) fn connect(&self, node_id: NodeId, phy_id: u8, generation: u8, max_speed: Speed) {
        let mut state = self.state.write();
        state.node_id = Some(node_id);
        state.phy_id = Some(phy_id);
        state.generation = generation;
        state.max_speed = max_speed;
    }

    /// Unlink from the topology: release all unit bindings and mark the
    /// record detached. The ROM and the listener list stay.
    pub(crate) fn disconnect(&self) {
        let units = {
            let mut state = self.state.write();
            state.node_id = None;
            state.phy_id = None;
            state.generation = 0;
            // Units die with the connection; a reconnect rebuilds them from
            // the (possibly unchanged) ROM.
            state.unit_scan = true;
            core::mem::take(&mut state.units)
        };
        for u in &units {
            u.unbind();
        }
    }

    /// Swap in a freshly read ROM. Returns true when the unit list needs a
    /// rebuild: either the checked prefix differs from the cached one, or a
    /// reconnect already flagged the scan.
    pub(crate) fn update_rom(&self, rom: &[Quadlet]) -> bool {
        let mut state = self.state.write();
        let checked = rom.len().min(state.rom.len()).min(5);
        let changed =
            state.rom.is_empty() || rom[..checked] != state.rom[..checked] || state.rom.len() != rom.len();
        if changed {
            state.rom = rom.to_vec();
        }
        state.unit_scan |= changed;
        state.unit_scan
    }

    /// Tear down the old unit list and create one unit per unit directory
    /// in the current ROM, inheriting the identification quadlets of the
    /// root directory. Returns the new units; the caller fires events and
    /// runs class binding outside the device lock.
    pub(crate) fn rebuild_units(self: &Arc<Self>) -> Vec<Arc<Unit>> {
        let old_units;
        let mut created = Vec::new();
        {
            let mut state = self.state.write();
            if !state.unit_scan {
                return Vec::new();
            }
            state.unit_scan = false;
            old_units = core::mem::take(&mut state.units);

            if state.rom.len() > csr::ROM_ROOT_DIR_INDEX
                && crate::crc::check_block(&state.rom[csr::ROM_ROOT_DIR_INDEX..])
            {
                let mut root_ids: UnitIds = [0; 4];
                unit::collect_ids(&state.rom, csr::ROM_ROOT_DIR_INDEX, &mut root_ids);
                state.ids = root_ids;

                let mut unit_no = 0;
                if let Some(iter) = RomIterator::new(&state.rom, csr::ROM_ROOT_DIR_INDEX) {
                    let mut pos = iter.position();
                    for (key, value) in iter {
                        if key == csr::ENTRY_UNIT_DIRECTORY {
                            let dir = crate::rom::resolve_offset(pos, value);
                            if let Some(len) = RomIterator::directory_quadlets(&state.rom, dir) {
                                if dir + len <= state.rom.len()
                                    && crate::crc::check_block(&state.rom[dir..])
                                {
                                    let mut ids = root_ids;
                                    unit::collect_ids(&state.rom, dir, &mut ids);
                                    created.push(Unit::new(self, unit_no, (dir, len), ids));
                                    unit_no += 1;
                                }
                            }
                        }
                        pos += 1;
                    }
                }
            }
            state.units = created.clone();
        }

        for u in &old_units {
            u.unbind();
        }
        created
    }

    /// Run class binding for every unbound unit.
    pub fn bind_units(&self, classes: &ClassRegistry) {
        for unit in self.units() {
            classes.attempt_binding(&unit);
        }
    }
}

impl SharedObject for Device {
    fn object_type(&self) -> ObjectType {
        ObjectType::Device
    }

    fn listeners(&self) -> Option<&EventListenerList> {
        Some(&self.listeners)
    }

    fn get_attr(&self, attr: Attr) -> Option<AttrValue> {
        let state = self.state.read();
        match attr {
            Attr::Guid => Some(AttrValue::U64(self.guid)),
            Attr::GuidHi => Some(AttrValue::U32((self.guid >> 32) as u32)),
            Attr::GuidLo => Some(AttrValue::U32(self.guid as u32)),
            Attr::NodeId => state.node_id.map(AttrValue::NodeId),
            Attr::Generation => Some(AttrValue::U32(state.generation as u32)),
            Attr::RomLength => Some(AttrValue::U32(state.rom.len() as u32)),
            Attr::Rom => Some(AttrValue::Data(state.rom.clone())),
            Attr::VendorId => Some(AttrValue::U32(state.ids[0])),
            Attr::ModelId => Some(AttrValue::U32(state.ids[1])),
            _ => None,
        }
    }

    fn set_attr(&self, _attr: Attr, _value: AttrValue) -> Result<()> {
        Err(crate::error::HeliosError::NotSupported)
    }
}

/// What `DeviceRegistry::connect` had to do to produce the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceOrigin {
    /// Already live with the same GUID.
    Existing,
    /// Came back from the dead list.
    Promoted,
    Created,
}

/// Per-hardware device bookkeeping: a live map and a dead map, both keyed
/// by GUID.
pub struct DeviceRegistry {
    live: RwLock<HashMap<u64, Arc<Device>>>,
    dead: RwLock<HashMap<u64, Arc<Device>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        DeviceRegistry {
            live: RwLock::new(HashMap::new()),
            dead: RwLock::new(HashMap::new()),
        }
    }

    pub fn lookup(&self, guid: u64) -> Option<Arc<Device>> {
        self.live.read().get(&guid).cloned()
    }

    pub fn lookup_dead(&self, guid: u64) -> Option<Arc<Device>> {
        self.dead.read().get(&guid).cloned()
    }

    pub fn live_devices(&self) -> Vec<Arc<Device>> {
        self.live.read().values().cloned().collect()
    }

    pub fn live_count(&self) -> usize {
        self.live.read().len()
    }

    pub fn dead_count(&self) -> usize {
        self.dead.read().len()
    }

    /// Match a scanned node to a device record: live hit, promotion from
    /// the dead list, or a fresh record.
    pub fn connect(
        &self,
        guid: u64,
        node_id: NodeId,
        phy_id: u8,
        generation: u8,
        max_speed: Speed,
    ) -> (Arc<Device>, DeviceOrigin) {
        if let Some(dev) = self.lookup(guid) {
            dev.connect(node_id, phy_id, generation, max_speed);
            return (dev, DeviceOrigin::Existing);
        }
        if let Some(dev) = self.dead.write().remove(&guid) {
            dev.connect(node_id, phy_id, generation, max_speed);
            self.live.write().insert(guid, dev.clone());
            return (dev, DeviceOrigin::Promoted);
        }
        let dev = Device::new(guid);
        dev.connect(node_id, phy_id, generation, max_speed);
        self.live.write().insert(guid, dev.clone());
        (dev, DeviceOrigin::Created)
    }

    /// Node went away: keep the record on the dead list.
    pub fn disconnect(&self, guid: u64) -> Option<Arc<Device>> {
        let dev = self.live.write().remove(&guid)?;
        dev.disconnect();
        dev.listeners.send(event::DEVICE_REMOVED, 0);
        self.dead.write().insert(guid, dev.clone());
        Some(dev)
    }

    /// Drop every dead record.
    pub fn flush_dead(&self) {
        self.dead.write().clear();
    }

    /// Teardown: disconnect everything, then reclaim the dead list.
    pub fn clear(&self) {
        let guids: Vec<u64> = self.live.read().keys().copied().collect();
        for guid in guids {
            self.disconnect(guid);
        }
        self.flush_dead();
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
