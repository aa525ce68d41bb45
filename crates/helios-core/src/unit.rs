//! Units: the logical sub-functions of a device, one per `UNIT_DIRECTORY`
//! entry in its Configuration ROM.

use alloc::boxed::Box;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::any::Any;

use spin::Mutex;

use crate::class::ClassHandle;
use crate::csr;
use crate::device::Device;
use crate::error::Result;
use crate::event::EventListenerList;
use crate::object::{Attr, AttrValue, ObjectType, SharedObject};
use crate::rom::RomIterator;
use crate::types::Quadlet;

/// Identification quadlets: vendor, model, specifier, software version.
pub type UnitIds = [u32; 4];

struct Binding {
    class: Option<Arc<ClassHandle>>,
    user_data: Option<Box<dyn Any + Send>>,
}

pub struct Unit {
    device: Weak<Device>,
    unit_no: u32,
    /// Quadlet offset and length of the unit directory inside the device
    /// ROM that existed when this unit was created.
    rom_dir: (usize, usize),
    ids: UnitIds,
    binding: Mutex<Binding>,
}

impl Unit {
    pub(crate) fn new(
        device: &Arc<Device>,
        unit_no: u32,
        rom_dir: (usize, usize),
        ids: UnitIds,
    ) -> Arc<Unit> {
        Arc::new(Unit {
            device: Arc::downgrade(device),
            unit_no,
            rom_dir,
            ids,
            binding: Mutex::new(Binding {
                class: None,
                user_data: None,
            }),
        })
    }

    pub fn device(&self) -> Option<Arc<Device>> {
        self.device.upgrade()
    }

    pub fn unit_no(&self) -> u32 {
        self.unit_no
    }

    pub fn vendor_id(&self) -> u32 {
        self.ids[0]
    }

    pub fn model_id(&self) -> u32 {
        self.ids[1]
    }

    pub fn spec_id(&self) -> u32 {
        self.ids[2]
    }

    pub fn sw_version(&self) -> u32 {
        self.ids[3]
    }

    /// Copy of the unit directory quadlets, while the parent device (and
    /// its current ROM) are still around.
    pub fn rom_directory(&self) -> Option<Vec<Quadlet>> {
        let device = self.device()?;
        let state = device.state();
        let (start, len) = self.rom_dir;
        state.rom.get(start..start + len).map(|s| s.to_vec())
    }

    pub fn bound_class(&self) -> Option<Arc<ClassHandle>> {
        self.binding.lock().class.clone()
    }

    pub fn is_bound(&self) -> bool {
        self.binding.lock().class.is_some()
    }

    /// Class-private slot. Only the bound class touches this.
    pub fn set_user_data(&self, data: Option<Box<dyn Any + Send>>) {
        self.binding.lock().user_data = data;
    }

    pub fn take_user_data(&self) -> Option<Box<dyn Any + Send>> {
        self.binding.lock().user_data.take()
    }

    /// Record a fresh binding. Fails when another class got there first.
    pub(crate) fn bind(self: &Arc<Self>, class: &Arc<ClassHandle>) -> bool {
        let mut binding = self.binding.lock();
        if binding.class.is_some() {
            return false;
        }
        binding.class = Some(class.clone());
        drop(binding);
        class.attach_unit(self);
        true
    }

    /// Drop the class binding, telling the class first so it can stop any
    /// work it drives on this unit. Idempotent.
    pub fn unbind(self: &Arc<Self>) {
        let class = self.binding.lock().class.take();
        if let Some(class) = class {
            class.driver().release_unit_binding(self);
            class.detach_unit(self);
        }
    }
}

impl SharedObject for Unit {
    fn object_type(&self) -> ObjectType {
        ObjectType::Unit
    }

    fn listeners(&self) -> Option<&EventListenerList> {
        None
    }

    fn get_attr(&self, attr: Attr) -> Option<AttrValue> {
        match attr {
            Attr::UnitNumber => Some(AttrValue::U32(self.unit_no)),
            Attr::VendorId => Some(AttrValue::U32(self.ids[0])),
            Attr::ModelId => Some(AttrValue::U32(self.ids[1])),
            Attr::UnitSpecId => Some(AttrValue::U32(self.ids[2])),
            Attr::UnitSwVersion => Some(AttrValue::U32(self.ids[3])),
            Attr::UnitRomDirectory => self.rom_directory().map(AttrValue::Data),
            _ => None,
        }
    }

    fn set_attr(&self, _attr: Attr, _value: AttrValue) -> Result<()> {
        Err(crate::error::HeliosError::NotSupported)
    }
}

/// Fill `ids` from the immediate identification entries of a directory.
pub fn collect_ids(rom: &[Quadlet], dir_index: usize, ids: &mut UnitIds) {
    if let Some(iter) = RomIterator::new(rom, dir_index) {
        for (key, value) in iter {
            match key {
                csr::ENTRY_VENDOR_ID => ids[0] = value,
                csr::ENTRY_MODEL_ID => ids[1] = value,
                csr::ENTRY_UNIT_SPEC_ID => ids[2] = value,
                csr::ENTRY_UNIT_SW_VERSION => ids[3] = value,
                _ => {}
            }
        }
    }
}
