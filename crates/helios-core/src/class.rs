//! Class plug-ins: external drivers that claim units by inspecting their
//! identification quadlets and ROM directories.

use alloc::boxed::Box;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use spin::{Mutex, RwLock};

use crate::error::{HeliosError, Result};
use crate::event::{self, EventListenerList};
use crate::object::{Attr, AttrValue, ObjectType, SharedObject};
use crate::unit::Unit;

/// The methods every class driver provides. `attempt_unit_binding` is
/// consulted for each new unit in registry priority order; the first driver
/// that returns true owns the unit until `release_unit_binding`. A driver
/// must stop all work it spawned on a unit before returning from the
/// release call, and must not call back into the registry from
/// `initialize`/`terminate`.
pub trait ClassDriver: Send + Sync {
    fn name(&self) -> &'static str;

    fn version(&self) -> u32 {
        0
    }

    /// Higher priority classes are consulted first.
    fn priority(&self) -> i8 {
        0
    }

    fn initialize(&self) -> Result<()>;

    fn terminate(&self);

    fn attempt_unit_binding(&self, unit: &Arc<Unit>) -> bool;

    fn release_unit_binding(&self, unit: &Arc<Unit>);

    /// Optional class-specific attribute surface.
    fn get_attr(&self, _attr: Attr) -> Option<AttrValue> {
        None
    }

    fn set_attr(&self, _attr: Attr, _value: AttrValue) -> Result<()> {
        Err(HeliosError::NotSupported)
    }
}

/// A registered class: the driver plus its listener list and the units it
/// currently owns (weak back-references; the device side owns the units).
pub struct ClassHandle {
    driver: Box<dyn ClassDriver>,
    pub listeners: EventListenerList,
    units: Mutex<Vec<Weak<Unit>>>,
}

impl ClassHandle {
    pub fn name(&self) -> &'static str {
        self.driver.name()
    }

    pub fn version(&self) -> u32 {
        self.driver.version()
    }

    pub fn priority(&self) -> i8 {
        self.driver.priority()
    }

    pub fn driver(&self) -> &dyn ClassDriver {
        self.driver.as_ref()
    }

    pub(crate) fn attach_unit(&self, unit: &Arc<Unit>) {
        self.units.lock().push(Arc::downgrade(unit));
    }

    pub(crate) fn detach_unit(&self, unit: &Arc<Unit>) {
        self.units
            .lock()
            .retain(|w| w.upgrade().map_or(false, |u| !Arc::ptr_eq(&u, unit)));
    }

    /// Strong handles to the currently bound units.
    pub fn bound_units(&self) -> Vec<Arc<Unit>> {
        self.units.lock().iter().filter_map(|w| w.upgrade()).collect()
    }
}

impl SharedObject for ClassHandle {
    fn object_type(&self) -> ObjectType {
        ObjectType::Class
    }

    fn listeners(&self) -> Option<&EventListenerList> {
        Some(&self.listeners)
    }

    fn get_attr(&self, attr: Attr) -> Option<AttrValue> {
        match attr {
            Attr::Priority => Some(AttrValue::U32(self.priority() as u32)),
            other => self.driver.get_attr(other),
        }
    }

    fn set_attr(&self, attr: Attr, value: AttrValue) -> Result<()> {
        self.driver.set_attr(attr, value)
    }
}

pub struct ClassRegistry {
    classes: RwLock<Vec<Arc<ClassHandle>>>,
}

impl ClassRegistry {
    pub const fn new() -> Self {
        ClassRegistry {
            classes: RwLock::new(Vec::new()),
        }
    }

    /// Register a driver: initialize it once, insert it by priority and
    /// announce `NEW_CLASS` on `base_listeners`.
    pub fn add(
        &self,
        driver: Box<dyn ClassDriver>,
        base_listeners: &EventListenerList,
    ) -> Result<Arc<ClassHandle>> {
        {
            let classes = self.classes.read();
            if classes.iter().any(|c| c.name() == driver.name()) {
                return Err(HeliosError::BadCall);
            }
        }

        driver.initialize()?;

        let handle = Arc::new(ClassHandle {
            driver,
            listeners: EventListenerList::new(),
            units: Mutex::new(Vec::new()),
        });

        let mut classes = self.classes.write();
        let at = classes
            .iter()
            .position(|c| c.priority() < handle.priority())
            .unwrap_or(classes.len());
        classes.insert(at, handle.clone());
        drop(classes);

        base_listeners.send(event::NEW_CLASS, 0);
        Ok(handle)
    }

    /// Remove a class: force-unbind every unit it owns, announce
    /// `CLASS_REMOVED` to its listeners and terminate the driver.
    /// Idempotent.
    pub fn remove(&self, class: &Arc<ClassHandle>) {
        let removed = {
            let mut classes = self.classes.write();
            let before = classes.len();
            classes.retain(|c| !Arc::ptr_eq(c, class));
            before != classes.len()
        };
        if !removed {
            return;
        }

        for unit in class.bound_units() {
            unit.unbind();
        }

        class.listeners.send(event::CLASS_REMOVED, 0);
        class.driver().terminate();
    }

    pub fn len(&self) -> usize {
        self.classes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.read().is_empty()
    }

    pub fn find(&self, name: &str) -> Option<Arc<ClassHandle>> {
        self.classes.read().iter().find(|c| c.name() == name).cloned()
    }

    /// Offer `unit` to every class in priority order until one takes it.
    pub fn attempt_binding(&self, unit: &Arc<Unit>) -> Option<Arc<ClassHandle>> {
        if unit.is_bound() {
            return unit.bound_class();
        }
        let candidates: Vec<Arc<ClassHandle>> = self.classes.read().clone();
        for class in candidates {
            if class.driver().attempt_unit_binding(unit) && unit.bind(&class) {
                return Some(class);
            }
        }
        None
    }
}

impl Default for ClassRegistry {
    fn default() -> Self {
        Self::new()
    }
}
