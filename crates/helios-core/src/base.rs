//! The library base: the process-wide class registry, the global listener
//! list and the report queue.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;

use lazy_static::lazy_static;

use crate::class::{ClassDriver, ClassHandle, ClassRegistry};
use crate::error::Result;
use crate::event::{self, EventListenerList};
use crate::report::{ReportList, ReportSeverity};

pub struct HeliosBase {
    pub classes: ClassRegistry,
    pub listeners: EventListenerList,
    pub reports: ReportList,
}

impl HeliosBase {
    fn new() -> Self {
        HeliosBase {
            classes: ClassRegistry::new(),
            listeners: EventListenerList::new(),
            reports: ReportList::new(),
        }
    }

    pub fn add_class(&self, driver: Box<dyn ClassDriver>) -> Result<Arc<ClassHandle>> {
        self.classes.add(driver, &self.listeners)
    }

    pub fn remove_class(&self, class: &Arc<ClassHandle>) {
        self.classes.remove(class);
    }

    /// Queue an operator-visible report and announce it.
    pub fn report(&self, severity: ReportSeverity, label: &'static str, text: String) {
        self.reports.post(severity, label, text);
        self.listeners.send(event::NEW_REPORTMSG, 0);
    }
}

lazy_static! {
    static ref HELIOS_BASE: HeliosBase = HeliosBase::new();
}

pub fn helios_base() -> &'static HeliosBase {
    &HELIOS_BASE
}
