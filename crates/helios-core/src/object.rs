//! Shared-object model.
//!
//! Hardware, Device, Unit and Class handles are reference-counted and
//! typed, with a small attribute surface for callers that hold only an
//! opaque handle. List membership owns one strong reference; every
//! back-reference between objects is a weak lookup, so cycles
//! (hardware ↔ device ↔ unit ↔ class) never keep each other alive.
//! Obtaining a handle from a weak reference after the last strong owner
//! dropped yields `None`; a dropped object is never revived.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use crate::error::{HeliosError, Result};
use crate::event::EventListenerList;
use crate::types::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectType {
    Hardware,
    Device,
    Unit,
    Class,
}

/// Attribute keys understood by `SharedObject::get_attr` / `set_attr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attr {
    NodeId,
    Generation,
    Guid,
    GuidHi,
    GuidLo,
    RomLength,
    Rom,
    UnitRomDirectory,
    Priority,
    UnitNumber,
    VendorId,
    ModelId,
    UnitSpecId,
    UnitSwVersion,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrValue {
    U32(u32),
    U64(u64),
    NodeId(NodeId),
    Data(Vec<u32>),
}

impl AttrValue {
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            AttrValue::U32(v) => Some(*v),
            AttrValue::NodeId(v) => Some(*v as u32),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            AttrValue::U64(v) => Some(*v),
            AttrValue::U32(v) => Some(*v as u64),
            _ => None,
        }
    }
}

/// The common surface of every long-lived handle.
pub trait SharedObject: Send + Sync {
    fn object_type(&self) -> ObjectType;

    /// The object's listener list, when it has one.
    fn listeners(&self) -> Option<&EventListenerList> {
        None
    }

    fn get_attr(&self, attr: Attr) -> Option<AttrValue>;

    fn set_attr(&self, _attr: Attr, _value: AttrValue) -> Result<()> {
        Err(HeliosError::NotSupported)
    }
}

/// Obtain a strong handle from a weak back-reference. Returns `None` once
/// the object has been released by its last owner; the count is never
/// revived from zero.
pub fn obtain<T: SharedObject>(weak: &Weak<T>) -> Option<Arc<T>> {
    weak.upgrade()
}

/// Current number of strong owners, for diagnostics and tests.
pub fn strong_count<T: SharedObject>(obj: &Arc<T>) -> usize {
    Arc::strong_count(obj)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;

    struct Dummy;

    impl SharedObject for Dummy {
        fn object_type(&self) -> ObjectType {
            ObjectType::Unit
        }
        fn get_attr(&self, _attr: Attr) -> Option<AttrValue> {
            None
        }
    }

    #[test]
    fn obtain_fails_after_release() {
        let strong = Arc::new(Dummy);
        let weak = Arc::downgrade(&strong);
        assert!(obtain(&weak).is_some());
        drop(strong);
        // The object died; the handle cannot be revived.
        assert!(obtain(&weak).is_none());
    }

    #[test]
    fn membership_and_caller_counts_are_independent() {
        let list_ref = Arc::new(Dummy);
        let caller_ref = list_ref.clone();
        assert_eq!(strong_count(&list_ref), 2);
        drop(list_ref);
        // Caller still holds the object alive.
        assert_eq!(strong_count(&caller_ref), 1);
    }
}
