//! # Object model
//!
//! Objects that can be synchronized on carry an [`ObjectHeader`]. Monitors
//! refer to their object weakly, so a monitor never keeps an object alive.

use std::{fmt, ops::Deref};

pub mod header;

pub use header::{LockState, ObjectHeader};

pub trait MonitoredObject: Send + Sync + 'static {
    fn header(&self) -> &ObjectHeader;
}

/// A value with a header attached.
pub struct HeapObject<T> {
    header: ObjectHeader,
    value: T,
}

impl<T> HeapObject<T> {
    pub const fn new(value: T) -> Self {
        Self {
            header: ObjectHeader::new(),
            value,
        }
    }

    pub fn into_inner(self) -> T {
        self.value
    }
}

impl<T> Deref for HeapObject<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T: Send + Sync + 'static> MonitoredObject for HeapObject<T> {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }
}

impl<T: fmt::Debug> fmt::Debug for HeapObject<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapObject")
            .field("header", &self.header)
            .field("value", &self.value)
            .finish()
    }
}
