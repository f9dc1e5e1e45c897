//! Object-level synchronization.
//!
//! Finds or creates the monitor of an object and retries whenever the
//! monitor it found turns out to be deflated. The table maps the address of
//! an object to its monitor; an entry pins the address because the monitor
//! holds a weak reference to the object.

use std::{
    sync::{atomic::Ordering, Arc},
    time::Duration,
};

use dashmap::mapref::entry::Entry;
use log::trace;

use crate::{
    objectmodel::MonitoredObject,
    runtime::{
        threads::{NativeThread, Participant, VirtualThread},
        MonitorRuntime,
    },
    sync::{MonitorError, ObjectMonitor, Owner, WaitOutcome},
};

fn object_key<O: MonitoredObject>(object: &Arc<O>) -> usize {
    Arc::as_ptr(object) as *const () as usize
}

impl MonitorRuntime {
    /// Returns the monitor of `object`, creating one if needed.
    ///
    /// A deflated monitor still in the table is replaced on the spot rather
    /// than waiting for the deflater to remove it.
    pub fn inflate<O: MonitoredObject>(&self, object: &Arc<O>) -> Arc<ObjectMonitor> {
        match self.table.entry(object_key(object)) {
            Entry::Occupied(mut entry) => {
                if !entry.get().is_being_async_deflated() {
                    return entry.get().clone();
                }
                trace!("replacing deflated {:?}", entry.get());
                let monitor = self.new_monitor(object);
                entry.insert(monitor.clone());
                monitor
            }
            Entry::Vacant(entry) => {
                let monitor = self.new_monitor(object);
                entry.insert(monitor.clone());
                monitor
            }
        }
    }

    /// Called with the table entry locked.
    fn new_monitor<O: MonitoredObject>(&self, object: &Arc<O>) -> Arc<ObjectMonitor> {
        let weak = Arc::downgrade(object);
        let monitor = Arc::new(ObjectMonitor::new(self.ctx.clone(), weak));
        monitor.set_metadata(object.header().identity_hash() as usize);
        object.header().set_inflated();

        self.in_use.add(monitor.clone());
        self.ctx.stats().inflations.fetch_add(1, Ordering::Relaxed);
        trace!("inflated {:?}", monitor);
        monitor
    }

    /// The current monitor of `object`, without inflating.
    pub fn peek_monitor<O: MonitoredObject>(&self, object: &Arc<O>) -> Option<Arc<ObjectMonitor>> {
        self.table
            .get(&object_key(object))
            .map(|monitor| monitor.clone())
            .filter(|monitor| !monitor.is_being_async_deflated())
    }

    /// Removes a deflated monitor from the table and reverts its object's
    /// header, unless the object got a new monitor meanwhile.
    pub(crate) fn forget_monitor(&self, monitor: &ObjectMonitor) {
        debug_assert!(monitor.is_being_async_deflated());
        if let Entry::Occupied(entry) = self.table.entry(monitor.object_key()) {
            if std::ptr::eq(Arc::as_ptr(entry.get()), monitor) {
                if let Some(object) = monitor.object() {
                    object.header().clear_inflated();
                }
                entry.remove();
            }
        }
    }

    fn owned_monitor<O, P>(&self, object: &Arc<O>, thread: &P, operation: &str) -> Arc<ObjectMonitor>
    where
        O: MonitoredObject,
        P: Participant + ?Sized,
    {
        match self.peek_monitor(object) {
            Some(monitor) => monitor,
            None => panic!(
                "{} calls {} on object {:#x} which it does not own",
                thread.owner_id(),
                operation,
                object_key(object)
            ),
        }
    }

    pub fn enter<O: MonitoredObject>(
        &self,
        object: &Arc<O>,
        thread: &Arc<NativeThread>,
    ) -> Result<(), MonitorError> {
        loop {
            let monitor = self.inflate(object);
            if monitor.enter(thread)? {
                return Ok(());
            }
        }
    }

    /// Never blocks. Counts as a recursive enter if the thread already owns
    /// the monitor.
    pub fn try_enter<O, P>(&self, object: &Arc<O>, thread: &P) -> bool
    where
        O: MonitoredObject,
        P: Participant + ?Sized,
    {
        loop {
            let monitor = self.inflate(object);
            if monitor.try_enter(thread, true) {
                return true;
            }
            if !monitor.is_being_async_deflated() {
                return false;
            }
        }
    }

    /// Enters `object` for a thread that is not the caller, e.g. to restore
    /// the locks of a suspended thread. Panics if another thread owns it.
    pub fn enter_for<O, P>(&self, object: &Arc<O>, thread: &P)
    where
        O: MonitoredObject,
        P: Participant + ?Sized,
    {
        loop {
            let monitor = self.inflate(object);
            if monitor.enter_for(thread) {
                return;
            }
            debug_assert!(monitor.is_being_async_deflated());
        }
    }

    pub fn exit<O, P>(&self, object: &Arc<O>, thread: &P)
    where
        O: MonitoredObject,
        P: Participant + ?Sized,
    {
        self.owned_monitor(object, thread, "exit").exit(thread);
    }

    pub fn wait<O: MonitoredObject>(
        &self,
        object: &Arc<O>,
        thread: &Arc<NativeThread>,
        timeout: Option<Duration>,
        interruptible: bool,
    ) -> Result<WaitOutcome, MonitorError> {
        self.owned_monitor(object, thread, "wait")
            .wait(thread, timeout, interruptible)
    }

    pub fn notify<O, P>(&self, object: &Arc<O>, thread: &P) -> bool
    where
        O: MonitoredObject,
        P: Participant + ?Sized,
    {
        self.owned_monitor(object, thread, "notify").notify(thread)
    }

    pub fn notify_all<O, P>(&self, object: &Arc<O>, thread: &P) -> usize
    where
        O: MonitoredObject,
        P: Participant + ?Sized,
    {
        self.owned_monitor(object, thread, "notify_all")
            .notify_all(thread)
    }

    pub async fn enter_virtual<O: MonitoredObject>(
        &self,
        object: &Arc<O>,
        thread: &Arc<VirtualThread>,
    ) -> Result<(), MonitorError> {
        loop {
            let monitor = self.inflate(object);
            if monitor.enter_virtual(thread).await? {
                return Ok(());
            }
        }
    }

    pub async fn wait_virtual<O: MonitoredObject>(
        &self,
        object: &Arc<O>,
        thread: &Arc<VirtualThread>,
        timeout: Option<Duration>,
        interruptible: bool,
    ) -> Result<WaitOutcome, MonitorError> {
        let monitor = self.owned_monitor(object, thread, "wait");
        monitor.wait_virtual(thread, timeout, interruptible).await
    }

    pub fn identity_hash<O: MonitoredObject>(&self, object: &Arc<O>) -> u32 {
        object.header().identity_hash()
    }

    pub fn holds_lock<O, P>(&self, object: &Arc<O>, thread: &P) -> bool
    where
        O: MonitoredObject,
        P: Participant + ?Sized,
    {
        self.peek_monitor(object)
            .is_some_and(|monitor| monitor.has_owner(thread))
    }

    /// The owner of `object`'s monitor. A monitor being deflated has none.
    pub fn get_lock_owner<O: MonitoredObject>(&self, object: &Arc<O>) -> Owner {
        match self.peek_monitor(object).map(|monitor| monitor.owner()) {
            Some(Owner::DeflaterMarker) | None => Owner::None,
            Some(owner) => owner,
        }
    }

    /// Fully exits every monitor `thread` owns, as when the thread
    /// terminates. Returns how many there were.
    pub fn release_monitors_owned_by<P: Participant + ?Sized>(&self, thread: &P) -> usize {
        let mut released = 0;
        for monitor in self.in_use.snapshot() {
            if monitor.has_owner(thread) {
                let recursions = monitor.complete_exit(thread);
                trace!(
                    "released {:?} held {} times by exiting {}",
                    monitor,
                    recursions + 1,
                    thread.owner_id()
                );
                released += 1;
            }
        }
        released
    }

    /// Visits every live monitor of the runtime.
    pub fn monitors_iterate(&self, mut f: impl FnMut(&Arc<ObjectMonitor>)) {
        for monitor in self.in_use.snapshot() {
            if !monitor.is_being_async_deflated() {
                f(&monitor);
            }
        }
    }
}
