//! The heavyweight object monitor.
//!
//! An [`ObjectMonitor`] is a recursive lock with a condition queue attached to
//! an object. Contending threads first spin, then queue on the entry list and
//! block. The entry list is a lock-free stack of waiter nodes that only the
//! lock owner may detach from; it is turned into a doubly linked list lazily,
//! from the tail, whenever the owner has to pick a successor.
//!
//! Waiters of `wait` live in a separate circular wait set guarded by a spin
//! lock. `notify` moves them to the entry list.
//!
//! A monitor that is idle may be deflated concurrently, see
//! [`ObjectMonitor::deflate_monitor`].

mod vthread;
mod wait;

use std::{
    fmt,
    mem::{offset_of, size_of},
    ops::Deref,
    ptr::null_mut,
    sync::{
        atomic::{fence, AtomicI32, AtomicIsize, AtomicPtr, AtomicU32, AtomicU64, AtomicUsize, Ordering},
        Arc, Weak,
    },
};

use cfg_if::cfg_if;
use log::trace;

use crate::{
    objectmodel::MonitoredObject,
    runtime::{
        threads::{NativeThread, OwnerId, Participant, ThreadHandle},
        MonitorContext,
    },
    sync::{
        contention::ContentionMark,
        deflation::{DeflationState, DeflationStep},
        waiter::{TState, WaitSet, WaiterArena, WaiterHandle, WaiterRef, NIL},
        MonitorError, Owner, ANONYMOUS_OWNER, DEFLATER_MARKER, NO_OWNER,
    },
};

pub use vthread::{VirtualEnter, VirtualWait};
pub use wait::WaitOutcome;

cfg_if! {
    if #[cfg(any(target_arch = "x86_64", target_arch = "aarch64", target_arch = "powerpc64"))] {
        /// Adjacent-line prefetching pulls lines in pairs on these targets.
        pub const CACHE_LINE_SIZE: usize = 128;
    } else {
        pub const CACHE_LINE_SIZE: usize = 64;
    }
}

/// Starts its contents on a fresh cache line and pads them to the end of it.
#[cfg_attr(
    any(target_arch = "x86_64", target_arch = "aarch64", target_arch = "powerpc64"),
    repr(C, align(128))
)]
#[cfg_attr(
    not(any(target_arch = "x86_64", target_arch = "aarch64", target_arch = "powerpc64")),
    repr(C, align(64))
)]
struct CacheLine<T>(T);

impl<T> Deref for CacheLine<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

/// Read-mostly identity of the monitor.
#[repr(C)]
struct Identity {
    /// Displaced header word; holds the object's identity hash.
    metadata: AtomicUsize,
    object: Weak<dyn MonitoredObject>,
}

/// Fields touched on every contended operation.
#[repr(C)]
struct Contention {
    owner: AtomicU64,
    recursions: AtomicIsize,
    /// Head of the entry list. Threads push here; only the owner detaches.
    entry_list: AtomicU32,
    /// Cached tail, maintained by the owner.
    entry_list_tail: AtomicU32,
    /// Heir presumptive: a thread that was woken or is spinning and will try
    /// to take the lock soon.
    succ: AtomicU64,
    previous_owner_tid: AtomicU64,
}

#[repr(C)]
struct Cold {
    next_om: AtomicPtr<ObjectMonitor>,
    contentions: AtomicI32,
    spin_duration: AtomicI32,
    waiters: AtomicI32,
    wait_set: spin::Mutex<WaitSet>,
    ctx: Arc<MonitorContext>,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TryLockResult {
    /// The owner word changed under us or the monitor is being deflated.
    Interference,
    HasOwner,
    Success,
}

/// Heavyweight monitor. See the module documentation.
#[repr(C)]
pub struct ObjectMonitor {
    identity: CacheLine<Identity>,
    contention: CacheLine<Contention>,
    cold: CacheLine<Cold>,
}

/// Byte offset of the metadata word, for code that reads monitors directly.
pub const METADATA_OFFSET: usize =
    offset_of!(ObjectMonitor, identity) + offset_of!(Identity, metadata);
pub const OWNER_OFFSET: usize =
    offset_of!(ObjectMonitor, contention) + offset_of!(Contention, owner);
pub const RECURSIONS_OFFSET: usize =
    offset_of!(ObjectMonitor, contention) + offset_of!(Contention, recursions);
pub const ENTRY_LIST_OFFSET: usize =
    offset_of!(ObjectMonitor, contention) + offset_of!(Contention, entry_list);
pub const SUCC_OFFSET: usize =
    offset_of!(ObjectMonitor, contention) + offset_of!(Contention, succ);

const _: () = {
    assert!(size_of::<Identity>() <= CACHE_LINE_SIZE);
    assert!(size_of::<Contention>() <= CACHE_LINE_SIZE);
    assert!(OWNER_OFFSET % CACHE_LINE_SIZE == 0);
    assert!(OWNER_OFFSET - METADATA_OFFSET >= CACHE_LINE_SIZE);
    assert!(offset_of!(ObjectMonitor, cold) - OWNER_OFFSET >= CACHE_LINE_SIZE);
};

impl ObjectMonitor {
    pub fn new(ctx: Arc<MonitorContext>, object: Weak<dyn MonitoredObject>) -> Self {
        let spin_limit = ctx.options().spin_limit;
        Self {
            identity: CacheLine(Identity {
                metadata: AtomicUsize::new(0),
                object,
            }),
            contention: CacheLine(Contention {
                owner: AtomicU64::new(NO_OWNER),
                recursions: AtomicIsize::new(0),
                entry_list: AtomicU32::new(NIL),
                entry_list_tail: AtomicU32::new(NIL),
                succ: AtomicU64::new(NO_OWNER),
                previous_owner_tid: AtomicU64::new(0),
            }),
            cold: CacheLine(Cold {
                next_om: AtomicPtr::new(null_mut()),
                contentions: AtomicI32::new(0),
                spin_duration: AtomicI32::new(spin_limit),
                waiters: AtomicI32::new(0),
                wait_set: spin::Mutex::new(WaitSet::new()),
                ctx,
            }),
        }
    }

    fn arena(&self) -> &WaiterArena {
        self.cold.ctx.arena()
    }

    pub(crate) fn ctx(&self) -> &MonitorContext {
        &self.cold.ctx
    }

    /// The associated object, if it is still alive.
    pub fn object(&self) -> Option<Arc<dyn MonitoredObject>> {
        self.identity.object.upgrade()
    }

    /// Address identifying the associated object, valid as long as this
    /// monitor exists.
    pub fn object_key(&self) -> usize {
        Weak::as_ptr(&self.identity.object) as *const () as usize
    }

    pub fn metadata(&self) -> usize {
        self.identity.metadata.load(Ordering::Relaxed)
    }

    pub fn set_metadata(&self, value: usize) {
        self.identity.metadata.store(value, Ordering::Relaxed);
    }

    pub fn owner(&self) -> Owner {
        Owner::from_raw(self.owner_raw())
    }

    pub(crate) fn owner_raw(&self) -> u64 {
        self.contention.owner.load(Ordering::Acquire)
    }

    pub fn has_owner<P: Participant + ?Sized>(&self, thread: &P) -> bool {
        self.owner_raw() == thread.owner_id().as_raw()
    }

    fn is_owned_by(&self, id: OwnerId) -> bool {
        self.owner_raw() == id.as_raw()
    }

    /// Returns the previous owner word.
    fn try_set_owner_from(&self, old: u64, new: u64) -> u64 {
        match self
            .contention
            .owner
            .compare_exchange(old, new, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(previous) | Err(previous) => previous,
        }
    }

    fn release_clear_owner(&self, id: OwnerId) {
        debug_assert!(self.is_owned_by(id));
        self.contention.owner.store(NO_OWNER, Ordering::Release);
    }

    pub fn set_anonymous_owner(&self) {
        let previous = self.try_set_owner_from(NO_OWNER, ANONYMOUS_OWNER);
        assert_eq!(previous, NO_OWNER, "anonymous owner set on a locked monitor");
    }

    pub fn is_owner_anonymous(&self) -> bool {
        self.owner_raw() == ANONYMOUS_OWNER
    }

    /// Resolves an anonymous owner to the thread that actually holds the lock.
    pub fn set_owner_from_anonymous<P: Participant + ?Sized>(&self, thread: &P) {
        let previous = self.try_set_owner_from(ANONYMOUS_OWNER, thread.owner_id().as_raw());
        assert_eq!(previous, ANONYMOUS_OWNER, "owner was not anonymous");
    }

    pub fn recursions(&self) -> isize {
        self.contention.recursions.load(Ordering::Relaxed)
    }

    pub fn contentions(&self) -> i32 {
        self.cold.contentions.load(Ordering::SeqCst)
    }

    pub(crate) fn add_to_contentions(&self, delta: i32) {
        self.cold.contentions.fetch_add(delta, Ordering::SeqCst);
    }

    pub fn waiters(&self) -> i32 {
        self.cold.waiters.load(Ordering::SeqCst)
    }

    pub fn successor(&self) -> Option<OwnerId> {
        match self.contention.succ.load(Ordering::Acquire) {
            NO_OWNER => None,
            raw => Some(OwnerId::from_raw(raw)),
        }
    }

    fn has_any_successor(&self) -> bool {
        self.contention.succ.load(Ordering::Acquire) != NO_OWNER
    }

    fn has_successor(&self, id: OwnerId) -> bool {
        self.contention.succ.load(Ordering::Acquire) == id.as_raw()
    }

    fn set_successor(&self, id: OwnerId) {
        self.contention.succ.store(id.as_raw(), Ordering::Release);
    }

    fn clear_successor(&self) {
        self.contention.succ.store(NO_OWNER, Ordering::Release);
    }

    /// Clears the successor only if it is still `id`.
    fn clear_successor_if(&self, id: OwnerId) -> bool {
        self.contention
            .succ
            .compare_exchange(id.as_raw(), NO_OWNER, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn previous_owner(&self) -> Option<OwnerId> {
        match self.contention.previous_owner_tid.load(Ordering::Relaxed) {
            0 => None,
            raw => Some(OwnerId::from_raw(raw)),
        }
    }

    pub fn has_entry_list(&self) -> bool {
        self.contention.entry_list.load(Ordering::Acquire) != NIL
    }

    pub(crate) fn next_om(&self) -> *mut ObjectMonitor {
        self.cold.next_om.load(Ordering::Acquire)
    }

    pub(crate) fn set_next_om(&self, next: *mut ObjectMonitor) {
        self.cold.next_om.store(next, Ordering::Release);
    }

    pub(crate) fn try_set_next_om(&self, current: *mut ObjectMonitor, next: *mut ObjectMonitor) -> bool {
        self.cold
            .next_om
            .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// A monitor is busy while anything could still observe or need it. A
    /// deflater marker or a negative contention count left by a deflation in
    /// progress do not count.
    pub fn is_busy(&self) -> bool {
        let contentions = self.contentions().max(0);
        let owner = match self.owner_raw() {
            DEFLATER_MARKER => NO_OWNER,
            owner => owner,
        };
        self.waiters() != 0 || contentions != 0 || owner != NO_OWNER || self.has_entry_list()
    }

    pub fn is_being_async_deflated(&self) -> bool {
        self.contentions() < 0 && self.owner_raw() == DEFLATER_MARKER
    }

    fn enter_is_async_deflating(&self) -> bool {
        self.is_being_async_deflated()
    }

    fn try_lock_with_contention_mark(&self, id: OwnerId, mark: &mut ContentionMark<'_>) -> bool {
        debug_assert!(!self.is_being_async_deflated());
        let me = id.as_raw();
        let previous = self.try_set_owner_from(NO_OWNER, me);

        if previous == NO_OWNER {
            debug_assert_eq!(self.recursions(), 0);
            true
        } else if previous == me {
            self.contention.recursions.fetch_add(1, Ordering::Relaxed);
            true
        } else if previous == DEFLATER_MARKER {
            match self.try_set_owner_from(DEFLATER_MARKER, me) {
                DEFLATER_MARKER => {
                    // Deflation cancelled. The deflater drops the extra count
                    // once it sees its marker is gone.
                    mark.extend();
                    true
                }
                NO_OWNER => self.try_set_owner_from(NO_OWNER, me) == NO_OWNER,
                _ => false,
            }
        } else {
            false
        }
    }

    /// Attempts to take the lock without blocking. Never succeeds
    /// recursively.
    pub fn try_lock(&self, id: OwnerId) -> TryLockResult {
        let first = self.owner_raw();
        let mut own = first;

        loop {
            if own == DEFLATER_MARKER {
                let mut mark = ContentionMark::new(self);
                if self.enter_is_async_deflating() {
                    return TryLockResult::Interference;
                }
                if self.try_lock_with_contention_mark(id, &mut mark) {
                    debug_assert_eq!(self.recursions(), 0);
                    return TryLockResult::Success;
                }
                break;
            } else if own == NO_OWNER {
                let previous = self.try_set_owner_from(NO_OWNER, id.as_raw());
                if previous == NO_OWNER {
                    debug_assert_eq!(self.recursions(), 0);
                    return TryLockResult::Success;
                }
                own = previous;
            } else {
                break;
            }
        }

        if first == own {
            TryLockResult::HasOwner
        } else {
            TryLockResult::Interference
        }
    }

    pub fn try_enter<P: Participant + ?Sized>(&self, thread: &P, check_for_recursion: bool) -> bool {
        let id = thread.owner_id();
        let result = self.try_lock(id);
        if result == TryLockResult::Success {
            return true;
        }

        if !check_for_recursion {
            return false;
        }

        if result == TryLockResult::HasOwner && self.is_owned_by(id) {
            self.contention.recursions.fetch_add(1, Ordering::Relaxed);
            return true;
        }

        false
    }

    /// Locks on behalf of `thread` without blocking. The monitor must be
    /// free or already owned by `thread`, so only deflation can interfere.
    ///
    /// Returns false if the monitor was deflated first.
    pub fn enter_for<P: Participant + ?Sized>(&self, thread: &P) -> bool {
        let id = thread.owner_id();
        let mut mark = ContentionMark::new(self);
        if self.enter_is_async_deflating() {
            return false;
        }

        if !self.try_lock_with_contention_mark(id, &mut mark) {
            panic!("{} cannot enter {:?} on behalf of another thread", id, self);
        }
        debug_assert!(self.is_owned_by(id));
        true
    }

    /// Recursive fast path followed by one round of spinning. Returns false
    /// without spinning if the monitor is being deflated.
    pub fn spin_enter(&self, id: OwnerId) -> bool {
        if self.try_enter(&id, true) {
            return true;
        }

        if self.enter_is_async_deflating() {
            return false;
        }

        self.try_spin(id)
    }

    /// Acquires the monitor, blocking if needed.
    ///
    /// Returns `Ok(false)` if the monitor was deflated under the caller, who
    /// must then look up the object's monitor again.
    pub fn enter(&self, thread: &Arc<NativeThread>) -> Result<bool, MonitorError> {
        let id = thread.id();
        if self.spin_enter(id) {
            return Ok(true);
        }
        debug_assert!(!self.is_owned_by(id));

        // Keeps the deflation state stable for the rest of the slow path.
        let mark = ContentionMark::new(self);
        if self.enter_is_async_deflating() {
            return Ok(false);
        }

        self.enter_with_contention_mark(thread, &mark)?;
        Ok(true)
    }

    fn enter_with_contention_mark(
        &self,
        thread: &Arc<NativeThread>,
        _mark: &ContentionMark<'_>,
    ) -> Result<(), MonitorError> {
        debug_assert!(!self.is_being_async_deflated());
        self.enter_internal(thread)?;

        debug_assert!(self.contentions() >= 0);
        debug_assert_eq!(self.recursions(), 0);
        debug_assert!(self.is_owned_by(thread.id()));
        self.ctx().stats().contended_lock_attempts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn enter_internal(&self, thread: &Arc<NativeThread>) -> Result<(), MonitorError> {
        let id = thread.id();
        if self.try_lock(id) == TryLockResult::Success {
            debug_assert!(!self.has_successor(id));
            return Ok(());
        }

        if self.try_spin(id) {
            return Ok(());
        }

        // Allocation failure leaves no trace on the monitor.
        let node = self.arena().allocate(ThreadHandle::Native(thread.clone()))?;
        self.enter_with_node(thread, &node);
        Ok(())
    }

    /// Queues `node` on the entry list and blocks until the lock is taken.
    fn enter_with_node(&self, thread: &NativeThread, node: &WaiterRef<'_>) {
        let id = thread.id();
        thread.park_event().reset();

        if self.try_lock_or_add_to_entry_list(id, node.handle()) {
            return;
        }

        loop {
            if self.try_lock(id) == TryLockResult::Success {
                break;
            }
            debug_assert!(!self.is_owned_by(id));

            thread.park_event().park();

            if self.try_lock(id) == TryLockResult::Success {
                break;
            }

            // Woken but lost the race.
            self.ctx().stats().futile_wakeups.fetch_add(1, Ordering::Relaxed);

            if self.try_spin(id) {
                break;
            }

            if self.has_successor(id) {
                self.clear_successor();
            }
            fence(Ordering::SeqCst);
        }

        self.unlink_after_acquire(id, node.handle());
        if self.has_successor(id) {
            self.clear_successor();
        }
    }

    /// Re-acquires the lock for a notified waiter that is already on the
    /// entry list.
    fn reenter_internal(&self, thread: &NativeThread, node: &WaiterRef<'_>) {
        let id = thread.id();
        debug_assert_eq!(node.state(), TState::Enter);

        loop {
            if self.try_lock(id) == TryLockResult::Success {
                break;
            }
            if self.try_spin(id) {
                break;
            }

            thread.park_event().park();

            if self.try_lock(id) == TryLockResult::Success {
                break;
            }

            if self.has_successor(id) {
                self.clear_successor();
            }
            fence(Ordering::SeqCst);

            self.ctx().stats().futile_wakeups.fetch_add(1, Ordering::Relaxed);
        }

        self.unlink_after_acquire(id, node.handle());
        if self.has_successor(id) {
            self.clear_successor();
        }
        node.set_state(TState::Run);
        fence(Ordering::SeqCst);
    }

    fn add_to_entry_list(&self, handle: WaiterHandle) {
        let node = self.arena().get(handle);
        node.set_prev(NIL);
        node.set_state(TState::Enter);

        loop {
            let head = self.contention.entry_list.load(Ordering::Acquire);
            node.set_next(head);
            if self
                .contention
                .entry_list
                .compare_exchange(head, handle.raw(), Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Pushes the node, or takes the lock if the list changes under us.
    /// Returns true if the lock was taken and the node was not queued.
    fn try_lock_or_add_to_entry_list(&self, id: OwnerId, handle: WaiterHandle) -> bool {
        let node = self.arena().get(handle);
        node.set_prev(NIL);
        node.set_state(TState::Enter);

        loop {
            let head = self.contention.entry_list.load(Ordering::Acquire);
            node.set_next(head);
            if self
                .contention
                .entry_list
                .compare_exchange(head, handle.raw(), Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                return false;
            }

            if self.try_lock(id) == TryLockResult::Success {
                return true;
            }
        }
    }

    /// Tail of the entry list, building the back links on the way. Owner
    /// only.
    fn entry_list_tail(&self) -> u32 {
        let tail = self.contention.entry_list_tail.load(Ordering::Relaxed);
        if tail != NIL {
            return tail;
        }

        let arena = self.arena();
        let mut w = self.contention.entry_list.load(Ordering::Acquire);
        debug_assert_ne!(w, NIL);
        if arena.slot(w).next() == NIL {
            self.contention.entry_list_tail.store(w, Ordering::Relaxed);
            return w;
        }

        let mut prev = NIL;
        while w != NIL {
            let node = arena.slot(w);
            debug_assert_eq!(node.state(), TState::Enter);
            node.set_prev(prev);
            prev = w;
            w = node.next();
        }
        self.contention.entry_list_tail.store(prev, Ordering::Relaxed);
        prev
    }

    /// Removes the caller's node after it took the lock. Owner only.
    fn unlink_after_acquire(&self, id: OwnerId, handle: WaiterHandle) {
        debug_assert!(self.is_owned_by(id));
        let arena = self.arena();
        let node = arena.get(handle);
        let me = handle.raw();

        if node.next() == NIL {
            let head = self.contention.entry_list.load(Ordering::Acquire);
            if head == me {
                if self
                    .contention
                    .entry_list
                    .compare_exchange(head, NIL, Ordering::SeqCst, Ordering::Relaxed)
                    .is_ok()
                {
                    self.contention.entry_list_tail.store(NIL, Ordering::Relaxed);
                    node.clear_links();
                    return;
                }
                // Someone pushed, we are no longer the head.
                debug_assert_eq!(node.prev(), NIL);
            }

            if node.prev() == NIL {
                self.contention.entry_list_tail.store(NIL, Ordering::Relaxed);
                self.entry_list_tail();
                debug_assert_ne!(node.prev(), NIL);
            }

            let prev = node.prev();
            self.contention.entry_list_tail.store(prev, Ordering::Relaxed);
            arena.slot(prev).set_next(NIL);
            node.clear_links();
            return;
        }

        // We took the lock ahead of the chosen successor, so we are the head
        // or an interior node.
        debug_assert_ne!(self.contention.entry_list_tail.load(Ordering::Relaxed), me);
        if node.prev() == NIL {
            let head = self.contention.entry_list.load(Ordering::Acquire);
            debug_assert_ne!(head, NIL);
            if head == me {
                let next = node.next();
                if self
                    .contention
                    .entry_list
                    .compare_exchange(head, next, Ordering::SeqCst, Ordering::Relaxed)
                    .is_ok()
                {
                    arena.slot(next).set_prev(NIL);
                    node.clear_links();
                    return;
                }
            }
            // Still in the singly linked part: build back links.
            self.contention.entry_list_tail.store(NIL, Ordering::Relaxed);
            self.entry_list_tail();
            debug_assert_ne!(node.prev(), NIL);
        }

        let next = node.next();
        let prev = node.prev();
        arena.slot(next).set_prev(prev);
        arena.slot(prev).set_next(next);
        node.clear_links();
    }

    /// Unlinks a cancelled node and gives back the counts it held. Owner only.
    fn reclaim_abandoned(&self, id: OwnerId, handle: WaiterHandle) {
        let node = self.arena().get(handle);
        debug_assert!(node.is_abandoned());

        self.unlink_after_acquire(id, handle);
        if node.holds_contention() {
            self.add_to_contentions(-1);
        }
        if node.is_wait() {
            self.cold.waiters.fetch_sub(1, Ordering::SeqCst);
        }
        trace!("reclaimed abandoned {:?} of {:?}", handle, node.owner_id());
        self.arena().release(handle);
    }

    /// Picks the next thread to wake: the oldest live waiter on the entry
    /// list. Owner only.
    fn select_successor(&self, id: OwnerId) -> Option<WaiterHandle> {
        loop {
            if !self.has_entry_list() {
                return None;
            }

            let tail = self.entry_list_tail();
            let handle = WaiterHandle::from_raw(tail)?;
            if self.arena().get(handle).is_abandoned() {
                self.reclaim_abandoned(id, handle);
                continue;
            }
            return Some(handle);
        }
    }

    /// Releases the monitor. Panics if `thread` is not the owner.
    pub fn exit<P: Participant + ?Sized>(&self, thread: &P) {
        let id = thread.owner_id();
        if !self.is_owned_by(id) {
            panic!("{} exits {:?} which it does not own", id, self);
        }
        self.exit_owner(id);
    }

    pub(crate) fn exit_owner(&self, id: OwnerId) {
        let recursions = self.recursions();
        if recursions != 0 {
            self.contention.recursions.store(recursions - 1, Ordering::Relaxed);
            return;
        }

        self.contention
            .previous_owner_tid
            .store(id.as_raw(), Ordering::Relaxed);

        self.release_clear_owner(id);
        loop {
            fence(Ordering::SeqCst);

            // A queued successor or a spinner guarantees progress. The check
            // is repeated after every wake-up: a successor that cancelled in
            // the meantime clears itself and leaves succession to us.
            if !self.has_entry_list() || self.has_any_successor() {
                return;
            }

            // Only the owner may detach from the entry list. If the lock was
            // taken meanwhile, succession is the new owner's job.
            if self.try_lock(id) != TryLockResult::Success {
                return;
            }

            loop {
                match self.select_successor(id) {
                    Some(wakee) => {
                        if self.exit_epilog(id, wakee) {
                            break;
                        }
                    }
                    None => {
                        self.release_clear_owner(id);
                        break;
                    }
                }
            }
        }
    }

    /// Designates `wakee` as successor, drops the lock and wakes it. Returns
    /// false if the node turned out to be abandoned; the lock is then still
    /// held.
    fn exit_epilog(&self, id: OwnerId, wakee: WaiterHandle) -> bool {
        let node = self.arena().get(wakee);
        let Some(thread) = node.thread() else {
            unreachable!("{:?} is linked without a thread", wakee);
        };
        let wakee_id = thread.owner_id();

        self.set_successor(wakee_id);
        fence(Ordering::SeqCst);
        if node.is_abandoned() {
            self.clear_successor_if(wakee_id);
            self.reclaim_abandoned(id, wakee);
            return false;
        }

        // The node may be released as soon as the owner word is cleared.
        self.release_clear_owner(id);
        fence(Ordering::SeqCst);

        match thread {
            ThreadHandle::Native(thread) => thread.park_event().unpark(),
            ThreadHandle::Virtual(thread) => self.ctx().unpark_virtual(&thread),
        }

        self.ctx().stats().unparks.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Fully releases the monitor whatever its recursion count and returns
    /// the count for a later re-entry.
    pub fn complete_exit<P: Participant + ?Sized>(&self, thread: &P) -> isize {
        let id = thread.owner_id();
        if !self.is_owned_by(id) {
            panic!("{} completely exits {:?} which it does not own", id, self);
        }

        let saved = self.recursions();
        self.contention.recursions.store(0, Ordering::Relaxed);
        self.exit_owner(id);
        saved
    }

    /// Bounded adaptive spinning on the owner word. Returns true with the
    /// lock held.
    fn try_spin(&self, id: OwnerId) -> bool {
        let options = self.ctx().options();

        if options.fixed_spin > 0 {
            return self.short_fixed_spin(id, options.fixed_spin, false);
        }

        if self.short_fixed_spin(id, options.pre_spin, true) {
            return true;
        }

        let mut ctr = self.cold.spin_duration.load(Ordering::Relaxed);
        if ctr <= 0 {
            return false;
        }

        // Announce ourselves so that exiting threads need not wake anyone.
        if !self.has_any_successor() {
            self.set_successor(id);
        }

        let mut prv = NO_OWNER;
        loop {
            ctr -= 1;
            if ctr < 0 {
                break;
            }

            if ctr & 0xFF == 0 && self.is_being_async_deflated() {
                break;
            }

            let mut ox = self.owner_raw();
            if ox == NO_OWNER {
                ox = self.try_set_owner_from(NO_OWNER, id.as_raw());
                if ox == NO_OWNER {
                    if self.has_successor(id) {
                        self.clear_successor();
                    }
                    let duration = self.cold.spin_duration.load(Ordering::Relaxed);
                    self.cold
                        .spin_duration
                        .store(options.adjust_up(duration), Ordering::Relaxed);
                    return true;
                }

                // Lost the race; spinning against it is pointless.
                break;
            }

            // The lock changed hands: the competition is fierce, stop.
            if ox != prv && prv != NO_OWNER {
                break;
            }
            prv = ox;

            if !self.has_any_successor() {
                self.set_successor(id);
            }
            std::hint::spin_loop();
        }

        if ctr < 0 {
            let duration = self.cold.spin_duration.load(Ordering::Relaxed);
            self.cold
                .spin_duration
                .store(options.adjust_down(duration), Ordering::Relaxed);
        }

        if self.has_successor(id) {
            self.clear_successor();
            // Re-check after giving up the successor role so that an exiting
            // thread that relied on us is not left without one.
            fence(Ordering::SeqCst);
            if self.try_lock(id) == TryLockResult::Success {
                return true;
            }
        }

        false
    }

    fn short_fixed_spin(&self, id: OwnerId, spin_count: i32, adapt: bool) -> bool {
        for _ in 0..spin_count {
            match self.try_lock(id) {
                TryLockResult::Success => {
                    if adapt {
                        let duration = self.cold.spin_duration.load(Ordering::Relaxed);
                        self.cold
                            .spin_duration
                            .store(self.ctx().options().adjust_up(duration), Ordering::Relaxed);
                    }
                    return true;
                }
                TryLockResult::Interference => break,
                TryLockResult::HasOwner => {}
            }
            std::hint::spin_loop();
        }
        false
    }

    /// Tries to deflate an idle monitor. On success the owner word is left as
    /// the deflater marker and contentions negative, so racing threads
    /// retry on a fresh monitor.
    pub fn deflate_monitor(&self) -> bool {
        if self.is_busy() {
            return false;
        }

        let won = self.try_set_owner_from(NO_OWNER, DEFLATER_MARKER) == NO_OWNER;
        let mut state = DeflationState::Idle.next(DeflationStep::Mark { won });
        if state != DeflationState::Marked {
            return false;
        }

        // Contending threads must see the marker before we look at their
        // counts.
        fence(Ordering::SeqCst);
        let busy = self.contentions() > 0 || self.waiters() != 0;
        state = state.next(DeflationStep::Verify { busy });

        if state == DeflationState::Marked {
            let won = self
                .cold
                .contentions
                .compare_exchange(0, i32::MIN, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok();
            state = state.next(DeflationStep::Claim { won });
        }

        if state == DeflationState::Cancelling {
            let marker_intact = self.try_set_owner_from(DEFLATER_MARKER, NO_OWNER) == DEFLATER_MARKER;
            if !marker_intact {
                // A racing enter replaced our marker and extended its mark;
                // this is the matching decrement.
                self.add_to_contentions(-1);
            }
            state = state.next(DeflationStep::Restore { marker_intact });
        }

        if state == DeflationState::Reclaimed {
            trace!("deflated {:?}", self);
            true
        } else {
            false
        }
    }
}

impl fmt::Debug for ObjectMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectMonitor")
            .field("address", &(self as *const Self))
            .field("object", &format_args!("{:#x}", self.object_key()))
            .field("owner", &self.owner())
            .field("recursions", &self.recursions())
            .field("contentions", &self.contentions())
            .field("waiters", &self.waiters())
            .field("successor", &self.successor())
            .finish()
    }
}
