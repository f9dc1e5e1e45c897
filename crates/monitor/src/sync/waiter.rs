//! Waiter nodes and the arena they live in.
//!
//! Nodes link to each other by arena index, so the entry list and the wait
//! set never hold pointers into memory that could be reclaimed under them.
//! A node is owned by the thread that allocated it until it is released back
//! to the arena.

use std::{
    fmt,
    mem::ManuallyDrop,
    sync::atomic::{AtomicBool, AtomicIsize, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering},
};

use parking_lot::Mutex;

use crate::{
    runtime::threads::{OwnerId, Participant, ThreadHandle},
    sync::MonitorError,
};

/// Sentinel index meaning "no node".
pub const NIL: u32 = u32::MAX;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct WaiterHandle(u32);

impl WaiterHandle {
    pub(crate) const fn from_raw(raw: u32) -> Option<Self> {
        if raw == NIL {
            None
        } else {
            Some(Self(raw))
        }
    }

    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for WaiterHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "waiter@{}", self.0)
    }
}

#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TState {
    Undef = 0,
    Ready = 1,
    Run = 2,
    /// Parked in the wait set.
    Wait = 3,
    /// Queued on the entry list.
    Enter = 4,
}

impl From<u8> for TState {
    fn from(value: u8) -> TState {
        match value {
            0 => TState::Undef,
            1 => TState::Ready,
            2 => TState::Run,
            3 => TState::Wait,
            4 => TState::Enter,
            _ => unreachable!(),
        }
    }
}

pub struct ObjectWaiter {
    next: AtomicU32,
    prev: AtomicU32,
    tstate: AtomicU8,
    notified: AtomicBool,
    interrupted: AtomicBool,
    at_reenter: AtomicBool,
    is_wait: AtomicBool,
    abandoned: AtomicBool,
    holds_contention: AtomicBool,
    recursions: AtomicIsize,
    notifier_tid: AtomicU64,
    next_free: AtomicU32,
    thread: Mutex<Option<ThreadHandle>>,
}

impl ObjectWaiter {
    fn vacant(next_free: u32) -> Self {
        Self {
            next: AtomicU32::new(NIL),
            prev: AtomicU32::new(NIL),
            tstate: AtomicU8::new(TState::Undef as u8),
            notified: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
            at_reenter: AtomicBool::new(false),
            is_wait: AtomicBool::new(false),
            abandoned: AtomicBool::new(false),
            holds_contention: AtomicBool::new(false),
            recursions: AtomicIsize::new(0),
            notifier_tid: AtomicU64::new(0),
            next_free: AtomicU32::new(next_free),
            thread: Mutex::new(None),
        }
    }

    fn prepare(&self, thread: ThreadHandle) {
        *self.thread.lock() = Some(thread);
        self.tstate.store(TState::Run as u8, Ordering::Relaxed);
    }

    fn reset(&self) {
        self.next.store(NIL, Ordering::Relaxed);
        self.prev.store(NIL, Ordering::Relaxed);
        self.tstate.store(TState::Undef as u8, Ordering::Relaxed);
        self.notified.store(false, Ordering::Relaxed);
        self.interrupted.store(false, Ordering::Relaxed);
        self.at_reenter.store(false, Ordering::Relaxed);
        self.is_wait.store(false, Ordering::Relaxed);
        self.abandoned.store(false, Ordering::Relaxed);
        self.holds_contention.store(false, Ordering::Relaxed);
        self.recursions.store(0, Ordering::Relaxed);
        self.notifier_tid.store(0, Ordering::Relaxed);
        *self.thread.lock() = None;
    }

    pub(crate) fn next(&self) -> u32 {
        self.next.load(Ordering::Acquire)
    }

    pub(crate) fn set_next(&self, next: u32) {
        self.next.store(next, Ordering::Release);
    }

    pub(crate) fn prev(&self) -> u32 {
        self.prev.load(Ordering::Acquire)
    }

    pub(crate) fn set_prev(&self, prev: u32) {
        self.prev.store(prev, Ordering::Release);
    }

    pub(crate) fn clear_links(&self) {
        self.set_next(NIL);
        self.set_prev(NIL);
    }

    pub fn state(&self) -> TState {
        TState::from(self.tstate.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: TState) {
        self.tstate.store(state as u8, Ordering::Release);
    }

    pub fn is_notified(&self) -> bool {
        self.notified.load(Ordering::Acquire)
    }

    pub(crate) fn set_notified(&self, notifier: OwnerId) {
        self.notifier_tid.store(notifier.as_raw(), Ordering::Relaxed);
        self.notified.store(true, Ordering::Release);
    }

    pub fn notifier(&self) -> Option<OwnerId> {
        match self.notifier_tid.load(Ordering::Relaxed) {
            0 => None,
            raw => Some(OwnerId::from_raw(raw)),
        }
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    pub(crate) fn set_interrupted(&self, interrupted: bool) {
        self.interrupted.store(interrupted, Ordering::Release);
    }

    pub fn is_at_reenter(&self) -> bool {
        self.at_reenter.load(Ordering::Acquire)
    }

    pub(crate) fn set_at_reenter(&self, value: bool) {
        self.at_reenter.store(value, Ordering::Release);
    }

    pub fn is_wait(&self) -> bool {
        self.is_wait.load(Ordering::Acquire)
    }

    pub(crate) fn set_is_wait(&self, value: bool) {
        self.is_wait.store(value, Ordering::Release);
    }

    /// Set when the blocked operation was cancelled. The node stays linked
    /// until the lock owner reclaims it.
    pub fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::SeqCst)
    }

    pub(crate) fn set_abandoned(&self) {
        self.abandoned.store(true, Ordering::SeqCst);
    }

    pub fn holds_contention(&self) -> bool {
        self.holds_contention.load(Ordering::Acquire)
    }

    pub(crate) fn set_holds_contention(&self, value: bool) {
        self.holds_contention.store(value, Ordering::Release);
    }

    pub fn recursions(&self) -> isize {
        self.recursions.load(Ordering::Relaxed)
    }

    pub(crate) fn set_recursions(&self, recursions: isize) {
        self.recursions.store(recursions, Ordering::Relaxed);
    }

    pub fn thread(&self) -> Option<ThreadHandle> {
        self.thread.lock().clone()
    }

    pub fn owner_id(&self) -> Option<OwnerId> {
        self.thread.lock().as_ref().map(|thread| thread.owner_id())
    }
}

impl fmt::Debug for ObjectWaiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectWaiter")
            .field("owner", &self.owner_id())
            .field("state", &self.state())
            .field("next", &self.next())
            .field("prev", &self.prev())
            .field("notified", &self.is_notified())
            .field("abandoned", &self.is_abandoned())
            .finish()
    }
}

const fn pack(tag: u32, index: u32) -> u64 {
    ((tag as u64) << 32) | index as u64
}

const fn unpack(word: u64) -> (u32, u32) {
    ((word >> 32) as u32, word as u32)
}

/// Fixed-capacity pool of waiter nodes with a lock-free free list. The head
/// carries a tag that changes on every update, so a stale head cannot be
/// swapped back in.
pub struct WaiterArena {
    slots: Box<[ObjectWaiter]>,
    free: AtomicU64,
    in_use: AtomicUsize,
}

impl WaiterArena {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.min(NIL as usize - 1);
        let slots = (0..capacity)
            .map(|i| {
                let next = if i + 1 < capacity { (i + 1) as u32 } else { NIL };
                ObjectWaiter::vacant(next)
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            slots,
            free: AtomicU64::new(pack(0, if capacity > 0 { 0 } else { NIL })),
            in_use: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }

    pub fn allocate(&self, thread: ThreadHandle) -> Result<WaiterRef<'_>, MonitorError> {
        let mut head = self.free.load(Ordering::Acquire);
        let index = loop {
            let (tag, index) = unpack(head);
            if index == NIL {
                return Err(MonitorError::WaiterArenaExhausted {
                    capacity: self.capacity(),
                });
            }

            let next = self.slots[index as usize].next_free.load(Ordering::Relaxed);
            match self.free.compare_exchange_weak(
                head,
                pack(tag.wrapping_add(1), next),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break index,
                Err(current) => head = current,
            }
        };

        self.slots[index as usize].prepare(thread);
        self.in_use.fetch_add(1, Ordering::Relaxed);
        Ok(WaiterRef {
            arena: self,
            handle: WaiterHandle(index),
        })
    }

    pub(crate) fn release(&self, handle: WaiterHandle) {
        let slot = self.get(handle);
        slot.reset();

        let mut head = self.free.load(Ordering::Acquire);
        loop {
            let (tag, index) = unpack(head);
            slot.next_free.store(index, Ordering::Relaxed);
            match self.free.compare_exchange_weak(
                head,
                pack(tag.wrapping_add(1), handle.0),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(current) => head = current,
            }
        }
        self.in_use.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self, handle: WaiterHandle) -> &ObjectWaiter {
        &self.slots[handle.0 as usize]
    }

    /// Looks up a raw link. `index` must not be [`NIL`].
    pub(crate) fn slot(&self, index: u32) -> &ObjectWaiter {
        debug_assert_ne!(index, NIL);
        &self.slots[index as usize]
    }
}

/// A node allocated from a [`WaiterArena`]. Released on drop unless it was
/// turned into a bare handle.
pub struct WaiterRef<'a> {
    arena: &'a WaiterArena,
    handle: WaiterHandle,
}

impl<'a> WaiterRef<'a> {
    pub fn handle(&self) -> WaiterHandle {
        self.handle
    }

    /// Hands ownership of the node to the caller, who must release it.
    pub fn into_handle(self) -> WaiterHandle {
        let this = ManuallyDrop::new(self);
        this.handle
    }
}

impl std::ops::Deref for WaiterRef<'_> {
    type Target = ObjectWaiter;

    fn deref(&self) -> &ObjectWaiter {
        self.arena.get(self.handle)
    }
}

impl Drop for WaiterRef<'_> {
    fn drop(&mut self) {
        self.arena.release(self.handle);
    }
}

/// Circular doubly-linked list of waiters. Guarded by the monitor's wait set
/// lock.
pub(crate) struct WaitSet {
    head: u32,
}

impl WaitSet {
    pub const fn new() -> Self {
        Self { head: NIL }
    }

    pub fn is_empty(&self) -> bool {
        self.head == NIL
    }

    pub fn len(&self, arena: &WaiterArena) -> usize {
        if self.is_empty() {
            return 0;
        }
        let mut count = 1;
        let mut cursor = arena.slot(self.head).next();
        while cursor != self.head {
            count += 1;
            cursor = arena.slot(cursor).next();
        }
        count
    }

    /// Appends at the tail so waiters are notified in arrival order.
    pub fn add_waiter(&mut self, arena: &WaiterArena, handle: WaiterHandle) {
        let node = arena.get(handle);
        if self.head == NIL {
            self.head = handle.raw();
            node.set_prev(handle.raw());
            node.set_next(handle.raw());
        } else {
            let head = arena.slot(self.head);
            let tail_index = head.prev();
            let tail = arena.slot(tail_index);
            tail.set_next(handle.raw());
            head.set_prev(handle.raw());
            node.set_next(self.head);
            node.set_prev(tail_index);
        }
    }

    pub fn dequeue_waiter(&mut self, arena: &WaiterArena) -> Option<WaiterHandle> {
        let waiter = WaiterHandle::from_raw(self.head)?;
        self.dequeue_specific_waiter(arena, waiter);
        Some(waiter)
    }

    pub fn dequeue_specific_waiter(&mut self, arena: &WaiterArena, handle: WaiterHandle) {
        let node = arena.get(handle);
        let next = node.next();
        debug_assert_ne!(next, NIL, "{handle:?} is not in the wait set");

        if next == handle.raw() {
            debug_assert_eq!(node.prev(), handle.raw());
            self.head = NIL;
        } else {
            let prev = node.prev();
            arena.slot(next).set_prev(prev);
            arena.slot(prev).set_next(next);
            if self.head == handle.raw() {
                self.head = next;
            }
        }
        node.clear_links();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::threads::VirtualThread;

    fn thread(id: u64) -> ThreadHandle {
        ThreadHandle::Virtual(VirtualThread::new(OwnerId::from_raw(id)))
    }

    #[test]
    fn allocate_until_exhausted() {
        let arena = WaiterArena::with_capacity(2);
        let a = arena.allocate(thread(3)).unwrap();
        let b = arena.allocate(thread(4)).unwrap();
        assert_ne!(a.handle(), b.handle());
        assert_eq!(arena.in_use(), 2);

        assert!(matches!(
            arena.allocate(thread(5)),
            Err(MonitorError::WaiterArenaExhausted { capacity: 2 })
        ));

        drop(a);
        let c = arena.allocate(thread(6)).unwrap();
        assert_eq!(c.owner_id(), Some(OwnerId::from_raw(6)));
        assert_eq!(c.state(), TState::Run);
    }

    #[test]
    fn release_resets_node() {
        let arena = WaiterArena::with_capacity(1);
        let node = arena.allocate(thread(3)).unwrap();
        node.set_state(TState::Wait);
        node.set_notified(OwnerId::from_raw(9));
        node.set_recursions(4);
        let handle = node.into_handle();
        assert_eq!(arena.in_use(), 1);

        arena.release(handle);
        assert_eq!(arena.in_use(), 0);
        let node = arena.get(handle);
        assert_eq!(node.state(), TState::Undef);
        assert!(!node.is_notified());
        assert_eq!(node.notifier(), None);
        assert_eq!(node.recursions(), 0);
        assert!(node.thread().is_none());
    }

    #[test]
    fn wait_set_is_fifo() {
        let arena = WaiterArena::with_capacity(4);
        let nodes = (0..3)
            .map(|i| arena.allocate(thread(3 + i)).unwrap())
            .collect::<Vec<_>>();

        let mut set = WaitSet::new();
        for node in &nodes {
            set.add_waiter(&arena, node.handle());
        }
        assert_eq!(set.len(&arena), 3);

        set.dequeue_specific_waiter(&arena, nodes[1].handle());
        assert_eq!(set.len(&arena), 2);
        assert_eq!(arena.get(nodes[1].handle()).next(), NIL);

        assert_eq!(set.dequeue_waiter(&arena), Some(nodes[0].handle()));
        assert_eq!(set.dequeue_waiter(&arena), Some(nodes[2].handle()));
        assert_eq!(set.dequeue_waiter(&arena), None);
        assert!(set.is_empty());
    }

    #[test]
    fn concurrent_allocation() {
        let arena = std::sync::Arc::new(WaiterArena::with_capacity(16));
        let workers = (0..4)
            .map(|i| {
                let arena = arena.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        let node = arena.allocate(thread(3 + i)).unwrap();
                        assert_eq!(node.owner_id(), Some(OwnerId::from_raw(3 + i)));
                    }
                })
            })
            .collect::<Vec<_>>();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(arena.in_use(), 0);
    }
}
