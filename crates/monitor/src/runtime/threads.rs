//! Threads that take part in monitor operations.
//!
//! Native threads block on their [`ParkEvent`]. Virtual threads are futures
//! polled by some executor and block by returning `Pending`; they are woken
//! through their registered [`Waker`].

use std::{
    cell::RefCell,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering},
        Arc,
    },
    task::Waker,
    time::Instant,
};

use parking_lot::{Condvar, Mutex};

/// Identity of a monitor participant. Native and virtual threads share one
/// id space, so an id can be stored directly in the owner word.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerId(u64);

impl OwnerId {
    /// Lower raw values are reserved for the sentinel owners.
    pub const FIRST: u64 = 3;

    pub(crate) const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Anything that can own a monitor.
pub trait Participant {
    fn owner_id(&self) -> OwnerId;
}

impl Participant for OwnerId {
    fn owner_id(&self) -> OwnerId {
        *self
    }
}

impl<P: Participant + ?Sized> Participant for Arc<P> {
    fn owner_id(&self) -> OwnerId {
        (**self).owner_id()
    }
}

/// A binary permit. `unpark` makes the permit available, `park` consumes it
/// or blocks until it is made available.
pub struct ParkEvent {
    permit: Mutex<bool>,
    cvar: Condvar,
}

impl ParkEvent {
    pub const fn new() -> Self {
        Self {
            permit: parking_lot::const_mutex(false),
            cvar: Condvar::new(),
        }
    }

    /// Drops a stale permit.
    pub fn reset(&self) {
        *self.permit.lock() = false;
    }

    pub fn park(&self) {
        let mut permit = self.permit.lock();
        while !*permit {
            self.cvar.wait(&mut permit);
        }
        *permit = false;
    }

    /// Returns false when `deadline` passed without an unpark.
    pub fn park_until(&self, deadline: Instant) -> bool {
        let mut permit = self.permit.lock();
        while !*permit {
            if self.cvar.wait_until(&mut permit, deadline).timed_out() {
                break;
            }
        }
        std::mem::replace(&mut *permit, false)
    }

    pub fn unpark(&self) {
        let mut permit = self.permit.lock();
        *permit = true;
        self.cvar.notify_one();
    }
}

impl Default for ParkEvent {
    fn default() -> Self {
        Self::new()
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<NativeThread>>> = const { RefCell::new(None) };
}

/// An OS thread registered with a monitor runtime.
pub struct NativeThread {
    id: OwnerId,
    name: Option<String>,
    park_event: ParkEvent,
    interrupted: AtomicBool,
}

impl NativeThread {
    pub(crate) fn new(id: OwnerId) -> Arc<Self> {
        Arc::new(Self {
            id,
            name: std::thread::current().name().map(str::to_owned),
            park_event: ParkEvent::new(),
            interrupted: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> OwnerId {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn park_event(&self) -> &ParkEvent {
        &self.park_event
    }

    /// Sets the interrupt flag and wakes the thread if it is parked.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        self.park_event.unpark();
    }

    pub fn is_interrupted(&self, clear: bool) -> bool {
        if clear {
            self.interrupted.swap(false, Ordering::SeqCst)
        } else {
            self.interrupted.load(Ordering::SeqCst)
        }
    }

    /// The native thread attached to the calling OS thread, if any.
    pub fn current() -> Option<Arc<NativeThread>> {
        CURRENT.with_borrow(|current| current.clone())
    }

    pub(crate) fn set_current(thread: Option<Arc<NativeThread>>) {
        CURRENT.with_borrow_mut(|current| *current = thread);
    }
}

impl Participant for NativeThread {
    fn owner_id(&self) -> OwnerId {
        self.id
    }
}

impl fmt::Debug for NativeThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeThread")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum VirtualThreadState {
    Running = 0,
    /// Queued on a monitor's entry list.
    Blocked = 1,
    Waiting = 2,
    TimedWaiting = 3,
}

impl From<u8> for VirtualThreadState {
    fn from(value: u8) -> VirtualThreadState {
        match value {
            0 => VirtualThreadState::Running,
            1 => VirtualThreadState::Blocked,
            2 => VirtualThreadState::Waiting,
            3 => VirtualThreadState::TimedWaiting,
            _ => unreachable!(),
        }
    }
}

/// A lightweight thread whose monitor operations are futures.
pub struct VirtualThread {
    id: OwnerId,
    waker: Mutex<Option<Waker>>,
    /// Set while an unpark request for this thread is queued on the unparker.
    on_waiting_list: AtomicBool,
    interrupted: AtomicBool,
    /// Bumped on every timed wait so that stale timers can be told apart.
    wait_seq: AtomicU64,
    state: AtomicU8,
}

impl VirtualThread {
    pub(crate) fn new(id: OwnerId) -> Arc<Self> {
        Arc::new(Self {
            id,
            waker: Mutex::new(None),
            on_waiting_list: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
            wait_seq: AtomicU64::new(0),
            state: AtomicU8::new(VirtualThreadState::Running as u8),
        })
    }

    pub fn id(&self) -> OwnerId {
        self.id
    }

    pub fn register_waker(&self, waker: &Waker) {
        let mut slot = self.waker.lock();
        match &*slot {
            Some(current) if current.will_wake(waker) => {}
            _ => *slot = Some(waker.clone()),
        }
    }

    /// Wakes the future currently blocked on behalf of this thread.
    pub fn unpark(&self) {
        let waker = self.waker.lock().take();
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Returns true if the caller must queue an unpark request.
    pub(crate) fn try_set_on_waiting_list(&self) -> bool {
        !self.on_waiting_list.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn clear_on_waiting_list(&self) {
        self.on_waiting_list.store(false, Ordering::Release);
    }

    pub fn is_on_waiting_list(&self) -> bool {
        self.on_waiting_list.load(Ordering::Acquire)
    }

    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        self.unpark();
    }

    pub fn is_interrupted(&self, clear: bool) -> bool {
        if clear {
            self.interrupted.swap(false, Ordering::SeqCst)
        } else {
            self.interrupted.load(Ordering::SeqCst)
        }
    }

    pub fn state(&self) -> VirtualThreadState {
        VirtualThreadState::from(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: VirtualThreadState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn next_wait_seq(&self) -> u64 {
        self.wait_seq.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn wait_seq(&self) -> u64 {
        self.wait_seq.load(Ordering::Acquire)
    }
}

impl Participant for VirtualThread {
    fn owner_id(&self) -> OwnerId {
        self.id
    }
}

impl fmt::Debug for VirtualThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualThread")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

/// The thread recorded in a waiter node.
#[derive(Clone, Debug)]
pub enum ThreadHandle {
    Native(Arc<NativeThread>),
    Virtual(Arc<VirtualThread>),
}

impl Participant for ThreadHandle {
    fn owner_id(&self) -> OwnerId {
        match self {
            ThreadHandle::Native(thread) => thread.id(),
            ThreadHandle::Virtual(thread) => thread.id(),
        }
    }
}
