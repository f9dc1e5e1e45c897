//! Asynchronous deflation of idle monitors.
//!
//! Deflating a monitor races with threads that are about to enter it. The
//! race is settled in two CAS steps on the monitor itself (see
//! [`ObjectMonitor::deflate_monitor`]), modelled here as [`DeflationState`].
//! Deflated monitors are unlinked from the in-use [`MonitorList`] and removed
//! from the monitor table. Their memory is reclaimed by reference counting,
//! so a thread that still holds one only ever sees
//! [`ObjectMonitor::is_being_async_deflated`] and retries.

use std::{
    ptr::null_mut,
    sync::{
        atomic::{AtomicPtr, AtomicUsize, Ordering},
        Arc, Weak,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use log::{debug, trace};
use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;

use crate::{
    runtime::MonitorRuntime,
    sync::{MonitorError, ObjectMonitor},
};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DeflationState {
    Idle,
    /// The deflater marker is installed in the owner word.
    Marked,
    /// A racing thread showed up; the marker is being taken back.
    Cancelling,
    /// Contentions claimed. The monitor is dead.
    Reclaimed,
}

/// Outcome of one step of the protocol.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DeflationStep {
    /// CAS of the owner word from no owner to the deflater marker.
    Mark { won: bool },
    /// Check of contentions and waiters after the marker is visible.
    Verify { busy: bool },
    /// CAS of contentions from zero to `i32::MIN`.
    Claim { won: bool },
    /// CAS of the owner word back from the marker to no owner.
    Restore { marker_intact: bool },
}

impl DeflationState {
    /// Total transition function. Steps that make no sense in a state leave
    /// it unchanged.
    pub fn next(self, step: DeflationStep) -> Self {
        use DeflationState::*;
        use DeflationStep::*;

        match (self, step) {
            (Idle, Mark { won: true }) => Marked,
            (Idle, Mark { won: false }) => Idle,
            (Marked, Verify { busy: true }) => Cancelling,
            (Marked, Verify { busy: false }) => Marked,
            (Marked, Claim { won: true }) => Reclaimed,
            (Marked, Claim { won: false }) => Cancelling,
            // Whether or not an entering thread replaced the marker, the
            // monitor stays in use.
            (Cancelling, Restore { .. }) => Idle,
            (state, _) => state,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, DeflationState::Idle | DeflationState::Reclaimed)
    }
}

type Batch = SmallVec<[Arc<ObjectMonitor>; 16]>;

/// Intrusive list of all monitors of a runtime, linked through
/// `ObjectMonitor::next_om`.
///
/// Pushing is lock-free. Unlinking is done by the deflater alone and
/// excludes traversals.
pub struct MonitorList {
    head: AtomicPtr<ObjectMonitor>,
    count: AtomicUsize,
    max: AtomicUsize,
    unlink_lock: Mutex<()>,
}

impl MonitorList {
    pub fn new() -> Self {
        Self {
            head: AtomicPtr::new(null_mut()),
            count: AtomicUsize::new(0),
            max: AtomicUsize::new(0),
            unlink_lock: Mutex::new(()),
        }
    }

    /// Number of linked monitors.
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    /// High-water mark of [`MonitorList::count`].
    pub fn max(&self) -> usize {
        self.max.load(Ordering::Relaxed)
    }

    pub fn add(&self, monitor: Arc<ObjectMonitor>) {
        let raw = Arc::into_raw(monitor) as *mut ObjectMonitor;
        loop {
            let head = self.head.load(Ordering::Acquire);
            // SAFETY: `raw` is owned by the list from here on.
            unsafe { (*raw).set_next_om(head) };
            if self
                .head
                .compare_exchange_weak(head, raw, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }

        let count = self.count.fetch_add(1, Ordering::Relaxed) + 1;
        self.max.fetch_max(count, Ordering::Relaxed);
    }

    /// Visits every linked monitor, deflated ones included.
    pub fn for_each(&self, mut f: impl FnMut(&ObjectMonitor)) {
        let _guard = self.unlink_lock.lock();
        let mut current = self.head.load(Ordering::Acquire);
        while !current.is_null() {
            // SAFETY: linked monitors are kept alive by the list and only
            // unlinked under `unlink_lock`.
            let monitor = unsafe { &*current };
            f(monitor);
            current = monitor.next_om();
        }
    }

    pub fn snapshot(&self) -> Vec<Arc<ObjectMonitor>> {
        let _guard = self.unlink_lock.lock();
        let mut monitors = Vec::with_capacity(self.count());
        let mut current = self.head.load(Ordering::Acquire);
        while !current.is_null() {
            // SAFETY: see `for_each`. The extra count belongs to the new Arc.
            let monitor = unsafe {
                Arc::increment_strong_count(current);
                Arc::from_raw(current)
            };
            current = monitor.next_om();
            monitors.push(monitor);
        }
        monitors
    }

    /// Unlinks up to `limit` deflated monitors and hands back the list's
    /// references to them.
    pub(crate) fn unlink_deflated(&self, limit: usize) -> Batch {
        let _guard = self.unlink_lock.lock();
        let mut unlinked = Batch::new();
        let mut prev: *mut ObjectMonitor = null_mut();
        let mut current = self.head.load(Ordering::Acquire);

        while !current.is_null() && unlinked.len() < limit {
            // SAFETY: we hold `unlink_lock`, nothing else unlinks.
            let monitor = unsafe { &*current };
            let next = monitor.next_om();

            if !monitor.is_being_async_deflated() {
                prev = current;
                current = next;
                continue;
            }

            if prev.is_null() {
                if self
                    .head
                    .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    // New monitors were pushed in front of us. They only ever
                    // change the head, so the predecessor is stable once found.
                    let mut pred = self.head.load(Ordering::Acquire);
                    loop {
                        // SAFETY: as above.
                        let pred_ref = unsafe { &*pred };
                        if pred_ref.next_om() == current {
                            break;
                        }
                        pred = pred_ref.next_om();
                    }
                    // SAFETY: as above.
                    unsafe { (*pred).set_next_om(next) };
                    prev = pred;
                }
            } else {
                // SAFETY: as above.
                let linked = unsafe { (*prev).try_set_next_om(current, next) };
                debug_assert!(linked);
            }

            monitor.set_next_om(null_mut());
            self.count.fetch_sub(1, Ordering::Relaxed);
            // SAFETY: the reference leaked in `add` is ours again.
            unlinked.push(unsafe { Arc::from_raw(current) });
            current = next;
        }

        unlinked
    }
}

impl Default for MonitorList {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MonitorList {
    fn drop(&mut self) {
        let mut current = *self.head.get_mut();
        while !current.is_null() {
            // SAFETY: we are the last user of the list.
            let monitor = unsafe { Arc::from_raw(current) };
            current = monitor.next_om();
        }
    }
}

#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
pub struct DeflationReport {
    /// Monitors looked at.
    pub scanned: usize,
    pub deflated: usize,
    /// Deflated monitors removed from the in-use list, including ones
    /// deflated before this pass.
    pub unlinked: usize,
    /// Monitors left in use.
    pub in_use: usize,
    pub elapsed: Duration,
}

/// Deflates idle monitors of `runtime`, unlinks every deflated monitor and
/// forgets their table entries.
pub fn deflate_idle_monitors(runtime: &MonitorRuntime) -> DeflationReport {
    let start = Instant::now();
    let options = runtime.options();
    let mut report = DeflationReport::default();

    runtime.in_use.for_each(|monitor| {
        if report.deflated >= options.monitor_deflation_max {
            return;
        }
        report.scanned += 1;
        if monitor.deflate_monitor() {
            report.deflated += 1;
        }
    });

    loop {
        let batch = runtime.in_use.unlink_deflated(options.monitor_unlink_batch);
        for monitor in &batch {
            runtime.forget_monitor(monitor);
        }
        report.unlinked += batch.len();
        trace!("unlinked a batch of {} deflated monitors", batch.len());
        if batch.len() < options.monitor_unlink_batch {
            break;
        }
    }

    runtime
        .ctx
        .stats()
        .deflations
        .fetch_add(report.deflated as u64, Ordering::Relaxed);
    report.in_use = runtime.in_use.count();
    report.elapsed = start.elapsed();
    report
}

#[derive(Default)]
struct DeflaterState {
    requested: bool,
    shutdown: bool,
}

struct DeflaterShared {
    state: Mutex<DeflaterState>,
    cond: Condvar,
}

/// Background thread running [`deflate_idle_monitors`] periodically or on
/// request.
pub struct MonitorDeflationThread {
    shared: Arc<DeflaterShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl MonitorDeflationThread {
    pub fn start(runtime: Weak<MonitorRuntime>, interval: Duration) -> Result<Self, MonitorError> {
        let shared = Arc::new(DeflaterShared {
            state: Mutex::new(DeflaterState::default()),
            cond: Condvar::new(),
        });

        let handle = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name("monitor-deflation".to_string())
                .spawn(move || deflation_loop(runtime, shared, interval))
                .map_err(|source| MonitorError::ThreadSpawn {
                    name: "monitor-deflation",
                    source,
                })?
        };

        Ok(Self {
            shared,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn request(&self) {
        self.shared.state.lock().requested = true;
        self.shared.cond.notify_one();
    }

    pub fn shutdown(&self) {
        self.shared.state.lock().shutdown = true;
        self.shared.cond.notify_one();

        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            // The last reference to the runtime may be dropped by the
            // deflation thread itself.
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for MonitorDeflationThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn deflation_loop(runtime: Weak<MonitorRuntime>, shared: Arc<DeflaterShared>, interval: Duration) {
    debug!("monitor-deflation started, interval {:?}", interval);
    loop {
        let requested = {
            let mut state = shared.state.lock();
            if !state.requested && !state.shutdown {
                shared.cond.wait_for(&mut state, interval);
            }
            if state.shutdown {
                break;
            }
            std::mem::take(&mut state.requested)
        };

        let Some(runtime) = runtime.upgrade() else {
            break;
        };

        if requested || runtime.is_async_deflation_needed() {
            let report = deflate_idle_monitors(&runtime);
            debug!(
                "deflated {} of {} monitors in {:?}, {} in use",
                report.deflated, report.scanned, report.elapsed, report.in_use
            );
        }
    }
    debug!("monitor-deflation stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        objectmodel::{HeapObject, MonitoredObject},
        runtime::options::MonitorOptions,
        sync::Owner,
    };

    fn runtime(options: MonitorOptions) -> Arc<MonitorRuntime> {
        MonitorRuntime::builder()
            .options(MonitorOptions {
                deflation_thread: false,
                ..options
            })
            .build()
            .unwrap()
    }

    #[test]
    fn transitions() {
        use DeflationState::*;
        use DeflationStep::*;

        assert_eq!(Idle.next(Mark { won: false }), Idle);
        assert_eq!(Idle.next(Mark { won: true }), Marked);
        assert_eq!(Marked.next(Verify { busy: false }), Marked);
        assert_eq!(Marked.next(Verify { busy: true }), Cancelling);
        assert_eq!(Marked.next(Claim { won: true }), Reclaimed);
        assert_eq!(Marked.next(Claim { won: false }), Cancelling);
        assert_eq!(Cancelling.next(Restore { marker_intact: true }), Idle);
        assert_eq!(Cancelling.next(Restore { marker_intact: false }), Idle);
        assert_eq!(Reclaimed.next(Mark { won: true }), Reclaimed);
        assert_eq!(Idle.next(Claim { won: true }), Idle);

        assert!(Idle.is_terminal());
        assert!(Reclaimed.is_terminal());
        assert!(!Marked.is_terminal());
        assert!(!Cancelling.is_terminal());
    }

    #[test]
    fn list_unlinks_only_deflated_monitors() {
        let runtime = runtime(MonitorOptions::default());
        let objects = (0..5)
            .map(|_| Arc::new(HeapObject::new(())))
            .collect::<Vec<_>>();
        let monitors = objects
            .iter()
            .map(|object| runtime.inflate(object))
            .collect::<Vec<_>>();
        assert_eq!(runtime.in_use_list().count(), 5);
        assert_eq!(runtime.in_use_list().max(), 5);

        // Head, middle and tail of the list.
        for index in [0, 2, 4] {
            assert!(monitors[index].deflate_monitor());
        }
        let batch = runtime.in_use_list().unlink_deflated(16);
        assert_eq!(batch.len(), 3);
        assert!(batch.iter().all(|monitor| monitor.is_being_async_deflated()));
        assert_eq!(runtime.in_use_list().count(), 2);
        assert_eq!(runtime.in_use_list().max(), 5);

        let mut remaining = Vec::new();
        runtime
            .in_use_list()
            .for_each(|monitor| remaining.push(monitor as *const ObjectMonitor));
        assert_eq!(remaining.len(), 2);
        assert!(remaining.contains(&Arc::as_ptr(&monitors[1])));
        assert!(remaining.contains(&Arc::as_ptr(&monitors[3])));
    }

    #[test]
    fn unlink_respects_batch_limit() {
        let runtime = runtime(MonitorOptions::default());
        let objects = (0..4)
            .map(|_| Arc::new(HeapObject::new(())))
            .collect::<Vec<_>>();
        for object in &objects {
            assert!(runtime.inflate(object).deflate_monitor());
        }
        assert_eq!(runtime.in_use_list().unlink_deflated(3).len(), 3);
        assert_eq!(runtime.in_use_list().unlink_deflated(3).len(), 1);
        assert_eq!(runtime.in_use_list().count(), 0);
    }

    #[test]
    fn pass_deflates_idle_monitors_and_reverts_headers() {
        let runtime = runtime(MonitorOptions {
            monitor_unlink_batch: 2,
            ..Default::default()
        });
        let idle = (0..3)
            .map(|_| Arc::new(HeapObject::new(())))
            .collect::<Vec<_>>();
        for object in &idle {
            runtime.inflate(object);
        }
        let busy = Arc::new(HeapObject::new(()));
        let thread = runtime.attach_current_thread();
        runtime.enter(&busy, &thread).unwrap();

        let report = runtime.deflate_idle_monitors();
        assert_eq!(report.scanned, 4);
        assert_eq!(report.deflated, 3);
        assert_eq!(report.unlinked, 3);
        assert_eq!(report.in_use, 1);
        assert_eq!(runtime.stats().deflations, 3);

        for object in &idle {
            assert!(!object.header().is_inflated());
            assert!(runtime.peek_monitor(object).is_none());
        }
        assert!(busy.header().is_inflated());
        assert!(runtime.holds_lock(&busy, &thread));
        runtime.exit(&busy, &thread);
    }

    #[test]
    fn pass_respects_deflation_max() {
        let runtime = runtime(MonitorOptions {
            monitor_deflation_max: 2,
            ..Default::default()
        });
        let objects = (0..5)
            .map(|_| Arc::new(HeapObject::new(())))
            .collect::<Vec<_>>();
        for object in &objects {
            runtime.inflate(object);
        }

        assert_eq!(runtime.deflate_idle_monitors().deflated, 2);
        assert_eq!(runtime.in_use_list().count(), 3);
        assert_eq!(runtime.deflate_idle_monitors().deflated, 2);
        assert_eq!(runtime.deflate_idle_monitors().deflated, 1);
        assert_eq!(runtime.in_use_list().count(), 0);
    }

    #[test]
    fn monitor_of_dead_object_is_deflated() {
        let runtime = runtime(MonitorOptions::default());
        let object = Arc::new(HeapObject::new(()));
        let monitor = runtime.inflate(&object);
        drop(object);
        assert!(monitor.object().is_none());
        drop(monitor);

        let report = runtime.deflate_idle_monitors();
        assert_eq!(report.deflated, 1);
        assert_eq!(runtime.table.len(), 0);
    }

    #[test]
    fn stale_monitor_is_replaced() {
        let runtime = runtime(MonitorOptions::default());
        let object = Arc::new(HeapObject::new(()));
        let stale = runtime.inflate(&object);
        assert!(stale.deflate_monitor());

        let fresh = runtime.inflate(&object);
        assert!(!Arc::ptr_eq(&stale, &fresh));
        assert_eq!(fresh.owner(), Owner::None);
        assert_eq!(fresh.metadata(), stale.metadata());

        // Unlinking the stale monitor must not disturb the fresh one, which
        // is held so the pass cannot deflate it.
        let thread = runtime.attach_current_thread();
        assert!(fresh.enter(&thread).unwrap());

        let report = runtime.deflate_idle_monitors();
        assert_eq!(report.deflated, 0);
        assert_eq!(report.unlinked, 1);
        assert_eq!(report.in_use, 1);
        assert!(!fresh.is_being_async_deflated());
        assert!(Arc::ptr_eq(&runtime.peek_monitor(&object).unwrap(), &fresh));
        assert!(object.header().is_inflated());

        fresh.exit(&thread);
        assert!(!fresh.is_busy());
    }

    #[test]
    fn background_thread_deflates_on_request() {
        let runtime = MonitorRuntime::builder()
            .options(MonitorOptions {
                async_deflation_interval: Duration::from_secs(3600),
                ..Default::default()
            })
            .build()
            .unwrap();
        let object = Arc::new(HeapObject::new(()));
        runtime.inflate(&object);
        runtime.request_deflation();

        let deadline = Instant::now() + Duration::from_secs(10);
        while runtime.in_use_list().count() != 0 {
            assert!(Instant::now() < deadline, "deflation never ran");
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(!object.header().is_inflated());
        runtime.shutdown();
    }
}
