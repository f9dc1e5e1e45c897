use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use dashmap::DashMap;
use log::{debug, warn};
use parking_lot::Mutex;

use crate::sync::{
    deflation::{self, DeflationReport, MonitorDeflationThread, MonitorList},
    waiter::WaiterArena,
    MonitorError, ObjectMonitor,
};
use options::MonitorOptions;
use threads::{NativeThread, OwnerId, VirtualThread};
use unparker::VThreadUnparker;

pub mod options;
pub mod threads;
pub mod unparker;

/// State shared between a runtime and every monitor it created.
///
/// Monitors keep the context alive, not the runtime, so that dropping the
/// runtime stops its helper threads even while monitors are still around.
pub struct MonitorContext {
    options: MonitorOptions,
    arena: WaiterArena,
    unparker: VThreadUnparker,
    stats: MonitorStats,
}

impl MonitorContext {
    pub fn options(&self) -> &MonitorOptions {
        &self.options
    }

    pub fn arena(&self) -> &WaiterArena {
        &self.arena
    }

    pub fn unparker(&self) -> &VThreadUnparker {
        &self.unparker
    }

    pub fn stats(&self) -> &MonitorStats {
        &self.stats
    }

    /// Wakes a virtual thread through the unparker, or inline if the unparker
    /// is gone.
    pub(crate) fn unpark_virtual(&self, thread: &Arc<VirtualThread>) {
        if !thread.try_set_on_waiting_list() {
            // Already queued; that wake-up is still to come.
            return;
        }

        if let Err(error) = self.unparker.unpark(thread.clone()) {
            warn!("{}, waking virtual thread {} inline", error, thread.id());
            thread.clear_on_waiting_list();
            thread.unpark();
        }
    }
}

#[derive(Default)]
pub struct MonitorStats {
    pub contended_lock_attempts: AtomicU64,
    pub futile_wakeups: AtomicU64,
    pub unparks: AtomicU64,
    pub notifications: AtomicU64,
    pub inflations: AtomicU64,
    pub deflations: AtomicU64,
}

impl MonitorStats {
    pub fn snapshot(&self) -> MonitorStatsSnapshot {
        MonitorStatsSnapshot {
            contended_lock_attempts: self.contended_lock_attempts.load(Ordering::Relaxed),
            futile_wakeups: self.futile_wakeups.load(Ordering::Relaxed),
            unparks: self.unparks.load(Ordering::Relaxed),
            notifications: self.notifications.load(Ordering::Relaxed),
            inflations: self.inflations.load(Ordering::Relaxed),
            deflations: self.deflations.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
pub struct MonitorStatsSnapshot {
    pub contended_lock_attempts: u64,
    pub futile_wakeups: u64,
    pub unparks: u64,
    pub notifications: u64,
    pub inflations: u64,
    pub deflations: u64,
}

/// Owns everything needed to inflate and synchronize on objects: the
/// monitor table, the in-use list and the helper threads.
pub struct MonitorRuntime {
    pub(crate) ctx: Arc<MonitorContext>,
    pub(crate) in_use: MonitorList,
    pub(crate) table: DashMap<usize, Arc<ObjectMonitor>>,
    next_thread_id: AtomicU64,
    deflater: Mutex<Option<MonitorDeflationThread>>,
}

pub struct MonitorRuntimeBuilder {
    options: MonitorOptions,
}

impl MonitorRuntimeBuilder {
    pub fn new() -> Self {
        Self {
            options: MonitorOptions::default(),
        }
    }

    /// Takes the options from the `monitor` flag group.
    pub fn from_options(self) -> Result<Self, MonitorError> {
        Ok(self.options(MonitorOptions::from_flags()?))
    }

    pub fn options(mut self, options: MonitorOptions) -> Self {
        self.options = options;
        self
    }

    /// Starts the unparker and, if enabled, the deflation thread.
    pub fn build(self) -> Result<Arc<MonitorRuntime>, MonitorError> {
        let options = self.options;
        options.validate()?;
        let options = options.adjust_for_platform();

        let ctx = Arc::new(MonitorContext {
            arena: WaiterArena::with_capacity(options.waiter_arena_capacity),
            unparker: VThreadUnparker::start()?,
            stats: MonitorStats::default(),
            options,
        });
        debug!("monitor runtime started with {:?}", ctx.options);

        let runtime = Arc::new(MonitorRuntime {
            ctx,
            in_use: MonitorList::new(),
            table: DashMap::new(),
            next_thread_id: AtomicU64::new(OwnerId::FIRST),
            deflater: Mutex::new(None),
        });

        if runtime.options().deflation_thread {
            let deflater = MonitorDeflationThread::start(
                Arc::downgrade(&runtime),
                runtime.options().async_deflation_interval,
            )?;
            *runtime.deflater.lock() = Some(deflater);
        }

        Ok(runtime)
    }
}

impl Default for MonitorRuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MonitorRuntime {
    pub fn builder() -> MonitorRuntimeBuilder {
        MonitorRuntimeBuilder::new()
    }

    pub fn context(&self) -> &Arc<MonitorContext> {
        &self.ctx
    }

    pub fn options(&self) -> &MonitorOptions {
        self.ctx.options()
    }

    pub fn stats(&self) -> MonitorStatsSnapshot {
        self.ctx.stats().snapshot()
    }

    fn next_owner_id(&self) -> OwnerId {
        OwnerId::from_raw(self.next_thread_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Registers the calling OS thread, replacing an earlier registration.
    pub fn attach_current_thread(&self) -> Arc<NativeThread> {
        let thread = NativeThread::new(self.next_owner_id());
        NativeThread::set_current(Some(thread.clone()));
        thread
    }

    /// Releases every monitor the calling thread still owns and forgets the
    /// registration.
    pub fn detach_current_thread(&self) -> usize {
        let Some(thread) = NativeThread::current() else {
            return 0;
        };
        let released = self.release_monitors_owned_by(&thread);
        NativeThread::set_current(None);
        released
    }

    /// A native thread that is not bound to the calling OS thread.
    pub fn new_native_thread(&self) -> Arc<NativeThread> {
        NativeThread::new(self.next_owner_id())
    }

    pub fn new_virtual_thread(&self) -> Arc<VirtualThread> {
        VirtualThread::new(self.next_owner_id())
    }

    pub fn in_use_list(&self) -> &MonitorList {
        &self.in_use
    }

    /// Asks the deflation thread to run a pass now.
    pub fn request_deflation(&self) {
        if let Some(deflater) = self.deflater.lock().as_ref() {
            deflater.request();
        }
    }

    /// Runs a deflation pass on the calling thread.
    pub fn deflate_idle_monitors(&self) -> DeflationReport {
        deflation::deflate_idle_monitors(self)
    }

    pub fn is_async_deflation_needed(&self) -> bool {
        let threshold = self.options().monitor_used_deflation_threshold;
        let ceiling = self.options().in_use_list_ceiling;
        threshold > 0 && self.in_use.count() * 100 > ceiling.saturating_mul(threshold)
    }

    /// Stops the helper threads. Virtual threads are woken inline from now
    /// on.
    pub fn shutdown(&self) {
        let deflater = self.deflater.lock().take();
        if let Some(deflater) = deflater {
            deflater.shutdown();
        }
        self.ctx.unparker().stop();
    }
}

impl Drop for MonitorRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}
