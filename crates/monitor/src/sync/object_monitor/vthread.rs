//! Monitor operations of virtual threads.
//!
//! A virtual thread never blocks its carrier. When it cannot take the lock it
//! leaves its waiter node queued and returns `Pending`; the exiting owner
//! wakes it through the unparker. Dropping a pending future cancels the
//! operation: the node is marked abandoned and reclaimed by whoever owns the
//! lock next.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{fence, Ordering},
        Arc,
    },
    task::{Context, Poll},
    time::{Duration, Instant},
};

use log::trace;

use super::{ObjectMonitor, TryLockResult, WaitOutcome};
use crate::{
    runtime::threads::{ThreadHandle, VirtualThread, VirtualThreadState},
    sync::{contention::ContentionMark, waiter::TState, waiter::WaiterHandle, MonitorError},
};

impl ObjectMonitor {
    /// Acquires the monitor on behalf of a virtual thread.
    ///
    /// Resolves to `Ok(false)` if the monitor was deflated before the thread
    /// could queue on it.
    pub fn enter_virtual<'a>(&'a self, thread: &Arc<VirtualThread>) -> VirtualEnter<'a> {
        VirtualEnter {
            monitor: self,
            thread: thread.clone(),
            state: EnterState::Start,
        }
    }

    /// Releases the monitor and waits like [`ObjectMonitor::wait`] without
    /// blocking the carrier.
    pub fn wait_virtual<'a>(
        &'a self,
        thread: &Arc<VirtualThread>,
        timeout: Option<Duration>,
        interruptible: bool,
    ) -> VirtualWait<'a> {
        VirtualWait {
            monitor: self,
            thread: thread.clone(),
            timeout,
            interruptible,
            state: WaitState::Start,
        }
    }

    /// Queues `handle` unless the lock can be taken. Returns true with the
    /// lock held and the node detached.
    fn vthread_monitor_enter(&self, thread: &VirtualThread, handle: WaiterHandle) -> bool {
        let id = thread.id();
        if self.try_lock(id) == TryLockResult::Success {
            return true;
        }

        if self.try_lock_or_add_to_entry_list(id, handle) {
            return true;
        }

        // The owner may have exited before our node was visible.
        if self.try_lock(id) == TryLockResult::Success {
            self.unlink_after_acquire(id, handle);
            if self.has_successor(id) {
                self.clear_successor();
            }
            return true;
        }

        thread.set_state(VirtualThreadState::Blocked);
        self.add_to_contentions(1);
        self.arena().get(handle).set_holds_contention(true);
        false
    }

    /// Retries the lock for a queued node. On success the node is released
    /// and the flags it carried are returned.
    fn resume_operation(&self, thread: &VirtualThread, handle: WaiterHandle) -> Option<Resumed> {
        let id = thread.id();
        debug_assert_eq!(self.arena().get(handle).state(), TState::Enter);

        if self.try_lock(id) == TryLockResult::Success {
            return Some(self.vthread_epilog(thread, handle));
        }

        if self.has_successor(id) {
            self.clear_successor();
        }
        // After giving up the successor role we must retry once more.
        fence(Ordering::SeqCst);

        if self.try_lock(id) == TryLockResult::Success {
            return Some(self.vthread_epilog(thread, handle));
        }

        thread.set_state(VirtualThreadState::Blocked);
        None
    }

    fn vthread_epilog(&self, thread: &VirtualThread, handle: WaiterHandle) -> Resumed {
        let id = thread.id();
        let node = self.arena().get(handle);

        if node.holds_contention() {
            self.add_to_contentions(-1);
        }
        if self.has_successor(id) {
            self.clear_successor();
        }

        debug_assert_eq!(self.recursions(), 0);
        if node.is_wait() {
            self.contention
                .recursions
                .store(node.recursions(), Ordering::Relaxed);
            self.cold.waiters.fetch_sub(1, Ordering::SeqCst);
        }

        let resumed = Resumed {
            notified: node.is_notified(),
            interrupted: node.is_interrupted(),
        };

        self.unlink_after_acquire(id, handle);
        self.arena().release(handle);
        thread.set_state(VirtualThreadState::Running);
        resumed
    }

    /// Puts the thread into the wait set and releases the monitor. The timer
    /// is armed before anything is released so that a failure leaves the
    /// monitor held and untouched.
    fn vthread_wait(
        &self,
        thread: &Arc<VirtualThread>,
        deadline: Option<Instant>,
    ) -> Result<WaiterHandle, MonitorError> {
        let id = thread.id();
        let node = self
            .arena()
            .allocate(ThreadHandle::Virtual(thread.clone()))?;
        node.set_is_wait(true);
        node.set_state(TState::Wait);

        if let Some(deadline) = deadline {
            let seq = thread.next_wait_seq();
            self.ctx()
                .unparker()
                .schedule_timeout(thread.clone(), deadline, seq)?;
        }

        self.cold.wait_set.lock().add_waiter(self.arena(), node.handle());

        node.set_recursions(self.recursions());
        self.contention.recursions.store(0, Ordering::Relaxed);
        self.cold.waiters.fetch_add(1, Ordering::SeqCst);
        thread.set_state(if deadline.is_some() {
            VirtualThreadState::TimedWaiting
        } else {
            VirtualThreadState::Waiting
        });
        self.exit_owner(id);

        Ok(node.into_handle())
    }

    /// First step after the wait ended. Returns the outcome if the monitor was
    /// re-acquired right away, otherwise the node is queued for the lock.
    fn vthread_wait_reenter(
        &self,
        thread: &VirtualThread,
        handle: WaiterHandle,
        interruptible: bool,
    ) -> Option<WaitOutcome> {
        let node = self.arena().get(handle);

        if node.state() == TState::Wait {
            let mut wait_set = self.cold.wait_set.lock();
            if node.state() == TState::Wait {
                wait_set.dequeue_specific_waiter(self.arena(), handle);
                debug_assert!(!node.is_notified());
                node.set_state(TState::Run);
            }
        }

        let was_notified = node.state() == TState::Enter;
        debug_assert!(was_notified || node.state() == TState::Run);
        node.set_interrupted(!was_notified && interruptible && thread.is_interrupted(true));
        node.set_at_reenter(true);

        if !was_notified {
            if self.vthread_monitor_enter(thread, handle) {
                debug_assert_eq!(self.recursions(), 0);
                self.contention
                    .recursions
                    .store(node.recursions(), Ordering::Relaxed);
                self.cold.waiters.fetch_sub(1, Ordering::SeqCst);

                let resumed = Resumed {
                    notified: false,
                    interrupted: node.is_interrupted(),
                };
                self.arena().release(handle);
                thread.set_state(VirtualThreadState::Running);
                return Some(resumed.outcome());
            }
        } else {
            // The notifier already queued us on the entry list.
            self.add_to_contentions(1);
            node.set_holds_contention(true);
            thread.set_state(VirtualThreadState::Blocked);
        }

        None
    }

    /// Cancels a pending operation whose future was dropped.
    fn abandon(&self, thread: &VirtualThread, handle: WaiterHandle) {
        let id = thread.id();
        let node = self.arena().get(handle);

        if node.state() == TState::Wait {
            let mut wait_set = self.cold.wait_set.lock();
            if node.state() == TState::Wait {
                // Still only in the wait set, which we may edit ourselves.
                wait_set.dequeue_specific_waiter(self.arena(), handle);
                drop(wait_set);
                self.cold.waiters.fetch_sub(1, Ordering::SeqCst);
                self.arena().release(handle);
                thread.set_state(VirtualThreadState::Running);
                return;
            }
        }

        // Queued on the entry list: only a lock owner may unlink the node.
        node.set_abandoned();
        fence(Ordering::SeqCst);
        if self.clear_successor_if(id) {
            fence(Ordering::SeqCst);
        }
        thread.set_state(VirtualThreadState::Running);
        trace!("{} abandoned {:?} on {:?}", id, handle, self);

        // If the lock is free, take it and let exit reclaim the node and pass
        // the lock on. Otherwise the current owner does it when exiting.
        if self.try_lock(id) == TryLockResult::Success {
            self.exit_owner(id);
        }
    }
}

#[derive(Clone, Copy)]
struct Resumed {
    notified: bool,
    interrupted: bool,
}

impl Resumed {
    fn outcome(self) -> WaitOutcome {
        if self.notified {
            WaitOutcome::Notified
        } else if self.interrupted {
            WaitOutcome::Interrupted
        } else {
            WaitOutcome::TimedOut
        }
    }
}

enum EnterState {
    Start,
    Blocked(WaiterHandle),
    Done,
}

/// Future returned by [`ObjectMonitor::enter_virtual`].
#[must_use = "futures do nothing unless polled"]
pub struct VirtualEnter<'a> {
    monitor: &'a ObjectMonitor,
    thread: Arc<VirtualThread>,
    state: EnterState,
}

impl Future for VirtualEnter<'_> {
    type Output = Result<bool, MonitorError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let monitor = this.monitor;
        // Registered before any check so a wake-up cannot slip in between.
        this.thread.register_waker(cx.waker());

        match this.state {
            EnterState::Start => {
                let id = this.thread.id();
                if monitor.spin_enter(id) {
                    this.state = EnterState::Done;
                    return Poll::Ready(Ok(true));
                }

                let _mark = ContentionMark::new(monitor);
                if monitor.enter_is_async_deflating() {
                    this.state = EnterState::Done;
                    return Poll::Ready(Ok(false));
                }

                if monitor.try_lock(id) == TryLockResult::Success {
                    this.state = EnterState::Done;
                    return Poll::Ready(Ok(true));
                }

                let node = match monitor
                    .arena()
                    .allocate(ThreadHandle::Virtual(this.thread.clone()))
                {
                    Ok(node) => node,
                    Err(error) => {
                        this.state = EnterState::Done;
                        return Poll::Ready(Err(error));
                    }
                };
                let handle = node.into_handle();

                monitor
                    .ctx()
                    .stats()
                    .contended_lock_attempts
                    .fetch_add(1, Ordering::Relaxed);

                if monitor.vthread_monitor_enter(&this.thread, handle) {
                    monitor.arena().release(handle);
                    this.state = EnterState::Done;
                    return Poll::Ready(Ok(true));
                }

                this.state = EnterState::Blocked(handle);
                Poll::Pending
            }
            EnterState::Blocked(handle) => match monitor.resume_operation(&this.thread, handle) {
                Some(_) => {
                    this.state = EnterState::Done;
                    Poll::Ready(Ok(true))
                }
                None => Poll::Pending,
            },
            EnterState::Done => panic!("`VirtualEnter` polled after completion"),
        }
    }
}

impl Drop for VirtualEnter<'_> {
    fn drop(&mut self) {
        if let EnterState::Blocked(handle) = self.state {
            self.monitor.abandon(&self.thread, handle);
        }
    }
}

enum WaitState {
    Start,
    Waiting {
        node: WaiterHandle,
        deadline: Option<Instant>,
    },
    Reentering(WaiterHandle),
    Done,
}

/// Future returned by [`ObjectMonitor::wait_virtual`].
#[must_use = "futures do nothing unless polled"]
pub struct VirtualWait<'a> {
    monitor: &'a ObjectMonitor,
    thread: Arc<VirtualThread>,
    timeout: Option<Duration>,
    interruptible: bool,
    state: WaitState,
}

impl Future for VirtualWait<'_> {
    type Output = Result<WaitOutcome, MonitorError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let monitor = this.monitor;
        this.thread.register_waker(cx.waker());

        loop {
            match this.state {
                WaitState::Start => {
                    let id = this.thread.id();
                    monitor.check_owner(id, "wait");

                    if this.interruptible && this.thread.is_interrupted(true) {
                        this.state = WaitState::Done;
                        return Poll::Ready(Ok(WaitOutcome::Interrupted));
                    }

                    let deadline = this
                        .timeout
                        .and_then(|timeout| Instant::now().checked_add(timeout));
                    match monitor.vthread_wait(&this.thread, deadline) {
                        Ok(node) => {
                            this.state = WaitState::Waiting { node, deadline };
                            return Poll::Pending;
                        }
                        Err(error) => {
                            this.state = WaitState::Done;
                            return Poll::Ready(Err(error));
                        }
                    }
                }
                WaitState::Waiting { node, deadline } => {
                    if monitor.arena().get(node).state() == TState::Wait {
                        let timed_out = deadline.is_some_and(|deadline| Instant::now() >= deadline);
                        let interrupted =
                            this.interruptible && this.thread.is_interrupted(false);
                        if !timed_out && !interrupted {
                            return Poll::Pending;
                        }
                    }

                    match monitor.vthread_wait_reenter(&this.thread, node, this.interruptible) {
                        Some(outcome) => {
                            this.state = WaitState::Done;
                            return Poll::Ready(Ok(outcome));
                        }
                        None => this.state = WaitState::Reentering(node),
                    }
                }
                WaitState::Reentering(node) => {
                    return match monitor.resume_operation(&this.thread, node) {
                        Some(resumed) => {
                            this.state = WaitState::Done;
                            Poll::Ready(Ok(resumed.outcome()))
                        }
                        None => Poll::Pending,
                    };
                }
                WaitState::Done => panic!("`VirtualWait` polled after completion"),
            }
        }
    }
}

impl Drop for VirtualWait<'_> {
    fn drop(&mut self) {
        match self.state {
            WaitState::Waiting { node, .. } | WaitState::Reentering(node) => {
                self.monitor.abandon(&self.thread, node);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mock::{block_on, noop_waker},
        objectmodel::HeapObject,
        runtime::{options::MonitorOptions, MonitorRuntime},
        sync::Owner,
    };

    fn runtime() -> Arc<MonitorRuntime> {
        MonitorRuntime::builder()
            .options(MonitorOptions {
                deflation_thread: false,
                ..Default::default()
            })
            .build()
            .unwrap()
    }

    #[test]
    fn uncontended_virtual_enter() {
        let runtime = runtime();
        let object = Arc::new(HeapObject::new(()));
        let monitor = runtime.inflate(&object);
        let thread = runtime.new_virtual_thread();

        assert!(block_on(monitor.enter_virtual(&thread)).unwrap());
        assert!(block_on(monitor.enter_virtual(&thread)).unwrap());
        assert_eq!(monitor.recursions(), 1);
        monitor.exit(&thread);
        monitor.exit(&thread);
        assert_eq!(monitor.owner(), Owner::None);
    }

    #[test]
    fn blocked_enter_is_woken_by_exit() {
        let runtime = runtime();
        let object = Arc::new(HeapObject::new(()));
        let monitor = runtime.inflate(&object);
        let owner = runtime.attach_current_thread();
        let thread = runtime.new_virtual_thread();

        assert!(monitor.enter(&owner).unwrap());

        let mut enter = Box::pin(monitor.enter_virtual(&thread));
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        assert!(enter.as_mut().poll(&mut cx).is_pending());
        assert_eq!(thread.state(), VirtualThreadState::Blocked);
        assert!(monitor.has_entry_list());
        assert_eq!(monitor.contentions(), 1);

        monitor.exit(&owner);
        assert_eq!(monitor.successor(), Some(thread.id()));

        assert!(matches!(enter.as_mut().poll(&mut cx), Poll::Ready(Ok(true))));
        assert!(monitor.has_owner(&thread));
        assert_eq!(monitor.contentions(), 0);
        assert!(!monitor.has_entry_list());
        monitor.exit(&thread);
        assert_eq!(runtime.context().arena().in_use(), 0);
    }

    #[test]
    fn dropped_enter_is_reclaimed() {
        let runtime = runtime();
        let object = Arc::new(HeapObject::new(()));
        let monitor = runtime.inflate(&object);
        let owner = runtime.attach_current_thread();
        let thread = runtime.new_virtual_thread();

        assert!(monitor.enter(&owner).unwrap());
        let mut enter = Box::pin(monitor.enter_virtual(&thread));
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        assert!(enter.as_mut().poll(&mut cx).is_pending());
        drop(enter);

        // Still linked until the owner passes by.
        assert!(monitor.has_entry_list());
        monitor.exit(&owner);

        assert!(!monitor.has_entry_list());
        assert_eq!(monitor.contentions(), 0);
        assert_eq!(monitor.owner(), Owner::None);
        assert!(!monitor.is_busy());
        assert_eq!(runtime.context().arena().in_use(), 0);
    }

    #[test]
    fn dropped_enter_on_free_lock_reclaims_itself() {
        let runtime = runtime();
        let object = Arc::new(HeapObject::new(()));
        let monitor = runtime.inflate(&object);
        let owner = runtime.attach_current_thread();
        let thread = runtime.new_virtual_thread();

        assert!(monitor.enter(&owner).unwrap());
        let mut enter = Box::pin(monitor.enter_virtual(&thread));
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        assert!(enter.as_mut().poll(&mut cx).is_pending());

        // The exit designates the virtual thread as successor, which then
        // goes away without running.
        monitor.exit(&owner);
        drop(enter);

        assert_eq!(monitor.owner(), Owner::None);
        assert_eq!(monitor.successor(), None);
        assert!(!monitor.is_busy());
        assert_eq!(runtime.context().arena().in_use(), 0);
    }

    #[test]
    fn virtual_wait_times_out() {
        let runtime = runtime();
        let object = Arc::new(HeapObject::new(()));
        let monitor = runtime.inflate(&object);
        let thread = runtime.new_virtual_thread();

        let outcome = block_on(async {
            assert!(monitor.enter_virtual(&thread).await.unwrap());
            assert!(monitor.enter_virtual(&thread).await.unwrap());
            let outcome = monitor
                .wait_virtual(&thread, Some(Duration::from_millis(20)), true)
                .await
                .unwrap();
            assert_eq!(monitor.recursions(), 1);
            monitor.exit(&thread);
            monitor.exit(&thread);
            outcome
        });

        assert_eq!(outcome, WaitOutcome::TimedOut);
        assert_eq!(monitor.waiters(), 0);
        assert!(!monitor.is_busy());
    }

    #[test]
    fn virtual_wait_notified_by_native_thread() {
        let runtime = runtime();
        let object = Arc::new(HeapObject::new(()));
        let monitor = runtime.inflate(&object);
        let main = runtime.attach_current_thread();
        let thread = runtime.new_virtual_thread();

        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        assert!(block_on(monitor.enter_virtual(&thread)).unwrap());
        let mut wait = Box::pin(monitor.wait_virtual(&thread, None, false));
        assert!(wait.as_mut().poll(&mut cx).is_pending());
        assert_eq!(thread.state(), VirtualThreadState::Waiting);
        assert_eq!(monitor.owner(), Owner::None);

        assert!(monitor.enter(&main).unwrap());
        assert!(monitor.notify(&main));
        assert_eq!(thread.state(), VirtualThreadState::Blocked);
        monitor.exit(&main);

        assert!(matches!(
            wait.as_mut().poll(&mut cx),
            Poll::Ready(Ok(WaitOutcome::Notified))
        ));
        assert!(monitor.has_owner(&thread));
        drop(wait);
        monitor.exit(&thread);
        assert_eq!(monitor.waiters(), 0);
        assert_eq!(runtime.context().arena().in_use(), 0);
    }

    #[test]
    fn interrupt_ends_virtual_wait() {
        let runtime = runtime();
        let object = Arc::new(HeapObject::new(()));
        let monitor = runtime.inflate(&object);
        let thread = runtime.new_virtual_thread();

        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        assert!(block_on(monitor.enter_virtual(&thread)).unwrap());
        assert!(block_on(monitor.enter_virtual(&thread)).unwrap());
        let mut wait = Box::pin(monitor.wait_virtual(&thread, None, true));
        assert!(wait.as_mut().poll(&mut cx).is_pending());
        assert_eq!(thread.state(), VirtualThreadState::Waiting);
        assert_eq!(monitor.waiters(), 1);

        thread.interrupt();
        assert!(matches!(
            wait.as_mut().poll(&mut cx),
            Poll::Ready(Ok(WaitOutcome::Interrupted))
        ));
        drop(wait);

        assert!(monitor.has_owner(&thread));
        assert_eq!(monitor.recursions(), 1);
        assert!(!thread.is_interrupted(false));
        assert_eq!(monitor.waiters(), 0);

        monitor.exit(&thread);
        monitor.exit(&thread);
        assert!(!monitor.is_busy());
        assert_eq!(runtime.context().arena().in_use(), 0);
    }

    #[test]
    fn dropped_wait_leaves_wait_set() {
        let runtime = runtime();
        let object = Arc::new(HeapObject::new(()));
        let monitor = runtime.inflate(&object);
        let thread = runtime.new_virtual_thread();

        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        assert!(block_on(monitor.enter_virtual(&thread)).unwrap());
        let mut wait = Box::pin(monitor.wait_virtual(&thread, None, true));
        assert!(wait.as_mut().poll(&mut cx).is_pending());
        assert_eq!(monitor.wait_set_len(), 1);
        drop(wait);

        assert_eq!(monitor.wait_set_len(), 0);
        assert_eq!(monitor.waiters(), 0);
        assert!(!monitor.is_busy());
        assert_eq!(runtime.context().arena().in_use(), 0);
    }
}
