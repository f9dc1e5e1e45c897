use std::{
    sync::{
        atomic::{fence, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use log::trace;

use super::{ObjectMonitor, TryLockResult};
use crate::{
    runtime::threads::{NativeThread, OwnerId, Participant, ThreadHandle, VirtualThreadState},
    sync::{contention::ContentionMark, waiter::TState, MonitorError},
};

/// How a wait ended. Exactly one applies; a notification wins over an
/// interrupt, which wins over a timeout.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum WaitOutcome {
    Notified,
    Interrupted,
    TimedOut,
}

impl ObjectMonitor {
    pub(super) fn check_owner(&self, id: OwnerId, operation: &str) {
        if !self.is_owned_by(id) {
            panic!("{} calls {} on {:?} which it does not own", id, operation, self);
        }
    }

    /// Releases the monitor and waits for a notification, an interrupt or the
    /// timeout, then re-acquires it with the saved recursion count.
    ///
    /// A pending interrupt is reported without releasing the monitor. If no
    /// waiter node can be allocated the monitor is still held when the error
    /// is returned.
    pub fn wait(
        &self,
        thread: &Arc<NativeThread>,
        timeout: Option<Duration>,
        interruptible: bool,
    ) -> Result<WaitOutcome, MonitorError> {
        let id = thread.id();
        self.check_owner(id, "wait");

        if interruptible && thread.is_interrupted(true) {
            return Ok(WaitOutcome::Interrupted);
        }

        let deadline = timeout.and_then(|timeout| Instant::now().checked_add(timeout));

        let node = self.arena().allocate(ThreadHandle::Native(thread.clone()))?;
        node.set_is_wait(true);
        node.set_state(TState::Wait);
        thread.park_event().reset();
        // Park event reset must be ordered before the interrupt check below.
        fence(Ordering::SeqCst);

        self.cold.wait_set.lock().add_waiter(self.arena(), node.handle());

        let saved = self.recursions();
        self.cold.waiters.fetch_add(1, Ordering::SeqCst);
        self.contention.recursions.store(0, Ordering::Relaxed);
        self.exit_owner(id);
        debug_assert!(!self.is_owned_by(id));

        let interrupted = interruptible && thread.is_interrupted(false);
        if !interrupted {
            while !node.is_notified() {
                match deadline {
                    Some(deadline) => {
                        if !thread.park_event().park_until(deadline) && Instant::now() >= deadline {
                            break;
                        }
                    }
                    None => thread.park_event().park(),
                }

                if interruptible && thread.is_interrupted(false) {
                    break;
                }
            }
        }

        // The node is in the wait set, on the entry list, or being moved
        // between them by a notifier.
        if node.state() == TState::Wait {
            let mut wait_set = self.cold.wait_set.lock();
            if node.state() == TState::Wait {
                wait_set.dequeue_specific_waiter(self.arena(), node.handle());
                debug_assert!(!node.is_notified());
                node.set_state(TState::Run);
            }
        }

        debug_assert_ne!(node.state(), TState::Wait);
        if self.has_successor(id) {
            self.clear_successor();
        }
        let was_notified = node.is_notified();
        fence(Ordering::SeqCst);

        match node.state() {
            TState::Run => {
                let _mark = ContentionMark::new(self);
                if self.try_lock(id) != TryLockResult::Success && !self.try_spin(id) {
                    self.enter_with_node(thread, &node);
                }
                node.set_state(TState::Run);
            }
            TState::Enter => self.reenter_internal(thread, &node),
            state => unreachable!("waiter in state {:?} after wait", state),
        }
        drop(node);

        debug_assert!(self.is_owned_by(id));
        debug_assert_eq!(self.recursions(), 0);
        self.contention.recursions.store(saved, Ordering::Relaxed);
        self.cold.waiters.fetch_sub(1, Ordering::SeqCst);

        Ok(if was_notified {
            WaitOutcome::Notified
        } else if interruptible && thread.is_interrupted(true) {
            WaitOutcome::Interrupted
        } else {
            WaitOutcome::TimedOut
        })
    }

    /// Moves the longest waiting thread to the entry list. It runs once the
    /// caller releases the monitor.
    pub fn notify<P: Participant + ?Sized>(&self, thread: &P) -> bool {
        let id = thread.owner_id();
        self.check_owner(id, "notify");

        let notified = self.notify_internal(id);
        if notified {
            self.ctx().stats().notifications.fetch_add(1, Ordering::Relaxed);
        }
        notified
    }

    /// Moves every waiting thread to the entry list. Returns how many there
    /// were.
    pub fn notify_all<P: Participant + ?Sized>(&self, thread: &P) -> usize {
        let id = thread.owner_id();
        self.check_owner(id, "notify_all");

        let mut tally = 0;
        while self.notify_internal(id) {
            tally += 1;
        }

        if tally > 0 {
            self.ctx()
                .stats()
                .notifications
                .fetch_add(tally as u64, Ordering::Relaxed);
        }
        tally
    }

    fn notify_internal(&self, id: OwnerId) -> bool {
        let mut wait_set = self.cold.wait_set.lock();
        let Some(handle) = wait_set.dequeue_waiter(self.arena()) else {
            return false;
        };

        let node = self.arena().get(handle);
        debug_assert_eq!(node.state(), TState::Wait);
        debug_assert!(!node.is_notified());
        node.set_notified(id);

        if let Some(ThreadHandle::Virtual(thread)) = node.thread() {
            thread.set_state(VirtualThreadState::Blocked);
        }

        self.add_to_entry_list(handle);
        trace!("{} notified {:?} on {:?}", id, node.owner_id(), self);
        true
    }

    /// Number of threads in the wait set.
    pub fn wait_set_len(&self) -> usize {
        self.cold.wait_set.lock().len(self.arena())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        objectmodel::HeapObject,
        runtime::{options::MonitorOptions, MonitorRuntime},
        sync::Owner,
    };

    fn runtime(capacity: usize) -> Arc<MonitorRuntime> {
        MonitorRuntime::builder()
            .options(MonitorOptions {
                deflation_thread: false,
                waiter_arena_capacity: capacity,
                ..Default::default()
            })
            .build()
            .unwrap()
    }

    #[test]
    fn timed_wait_restores_recursions() {
        let runtime = runtime(16);
        let object = Arc::new(HeapObject::new(()));
        let monitor = runtime.inflate(&object);
        let thread = runtime.attach_current_thread();

        assert!(monitor.enter(&thread).unwrap());
        assert!(monitor.enter(&thread).unwrap());
        let outcome = monitor
            .wait(&thread, Some(Duration::from_millis(20)), true)
            .unwrap();
        assert_eq!(outcome, WaitOutcome::TimedOut);
        assert!(monitor.has_owner(&thread));
        assert_eq!(monitor.recursions(), 1);
        assert_eq!(monitor.waiters(), 0);
        assert_eq!(monitor.wait_set_len(), 0);
        assert_eq!(monitor.complete_exit(&thread), 1);
        assert_eq!(runtime.context().arena().in_use(), 0);
    }

    #[test]
    fn pending_interrupt_keeps_lock() {
        let runtime = runtime(16);
        let object = Arc::new(HeapObject::new(()));
        let monitor = runtime.inflate(&object);
        let thread = runtime.attach_current_thread();

        assert!(monitor.enter(&thread).unwrap());
        thread.interrupt();
        thread.park_event().reset();
        assert_eq!(
            monitor.wait(&thread, None, true).unwrap(),
            WaitOutcome::Interrupted
        );
        assert!(monitor.has_owner(&thread));
        assert!(!thread.is_interrupted(false));
        assert_eq!(monitor.waiters(), 0);
        monitor.exit(&thread);
    }

    #[test]
    fn wait_without_node_keeps_lock() {
        let runtime = runtime(1);
        let object = Arc::new(HeapObject::new(()));
        let monitor = runtime.inflate(&object);
        let thread = runtime.attach_current_thread();

        let hog = runtime
            .context()
            .arena()
            .allocate(ThreadHandle::Native(thread.clone()))
            .unwrap();

        assert!(monitor.enter(&thread).unwrap());
        let result = monitor.wait(&thread, Some(Duration::from_millis(1)), false);
        assert!(matches!(
            result,
            Err(MonitorError::WaiterArenaExhausted { capacity: 1 })
        ));
        assert!(monitor.has_owner(&thread));
        assert_eq!(monitor.waiters(), 0);
        monitor.exit(&thread);
        drop(hog);
    }

    #[test]
    fn notify_without_waiters() {
        let runtime = runtime(16);
        let object = Arc::new(HeapObject::new(()));
        let monitor = runtime.inflate(&object);
        let thread = runtime.attach_current_thread();

        assert!(monitor.enter(&thread).unwrap());
        assert!(!monitor.notify(&thread));
        assert_eq!(monitor.notify_all(&thread), 0);
        monitor.exit(&thread);
        assert_eq!(runtime.stats().notifications, 0);
    }

    #[test]
    #[should_panic(expected = "calls notify")]
    fn notify_requires_ownership() {
        let runtime = runtime(16);
        let object = Arc::new(HeapObject::new(()));
        let monitor = runtime.inflate(&object);
        let thread = runtime.new_native_thread();
        monitor.notify(&thread);
    }

    #[test]
    fn notify_wakes_waiter() {
        let runtime = runtime(16);
        let object = Arc::new(HeapObject::new(()));
        let monitor = runtime.inflate(&object);
        let main = runtime.attach_current_thread();

        let waiter = {
            let runtime = runtime.clone();
            let monitor = monitor.clone();
            std::thread::spawn(move || {
                let thread = runtime.attach_current_thread();
                assert!(monitor.enter(&thread).unwrap());
                let outcome = monitor.wait(&thread, None, true).unwrap();
                assert!(monitor.has_owner(&thread));
                monitor.exit(&thread);
                outcome
            })
        };

        loop {
            assert!(monitor.enter(&main).unwrap());
            if monitor.wait_set_len() == 1 {
                break;
            }
            monitor.exit(&main);
            std::thread::sleep(Duration::from_millis(1));
        }

        assert_eq!(monitor.waiters(), 1);
        assert!(monitor.notify(&main));
        assert!(monitor.has_entry_list());
        monitor.exit(&main);

        assert_eq!(waiter.join().unwrap(), WaitOutcome::Notified);
        assert_eq!(monitor.owner(), Owner::None);
        assert_eq!(monitor.waiters(), 0);
        assert_eq!(runtime.stats().notifications, 1);
        assert_eq!(runtime.context().arena().in_use(), 0);
    }

    #[test]
    fn interrupt_ends_wait() {
        let runtime = runtime(16);
        let object = Arc::new(HeapObject::new(()));
        let monitor = runtime.inflate(&object);
        let (tx, rx) = std::sync::mpsc::channel();

        let waiter = {
            let runtime = runtime.clone();
            let monitor = monitor.clone();
            std::thread::spawn(move || {
                let thread = runtime.attach_current_thread();
                tx.send(thread.clone()).unwrap();
                assert!(monitor.enter(&thread).unwrap());
                let outcome = monitor.wait(&thread, None, true).unwrap();
                monitor.exit(&thread);
                outcome
            })
        };

        let thread = rx.recv().unwrap();
        while monitor.waiters() == 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
        thread.interrupt();

        assert_eq!(waiter.join().unwrap(), WaitOutcome::Interrupted);
        assert!(!thread.is_interrupted(false));
        assert_eq!(monitor.wait_set_len(), 0);
    }
}
