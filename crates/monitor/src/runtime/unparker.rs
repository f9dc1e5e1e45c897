//! Dedicated thread that wakes virtual threads.
//!
//! Exiting owners hand the thread to wake over a channel instead of calling
//! into an executor while they still sit in the exit protocol. The same
//! thread fires the timers of timed virtual waits.

use std::{
    cmp::{Ordering as CmpOrdering, Reverse},
    collections::BinaryHeap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::Instant,
};

use flume::RecvTimeoutError;
use log::{debug, trace};
use parking_lot::Mutex;

use crate::{runtime::threads::VirtualThread, sync::MonitorError};

pub(crate) enum UnparkRequest {
    Unpark(Arc<VirtualThread>),
    Timeout {
        thread: Arc<VirtualThread>,
        deadline: Instant,
        seq: u64,
    },
    Shutdown,
}

struct Timer {
    deadline: Instant,
    seq: u64,
    thread: Arc<VirtualThread>,
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for Timer {}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timer {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.thread.id().cmp(&other.thread.id()))
            .then(self.seq.cmp(&other.seq))
    }
}

pub struct VThreadUnparker {
    sender: flume::Sender<UnparkRequest>,
    running: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl VThreadUnparker {
    pub fn start() -> Result<Self, MonitorError> {
        let (sender, receiver) = flume::unbounded();
        let handle = std::thread::Builder::new()
            .name("vthread-unparker".to_string())
            .spawn(move || unparker_loop(receiver))
            .map_err(|source| MonitorError::ThreadSpawn {
                name: "vthread-unparker",
                source,
            })?;

        Ok(Self {
            sender,
            running: AtomicBool::new(true),
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn send(&self, request: UnparkRequest) -> Result<(), MonitorError> {
        if !self.is_running() {
            return Err(MonitorError::UnparkerStopped);
        }
        self.sender
            .send(request)
            .map_err(|_| MonitorError::UnparkerStopped)
    }

    /// Queues `thread` to be woken.
    pub fn unpark(&self, thread: Arc<VirtualThread>) -> Result<(), MonitorError> {
        self.send(UnparkRequest::Unpark(thread.clone()))?;
        // A request that raced with `stop` may never be drained; waking twice
        // is harmless.
        if !self.is_running() {
            thread.clear_on_waiting_list();
            thread.unpark();
        }
        Ok(())
    }

    /// Wakes `thread` at `deadline` unless it has started another wait by
    /// then.
    pub fn schedule_timeout(
        &self,
        thread: Arc<VirtualThread>,
        deadline: Instant,
        seq: u64,
    ) -> Result<(), MonitorError> {
        self.send(UnparkRequest::Timeout {
            thread,
            deadline,
            seq,
        })
    }

    /// Stops the thread after it woke everything still queued.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let _ = self.sender.send(UnparkRequest::Shutdown);

        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for VThreadUnparker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn wake(thread: &VirtualThread) {
    thread.clear_on_waiting_list();
    thread.unpark();
}

fn unparker_loop(receiver: flume::Receiver<UnparkRequest>) {
    let mut timers: BinaryHeap<Reverse<Timer>> = BinaryHeap::new();

    'outer: loop {
        let first = match timers.peek() {
            Some(Reverse(timer)) => match receiver.recv_deadline(timer.deadline) {
                Ok(request) => Some(request),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => break,
            },
            None => match receiver.recv() {
                Ok(request) => Some(request),
                Err(_) => break,
            },
        };

        // Handle everything that queued up while we were asleep in one go.
        for request in first.into_iter().chain(receiver.try_iter()) {
            match request {
                UnparkRequest::Unpark(thread) => {
                    trace!("unparking virtual thread {}", thread.id());
                    wake(&thread);
                }
                UnparkRequest::Timeout {
                    thread,
                    deadline,
                    seq,
                } => timers.push(Reverse(Timer {
                    deadline,
                    seq,
                    thread,
                })),
                UnparkRequest::Shutdown => break 'outer,
            }
        }

        let now = Instant::now();
        while let Some(Reverse(timer)) = timers.peek() {
            if timer.deadline > now {
                break;
            }
            let Some(Reverse(timer)) = timers.pop() else {
                break;
            };
            if timer.thread.wait_seq() == timer.seq {
                trace!("wait of virtual thread {} timed out", timer.thread.id());
                timer.thread.unpark();
            }
        }
    }

    // Nobody may be left blocked on a wake-up that will never come.
    for request in receiver.try_iter() {
        if let UnparkRequest::Unpark(thread) | UnparkRequest::Timeout { thread, .. } = request {
            wake(&thread);
        }
    }
    for Reverse(timer) in timers {
        timer.thread.unpark();
    }
    debug!("vthread-unparker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::threads::OwnerId;
    use std::{
        sync::atomic::AtomicUsize,
        task::{Wake, Waker},
        time::Duration,
    };

    struct Counter(AtomicUsize);

    impl Wake for Counter {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn wait_for(counter: &Counter, value: usize) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while counter.0.load(Ordering::SeqCst) < value {
            assert!(Instant::now() < deadline, "wake-up never arrived");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn unparks_queued_thread() {
        let unparker = VThreadUnparker::start().unwrap();
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let thread = VirtualThread::new(OwnerId::from_raw(3));
        thread.register_waker(&Waker::from(counter.clone()));

        assert!(thread.try_set_on_waiting_list());
        unparker.unpark(thread.clone()).unwrap();
        wait_for(&counter, 1);
        while thread.is_on_waiting_list() {
            std::thread::yield_now();
        }
        unparker.stop();
    }

    #[test]
    fn stale_timer_is_ignored() {
        let unparker = VThreadUnparker::start().unwrap();
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let thread = VirtualThread::new(OwnerId::from_raw(4));
        thread.register_waker(&Waker::from(counter.clone()));

        let stale = thread.next_wait_seq();
        let current = thread.next_wait_seq();
        let soon = Instant::now() + Duration::from_millis(5);
        unparker.schedule_timeout(thread.clone(), soon, stale).unwrap();
        unparker
            .schedule_timeout(thread.clone(), soon + Duration::from_millis(20), current)
            .unwrap();

        wait_for(&counter, 1);
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        unparker.stop();
    }

    #[test]
    fn requests_after_stop_fail() {
        let unparker = VThreadUnparker::start().unwrap();
        unparker.stop();
        assert!(!unparker.is_running());

        let thread = VirtualThread::new(OwnerId::from_raw(5));
        assert!(matches!(
            unparker.unpark(thread.clone()),
            Err(MonitorError::UnparkerStopped)
        ));
        assert!(matches!(
            unparker.schedule_timeout(thread, Instant::now(), 1),
            Err(MonitorError::UnparkerStopped)
        ));
    }

    #[test]
    fn stop_wakes_pending_timers() {
        let unparker = VThreadUnparker::start().unwrap();
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let thread = VirtualThread::new(OwnerId::from_raw(6));
        thread.register_waker(&Waker::from(counter.clone()));

        let seq = thread.next_wait_seq();
        unparker
            .schedule_timeout(thread, Instant::now() + Duration::from_secs(3600), seq)
            .unwrap();
        unparker.stop();
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }
}
