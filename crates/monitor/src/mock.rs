//! Simple executor for virtual threads, used in tests and the stress tool.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    task::{Context, Poll, Wake, Waker},
    thread::{JoinHandle, Thread},
    time::Duration,
};

use parking_lot::Mutex;

use crate::runtime::{threads::VirtualThread, MonitorRuntime};

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

enum Job {
    Run(Arc<Task>),
    Stop,
}

struct Task {
    future: Mutex<Option<BoxFuture>>,
    queued: AtomicBool,
    queue: flume::Sender<Job>,
}

impl Task {
    fn run(self: &Arc<Self>) {
        self.queued.store(false, Ordering::Release);
        let mut slot = self.future.lock();
        if let Some(future) = slot.as_mut() {
            let waker = Waker::from(self.clone());
            let mut cx = Context::from_waker(&waker);
            if future.as_mut().poll(&mut cx).is_ready() {
                *slot = None;
            }
        }
    }
}

impl Wake for Task {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        if !self.queued.swap(true, Ordering::AcqRel) {
            let _ = self.queue.send(Job::Run(self.clone()));
        }
    }
}

/// A fixed set of carrier threads polling virtual thread futures.
///
/// Dropping the pool drops every future that has not finished, like
/// cancelling the virtual threads.
pub struct CarrierPool {
    queue: flume::Sender<Job>,
    carriers: Vec<JoinHandle<()>>,
    tasks: Mutex<Vec<Weak<Task>>>,
}

impl CarrierPool {
    pub fn new(carriers: usize) -> std::io::Result<Self> {
        let (queue, jobs) = flume::unbounded::<Job>();
        let carriers = (0..carriers.max(1))
            .map(|index| {
                let jobs = jobs.clone();
                std::thread::Builder::new()
                    .name(format!("carrier-{}", index))
                    .spawn(move || {
                        while let Ok(job) = jobs.recv() {
                            match job {
                                Job::Run(task) => task.run(),
                                Job::Stop => break,
                            }
                        }
                    })
            })
            .collect::<std::io::Result<Vec<_>>>()?;

        Ok(Self {
            queue,
            carriers,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn spawn<F, T>(&self, future: F) -> TaskHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (result, receiver) = flume::bounded(1);
        let future = async move {
            let _ = result.send(future.await);
        };

        let task = Arc::new(Task {
            future: Mutex::new(Some(Box::pin(future))),
            queued: AtomicBool::new(true),
            queue: self.queue.clone(),
        });
        {
            let mut tasks = self.tasks.lock();
            tasks.retain(|task| task.strong_count() > 0);
            tasks.push(Arc::downgrade(&task));
        }
        let _ = self.queue.send(Job::Run(task));
        TaskHandle { receiver }
    }

    /// Creates a virtual thread of `runtime` and runs `body` on it.
    pub fn spawn_virtual<F, Fut, T>(&self, runtime: &MonitorRuntime, body: F) -> TaskHandle<T>
    where
        F: FnOnce(Arc<VirtualThread>) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let thread = runtime.new_virtual_thread();
        self.spawn(body(thread))
    }
}

impl Drop for CarrierPool {
    fn drop(&mut self) {
        for _ in 0..self.carriers.len() {
            let _ = self.queue.send(Job::Stop);
        }
        for carrier in self.carriers.drain(..) {
            let _ = carrier.join();
        }

        // Blocked futures are kept alive by their own wakers.
        for task in self.tasks.get_mut().drain(..) {
            if let Some(task) = task.upgrade() {
                let future = task.future.lock().take();
                drop(future);
            }
        }
    }
}

pub struct TaskHandle<T> {
    receiver: flume::Receiver<T>,
}

impl<T> TaskHandle<T> {
    /// Waits for the result. `None` if the task was dropped unfinished.
    pub fn join(self) -> Option<T> {
        self.receiver.recv().ok()
    }

    pub fn join_timeout(&self, timeout: Duration) -> Option<T> {
        self.receiver.recv_timeout(timeout).ok()
    }
}

struct ThreadWaker(Thread);

impl Wake for ThreadWaker {
    fn wake(self: Arc<Self>) {
        self.0.unpark();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.0.unpark();
    }
}

/// Polls `future` to completion on the calling thread.
pub fn block_on<F: Future>(future: F) -> F::Output {
    let mut future = std::pin::pin!(future);
    let waker = Waker::from(Arc::new(ThreadWaker(std::thread::current())));
    let mut cx = Context::from_waker(&waker);
    loop {
        if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
            return output;
        }
        std::thread::park();
    }
}

struct NoopWaker;

impl Wake for NoopWaker {
    fn wake(self: Arc<Self>) {}
}

pub fn noop_waker() -> Waker {
    Waker::from(Arc::new(NoopWaker))
}

/// Gives other virtual threads on the same carrier a chance to run.
pub async fn yield_now() {
    struct YieldNow(bool);

    impl Future for YieldNow {
        type Output = ();

        fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
            if self.0 {
                return Poll::Ready(());
            }
            self.0 = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }

    YieldNow(false).await
}
