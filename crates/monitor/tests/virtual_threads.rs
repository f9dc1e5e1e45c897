use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use vmkit_monitor::{
    mock::{yield_now, CarrierPool},
    objectmodel::HeapObject,
    runtime::options::MonitorOptions,
    MonitorRuntime, Owner, WaitOutcome,
};

const TIMEOUT: Duration = Duration::from_secs(60);

fn runtime() -> Arc<MonitorRuntime> {
    let _ = env_logger::builder().is_test(true).try_init();
    MonitorRuntime::builder()
        .options(MonitorOptions {
            deflation_thread: false,
            ..Default::default()
        })
        .build()
        .unwrap()
}

#[test]
fn virtual_and_native_threads_share_a_monitor() {
    const VIRTUAL: usize = 12;
    const NATIVE: usize = 2;
    const ITERATIONS: usize = 1_000;

    let runtime = runtime();
    let pool = CarrierPool::new(3).unwrap();
    let object = Arc::new(HeapObject::new(AtomicUsize::new(0)));
    let total = Arc::new(AtomicUsize::new(0));

    let tasks = (0..VIRTUAL)
        .map(|_| {
            let runtime = runtime.clone();
            let object = object.clone();
            let total = total.clone();
            pool.spawn_virtual(&runtime.clone(), move |thread| async move {
                for i in 0..ITERATIONS {
                    runtime.enter_virtual(&object, &thread).await.unwrap();
                    assert_eq!(object.fetch_add(1, Ordering::SeqCst), 0);
                    total.fetch_add(1, Ordering::Relaxed);
                    object.fetch_sub(1, Ordering::SeqCst);
                    runtime.exit(&object, &thread);
                    if i % 16 == 0 {
                        yield_now().await;
                    }
                }
            })
        })
        .collect::<Vec<_>>();

    let natives = (0..NATIVE)
        .map(|_| {
            let runtime = runtime.clone();
            let object = object.clone();
            let total = total.clone();
            std::thread::spawn(move || {
                let thread = runtime.attach_current_thread();
                for _ in 0..ITERATIONS {
                    runtime.enter(&object, &thread).unwrap();
                    assert_eq!(object.fetch_add(1, Ordering::SeqCst), 0);
                    total.fetch_add(1, Ordering::Relaxed);
                    object.fetch_sub(1, Ordering::SeqCst);
                    runtime.exit(&object, &thread);
                }
            })
        })
        .collect::<Vec<_>>();

    for task in tasks {
        task.join_timeout(TIMEOUT).expect("virtual thread got stuck");
    }
    for native in natives {
        native.join().unwrap();
    }

    assert_eq!(total.load(Ordering::Relaxed), (VIRTUAL + NATIVE) * ITERATIONS);
    let monitor = runtime.peek_monitor(&object).unwrap();
    assert_eq!(monitor.owner(), Owner::None);
    assert!(!monitor.is_busy());
    assert_eq!(runtime.context().arena().in_use(), 0);
}

#[test]
fn native_notify_all_resumes_virtual_waiters() {
    const WAITERS: usize = 8;

    let runtime = runtime();
    let pool = CarrierPool::new(2).unwrap();
    let object = Arc::new(HeapObject::new(()));
    let main = runtime.attach_current_thread();

    let tasks = (0..WAITERS)
        .map(|_| {
            let runtime = runtime.clone();
            let object = object.clone();
            pool.spawn_virtual(&runtime.clone(), move |thread| async move {
                runtime.enter_virtual(&object, &thread).await.unwrap();
                let outcome = runtime
                    .wait_virtual(&object, &thread, None, true)
                    .await
                    .unwrap();
                assert!(runtime.holds_lock(&object, &thread));
                runtime.exit(&object, &thread);
                outcome
            })
        })
        .collect::<Vec<_>>();

    let monitor = runtime.inflate(&object);
    loop {
        runtime.enter(&object, &main).unwrap();
        if monitor.wait_set_len() == WAITERS {
            break;
        }
        runtime.exit(&object, &main);
        std::thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(runtime.notify_all(&object, &main), WAITERS);
    runtime.exit(&object, &main);

    for task in tasks {
        assert_eq!(
            task.join_timeout(TIMEOUT).expect("virtual waiter got stuck"),
            WaitOutcome::Notified
        );
    }
    assert_eq!(monitor.waiters(), 0);
    assert_eq!(runtime.context().arena().in_use(), 0);
}

#[test]
fn timed_virtual_waits_expire() {
    let runtime = runtime();
    let pool = CarrierPool::new(1).unwrap();

    let tasks = (0..4)
        .map(|_| {
            let runtime = runtime.clone();
            pool.spawn_virtual(&runtime.clone(), move |thread| async move {
                let object = Arc::new(HeapObject::new(()));
                runtime.enter_virtual(&object, &thread).await.unwrap();
                let outcome = runtime
                    .wait_virtual(&object, &thread, Some(Duration::from_millis(20)), true)
                    .await
                    .unwrap();
                runtime.exit(&object, &thread);
                outcome
            })
        })
        .collect::<Vec<_>>();

    for task in tasks {
        assert_eq!(
            task.join_timeout(TIMEOUT).expect("timer never fired"),
            WaitOutcome::TimedOut
        );
    }
}

#[test]
fn dropped_pool_abandons_blocked_virtual_threads() {
    let runtime = runtime();
    let object = Arc::new(HeapObject::new(()));
    let main = runtime.attach_current_thread();
    runtime.enter(&object, &main).unwrap();
    let monitor = runtime.peek_monitor(&object).unwrap();

    {
        let pool = CarrierPool::new(1).unwrap();
        for _ in 0..3 {
            let runtime = runtime.clone();
            let object = object.clone();
            pool.spawn_virtual(&runtime.clone(), move |thread| async move {
                runtime.enter_virtual(&object, &thread).await.unwrap();
                runtime.exit(&object, &thread);
            });
        }
        while monitor.contentions() < 3 {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    // The carriers are gone; the queued futures were dropped with them.
    runtime.exit(&object, &main);
    runtime.enter(&object, &main).unwrap();
    runtime.exit(&object, &main);

    assert_eq!(monitor.contentions(), 0);
    assert!(!monitor.is_busy());
    assert_eq!(runtime.context().arena().in_use(), 0);
}
