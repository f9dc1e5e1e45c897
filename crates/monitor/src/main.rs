use std::{
    error::Error,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use log::info;
use vmkit_monitor::{
    define_flag,
    mock::{yield_now, CarrierPool},
    objectmodel::HeapObject,
    runtime::{options::MonitorFlags, MonitorRuntime, MonitorRuntimeBuilder},
    utils::flags::{parse_with_prefix, FlagsOf},
};

struct StressFlags;

define_flag!(StressFlags => usize, threads, "t", 4, "Number of native threads. (default 4)");
define_flag!(StressFlags => usize, virtual_threads, "v", 16, "Number of virtual threads. (default 16)");
define_flag!(StressFlags => usize, carriers, 2, "Carrier threads polling virtual threads. (default 2)");
define_flag!(StressFlags => usize, iterations, "n", 10_000, "Lock acquisitions per thread. (default 10000)");
define_flag!(StressFlags => usize, objects, 4, "Number of objects contended for. (default 4)");
define_flag!(StressFlags => usize, notify_every, 0, "Wait and notify every this many acquisitions, 0 disables. (default 0)");
define_flag!(StressFlags => bool, help, "h", false, "Print the flags and exit.");

type Object = HeapObject<AtomicUsize>;

/// Runs while holding the object's monitor.
fn critical_section(object: &Object, total: &AtomicUsize) {
    let inside = object.fetch_add(1, Ordering::SeqCst);
    assert_eq!(inside, 0, "two owners inside one monitor");
    total.fetch_add(1, Ordering::Relaxed);
    object.fetch_sub(1, Ordering::SeqCst);
}

fn run_native(
    runtime: &Arc<MonitorRuntime>,
    objects: &Arc<Vec<Arc<Object>>>,
    total: &Arc<AtomicUsize>,
) -> Result<(), Box<dyn Error>> {
    let iterations = stressflags_iterations();
    let notify_every = stressflags_notify_every();

    let workers = (0..stressflags_threads())
        .map(|index| {
            let runtime = runtime.clone();
            let objects = objects.clone();
            let total = total.clone();
            std::thread::Builder::new()
                .name(format!("stress-{}", index))
                .spawn(move || {
                    let thread = runtime.attach_current_thread();
                    for i in 0..iterations {
                        let object = &objects[(index + i) % objects.len()];
                        runtime.enter(object, &thread)?;
                        critical_section(object, &total);
                        if notify_every != 0 && i % notify_every == 0 {
                            runtime.notify_all(object, &thread);
                            runtime.wait(object, &thread, Some(Duration::from_millis(1)), false)?;
                        }
                        runtime.exit(object, &thread);
                    }
                    runtime.detach_current_thread();
                    Ok::<_, vmkit_monitor::sync::MonitorError>(())
                })
        })
        .collect::<Result<Vec<_>, _>>()?;

    for worker in workers {
        match worker.join() {
            Ok(result) => result?,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
    Ok(())
}

fn run_virtual(
    runtime: &Arc<MonitorRuntime>,
    objects: &Arc<Vec<Arc<Object>>>,
    total: &Arc<AtomicUsize>,
) -> Result<(), Box<dyn Error>> {
    let iterations = stressflags_iterations();
    let notify_every = stressflags_notify_every();
    let pool = CarrierPool::new(stressflags_carriers())?;

    let tasks = (0..stressflags_virtual_threads())
        .map(|index| {
            let runtime = runtime.clone();
            let objects = objects.clone();
            let total = total.clone();
            pool.spawn_virtual(&runtime.clone(), move |thread| async move {
                for i in 0..iterations {
                    let object = &objects[(index + i) % objects.len()];
                    runtime.enter_virtual(object, &thread).await?;
                    critical_section(object, &total);
                    if notify_every != 0 && i % notify_every == 0 {
                        runtime.notify_all(object, &thread);
                        runtime
                            .wait_virtual(object, &thread, Some(Duration::from_millis(1)), false)
                            .await?;
                    }
                    runtime.exit(object, &thread);
                    if i % 64 == 0 {
                        yield_now().await;
                    }
                }
                Ok::<_, vmkit_monitor::sync::MonitorError>(())
            })
        })
        .collect::<Vec<_>>();

    for task in tasks {
        task.join().ok_or("virtual thread was dropped unfinished")??;
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    parse_with_prefix::<MonitorFlags>("monitor", std::env::args(), std::env::vars())?;
    parse_with_prefix::<StressFlags>("stress", std::env::args(), std::env::vars())?;

    if stressflags_help() {
        println!("Monitor options:");
        print!("{}", FlagsOf::<MonitorFlags>::describe(Some("monitor")));
        println!("Stress options:");
        print!("{}", FlagsOf::<StressFlags>::describe(Some("stress")));
        return Ok(());
    }

    let runtime = MonitorRuntimeBuilder::new().from_options()?.build()?;
    let objects = Arc::new(
        (0..stressflags_objects().max(1))
            .map(|_| Arc::new(HeapObject::new(AtomicUsize::new(0))))
            .collect::<Vec<_>>(),
    );
    let total = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();

    run_native(&runtime, &objects, &total)?;
    info!("native threads done after {:?}", start.elapsed());
    run_virtual(&runtime, &objects, &total)?;
    info!("virtual threads done after {:?}", start.elapsed());

    let expected =
        (stressflags_threads() + stressflags_virtual_threads()) * stressflags_iterations();
    let acquired = total.load(Ordering::Relaxed);
    let report = runtime.deflate_idle_monitors();
    let stats = runtime.stats();

    println!("acquisitions: {} of {}", acquired, expected);
    println!("elapsed: {:?}", start.elapsed());
    println!("{:#?}", stats);
    println!(
        "deflated {} monitors, {} in use, at most {}",
        report.deflated,
        report.in_use,
        runtime.in_use_list().max()
    );
    runtime.shutdown();

    if acquired != expected {
        return Err(format!("lost {} acquisitions", expected - acquired).into());
    }
    Ok(())
}
