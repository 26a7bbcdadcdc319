use abyss::{
    interrupt::InterruptGuard,
    kprint::{debug_enabled, is_quiet},
};
use grading::{EventKind, Recorder, kernel_test};
use kthreads::{
    DebugFlags, Kernel, KernelConfig, KernelError, Observer, Thread, ThreadBuilder, ThreadStatus,
    sync::SpinLock,
};
use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

#[kernel_test]
fn smoke(kernel: &Kernel) {
    let counter = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..10)
        .map(|i| {
            let counter = counter.clone();
            ThreadBuilder::new(format!("worker {i}")).spawn(kernel, move || {
                counter.fetch_add(1, Ordering::SeqCst);
                i
            })
        })
        .collect();
    for (i, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.join(), Ok(i));
    }
    assert_eq!(counter.load(Ordering::SeqCst), 10);
}

#[kernel_test(timer = 100000)]
fn spawned_thread_waits_for_start(kernel: &Kernel) {
    let ran = Arc::new(AtomicBool::new(false));
    let flag = ran.clone();
    let th = kernel.spawn("lazy", move || flag.store(true, Ordering::SeqCst));
    assert_eq!(th.status(), ThreadStatus::New);

    kernel.yield_now();
    assert!(!ran.load(Ordering::SeqCst));

    kernel.start(&th);
    assert_eq!(th.status(), ThreadStatus::Ready);
    kernel.join(&th).unwrap();
    assert!(ran.load(Ordering::SeqCst));
    assert_eq!(th.status(), ThreadStatus::Finished);
}

#[kernel_test(timer = 100000)]
fn yield_is_round_robin(kernel: &Kernel) {
    let log = Arc::new(SpinLock::new(Vec::new()));
    let handles: Vec<_> = ["a", "b"]
        .into_iter()
        .map(|name| {
            let (log, k) = (log.clone(), kernel.clone());
            ThreadBuilder::new(name).spawn(kernel, move || {
                for i in 0..3 {
                    log.with(|l| l.push(format!("{name}{i}")));
                    k.yield_now();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(
        log.with(|l| l.clone()),
        ["a0", "b0", "a1", "b1", "a2", "b2"]
    );
}

#[kernel_test(timer = 100000)]
fn started_threads_wait_in_the_ready_queue(kernel: &Kernel) {
    let threads: Vec<_> = ["a", "b"]
        .into_iter()
        .map(|name| kernel.spawn(name, || ()))
        .collect();
    assert_eq!(kernel.ready_count(), 0);
    for th in &threads {
        kernel.start(th);
    }
    assert_eq!(kernel.ready_count(), 2);

    // Both run to completion before main gets the processor back.
    kernel.yield_now();
    assert_eq!(kernel.ready_count(), 0);
    assert!(threads.iter().all(|th| th.status() == ThreadStatus::Finished));
}

#[kernel_test]
fn current_thread_is_running(kernel: &Kernel) {
    let main = kernel.current();
    assert_eq!(main.name(), "main");
    assert_eq!(main.status(), ThreadStatus::Running);

    let k = kernel.clone();
    let child = ThreadBuilder::new("child").spawn(kernel, move || {
        let me = k.current();
        (me.name().to_owned(), me.status())
    });
    assert_eq!(
        child.join(),
        Ok(("child".to_owned(), ThreadStatus::Running))
    );
}

#[kernel_test]
fn join_finished_thread_returns_immediately(kernel: &Kernel) {
    let th = kernel.spawn("quick", || {});
    kernel.start(&th);
    kernel.join(&th).unwrap();
    assert_eq!(th.status(), ThreadStatus::Finished);

    let switches = kernel.stats().context_switches;
    assert_eq!(kernel.join(&th), Ok(()));
    assert_eq!(kernel.stats().context_switches, switches);
}

#[kernel_test]
fn join_self_is_a_deadlock(kernel: &Kernel) {
    assert_eq!(kernel.join(&kernel.current()), Err(KernelError::Deadlock));
    assert_eq!(i32::from(KernelError::Deadlock), -35);
}

#[kernel_test]
fn second_joiner_is_rejected(kernel: &Kernel) {
    let gate = Arc::new(AtomicBool::new(false));
    let (g, k) = (gate.clone(), kernel.clone());
    let target = kernel.spawn("target", move || {
        while !g.load(Ordering::SeqCst) {
            k.yield_now();
        }
    });
    kernel.start(&target);

    let (t, k) = (target.clone(), kernel.clone());
    let first = ThreadBuilder::new("first joiner").spawn(kernel, move || k.join(&t));
    // Let the first joiner register itself.
    kernel.yield_now();

    assert_eq!(kernel.join(&target), Err(KernelError::AlreadyJoined));
    gate.store(true, Ordering::SeqCst);
    assert_eq!(first.join(), Ok(Ok(())));
    assert_eq!(target.status(), ThreadStatus::Finished);
}

#[kernel_test]
#[should_panic(expected = "already started")]
fn start_twice_panics(kernel: &Kernel) {
    let th = kernel.spawn("twice", || {});
    kernel.start(&th);
    kernel.start(&th);
}

#[kernel_test]
#[should_panic(expected = "has no action")]
fn start_without_action_panics(kernel: &Kernel) {
    let th = kernel.create("empty");
    kernel.start(&th);
}

#[kernel_test]
#[should_panic(expected = "deadlock")]
fn blocking_forever_is_detected(kernel: &Kernel) {
    let _guard = InterruptGuard::new(kernel.interrupt());
    kernel.block();
}

#[kernel_test]
#[should_panic(expected = "worker gave up")]
fn panic_in_thread_halts_kernel(kernel: &Kernel) {
    let worker = ThreadBuilder::new("worker").spawn(kernel, || panic!("worker gave up"));
    let _ = worker.join();
}

#[test]
fn observer_sees_lifecycle() {
    let recorder = Arc::new(Recorder::default());
    let config = KernelConfig::default()
        .quiet(true)
        .timer_period(100000)
        .observer(recorder.clone());
    Kernel::boot(config, |kernel| {
        ThreadBuilder::new("observed")
            .spawn(kernel, || ())
            .join()
            .unwrap();
    });

    let events: Vec<_> = recorder
        .take()
        .into_iter()
        .filter(|e| e.kind != EventKind::Timer)
        .map(|e| (e.kind, e.thread))
        .collect();
    let expected = [
        (EventKind::Idle, "idle"),
        (EventKind::Ready, "idle"),
        (EventKind::Ready, "observed"),
        (EventKind::Running, "observed"),
        (EventKind::Finishing, "observed"),
        (EventKind::Ready, "main"),
        (EventKind::Running, "main"),
    ]
    .map(|(kind, name)| (kind, name.to_owned()));
    assert_eq!(events, expected);
}

/// Notes whether a watched thread still owns its context at every dispatch.
#[derive(Default)]
struct ContextWatch {
    watched: SpinLock<Option<Arc<Thread>>>,
    notes: SpinLock<Vec<(&'static str, String, bool)>>,
}

impl ContextWatch {
    fn note(&self, event: &'static str, th: &Thread) {
        if let Some(watched) = self.watched.with(|w| w.clone()) {
            let alive = watched.has_context();
            self.notes
                .with(|notes| notes.push((event, th.name().to_owned(), alive)));
        }
    }
}

impl Observer for ContextWatch {
    fn running_thread(&self, th: &Thread, _now: u64) {
        self.note("running", th);
    }

    fn finishing_thread(&self, th: &Thread, _now: u64) {
        self.note("finishing", th);
    }
}

#[test]
fn finished_context_is_torn_down_by_the_next_thread() {
    let watch = Arc::new(ContextWatch::default());
    let config = KernelConfig::default()
        .quiet(true)
        .timer_period(100000)
        .observer(watch.clone());
    let doomed = Kernel::boot(config, |kernel| {
        let doomed = kernel.spawn("doomed", || ());
        assert!(doomed.has_context());
        watch.watched.with(|w| *w = Some(doomed.clone()));
        kernel.start(&doomed);
        kernel.join(&doomed).unwrap();
        watch.watched.with(|w| *w = None);
        doomed
    });

    assert_eq!(doomed.status(), ThreadStatus::Finished);
    assert!(!doomed.has_context());
    // Still alive while finishing, and when main is dispatched after it.
    let notes = watch.notes.with(|notes| notes.clone());
    let expected = [
        ("running", "doomed", true),
        ("finishing", "doomed", true),
        ("running", "main", true),
    ]
    .map(|(event, name, alive)| (event, name.to_owned(), alive));
    assert_eq!(notes, expected);
}

#[test]
fn kernels_are_independent() {
    let runs: Vec<_> = (0..3u64)
        .map(|n| {
            std::thread::spawn(move || {
                let config = KernelConfig::default().quiet(true).random_seed(n);
                Kernel::boot(config, |kernel| {
                    let handles: Vec<_> = (0..5)
                        .map(|i| ThreadBuilder::new(format!("t{i}")).spawn(kernel, move || i * n))
                        .collect();
                    handles.into_iter().map(|h| h.join().unwrap()).sum::<u64>()
                })
            })
        })
        .collect();
    let sums: Vec<u64> = runs.into_iter().map(|r| r.join().unwrap()).collect();
    assert_eq!(sums, [0, 10, 20]);
}

#[test]
fn console_settings_belong_to_each_kernel() {
    let loud = std::thread::spawn(|| {
        Kernel::boot(KernelConfig::default().timer_period(100000), |kernel| {
            ThreadBuilder::new("loud")
                .spawn(kernel, || (is_quiet(), debug_enabled(DebugFlags::all())))
                .join()
                .unwrap()
        })
    });
    let config = KernelConfig::default()
        .quiet(true)
        .timer_period(100000)
        .debug("c");
    let hushed = Kernel::boot(config, |kernel| {
        let mine = (is_quiet(), debug_enabled(DebugFlags::CHANNEL));
        let child = ThreadBuilder::new("hushed")
            .spawn(kernel, || (is_quiet(), debug_enabled(DebugFlags::THREAD)))
            .join()
            .unwrap();
        (mine, child)
    });

    assert_eq!(hushed, ((true, true), (true, false)));
    assert_eq!(loud.join().unwrap(), (false, false));
}
