use grading::kernel_test;
use kthreads::{
    Kernel, ThreadBuilder,
    sync::{Condition, Lock, Mutex, WouldBlock},
};
use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

#[kernel_test(seed = 11, timer = 50)]
fn lock_provides_mutual_exclusion(kernel: &Kernel) {
    let lock = Arc::new(Lock::new(kernel));
    let counter = Arc::new(AtomicUsize::new(0));
    let inside = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..5)
        .map(|i| {
            let (k, lock, counter, inside) =
                (kernel.clone(), lock.clone(), counter.clone(), inside.clone());
            ThreadBuilder::new(format!("incrementer {i}")).spawn(kernel, move || {
                for _ in 0..20 {
                    lock.acquire();
                    assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                    let value = counter.load(Ordering::SeqCst);
                    k.yield_now();
                    counter.store(value + 1, Ordering::SeqCst);
                    inside.fetch_sub(1, Ordering::SeqCst);
                    lock.release();
                    k.yield_now();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(counter.load(Ordering::SeqCst), 100);
}

#[kernel_test]
fn lock_ownership_is_per_thread(kernel: &Kernel) {
    let lock = Arc::new(Lock::new(kernel));
    assert!(!lock.is_held_by_current_thread());
    lock.acquire();
    assert!(lock.is_held_by_current_thread());

    let l = lock.clone();
    let bystander = ThreadBuilder::new("bystander")
        .spawn(kernel, move || (l.is_held_by_current_thread(), l.try_acquire()));
    assert_eq!(bystander.join(), Ok((false, false)));

    lock.release();
    assert!(!lock.is_held_by_current_thread());
    assert!(lock.try_acquire());
    lock.release();
}

#[kernel_test]
fn release_hands_the_lock_to_a_waiter(kernel: &Kernel) {
    let lock = Arc::new(Lock::new(kernel));
    lock.acquire();

    let l = lock.clone();
    let waiter = ThreadBuilder::new("waiter").spawn(kernel, move || {
        l.acquire();
        let held = l.is_held_by_current_thread();
        l.release();
        held
    });
    kernel.yield_now();
    assert!(lock.is_held_by_current_thread());
    lock.release();
    assert_eq!(waiter.join(), Ok(true));
}

#[kernel_test]
#[should_panic(expected = "does not hold")]
fn release_by_non_owner_panics(kernel: &Kernel) {
    let lock = Arc::new(Lock::new(kernel));
    lock.acquire();
    let l = lock.clone();
    let thief = ThreadBuilder::new("thief").spawn(kernel, move || l.release());
    let _ = thief.join();
}

#[kernel_test]
#[should_panic(expected = "already holds")]
fn recursive_acquire_panics(kernel: &Kernel) {
    let lock = Lock::new(kernel);
    lock.acquire();
    lock.acquire();
}

#[kernel_test]
fn condition_wake_all_wakes_every_sleeper(kernel: &Kernel) {
    let lock = Arc::new(Lock::new(kernel));
    let cond = Arc::new(Condition::new(&lock));
    let asleep = Arc::new(AtomicUsize::new(0));
    let released = Arc::new(AtomicBool::new(false));

    let sleepers: Vec<_> = (0..5)
        .map(|i| {
            let (lock, cond, asleep, released) =
                (lock.clone(), cond.clone(), asleep.clone(), released.clone());
            ThreadBuilder::new(format!("sleeper {i}")).spawn(kernel, move || {
                lock.acquire();
                asleep.fetch_add(1, Ordering::SeqCst);
                while !released.load(Ordering::SeqCst) {
                    cond.sleep();
                }
                let held = lock.is_held_by_current_thread();
                lock.release();
                held
            })
        })
        .collect();
    while asleep.load(Ordering::SeqCst) < 5 {
        kernel.yield_now();
    }

    let (l, c, r) = (lock.clone(), cond.clone(), released.clone());
    let waker = ThreadBuilder::new("waker").spawn(kernel, move || {
        l.acquire();
        r.store(true, Ordering::SeqCst);
        c.wake_all();
        l.release();
    });
    waker.join().unwrap();
    for sleeper in sleepers {
        assert_eq!(sleeper.join(), Ok(true));
    }
}

#[kernel_test]
fn condition_wake_without_sleepers_is_a_no_op(kernel: &Kernel) {
    let lock = Arc::new(Lock::new(kernel));
    let cond = Condition::new(&lock);
    lock.acquire();
    cond.wake();
    cond.wake_all();
    assert!(lock.is_held_by_current_thread());
    lock.release();
}

struct Tokens {
    asleep: usize,
    tokens: usize,
    woken: usize,
}

/// Sleepers and woken threads so far.
fn snapshot(state: &Mutex<Tokens>) -> (usize, usize) {
    let guard = state.lock();
    let snapshot = (guard.asleep, guard.woken);
    guard.unlock();
    snapshot
}

#[kernel_test(timer = 100000)]
fn condition_wake_readies_one_sleeper(kernel: &Kernel) {
    let state = Arc::new(Mutex::new(
        kernel,
        Tokens {
            asleep: 0,
            tokens: 0,
            woken: 0,
        },
    ));
    let cond = Arc::new(Condition::new(state.raw_lock()));

    let sleepers: Vec<_> = (0..2)
        .map(|i| {
            let (state, cond) = (state.clone(), cond.clone());
            ThreadBuilder::new(format!("sleeper {i}")).spawn(kernel, move || {
                let mut guard = state.lock();
                guard.asleep += 1;
                let mut guard = cond.wait_while(guard, |s| s.tokens == 0);
                guard.tokens -= 1;
                guard.woken += 1;
                guard.unlock();
            })
        })
        .collect();
    while snapshot(&state).0 < 2 {
        kernel.yield_now();
    }

    for round in 1..=2 {
        let mut guard = state.lock();
        guard.tokens += 1;
        cond.wake();
        guard.unlock();
        for _ in 0..3 {
            kernel.yield_now();
        }
        assert_eq!(snapshot(&state).1, round);
    }
    for sleeper in sleepers {
        sleeper.join().unwrap();
    }
}

#[kernel_test]
#[should_panic(expected = "without holding its lock")]
fn condition_sleep_without_lock_panics(kernel: &Kernel) {
    let lock = Arc::new(Lock::new(kernel));
    let cond = Condition::new(&lock);
    cond.sleep();
}

#[kernel_test]
#[should_panic(expected = "without holding its lock")]
fn condition_wake_without_lock_panics(kernel: &Kernel) {
    let lock = Arc::new(Lock::new(kernel));
    let cond = Condition::new(&lock);
    cond.wake();
}

#[kernel_test]
#[should_panic(expected = "foreign mutex")]
fn condition_rejects_foreign_mutex(kernel: &Kernel) {
    let a = Mutex::new(kernel, ());
    let b = Mutex::new(kernel, ());
    let cond = Condition::new(a.raw_lock());
    let guard = cond.wait(b.lock());
    guard.unlock();
}

#[kernel_test(seed = 5, timer = 60)]
fn bounded_buffer(kernel: &Kernel) {
    const CAPACITY: usize = 4;
    let buffer = Arc::new(Mutex::new(kernel, VecDeque::new()));
    let not_full = Arc::new(Condition::new(buffer.raw_lock()));
    let not_empty = Arc::new(Condition::new(buffer.raw_lock()));

    let producers: Vec<_> = (0..2usize)
        .map(|p| {
            let (buffer, not_full, not_empty) = (buffer.clone(), not_full.clone(), not_empty.clone());
            ThreadBuilder::new(format!("producer {p}")).spawn(kernel, move || {
                for i in 0..50 {
                    let guard = buffer.lock();
                    let mut guard = not_full.wait_while(guard, |q| q.len() == CAPACITY);
                    guard.push_back(p * 100 + i);
                    not_empty.wake();
                    guard.unlock();
                }
            })
        })
        .collect();
    let consumers: Vec<_> = (0..2)
        .map(|c| {
            let (buffer, not_full, not_empty) = (buffer.clone(), not_full.clone(), not_empty.clone());
            ThreadBuilder::new(format!("consumer {c}")).spawn(kernel, move || {
                let mut taken = Vec::new();
                for _ in 0..50 {
                    let guard = buffer.lock();
                    let mut guard = not_empty.wait_while(guard, |q| q.is_empty());
                    assert!(guard.len() <= CAPACITY);
                    taken.extend(guard.pop_front());
                    not_full.wake();
                    guard.unlock();
                }
                taken
            })
        })
        .collect();

    for producer in producers {
        producer.join().unwrap();
    }
    let mut taken: Vec<usize> = consumers
        .into_iter()
        .flat_map(|c| c.join().unwrap())
        .collect();
    taken.sort_unstable();
    let expected: Vec<usize> = (0..50).chain(100..150).collect();
    assert_eq!(taken, expected);
}

#[kernel_test]
fn mutex_try_lock_fails_while_held(kernel: &Kernel) {
    let counter = Arc::new(Mutex::new(kernel, 0));
    let guard = counter.lock();

    let c = counter.clone();
    let bystander = ThreadBuilder::new("bystander").spawn(kernel, move || match c.try_lock() {
        Ok(guard) => {
            guard.unlock();
            false
        }
        Err(WouldBlock) => true,
    });
    assert_eq!(bystander.join(), Ok(true));

    guard.unlock();
    let mut guard = counter.try_lock().expect("mutex is free");
    *guard += 1;
    guard.unlock();
    assert_eq!(Arc::try_unwrap(counter).ok().map(Mutex::into_inner), Some(1));
}

#[kernel_test]
#[should_panic(expected = "must be explicitly called")]
fn mutex_guard_must_be_unlocked(kernel: &Kernel) {
    let mutex = Mutex::new(kernel, 0);
    let _guard = mutex.lock();
}
