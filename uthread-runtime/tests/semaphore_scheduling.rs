//! Scheduling behaviour of semaphores under real thread contention.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use uthread_runtime::{ErrorKind, Scheduler, Semaphore, SemaphoreError};

fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(1));
    }
}

fn semaphore(count: usize) -> Arc<Semaphore> {
    Arc::new(Semaphore::new(Arc::new(Scheduler::new()), count).unwrap())
}

#[test]
fn test_holders_never_exceed_initial_count() {
    let sem = semaphore(2);
    let inside = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let sem = sem.clone();
            let inside = inside.clone();
            let peak = peak.clone();
            thread::spawn(move || {
                for _ in 0..20 {
                    sem.down().unwrap();
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::yield_now();
                    inside.fetch_sub(1, Ordering::SeqCst);
                    sem.up().unwrap();
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(sem.count().unwrap(), 2);
    assert_eq!(sem.waiters().unwrap(), 0);
}

#[test]
fn test_waiters_wake_in_arrival_order() {
    let sem = semaphore(0);
    let order = Arc::new(Mutex::new(Vec::new()));

    let mut handles = Vec::new();
    for (i, name) in ["A", "B", "C"].into_iter().enumerate() {
        let sem_for_thread = sem.clone();
        let order = order.clone();
        handles.push(thread::spawn(move || {
            sem_for_thread.down().unwrap();
            order.lock().push(name);
        }));
        wait_until(|| sem.waiters().unwrap() == i + 1);
    }

    for woken in 1..=3 {
        sem.up().unwrap();
        wait_until(|| order.lock().len() == woken);
    }

    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(*order.lock(), vec!["A", "B", "C"]);
}

#[test]
fn test_every_up_releases_a_waiter() {
    let sem = semaphore(0);
    let waiters: Vec<_> = (0..4)
        .map(|_| {
            let sem = sem.clone();
            thread::spawn(move || sem.down())
        })
        .collect();

    wait_until(|| sem.waiters().unwrap() == 4);
    for _ in 0..4 {
        sem.up().unwrap();
    }

    for waiter in waiters {
        waiter.join().unwrap().unwrap();
    }
    assert_eq!(sem.count().unwrap(), 0);
    assert_eq!(sem.waiters().unwrap(), 0);
    sem.destroy().unwrap();
}

#[test]
fn test_shared_scheduler_across_semaphores() {
    let scheduler = Arc::new(Scheduler::new());
    let ping = Arc::new(Semaphore::new(scheduler.clone(), 0).unwrap());
    let pong = Arc::new(Semaphore::new(scheduler, 0).unwrap());

    let partner = {
        let ping = ping.clone();
        let pong = pong.clone();
        thread::spawn(move || {
            for _ in 0..50 {
                ping.down().unwrap();
                pong.up().unwrap();
            }
        })
    };

    for _ in 0..50 {
        ping.up().unwrap();
        pong.down().unwrap();
    }
    partner.join().unwrap();

    assert_eq!(ping.count().unwrap(), 0);
    assert_eq!(pong.count().unwrap(), 0);
}

#[test]
fn test_destroyed_semaphore_reports_validation() {
    let sem = semaphore(0);
    sem.destroy().unwrap();
    let err = sem.up().unwrap_err();
    assert_eq!(err, SemaphoreError::Destroyed);
    assert_eq!(err.kind(), ErrorKind::Validation);
}
