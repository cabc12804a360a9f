mod common;

use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use modal_monitor::{prelude::*, threading::ThreadState};

#[test]
fn misuse_is_illegal_monitor_state() {
    for scheme in common::all_schemes() {
        let object = Object::new();
        assert_eq!(scheme.monitor_exit(&object), Err(MonitorError::IllegalMonitorState));
        assert_eq!(scheme.monitor_notify(&object), Err(MonitorError::IllegalMonitorState));
        assert_eq!(scheme.monitor_notify_all(&object), Err(MonitorError::IllegalMonitorState));
        assert_eq!(scheme.monitor_wait(&object, 1), Err(MonitorError::IllegalMonitorState));
    }
}

#[test]
fn notify_all_wakes_every_waiter() {
    const WAITERS: usize = 4;
    for scheme in common::all_schemes() {
        let scheme = Arc::new(scheme);
        let object = Object::new();
        let ready = Arc::new(AtomicUsize::new(0));
        let go = Arc::new(AtomicBool::new(false));

        let waiters: Vec<_> = (0..WAITERS)
            .map(|_| {
                let scheme = scheme.clone();
                let object = object.clone();
                let ready = ready.clone();
                let go = go.clone();
                std::thread::spawn(move || {
                    scheme.monitor_enter(&object);
                    ready.fetch_add(1, Ordering::Relaxed);
                    while !go.load(Ordering::Relaxed) {
                        scheme.monitor_wait(&object, 0).unwrap();
                    }
                    assert!(scheme.thread_holds_monitor(&object, &Thread::current()));
                    scheme.monitor_exit(&object).unwrap();
                })
            })
            .collect();

        loop {
            scheme.monitor_enter(&object);
            let all_ready = ready.load(Ordering::Relaxed) == WAITERS;
            if all_ready {
                go.store(true, Ordering::Relaxed);
                scheme.monitor_notify_all(&object).unwrap();
            }
            scheme.monitor_exit(&object).unwrap();
            if all_ready {
                break;
            }
            std::thread::yield_now();
        }
        for waiter in waiters {
            waiter.join().unwrap();
        }
    }
}

#[test]
fn producer_consumer_hand_off() {
    const ITEMS: usize = 200;
    for scheme in common::all_schemes() {
        let scheme = Arc::new(scheme);
        let object = Object::named("queue");
        let slot = Arc::new(AtomicUsize::new(0));

        let consumer = {
            let scheme = scheme.clone();
            let object = object.clone();
            let slot = slot.clone();
            std::thread::spawn(move || {
                let mut sum = 0;
                for _ in 0..ITEMS {
                    scheme.monitor_enter(&object);
                    while slot.load(Ordering::Relaxed) == 0 {
                        scheme.monitor_wait(&object, 0).unwrap();
                    }
                    sum += slot.swap(0, Ordering::Relaxed);
                    scheme.monitor_notify(&object).unwrap();
                    scheme.monitor_exit(&object).unwrap();
                }
                sum
            })
        };

        for item in 1..=ITEMS {
            scheme.monitor_enter(&object);
            while slot.load(Ordering::Relaxed) != 0 {
                scheme.monitor_wait(&object, 0).unwrap();
            }
            slot.store(item, Ordering::Relaxed);
            scheme.monitor_notify(&object).unwrap();
            scheme.monitor_exit(&object).unwrap();
        }
        assert_eq!(consumer.join().unwrap(), ITEMS * (ITEMS + 1) / 2);
    }
}

#[test]
fn timed_wait_returns_with_lock_held() {
    for scheme in common::all_schemes() {
        let object = Object::new();
        scheme.monitor_enter(&object);
        scheme.monitor_enter(&object);
        let start = Instant::now();
        scheme.monitor_wait(&object, 20).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(20));
        scheme.monitor_exit(&object).unwrap();
        assert!(scheme.thread_holds_monitor(&object, &Thread::current()));
        scheme.monitor_exit(&object).unwrap();
        assert!(!scheme.thread_holds_monitor(&object, &Thread::current()));
    }
}

#[test]
fn interrupt_aborts_wait() {
    for scheme in common::all_schemes() {
        let scheme = Arc::new(scheme);
        let object = Object::new();
        let (sender, receiver) = std::sync::mpsc::channel();

        let waiter = {
            let scheme = scheme.clone();
            let object = object.clone();
            std::thread::spawn(move || {
                let thread = Thread::current();
                sender.send(thread.clone()).unwrap();
                scheme.monitor_enter(&object);
                let result = scheme.monitor_wait(&object, 0);
                let holds = scheme.thread_holds_monitor(&object, &thread);
                scheme.monitor_exit(&object).unwrap();
                (result, holds, thread.is_interrupted())
            })
        };

        let thread = receiver.recv().unwrap();
        while thread.get_exec_status() != ThreadState::Waiting {
            std::thread::yield_now();
        }
        thread.interrupt();

        let (result, holds, still_interrupted) = waiter.join().unwrap();
        assert_eq!(result, Err(MonitorError::Interrupted));
        assert!(holds);
        assert!(!still_interrupted);
    }
}

#[test]
fn interrupt_before_wait_fails_fast() {
    for scheme in common::all_schemes() {
        let object = Object::new();
        let me = Thread::current();
        scheme.monitor_enter(&object);
        me.interrupt();
        assert_eq!(scheme.monitor_wait(&object, 0), Err(MonitorError::Interrupted));
        assert!(!me.is_interrupted());
        assert!(scheme.thread_holds_monitor(&object, &me));
        scheme.monitor_exit(&object).unwrap();
    }
}
