use std::cell::Cell;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use strand::Error;
use strand::runtime::fiber::FIBER_MIN_STACK;
use strand::runtime::{FiberState, Runtime, RuntimeConfig, yield_now};

fn runtime() -> Runtime {
    Runtime::new(RuntimeConfig::default()).unwrap()
}

fn run_for(rt: &Runtime, limit: Duration) {
    rt.run_until(Some(Instant::now() + limit)).unwrap();
}

#[test]
fn test_fiber_resume_and_yield_exchange_values() {
    let rt = runtime();
    let fiber = rt
        .alloc(|arg| async move {
            let got = yield_now(arg + 1).await;
            got * 2
        })
        .unwrap();

    assert_eq!(rt.fiber_state(fiber), Some(FiberState::Created));
    assert_eq!(rt.resume(fiber, 10).unwrap(), 11);
    assert_eq!(rt.fiber_state(fiber), Some(FiberState::Suspended));

    assert_eq!(rt.resume(fiber, 5).unwrap(), 10);
    assert_eq!(rt.fiber_state(fiber), Some(FiberState::Done));

    // Finished fibers keep answering with their result
    assert_eq!(rt.resume(fiber, 0).unwrap(), 10);

    rt.free(fiber);
    assert_eq!(rt.fiber_state(fiber), None);
    assert_eq!(rt.fiber_count(), 0);
}

#[test]
fn test_fiber_main_context() {
    let rt = runtime();
    assert!(rt.is_main());
    assert_eq!(rt.current_fiber(), None);

    let seen = Rc::new(Cell::new(None));
    let inside = seen.clone();
    let rt2 = rt.clone();
    let fiber = rt
        .alloc(move |_| async move {
            inside.set(rt2.current_fiber());
            0
        })
        .unwrap();
    rt.resume(fiber, 0).unwrap();

    assert_eq!(seen.get(), Some(fiber));
    rt.close();
}

#[test]
fn test_fiber_limit() {
    let rt = Runtime::new(RuntimeConfig {
        max_fibers: 2,
        ..RuntimeConfig::default()
    })
    .unwrap();

    rt.alloc(|_| async { 0 }).unwrap();
    rt.alloc(|_| async { 0 }).unwrap();
    let third = rt.alloc(|_| async { 0 });

    assert!(matches!(third, Err(Error::TooManyFibers(2))));
}

#[test]
fn test_fiber_stack_size_limit() {
    let rt = Runtime::new(RuntimeConfig {
        stack_size: FIBER_MIN_STACK,
        ..RuntimeConfig::default()
    })
    .unwrap();

    let big = [1u8; 2 * FIBER_MIN_STACK];
    let result = rt.alloc(move |_| async move {
        let frame = big;
        yield_now(0).await;
        frame[0] as isize
    });

    assert!(matches!(result, Err(Error::StackSize { .. })));
}

#[test]
fn test_spawned_fiber_runs_from_event_loop() {
    let rt = runtime();
    let result = Rc::new(Cell::new(0));
    let out = result.clone();
    let rt2 = rt.clone();

    rt.spawn(
        move |arg| async move {
            out.set(arg);
            rt2.stop();
            0
        },
        7,
    )
    .unwrap();
    assert_eq!(result.get(), 0);

    run_for(&rt, Duration::from_secs(5));
    assert_eq!(result.get(), 7);
    // Scheduler fibers are released once they finish
    assert_eq!(rt.fiber_count(), 0);
}

#[test]
fn test_sleep_suspends_fiber() {
    let rt = runtime();
    let elapsed = Rc::new(Cell::new(None));
    let out = elapsed.clone();
    let rt2 = rt.clone();

    rt.spawn_future(async move {
        let start = Instant::now();
        rt2.sleep(Duration::from_millis(50)).await.unwrap();
        out.set(Some(start.elapsed()));
        rt2.stop();
    })
    .unwrap();
    run_for(&rt, Duration::from_secs(5));

    let elapsed = elapsed.get().unwrap();
    assert!(elapsed >= Duration::from_millis(50));
}

#[test]
fn test_cross_thread_event_and_stop() {
    let rt = runtime();
    let fired = Arc::new(AtomicBool::new(false));
    let flag = fired.clone();
    let handle = rt.handle();

    let poster = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(20));
        handle.start_event(Duration::ZERO, move || flag.store(true, Ordering::SeqCst));
        handle.stop();
    });

    run_for(&rt, Duration::from_secs(10));
    poster.join().unwrap();

    assert!(fired.load(Ordering::SeqCst));
}

#[test]
fn test_cancelled_event_never_fires() {
    let rt = runtime();
    let fired = Arc::new(AtomicBool::new(false));
    let flag = fired.clone();

    let id = rt.start_event(Duration::from_millis(10), move || flag.store(true, Ordering::SeqCst));
    assert!(rt.lookup_event(id));
    assert!(rt.cancel_event(id));
    assert!(!rt.cancel_event(id));

    run_for(&rt, Duration::from_millis(50));
    assert!(!fired.load(Ordering::SeqCst));
}

#[test]
fn test_run_due_fires_due_events_and_reports_next_deadline() {
    let rt = runtime();
    let fired = Arc::new(AtomicBool::new(false));
    let flag = fired.clone();

    rt.start_event(Duration::ZERO, move || flag.store(true, Ordering::SeqCst));
    let later = rt.start_event(Duration::from_secs(3600), || {});

    let next = rt.run_due().unwrap();

    assert!(fired.load(Ordering::SeqCst));
    assert!(next > Instant::now() + Duration::from_secs(3500));
    assert!(rt.lookup_event(later));
}

#[test]
fn test_spawn_blocking_returns_result_to_fiber() {
    let rt = runtime();
    let result = Rc::new(Cell::new(0));
    let out = result.clone();
    let rt2 = rt.clone();

    rt.spawn_future(async move {
        let value = rt2
            .spawn_blocking(|| {
                std::thread::sleep(Duration::from_millis(10));
                21 * 2
            })
            .await
            .unwrap();
        out.set(value);
        rt2.stop();
    })
    .unwrap();
    run_for(&rt, Duration::from_secs(5));

    assert_eq!(result.get(), 42);
}

#[test]
fn test_enter_lock_serializes_fibers() {
    let rt = runtime();
    let lock = Rc::new(Cell::new(false));
    let order = Rc::new(std::cell::RefCell::new(Vec::new()));

    for name in ["first", "second"] {
        let rt2 = rt.clone();
        let lock = lock.clone();
        let order = order.clone();
        rt.spawn_future(async move {
            rt2.enter_lock(&lock, None).await.unwrap();
            order.borrow_mut().push(format!("{name} in"));
            rt2.sleep(Duration::from_millis(20)).await.unwrap();
            order.borrow_mut().push(format!("{name} out"));
            rt2.leave_lock(&lock);
            if name == "second" {
                rt2.stop();
            }
        })
        .unwrap();
    }
    run_for(&rt, Duration::from_secs(5));

    assert_eq!(
        *order.borrow(),
        vec!["first in", "first out", "second in", "second out"]
    );
}

#[test]
fn test_enter_lock_times_out() {
    let rt = runtime();
    let lock = Rc::new(Cell::new(true));
    let timed_out = Rc::new(Cell::new(false));
    let out = timed_out.clone();
    let rt2 = rt.clone();

    rt.spawn_future(async move {
        let deadline = Some(Instant::now() + Duration::from_millis(20));
        let result = rt2.enter_lock(&lock, deadline).await;
        out.set(matches!(result, Err(Error::Timeout)));
        rt2.stop();
    })
    .unwrap();
    run_for(&rt, Duration::from_secs(5));

    assert!(timed_out.get());
}
