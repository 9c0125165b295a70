//! Single-threaded fiber runtime.
//!
//! One OS thread runs the event loop: fire due events, then block in the
//! reactor until a descriptor is ready or the next deadline arrives, then
//! resume the fibers waiting on whatever became ready.
//!
//! ```text
//!   ┌──────────────┐   due events    ┌──────────────┐
//!   │ EventQueue   ├────────────────►│ Fiber table  │
//!   └──────▲───────┘  resume/spawn   └──────▲───────┘
//!          │ post (any thread)              │ resume(mask)
//!   ┌──────┴───────┐                 ┌──────┴───────┐
//!   │RuntimeHandle │                 │   Reactor    │
//!   └──────────────┘                 └──────────────┘
//! ```
//!
//! Only structures reachable from other threads (the event queue and its
//! waker) are locked. Everything else lives behind `Rc`/`RefCell` and is
//! touched exclusively by the runtime thread.

pub mod buf;
pub mod event;
pub mod fiber;
pub mod socket;
pub mod tls;
pub mod wait;

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

pub use buf::Buf;
pub use event::{EventAction, EventId, EventQueue};
pub use fiber::{FiberFuture, FiberId, FiberState, yield_now};
pub use socket::{Listener, Socket};
pub use wait::{WAIT_MODIFIED, WAIT_READ, WAIT_TIMEOUT, WAIT_WRITE, WaitId};

use fiber::FiberTable;
use wait::Reactor;

/// Poll interval while spinning on a fiber lock
const ENTER_SPIN: Duration = Duration::from_millis(5);

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Maximum number of live fibers
    pub max_fibers: usize,
    /// Largest fiber future accepted, in bytes
    pub stack_size: usize,
    /// When false every deadline is ignored (debugging aid)
    pub timeouts_enabled: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_fibers: 10_000,
            stack_size: fiber::FIBER_DEFAULT_STACK,
            timeouts_enabled: true,
        }
    }
}

thread_local! {
    static CONTEXT: RefCell<Option<Runtime>> = const { RefCell::new(None) };
}

struct Inner {
    config: RuntimeConfig,
    fibers: RefCell<FiberTable>,
    reactor: RefCell<Reactor>,
    events: Arc<EventQueue>,
    current: Cell<Option<FiberId>>,
    /// Value handed from `resume` to the pending yield
    resume_value: Cell<Option<isize>>,
    /// Value handed from `yield_now` back to the resumer
    yield_value: Cell<Option<isize>>,
    stopping: Cell<bool>,
}

/// Cheap, clonable reference to the runtime of the current thread.
#[derive(Clone)]
pub struct Runtime {
    inner: Rc<Inner>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("fibers", &self.fiber_count())
            .field("events", &self.inner.events.len())
            .finish()
    }
}

/// Restores the previous thread context when dropped
pub struct EnterGuard {
    prev: Option<Runtime>,
}

impl Drop for EnterGuard {
    fn drop(&mut self) {
        let prev = self.prev.take();
        CONTEXT.with(|c| *c.borrow_mut() = prev);
    }
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        let reactor = Reactor::new()?;
        let events = Arc::new(EventQueue::new(reactor.waker()?));
        Ok(Self {
            inner: Rc::new(Inner {
                fibers: RefCell::new(FiberTable::new(config.max_fibers, config.stack_size)),
                config,
                reactor: RefCell::new(reactor),
                events,
                current: Cell::new(None),
                resume_value: Cell::new(None),
                yield_value: Cell::new(None),
                stopping: Cell::new(false),
            }),
        })
    }

    /// The runtime entered on this thread.
    ///
    /// # Panics
    ///
    /// Panics when called outside a runtime context, like fiber code run
    /// without the event loop.
    pub fn current() -> Runtime {
        match Self::try_current() {
            Some(rt) => rt,
            None => panic!("must be called from the context of a strand runtime"),
        }
    }

    pub fn try_current() -> Option<Runtime> {
        CONTEXT.with(|c| c.borrow().clone())
    }

    /// Makes this runtime the thread's current one until the guard drops.
    pub fn enter(&self) -> EnterGuard {
        let prev = CONTEXT.with(|c| c.borrow_mut().replace(self.clone()));
        EnterGuard { prev }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// Thread-safe handle for posting events from other threads.
    pub fn handle(&self) -> RuntimeHandle {
        RuntimeHandle {
            events: self.inner.events.clone(),
        }
    }

    /// Runs the event loop until [`Runtime::stop`] or a `Stop` event.
    pub fn run(&self) -> Result<()> {
        self.run_until(None)
    }

    /// Runs the event loop until stopped or `deadline` passes.
    pub fn run_until(&self, deadline: Option<Instant>) -> Result<()> {
        let _enter = self.enter();
        self.inner.stopping.set(false);
        tracing::debug!("Event loop started");
        loop {
            let next = self.run_due();
            if self.inner.stopping.get() || deadline.is_some_and(|d| d <= Instant::now()) {
                break;
            }
            let wake = match (next, deadline) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            self.wait(wake)?;
        }
        tracing::debug!("Event loop stopped");
        Ok(())
    }

    pub fn stop(&self) {
        self.inner.stopping.set(true);
        self.inner.events.wake();
    }

    /// Drops every fiber and pending event. Fibers hold runtime references,
    /// so this is what finally releases a runtime that is no longer needed.
    pub fn close(&self) {
        let futures = self.inner.fibers.borrow_mut().drain();
        drop(futures);
        self.inner.events.clear();
    }

    /// Queues an event on this runtime.
    pub fn post(&self, delay: Duration, action: EventAction) -> EventId {
        self.inner.events.post(deadline_after(delay), action)
    }

    /// Queues a plain callback invoked directly on the main context.
    pub fn start_event<F>(&self, delay: Duration, callback: F) -> EventId
    where
        F: FnOnce() + Send + 'static,
    {
        self.post(delay, EventAction::Call(Box::new(callback)))
    }

    pub fn cancel_event(&self, id: EventId) -> bool {
        self.inner.events.cancel(id)
    }

    pub fn lookup_event(&self, id: EventId) -> bool {
        self.inner.events.lookup(id)
    }

    /// Fires every due event and returns the earliest remaining deadline.
    ///
    /// Events posted or cancelled while firing bump the queue generation,
    /// which restarts the scan instead of trusting a stale snapshot. Only
    /// events due at the start of the pass fire, so a callback that reposts
    /// itself without delay cannot starve the reactor.
    pub fn run_due(&self) -> Option<Instant> {
        let now = Instant::now();
        loop {
            let (due, generation) = self.inner.events.take_due(now);
            if due.is_empty() {
                break;
            }
            for event in due {
                self.fire(event.action);
            }
            if self.inner.events.generation() == generation {
                break;
            }
        }
        self.inner.events.next_deadline()
    }

    fn fire(&self, action: EventAction) {
        match action {
            EventAction::Resume { fiber, value } => {
                if let Err(e) = self.step(fiber, Some(value)) {
                    tracing::debug!(%fiber, error = %e, "Cannot resume fiber");
                }
            }
            EventAction::Wake(fiber) => {
                // Wakers may outlive their fiber
                if self.fiber_state(fiber).is_some_and(|s| s != FiberState::Done) {
                    if let Err(e) = self.step(fiber, None) {
                        tracing::debug!(%fiber, error = %e, "Cannot wake fiber");
                    }
                }
            }
            EventAction::Spawn(make) => {
                let future = make();
                if let Err(e) = self.spawn(move |_| future, 0) {
                    tracing::error!(error = %e, "Cannot spawn event fiber");
                }
            }
            EventAction::Call(callback) => callback(),
            EventAction::Stop => self.inner.stopping.set(true),
        }
    }

    /// Suspends the current fiber for `duration`.
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        let fiber = self
            .current_fiber()
            .ok_or(Error::BadState("sleep outside a fiber"))?;
        self.post(duration, EventAction::Resume { fiber, value: 0 });
        yield_now(0).await;
        Ok(())
    }

    /// Acquires a cooperative fiber lock, suspending while another fiber
    /// holds it.
    pub async fn enter_lock(&self, lock: &Cell<bool>, deadline: Option<Instant>) -> Result<()> {
        while lock.get() {
            if self.inner.config.timeouts_enabled && deadline.is_some_and(|d| d <= Instant::now()) {
                return Err(Error::Timeout);
            }
            self.sleep(ENTER_SPIN).await?;
        }
        lock.set(true);
        Ok(())
    }

    pub fn leave_lock(&self, lock: &Cell<bool>) {
        lock.set(false);
    }

    /// Runs a blocking function on a dedicated OS thread. The result comes
    /// back through the event queue, so the calling fiber suspends while the
    /// thread works.
    pub async fn spawn_blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = tokio::sync::oneshot::channel();
        std::thread::Builder::new()
            .name("strand-blocking".to_string())
            .spawn(move || {
                let _ = tx.send(f());
            })?;
        rx.await.map_err(|_| Error::BadState("blocking thread panicked"))
    }

    /// Spawns `future` in a new fiber; errors are logged, not returned.
    pub fn spawn_detached<Fut>(&self, name: &'static str, future: Fut)
    where
        Fut: Future<Output = ()> + 'static,
    {
        if let Err(e) = self.spawn_future(future) {
            tracing::error!(fiber = name, error = %e, "Cannot spawn fiber");
        }
    }
}

/// `delay` from now, capped at a century for delays `Instant` cannot hold.
fn deadline_after(delay: Duration) -> Instant {
    const CENTURY: Duration = Duration::from_secs(100 * 365 * 86400);
    let now = Instant::now();
    now.checked_add(delay)
        .or_else(|| now.checked_add(CENTURY))
        .unwrap_or(now)
}

/// Send + Sync access to a runtime from any thread.
#[derive(Clone, Debug)]
pub struct RuntimeHandle {
    events: Arc<EventQueue>,
}

impl RuntimeHandle {
    pub fn post(&self, delay: Duration, action: EventAction) -> EventId {
        self.events.post(deadline_after(delay), action)
    }

    /// Runs `callback` on the runtime thread.
    pub fn start_event<F>(&self, delay: Duration, callback: F) -> EventId
    where
        F: FnOnce() + Send + 'static,
    {
        self.post(delay, EventAction::Call(Box::new(callback)))
    }

    pub fn cancel(&self, id: EventId) -> bool {
        self.events.cancel(id)
    }

    /// Interrupts a blocked reactor wait without queuing anything.
    pub fn wake(&self) {
        self.events.wake();
    }

    /// Asks the event loop to return.
    pub fn stop(&self) {
        self.post(Duration::ZERO, EventAction::Stop);
        self.events.wake();
    }
}
