//! Cooperative fibers.
//!
//! A fiber is a boxed future owned by the scheduler. Its "stack" is the
//! future's state machine, so the stack size limit bounds the size of the
//! future type. Only the main context steps fibers: `resume` called from
//! inside a fiber posts an event and the event loop performs the switch.
//!
//! Values cross the suspend/resume boundary through two slots on the
//! runtime: `yield_now(v)` parks `v` for the resumer, and `resume(f, v)`
//! parks `v` for the pending yield.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};
use std::time::Instant;

use crate::error::{Error, Result};
use crate::runtime::Runtime;
use crate::runtime::event::{EventAction, EventQueue};

pub type FiberFuture = Pin<Box<dyn Future<Output = isize>>>;

type Entry = Box<dyn FnOnce(isize) -> FiberFuture>;

/// Smallest stack (future size) a fiber may be configured with
pub const FIBER_MIN_STACK: usize = 16 * 1024;

/// Default fiber stack (future size) budget
pub const FIBER_DEFAULT_STACK: usize = 64 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId(u64);

impl std::fmt::Display for FiberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "fiber-{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FiberState {
    /// Allocated, never run
    Created,
    /// Scheduled to start from the event loop
    Runnable,
    Running,
    /// Waiting for a resume
    Suspended,
    /// Entry returned; the future has been dropped
    Done,
}

struct Fiber {
    state: FiberState,
    entry: Option<Entry>,
    future: Option<FiberFuture>,
    result: isize,
    /// Owned fibers keep their result until `free`; scheduler fibers are
    /// released as soon as they finish.
    owned: bool,
}

pub(crate) struct FiberTable {
    fibers: HashMap<FiberId, Fiber>,
    next: u64,
    max: usize,
    stack_size: usize,
}

impl FiberTable {
    pub(crate) fn new(max: usize, stack_size: usize) -> Self {
        Self {
            fibers: HashMap::new(),
            next: 1,
            max,
            stack_size: stack_size.max(FIBER_MIN_STACK),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.fibers.len()
    }

    fn insert(&mut self, entry: Entry, frame: usize, owned: bool) -> Result<FiberId> {
        if frame > self.stack_size {
            return Err(Error::StackSize {
                size: frame,
                limit: self.stack_size,
            });
        }
        if self.fibers.len() >= self.max {
            tracing::warn!(limit = self.max, "Fiber limit reached");
            return Err(Error::TooManyFibers(self.max));
        }
        let id = FiberId(self.next);
        self.next += 1;
        self.fibers.insert(
            id,
            Fiber {
                state: FiberState::Created,
                entry: Some(entry),
                future: None,
                result: 0,
                owned,
            },
        );
        Ok(id)
    }

    /// Drops every fiber, returning the futures so the caller can release
    /// them without holding the table borrow.
    pub(crate) fn drain(&mut self) -> Vec<FiberFuture> {
        self.fibers.drain().filter_map(|(_, f)| f.future).collect()
    }
}

enum Start {
    Enter(Entry),
    Resume(FiberFuture),
}

/// Posts a `Wake` event for its fiber. This is how futures that complete on
/// other threads get their fiber stepped again.
struct FiberWaker {
    fiber: FiberId,
    events: Arc<EventQueue>,
}

impl Wake for FiberWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.events
            .post(Instant::now(), EventAction::Wake(self.fiber));
    }
}

impl Runtime {
    /// Allocates a fiber without scheduling it. The caller owns it: the
    /// first `resume` passes the entry argument, and after the fiber
    /// finishes its result stays readable until [`Runtime::free`].
    pub fn alloc<F, Fut>(&self, entry: F) -> Result<FiberId>
    where
        F: FnOnce(isize) -> Fut + 'static,
        Fut: Future<Output = isize> + 'static,
    {
        self.insert_fiber(entry, true)
    }

    /// Allocates a fiber and schedules it to start from the event loop with
    /// `arg`. The fiber is released when its entry returns.
    pub fn spawn<F, Fut>(&self, entry: F, arg: isize) -> Result<FiberId>
    where
        F: FnOnce(isize) -> Fut + 'static,
        Fut: Future<Output = isize> + 'static,
    {
        let id = self.insert_fiber(entry, false)?;
        if let Some(f) = self.inner.fibers.borrow_mut().fibers.get_mut(&id) {
            f.state = FiberState::Runnable;
        }
        self.inner.events.post(
            Instant::now(),
            EventAction::Resume {
                fiber: id,
                value: arg,
            },
        );
        Ok(id)
    }

    /// Spawns a fiber that runs `future` to completion.
    pub fn spawn_future<Fut>(&self, future: Fut) -> Result<FiberId>
    where
        Fut: Future<Output = ()> + 'static,
    {
        self.spawn(
            move |_| async move {
                future.await;
                0
            },
            0,
        )
    }

    fn insert_fiber<F, Fut>(&self, entry: F, owned: bool) -> Result<FiberId>
    where
        F: FnOnce(isize) -> Fut + 'static,
        Fut: Future<Output = isize> + 'static,
    {
        let frame = std::mem::size_of::<Fut>();
        let entry: Entry = Box::new(move |arg| Box::pin(entry(arg)));
        self.inner.fibers.borrow_mut().insert(entry, frame, owned)
    }

    /// Resumes `fiber`, passing `value` to its pending yield (or as the entry
    /// argument on first run). Returns the value of the fiber's next yield,
    /// or its result once it has finished.
    ///
    /// Called from inside a fiber this does not switch: the resume is posted
    /// to the event loop and `Ok(0)` is returned.
    pub fn resume(&self, fiber: FiberId, value: isize) -> Result<isize> {
        if self.inner.current.get().is_some() {
            self.inner.events.post(
                Instant::now(),
                EventAction::Resume { fiber, value },
            );
            return Ok(0);
        }
        self.step(fiber, Some(value))
    }

    /// Frees a finished (or abandoned) owned fiber.
    pub fn free(&self, fiber: FiberId) {
        let removed = self.inner.fibers.borrow_mut().fibers.remove(&fiber);
        drop(removed);
    }

    pub fn fiber_state(&self, fiber: FiberId) -> Option<FiberState> {
        self.inner
            .fibers
            .borrow()
            .fibers
            .get(&fiber)
            .map(|f| f.state)
    }

    pub fn fiber_count(&self) -> usize {
        self.inner.fibers.borrow().len()
    }

    /// Current fiber, or `None` on the main context.
    pub fn current_fiber(&self) -> Option<FiberId> {
        self.inner.current.get()
    }

    pub fn is_main(&self) -> bool {
        self.inner.current.get().is_none()
    }

    /// Polls a fiber once on the main context.
    pub(crate) fn step(&self, fiber: FiberId, mut value: Option<isize>) -> Result<isize> {
        let (start, owned) = {
            let mut table = self.inner.fibers.borrow_mut();
            let f = table
                .fibers
                .get_mut(&fiber)
                .ok_or(Error::BadState("unknown fiber"))?;
            match f.state {
                FiberState::Done => return Ok(f.result),
                FiberState::Running => return Err(Error::BadState("fiber is already running")),
                _ => {}
            }
            let start = match (f.future.take(), f.entry.take()) {
                (Some(future), _) => Start::Resume(future),
                (None, Some(entry)) => Start::Enter(entry),
                (None, None) => return Err(Error::BadState("fiber has no entry")),
            };
            f.state = FiberState::Running;
            (start, f.owned)
        };
        // The first resume's value is the entry argument, not a yield result
        let mut future = match start {
            Start::Resume(future) => future,
            Start::Enter(entry) => entry(value.take().unwrap_or(0)),
        };

        let _enter = self.enter();
        self.inner.resume_value.set(value);
        self.inner.yield_value.set(None);
        let prev = self.inner.current.replace(Some(fiber));
        let waker = Waker::from(Arc::new(FiberWaker {
            fiber,
            events: self.inner.events.clone(),
        }));
        let mut cx = Context::from_waker(&waker);
        let poll = future.as_mut().poll(&mut cx);
        self.inner.current.set(prev);
        self.inner.resume_value.set(None);
        let out = self.inner.yield_value.take();

        match poll {
            Poll::Ready(result) => {
                // Release the fiber's frame before touching the table so
                // destructors may call back into the runtime.
                drop(future);
                let mut table = self.inner.fibers.borrow_mut();
                if owned {
                    if let Some(f) = table.fibers.get_mut(&fiber) {
                        f.state = FiberState::Done;
                        f.result = result;
                    }
                } else {
                    table.fibers.remove(&fiber);
                }
                Ok(result)
            }
            Poll::Pending => {
                let mut table = self.inner.fibers.borrow_mut();
                match table.fibers.get_mut(&fiber) {
                    Some(f) => {
                        f.state = FiberState::Suspended;
                        f.future = Some(future);
                    }
                    None => {
                        // Freed while running
                        drop(table);
                        drop(future);
                    }
                }
                Ok(out.unwrap_or(0))
            }
        }
    }
}

/// Suspends the current fiber, handing `value` to whoever resumed it.
/// Resolves to the value passed to the next `resume`.
pub fn yield_now(value: isize) -> YieldNow {
    YieldNow {
        rt: Runtime::current(),
        value,
        yielded: false,
    }
}

pub struct YieldNow {
    rt: Runtime,
    value: isize,
    yielded: bool,
}

impl Future for YieldNow {
    type Output = isize;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<isize> {
        debug_assert!(!self.rt.is_main(), "yield called on the main context");
        if !self.yielded {
            self.yielded = true;
            self.rt.inner.yield_value.set(Some(self.value));
            return Poll::Pending;
        }
        match self.rt.inner.resume_value.take() {
            Some(value) => Poll::Ready(value),
            None => Poll::Pending,
        }
    }
}
