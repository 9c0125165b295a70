//! Readiness multiplexer.
//!
//! Wraps a `mio::Poll` (epoll or kqueue, edge triggered) and maps each
//! registered descriptor to a [`WaitHandle`]: its interest mask, an optional
//! deadline and whoever is waiting on it. The runtime calls
//! [`Reactor::poll`] as the only blocking call on the thread, then dispatches
//! the returned ready list.

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

use crate::error::{Error, Result};
use crate::runtime::Runtime;
use crate::runtime::fiber::{FiberFuture, FiberId, yield_now};

pub const WAIT_READ: u32 = 0x1;
pub const WAIT_WRITE: u32 = 0x2;
/// File modification interest; folded into readability
pub const WAIT_MODIFIED: u32 = 0x4;
/// Set in a dispatched mask when the handle's deadline expired
pub const WAIT_TIMEOUT: u32 = 0x8;

/// Token reserved for the cross-thread waker
pub(crate) const WAKE_TOKEN: Token = Token(0);

const EVENTS_CAPACITY: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WaitId(usize);

/// Invoked in a fresh fiber each time a handler-owned descriptor is ready
pub type WaitHandler = Rc<dyn Fn(u32) -> FiberFuture>;

#[derive(Clone)]
pub(crate) enum Waiter {
    None,
    Fiber(FiberId),
    Handler(WaitHandler),
}

struct WaitHandle {
    fd: RawFd,
    mask: u32,
    deadline: Option<Instant>,
    waiter: Waiter,
    registered: bool,
}

impl WaitHandle {
    fn waiting(&self) -> bool {
        !matches!(self.waiter, Waiter::None)
    }
}

pub(crate) struct Reactor {
    poll: Poll,
    events: Events,
    handles: HashMap<usize, WaitHandle>,
    next: usize,
}

impl Reactor {
    pub(crate) fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(EVENTS_CAPACITY),
            handles: HashMap::new(),
            next: 1,
        })
    }

    pub(crate) fn waker(&self) -> io::Result<mio::Waker> {
        mio::Waker::new(self.poll.registry(), WAKE_TOKEN)
    }

    pub(crate) fn add(&mut self, fd: RawFd) -> WaitId {
        let id = self.next;
        self.next += 1;
        self.handles.insert(
            id,
            WaitHandle {
                fd,
                mask: 0,
                deadline: None,
                waiter: Waiter::None,
                registered: false,
            },
        );
        WaitId(id)
    }

    pub(crate) fn remove(&mut self, id: WaitId) {
        if let Some(handle) = self.handles.remove(&id.0) {
            if handle.registered {
                let _ = self.poll.registry().deregister(&mut SourceFd(&handle.fd));
            }
        }
    }

    /// Replaces the interest set of a handle. A zero mask deregisters it.
    pub(crate) fn set_mask(
        &mut self,
        id: WaitId,
        mask: u32,
        deadline: Option<Instant>,
        waiter: Waiter,
    ) -> io::Result<()> {
        let handle = self
            .handles
            .get_mut(&id.0)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "unknown wait handle"))?;
        let registry = self.poll.registry();

        let mask = if mask & WAIT_MODIFIED != 0 {
            (mask & !WAIT_MODIFIED) | WAIT_READ
        } else {
            mask
        };
        let interest = match (mask & WAIT_READ != 0, mask & WAIT_WRITE != 0) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        };

        match interest {
            None => {
                if handle.registered {
                    registry.deregister(&mut SourceFd(&handle.fd))?;
                    handle.registered = false;
                }
                handle.mask = 0;
                handle.deadline = None;
                handle.waiter = Waiter::None;
            }
            Some(interest) => {
                // Re-arming on every wait makes the edge-triggered backend
                // report readiness that is already present.
                if handle.registered {
                    registry.reregister(&mut SourceFd(&handle.fd), Token(id.0), interest)?;
                } else {
                    registry.register(&mut SourceFd(&handle.fd), Token(id.0), interest)?;
                    handle.registered = true;
                }
                handle.mask = mask;
                handle.deadline = deadline;
                handle.waiter = waiter;
            }
        }
        Ok(())
    }

    /// Detaches the waiter for dispatch. Handler waiters stay registered.
    pub(crate) fn take_waiter(&mut self, id: WaitId) -> Option<Waiter> {
        let handle = self.handles.get_mut(&id.0)?;
        match &handle.waiter {
            Waiter::None => None,
            Waiter::Handler(h) => Some(Waiter::Handler(h.clone())),
            Waiter::Fiber(_) => {
                handle.deadline = None;
                Some(std::mem::replace(&mut handle.waiter, Waiter::None))
            }
        }
    }

    pub(crate) fn clear_waiter(&mut self, id: WaitId) {
        if let Some(handle) = self.handles.get_mut(&id.0) {
            if matches!(handle.waiter, Waiter::Fiber(_)) {
                handle.waiter = Waiter::None;
                handle.deadline = None;
            }
        }
    }

    /// Earliest deadline among handles with a waiter.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.handles
            .values()
            .filter(|h| h.waiting())
            .filter_map(|h| h.deadline)
            .min()
    }

    /// Blocks until a descriptor is ready, a handle deadline passes or
    /// `deadline` is reached. Returns `(handle, mask)` pairs to dispatch.
    pub(crate) fn poll(&mut self, deadline: Option<Instant>) -> io::Result<Vec<(WaitId, u32)>> {
        let deadline = match (deadline, self.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let timeout = deadline.map(|d| d.saturating_duration_since(Instant::now()));

        match self.poll.poll(&mut self.events, timeout.map(round_up)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }

        let mut ready = Vec::new();
        for event in self.events.iter() {
            if event.token() == WAKE_TOKEN {
                continue;
            }
            let mut mask = 0;
            if event.is_readable() || event.is_read_closed() || event.is_error() {
                mask |= WAIT_READ;
            }
            if event.is_writable() || event.is_write_closed() || event.is_error() {
                mask |= WAIT_WRITE;
            }
            let id = event.token().0;
            if let Some(handle) = self.handles.get(&id) {
                let mask = mask & handle.mask;
                if mask != 0 && handle.waiting() {
                    ready.push((WaitId(id), mask));
                }
            }
        }

        let now = Instant::now();
        for (id, handle) in &self.handles {
            if handle.waiting()
                && handle.deadline.is_some_and(|d| d <= now)
                && !ready.iter().any(|(r, _)| r.0 == *id)
            {
                ready.push((WaitId(*id), WAIT_TIMEOUT));
            }
        }
        Ok(ready)
    }
}

/// Sub-millisecond timeouts would otherwise spin on the backend's rounding
fn round_up(timeout: Duration) -> Duration {
    if timeout.is_zero() || timeout.subsec_nanos() % 1_000_000 == 0 {
        timeout
    } else {
        Duration::from_millis(timeout.as_millis() as u64 + 1)
    }
}

impl Runtime {
    /// Registers a descriptor with the reactor.
    pub fn add_wait(&self, fd: RawFd) -> WaitId {
        self.inner.reactor.borrow_mut().add(fd)
    }

    /// Deregisters and forgets a descriptor.
    pub fn remove_wait(&self, id: WaitId) {
        self.inner.reactor.borrow_mut().remove(id);
    }

    /// Installs a persistent handler: each time the descriptor is ready the
    /// handler runs in a new fiber.
    pub fn set_wait_handler(&self, id: WaitId, mask: u32, handler: WaitHandler) -> Result<()> {
        self.inner
            .reactor
            .borrow_mut()
            .set_mask(id, mask, None, Waiter::Handler(handler))?;
        Ok(())
    }

    /// Replaces the interest of a handle without a waiter. Zero deregisters.
    pub fn set_wait_mask(&self, id: WaitId, mask: u32) -> Result<()> {
        self.inner
            .reactor
            .borrow_mut()
            .set_mask(id, mask, None, Waiter::None)?;
        Ok(())
    }

    /// Suspends the current fiber until the descriptor is ready for `mask`.
    /// Returns the ready mask, or [`Error::Timeout`] once `deadline` passes.
    pub async fn wait_for_io(&self, id: WaitId, mask: u32, deadline: Option<Instant>) -> Result<u32> {
        let fiber = self
            .current_fiber()
            .ok_or(Error::BadState("wait_for_io outside a fiber"))?;
        let deadline = if self.inner.config.timeouts_enabled {
            deadline
        } else {
            None
        };
        if deadline.is_some_and(|d| d <= Instant::now()) {
            return Err(Error::Timeout);
        }
        self.inner
            .reactor
            .borrow_mut()
            .set_mask(id, mask, deadline, Waiter::Fiber(fiber))?;

        let ready = yield_now(0).await;
        self.inner.reactor.borrow_mut().clear_waiter(id);
        match ready {
            0 => Err(Error::Timeout),
            ready => Ok(ready as u32),
        }
    }

    /// Waits for the reactor and dispatches everything that became ready.
    pub(crate) fn wait(&self, deadline: Option<Instant>) -> Result<usize> {
        self.inner.events.set_blocked(true);
        // Read the event deadline only after advertising the block so a
        // concurrent post either lands here or wakes the poll.
        let deadline = match (deadline, self.inner.events.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let ready = self.inner.reactor.borrow_mut().poll(deadline);
        self.inner.events.set_blocked(false);
        let ready = ready?;

        let count = ready.len();
        for (id, mask) in ready {
            // An earlier dispatch in this batch may have closed the handle
            let waiter = match self.inner.reactor.borrow_mut().take_waiter(id) {
                Some(waiter) => waiter,
                None => continue,
            };
            match waiter {
                Waiter::Fiber(fiber) => {
                    let value = (mask & !WAIT_TIMEOUT) as isize;
                    if let Err(e) = self.step(fiber, Some(value)) {
                        tracing::debug!(%fiber, error = %e, "Cannot resume waiting fiber");
                    }
                }
                Waiter::Handler(handler) => {
                    if let Err(e) = self.spawn(move |_| handler(mask), mask as isize) {
                        tracing::error!(error = %e, "Cannot spawn fiber for ready handle");
                    }
                }
                Waiter::None => {}
            }
        }
        Ok(count)
    }
}
