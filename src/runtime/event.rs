//! Deferred callbacks and fiber resumptions keyed by a monotonic deadline.
//!
//! The queue is the only runtime structure shared with foreign OS threads.
//! Posting takes the lock, appends an unordered entry and nudges the reactor
//! when it is blocked in its wait call.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use crate::runtime::fiber::{FiberFuture, FiberId};

/// Event identifier. Zero is never issued.
pub type EventId = u64;

pub enum EventAction {
    /// Resume a suspended fiber, handing `value` to its pending yield
    Resume { fiber: FiberId, value: isize },
    /// Poll a fiber again without a value (used by fiber wakers)
    Wake(FiberId),
    /// Build a future on the main context and run it in a new fiber
    Spawn(Box<dyn FnOnce() -> FiberFuture + Send>),
    /// Invoke directly on the main context without a fiber
    Call(Box<dyn FnOnce() + Send>),
    /// Ask the event loop to return
    Stop,
}

impl std::fmt::Debug for EventAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventAction::Resume { fiber, value } => f
                .debug_struct("Resume")
                .field("fiber", fiber)
                .field("value", value)
                .finish(),
            EventAction::Wake(fiber) => f.debug_tuple("Wake").field(fiber).finish(),
            EventAction::Spawn(_) => f.write_str("Spawn"),
            EventAction::Call(_) => f.write_str("Call"),
            EventAction::Stop => f.write_str("Stop"),
        }
    }
}

#[derive(Debug)]
pub struct Event {
    pub id: EventId,
    pub when: Instant,
    pub action: EventAction,
}

#[derive(Debug)]
struct State {
    events: Vec<Event>,
    next_id: EventId,
    /// Bumped on every insert or removal so scanners can detect changes
    generation: u64,
}

#[derive(Debug)]
pub struct EventQueue {
    state: Mutex<State>,
    waker: mio::Waker,
    blocked: AtomicBool,
}

impl EventQueue {
    pub(crate) fn new(waker: mio::Waker) -> Self {
        Self {
            state: Mutex::new(State {
                events: Vec::new(),
                next_id: 1,
                generation: 0,
            }),
            waker,
            blocked: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queues `action` to fire at `when`. Safe to call from any thread.
    pub fn post(&self, when: Instant, action: EventAction) -> EventId {
        let id = {
            let mut state = self.lock();
            let id = alloc_id(&mut state);
            state.events.push(Event { id, when, action });
            state.generation += 1;
            id
        };
        if self.blocked.load(Ordering::Acquire) {
            self.wake();
        }
        id
    }

    /// Removes a pending event. Returns false if it already fired.
    pub fn cancel(&self, id: EventId) -> bool {
        let mut state = self.lock();
        match state.events.iter().position(|e| e.id == id) {
            Some(index) => {
                state.events.swap_remove(index);
                state.generation += 1;
                true
            }
            None => false,
        }
    }

    pub fn lookup(&self, id: EventId) -> bool {
        self.lock().events.iter().any(|e| e.id == id)
    }

    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes and returns every event due at `now`, plus the queue generation
    /// observed after the removal.
    pub(crate) fn take_due(&self, now: Instant) -> (Vec<Event>, u64) {
        let mut state = self.lock();
        let mut due = Vec::new();
        let mut i = 0;
        while i < state.events.len() {
            if state.events[i].when <= now {
                due.push(state.events.swap_remove(i));
            } else {
                i += 1;
            }
        }
        if !due.is_empty() {
            state.generation += 1;
        }
        due.sort_by_key(|e| (e.when, e.id));
        (due, state.generation)
    }

    /// Drops every pending event.
    pub(crate) fn clear(&self) {
        let events = {
            let mut state = self.lock();
            state.generation += 1;
            std::mem::take(&mut state.events)
        };
        drop(events);
    }

    pub(crate) fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Earliest deadline among pending events.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.lock().events.iter().map(|e| e.when).min()
    }

    pub(crate) fn set_blocked(&self, blocked: bool) {
        self.blocked.store(blocked, Ordering::Release);
    }

    /// Nudges the reactor out of its wait call.
    pub fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            tracing::error!(error = %e, "Cannot wake reactor");
        }
    }
}

fn alloc_id(state: &mut State) -> EventId {
    loop {
        let id = state.next_id;
        state.next_id = state.next_id.wrapping_add(1).max(1);
        if !state.events.iter().any(|e| e.id == id) {
            return id;
        }
    }
}
