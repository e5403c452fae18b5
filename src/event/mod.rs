//! One-shot events and their listener machinery.
//!
//! An [`Event`] is a clonable handle to a shared, reference-counted body.
//! The body fires at most once; firing schedules every listening coroutine
//! (in registration order) and notifies every quorum built on top of it.
//!
//! # Listener model
//!
//! A listener is either a suspended coroutine (stored by task id — a
//! borrow, never an ownership edge, so an event held inside a task's own
//! frame cannot keep that frame alive) or a weak edge to a quorum parent.
//! The weak direction matters: a quorum owns its member events, so the
//! member-to-quorum back edge must not own anything or the pair would form
//! a cycle.
//!
//! # Trigger discipline
//!
//! Notifying a quorum parent can satisfy it, which drops its member
//! handles — possibly the last references to the very body that is
//! triggering. [`EventBody::trigger`] therefore publishes the triggered
//! state and schedules all coroutine listeners *before* dispatching to
//! quorum parents, and holds the parents in a stack-local buffer of strong
//! references for the duration of the dispatch.

pub(crate) mod quorum;

use crate::driver;
use crate::error::ClearingError;
use crate::event::quorum::QuorumState;
use crate::types::TaskId;
use smallvec::SmallVec;
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll};

/// An entity notified when an event fires.
pub(crate) enum Listener {
    /// A suspended coroutine, scheduled onto the ready queue on trigger.
    Coroutine(TaskId),
    /// A quorum built over this event; told to count the trigger.
    Quorum(Weak<EventBody>),
}

/// Shared state behind an [`Event`] handle.
pub(crate) struct EventBody {
    /// `None` once the event has triggered. While live, holds the
    /// listeners in registration order (possibly none).
    listeners: RefCell<Option<SmallVec<[Listener; 3]>>>,
    /// Somewhere in this event's transitive member tree sits an interest
    /// placeholder that has not yet been connected to a concrete task.
    want_interest: Cell<bool>,
    /// Present iff this body was built by `any`/`all`.
    quorum: RefCell<Option<QuorumState>>,
}

impl EventBody {
    pub(crate) fn new() -> Self {
        Self {
            listeners: RefCell::new(Some(SmallVec::new())),
            want_interest: Cell::new(false),
            quorum: RefCell::new(None),
        }
    }

    pub(crate) fn new_quorum(threshold: u32) -> Self {
        Self {
            listeners: RefCell::new(Some(SmallVec::new())),
            want_interest: Cell::new(false),
            quorum: RefCell::new(Some(QuorumState::new(threshold))),
        }
    }

    pub(crate) fn triggered(&self) -> bool {
        self.listeners.borrow().is_none()
    }

    /// No listeners: either never awaited or already triggered. Timers
    /// whose event is empty can be culled without observable effect.
    pub(crate) fn empty(&self) -> bool {
        self.listeners.borrow().as_ref().map_or(true, |l| l.is_empty())
    }

    pub(crate) fn is_quorum(&self) -> bool {
        self.quorum.borrow().is_some()
    }

    pub(crate) fn wants_interest(&self) -> bool {
        self.want_interest.get()
    }

    pub(crate) fn set_wants_interest(&self, value: bool) {
        self.want_interest.set(value);
    }

    pub(crate) fn quorum_state(&self) -> &RefCell<Option<QuorumState>> {
        &self.quorum
    }

    /// Appends a listener. Duplicates are allowed: the same coroutine may
    /// reach one event twice through nested quorums.
    ///
    /// # Panics
    ///
    /// Panics if the event has already triggered.
    pub(crate) fn add_listener(&self, listener: Listener) {
        let mut listeners = self.listeners.borrow_mut();
        listeners
            .as_mut()
            .expect("listener added to a triggered event")
            .push(listener);
    }

    /// Removes every occurrence of a coroutine listener, swap-with-back.
    /// A listener that is not present (or an already-triggered event) is
    /// silently tolerated.
    pub(crate) fn remove_coroutine(&self, id: TaskId) {
        self.retain_listeners(|l| !matches!(l, Listener::Coroutine(t) if *t == id));
    }

    /// Removes every quorum-parent edge pointing at `parent`.
    pub(crate) fn remove_quorum_edge(&self, parent: *const EventBody) {
        self.retain_listeners(|l| {
            !matches!(l, Listener::Quorum(w) if std::ptr::eq(w.as_ptr(), parent))
        });
    }

    fn retain_listeners(&self, keep: impl Fn(&Listener) -> bool) {
        let mut listeners = self.listeners.borrow_mut();
        if let Some(listeners) = listeners.as_mut() {
            let mut i = 0;
            while i < listeners.len() {
                if keep(&listeners[i]) {
                    i += 1;
                } else {
                    listeners.swap_remove(i);
                }
            }
        }
    }

    /// Fires the event. A second call is a no-op.
    pub(crate) fn trigger(&self) {
        // Taking the listener list both publishes the triggered state and
        // makes a repeat call a no-op.
        let Some(listeners) = self.listeners.borrow_mut().take() else {
            return;
        };

        // A quorum detaches from its surviving members first, so that a
        // later member trigger cannot reach back into this body.
        let members = {
            let mut quorum = self.quorum.borrow_mut();
            quorum.as_mut().map(|q| mem::take(&mut q.members))
        };
        if let Some(members) = members {
            let me: *const EventBody = self;
            for member in &members {
                if let Some(body) = member.body() {
                    body.remove_quorum_edge(me);
                }
            }
        }

        // Schedule coroutines in registration order; stage quorum parents
        // in a local buffer. The buffer holds strong references: step four
        // below may drop every other reference to us or to a parent.
        let mut parents: SmallVec<[Rc<EventBody>; 2]> = SmallVec::new();
        for listener in listeners {
            match listener {
                Listener::Coroutine(id) => driver::schedule(id),
                Listener::Quorum(weak) => {
                    if let Some(parent) = weak.upgrade() {
                        parents.push(parent);
                    }
                }
            }
        }

        let me: *const EventBody = self;
        for parent in parents {
            parent.trigger_member(me);
        }
    }
}

impl Drop for EventBody {
    fn drop(&mut self) {
        if !self.empty() {
            // An untriggered body going away with listeners still parked
            // fires so that the listeners unwind instead of leaking. This
            // cascade is what `clear()` rides.
            self.trigger();
        } else if let Some(quorum) = self.quorum.get_mut().as_mut() {
            // An unobserved quorum still detaches from its members.
            let members = mem::take(&mut quorum.members);
            let me: *const EventBody = self;
            for member in &members {
                if let Some(body) = member.body() {
                    body.remove_quorum_edge(me);
                }
            }
        }
    }
}

/// A one-shot signal.
///
/// Handles are cheap to clone and share one underlying body. The *null*
/// handle ([`Event::null`]) has no body at all: it reports itself
/// triggered and every operation on it is a no-op — it is the natural
/// result of combinators whose condition is already satisfied.
///
/// Once an event has triggered it stays triggered; waiting on it completes
/// immediately.
pub struct Event {
    body: Option<Rc<EventBody>>,
}

impl Event {
    /// Creates a fresh, untriggered event.
    #[must_use]
    pub fn new() -> Self {
        Self {
            body: Some(Rc::new(EventBody::new())),
        }
    }

    /// The no-op handle: no body, reports itself triggered.
    #[must_use]
    pub const fn null() -> Self {
        Self { body: None }
    }

    pub(crate) fn from_body(body: Rc<EventBody>) -> Self {
        Self { body: Some(body) }
    }

    pub(crate) fn body(&self) -> Option<&Rc<EventBody>> {
        self.body.as_ref()
    }

    /// Fires the event, scheduling its listeners. Triggering an event
    /// twice is a no-op the second time.
    pub fn trigger(&self) {
        if let Some(body) = &self.body {
            body.trigger();
        }
    }

    /// Whether the event has fired. Monotone: once true, true forever.
    #[must_use]
    pub fn triggered(&self) -> bool {
        self.body.as_ref().map_or(true, |b| b.triggered())
    }

    /// Whether nobody is listening (also true once triggered).
    #[must_use]
    pub fn empty(&self) -> bool {
        self.body.as_ref().map_or(true, |b| b.empty())
    }

    /// Awaits the event.
    ///
    /// Completes immediately if the event has already triggered. Yields
    /// `Err(ClearingError)` when the coroutine is resumed while the driver
    /// is clearing.
    #[must_use]
    pub fn wait(&self) -> WaitEvent {
        WaitEvent {
            event: self.clone(),
            registered: None,
        }
    }
}

impl Clone for Event {
    fn clone(&self) -> Self {
        Self {
            body: self.body.clone(),
        }
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.body {
            None => write!(f, "Event(null)"),
            Some(body) => f
                .debug_struct("Event")
                .field("triggered", &body.triggered())
                .field("empty", &body.empty())
                .finish(),
        }
    }
}

/// Future returned by [`Event::wait`].
///
/// Registers the awaiting coroutine as a listener on first poll and
/// deregisters it if dropped before the event fires, so an abandoned wait
/// (a lost `attempt` race, say) leaves nothing behind.
pub struct WaitEvent {
    event: Event,
    registered: Option<TaskId>,
}

impl Future for WaitEvent {
    type Output = Result<(), ClearingError>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.registered.is_some() {
            if this.event.triggered() {
                this.registered = None;
                return Poll::Ready(resumption_result());
            }
            // Woken for some other reason; the listener entry is still in
            // place.
            return Poll::Pending;
        }
        if this.event.triggered() {
            return Poll::Ready(resumption_result());
        }

        let body = Rc::clone(this.event.body().expect("untriggered event has a body"));
        if body.wants_interest() {
            // We are about to park on this event, so any interest
            // placeholder below it now has a concrete waiter to bind to.
            // Binding it may fire the event out from under us.
            let ievent = driver::with_current_core(super::task::PromiseCore::make_interest);
            quorum::fix_want_interest(&body, &ievent);
            if this.event.triggered() {
                return Poll::Ready(resumption_result());
            }
        }

        let id = driver::current();
        body.add_listener(Listener::Coroutine(id));
        this.registered = Some(id);
        Poll::Pending
    }
}

impl Drop for WaitEvent {
    fn drop(&mut self) {
        if let Some(id) = self.registered {
            if let Some(body) = self.event.body() {
                body.remove_coroutine(id);
            }
        }
    }
}

fn resumption_result() -> Result<(), ClearingError> {
    if driver::is_clearing() {
        Err(ClearingError)
    } else {
        Ok(())
    }
}
