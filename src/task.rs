//! Tasks: eagerly-started, single-owner coroutines.
//!
//! [`spawn`] wraps a future into a task and runs it immediately, up to its
//! first unsatisfied await. The returned [`Task`] handle owns the frame:
//! dropping it aborts the coroutine, [`Task::detach`] lets the coroutine
//! run unowned (its frame is reclaimed when it finishes), and awaiting the
//! handle yields the coroutine's result.
//!
//! A task body has output type `Result<T, ClearingError>`: awaits inside
//! it surface [`ClearingError`](crate::ClearingError) when the driver is
//! clearing, and propagating that with `?` is what unwinds the frame.
//!
//! # Interest
//!
//! A task can defer its real work until someone actually wants the result:
//! start with [`interest`]`().await` and the body parks until the task is
//! awaited or [`Task::start`]ed. The interest event is created lazily; a
//! `start()` that arrives before anything asked for the event is recorded
//! so that a later `interest().await` does not suspend at all.

use crate::driver;
use crate::error::ClearingError;
use crate::event::{Event, WaitEvent};
use crate::types::TaskId;
use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};
use tracing::trace;

/// The untyped per-task promise state, shared between the task handle and
/// the driver's task table.
pub(crate) struct PromiseCore {
    /// The coroutine has reached its end (result available).
    pub(crate) done: bool,
    /// At most one coroutine waiting for the result.
    pub(crate) continuation: Option<TaskId>,
    /// Fires when the task finishes; created on demand.
    pub(crate) completion: Option<Event>,
    pub(crate) interest: InterestState,
}

/// Lazily-created interest signal, with a record of early `start()`s.
pub(crate) enum InterestState {
    /// Nobody has asked for the event and nobody has started the task.
    Unrequested,
    /// `start()` arrived before the event existed: interest is
    /// pre-satisfied, so the event materialises as the null handle.
    Expressed,
    /// The event exists (and fires on `start()` or first await).
    Created(Event),
}

impl PromiseCore {
    pub(crate) fn new() -> Self {
        Self {
            done: false,
            continuation: None,
            completion: None,
            interest: InterestState::Unrequested,
        }
    }

    /// The task's interest event, created on demand.
    pub(crate) fn make_interest(&mut self) -> Event {
        match &self.interest {
            InterestState::Expressed => Event::null(),
            InterestState::Created(ev) => ev.clone(),
            InterestState::Unrequested => {
                let ev = Event::new();
                self.interest = InterestState::Created(ev.clone());
                ev
            }
        }
    }
}

/// Spawns `body` as a task and runs it to its first unsatisfied await.
///
/// The returned handle owns the coroutine; see [`Task`].
pub fn spawn<T, F>(body: F) -> Task<T>
where
    T: 'static,
    F: Future<Output = Result<T, ClearingError>> + 'static,
{
    let id = driver::next_task_id();
    let core = Rc::new(RefCell::new(PromiseCore::new()));
    let result: Rc<RefCell<Option<Result<T, ClearingError>>>> = Rc::new(RefCell::new(None));

    let slot = Rc::clone(&result);
    let frame = Box::pin(async move {
        *slot.borrow_mut() = Some(body.await);
    });
    trace!(task = %id, "spawn");
    driver::insert_task(id, Rc::clone(&core), frame);
    driver::resume(id);

    Task {
        id,
        core,
        result,
        owned: true,
    }
}

/// An owning, move-only handle to a spawned coroutine.
///
/// Awaiting the handle (it implements [`Future`]) parks the caller until
/// the task finishes and then yields its result; the finished task hands
/// control to its awaiter directly, in the same scheduler step. Only one
/// coroutine may await a given task — use [`Task::completion`] plus
/// [`any`](crate::any) when several parties care.
pub struct Task<T> {
    id: TaskId,
    core: Rc<RefCell<PromiseCore>>,
    result: Rc<RefCell<Option<Result<T, ClearingError>>>>,
    owned: bool,
}

impl<T> Task<T> {
    /// Whether the coroutine has finished.
    #[must_use]
    pub fn done(&self) -> bool {
        self.core.borrow().done
    }

    /// An event that fires when the task finishes.
    ///
    /// Already-finished tasks yield the null (triggered) event.
    #[must_use]
    pub fn completion(&self) -> Event {
        if self.done() {
            return Event::null();
        }
        self.core
            .borrow_mut()
            .completion
            .get_or_insert_with(Event::new)
            .clone()
    }

    /// Expresses interest in the task's result, waking an
    /// [`interest`]-gated body.
    pub fn start(&self) {
        let mut core = self.core.borrow_mut();
        if core.done {
            return;
        }
        match &core.interest {
            InterestState::Created(ev) => {
                let ev = ev.clone();
                drop(core);
                ev.trigger();
            }
            InterestState::Unrequested => core.interest = InterestState::Expressed,
            InterestState::Expressed => {}
        }
    }

    /// Releases ownership: the coroutine keeps running and its frame is
    /// reclaimed when it finishes. The result of a detached task is
    /// discarded.
    pub fn detach(mut self) {
        self.owned = false;
        trace!(task = %self.id, "detach");
    }
}

impl<T> Future for Task<T> {
    type Output = Result<T, ClearingError>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut core = this.core.borrow_mut();
        if core.done {
            drop(core);
            let result = this
                .result
                .borrow_mut()
                .take()
                .expect("task result taken twice");
            return Poll::Ready(result);
        }

        let me = driver::current();
        match core.continuation {
            None => core.continuation = Some(me),
            Some(existing) => {
                assert!(
                    existing == me,
                    "task awaited from two places; await completion() instead"
                );
            }
        }
        let interest = match &core.interest {
            InterestState::Created(ev) => Some(ev.clone()),
            _ => None,
        };
        drop(core);
        if let Some(ev) = interest {
            ev.trigger();
        }
        Poll::Pending
    }
}

impl<T> Drop for Task<T> {
    fn drop(&mut self) {
        if self.owned {
            // Aborts the coroutine if it is still running; a finished
            // task's frame is already gone and this is a no-op.
            driver::abort(self.id);
        }
    }
}

/// Parks the current task until someone expresses interest in its result
/// (awaits it or calls [`Task::start`]).
///
/// Returns immediately if interest was expressed before the call.
#[must_use]
pub fn interest() -> WaitEvent {
    interest_event().wait()
}

/// The current task's interest event, without suspending.
///
/// The event fires the first time anyone expresses interest in the task's
/// result; a body that owns it explicitly can, for example, race it
/// against a timer.
#[must_use]
pub fn interest_event() -> Event {
    driver::with_current_core(PromiseCore::make_interest)
}
