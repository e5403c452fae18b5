//! The event loop: ready queue, asap queue, timer heap, virtual clock.
//!
//! One driver lives per thread, created lazily; every public function here
//! operates on the current thread's driver. The loop is strictly
//! cooperative and single-threaded: a coroutine runs until it awaits or
//! returns, and the clock is a counter only the driver moves.
//!
//! # Scheduling order
//!
//! [`run`] repeats three phases until none of them finds work:
//!
//! 1. Trigger asap events, oldest first. Triggering moves listeners onto
//!    the ready queue.
//! 2. Resume ready coroutines, FIFO. The clock advances one tick (1 ns)
//!    after every resume, so output from distinct resumes carries distinct
//!    timestamps.
//! 3. Cull abandoned timers; if nothing is pending sooner, jump the clock
//!    forward to the earliest deadline and fire everything that is due, in
//!    deadline order (ties by insertion order).
//!
//! Asap events and ready coroutines always drain before any timer fires,
//! so timers cannot starve pending work.
//!
//! # Clearing
//!
//! [`clear`] flags the driver; the next [`run`] then unwinds the world:
//! every coroutine resumed while the flag is up observes
//! [`ClearingError`](crate::ClearingError) at its await site and
//! propagates it out, and each unwound frame releases the events it holds,
//! which fire their own parked listeners in turn — the cascade reaches
//! everything transitively. The flag drops when the loop goes quiescent.

pub(crate) mod timer_heap;

use crate::event::Event;
use crate::task::PromiseCore;
use crate::types::{TaskId, Time};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};
use std::time::Duration;
use self::timer_heap::{IdlePayload, TimerHeap};
use tracing::trace;

/// How far the clock moves after each coroutine resume.
const TICK: Duration = Duration::from_nanos(1);

impl IdlePayload for Event {
    fn is_idle(&self) -> bool {
        self.empty()
    }
}

struct Driver {
    ready: VecDeque<TaskId>,
    asap: VecDeque<Event>,
    timers: TimerHeap<Event>,
    now: Time,
    clearing: bool,
}

impl Driver {
    fn new() -> Self {
        Self {
            ready: VecDeque::new(),
            asap: VecDeque::new(),
            timers: TimerHeap::new(),
            now: Time::EPOCH,
            clearing: false,
        }
    }
}

/// A parked task frame plus its shared promise state.
struct StoredTask {
    core: Rc<RefCell<PromiseCore>>,
    frame: Pin<Box<dyn Future<Output = ()>>>,
}

/// Table slot for a task. `Running` marks a frame that is currently out
/// being polled; aborting such a task removes the slot, and the poll loop
/// notices the removal instead of parking the frame again.
enum TaskSlot {
    Parked(StoredTask),
    Running,
}

thread_local! {
    static DRIVER: RefCell<Driver> = RefCell::new(Driver::new());
    static TASKS: RefCell<BTreeMap<TaskId, TaskSlot>> = RefCell::new(BTreeMap::new());
    /// The task being polled right now, with its promise state.
    static CURRENT: RefCell<Option<(TaskId, Rc<RefCell<PromiseCore>>)>> = const { RefCell::new(None) };
    /// Never reset, so ids from a previous driver generation stay dead.
    static NEXT_TASK_ID: Cell<u64> = const { Cell::new(0) };
}

fn with_driver<R>(f: impl FnOnce(&mut Driver) -> R) -> R {
    DRIVER.with(|d| f(&mut d.borrow_mut()))
}

pub(crate) fn next_task_id() -> TaskId {
    NEXT_TASK_ID.with(|c| {
        let id = c.get();
        c.set(id + 1);
        TaskId::new(id)
    })
}

/// Pushes a coroutine onto the ready queue. Ids of dead tasks are
/// tolerated; the resume becomes a no-op.
pub(crate) fn schedule(id: TaskId) {
    // Ignored during thread teardown, when destructors of leftover events
    // may fire after the queues are gone.
    let _ = DRIVER.try_with(|d| d.borrow_mut().ready.push_back(id));
}

pub(crate) fn is_clearing() -> bool {
    DRIVER.try_with(|d| d.borrow().clearing).unwrap_or(false)
}

/// The task currently being polled.
///
/// # Panics
///
/// Panics when called outside a task — runtime futures only make progress
/// under the driver.
pub(crate) fn current() -> TaskId {
    CURRENT.with(|c| c.borrow().as_ref().map(|(id, _)| *id))
        .expect("not inside a cotamer task")
}

pub(crate) fn with_current_core<R>(f: impl FnOnce(&mut PromiseCore) -> R) -> R {
    let core = CURRENT
        .with(|c| c.borrow().as_ref().map(|(_, core)| Rc::clone(core)))
        .expect("not inside a cotamer task");
    let mut core = core.borrow_mut();
    f(&mut core)
}

pub(crate) fn insert_task(
    id: TaskId,
    core: Rc<RefCell<PromiseCore>>,
    frame: Pin<Box<dyn Future<Output = ()>>>,
) {
    TASKS.with(|t| {
        t.borrow_mut()
            .insert(id, TaskSlot::Parked(StoredTask { core, frame }))
    });
}

/// Drops a task's frame. Safe to call for finished or unknown ids, and
/// during thread teardown.
pub(crate) fn abort(id: TaskId) {
    let removed = TASKS.try_with(|t| t.borrow_mut().remove(&id)).ok().flatten();
    // The frame's drop can cascade (events it held fire); run it with no
    // table borrow outstanding. A frame that is out being polled is
    // dropped by the poll loop instead, which finds its slot gone.
    drop(removed);
}

/// Number of live task frames, parked or running. Useful in tests to
/// assert that teardown reclaimed everything.
#[must_use]
pub fn pending_tasks() -> usize {
    TASKS.with(|t| t.borrow().len())
}

struct TaskWaker {
    id: TaskId,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        schedule(self.id);
    }
}

/// Polls a task once; on completion, fires its completion event and hands
/// control straight to its awaiter, if any.
///
/// The direct hand-off is what lets a caller awaiting a computed value
/// observe it in the same tick the producer finishes: the continuation
/// never goes through the ready queue.
pub(crate) fn resume(id: TaskId) {
    let mut next = Some(id);
    while let Some(id) = next {
        next = resume_one(id);
    }
}

fn resume_one(id: TaskId) -> Option<TaskId> {
    // Take the frame out of the table so nothing alias-borrows it while
    // the poll runs user code (which may spawn, abort, or re-enter the
    // driver freely).
    let taken = TASKS.with(|t| {
        let mut tasks = t.borrow_mut();
        match tasks.get_mut(&id) {
            Some(slot @ TaskSlot::Parked(_)) => match mem::replace(slot, TaskSlot::Running) {
                TaskSlot::Parked(stored) => Some(stored),
                TaskSlot::Running => unreachable!(),
            },
            _ => None,
        }
    });
    let Some(mut stored) = taken else {
        // Stale wake of a finished or aborted task.
        return None;
    };

    let waker = Waker::from(Arc::new(TaskWaker { id }));
    let mut cx = Context::from_waker(&waker);
    let previous = CURRENT.with(|c| {
        c.borrow_mut()
            .replace((id, Rc::clone(&stored.core)))
    });
    let poll = stored.frame.as_mut().poll(&mut cx);
    CURRENT.with(|c| *c.borrow_mut() = previous);

    match poll {
        Poll::Pending => {
            // Park again — unless the task was aborted while running, in
            // which case its slot is gone and the frame drops here.
            let leftover = TASKS.with(|t| {
                let mut tasks = t.borrow_mut();
                match tasks.get_mut(&id) {
                    Some(slot @ TaskSlot::Running) => {
                        *slot = TaskSlot::Parked(stored);
                        None
                    }
                    _ => Some(stored),
                }
            });
            drop(leftover);
            None
        }
        Poll::Ready(()) => {
            TASKS.with(|t| t.borrow_mut().remove(&id));
            let core = Rc::clone(&stored.core);
            // Frame first: a finished frame holds nothing, and the
            // completion cascade below must see the table consistent.
            drop(stored);
            let (completion, continuation) = {
                let mut core = core.borrow_mut();
                core.done = true;
                (core.completion.take(), core.continuation.take())
            };
            trace!(task = %id, "finished");
            if let Some(ev) = completion {
                ev.trigger();
            }
            continuation
        }
    }
}

/// Runs the event loop until no queue has work left.
///
/// Returns once the ready queue and asap queue are empty and every timer
/// has fired or been culled. Clears the clearing flag on exit.
pub fn run() {
    loop {
        let mut progressed = false;

        while let Some(ev) = with_driver(|d| d.asap.pop_front()) {
            ev.trigger();
            drop(ev);
            progressed = true;
        }

        while let Some(id) = with_driver(|d| d.ready.pop_front()) {
            trace!(task = %id, "resume");
            resume(id);
            with_driver(|d| d.now += TICK);
            progressed = true;
        }

        // Throw out abandoned timers, then let the clock jump to the next
        // deadline — but never backwards — and fire everything due.
        let culled = with_driver(|d| d.timers.drain_idle());
        drop(culled);
        with_driver(|d| {
            if d.asap.is_empty() {
                if let Some(top) = d.timers.top_time() {
                    if top > d.now {
                        trace!(from = %d.now, to = %top, "clock jump");
                        d.now = top;
                    }
                }
            }
        });
        while let Some(ev) = with_driver(|d| {
            match d.timers.top_time() {
                Some(top) if top <= d.now => Some(d.timers.pop()),
                _ => None,
            }
        }) {
            ev.trigger();
            drop(ev);
            progressed = true;
        }

        if !progressed {
            break;
        }
    }
    with_driver(|d| d.clearing = false);
}

/// Puts the driver into clearing mode.
///
/// The next [`run`] unwinds everything outstanding: resumed coroutines
/// observe [`ClearingError`](crate::ClearingError), timers fast-forward
/// and fire, and unwound frames release (and thereby fire) the events
/// they hold.
pub fn clear() {
    with_driver(|d| d.clearing = true);
}

/// Tears the current driver down and installs a fresh one at
/// [`Time::EPOCH`].
///
/// Equivalent to [`clear`] + [`run`], plus dropping any frames that
/// survived because nothing ever fired their events (frames drop in task
/// order, so the teardown cascade is deterministic).
pub fn reset() {
    clear();
    run();

    // Survivors are tasks parked on events that no queue references —
    // reachable only from other frames, or from the caller. Dropping the
    // frames directly releases those events; any listeners they fire at
    // are being dropped in the same sweep, so the scheduled ids resolve
    // to nothing.
    let survivors = TASKS.with(|t| mem::take(&mut *t.borrow_mut()));
    if !survivors.is_empty() {
        with_driver(|d| d.clearing = true);
        drop(survivors);
        run();
    }

    let old = DRIVER.with(|d| mem::replace(&mut *d.borrow_mut(), Driver::new()));
    drop(old);
}

/// The current simulated time.
#[must_use]
pub fn now() -> Time {
    with_driver(|d| d.now)
}

/// Advances the clock one tick without running anything.
pub fn step_time() {
    with_driver(|d| d.now += TICK);
}

/// A fresh event that fires on the driver's next pass, before time
/// advances past any timer.
#[must_use]
pub fn asap() -> Event {
    let ev = Event::new();
    with_driver(|d| d.asap.push_back(ev.clone()));
    ev
}

/// An event that fires when the clock reaches `t`.
///
/// A deadline that is not in the future yields the null (already
/// triggered) event and never touches the timer heap.
#[must_use]
pub fn at(t: Time) -> Event {
    let due = with_driver(|d| t <= d.now);
    if due {
        return Event::null();
    }
    let ev = Event::new();
    let evicted = with_driver(|d| d.timers.emplace(t, ev.clone()));
    drop(evicted);
    ev
}

/// An event that fires after `d` of simulated time; `after(0)` is already
/// triggered.
#[must_use]
pub fn after(d: Duration) -> Event {
    at(now() + d)
}
