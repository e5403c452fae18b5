//! Event combinators: `any`, `all`, and `attempt`.
//!
//! `any` fires when one member fires, `all` when every member has fired.
//! Both accept already-triggered members (which count immediately), the
//! [`Interest`] placeholder, and — via [`event_of`] — arbitrary futures.
//!
//! `attempt` races a task against a set of events: the task's result if it
//! finishes first, `None` if an event beats it. The losing side leaves
//! nothing behind — when the quorum resolves it strips its listener from
//! every surviving member, so an abandoned timeout is just an empty timer
//! the heap culls lazily.

use crate::error::ClearingError;
use crate::event::quorum::new_quorum;
use crate::event::Event;
use crate::task::{spawn, Task};
use std::future::Future;

/// Placeholder member for `any`/`all`: stands for the enclosing task's
/// interest event, bound lazily when a concrete waiter parks on the
/// combined event.
///
/// `any!(work_ready, Interest)` thus fires either when work arrives or
/// when somebody starts asking for results — without allocating a signal
/// per task up front.
#[derive(Debug, Clone, Copy)]
pub struct Interest;

/// One member of an `any`/`all` combination.
#[derive(Debug)]
pub enum Member {
    /// A concrete event.
    Event(Event),
    /// The lazy interest placeholder.
    Interest,
}

impl From<Event> for Member {
    fn from(ev: Event) -> Self {
        Self::Event(ev)
    }
}

impl From<&Event> for Member {
    fn from(ev: &Event) -> Self {
        Self::Event(ev.clone())
    }
}

impl From<Interest> for Member {
    fn from(_: Interest) -> Self {
        Self::Interest
    }
}

/// An event that fires when any member fires.
///
/// `any()` of nothing is the null (already triggered) event. A single
/// event member is returned unchanged, no quorum allocated.
#[must_use]
pub fn any(members: impl IntoIterator<Item = Member>) -> Event {
    let members: Vec<Member> = members.into_iter().collect();
    match members.len() {
        0 => Event::null(),
        1 => single(members),
        _ => new_quorum(1, members),
    }
}

/// An event that fires once every member has fired.
///
/// `all()` of nothing is vacuously satisfied: the null event. The
/// threshold counts every member spec, so already-triggered members and
/// placeholders participate in the arithmetic.
#[must_use]
pub fn all(members: impl IntoIterator<Item = Member>) -> Event {
    let members: Vec<Member> = members.into_iter().collect();
    let threshold = u32::try_from(members.len()).expect("member count fits in u32");
    match members.len() {
        0 => Event::null(),
        1 => single(members),
        _ => new_quorum(threshold, members),
    }
}

fn single(members: Vec<Member>) -> Event {
    match members.into_iter().next().expect("exactly one member") {
        Member::Event(ev) => ev,
        // A bare placeholder still needs a body to hang the laziness on.
        Member::Interest => new_quorum(1, [Member::Interest]),
    }
}

/// Runs `task` under interruption: yields `Some(result)` if the task
/// finishes first, `None` if one of `events` fires first.
///
/// The task is started (its interest event fires) if it has not finished
/// already. A task that loses the race keeps its frame only as long as
/// the caller keeps the returned `None` path running — the handle is
/// dropped here, which aborts the coroutine.
pub async fn attempt<T: 'static>(
    task: Task<T>,
    events: impl IntoIterator<Item = Member>,
) -> Result<Option<T>, ClearingError> {
    if !task.done() {
        task.start();
        let mut members: Vec<Member> = Vec::new();
        members.push(Member::from(task.completion()));
        members.extend(events);
        any(members).wait().await?;
    }
    if task.done() {
        Ok(Some(task.await?))
    } else {
        Ok(None)
    }
}

/// Adapts an arbitrary future into an event that fires when the future
/// completes. The future runs as a detached task; its output is
/// discarded.
#[must_use]
pub fn event_of<F>(fut: F) -> Event
where
    F: Future + 'static,
{
    let task = spawn(async move {
        let _ = fut.await;
        Ok(())
    });
    let ev = task.completion();
    task.detach();
    ev
}

/// Variadic sugar for [`any`]: `any!(a, b, Interest)`.
///
/// `any!()` is the null (already triggered) event.
#[macro_export]
macro_rules! any {
    () => {
        $crate::Event::null()
    };
    ($($member:expr),+ $(,)?) => {
        $crate::any([$($crate::Member::from($member)),+])
    };
}

/// Variadic sugar for [`all`]: `all!(a, b)`.
///
/// `all!()` is the null (already triggered) event — vacuous truth.
#[macro_export]
macro_rules! all {
    () => {
        $crate::Event::null()
    };
    ($($member:expr),+ $(,)?) => {
        $crate::all([$($crate::Member::from($member)),+])
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_member_combinators_are_triggered() {
        assert!(any([]).triggered());
        assert!(all([]).triggered());
        assert!(any!().triggered());
        assert!(all!().triggered());
    }

    #[test]
    fn single_event_passes_through() {
        let ev = Event::new();
        let combined = any([Member::from(&ev)]);
        ev.trigger();
        assert!(combined.triggered());
    }

    #[test]
    fn any_fires_on_first_member() {
        let a = Event::new();
        let b = Event::new();
        let combined = any!(&a, &b);
        assert!(!combined.triggered());
        b.trigger();
        assert!(combined.triggered());
    }

    #[test]
    fn all_waits_for_every_member() {
        let a = Event::new();
        let b = Event::new();
        let c = Event::new();
        let combined = all!(&a, &b, &c);
        a.trigger();
        c.trigger();
        assert!(!combined.triggered());
        b.trigger();
        assert!(combined.triggered());
    }

    #[test]
    fn all_counts_already_triggered_members() {
        let fired = Event::new();
        fired.trigger();
        let live = Event::new();
        let combined = all!(&fired, &live, Event::null());
        assert!(!combined.triggered());
        live.trigger();
        assert!(combined.triggered());
    }
}
