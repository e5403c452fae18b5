//! Quorum bodies: the machinery behind `any` and `all`.
//!
//! A quorum is an event body that owns a set of member events and fires
//! the first time enough of them have fired. `any` is a threshold of one,
//! `all` a threshold equal to the member count. Already-triggered members
//! count immediately and are never stored.
//!
//! # Interest propagation
//!
//! An [`Interest`](crate::Interest) member is a placeholder for "some
//! task's interest event, once a concrete waiter shows up". Rather than
//! allocating a signal per task up front, the quorum records a count of
//! placeholders and raises `want_interest` on itself (the flag is also
//! inherited from members that carry it). The placeholder is resolved
//! lazily by [`fix_want_interest`], at the moment a coroutine is about to
//! park on the event: one walk down the member tree replaces every
//! placeholder with the waiter's interest event and clears the flag
//! everywhere it goes.
//!
//! # Reentrancy
//!
//! Both the trigger path and the interest walk can, mid-iteration, fire
//! the very body being iterated — which drops member handles, possibly the
//! last ones. Every loop over members below therefore runs on a
//! stack-local copy taken up front.

use crate::combinator::Member;
use crate::event::{Event, EventBody, Listener};
use smallvec::SmallVec;
use std::rc::Rc;

/// Member bookkeeping for a quorum event body.
pub(crate) struct QuorumState {
    /// Surviving (untriggered) members. Strong handles: the quorum keeps
    /// its children alive, never the other way around.
    pub(crate) members: SmallVec<[Event; 3]>,
    /// Members that have already fired (or arrived fired).
    pub(crate) triggered_count: u32,
    /// Fire once `triggered_count` reaches this.
    pub(crate) threshold: u32,
    /// Interest placeholders not yet bound to a concrete waiter.
    pub(crate) interest_count: u32,
}

impl QuorumState {
    pub(crate) fn new(threshold: u32) -> Self {
        Self {
            members: SmallVec::new(),
            triggered_count: 0,
            threshold,
            interest_count: 0,
        }
    }
}

/// Builds a quorum event over `members` that fires once `threshold` of
/// them have fired. Fires immediately (before returning) if the supplied
/// members already satisfy the threshold.
pub(crate) fn new_quorum(threshold: u32, members: impl IntoIterator<Item = Member>) -> Event {
    let body = Rc::new(EventBody::new_quorum(threshold));
    for member in members {
        match member {
            Member::Event(ev) => add_member(&body, ev),
            Member::Interest => add_interest(&body),
        }
    }
    if threshold_reached(&body) {
        body.trigger();
    }
    Event::from_body(body)
}

/// Adds one member event to a live quorum.
///
/// A null or already-triggered member only bumps the count. A live member
/// is stored and given a weak back edge to the quorum; a member that
/// carries `want_interest` hands the flag up.
fn add_member(body: &Rc<EventBody>, ev: Event) {
    if ev.triggered() {
        let mut quorum = body.quorum_state().borrow_mut();
        quorum.as_mut().expect("quorum body").triggered_count += 1;
        return;
    }
    let inner = Rc::clone(ev.body().expect("untriggered event has a body"));
    inner.add_listener(Listener::Quorum(Rc::downgrade(body)));
    if inner.wants_interest() {
        body.set_wants_interest(true);
    }
    let mut quorum = body.quorum_state().borrow_mut();
    quorum.as_mut().expect("quorum body").members.push(ev);
}

fn add_interest(body: &Rc<EventBody>) {
    {
        let mut quorum = body.quorum_state().borrow_mut();
        quorum.as_mut().expect("quorum body").interest_count += 1;
    }
    body.set_wants_interest(true);
}

fn threshold_reached(body: &EventBody) -> bool {
    let quorum = body.quorum_state().borrow();
    let q = quorum.as_ref().expect("quorum body");
    q.triggered_count >= q.threshold
}

impl EventBody {
    /// Called by a member event during its trigger dispatch.
    ///
    /// Removes every entry for the member (it may appear more than once),
    /// counts each, and fires if the threshold is reached.
    pub(crate) fn trigger_member(&self, member: *const EventBody) {
        if self.triggered() {
            return;
        }
        let fire = {
            let mut quorum = self.quorum_state().borrow_mut();
            let q = quorum
                .as_mut()
                .expect("member notified a body that is not a quorum");
            let mut i = 0;
            while i < q.members.len() {
                let matches = q.members[i]
                    .body()
                    .is_some_and(|b| std::ptr::eq(Rc::as_ptr(b), member));
                if matches {
                    q.members.swap_remove(i);
                    q.triggered_count += 1;
                } else {
                    i += 1;
                }
            }
            q.triggered_count >= q.threshold
        };
        if fire {
            self.trigger();
        }
    }
}

/// Binds a concrete waiter's interest event to every unresolved interest
/// placeholder under `body`, clearing `want_interest` on the way down.
///
/// May fire `body` (binding an already-triggered interest event can reach
/// the threshold); callers must re-check the triggered state afterwards.
pub(crate) fn fix_want_interest(body: &Rc<EventBody>, ievent: &Event) {
    debug_assert!(body.is_quorum() && body.wants_interest());
    body.set_wants_interest(false);
    if body.triggered() {
        return;
    }

    // Replace this quorum's own placeholders.
    loop {
        let take = {
            let mut quorum = body.quorum_state().borrow_mut();
            let q = quorum.as_mut().expect("quorum body");
            if q.interest_count > 0 {
                q.interest_count -= 1;
                true
            } else {
                false
            }
        };
        if !take {
            break;
        }
        add_member(body, ievent.clone());
    }
    if threshold_reached(body) {
        body.trigger();
        return;
    }

    // Recurse into members that still want interest. Stack copy first:
    // binding interest to a member can trigger it, which can trigger us
    // and drop the remaining member handles.
    let wanting: SmallVec<[Event; 3]> = {
        let quorum = body.quorum_state().borrow();
        quorum
            .as_ref()
            .expect("quorum body")
            .members
            .iter()
            .filter(|m| m.body().is_some_and(|b| b.wants_interest()))
            .cloned()
            .collect()
    };
    for member in wanting {
        let inner = Rc::clone(member.body().expect("stored members are live"));
        fix_want_interest(&inner, ievent);
    }
}
