//! Cotamer: a single-threaded cooperative coroutine runtime on a simulated
//! clock.
//!
//! # Overview
//!
//! Cotamer runs coroutines against a discrete-event scheduler. Time is a
//! counter the driver advances — no wall clock, no I/O, no threads — so a
//! simulation that arms the same timers and spawns the same tasks produces
//! the same interleaving and the same timestamps, every run.
//!
//! Three primitives:
//!
//! - [`Event`]: a one-shot, reference-counted signal. Coroutines park on
//!   it; triggering it schedules them in registration order.
//! - [`Task`]: an eagerly-started coroutine producing a value. Awaiting a
//!   task hands its result over in the same scheduler step it finishes.
//! - The driver: ready queue, asap queue, timer heap, virtual clock.
//!   [`run`] drains them to quiescence; [`clear`] unwinds everything.
//!
//! On top of these sit the combinators [`any`], [`all`] and [`attempt`]
//! (threshold quorums with an interest-propagation optimisation that
//! avoids allocating per-task start signals), and the [`netsim`] module, a
//! small message-passing network simulator.
//!
//! # Guarantees
//!
//! - **Cooperative, single-threaded**: a coroutine runs until it awaits or
//!   returns; nothing is `Send`.
//! - **FIFO scheduling**: listeners resume in registration order, ready
//!   coroutines run in arrival order, same-deadline timers fire in
//!   insertion order.
//! - **Determinism**: same actions, same clock, same interleaving.
//! - **No starvation by timers**: pending work always drains before the
//!   clock jumps.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//!
//! let greeting = cotamer::spawn(async {
//!     cotamer::after(Duration::from_millis(10)).wait().await?;
//!     Ok("hello")
//! });
//! let relay = cotamer::spawn(async move {
//!     let word = greeting.await?;
//!     Ok(word.len())
//! });
//! cotamer::run();
//! assert!(relay.done());
//! cotamer::reset();
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]

mod combinator;
mod driver;
mod error;
mod event;
pub mod netsim;
mod task;
mod types;
mod util;

pub use combinator::{all, any, attempt, event_of, Interest, Member};
pub use driver::{after, asap, at, clear, now, pending_tasks, reset, run, step_time};
pub use error::{ClearingError, Result};
pub use event::{Event, WaitEvent};
pub use task::{interest, interest_event, spawn, Task};
pub use types::{TaskId, Time};
pub use util::DetRng;
