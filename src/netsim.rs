//! Message-passing network simulator.
//!
//! Three pieces, looked up by integer id and created lazily:
//!
//! - [`Channel`]: a directed link between two nodes. [`Channel::send`]
//!   returns once the *sender* may proceed (after `send_delay`), while a
//!   detached coroutine delivers the message after `link_delay`.
//! - [`Port`]: a node's receive side. [`Port::receive`] parks until the
//!   port's FIFO is non-empty, then dequeues — the canonical
//!   two-coroutines-and-an-event pattern.
//! - [`Network`]: the table of channels and ports, plus a deterministic
//!   randomness source for simulations that want jitter or failures.
//!
//! All handles are cheap clones sharing one underlying network; everything
//! runs on the current thread's driver.

use crate::driver::{after, now};
use crate::event::Event;
use crate::task::{spawn, Task};
use crate::util::DetRng;
use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::rc::Rc;
use std::time::Duration;
use tracing::debug;

/// Node identifier. Negative ids are fine — observers conventionally sit
/// below zero.
pub type NodeId = i32;

/// Tuning knobs for a [`Network`].
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Time for a message to arrive at the destination port.
    ///
    /// Default: 20 ms
    pub link_delay: Duration,

    /// Time before the sender may send again.
    ///
    /// Default: 1 ms
    pub send_delay: Duration,

    /// Seed for the network's randomness source. Fixed by default, so a
    /// simulation is reproducible unless it asks for entropy.
    pub seed: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            link_delay: Duration::from_millis(20),
            send_delay: Duration::from_millis(1),
            seed: 0x0c07_a3ed,
        }
    }
}

impl NetworkConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the link delay.
    #[must_use]
    pub fn link_delay(mut self, delay: Duration) -> Self {
        self.link_delay = delay;
        self
    }

    /// Sets the send delay.
    #[must_use]
    pub fn send_delay(mut self, delay: Duration) -> Self {
        self.send_delay = delay;
        self
    }

    /// Sets the randomness seed.
    #[must_use]
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

struct PortInner<M> {
    id: NodeId,
    queue: RefCell<VecDeque<M>>,
    /// One-shot wakeup for a parked receiver; replaced on every park.
    /// Dropping the port fires it, so parked receivers unwind with the
    /// port instead of leaking.
    receiver: RefCell<Event>,
}

impl<M> Drop for PortInner<M> {
    fn drop(&mut self) {
        // The parked receiver holds its own handle to the wakeup event, so
        // the event will not fire by going away; fire it explicitly so the
        // receiver unwinds during cleanup instead of leaking.
        self.receiver.get_mut().trigger();
    }
}

/// A node's receive side. Cloning shares the underlying port.
pub struct Port<M> {
    inner: Rc<PortInner<M>>,
}

impl<M> Clone for Port<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<M: fmt::Debug + 'static> Port<M> {
    /// This port's node id.
    #[must_use]
    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    /// Receives the next message, parking until one is available.
    pub fn receive(&self) -> Task<M> {
        let inner = Rc::clone(&self.inner);
        spawn(async move {
            loop {
                let next = inner.queue.borrow_mut().pop_front();
                if let Some(message) = next {
                    debug!(at = %now(), to = inner.id, msg = ?message, "receive");
                    return Ok(message);
                }
                // Events are one-shot, so each park installs a fresh one
                // for the next delivery to fire.
                let wakeup = Event::new();
                *inner.receiver.borrow_mut() = wakeup.clone();
                wakeup.wait().await?;
            }
        })
    }

    fn deliver(&self, message: M) {
        self.inner.queue.borrow_mut().push_back(message);
        let wakeup = self.inner.receiver.borrow().clone();
        wakeup.trigger();
    }

    /// Messages queued and not yet received.
    #[must_use]
    pub fn backlog(&self) -> usize {
        self.inner.queue.borrow().len()
    }
}

struct ChannelInner<M> {
    source: NodeId,
    dest: Port<M>,
    link_delay: Duration,
    send_delay: Duration,
}

/// A directed link between two nodes. Cloning shares the underlying
/// channel.
pub struct Channel<M> {
    inner: Rc<ChannelInner<M>>,
}

impl<M> Clone for Channel<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<M: fmt::Debug + 'static> Channel<M> {
    /// The sending node.
    #[must_use]
    pub fn source(&self) -> NodeId {
        self.inner.source
    }

    /// The receiving node.
    #[must_use]
    pub fn destination(&self) -> NodeId {
        self.inner.dest.id()
    }

    /// Sends a message on this link.
    ///
    /// The returned task resolves when the *sender* may continue (after
    /// `send_delay`); delivery itself happens `link_delay` later via a
    /// detached coroutine, so consecutive sends pipeline on the wire.
    pub fn send(&self, message: M) -> Task<()> {
        let inner = Rc::clone(&self.inner);
        spawn(async move {
            debug!(
                at = %now(),
                from = inner.source,
                to = inner.dest.id(),
                msg = ?message,
                "send",
            );
            let port = inner.dest.clone();
            let link_delay = inner.link_delay;
            spawn(async move {
                after(link_delay).wait().await?;
                port.deliver(message);
                Ok(())
            })
            .detach();

            after(inner.send_delay).wait().await?;
            Ok(())
        })
    }
}

struct NetworkInner<M> {
    config: NetworkConfig,
    links: RefCell<BTreeMap<(NodeId, NodeId), Channel<M>>>,
    inputs: RefCell<BTreeMap<NodeId, Port<M>>>,
    rng: RefCell<DetRng>,
}

/// A collection of channels and ports, looked up (and created) by node id.
pub struct Network<M> {
    inner: Rc<NetworkInner<M>>,
}

impl<M> Clone for Network<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<M> Default for Network<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> Network<M> {
    /// Creates a network with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(NetworkConfig::default())
    }

    /// Creates a network with the given configuration.
    #[must_use]
    pub fn with_config(config: NetworkConfig) -> Self {
        let rng = DetRng::new(config.seed);
        Self {
            inner: Rc::new(NetworkInner {
                config,
                links: RefCell::new(BTreeMap::new()),
                inputs: RefCell::new(BTreeMap::new()),
                rng: RefCell::new(rng),
            }),
        }
    }

    /// The channel for the `src → dst` link, created on first use.
    #[must_use]
    pub fn link(&self, src: NodeId, dst: NodeId) -> Channel<M> {
        let dest = self.input(dst);
        self.inner
            .links
            .borrow_mut()
            .entry((src, dst))
            .or_insert_with(|| Channel {
                inner: Rc::new(ChannelInner {
                    source: src,
                    dest,
                    link_delay: self.inner.config.link_delay,
                    send_delay: self.inner.config.send_delay,
                }),
            })
            .clone()
    }

    /// The input port for node `id`, created on first use.
    #[must_use]
    pub fn input(&self, id: NodeId) -> Port<M> {
        self.inner
            .inputs
            .borrow_mut()
            .entry(id)
            .or_insert_with(|| Port {
                inner: Rc::new(PortInner {
                    id,
                    queue: RefCell::new(VecDeque::new()),
                    receiver: RefCell::new(Event::new()),
                }),
            })
            .clone()
    }

    /// Returns true with the given probability, from the network's
    /// deterministic randomness source.
    pub fn chance(&self, probability: f64) -> bool {
        self.inner.rng.borrow_mut().chance(probability)
    }

    /// A uniformly-random duration in `[min, max]`.
    pub fn uniform_delay(&self, min: Duration, max: Duration) -> Duration {
        self.inner.rng.borrow_mut().uniform_duration(min, max)
    }

    /// A uniformly-random element of a non-empty slice.
    ///
    /// # Panics
    ///
    /// Panics if the slice is empty.
    pub fn pick<T: Copy>(&self, items: &[T]) -> T {
        self.inner.rng.borrow_mut().pick(items)
    }

    /// Drops every channel and port.
    ///
    /// Parked receivers wake up (their ports fire on drop); follow with
    /// [`clear`](crate::clear) + [`run`](crate::run) to unwind them.
    pub fn clear(&self) {
        self.inner.links.borrow_mut().clear();
        self.inner.inputs.borrow_mut().clear();
    }
}
