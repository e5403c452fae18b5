//! Chandra–Toueg consensus over the simulated network: three servers with
//! random initial colours reach a decision, and the observer sees one
//! DECIDE per server, all of the same colour.

use cotamer::netsim::{Network, NodeId, Port};
use cotamer::{after, attempt, spawn, DetRng, Event, Member, Task};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

/// The distinguished observer that collects final decisions.
const NANCY: NodeId = -1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Color {
    Red,
    Blue,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Kind {
    Prepare,
    Propose,
    Ack,
    Decide,
}

#[derive(Clone, Debug)]
struct Message {
    kind: Kind,
    round: u64,
    color: Color,
    color_round: u64,
    ack: bool,
}

fn prepare(round: u64, color: Color, color_round: u64) -> Message {
    Message {
        kind: Kind::Prepare,
        round,
        color,
        color_round,
        ack: false,
    }
}

fn propose(round: u64, color: Color) -> Message {
    Message {
        kind: Kind::Propose,
        round,
        color,
        color_round: 0,
        ack: false,
    }
}

fn ack_message(round: u64, ack: bool) -> Message {
    Message {
        kind: Kind::Ack,
        round,
        color: Color::Red,
        color_round: 0,
        ack,
    }
}

fn decide(color: Color) -> Message {
    Message {
        kind: Kind::Decide,
        round: 0,
        color,
        color_round: 0,
        ack: false,
    }
}

/// What a filtered receive produced: the wanted message, or the news that
/// this server is finished because a DECIDE arrived.
enum Step {
    Got(Message),
    Decided,
}

struct Vars {
    color: Color,
    round: u64,
    color_round: u64,
}

#[derive(Clone)]
struct Server {
    id: NodeId,
    n: i32,
    net: Network<Message>,
    port: Port<Message>,
    vars: Rc<RefCell<Vars>>,
}

impl Server {
    fn new(id: NodeId, n: i32, net: &Network<Message>, color: Color) -> Self {
        Self {
            id,
            n,
            net: net.clone(),
            port: net.input(id),
            vars: Rc::new(RefCell::new(Vars {
                color,
                round: 1,
                color_round: 0,
            })),
        }
    }

    /// A simple timeout stands in for a real failure detector.
    fn failure_detector(&self, _leader: NodeId) -> Event {
        after(Duration::from_millis(100))
    }

    /// Receives the next message of `want` for the current round,
    /// discarding stragglers. A DECIDE short-circuits: the decision is
    /// re-broadcast and the server is done.
    fn receive(&self, want: Kind) -> Task<Step> {
        let server = self.clone();
        spawn(async move {
            loop {
                let m = server.port.receive().await?;
                if m.kind == Kind::Decide {
                    server.broadcast_decide(m.color).await?;
                    return Ok(Step::Decided);
                }
                let round = server.vars.borrow().round;
                if m.kind == want && m.round == round {
                    return Ok(Step::Got(m));
                }
            }
        })
    }

    /// Sends DECIDE to every other server and to the observer.
    async fn broadcast_decide(&self, color: Color) -> cotamer::Result<()> {
        for j in 0..self.n {
            if j != self.id {
                self.net.link(self.id, j).send(decide(color)).await?;
            }
        }
        self.net.link(self.id, NANCY).send(decide(color)).await?;
        Ok(())
    }

    fn consensus(self) -> Task<()> {
        spawn(async move {
            loop {
                let (round, color, color_round) = {
                    let vars = self.vars.borrow();
                    (vars.round, vars.color, vars.color_round)
                };
                #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
                let leader = (round % self.n as u64) as NodeId;

                // Phase 1: everyone PREPAREs to the round's leader.
                self.net
                    .link(self.id, leader)
                    .send(prepare(round, color, color_round))
                    .await?;

                // Phase 2: the leader gathers a majority of PREPAREs and
                // adopts the freshest colour it sees.
                if self.id == leader {
                    let mut received_prepare = 0;
                    while received_prepare <= self.n / 2 {
                        match self.receive(Kind::Prepare).await? {
                            Step::Decided => return Ok(()),
                            Step::Got(m) => {
                                let mut vars = self.vars.borrow_mut();
                                if m.color_round > vars.color_round {
                                    vars.color = m.color;
                                    vars.color_round = m.color_round;
                                }
                                received_prepare += 1;
                            }
                        }
                    }

                    // Phase 3: the leader PROPOSEs to everyone (itself
                    // included).
                    let color = self.vars.borrow().color;
                    for j in 0..self.n {
                        self.net.link(self.id, j).send(propose(round, color)).await?;
                    }
                }

                // Phase 4: wait for the PROPOSE or give up on the leader.
                let proposal = attempt(
                    self.receive(Kind::Propose),
                    [Member::from(self.failure_detector(leader))],
                )
                .await?;
                let acked = match proposal {
                    Some(Step::Decided) => return Ok(()),
                    Some(Step::Got(m)) => {
                        self.vars.borrow_mut().color = m.color;
                        true
                    }
                    None => false,
                };
                self.net
                    .link(self.id, leader)
                    .send(ack_message(round, acked))
                    .await?;

                // Phase 5: the leader decides on a majority of positive
                // ACKs.
                if self.id == leader {
                    let mut success = 0;
                    let mut total = 0;
                    while total <= self.n / 2 {
                        match self.receive(Kind::Ack).await? {
                            Step::Decided => return Ok(()),
                            Step::Got(m) => {
                                if m.ack {
                                    success += 1;
                                }
                                total += 1;
                            }
                        }
                    }
                    if success > self.n / 2 {
                        let color = self.vars.borrow().color;
                        self.broadcast_decide(color).await?;
                        return Ok(());
                    }
                }

                // Phase 6: next round, after a breather.
                self.vars.borrow_mut().round += 1;
                after(Duration::from_millis(10)).wait().await?;
            }
        })
    }
}

/// Nancy collects DECIDEs and validates agreement. Once a majority has
/// reported she lingers briefly for stragglers, then tears the world down.
fn nancy(
    port: Port<Message>,
    n: i32,
    have_red: bool,
    have_blue: bool,
    outcome: Rc<RefCell<Option<(usize, Color)>>>,
) -> Task<()> {
    spawn(async move {
        let majority = (n / 2) as usize;
        let mut received = 0usize;
        let mut agreed: Option<Color> = None;
        let mut stopper = Event::new();

        while !stopper.triggered() {
            let Some(m) = attempt(port.receive(), [Member::from(&stopper)]).await? else {
                break;
            };
            assert_eq!(m.kind, Kind::Decide, "nancy received a stray {m:?}");
            match m.color {
                Color::Red => assert!(have_red, "decided Red but nobody started Red"),
                Color::Blue => assert!(have_blue, "decided Blue but nobody started Blue"),
            }
            if let Some(color) = agreed {
                assert_eq!(color, m.color, "servers disagreed");
            }
            agreed = Some(m.color);
            received += 1;

            // Majority reached: give stragglers a grace period.
            if received > majority && stopper.empty() {
                stopper = after(Duration::from_secs(10));
            }
        }

        assert!(received > majority, "nancy stopped before a majority decided");
        *outcome.borrow_mut() = Some((received, agreed.expect("at least one decision")));
        cotamer::clear();
        Ok(())
    })
}

fn run_consensus(seed: u64, n: i32) -> (usize, Color, bool, bool) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    cotamer::reset();
    let net: Network<Message> = Network::new();
    let mut rng = DetRng::new(seed);

    let mut have_red = false;
    let mut have_blue = false;
    for id in 0..n {
        let color = if rng.next_bool() {
            have_red = true;
            Color::Red
        } else {
            have_blue = true;
            Color::Blue
        };
        Server::new(id, n, &net, color).consensus().detach();
    }

    let outcome = Rc::new(RefCell::new(None));
    nancy(
        net.input(NANCY),
        n,
        have_red,
        have_blue,
        Rc::clone(&outcome),
    )
    .detach();

    cotamer::run();

    let (received, color) = outcome
        .borrow()
        .expect("consensus never reached a decision");

    // Unwind the surviving server coroutines and verify nothing leaked.
    cotamer::reset();
    assert_eq!(cotamer::pending_tasks(), 0);

    (received, color, have_red, have_blue)
}

#[test]
fn three_servers_decide_one_colour() {
    let (received, color, have_red, have_blue) = run_consensus(42, 3);
    assert_eq!(received, 3, "every server reported its decision");
    match color {
        Color::Red => assert!(have_red),
        Color::Blue => assert!(have_blue),
    }
}

#[test]
fn a_different_seed_also_decides() {
    let (received, _color, _have_red, _have_blue) = run_consensus(7, 3);
    assert_eq!(received, 3);
}

#[test]
fn consensus_is_deterministic_per_seed() {
    let first = run_consensus(42, 3);
    let second = run_consensus(42, 3);
    assert_eq!(first.1, second.1);
    assert_eq!(first.0, second.0);
}
