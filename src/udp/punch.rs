//! SYN/ACK handshake with every peer over the shared socket.
//!
//! One session task per peer keeps firing its current message until it sees
//! the counter-message. A single read loop owns the socket receives for the
//! phase and routes each datagram to the session of its source address.

use std::collections::HashMap;
use std::io::{self, ErrorKind::Other};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::mpsc::{channel, Receiver, Sender};
use tokio::task::JoinSet;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};

use super::client::wait_until;
use crate::config::MIN_RETRY_PERIOD;
use crate::error::{Error, Result};
use crate::message::{Inbound, Origin, Signal, MAX_DATAGRAM};

const INBOX_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// sending SYN, nothing heard yet
    Init,
    /// peer's SYN seen, sending ACK
    AwaitingAck,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Nothing,
    /// send this right away, then keep retransmitting it
    Send(Signal),
    /// confirm with ACK, once now and once a retry period later, then stop
    Complete,
}

/// Handshake state for one peer, free of any io.
#[derive(Debug)]
pub struct Handshake {
    peer: SocketAddr,
    state: State,
}

impl Handshake {
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            peer,
            state: State::Init,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// the message to retransmit, if any.
    pub fn outbound(&self) -> Option<Signal> {
        match self.state {
            State::Init => Some(Signal::Syn),
            State::AwaitingAck => Some(Signal::Ack),
            State::Complete => None,
        }
    }

    pub fn on_inbound(&mut self, msg: &Inbound) -> Action {
        match (self.state, msg) {
            (State::Complete, _) => Action::Nothing,
            (State::Init, Inbound::Syn) => {
                log::debug!("syn from {}", self.peer);
                self.state = State::AwaitingAck;
                Action::Send(Signal::Ack)
            }
            (State::AwaitingAck, Inbound::Syn) => Action::Nothing,
            (_, Inbound::Ack) => {
                log::debug!("ack from {}", self.peer);
                self.state = State::Complete;
                Action::Complete
            }
            (_, Inbound::Keepalive) => Action::Nothing,
            (_, other) => {
                log::warn!("ignoring {:?} from peer {}", other, self.peer);
                Action::Nothing
            }
        }
    }
}

async fn session(
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    period: Duration,
    mut inbox: Receiver<Inbound>,
) -> Result<SocketAddr> {
    let mut handshake = Handshake::new(peer);
    let mut ticker = interval(period.max(MIN_RETRY_PERIOD));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        select! {
            _ = ticker.tick() => {
                if let Some(signal) = handshake.outbound() {
                    socket.send_to(signal.as_bytes(), peer).await?;
                }
            }
            msg = inbox.recv() => {
                let msg = msg.ok_or(Error::Cancelled(peer))?;

                match handshake.on_inbound(&msg) {
                    Action::Nothing => {}
                    Action::Send(signal) => {
                        socket.send_to(signal.as_bytes(), peer).await?;
                        ticker.reset();
                    }
                    Action::Complete => {
                        socket.send_to(Signal::Ack.as_bytes(), peer).await?;
                        sleep(period).await;
                        socket.send_to(Signal::Ack.as_bytes(), peer).await?;
                        log::debug!("punched {}", peer);
                        return Ok(peer);
                    }
                }
            }
        }
    }
}

/// handshake with all `peers` at once. Fails as a whole on the first
/// transport error, cancelling every other session.
pub(crate) async fn punch_peers(
    socket: &Arc<UdpSocket>,
    peers: &[SocketAddr],
    period: Duration,
    deadline: Option<Instant>,
) -> Result<()> {
    let mut routes: HashMap<SocketAddr, Sender<Inbound>> = HashMap::new();
    let mut sessions = JoinSet::new();

    // routes exist before the first SYN leaves, so no early reply is misrouted
    for &peer in peers {
        if routes.contains_key(&peer) {
            continue;
        }
        let (tx, rx) = channel(INBOX_SIZE);
        routes.insert(peer, tx);
        sessions.spawn(session(socket.clone(), peer, period, rx));
    }

    let expired = wait_until(deadline);
    tokio::pin!(expired);
    let mut buf = vec![0u8; MAX_DATAGRAM];

    while !routes.is_empty() {
        select! {
            _ = &mut expired => {
                sessions.shutdown().await;
                return Err(Error::PunchTimeout {
                    peers: peers.to_vec(),
                    pending: peers
                        .iter()
                        .filter(|p| routes.contains_key(*p))
                        .copied()
                        .collect(),
                });
            }
            Some(joined) = sessions.join_next() => {
                let res = joined.unwrap_or_else(|e| Err(io::Error::new(Other, e).into()));
                match res {
                    Ok(peer) => {
                        routes.remove(&peer);
                    }
                    Err(e) => {
                        log::debug!(
                            "handshake failed, cancelling {} sessions: {}",
                            sessions.len(),
                            e
                        );
                        sessions.shutdown().await;
                        return Err(e);
                    }
                }
            }
            res = socket.recv_from(&mut buf) => {
                let (n, from) = match res {
                    Ok(r) => r,
                    Err(e) => {
                        sessions.shutdown().await;
                        return Err(e.into());
                    }
                };

                match Inbound::decode(&buf[..n], Origin::Peer) {
                    Inbound::Keepalive => log::trace!("keepalive from {}", from),
                    msg => match routes.get(&from) {
                        Some(tx) => {
                            if tx.try_send(msg).is_err() {
                                log::trace!("inbox of {} full, dropping", from);
                            }
                        }
                        None => log::debug!(addr:% = from; "dropping packet from unknown peer"),
                    },
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};

    fn peer() -> SocketAddr {
        "10.0.0.2:4000".parse().unwrap()
    }

    #[test]
    fn test_syn_then_ack() {
        let mut h = Handshake::new(peer());
        assert_eq!(h.outbound(), Some(Signal::Syn));

        assert_eq!(h.on_inbound(&Inbound::Syn), Action::Send(Signal::Ack));
        assert_eq!(h.state(), State::AwaitingAck);
        assert_eq!(h.outbound(), Some(Signal::Ack));

        // duplicate syn changes nothing
        assert_eq!(h.on_inbound(&Inbound::Syn), Action::Nothing);
        assert_eq!(h.outbound(), Some(Signal::Ack));

        assert_eq!(h.on_inbound(&Inbound::Ack), Action::Complete);
        assert_eq!(h.state(), State::Complete);
        assert_eq!(h.outbound(), None);
    }

    #[test]
    fn test_ack_before_syn_completes() {
        let mut h = Handshake::new(peer());
        assert_eq!(h.on_inbound(&Inbound::Ack), Action::Complete);
        assert_eq!(h.state(), State::Complete);
    }

    #[test]
    fn test_complete_is_final() {
        let mut h = Handshake::new(peer());
        h.on_inbound(&Inbound::Ack);

        for msg in [Inbound::Ack, Inbound::Syn, Inbound::Keepalive] {
            assert_eq!(h.on_inbound(&msg), Action::Nothing);
            assert_eq!(h.state(), State::Complete);
            assert_eq!(h.outbound(), None);
        }
    }

    #[test]
    fn test_garbage_is_ignored() {
        let mut h = Handshake::new(peer());
        let msgs = [
            Inbound::Keepalive,
            Inbound::Malformed("HELLO".into()),
            Inbound::PeerList(vec![peer()]),
            Inbound::Registration(b"x".to_vec()),
        ];
        for msg in msgs {
            assert_eq!(h.on_inbound(&msg), Action::Nothing);
            assert_eq!(h.state(), State::Init);
        }
    }

    /// one direction of a lossy network: drops (never twice in a row),
    /// duplicates and delays messages.
    struct Link {
        last_dropped: bool,
        in_flight: Vec<Inbound>,
    }

    impl Link {
        fn new() -> Self {
            Self {
                last_dropped: false,
                in_flight: vec![],
            }
        }

        fn send(&mut self, rng: &mut StdRng, signal: Signal) {
            let drop = !self.last_dropped && rng.gen_bool(0.4);
            self.last_dropped = drop;
            if drop {
                return;
            }

            let msg = Inbound::decode(signal.as_bytes(), Origin::Peer);
            if rng.gen_bool(0.2) {
                self.in_flight.push(msg.clone());
            }
            self.in_flight.push(msg);
        }

        fn deliver(&mut self, rng: &mut StdRng) -> Vec<Inbound> {
            let (mut now, later): (Vec<_>, Vec<_>) = std::mem::take(&mut self.in_flight)
                .into_iter()
                .partition(|_| rng.gen_bool(0.7));
            self.in_flight = later;
            now.shuffle(rng);
            now
        }
    }

    struct Side {
        handshake: Handshake,
        confirm_pending: bool,
    }

    impl Side {
        fn step(&mut self, rng: &mut StdRng, inbound: Vec<Inbound>, out: &mut Link) {
            if self.confirm_pending {
                out.send(rng, Signal::Ack);
                self.confirm_pending = false;
            }

            for msg in inbound {
                match self.handshake.on_inbound(&msg) {
                    Action::Nothing => {}
                    Action::Send(signal) => out.send(rng, signal),
                    Action::Complete => {
                        out.send(rng, Signal::Ack);
                        self.confirm_pending = true;
                    }
                }
            }

            if let Some(signal) = self.handshake.outbound() {
                out.send(rng, signal);
            }
        }
    }

    #[test]
    fn test_converges_under_loss_and_reordering() {
        for seed in 0..64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut a = Side {
                handshake: Handshake::new("10.0.0.1:4000".parse().unwrap()),
                confirm_pending: false,
            };
            let mut b = Side {
                handshake: Handshake::new(peer()),
                confirm_pending: false,
            };
            let (mut a_to_b, mut b_to_a) = (Link::new(), Link::new());

            for _ in 0..500 {
                let to_a = b_to_a.deliver(&mut rng);
                a.step(&mut rng, to_a, &mut a_to_b);
                let to_b = a_to_b.deliver(&mut rng);
                b.step(&mut rng, to_b, &mut b_to_a);

                if a.handshake.state() == State::Complete
                    && b.handshake.state() == State::Complete
                {
                    break;
                }
            }

            assert_eq!(a.handshake.state(), State::Complete, "seed {}", seed);
            assert_eq!(b.handshake.state(), State::Complete, "seed {}", seed);
        }
    }
}
