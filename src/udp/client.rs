use socket2::{Domain, Protocol, Socket, Type};
use std::future::pending;
use std::io::{self, ErrorKind::Other};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::net::{lookup_host, UdpSocket};
use tokio::select;
use tokio::task::JoinSet;
use tokio::time::{sleep, sleep_until, Instant};

use super::punch::punch_peers;
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::message::{lossy, Inbound, Origin, MAX_DATAGRAM};

/// Udp hole punching client
///
/// registers a domain id with the mediator until the expected peers are
/// known, then handshakes with all of them over the same socket.
///
/// # example
/// ```no_run
/// use holepunch::udp::Client;
///
/// # async fn run() -> holepunch::Result<()> {
/// let c = Client::new("mediator:5000", None).await?;
/// let (peers, socket) = c.connect(b"room1", 2).await?;
/// for peer in peers {
///     socket.send_to(b"hello", peer).await?;
/// }
/// # Ok(())
/// # }
/// ```
pub struct Client {
    socket: Arc<UdpSocket>,
    mediator: SocketAddr,
    config: ClientConfig,
    deadline: Mutex<Option<Instant>>,
}

impl Client {
    /// resolve the mediator and bind a local socket.
    /// if no local address set, choose according mediator address type(ipv4 or ipv6).
    pub async fn new(mediator: &str, local_addr: Option<SocketAddr>) -> Result<Self> {
        let mediator = lookup_host(mediator)
            .await?
            .next()
            .ok_or_else(|| io::Error::new(Other, "mediator name resolve fail"))?;

        let local_addr = local_addr.unwrap_or_else(|| Self::choose_bind_addr(mediator));
        let socket = Self::bind(local_addr)?;

        Ok(Self::from_parts(socket, mediator))
    }

    /// use an already bound socket.
    pub fn new_with_socket(mediator: SocketAddr, socket: std::net::UdpSocket) -> Result<Self> {
        socket.set_nonblocking(true)?;
        let socket = UdpSocket::from_std(socket)?;

        Ok(Self::from_parts(socket, mediator))
    }

    fn from_parts(socket: UdpSocket, mediator: SocketAddr) -> Self {
        Self {
            socket: Arc::new(socket),
            mediator,
            config: Default::default(),
            deadline: Mutex::new(None),
        }
    }

    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    fn choose_bind_addr(mediator: SocketAddr) -> SocketAddr {
        match mediator {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        }
    }

    fn bind(local_addr: SocketAddr) -> io::Result<UdpSocket> {
        let socket = Socket::new(
            Domain::for_address(local_addr),
            Type::DGRAM,
            Some(Protocol::UDP),
        )?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&local_addr.into())?;

        UdpSocket::from_std(socket.into())
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn mediator_addr(&self) -> SocketAddr {
        self.mediator
    }

    /// the shared socket. It stays open after every phase, successful or not.
    pub fn socket(&self) -> Arc<UdpSocket> {
        self.socket.clone()
    }

    fn arm_deadline(&self) -> Option<Instant> {
        let deadline = self.config.timeout.map(|t| Instant::now() + t);
        *self.deadline.lock().unwrap_or_else(PoisonError::into_inner) = deadline;
        deadline
    }

    // reuse the running deadline, or arm a new one once it has passed
    fn phase_deadline(&self) -> Option<Instant> {
        let timeout = self.config.timeout?;
        let mut deadline = self.deadline.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();

        match *deadline {
            Some(d) if d > now => Some(d),
            _ => {
                *deadline = Some(now + timeout);
                *deadline
            }
        }
    }

    /// register under `domain` and handshake with the `expected` peers it
    /// announces, all within one timeout.
    ///
    /// Returns the peers and the socket to talk to them. On error the socket is
    /// still available through [`socket`](Self::socket), and timeouts carry the
    /// peers known so far.
    pub async fn connect(
        &self,
        domain: &[u8],
        expected: usize,
    ) -> Result<(Vec<SocketAddr>, Arc<UdpSocket>)> {
        let deadline = self.arm_deadline();

        let peers = self.register_until(domain, expected, deadline).await?;
        punch_peers(
            &self.socket,
            &peers,
            self.config.peer_period(),
            deadline,
        )
        .await?;

        Ok((peers, self.socket()))
    }

    /// only the mediator phase of [`connect`](Self::connect).
    pub async fn register(&self, domain: &[u8], expected: usize) -> Result<Vec<SocketAddr>> {
        let deadline = self.phase_deadline();
        self.register_until(domain, expected, deadline).await
    }

    /// only the handshake phase of [`connect`](Self::connect), e.g. with the
    /// partial peer set of a [`Error::MediatorTimeout`].
    pub async fn punch(&self, peers: &[SocketAddr]) -> Result<()> {
        let deadline = self.phase_deadline();
        punch_peers(
            &self.socket,
            peers,
            self.config.peer_period(),
            deadline,
        )
        .await
    }

    async fn register_until(
        &self,
        domain: &[u8],
        expected: usize,
        deadline: Option<Instant>,
    ) -> Result<Vec<SocketAddr>> {
        if expected == 0 {
            self.socket.send_to(domain, self.mediator).await?;
            return Ok(vec![]);
        }

        // dropped on return, which stops the retries
        let mut sender = JoinSet::new();
        {
            let socket = self.socket.clone();
            let mediator = self.mediator;
            let domain = domain.to_vec();
            let period = self.config.mediator_period();
            sender.spawn(async move {
                loop {
                    if let Err(e) = socket.send_to(&domain, mediator).await {
                        return e;
                    }
                    sleep(period).await;
                }
            });
        }

        log::debug!(domain:% = lossy(domain), mediator:% = self.mediator; "registering");

        let expired = wait_until(deadline);
        tokio::pin!(expired);
        let mut known = Vec::new();
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            select! {
                _ = &mut expired => {
                    return Err(Error::MediatorTimeout { expected, known });
                }
                Some(joined) = sender.join_next() => {
                    let e = joined.unwrap_or_else(|e| io::Error::new(Other, e));
                    return Err(e.into());
                }
                res = self.socket.recv_from(&mut buf) => {
                    let (n, from) = res?;

                    if from != self.mediator {
                        log::trace!("ignoring packet from {} while registering", from);
                    } else {
                        match Inbound::decode(&buf[..n], Origin::Mediator) {
                            Inbound::PeerList(peers) => {
                                log::debug!(known = peers.len(), expected = expected; "mediator reply");
                                // the reply is the full current set, so it replaces what we had
                                known = peers;
                                if known.len() == expected {
                                    return Ok(known);
                                }
                            }
                            Inbound::Keepalive => log::trace!("keepalive from mediator"),
                            other => log::warn!("ignoring mediator reply: {:?}", other),
                        }
                    }
                }
            }
        }
    }
}

pub(crate) async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(d) => sleep_until(d).await,
        None => pending().await,
    }
}
