use std::io::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};

use crate::config::ServerConfig;
use crate::message::{encode_peer_list, lossy, Inbound, Origin, KEEPALIVE};
use crate::store::{AddressStore, DomainAddrMap};

/// Udp mediator server
///
/// remembers the observed address of every client per domain, and answers each
/// registration with the other addresses of that domain.
pub struct Server {
    socket: Arc<UdpSocket>,
    store: Arc<dyn AddressStore>,
    config: ServerConfig,
}

impl Server {
    pub async fn new<A: ToSocketAddrs>(listen_addr: A) -> Result<Self> {
        let socket = UdpSocket::bind(listen_addr).await?;

        Ok(Self {
            socket: Arc::new(socket),
            store: Arc::new(DomainAddrMap::new()),
            config: Default::default(),
        })
    }

    pub fn with_config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// replace the default in-memory store.
    pub fn with_store(mut self, store: Arc<dyn AddressStore>) -> Self {
        self.store = store;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// serve until the task is dropped. Errors on single datagrams are logged, never returned.
    pub async fn run(self) -> Result<()> {
        log::info!("server listening on {}", self.socket.local_addr()?);

        // dropped with this future, which stops the keepalive loop too
        let mut background = JoinSet::new();
        if let Some(period) = self.config.keepalive_period() {
            let socket = self.socket.clone();
            let store = self.store.clone();
            background.spawn(Self::keepalive_loop(socket, store, period));
        }

        // twice the limit, so an oversized datagram is seen as such rather than truncated to fit
        let mut buf = vec![0u8; 2 * self.config.max_packet_size.max(1)];

        loop {
            let (size, addr) = match self.socket.recv_from(&mut buf).await {
                Ok(r) => r,
                Err(e) => {
                    log::error!("recv_from failed: {}", e);
                    continue;
                }
            };

            if size > self.config.max_packet_size {
                log::warn!(
                    addr:% = addr,
                    size = size,
                    max = self.config.max_packet_size;
                    "dropping oversized packet"
                );
                continue;
            }

            match Inbound::decode(&buf[..size], Origin::Client) {
                Inbound::Keepalive => log::trace!(addr:% = addr; "keepalive"),
                Inbound::Registration(domain) => {
                    let socket = self.socket.clone();
                    let store = self.store.clone();
                    let ttl = self.config.domain_timeout;
                    tokio::spawn(async move {
                        let res =
                            Self::handle_registration(&socket, &*store, domain, addr, ttl).await;
                        if let Err(e) = res {
                            log::error!(addr:% = addr; "registration failed: {}", e);
                        }
                    });
                }
                other => log::debug!(addr:% = addr; "unexpected {:?}", other),
            }
        }
    }

    async fn handle_registration(
        socket: &UdpSocket,
        store: &dyn AddressStore,
        domain: Vec<u8>,
        addr: SocketAddr,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let peers = store.register(&domain, addr, ttl)?;
        let payload = encode_peer_list(&peers);

        socket.send_to(&payload, addr).await?;

        log::debug!(
            addr:% = addr,
            domain:% = lossy(&domain),
            payload:% = lossy(&payload);
            "replied"
        );
        Ok(())
    }

    async fn keepalive_loop(
        socket: Arc<UdpSocket>,
        store: Arc<dyn AddressStore>,
        period: Duration,
    ) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let addrs = match store.list_all() {
                Ok(addrs) => addrs,
                Err(e) => {
                    log::error!("could not list addresses: {}", e);
                    continue;
                }
            };

            log::trace!("sending keepalive to {} addresses", addrs.len());

            for addr in addrs {
                if let Err(e) = socket.send_to(KEEPALIVE, addr).await {
                    log::warn!(addr:% = addr; "keepalive failed: {}", e);
                }
            }
        }
    }
}
