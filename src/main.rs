use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use structopt::StructOpt;
use tokio::io::{stdin, AsyncBufReadExt, BufReader};
use tokio::net::UdpSocket;
use tokio::time::interval;

use holepunch::config::{ClientConfig, ServerConfig};
use holepunch::message::{Inbound, Origin, KEEPALIVE, MAX_DATAGRAM};
use holepunch::udp::{Client, Server};

#[derive(StructOpt, Debug)]
#[structopt(name = "holepunch")]
enum Opt {
    /// register with a mediator, punch holes to the peers and chat with them
    Client(ClientOpt),
    /// run a mediator server
    Server(ServerOpt),
}

#[derive(StructOpt, Debug)]
struct ClientOpt {
    #[structopt(long = "server-addr")]
    server_addr: String,

    /// domain id shared by the peers that should meet
    #[structopt(long = "domain")]
    domain: String,

    /// number of other peers to wait for
    #[structopt(long = "peers", default_value = "1")]
    peers: usize,

    /// overall connect timeout in ms, negative for none
    #[structopt(long = "timeout", default_value = "10000", allow_hyphen_values = true)]
    timeout: i64,

    #[structopt(long = "retry-period", default_value = "100")]
    retry_period: u64,

    /// period of keepalive packets to the peers in ms
    #[structopt(long = "keepalive", default_value = "5000")]
    keepalive: u64,
}

#[derive(StructOpt, Debug)]
struct ServerOpt {
    #[structopt(long = "listen-addr", default_value = "0.0.0.0:5000")]
    listen_addr: SocketAddr,

    /// how long an address stays registered in ms, negative for forever
    #[structopt(long = "domain-timeout", default_value = "40000", allow_hyphen_values = true)]
    domain_timeout: i64,

    /// keepalive period in ms, negative to disable
    #[structopt(long = "keepalive", default_value = "10000", allow_hyphen_values = true)]
    keepalive: i64,

    #[structopt(long = "max-packet-size", default_value = "1024")]
    max_packet_size: usize,
}

fn millis(ms: i64) -> Option<Duration> {
    u64::try_from(ms).ok().map(Duration::from_millis)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let opt: Opt = StructOpt::from_args();

    match opt {
        Opt::Server(opt) => run_server(opt).await,
        Opt::Client(opt) => run_client(opt).await,
    }
}

async fn run_server(opt: ServerOpt) -> Result<(), Box<dyn Error>> {
    let config = ServerConfig {
        domain_timeout: millis(opt.domain_timeout),
        keepalive: millis(opt.keepalive),
        max_packet_size: opt.max_packet_size,
    };

    let s = Server::new(opt.listen_addr).await?.with_config(config);
    s.run().await?;
    Ok(())
}

async fn run_client(opt: ClientOpt) -> Result<(), Box<dyn Error>> {
    let config = ClientConfig {
        timeout: millis(opt.timeout),
        mediator_retry_period: Duration::from_millis(opt.retry_period),
        peer_retry_period: Duration::from_millis(opt.retry_period),
    };

    let c = Client::new(&opt.server_addr, None).await?.with_config(config);
    log::info!("local address {}", c.local_addr()?);

    let (peers, socket) = c.connect(opt.domain.as_bytes(), opt.peers).await?;
    for (i, peer) in peers.iter().enumerate() {
        println!("Peer {}: {}", i, peer);
    }

    let peers = Arc::new(peers);

    let period = Duration::from_millis(opt.keepalive);
    tokio::spawn(keepalive(socket.clone(), peers.clone(), period));
    tokio::spawn(receive(socket.clone(), peers.clone()));

    let mut lines = BufReader::new(stdin()).lines();
    while let Some(msg) = lines.next_line().await? {
        for peer in peers.iter() {
            if let Err(e) = socket.send_to(msg.as_bytes(), *peer).await {
                log::warn!("send to {} failed: {}", peer, e);
            }
        }
        println!("Me: {}", msg);
    }

    Ok(())
}

async fn receive(socket: Arc<UdpSocket>, peers: Arc<Vec<SocketAddr>>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                log::warn!("recv failed: {}", e);
                continue;
            }
        };

        // chat lines are shown as sent, even ones that spell SYN or ACK
        if is_keepalive(&buf[..n]) {
            continue;
        }

        match peers.iter().position(|p| *p == from) {
            Some(i) => println!("Peer {}: {}", i, String::from_utf8_lossy(&buf[..n])),
            None => println!("Peer unknown: {}", String::from_utf8_lossy(&buf[..n])),
        }
    }
}

fn is_keepalive(payload: &[u8]) -> bool {
    matches!(Inbound::decode(payload, Origin::Peer), Inbound::Keepalive)
}

async fn keepalive(socket: Arc<UdpSocket>, peers: Arc<Vec<SocketAddr>>, period: Duration) {
    let mut ticker = interval(period.max(Duration::from_millis(1)));
    loop {
        ticker.tick().await;
        for peer in peers.iter() {
            let _ = socket.send_to(KEEPALIVE, *peer).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_keepalives_are_hidden() {
        assert!(is_keepalive(KEEPALIVE));
        assert!(!is_keepalive(b"SYN"));
        assert!(!is_keepalive(b"ACK"));
        assert!(!is_keepalive(b"hello"));
    }

    #[test]
    fn test_negative_millis_is_unbounded() {
        assert_eq!(millis(-1), None);
        assert_eq!(millis(250), Some(Duration::from_millis(250)));
    }
}
