//! Wire format.
//!
//! There is no framing: a datagram is one message. Registrations carry the
//! raw domain id, the mediator answers with `host:port` endpoints joined by
//! commas, peers exchange `SYN` and `ACK`, and a zero-length datagram is a
//! keepalive everywhere.
//!
//! Inbound datagrams are decoded once into [`Inbound`]; what a payload means
//! depends on who sent it, see [`Origin`].

use std::borrow::Cow;
use std::net::SocketAddr;

pub const SYN: &[u8] = b"SYN";
pub const ACK: &[u8] = b"ACK";
pub const KEEPALIVE: &[u8] = b"";

/// Largest UDP payload, used to size receive buffers.
pub const MAX_DATAGRAM: usize = 0xffff;

/// Application chosen key grouping peers that should meet.
pub type DomainId = Vec<u8>;

/// Who a datagram came from, as far as the receiver can tell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// A client talking to the mediator.
    Client,
    /// The mediator talking to a client.
    Mediator,
    /// Another client during the handshake.
    Peer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Keepalive,
    Registration(DomainId),
    PeerList(Vec<SocketAddr>),
    Syn,
    Ack,
    Malformed(String),
}

impl Inbound {
    pub fn decode(payload: &[u8], origin: Origin) -> Self {
        if payload.is_empty() {
            return Inbound::Keepalive;
        }

        match origin {
            Origin::Client => Inbound::Registration(payload.to_vec()),
            Origin::Mediator => match parse_peer_list(payload) {
                Ok(peers) => Inbound::PeerList(peers),
                Err(e) => Inbound::Malformed(e),
            },
            Origin::Peer => match payload {
                SYN => Inbound::Syn,
                ACK => Inbound::Ack,
                _ => Inbound::Malformed(format!("unexpected payload {:?}", lossy(payload))),
            },
        }
    }
}

/// Outbound handshake message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Syn,
    Ack,
}

impl Signal {
    pub fn as_bytes(self) -> &'static [u8] {
        match self {
            Signal::Syn => SYN,
            Signal::Ack => ACK,
        }
    }
}

pub fn encode_peer_list(peers: &[SocketAddr]) -> Vec<u8> {
    peers
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(",")
        .into_bytes()
}

/// parse a mediator reply. An empty payload is an empty list.
pub fn parse_peer_list(payload: &[u8]) -> Result<Vec<SocketAddr>, String> {
    if payload.is_empty() {
        return Ok(vec![]);
    }

    let text = std::str::from_utf8(payload).map_err(|_| "peer list is not utf-8".to_string())?;

    text.split(',')
        .map(|s| {
            s.parse::<SocketAddr>()
                .map_err(|_| format!("invalid peer address {:?}", s))
        })
        .collect()
}

pub(crate) fn lossy(domain: &[u8]) -> Cow<'_, str> {
    String::from_utf8_lossy(domain)
}
