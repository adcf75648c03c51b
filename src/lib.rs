//!A UDP rendezvous protocol to help peers behind NAT find each other and punch holes.
//!
//!Two peers behind NAT or a firewall can't reach each other until each one has
//!sent the other traffic first, and neither knows the other's public address.
//!
//!## How it works
//!Setup a public accessible mediator server. A client sends the mediator a domain id, any
//!bytes the application picks to group peers. The mediator remembers the address it
//!observed for the client and replies with the addresses already registered under the same
//!domain. Clients keep registering until they know as many peers as they expect.
//!
//!Then every client sends `SYN` to every peer, switches to `ACK` once it hears the peer's
//!`SYN`, and is done once it hears an `ACK`. The outbound packets open the local NAT mapping,
//!so the peer's packets get through.
//!
//!The essential is, we must use the same socket to talk with the mediator and the peers.
//!The socket is returned to the caller afterwards, as a [`tokio::net::UdpSocket`].
//!
//!## Feature flags
//!For convenient, the crate include both client and server code by default.
//!Mostly you only use client or server code, set features to `client` or `server` instead.
//!
//!```toml
//!holepunch = { version = "0.1", default-features=false, features=["client"]}
//!```
//!
//!- `client`: hole punching client
//!- `server`: mediator server

pub mod config;
pub mod error;
pub mod message;
#[cfg(feature = "server")]
pub mod store;
pub mod udp;

pub use error::{Error, Result};
