//! UDP rendezvous and hole punching.
//!
//! use `Server` to run a mediator.
//!
//! use `Client` to find the peers of a domain and punch holes to them.

#[cfg(feature = "client")]
mod client;
#[cfg(feature = "client")]
pub use client::Client;

#[cfg(feature = "client")]
mod punch;
#[cfg(feature = "client")]
pub use punch::{Action, Handshake, State};

#[cfg(feature = "server")]
mod server;
#[cfg(feature = "server")]
pub use server::Server;
