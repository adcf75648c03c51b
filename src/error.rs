use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Errors returned by the client connector.
///
/// Both timeout variants carry what was achieved before the deadline, so a
/// caller can resume with a narrower operation instead of starting over.
#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The mediator did not announce the expected number of peers in time.
    #[error("timed out waiting for mediator, {} of {expected} peers known", .known.len())]
    MediatorTimeout {
        expected: usize,
        known: Vec<SocketAddr>,
    },

    /// Not every peer acknowledged the handshake in time.
    #[error("timed out punching peers, {} of {} not acknowledged", .pending.len(), .peers.len())]
    PunchTimeout {
        peers: Vec<SocketAddr>,
        pending: Vec<SocketAddr>,
    },

    #[error("handshake with {0} cancelled")]
    Cancelled(SocketAddr),
}

impl Error {
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Error::MediatorTimeout { .. } | Error::PunchTimeout { .. }
        )
    }

    /// peers learned before a timeout, if any phase got that far.
    pub fn known_peers(&self) -> Option<&[SocketAddr]> {
        match self {
            Error::MediatorTimeout { known, .. } => Some(known),
            Error::PunchTimeout { peers, .. } => Some(peers),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
