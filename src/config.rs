//! Tunables for the client connector and the mediator server.
//!
//! A `None` duration means "unbounded": no deadline, no expiry, no keepalive.

use std::time::Duration;

/// Keepalive periods below this are raised to it.
pub const MIN_KEEPALIVE: Duration = Duration::from_secs(1);

/// Retry periods below this are raised to it.
pub const MIN_RETRY_PERIOD: Duration = Duration::from_millis(1);

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Overall deadline for [`connect`](crate::udp::Client::connect).
    pub timeout: Option<Duration>,
    /// Interval between registration datagrams to the mediator.
    pub mediator_retry_period: Duration,
    /// Interval between handshake retransmissions to each peer.
    pub peer_retry_period: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Some(Duration::from_secs(10)),
            mediator_retry_period: Duration::from_millis(100),
            peer_retry_period: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// How long a registered address stays in its domain without re-registration.
    pub domain_timeout: Option<Duration>,
    /// Period of the zero-length datagrams sent to every known address.
    pub keepalive: Option<Duration>,
    /// Registrations with a larger payload are dropped.
    pub max_packet_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            domain_timeout: Some(Duration::from_secs(40)),
            keepalive: Some(Duration::from_secs(10)),
            max_packet_size: 1024,
        }
    }
}

impl ClientConfig {
    pub(crate) fn mediator_period(&self) -> Duration {
        self.mediator_retry_period.max(MIN_RETRY_PERIOD)
    }

    pub(crate) fn peer_period(&self) -> Duration {
        self.peer_retry_period.max(MIN_RETRY_PERIOD)
    }
}

impl ServerConfig {
    pub(crate) fn keepalive_period(&self) -> Option<Duration> {
        self.keepalive.map(|t| t.max(MIN_KEEPALIVE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keepalive_clamped() {
        let mut c = ServerConfig {
            keepalive: Some(Duration::from_millis(10)),
            ..Default::default()
        };
        assert_eq!(c.keepalive_period(), Some(MIN_KEEPALIVE));

        c.keepalive = Some(Duration::from_secs(5));
        assert_eq!(c.keepalive_period(), Some(Duration::from_secs(5)));

        c.keepalive = None;
        assert_eq!(c.keepalive_period(), None);
    }

    #[test]
    fn test_retry_periods_clamped() {
        let mut c = ClientConfig {
            mediator_retry_period: Duration::ZERO,
            peer_retry_period: Duration::ZERO,
            ..Default::default()
        };
        assert_eq!(c.mediator_period(), MIN_RETRY_PERIOD);
        assert_eq!(c.peer_period(), MIN_RETRY_PERIOD);

        c.peer_retry_period = Duration::from_millis(250);
        assert_eq!(c.peer_period(), Duration::from_millis(250));
        assert_eq!(ClientConfig::default().mediator_period(), Duration::from_millis(100));
    }
}
