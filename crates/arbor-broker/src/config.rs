use std::time::Duration;

use arbor_transport::TcpTransportConfig;

use crate::reconfig::{
    DEFAULT_ACK_TIMEOUT, DEFAULT_DEDUP_CAPACITY, DEFAULT_DEFER_TIMEOUT, DEFAULT_MAX_ATTEMPTS,
    DEFAULT_SUBSCRIPTION_TIMEOUT, DEFAULT_UNSUBSCRIPTION_TIMEOUT,
};

/// Which reconfiguration protocol a broker runs, with its timeouts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconfigurationConfig {
    DeferredUnsubscription {
        /// Wait for a FLUSH naming the episode instead of only the timeout.
        notified: bool,
        defer_timeout: Duration,
    },
    InformedLinkActivation {
        subscription_timeout: Duration,
        unsubscription_timeout: Duration,
        ack_timeout: Duration,
        max_attempts: u32,
        dedup_capacity: usize,
    },
}

impl ReconfigurationConfig {
    /// Timed deferred unsubscription with the default timeout.
    pub fn deferred() -> Self {
        Self::DeferredUnsubscription {
            notified: false,
            defer_timeout: DEFAULT_DEFER_TIMEOUT,
        }
    }

    /// Notified deferred unsubscription with the default timeout.
    pub fn notified() -> Self {
        Self::DeferredUnsubscription {
            notified: true,
            defer_timeout: DEFAULT_DEFER_TIMEOUT,
        }
    }

    /// Informed link activation with the default timeouts.
    pub fn informed() -> Self {
        Self::InformedLinkActivation {
            subscription_timeout: DEFAULT_SUBSCRIPTION_TIMEOUT,
            unsubscription_timeout: DEFAULT_UNSUBSCRIPTION_TIMEOUT,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
        }
    }
}

impl Default for ReconfigurationConfig {
    fn default() -> Self {
        Self::deferred()
    }
}

/// Configuration for a [`Broker`](crate::Broker).
///
/// ```rust
/// use arbor_broker::{BrokerConfig, ReconfigurationConfig};
/// use std::time::Duration;
///
/// let config = BrokerConfig::new()
///     .reply_timeout(Duration::from_secs(10))
///     .traffic_class_capacity("MessageClass", 10_000)
///     .reconfiguration(ReconfigurationConfig::informed());
/// ```
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub(crate) transport: TcpTransportConfig,
    pub(crate) handshake_timeout: Duration,
    pub(crate) reply_timeout: Duration,
    pub(crate) sweep_interval: Duration,
    pub(crate) class_capacities: Vec<(String, usize)>,
    pub(crate) reconfiguration: ReconfigurationConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl BrokerConfig {
    pub fn new() -> Self {
        Self {
            transport: TcpTransportConfig::new(),
            handshake_timeout: Duration::from_secs(10),
            reply_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(5),
            class_capacities: Vec::new(),
            reconfiguration: ReconfigurationConfig::default(),
        }
    }

    pub fn transport(mut self, transport: TcpTransportConfig) -> Self {
        self.transport = transport;
        self
    }

    /// Upper bound on the neighbor handshake (default: 10 s).
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// How long a reply row stays open (default: 30 s).
    pub fn reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    /// Period of the expired-reply sweep (default: 5 s).
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Bound the queue of traffic class `name`. Classes are unbounded otherwise.
    pub fn traffic_class_capacity(mut self, name: &str, capacity: usize) -> Self {
        self.class_capacities.retain(|(n, _)| n != name);
        self.class_capacities.push((name.to_string(), capacity));
        self
    }

    pub fn reconfiguration(mut self, reconfiguration: ReconfigurationConfig) -> Self {
        self.reconfiguration = reconfiguration;
        self
    }

    pub fn get_handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    pub fn get_reply_timeout(&self) -> Duration {
        self.reply_timeout
    }

    pub fn get_reconfiguration(&self) -> &ReconfigurationConfig {
        &self.reconfiguration
    }
}

/// Configuration for a [`Client`](crate::Client).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub(crate) transport: TcpTransportConfig,
    pub(crate) handshake_timeout: Duration,
    pub(crate) reply_timeout: Duration,
    pub(crate) sweep_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientConfig {
    /// Outbound-only transport, 10 s handshake, 30 s reply timeout.
    pub fn new() -> Self {
        Self {
            transport: TcpTransportConfig::outbound_only(),
            handshake_timeout: Duration::from_secs(10),
            reply_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(5),
        }
    }

    pub fn transport(mut self, transport: TcpTransportConfig) -> Self {
        self.transport = transport;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// How long replies to a repliable publication are awaited (default: 30 s).
    pub fn reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn get_reply_timeout(&self) -> Duration {
        self.reply_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_broker_config() {
        let config = BrokerConfig::default();
        assert_eq!(config.get_handshake_timeout(), Duration::from_secs(10));
        assert_eq!(config.get_reply_timeout(), Duration::from_secs(30));
        assert_eq!(config.get_reconfiguration(), &ReconfigurationConfig::deferred());
    }

    #[test]
    fn test_class_capacity_replaces_previous() {
        let config = BrokerConfig::new()
            .traffic_class_capacity("MessageClass", 10)
            .traffic_class_capacity("MessageClass", 20);
        assert_eq!(config.class_capacities, vec![("MessageClass".to_string(), 20)]);
    }

    #[test]
    fn test_informed_defaults() {
        match ReconfigurationConfig::informed() {
            ReconfigurationConfig::InformedLinkActivation {
                subscription_timeout,
                unsubscription_timeout,
                ack_timeout,
                max_attempts,
                dedup_capacity,
            } => {
                assert_eq!(subscription_timeout, Duration::from_secs(5));
                assert_eq!(unsubscription_timeout, Duration::from_secs(3));
                assert_eq!(ack_timeout, Duration::from_secs(3));
                assert_eq!(max_attempts, 5);
                assert_eq!(dedup_capacity, 100);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_client_config_is_outbound_only() {
        let config = ClientConfig::new();
        assert!(config.transport.get_listen_addr().is_none());
        assert_eq!(config.get_reply_timeout(), Duration::from_secs(30));
    }
}
