use std::net::SocketAddr;
use std::time::Duration;

/// Configuration for a [`TcpTransport`](crate::TcpTransport).
///
/// All fields have sensible defaults. Use the builder pattern:
///
/// ```rust
/// use arbor_transport::TcpTransportConfig;
/// use std::time::Duration;
///
/// let config = TcpTransportConfig::new()
///     .max_frame_size(2 * 1024 * 1024)
///     .beacon_interval(Duration::from_millis(500));
/// ```
#[derive(Debug, Clone)]
pub struct TcpTransportConfig {
    /// Address to accept connections on. `None` for an outbound-only transport.
    pub(crate) listen_addr: Option<SocketAddr>,
    /// Maximum frame size in bytes, both directions.
    pub(crate) max_frame_size: usize,
    /// Upper bound on establishing an outbound connection.
    pub(crate) connect_timeout: Duration,
    /// Period of liveness beacons. `None` disables beaconing.
    pub(crate) beacon_interval: Option<Duration>,
    /// Beacon periods of silence after which a link is declared crashed.
    pub(crate) beacon_misses: u32,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpTransportConfig {
    /// Create a new config with defaults.
    ///
    /// Listens on `127.0.0.1:0` unless the `ARBOR_LISTEN_ADDR` environment
    /// variable holds a socket address. Override with [`.listen_addr()`](Self::listen_addr).
    pub fn new() -> Self {
        let listen_addr = std::env::var("ARBOR_LISTEN_ADDR")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 0)));

        Self {
            listen_addr: Some(listen_addr),
            max_frame_size: 1024 * 1024, // 1 MB
            connect_timeout: Duration::from_secs(5),
            beacon_interval: None,
            beacon_misses: 3,
        }
    }

    /// A transport that only dials out (client nodes).
    pub fn outbound_only() -> Self {
        Self {
            listen_addr: None,
            ..Self::new()
        }
    }

    /// Set the address to accept connections on.
    pub fn listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = Some(addr);
        self
    }

    /// Set maximum frame size (default: 1 MB).
    pub fn max_frame_size(mut self, bytes: usize) -> Self {
        self.max_frame_size = bytes;
        self
    }

    /// Set the outbound connect timeout (default: 5 s).
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Enable liveness beacons with the given period (default: off).
    pub fn beacon_interval(mut self, interval: Duration) -> Self {
        self.beacon_interval = Some(interval);
        self
    }

    /// Set how many silent beacon periods declare a crash (default: 3).
    pub fn beacon_misses(mut self, misses: u32) -> Self {
        self.beacon_misses = misses.max(1);
        self
    }

    pub fn get_listen_addr(&self) -> Option<SocketAddr> {
        self.listen_addr
    }

    pub fn get_max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbound_only_has_no_listener() {
        let config = TcpTransportConfig::outbound_only();
        assert!(config.get_listen_addr().is_none());
        assert_eq!(config.get_max_frame_size(), 1024 * 1024);
    }

    #[test]
    fn beacon_misses_never_zero() {
        let config = TcpTransportConfig::new().beacon_misses(0);
        assert_eq!(config.beacon_misses, 1);
    }
}
