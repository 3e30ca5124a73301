/// Errors returned by the Arbor transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to bind listener: {0}")]
    Bind(#[source] std::io::Error),

    #[error("connection to {url} failed: {source}")]
    Connect {
        url: String,
        #[source]
        source: std::io::Error,
    },

    #[error("link is not connected")]
    NotConnected,

    #[error("transport is not running")]
    NotRunning,

    #[error("malformed url: {0}")]
    MalformedUrl(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame serialization failed: {0}")]
    Serialization(String),

    #[error("frame deserialization failed: {0}")]
    Deserialization(String),

    #[error("frame too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<rmp_serde::encode::Error> for TransportError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        TransportError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for TransportError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        TransportError::Deserialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_too_large() {
        let err = TransportError::MessageTooLarge { size: 10, max: 4 };
        assert_eq!(err.to_string(), "frame too large: 10 bytes (max 4)");
    }

    #[test]
    fn test_display_malformed_url() {
        let err = TransportError::MalformedUrl("nope".into());
        assert_eq!(err.to_string(), "malformed url: nope");
    }
}
