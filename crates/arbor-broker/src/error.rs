/// Broker-level errors.
///
/// Wraps transport errors and adds the overlay, admission and reply
/// failures seen by callers of the broker and client APIs.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("transport error: {0}")]
    Transport(#[from] arbor_transport::TransportError),

    #[error("component is not running")]
    NotRunning,

    #[error("not connected to {neighbor}")]
    NotConnected { neighbor: String },

    #[error("connection to {url} failed: {reason}")]
    ConnectError { url: String, reason: String },

    #[error("{neighbor} is already a neighbor")]
    AlreadyNeighbor { neighbor: String },

    #[error("malformed address: {0}")]
    MalformedAddress(String),

    #[error("no reply for message {message_id} within the deadline")]
    ReplyTimeout { message_id: String },

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<rmp_serde::encode::Error> for BrokerError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        BrokerError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for BrokerError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        BrokerError::Deserialization(e.to_string())
    }
}
