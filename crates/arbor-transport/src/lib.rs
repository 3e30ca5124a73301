//! Arbor transport layer.
//!
//! Point-to-point links that carry subject-tagged opaque payloads. A
//! [`Transport`] opens and accepts [`Link`]s and reports their lifecycle
//! (opened / closed / crashed) and incoming payloads to registered
//! listeners. [`TcpTransport`] is the TCP implementation, addressed by
//! URLs of the form `arbor-tcp:host:port`.
//!
//! Wire format: 4-byte big-endian length prefix, then a MessagePack frame.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use arbor_transport::{LinkId, TcpTransport, TcpTransportConfig, Transport};
//!
//! # async fn example() -> Result<(), arbor_transport::TransportError> {
//! let transport = TcpTransport::new(TcpTransportConfig::new());
//! transport.start().await?;
//! println!("Listening on {:?}", transport.local_url());
//!
//! let link = transport
//!     .open_link("arbor-tcp:127.0.0.1:1911", LinkId::next())
//!     .await?;
//! link.send("greeting", b"hello")?;
//! link.close();
//!
//! transport.stop().await;
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod link;
mod listener;
mod protocol;
mod tcp;
mod transport;
mod url;

pub use config::TcpTransportConfig;
pub use error::TransportError;
pub use link::{Link, LinkId};
pub use listener::{ConnectivityListener, DataListener, ListenerRegistry, ListenerSet};
pub use tcp::{TcpTransport, TCP_SCHEME};
pub use transport::Transport;
pub use url::{scheme_of, NodeUrl};
