use std::sync::Arc;

use crate::{ConnectivityListener, DataListener, Link, LinkId, TransportError};

/// A kind of point-to-point connectivity (TCP, ...).
///
/// Implementations notify registered listeners of link lifecycle events
/// and of payloads arriving on any of their links.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Start accepting connections. Idempotent.
    async fn start(&self) -> Result<(), TransportError>;

    /// Stop accepting connections and close every open link. Idempotent.
    async fn stop(&self);

    fn is_running(&self) -> bool;

    /// URLs under which this transport is reachable.
    fn urls(&self) -> Vec<String>;

    /// Whether URLs with this scheme are handled by this transport.
    fn knows_protocol(&self, scheme: &str) -> bool;

    /// Open a link to `url`, using the pre-allocated `id`.
    async fn open_link(&self, url: &str, id: LinkId) -> Result<Link, TransportError>;

    fn open_links(&self) -> Vec<Link>;

    fn set_beaconing(&self, enabled: bool);

    fn is_beaconing(&self) -> bool;

    fn add_data_listener(&self, subject: &str, listener: Arc<dyn DataListener>);

    fn remove_data_listener(&self, subject: &str, listener: &Arc<dyn DataListener>);

    fn add_connectivity_listener(&self, listener: Arc<dyn ConnectivityListener>);

    fn remove_connectivity_listener(&self, listener: &Arc<dyn ConnectivityListener>);
}
