//! Neighbor admission and bookkeeping.
//!
//! Every new raw link runs a tie-break handshake: both ends send their
//! descriptor on `OPEN`, the higher-ordered end decides (`CONFIRM_OPEN` or
//! `ALREADY_NEIGHBOR`), the lower end waits for the verdict. This keeps at
//! most one link per pair of nodes, even when both dial at once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arbor_transport::{
    scheme_of, ConnectivityListener, DataListener, Link, LinkId, ListenerSet, Transport,
    TransportError,
};
use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::descriptor::NodeDescriptor;
use crate::error::BrokerError;
use crate::types::{NodeId, ReconfigurationId, ReconfigurationInfo};

pub const OPEN: &str = "__TOPOLOGY_OPEN";
pub const CONFIRM_OPEN: &str = "__TOPOLOGY_CONFIRM_OPEN";
pub const ALREADY_NEIGHBOR: &str = "__TOPOLOGY_ALREADY_NEIGHBOR";

/// Observer of neighborhood changes.
pub trait NeighborhoodListener: Send + Sync {
    /// `reconfiguration` is set when the link was opened to repair a failure.
    fn neighbor_added(&self, neighbor: &NodeDescriptor, reconfiguration: Option<ReconfigurationId>);

    /// The link to `neighbor` was closed cleanly.
    fn neighbor_removed(&self, neighbor: &NodeDescriptor);

    /// The link to `neighbor` was lost.
    fn neighbor_dead(&self, neighbor: &NodeDescriptor, reconfiguration: Option<&ReconfigurationInfo>);
}

/// Outcome of a pending admission.
#[derive(Debug)]
enum Admission {
    Accepted(NodeDescriptor),
    AlreadyNeighbor(String),
    Failed(String),
}

#[derive(Default)]
struct Neighbors {
    links: HashMap<NodeDescriptor, Link>,
    by_link: HashMap<LinkId, NodeDescriptor>,
}

impl Neighbors {
    fn insert(&mut self, node: NodeDescriptor, link: Link) -> Option<Link> {
        let previous = self.links.insert(node.clone(), link.clone());
        if let Some(old) = &previous {
            self.by_link.remove(&old.id());
        }
        self.by_link.insert(link.id(), node);
        previous
    }

    fn remove_link(&mut self, id: LinkId) -> Option<NodeDescriptor> {
        let node = self.by_link.remove(&id)?;
        self.links.remove(&node);
        Some(node)
    }
}

/// Owns the set of neighbor links of the local node.
#[derive(Clone)]
pub struct TopologyManager {
    inner: Arc<TopologyInner>,
}

struct TopologyInner {
    local: NodeDescriptor,
    handshake_timeout: Duration,
    running: AtomicBool,
    transports: RwLock<Vec<Arc<dyn Transport>>>,
    neighbors: Mutex<Neighbors>,
    /// Descriptors received on `OPEN` by the lower end, awaiting a verdict.
    peers: Mutex<HashMap<LinkId, NodeDescriptor>>,
    pending: Mutex<HashMap<LinkId, oneshot::Sender<Admission>>>,
    reconfigurations: Mutex<HashMap<LinkId, ReconfigurationId>>,
    hints: Mutex<HashMap<NodeId, ReconfigurationInfo>>,
    listeners: ListenerSet<dyn NeighborhoodListener>,
}

impl TopologyManager {
    pub fn new(local: NodeDescriptor, handshake_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(TopologyInner {
                local,
                handshake_timeout,
                running: AtomicBool::new(false),
                transports: RwLock::new(Vec::new()),
                neighbors: Mutex::new(Neighbors::default()),
                peers: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                reconfigurations: Mutex::new(HashMap::new()),
                hints: Mutex::new(HashMap::new()),
                listeners: ListenerSet::new(),
            }),
        }
    }

    pub fn local(&self) -> &NodeDescriptor {
        &self.inner.local
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Start every transport and publish their URLs in the local descriptor.
    pub async fn start(&self) -> Result<(), BrokerError> {
        if self.is_running() {
            return Ok(());
        }
        for transport in self.transports() {
            transport.start().await?;
            for url in transport.urls() {
                self.inner.local.add_url(&url);
            }
        }
        self.inner.running.store(true, Ordering::Release);
        info!("{} started", self.inner.local);
        Ok(())
    }

    /// Stop every transport. Open links close, firing neighbor-removed.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        for transport in self.transports() {
            for url in transport.urls() {
                self.inner.local.remove_url(&url);
            }
            transport.stop().await;
        }
        info!("{} stopped", self.inner.local);
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    pub fn add_transport(&self, transport: Arc<dyn Transport>) {
        let data: Arc<dyn DataListener> = self.inner.clone();
        for subject in [OPEN, CONFIRM_OPEN, ALREADY_NEIGHBOR] {
            transport.add_data_listener(subject, data.clone());
        }
        transport.add_connectivity_listener(self.inner.clone());
        if self.is_running() {
            for url in transport.urls() {
                self.inner.local.add_url(&url);
            }
        }
        self.inner.transports.write().push(transport);
    }

    pub fn remove_transport(&self, transport: &Arc<dyn Transport>) {
        let data: Arc<dyn DataListener> = self.inner.clone();
        for subject in [OPEN, CONFIRM_OPEN, ALREADY_NEIGHBOR] {
            transport.remove_data_listener(subject, &data);
        }
        let connectivity: Arc<dyn ConnectivityListener> = self.inner.clone();
        transport.remove_connectivity_listener(&connectivity);
        for url in transport.urls() {
            self.inner.local.remove_url(&url);
        }
        self.inner
            .transports
            .write()
            .retain(|t| !Arc::ptr_eq(t, transport));
    }

    pub fn transports(&self) -> Vec<Arc<dyn Transport>> {
        self.inner.transports.read().clone()
    }

    // ── Admission ───────────────────────────────────────────────────

    /// Connect to `url` and wait for the handshake verdict.
    pub async fn add_neighbor(&self, url: &str) -> Result<NodeDescriptor, BrokerError> {
        self.connect(url, None).await
    }

    /// Like [`add_neighbor`](Self::add_neighbor), for a link that repairs
    /// the failure identified by `id`. The neighbor-added event carries it.
    pub async fn add_neighbor_with_reconfiguration(
        &self,
        url: &str,
        id: ReconfigurationId,
    ) -> Result<NodeDescriptor, BrokerError> {
        self.connect(url, Some(id)).await
    }

    /// Best-effort admission in the background. Only addressing and
    /// lifecycle errors are reported; connection failures are logged.
    pub fn tentatively_add_neighbor(&self, url: &str) -> Result<(), BrokerError> {
        if !self.is_running() {
            return Err(BrokerError::NotRunning);
        }
        self.transport_for(url)?;
        let this = self.clone();
        let url = url.to_string();
        tokio::spawn(async move {
            if let Err(e) = this.add_neighbor(&url).await {
                debug!("tentative connection to {url} failed: {e}");
            }
        });
        Ok(())
    }

    /// Close the link to `node`. Neighbor-removed fires once it is closed.
    pub fn remove_neighbor(&self, node: &NodeDescriptor) {
        if let Some(link) = self.link_for(node) {
            link.close();
        }
    }

    async fn connect(
        &self,
        url: &str,
        reconfiguration: Option<ReconfigurationId>,
    ) -> Result<NodeDescriptor, BrokerError> {
        if !self.is_running() {
            return Err(BrokerError::NotRunning);
        }
        let transport = self.transport_for(url)?;

        let id = LinkId::next();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(id, tx);
        if let Some(r) = reconfiguration {
            self.inner.reconfigurations.lock().insert(id, r);
        }

        let link = match transport.open_link(url, id).await {
            Ok(link) => link,
            Err(e) => {
                self.inner.pending.lock().remove(&id);
                self.inner.reconfigurations.lock().remove(&id);
                return Err(match e {
                    TransportError::MalformedUrl(_) => BrokerError::MalformedAddress(url.into()),
                    other => BrokerError::ConnectError {
                        url: url.into(),
                        reason: other.to_string(),
                    },
                });
            }
        };

        match tokio::time::timeout(self.inner.handshake_timeout, rx).await {
            Ok(Ok(Admission::Accepted(node))) => Ok(node),
            Ok(Ok(Admission::AlreadyNeighbor(neighbor))) => {
                Err(BrokerError::AlreadyNeighbor { neighbor })
            }
            Ok(Ok(Admission::Failed(reason))) => Err(BrokerError::ConnectError {
                url: url.into(),
                reason,
            }),
            Ok(Err(_)) => Err(BrokerError::ConnectError {
                url: url.into(),
                reason: "handshake abandoned".into(),
            }),
            Err(_) => {
                self.inner.pending.lock().remove(&id);
                link.close();
                Err(BrokerError::ConnectError {
                    url: url.into(),
                    reason: "handshake timed out".into(),
                })
            }
        }
    }

    fn transport_for(&self, url: &str) -> Result<Arc<dyn Transport>, BrokerError> {
        let scheme = scheme_of(url).ok_or_else(|| BrokerError::MalformedAddress(url.into()))?;
        self.inner
            .transports
            .read()
            .iter()
            .find(|t| t.knows_protocol(scheme))
            .cloned()
            .ok_or_else(|| BrokerError::MalformedAddress(url.into()))
    }

    // ── Reconfiguration hints ───────────────────────────────────────

    /// Attach reconfiguration data to the next death of `node`.
    pub fn set_reconfiguration_hint(&self, node: &NodeDescriptor, info: ReconfigurationInfo) {
        self.inner.hints.lock().insert(node.id(), info);
    }

    // ── Queries ─────────────────────────────────────────────────────

    pub fn neighbors(&self) -> Vec<NodeDescriptor> {
        self.inner.neighbors.lock().links.keys().cloned().collect()
    }

    pub fn neighbors_except(&self, excluded: &NodeDescriptor) -> Vec<NodeDescriptor> {
        self.inner
            .neighbors
            .lock()
            .links
            .keys()
            .filter(|n| *n != excluded)
            .cloned()
            .collect()
    }

    pub fn is_neighbor(&self, node: &NodeDescriptor) -> bool {
        self.inner.neighbors.lock().links.contains_key(node)
    }

    pub fn link_for(&self, node: &NodeDescriptor) -> Option<Link> {
        self.inner.neighbors.lock().links.get(node).cloned()
    }

    pub fn neighbor_for(&self, link: LinkId) -> Option<NodeDescriptor> {
        self.inner.neighbors.lock().by_link.get(&link).cloned()
    }

    pub fn number_of_neighbors(&self) -> usize {
        self.inner.neighbors.lock().links.len()
    }

    pub fn number_of_brokers(&self) -> usize {
        self.inner
            .neighbors
            .lock()
            .links
            .keys()
            .filter(|n| n.is_broker())
            .count()
    }

    pub fn number_of_clients(&self) -> usize {
        self.inner
            .neighbors
            .lock()
            .links
            .keys()
            .filter(|n| n.is_client())
            .count()
    }

    // ── Listeners ───────────────────────────────────────────────────

    pub fn add_neighborhood_listener(&self, listener: Arc<dyn NeighborhoodListener>) {
        self.inner.listeners.add(listener);
    }

    pub fn remove_neighborhood_listener(&self, listener: &Arc<dyn NeighborhoodListener>) {
        self.inner.listeners.remove(listener);
    }
}

impl TopologyInner {
    fn resolve(&self, link: LinkId, admission: Admission) {
        if let Some(tx) = self.pending.lock().remove(&link) {
            let _ = tx.send(admission);
        }
    }

    fn send_control(&self, link: &Link, subject: &str) {
        if let Err(e) = link.send(subject, &[]) {
            debug!("sending {subject} on {link} failed: {e}");
        }
    }

    fn handle_open(&self, link: &Link, peer: NodeDescriptor) {
        if peer == self.local {
            warn!("{link} loops back to {}", self.local);
            link.close();
            self.resolve(link.id(), Admission::Failed("connected to self".into()));
            return;
        }

        if self.local < peer {
            // The peer decides.
            self.peers.lock().insert(link.id(), peer);
            return;
        }

        let added = {
            let mut neighbors = self.neighbors.lock();
            if neighbors.links.contains_key(&peer) {
                false
            } else {
                // Confirm before anything else can reach the peer on this link.
                self.send_control(link, CONFIRM_OPEN);
                neighbors.insert(peer.clone(), link.clone());
                true
            }
        };

        let reconfiguration = self.reconfigurations.lock().remove(&link.id());
        if added {
            debug!("{} admitted {peer} on {link}", self.local);
            self.resolve(link.id(), Admission::Accepted(peer.clone()));
            self.notify_added(&peer, reconfiguration);
        } else {
            debug!("{} refuses duplicate link to {peer}", self.local);
            self.send_control(link, ALREADY_NEIGHBOR);
            link.close();
            self.resolve(link.id(), Admission::AlreadyNeighbor(peer.to_string()));
        }
    }

    fn handle_confirm(&self, link: &Link) {
        let Some(peer) = self.peers.lock().remove(&link.id()) else {
            warn!("{CONFIRM_OPEN} on {link} before {OPEN}");
            link.close();
            return;
        };

        // A stale link to the same peer means the peer already dropped it.
        let stale = self.neighbors.lock().insert(peer.clone(), link.clone());
        if let Some(old) = stale {
            debug!("{peer} replaced {old} with {link}");
            old.close();
        }

        let reconfiguration = self.reconfigurations.lock().remove(&link.id());
        self.resolve(link.id(), Admission::Accepted(peer.clone()));
        self.notify_added(&peer, reconfiguration);
    }

    fn handle_already_neighbor(&self, link: &Link) {
        let peer = self.peers.lock().remove(&link.id());
        self.reconfigurations.lock().remove(&link.id());
        link.close();
        let name = peer
            .map(|p| p.to_string())
            .unwrap_or_else(|| link.remote().to_string());
        self.resolve(link.id(), Admission::AlreadyNeighbor(name));
    }

    fn handle_link_end(&self, link: &Link, crashed: bool) {
        self.peers.lock().remove(&link.id());
        self.reconfigurations.lock().remove(&link.id());
        self.resolve(
            link.id(),
            Admission::Failed("link closed during handshake".into()),
        );

        let Some(node) = self.neighbors.lock().remove_link(link.id()) else {
            return;
        };
        let hint = self.hints.lock().remove(&node.id());
        if crashed {
            info!("{} lost neighbor {node}", self.local);
            for l in self.listeners.snapshot() {
                l.neighbor_dead(&node, hint.as_ref());
            }
        } else {
            info!("{} removed neighbor {node}", self.local);
            for l in self.listeners.snapshot() {
                l.neighbor_removed(&node);
            }
        }
    }

    fn notify_added(&self, node: &NodeDescriptor, reconfiguration: Option<ReconfigurationId>) {
        info!("{} added neighbor {node}", self.local);
        for l in self.listeners.snapshot() {
            l.neighbor_added(node, reconfiguration);
        }
    }
}

impl DataListener for TopologyInner {
    fn data_arrived(&self, subject: &str, link: &Link, payload: &[u8]) {
        match subject {
            OPEN => match rmp_serde::from_slice::<NodeDescriptor>(payload) {
                Ok(peer) => self.handle_open(link, peer),
                Err(e) => {
                    warn!("malformed {OPEN} on {link}: {e}");
                    link.close();
                }
            },
            CONFIRM_OPEN => self.handle_confirm(link),
            ALREADY_NEIGHBOR => self.handle_already_neighbor(link),
            other => debug!("unexpected subject {other} on {link}"),
        }
    }
}

impl ConnectivityListener for TopologyInner {
    fn link_opened(&self, link: &Link) {
        if !self.running.load(Ordering::Acquire) {
            link.close();
            return;
        }
        match rmp_serde::to_vec(&self.local) {
            Ok(bytes) => {
                if let Err(e) = link.send(OPEN, &bytes) {
                    debug!("sending {OPEN} on {link} failed: {e}");
                }
            }
            Err(e) => warn!("cannot encode local descriptor: {e}"),
        }
    }

    fn link_closed(&self, link: &Link) {
        self.handle_link_end(link, false);
    }

    fn link_crashed(&self, link: &Link) {
        self.handle_link_end(link, true);
    }
}
