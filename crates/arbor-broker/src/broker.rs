//! A broker node, assembled.
//!
//! TCP transport → topology manager → overlay → router → reconfigurator,
//! plus a background task that sweeps expired reply rows.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use arbor_transport::{NodeUrl, TcpTransport, Transport};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::{BrokerConfig, ReconfigurationConfig};
use crate::descriptor::NodeDescriptor;
use crate::error::BrokerError;
use crate::filter::{AttributeFilter, Filter};
use crate::overlay::Overlay;
use crate::reconfig::{DeferredUnsubscription, InformedLinkActivation, OobChannel, Reconfigurator};
use crate::router::Router;
use crate::topology::TopologyManager;
use crate::types::{ReconfigurationId, ReconfigurationInfo};

/// The reconfiguration protocol a broker runs.
pub enum Reconfiguration<F: Filter> {
    Deferred(DeferredUnsubscription<F>),
    Informed(InformedLinkActivation<F>),
}

impl<F: Filter> Reconfiguration<F> {
    pub fn as_reconfigurator(&self) -> &dyn Reconfigurator {
        match self {
            Reconfiguration::Deferred(d) => d,
            Reconfiguration::Informed(i) => i,
        }
    }
}

/// A running broker.
pub struct Broker<F: Filter = AttributeFilter> {
    transport: TcpTransport,
    overlay: Overlay,
    router: Router<F>,
    reconfiguration: Reconfiguration<F>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl<F: Filter> Broker<F> {
    /// Build and start a broker with a fresh identity.
    pub async fn start(config: BrokerConfig) -> Result<Self, BrokerError> {
        let transport = TcpTransport::new(config.transport.clone());
        let topology = TopologyManager::new(NodeDescriptor::broker(), config.handshake_timeout);
        topology.add_transport(Arc::new(transport.clone()));

        let overlay = Overlay::new(topology);
        for (name, capacity) in &config.class_capacities {
            overlay.add_traffic_class(name, Some(*capacity))?;
        }
        let router = Router::new(Arc::new(overlay.clone()), config.reply_timeout);
        router.register(&overlay);

        // Bind first so the datagram port is known. Links accepted before the
        // topology runs are closed unadmitted.
        transport.start().await?;
        let reconfiguration = match Self::reconfigure(&config.reconfiguration, &transport, &router).await {
            Ok(reconfiguration) => reconfiguration,
            Err(e) => {
                transport.stop().await;
                return Err(e);
            }
        };
        match &reconfiguration {
            Reconfiguration::Deferred(d) => d.register(&overlay),
            Reconfiguration::Informed(i) => i.register(&overlay),
        }
        if let Err(e) = overlay.start().await {
            reconfiguration.as_reconfigurator().shutdown();
            transport.stop().await;
            return Err(e);
        }

        let sweeper = tokio::spawn(sweep_loop(router.clone(), config.sweep_interval));
        info!("broker {} listening on {:?}", overlay.node_descriptor(), transport.local_url());

        Ok(Self {
            transport,
            overlay,
            router,
            reconfiguration,
            sweeper: Mutex::new(Some(sweeper)),
        })
    }

    async fn reconfigure(
        config: &ReconfigurationConfig,
        transport: &TcpTransport,
        router: &Router<F>,
    ) -> Result<Reconfiguration<F>, BrokerError> {
        match config {
            ReconfigurationConfig::DeferredUnsubscription {
                notified,
                defer_timeout,
            } => Ok(Reconfiguration::Deferred(DeferredUnsubscription::new(
                router.clone(),
                *notified,
                *defer_timeout,
            ))),
            ReconfigurationConfig::InformedLinkActivation {
                subscription_timeout,
                unsubscription_timeout,
                ack_timeout,
                max_attempts,
                dedup_capacity,
            } => {
                let addr = datagram_addr(transport)?;
                let oob = OobChannel::bind(addr, *ack_timeout, *max_attempts, *dedup_capacity).await?;
                Ok(Reconfiguration::Informed(InformedLinkActivation::new(
                    router.clone(),
                    oob,
                    *subscription_timeout,
                    *unsubscription_timeout,
                )))
            }
        }
    }

    // ── Identity ────────────────────────────────────────────────────

    pub fn descriptor(&self) -> &NodeDescriptor {
        self.overlay.node_descriptor()
    }

    /// URL neighbors and clients connect to.
    pub fn url(&self) -> Option<String> {
        self.transport.local_url()
    }

    // ── Neighborhood ────────────────────────────────────────────────

    pub async fn add_neighbor(&self, url: &str) -> Result<NodeDescriptor, BrokerError> {
        self.topology().add_neighbor(url).await
    }

    pub async fn add_neighbor_with_reconfiguration(
        &self,
        url: &str,
        id: ReconfigurationId,
    ) -> Result<NodeDescriptor, BrokerError> {
        self.topology().add_neighbor_with_reconfiguration(url, id).await
    }

    pub fn tentatively_add_neighbor(&self, url: &str) -> Result<(), BrokerError> {
        self.topology().tentatively_add_neighbor(url)
    }

    pub fn remove_neighbor(&self, neighbor: &NodeDescriptor) {
        self.topology().remove_neighbor(neighbor);
    }

    pub fn set_reconfiguration_hint(&self, neighbor: &NodeDescriptor, info: ReconfigurationInfo) {
        self.topology().set_reconfiguration_hint(neighbor, info);
    }

    pub fn neighbors(&self) -> Vec<NodeDescriptor> {
        self.topology().neighbors()
    }

    /// Drop the link to `neighbor` abruptly: both ends see it crash.
    pub fn sever_link(&self, neighbor: &NodeDescriptor) {
        if let Some(link) = self.topology().link_for(neighbor) {
            self.transport.sever(link.id());
        }
    }

    // ── Components ──────────────────────────────────────────────────

    pub fn topology(&self) -> &TopologyManager {
        self.overlay.topology()
    }

    pub fn overlay(&self) -> &Overlay {
        &self.overlay
    }

    pub fn router(&self) -> &Router<F> {
        &self.router
    }

    pub fn reconfiguration(&self) -> &Reconfiguration<F> {
        &self.reconfiguration
    }

    pub fn reconfigurator(&self) -> &dyn Reconfigurator {
        self.reconfiguration.as_reconfigurator()
    }

    // ── Shutdown ────────────────────────────────────────────────────

    /// Close every link cleanly and stop all background work.
    pub async fn shutdown(&self) {
        self.stop_background();
        self.overlay.stop().await;
        info!("broker {} shut down", self.descriptor());
    }

    /// Vanish without closing links, as a crashed process would.
    /// Neighbors observe every link as crashed.
    pub async fn kill(&self) {
        self.stop_background();
        self.transport.kill();
        self.overlay.stop().await;
        debug!("broker {} killed", self.descriptor());
    }

    fn stop_background(&self) {
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.abort();
        }
        self.reconfigurator().shutdown();
    }
}

impl<F: Filter> Drop for Broker<F> {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.abort();
        }
    }
}

/// UDP address matching the TCP listener: same host, same port.
fn datagram_addr(transport: &TcpTransport) -> Result<SocketAddr, BrokerError> {
    let url = transport
        .local_url()
        .ok_or_else(|| BrokerError::Config("informed link activation needs a listening transport".into()))?;
    let parsed: NodeUrl = url
        .parse()
        .map_err(|_| BrokerError::MalformedAddress(url.clone()))?;
    parsed
        .authority()
        .parse()
        .map_err(|_| BrokerError::MalformedAddress(url))
}

async fn sweep_loop<F: Filter>(router: Router<F>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let expired = router.sweep_replies();
        if expired > 0 {
            debug!("{} dropped {expired} expired reply row(s)", router.descriptor());
        }
    }
}
