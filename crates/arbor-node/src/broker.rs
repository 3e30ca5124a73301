use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arbor_broker::{
    Broker, BrokerConfig, NeighborhoodListener, NodeDescriptor, ReconfigurationConfig,
    ReconfigurationId, ReconfigurationInfo, TcpTransportConfig,
};

use crate::common::setup_ctrlc;
use crate::events::{emit, now_ms, EventNeighbor, EventStarted, EventStopped};

pub struct BrokerArgs {
    pub listen: SocketAddr,
    pub connect: Vec<String>,
    pub reconfiguration: ReconfigurationConfig,
}

/// Emits neighborhood changes as JSONL.
struct NeighborEvents;

impl NeighborEvents {
    fn emit(event: &'static str, neighbor: &NodeDescriptor, reconfiguration: Option<String>) {
        emit(&EventNeighbor {
            event,
            neighbor: neighbor.to_string(),
            broker: neighbor.is_broker(),
            reconfiguration,
            ts: now_ms(),
        });
    }
}

impl NeighborhoodListener for NeighborEvents {
    fn neighbor_added(&self, neighbor: &NodeDescriptor, reconfiguration: Option<ReconfigurationId>) {
        Self::emit("neighbor_added", neighbor, reconfiguration.map(|id| id.to_string()));
    }

    fn neighbor_removed(&self, neighbor: &NodeDescriptor) {
        Self::emit("neighbor_removed", neighbor, None);
    }

    fn neighbor_dead(&self, neighbor: &NodeDescriptor, reconfiguration: Option<&ReconfigurationInfo>) {
        Self::emit("neighbor_dead", neighbor, reconfiguration.map(|r| r.id().to_string()));
    }
}

pub async fn run(args: BrokerArgs, start: Instant) -> anyhow::Result<()> {
    let config = BrokerConfig::new()
        .transport(TcpTransportConfig::new().listen_addr(args.listen))
        .reconfiguration(args.reconfiguration);
    let broker: Broker = Broker::start(config).await?;
    broker
        .topology()
        .add_neighborhood_listener(Arc::new(NeighborEvents));

    let id = broker.descriptor().id().to_string();
    emit(&EventStarted::new(&id, "broker", broker.url()));
    eprintln!("Broker {id} listening on {}", broker.url().unwrap_or_default());
    eprintln!("Press Ctrl+C to stop.\n");

    for url in &args.connect {
        if let Err(e) = broker.add_neighbor(url).await {
            eprintln!("connect to {url} failed: {e}");
        }
    }

    let running = setup_ctrlc();
    while running.load(Ordering::Relaxed) {
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    broker.shutdown().await;
    emit(&EventStopped {
        event: "stopped",
        id,
        elapsed_s: start.elapsed().as_secs_f64(),
    });
    Ok(())
}
