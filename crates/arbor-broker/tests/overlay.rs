//! Integration tests: packet dispatch through bare overlays on localhost.

use std::sync::Arc;
use std::time::Duration;

use arbor_broker::{BrokerError, NodeDescriptor, Overlay, PacketListener, TopologyManager};
use arbor_transport::{TcpTransport, TcpTransportConfig};
use tokio::sync::mpsc;

const PING: &str = "ping";

struct Recorder {
    tx: mpsc::UnboundedSender<(NodeDescriptor, u32)>,
}

impl PacketListener for Recorder {
    fn packet_arrived(&self, _subject: &str, source: &NodeDescriptor, payload: &[u8]) {
        let n: u32 = rmp_serde::from_slice(payload).unwrap();
        let _ = self.tx.send((source.clone(), n));
    }
}

fn overlay() -> (Overlay, TcpTransport) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("warn")
        .try_init();
    let transport = TcpTransport::new(TcpTransportConfig::new());
    let topology = TopologyManager::new(NodeDescriptor::broker(), Duration::from_secs(5));
    topology.add_transport(Arc::new(transport.clone()));
    (Overlay::new(topology), transport)
}

fn recorded(overlay: &Overlay) -> mpsc::UnboundedReceiver<(NodeDescriptor, u32)> {
    let (tx, rx) = mpsc::unbounded_channel();
    overlay.add_packet_listener(PING, Arc::new(Recorder { tx }));
    rx
}

/// Two started overlays, `b` linked to `a`.
async fn pair() -> (Overlay, TcpTransport, Overlay) {
    let (a, a_transport) = overlay();
    let (b, _) = overlay();
    a.start().await.unwrap();
    b.start().await.unwrap();
    b.topology()
        .add_neighbor(&a_transport.local_url().unwrap())
        .await
        .unwrap();
    // The accepting side admits on its own schedule.
    for _ in 0..100 {
        if a.topology().is_neighbor(b.node_descriptor()) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(a.topology().is_neighbor(b.node_descriptor()));
    (a, a_transport, b)
}

async fn next(rx: &mut mpsc::UnboundedReceiver<(NodeDescriptor, u32)>) -> (NodeDescriptor, u32) {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("packet timed out")
        .expect("recorder dropped")
}

#[tokio::test]
async fn packets_of_one_class_arrive_in_order() {
    let (a, _a_transport, b) = pair().await;
    let mut rx = recorded(&a);

    for n in 0..50u32 {
        b.send(PING, &n, a.node_descriptor()).unwrap();
    }
    for n in 0..50u32 {
        assert_eq!(next(&mut rx).await, (b.node_descriptor().clone(), n));
    }
    assert_eq!(a.traffic_class_of(PING).as_deref(), Some("MiscClass"));
}

#[tokio::test]
async fn nothing_is_dispatched_once_stop_returns() {
    let (a, _a_transport, b) = pair().await;
    let mut rx = recorded(&a);

    b.send(PING, &0u32, a.node_descriptor()).unwrap();
    assert_eq!(next(&mut rx).await.1, 0);

    for n in 1..2000u32 {
        if b.send(PING, &n, a.node_descriptor()).is_err() {
            break;
        }
    }
    a.stop().await;
    while rx.try_recv().is_ok() {}

    for n in 2000..2010u32 {
        let _ = b.send(PING, &n, a.node_descriptor());
    }
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(rx.try_recv().is_err());
    b.stop().await;
}

#[tokio::test]
async fn send_requires_a_running_overlay() {
    let (a, _) = overlay();
    let peer = NodeDescriptor::broker();
    assert!(matches!(
        a.send_bytes(PING, b"x", &peer),
        Err(BrokerError::NotRunning)
    ));

    a.start().await.unwrap();
    a.stop().await;
    assert!(!a.is_running());
    assert!(matches!(
        a.send_bytes(PING, b"x", &peer),
        Err(BrokerError::NotRunning)
    ));
}

#[tokio::test]
async fn send_to_a_stranger_is_not_connected() {
    let (a, _a_transport, b) = pair().await;
    let stranger = NodeDescriptor::broker();
    assert!(matches!(
        a.send_bytes(PING, b"x", &stranger),
        Err(BrokerError::NotConnected { .. })
    ));
    assert!(a.send(PING, &1u32, b.node_descriptor()).is_ok());

    b.stop().await;
    for _ in 0..100 {
        if !a.topology().is_neighbor(b.node_descriptor()) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(matches!(
        a.send(PING, &2u32, b.node_descriptor()),
        Err(BrokerError::NotConnected { .. })
    ));
    a.stop().await;
}

#[tokio::test]
async fn traffic_classes_are_declared_once() {
    let (a, _) = overlay();
    a.add_traffic_class("Bulk", Some(4)).unwrap();
    assert!(matches!(
        a.add_traffic_class("Bulk", None),
        Err(BrokerError::Config(_))
    ));

    a.set_traffic_class(PING, "Control");
    let mut classes = a.traffic_classes();
    classes.sort();
    assert_eq!(classes, vec!["Bulk", "Control", "MiscClass"]);
    assert_eq!(a.traffic_class_of(PING).as_deref(), Some("Control"));
}
