//! Integration tests: TCP transports on localhost.

use std::sync::Arc;
use std::time::Duration;

use arbor_transport::{
    ConnectivityListener, DataListener, Link, LinkId, TcpTransport, TcpTransportConfig, Transport,
    TransportError,
};
use tokio::sync::mpsc;

#[derive(Debug, PartialEq, Eq)]
enum Event {
    Opened(LinkId),
    Closed(LinkId),
    Crashed(LinkId),
    Data(LinkId, String, Vec<u8>),
}

struct Recorder {
    tx: mpsc::UnboundedSender<Event>,
}

impl ConnectivityListener for Recorder {
    fn link_opened(&self, link: &Link) {
        let _ = self.tx.send(Event::Opened(link.id()));
    }

    fn link_closed(&self, link: &Link) {
        let _ = self.tx.send(Event::Closed(link.id()));
    }

    fn link_crashed(&self, link: &Link) {
        let _ = self.tx.send(Event::Crashed(link.id()));
    }
}

impl DataListener for Recorder {
    fn data_arrived(&self, subject: &str, link: &Link, payload: &[u8]) {
        let _ = self
            .tx
            .send(Event::Data(link.id(), subject.to_string(), payload.to_vec()));
    }
}

fn recorder() -> (Arc<Recorder>, mpsc::UnboundedReceiver<Event>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(Recorder { tx }), rx)
}

async fn next(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("event timed out")
        .expect("recorder dropped")
}

async fn listening(config: TcpTransportConfig) -> (TcpTransport, mpsc::UnboundedReceiver<Event>) {
    let transport = TcpTransport::new(config);
    let (rec, rx) = recorder();
    transport.add_connectivity_listener(rec.clone());
    transport.add_data_listener("greeting", rec);
    transport.start().await.unwrap();
    (transport, rx)
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_env_filter("warn").try_init();
}

#[tokio::test]
async fn two_transports_exchange_payload() {
    init_tracing();

    let (server, mut server_rx) = listening(TcpTransportConfig::new()).await;
    let url = server.local_url().unwrap();
    assert!(url.starts_with("arbor-tcp:127.0.0.1:"));

    let client = TcpTransport::new(TcpTransportConfig::outbound_only());
    let (rec, mut client_rx) = recorder();
    client.add_connectivity_listener(rec.clone());
    client.add_data_listener("greeting", rec);
    client.start().await.unwrap();
    assert!(client.urls().is_empty());

    let id = LinkId::next();
    let link = client.open_link(&url, id).await.unwrap();
    assert_eq!(link.id(), id);
    assert_eq!(next(&mut client_rx).await, Event::Opened(id));

    link.send("greeting", b"hello").unwrap();
    link.send("ignored", b"nobody listens").unwrap();

    let server_link = match next(&mut server_rx).await {
        Event::Opened(id) => id,
        other => panic!("unexpected {other:?}"),
    };
    assert_eq!(
        next(&mut server_rx).await,
        Event::Data(server_link, "greeting".into(), b"hello".to_vec())
    );

    // Reply on the accepted side.
    let accepted = server
        .open_links()
        .into_iter()
        .find(|l| l.id() == server_link)
        .unwrap();
    accepted.send("greeting", b"welcome").unwrap();
    assert_eq!(
        next(&mut client_rx).await,
        Event::Data(id, "greeting".into(), b"welcome".to_vec())
    );

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn clean_close_is_reported_as_closed_on_both_sides() {
    init_tracing();

    let (server, mut server_rx) = listening(TcpTransportConfig::new()).await;
    let client = TcpTransport::new(TcpTransportConfig::outbound_only());
    let (rec, mut client_rx) = recorder();
    client.add_connectivity_listener(rec);
    client.start().await.unwrap();

    let link = client
        .open_link(&server.local_url().unwrap(), LinkId::next())
        .await
        .unwrap();
    assert!(matches!(next(&mut client_rx).await, Event::Opened(_)));
    let server_link = match next(&mut server_rx).await {
        Event::Opened(id) => id,
        other => panic!("unexpected {other:?}"),
    };

    link.close();
    link.close();
    assert!(!link.is_connected());
    assert_eq!(next(&mut client_rx).await, Event::Closed(link.id()));
    assert_eq!(next(&mut server_rx).await, Event::Closed(server_link));
    assert!(server.open_links().is_empty());

    server.stop().await;
}

#[tokio::test]
async fn killed_peer_is_reported_as_crashed() {
    init_tracing();

    let (server, mut server_rx) = listening(TcpTransportConfig::new()).await;
    let client = TcpTransport::new(TcpTransportConfig::outbound_only());
    client.start().await.unwrap();

    client
        .open_link(&server.local_url().unwrap(), LinkId::next())
        .await
        .unwrap();
    let server_link = match next(&mut server_rx).await {
        Event::Opened(id) => id,
        other => panic!("unexpected {other:?}"),
    };

    client.kill();
    assert_eq!(next(&mut server_rx).await, Event::Crashed(server_link));

    server.stop().await;
}

#[tokio::test]
async fn severed_link_is_reported_as_crashed_on_both_sides() {
    init_tracing();

    let (server, mut server_rx) = listening(TcpTransportConfig::new()).await;
    let client = TcpTransport::new(TcpTransportConfig::outbound_only());
    let (rec, mut client_rx) = recorder();
    client.add_connectivity_listener(rec);
    client.start().await.unwrap();

    let link = client
        .open_link(&server.local_url().unwrap(), LinkId::next())
        .await
        .unwrap();
    assert!(matches!(next(&mut client_rx).await, Event::Opened(_)));
    let server_link = match next(&mut server_rx).await {
        Event::Opened(id) => id,
        other => panic!("unexpected {other:?}"),
    };

    client.sever(link.id());
    assert_eq!(next(&mut client_rx).await, Event::Crashed(link.id()));
    assert_eq!(next(&mut server_rx).await, Event::Crashed(server_link));
    assert!(client.open_links().is_empty());

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn beacon_silence_is_reported_as_crashed() {
    init_tracing();

    let config = TcpTransportConfig::new()
        .beacon_interval(Duration::from_millis(50))
        .beacon_misses(2);
    let (server, mut server_rx) = listening(config).await;
    let url: arbor_transport::NodeUrl = server.local_url().unwrap().parse().unwrap();

    // A raw socket that never speaks.
    let _silent = tokio::net::TcpStream::connect(url.authority()).await.unwrap();

    let server_link = match next(&mut server_rx).await {
        Event::Opened(id) => id,
        other => panic!("unexpected {other:?}"),
    };
    assert_eq!(next(&mut server_rx).await, Event::Crashed(server_link));

    server.stop().await;
}

#[tokio::test]
async fn open_link_errors() {
    init_tracing();

    let client = TcpTransport::new(TcpTransportConfig::outbound_only());
    let err = client
        .open_link("arbor-tcp:127.0.0.1:1", LinkId::next())
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::NotRunning));

    client.start().await.unwrap();
    assert!(client.knows_protocol("arbor-tcp"));
    assert!(!client.knows_protocol("udp"));

    let err = client
        .open_link("other:127.0.0.1:1", LinkId::next())
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::MalformedUrl(_)));

    let err = client
        .open_link("arbor-tcp:localhost", LinkId::next())
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::MalformedUrl(_)));

    // Bind and drop a listener to get a port that refuses connections.
    let port = {
        let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap().port()
    };
    let err = client
        .open_link(&format!("arbor-tcp:127.0.0.1:{port}"), LinkId::next())
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Connect { .. }));
}
