use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::link::Outbound;
use crate::protocol::{read_framed, write_framed, Frame};
use crate::{
    ConnectivityListener, DataListener, Link, LinkId, ListenerRegistry, ListenerSet, NodeUrl,
    TcpTransportConfig, Transport, TransportError,
};

/// URL scheme understood by [`TcpTransport`].
pub const TCP_SCHEME: &str = "arbor-tcp";

/// Beacon period used when beaconing is switched on without a configured interval.
const DEFAULT_BEACON_INTERVAL: Duration = Duration::from_secs(1);

/// How a link ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkEnd {
    Closed,
    Crashed,
}

/// Transport over TCP streams, one stream per link.
#[derive(Clone)]
pub struct TcpTransport {
    inner: Arc<TcpInner>,
}

struct TcpInner {
    config: TcpTransportConfig,
    running: AtomicBool,
    beaconing: AtomicBool,
    beacon_interval: Duration,
    urls: RwLock<Vec<String>>,
    links: Mutex<HashMap<LinkId, Link>>,
    data_listeners: ListenerRegistry<String, dyn DataListener>,
    connectivity: ListenerSet<dyn ConnectivityListener>,
    acceptor: Mutex<Option<JoinHandle<()>>>,
}

impl TcpTransport {
    pub fn new(config: TcpTransportConfig) -> Self {
        let beacon_interval = config.beacon_interval.unwrap_or(DEFAULT_BEACON_INTERVAL);
        let beaconing = config.beacon_interval.is_some();
        Self {
            inner: Arc::new(TcpInner {
                config,
                running: AtomicBool::new(false),
                beaconing: AtomicBool::new(beaconing),
                beacon_interval,
                urls: RwLock::new(Vec::new()),
                links: Mutex::new(HashMap::new()),
                data_listeners: ListenerRegistry::new(),
                connectivity: ListenerSet::new(),
                acceptor: Mutex::new(None),
            }),
        }
    }

    /// First URL this transport listens on, once started.
    pub fn local_url(&self) -> Option<String> {
        self.inner.urls.read().first().cloned()
    }

    /// Drop every link without a clean close, as if the process had died.
    ///
    /// Peers observe a crash on each link. No events fire locally.
    pub fn kill(&self) {
        self.inner.running.store(false, Ordering::Release);
        if let Some(acceptor) = self.inner.acceptor.lock().take() {
            acceptor.abort();
        }
        let links: Vec<Link> = self.inner.links.lock().drain().map(|(_, l)| l).collect();
        for link in links {
            link.abort();
        }
    }

    /// Drop one link without a clean close. Both ends report a crash.
    pub fn sever(&self, id: LinkId) {
        let link = self.inner.links.lock().get(&id).cloned();
        if let Some(link) = link {
            link.abort();
            self.inner.finish_link(&link, LinkEnd::Crashed);
        }
    }
}

impl TcpInner {
    fn spawn_link(self: &Arc<Self>, stream: TcpStream, id: LinkId, remote: String) -> Link {
        let _ = stream.set_nodelay(true);
        let (rd, wr) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let link = Link::new(id, remote, tx, self.config.max_frame_size);
        self.links.lock().insert(id, link.clone());

        // Listeners see the link before any frame is read from it.
        for listener in self.connectivity.snapshot() {
            listener.link_opened(&link);
        }

        let writer = tokio::spawn(write_loop(self.clone(), link.clone(), wr, rx));
        let reader = tokio::spawn(read_loop(self.clone(), link.clone(), rd));
        link.track(writer.abort_handle());
        link.track(reader.abort_handle());
        link
    }

    fn dispatch(&self, subject: &str, link: &Link, payload: &[u8]) {
        let listeners = self.data_listeners.snapshot(&subject.to_string());
        if listeners.is_empty() {
            debug!("no listener for subject {subject} on {link}");
            return;
        }
        for listener in listeners {
            listener.data_arrived(subject, link, payload);
        }
    }

    fn finish_link(&self, link: &Link, end: LinkEnd) {
        if self.links.lock().remove(&link.id()).is_none() {
            return;
        }
        debug!("{link} ended: {end:?}");
        for listener in self.connectivity.snapshot() {
            match end {
                LinkEnd::Closed => listener.link_closed(link),
                LinkEnd::Crashed => listener.link_crashed(link),
            }
        }
    }
}

async fn accept_loop(inner: Arc<TcpInner>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!("accepted connection from {peer}");
                inner.spawn_link(stream, LinkId::next(), peer.to_string());
            }
            Err(e) => {
                warn!("accept failed: {e}");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn send_frame(wr: &mut OwnedWriteHalf, frame: &Frame) -> Result<(), TransportError> {
    write_framed(wr, &frame.to_bytes()?).await
}

async fn write_loop(
    inner: Arc<TcpInner>,
    link: Link,
    mut wr: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) {
    let mut ticker = tokio::time::interval(inner.beacon_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        let result = tokio::select! {
            out = rx.recv() => match out {
                Some(Outbound::Frame(bytes)) => write_framed(&mut wr, &bytes).await,
                Some(Outbound::Close) => {
                    let _ = send_frame(&mut wr, &Frame::Close).await;
                    let _ = wr.shutdown().await;
                    return;
                }
                Some(Outbound::Stop) | None => return,
            },
            _ = ticker.tick() => {
                if inner.beaconing.load(Ordering::Relaxed) {
                    send_frame(&mut wr, &Frame::Beacon).await
                } else {
                    Ok(())
                }
            }
        };
        if let Err(e) = result {
            debug!("write to {link} failed: {e}");
            link.write_failed();
            return;
        }
    }
}

async fn read_loop(inner: Arc<TcpInner>, link: Link, mut rd: OwnedReadHalf) {
    let max = inner.config.max_frame_size;
    let silence = inner.beacon_interval * inner.config.beacon_misses;

    let end = loop {
        let beaconing = inner.beaconing.load(Ordering::Relaxed);
        let read = async {
            if beaconing {
                match tokio::time::timeout(silence, read_framed(&mut rd, max)).await {
                    Ok(result) => result,
                    Err(_) => Err(TransportError::Io(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "beacon silence",
                    ))),
                }
            } else {
                read_framed(&mut rd, max).await
            }
        };

        let bytes = tokio::select! {
            _ = link.interrupted() => {
                break if link.closed_locally() { LinkEnd::Closed } else { LinkEnd::Crashed };
            }
            result = read => result,
        };

        match bytes.and_then(|b| Frame::from_bytes(&b)) {
            Ok(Frame::Data { subject, payload }) => inner.dispatch(&subject, &link, &payload),
            Ok(Frame::Beacon) => {}
            Ok(Frame::Close) => {
                link.halt();
                break LinkEnd::Closed;
            }
            Err(e) => {
                if link.closed_locally() {
                    break LinkEnd::Closed;
                }
                debug!("{link} lost: {e}");
                link.halt();
                break LinkEnd::Crashed;
            }
        }
    };

    inner.finish_link(&link, end);
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    async fn start(&self) -> Result<(), TransportError> {
        if self.inner.running.load(Ordering::Acquire) {
            return Ok(());
        }
        if let Some(addr) = self.inner.config.listen_addr {
            let listener = TcpListener::bind(addr).await.map_err(TransportError::Bind)?;
            let local = listener.local_addr().map_err(TransportError::Bind)?;
            let url = NodeUrl::new(TCP_SCHEME, local.ip().to_string(), local.port());
            self.inner.urls.write().push(url.to_string());
            let handle = tokio::spawn(accept_loop(self.inner.clone(), listener));
            if let Some(previous) = self.inner.acceptor.lock().replace(handle) {
                previous.abort();
            }
            debug!("listening on {url}");
        }
        self.inner.running.store(true, Ordering::Release);
        Ok(())
    }

    async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(acceptor) = self.inner.acceptor.lock().take() {
            acceptor.abort();
        }
        self.inner.urls.write().clear();
        for link in self.open_links() {
            link.close();
        }
    }

    fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    fn urls(&self) -> Vec<String> {
        self.inner.urls.read().clone()
    }

    fn knows_protocol(&self, scheme: &str) -> bool {
        scheme == TCP_SCHEME
    }

    async fn open_link(&self, url: &str, id: LinkId) -> Result<Link, TransportError> {
        if !self.is_running() {
            return Err(TransportError::NotRunning);
        }
        let parsed: NodeUrl = url.parse()?;
        if !self.knows_protocol(&parsed.scheme) {
            return Err(TransportError::MalformedUrl(url.to_string()));
        }

        let connect = TcpStream::connect(parsed.authority());
        let stream = tokio::time::timeout(self.inner.config.connect_timeout, connect)
            .await
            .map_err(|_| TransportError::Connect {
                url: url.to_string(),
                source: io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
            })?
            .map_err(|source| TransportError::Connect {
                url: url.to_string(),
                source,
            })?;

        Ok(self.inner.spawn_link(stream, id, url.to_string()))
    }

    fn open_links(&self) -> Vec<Link> {
        self.inner.links.lock().values().cloned().collect()
    }

    fn set_beaconing(&self, enabled: bool) {
        self.inner.beaconing.store(enabled, Ordering::Relaxed);
    }

    fn is_beaconing(&self) -> bool {
        self.inner.beaconing.load(Ordering::Relaxed)
    }

    fn add_data_listener(&self, subject: &str, listener: Arc<dyn DataListener>) {
        self.inner.data_listeners.add(subject.to_string(), listener);
    }

    fn remove_data_listener(&self, subject: &str, listener: &Arc<dyn DataListener>) {
        self.inner
            .data_listeners
            .remove(&subject.to_string(), listener);
    }

    fn add_connectivity_listener(&self, listener: Arc<dyn ConnectivityListener>) {
        self.inner.connectivity.add(listener);
    }

    fn remove_connectivity_listener(&self, listener: &Arc<dyn ConnectivityListener>) {
        self.inner.connectivity.remove(listener);
    }
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("urls", &*self.inner.urls.read())
            .field("running", &self.is_running())
            .finish()
    }
}
