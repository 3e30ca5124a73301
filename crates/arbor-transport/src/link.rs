use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::task::AbortHandle;

use crate::protocol::Frame;
use crate::TransportError;

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique link identifier.
///
/// Allocated before the link is opened so that callers can register
/// per-link state that the first incoming frame may already need.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(u64);

impl LinkId {
    pub fn next() -> Self {
        Self(NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

/// Work queued for the writer task of a link.
pub(crate) enum Outbound {
    Frame(Vec<u8>),
    /// Send a `Close` frame, then shut the socket down.
    Close,
    /// Stop writing without announcing anything.
    Stop,
}

/// A point-to-point connection carrying subject-tagged payloads.
///
/// Cheap to clone; all clones refer to the same connection. Sending
/// never blocks: frames are queued for a background writer.
#[derive(Clone)]
pub struct Link {
    inner: Arc<LinkInner>,
}

struct LinkInner {
    id: LinkId,
    remote: String,
    tx: mpsc::UnboundedSender<Outbound>,
    max_frame_size: usize,
    connected: AtomicBool,
    closing: AtomicBool,
    signal: Notify,
    tasks: Mutex<Vec<AbortHandle>>,
}

impl Link {
    pub(crate) fn new(
        id: LinkId,
        remote: String,
        tx: mpsc::UnboundedSender<Outbound>,
        max_frame_size: usize,
    ) -> Self {
        Self {
            inner: Arc::new(LinkInner {
                id,
                remote,
                tx,
                max_frame_size,
                connected: AtomicBool::new(true),
                closing: AtomicBool::new(false),
                signal: Notify::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn id(&self) -> LinkId {
        self.inner.id
    }

    /// Address of the remote end, as seen by this side.
    pub fn remote(&self) -> &str {
        &self.inner.remote
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// Queue a payload for the remote end.
    pub fn send(&self, subject: &str, payload: &[u8]) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let bytes = Frame::Data {
            subject: subject.to_string(),
            payload: payload.to_vec(),
        }
        .to_bytes()?;
        if bytes.len() > self.inner.max_frame_size {
            return Err(TransportError::MessageTooLarge {
                size: bytes.len(),
                max: self.inner.max_frame_size,
            });
        }
        self.inner
            .tx
            .send(Outbound::Frame(bytes))
            .map_err(|_| TransportError::NotConnected)
    }

    /// Close the link cleanly. Idempotent.
    pub fn close(&self) {
        if self.inner.connected.swap(false, Ordering::AcqRel) {
            self.inner.closing.store(true, Ordering::Release);
            let _ = self.inner.tx.send(Outbound::Close);
            self.inner.signal.notify_one();
        }
    }

    /// Resolves once the link was closed locally or its writer failed.
    pub(crate) async fn interrupted(&self) {
        self.inner.signal.notified().await
    }

    pub(crate) fn closed_locally(&self) -> bool {
        self.inner.closing.load(Ordering::Acquire)
    }

    /// Mark the link dead and stop its writer without announcing anything.
    pub(crate) fn halt(&self) {
        self.inner.connected.store(false, Ordering::Release);
        let _ = self.inner.tx.send(Outbound::Stop);
    }

    /// The writer could not deliver a frame.
    pub(crate) fn write_failed(&self) {
        self.inner.connected.store(false, Ordering::Release);
        self.inner.signal.notify_one();
    }

    pub(crate) fn track(&self, handle: AbortHandle) {
        self.inner.tasks.lock().push(handle);
    }

    /// Drop the connection without any shutdown exchange.
    pub(crate) fn abort(&self) {
        self.inner.connected.store(false, Ordering::Release);
        for handle in self.inner.tasks.lock().drain(..) {
            handle.abort();
        }
    }
}

impl PartialEq for Link {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Link {}

impl Hash for Link {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("id", &self.inner.id)
            .field("remote", &self.inner.remote)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.inner.id, self.inner.remote)
    }
}
