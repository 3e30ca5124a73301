//! Out-of-band ACTIVATE delivery over UDP.
//!
//! The datagram socket listens on the same port number as the broker's TCP
//! listener, so the target of an ACTIVATE is found from the first
//! `arbor-tcp:host:port` URL of its descriptor. Each ACTIVATE is resent
//! until acknowledged or the attempts run out. Receivers always
//! acknowledge, but hand an ACTIVATE to the handler only the first time
//! its id is seen.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use arbor_transport::{NodeUrl, TCP_SCHEME};
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio::task::AbortHandle;
use tracing::{debug, error, warn};

use crate::descriptor::NodeDescriptor;
use crate::error::BrokerError;
use crate::filter::Filter;
use crate::types::ReconfigurationId;

/// Largest datagram sent or accepted.
pub const MAX_DATAGRAM_SIZE: usize = 4096;

pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
/// Recent ACTIVATE ids remembered for deduplication.
pub const DEFAULT_DEDUP_CAPACITY: usize = 100;

/// Asks the same-subtree endpoint of a replacement link to bring it up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound = "F: Filter")]
pub struct Activate<F> {
    pub reconfiguration: ReconfigurationId,
    /// Filters held only by the dead neighbor; their propagation over the
    /// new link waits for the subscription timeout.
    pub unconfirmed: Vec<F>,
    /// The other endpoint of the replacement link.
    pub new_neighbor: NodeDescriptor,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "F: Filter")]
pub enum OobMessage<F> {
    Activate(Activate<F>),
    ActivateAck(ReconfigurationId),
}

/// Receives every ACTIVATE not seen recently.
pub trait ActivateHandler<F: Filter>: Send + Sync {
    fn activate_arrived(&self, activate: Activate<F>);
}

/// UDP endpoint for ACTIVATE / ACTIVATE_ACK.
pub struct OobChannel<F: Filter> {
    inner: Arc<OobInner<F>>,
}

impl<F: Filter> Clone for OobChannel<F> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct OobInner<F> {
    socket: UdpSocket,
    local: SocketAddr,
    ack_timeout: Duration,
    max_attempts: u32,
    /// Ids of ACTIVATEs already handed to the handler.
    seen: Mutex<LruCache<ReconfigurationId, ()>>,
    /// Outgoing ACTIVATEs still waiting for their ACK.
    awaiting: Mutex<HashMap<ReconfigurationId, Arc<Notify>>>,
    tasks: Mutex<Vec<AbortHandle>>,
    _filter: PhantomData<fn() -> F>,
}

impl<F: Filter> OobChannel<F> {
    pub async fn bind(
        addr: SocketAddr,
        ack_timeout: Duration,
        max_attempts: u32,
        dedup_capacity: usize,
    ) -> Result<Self, BrokerError> {
        let capacity = NonZeroUsize::new(dedup_capacity)
            .ok_or_else(|| BrokerError::Config("dedup capacity must be positive".into()))?;
        if max_attempts == 0 {
            return Err(BrokerError::Config("max_attempts must be positive".into()));
        }
        let socket = UdpSocket::bind(addr).await?;
        let local = socket.local_addr()?;
        debug!("out-of-band channel bound to {local}");
        Ok(Self {
            inner: Arc::new(OobInner {
                socket,
                local,
                ack_timeout,
                max_attempts,
                seen: Mutex::new(LruCache::new(capacity)),
                awaiting: Mutex::new(HashMap::new()),
                tasks: Mutex::new(Vec::new()),
                _filter: PhantomData,
            }),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local
    }

    /// Start receiving. ACTIVATEs go to `handler`; ACKs stop retransmission.
    pub fn start(&self, handler: Arc<dyn ActivateHandler<F>>) {
        let task = tokio::spawn(receive_loop(self.inner.clone(), handler));
        self.inner.track(task.abort_handle());
    }

    /// Send `activate` to `to` in the background, retrying until acknowledged.
    ///
    /// Fails at once if `to` has no usable TCP URL or the message does not
    /// fit in a datagram.
    pub fn send_activate(&self, activate: Activate<F>, to: &NodeDescriptor) -> Result<(), BrokerError> {
        let url = to
            .first_url()
            .ok_or_else(|| BrokerError::MalformedAddress(format!("{to} has no URL")))?;
        let parsed: NodeUrl = url
            .parse()
            .map_err(|_| BrokerError::MalformedAddress(url.clone()))?;
        if parsed.scheme != TCP_SCHEME {
            return Err(BrokerError::MalformedAddress(url));
        }

        let id = activate.reconfiguration;
        let bytes = rmp_serde::to_vec(&OobMessage::Activate(activate))?;
        if bytes.len() > MAX_DATAGRAM_SIZE {
            return Err(BrokerError::MessageTooLarge {
                size: bytes.len(),
                max: MAX_DATAGRAM_SIZE,
            });
        }

        let acked = Arc::new(Notify::new());
        self.inner.awaiting.lock().insert(id, acked.clone());
        let task = tokio::spawn(deliver(self.inner.clone(), id, parsed.authority(), bytes, acked));
        self.inner.track(task.abort_handle());
        Ok(())
    }

    /// ACTIVATEs sent but not yet acknowledged nor abandoned.
    pub fn awaiting_acks(&self) -> usize {
        self.inner.awaiting.lock().len()
    }

    /// Stop receiving and abandon pending retransmissions.
    pub fn shutdown(&self) {
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        self.inner.awaiting.lock().clear();
    }
}

impl<F: Filter> OobInner<F> {
    fn track(&self, handle: AbortHandle) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    async fn send_ack(&self, id: ReconfigurationId, to: SocketAddr) {
        let bytes = match rmp_serde::to_vec(&OobMessage::<F>::ActivateAck(id)) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("cannot encode ACK for {id}: {e}");
                return;
            }
        };
        if let Err(e) = self.socket.send_to(&bytes, to).await {
            warn!("ACK for {id} to {to} failed: {e}");
        }
    }
}

async fn deliver<F: Filter>(
    inner: Arc<OobInner<F>>,
    id: ReconfigurationId,
    authority: String,
    bytes: Vec<u8>,
    acked: Arc<Notify>,
) {
    let target = match tokio::net::lookup_host(&authority).await {
        Ok(mut addrs) => addrs.next(),
        Err(e) => {
            warn!("cannot resolve {authority}: {e}");
            None
        }
    };
    let Some(target) = target else {
        error!("ACTIVATE ({id}) not sent: {authority} does not resolve");
        inner.awaiting.lock().remove(&id);
        return;
    };

    for attempt in 1..=inner.max_attempts {
        if let Err(e) = inner.socket.send_to(&bytes, target).await {
            warn!("ACTIVATE ({id}) to {target} failed: {e}, will retry");
        }
        if tokio::time::timeout(inner.ack_timeout, acked.notified())
            .await
            .is_ok()
        {
            debug!("ACTIVATE ({id}) acknowledged by {target} after {attempt} attempt(s)");
            inner.awaiting.lock().remove(&id);
            return;
        }
    }

    error!(
        "all {} attempts to send ACTIVATE ({id}) to {target} failed, giving up",
        inner.max_attempts
    );
    inner.awaiting.lock().remove(&id);
}

async fn receive_loop<F: Filter>(inner: Arc<OobInner<F>>, handler: Arc<dyn ActivateHandler<F>>) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let (len, from) = match inner.socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                // Some platforms surface ICMP errors of earlier sends here.
                debug!("out-of-band receive failed: {e}");
                continue;
            }
        };

        let message: OobMessage<F> = match rmp_serde::from_slice(&buf[..len]) {
            Ok(message) => message,
            Err(e) => {
                warn!("malformed datagram from {from}: {e}");
                continue;
            }
        };

        match message {
            OobMessage::Activate(activate) => {
                let id = activate.reconfiguration;
                inner.send_ack(id, from).await;
                let fresh = inner.seen.lock().put(id, ()).is_none();
                if fresh {
                    handler.activate_arrived(activate);
                } else {
                    debug!("duplicate ACTIVATE ({id}) from {from}");
                }
            }
            OobMessage::ActivateAck(id) => {
                // Late ACKs for abandoned or completed sends find nothing.
                if let Some(acked) = inner.awaiting.lock().get(&id) {
                    acked.notify_one();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::AttributeFilter;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<Activate<AttributeFilter>>>,
    }

    impl ActivateHandler<AttributeFilter> for Recorder {
        fn activate_arrived(&self, activate: Activate<AttributeFilter>) {
            self.seen.lock().push(activate);
        }
    }

    async fn channel(ack_timeout: Duration, attempts: u32) -> OobChannel<AttributeFilter> {
        OobChannel::bind("127.0.0.1:0".parse().unwrap(), ack_timeout, attempts, 100)
            .await
            .unwrap()
    }

    fn descriptor_at(addr: SocketAddr) -> NodeDescriptor {
        let node = NodeDescriptor::broker();
        node.add_url(&NodeUrl::new(TCP_SCHEME, addr.ip().to_string(), addr.port()).to_string());
        node
    }

    fn activate() -> Activate<AttributeFilter> {
        Activate {
            reconfiguration: ReconfigurationId::random(),
            unconfirmed: vec![AttributeFilter::new().equals("type", "temp")],
            new_neighbor: NodeDescriptor::broker(),
        }
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn activate_is_acknowledged_and_handled_once() {
        let sender = channel(Duration::from_millis(200), 5).await;
        let receiver = channel(Duration::from_millis(200), 5).await;
        let recorder = Arc::new(Recorder::default());
        sender.start(Arc::new(Recorder::default()));
        receiver.start(recorder.clone());

        let to = descriptor_at(receiver.local_addr());
        let act = activate();
        sender.send_activate(act.clone(), &to).unwrap();
        eventually(|| recorder.seen.lock().len() == 1 && sender.awaiting_acks() == 0).await;
        assert_eq!(recorder.seen.lock()[0], act);

        // A retransmission is acknowledged again but not handled again.
        sender.send_activate(act, &to).unwrap();
        eventually(|| sender.awaiting_acks() == 0).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(recorder.seen.lock().len(), 1);

        sender.shutdown();
        receiver.shutdown();
    }

    #[tokio::test]
    async fn unacknowledged_activate_is_retried_then_abandoned() {
        let sender = channel(Duration::from_millis(50), 3).await;
        sender.start(Arc::new(Recorder::default()));
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        sender
            .send_activate(activate(), &descriptor_at(silent.local_addr().unwrap()))
            .unwrap();
        assert_eq!(sender.awaiting_acks(), 1);

        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        for _ in 0..3 {
            tokio::time::timeout(Duration::from_secs(2), silent.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
        }
        eventually(|| sender.awaiting_acks() == 0).await;
        assert!(
            tokio::time::timeout(Duration::from_millis(150), silent.recv_from(&mut buf))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn unusable_destination_is_refused() {
        let sender = channel(Duration::from_millis(50), 1).await;
        let err = sender
            .send_activate(activate(), &NodeDescriptor::broker())
            .unwrap_err();
        assert!(matches!(err, BrokerError::MalformedAddress(_)));

        let other = NodeDescriptor::broker();
        other.add_url("carrier-pigeon:loft:7");
        let err = sender.send_activate(activate(), &other).unwrap_err();
        assert!(matches!(err, BrokerError::MalformedAddress(_)));
        assert_eq!(sender.awaiting_acks(), 0);
    }

    #[tokio::test]
    async fn invalid_settings_are_rejected() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let zero_cache = OobChannel::<AttributeFilter>::bind(addr, Duration::from_secs(1), 5, 0).await;
        assert!(matches!(zero_cache, Err(BrokerError::Config(_))));
        let zero_attempts =
            OobChannel::<AttributeFilter>::bind(addr, Duration::from_secs(1), 0, 100).await;
        assert!(matches!(zero_attempts, Err(BrokerError::Config(_))));
    }
}
