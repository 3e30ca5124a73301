//! Client endpoint: attaches to exactly one broker, subscribes, publishes
//! and collects replies.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use arbor_transport::TcpTransport;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::descriptor::NodeDescriptor;
use crate::error::BrokerError;
use crate::filter::{AttributeFilter, Filter};
use crate::message::{Message, Replies, Reply};
use crate::overlay::{Overlay, PacketListener};
use crate::reply::ReplyTable;
use crate::router::{MESSAGE_CLASS, PUBLISH, REPLY, SUBSCRIBE, UNSUBSCRIBE, UNSUBSCRIBE_ALL};
use crate::topology::{NeighborhoodListener, TopologyManager};
use crate::types::{MessageId, ReconfigurationId, ReconfigurationInfo};

/// A publish/subscribe client.
pub struct Client<F: Filter = AttributeFilter> {
    overlay: Overlay,
    inner: Arc<ClientInner<F>>,
    reply_timeout: Duration,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

struct ClientInner<F: Filter> {
    broker: Mutex<Option<NodeDescriptor>>,
    inbox: Mutex<VecDeque<Message<F::Content>>>,
    delivered: Notify,
    replies: ReplyTable<F::Content>,
}

impl<F: Filter> Client<F> {
    pub async fn start(config: ClientConfig) -> Result<Self, BrokerError> {
        let transport = TcpTransport::new(config.transport.clone());
        let topology = TopologyManager::new(NodeDescriptor::client(), config.handshake_timeout);
        topology.add_transport(Arc::new(transport));

        let overlay = Overlay::new(topology);
        let inner = Arc::new(ClientInner {
            broker: Mutex::new(None),
            inbox: Mutex::new(VecDeque::new()),
            delivered: Notify::new(),
            replies: ReplyTable::new(),
        });

        for subject in [PUBLISH, REPLY] {
            overlay.set_traffic_class(subject, MESSAGE_CLASS);
            overlay.add_packet_listener(subject, inner.clone());
        }
        overlay.add_neighborhood_listener(inner.clone());
        overlay.start().await?;

        let sweeper = tokio::spawn(sweep_loop(inner.clone(), config.sweep_interval));
        Ok(Self {
            overlay,
            inner,
            reply_timeout: config.reply_timeout,
            sweeper: Mutex::new(Some(sweeper)),
        })
    }

    pub fn descriptor(&self) -> &NodeDescriptor {
        self.overlay.node_descriptor()
    }

    // ── Connection ──────────────────────────────────────────────────

    /// Attach to the broker at `url`. A client has at most one broker.
    pub async fn connect(&self, url: &str) -> Result<NodeDescriptor, BrokerError> {
        if let Some(current) = self.broker() {
            return Err(BrokerError::AlreadyNeighbor {
                neighbor: current.to_string(),
            });
        }
        let node = self.overlay.topology().add_neighbor(url).await?;
        if !node.is_broker() {
            self.overlay.topology().remove_neighbor(&node);
            return Err(BrokerError::ConnectError {
                url: url.into(),
                reason: format!("{node} is not a broker"),
            });
        }
        *self.inner.broker.lock() = Some(node.clone());
        info!("{} attached to {node}", self.descriptor());
        Ok(node)
    }

    /// Detach from the current broker, if any.
    pub fn disconnect(&self) {
        if let Some(broker) = self.inner.broker.lock().take() {
            self.overlay.topology().remove_neighbor(&broker);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.broker()
            .is_some_and(|b| self.overlay.topology().is_neighbor(&b))
    }

    pub fn broker(&self) -> Option<NodeDescriptor> {
        self.inner.broker.lock().clone()
    }

    fn attached(&self) -> Result<NodeDescriptor, BrokerError> {
        self.broker().ok_or_else(|| BrokerError::NotConnected {
            neighbor: "no broker".into(),
        })
    }

    // ── Subscriptions ───────────────────────────────────────────────

    pub fn subscribe(&self, filter: &F) -> Result<(), BrokerError> {
        self.overlay.send(SUBSCRIBE, filter, &self.attached()?)
    }

    pub fn unsubscribe(&self, filter: &F) -> Result<(), BrokerError> {
        self.overlay.send(UNSUBSCRIBE, filter, &self.attached()?)
    }

    pub fn unsubscribe_all(&self) -> Result<(), BrokerError> {
        self.overlay.send(UNSUBSCRIBE_ALL, &(), &self.attached()?)
    }

    // ── Publishing ──────────────────────────────────────────────────

    pub fn publish(&self, content: F::Content) -> Result<MessageId, BrokerError> {
        let message = Message::new(content).with_origin(self.descriptor().id());
        self.overlay.send(PUBLISH, &message, &self.attached()?)?;
        Ok(message.id())
    }

    /// Publish a message subscribers may answer. Collect the answers with
    /// [`next_reply`](Self::next_reply) or [`all_replies`](Self::all_replies).
    pub fn publish_repliable(&self, content: F::Content) -> Result<MessageId, BrokerError> {
        let broker = self.attached()?;
        let message = Message::repliable(content).with_origin(self.descriptor().id());
        self.inner
            .replies
            .expect(message.id(), Instant::now() + self.reply_timeout);
        self.overlay.send(PUBLISH, &message, &broker)?;
        Ok(message.id())
    }

    /// Answer a repliable message received from the broker.
    pub fn reply(&self, content: F::Content, to: &Message<F::Content>) -> Result<(), BrokerError> {
        if !to.is_repliable() {
            debug!("{} is not repliable; reply dropped", to.id());
            return Ok(());
        }
        let reply = Reply::new(to.id(), content, to.origin());
        self.overlay.send(REPLY, &reply, &self.attached()?)
    }

    // ── Delivery ────────────────────────────────────────────────────

    /// Wait for the next delivered message.
    pub async fn next_message(&self) -> Message<F::Content> {
        loop {
            let delivered = self.inner.delivered.notified();
            tokio::pin!(delivered);
            delivered.as_mut().enable();
            if let Some(message) = self.inner.inbox.lock().pop_front() {
                return message;
            }
            delivered.await;
        }
    }

    pub async fn next_message_timeout(&self, timeout: Duration) -> Option<Message<F::Content>> {
        tokio::time::timeout(timeout, self.next_message()).await.ok()
    }

    pub fn has_more_messages(&self) -> bool {
        !self.inner.inbox.lock().is_empty()
    }

    pub async fn next_reply(&self, id: MessageId) -> Result<Option<F::Content>, BrokerError> {
        self.inner.replies.next_reply(id).await
    }

    pub fn has_more_replies(&self, id: &MessageId) -> bool {
        self.inner.replies.has_more_replies(id)
    }

    pub async fn all_replies(&self, id: MessageId) -> Replies<F::Content> {
        self.inner.replies.all_replies(id).await
    }

    pub async fn shutdown(&self) {
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.abort();
        }
        self.disconnect();
        self.overlay.stop().await;
    }
}

impl<F: Filter> Drop for Client<F> {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.abort();
        }
    }
}

fn decode<T: DeserializeOwned>(subject: &str, source: &NodeDescriptor, payload: &[u8]) -> Option<T> {
    match rmp_serde::from_slice(payload) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("malformed {subject} from {source}: {e}");
            None
        }
    }
}

impl<F: Filter> PacketListener for ClientInner<F> {
    fn packet_arrived(&self, subject: &str, source: &NodeDescriptor, payload: &[u8]) {
        match subject {
            PUBLISH => {
                if let Some(message) = decode::<Message<F::Content>>(subject, source, payload) {
                    self.inbox.lock().push_back(message);
                    self.delivered.notify_waiters();
                }
            }
            REPLY => {
                if let Some(reply) = decode::<Reply<F::Content>>(subject, source, payload) {
                    let id = reply.message_id;
                    if !self.replies.push(reply) {
                        debug!("reply for unknown or expired {id} dropped");
                    }
                }
            }
            other => debug!("client ignores subject {other}"),
        }
    }
}

impl<F: Filter> ClientInner<F> {
    fn forget_broker(&self, neighbor: &NodeDescriptor) -> bool {
        let mut broker = self.broker.lock();
        if broker.as_ref() == Some(neighbor) {
            *broker = None;
            true
        } else {
            false
        }
    }
}

impl<F: Filter> NeighborhoodListener for ClientInner<F> {
    fn neighbor_added(&self, _neighbor: &NodeDescriptor, _reconfiguration: Option<ReconfigurationId>) {}

    fn neighbor_removed(&self, neighbor: &NodeDescriptor) {
        if self.forget_broker(neighbor) {
            debug!("detached from {neighbor}");
        }
    }

    fn neighbor_dead(&self, neighbor: &NodeDescriptor, _reconfiguration: Option<&ReconfigurationInfo>) {
        if self.forget_broker(neighbor) {
            warn!("lost broker {neighbor}");
        }
    }
}

async fn sweep_loop<F: Filter>(inner: Arc<ClientInner<F>>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let expired = inner.replies.sweep(Instant::now());
        if expired > 0 {
            debug!("discarded {expired} abandoned reply row(s)");
        }
    }
}
