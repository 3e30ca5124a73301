use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::types::NodeId;

/// Identity of a node in the overlay.
///
/// The id is fixed for the life of the process; the URL set changes as
/// transports start and stop and is shared by every clone of the
/// descriptor. Equality and hashing use the id only. Ordering puts every
/// client before every broker, then orders by id.
#[derive(Clone, Serialize, Deserialize)]
#[serde(from = "DescriptorWire", into = "DescriptorWire")]
pub struct NodeDescriptor {
    inner: Arc<DescriptorInner>,
}

struct DescriptorInner {
    id: NodeId,
    broker: bool,
    urls: RwLock<Vec<String>>,
}

/// Serialized form: a snapshot of the URL set.
#[derive(Serialize, Deserialize)]
struct DescriptorWire {
    id: NodeId,
    broker: bool,
    urls: Vec<String>,
}

impl NodeDescriptor {
    pub fn new(id: NodeId, broker: bool) -> Self {
        Self {
            inner: Arc::new(DescriptorInner {
                id,
                broker,
                urls: RwLock::new(Vec::new()),
            }),
        }
    }

    /// Fresh broker identity.
    pub fn broker() -> Self {
        Self::new(NodeId::random(), true)
    }

    /// Fresh client identity.
    pub fn client() -> Self {
        Self::new(NodeId::random(), false)
    }

    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    pub fn is_broker(&self) -> bool {
        self.inner.broker
    }

    pub fn is_client(&self) -> bool {
        !self.inner.broker
    }

    pub fn urls(&self) -> Vec<String> {
        self.inner.urls.read().clone()
    }

    pub fn first_url(&self) -> Option<String> {
        self.inner.urls.read().first().cloned()
    }

    pub fn add_url(&self, url: &str) {
        let mut urls = self.inner.urls.write();
        if !urls.iter().any(|u| u == url) {
            urls.push(url.to_string());
        }
    }

    pub fn remove_url(&self, url: &str) {
        self.inner.urls.write().retain(|u| u != url);
    }
}

impl From<DescriptorWire> for NodeDescriptor {
    fn from(wire: DescriptorWire) -> Self {
        let descriptor = NodeDescriptor::new(wire.id, wire.broker);
        *descriptor.inner.urls.write() = wire.urls;
        descriptor
    }
}

impl From<NodeDescriptor> for DescriptorWire {
    fn from(descriptor: NodeDescriptor) -> Self {
        DescriptorWire {
            id: descriptor.inner.id,
            broker: descriptor.inner.broker,
            urls: descriptor.urls(),
        }
    }
}

impl PartialEq for NodeDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for NodeDescriptor {}

impl Hash for NodeDescriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl Ord for NodeDescriptor {
    fn cmp(&self, other: &Self) -> Ordering {
        self.inner
            .broker
            .cmp(&other.inner.broker)
            .then_with(|| self.inner.id.cmp(&other.inner.id))
    }
}

impl PartialOrd for NodeDescriptor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for NodeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.inner.broker { "Broker" } else { "Client" };
        write!(f, "{kind}:{}", self.inner.id)
    }
}

impl fmt::Debug for NodeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use uuid::Uuid;

    fn node(seed: u128, broker: bool) -> NodeDescriptor {
        NodeDescriptor::new(NodeId::from_uuid(Uuid::from_u128(seed)), broker)
    }

    #[test]
    fn clients_sort_before_brokers() {
        let client = node(u128::MAX, false);
        let broker = node(1, true);
        assert!(client < broker);
        assert!(node(1, true) < node(2, true));
        assert!(node(1, false) < node(2, false));
    }

    #[test]
    fn equality_ignores_urls() {
        let a = node(7, true);
        let b = node(7, true);
        a.add_url("arbor-tcp:127.0.0.1:1911");
        assert_eq!(a, b);
        assert_ne!(a.urls(), b.urls());
    }

    #[test]
    fn urls_are_shared_between_clones() {
        let a = NodeDescriptor::broker();
        let b = a.clone();
        a.add_url("arbor-tcp:127.0.0.1:1");
        a.add_url("arbor-tcp:127.0.0.1:1");
        assert_eq!(b.urls(), vec!["arbor-tcp:127.0.0.1:1".to_string()]);
        b.remove_url("arbor-tcp:127.0.0.1:1");
        assert!(a.first_url().is_none());
    }

    #[test]
    fn msgpack_carries_url_snapshot() {
        let a = NodeDescriptor::broker();
        a.add_url("arbor-tcp:10.0.0.1:1911");
        let bytes = rmp_serde::to_vec(&a).unwrap();
        let b: NodeDescriptor = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(a, b);
        assert!(b.is_broker());
        assert_eq!(b.urls(), a.urls());
    }

    #[test]
    fn display_names_kind() {
        let c = node(1, false);
        assert!(c.to_string().starts_with("Client:"));
        assert!(node(1, true).to_string().starts_with("Broker:"));
    }

    proptest! {
        #[test]
        fn order_is_total_and_antisymmetric(
            a in any::<u128>(),
            b in any::<u128>(),
            ka in any::<bool>(),
            kb in any::<bool>()
        ) {
            let x = node(a, ka);
            let y = node(b, kb);
            let xy = x.cmp(&y);
            prop_assert_eq!(xy, y.cmp(&x).reverse());
            if ka != kb {
                prop_assert_eq!(xy == Ordering::Less, !ka);
            }
        }
    }
}
