//! Arbor broker layer.
//!
//! Content-based publish/subscribe over an acyclic overlay of brokers.
//! Clients attach to one broker each; subscriptions flow toward
//! publishers, messages flow back along the reverse path, and replies to
//! repliable messages retrace the path of the message they answer.
//!
//! When a link between brokers fails, a reconfigurator keeps routing
//! consistent while the overlay is repaired: either by deferring the
//! unsubscriptions caused by the failure, or by activating the replacement
//! link with the filters it must carry (informed link activation).
//!
//! Wire format: MessagePack (compact binary), over `arbor-transport`.

pub mod broker;
pub mod client;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod filter;
pub mod message;
pub mod neighborhood;
pub mod overlay;
pub mod reconfig;
pub mod reply;
pub mod router;
pub mod strategy;
pub mod subscription;
pub mod topology;
pub mod types;

pub use broker::{Broker, Reconfiguration};
pub use client::Client;
pub use config::{BrokerConfig, ClientConfig, ReconfigurationConfig};
pub use descriptor::NodeDescriptor;
pub use error::BrokerError;
pub use filter::{AttributeFilter, Attributes, Constraint, Filter, Value};
pub use message::{Message, Replies, Reply};
pub use neighborhood::Neighborhood;
pub use overlay::{Overlay, PacketListener};
pub use reconfig::{DeferredUnsubscription, InformedLinkActivation, Reconfigurator};
pub use reply::{ReplyManager, ReplyTable};
pub use router::Router;
pub use strategy::{RoutingStrategy, SubscriptionForwarding};
pub use subscription::SubscriptionTable;
pub use topology::{NeighborhoodListener, TopologyManager};
pub use arbor_transport::TcpTransportConfig;
pub use types::{LinkSubstitution, MessageId, NodeId, ReconfigurationId, ReconfigurationInfo};
