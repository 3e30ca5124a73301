//! Asynchronous packet dispatch on top of the topology.
//!
//! Transport threads only enqueue: every incoming packet from a neighbor is
//! classified by subject into a traffic class, and a single dispatch task
//! drains the classes round-robin and hands packets to subject listeners.
//! Packets of one class are delivered in arrival order.

mod traffic;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arbor_transport::{DataListener, Link, ListenerRegistry, TransportError};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::descriptor::NodeDescriptor;
use crate::error::BrokerError;
use crate::neighborhood::Neighborhood;
use crate::topology::{NeighborhoodListener, TopologyManager};
use traffic::{Enqueued, Incoming, TrafficClasses};

/// Class of every subject that was not assigned one explicitly.
pub const DEFAULT_CLASS: &str = "MiscClass";

/// Receiver of packets dispatched by the overlay.
pub trait PacketListener: Send + Sync {
    fn packet_arrived(&self, subject: &str, source: &NodeDescriptor, payload: &[u8]);
}

#[derive(Clone)]
pub struct Overlay {
    inner: Arc<OverlayInner>,
}

struct OverlayInner {
    topology: TopologyManager,
    running: AtomicBool,
    classes: Mutex<TrafficClasses>,
    listeners: ListenerRegistry<String, dyn PacketListener>,
    wake: Notify,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Overlay {
    /// Wrap `topology`. Transports must be attached to it before packet
    /// listeners are registered here.
    pub fn new(topology: TopologyManager) -> Self {
        let mut classes = TrafficClasses::default();
        classes.add_class(DEFAULT_CLASS, None);
        Self {
            inner: Arc::new(OverlayInner {
                topology,
                running: AtomicBool::new(false),
                classes: Mutex::new(classes),
                listeners: ListenerRegistry::new(),
                wake: Notify::new(),
                dispatcher: Mutex::new(None),
            }),
        }
    }

    pub fn topology(&self) -> &TopologyManager {
        &self.inner.topology
    }

    pub fn node_descriptor(&self) -> &NodeDescriptor {
        self.inner.topology.local()
    }

    pub fn number_of_neighbors(&self) -> usize {
        self.inner.topology.number_of_neighbors()
    }

    pub fn number_of_clients(&self) -> usize {
        self.inner.topology.number_of_clients()
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Start the topology, then the dispatch task. Idempotent.
    pub async fn start(&self) -> Result<(), BrokerError> {
        if self.is_running() {
            return Ok(());
        }
        self.inner.topology.start().await?;
        self.inner.running.store(true, Ordering::Release);

        let inner = self.inner.clone();
        let handle = tokio::spawn(async move { inner.dispatch_loop().await });
        *self.inner.dispatcher.lock() = Some(handle);
        Ok(())
    }

    /// Stop dispatching and wait for the dispatch task to finish, then stop
    /// the topology. No packet is delivered once this returns.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.inner.wake.notify_one();
        let handle = self.inner.dispatcher.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("dispatch task ended abnormally: {e}");
            }
        }
        self.inner.classes.lock().clear();
        self.inner.topology.stop().await;
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    // ── Sending ─────────────────────────────────────────────────────

    /// Encode `packet` and send it to the neighbor `to`.
    pub fn send<T: Serialize + ?Sized>(
        &self,
        subject: &str,
        packet: &T,
        to: &NodeDescriptor,
    ) -> Result<(), BrokerError> {
        let bytes = rmp_serde::to_vec(packet)?;
        self.send_bytes(subject, &bytes, to)
    }

    pub fn send_bytes(
        &self,
        subject: &str,
        payload: &[u8],
        to: &NodeDescriptor,
    ) -> Result<(), BrokerError> {
        if !self.is_running() {
            return Err(BrokerError::NotRunning);
        }
        let not_connected = || BrokerError::NotConnected {
            neighbor: to.to_string(),
        };
        let link = self.inner.topology.link_for(to).ok_or_else(not_connected)?;
        link.send(subject, payload).map_err(|e| match e {
            TransportError::NotConnected => not_connected(),
            TransportError::MessageTooLarge { size, max } => {
                BrokerError::MessageTooLarge { size, max }
            }
            other => other.into(),
        })
    }

    // ── Listeners ───────────────────────────────────────────────────

    /// Deliver packets with `subject` to `listener`. The subject falls in
    /// the default class unless a class was set for it.
    pub fn add_packet_listener(&self, subject: &str, listener: Arc<dyn PacketListener>) {
        {
            let mut classes = self.inner.classes.lock();
            if classes.class_of(subject).is_none() {
                classes.set_class(subject, DEFAULT_CLASS);
            }
        }
        if self.inner.listeners.add(subject.to_string(), listener) {
            let data: Arc<dyn DataListener> = self.inner.clone();
            for transport in self.inner.topology.transports() {
                transport.add_data_listener(subject, data.clone());
            }
        }
    }

    pub fn remove_packet_listener(&self, subject: &str, listener: &Arc<dyn PacketListener>) {
        if self.inner.listeners.remove(&subject.to_string(), listener) {
            let data: Arc<dyn DataListener> = self.inner.clone();
            for transport in self.inner.topology.transports() {
                transport.remove_data_listener(subject, &data);
            }
        }
    }

    pub fn add_neighborhood_listener(&self, listener: Arc<dyn NeighborhoodListener>) {
        self.inner.topology.add_neighborhood_listener(listener);
    }

    // ── Traffic classes ─────────────────────────────────────────────

    /// Declare a class. `capacity` bounds its queue; `None` is unbounded.
    pub fn add_traffic_class(&self, name: &str, capacity: Option<usize>) -> Result<(), BrokerError> {
        if self.inner.classes.lock().add_class(name, capacity) {
            Ok(())
        } else {
            Err(BrokerError::Config(format!("traffic class {name} already exists")))
        }
    }

    /// Assign `subject` to class `name`, creating it unbounded if unknown.
    pub fn set_traffic_class(&self, subject: &str, name: &str) {
        self.inner.classes.lock().set_class(subject, name);
    }

    pub fn traffic_classes(&self) -> Vec<String> {
        self.inner.classes.lock().names()
    }

    /// Packets received but not yet dispatched.
    pub fn pending_packets(&self) -> usize {
        self.inner.classes.lock().pending()
    }

    pub fn traffic_class_of(&self, subject: &str) -> Option<String> {
        self.inner
            .classes
            .lock()
            .class_of(subject)
            .map(str::to_string)
    }
}

impl OverlayInner {
    async fn dispatch_loop(&self) {
        debug!("dispatch loop started for {}", self.topology.local());
        loop {
            if !self.running.load(Ordering::Acquire) {
                break;
            }
            let round = self.classes.lock().next_round();
            if round.is_empty() {
                self.wake.notified().await;
                continue;
            }
            for packet in round {
                if !self.running.load(Ordering::Acquire) {
                    break;
                }
                for listener in self.listeners.snapshot(&packet.subject) {
                    listener.packet_arrived(&packet.subject, &packet.source, &packet.payload);
                }
            }
            tokio::task::yield_now().await;
        }
        debug!("dispatch loop stopped for {}", self.topology.local());
    }
}

impl DataListener for OverlayInner {
    fn data_arrived(&self, subject: &str, link: &Link, payload: &[u8]) {
        if !self.running.load(Ordering::Acquire) {
            return;
        }
        let Some(source) = self.topology.neighbor_for(link.id()) else {
            trace!("{subject} from {link} before admission, dropped");
            return;
        };
        let packet = Incoming {
            subject: subject.to_string(),
            source,
            payload: payload.to_vec(),
        };
        match self.classes.lock().enqueue(packet) {
            Enqueued::Queued => self.wake.notify_one(),
            Enqueued::Dropped => debug!("traffic class of {subject} full, packet dropped"),
            Enqueued::Unclassified => debug!("no traffic class for {subject}, packet dropped"),
        }
    }
}

impl Neighborhood for Overlay {
    fn local(&self) -> &NodeDescriptor {
        self.inner.topology.local()
    }

    fn neighbors(&self) -> Vec<NodeDescriptor> {
        self.inner.topology.neighbors()
    }

    fn neighbors_except(&self, excluded: &NodeDescriptor) -> Vec<NodeDescriptor> {
        self.inner.topology.neighbors_except(excluded)
    }

    fn is_neighbor(&self, node: &NodeDescriptor) -> bool {
        self.inner.topology.is_neighbor(node)
    }

    fn number_of_brokers(&self) -> usize {
        self.inner.topology.number_of_brokers()
    }

    fn send_raw(
        &self,
        subject: &str,
        payload: &[u8],
        to: &NodeDescriptor,
    ) -> Result<(), BrokerError> {
        self.send_bytes(subject, payload, to)
    }
}
