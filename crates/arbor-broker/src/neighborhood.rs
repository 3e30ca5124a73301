use serde::Serialize;

use crate::descriptor::NodeDescriptor;
use crate::error::BrokerError;

/// What routing sees of the overlay: the local node, its neighbors and a
/// way to push an encoded packet to one of them.
///
/// In production: implemented by [`Overlay`](crate::overlay::Overlay).
/// In tests: implemented by `MockNeighborhood` (records every send).
pub trait Neighborhood: Send + Sync {
    fn local(&self) -> &NodeDescriptor;

    fn neighbors(&self) -> Vec<NodeDescriptor>;

    fn neighbors_except(&self, excluded: &NodeDescriptor) -> Vec<NodeDescriptor> {
        self.neighbors()
            .into_iter()
            .filter(|n| n != excluded)
            .collect()
    }

    fn is_neighbor(&self, node: &NodeDescriptor) -> bool;

    fn number_of_brokers(&self) -> usize {
        self.neighbors().iter().filter(|n| n.is_broker()).count()
    }

    /// Send an already-encoded payload under `subject` to the neighbor `to`.
    fn send_raw(&self, subject: &str, payload: &[u8], to: &NodeDescriptor)
        -> Result<(), BrokerError>;
}

/// Encode `packet` with MessagePack and send it to `to`.
pub fn send_packet<T: Serialize + ?Sized>(
    neighborhood: &dyn Neighborhood,
    subject: &str,
    packet: &T,
    to: &NodeDescriptor,
) -> Result<(), BrokerError> {
    let bytes = rmp_serde::to_vec(packet)?;
    neighborhood.send_raw(subject, &bytes, to)
}

// ── MockNeighborhood (tests) ────────────────────────────────────────
