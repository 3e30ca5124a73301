//! Who is subscribed to what, indexed both ways.
//!
//! A `(neighbor, filter)` pair appears at most once. The table is not
//! internally synchronized: it lives inside the router lock, which also
//! serializes reconfiguration.

use std::collections::{HashMap, HashSet};

use crate::descriptor::NodeDescriptor;
use crate::filter::Filter;
use crate::message::Message;

#[derive(Debug)]
pub struct SubscriptionTable<F: Filter> {
    by_neighbor: HashMap<NodeDescriptor, HashSet<F>>,
    by_filter: HashMap<F, HashSet<NodeDescriptor>>,
}

impl<F: Filter> Default for SubscriptionTable<F> {
    fn default() -> Self {
        Self {
            by_neighbor: HashMap::new(),
            by_filter: HashMap::new(),
        }
    }
}

impl<F: Filter> SubscriptionTable<F> {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Mutation ────────────────────────────────────────────────────

    /// Record the pair. Returns `false` if it was already present.
    pub fn add_subscription(&mut self, neighbor: &NodeDescriptor, filter: &F) -> bool {
        let added = self
            .by_neighbor
            .entry(neighbor.clone())
            .or_default()
            .insert(filter.clone());
        if added {
            self.by_filter
                .entry(filter.clone())
                .or_default()
                .insert(neighbor.clone());
        }
        added
    }

    /// Drop the pair. Returns `false` if it was not present.
    pub fn remove_subscription(&mut self, neighbor: &NodeDescriptor, filter: &F) -> bool {
        let Some(filters) = self.by_neighbor.get_mut(neighbor) else {
            return false;
        };
        if !filters.remove(filter) {
            return false;
        }
        if filters.is_empty() {
            self.by_neighbor.remove(neighbor);
        }
        if let Some(holders) = self.by_filter.get_mut(filter) {
            holders.remove(neighbor);
            if holders.is_empty() {
                self.by_filter.remove(filter);
            }
        }
        true
    }

    /// Drop every filter of `neighbor`, returning them.
    pub fn remove_all_subscriptions(&mut self, neighbor: &NodeDescriptor) -> Vec<F> {
        let filters: Vec<F> = self
            .by_neighbor
            .remove(neighbor)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();
        for filter in &filters {
            if let Some(holders) = self.by_filter.get_mut(filter) {
                holders.remove(neighbor);
                if holders.is_empty() {
                    self.by_filter.remove(filter);
                }
            }
        }
        filters
    }

    pub fn clear(&mut self) {
        self.by_neighbor.clear();
        self.by_filter.clear();
    }

    // ── Queries ─────────────────────────────────────────────────────

    pub fn is_subscribed(&self, neighbor: &NodeDescriptor, filter: &F) -> bool {
        self.by_neighbor
            .get(neighbor)
            .is_some_and(|filters| filters.contains(filter))
    }

    /// At least one neighbor holds `filter`.
    pub fn is_filter_in_table(&self, filter: &F) -> bool {
        self.by_filter.contains_key(filter)
    }

    pub fn subscribed_neighbors(&self, filter: &F) -> Vec<NodeDescriptor> {
        self.by_filter
            .get(filter)
            .map(|holders| holders.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// The broker holding `filter`, if exactly one broker does.
    /// Client holders are not counted.
    pub fn single_subscribed_broker(&self, filter: &F) -> Option<NodeDescriptor> {
        let mut brokers = self
            .by_filter
            .get(filter)?
            .iter()
            .filter(|n| n.is_broker());
        let first = brokers.next()?;
        match brokers.next() {
            None => Some(first.clone()),
            Some(_) => None,
        }
    }

    /// Every filter in the table, optionally restricted to those held by a
    /// broker.
    pub fn all_filters(&self, only_brokers: bool) -> Vec<F> {
        self.by_filter
            .iter()
            .filter(|(_, holders)| !only_brokers || holders.iter().any(|n| n.is_broker()))
            .map(|(f, _)| f.clone())
            .collect()
    }

    /// Every filter held by some neighbor other than `excluded`.
    pub fn all_filters_except(&self, only_brokers: bool, excluded: &NodeDescriptor) -> Vec<F> {
        self.by_filter
            .iter()
            .filter(|(_, holders)| {
                holders
                    .iter()
                    .any(|n| n != excluded && (!only_brokers || n.is_broker()))
            })
            .map(|(f, _)| f.clone())
            .collect()
    }

    pub fn filters_of(&self, neighbor: &NodeDescriptor) -> Vec<F> {
        self.by_neighbor
            .get(neighbor)
            .map(|filters| filters.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Neighbors holding at least one filter.
    pub fn neighbors(&self) -> Vec<NodeDescriptor> {
        self.by_neighbor.keys().cloned().collect()
    }

    /// Distinct neighbors with at least one filter matching `message`,
    /// never including `excluded`.
    pub fn matches(
        &self,
        message: &Message<F::Content>,
        excluded: Option<&NodeDescriptor>,
    ) -> Vec<NodeDescriptor> {
        self.by_neighbor
            .iter()
            .filter(|(n, _)| Some(*n) != excluded)
            .filter(|(_, filters)| filters.iter().any(|f| f.matches(message)))
            .map(|(n, _)| n.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.by_neighbor.values().map(HashSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_neighbor.is_empty()
    }
}
