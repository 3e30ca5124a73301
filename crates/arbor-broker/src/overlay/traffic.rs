use std::collections::{HashMap, VecDeque};

use crate::descriptor::NodeDescriptor;

/// A packet waiting for dispatch.
#[derive(Debug, Clone)]
pub(crate) struct Incoming {
    pub subject: String,
    pub source: NodeDescriptor,
    pub payload: Vec<u8>,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Enqueued {
    Queued,
    /// The class is bounded and full; the packet was discarded.
    Dropped,
    /// No class is assigned to the subject.
    Unclassified,
}

#[derive(Debug)]
struct TrafficClass {
    name: String,
    capacity: Option<usize>,
    queue: VecDeque<Incoming>,
}

/// Named FIFO queues, one per traffic class, and the subject → class map.
#[derive(Debug, Default)]
pub(crate) struct TrafficClasses {
    classes: Vec<TrafficClass>,
    by_subject: HashMap<String, usize>,
    /// Next class to look at, for round-robin service.
    cursor: usize,
}

impl TrafficClasses {
    /// Returns `false` if a class with that name already exists.
    pub fn add_class(&mut self, name: &str, capacity: Option<usize>) -> bool {
        if self.index_of(name).is_some() {
            return false;
        }
        self.classes.push(TrafficClass {
            name: name.to_string(),
            capacity,
            queue: VecDeque::new(),
        });
        true
    }

    /// Route `subject` to class `name`, creating an unbounded class if needed.
    pub fn set_class(&mut self, subject: &str, name: &str) {
        let index = match self.index_of(name) {
            Some(i) => i,
            None => {
                self.add_class(name, None);
                self.classes.len() - 1
            }
        };
        self.by_subject.insert(subject.to_string(), index);
    }

    pub fn class_of(&self, subject: &str) -> Option<&str> {
        self.by_subject
            .get(subject)
            .map(|&i| self.classes[i].name.as_str())
    }

    pub fn enqueue(&mut self, packet: Incoming) -> Enqueued {
        let Some(&index) = self.by_subject.get(&packet.subject) else {
            return Enqueued::Unclassified;
        };
        let class = &mut self.classes[index];
        if class.capacity.is_some_and(|cap| class.queue.len() >= cap) {
            return Enqueued::Dropped;
        }
        class.queue.push_back(packet);
        Enqueued::Queued
    }

    /// One packet from each non-empty class, starting after the class that
    /// was served first last time.
    pub fn next_round(&mut self) -> Vec<Incoming> {
        let n = self.classes.len();
        let mut round = Vec::new();
        for offset in 0..n {
            let index = (self.cursor + offset) % n;
            if let Some(packet) = self.classes[index].queue.pop_front() {
                round.push(packet);
            }
        }
        if n > 0 {
            self.cursor = (self.cursor + 1) % n;
        }
        round
    }

    /// Class names in declaration order.
    pub fn names(&self) -> Vec<String> {
        self.classes.iter().map(|c| c.name.clone()).collect()
    }

    pub fn pending(&self) -> usize {
        self.classes.iter().map(|c| c.queue.len()).sum()
    }

    pub fn clear(&mut self) {
        for class in &mut self.classes {
            class.queue.clear();
        }
    }

    fn index_of(&self, name: &str) -> Option<usize> {
        self.classes.iter().position(|c| c.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(subject: &str, n: u8) -> Incoming {
        Incoming {
            subject: subject.into(),
            source: NodeDescriptor::broker(),
            payload: vec![n],
        }
    }

    #[test]
    fn unclassified_subject_is_rejected() {
        let mut classes = TrafficClasses::default();
        assert_eq!(classes.enqueue(packet("x", 0)), Enqueued::Unclassified);
    }

    #[test]
    fn duplicate_class_is_refused() {
        let mut classes = TrafficClasses::default();
        assert!(classes.add_class("A", None));
        assert!(!classes.add_class("A", Some(3)));
    }

    #[test]
    fn bounded_class_drops_newest() {
        let mut classes = TrafficClasses::default();
        classes.add_class("Small", Some(2));
        classes.set_class("s", "Small");
        assert_eq!(classes.enqueue(packet("s", 1)), Enqueued::Queued);
        assert_eq!(classes.enqueue(packet("s", 2)), Enqueued::Queued);
        assert_eq!(classes.enqueue(packet("s", 3)), Enqueued::Dropped);

        let kept: Vec<u8> = std::iter::from_fn(|| classes.next_round().pop())
            .map(|p| p.payload[0])
            .collect();
        assert_eq!(kept, vec![1, 2]);
    }

    #[test]
    fn fifo_within_a_class_round_robin_across() {
        let mut classes = TrafficClasses::default();
        classes.set_class("a", "A");
        classes.set_class("b", "B");
        for i in 0..3 {
            classes.enqueue(packet("a", i));
        }
        classes.enqueue(packet("b", 10));
        assert_eq!(classes.class_of("b"), Some("B"));

        let first = classes.next_round();
        assert_eq!(first.len(), 2);
        assert_eq!(classes.pending(), 2);

        let mut a_order = vec![first.iter().find(|p| p.subject == "a").unwrap().payload[0]];
        while classes.pending() > 0 {
            for p in classes.next_round() {
                a_order.push(p.payload[0]);
            }
        }
        assert_eq!(a_order, vec![0, 1, 2]);
    }

    #[test]
    fn clear_empties_every_queue() {
        let mut classes = TrafficClasses::default();
        classes.set_class("a", "A");
        classes.enqueue(packet("a", 0));
        classes.clear();
        assert_eq!(classes.pending(), 0);
    }
}
