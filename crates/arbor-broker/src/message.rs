use serde::{Deserialize, Serialize};

use crate::types::{MessageId, NodeId};

/// A published message: application content plus routing metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message<C> {
    id: MessageId,
    repliable: bool,
    origin: Option<NodeId>,
    content: C,
}

impl<C> Message<C> {
    /// New message with a fresh id.
    pub fn new(content: C) -> Self {
        Self {
            id: MessageId::random(),
            repliable: false,
            origin: None,
            content,
        }
    }

    /// New message whose publisher expects correlated replies.
    pub fn repliable(content: C) -> Self {
        Self {
            repliable: true,
            ..Self::new(content)
        }
    }

    /// Record the publishing node; replies use it as their destination hint.
    pub fn with_origin(mut self, origin: NodeId) -> Self {
        self.origin = Some(origin);
        self
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn is_repliable(&self) -> bool {
        self.repliable
    }

    pub fn origin(&self) -> Option<NodeId> {
        self.origin
    }

    pub fn content(&self) -> &C {
        &self.content
    }

    pub fn into_content(self) -> C {
        self.content
    }
}

/// A reply travelling back toward the publisher of a repliable message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply<C> {
    /// Id of the repliable message this answers.
    pub message_id: MessageId,
    /// No further reply follows from this branch.
    pub last: bool,
    pub payload: Option<C>,
    /// Publisher of the original message, when known.
    pub destination: Option<NodeId>,
}

impl<C> Reply<C> {
    /// A single, final reply from one subscriber.
    pub fn new(message_id: MessageId, payload: C, destination: Option<NodeId>) -> Self {
        Self {
            message_id,
            last: true,
            payload: Some(payload),
            destination,
        }
    }

    /// Terminal marker with no payload.
    pub fn terminal(message_id: MessageId, destination: Option<NodeId>) -> Self {
        Self {
            message_id,
            last: true,
            payload: None,
            destination,
        }
    }
}

/// Every reply collected for one message.
#[derive(Debug, Clone, PartialEq)]
pub struct Replies<C> {
    pub replies: Vec<C>,
    /// The terminal marker was seen before the deadline.
    pub complete: bool,
}
