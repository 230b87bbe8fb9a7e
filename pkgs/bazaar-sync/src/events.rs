//! Record and event types shared by the timeline, the sidebar and the backend

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::offer::OfferStatus;

macro_rules! durable_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }
    };
}

durable_id!(
    /// Backend-assigned message identifier
    MessageId
);
durable_id!(
    /// Backend-assigned offer identifier
    OfferId
);
durable_id!(ConversationId);
durable_id!(UserId);
durable_id!(ItemId);

/// Client-minted identifier for an entry awaiting backend confirmation.
///
/// Never persisted; only meaningful inside the process that minted it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LocalId(Uuid);

impl LocalId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LocalId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "local:{}", self.0)
    }
}

/// Identity of a timeline entry or offer snapshot.
///
/// A `Pending` identity is replaced by its `Confirmed` twin on reconciliation.
/// Comparison is structural: a pending id never equals a confirmed one.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ident<T> {
    Pending(LocalId),
    Confirmed(T),
}

impl<T> Ident<T> {
    pub fn is_pending(&self) -> bool {
        matches!(self, Ident::Pending(_))
    }

    pub fn confirmed(&self) -> Option<&T> {
        match self {
            Ident::Confirmed(id) => Some(id),
            Ident::Pending(_) => None,
        }
    }

    pub fn local(&self) -> Option<LocalId> {
        match self {
            Ident::Pending(local) => Some(*local),
            Ident::Confirmed(_) => None,
        }
    }
}

impl<T: fmt::Display> fmt::Display for Ident<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ident::Pending(local) => write!(f, "{}", local),
            Ident::Confirmed(id) => write!(f, "{}", id),
        }
    }
}

/// Message kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Offer,
    ItemInquiry,
}

/// Price offer, either a backend row or an optimistic snapshot of one
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offer {
    pub id: Ident<OfferId>,
    pub conversation_id: ConversationId,
    pub item_id: ItemId,
    pub maker_id: UserId,
    /// Integer minor currency units
    pub price_minor_units: i64,
    pub currency: String,
    pub status: OfferStatus,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// One timeline entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: Ident<MessageId>,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub kind: MessageKind,
    pub body: Option<String>,
    pub offer_id: Option<Ident<OfferId>>,
    pub created_at: DateTime<Utc>,
    /// Copy of the referenced offer; refreshed only by explicit re-embedding
    pub offer: Option<Offer>,
}

impl Message {
    /// Total timeline order: creation time, then identity.
    pub fn sort_key(&self) -> (DateTime<Utc>, &Ident<MessageId>) {
        (self.created_at, &self.id)
    }

    pub fn references_offer(&self, offer_id: &Ident<OfferId>) -> bool {
        self.offer_id.as_ref() == Some(offer_id)
    }
}

/// Create-message request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub kind: MessageKind,
    pub body: Option<String>,
    pub offer_id: Option<OfferId>,
}

/// Create-offer request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewOffer {
    pub conversation_id: ConversationId,
    pub item_id: ItemId,
    pub maker_id: UserId,
    pub price_minor_units: i64,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Conversation row as delivered by the change feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub id: ConversationId,
    pub item_id: ItemId,
    pub user_a_id: UserId,
    pub user_b_id: UserId,
    pub created_at: DateTime<Utc>,
}

impl ConversationRecord {
    /// The other participant, or `None` if `user` is not a participant.
    pub fn peer_of(&self, user: &UserId) -> Option<&UserId> {
        if &self.user_a_id == user {
            Some(&self.user_b_id)
        } else if &self.user_b_id == user {
            Some(&self.user_a_id)
        } else {
            None
        }
    }
}

/// Peer display fields of a summary row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PeerDisplay {
    Resolved {
        name: Option<String>,
        avatar_url: Option<String>,
    },
    /// Placeholder awaiting a summary fetch; must not be shown as authoritative.
    Unresolved,
}

impl PeerDisplay {
    pub fn is_resolved(&self) -> bool {
        matches!(self, PeerDisplay::Resolved { .. })
    }
}

/// Last-message preview of a summary row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePreview {
    pub message_id: Option<MessageId>,
    pub body: Option<String>,
    pub kind: MessageKind,
    pub created_at: DateTime<Utc>,
}

impl From<&Message> for MessagePreview {
    fn from(message: &Message) -> Self {
        Self {
            message_id: message.id.confirmed().cloned(),
            body: message.body.clone(),
            kind: message.kind,
            created_at: message.created_at,
        }
    }
}

/// Per-conversation row of the conversation list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub conversation_id: ConversationId,
    pub item_id: ItemId,
    pub peer_id: UserId,
    pub peer: PeerDisplay,
    pub last_message: Option<MessagePreview>,
    pub unread_count: u32,
}

/// Row-level change notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedEvent {
    MessageInserted(Message),
    OfferUpdated(Offer),
    ConversationInserted(ConversationRecord),
}

/// Filter predicate of a change-feed subscription
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedScope {
    Conversation(ConversationId),
    Global,
}

impl FeedScope {
    /// Whether a subscriber with this scope receives `event`.
    ///
    /// Conversation scopes see message inserts and offer updates of that
    /// conversation only; conversation inserts go to global subscribers.
    pub fn matches(&self, event: &FeedEvent) -> bool {
        match (self, event) {
            (FeedScope::Global, _) => true,
            (FeedScope::Conversation(id), FeedEvent::MessageInserted(m)) => &m.conversation_id == id,
            (FeedScope::Conversation(id), FeedEvent::OfferUpdated(o)) => &o.conversation_id == id,
            (FeedScope::Conversation(_), FeedEvent::ConversationInserted(_)) => false,
        }
    }
}
