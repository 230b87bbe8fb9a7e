//! In-memory backend
//!
//! Holds conversations, messages, offers and read marks in process, enforces
//! the offer rules an authoritative backend would, and broadcasts row-level
//! changes to scoped subscribers. Faults and latency can be injected per
//! operation, and feed delivery can be held back, duplicated or dropped to
//! exercise the sync engine's ordering and dedup paths.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::backend::{Backend, FeedReceiver};
use crate::error::BackendError;
use crate::events::{
    ConversationId, ConversationRecord, ConversationSummary, FeedEvent, FeedScope, Ident, ItemId,
    Message, MessageId, MessageKind, MessagePreview, NewMessage, NewOffer, Offer, OfferId,
    PeerDisplay, UserId,
};
use crate::offer::{OfferResponse, OfferStatus};
use crate::SyncConfig;

/// Backend operation, used to target injected faults and latency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    CreateMessage,
    CreateOffer,
    RespondToOffer,
    MarkRead,
    ListMessages,
    GetOffer,
    ListSummaries,
    GetSummary,
    Subscribe,
}

#[derive(Debug, Clone, Copy)]
struct Fault {
    /// Calls that still succeed before the failing one
    skip: usize,
}

#[derive(Default)]
struct MemoryState {
    next_id: u64,
    last_timestamp: Option<DateTime<Utc>>,
    conversations: Vec<ConversationRecord>,
    messages: Vec<Message>,
    offers: HashMap<OfferId, Offer>,
    read_marks: HashMap<(ConversationId, UserId), DateTime<Utc>>,
    profiles: HashMap<UserId, (String, Option<String>)>,
    subscribers: Vec<(FeedScope, mpsc::UnboundedSender<FeedEvent>)>,
    held: Option<Vec<FeedEvent>>,
    faults: HashMap<Operation, Vec<Fault>>,
    latency: HashMap<Operation, std::time::Duration>,
}

impl MemoryState {
    fn mint(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}{}", prefix, self.next_id)
    }

    /// Strictly increasing server clock
    fn stamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let stamped = match self.last_timestamp {
            Some(last) if now <= last => last + Duration::milliseconds(1),
            _ => now,
        };
        self.last_timestamp = Some(stamped);
        stamped
    }

    fn take_fault(&mut self, op: Operation) -> bool {
        let Some(faults) = self.faults.get_mut(&op) else {
            return false;
        };
        let mut fired = false;
        faults.retain_mut(|fault| {
            if fired {
                return true;
            }
            if fault.skip == 0 {
                fired = true;
                false
            } else {
                fault.skip -= 1;
                true
            }
        });
        fired
    }

    fn publish(&mut self, event: FeedEvent) {
        if let Some(held) = self.held.as_mut() {
            held.push(event);
            return;
        }
        self.deliver(event);
    }

    fn deliver(&mut self, event: FeedEvent) {
        self.subscribers.retain(|(scope, sender)| {
            if !scope.matches(&event) {
                return !sender.is_closed();
            }
            sender.send(event.clone()).is_ok()
        });
    }

    fn conversation(&self, id: &ConversationId) -> Option<&ConversationRecord> {
        self.conversations.iter().find(|c| &c.id == id)
    }

    fn with_offer(&self, message: &Message) -> Message {
        let mut message = message.clone();
        if let Some(Ident::Confirmed(offer_id)) = &message.offer_id {
            message.offer = self.offers.get(offer_id).cloned();
        }
        message
    }

    fn summary_for(&self, record: &ConversationRecord, user: &UserId) -> Option<ConversationSummary> {
        let peer = record.peer_of(user)?.clone();
        let last = self
            .messages
            .iter()
            .filter(|m| m.conversation_id == record.id)
            .max_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        let read_mark = self.read_marks.get(&(record.id.clone(), user.clone()));
        let unread = self
            .messages
            .iter()
            .filter(|m| m.conversation_id == record.id && &m.sender_id != user)
            .filter(|m| read_mark.map_or(true, |mark| m.created_at > *mark))
            .count();
        let (name, avatar_url) = match self.profiles.get(&peer) {
            Some((name, avatar)) => (Some(name.clone()), avatar.clone()),
            None => (None, None),
        };

        Some(ConversationSummary {
            conversation_id: record.id.clone(),
            item_id: record.item_id.clone(),
            peer_id: peer,
            peer: PeerDisplay::Resolved { name, avatar_url },
            last_message: last.map(MessagePreview::from),
            unread_count: unread as u32,
        })
    }

    fn last_activity(&self, record: &ConversationRecord) -> DateTime<Utc> {
        self.messages
            .iter()
            .filter(|m| m.conversation_id == record.id)
            .map(|m| m.created_at)
            .max()
            .unwrap_or(record.created_at)
    }
}

/// Shared in-memory backend; hand out per-user views with [`MemoryBackend::client`]
#[derive(Clone)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
    currency: String,
}

impl MemoryBackend {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            currency: config.currency,
        }
    }

    /// Backend view acting as `user`; `None` behaves as signed out.
    pub fn client(&self, user: Option<UserId>) -> MemoryClient {
        MemoryClient {
            backend: self.clone(),
            user,
        }
    }

    pub fn register_profile(&self, user: &UserId, name: &str, avatar_url: Option<&str>) {
        self.state.lock().profiles.insert(
            user.clone(),
            (name.to_string(), avatar_url.map(str::to_string)),
        );
    }

    /// Get or create the conversation between two users about an item.
    ///
    /// A newly created conversation is published to global subscribers.
    pub fn open_conversation(
        &self,
        item: &ItemId,
        user_a: &UserId,
        user_b: &UserId,
    ) -> ConversationRecord {
        let mut state = self.state.lock();
        let existing = state.conversations.iter().find(|c| {
            &c.item_id == item
                && ((&c.user_a_id == user_a && &c.user_b_id == user_b)
                    || (&c.user_a_id == user_b && &c.user_b_id == user_a))
        });
        if let Some(record) = existing {
            return record.clone();
        }

        let record = ConversationRecord {
            id: ConversationId::new(state.mint("c")),
            item_id: item.clone(),
            user_a_id: user_a.clone(),
            user_b_id: user_b.clone(),
            created_at: state.stamp(),
        };
        state.conversations.push(record.clone());
        info!("Created conversation {} for item {}", record.id, item);
        state.publish(FeedEvent::ConversationInserted(record.clone()));
        record
    }

    /// Expire a pending offer, as the backend clock would.
    pub fn expire_offer(&self, offer_id: &OfferId) -> Result<Offer, BackendError> {
        let mut state = self.state.lock();
        let offer = state
            .offers
            .get_mut(offer_id)
            .ok_or_else(|| BackendError::NotFound(format!("offer {}", offer_id)))?;
        if !offer.status.can_transition_to(OfferStatus::Expired) {
            return Err(BackendError::Rejected(format!(
                "offer {} is already {:?}",
                offer_id, offer.status
            )));
        }
        offer.status = OfferStatus::Expired;
        let updated = offer.clone();
        state.publish(FeedEvent::OfferUpdated(updated.clone()));
        Ok(updated)
    }

    /// Make the call after `skip` successful calls of `op` fail once.
    pub fn fail_after(&self, op: Operation, skip: usize) {
        self.state
            .lock()
            .faults
            .entry(op)
            .or_default()
            .push(Fault { skip });
    }

    /// Make the next call of `op` fail once.
    pub fn fail_next(&self, op: Operation) {
        self.fail_after(op, 0);
    }

    pub fn set_latency(&self, op: Operation, latency: std::time::Duration) {
        self.state.lock().latency.insert(op, latency);
    }

    /// Queue feed events instead of delivering them.
    pub fn hold_feed(&self) {
        let mut state = self.state.lock();
        if state.held.is_none() {
            state.held = Some(Vec::new());
        }
    }

    /// Deliver queued feed events in order and resume live delivery.
    pub fn release_feed(&self) {
        let mut state = self.state.lock();
        for event in state.held.take().unwrap_or_default() {
            state.deliver(event);
        }
    }

    /// Publish a stored message's insert event again.
    pub fn redeliver_message(&self, message_id: &MessageId) -> bool {
        let mut state = self.state.lock();
        let target = Ident::Confirmed(message_id.clone());
        let Some(message) = state.messages.iter().find(|m| m.id == target).cloned() else {
            return false;
        };
        state.publish(FeedEvent::MessageInserted(message));
        true
    }

    /// Close every open subscriber stream, as a dropped connection would.
    pub fn disconnect_subscribers(&self) {
        self.state.lock().subscribers.clear();
    }

    pub fn subscriber_count(&self) -> usize {
        let mut state = self.state.lock();
        state.subscribers.retain(|(_, sender)| !sender.is_closed());
        state.subscribers.len()
    }

    pub fn offer(&self, offer_id: &OfferId) -> Option<Offer> {
        self.state.lock().offers.get(offer_id).cloned()
    }

    pub fn offers(&self) -> Vec<Offer> {
        self.state.lock().offers.values().cloned().collect()
    }

    pub fn messages(&self, conversation: &ConversationId) -> Vec<Message> {
        let state = self.state.lock();
        state
            .messages
            .iter()
            .filter(|m| &m.conversation_id == conversation)
            .map(|m| state.with_offer(m))
            .collect()
    }

    async fn enter(&self, op: Operation) -> Result<(), BackendError> {
        let latency = self.state.lock().latency.get(&op).copied();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.state.lock().take_fault(op) {
            debug!("Injected fault for {:?}", op);
            return Err(BackendError::Unavailable(format!("injected {:?} failure", op)));
        }
        Ok(())
    }
}

/// One user's view of a [`MemoryBackend`]
#[derive(Clone)]
pub struct MemoryClient {
    backend: MemoryBackend,
    user: Option<UserId>,
}

impl MemoryClient {
    pub fn backend(&self) -> &MemoryBackend {
        &self.backend
    }

    fn require_user(&self) -> Result<&UserId, BackendError> {
        self.user
            .as_ref()
            .ok_or_else(|| BackendError::Rejected("not authenticated".to_string()))
    }
}

#[async_trait]
impl Backend for MemoryClient {
    async fn create_message(&self, draft: NewMessage) -> Result<Message, BackendError> {
        self.backend.enter(Operation::CreateMessage).await?;
        let user = self.require_user()?;
        if &draft.sender_id != user {
            return Err(BackendError::Rejected("sender must be the caller".to_string()));
        }

        let mut state = self.backend.state.lock();
        let record = state
            .conversation(&draft.conversation_id)
            .ok_or_else(|| BackendError::NotFound(format!("conversation {}", draft.conversation_id)))?;
        if record.peer_of(user).is_none() {
            return Err(BackendError::Rejected("not a participant".to_string()));
        }
        match (draft.kind, &draft.offer_id) {
            (MessageKind::Offer, Some(offer_id)) if state.offers.contains_key(offer_id) => {}
            (MessageKind::Offer, _) => {
                return Err(BackendError::Rejected(
                    "offer message must reference an existing offer".to_string(),
                ))
            }
            _ => {}
        }

        let message = Message {
            id: Ident::Confirmed(MessageId::new(state.mint("m"))),
            conversation_id: draft.conversation_id,
            sender_id: draft.sender_id,
            kind: draft.kind,
            body: draft.body,
            offer_id: draft.offer_id.map(Ident::Confirmed),
            created_at: state.stamp(),
            offer: None,
        };
        state.messages.push(message.clone());
        debug!("Stored message {}", message.id);
        state.publish(FeedEvent::MessageInserted(message.clone()));
        Ok(message)
    }

    async fn create_offer(&self, draft: NewOffer) -> Result<Offer, BackendError> {
        self.backend.enter(Operation::CreateOffer).await?;
        let user = self.require_user()?;
        if &draft.maker_id != user {
            return Err(BackendError::Rejected("maker must be the caller".to_string()));
        }
        if draft.price_minor_units < 0 {
            return Err(BackendError::Rejected("price must not be negative".to_string()));
        }

        let mut state = self.backend.state.lock();
        let record = state
            .conversation(&draft.conversation_id)
            .ok_or_else(|| BackendError::NotFound(format!("conversation {}", draft.conversation_id)))?;
        if record.peer_of(user).is_none() {
            return Err(BackendError::Rejected("not a participant".to_string()));
        }

        let offer_id = OfferId::new(state.mint("o"));
        let offer = Offer {
            id: Ident::Confirmed(offer_id.clone()),
            conversation_id: draft.conversation_id,
            item_id: draft.item_id,
            maker_id: draft.maker_id,
            price_minor_units: draft.price_minor_units,
            currency: self.backend.currency.clone(),
            status: OfferStatus::Pending,
            expires_at: draft.expires_at,
            created_at: state.stamp(),
        };
        state.offers.insert(offer_id, offer.clone());
        debug!("Stored offer {}", offer.id);
        Ok(offer)
    }

    async fn respond_to_offer(
        &self,
        offer_id: &OfferId,
        response: OfferResponse,
    ) -> Result<(), BackendError> {
        self.backend.enter(Operation::RespondToOffer).await?;
        let user = self.require_user()?.clone();

        let mut state = self.backend.state.lock();
        let offer = state
            .offers
            .get(offer_id)
            .ok_or_else(|| BackendError::NotFound(format!("offer {}", offer_id)))?;
        let participant = state
            .conversation(&offer.conversation_id)
            .is_some_and(|c| c.peer_of(&user).is_some());
        if !participant || offer.maker_id == user {
            return Err(BackendError::Rejected(
                "only the other participant may respond".to_string(),
            ));
        }
        let next = OfferStatus::from(response);
        if !offer.status.can_transition_to(next) {
            return Err(BackendError::Rejected(format!(
                "offer {} is already {:?}",
                offer_id, offer.status
            )));
        }

        let mut updated = offer.clone();
        updated.status = next;
        state.offers.insert(offer_id.clone(), updated.clone());
        info!("Offer {} {:?} by {}", offer_id, next, user);
        state.publish(FeedEvent::OfferUpdated(updated));
        Ok(())
    }

    async fn mark_conversation_read(
        &self,
        conversation: &ConversationId,
    ) -> Result<(), BackendError> {
        self.backend.enter(Operation::MarkRead).await?;
        let user = self.require_user()?.clone();
        let mut state = self.backend.state.lock();
        if state.conversation(conversation).is_none() {
            return Err(BackendError::NotFound(format!("conversation {}", conversation)));
        }
        let mark = state.stamp();
        state.read_marks.insert((conversation.clone(), user), mark);
        Ok(())
    }

    async fn list_messages(
        &self,
        conversation: &ConversationId,
        before: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Message>, BackendError> {
        self.backend.enter(Operation::ListMessages).await?;
        let state = self.backend.state.lock();
        let mut rows: Vec<&Message> = state
            .messages
            .iter()
            .filter(|m| &m.conversation_id == conversation)
            .filter(|m| before.map_or(true, |before| m.created_at < before))
            .collect();
        rows.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        if before.is_some() {
            rows.reverse();
        }
        Ok(rows
            .into_iter()
            .take(limit)
            .map(|m| state.with_offer(m))
            .collect())
    }

    async fn get_offer(&self, offer_id: &OfferId) -> Result<Option<Offer>, BackendError> {
        self.backend.enter(Operation::GetOffer).await?;
        Ok(self.backend.state.lock().offers.get(offer_id).cloned())
    }

    async fn list_conversation_summaries(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ConversationSummary>, BackendError> {
        self.backend.enter(Operation::ListSummaries).await?;
        let user = self.require_user()?;
        let state = self.backend.state.lock();
        let mut records: Vec<&ConversationRecord> = state
            .conversations
            .iter()
            .filter(|c| c.peer_of(user).is_some())
            .collect();
        records.sort_by_key(|c| std::cmp::Reverse(state.last_activity(c)));
        Ok(records
            .into_iter()
            .skip(offset)
            .take(limit)
            .filter_map(|c| state.summary_for(c, user))
            .collect())
    }

    async fn get_conversation_summary(
        &self,
        conversation: &ConversationId,
    ) -> Result<Option<ConversationSummary>, BackendError> {
        self.backend.enter(Operation::GetSummary).await?;
        let user = self.require_user()?;
        let state = self.backend.state.lock();
        Ok(state
            .conversation(conversation)
            .and_then(|c| state.summary_for(c, user)))
    }

    async fn subscribe(&self, scope: FeedScope) -> Result<FeedReceiver, BackendError> {
        self.backend.enter(Operation::Subscribe).await?;
        let (sender, receiver) = mpsc::unbounded_channel();
        self.backend.state.lock().subscribers.push((scope, sender));
        Ok(receiver)
    }

    fn current_user_id(&self) -> Option<UserId> {
        self.user.clone()
    }
}
