//! Conversation session - optimistic writes against one conversation
//!
//! Each user-initiated write appends a provisional entry to the timeline
//! right away, issues the backend create, then reconciles or rolls back that
//! same entry. Writes are tracked individually in an [`InFlight`] registry,
//! so a pending text send never blocks an offer.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::backend::Backend;
use crate::error::SyncError;
use crate::events::{
    ConversationId, Ident, ItemId, LocalId, Message, MessageKind, NewMessage, NewOffer, Offer,
    OfferId, UserId,
};
use crate::feed::ChangeFeedListener;
use crate::offer::{round_price, OfferResponse, OfferStatus};
use crate::timeline::{SharedTimeline, TimelineStore};
use crate::{Result, SyncConfig};

/// Kind of user-initiated operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    SendText,
    SendInquiry,
    SendInquiryWithText,
    MakeOffer,
    RespondToOffer,
    MarkRead,
    LoadMore,
}

/// One in-flight operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OperationToken {
    pub kind: OperationKind,
    pub local_id: LocalId,
}

/// Registry of operations currently awaiting the backend
#[derive(Debug, Clone, Default)]
pub struct InFlight {
    tokens: Arc<Mutex<HashSet<OperationToken>>>,
}

impl InFlight {
    /// Register an operation; it stays registered until the guard drops.
    pub fn begin(&self, kind: OperationKind, local_id: LocalId) -> InFlightGuard {
        let token = OperationToken { kind, local_id };
        self.tokens.lock().insert(token);
        InFlightGuard {
            tokens: Arc::clone(&self.tokens),
            token,
        }
    }

    pub fn snapshot(&self) -> Vec<OperationToken> {
        self.tokens.lock().iter().copied().collect()
    }

    pub fn is_in_flight(&self, kind: OperationKind) -> bool {
        self.tokens.lock().iter().any(|t| t.kind == kind)
    }

    pub fn len(&self) -> usize {
        self.tokens.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.lock().is_empty()
    }
}

/// Deregisters its operation on drop, including when the future is cancelled
#[derive(Debug)]
pub struct InFlightGuard {
    tokens: Arc<Mutex<HashSet<OperationToken>>>,
    token: OperationToken,
}

impl InFlightGuard {
    pub fn token(&self) -> OperationToken {
        self.token
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.tokens.lock().remove(&self.token);
    }
}

/// Optimistic writer for one conversation about one item
pub struct ConversationSession {
    backend: Arc<dyn Backend>,
    conversation_id: ConversationId,
    item_id: ItemId,
    timeline: SharedTimeline,
    in_flight: InFlight,
    config: SyncConfig,
}

impl ConversationSession {
    pub fn new(
        backend: Arc<dyn Backend>,
        conversation_id: ConversationId,
        item_id: ItemId,
        config: SyncConfig,
    ) -> Self {
        let timeline = TimelineStore::shared(conversation_id.clone());
        Self {
            backend,
            conversation_id,
            item_id,
            timeline,
            in_flight: InFlight::default(),
            config,
        }
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    pub fn timeline(&self) -> SharedTimeline {
        Arc::clone(&self.timeline)
    }

    /// Copy of the current timeline
    pub fn messages(&self) -> Vec<Message> {
        self.timeline.lock().messages().to_vec()
    }

    pub fn in_flight(&self) -> Vec<OperationToken> {
        self.in_flight.snapshot()
    }

    pub fn is_in_flight(&self, kind: OperationKind) -> bool {
        self.in_flight.is_in_flight(kind)
    }

    /// Start a change-feed listener that merges into this session's timeline.
    pub fn listen(&self) -> Result<ChangeFeedListener> {
        let mut listener = ChangeFeedListener::new(Arc::clone(&self.timeline));
        listener.subscribe(Arc::clone(&self.backend), &self.config)?;
        Ok(listener)
    }

    fn current_user(&self) -> Result<UserId> {
        self.backend
            .current_user_id()
            .ok_or(SyncError::NotAuthenticated)
    }

    fn draft(&self, sender: &UserId, kind: MessageKind, body: Option<String>) -> Message {
        Message {
            id: Ident::Pending(LocalId::new()),
            conversation_id: self.conversation_id.clone(),
            sender_id: sender.clone(),
            kind,
            body,
            offer_id: None,
            created_at: Utc::now(),
            offer: None,
        }
    }

    fn request(&self, sender: &UserId, kind: MessageKind, body: Option<String>) -> NewMessage {
        NewMessage {
            conversation_id: self.conversation_id.clone(),
            sender_id: sender.clone(),
            kind,
            body,
            offer_id: None,
        }
    }

    fn rollback_all(&self, local_ids: &[LocalId]) {
        let mut timeline = self.timeline.lock();
        for local_id in local_ids {
            timeline.rollback(*local_id);
        }
    }

    /// Load the first page ascending and replace the timeline.
    pub async fn fetch_initial(&self) -> Result<usize> {
        let messages = self
            .backend
            .list_messages(&self.conversation_id, None, self.config.page_size)
            .await?;
        let count = messages.len();
        self.timeline.lock().replace_all(messages);
        info!(
            "Loaded {} messages for conversation {}",
            count, self.conversation_id
        );
        Ok(count)
    }

    /// Send a text message with an optimistic entry.
    ///
    /// On failure the entry is removed and the error returned.
    pub async fn send_text(&self, body: impl Into<String>) -> Result<Message> {
        let sender = self.current_user()?;
        let body = body.into();

        let local_id = self
            .timeline
            .lock()
            .append_optimistic(self.draft(&sender, MessageKind::Text, Some(body.clone())));
        let _guard = self.in_flight.begin(OperationKind::SendText, local_id);

        let request = self.request(&sender, MessageKind::Text, Some(body));
        match self.backend.create_message(request).await {
            Ok(confirmed) => {
                self.timeline.lock().reconcile(local_id, confirmed.clone());
                Ok(confirmed)
            }
            Err(e) => {
                self.timeline.lock().rollback(local_id);
                error!("Failed to send message, rolled back {}: {}", local_id, e);
                Err(e.into())
            }
        }
    }

    /// Post a structured inquiry without an optimistic entry.
    ///
    /// The message shows up only once the change feed delivers it.
    pub async fn send_inquiry(&self) -> Result<Message> {
        let sender = self.current_user()?;
        let _guard = self
            .in_flight
            .begin(OperationKind::SendInquiry, LocalId::new());

        let request = self.request(&sender, MessageKind::ItemInquiry, None);
        self.backend.create_message(request).await.map_err(|e| {
            error!("Failed to send inquiry: {}", e);
            SyncError::from(e)
        })
    }

    /// Post the item-card marker followed by a generated inquiry text.
    ///
    /// Both entries appear immediately; if either create fails, both are
    /// removed from the timeline even if the marker was already stored.
    pub async fn send_inquiry_with_text(&self, item_title: &str) -> Result<(Message, Message)> {
        let sender = self.current_user()?;
        let marker = self.config.inquiry_marker.clone();
        let text = self.config.inquiry_text(item_title);

        let (card_id, text_id) = {
            let card = self.draft(&sender, MessageKind::Text, Some(marker.clone()));
            let mut follow_up = self.draft(&sender, MessageKind::Text, Some(text.clone()));
            follow_up.created_at = card.created_at + Duration::milliseconds(1);

            let mut timeline = self.timeline.lock();
            (
                timeline.append_optimistic(card),
                timeline.append_optimistic(follow_up),
            )
        };
        let _guard = self
            .in_flight
            .begin(OperationKind::SendInquiryWithText, card_id);

        let card = match self
            .backend
            .create_message(self.request(&sender, MessageKind::Text, Some(marker)))
            .await
        {
            Ok(card) => card,
            Err(e) => {
                self.rollback_all(&[card_id, text_id]);
                error!("Failed to send inquiry card, rolled back both entries: {}", e);
                return Err(e.into());
            }
        };

        let follow_up = match self
            .backend
            .create_message(self.request(&sender, MessageKind::Text, Some(text)))
            .await
        {
            Ok(follow_up) => follow_up,
            Err(e) => {
                self.rollback_all(&[card_id, text_id]);
                error!("Failed to send inquiry text, rolled back both entries: {}", e);
                warn!("Inquiry card {} remains stored without its text", card.id);
                return Err(e.into());
            }
        };

        let mut timeline = self.timeline.lock();
        timeline.reconcile(card_id, card.clone());
        timeline.reconcile(text_id, follow_up.clone());
        Ok((card, follow_up))
    }

    /// Make a price offer for this conversation's item.
    ///
    /// Creates the offer, then the message linking to it. A failure at either
    /// step removes the optimistic message; an offer stored before a failed
    /// link stays in place unlinked.
    pub async fn make_offer(
        &self,
        price: f64,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<Message> {
        let maker = self.current_user()?;
        let price_minor_units = round_price(price)?;
        let now = Utc::now();

        let snapshot = Offer {
            id: Ident::Pending(LocalId::new()),
            conversation_id: self.conversation_id.clone(),
            item_id: self.item_id.clone(),
            maker_id: maker.clone(),
            price_minor_units,
            currency: self.config.currency.clone(),
            status: OfferStatus::Pending,
            expires_at,
            created_at: now,
        };
        let mut draft = self.draft(&maker, MessageKind::Offer, None);
        draft.created_at = now;
        draft.offer_id = Some(snapshot.id.clone());
        draft.offer = Some(snapshot);

        let local_id = self.timeline.lock().append_optimistic(draft);
        let _guard = self.in_flight.begin(OperationKind::MakeOffer, local_id);

        let offer_request = NewOffer {
            conversation_id: self.conversation_id.clone(),
            item_id: self.item_id.clone(),
            maker_id: maker.clone(),
            price_minor_units,
            expires_at,
        };
        let offer = match self.backend.create_offer(offer_request).await {
            Ok(offer) => offer,
            Err(e) => {
                self.timeline.lock().rollback(local_id);
                error!("Failed to create offer, rolled back {}: {}", local_id, e);
                return Err(e.into());
            }
        };

        let mut link = self.request(&maker, MessageKind::Offer, None);
        link.offer_id = offer.id.confirmed().cloned();
        match self.backend.create_message(link).await {
            Ok(mut confirmed) => {
                confirmed.offer = Some(offer);
                self.timeline.lock().reconcile(local_id, confirmed.clone());
                Ok(confirmed)
            }
            Err(e) => {
                self.timeline.lock().rollback(local_id);
                error!(
                    "Failed to link offer {}, rolled back {} (offer left unlinked): {}",
                    offer.id, local_id, e
                );
                Err(e.into())
            }
        }
    }

    /// Request an offer response. The timeline is updated only when the
    /// change feed reports the new status.
    pub async fn respond_to_offer(&self, offer_id: &OfferId, response: OfferResponse) -> Result<()> {
        let _guard = self
            .in_flight
            .begin(OperationKind::RespondToOffer, LocalId::new());
        self.backend
            .respond_to_offer(offer_id, response)
            .await
            .map_err(|e| {
                error!("Failed to respond to offer {}: {}", offer_id, e);
                e
            })?;
        debug!("Requested {:?} for offer {}", response, offer_id);
        Ok(())
    }

    /// Mark the conversation read on the backend.
    pub async fn mark_read(&self) -> Result<()> {
        let _guard = self.in_flight.begin(OperationKind::MarkRead, LocalId::new());
        self.backend
            .mark_conversation_read(&self.conversation_id)
            .await
            .map_err(|e| {
                error!(
                    "Failed to mark conversation {} read: {}",
                    self.conversation_id, e
                );
                e
            })?;
        Ok(())
    }

    /// Prepend the page of messages strictly older than `before`.
    ///
    /// Returns the number of entries added.
    pub async fn load_more(&self, before: DateTime<Utc>) -> Result<usize> {
        let _guard = self.in_flight.begin(OperationKind::LoadMore, LocalId::new());
        let mut page = self
            .backend
            .list_messages(&self.conversation_id, Some(before), self.config.page_size)
            .await?;
        page.reverse();
        let added = self.timeline.lock().prepend_history(page);
        debug!(
            "Prepended {} older messages to conversation {}",
            added, self.conversation_id
        );
        Ok(added)
    }

    /// `load_more` from the oldest loaded entry. Returns 0 on an empty timeline.
    pub async fn load_older(&self) -> Result<usize> {
        let oldest = self.timeline.lock().oldest_timestamp();
        match oldest {
            Some(before) => self.load_more(before).await,
            None => Ok(0),
        }
    }
}
