//! Backend contract consumed by the sync engine

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::error::BackendError;
use crate::events::{
    ConversationId, ConversationSummary, FeedEvent, FeedScope, Message, NewMessage, NewOffer,
    Offer, OfferId, UserId,
};
use crate::offer::OfferResponse;

/// Stream of change-feed events for one subscription.
///
/// Dropping the receiver unsubscribes.
pub type FeedReceiver = mpsc::UnboundedReceiver<FeedEvent>;

/// Request/response and push operations of the backend collaborator.
///
/// Returned messages and offers always carry confirmed identities.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    async fn create_message(&self, draft: NewMessage) -> Result<Message, BackendError>;

    async fn create_offer(&self, draft: NewOffer) -> Result<Offer, BackendError>;

    /// Ask the authority to move a pending offer to a terminal status.
    async fn respond_to_offer(
        &self,
        offer_id: &OfferId,
        response: OfferResponse,
    ) -> Result<(), BackendError>;

    async fn mark_conversation_read(&self, conversation: &ConversationId)
        -> Result<(), BackendError>;

    /// Descending and strictly older than `before` when given, otherwise
    /// ascending from the start of the conversation.
    async fn list_messages(
        &self,
        conversation: &ConversationId,
        before: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Message>, BackendError>;

    async fn get_offer(&self, offer_id: &OfferId) -> Result<Option<Offer>, BackendError>;

    /// Summaries of the current user's conversations, most recent first.
    async fn list_conversation_summaries(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ConversationSummary>, BackendError>;

    async fn get_conversation_summary(
        &self,
        conversation: &ConversationId,
    ) -> Result<Option<ConversationSummary>, BackendError>;

    async fn subscribe(&self, scope: FeedScope) -> Result<FeedReceiver, BackendError>;

    fn current_user_id(&self) -> Option<UserId>;
}
