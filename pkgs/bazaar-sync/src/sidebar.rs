//! Sidebar aggregator - one summary row per conversation
//!
//! Rows are kept most-recent-first. A new message moves its row to the head
//! and bumps the unread count when it came from the peer and the
//! conversation is not the one open in the UI. Rows created from a
//! conversation-insert event start unresolved and are replaced by a fetched
//! summary as soon as the backend returns one.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::events::{
    ConversationId, ConversationRecord, ConversationSummary, FeedEvent, FeedScope, Message,
    MessageId, MessagePreview, PeerDisplay, UserId,
};
use crate::feed::{FeedGate, FeedHandler, Subscription};
use crate::{Result, SyncConfig};

/// Message ids remembered per row for redelivery detection
const SEEN_IDS_PER_ROW: usize = 64;

/// Summary rows plus the context unread accounting depends on
#[derive(Debug, Clone, Default)]
pub struct SidebarState {
    current_user: Option<UserId>,
    open_conversation: Option<ConversationId>,
    entries: Vec<ConversationSummary>,
    seen: HashMap<ConversationId, VecDeque<MessageId>>,
}

impl SidebarState {
    pub fn new(current_user: Option<UserId>) -> Self {
        Self {
            current_user,
            open_conversation: None,
            entries: Vec::new(),
            seen: HashMap::new(),
        }
    }

    pub fn entries(&self) -> &[ConversationSummary] {
        &self.entries
    }

    pub fn get(&self, conversation: &ConversationId) -> Option<&ConversationSummary> {
        self.entries
            .iter()
            .find(|e| &e.conversation_id == conversation)
    }

    pub fn current_user(&self) -> Option<&UserId> {
        self.current_user.as_ref()
    }

    pub fn set_current_user(&mut self, user: Option<UserId>) {
        self.current_user = user;
    }

    pub fn open_conversation(&self) -> Option<&ConversationId> {
        self.open_conversation.as_ref()
    }

    pub fn set_open_conversation(&mut self, conversation: Option<ConversationId>) {
        self.open_conversation = conversation;
    }

    fn position(&self, conversation: &ConversationId) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| &e.conversation_id == conversation)
    }

    /// Replace rows with an authoritative first page.
    pub fn replace(&mut self, entries: Vec<ConversationSummary>) {
        self.entries = entries;
        self.seen.clear();
    }

    /// Append a later page, skipping rows already listed.
    pub fn extend(&mut self, entries: Vec<ConversationSummary>) -> usize {
        let mut added = 0;
        for entry in entries {
            if self.position(&entry.conversation_id).is_none() {
                self.entries.push(entry);
                added += 1;
            }
        }
        added
    }

    /// Insert an unresolved placeholder for a conversation the current user
    /// takes part in. Returns false if not a participant or already listed.
    pub fn apply_conversation_insert(&mut self, record: &ConversationRecord) -> bool {
        let Some(user) = self.current_user.as_ref() else {
            return false;
        };
        let Some(peer) = record.peer_of(user) else {
            return false;
        };
        if self.position(&record.id).is_some() {
            return false;
        }
        self.entries.insert(
            0,
            ConversationSummary {
                conversation_id: record.id.clone(),
                item_id: record.item_id.clone(),
                peer_id: peer.clone(),
                peer: PeerDisplay::Unresolved,
                last_message: None,
                unread_count: 0,
            },
        );
        true
    }

    /// Fold a new message into its row.
    ///
    /// Unread counts every message not seen before. The preview, and the
    /// row's place at the head, change only for a message newer than the
    /// current preview. Returns false if no row matches or the message was
    /// already counted.
    pub fn apply_message_insert(&mut self, message: &Message) -> bool {
        let Some(pos) = self.position(&message.conversation_id) else {
            debug!(
                "No sidebar row for conversation {}, ignoring message {}",
                message.conversation_id, message.id
            );
            return false;
        };

        let preview = self.entries[pos].last_message.as_ref();
        if let Some(id) = message.id.confirmed() {
            let previewed = preview.and_then(|p| p.message_id.as_ref()) == Some(id);
            let seen = self
                .seen
                .get(&message.conversation_id)
                .is_some_and(|ids| ids.contains(id));
            if previewed || seen {
                debug!("Sidebar already counted message {}", message.id);
                return false;
            }
            let ids = self.seen.entry(message.conversation_id.clone()).or_default();
            if ids.len() == SEEN_IDS_PER_ROW {
                ids.pop_front();
            }
            ids.push_back(id.clone());
        }
        let newer = preview.map_or(true, |p| p.created_at <= message.created_at);

        let from_me = self.current_user.as_ref() == Some(&message.sender_id);
        let is_open = self.open_conversation.as_ref() == Some(&message.conversation_id);
        if !from_me && !is_open {
            self.entries[pos].unread_count += 1;
        }

        if newer {
            let mut entry = self.entries.remove(pos);
            entry.last_message = Some(MessagePreview::from(message));
            self.entries.insert(0, entry);
        }
        true
    }

    pub fn clear_unread(&mut self, conversation: &ConversationId) -> bool {
        match self.position(conversation) {
            Some(pos) => {
                self.entries[pos].unread_count = 0;
                true
            }
            None => false,
        }
    }

    /// Swap a row for a fetched summary, keeping its position.
    pub fn apply_resolved(&mut self, summary: ConversationSummary) -> bool {
        match self.position(&summary.conversation_id) {
            Some(pos) => {
                self.entries[pos] = summary;
                true
            }
            None => false,
        }
    }

    pub fn unresolved(&self) -> Vec<ConversationId> {
        self.entries
            .iter()
            .filter(|e| !e.peer.is_resolved())
            .map(|e| e.conversation_id.clone())
            .collect()
    }
}

/// Maintains the conversation list for the current user
pub struct SidebarAggregator {
    backend: Arc<dyn Backend>,
    state: Arc<Mutex<SidebarState>>,
    subscription: Option<Subscription>,
    config: SyncConfig,
}

impl SidebarAggregator {
    pub fn new(backend: Arc<dyn Backend>, config: SyncConfig) -> Self {
        let state = SidebarState::new(backend.current_user_id());
        Self {
            backend,
            state: Arc::new(Mutex::new(state)),
            subscription: None,
            config,
        }
    }

    /// Copy of the current rows
    pub fn entries(&self) -> Vec<ConversationSummary> {
        self.state.lock().entries().to_vec()
    }

    pub fn get(&self, conversation: &ConversationId) -> Option<ConversationSummary> {
        self.state.lock().get(conversation).cloned()
    }

    pub fn set_open_conversation(&self, conversation: Option<ConversationId>) {
        self.state.lock().set_open_conversation(conversation);
    }

    /// Load the first page and replace all rows.
    pub async fn load(&self) -> Result<usize> {
        self.load_page(self.config.sidebar_page_size, 0).await
    }

    /// Load a page of rows. Offset 0 replaces the list; later pages append.
    pub async fn load_page(&self, limit: usize, offset: usize) -> Result<usize> {
        let current_user = self.backend.current_user_id();
        let page = self
            .backend
            .list_conversation_summaries(limit, offset)
            .await?;
        let count = page.len();

        let mut state = self.state.lock();
        state.set_current_user(current_user);
        if offset == 0 {
            state.replace(page);
        } else {
            state.extend(page);
        }
        info!("Loaded {} conversation summaries (offset {})", count, offset);
        Ok(count)
    }

    /// Mark a conversation read on the backend, then zero its unread count.
    pub async fn mark_read(&self, conversation: &ConversationId) -> Result<()> {
        self.backend.mark_conversation_read(conversation).await?;
        self.state.lock().clear_unread(conversation);
        Ok(())
    }

    /// Fetch real summaries for every placeholder row.
    ///
    /// Returns the number resolved; failed rows stay unresolved.
    pub async fn resolve_unresolved(&self) -> usize {
        let pending = self.state.lock().unresolved();
        let mut resolved = 0;
        for conversation in pending {
            if let Some(summary) = fetch_resolved(self.backend.as_ref(), &conversation).await {
                if self.state.lock().apply_resolved(summary) {
                    resolved += 1;
                }
            }
        }
        resolved
    }

    pub fn subscribe(&mut self) -> Result<()> {
        if self.is_subscribed() {
            return Ok(());
        }
        let handler = SidebarFeedHandler {
            backend: Arc::clone(&self.backend),
            state: Arc::clone(&self.state),
        };
        self.subscription = Some(Subscription::spawn(
            Arc::clone(&self.backend),
            FeedScope::Global,
            Arc::new(handler),
            &self.config,
        )?);
        Ok(())
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscription.as_ref().is_some_and(|s| s.is_active())
    }

    /// Stop delivery. Idempotent.
    pub fn unsubscribe(&mut self) {
        let _state = self.state.lock();
        if let Some(mut subscription) = self.subscription.take() {
            subscription.cancel();
            info!("Sidebar feed unsubscribed");
        }
    }
}

impl Drop for SidebarAggregator {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// Fetch an authoritative summary to replace a placeholder row.
async fn fetch_resolved(
    backend: &dyn Backend,
    conversation: &ConversationId,
) -> Option<ConversationSummary> {
    match backend.get_conversation_summary(conversation).await {
        Ok(Some(summary)) if summary.peer.is_resolved() => Some(summary),
        Ok(_) => {
            warn!("No summary available yet for conversation {}", conversation);
            None
        }
        Err(e) => {
            warn!("Failed to resolve conversation {}: {}", conversation, e);
            None
        }
    }
}

struct SidebarFeedHandler {
    backend: Arc<dyn Backend>,
    state: Arc<Mutex<SidebarState>>,
}

#[async_trait]
impl FeedHandler for SidebarFeedHandler {
    async fn handle(&self, event: FeedEvent, gate: &FeedGate) {
        match event {
            FeedEvent::ConversationInserted(record) => {
                let inserted = {
                    let mut state = self.state.lock();
                    gate.is_open() && state.apply_conversation_insert(&record)
                };
                if !inserted {
                    return;
                }
                debug!("Placeholder row for conversation {}", record.id);
                if let Some(summary) = fetch_resolved(self.backend.as_ref(), &record.id).await {
                    let mut state = self.state.lock();
                    if gate.is_open() {
                        state.apply_resolved(summary);
                    }
                }
            }
            FeedEvent::MessageInserted(message) => {
                let mut state = self.state.lock();
                if gate.is_open() {
                    state.apply_message_insert(&message);
                }
            }
            FeedEvent::OfferUpdated(_) => {}
        }
    }
}
