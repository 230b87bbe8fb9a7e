//! Timeline store - ordered, deduplicated messages of one conversation
//!
//! Entries are kept non-decreasing by `(created_at, id)`. Optimistic entries
//! carry a pending identity and are swapped for their confirmed twin in
//! place. A confirmed entry moves only when its server timestamp no longer
//! sorts between its neighbours.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::events::{ConversationId, Ident, LocalId, Message, MessageId, Offer};

/// Timeline handle shared by the session and its feed listener
pub type SharedTimeline = Arc<Mutex<TimelineStore>>;

/// In-memory message sequence for one conversation
#[derive(Debug, Clone)]
pub struct TimelineStore {
    conversation_id: ConversationId,
    entries: Vec<Message>,
}

impl TimelineStore {
    pub fn new(conversation_id: ConversationId) -> Self {
        Self {
            conversation_id,
            entries: Vec::new(),
        }
    }

    pub fn shared(conversation_id: ConversationId) -> SharedTimeline {
        Arc::new(Mutex::new(Self::new(conversation_id)))
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    pub fn messages(&self) -> &[Message] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &Ident<MessageId>) -> bool {
        self.position(id).is_some()
    }

    pub fn position(&self, id: &Ident<MessageId>) -> Option<usize> {
        self.entries.iter().position(|m| &m.id == id)
    }

    pub fn get(&self, id: &Ident<MessageId>) -> Option<&Message> {
        self.entries.iter().find(|m| &m.id == id)
    }

    /// Creation time of the oldest loaded entry, the cursor for `load_more`.
    pub fn oldest_timestamp(&self) -> Option<DateTime<Utc>> {
        self.entries.first().map(|m| m.created_at)
    }

    /// True when entries are non-decreasing by `(created_at, id)`.
    pub fn is_ordered(&self) -> bool {
        self.entries
            .windows(2)
            .all(|pair| pair[0].sort_key() <= pair[1].sort_key())
    }

    /// Insert a provisional entry and return its handle.
    ///
    /// Any id already on `message` is replaced with a fresh pending one.
    pub fn append_optimistic(&mut self, mut message: Message) -> LocalId {
        let local_id = LocalId::new();
        message.id = Ident::Pending(local_id);
        debug!("Appending optimistic entry {}", local_id);
        self.insert_sorted(message);
        local_id
    }

    /// Swap the provisional entry for its confirmed counterpart.
    ///
    /// Returns false if the provisional entry is gone (rolled back, or the
    /// store was reset while the request was in flight). If the feed already
    /// delivered the confirmed twin, the provisional entry is dropped and the
    /// twin keeps its place, so exactly one entry survives.
    pub fn reconcile(&mut self, local_id: LocalId, confirmed: Message) -> bool {
        let Some(pos) = self.position(&Ident::Pending(local_id)) else {
            debug!("Reconcile of {} skipped: entry no longer present", local_id);
            return false;
        };

        if let Some(twin) = self.position(&confirmed.id) {
            debug!(
                "Confirmed message {} already delivered by feed, dropping {}",
                confirmed.id, local_id
            );
            let existing_offer = self.entries[twin].offer.take();
            let mut merged = confirmed;
            if merged.offer.is_none() {
                merged.offer = existing_offer;
            }
            self.entries[twin] = merged;
            self.entries.remove(pos);
            return true;
        }

        let key = confirmed.sort_key();
        let fits_after = pos == 0 || self.entries[pos - 1].sort_key() <= key;
        let fits_before = self
            .entries
            .get(pos + 1)
            .map_or(true, |next| key <= next.sort_key());

        debug!("Reconciled {} -> {}", local_id, confirmed.id);
        if fits_after && fits_before {
            self.entries[pos] = confirmed;
        } else {
            // Server stamped it out of local order; keep the list sorted
            self.entries.remove(pos);
            self.insert_sorted(confirmed);
        }
        true
    }

    /// Remove a provisional entry. Returns the removed entry, if any.
    pub fn rollback(&mut self, local_id: LocalId) -> Option<Message> {
        let pos = self.position(&Ident::Pending(local_id))?;
        debug!("Rolled back optimistic entry {}", local_id);
        Some(self.entries.remove(pos))
    }

    /// Merge a message delivered by the feed. Returns false on a duplicate.
    pub fn insert_remote(&mut self, message: Message) -> bool {
        if message.conversation_id != self.conversation_id {
            warn!(
                "Ignoring message {} for conversation {}",
                message.id, message.conversation_id
            );
            return false;
        }
        if self.contains(&message.id) {
            debug!("Discarding duplicate message {}", message.id);
            return false;
        }
        self.insert_sorted(message);
        true
    }

    /// Prepend an ascending page of older history.
    ///
    /// Entries already present are skipped untouched. Returns how many
    /// entries were added.
    pub fn prepend_history(&mut self, page: Vec<Message>) -> usize {
        let fresh: Vec<Message> = page
            .into_iter()
            .filter(|m| m.conversation_id == self.conversation_id && !self.contains(&m.id))
            .collect();
        let added = fresh.len();
        if added == 0 {
            return 0;
        }

        let page_sorted = fresh
            .windows(2)
            .all(|pair| pair[0].sort_key() <= pair[1].sort_key());
        let fits_in_front = match (fresh.last(), self.entries.first()) {
            (Some(last), Some(first)) => last.sort_key() <= first.sort_key(),
            _ => true,
        };

        if page_sorted && fits_in_front {
            self.entries.splice(0..0, fresh);
        } else {
            warn!("History page overlaps loaded entries, merging by timestamp");
            for message in fresh {
                self.insert_sorted(message);
            }
        }
        added
    }

    /// Replace the whole timeline, e.g. after an initial fetch.
    ///
    /// Provisional entries are dropped; their pending reconciles become no-ops.
    pub fn replace_all(&mut self, mut messages: Vec<Message>) {
        messages.retain(|m| m.conversation_id == self.conversation_id);
        messages.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        messages.dedup_by(|a, b| a.id == b.id);
        self.entries = messages;
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Re-embed an observed offer into every message that references it.
    ///
    /// Returns the number of snapshots changed. Snapshots already in a
    /// different terminal status are left alone.
    pub fn apply_offer_update(&mut self, offer: &Offer) -> usize {
        let mut changed = 0;
        for message in self.entries.iter_mut().filter(|m| m.references_offer(&offer.id)) {
            match message.offer.as_mut() {
                Some(snapshot) => match snapshot.apply_update(offer.clone()) {
                    Ok(true) => changed += 1,
                    Ok(false) => {}
                    Err(e) => warn!("Ignoring offer update for message {}: {}", message.id, e),
                },
                None => {
                    message.offer = Some(offer.clone());
                    changed += 1;
                }
            }
        }
        changed
    }

    fn insert_sorted(&mut self, message: Message) {
        let in_order = self
            .entries
            .last()
            .map_or(true, |last| last.sort_key() <= message.sort_key());
        if in_order {
            self.entries.push(message);
        } else {
            let key = message.sort_key();
            let pos = self.entries.partition_point(|m| m.sort_key() <= key);
            self.entries.insert(pos, message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ItemId, MessageKind, OfferId, UserId};
    use crate::offer::OfferStatus;
    use chrono::Duration;

    fn conversation() -> ConversationId {
        ConversationId::from("c1")
    }

    fn text(id: Option<&str>, at: DateTime<Utc>, body: &str) -> Message {
        Message {
            id: match id {
                Some(id) => Ident::Confirmed(MessageId::from(id)),
                None => Ident::Pending(LocalId::new()),
            },
            conversation_id: conversation(),
            sender_id: UserId::from("u1"),
            kind: MessageKind::Text,
            body: Some(body.to_string()),
            offer_id: None,
            created_at: at,
            offer: None,
        }
    }

    fn offer(id: &str, status: OfferStatus) -> Offer {
        Offer {
            id: Ident::Confirmed(OfferId::from(id)),
            conversation_id: conversation(),
            item_id: ItemId::from("i1"),
            maker_id: UserId::from("u1"),
            price_minor_units: 100,
            currency: "KRW".to_string(),
            status,
            expires_at: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_reconcile_replaces_in_place() {
        let now = Utc::now();
        let mut store = TimelineStore::new(conversation());
        store.insert_remote(text(Some("m0"), now - Duration::seconds(5), "earlier"));
        let local = store.append_optimistic(text(None, now, "hello"));
        store.insert_remote(text(Some("m2"), now + Duration::seconds(1), "later"));

        let confirmed = text(Some("m1"), now + Duration::milliseconds(3), "hello");
        assert!(store.reconcile(local, confirmed));

        let ids: Vec<String> = store.messages().iter().map(|m| m.id.to_string()).collect();
        assert_eq!(ids, vec!["m0", "m1", "m2"]);
    }

    #[test]
    fn test_reconcile_out_of_local_order_keeps_sorted() {
        let now = Utc::now();
        let mut store = TimelineStore::new(conversation());
        let offer_local = store.append_optimistic(text(None, now, "offer"));
        let text_local = store.append_optimistic(text(None, now + Duration::milliseconds(5), "hi"));

        // The later write is confirmed first and stamped earlier
        assert!(store.reconcile(text_local, text(Some("m2"), now + Duration::milliseconds(10), "hi")));
        assert!(store.reconcile(offer_local, text(Some("m4"), now + Duration::milliseconds(90), "offer")));

        assert!(store.is_ordered());
        let ids: Vec<String> = store.messages().iter().map(|m| m.id.to_string()).collect();
        assert_eq!(ids, vec!["m2", "m4"]);

        store.insert_remote(text(Some("m3"), now + Duration::milliseconds(50), "between"));
        let ids: Vec<String> = store.messages().iter().map(|m| m.id.to_string()).collect();
        assert_eq!(ids, vec!["m2", "m3", "m4"]);
    }

    #[test]
    fn test_reconcile_after_reset_is_noop() {
        let mut store = TimelineStore::new(conversation());
        let local = store.append_optimistic(text(None, Utc::now(), "hello"));
        store.clear();
        assert!(!store.reconcile(local, text(Some("m1"), Utc::now(), "hello")));
        assert!(store.is_empty());
        assert!(store.rollback(local).is_none());
    }

    #[test]
    fn test_reconcile_when_feed_won_keeps_one_entry() {
        let now = Utc::now();
        let mut store = TimelineStore::new(conversation());
        let local = store.append_optimistic(text(None, now, "hello"));
        assert!(store.insert_remote(text(Some("m1"), now, "hello")));
        assert_eq!(store.len(), 2);

        assert!(store.reconcile(local, text(Some("m1"), now, "hello")));
        assert_eq!(store.len(), 1);
        assert_eq!(store.messages()[0].id, Ident::Confirmed(MessageId::from("m1")));
    }

    #[test]
    fn test_out_of_order_remote_insert_is_sorted() {
        let now = Utc::now();
        let mut store = TimelineStore::new(conversation());
        store.insert_remote(text(Some("m2"), now, "second"));
        store.insert_remote(text(Some("m1"), now - Duration::seconds(1), "first"));
        store.insert_remote(text(Some("m0"), now, "tie"));
        assert!(store.is_ordered());
        assert_eq!(store.messages()[0].id, Ident::Confirmed(MessageId::from("m1")));
        assert_eq!(store.messages()[1].id, Ident::Confirmed(MessageId::from("m0")));
    }

    #[test]
    fn test_prepend_history_skips_present_entries() {
        let now = Utc::now();
        let mut store = TimelineStore::new(conversation());
        store.insert_remote(text(Some("m3"), now, "three"));

        let page = vec![
            text(Some("m1"), now - Duration::seconds(2), "one"),
            text(Some("m2"), now - Duration::seconds(1), "two"),
            text(Some("m3"), now, "three (stale copy)"),
        ];
        assert_eq!(store.prepend_history(page), 2);
        assert_eq!(store.len(), 3);
        assert!(store.is_ordered());
        assert_eq!(store.messages()[2].body.as_deref(), Some("three"));
    }

    #[test]
    fn test_offer_update_reaches_every_reference() {
        let now = Utc::now();
        let mut store = TimelineStore::new(conversation());
        for (id, embed) in [("m1", true), ("m2", false), ("m3", true)] {
            let mut message = text(Some(id), now, "");
            message.kind = MessageKind::Offer;
            message.offer_id = Some(Ident::Confirmed(OfferId::from("o1")));
            if embed {
                message.offer = Some(offer("o1", OfferStatus::Pending));
            }
            store.insert_remote(message);
        }
        store.insert_remote(text(Some("m4"), now, "unrelated"));

        assert_eq!(store.apply_offer_update(&offer("o1", OfferStatus::Accepted)), 3);
        let statuses: Vec<Option<OfferStatus>> = store
            .messages()
            .iter()
            .map(|m| m.offer.as_ref().map(|o| o.status))
            .collect();
        assert_eq!(statuses.iter().filter(|s| **s == Some(OfferStatus::Accepted)).count(), 3);

        assert_eq!(store.apply_offer_update(&offer("o1", OfferStatus::Expired)), 0);
    }
}
