//! Bazaar Sync - conversation synchronization for item negotiation chats
//!
//! This crate keeps a client-held message timeline and a per-conversation
//! summary list consistent with a backend that confirms writes
//! asynchronously and pushes row-level change notifications.
//!
//! # Architecture
//!
//! - **offer**: Offer status lifecycle; transitions are requested, never applied locally
//! - **TimelineStore**: Ordered, deduplicated messages of one conversation
//! - **ConversationSession**: Optimistic writes with reconcile/rollback per provisional id
//! - **ChangeFeedListener**: Merges pushed inserts and offer updates into the timeline
//! - **SidebarAggregator**: One summary row per conversation with unread accounting
//! - **MemoryBackend**: In-process backend with a change feed and fault injection
//!
//! # Concurrency
//!
//! Every store mutation is a short synchronous critical section; locks are
//! never held across a backend round trip. Several sends may be in flight at
//! once, each tracked by its own provisional id.
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use bazaar_sync::{
//!     ConversationSession, ItemId, MemoryBackend, SyncConfig, UserId,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let server = MemoryBackend::new(SyncConfig::default());
//! let buyer = UserId::from("buyer");
//! let seller = UserId::from("seller");
//! let item = ItemId::from("bike");
//! let conversation = server.open_conversation(&item, &buyer, &seller);
//!
//! let session = ConversationSession::new(
//!     Arc::new(server.client(Some(buyer))),
//!     conversation.id,
//!     item,
//!     SyncConfig::default(),
//! );
//! session.fetch_initial().await?;
//! let mut feed = session.listen()?;
//!
//! session.send_text("hello").await?;
//! session.make_offer(15000.0, None).await?;
//!
//! feed.unsubscribe();
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod error;
pub mod events;
pub mod feed;
pub mod memory;
pub mod offer;
pub mod session;
pub mod sidebar;
pub mod timeline;

pub use backend::{Backend, FeedReceiver};
pub use error::{BackendError, SyncError};
pub use events::{
    ConversationId, ConversationRecord, ConversationSummary, FeedEvent, FeedScope, Ident, ItemId,
    LocalId, Message, MessageId, MessageKind, MessagePreview, NewMessage, NewOffer, Offer,
    OfferId, PeerDisplay, UserId,
};
pub use feed::{ChangeFeedListener, FeedGate, FeedHandler, Subscription, TimelineFeedHandler};
pub use memory::{MemoryBackend, MemoryClient, Operation};
pub use offer::{round_price, ExpiryHint, OfferResponse, OfferStatus};
pub use session::{ConversationSession, InFlight, InFlightGuard, OperationKind, OperationToken};
pub use sidebar::{SidebarAggregator, SidebarState};
pub use timeline::{SharedTimeline, TimelineStore};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub type Result<T> = std::result::Result<T, SyncError>;

/// Configuration for the sync engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Messages per history page for initial fetch and `load_more` (default: 50)
    pub page_size: usize,

    /// Rows requested by the initial sidebar load (default: 30)
    pub sidebar_page_size: usize,

    /// Currency code stamped on optimistic offers (default: KRW)
    pub currency: String,

    /// Body of the item-card marker message (default: [ITEM_CARD_INQUIRY])
    pub inquiry_marker: String,

    /// Generated inquiry text; `{title}` is replaced with the item title
    pub inquiry_template: String,

    /// Window in seconds for the "expiring soon" hint (default: 3600s)
    pub expiring_soon_secs: u64,

    /// First feed reconnect delay in milliseconds (default: 500ms)
    pub reconnect_initial_backoff_ms: u64,

    /// Upper bound on the feed reconnect delay in milliseconds (default: 30s)
    pub reconnect_max_backoff_ms: u64,

    /// Consecutive failed reconnects before the feed gives up (default: 8)
    pub max_reconnect_attempts: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: 50,
            sidebar_page_size: 30,
            currency: "KRW".to_string(),
            inquiry_marker: "[ITEM_CARD_INQUIRY]".to_string(),
            inquiry_template: "I'd like to enquire about {title}".to_string(),
            expiring_soon_secs: 3600,
            reconnect_initial_backoff_ms: 500,
            reconnect_max_backoff_ms: 30_000,
            max_reconnect_attempts: 8,
        }
    }
}

impl SyncConfig {
    /// Load a JSON config file; missing fields keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config {}", path.display()))
    }

    pub fn inquiry_text(&self, item_title: &str) -> String {
        self.inquiry_template.replace("{title}", item_title)
    }

    pub fn expiring_soon_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.expiring_soon_secs as i64)
    }

    /// Delay before reconnect attempt `attempt` (1-based), doubling up to the cap.
    pub fn reconnect_backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let delay = self
            .reconnect_initial_backoff_ms
            .saturating_mul(1u64 << shift)
            .min(self.reconnect_max_backoff_ms);
        Duration::from_millis(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnect_backoff_doubles_and_caps() {
        let config = SyncConfig::default();
        assert_eq!(config.reconnect_backoff(1), Duration::from_millis(500));
        assert_eq!(config.reconnect_backoff(2), Duration::from_millis(1000));
        assert_eq!(config.reconnect_backoff(4), Duration::from_millis(4000));
        assert_eq!(config.reconnect_backoff(20), Duration::from_millis(30_000));
    }

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config: SyncConfig = serde_json::from_str(r#"{ "page_size": 20 }"#).unwrap();
        assert_eq!(config.page_size, 20);
        assert_eq!(config.currency, "KRW");
        assert_eq!(config.inquiry_text("Bike"), "I'd like to enquire about Bike");
    }
}
