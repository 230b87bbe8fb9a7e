//! Change-feed subscriptions and the timeline listener
//!
//! A [`Subscription`] owns a pump task that pulls events from the backend
//! stream and hands them, one at a time and in arrival order, to a
//! [`FeedHandler`]. When the stream ends without being cancelled the pump
//! resubscribes with exponential backoff.
//!
//! A pump that runs out of attempts closes its gate, so the owner reports
//! itself unsubscribed and may subscribe again.
//!
//! Cancellation is idempotent. Handlers check the [`FeedGate`] while holding
//! their state lock, and owners close the gate under that same lock, so no
//! mutation can land after `unsubscribe` returns.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backend::Backend;
use crate::error::SyncError;
use crate::events::{ConversationId, FeedEvent, FeedScope, Ident, Message, MessageKind, Offer};
use crate::timeline::SharedTimeline;
use crate::{Result, SyncConfig};

/// Open/closed flag shared by a subscription and its handler
#[derive(Debug, Clone)]
pub struct FeedGate(Arc<AtomicBool>);

impl FeedGate {
    pub fn open() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn closed() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn is_open(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn close(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Consumer of change-feed events
#[async_trait]
pub trait FeedHandler: Send + Sync + 'static {
    async fn handle(&self, event: FeedEvent, gate: &FeedGate);
}

/// Running change-feed subscription
pub struct Subscription {
    gate: FeedGate,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Subscribe to `scope` and deliver events to `handler` on a pump task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        backend: Arc<dyn Backend>,
        scope: FeedScope,
        handler: Arc<dyn FeedHandler>,
        config: &SyncConfig,
    ) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| SyncError::Subscription(format!("no tokio runtime: {}", e)))?;
        let gate = FeedGate::open();
        let task = runtime.spawn(pump(
            backend,
            scope,
            handler,
            gate.clone(),
            config.clone(),
        ));
        Ok(Self {
            gate,
            task: Some(task),
        })
    }

    pub fn gate(&self) -> &FeedGate {
        &self.gate
    }

    pub fn is_active(&self) -> bool {
        self.gate.is_open()
    }

    /// Stop delivery. Safe to call repeatedly.
    pub fn cancel(&mut self) {
        self.gate.close();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

async fn pump(
    backend: Arc<dyn Backend>,
    scope: FeedScope,
    handler: Arc<dyn FeedHandler>,
    gate: FeedGate,
    config: SyncConfig,
) {
    let mut failures: u32 = 0;

    while gate.is_open() {
        match backend.subscribe(scope.clone()).await {
            Ok(mut events) => {
                if failures > 0 {
                    info!("Feed {:?} resubscribed after {} attempts", scope, failures);
                } else {
                    info!("Feed {:?} subscribed", scope);
                }
                failures = 0;

                while let Some(event) = events.recv().await {
                    if !gate.is_open() {
                        return;
                    }
                    handler.handle(event, &gate).await;
                }

                if !gate.is_open() {
                    return;
                }
                warn!("Feed {:?} stream ended, reconnecting", scope);
            }
            Err(e) => {
                error!("Feed {:?} subscription failed: {}", scope, e);
            }
        }

        failures += 1;
        if failures > config.max_reconnect_attempts {
            error!(
                "Feed {:?} giving up after {} attempts, running degraded",
                scope, failures
            );
            // Lets the owner see the feed is down and subscribe again
            gate.close();
            return;
        }
        let delay = config.reconnect_backoff(failures);
        debug!("Feed {:?} retrying in {:?}", scope, delay);
        tokio::time::sleep(delay).await;
    }
}

/// Merges conversation-scoped feed events into a timeline
pub struct TimelineFeedHandler {
    timeline: SharedTimeline,
    backend: Arc<dyn Backend>,
    conversation_id: ConversationId,
}

impl TimelineFeedHandler {
    pub fn new(timeline: SharedTimeline, backend: Arc<dyn Backend>) -> Self {
        let conversation_id = timeline.lock().conversation_id().clone();
        Self {
            timeline,
            backend,
            conversation_id,
        }
    }

    /// Merge an inserted message. Returns true if it was added.
    ///
    /// Messages already in the timeline are discarded. Offer messages get
    /// their offer resolved first; if that lookup fails the message is
    /// still added, without the snapshot.
    pub async fn on_message_insert(&self, mut message: Message, gate: &FeedGate) -> bool {
        if message.conversation_id != self.conversation_id {
            return false;
        }
        if self.timeline.lock().contains(&message.id) {
            debug!("Discarding feed message {}: already present", message.id);
            return false;
        }

        if message.kind == MessageKind::Offer && message.offer.is_none() {
            if let Some(Ident::Confirmed(offer_id)) = message.offer_id.clone() {
                match self.backend.get_offer(&offer_id).await {
                    Ok(Some(offer)) => message.offer = Some(offer),
                    Ok(None) => warn!(
                        "Offer {} for message {} not found, adding without it",
                        offer_id, message.id
                    ),
                    Err(e) => warn!(
                        "Offer lookup for message {} failed, adding without it: {}",
                        message.id, e
                    ),
                }
            }
        }

        let mut timeline = self.timeline.lock();
        if !gate.is_open() {
            return false;
        }
        timeline.insert_remote(message)
    }

    /// Re-embed an updated offer. Returns the number of snapshots changed.
    pub fn on_offer_update(&self, offer: Offer, gate: &FeedGate) -> usize {
        if offer.conversation_id != self.conversation_id {
            return 0;
        }
        let mut timeline = self.timeline.lock();
        if !gate.is_open() {
            return 0;
        }
        let changed = timeline.apply_offer_update(&offer);
        debug!("Offer {} now {:?} in {} messages", offer.id, offer.status, changed);
        changed
    }
}

#[async_trait]
impl FeedHandler for TimelineFeedHandler {
    async fn handle(&self, event: FeedEvent, gate: &FeedGate) {
        match event {
            FeedEvent::MessageInserted(message) => {
                self.on_message_insert(message, gate).await;
            }
            FeedEvent::OfferUpdated(offer) => {
                self.on_offer_update(offer, gate);
            }
            FeedEvent::ConversationInserted(_) => {}
        }
    }
}

/// Change-feed listener bound to one conversation timeline
pub struct ChangeFeedListener {
    timeline: SharedTimeline,
    subscription: Option<Subscription>,
}

impl ChangeFeedListener {
    /// Create an unsubscribed listener.
    pub fn new(timeline: SharedTimeline) -> Self {
        Self {
            timeline,
            subscription: None,
        }
    }

    /// Subscribe to the timeline's conversation. No-op if already subscribed.
    pub fn subscribe(&mut self, backend: Arc<dyn Backend>, config: &SyncConfig) -> Result<()> {
        if self.is_subscribed() {
            return Ok(());
        }
        let handler = TimelineFeedHandler::new(Arc::clone(&self.timeline), Arc::clone(&backend));
        let scope = FeedScope::Conversation(handler.conversation_id.clone());
        self.subscription = Some(Subscription::spawn(
            backend,
            scope,
            Arc::new(handler),
            config,
        )?);
        Ok(())
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscription.as_ref().is_some_and(|s| s.is_active())
    }

    /// Stop delivery. Idempotent; no timeline mutation from the feed happens
    /// after this returns.
    pub fn unsubscribe(&mut self) {
        let timeline = self.timeline.lock();
        if let Some(mut subscription) = self.subscription.take() {
            subscription.cancel();
            info!("Feed for conversation {} unsubscribed", timeline.conversation_id());
        }
    }
}

impl Drop for ChangeFeedListener {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
