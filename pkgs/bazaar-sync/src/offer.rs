//! Offer negotiation lifecycle
//!
//! `pending` is the only non-terminal status. The client never moves an offer
//! between statuses itself: it asks the backend through
//! [`Backend::respond_to_offer`](crate::Backend::respond_to_offer) and later
//! observes the outcome on the change feed. `expired` arrives the same way;
//! a local clock comparison only yields an [`ExpiryHint`].

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::events::Offer;

/// Offer status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfferStatus {
    Pending,
    Accepted,
    Declined,
    Expired,
}

impl OfferStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, OfferStatus::Pending)
    }

    /// Returns true if moving from self to `next` is a legal transition.
    pub fn can_transition_to(self, next: OfferStatus) -> bool {
        matches!(
            (self, next),
            (OfferStatus::Pending, OfferStatus::Accepted)
                | (OfferStatus::Pending, OfferStatus::Declined)
                | (OfferStatus::Pending, OfferStatus::Expired)
        )
    }

    /// Whether an observed status may replace this one in a snapshot.
    /// Re-observing the same status is allowed.
    pub fn admits(self, observed: OfferStatus) -> bool {
        self == observed || self.can_transition_to(observed)
    }
}

/// Terminal status a responder may request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfferResponse {
    Accepted,
    Declined,
}

impl From<OfferResponse> for OfferStatus {
    fn from(response: OfferResponse) -> Self {
        match response {
            OfferResponse::Accepted => OfferStatus::Accepted,
            OfferResponse::Declined => OfferStatus::Declined,
        }
    }
}

/// Display-only expiry hint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryHint {
    None,
    ExpiringSoon,
    /// Past the expiry timestamp but not yet expired by the backend.
    PastDue,
}

impl Offer {
    pub fn expiry_hint(&self, now: DateTime<Utc>, window: Duration) -> ExpiryHint {
        if self.status != OfferStatus::Pending {
            return ExpiryHint::None;
        }
        match self.expires_at {
            Some(expires_at) if expires_at <= now => ExpiryHint::PastDue,
            Some(expires_at) if expires_at - now <= window => ExpiryHint::ExpiringSoon,
            _ => ExpiryHint::None,
        }
    }

    /// Replace this snapshot with an observed one.
    ///
    /// Returns `Ok(true)` if anything changed. A snapshot that would move a
    /// terminal offer anywhere else is refused and leaves `self` untouched.
    pub fn apply_update(&mut self, observed: Offer) -> Result<bool, SyncError> {
        if !self.status.admits(observed.status) {
            return Err(SyncError::InvalidTransition {
                from: self.status,
                to: observed.status,
            });
        }
        if *self == observed {
            return Ok(false);
        }
        *self = observed;
        Ok(true)
    }
}

/// Round a user-entered price to integer minor units.
pub fn round_price(input: f64) -> Result<i64, SyncError> {
    if !input.is_finite() {
        return Err(SyncError::InvalidPrice(format!("{} is not a number", input)));
    }
    let rounded = input.round();
    if rounded < 0.0 {
        return Err(SyncError::InvalidPrice(format!("{} is negative", input)));
    }
    if rounded > i64::MAX as f64 {
        return Err(SyncError::InvalidPrice(format!("{} is out of range", input)));
    }
    Ok(rounded as i64)
}
