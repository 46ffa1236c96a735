//! Offer attempt types for the sequential offer protocol.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One time-bounded proposal of an order to one farmer.
///
/// Identified by `(order_id, sequence)`. Created when the dispatcher
/// advances to a candidate, finalized exactly once with one of the
/// non-pending outcomes, and immutable afterwards. At most one attempt per
/// order is `Pending` at any instant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfferAttempt {
	/// Order this attempt belongs to.
	pub order_id: String,
	/// Attempt sequence number, starting at 1 for the first candidate.
	pub sequence: u32,
	/// Farmer the offer was made to.
	pub farmer: String,
	/// Timestamp when the offer was opened.
	pub opened_at: u64,
	/// Deadline after which the offer expires unanswered.
	pub expires_at: u64,
	/// Outcome of the attempt.
	pub outcome: OfferOutcome,
}

impl OfferAttempt {
	/// Storage id for this attempt within the attempts namespace.
	pub fn storage_id(&self) -> String {
		format!("{}:{}", self.order_id, self.sequence)
	}
}

/// Outcome of an offer attempt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum OfferOutcome {
	/// Offer is open and waiting for the farmer's response.
	Pending,
	/// Farmer accepted before the deadline.
	Accepted,
	/// Farmer explicitly declined.
	Rejected,
	/// Deadline passed with no response, or the order was cancelled
	/// while the offer was open.
	Expired,
}

impl fmt::Display for OfferOutcome {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			OfferOutcome::Pending => write!(f, "pending"),
			OfferOutcome::Accepted => write!(f, "accepted"),
			OfferOutcome::Rejected => write!(f, "rejected"),
			OfferOutcome::Expired => write!(f, "expired"),
		}
	}
}
