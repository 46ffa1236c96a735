//! Per-order offer attempt ledger.
//!
//! The synchronous heart of the offer protocol: tracks every attempt made
//! for one order and enforces the protocol invariants. At most one attempt
//! is pending at any instant, attempts are finalized exactly once, and
//! sequence numbers strictly increase. A violated invariant is an internal
//! error the dispatcher surfaces, never reconciles.

use dispatch_types::{OfferAttempt, OfferOutcome};
use std::collections::HashSet;
use thiserror::Error;

/// Invariant violations in the attempt ledger.
#[derive(Debug, Error)]
pub enum LedgerError {
	#[error("Attempt {pending} for order {order_id} is still pending")]
	PendingAttemptExists { order_id: String, pending: u32 },
	#[error("Attempt {sequence} for order {order_id} is not pending")]
	AttemptNotPending { order_id: String, sequence: u32 },
	#[error("Attempt sequence {sequence} for order {order_id} is not increasing")]
	NonMonotonicSequence { order_id: String, sequence: u32 },
}

/// Attempt history of a single order.
pub struct OfferLedger {
	order_id: String,
	attempts: Vec<OfferAttempt>,
}

impl OfferLedger {
	pub fn new(order_id: impl Into<String>) -> Self {
		Self {
			order_id: order_id.into(),
			attempts: Vec::new(),
		}
	}

	/// Rebuilds a ledger from persisted attempts (startup recovery).
	///
	/// The caller is responsible for having expired any attempt left
	/// pending by a crash before handing them over.
	pub fn from_attempts(order_id: impl Into<String>, mut attempts: Vec<OfferAttempt>) -> Self {
		attempts.sort_by_key(|a| a.sequence);
		Self {
			order_id: order_id.into(),
			attempts,
		}
	}

	/// Opens a new attempt to the given farmer.
	///
	/// Refused while another attempt is pending or when the sequence does
	/// not advance past every recorded attempt.
	pub fn open(
		&mut self,
		sequence: u32,
		farmer: impl Into<String>,
		opened_at: u64,
		expires_at: u64,
	) -> Result<&OfferAttempt, LedgerError> {
		if let Some(pending) = self.pending() {
			return Err(LedgerError::PendingAttemptExists {
				order_id: self.order_id.clone(),
				pending: pending.sequence,
			});
		}
		if self.attempts.iter().any(|a| a.sequence >= sequence) {
			return Err(LedgerError::NonMonotonicSequence {
				order_id: self.order_id.clone(),
				sequence,
			});
		}

		self.attempts.push(OfferAttempt {
			order_id: self.order_id.clone(),
			sequence,
			farmer: farmer.into(),
			opened_at,
			expires_at,
			outcome: OfferOutcome::Pending,
		});
		Ok(self.attempts.last().expect("attempt just pushed"))
	}

	/// Finalizes the attempt with the given sequence exactly once.
	pub fn finalize(
		&mut self,
		sequence: u32,
		outcome: OfferOutcome,
	) -> Result<&OfferAttempt, LedgerError> {
		debug_assert_ne!(outcome, OfferOutcome::Pending);
		let order_id = self.order_id.clone();
		let attempt = self
			.attempts
			.iter_mut()
			.find(|a| a.sequence == sequence)
			.filter(|a| a.outcome == OfferOutcome::Pending)
			.ok_or(LedgerError::AttemptNotPending { order_id, sequence })?;

		attempt.outcome = outcome;
		Ok(attempt)
	}

	/// The attempt currently waiting for a response, if any.
	pub fn pending(&self) -> Option<&OfferAttempt> {
		self.attempts
			.iter()
			.find(|a| a.outcome == OfferOutcome::Pending)
	}

	/// Farmers that already saw an attempt for this order.
	///
	/// They are excluded from further candidates: a farmer that rejected
	/// or ignored the order is never offered it again, and a farmer with
	/// the open attempt cannot receive a second one.
	pub fn tried_farmers(&self) -> HashSet<String> {
		self.attempts.iter().map(|a| a.farmer.clone()).collect()
	}

	/// All recorded attempts in sequence order.
	pub fn attempts(&self) -> &[OfferAttempt] {
		&self.attempts
	}

	/// Next attempt sequence: one past the highest recorded.
	pub fn next_sequence(&self) -> u32 {
		self.attempts.iter().map(|a| a.sequence).max().unwrap_or(0) + 1
	}
}
