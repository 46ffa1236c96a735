//! Outbound notification module for the dispatch engine.
//!
//! Translates internal state-change records into bus envelopes and
//! publishes them for downstream consumers (notification delivery, the UI
//! websocket layer). Publishing is at-least-once: failures are retried
//! with backoff and then parked in a buffer for the next flush, never
//! silently dropped. Consumers deduplicate on order id + state + attempt
//! sequence number.

use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use dispatch_types::{
	current_timestamp, BusEnvelope, ConfigSchema, DispatchEvent, EventKind, OfferEvent,
	OfferOpenedPayload, OrderAssignedPayload, OrderEvent, OrderStateChangedPayload,
	OrderStatus, OrderUnassignablePayload,
};
use std::collections::VecDeque;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;

/// Re-export implementations
pub mod implementations {
	pub mod memory;
}

/// Errors that can occur during notification publishing.
#[derive(Debug, Error)]
pub enum PublishError {
	/// The bus refused or failed to take the envelope.
	#[error("Publish failed: {0}")]
	Bus(String),
	/// The internal event could not be encoded into an envelope.
	#[error("Encoding error: {0}")]
	Encoding(String),
}

/// Trait defining the interface for outbound bus adapters.
#[async_trait]
pub trait PublisherInterface: Send + Sync {
	/// Returns the configuration schema for this publisher implementation.
	fn config_schema(&self) -> Box<dyn ConfigSchema>;

	/// Publishes one envelope to its topic.
	async fn publish(&self, envelope: &BusEnvelope) -> Result<(), PublishError>;
}

/// Type alias for publisher factory functions.
pub type PublisherFactory = fn(&toml::Value) -> Result<Box<dyn PublisherInterface>, PublishError>;

/// Service that publishes internal events with at-least-once semantics.
pub struct NotifyService {
	/// The outbound bus adapter.
	implementation: Box<dyn PublisherInterface>,
	/// Maximum tries per publish before the envelope is parked.
	max_tries: u32,
	/// Envelopes whose publish kept failing, waiting for the next flush.
	parked: Mutex<VecDeque<BusEnvelope>>,
}

impl NotifyService {
	pub fn new(implementation: Box<dyn PublisherInterface>, max_tries: u32) -> Self {
		Self {
			implementation,
			max_tries,
			parked: Mutex::new(VecDeque::new()),
		}
	}

	/// Publishes an internal event, translating it to an envelope first.
	///
	/// Events with no outbound counterpart (offer closures are implied by
	/// the next state change) produce no envelope.
	pub async fn publish_event(&self, event: &DispatchEvent) -> Result<(), PublishError> {
		for envelope in envelopes_for(event)? {
			self.publish_envelope(envelope).await?;
		}
		Ok(())
	}

	/// Publishes one envelope with bounded retry; parks it on failure.
	///
	/// Returns Ok even when the envelope was parked: the caller's state
	/// change has already been applied locally, and the parked envelope
	/// will be re-delivered by a later flush (at-least-once).
	async fn publish_envelope(&self, envelope: BusEnvelope) -> Result<(), PublishError> {
		match self.try_publish(&envelope).await {
			Ok(()) => Ok(()),
			Err(e) => {
				tracing::error!(
					envelope_id = %envelope.id,
					kind = ?envelope.kind,
					error = %e,
					"Publish kept failing, parking envelope for retry"
				);
				self.parked.lock().await.push_back(envelope);
				Ok(())
			},
		}
	}

	/// Retries every parked envelope once; failures stay parked.
	///
	/// Returns the number of envelopes successfully flushed.
	pub async fn flush_parked(&self) -> usize {
		let mut parked = self.parked.lock().await;
		let mut flushed = 0;
		for _ in 0..parked.len() {
			let envelope = match parked.pop_front() {
				Some(envelope) => envelope,
				None => break,
			};
			match self.try_publish(&envelope).await {
				Ok(()) => flushed += 1,
				Err(_) => parked.push_back(envelope),
			}
		}
		flushed
	}

	/// Number of envelopes currently parked.
	pub async fn parked_len(&self) -> usize {
		self.parked.lock().await.len()
	}

	async fn try_publish(&self, envelope: &BusEnvelope) -> Result<(), PublishError> {
		// Tight retry window: transient broker hiccups are absorbed here,
		// anything longer goes through the parked buffer.
		let policy = BoundedBackoff {
			inner: ExponentialBackoffBuilder::new()
				.with_initial_interval(Duration::from_millis(25))
				.with_max_elapsed_time(None)
				.build(),
			retries_left: self.max_tries.saturating_sub(1),
		};

		backoff::future::retry(policy, || async {
			self.implementation
				.publish(envelope)
				.await
				.map_err(backoff::Error::transient)
		})
		.await
	}
}

/// Exponential backoff capped at a fixed number of retries.
///
/// The backoff crate bounds by elapsed time; publishing wants an exact try
/// count so the parked-buffer behavior stays deterministic.
struct BoundedBackoff {
	inner: backoff::ExponentialBackoff,
	retries_left: u32,
}

impl backoff::backoff::Backoff for BoundedBackoff {
	fn next_backoff(&mut self) -> Option<Duration> {
		if self.retries_left == 0 {
			return None;
		}
		self.retries_left -= 1;
		self.inner.next_backoff()
	}

	fn reset(&mut self) {
		self.inner.reset();
	}
}

/// Translates an internal event into its outbound envelopes.
///
/// State changes always produce an `OrderStateChanged` record; the
/// user-facing kinds (`OrderAssigned`, `OrderUnassignable`) are emitted
/// alongside it so notification consumers do not need to diff states.
pub fn envelopes_for(event: &DispatchEvent) -> Result<Vec<BusEnvelope>, PublishError> {
	let now = current_timestamp();
	let envelopes = match event {
		DispatchEvent::Offer(OfferEvent::Opened {
			order_id,
			farmer,
			attempt,
			expires_at,
		}) => {
			vec![BusEnvelope::new(
				EventKind::OfferOpened,
				order_id.clone(),
				now,
				&OfferOpenedPayload {
					order_id: order_id.clone(),
					farmer: farmer.clone(),
					attempt: *attempt,
					expires_at: *expires_at,
				},
			)
			.map_err(|e| PublishError::Encoding(e.to_string()))?]
		},
		// Closures are implied by the follow-up state change or next
		// OfferOpened; nothing downstream consumes them directly.
		DispatchEvent::Offer(OfferEvent::Closed { .. }) => vec![],
		DispatchEvent::Order(OrderEvent::StateChanged {
			order_id,
			from,
			to,
			attempt,
			assigned_farmer,
			reason,
		}) => {
			let mut envelopes = vec![BusEnvelope::new(
				EventKind::OrderStateChanged,
				order_id.clone(),
				now,
				&OrderStateChangedPayload {
					order_id: order_id.clone(),
					from: *from,
					to: *to,
					attempt: *attempt,
					reason: reason.clone(),
				},
			)
			.map_err(|e| PublishError::Encoding(e.to_string()))?];

			match to {
				OrderStatus::Assigned => {
					let farmer = assigned_farmer.clone().ok_or_else(|| {
						PublishError::Encoding(
							"Assigned state change without a farmer".to_string(),
						)
					})?;
					envelopes.push(
						BusEnvelope::new(
							EventKind::OrderAssigned,
							order_id.clone(),
							now,
							&OrderAssignedPayload {
								order_id: order_id.clone(),
								farmer,
							},
						)
						.map_err(|e| PublishError::Encoding(e.to_string()))?,
					);
				},
				OrderStatus::Unassignable => {
					envelopes.push(
						BusEnvelope::new(
							EventKind::OrderUnassignable,
							order_id.clone(),
							now,
							&OrderUnassignablePayload {
								order_id: order_id.clone(),
								attempts: *attempt,
							},
						)
						.map_err(|e| PublishError::Encoding(e.to_string()))?,
					);
				},
				_ => {},
			}
			envelopes
		},
	};
	Ok(envelopes)
}
