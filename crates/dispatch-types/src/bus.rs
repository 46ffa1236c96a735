//! Message bus envelope and event kind types.
//!
//! Everything that crosses the external message bus travels inside a
//! [`BusEnvelope`]: a typed kind, a subject id, a timestamp and a free-form
//! JSON payload. Typed payload structs are provided for the payloads the
//! dispatch core produces or consumes, so handlers never poke at raw JSON.

use crate::order::Order;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

/// Topic carrying farmer presence/lifecycle events.
pub const TOPIC_USER_EVENTS: &str = "user-events";
/// Topic carrying session expiry/logout signals from the auth collaborator.
pub const TOPIC_AUTH_EVENTS: &str = "auth-events";
/// Topic carrying order creation and order state-change notifications.
pub const TOPIC_ORDERS: &str = "orders-topic";

/// Errors raised when decoding an envelope payload.
#[derive(Debug, Error)]
pub enum EnvelopeError {
	/// The payload did not match the shape expected for the event kind.
	#[error("Malformed payload for {kind}: {message}")]
	MalformedPayload { kind: String, message: String },
}

/// Logical envelope for every event crossing the external bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusEnvelope {
	/// Unique event id, used for downstream idempotence.
	pub id: String,
	/// What kind of event this is.
	pub kind: EventKind,
	/// Subject the event is about (user id or order id).
	pub subject: String,
	/// When the event happened at the producer.
	pub timestamp: u64,
	/// Kind-specific payload.
	#[serde(default)]
	pub payload: serde_json::Value,
}

impl BusEnvelope {
	/// Builds an envelope with a fresh uuid and the given payload.
	pub fn new<T: Serialize>(
		kind: EventKind,
		subject: impl Into<String>,
		timestamp: u64,
		payload: &T,
	) -> Result<Self, serde_json::Error> {
		Ok(Self {
			id: uuid::Uuid::new_v4().to_string(),
			kind,
			subject: subject.into(),
			timestamp,
			payload: serde_json::to_value(payload)?,
		})
	}

	/// Decodes the payload into the typed struct expected for the kind.
	pub fn decode<T: DeserializeOwned>(&self) -> Result<T, EnvelopeError> {
		serde_json::from_value(self.payload.clone()).map_err(|e| EnvelopeError::MalformedPayload {
			kind: format!("{:?}", self.kind),
			message: e.to_string(),
		})
	}

	/// Which topic envelopes of this kind belong to.
	pub fn topic(&self) -> &'static str {
		self.kind.topic()
	}
}

/// Enumerated event kinds crossing the bus, consumed and produced.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
	// Consumed: presence and session lifecycle.
	FarmerOnline,
	FarmerOffline,
	Heartbeat,
	SessionExpired,
	// Consumed: order lifecycle commands.
	OrderCreated,
	OrderCancelled,
	OfferAccepted,
	OfferRejected,
	JobStarted,
	JobCompleted,
	// Produced: notifications for UI/notification consumers.
	OfferOpened,
	OrderAssigned,
	OrderUnassignable,
	OrderStateChanged,
}

impl EventKind {
	/// Topic this kind of event travels on.
	pub fn topic(&self) -> &'static str {
		match self {
			EventKind::FarmerOnline | EventKind::FarmerOffline | EventKind::Heartbeat => {
				TOPIC_USER_EVENTS
			},
			EventKind::SessionExpired => TOPIC_AUTH_EVENTS,
			_ => TOPIC_ORDERS,
		}
	}
}

/// Payload of an `OrderCreated` envelope: the full order as accepted by
/// the intake collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderCreatedPayload {
	pub order: Order,
}

/// Payload of `OfferAccepted` / `OfferRejected` envelopes.
///
/// The farmer identity is the verified identity attached by the auth
/// collaborator; the core trusts it without re-validating credentials.
/// The attempt sequence is optional: clients that echo it get strict
/// matching, clients that omit it are matched against the open attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfferResponsePayload {
	pub order_id: String,
	pub farmer: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub attempt: Option<u32>,
}

/// Payload of an `OrderCancelled` envelope from the creator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelPayload {
	pub order_id: String,
	pub reason: String,
}

/// Payload of `JobStarted` / `JobCompleted` envelopes from the assigned
/// farmer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPayload {
	pub order_id: String,
	pub farmer: String,
}

/// Payload of a produced `OfferOpened` notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfferOpenedPayload {
	pub order_id: String,
	pub farmer: String,
	pub attempt: u32,
	pub expires_at: u64,
}

/// Payload of a produced `OrderAssigned` notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAssignedPayload {
	pub order_id: String,
	pub farmer: String,
}

/// Payload of a produced `OrderUnassignable` notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderUnassignablePayload {
	pub order_id: String,
	pub attempts: u32,
}

/// Payload of a produced `OrderStateChanged` notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderStateChangedPayload {
	pub order_id: String,
	pub from: crate::order::OrderStatus,
	pub to: crate::order::OrderStatus,
	pub attempt: u32,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub reason: Option<String>,
}

/// In-process stand-in for the external message broker.
///
/// One broadcast channel carrying envelopes for every topic; subscribers
/// filter by topic. Used by the memory ingest/notify implementations for
/// tests and local runs, wired the same way a real broker client would be.
#[derive(Clone)]
pub struct MemoryBus {
	sender: tokio::sync::broadcast::Sender<BusEnvelope>,
}

impl MemoryBus {
	/// Creates a bus retaining up to `capacity` undelivered envelopes
	/// per subscriber.
	pub fn new(capacity: usize) -> Self {
		let (sender, _) = tokio::sync::broadcast::channel(capacity);
		Self { sender }
	}

	/// Publishes an envelope to every current subscriber.
	///
	/// A bus with no subscribers swallows the envelope, matching broker
	/// semantics for topics nobody consumes.
	pub fn publish(&self, envelope: BusEnvelope) {
		let _ = self.sender.send(envelope);
	}

	/// Subscribes to every envelope published after this call.
	pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<BusEnvelope> {
		self.sender.subscribe()
	}
}

impl Default for MemoryBus {
	fn default() -> Self {
		Self::new(1024)
	}
}
