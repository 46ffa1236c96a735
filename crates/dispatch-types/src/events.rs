//! Internal engine events for in-process communication.
//!
//! These events flow on the in-process event bus between the dispatch core
//! and the notify pump. They are state-change records, not bus wire
//! payloads; the notify service translates them into outbound envelopes.

use crate::order::OrderStatus;
use serde::{Deserialize, Serialize};

/// Main event type carried on the internal event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DispatchEvent {
	/// Order lifecycle changes recorded by the state machine.
	Order(OrderEvent),
	/// Offer protocol progress recorded by the dispatcher.
	Offer(OfferEvent),
}

/// Events emitted by the order state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OrderEvent {
	/// An order moved from one state to another.
	StateChanged {
		order_id: String,
		from: OrderStatus,
		to: OrderStatus,
		/// Dispatch attempt counter at the time of the transition, so
		/// downstream consumers can deduplicate replays.
		attempt: u32,
		/// Assigned farmer when `to` is `Assigned`.
		assigned_farmer: Option<String>,
		/// Cancellation reason when `to` is `Cancelled`.
		reason: Option<String>,
	},
}

/// Events emitted by the sequential dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OfferEvent {
	/// A time-bounded offer was opened to a candidate farmer.
	Opened {
		order_id: String,
		farmer: String,
		attempt: u32,
		expires_at: u64,
	},
	/// An open offer was closed with a final outcome.
	Closed {
		order_id: String,
		farmer: String,
		attempt: u32,
		outcome: crate::offer::OfferOutcome,
	},
}
