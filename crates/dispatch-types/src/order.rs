//! Order types for the dispatch engine.
//!
//! This module defines the marketplace order as seen by the dispatch core:
//! its print requirements, its lifecycle status, and the bookkeeping fields
//! the state machine and dispatcher maintain (attempt counter, optimistic
//! version, transition history).

use serde::{Deserialize, Serialize};
use std::fmt;

/// A creator's print order with its full dispatch lifecycle state.
///
/// Orders are created in `Pending` by the order-intake collaborator and are
/// mutated only through the order state machine. Terminal orders are
/// retained, not deleted, so the transition history doubles as an audit
/// record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
	/// Stable order identifier, distinct from any storage-assigned id.
	pub id: String,
	/// Verified identity of the creator who submitted the order.
	pub creator: String,
	/// Where the printed parts have to end up.
	pub location: Location,
	/// What has to be printed and how.
	pub requirements: PrintSpec,
	/// Current lifecycle status.
	pub status: OrderStatus,
	/// Farmer the order was assigned to, once accepted.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub assigned_farmer: Option<String>,
	/// Reason supplied when the order was cancelled.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub cancellation_reason: Option<String>,
	/// Monotonically increasing dispatch attempt counter.
	pub attempts: u32,
	/// Optimistic-concurrency version, bumped on every transition.
	pub version: u64,
	/// Timestamp when this order was created.
	pub created_at: u64,
	/// Timestamp when this order was last updated.
	pub updated_at: u64,
	/// One record per state transition, in order.
	#[serde(default)]
	pub history: Vec<StateChange>,
}

impl Order {
	/// Creates a new order in `Pending` with zeroed bookkeeping fields.
	pub fn new(
		id: String,
		creator: String,
		location: Location,
		requirements: PrintSpec,
		now: u64,
	) -> Self {
		Self {
			id,
			creator,
			location,
			requirements,
			status: OrderStatus::Pending,
			assigned_farmer: None,
			cancellation_reason: None,
			attempts: 0,
			version: 0,
			created_at: now,
			updated_at: now,
			history: Vec::new(),
		}
	}
}

/// Delivery location of an order: city plus geocoordinates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Location {
	pub city: String,
	pub lat: f64,
	pub lon: f64,
}

/// Printing requirements attached to an order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrintSpec {
	/// Print material, e.g. "PLA" or "PETG".
	pub material: String,
	/// Print mode, e.g. "draft" or "quality".
	pub mode: String,
	/// Storage keys of the uploaded model files.
	#[serde(default)]
	pub file_keys: Vec<String>,
	/// Estimated print duration in minutes.
	pub estimated_minutes: u64,
	/// Quoted cost for the job.
	pub cost: f64,
}

/// A single recorded state transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateChange {
	pub from: OrderStatus,
	pub to: OrderStatus,
	pub at: u64,
}

/// Lifecycle status of an order.
///
/// `Pending` is initial; `Completed`, `Cancelled` and `Unassignable` are
/// terminal. The valid edges between these states live in the order state
/// machine, which is the only component allowed to move an order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum OrderStatus {
	/// Order has been created and is waiting for dispatch to start.
	Pending,
	/// The sequential dispatcher is offering the order to candidates.
	Dispatching,
	/// A farmer accepted the offer.
	Assigned,
	/// The assigned farmer started printing.
	InProgress,
	/// The assigned farmer finished the job.
	Completed,
	/// The creator cancelled the order.
	Cancelled,
	/// Every eligible candidate was tried without success.
	Unassignable,
}

impl OrderStatus {
	/// Whether this status is terminal (no further transitions allowed).
	pub fn is_terminal(&self) -> bool {
		matches!(
			self,
			OrderStatus::Completed | OrderStatus::Cancelled | OrderStatus::Unassignable
		)
	}
}

impl fmt::Display for OrderStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			OrderStatus::Pending => write!(f, "Pending"),
			OrderStatus::Dispatching => write!(f, "Dispatching"),
			OrderStatus::Assigned => write!(f, "Assigned"),
			OrderStatus::InProgress => write!(f, "InProgress"),
			OrderStatus::Completed => write!(f, "Completed"),
			OrderStatus::Cancelled => write!(f, "Cancelled"),
			OrderStatus::Unassignable => write!(f, "Unassignable"),
		}
	}
}

/// State-specific payload accompanying a transition request.
///
/// Keeps the state machine honest about which transitions require extra
/// data: an assignment always names the accepting farmer, a cancellation
/// always carries a reason.
#[derive(Debug, Clone)]
pub enum TransitionEvidence {
	/// No state-specific fields to apply.
	None,
	/// The farmer whose accepted offer produced the assignment.
	AssignedFarmer(String),
	/// The creator-supplied cancellation reason.
	Cancellation(String),
}
