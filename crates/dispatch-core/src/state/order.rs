//! Order state machine implementation.
//!
//! The single source of truth for order lifecycle transitions:
//! Pending -> Dispatching -> Assigned -> InProgress -> Completed, with the
//! side branches Dispatching -> Unassignable and
//! {Pending, Dispatching, Assigned, InProgress} -> Cancelled. Every
//! transition is guarded by the order's optimistic version so two racing
//! writers cannot both win, and every successful transition emits a
//! state-change record for the notify pump.

use crate::engine::event_bus::EventBus;
use dispatch_storage::{StorageError, StorageService};
use dispatch_types::{
	current_timestamp, DispatchEvent, Order, OrderEvent, OrderStatus, StateChange, StorageKey,
	TransitionEvidence,
};
use once_cell::sync::Lazy;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur during order state management.
#[derive(Debug, Error)]
pub enum StateError {
	#[error("Storage error: {0}")]
	Storage(String),
	/// The requested edge is not in the transition table. A programming
	/// or race error: logged and refused, never reconciled silently.
	#[error("Invalid state transition from {from} to {to}")]
	InvalidTransition { from: OrderStatus, to: OrderStatus },
	/// Optimistic-concurrency conflict; the caller retries with fresh
	/// state.
	#[error("Stale order version: expected {expected}, stored {actual}")]
	StaleOrder { expected: u64, actual: u64 },
	#[error("Order not found: {0}")]
	OrderNotFound(String),
	/// Evidence did not match the target state (e.g. an assignment
	/// without a farmer).
	#[error("Invalid evidence for transition to {to}: {message}")]
	InvalidEvidence { to: OrderStatus, message: String },
}

impl From<StorageError> for StateError {
	fn from(e: StorageError) -> Self {
		match e {
			StorageError::NotFound => StateError::OrderNotFound("order".into()),
			other => StateError::Storage(other.to_string()),
		}
	}
}

/// Manages order state transitions and persistence.
pub struct OrderStateMachine {
	storage: Arc<StorageService>,
	event_bus: EventBus,
}

/// Static transition table - each state maps to its allowed next states.
static TRANSITIONS: Lazy<HashMap<OrderStatus, HashSet<OrderStatus>>> = Lazy::new(|| {
	let mut m = HashMap::new();
	m.insert(
		OrderStatus::Pending,
		HashSet::from([OrderStatus::Dispatching, OrderStatus::Cancelled]),
	);
	m.insert(
		OrderStatus::Dispatching,
		HashSet::from([
			OrderStatus::Assigned,
			OrderStatus::Unassignable,
			OrderStatus::Cancelled,
		]),
	);
	m.insert(
		OrderStatus::Assigned,
		HashSet::from([OrderStatus::InProgress, OrderStatus::Cancelled]),
	);
	m.insert(
		OrderStatus::InProgress,
		HashSet::from([OrderStatus::Completed, OrderStatus::Cancelled]),
	);
	m.insert(OrderStatus::Completed, HashSet::new()); // terminal
	m.insert(OrderStatus::Cancelled, HashSet::new()); // terminal
	m.insert(OrderStatus::Unassignable, HashSet::new()); // terminal
	m
});

impl OrderStateMachine {
	pub fn new(storage: Arc<StorageService>, event_bus: EventBus) -> Self {
		Self { storage, event_bus }
	}

	/// Checks if a state transition is valid.
	pub fn is_valid_transition(from: &OrderStatus, to: &OrderStatus) -> bool {
		TRANSITIONS.get(from).is_some_and(|set| set.contains(to))
	}

	/// Gets an order by ID.
	pub async fn get_order(&self, order_id: &str) -> Result<Order, StateError> {
		self.storage
			.retrieve(StorageKey::Orders.as_str(), order_id)
			.await
			.map_err(|e| match e {
				StorageError::NotFound => StateError::OrderNotFound(order_id.to_string()),
				other => StateError::Storage(other.to_string()),
			})
	}

	/// Stores a new order.
	pub async fn store_order(&self, order: &Order) -> Result<(), StateError> {
		self.storage
			.store(StorageKey::Orders.as_str(), &order.id, order)
			.await
			.map_err(|e| StateError::Storage(e.to_string()))
	}

	/// Transitions an order to a new status.
	///
	/// Fails with `InvalidTransition` if the edge is not allowed, with
	/// `StaleOrder` if `expected_version` does not match the stored
	/// order. On success the status, version, timestamp, history and any
	/// state-specific fields are updated atomically with respect to other
	/// version-guarded writers, and a state-change record is published.
	pub async fn transition(
		&self,
		order_id: &str,
		to: OrderStatus,
		expected_version: u64,
		evidence: TransitionEvidence,
	) -> Result<Order, StateError> {
		let mut order = self.get_order(order_id).await?;

		if order.version != expected_version {
			return Err(StateError::StaleOrder {
				expected: expected_version,
				actual: order.version,
			});
		}

		let from = order.status;
		if !Self::is_valid_transition(&from, &to) {
			tracing::error!(
				order_id = %dispatch_types::truncate_id(order_id),
				%from,
				%to,
				"Refusing invalid state transition"
			);
			return Err(StateError::InvalidTransition { from, to });
		}

		match (&to, &evidence) {
			(OrderStatus::Assigned, TransitionEvidence::AssignedFarmer(farmer)) => {
				order.assigned_farmer = Some(farmer.clone());
			},
			(OrderStatus::Assigned, _) => {
				return Err(StateError::InvalidEvidence {
					to,
					message: "assignment requires the accepting farmer".into(),
				});
			},
			(OrderStatus::Cancelled, TransitionEvidence::Cancellation(reason)) => {
				order.cancellation_reason = Some(reason.clone());
			},
			(OrderStatus::Cancelled, _) => {
				return Err(StateError::InvalidEvidence {
					to,
					message: "cancellation requires a reason".into(),
				});
			},
			_ => {},
		}

		let now = current_timestamp();
		order.status = to;
		order.version += 1;
		order.updated_at = now;
		order.history.push(StateChange { from, to, at: now });

		self.storage
			.update(StorageKey::Orders.as_str(), order_id, &order)
			.await
			.map_err(|e| StateError::Storage(e.to_string()))?;

		self.event_bus
			.publish(DispatchEvent::Order(OrderEvent::StateChanged {
				order_id: order_id.to_string(),
				from,
				to,
				attempt: order.attempts,
				assigned_farmer: order.assigned_farmer.clone(),
				reason: order.cancellation_reason.clone(),
			}))
			.ok();

		tracing::info!(
			order_id = %dispatch_types::truncate_id(order_id),
			%from,
			%to,
			version = order.version,
			"Order transitioned"
		);

		Ok(order)
	}

	/// Increments the order's dispatch attempt counter.
	///
	/// Shares the version guard with `transition` so a racing dispatcher
	/// on the same order loses with `StaleOrder` instead of corrupting
	/// the counter.
	pub async fn record_attempt(
		&self,
		order_id: &str,
		expected_version: u64,
	) -> Result<Order, StateError> {
		let mut order = self.get_order(order_id).await?;

		if order.version != expected_version {
			return Err(StateError::StaleOrder {
				expected: expected_version,
				actual: order.version,
			});
		}

		order.attempts += 1;
		order.version += 1;
		order.updated_at = current_timestamp();

		self.storage
			.update(StorageKey::Orders.as_str(), order_id, &order)
			.await
			.map_err(|e| StateError::Storage(e.to_string()))?;

		Ok(order)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use dispatch_storage::implementations::memory::MemoryStorage;
	use dispatch_types::{Location, PrintSpec};

	fn machine() -> OrderStateMachine {
		OrderStateMachine::new(
			Arc::new(StorageService::new(Box::new(MemoryStorage::new()))),
			EventBus::new(64),
		)
	}

	fn order(id: &str) -> Order {
		Order::new(
			id.to_string(),
			"creator-1".into(),
			Location {
				city: "Paris".into(),
				lat: 48.85,
				lon: 2.35,
			},
			PrintSpec {
				material: "PLA".into(),
				mode: "quality".into(),
				file_keys: vec![],
				estimated_minutes: 45,
				cost: 12.5,
			},
			1_700_000_000,
		)
	}

	#[tokio::test]
	async fn happy_path_walks_the_full_lifecycle() {
		let machine = machine();
		machine.store_order(&order("o-1")).await.unwrap();

		let o = machine
			.transition("o-1", OrderStatus::Dispatching, 0, TransitionEvidence::None)
			.await
			.unwrap();
		let o = machine
			.transition(
				"o-1",
				OrderStatus::Assigned,
				o.version,
				TransitionEvidence::AssignedFarmer("f-1".into()),
			)
			.await
			.unwrap();
		assert_eq!(o.assigned_farmer.as_deref(), Some("f-1"));

		let o = machine
			.transition("o-1", OrderStatus::InProgress, o.version, TransitionEvidence::None)
			.await
			.unwrap();
		let o = machine
			.transition("o-1", OrderStatus::Completed, o.version, TransitionEvidence::None)
			.await
			.unwrap();

		assert_eq!(o.status, OrderStatus::Completed);
		assert_eq!(o.history.len(), 4);
		assert_eq!(o.version, 4);
	}

	#[tokio::test]
	async fn invalid_edges_are_refused() {
		let machine = machine();
		machine.store_order(&order("o-1")).await.unwrap();

		// Pending -> Assigned skips dispatching.
		let result = machine
			.transition(
				"o-1",
				OrderStatus::Assigned,
				0,
				TransitionEvidence::AssignedFarmer("f-1".into()),
			)
			.await;
		assert!(matches!(result, Err(StateError::InvalidTransition { .. })));

		// Unassignable is reachable only from Dispatching.
		let result = machine
			.transition("o-1", OrderStatus::Unassignable, 0, TransitionEvidence::None)
			.await;
		assert!(matches!(result, Err(StateError::InvalidTransition { .. })));
	}

	#[tokio::test]
	async fn stale_version_is_refused() {
		let machine = machine();
		machine.store_order(&order("o-1")).await.unwrap();

		machine
			.transition("o-1", OrderStatus::Dispatching, 0, TransitionEvidence::None)
			.await
			.unwrap();

		// A second writer still holding version 0 must lose.
		let result = machine
			.transition("o-1", OrderStatus::Cancelled, 0, TransitionEvidence::Cancellation(
				"changed my mind".into(),
			))
			.await;
		assert!(matches!(
			result,
			Err(StateError::StaleOrder { expected: 0, actual: 1 })
		));
	}

	#[tokio::test]
	async fn assignment_requires_farmer_evidence() {
		let machine = machine();
		machine.store_order(&order("o-1")).await.unwrap();
		machine
			.transition("o-1", OrderStatus::Dispatching, 0, TransitionEvidence::None)
			.await
			.unwrap();

		let result = machine
			.transition("o-1", OrderStatus::Assigned, 1, TransitionEvidence::None)
			.await;
		assert!(matches!(result, Err(StateError::InvalidEvidence { .. })));
	}

	#[tokio::test]
	async fn terminal_states_accept_nothing() {
		let machine = machine();
		machine.store_order(&order("o-1")).await.unwrap();

		let o = machine
			.transition("o-1", OrderStatus::Cancelled, 0, TransitionEvidence::Cancellation(
				"no longer needed".into(),
			))
			.await
			.unwrap();

		let result = machine
			.transition("o-1", OrderStatus::Dispatching, o.version, TransitionEvidence::None)
			.await;
		assert!(matches!(result, Err(StateError::InvalidTransition { .. })));
	}

	#[tokio::test]
	async fn transitions_publish_state_change_records() {
		let machine = machine();
		let mut events = machine.event_bus.subscribe();
		machine.store_order(&order("o-1")).await.unwrap();

		machine
			.transition("o-1", OrderStatus::Dispatching, 0, TransitionEvidence::None)
			.await
			.unwrap();

		match events.recv().await.unwrap() {
			DispatchEvent::Order(OrderEvent::StateChanged { from, to, .. }) => {
				assert_eq!(from, OrderStatus::Pending);
				assert_eq!(to, OrderStatus::Dispatching);
			},
			other => panic!("unexpected event: {:?}", other),
		}
	}

	#[tokio::test]
	async fn record_attempt_bumps_counter_and_version() {
		let machine = machine();
		machine.store_order(&order("o-1")).await.unwrap();

		let o = machine.record_attempt("o-1", 0).await.unwrap();
		assert_eq!(o.attempts, 1);
		assert_eq!(o.version, 1);

		assert!(matches!(
			machine.record_attempt("o-1", 0).await,
			Err(StateError::StaleOrder { .. })
		));
	}
}
