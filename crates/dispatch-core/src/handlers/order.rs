//! Order handler for creation intake and job progress events.

use crate::dispatcher::{DispatcherRegistry, SequentialDispatcher};
use crate::state::{OrderStateMachine, StateError};
use dispatch_types::{
	truncate_id, BusEnvelope, JobPayload, OrderCreatedPayload, OrderStatus, TransitionEvidence,
};
use std::sync::Arc;
use thiserror::Error;
use tracing::instrument;

/// Errors that can occur during order event handling.
#[derive(Debug, Error)]
pub enum OrderHandlerError {
	#[error("Malformed payload: {0}")]
	Malformed(String),
	#[error("State error: {0}")]
	State(String),
	/// The command came from an identity that does not own the order's
	/// assignment. Refused.
	#[error("Identity mismatch: {0}")]
	Identity(String),
}

/// Handles order creation and the assigned farmer's job progress.
pub struct OrderHandler {
	state_machine: Arc<OrderStateMachine>,
	dispatcher: Arc<SequentialDispatcher>,
	registry: DispatcherRegistry,
}

impl OrderHandler {
	pub fn new(
		state_machine: Arc<OrderStateMachine>,
		dispatcher: Arc<SequentialDispatcher>,
		registry: DispatcherRegistry,
	) -> Self {
		Self {
			state_machine,
			dispatcher,
			registry,
		}
	}

	/// Handles a newly created order: persist it and start its dispatch
	/// cycle. Duplicate deliveries of the same order id are ignored.
	#[instrument(skip_all, fields(order_id = %truncate_id(&envelope.subject)))]
	pub async fn handle_created(&self, envelope: &BusEnvelope) -> Result<(), OrderHandlerError> {
		let payload: OrderCreatedPayload = envelope
			.decode()
			.map_err(|e| OrderHandlerError::Malformed(e.to_string()))?;
		let order = payload.order;

		match self.state_machine.get_order(&order.id).await {
			Ok(_) => {
				tracing::debug!("Order already known, ignoring duplicate creation");
				return Ok(());
			},
			Err(StateError::OrderNotFound(_)) => {},
			Err(e) => return Err(OrderHandlerError::State(e.to_string())),
		}

		self.state_machine
			.store_order(&order)
			.await
			.map_err(|e| OrderHandlerError::State(e.to_string()))?;
		tracing::info!("Order stored, starting dispatch");

		self.dispatcher.spawn(order, self.registry.clone());
		Ok(())
	}

	/// Handles the assigned farmer starting the job.
	#[instrument(skip_all, fields(order_id = %truncate_id(&envelope.subject)))]
	pub async fn handle_job_started(&self, envelope: &BusEnvelope) -> Result<(), OrderHandlerError> {
		self.progress(envelope, OrderStatus::InProgress).await
	}

	/// Handles the assigned farmer completing the job.
	#[instrument(skip_all, fields(order_id = %truncate_id(&envelope.subject)))]
	pub async fn handle_job_completed(
		&self,
		envelope: &BusEnvelope,
	) -> Result<(), OrderHandlerError> {
		self.progress(envelope, OrderStatus::Completed).await
	}

	/// Shared guard for job progress: only the assigned farmer may move
	/// the order forward.
	async fn progress(
		&self,
		envelope: &BusEnvelope,
		to: OrderStatus,
	) -> Result<(), OrderHandlerError> {
		let payload: JobPayload = envelope
			.decode()
			.map_err(|e| OrderHandlerError::Malformed(e.to_string()))?;

		let order = self
			.state_machine
			.get_order(&payload.order_id)
			.await
			.map_err(|e| OrderHandlerError::State(e.to_string()))?;

		if order.assigned_farmer.as_deref() != Some(payload.farmer.as_str()) {
			tracing::warn!(
				farmer = %payload.farmer,
				"Job progress from a farmer the order is not assigned to, refusing"
			);
			return Err(OrderHandlerError::Identity(payload.farmer));
		}

		self.state_machine
			.transition(&payload.order_id, to, order.version, TransitionEvidence::None)
			.await
			.map_err(|e| OrderHandlerError::State(e.to_string()))?;
		Ok(())
	}
}
