//! Response handler routing farmer replies and creator cancellations to
//! the order's dispatcher actor.

use crate::dispatcher::{DispatchError, DispatcherRegistry};
use crate::state::OrderStateMachine;
use dispatch_types::{
	truncate_id, BusEnvelope, CancelPayload, OfferResponsePayload, OrderStatus,
	TransitionEvidence,
};
use std::sync::Arc;
use thiserror::Error;
use tracing::instrument;

/// Errors that can occur during response handling.
#[derive(Debug, Error)]
pub enum ResponseHandlerError {
	#[error("Malformed payload: {0}")]
	Malformed(String),
	#[error("State error: {0}")]
	State(String),
}

/// Routes accept/reject/cancel commands to dispatcher actors.
pub struct ResponseHandler {
	registry: DispatcherRegistry,
	state_machine: Arc<OrderStateMachine>,
}

impl ResponseHandler {
	pub fn new(registry: DispatcherRegistry, state_machine: Arc<OrderStateMachine>) -> Self {
		Self {
			registry,
			state_machine,
		}
	}

	/// Handles a farmer's accept or reject.
	///
	/// A response for an order with no running dispatcher, or one the
	/// dispatcher refuses, is a stale answer to a closed offer: logged
	/// and dropped with no side effect.
	#[instrument(skip_all, fields(order_id = %truncate_id(&envelope.subject), accept))]
	pub async fn handle_offer_response(
		&self,
		envelope: &BusEnvelope,
		accept: bool,
	) -> Result<(), ResponseHandlerError> {
		let payload: OfferResponsePayload = envelope
			.decode()
			.map_err(|e| ResponseHandlerError::Malformed(e.to_string()))?;

		let handle = match self.registry.get(&payload.order_id) {
			Some(handle) => handle.value().clone(),
			None => {
				tracing::warn!(
					farmer = %payload.farmer,
					"Response for an order that is not dispatching, refusing as expired"
				);
				return Ok(());
			},
		};

		let result = if accept {
			handle.accept(&payload.farmer, payload.attempt).await
		} else {
			handle.reject(&payload.farmer, payload.attempt).await
		};

		match result {
			Ok(()) => Ok(()),
			Err(DispatchError::OfferExpired) => {
				tracing::warn!(
					farmer = %payload.farmer,
					"Stale response refused, offer already closed"
				);
				Ok(())
			},
			Err(e) => Err(ResponseHandlerError::State(e.to_string())),
		}
	}

	/// Handles the creator cancelling an order.
	///
	/// A dispatching order is cancelled through its actor so the guard is
	/// shared with accept/reject/timeout; otherwise the state machine
	/// cancels directly (refusing terminal states).
	#[instrument(skip_all, fields(order_id = %truncate_id(&envelope.subject)))]
	pub async fn handle_cancelled(&self, envelope: &BusEnvelope) -> Result<(), ResponseHandlerError> {
		let payload: CancelPayload = envelope
			.decode()
			.map_err(|e| ResponseHandlerError::Malformed(e.to_string()))?;

		if let Some(handle) = self.registry.get(&payload.order_id).map(|h| h.value().clone()) {
			match handle.cancel(&payload.reason).await {
				Ok(()) => return Ok(()),
				// The actor finished between lookup and delivery; fall
				// through to the direct path.
				Err(DispatchError::OfferExpired) => {},
				Err(e) => return Err(ResponseHandlerError::State(e.to_string())),
			}
		}

		let order = self
			.state_machine
			.get_order(&payload.order_id)
			.await
			.map_err(|e| ResponseHandlerError::State(e.to_string()))?;

		if order.status.is_terminal() {
			tracing::warn!(status = %order.status, "Cancellation of a terminal order refused");
			return Ok(());
		}

		self.state_machine
			.transition(
				&payload.order_id,
				OrderStatus::Cancelled,
				order.version,
				TransitionEvidence::Cancellation(payload.reason),
			)
			.await
			.map_err(|e| ResponseHandlerError::State(e.to_string()))?;
		Ok(())
	}
}
