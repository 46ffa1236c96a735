//! Recovery module for resuming dispatch after unexpected exits.
//!
//! Orders stranded in Pending or Dispatching by a crash are picked up from
//! the order store at startup and handed back to the dispatcher. Attempts
//! left pending die with the process (the dispatcher expires them while
//! rebuilding its ledger), and at-least-once publishing absorbs any
//! notification that was lost in flight.

use crate::dispatcher::{DispatcherRegistry, SequentialDispatcher};
use dispatch_storage::OrderStore;
use dispatch_types::truncate_id;
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur during recovery operations.
#[derive(Debug, Error)]
pub enum RecoveryError {
	#[error("Storage error: {0}")]
	Storage(String),
}

/// Report of the recovery operation.
#[derive(Debug, Default)]
pub struct RecoveryReport {
	/// Orders found stranded before assignment.
	pub stranded: usize,
	/// Dispatchers actually re-spawned (stranded minus already running).
	pub resumed: usize,
}

/// Service responsible for resuming stranded orders at startup.
pub struct RecoveryService {
	orders: Arc<OrderStore>,
	dispatcher: Arc<SequentialDispatcher>,
	registry: DispatcherRegistry,
}

impl RecoveryService {
	pub fn new(
		orders: Arc<OrderStore>,
		dispatcher: Arc<SequentialDispatcher>,
		registry: DispatcherRegistry,
	) -> Self {
		Self {
			orders,
			dispatcher,
			registry,
		}
	}

	/// Re-spawns dispatchers for every order stranded before assignment.
	pub async fn resume(&self) -> Result<RecoveryReport, RecoveryError> {
		let stranded = self
			.orders
			.find_pending_unassigned()
			.await
			.map_err(|e| RecoveryError::Storage(e.to_string()))?;

		let mut report = RecoveryReport {
			stranded: stranded.len(),
			..Default::default()
		};

		for order in stranded {
			let order_id = order.id.clone();
			if self.dispatcher.spawn(order, self.registry.clone()) {
				tracing::info!(
					order_id = %truncate_id(&order_id),
					"Resumed dispatch for stranded order"
				);
				report.resumed += 1;
			}
		}

		if report.stranded > 0 {
			tracing::info!(
				stranded = report.stranded,
				resumed = report.resumed,
				"Recovery pass finished"
			);
		}

		Ok(report)
	}
}
