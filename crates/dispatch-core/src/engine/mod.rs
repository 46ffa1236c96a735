//! Core dispatch engine that wires the components together.
//!
//! This module contains the main DispatchEngine struct which owns the
//! event loop: inbound bus envelopes are routed to the presence, order and
//! response handlers; internal state-change records are pumped to the
//! notify service; parked notifications are re-flushed on an interval; and
//! ctrl-c shuts everything down.

pub mod event_bus;

use crate::dispatcher::{DispatcherRegistry, DispatcherSettings, SequentialDispatcher};
use crate::handlers::{OrderHandler, PresenceHandler, ResponseHandler};
use crate::recovery::RecoveryService;
use crate::state::OrderStateMachine;
use dashmap::DashMap;
use dispatch_config::Config;
use dispatch_ingest::IngestService;
use dispatch_matching::{
	CandidateSelector, FarmerDirectory, PresenceRetryPolicy, RankingPolicy,
};
use dispatch_notify::NotifyService;
use dispatch_presence::PresenceRegistry;
use dispatch_storage::{OrderStore, StorageService};
use dispatch_types::{BusEnvelope, EventKind};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors that can occur during engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
	#[error("Configuration error: {0}")]
	Config(String),
	#[error("Service error: {0}")]
	Service(String),
}

/// Main dispatch engine orchestrating the order lifecycle.
pub struct DispatchEngine {
	/// Engine configuration.
	config: Config,
	/// Storage service for persisting state.
	storage: Arc<StorageService>,
	/// Presence registry fed by the ingest stream.
	presence: Arc<PresenceRegistry>,
	/// Inbound bus adapters.
	ingest: Arc<IngestService>,
	/// Outbound notification service.
	notify: Arc<NotifyService>,
	/// Internal event bus.
	event_bus: event_bus::EventBus,
	/// Running dispatcher actors by order id.
	registry: DispatcherRegistry,
	/// Handlers for the inbound event kinds.
	presence_handler: PresenceHandler,
	order_handler: OrderHandler,
	response_handler: ResponseHandler,
	/// Startup recovery of stranded orders.
	recovery: RecoveryService,
}

impl DispatchEngine {
	/// Wires up an engine from its collaborator services.
	///
	/// The farmer directory, storage backend and bus adapters are
	/// injected; everything else (state machine, selector, dispatcher,
	/// handlers, recovery) is constructed here.
	pub fn new(
		config: Config,
		storage: Arc<StorageService>,
		directory: Arc<dyn FarmerDirectory>,
		presence: Arc<PresenceRegistry>,
		ingest: Arc<IngestService>,
		notify: Arc<NotifyService>,
	) -> Self {
		let event_bus = event_bus::EventBus::new(1000);
		let registry: DispatcherRegistry = Arc::new(DashMap::new());

		let state_machine = Arc::new(OrderStateMachine::new(storage.clone(), event_bus.clone()));
		let selector = Arc::new(CandidateSelector::new(
			directory,
			presence.clone(),
			RankingPolicy {
				search_radius_km: config.matching.search_radius_km,
				distance_bucket_km: config.matching.distance_bucket_km,
			},
			PresenceRetryPolicy {
				max_tries: config.dispatch.presence_retry.max_tries,
				initial_backoff: Duration::from_millis(
					config.dispatch.presence_retry.initial_backoff_ms,
				),
			},
		));
		let dispatcher = Arc::new(SequentialDispatcher::new(
			state_machine.clone(),
			selector,
			storage.clone(),
			event_bus.clone(),
			DispatcherSettings {
				offer_expiry: Duration::from_secs(config.dispatch.offer_expiry_secs),
			},
		));

		let orders = Arc::new(OrderStore::new(storage.clone()));
		let recovery = RecoveryService::new(orders, dispatcher.clone(), registry.clone());

		let presence_handler = PresenceHandler::new(presence.clone());
		let order_handler =
			OrderHandler::new(state_machine.clone(), dispatcher.clone(), registry.clone());
		let response_handler = ResponseHandler::new(registry.clone(), state_machine);

		Self {
			config,
			storage,
			presence,
			ingest,
			notify,
			event_bus,
			registry,
			presence_handler,
			order_handler,
			response_handler,
			recovery,
		}
	}

	/// Main execution loop for the dispatch engine.
	///
	/// This method:
	/// 1. Starts the inbound bus consumers
	/// 2. Resumes orders stranded by a previous run
	/// 3. Routes envelopes, pumps notifications, flushes parked ones
	/// 4. Handles graceful shutdown on ctrl-c
	pub async fn run(&self) -> Result<(), EngineError> {
		let (envelope_tx, mut envelope_rx) = mpsc::unbounded_channel();
		self.ingest
			.start_all(envelope_tx)
			.await
			.map_err(|e| EngineError::Service(e.to_string()))?;

		let mut event_rx = self.event_bus.subscribe();

		self.recovery
			.resume()
			.await
			.map_err(|e| EngineError::Service(e.to_string()))?;

		let mut flush_interval = tokio::time::interval(Duration::from_secs(
			self.config.notify.flush_interval_secs,
		));

		loop {
			tokio::select! {
				Some(envelope) = envelope_rx.recv() => {
					self.route(envelope).await;
				}

				Ok(event) = event_rx.recv() => {
					if let Err(e) = self.notify.publish_event(&event).await {
						tracing::error!(error = %e, "Failed to publish notification");
					}
				}

				_ = flush_interval.tick() => {
					let flushed = self.notify.flush_parked().await;
					if flushed > 0 {
						tracing::debug!(flushed, "Re-delivered parked notifications");
					}
				}

				// Shutdown signal
				_ = tokio::signal::ctrl_c() => {
					break;
				}
			}
		}

		// Cleanup
		self.ingest
			.stop_all()
			.await
			.map_err(|e| EngineError::Service(e.to_string()))?;

		Ok(())
	}

	/// Routes one inbound envelope to its handler.
	///
	/// Handler failures are logged, never fatal for the loop: a malformed
	/// or stale event must not take the engine down.
	async fn route(&self, envelope: BusEnvelope) {
		match envelope.kind {
			EventKind::FarmerOnline
			| EventKind::FarmerOffline
			| EventKind::Heartbeat
			| EventKind::SessionExpired => {
				if let Err(e) = self.presence_handler.handle(&envelope) {
					tracing::warn!(error = %e, "Presence event refused");
				}
			},
			EventKind::OrderCreated => {
				if let Err(e) = self.order_handler.handle_created(&envelope).await {
					tracing::error!(error = %e, "Order creation failed");
				}
			},
			EventKind::OfferAccepted => {
				if let Err(e) = self
					.response_handler
					.handle_offer_response(&envelope, true)
					.await
				{
					tracing::error!(error = %e, "Accept handling failed");
				}
			},
			EventKind::OfferRejected => {
				if let Err(e) = self
					.response_handler
					.handle_offer_response(&envelope, false)
					.await
				{
					tracing::error!(error = %e, "Reject handling failed");
				}
			},
			EventKind::OrderCancelled => {
				if let Err(e) = self.response_handler.handle_cancelled(&envelope).await {
					tracing::error!(error = %e, "Cancellation handling failed");
				}
			},
			EventKind::JobStarted => {
				if let Err(e) = self.order_handler.handle_job_started(&envelope).await {
					tracing::warn!(error = %e, "Job start refused");
				}
			},
			EventKind::JobCompleted => {
				if let Err(e) = self.order_handler.handle_job_completed(&envelope).await {
					tracing::warn!(error = %e, "Job completion refused");
				}
			},
			// Notifications this engine itself published on the orders
			// topic come back through the consumer; nothing to do.
			EventKind::OfferOpened
			| EventKind::OrderAssigned
			| EventKind::OrderUnassignable
			| EventKind::OrderStateChanged => {},
		}
	}

	/// Returns a reference to the internal event bus.
	pub fn event_bus(&self) -> &event_bus::EventBus {
		&self.event_bus
	}

	/// Returns a reference to the configuration.
	pub fn config(&self) -> &Config {
		&self.config
	}

	/// Returns a reference to the storage service.
	pub fn storage(&self) -> &Arc<StorageService> {
		&self.storage
	}

	/// Returns a reference to the presence registry.
	pub fn presence(&self) -> &Arc<PresenceRegistry> {
		&self.presence
	}

	/// Returns the registry of running dispatcher actors.
	pub fn dispatchers(&self) -> &DispatcherRegistry {
		&self.registry
	}
}
