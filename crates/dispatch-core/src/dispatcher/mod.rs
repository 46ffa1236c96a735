//! Sequential offer dispatcher.
//!
//! One actor task per order drives the offer protocol: pick the next
//! eligible candidate, open a time-bounded offer, and react to exactly one
//! of accept, reject or timeout. The actor's command queue is the
//! serialization point for everything that can happen to a dispatching
//! order, so accept, reject, timeout and cancellation all pass the same
//! guard and a late timer or replayed response can never resurrect a
//! closed attempt.

pub mod ledger;

use crate::engine::event_bus::EventBus;
use crate::state::{OrderStateMachine, StateError};
use dashmap::DashMap;
use dispatch_matching::{CandidateSelector, MatchError};
use dispatch_storage::{StorageError, StorageService};
use dispatch_types::{
	current_timestamp, truncate_id, DispatchEvent, OfferAttempt, OfferEvent, OfferOutcome, Order,
	OrderStatus, StorageKey, TransitionEvidence,
};
use ledger::{LedgerError, OfferLedger};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

/// Errors surfaced by the dispatcher and its command handles.
#[derive(Debug, Error)]
pub enum DispatchError {
	/// A response referred to an attempt that is no longer open: wrong
	/// farmer, wrong sequence, already closed, or the order left the
	/// dispatching phase. Refused with no side effect.
	#[error("Offer expired")]
	OfferExpired,
	/// The candidate sequence was empty or ran dry.
	#[error("No eligible candidates")]
	NoEligibleCandidates,
	#[error("State error: {0}")]
	State(#[from] StateError),
	#[error("Selection error: {0}")]
	Match(#[from] MatchError),
	#[error("Storage error: {0}")]
	Storage(#[from] StorageError),
	/// A violated protocol invariant. Fatal for the order's dispatcher;
	/// logged and surfaced, never silently reconciled.
	#[error("Protocol invariant violated: {0}")]
	Invariant(#[from] LedgerError),
}

/// Tunables of the offer protocol.
#[derive(Debug, Clone)]
pub struct DispatcherSettings {
	/// How long one offer stays open.
	pub offer_expiry: Duration,
}

/// Commands routed into an order's dispatcher actor.
enum OfferCommand {
	Accept {
		farmer: String,
		attempt: Option<u32>,
		reply: oneshot::Sender<Result<(), DispatchError>>,
	},
	Reject {
		farmer: String,
		attempt: Option<u32>,
		reply: oneshot::Sender<Result<(), DispatchError>>,
	},
	Cancel {
		reason: String,
		reply: oneshot::Sender<Result<(), DispatchError>>,
	},
}

/// Handle for sending commands to one order's dispatcher actor.
///
/// A handle whose actor has already finished reports `OfferExpired` for
/// responses: the offer the caller is answering no longer exists.
#[derive(Clone)]
pub struct DispatcherHandle {
	tx: mpsc::Sender<OfferCommand>,
}

impl DispatcherHandle {
	/// Delivers a farmer's accept for the currently open attempt.
	pub async fn accept(&self, farmer: &str, attempt: Option<u32>) -> Result<(), DispatchError> {
		self.send_response(|reply| OfferCommand::Accept {
			farmer: farmer.to_string(),
			attempt,
			reply,
		})
		.await
	}

	/// Delivers a farmer's reject for the currently open attempt.
	pub async fn reject(&self, farmer: &str, attempt: Option<u32>) -> Result<(), DispatchError> {
		self.send_response(|reply| OfferCommand::Reject {
			farmer: farmer.to_string(),
			attempt,
			reply,
		})
		.await
	}

	/// Delivers the creator's cancellation.
	///
	/// Returns `OfferExpired` when the actor is already gone; the caller
	/// then cancels through the state machine directly.
	pub async fn cancel(&self, reason: &str) -> Result<(), DispatchError> {
		self.send_response(|reply| OfferCommand::Cancel {
			reason: reason.to_string(),
			reply,
		})
		.await
	}

	async fn send_response<F>(&self, build: F) -> Result<(), DispatchError>
	where
		F: FnOnce(oneshot::Sender<Result<(), DispatchError>>) -> OfferCommand,
	{
		let (reply_tx, reply_rx) = oneshot::channel();
		self.tx
			.send(build(reply_tx))
			.await
			.map_err(|_| DispatchError::OfferExpired)?;
		reply_rx.await.map_err(|_| DispatchError::OfferExpired)?
	}
}

/// Registry of running dispatcher actors, keyed by order id.
pub type DispatcherRegistry = Arc<DashMap<String, DispatcherHandle>>;

/// How one waiting period around an open attempt resolved.
enum Resolution {
	Accepted { farmer: String },
	Rejected { farmer: String },
	TimedOut,
	Cancelled { reason: String },
	/// The engine dropped the command channel (shutdown). The order is
	/// left in Dispatching for startup recovery to resume.
	Shutdown,
}

/// Drives the offer protocol for orders, one spawned actor per order.
pub struct SequentialDispatcher {
	state_machine: Arc<OrderStateMachine>,
	selector: Arc<CandidateSelector>,
	storage: Arc<StorageService>,
	event_bus: EventBus,
	settings: DispatcherSettings,
}

impl SequentialDispatcher {
	pub fn new(
		state_machine: Arc<OrderStateMachine>,
		selector: Arc<CandidateSelector>,
		storage: Arc<StorageService>,
		event_bus: EventBus,
		settings: DispatcherSettings,
	) -> Self {
		Self {
			state_machine,
			selector,
			storage,
			event_bus,
			settings,
		}
	}

	/// Spawns the dispatcher actor for an order and registers its handle.
	///
	/// Returns false when a dispatcher for this order is already running
	/// (duplicate `OrderCreated` delivery, or a recovery racing a live
	/// actor); the existing actor keeps the order.
	pub fn spawn(self: &Arc<Self>, order: Order, registry: DispatcherRegistry) -> bool {
		use dashmap::mapref::entry::Entry;

		let order_id = order.id.clone();
		let (tx, rx) = mpsc::channel(32);
		match registry.entry(order_id.clone()) {
			Entry::Occupied(_) => {
				tracing::debug!(
					order_id = %truncate_id(&order_id),
					"Dispatcher already running, ignoring duplicate start"
				);
				return false;
			},
			Entry::Vacant(vacant) => {
				vacant.insert(DispatcherHandle { tx });
			},
		}

		let dispatcher = self.clone();
		let registry = registry.clone();
		tokio::spawn(async move {
			if let Err(e) = dispatcher.run(order, rx).await {
				tracing::error!(
					order_id = %truncate_id(&order_id),
					error = %e,
					"Dispatcher failed"
				);
			}
			registry.remove(&order_id);
		});
		true
	}

	/// The actor body: offer to candidates one at a time until one
	/// accepts, the sequence runs dry, or the order is cancelled.
	async fn run(
		&self,
		order: Order,
		mut rx: mpsc::Receiver<OfferCommand>,
	) -> Result<(), DispatchError> {
		let order_id = order.id.clone();

		// A recovered order is already Dispatching; a fresh one starts
		// its dispatch cycle here.
		let mut current = if order.status == OrderStatus::Pending {
			self.state_machine
				.transition(
					&order_id,
					OrderStatus::Dispatching,
					order.version,
					TransitionEvidence::None,
				)
				.await?
		} else {
			order
		};

		let mut ledger = self.restore_ledger(&order_id).await?;
		let mut stream = self.selector.candidates(&current).await?;

		loop {
			// Commands queued while no offer was open: a cancellation
			// takes effect before the next offer opens, stale responses
			// are refused.
			if let Some(resolution) = self.drain_idle_commands(&mut rx) {
				match resolution {
					Resolution::Cancelled { reason } => {
						return self.cancel_order(&order_id, &current, None, &reason).await;
					},
					Resolution::Shutdown => return Ok(()),
					_ => unreachable!("idle drain only yields cancel or shutdown"),
				}
			}

			let excluded: HashSet<String> = ledger.tried_farmers();
			let candidate = match stream.next_eligible(&excluded).await {
				Some(candidate) => candidate,
				None => {
					tracing::info!(
						order_id = %truncate_id(&order_id),
						attempts = current.attempts,
						"Candidate sequence exhausted, order unassignable"
					);
					self.state_machine
						.transition(
							&order_id,
							OrderStatus::Unassignable,
							current.version,
							TransitionEvidence::None,
						)
						.await?;
					return Ok(());
				},
			};

			// Open the next attempt.
			current = self
				.state_machine
				.record_attempt(&order_id, current.version)
				.await?;
			let sequence = current.attempts;
			let opened_at = current_timestamp();
			let expires_at = opened_at + self.settings.offer_expiry.as_secs();
			let attempt = ledger
				.open(sequence, candidate.farmer.clone(), opened_at, expires_at)?
				.clone();
			self.persist_attempt(&attempt).await?;

			self.event_bus
				.publish(DispatchEvent::Offer(OfferEvent::Opened {
					order_id: order_id.clone(),
					farmer: candidate.farmer.clone(),
					attempt: sequence,
					expires_at,
				}))
				.ok();
			tracing::info!(
				order_id = %truncate_id(&order_id),
				farmer = %candidate.farmer,
				attempt = sequence,
				"Offer opened"
			);

			let deadline = Instant::now() + self.settings.offer_expiry;
			let resolution = self
				.await_resolution(&mut rx, &candidate.farmer, sequence, deadline)
				.await;

			match resolution {
				Resolution::Accepted { farmer } => {
					self.close_attempt(&mut ledger, sequence, OfferOutcome::Accepted)
						.await?;
					self.state_machine
						.transition(
							&order_id,
							OrderStatus::Assigned,
							current.version,
							TransitionEvidence::AssignedFarmer(farmer),
						)
						.await?;
					return Ok(());
				},
				Resolution::Rejected { farmer } => {
					tracing::info!(
						order_id = %truncate_id(&order_id),
						farmer = %farmer,
						attempt = sequence,
						"Offer rejected, advancing"
					);
					self.close_attempt(&mut ledger, sequence, OfferOutcome::Rejected)
						.await?;
				},
				Resolution::TimedOut => {
					tracing::info!(
						order_id = %truncate_id(&order_id),
						farmer = %candidate.farmer,
						attempt = sequence,
						"Offer expired unanswered, advancing"
					);
					self.close_attempt(&mut ledger, sequence, OfferOutcome::Expired)
						.await?;
				},
				Resolution::Cancelled { reason } => {
					return self
						.cancel_order(&order_id, &current, Some((&mut ledger, sequence)), &reason)
						.await;
				},
				Resolution::Shutdown => return Ok(()),
			}
		}
	}

	/// Waits for the open attempt to resolve: a matching response from
	/// the offered farmer, the expiry timer, or a cancellation. Responses
	/// for anything but the open attempt are refused with `OfferExpired`
	/// and do not close it.
	async fn await_resolution(
		&self,
		rx: &mut mpsc::Receiver<OfferCommand>,
		offered_farmer: &str,
		sequence: u32,
		deadline: Instant,
	) -> Resolution {
		loop {
			tokio::select! {
				command = rx.recv() => match command {
					Some(OfferCommand::Accept { farmer, attempt, reply }) => {
						if farmer == offered_farmer && attempt.map_or(true, |a| a == sequence) {
							let _ = reply.send(Ok(()));
							return Resolution::Accepted { farmer };
						}
						let _ = reply.send(Err(DispatchError::OfferExpired));
					},
					Some(OfferCommand::Reject { farmer, attempt, reply }) => {
						if farmer == offered_farmer && attempt.map_or(true, |a| a == sequence) {
							let _ = reply.send(Ok(()));
							return Resolution::Rejected { farmer };
						}
						let _ = reply.send(Err(DispatchError::OfferExpired));
					},
					Some(OfferCommand::Cancel { reason, reply }) => {
						let _ = reply.send(Ok(()));
						return Resolution::Cancelled { reason };
					},
					None => return Resolution::Shutdown,
				},
				_ = tokio::time::sleep_until(deadline) => {
					return Resolution::TimedOut;
				},
			}
		}
	}

	/// Handles commands that arrived while no attempt was open.
	fn drain_idle_commands(&self, rx: &mut mpsc::Receiver<OfferCommand>) -> Option<Resolution> {
		loop {
			match rx.try_recv() {
				Ok(OfferCommand::Cancel { reason, reply }) => {
					let _ = reply.send(Ok(()));
					return Some(Resolution::Cancelled { reason });
				},
				Ok(OfferCommand::Accept { reply, .. }) | Ok(OfferCommand::Reject { reply, .. }) => {
					let _ = reply.send(Err(DispatchError::OfferExpired));
				},
				Err(mpsc::error::TryRecvError::Empty) => return None,
				Err(mpsc::error::TryRecvError::Disconnected) => return Some(Resolution::Shutdown),
			}
		}
	}

	/// Cancels the order, invalidating the open attempt if one exists.
	async fn cancel_order(
		&self,
		order_id: &str,
		current: &Order,
		open_attempt: Option<(&mut OfferLedger, u32)>,
		reason: &str,
	) -> Result<(), DispatchError> {
		if let Some((ledger, sequence)) = open_attempt {
			self.close_attempt(ledger, sequence, OfferOutcome::Expired)
				.await?;
		}
		self.state_machine
			.transition(
				order_id,
				OrderStatus::Cancelled,
				current.version,
				TransitionEvidence::Cancellation(reason.to_string()),
			)
			.await?;
		tracing::info!(
			order_id = %truncate_id(order_id),
			reason = %reason,
			"Order cancelled during dispatch"
		);
		Ok(())
	}

	/// Finalizes an attempt in the ledger, persists it, and records the
	/// closure on the event bus.
	async fn close_attempt(
		&self,
		ledger: &mut OfferLedger,
		sequence: u32,
		outcome: OfferOutcome,
	) -> Result<(), DispatchError> {
		let attempt = ledger.finalize(sequence, outcome)?.clone();
		self.persist_attempt(&attempt).await?;
		self.event_bus
			.publish(DispatchEvent::Offer(OfferEvent::Closed {
				order_id: attempt.order_id.clone(),
				farmer: attempt.farmer.clone(),
				attempt: sequence,
				outcome,
			}))
			.ok();
		Ok(())
	}

	async fn persist_attempt(&self, attempt: &OfferAttempt) -> Result<(), StorageError> {
		self.storage
			.store(
				StorageKey::OfferAttempts.as_str(),
				&attempt.storage_id(),
				attempt,
			)
			.await
	}

	/// Rebuilds the attempt ledger from storage.
	///
	/// An attempt left pending by a crash is finalized as expired first:
	/// the offer died with the process, and its farmer must not receive
	/// a second one.
	async fn restore_ledger(&self, order_id: &str) -> Result<OfferLedger, DispatchError> {
		let namespace = StorageKey::OfferAttempts.as_str();
		// Backends that sanitize separators hand ids back with the
		// separator flattened; match both spellings.
		let prefixes = [format!("{}:", order_id), format!("{}_", order_id)];

		let mut attempts = Vec::new();
		for id in self.storage.ids(namespace).await? {
			if !prefixes.iter().any(|p| id.starts_with(p.as_str())) {
				continue;
			}
			let mut attempt: OfferAttempt = self.storage.retrieve(namespace, &id).await?;
			if attempt.outcome == OfferOutcome::Pending {
				attempt.outcome = OfferOutcome::Expired;
				self.storage.store(namespace, &id, &attempt).await?;
				tracing::warn!(
					order_id = %truncate_id(order_id),
					attempt = attempt.sequence,
					"Expired attempt left pending by a previous run"
				);
			}
			attempts.push(attempt);
		}

		Ok(OfferLedger::from_attempts(order_id, attempts))
	}
}
