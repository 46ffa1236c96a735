//! End-to-end scenarios for the sequential offer protocol.
//!
//! These tests drive the dispatcher actor against real storage, a real
//! presence registry and a fixed farmer directory, with tokio's paused
//! clock standing in for the offer expiry timer.

use async_trait::async_trait;
use dispatch_core::engine::event_bus::EventBus;
use dispatch_core::dispatcher::DispatcherRegistry;
use dispatch_core::{
	DispatchError, DispatcherSettings, OrderStateMachine, SequentialDispatcher,
};
use dispatch_matching::{
	CandidateSelector, FarmerDirectory, MatchError, PresenceRetryPolicy, RankingPolicy,
};
use dispatch_presence::PresenceRegistry;
use dispatch_storage::implementations::memory::MemoryStorage;
use dispatch_storage::StorageService;
use dispatch_types::{
	DispatchEvent, FarmerProfile, Location, OfferAttempt, OfferEvent, OfferOutcome, Order,
	OrderEvent, OrderStatus, PresenceEvent, PresenceEventKind, PrintSpec, StorageKey,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

struct FixedDirectory(Vec<FarmerProfile>);

#[async_trait]
impl FarmerDirectory for FixedDirectory {
	async fn farmers(&self) -> Result<Vec<FarmerProfile>, MatchError> {
		Ok(self.0.clone())
	}
}

struct Harness {
	storage: Arc<StorageService>,
	state_machine: Arc<OrderStateMachine>,
	dispatcher: Arc<SequentialDispatcher>,
	registry: DispatcherRegistry,
	presence: Arc<PresenceRegistry>,
	events: broadcast::Receiver<DispatchEvent>,
}

fn harness(farmers: Vec<FarmerProfile>) -> Harness {
	let storage = Arc::new(StorageService::new(Box::new(MemoryStorage::new())));
	let event_bus = EventBus::new(256);
	let events = event_bus.subscribe();
	let presence = Arc::new(PresenceRegistry::new());
	let state_machine = Arc::new(OrderStateMachine::new(storage.clone(), event_bus.clone()));

	let selector = Arc::new(CandidateSelector::new(
		Arc::new(FixedDirectory(farmers)),
		presence.clone(),
		RankingPolicy {
			search_radius_km: 50.0,
			distance_bucket_km: 10.0,
		},
		PresenceRetryPolicy {
			max_tries: 3,
			initial_backoff: Duration::from_millis(10),
		},
	));

	let dispatcher = Arc::new(SequentialDispatcher::new(
		state_machine.clone(),
		selector,
		storage.clone(),
		event_bus,
		DispatcherSettings {
			offer_expiry: Duration::from_secs(120),
		},
	));

	Harness {
		storage,
		state_machine,
		dispatcher,
		registry: Arc::new(dashmap::DashMap::new()),
		presence,
		events,
	}
}

fn farmer(id: &str, reliability: f64) -> FarmerProfile {
	FarmerProfile {
		id: id.into(),
		city: "Paris".into(),
		lat: 48.86,
		lon: 2.34,
		materials: vec!["PLA".into()],
		modes: vec!["quality".into()],
		reliability,
		has_capacity: true,
	}
}

fn paris_order(id: &str) -> Order {
	Order::new(
		id.to_string(),
		"creator-1".into(),
		Location {
			city: "Paris".into(),
			lat: 48.8566,
			lon: 2.3522,
		},
		PrintSpec {
			material: "PLA".into(),
			mode: "quality".into(),
			file_keys: vec![format!("files/{}/model.stl", id)],
			estimated_minutes: 90,
			cost: 24.0,
		},
		1_700_000_000,
	)
}

/// Persists a fresh order and starts its dispatch cycle, mirroring the
/// production intake path (`OrderHandler::handle_created` stores the order
/// before spawning its actor). The dispatcher's `run` reads the order back
/// from storage on its first transition, so the store is a precondition.
async fn spawn_fresh(h: &Harness, order: Order) -> bool {
	h.state_machine.store_order(&order).await.unwrap();
	h.dispatcher.spawn(order, h.registry.clone())
}

fn login(presence: &PresenceRegistry, farmer: &str) {
	presence.apply(&PresenceEvent {
		farmer: farmer.into(),
		kind: PresenceEventKind::Login,
		timestamp: 1,
		busy: None,
	});
}

async fn next_opened(events: &mut broadcast::Receiver<DispatchEvent>) -> (String, u32) {
	loop {
		match events.recv().await.expect("event bus open") {
			DispatchEvent::Offer(OfferEvent::Opened {
				farmer, attempt, ..
			}) => return (farmer, attempt),
			_ => continue,
		}
	}
}

async fn wait_for_status(
	events: &mut broadcast::Receiver<DispatchEvent>,
	status: OrderStatus,
) -> OrderEvent {
	loop {
		match events.recv().await.expect("event bus open") {
			DispatchEvent::Order(event) => {
				let OrderEvent::StateChanged { to, .. } = &event;
				if *to == status {
					return event;
				}
			},
			_ => continue,
		}
	}
}

async fn stored_attempts(storage: &StorageService, order_id: &str) -> Vec<OfferAttempt> {
	let namespace = StorageKey::OfferAttempts.as_str();
	let prefix = format!("{}:", order_id);
	let mut attempts = Vec::new();
	for id in storage.ids(namespace).await.unwrap() {
		if id.starts_with(&prefix) {
			attempts.push(storage.retrieve::<OfferAttempt>(namespace, &id).await.unwrap());
		}
	}
	attempts.sort_by_key(|a| a.sequence);
	attempts
}

/// Scenario A: the top candidate lets the offer expire, the runner-up
/// accepts. Two attempts recorded: expired, then accepted.
#[tokio::test(start_paused = true)]
async fn timeout_falls_back_to_next_candidate() {
	let mut h = harness(vec![farmer("f-1", 0.95), farmer("f-2", 0.90)]);
	login(&h.presence, "f-1");
	login(&h.presence, "f-2");

	assert!(spawn_fresh(&h, paris_order("o-1")).await);

	let (first, seq1) = next_opened(&mut h.events).await;
	assert_eq!(first, "f-1");
	assert_eq!(seq1, 1);

	// f-1 never answers; the paused clock advances past the expiry and
	// the dispatcher moves on to f-2.
	let (second, seq2) = next_opened(&mut h.events).await;
	assert_eq!(second, "f-2");
	assert_eq!(seq2, 2);

	let handle = h.registry.get("o-1").map(|e| e.value().clone()).unwrap();
	handle.accept("f-2", Some(2)).await.unwrap();

	let event = wait_for_status(&mut h.events, OrderStatus::Assigned).await;
	let OrderEvent::StateChanged {
		assigned_farmer, ..
	} = event;
	assert_eq!(assigned_farmer.as_deref(), Some("f-2"));

	let order = h.state_machine.get_order("o-1").await.unwrap();
	assert_eq!(order.status, OrderStatus::Assigned);
	assert_eq!(order.assigned_farmer.as_deref(), Some("f-2"));
	assert_eq!(order.attempts, 2);

	let attempts = stored_attempts(&h.storage, "o-1").await;
	let outcomes: Vec<OfferOutcome> = attempts.iter().map(|a| a.outcome).collect();
	assert_eq!(outcomes, vec![OfferOutcome::Expired, OfferOutcome::Accepted]);
	// The accepted attempt belongs to the assigned farmer.
	assert_eq!(attempts[1].farmer, "f-2");
}

/// Scenario B: nobody is online, the selector yields nothing, the order
/// becomes unassignable with zero attempts.
#[tokio::test(start_paused = true)]
async fn empty_candidate_sequence_is_unassignable() {
	let mut h = harness(vec![farmer("f-1", 0.95)]);
	// f-1 exists in the directory but never logged in.

	assert!(spawn_fresh(&h, paris_order("o-2")).await);

	wait_for_status(&mut h.events, OrderStatus::Unassignable).await;

	let order = h.state_machine.get_order("o-2").await.unwrap();
	assert_eq!(order.status, OrderStatus::Unassignable);
	assert_eq!(order.attempts, 0);
	assert!(stored_attempts(&h.storage, "o-2").await.is_empty());
}

/// Scenario C: a reject lands before the expiry; only the reject is
/// recorded and the late timer is a no-op.
#[tokio::test(start_paused = true)]
async fn reject_wins_over_the_expiry_timer() {
	let mut h = harness(vec![farmer("f-1", 0.95)]);
	login(&h.presence, "f-1");

	assert!(spawn_fresh(&h, paris_order("o-3")).await);

	let (first, _) = next_opened(&mut h.events).await;
	assert_eq!(first, "f-1");

	let handle = h.registry.get("o-3").map(|e| e.value().clone()).unwrap();
	handle.reject("f-1", Some(1)).await.unwrap();

	// f-1 was the only candidate; the reject exhausts the sequence.
	wait_for_status(&mut h.events, OrderStatus::Unassignable).await;

	let attempts = stored_attempts(&h.storage, "o-3").await;
	assert_eq!(attempts.len(), 1);
	assert_eq!(attempts[0].outcome, OfferOutcome::Rejected);

	// A replayed reject (or the timer racing in after the close) finds
	// the actor gone and is refused without touching the record.
	assert!(matches!(
		handle.reject("f-1", Some(1)).await,
		Err(DispatchError::OfferExpired)
	));
	let attempts = stored_attempts(&h.storage, "o-3").await;
	assert_eq!(attempts[0].outcome, OfferOutcome::Rejected);
}

/// Scenario D: the creator cancels while an offer is pending; the late
/// accept is refused and the order stays cancelled.
#[tokio::test(start_paused = true)]
async fn cancellation_invalidates_the_open_offer() {
	let mut h = harness(vec![farmer("f-3", 0.95)]);
	login(&h.presence, "f-3");

	assert!(spawn_fresh(&h, paris_order("o-4")).await);

	let (first, _) = next_opened(&mut h.events).await;
	assert_eq!(first, "f-3");

	let handle = h.registry.get("o-4").map(|e| e.value().clone()).unwrap();
	handle.cancel("found a local print shop").await.unwrap();

	wait_for_status(&mut h.events, OrderStatus::Cancelled).await;

	// The accept arrives after the cancellation closed the attempt.
	assert!(matches!(
		handle.accept("f-3", Some(1)).await,
		Err(DispatchError::OfferExpired)
	));

	let order = h.state_machine.get_order("o-4").await.unwrap();
	assert_eq!(order.status, OrderStatus::Cancelled);
	assert_eq!(
		order.cancellation_reason.as_deref(),
		Some("found a local print shop")
	);
	assert!(order.assigned_farmer.is_none());

	let attempts = stored_attempts(&h.storage, "o-4").await;
	assert_eq!(attempts.len(), 1);
	assert_eq!(attempts[0].outcome, OfferOutcome::Expired);
}

/// Replaying an accept after assignment is refused and changes nothing.
#[tokio::test(start_paused = true)]
async fn accept_replay_is_idempotent() {
	let mut h = harness(vec![farmer("f-1", 0.95)]);
	login(&h.presence, "f-1");

	assert!(spawn_fresh(&h, paris_order("o-5")).await);

	let (first, _) = next_opened(&mut h.events).await;
	assert_eq!(first, "f-1");

	let handle = h.registry.get("o-5").map(|e| e.value().clone()).unwrap();
	handle.accept("f-1", Some(1)).await.unwrap();
	wait_for_status(&mut h.events, OrderStatus::Assigned).await;

	let before = h.state_machine.get_order("o-5").await.unwrap();
	assert!(matches!(
		handle.accept("f-1", Some(1)).await,
		Err(DispatchError::OfferExpired)
	));
	let after = h.state_machine.get_order("o-5").await.unwrap();
	assert_eq!(before.version, after.version);
	assert_eq!(after.status, OrderStatus::Assigned);

	let attempts = stored_attempts(&h.storage, "o-5").await;
	let accepted: Vec<&OfferAttempt> = attempts
		.iter()
		.filter(|a| a.outcome == OfferOutcome::Accepted)
		.collect();
	assert_eq!(accepted.len(), 1);
	assert_eq!(accepted[0].farmer, "f-1");
}

/// A response from the wrong farmer must not close the open attempt.
#[tokio::test(start_paused = true)]
async fn response_from_wrong_farmer_is_refused() {
	let mut h = harness(vec![farmer("f-1", 0.95), farmer("f-2", 0.90)]);
	login(&h.presence, "f-1");
	login(&h.presence, "f-2");

	assert!(spawn_fresh(&h, paris_order("o-6")).await);

	let (first, _) = next_opened(&mut h.events).await;
	assert_eq!(first, "f-1");

	// f-2 tries to grab an offer that was made to f-1.
	let handle = h.registry.get("o-6").map(|e| e.value().clone()).unwrap();
	assert!(matches!(
		handle.accept("f-2", None).await,
		Err(DispatchError::OfferExpired)
	));

	// The attempt to f-1 is still open and f-1 can still accept it.
	handle.accept("f-1", Some(1)).await.unwrap();
	wait_for_status(&mut h.events, OrderStatus::Assigned).await;

	let order = h.state_machine.get_order("o-6").await.unwrap();
	assert_eq!(order.assigned_farmer.as_deref(), Some("f-1"));
}

/// A farmer who went offline between offers is skipped after a reject.
#[tokio::test(start_paused = true)]
async fn presence_is_rechecked_between_offers() {
	let mut h = harness(vec![
		farmer("f-1", 0.95),
		farmer("f-2", 0.90),
		farmer("f-3", 0.85),
	]);
	login(&h.presence, "f-1");
	login(&h.presence, "f-2");
	login(&h.presence, "f-3");

	assert!(spawn_fresh(&h, paris_order("o-7")).await);

	let (first, _) = next_opened(&mut h.events).await;
	assert_eq!(first, "f-1");

	// f-2 drops off while f-1 is deliberating.
	h.presence.apply(&PresenceEvent {
		farmer: "f-2".into(),
		kind: PresenceEventKind::Logout,
		timestamp: 2,
		busy: None,
	});

	let handle = h.registry.get("o-7").map(|e| e.value().clone()).unwrap();
	handle.reject("f-1", Some(1)).await.unwrap();

	// The next offer skips the now-offline f-2.
	let (second, _) = next_opened(&mut h.events).await;
	assert_eq!(second, "f-3");
}

/// A dispatcher restarted over persisted attempts does not re-offer to
/// farmers that already saw the order.
#[tokio::test(start_paused = true)]
async fn recovery_excludes_previously_tried_farmers() {
	let mut h = harness(vec![farmer("f-1", 0.95), farmer("f-2", 0.90)]);
	login(&h.presence, "f-1");
	login(&h.presence, "f-2");

	// Persist what a previous run would have left behind: the order in
	// Dispatching with one attempt still pending to f-1.
	let mut order = paris_order("o-8");
	order.status = OrderStatus::Dispatching;
	order.attempts = 1;
	order.version = 2;
	h.state_machine.store_order(&order).await.unwrap();
	h.storage
		.store(
			StorageKey::OfferAttempts.as_str(),
			"o-8:1",
			&OfferAttempt {
				order_id: "o-8".into(),
				sequence: 1,
				farmer: "f-1".into(),
				opened_at: 1_700_000_000,
				expires_at: 1_700_000_120,
				outcome: OfferOutcome::Pending,
			},
		)
		.await
		.unwrap();

	assert!(h.dispatcher.spawn(order, h.registry.clone()));

	// The stranded attempt is expired, and the next offer goes to f-2.
	let (next, seq) = next_opened(&mut h.events).await;
	assert_eq!(next, "f-2");
	assert_eq!(seq, 2);

	let attempts = stored_attempts(&h.storage, "o-8").await;
	assert_eq!(attempts[0].outcome, OfferOutcome::Expired);

	let handle = h.registry.get("o-8").map(|e| e.value().clone()).unwrap();
	handle.accept("f-2", Some(2)).await.unwrap();
	wait_for_status(&mut h.events, OrderStatus::Assigned).await;
}

/// Spawning a second dispatcher for the same order is refused.
#[tokio::test(start_paused = true)]
async fn duplicate_spawn_is_refused() {
	let mut h = harness(vec![farmer("f-1", 0.95)]);
	login(&h.presence, "f-1");

	assert!(spawn_fresh(&h, paris_order("o-9")).await);
	let (_, _) = next_opened(&mut h.events).await;

	assert!(!h.dispatcher.spawn(paris_order("o-9"), h.registry.clone()));
}

/// Between offers, candidates the order already tried stay excluded even
/// though they are still online.
#[tokio::test(start_paused = true)]
async fn tried_farmers_are_never_reoffered() {
	let mut h = harness(vec![farmer("f-1", 0.95), farmer("f-2", 0.90)]);
	login(&h.presence, "f-1");
	login(&h.presence, "f-2");

	assert!(spawn_fresh(&h, paris_order("o-10")).await);

	let handle = h.registry.get("o-10").map(|e| e.value().clone()).unwrap();

	let (first, _) = next_opened(&mut h.events).await;
	assert_eq!(first, "f-1");
	handle.reject("f-1", None).await.unwrap();

	let (second, _) = next_opened(&mut h.events).await;
	assert_eq!(second, "f-2");
	handle.reject("f-2", None).await.unwrap();

	// Both candidates rejected: exhaustion, not a loop back to f-1.
	wait_for_status(&mut h.events, OrderStatus::Unassignable).await;
	let excluded: HashSet<String> = stored_attempts(&h.storage, "o-10")
		.await
		.iter()
		.map(|a| a.farmer.clone())
		.collect();
	assert_eq!(excluded.len(), 2);
}
