//! Candidate selection module for the dispatch engine.
//!
//! Given an order, produces the ordered sequence of farmer candidates the
//! sequential dispatcher offers to. The sequence is lazy and restartable:
//! ranking over the directory is computed once per dispatch cycle, but
//! every candidate is re-validated against live presence at the moment it
//! is consumed, because presence can change between offers.

use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use dispatch_presence::{PresenceError, PresenceSource};
use dispatch_types::{FarmerProfile, Order};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during candidate selection.
#[derive(Debug, Error)]
pub enum MatchError {
	/// The farmer directory collaborator failed.
	#[error("Directory error: {0}")]
	Directory(String),
}

/// Directory collaborator supplying registered farmer profiles.
///
/// Profiles are reference data owned elsewhere; the selector only reads
/// them. Implementations may be storage-backed or remote.
#[async_trait]
pub trait FarmerDirectory: Send + Sync {
	/// All registered farmer profiles.
	async fn farmers(&self) -> Result<Vec<FarmerProfile>, MatchError>;
}

/// Ranking tunables with documented defaults (see dispatch-config).
#[derive(Debug, Clone)]
pub struct RankingPolicy {
	/// Farms farther than this are ranked in the any-city fallback tier.
	pub search_radius_km: f64,
	/// Distance bucket width; reliability orders farms inside one bucket.
	pub distance_bucket_km: f64,
}

/// Bounded-retry policy for transient presence lookups.
#[derive(Debug, Clone)]
pub struct PresenceRetryPolicy {
	pub max_tries: u32,
	pub initial_backoff: Duration,
}

/// How well a farm's location matches the order's.
///
/// The primary ranking key: an exact city match beats any distance, farms
/// within the search radius beat the fallback tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LocationTier {
	ExactCity,
	WithinRadius,
	Fallback,
}

/// One ranked candidate, derived per dispatch cycle and never persisted.
#[derive(Debug, Clone)]
pub struct FarmerCandidate {
	pub farmer: String,
	pub tier: LocationTier,
	pub distance_km: f64,
	pub reliability: f64,
}

/// Produces ranked candidate sequences for orders.
pub struct CandidateSelector {
	directory: Arc<dyn FarmerDirectory>,
	presence: Arc<dyn PresenceSource>,
	ranking: RankingPolicy,
	retry: PresenceRetryPolicy,
}

impl CandidateSelector {
	pub fn new(
		directory: Arc<dyn FarmerDirectory>,
		presence: Arc<dyn PresenceSource>,
		ranking: RankingPolicy,
		retry: PresenceRetryPolicy,
	) -> Self {
		Self {
			directory,
			presence,
			ranking,
			retry,
		}
	}

	/// Builds the lazy candidate sequence for one dispatch cycle.
	///
	/// Filters out farms that cannot take the job at all (capability,
	/// capacity) and ranks the rest. Presence is deliberately NOT checked
	/// here; it is checked per candidate in
	/// [`CandidateStream::next_eligible`].
	pub async fn candidates(&self, order: &Order) -> Result<CandidateStream, MatchError> {
		let mut ranked: Vec<FarmerCandidate> = self
			.directory
			.farmers()
			.await?
			.into_iter()
			.filter(|farmer| {
				farmer.has_capacity
					&& farmer.supports(&order.requirements.material, &order.requirements.mode)
			})
			.map(|farmer| self.rank(order, &farmer))
			.collect();

		let bucket_km = self.ranking.distance_bucket_km;
		ranked.sort_by(|a, b| {
			a.tier
				.cmp(&b.tier)
				.then_with(|| {
					let bucket_a = (a.distance_km / bucket_km) as u64;
					let bucket_b = (b.distance_km / bucket_km) as u64;
					bucket_a.cmp(&bucket_b)
				})
				.then_with(|| {
					b.reliability
						.partial_cmp(&a.reliability)
						.unwrap_or(std::cmp::Ordering::Equal)
				})
				// Deterministic tie-break keeps tests reproducible.
				.then_with(|| a.farmer.cmp(&b.farmer))
		});

		Ok(CandidateStream {
			presence: self.presence.clone(),
			retry: self.retry.clone(),
			ranked,
			next_index: 0,
		})
	}

	fn rank(&self, order: &Order, farmer: &FarmerProfile) -> FarmerCandidate {
		let distance_km = haversine_km(
			order.location.lat,
			order.location.lon,
			farmer.lat,
			farmer.lon,
		);
		let tier = if farmer.city == order.location.city {
			LocationTier::ExactCity
		} else if distance_km <= self.ranking.search_radius_km {
			LocationTier::WithinRadius
		} else {
			LocationTier::Fallback
		};

		FarmerCandidate {
			farmer: farmer.id.clone(),
			tier,
			distance_km: if tier == LocationTier::ExactCity {
				0.0
			} else {
				distance_km
			},
			reliability: farmer.reliability,
		}
	}
}

/// The lazy, finite candidate sequence for one dispatch cycle.
///
/// The dispatcher consumes one candidate at a time and may stop early;
/// candidates past that point are never validated. Consumed candidates are
/// not revisited.
pub struct CandidateStream {
	presence: Arc<dyn PresenceSource>,
	retry: PresenceRetryPolicy,
	ranked: Vec<FarmerCandidate>,
	next_index: usize,
}

impl CandidateStream {
	/// Yields the next candidate passing a fresh eligibility check.
	///
	/// `excluded` holds the farmers that already saw a non-expired attempt
	/// for this order or previously rejected it. A transient presence
	/// failure is retried with bounded backoff; a candidate whose lookup
	/// still fails is degraded to ineligible and skipped, never surfaced
	/// as a dispatcher error.
	pub async fn next_eligible(&mut self, excluded: &HashSet<String>) -> Option<FarmerCandidate> {
		while self.next_index < self.ranked.len() {
			let candidate = self.ranked[self.next_index].clone();
			self.next_index += 1;

			if excluded.contains(&candidate.farmer) {
				continue;
			}

			match self.check_presence(&candidate.farmer).await {
				Ok(true) => return Some(candidate),
				Ok(false) => {
					tracing::debug!(farmer = %candidate.farmer, "Candidate not reachable, skipping");
				},
				Err(e) => {
					tracing::warn!(
						farmer = %candidate.farmer,
						error = %e,
						"Presence lookup kept failing, degrading candidate to ineligible"
					);
				},
			}
		}
		None
	}

	/// Number of ranked candidates not yet consumed.
	pub fn remaining(&self) -> usize {
		self.ranked.len() - self.next_index
	}

	/// Presence check with bounded exponential retry.
	///
	/// A farmer is reachable when online and not reporting busy.
	async fn check_presence(&self, farmer: &str) -> Result<bool, PresenceError> {
		let max_elapsed = self.retry.initial_backoff
			* 2u32.saturating_pow(self.retry.max_tries.saturating_sub(1));
		let policy = ExponentialBackoffBuilder::new()
			.with_initial_interval(self.retry.initial_backoff)
			.with_max_elapsed_time(Some(max_elapsed))
			.build();

		let presence = self.presence.clone();
		let farmer = farmer.to_string();
		backoff::future::retry(policy, || {
			let presence = presence.clone();
			let farmer = farmer.clone();
			async move {
				let online = presence
					.is_online(&farmer)
					.await
					.map_err(backoff::Error::transient)?;
				if !online {
					return Ok(false);
				}
				let busy = presence
					.is_busy(&farmer)
					.await
					.map_err(backoff::Error::transient)?;
				Ok(busy != Some(true))
			}
		})
		.await
	}
}

/// Great-circle distance between two coordinates, in kilometers.
fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
	const EARTH_RADIUS_KM: f64 = 6371.0;

	let d_lat = (lat2 - lat1).to_radians();
	let d_lon = (lon2 - lon1).to_radians();
	let a = (d_lat / 2.0).sin().powi(2)
		+ lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
	2.0 * EARTH_RADIUS_KM * a.sqrt().atan2((1.0 - a).sqrt())
}

#[cfg(test)]
mod tests {
	use super::*;
	use dispatch_types::{Location, PrintSpec};
	use std::sync::atomic::{AtomicU32, Ordering};

	struct FixedDirectory(Vec<FarmerProfile>);

	#[async_trait]
	impl FarmerDirectory for FixedDirectory {
		async fn farmers(&self) -> Result<Vec<FarmerProfile>, MatchError> {
			Ok(self.0.clone())
		}
	}

	/// Presence double: a fixed online set, optionally failing the first
	/// N lookups to exercise the retry path.
	struct ScriptedPresence {
		online: HashSet<String>,
		failures_left: AtomicU32,
	}

	impl ScriptedPresence {
		fn online(ids: &[&str]) -> Self {
			Self {
				online: ids.iter().map(|s| s.to_string()).collect(),
				failures_left: AtomicU32::new(0),
			}
		}

		fn failing_first(ids: &[&str], failures: u32) -> Self {
			let mut p = Self::online(ids);
			p.failures_left = AtomicU32::new(failures);
			p
		}
	}

	#[async_trait]
	impl PresenceSource for ScriptedPresence {
		async fn is_online(&self, farmer: &str) -> Result<bool, PresenceError> {
			if self
				.failures_left
				.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
				.is_ok()
			{
				return Err(PresenceError::LookupFailure("registry unavailable".into()));
			}
			Ok(self.online.contains(farmer))
		}

		async fn is_busy(&self, _farmer: &str) -> Result<Option<bool>, PresenceError> {
			Ok(None)
		}
	}

	fn paris_order() -> Order {
		Order::new(
			"o-1".into(),
			"creator-1".into(),
			Location {
				city: "Paris".into(),
				lat: 48.8566,
				lon: 2.3522,
			},
			PrintSpec {
				material: "PLA".into(),
				mode: "quality".into(),
				file_keys: vec![],
				estimated_minutes: 60,
				cost: 20.0,
			},
			1_700_000_000,
		)
	}

	fn farmer(id: &str, city: &str, lat: f64, lon: f64, reliability: f64) -> FarmerProfile {
		FarmerProfile {
			id: id.into(),
			city: city.into(),
			lat,
			lon,
			materials: vec!["PLA".into()],
			modes: vec!["quality".into()],
			reliability,
			has_capacity: true,
		}
	}

	fn selector(
		farmers: Vec<FarmerProfile>,
		presence: ScriptedPresence,
	) -> CandidateSelector {
		CandidateSelector::new(
			Arc::new(FixedDirectory(farmers)),
			Arc::new(presence),
			RankingPolicy {
				search_radius_km: 50.0,
				distance_bucket_km: 10.0,
			},
			PresenceRetryPolicy {
				max_tries: 6,
				initial_backoff: Duration::from_millis(1),
			},
		)
	}

	#[tokio::test]
	async fn exact_city_outranks_distance_and_fallback() {
		// Orléans is ~110 km from Paris (fallback), Versailles ~17 km
		// (within radius), Paris is an exact city match.
		let farmers = vec![
			farmer("f-orleans", "Orléans", 47.9030, 1.9093, 0.99),
			farmer("f-versailles", "Versailles", 48.8049, 2.1204, 0.99),
			farmer("f-paris", "Paris", 48.8600, 2.3400, 0.10),
		];
		let selector = selector(farmers, ScriptedPresence::online(&[
			"f-orleans",
			"f-versailles",
			"f-paris",
		]));

		let mut stream = selector.candidates(&paris_order()).await.unwrap();
		let excluded = HashSet::new();
		let first = stream.next_eligible(&excluded).await.unwrap();
		let second = stream.next_eligible(&excluded).await.unwrap();
		let third = stream.next_eligible(&excluded).await.unwrap();

		assert_eq!(first.farmer, "f-paris");
		assert_eq!(first.tier, LocationTier::ExactCity);
		assert_eq!(second.farmer, "f-versailles");
		assert_eq!(second.tier, LocationTier::WithinRadius);
		assert_eq!(third.farmer, "f-orleans");
		assert_eq!(third.tier, LocationTier::Fallback);
		assert!(stream.next_eligible(&excluded).await.is_none());
	}

	#[tokio::test]
	async fn reliability_then_id_break_ties() {
		let farmers = vec![
			farmer("f-c", "Paris", 48.86, 2.34, 0.80),
			farmer("f-a", "Paris", 48.86, 2.34, 0.95),
			farmer("f-b", "Paris", 48.86, 2.34, 0.95),
		];
		let selector = selector(farmers, ScriptedPresence::online(&["f-a", "f-b", "f-c"]));

		let mut stream = selector.candidates(&paris_order()).await.unwrap();
		let excluded = HashSet::new();
		let order: Vec<String> = [
			stream.next_eligible(&excluded).await.unwrap().farmer,
			stream.next_eligible(&excluded).await.unwrap().farmer,
			stream.next_eligible(&excluded).await.unwrap().farmer,
		]
		.into();
		assert_eq!(order, vec!["f-a", "f-b", "f-c"]);
	}

	#[tokio::test]
	async fn capability_and_capacity_filter_upfront() {
		let mut no_material = farmer("f-1", "Paris", 48.86, 2.34, 0.9);
		no_material.materials = vec!["ABS".into()];
		let mut no_capacity = farmer("f-2", "Paris", 48.86, 2.34, 0.9);
		no_capacity.has_capacity = false;

		let selector = selector(
			vec![no_material, no_capacity],
			ScriptedPresence::online(&["f-1", "f-2"]),
		);
		let mut stream = selector.candidates(&paris_order()).await.unwrap();
		assert!(stream.next_eligible(&HashSet::new()).await.is_none());
	}

	#[tokio::test]
	async fn offline_and_excluded_candidates_are_skipped() {
		let farmers = vec![
			farmer("f-1", "Paris", 48.86, 2.34, 0.95),
			farmer("f-2", "Paris", 48.86, 2.34, 0.90),
			farmer("f-3", "Paris", 48.86, 2.34, 0.85),
		];
		// f-1 is offline, f-2 is excluded (already tried).
		let selector = selector(farmers, ScriptedPresence::online(&["f-2", "f-3"]));
		let mut stream = selector.candidates(&paris_order()).await.unwrap();

		let excluded: HashSet<String> = ["f-2".to_string()].into();
		let candidate = stream.next_eligible(&excluded).await.unwrap();
		assert_eq!(candidate.farmer, "f-3");
	}

	#[tokio::test]
	async fn transient_lookup_failure_is_retried() {
		let farmers = vec![farmer("f-1", "Paris", 48.86, 2.34, 0.95)];
		// Two failures, then success: inside the retry budget.
		let selector = selector(farmers, ScriptedPresence::failing_first(&["f-1"], 2));
		let mut stream = selector.candidates(&paris_order()).await.unwrap();

		let candidate = stream.next_eligible(&HashSet::new()).await;
		assert_eq!(candidate.unwrap().farmer, "f-1");
	}

	#[tokio::test]
	async fn eligibility_is_rechecked_at_consumption_time() {
		// The stream is created while nobody is online; the presence
		// source double answers per call, so a farmer who is online by
		// the time the candidate is consumed still qualifies.
		let farmers = vec![farmer("f-1", "Paris", 48.86, 2.34, 0.95)];
		let selector = selector(farmers, ScriptedPresence::online(&["f-1"]));

		let mut stream = selector.candidates(&paris_order()).await.unwrap();
		assert_eq!(stream.remaining(), 1);
		assert!(stream.next_eligible(&HashSet::new()).await.is_some());
		assert_eq!(stream.remaining(), 0);
	}
}
