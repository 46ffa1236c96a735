//! Presence registry for the dispatch engine.
//!
//! Consumes the stream of login/logout/heartbeat/session events and
//! maintains the authoritative in-memory view of which farmers are
//! currently reachable. Entries are upserted per farmer key with
//! last-event-wins resolution by event timestamp. Queries never block on
//! ingestion; they observe the latest committed snapshot.

use arc_swap::ArcSwap;
use async_trait::async_trait;
use dashmap::DashMap;
use dispatch_types::{PresenceEntry, PresenceEvent};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised by presence lookups.
#[derive(Debug, Error)]
pub enum PresenceError {
	/// Transient lookup failure; callers retry with bounded backoff
	/// before treating the farmer as unreachable.
	#[error("Presence lookup failed: {0}")]
	LookupFailure(String),
}

/// Read interface the candidate selector consumes.
///
/// Abstracting the registry behind a trait keeps the selector testable
/// against doubles that simulate transient lookup failures, and leaves
/// room for a remote presence source.
#[async_trait]
pub trait PresenceSource: Send + Sync {
	/// Whether the farmer is currently online.
	async fn is_online(&self, farmer: &str) -> Result<bool, PresenceError>;

	/// Whether the farmer reported being busy. `None` when unknown.
	async fn is_busy(&self, farmer: &str) -> Result<Option<bool>, PresenceError>;
}

/// Authoritative in-memory presence view.
///
/// An owned, injectable object with explicit lifecycle: constructed at
/// service start, dropped at shutdown. Tests build isolated instances.
pub struct PresenceRegistry {
	/// Per-farmer entries; the dashmap gives per-key atomic upsert
	/// without cross-farmer ordering guarantees.
	entries: DashMap<String, PresenceEntry>,
	/// Committed set of online farmer ids, swapped wholesale after each
	/// applied event so readers never contend with writers.
	online: ArcSwap<HashSet<String>>,
}

impl PresenceRegistry {
	pub fn new() -> Self {
		Self {
			entries: DashMap::new(),
			online: ArcSwap::from_pointee(HashSet::new()),
		}
	}

	/// Applies one presence event.
	///
	/// Events older than the entry's `last_seen` are ignored
	/// (last-event-wins); equal timestamps apply in arrival order, which
	/// is the per-farmer ordering the bus guarantees.
	pub fn apply(&self, event: &PresenceEvent) {
		let mut changed = false;
		{
			let mut entry = self
				.entries
				.entry(event.farmer.clone())
				.or_insert_with(|| PresenceEntry {
					farmer: event.farmer.clone(),
					online: false,
					last_seen: 0,
					busy: None,
				});

			if event.timestamp < entry.last_seen {
				tracing::debug!(
					farmer = %event.farmer,
					event_ts = event.timestamp,
					entry_ts = entry.last_seen,
					"Ignoring stale presence event"
				);
				return;
			}

			let online = event.kind.marks_online();
			if entry.online != online {
				changed = true;
			}
			entry.online = online;
			entry.last_seen = event.timestamp;
			if let Some(busy) = event.busy {
				entry.busy = Some(busy);
			} else if !online {
				entry.busy = None;
			}
		}

		if changed {
			self.republish();
		}
	}

	/// Rebuilds and swaps in the online-id snapshot.
	fn republish(&self) {
		let online: HashSet<String> = self
			.entries
			.iter()
			.filter(|e| e.online)
			.map(|e| e.farmer.clone())
			.collect();
		self.online.store(Arc::new(online));
	}

	/// Current set of online farmer ids.
	pub fn snapshot(&self) -> Arc<HashSet<String>> {
		self.online.load_full()
	}

	/// Last-known entry for one farmer, if any event was ever seen.
	pub fn entry(&self, farmer: &str) -> Option<PresenceEntry> {
		self.entries.get(farmer).map(|e| e.clone())
	}
}

impl Default for PresenceRegistry {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait]
impl PresenceSource for PresenceRegistry {
	async fn is_online(&self, farmer: &str) -> Result<bool, PresenceError> {
		Ok(self.online.load().contains(farmer))
	}

	async fn is_busy(&self, farmer: &str) -> Result<Option<bool>, PresenceError> {
		Ok(self.entries.get(farmer).and_then(|e| e.busy))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use dispatch_types::PresenceEventKind;

	fn event(farmer: &str, kind: PresenceEventKind, timestamp: u64) -> PresenceEvent {
		PresenceEvent {
			farmer: farmer.into(),
			kind,
			timestamp,
			busy: None,
		}
	}

	#[tokio::test]
	async fn login_marks_online_logout_marks_offline() {
		let registry = PresenceRegistry::new();

		registry.apply(&event("f-1", PresenceEventKind::Login, 10));
		assert!(registry.is_online("f-1").await.unwrap());
		assert!(registry.snapshot().contains("f-1"));

		registry.apply(&event("f-1", PresenceEventKind::Logout, 11));
		assert!(!registry.is_online("f-1").await.unwrap());
		assert!(registry.snapshot().is_empty());
	}

	#[tokio::test]
	async fn stale_events_are_ignored() {
		let registry = PresenceRegistry::new();

		registry.apply(&event("f-1", PresenceEventKind::Login, 20));
		// A logout that happened before the login must not win.
		registry.apply(&event("f-1", PresenceEventKind::Logout, 15));
		assert!(registry.is_online("f-1").await.unwrap());
	}

	#[tokio::test]
	async fn session_expiry_downgrades_presence() {
		let registry = PresenceRegistry::new();

		registry.apply(&event("f-1", PresenceEventKind::Heartbeat, 30));
		assert!(registry.is_online("f-1").await.unwrap());

		registry.apply(&event("f-1", PresenceEventKind::SessionExpired, 31));
		assert!(!registry.is_online("f-1").await.unwrap());
	}

	#[tokio::test]
	async fn heartbeat_carries_busy_flag() {
		let registry = PresenceRegistry::new();

		let mut hb = event("f-1", PresenceEventKind::Heartbeat, 40);
		hb.busy = Some(true);
		registry.apply(&hb);
		assert_eq!(registry.is_busy("f-1").await.unwrap(), Some(true));

		// Going offline clears the stale busy flag.
		registry.apply(&event("f-1", PresenceEventKind::Logout, 41));
		assert_eq!(registry.is_busy("f-1").await.unwrap(), None);
	}

	#[tokio::test]
	async fn farmers_update_independently() {
		let registry = PresenceRegistry::new();

		registry.apply(&event("f-1", PresenceEventKind::Login, 5));
		registry.apply(&event("f-2", PresenceEventKind::Login, 50));
		registry.apply(&event("f-1", PresenceEventKind::Logout, 6));

		let snapshot = registry.snapshot();
		assert!(!snapshot.contains("f-1"));
		assert!(snapshot.contains("f-2"));
	}
}
