//! Presence entry and presence event types.
//!
//! Presence entries are owned exclusively by the presence registry; other
//! components observe them only through the registry's query interface.

use serde::{Deserialize, Serialize};

/// Last-known presence state of one farmer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceEntry {
	/// Farmer this entry describes.
	pub farmer: String,
	/// Whether the farmer is currently reachable.
	pub online: bool,
	/// Timestamp of the newest event applied to this entry.
	pub last_seen: u64,
	/// Busy/available flag when the farmer reports it.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub busy: Option<bool>,
}

/// A presence-relevant event decoded from the user or auth topics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceEvent {
	/// Farmer the event concerns.
	pub farmer: String,
	/// What happened.
	pub kind: PresenceEventKind,
	/// Event timestamp used for last-event-wins resolution.
	pub timestamp: u64,
	/// Busy flag carried by heartbeats when the farm reports load.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub busy: Option<bool>,
}

/// Kinds of presence events the registry understands.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum PresenceEventKind {
	/// Farmer logged in.
	Login,
	/// Farmer logged out.
	Logout,
	/// Periodic liveness signal.
	Heartbeat,
	/// The auth collaborator expired the farmer's session.
	SessionExpired,
}

impl PresenceEventKind {
	/// Whether events of this kind mark the farmer online.
	pub fn marks_online(&self) -> bool {
		matches!(self, PresenceEventKind::Login | PresenceEventKind::Heartbeat)
	}
}
