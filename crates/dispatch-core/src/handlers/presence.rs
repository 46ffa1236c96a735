//! Presence handler translating bus events into registry updates.

use dispatch_presence::PresenceRegistry;
use dispatch_types::{BusEnvelope, EventKind, PresenceEvent, PresenceEventKind};
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised while applying presence events.
#[derive(Debug, Error)]
pub enum PresenceHandlerError {
	#[error("Unexpected event kind: {0:?}")]
	UnexpectedKind(EventKind),
}

/// Busy flag optionally carried by heartbeat payloads.
#[derive(Debug, Deserialize, Default)]
struct HeartbeatPayload {
	#[serde(default)]
	busy: Option<bool>,
}

/// Applies presence-relevant bus events to the registry.
pub struct PresenceHandler {
	registry: Arc<PresenceRegistry>,
}

impl PresenceHandler {
	pub fn new(registry: Arc<PresenceRegistry>) -> Self {
		Self { registry }
	}

	/// Maps one envelope to a presence event and applies it.
	///
	/// The envelope subject is the farmer identity; a heartbeat may carry
	/// a busy flag in its payload. A malformed payload degrades to "no
	/// busy information" rather than dropping the liveness signal.
	pub fn handle(&self, envelope: &BusEnvelope) -> Result<(), PresenceHandlerError> {
		let kind = match envelope.kind {
			EventKind::FarmerOnline => PresenceEventKind::Login,
			EventKind::FarmerOffline => PresenceEventKind::Logout,
			EventKind::Heartbeat => PresenceEventKind::Heartbeat,
			EventKind::SessionExpired => PresenceEventKind::SessionExpired,
			other => return Err(PresenceHandlerError::UnexpectedKind(other)),
		};

		let busy = envelope
			.decode::<HeartbeatPayload>()
			.unwrap_or_default()
			.busy;

		self.registry.apply(&PresenceEvent {
			farmer: envelope.subject.clone(),
			kind,
			timestamp: envelope.timestamp,
			busy,
		});
		Ok(())
	}
}
