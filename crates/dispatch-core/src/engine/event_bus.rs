//! In-process event bus for the dispatch engine.
//!
//! Carries internal state-change records between the core components and
//! the notify pump. Backed by a tokio broadcast channel: publishers never
//! block, slow subscribers lag and are told so.

use dispatch_types::DispatchEvent;
use tokio::sync::broadcast;

/// Clonable handle to the internal event bus.
#[derive(Clone)]
pub struct EventBus {
	sender: broadcast::Sender<DispatchEvent>,
}

impl EventBus {
	/// Creates a bus retaining up to `capacity` undelivered events per
	/// subscriber.
	pub fn new(capacity: usize) -> Self {
		let (sender, _) = broadcast::channel(capacity);
		Self { sender }
	}

	/// Publishes an event to all current subscribers.
	///
	/// Returns Err when nobody is subscribed; callers that do not care
	/// (fire-and-forget progress records) discard the result.
	pub fn publish(&self, event: DispatchEvent) -> Result<(), Box<DispatchEvent>> {
		self.sender.send(event).map(|_| ()).map_err(|e| Box::new(e.0))
	}

	/// Subscribes to every event published after this call.
	pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
		self.sender.subscribe()
	}
}

impl Default for EventBus {
	fn default() -> Self {
		Self::new(1000)
	}
}
