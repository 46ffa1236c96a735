//! In-memory bus consumer implementation.
//!
//! Subscribes to a [`MemoryBus`] and forwards envelopes for the configured
//! topics into the engine channel. Used by tests and local runs; a real
//! broker client implements the same interface.

use crate::{IngestError, IngestInterface};
use async_trait::async_trait;
use dispatch_types::{BusEnvelope, ConfigSchema, MemoryBus, Schema, ValidationError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// In-memory bus consumer.
pub struct MemoryIngest {
	/// The bus to subscribe to.
	bus: MemoryBus,
	/// Topics forwarded to the engine; all topics when empty.
	topics: Vec<String>,
	/// Flag indicating if consumption is active.
	is_consuming: Arc<AtomicBool>,
	/// Channel for signaling consumption shutdown.
	stop_signal: Arc<Mutex<Option<mpsc::Sender<()>>>>,
}

impl MemoryIngest {
	/// Creates a consumer forwarding the given topics from the bus.
	pub fn new(bus: MemoryBus, topics: Vec<String>) -> Self {
		Self {
			bus,
			topics,
			is_consuming: Arc::new(AtomicBool::new(false)),
			stop_signal: Arc::new(Mutex::new(None)),
		}
	}

	async fn consume_loop(
		mut bus_rx: tokio::sync::broadcast::Receiver<BusEnvelope>,
		topics: Vec<String>,
		sender: mpsc::UnboundedSender<BusEnvelope>,
		mut stop_rx: mpsc::Receiver<()>,
	) {
		loop {
			tokio::select! {
				received = bus_rx.recv() => {
					match received {
						Ok(envelope) => {
							if !topics.is_empty() && !topics.iter().any(|t| t == envelope.topic()) {
								continue;
							}
							if sender.send(envelope).is_err() {
								// Engine went away; nothing left to feed.
								break;
							}
						},
						Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
							tracing::warn!(skipped, "Consumer lagged behind the bus, events dropped");
						},
						Err(tokio::sync::broadcast::error::RecvError::Closed) => {
							break;
						},
					}
				}
				_ = stop_rx.recv() => {
					break;
				}
			}
		}
	}
}

#[async_trait]
impl IngestInterface for MemoryIngest {
	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(MemoryIngestSchema)
	}

	async fn start_consuming(
		&self,
		sender: mpsc::UnboundedSender<BusEnvelope>,
	) -> Result<(), IngestError> {
		if self.is_consuming.swap(true, Ordering::SeqCst) {
			return Err(IngestError::AlreadyConsuming);
		}

		let (stop_tx, stop_rx) = mpsc::channel(1);
		*self.stop_signal.lock().await = Some(stop_tx);

		let bus_rx = self.bus.subscribe();
		let topics = self.topics.clone();
		let is_consuming = self.is_consuming.clone();
		tokio::spawn(async move {
			Self::consume_loop(bus_rx, topics, sender, stop_rx).await;
			is_consuming.store(false, Ordering::SeqCst);
		});

		Ok(())
	}

	async fn stop_consuming(&self) -> Result<(), IngestError> {
		if let Some(stop_tx) = self.stop_signal.lock().await.take() {
			let _ = stop_tx.send(()).await;
		}
		Ok(())
	}
}

/// Configuration schema for MemoryIngest.
pub struct MemoryIngestSchema;

impl ConfigSchema for MemoryIngestSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		// Topic filtering is optional; no required configuration.
		let schema = Schema::new(vec![], vec![]);
		schema.validate(config)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use dispatch_types::{EventKind, TOPIC_ORDERS, TOPIC_USER_EVENTS};

	fn envelope(kind: EventKind, subject: &str) -> BusEnvelope {
		BusEnvelope {
			id: format!("e-{}", subject),
			kind,
			subject: subject.into(),
			timestamp: 1,
			payload: serde_json::Value::Null,
		}
	}

	#[tokio::test]
	async fn forwards_only_configured_topics() {
		let bus = MemoryBus::new(16);
		let ingest = MemoryIngest::new(bus.clone(), vec![TOPIC_USER_EVENTS.to_string()]);

		let (tx, mut rx) = mpsc::unbounded_channel();
		ingest.start_consuming(tx).await.unwrap();
		// The subscription is taken inside start_consuming, so these
		// publishes cannot be missed.
		bus.publish(envelope(EventKind::Heartbeat, "f-1"));
		bus.publish(envelope(EventKind::OrderCreated, "o-1"));
		bus.publish(envelope(EventKind::FarmerOnline, "f-2"));

		let first = rx.recv().await.unwrap();
		let second = rx.recv().await.unwrap();
		assert_eq!(first.subject, "f-1");
		assert_eq!(second.subject, "f-2");
		assert_eq!(second.topic(), TOPIC_USER_EVENTS);

		ingest.stop_consuming().await.unwrap();
	}

	#[tokio::test]
	async fn empty_topic_list_forwards_everything() {
		let bus = MemoryBus::new(16);
		let ingest = MemoryIngest::new(bus.clone(), vec![]);

		let (tx, mut rx) = mpsc::unbounded_channel();
		ingest.start_consuming(tx).await.unwrap();
		bus.publish(envelope(EventKind::OrderCreated, "o-1"));

		assert_eq!(rx.recv().await.unwrap().topic(), TOPIC_ORDERS);
	}

	#[tokio::test]
	async fn double_start_is_refused() {
		let bus = MemoryBus::new(16);
		let ingest = MemoryIngest::new(bus, vec![]);

		let (tx, _rx) = mpsc::unbounded_channel();
		ingest.start_consuming(tx.clone()).await.unwrap();
		assert!(matches!(
			ingest.start_consuming(tx).await,
			Err(IngestError::AlreadyConsuming)
		));
	}
}
