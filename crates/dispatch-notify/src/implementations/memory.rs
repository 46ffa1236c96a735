//! In-memory bus publisher implementation.
//!
//! Sends envelopes into a [`MemoryBus`], the in-process stand-in for the
//! external broker. Used by tests and local runs.

use crate::{PublishError, PublisherInterface};
use async_trait::async_trait;
use dispatch_types::{BusEnvelope, ConfigSchema, MemoryBus, Schema, ValidationError};

/// In-memory bus publisher.
pub struct MemoryPublisher {
	bus: MemoryBus,
}

impl MemoryPublisher {
	pub fn new(bus: MemoryBus) -> Self {
		Self { bus }
	}
}

#[async_trait]
impl PublisherInterface for MemoryPublisher {
	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(MemoryPublisherSchema)
	}

	async fn publish(&self, envelope: &BusEnvelope) -> Result<(), PublishError> {
		self.bus.publish(envelope.clone());
		Ok(())
	}
}

/// Configuration schema for MemoryPublisher.
pub struct MemoryPublisherSchema;

impl ConfigSchema for MemoryPublisherSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		// Memory publishing has no required configuration
		let schema = Schema::new(vec![], vec![]);
		schema.validate(config)
	}
}
