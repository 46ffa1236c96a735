//! Inbound event consumption module for the dispatch engine.
//!
//! This module adapts the external message bus to the engine: ingest
//! implementations subscribe to their topics and push decoded envelopes
//! into the engine's command channel. It provides abstractions for
//! different consumption mechanisms; the in-memory implementation serves
//! tests and local runs.

use async_trait::async_trait;
use dispatch_types::{BusEnvelope, ConfigSchema};
use thiserror::Error;
use tokio::sync::mpsc;

/// Re-export implementations
pub mod implementations {
	pub mod memory;
}

/// Errors that can occur during event ingestion.
#[derive(Debug, Error)]
pub enum IngestError {
	/// Error that occurs when connecting to the bus fails.
	#[error("Connection error: {0}")]
	Connection(String),
	/// Error that occurs when trying to start an already active consumer.
	#[error("Already consuming")]
	AlreadyConsuming,
	/// Error that occurs when decoding an inbound event fails.
	#[error("Parse error: {0}")]
	ParseError(String),
}

/// Trait defining the interface for inbound bus adapters.
///
/// This trait must be implemented by any consumer that wants to feed the
/// dispatch engine. It provides methods for starting and stopping event
/// consumption.
#[async_trait]
pub trait IngestInterface: Send + Sync {
	/// Returns the configuration schema for this ingest implementation.
	fn config_schema(&self) -> Box<dyn ConfigSchema>;

	/// Starts consuming events from this implementation's topics.
	///
	/// Consumed envelopes are sent through the provided channel. The
	/// implementation should continue until stop_consuming is called.
	async fn start_consuming(
		&self,
		sender: mpsc::UnboundedSender<BusEnvelope>,
	) -> Result<(), IngestError>;

	/// Stops consuming events and releases associated resources.
	async fn stop_consuming(&self) -> Result<(), IngestError>;
}

/// Service that manages multiple ingest implementations.
///
/// The IngestService coordinates the configured consumers, fanning all of
/// their envelopes into one channel for the engine loop.
pub struct IngestService {
	/// Collection of ingest implementations to run.
	implementations: Vec<Box<dyn IngestInterface>>,
}

impl IngestService {
	/// Creates a new IngestService with the specified implementations.
	pub fn new(implementations: Vec<Box<dyn IngestInterface>>) -> Self {
		Self { implementations }
	}

	/// Starts consumption on all configured implementations.
	///
	/// All envelopes from any implementation are sent through the provided
	/// channel. If any implementation fails to start, the entire operation
	/// fails.
	pub async fn start_all(
		&self,
		sender: mpsc::UnboundedSender<BusEnvelope>,
	) -> Result<(), IngestError> {
		for implementation in &self.implementations {
			implementation.start_consuming(sender.clone()).await?;
		}
		Ok(())
	}

	/// Stops consumption on all active implementations.
	pub async fn stop_all(&self) -> Result<(), IngestError> {
		for implementation in &self.implementations {
			implementation.stop_consuming().await?;
		}
		Ok(())
	}
}
