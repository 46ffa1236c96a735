//! Main entry point for the printfarm dispatch service.
//!
//! This binary runs the order-to-farmer dispatch engine: it consumes
//! presence and order events from the bus, drives the sequential offer
//! protocol, and publishes lifecycle notifications. Storage and bus
//! implementations are pluggable and selected from configuration.

use anyhow::Context;
use clap::Parser;
use dispatch_config::Config;
use dispatch_core::DispatchEngine;
use dispatch_ingest::implementations::memory::MemoryIngest;
use dispatch_ingest::{IngestInterface, IngestService};
use dispatch_notify::implementations::memory::MemoryPublisher;
use dispatch_notify::{NotifyService, PublisherInterface};
use dispatch_presence::PresenceRegistry;
use dispatch_storage::StorageService;
use dispatch_types::MemoryBus;
use std::path::PathBuf;
use std::sync::Arc;

mod directory;

use directory::StorageFarmerDirectory;

/// Command-line arguments for the dispatch service.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
	/// Path to configuration file
	#[arg(short, long, default_value = "config.toml")]
	config: PathBuf,

	/// Log level (trace, debug, info, warn, error)
	#[arg(short, long, default_value = "info")]
	log_level: String,
}

/// Main entry point for the dispatch service.
///
/// This function:
/// 1. Parses command-line arguments
/// 2. Initializes logging infrastructure
/// 3. Loads configuration from file
/// 4. Wires up the engine with the configured implementations
/// 5. Runs the engine until interrupted
#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let args = Args::parse();

	// Initialize tracing with env filter
	use tracing_subscriber::{fmt, EnvFilter};

	let env_filter = EnvFilter::try_from_default_env()
		.unwrap_or_else(|_| EnvFilter::new(args.log_level.clone()));

	fmt()
		.with_env_filter(env_filter)
		.with_thread_ids(true)
		.with_target(true)
		.init();

	tracing::info!("Started dispatch service");

	let config = Config::from_file(&args.config)
		.with_context(|| format!("loading {}", args.config.display()))?;
	tracing::info!("Loaded configuration [{}]", config.service.id);

	let engine = build_engine(config)?;
	engine.run().await.map_err(|e| anyhow::anyhow!(e))?;

	tracing::info!("Stopped dispatch service");
	Ok(())
}

/// Wires up the dispatch engine from configuration.
///
/// The in-memory bus stands in for the external broker; storage backends
/// come from the dispatch-storage factory list. Implementations named in
/// the configuration but unknown here are skipped with an error log, the
/// way a partially degraded deployment keeps the rest running.
fn build_engine(config: Config) -> anyhow::Result<DispatchEngine> {
	let storage = build_storage(&config)?;
	let bus = MemoryBus::default();

	// Inbound adapters.
	let mut consumers: Vec<Box<dyn IngestInterface>> = Vec::new();
	for (name, implementation_config) in &config.ingest.implementations {
		match name.as_str() {
			"memory" => {
				let topics = implementation_config
					.get("topics")
					.and_then(|v| v.as_array())
					.map(|items| {
						items
							.iter()
							.filter_map(|v| v.as_str().map(str::to_string))
							.collect()
					})
					.unwrap_or_default();
				let consumer = MemoryIngest::new(bus.clone(), topics);
				consumer
					.config_schema()
					.validate(implementation_config)
					.map_err(|e| anyhow::anyhow!("ingest.{}: {}", name, e))?;
				consumers.push(Box::new(consumer));
				tracing::info!(component = "ingest", implementation = %name, "Loaded");
			},
			other => {
				tracing::error!(
					component = "ingest",
					implementation = %other,
					"Unknown ingest implementation, skipping"
				);
			},
		}
	}
	if consumers.is_empty() {
		tracing::warn!("No ingest implementations available - the engine will see no events");
	}

	// Outbound adapter.
	let notify = match config.notify.primary.as_str() {
		"memory" => {
			let publisher = MemoryPublisher::new(bus.clone());
			let publisher_config = config
				.notify
				.implementations
				.get(&config.notify.primary)
				.expect("validated by Config::from_file");
			publisher
				.config_schema()
				.validate(publisher_config)
				.map_err(|e| anyhow::anyhow!("notify.{}: {}", config.notify.primary, e))?;
			NotifyService::new(Box::new(publisher), config.notify.publish_max_tries)
		},
		other => anyhow::bail!("Unknown notify implementation '{}'", other),
	};
	tracing::info!(component = "notify", implementation = %config.notify.primary, "Loaded");

	let directory = Arc::new(StorageFarmerDirectory::new(storage.clone()));
	let presence = Arc::new(PresenceRegistry::new());

	Ok(DispatchEngine::new(
		config,
		storage,
		directory,
		presence,
		Arc::new(IngestService::new(consumers)),
		Arc::new(notify),
	))
}

/// Creates the storage backend named in the configuration.
fn build_storage(config: &Config) -> anyhow::Result<Arc<StorageService>> {
	let name = config.storage.primary.as_str();
	let implementation_config = config
		.storage
		.implementations
		.get(name)
		.expect("validated by Config::from_file");

	let (_, factory) = dispatch_storage::implementations()
		.into_iter()
		.find(|(known, _)| *known == name)
		.with_context(|| format!("Unknown storage implementation '{}'", name))?;

	let backend =
		factory(implementation_config).map_err(|e| anyhow::anyhow!("storage.{}: {}", name, e))?;
	backend
		.config_schema()
		.validate(implementation_config)
		.map_err(|e| anyhow::anyhow!("storage.{}: {}", name, e))?;
	tracing::info!(component = "storage", implementation = %name, "Loaded");

	Ok(Arc::new(StorageService::new(backend)))
}
