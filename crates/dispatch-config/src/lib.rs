//! Configuration module for the printfarm dispatch engine.
//!
//! This module provides structures and utilities for managing dispatch
//! configuration. It supports loading configuration from TOML files and
//! provides validation to ensure all required configuration values are
//! properly set.
//!
//! Configurations can be split into multiple files: a top-level
//! `include = ["file1.toml", "file2.toml"]` merges additional files, with
//! each top-level section required to be unique across all files.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
	/// Error that occurs during file I/O operations.
	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),
	/// Error that occurs when parsing TOML configuration.
	#[error("Configuration error: {0}")]
	Parse(String),
	/// Error that occurs when configuration validation fails.
	#[error("Validation error: {0}")]
	Validation(String),
}

impl From<toml::de::Error> for ConfigError {
	fn from(err: toml::de::Error) -> Self {
		// Extract just the message without the huge input dump
		ConfigError::Parse(err.message().to_string())
	}
}

/// Main configuration structure for the dispatch engine.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
	/// Configuration specific to this service instance.
	pub service: ServiceConfig,
	/// Tunables of the sequential offer protocol.
	#[serde(default)]
	pub dispatch: DispatchConfig,
	/// Tunables of candidate ranking.
	#[serde(default)]
	pub matching: MatchingConfig,
	/// Configuration for the storage backend.
	pub storage: StorageConfig,
	/// Configuration for inbound bus adapters.
	pub ingest: IngestConfig,
	/// Configuration for outbound bus adapters.
	pub notify: NotifyConfig,
}

/// Configuration specific to the service instance.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceConfig {
	/// Unique identifier for this dispatcher instance.
	pub id: String,
}

/// Tunables of the sequential offer protocol.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DispatchConfig {
	/// How long a single offer stays open before it expires, in seconds.
	#[serde(default = "default_offer_expiry_secs")]
	pub offer_expiry_secs: u64,
	/// Retry policy for transient presence lookups.
	#[serde(default)]
	pub presence_retry: PresenceRetryConfig,
}

impl Default for DispatchConfig {
	fn default() -> Self {
		Self {
			offer_expiry_secs: default_offer_expiry_secs(),
			presence_retry: PresenceRetryConfig::default(),
		}
	}
}

/// Returns the default offer expiry in seconds.
///
/// Two minutes: long enough for a farmer to react to a notification,
/// short enough that an unresponsive farm does not stall the order.
fn default_offer_expiry_secs() -> u64 {
	120
}

/// Bounded-retry policy applied to transient presence lookups before a
/// candidate is degraded to ineligible.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PresenceRetryConfig {
	/// Maximum number of lookup tries, including the first.
	#[serde(default = "default_presence_max_tries")]
	pub max_tries: u32,
	/// Initial backoff between tries, in milliseconds; doubles per try.
	#[serde(default = "default_presence_backoff_ms")]
	pub initial_backoff_ms: u64,
}

impl Default for PresenceRetryConfig {
	fn default() -> Self {
		Self {
			max_tries: default_presence_max_tries(),
			initial_backoff_ms: default_presence_backoff_ms(),
		}
	}
}

fn default_presence_max_tries() -> u32 {
	3
}

fn default_presence_backoff_ms() -> u64 {
	50
}

/// Tunables of candidate ranking.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MatchingConfig {
	/// Farms farther than this from the order are ranked in the
	/// any-city fallback tier, in kilometers.
	#[serde(default = "default_search_radius_km")]
	pub search_radius_km: f64,
	/// Width of the distance buckets used for ranking, in kilometers.
	/// Farms inside the same bucket are ordered by reliability.
	#[serde(default = "default_distance_bucket_km")]
	pub distance_bucket_km: f64,
}

impl Default for MatchingConfig {
	fn default() -> Self {
		Self {
			search_radius_km: default_search_radius_km(),
			distance_bucket_km: default_distance_bucket_km(),
		}
	}
}

fn default_search_radius_km() -> f64 {
	50.0
}

fn default_distance_bucket_km() -> f64 {
	10.0
}

/// Configuration for the storage backend.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
	/// Which implementation to use as primary.
	pub primary: String,
	/// Map of storage implementation names to their configurations.
	pub implementations: HashMap<String, toml::Value>,
}

/// Configuration for inbound bus adapters.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IngestConfig {
	/// Map of ingest implementation names to their configurations.
	/// Each implementation has its own format stored as raw TOML values.
	pub implementations: HashMap<String, toml::Value>,
}

/// Configuration for outbound bus adapters.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NotifyConfig {
	/// Which implementation to use as primary.
	pub primary: String,
	/// Map of publisher implementation names to their configurations.
	pub implementations: HashMap<String, toml::Value>,
	/// Maximum publish retries before an event is parked in the retry
	/// buffer for the next flush.
	#[serde(default = "default_publish_max_tries")]
	pub publish_max_tries: u32,
	/// Seconds between retry flushes of parked notifications.
	#[serde(default = "default_flush_interval_secs")]
	pub flush_interval_secs: u64,
}

fn default_publish_max_tries() -> u32 {
	5
}

fn default_flush_interval_secs() -> u64 {
	30
}

impl Config {
	/// Loads configuration from a TOML file, merging `include`d files.
	///
	/// Each top-level section must be unique across the main file and all
	/// includes; a duplicate section is a validation error rather than a
	/// silent override.
	pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
		let path = path.as_ref();
		let content = std::fs::read_to_string(path)?;
		let mut main: toml::Value = toml::from_str(&content)?;

		let includes = extract_includes(&main)?;
		if !includes.is_empty() {
			let base = path.parent().unwrap_or_else(|| Path::new("."));
			merge_includes(&mut main, &includes, base)?;
		}

		let combined = toml::to_string(&main)
			.map_err(|e| ConfigError::Parse(format!("Failed to serialize combined config: {}", e)))?;
		let config: Config = toml::from_str(&combined)?;
		config.validate()?;
		Ok(config)
	}

	/// Parses configuration from an in-memory TOML string.
	pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
		let config: Config = toml::from_str(content)?;
		config.validate()?;
		Ok(config)
	}

	/// Cross-section validation beyond what serde enforces.
	fn validate(&self) -> Result<(), ConfigError> {
		if self.service.id.is_empty() {
			return Err(ConfigError::Validation("service.id must not be empty".into()));
		}
		if self.dispatch.offer_expiry_secs == 0 {
			return Err(ConfigError::Validation(
				"dispatch.offer_expiry_secs must be positive".into(),
			));
		}
		if self.dispatch.presence_retry.max_tries == 0 {
			return Err(ConfigError::Validation(
				"dispatch.presence_retry.max_tries must be positive".into(),
			));
		}
		if self.matching.search_radius_km <= 0.0 || self.matching.distance_bucket_km <= 0.0 {
			return Err(ConfigError::Validation(
				"matching radii must be positive".into(),
			));
		}
		if !self.storage.implementations.contains_key(&self.storage.primary) {
			return Err(ConfigError::Validation(format!(
				"storage.primary '{}' has no matching implementation section",
				self.storage.primary
			)));
		}
		if !self.notify.implementations.contains_key(&self.notify.primary) {
			return Err(ConfigError::Validation(format!(
				"notify.primary '{}' has no matching implementation section",
				self.notify.primary
			)));
		}
		Ok(())
	}
}

/// Extracts the optional top-level `include` directive.
fn extract_includes(main: &toml::Value) -> Result<Vec<String>, ConfigError> {
	match main.get("include") {
		None => Ok(Vec::new()),
		Some(toml::Value::String(path)) => Ok(vec![path.clone()]),
		Some(toml::Value::Array(items)) => items
			.iter()
			.map(|item| {
				item.as_str().map(str::to_string).ok_or_else(|| {
					ConfigError::Validation("Include array must contain only strings".into())
				})
			})
			.collect(),
		Some(_) => Err(ConfigError::Validation(
			"Include must be a string or array of strings".into(),
		)),
	}
}

/// Merges included files into the main table, refusing duplicate sections.
fn merge_includes(
	main: &mut toml::Value,
	includes: &[String],
	base: &Path,
) -> Result<(), ConfigError> {
	let table = main
		.as_table_mut()
		.ok_or_else(|| ConfigError::Parse("Top level must be a table".into()))?;
	table.remove("include");

	for include in includes {
		let include_path = base.join(include);
		let content = std::fs::read_to_string(&include_path)?;
		let included: toml::Value = toml::from_str(&content)?;
		let included_table = included
			.as_table()
			.ok_or_else(|| ConfigError::Parse("Included file must be a table".into()))?;

		for (key, value) in included_table {
			if table.contains_key(key) {
				return Err(ConfigError::Validation(format!(
					"Section '{}' defined in both the main file and {}",
					key,
					include_path.display()
				)));
			}
			table.insert(key.clone(), value.clone());
		}
	}
	Ok(())
}
