//! Storage module for the dispatch engine.
//!
//! This module provides abstractions for persisting dispatch data,
//! supporting different backend implementations such as in-memory or
//! file-based storage. On top of the raw key-value interface it exposes the
//! typed [`OrderStore`] view consumed by the dispatch core.

use async_trait::async_trait;
use dispatch_types::{ConfigSchema, Order, OrderStatus, StorageKey};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Re-export implementations
pub mod implementations {
	pub mod file;
	pub mod memory;
}

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
	/// Error that occurs when a requested item is not found.
	#[error("Not found")]
	NotFound,
	/// Error that occurs during serialization/deserialization.
	#[error("Serialization error: {0}")]
	Serialization(String),
	/// Error that occurs in the storage backend.
	#[error("Backend error: {0}")]
	Backend(String),
	/// Error that occurs during configuration validation.
	#[error("Configuration error: {0}")]
	Configuration(String),
}

/// Trait defining the low-level interface for storage backends.
///
/// This trait must be implemented by any storage backend that wants to
/// integrate with the dispatch engine. It provides basic key-value
/// operations plus per-namespace key enumeration, which the order store
/// needs for its pending-order scan.
#[async_trait]
pub trait StorageInterface: Send + Sync {
	/// Retrieves raw bytes for the given key.
	async fn get_bytes(&self, key: &str) -> Result<Vec<u8>, StorageError>;

	/// Stores raw bytes under the given key.
	async fn set_bytes(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError>;

	/// Deletes the value associated with the given key.
	async fn delete(&self, key: &str) -> Result<(), StorageError>;

	/// Checks if a key exists in storage.
	async fn exists(&self, key: &str) -> Result<bool, StorageError>;

	/// Lists all keys starting with the given prefix.
	async fn keys(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

	/// Returns the configuration schema for validation.
	fn config_schema(&self) -> Box<dyn ConfigSchema>;
}

/// Type alias for storage factory functions.
pub type StorageFactory = fn(&toml::Value) -> Result<Box<dyn StorageInterface>, StorageError>;

/// All registered storage implementations as (name, factory) pairs.
///
/// Used by the service wiring to construct the backend named in the
/// configuration.
pub fn implementations() -> Vec<(&'static str, StorageFactory)> {
	use implementations::{file, memory};

	vec![
		("file", file::create_storage as StorageFactory),
		("memory", memory::create_storage as StorageFactory),
	]
}

/// High-level storage service that provides typed operations.
///
/// The StorageService wraps a low-level storage backend and provides
/// convenient methods for storing and retrieving typed data with
/// automatic serialization/deserialization.
pub struct StorageService {
	/// The underlying storage backend implementation.
	backend: Box<dyn StorageInterface>,
}

impl StorageService {
	/// Creates a new StorageService with the specified backend.
	pub fn new(backend: Box<dyn StorageInterface>) -> Self {
		Self { backend }
	}

	/// Stores a serializable value.
	///
	/// The namespace and id are combined to form a unique key. The data is
	/// serialized to JSON before storage.
	pub async fn store<T: Serialize>(
		&self,
		namespace: &str,
		id: &str,
		data: &T,
	) -> Result<(), StorageError> {
		let key = format!("{}:{}", namespace, id);
		let bytes =
			serde_json::to_vec(data).map_err(|e| StorageError::Serialization(e.to_string()))?;
		self.backend.set_bytes(&key, bytes).await
	}

	/// Retrieves and deserializes a value from storage.
	pub async fn retrieve<T: DeserializeOwned>(
		&self,
		namespace: &str,
		id: &str,
	) -> Result<T, StorageError> {
		let key = format!("{}:{}", namespace, id);
		let bytes = self.backend.get_bytes(&key).await?;
		serde_json::from_slice(&bytes).map_err(|e| StorageError::Serialization(e.to_string()))
	}

	/// Removes a value from storage.
	pub async fn remove(&self, namespace: &str, id: &str) -> Result<(), StorageError> {
		let key = format!("{}:{}", namespace, id);
		self.backend.delete(&key).await
	}

	/// Updates an existing value in storage.
	///
	/// This method first checks if the key exists, then updates the value.
	/// Returns an error if the key doesn't exist, making it semantically
	/// different from store() which will create or overwrite.
	pub async fn update<T: Serialize>(
		&self,
		namespace: &str,
		id: &str,
		data: &T,
	) -> Result<(), StorageError> {
		let key = format!("{}:{}", namespace, id);

		if !self.backend.exists(&key).await? {
			return Err(StorageError::NotFound);
		}

		let bytes =
			serde_json::to_vec(data).map_err(|e| StorageError::Serialization(e.to_string()))?;
		self.backend.set_bytes(&key, bytes).await
	}

	/// Checks if a value exists in storage.
	pub async fn exists(&self, namespace: &str, id: &str) -> Result<bool, StorageError> {
		let key = format!("{}:{}", namespace, id);
		self.backend.exists(&key).await
	}

	/// Lists the ids stored under a namespace.
	pub async fn ids(&self, namespace: &str) -> Result<Vec<String>, StorageError> {
		let prefix = format!("{}:", namespace);
		let keys = self.backend.keys(&prefix).await?;
		Ok(keys
			.into_iter()
			.filter_map(|k| k.strip_prefix(&prefix).map(str::to_string))
			.collect())
	}
}

/// Typed view of the order collection, the storage collaborator interface
/// the dispatch core consumes.
pub struct OrderStore {
	storage: Arc<StorageService>,
}

impl OrderStore {
	pub fn new(storage: Arc<StorageService>) -> Self {
		Self { storage }
	}

	/// Fetches one order by id.
	pub async fn get(&self, order_id: &str) -> Result<Order, StorageError> {
		self.storage.retrieve(StorageKey::Orders.as_str(), order_id).await
	}

	/// Persists an order, creating or overwriting.
	pub async fn save(&self, order: &Order) -> Result<(), StorageError> {
		self.storage
			.store(StorageKey::Orders.as_str(), &order.id, order)
			.await
	}

	/// Returns the orders stranded before assignment: still `Pending` or
	/// `Dispatching`. Used by startup recovery to re-spawn dispatchers.
	pub async fn find_pending_unassigned(&self) -> Result<Vec<Order>, StorageError> {
		let namespace = StorageKey::Orders.as_str();
		let mut pending = Vec::new();
		for id in self.storage.ids(namespace).await? {
			match self.storage.retrieve::<Order>(namespace, &id).await {
				Ok(order)
					if matches!(
						order.status,
						OrderStatus::Pending | OrderStatus::Dispatching
					) =>
				{
					pending.push(order)
				},
				Ok(_) => {},
				// A record deleted between listing and retrieval is not an error.
				Err(StorageError::NotFound) => {},
				Err(e) => return Err(e),
			}
		}
		// Deterministic scan order for recovery and for tests.
		pending.sort_by(|a, b| a.id.cmp(&b.id));
		Ok(pending)
	}
}
