//! Storage-backed farmer directory.
//!
//! Reads farmer profiles from the shared storage service. Profile records
//! are owned by the marketplace's registration surface; this adapter only
//! reads them for candidate selection.

use async_trait::async_trait;
use dispatch_matching::{FarmerDirectory, MatchError};
use dispatch_storage::StorageService;
use dispatch_types::{FarmerProfile, StorageKey};
use std::sync::Arc;

/// Farmer directory reading profiles from the storage backend.
pub struct StorageFarmerDirectory {
	storage: Arc<StorageService>,
}

impl StorageFarmerDirectory {
	pub fn new(storage: Arc<StorageService>) -> Self {
		Self { storage }
	}
}

#[async_trait]
impl FarmerDirectory for StorageFarmerDirectory {
	async fn farmers(&self) -> Result<Vec<FarmerProfile>, MatchError> {
		let namespace = StorageKey::Farmers.as_str();
		let ids = self
			.storage
			.ids(namespace)
			.await
			.map_err(|e| MatchError::Directory(e.to_string()))?;

		let mut farmers = Vec::with_capacity(ids.len());
		for id in ids {
			match self.storage.retrieve::<FarmerProfile>(namespace, &id).await {
				Ok(profile) => farmers.push(profile),
				Err(e) => {
					tracing::warn!(farmer = %id, error = %e, "Skipping unreadable farmer profile");
				},
			}
		}
		Ok(farmers)
	}
}
