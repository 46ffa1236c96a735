//! Storage-related types for the dispatch engine.

use std::str::FromStr;

/// Storage namespaces for the persisted collections.
///
/// This enum provides type safety for storage operations by replacing
/// string literals with strongly typed variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageKey {
	/// Namespace for order records.
	Orders,
	/// Namespace for offer attempt records.
	OfferAttempts,
	/// Namespace for farmer directory profiles.
	Farmers,
}

impl StorageKey {
	/// Returns the string representation of the storage key.
	pub fn as_str(&self) -> &'static str {
		match self {
			StorageKey::Orders => "orders",
			StorageKey::OfferAttempts => "offer_attempts",
			StorageKey::Farmers => "farmers",
		}
	}

	/// Returns an iterator over all StorageKey variants.
	pub fn all() -> impl Iterator<Item = Self> {
		[Self::Orders, Self::OfferAttempts, Self::Farmers].into_iter()
	}
}

impl FromStr for StorageKey {
	type Err = ();

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"orders" => Ok(Self::Orders),
			"offer_attempts" => Ok(Self::OfferAttempts),
			"farmers" => Ok(Self::Farmers),
			_ => Err(()),
		}
	}
}

impl From<StorageKey> for &'static str {
	fn from(key: StorageKey) -> Self {
		key.as_str()
	}
}
