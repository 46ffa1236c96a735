//! Farmer profile types supplied by the directory collaborator.

use serde::{Deserialize, Serialize};

/// A registered printer owner as recorded in the farmer directory.
///
/// Profiles are collaborator-owned reference data; the dispatch core reads
/// them through the directory trait and never mutates them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FarmerProfile {
	/// Verified farmer identity.
	pub id: String,
	/// City the farm operates from.
	pub city: String,
	pub lat: f64,
	pub lon: f64,
	/// Materials this farm can print, e.g. ["PLA", "PETG"].
	#[serde(default)]
	pub materials: Vec<String>,
	/// Print modes this farm supports, e.g. ["draft", "quality"].
	#[serde(default)]
	pub modes: Vec<String>,
	/// Historical reliability score in [0, 1].
	pub reliability: f64,
	/// Whether the farm currently has capacity for another job.
	pub has_capacity: bool,
}

impl FarmerProfile {
	/// Whether this farm can print the given material in the given mode.
	pub fn supports(&self, material: &str, mode: &str) -> bool {
		self.materials.iter().any(|m| m == material) && self.modes.iter().any(|m| m == mode)
	}
}
