//! Common types module for the printfarm dispatch engine.
//!
//! This module defines the core data types and structures shared by the
//! dispatch subsystem. It provides a centralized location for the data model
//! to ensure consistency across all dispatch components.

/// Message bus envelope and event kind types.
pub mod bus;
/// Internal engine events for in-process communication.
pub mod events;
/// Farmer profile types supplied by the directory collaborator.
pub mod farmer;
/// Offer attempt types for the sequential offer protocol.
pub mod offer;
/// Order types including lifecycle status and print requirements.
pub mod order;
/// Presence entry and presence event types.
pub mod presence;
/// Storage namespace keys for persisted collections.
pub mod storage;
/// Utility functions shared across crates.
pub mod utils;
/// Configuration validation types for ensuring type-safe configurations.
pub mod validation;

// Re-export all types for convenient access
pub use bus::*;
pub use events::*;
pub use farmer::*;
pub use offer::*;
pub use order::*;
pub use presence::*;
pub use storage::*;
pub use utils::{current_timestamp, truncate_id};
pub use validation::*;
