//! Core dispatch engine for the printfarm marketplace.
//!
//! This crate owns the order lifecycle: the state machine that is the
//! single source of truth for transitions, the sequential one-at-a-time
//! offer protocol with timeout and fallback, the per-order actor model
//! that serializes all operations on one order, and the event loop wiring
//! presence events, order commands and outbound notifications together.

pub mod dispatcher;
pub mod engine;
pub mod handlers;
pub mod recovery;
pub mod state;

pub use dispatcher::{DispatchError, DispatcherHandle, DispatcherSettings, SequentialDispatcher};
pub use engine::{DispatchEngine, EngineError};
pub use state::{OrderStateMachine, StateError};
