//! # swarm-core
//!
//! Core types, events, and error types shared by every crate in the swarm
//! workspace: node identifiers, the local role, the event bus, and the unified
//! error type.

pub mod error;
pub mod event;
pub mod types;

pub use error::{Result, SwarmError};
pub use event::{Event, EventBus};
pub use types::*;
