//! Network layer subsystem.
//!
//! # Design Decisions
//! - Listeners are bound before the actor group runs, so bind failures
//!   abort startup with a clear error
//! - Each server owns exactly one listener

pub mod listener;

pub use listener::{bind, parse_address, ListenerError};
