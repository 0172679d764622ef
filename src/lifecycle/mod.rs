//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Build registry/tracer → Bind listeners → Register actors → Run group
//!
//! Group (group.rs):
//!     First actor returns → Interrupt all others → Join all → Trigger outcome
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Clean outcome → Group shuts down
//!
//! Shutdown (shutdown.rs):
//!     Interrupt → trigger → serving actors drain and return
//! ```
//!
//! # Design Decisions
//! - Every subsystem is an actor: an execute future plus a non-blocking
//!   interrupt
//! - Shutdown waits for every actor; slow ones are named in periodic warnings

pub mod actor;
pub mod group;
pub mod shutdown;
pub mod signals;
pub mod startup;

pub use actor::{ActorError, Outcome};
pub use group::Group;
pub use shutdown::{Shutdown, ShutdownSignal};
pub use signals::SignalWatcher;
pub use startup::{ServiceKind, StartupError};
