//! Actor definitions shared by every lifecycle component.
//!
//! An actor is a pair of operations:
//! - `execute`: a future that runs until the unit's work completes or it is
//!   asked to stop, and resolves to an [`Outcome`]
//! - `interrupt`: a one-shot, non-blocking request to stop, receiving the
//!   outcome that triggered the shutdown

use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use thiserror::Error;

/// Terminal result of an actor's execute operation.
pub type Outcome = Result<(), ActorError>;

/// Failure side of an [`Outcome`].
///
/// Cloneable so the trigger outcome can be handed to every interrupt and
/// still be returned from [`Group::run`](crate::lifecycle::Group::run).
#[derive(Debug, Clone, Error)]
pub enum ActorError {
    /// The actor was unblocked because a sibling already triggered shutdown.
    #[error("canceled")]
    Canceled,

    /// The actor's work failed.
    #[error("{context}: {source}")]
    Failed {
        context: String,
        source: Arc<dyn StdError + Send + Sync>,
    },

    /// The actor gave up with a plain message.
    #[error("{0}")]
    Fatal(String),

    /// The actor's execute future panicked.
    #[error("actor {actor} panicked: {message}")]
    Panicked { actor: String, message: String },
}

impl ActorError {
    /// Wrap an underlying error with a short description of what was being done.
    pub fn failed<E>(context: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        ActorError::Failed {
            context: context.into(),
            source: Arc::new(source),
        }
    }

    /// Whether this is the sibling-triggered cancellation condition.
    pub fn is_canceled(&self) -> bool {
        matches!(self, ActorError::Canceled)
    }
}

pub(crate) type Interrupt = Box<dyn FnOnce(&Outcome) + Send + 'static>;

/// A registered unit of concurrent work.
pub(crate) struct Actor {
    pub(crate) name: String,
    pub(crate) execute: BoxFuture<'static, Outcome>,
    pub(crate) interrupt: Interrupt,
}

impl Actor {
    pub(crate) fn new<E, I>(name: impl Into<String>, execute: E, interrupt: I) -> Self
    where
        E: Future<Output = Outcome> + Send + 'static,
        I: FnOnce(&Outcome) + Send + 'static,
    {
        Self {
            name: name.into(),
            execute: execute.boxed(),
            interrupt: Box::new(interrupt),
        }
    }
}

impl fmt::Debug for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Actor").field("name", &self.name).finish_non_exhaustive()
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Box<dyn Any>".to_string()
    }
}
