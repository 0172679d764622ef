//! Actor lifecycle group.
//!
//! Runs every registered actor concurrently. The first actor to return, with
//! any outcome, decides the group's result and causes every other actor to
//! be interrupted. The group then joins all of them before returning.

use std::collections::BTreeSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::Instrument;

use crate::lifecycle::actor::{panic_message, Actor, ActorError, Outcome};

/// An ordered set of actors run together for the lifetime of a process.
///
/// [`Group::run`] consumes the group, so it can run at most once and no actor
/// can be added after the run has started.
#[derive(Debug, Default)]
pub struct Group {
    actors: Vec<Actor>,
    shutdown_warning: Option<Duration>,
}

impl Group {
    /// Create an empty group.
    pub fn new() -> Self {
        Self::default()
    }

    /// Log the names of actors still running after interrupt, once per `period`.
    pub fn with_shutdown_warning(mut self, period: Duration) -> Self {
        self.shutdown_warning = Some(period).filter(|p| !p.is_zero());
        self
    }

    /// Register an actor.
    ///
    /// `execute` does not start until [`Group::run`] is called. `interrupt` is
    /// called at most once, possibly while `execute` is still running, and must
    /// not wait for `execute` to finish.
    pub fn add<E, I>(&mut self, name: impl Into<String>, execute: E, interrupt: I)
    where
        E: Future<Output = Outcome> + Send + 'static,
        I: FnOnce(&Outcome) + Send + 'static,
    {
        let actor = Actor::new(name, execute, interrupt);
        tracing::debug!(actor = %actor.name, "Actor registered");
        self.actors.push(actor);
    }

    /// Number of registered actors.
    pub fn len(&self) -> usize {
        self.actors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actors.is_empty()
    }

    /// Run all actors and return the outcome of the first one to finish.
    pub async fn run(self) -> Outcome {
        if self.actors.is_empty() {
            return Ok(());
        }

        let count = self.actors.len();
        let (done_tx, mut done_rx) = mpsc::channel::<(usize, Outcome)>(count);
        let mut tasks = JoinSet::new();
        let mut names = Vec::with_capacity(count);
        let mut interrupts = Vec::with_capacity(count);

        for (idx, actor) in self.actors.into_iter().enumerate() {
            let Actor {
                name,
                execute,
                interrupt,
            } = actor;
            let done_tx = done_tx.clone();
            let task_name = name.clone();
            let span = tracing::info_span!("actor", actor = %name);
            let task = async move {
                let outcome = match AssertUnwindSafe(execute).catch_unwind().await {
                    Ok(outcome) => outcome,
                    Err(payload) => Err(ActorError::Panicked {
                        actor: task_name,
                        message: panic_message(payload.as_ref()),
                    }),
                };
                // Capacity equals the actor count, so this never waits.
                let _ = done_tx.send((idx, outcome)).await;
            };
            tasks.spawn(task.instrument(span));
            names.push(name);
            interrupts.push(Some(interrupt));
        }
        drop(done_tx);

        tracing::debug!(actors = count, "Actor group started");

        let Some((first, trigger)) = done_rx.recv().await else {
            // Every task ended without reporting; only possible if the runtime
            // is shutting down underneath us.
            while tasks.join_next().await.is_some() {}
            return Err(ActorError::Fatal("actor group lost all actors".into()));
        };

        match &trigger {
            Ok(()) => tracing::info!(actor = %names[first], "Actor finished, shutting down group"),
            Err(e) => tracing::info!(actor = %names[first], error = %e, "Actor failed, shutting down group"),
        }

        let mut interrupt_calls = JoinSet::new();
        for (idx, slot) in interrupts.iter_mut().enumerate() {
            if idx == first {
                continue;
            }
            if let Some(interrupt) = slot.take() {
                let trigger = trigger.clone();
                let name = names[idx].clone();
                interrupt_calls.spawn_blocking(move || {
                    tracing::debug!(actor = %name, "Interrupting actor");
                    interrupt(&trigger);
                });
            }
        }

        let mut pending: BTreeSet<usize> = (0..count).filter(|&i| i != first).collect();
        let mut warning = self.shutdown_warning.map(|period| {
            tokio::time::interval_at(tokio::time::Instant::now() + period, period)
        });

        while !pending.is_empty() {
            tokio::select! {
                next = done_rx.recv() => {
                    let Some((idx, outcome)) = next else { break };
                    pending.remove(&idx);
                    match outcome {
                        Err(e) if !e.is_canceled() => {
                            tracing::error!(actor = %names[idx], error = %e, "Actor failed during shutdown");
                        }
                        Err(_) => tracing::debug!(actor = %names[idx], "Actor canceled"),
                        Ok(()) => tracing::debug!(actor = %names[idx], "Actor stopped"),
                    }
                }
                _ = tick(&mut warning) => {
                    let waiting: Vec<&str> = pending.iter().map(|&i| names[i].as_str()).collect();
                    tracing::warn!(actors = ?waiting, "Still waiting for actors to stop");
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Actor task aborted");
            }
        }
        while let Some(joined) = interrupt_calls.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Actor interrupt panicked");
            }
        }

        trigger
    }
}

async fn tick(interval: &mut Option<tokio::time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
