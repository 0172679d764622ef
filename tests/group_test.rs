//! Actor group behavior under randomized actor counts and finish orders.

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::oneshot;

use chronostore::lifecycle::{ActorError, Group};

struct Markers {
    finished: Vec<Arc<AtomicBool>>,
    interrupts: Vec<Arc<AtomicUsize>>,
}

/// Actor 0 returns after `trigger_delay`; every other actor blocks until
/// interrupted and then lingers for a random while before returning.
fn randomized_group(count: usize, trigger_delay: Duration, trigger: Result<(), ActorError>) -> (Group, Markers) {
    let mut rng = rand::thread_rng();
    let mut group = Group::new();
    let mut markers = Markers {
        finished: Vec::new(),
        interrupts: Vec::new(),
    };

    for idx in 0..count {
        let finished = Arc::new(AtomicBool::new(false));
        let interrupts = Arc::new(AtomicUsize::new(0));
        markers.finished.push(finished.clone());
        markers.interrupts.push(interrupts.clone());

        if idx == 0 {
            let outcome = trigger.clone();
            group.add(
                "trigger",
                async move {
                    tokio::time::sleep(trigger_delay).await;
                    finished.store(true, Ordering::SeqCst);
                    outcome
                },
                move |_| {
                    interrupts.fetch_add(1, Ordering::SeqCst);
                },
            );
            continue;
        }

        let linger = Duration::from_millis(rng.gen_range(0..40));
        let outcome = if rng.gen_bool(0.5) {
            Ok(())
        } else {
            Err(ActorError::Fatal(format!("late failure {idx}")))
        };
        let (tx, rx) = oneshot::channel::<()>();
        group.add(
            format!("worker-{idx}"),
            async move {
                let _ = rx.await;
                tokio::time::sleep(linger).await;
                finished.store(true, Ordering::SeqCst);
                outcome
            },
            move |_| {
                interrupts.fetch_add(1, Ordering::SeqCst);
                drop(tx);
            },
        );
    }
    (group, markers)
}

#[tokio::test]
async fn run_returns_first_outcome_and_waits_for_all() {
    let mut rng = rand::thread_rng();
    for round in 0..20 {
        let count = rng.gen_range(1..8);
        let delay = Duration::from_millis(rng.gen_range(0..20));
        let trigger = if round % 2 == 0 {
            Ok(())
        } else {
            Err(ActorError::Fatal("first".into()))
        };
        let (group, markers) = randomized_group(count, delay, trigger);

        let outcome = common::within(group.run()).await;
        if round % 2 == 0 {
            assert!(outcome.is_ok(), "round {round}: {outcome:?}");
        } else {
            assert_eq!(outcome.unwrap_err().to_string(), "first");
        }

        for (idx, finished) in markers.finished.iter().enumerate() {
            assert!(finished.load(Ordering::SeqCst), "round {round}: actor {idx} still running");
        }
        assert_eq!(markers.interrupts[0].load(Ordering::SeqCst), 0);
        for interrupts in &markers.interrupts[1..] {
            assert_eq!(interrupts.load(Ordering::SeqCst), 1);
        }
    }
}

#[tokio::test]
async fn empty_group_does_not_block() {
    let outcome = tokio::time::timeout(Duration::from_millis(50), Group::new().run())
        .await
        .expect("empty group returned");
    assert!(outcome.is_ok());
}

#[tokio::test]
async fn sleeping_actor_stops_blocked_sibling() {
    let a_returned = Arc::new(Mutex::new(None::<Instant>));
    let b_interrupted = Arc::new(Mutex::new(None::<Instant>));
    let mut group = Group::new();

    let returned = a_returned.clone();
    group.add(
        "a",
        async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            *returned.lock().unwrap() = Some(Instant::now());
            Ok(())
        },
        |_| {},
    );

    let interrupted = b_interrupted.clone();
    let (tx, rx) = oneshot::channel::<()>();
    group.add(
        "b",
        async move {
            let _ = rx.await;
            Err(ActorError::Canceled)
        },
        move |_| {
            *interrupted.lock().unwrap() = Some(Instant::now());
            drop(tx);
        },
    );

    let started = Instant::now();
    let outcome = common::within(group.run()).await;
    let elapsed = started.elapsed();

    assert!(outcome.is_ok());
    assert!(elapsed >= Duration::from_millis(50));
    assert!(elapsed < Duration::from_secs(2), "took {elapsed:?}");

    let returned = a_returned.lock().unwrap().expect("a returned");
    let interrupted = b_interrupted.lock().unwrap().expect("b interrupted");
    let lag = interrupted.saturating_duration_since(returned);
    assert!(lag < Duration::from_millis(100), "interrupt lagged {lag:?}");
}

#[tokio::test]
async fn canceled_sibling_does_not_replace_trigger() {
    let mut group = Group::new();
    group.add("failing", async { Err(ActorError::Fatal("disk full".into())) }, |_| {});
    common::add_blocking_actor(&mut group, "waiter");

    let outcome = common::within(group.run()).await;
    assert_eq!(outcome.unwrap_err().to_string(), "disk full");
}
