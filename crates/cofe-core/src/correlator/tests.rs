use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use super::*;

fn short_lived(max_waiters: usize) -> Correlator {
    Correlator::new(CorrelatorConfig {
        retention: Duration::from_secs(60),
        max_pending_age: Duration::from_secs(30),
        max_waiters,
    })
}

/// Yield until `id` has `n` suspended waiters.
async fn wait_for_waiters(correlator: &Correlator, id: &str, n: usize) {
    for _ in 0..1000 {
        if correlator.status(id).await.unwrap().waiters == n {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("never saw {n} waiters on {id}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_registration_yields_distinct_ids() {
    let correlator = Arc::new(Correlator::with_defaults());

    let mut handles = Vec::new();
    for _ in 0..64 {
        let c = Arc::clone(&correlator);
        handles.push(tokio::spawn(async move {
            let mut ids = Vec::with_capacity(250);
            for _ in 0..250 {
                ids.push(c.register().await);
            }
            ids
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        for id in handle.await.unwrap() {
            assert!(seen.insert(id), "duplicate id issued");
        }
    }
    assert_eq!(seen.len(), 64 * 250);
    assert_eq!(correlator.len().await, 64 * 250);
}

#[tokio::test]
async fn fulfill_then_await_returns_answer() {
    let correlator = Correlator::with_defaults();
    let id = correlator.register().await;

    correlator.fulfill(id.as_str(), "X").await.unwrap();

    let outcome = correlator
        .await_result(id.as_str(), Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Fulfilled("X".into()));
}

#[tokio::test]
async fn waiter_is_woken_by_later_fulfill() {
    let correlator = Arc::new(Correlator::with_defaults());
    let id = correlator.register().await;

    let waiter = {
        let c = Arc::clone(&correlator);
        let id = id.clone();
        tokio::spawn(async move { c.await_result(id.as_str(), Duration::from_secs(5)).await })
    };
    wait_for_waiters(&correlator, id.as_str(), 1).await;

    correlator.fulfill(id.as_str(), "hi there").await.unwrap();

    let outcome = waiter.await.unwrap().unwrap();
    assert_eq!(outcome, Outcome::Fulfilled("hi there".into()));
    assert!(correlator.status(id.as_str()).await.unwrap().delivered);
}

#[tokio::test]
async fn duplicate_fulfill_keeps_first_text() {
    let correlator = Correlator::with_defaults();
    let id = correlator.register().await;

    correlator.fulfill(id.as_str(), "first").await.unwrap();
    let second = correlator.fulfill(id.as_str(), "second").await;

    assert!(matches!(
        second,
        Err(CorrelatorError::DuplicateDelivery { state: "fulfilled", .. })
    ));
    let status = correlator.status(id.as_str()).await.unwrap();
    assert_eq!(status.state, RequestState::Fulfilled("first".into()));
}

#[tokio::test]
async fn fail_after_fulfill_is_duplicate() {
    let correlator = Correlator::with_defaults();
    let id = correlator.register().await;

    correlator.fulfill(id.as_str(), "answer").await.unwrap();
    let result = correlator.fail(id.as_str(), "late error").await;

    assert!(matches!(result, Err(CorrelatorError::DuplicateDelivery { .. })));
    let outcome = correlator
        .await_result(id.as_str(), Duration::from_millis(10))
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Fulfilled("answer".into()));
}

#[tokio::test]
async fn fail_then_await_returns_reason() {
    let correlator = Correlator::with_defaults();
    let id = correlator.register().await;

    correlator.fail(id.as_str(), "workflow crashed").await.unwrap();

    let outcome = correlator
        .await_result(id.as_str(), Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Failed("workflow crashed".into()));
}

#[tokio::test]
async fn unknown_id_is_not_found() {
    let correlator = Correlator::with_defaults();

    let awaited = correlator
        .await_result("never-registered", Duration::from_millis(10))
        .await;
    assert!(matches!(awaited, Err(CorrelatorError::NotFound(_))));

    assert!(matches!(
        correlator.fulfill("never-registered", "x").await,
        Err(CorrelatorError::NotFound(_))
    ));
    assert!(matches!(
        correlator.fail("never-registered", "x").await,
        Err(CorrelatorError::NotFound(_))
    ));
    assert!(matches!(
        correlator.status("never-registered").await,
        Err(CorrelatorError::NotFound(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn unresolved_wait_times_out_within_margin() {
    let correlator = Correlator::with_defaults();
    let id = correlator.register().await;

    let started = Instant::now();
    let outcome = correlator
        .await_result(id.as_str(), Duration::from_millis(100))
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(outcome, Outcome::TimedOut);
    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed <= Duration::from_millis(150), "took {elapsed:?}");

    // A timed-out wait leaves the entry pending and not delivered.
    let status = correlator.status(id.as_str()).await.unwrap();
    assert_eq!(status.state, RequestState::Pending);
    assert!(!status.delivered);
    assert_eq!(status.waiters, 0);
}

#[tokio::test]
async fn all_concurrent_waiters_see_the_same_answer() {
    let correlator = Arc::new(short_lived(3));
    let id = correlator.register().await;

    let mut waiters = Vec::new();
    for _ in 0..3 {
        let c = Arc::clone(&correlator);
        let id = id.clone();
        waiters.push(tokio::spawn(async move {
            c.await_result(id.as_str(), Duration::from_secs(5)).await
        }));
    }
    wait_for_waiters(&correlator, id.as_str(), 3).await;

    correlator.fulfill(id.as_str(), "broadcast").await.unwrap();

    for waiter in waiters {
        assert_eq!(
            waiter.await.unwrap().unwrap(),
            Outcome::Fulfilled("broadcast".into())
        );
    }
}

#[tokio::test]
async fn waiter_beyond_limit_is_rejected() {
    let correlator = Arc::new(short_lived(2));
    let id = correlator.register().await;

    let mut waiters = Vec::new();
    for _ in 0..2 {
        let c = Arc::clone(&correlator);
        let id = id.clone();
        waiters.push(tokio::spawn(async move {
            c.await_result(id.as_str(), Duration::from_secs(5)).await
        }));
    }
    wait_for_waiters(&correlator, id.as_str(), 2).await;

    let third = correlator
        .await_result(id.as_str(), Duration::from_secs(5))
        .await;
    assert!(matches!(
        third,
        Err(CorrelatorError::TooManyWaiters { limit: 2, .. })
    ));

    correlator.fail(id.as_str(), "done").await.unwrap();
    for waiter in waiters {
        assert_eq!(waiter.await.unwrap().unwrap(), Outcome::Failed("done".into()));
    }
}

#[tokio::test]
async fn dropped_waiter_releases_its_slot() {
    let correlator = Arc::new(short_lived(1));
    let id = correlator.register().await;

    let abandoned = {
        let c = Arc::clone(&correlator);
        let id = id.clone();
        tokio::spawn(async move { c.await_result(id.as_str(), Duration::from_secs(60)).await })
    };
    wait_for_waiters(&correlator, id.as_str(), 1).await;

    // Simulates a client disconnect dropping the handler future.
    abandoned.abort();
    let _ = abandoned.await;
    wait_for_waiters(&correlator, id.as_str(), 0).await;

    correlator.fulfill(id.as_str(), "still delivered").await.unwrap();
    let outcome = correlator
        .await_result(id.as_str(), Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Fulfilled("still delivered".into()));
}

#[tokio::test]
async fn sweep_past_retention_reaps_pending_entry() {
    let correlator = short_lived(4);
    let id = correlator.register().await;

    let later = Instant::now() + correlator.config().retention + Duration::from_secs(1);
    let report = correlator.sweep(later).await;

    assert_eq!(report.expired, vec![id.clone()]);
    assert!(matches!(
        correlator
            .await_result(id.as_str(), Duration::from_millis(10))
            .await,
        Err(CorrelatorError::NotFound(_))
    ));
    assert!(correlator.is_empty().await);
}

#[tokio::test]
async fn sweep_keeps_fresh_pending_entries() {
    let correlator = short_lived(4);
    let id = correlator.register().await;

    let report = correlator.sweep(Instant::now()).await;

    assert_eq!(report.total_removed(), 0);
    assert_eq!(
        correlator.status(id.as_str()).await.unwrap().state,
        RequestState::Pending
    );
}

#[tokio::test]
async fn sweep_wakes_waiters_with_expired() {
    let correlator = Arc::new(short_lived(4));
    let id = correlator.register().await;

    let waiter = {
        let c = Arc::clone(&correlator);
        let id = id.clone();
        tokio::spawn(async move { c.await_result(id.as_str(), Duration::from_secs(300)).await })
    };
    wait_for_waiters(&correlator, id.as_str(), 1).await;

    let later = Instant::now() + correlator.config().max_pending_age;
    correlator.sweep(later).await;

    assert_eq!(waiter.await.unwrap().unwrap(), Outcome::Expired);
}

#[tokio::test]
async fn sweep_drops_delivered_entries_immediately() {
    let correlator = short_lived(4);
    let id = correlator.register().await;
    correlator.fulfill(id.as_str(), "answer").await.unwrap();
    correlator
        .await_result(id.as_str(), Duration::from_secs(1))
        .await
        .unwrap();

    let report = correlator.sweep(Instant::now()).await;

    assert_eq!(report.reaped, 1);
    assert!(correlator.status(id.as_str()).await.is_err());
}

#[tokio::test]
async fn undelivered_terminal_entry_kept_until_retention() {
    let correlator = short_lived(4);
    let id = correlator.register().await;
    correlator.fail(id.as_str(), "nobody listening").await.unwrap();

    let report = correlator.sweep(Instant::now()).await;
    assert_eq!(report.total_removed(), 0);
    // Duplicate callbacks are still recognised as duplicates meanwhile.
    assert!(matches!(
        correlator.fulfill(id.as_str(), "late").await,
        Err(CorrelatorError::DuplicateDelivery { .. })
    ));

    let later = Instant::now() + correlator.config().retention;
    let report = correlator.sweep(later).await;
    assert_eq!(report.reaped, 1);
    assert!(correlator.is_empty().await);
}

#[tokio::test(start_paused = true)]
async fn background_sweeper_reaps_abandoned_requests() {
    let correlator = Arc::new(Correlator::new(CorrelatorConfig {
        retention: Duration::from_secs(2),
        max_pending_age: Duration::from_secs(1),
        max_waiters: 1,
    }));
    correlator.register().await;
    correlator.register().await;

    let sweeper = correlator.spawn_sweeper(Duration::from_millis(500));
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert!(correlator.is_empty().await);
    sweeper.abort();
}

#[tokio::test(start_paused = true)]
async fn zero_sweep_interval_is_raised_to_minimum() {
    let correlator = Arc::new(Correlator::new(CorrelatorConfig {
        retention: Duration::from_secs(2),
        max_pending_age: Duration::from_secs(1),
        max_waiters: 1,
    }));
    correlator.register().await;

    let sweeper = correlator.spawn_sweeper(Duration::ZERO);
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert!(!sweeper.is_finished(), "sweeper must keep running");
    assert!(correlator.is_empty().await);
    sweeper.abort();
}

#[tokio::test]
async fn marked_delivered_failure_is_reaped_at_next_sweep() {
    let correlator = short_lived(4);
    let id = correlator.register().await;
    correlator.fail(id.as_str(), "webhook down").await.unwrap();

    assert!(correlator.mark_delivered(id.as_str()).await);
    let report = correlator.sweep(Instant::now()).await;

    assert_eq!(report.reaped, 1);
    assert!(correlator.is_empty().await);
    assert!(!correlator.mark_delivered(id.as_str()).await);
}

#[tokio::test]
async fn pending_count_excludes_terminal_entries() {
    let correlator = short_lived(4);
    let done = correlator.register().await;
    correlator.register().await;
    correlator.fulfill(done.as_str(), "answer").await.unwrap();

    assert_eq!(correlator.len().await, 2);
    assert_eq!(correlator.pending_count().await, 1);
}

#[tokio::test]
async fn shutdown_fails_pending_waiters() {
    let correlator = Arc::new(Correlator::with_defaults());
    let pending = correlator.register().await;
    let finished = correlator.register().await;
    correlator.fulfill(finished.as_str(), "done").await.unwrap();

    let waiter = {
        let c = Arc::clone(&correlator);
        let id = pending.clone();
        tokio::spawn(async move { c.await_result(id.as_str(), Duration::from_secs(60)).await })
    };
    wait_for_waiters(&correlator, pending.as_str(), 1).await;

    let failed = correlator.shutdown().await;

    assert_eq!(failed, 1);
    assert_eq!(
        waiter.await.unwrap().unwrap(),
        Outcome::Failed(SHUTDOWN_REASON.into())
    );
    assert!(correlator.is_empty().await);
}

#[test]
fn pending_age_is_clamped_to_retention() {
    let correlator = Correlator::new(CorrelatorConfig {
        retention: Duration::from_secs(10),
        max_pending_age: Duration::from_secs(20),
        max_waiters: 0,
    });
    assert_eq!(correlator.config().max_pending_age, Duration::from_secs(10));
    assert_eq!(correlator.config().max_waiters, 1);
}
