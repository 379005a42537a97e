//! Integration tests for deadline and timeout contexts.

use canopy::{with_deadline, with_timeout, Context, ContextError, TimeoutConfig};
use std::time::Duration;
use tokio::time::{timeout, Instant};

#[tokio::test]
async fn test_passed_deadline_closes_done_without_release() {
    let (ctx, _cancel) = with_deadline(&Context::background(), Instant::now());

    timeout(Duration::from_millis(500), ctx.done().wait())
        .await
        .expect("done closed promptly");
    assert_eq!(ctx.err(), Some(ContextError::DeadlineExceeded));
}

#[tokio::test]
async fn test_deadline_in_the_past_by_a_lot() {
    let past = Instant::now() - Duration::from_millis(1);
    let (ctx, _cancel) = with_deadline(&Context::background(), past);
    assert_eq!(ctx.err(), Some(ContextError::DeadlineExceeded));
    assert_eq!(ctx.deadline(), Some(past));
}

#[tokio::test(start_paused = true)]
async fn test_timeout_fires_on_schedule() {
    let start = Instant::now();
    let (ctx, _cancel) = with_timeout(&Context::background(), Duration::from_millis(250));
    assert_eq!(ctx.deadline(), Some(start + Duration::from_millis(250)));

    ctx.done().wait().await;
    assert!(Instant::now() >= start + Duration::from_millis(250));
    assert_eq!(ctx.err(), Some(ContextError::DeadlineExceeded));
}

#[tokio::test(start_paused = true)]
async fn test_nested_deadline_reports_its_own() {
    let root = Context::background();
    let outer_deadline = Instant::now() + Duration::from_secs(1);
    let (outer, _cancel_outer) = root.with_deadline(outer_deadline);
    let (inner, _cancel_inner) = outer.with_timeout(Duration::from_secs(10));
    let (leaf, _cancel_leaf) = inner.with_cancel();

    assert_eq!(outer.deadline(), Some(outer_deadline));
    assert!(inner.deadline() > Some(outer_deadline));
    assert_eq!(leaf.deadline(), inner.deadline());

    // The shorter outer deadline still cancels the inner subtree first
    leaf.done().wait().await;
    assert_eq!(leaf.err(), Some(ContextError::DeadlineExceeded));
    assert!(Instant::now() < outer_deadline + Duration::from_secs(1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_release_races_timer() {
    for i in 0..200 {
        let (ctx, cancel) = with_timeout(&Context::background(), Duration::from_micros(200));
        let release = tokio::spawn(async move {
            if i % 3 != 0 {
                tokio::time::sleep(Duration::from_micros(150)).await;
            }
            cancel.cancel();
        });

        timeout(Duration::from_secs(2), ctx.done().wait())
            .await
            .expect("context settled");
        release.await.expect("release task ok");

        let err = ctx.err().expect("terminal error set");
        assert!(matches!(
            err,
            ContextError::Canceled | ContextError::DeadlineExceeded
        ));
        let cause = ctx.cause().expect("cause set");
        assert_eq!(cause.downcast_ref::<ContextError>(), Some(&err));

        // settled means settled
        tokio::time::sleep(Duration::from_micros(300)).await;
        assert_eq!(ctx.err(), Some(err));
    }
}

#[tokio::test(start_paused = true)]
async fn test_configured_timeout() {
    let config = TimeoutConfig::default().with_operation("db_query", 2000);
    let root = Context::background();

    let start = Instant::now();
    let (ctx, _cancel) = root.with_configured_timeout(&config, "db_query");
    assert_eq!(ctx.deadline(), Some(start + Duration::from_secs(2)));

    let (fallback, _cancel_fallback) = root.with_configured_timeout(&config, "other");
    assert_eq!(fallback.deadline(), Some(start + Duration::from_secs(30)));

    ctx.done().wait().await;
    assert_eq!(ctx.err(), Some(ContextError::DeadlineExceeded));
    assert!(!fallback.is_done());
}
