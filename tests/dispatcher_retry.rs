use std::error::Error;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cmddispatch::dispatch::{
    handler_fn, Dispatcher, DispatcherOptions, EnqueueRequest, RetryPolicy, StaticPolicyResolver,
};
use cmddispatch::types::{CommandResult, CommandStatus, CANCELLED_MESSAGE};
use cmddispatch_test_utils::builders::fast_retry;
use cmddispatch_test_utils::handlers::{
    always_error, always_fail_result, error_then_succeed, fail_result_then_succeed,
};
use cmddispatch_test_utils::recorders::RecordingReporter;
use cmddispatch_test_utils::{init_tracing, with_timeout};

type TestResult = Result<(), Box<dyn Error>>;

fn dispatcher_with(policy: RetryPolicy, reporter: Arc<RecordingReporter>) -> Dispatcher {
    Dispatcher::builder(DispatcherOptions {
        parallelism: 1,
        ..DispatcherOptions::default()
    })
    .policy_resolver(Arc::new(StaticPolicyResolver::new(policy)))
    .failure_reporter(reporter)
    .build()
}

#[tokio::test]
async fn errors_are_retried_until_success() -> TestResult {
    init_tracing();
    let reporter = RecordingReporter::new();
    let dispatcher = dispatcher_with(fast_retry(5), Arc::clone(&reporter));
    dispatcher.start()?;

    let calls = Arc::new(AtomicU32::new(0));
    let handle = dispatcher.enqueue(
        EnqueueRequest::new("flaky", error_then_succeed(2, Arc::clone(&calls))).run_id("flaky"),
    )?;
    let result = with_timeout(handle.wait()).await;

    assert!(result.success, "{result:?}");
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let snapshot = dispatcher.command("flaky").expect("retained after completion");
    assert_eq!(snapshot.status, CommandStatus::Completed);
    assert_eq!(snapshot.retry_count, 2);
    assert!(reporter.reports().is_empty());

    dispatcher.stop().await;
    Ok(())
}

#[tokio::test]
async fn failure_results_are_retried_until_success() -> TestResult {
    init_tracing();
    let reporter = RecordingReporter::new();
    let dispatcher = dispatcher_with(fast_retry(3), Arc::clone(&reporter));
    dispatcher.start()?;

    let calls = Arc::new(AtomicU32::new(0));
    let handle = dispatcher.enqueue(
        EnqueueRequest::new("poll", fail_result_then_succeed(2, Arc::clone(&calls)))
            .run_id("poll"),
    )?;
    let result = with_timeout(handle.wait()).await;

    assert!(result.success, "{result:?}");
    assert_eq!(result.message, "ok after 3 calls");
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let snapshot = dispatcher.command("poll").expect("retained after completion");
    assert_eq!(snapshot.status, CommandStatus::Completed);
    assert_eq!(snapshot.retry_count, 2);
    assert!(reporter.reports().is_empty());

    dispatcher.stop().await;
    Ok(())
}

#[tokio::test]
async fn failure_results_stop_at_max_attempts() -> TestResult {
    init_tracing();
    let reporter = RecordingReporter::new();
    let dispatcher = dispatcher_with(fast_retry(3), Arc::clone(&reporter));
    dispatcher.start()?;

    let calls = Arc::new(AtomicU32::new(0));
    let handle = dispatcher.enqueue(
        EnqueueRequest::new("doomed", always_fail_result(Arc::clone(&calls)))
            .run_id("doomed")
            .meta("correlation_id", "abc-123"),
    )?;
    let result = with_timeout(handle.wait()).await;

    assert!(!result.success);
    assert_eq!(result.message, "attempt 3 failed");
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let snapshot = dispatcher.command("doomed").expect("retained after completion");
    assert_eq!(snapshot.status, CommandStatus::Failed);
    assert_eq!(snapshot.error_message.as_deref(), Some("attempt 3 failed"));

    // Reported before the completion signal resolved.
    let reports = reporter.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].run_id, "doomed");
    assert_eq!(reports[0].retry_count, 2);
    assert_eq!(reports[0].error, None);
    assert_eq!(
        reports[0].metadata.get("correlation_id").map(String::as_str),
        Some("abc-123")
    );

    dispatcher.stop().await;
    Ok(())
}

#[tokio::test]
async fn failure_results_are_final_unless_enabled() -> TestResult {
    init_tracing();
    let policy = RetryPolicy {
        retry_on_failure_result: false,
        ..fast_retry(5)
    };
    let dispatcher = dispatcher_with(policy, RecordingReporter::new());
    dispatcher.start()?;

    let calls = Arc::new(AtomicU32::new(0));
    let handle =
        dispatcher.enqueue(EnqueueRequest::new("once", always_fail_result(Arc::clone(&calls))))?;
    let result = with_timeout(handle.wait()).await;

    assert!(!result.success);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    dispatcher.stop().await;
    Ok(())
}

#[tokio::test]
async fn errors_are_final_when_exception_retry_is_disabled() -> TestResult {
    init_tracing();
    let reporter = RecordingReporter::new();
    let policy = RetryPolicy {
        retry_on_exception: false,
        ..fast_retry(5)
    };
    let dispatcher = dispatcher_with(policy, Arc::clone(&reporter));
    dispatcher.start()?;

    let calls = Arc::new(AtomicU32::new(0));
    let handle = dispatcher.enqueue(EnqueueRequest::new("err", always_error(Arc::clone(&calls))))?;
    let result = with_timeout(handle.wait()).await;

    assert!(!result.success);
    assert!(result.message.contains("error on attempt 1"), "{}", result.message);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let reports = reporter.reports();
    assert_eq!(reports.len(), 1);
    assert!(reports[0].error.is_some());
    dispatcher.stop().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn exponential_backoff_waits_between_attempts() -> TestResult {
    init_tracing();
    let policy = RetryPolicy {
        max_attempts: 4,
        retry_on_exception: true,
        backoff_base: Duration::from_secs(1),
        backoff_max: Duration::from_secs(10),
        exponential: true,
        ..RetryPolicy::default()
    };
    let dispatcher = dispatcher_with(policy, RecordingReporter::new());
    dispatcher.start()?;

    let calls = Arc::new(AtomicU32::new(0));
    let started = tokio::time::Instant::now();
    let handle = dispatcher.enqueue(EnqueueRequest::new("slow", always_error(Arc::clone(&calls))))?;
    let result = handle.wait().await;
    let elapsed = started.elapsed();

    assert!(!result.success);
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    // 1s + 2s + 4s between the four attempts.
    assert!(elapsed >= Duration::from_secs(7), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(8), "{elapsed:?}");

    dispatcher.stop().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn backoff_is_clamped_to_the_maximum() -> TestResult {
    init_tracing();
    let policy = RetryPolicy {
        max_attempts: 3,
        backoff_base: Duration::from_secs(20),
        backoff_max: Duration::from_secs(25),
        exponential: true,
        ..RetryPolicy::default()
    };
    let dispatcher = dispatcher_with(policy, RecordingReporter::new());
    dispatcher.start()?;

    let calls = Arc::new(AtomicU32::new(0));
    let started = tokio::time::Instant::now();
    let handle = dispatcher.enqueue(EnqueueRequest::new("slow", always_error(Arc::clone(&calls))))?;
    handle.wait().await;

    // 20s, then min(40s, 25s).
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(45), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(46), "{elapsed:?}");

    dispatcher.stop().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn attempt_timeout_cancels_without_retrying() -> TestResult {
    init_tracing();
    let reporter = RecordingReporter::new();
    let policy = RetryPolicy {
        timeout: Some(Duration::from_millis(50)),
        ..fast_retry(3)
    };
    let dispatcher = dispatcher_with(policy, Arc::clone(&reporter));
    dispatcher.start()?;

    let calls = Arc::new(AtomicU32::new(0));
    let counted = Arc::clone(&calls);
    let handler = handler_fn(move |_ctx| {
        let counted = Arc::clone(&counted);
        async move {
            counted.fetch_add(1, Ordering::SeqCst);
            std::future::pending::<()>().await;
            Ok(CommandResult::success("unreachable"))
        }
    });

    let handle = dispatcher.enqueue(EnqueueRequest::new("stuck", handler).run_id("stuck"))?;
    let result = handle.wait().await;

    assert!(!result.success);
    assert_eq!(result.message, CANCELLED_MESSAGE);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let snapshot = dispatcher.command("stuck").expect("retained after completion");
    assert_eq!(snapshot.status, CommandStatus::Cancelled);
    assert_eq!(snapshot.timeout_seconds, Some(0.05));
    assert!(reporter.reports().is_empty());

    dispatcher.stop().await;
    Ok(())
}
