use std::error::Error;
use std::sync::{Arc, Mutex};

use cmddispatch::dispatch::{Dispatcher, DispatcherOptions, EnqueueRequest};
use cmddispatch::types::{CommandStatus, CANCELLED_MESSAGE};
use cmddispatch::DispatchError;
use cmddispatch_test_utils::handlers::{
    hang_forever, panics, record_order, succeed, wait_for_cancel, Gate,
};
use cmddispatch_test_utils::recorders::RecordingReporter;
use cmddispatch_test_utils::{eventually, init_tracing, with_timeout};
use tokio_util::sync::CancellationToken;

type TestResult = Result<(), Box<dyn Error>>;

fn dispatcher(parallelism: usize, reporter: Arc<RecordingReporter>) -> Dispatcher {
    Dispatcher::builder(DispatcherOptions {
        parallelism,
        ..DispatcherOptions::default()
    })
    .failure_reporter(reporter)
    .build()
}

fn status_of(dispatcher: &Dispatcher, run_id: &str) -> Option<CommandStatus> {
    dispatcher.command(run_id).map(|s| s.status)
}

#[tokio::test]
async fn cancelled_queued_command_never_runs() -> TestResult {
    init_tracing();
    let reporter = RecordingReporter::new();
    let dispatcher = dispatcher(1, Arc::clone(&reporter));
    dispatcher.start()?;

    let gate = Gate::new();
    let blocker = dispatcher.enqueue(EnqueueRequest::new("block", gate.handler()))?;
    eventually("blocker running", || gate.entered() == 1).await;

    let log = Arc::new(Mutex::new(Vec::new()));
    let victim = dispatcher.enqueue(
        EnqueueRequest::new("victim", record_order(Arc::clone(&log), "victim")).run_id("victim"),
    )?;

    assert!(dispatcher.cancel("victim"));
    let result = with_timeout(victim.wait()).await;
    assert!(!result.success);
    assert_eq!(result.message, CANCELLED_MESSAGE);
    assert_eq!(status_of(&dispatcher, "victim"), Some(CommandStatus::Cancelled));

    // A second cancel is a no-op.
    assert!(!dispatcher.cancel("victim"));

    gate.open();
    assert!(with_timeout(blocker.wait()).await.success);
    dispatcher.stop().await;

    assert!(log.lock().unwrap().is_empty());
    assert!(reporter.reports().is_empty());
    Ok(())
}

#[tokio::test]
async fn cancelling_a_handler_that_ignores_its_token() -> TestResult {
    init_tracing();
    let reporter = RecordingReporter::new();
    let dispatcher = dispatcher(1, Arc::clone(&reporter));
    dispatcher.start()?;

    let handle = dispatcher.enqueue(EnqueueRequest::new("hang", hang_forever()).run_id("hang"))?;
    eventually("hang is running", || {
        status_of(&dispatcher, "hang") == Some(CommandStatus::Running)
    })
    .await;

    assert!(dispatcher.cancel("hang"));
    let result = with_timeout(handle.wait()).await;
    assert_eq!(result.message, CANCELLED_MESSAGE);
    assert_eq!(status_of(&dispatcher, "hang"), Some(CommandStatus::Cancelled));
    assert!(reporter.reports().is_empty());

    // The worker is free again.
    let next = dispatcher.enqueue(EnqueueRequest::new("next", succeed("after")))?;
    assert!(with_timeout(next.wait()).await.success);

    dispatcher.stop().await;
    Ok(())
}

#[tokio::test]
async fn cooperative_handler_observes_cancellation() -> TestResult {
    init_tracing();
    let dispatcher = dispatcher(1, RecordingReporter::new());
    dispatcher.start()?;

    let handle =
        dispatcher.enqueue(EnqueueRequest::new("coop", wait_for_cancel()).run_id("coop"))?;
    eventually("coop is running", || {
        status_of(&dispatcher, "coop") == Some(CommandStatus::Running)
    })
    .await;

    assert!(dispatcher.cancel("coop"));
    let result = with_timeout(handle.wait()).await;
    assert_eq!(result.message, CANCELLED_MESSAGE);

    dispatcher.stop().await;
    Ok(())
}

#[tokio::test]
async fn cancel_of_unknown_or_finished_commands_returns_false() -> TestResult {
    init_tracing();
    let dispatcher = dispatcher(1, RecordingReporter::new());
    dispatcher.start()?;

    assert!(!dispatcher.cancel("missing"));

    let handle = dispatcher.enqueue(EnqueueRequest::new("quick", succeed("done")).run_id("quick"))?;
    with_timeout(handle.wait()).await;
    assert!(!dispatcher.cancel("quick"));
    assert_eq!(status_of(&dispatcher, "quick"), Some(CommandStatus::Completed));

    dispatcher.stop().await;
    Ok(())
}

#[tokio::test]
async fn stop_cancels_running_and_queued_commands() -> TestResult {
    init_tracing();
    let reporter = RecordingReporter::new();
    let dispatcher = dispatcher(1, Arc::clone(&reporter));
    dispatcher.start()?;

    let gate = Gate::new();
    let running = dispatcher.enqueue(EnqueueRequest::new("block", gate.handler()))?;
    eventually("blocker running", || gate.entered() == 1).await;

    let log = Arc::new(Mutex::new(Vec::new()));
    let queued: Vec<_> = ["q1", "q2", "q3"]
        .into_iter()
        .map(|label| {
            dispatcher.enqueue(EnqueueRequest::new("queued", record_order(Arc::clone(&log), label)))
        })
        .collect::<Result<_, _>>()?;

    with_timeout(dispatcher.stop()).await;
    assert!(dispatcher.is_stopped());

    assert_eq!(with_timeout(running.wait()).await.message, CANCELLED_MESSAGE);
    for handle in queued {
        assert_eq!(with_timeout(handle.wait()).await.message, CANCELLED_MESSAGE);
    }
    assert!(log.lock().unwrap().is_empty());
    assert!(reporter.reports().is_empty());
    assert_eq!(dispatcher.queued_len(), 0);
    Ok(())
}

#[tokio::test]
async fn cancel_all_signals_every_active_command() -> TestResult {
    init_tracing();
    let dispatcher = dispatcher(2, RecordingReporter::new());
    dispatcher.start()?;

    let mut handles = Vec::new();
    for i in 0..4 {
        let req = EnqueueRequest::new("hang", hang_forever()).run_id(format!("hang-{i}"));
        handles.push(dispatcher.enqueue(req)?);
    }
    eventually("two commands running", || {
        dispatcher
            .active_commands()
            .iter()
            .filter(|s| s.status == CommandStatus::Running)
            .count()
            == 2
    })
    .await;

    assert_eq!(dispatcher.cancel_all(), 4);
    for handle in handles {
        assert_eq!(with_timeout(handle.wait()).await.message, CANCELLED_MESSAGE);
    }

    // The pool keeps serving new work.
    let after = dispatcher.enqueue(EnqueueRequest::new("after", succeed("still alive")))?;
    assert!(with_timeout(after.wait()).await.success);

    dispatcher.stop().await;
    Ok(())
}

#[tokio::test]
async fn panicking_handler_fails_the_command_but_not_the_worker() -> TestResult {
    init_tracing();
    let reporter = RecordingReporter::new();
    let dispatcher = dispatcher(1, Arc::clone(&reporter));
    dispatcher.start()?;

    let bad = dispatcher.enqueue(EnqueueRequest::new("bad", panics("kaboom")).run_id("bad"))?;
    let good = dispatcher.enqueue(EnqueueRequest::new("good", succeed("fine")))?;

    let result = with_timeout(bad.wait()).await;
    assert!(!result.success);
    assert!(result.message.contains("kaboom"), "{}", result.message);
    assert_eq!(status_of(&dispatcher, "bad"), Some(CommandStatus::Failed));
    assert!(with_timeout(good.wait()).await.success);

    let reports = reporter.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].run_id, "bad");

    dispatcher.stop().await;
    Ok(())
}

#[tokio::test]
async fn wait_for_completion_behaviour() -> TestResult {
    init_tracing();
    let dispatcher = dispatcher(1, RecordingReporter::new());
    dispatcher.start()?;

    let unknown = dispatcher
        .wait_for_completion("nope", CancellationToken::new())
        .await?;
    assert!(!unknown.success);
    assert!(unknown.message.contains("not found"), "{}", unknown.message);

    let gate = Gate::new();
    let _handle = dispatcher.enqueue(EnqueueRequest::new("gated", gate.handler()).run_id("gated"))?;

    // Abandoning the wait leaves the command alone.
    let caller = CancellationToken::new();
    caller.cancel();
    let waited = dispatcher.wait_for_completion("gated", caller).await;
    assert!(matches!(waited, Err(DispatchError::WaitCancelled(_))));
    assert!(!status_of(&dispatcher, "gated").is_some_and(|s| s.is_terminal()));

    // Several waiters see the same result.
    let d1 = dispatcher.clone();
    let d2 = dispatcher.clone();
    let w1 = tokio::spawn(async move {
        d1.wait_for_completion("gated", CancellationToken::new()).await
    });
    let w2 = tokio::spawn(async move {
        d2.wait_for_completion("gated", CancellationToken::new()).await
    });

    eventually("gated running", || gate.entered() == 1).await;
    gate.open();

    let r1 = with_timeout(w1).await??;
    let r2 = with_timeout(w2).await??;
    assert_eq!(r1, r2);
    assert!(r1.success);

    // Already finished: resolves immediately.
    let again = dispatcher
        .wait_for_completion("gated", CancellationToken::new())
        .await?;
    assert_eq!(again, r1);

    dispatcher.stop().await;
    Ok(())
}
