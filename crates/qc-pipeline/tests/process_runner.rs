//! Process runner behaviour against real child processes.
#![cfg(unix)]

use std::time::{Duration, Instant};

use qc_pipeline::{
    CommandLine, CommandRunner, ProcessRunner, RunControls, Termination, CANCELLED,
    LAUNCH_FAILURE, SIGNALLED, TIMED_OUT,
};
use tokio_util::sync::CancellationToken;

fn sh(script: &str) -> CommandLine {
    CommandLine::new("sh", ["-c", script])
}

/// Guard against a runner that deadlocks instead of failing.
async fn within<F: std::future::Future>(secs: u64, fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(secs), fut)
        .await
        .expect("runner did not return in time")
}

/// Test: output far larger than a pipe buffer does not stall the runner
#[tokio::test]
async fn test_large_stdout_is_fully_captured() {
    let size = 4 * 1024 * 1024;
    let command = sh(&format!("head -c {size} /dev/zero | tr '\\0' x"));

    let result = within(60, ProcessRunner::new().execute(&command, &RunControls::default())).await;

    assert_eq!(result.exit_code, 0);
    assert_eq!(result.stdout.len(), size);
    assert!(result.stdout.bytes().all(|b| b == b'x'));
    assert!(result.stderr.is_empty());
}

/// Test: both streams written in alternation are captured exactly
#[tokio::test]
async fn test_interleaved_streams_are_captured_exactly() {
    let lines = 5000;
    let command = sh(&format!(
        "i=0; while [ $i -lt {lines} ]; do echo \"out line $i\"; echo \"err line $i\" >&2; i=$((i+1)); done"
    ));

    let result = within(60, ProcessRunner::new().execute(&command, &RunControls::default())).await;

    let expected_out: String = (0..lines).map(|i| format!("out line {i}\n")).collect();
    let expected_err: String = (0..lines).map(|i| format!("err line {i}\n")).collect();
    assert_eq!(result.exit_code, 0);
    assert!(result.stdout.len() > 64 * 1024);
    assert_eq!(result.stdout, expected_out);
    assert_eq!(result.stderr, expected_err);
}

/// Test: a missing executable yields the launch-failure sentinel
#[tokio::test]
async fn test_missing_executable_is_launch_failure() {
    let command = CommandLine::new("/nonexistent-binary-that-does-not-exist", ["--input", "x"]);

    let result = ProcessRunner::new()
        .execute(&command, &RunControls::default())
        .await;

    assert_eq!(result.exit_code, LAUNCH_FAILURE);
    assert!(result.exit_code < 0);
    assert_eq!(result.termination(), Termination::LaunchFailed);
    assert!(result.stdout.is_empty());
    assert!(result.stderr.contains("/nonexistent-binary-that-does-not-exist"));
}

/// Test: the string contract splits quoted arguments before launching
#[tokio::test]
async fn test_execute_line_passes_quoted_arguments() {
    let result = ProcessRunner::new()
        .execute_line(r#"printf "%s|%s" "hello world" 'x y'"#)
        .await;

    assert_eq!(result.exit_code, 0);
    assert_eq!(result.stdout, "hello world|x y");
}

/// Test: a non-zero exit is reported, not raised
#[tokio::test]
async fn test_non_zero_exit_keeps_output() {
    let result = ProcessRunner::new()
        .execute(&sh("echo partial; echo oops >&2; exit 3"), &RunControls::default())
        .await;

    assert_eq!(result.exit_code, 3);
    assert_eq!(result.termination(), Termination::Exited(3));
    assert_eq!(result.stdout, "partial\n");
    assert_eq!(result.stderr, "oops\n");
}

/// Test: a process killed by a signal gets its own sentinel
#[tokio::test]
async fn test_signal_termination() {
    let result = ProcessRunner::new()
        .execute(&sh("kill -9 $$"), &RunControls::default())
        .await;

    assert_eq!(result.exit_code, SIGNALLED);
}

/// Test: the timeout kills the process and keeps what it already wrote
#[tokio::test]
async fn test_timeout_kills_process() {
    let controls = RunControls::default().with_timeout(Some(Duration::from_millis(500)));
    let start = Instant::now();

    let result = within(
        20,
        ProcessRunner::new().execute(&sh("echo started; sleep 30"), &controls),
    )
    .await;

    assert_eq!(result.exit_code, TIMED_OUT);
    assert_eq!(result.termination(), Termination::TimedOut);
    assert_eq!(result.stdout, "started\n");
    assert!(start.elapsed() < Duration::from_secs(15));
}

/// Test: cancelling the token kills the in-flight process
#[tokio::test]
async fn test_cancellation_kills_process() {
    let cancel = CancellationToken::new();
    let controls = RunControls::new(cancel.clone());

    let trigger = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
    });

    let result = within(
        20,
        ProcessRunner::new().execute(&CommandLine::new("sleep", ["30"]), &controls),
    )
    .await;
    trigger.await.unwrap();

    assert_eq!(result.exit_code, CANCELLED);
    assert_eq!(result.termination(), Termination::Cancelled);
}

/// Test: a timeout also kills the processes the stage started
#[tokio::test]
async fn test_timeout_kills_grandchildren() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("survived");
    let script = format!("(sleep 1; touch '{}') & sleep 30; :", marker.display());
    let controls = RunControls::default().with_timeout(Some(Duration::from_millis(300)));

    let result = within(20, ProcessRunner::new().execute(&sh(&script), &controls)).await;
    assert_eq!(result.exit_code, TIMED_OUT);

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(!marker.exists(), "background job outlived the stage");
}

/// Test: cancellation also kills the processes the stage started
#[tokio::test]
async fn test_cancellation_kills_grandchildren() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("survived");
    let script = format!("(sleep 1; touch '{}') & sleep 30; :", marker.display());
    let cancel = CancellationToken::new();
    let controls = RunControls::new(cancel.clone());

    let trigger = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
    });
    let result = within(20, ProcessRunner::new().execute(&sh(&script), &controls)).await;
    trigger.await.unwrap();
    assert_eq!(result.exit_code, CANCELLED);

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(!marker.exists(), "stage kept running after cancellation");
}

/// Test: a background job holding the pipe open does not hang the runner
#[tokio::test]
async fn test_orphaned_pipe_is_released_after_grace() {
    let start = Instant::now();

    let result = within(
        20,
        ProcessRunner::new().execute(&sh("echo early; sleep 5 &"), &RunControls::default()),
    )
    .await;

    assert_eq!(result.exit_code, 0);
    assert_eq!(result.stdout, "early\n");
    assert!(start.elapsed() < Duration::from_millis(4500));
}
