//! Runner lifecycle tests driven by shell stubs.
//!
//! Stubs are `sh -c` scripts that print (or withhold) the `AGENT_PORT=`
//! handshake line. None of them serve RPC: the client channel is lazy, so a
//! runner reaches Running as soon as the handshake resolves, and a dead
//! endpoint only surfaces as a transport error on first use -- which is
//! exactly the split these tests exercise.

use std::sync::Arc;
use std::time::Duration;

use idra::error::RunnerError;
use idra::fleet::{Manifest, Runner, RunnerState};
use idra::rpc::types::TaskRequest;
use tokio_util::sync::CancellationToken;

fn stub(name: &str, script: &str) -> Runner {
    let manifest = Manifest {
        name: name.into(),
        description: String::new(),
        skills: vec!["echo".into()],
        command: "sh".into(),
        args: vec!["-c".into(), script.into()],
        dir: ".".into(),
    };
    Runner::new(manifest, std::env::temp_dir())
}

async fn wait_for_state(runner: &Runner, state: RunnerState, deadline: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < deadline {
        if runner.state() == state {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    runner.state() == state
}

#[tokio::test]
async fn handshake_reaches_running() {
    let runner = stub("happy", "echo AGENT_PORT=45901; sleep 30");
    let token = CancellationToken::new();

    runner.start(&token).await.unwrap();

    assert_eq!(runner.state(), RunnerState::Running);
    let status = runner.status();
    assert_eq!(status.port, 45901);
    assert!(status.error.is_none());

    runner.stop().await;
    assert_eq!(runner.state(), RunnerState::Stopped);
}

#[tokio::test]
async fn chatter_before_the_handshake_is_ignored() {
    let runner = stub(
        "chatty",
        "echo booting; echo loading model; echo AGENT_PORT=45902; sleep 30",
    );
    let token = CancellationToken::new();

    runner.start(&token).await.unwrap();
    assert_eq!(runner.status().port, 45902);

    runner.stop().await;
}

#[tokio::test]
async fn premature_exit_fails_the_handshake() {
    let runner = stub("quitter", "exit 0");
    let token = CancellationToken::new();

    let err = runner.start(&token).await.unwrap_err();
    assert!(matches!(err, RunnerError::HandshakeExit { .. }), "{err}");
    assert_eq!(runner.state(), RunnerState::Failed);
    assert!(runner.status().error.unwrap().contains("AGENT_PORT"));
}

#[tokio::test]
async fn malformed_port_line_fails_the_handshake() {
    let runner = stub("garbled", "echo AGENT_PORT=not-a-port; sleep 30");
    let token = CancellationToken::new();

    let err = runner.start(&token).await.unwrap_err();
    assert!(matches!(err, RunnerError::HandshakeMalformed { .. }), "{err}");
    assert_eq!(runner.state(), RunnerState::Failed);
}

#[tokio::test]
async fn silent_child_times_out() {
    let runner = stub("sleeper", "sleep 30").with_handshake_timeout(Duration::from_millis(300));
    let token = CancellationToken::new();

    let err = runner.start(&token).await.unwrap_err();
    assert!(matches!(err, RunnerError::HandshakeTimeout { .. }), "{err}");
    assert_eq!(runner.state(), RunnerState::Failed);

    // The failure path cancelled the child; stop confirms it is reaped
    // well inside the grace window.
    let stopped_at = std::time::Instant::now();
    runner.stop().await;
    assert!(stopped_at.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn unexpected_exit_is_recorded_by_the_monitor() {
    let runner = stub("dying", "echo AGENT_PORT=45903; sleep 1; exit 3");
    let token = CancellationToken::new();

    runner.start(&token).await.unwrap();
    assert_eq!(runner.state(), RunnerState::Running);

    assert!(wait_for_state(&runner, RunnerState::Failed, Duration::from_secs(5)).await);
    let status = runner.status();
    assert!(status.error.unwrap().contains("exited unexpectedly"));
}

#[tokio::test]
async fn stop_is_never_recorded_as_failure() {
    let runner = stub("clean", "echo AGENT_PORT=45904; sleep 30");
    let token = CancellationToken::new();

    runner.start(&token).await.unwrap();
    runner.stop().await;

    // Give a late monitor write every chance to happen, then confirm it
    // did not: stop owns the Stopped transition.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(runner.state(), RunnerState::Stopped);
    assert!(runner.status().error.is_none());
}

#[tokio::test]
async fn start_is_idempotent_while_running() {
    let runner = stub("twice", "echo AGENT_PORT=45905; sleep 30");
    let token = CancellationToken::new();

    runner.start(&token).await.unwrap();
    runner.start(&token).await.unwrap();
    assert_eq!(runner.state(), RunnerState::Running);

    runner.stop().await;
}

#[tokio::test]
async fn failed_runner_can_be_started_again() {
    let tmp = tempfile::TempDir::new().unwrap();
    let flag = tmp.path().join("ready");
    let script = format!(
        "if [ -f {flag} ]; then echo AGENT_PORT=45906; sleep 30; else touch {flag}; exit 1; fi",
        flag = flag.display()
    );
    let runner = stub("retry", &script);
    let token = CancellationToken::new();

    let err = runner.start(&token).await.unwrap_err();
    assert!(matches!(err, RunnerError::HandshakeExit { .. }));
    assert_eq!(runner.state(), RunnerState::Failed);

    // Recovery is an explicit operator action: a second start.
    runner.start(&token).await.unwrap();
    assert_eq!(runner.state(), RunnerState::Running);
    assert!(runner.status().error.is_none());

    runner.stop().await;
}

#[tokio::test]
async fn transport_errors_do_not_change_state() {
    // Nothing listens on the advertised port, so the lazy channel fails on
    // first use. That is the caller's problem, not a lifecycle event.
    let runner = stub("deaf", "echo AGENT_PORT=45907; sleep 30");
    let token = CancellationToken::new();

    runner.start(&token).await.unwrap();

    let req = TaskRequest {
        task_id: "t1".into(),
        skill: "echo".into(),
        input: "x".into(),
        ..TaskRequest::default()
    };
    let err = runner.execute(req).await.unwrap_err();
    assert!(matches!(err, RunnerError::Rpc { .. }), "{err}");
    assert_eq!(runner.state(), RunnerState::Running);

    runner.stop().await;
}

#[tokio::test]
async fn stop_during_starting_wins_the_race() {
    let runner = Arc::new(stub("limbo", "sleep 30").with_handshake_timeout(Duration::from_secs(10)));
    let token = CancellationToken::new();

    let start_task = {
        let runner = Arc::clone(&runner);
        let token = token.clone();
        tokio::spawn(async move { runner.start(&token).await })
    };

    assert!(wait_for_state(&runner, RunnerState::Starting, Duration::from_secs(2)).await);
    runner.stop().await;

    // However the interrupted handshake resolved, Stopped stands and no
    // failure is recorded.
    let _ = start_task.await.unwrap();
    assert_eq!(runner.state(), RunnerState::Stopped);
    assert!(runner.status().error.is_none());
}

#[tokio::test]
async fn cancelling_the_parent_token_kills_the_child() {
    let runner = stub("cancelled", "echo AGENT_PORT=45908; sleep 30");
    let token = CancellationToken::new();

    runner.start(&token).await.unwrap();
    token.cancel();

    // The monitor reaps the killed child and, since nobody called stop,
    // records the death as a failure.
    assert!(wait_for_state(&runner, RunnerState::Failed, Duration::from_secs(5)).await);
}

#[tokio::test]
async fn spawn_failure_is_immediate() {
    let manifest = Manifest {
        name: "ghost".into(),
        description: String::new(),
        skills: vec!["s".into()],
        command: "/no/such/binary".into(),
        args: vec![],
        dir: ".".into(),
    };
    let runner = Runner::new(manifest, std::env::temp_dir());
    let token = CancellationToken::new();

    let err = runner.start(&token).await.unwrap_err();
    assert!(matches!(err, RunnerError::Spawn { .. }), "{err}");
    assert_eq!(runner.state(), RunnerState::Failed);
}
