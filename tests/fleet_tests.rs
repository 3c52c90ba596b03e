//! Fleet-level tests: concurrent startup, routing, and the health loop.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use idra::error::RunnerError;
use idra::fleet::{spawn_health_loop, Manager, Registry, RunnerState};
use idra::rpc::types::TaskRequest;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn write_agent(agents_dir: &Path, sub: &str, name: &str, script: &str) {
    let dir = agents_dir.join(sub);
    std::fs::create_dir_all(&dir).unwrap();
    let manifest = serde_json::json!({
        "name": name,
        "skills": [name],
        "command": "sh",
        "args": ["-c", script],
        "dir": "."
    });
    std::fs::write(dir.join("manifest.json"), manifest.to_string()).unwrap();
}

async fn wait_for(manager: &Manager, name: &str, state: RunnerState, deadline: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < deadline {
        if manager.agent_status(name).map(|s| s.state) == Some(state) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    manager.agent_status(name).map(|s| s.state) == Some(state)
}

#[tokio::test]
async fn start_all_settles_every_runner() {
    let tmp = TempDir::new().unwrap();
    let agents = tmp.path().join("agents");
    write_agent(&agents, "01-good", "good", "echo AGENT_PORT=45911; sleep 30");
    write_agent(&agents, "02-bad", "bad", "exit 1");

    let manager = Manager::new(Registry::scan(&agents).unwrap());
    let token = CancellationToken::new();

    // One agent fails to start; the other must be unaffected, and both
    // attempts settle before start_all returns.
    manager.start_all(&token).await;

    assert_eq!(
        manager.agent_status("good").unwrap().state,
        RunnerState::Running
    );
    assert_eq!(
        manager.agent_status("bad").unwrap().state,
        RunnerState::Failed
    );

    manager.stop_all().await;
    assert!(manager
        .all_statuses()
        .iter()
        .all(|s| s.state == RunnerState::Stopped));
}

#[tokio::test]
async fn route_task_surfaces_transport_errors() {
    let tmp = TempDir::new().unwrap();
    let agents = tmp.path().join("agents");
    write_agent(&agents, "01-deaf", "deaf", "echo AGENT_PORT=45912; sleep 30");

    let manager = Manager::new(Registry::scan(&agents).unwrap());
    let token = CancellationToken::new();
    manager.start_all(&token).await;

    let req = TaskRequest {
        task_id: "t1".into(),
        skill: "deaf".into(),
        input: "x".into(),
        ..TaskRequest::default()
    };
    let err = manager.route_task("deaf", req).await.unwrap_err();
    assert!(matches!(err, RunnerError::Rpc { .. }), "{err}");

    manager.stop_all().await;
}

#[tokio::test]
async fn health_loop_demotes_an_unresponsive_agent() {
    let tmp = TempDir::new().unwrap();
    let agents = tmp.path().join("agents");
    // Advertises a port nothing listens on; the probe gets a transport
    // error and the loop must demote the runner.
    write_agent(&agents, "01-probe", "probe", "echo AGENT_PORT=45913; sleep 30");

    let manager = Arc::new(Manager::new(Registry::scan(&agents).unwrap()));
    let token = CancellationToken::new();
    manager.start_all(&token).await;
    assert_eq!(
        manager.agent_status("probe").unwrap().state,
        RunnerState::Running
    );

    let loop_token = CancellationToken::new();
    let handle = spawn_health_loop(
        Arc::clone(&manager),
        Duration::from_millis(100),
        loop_token.clone(),
    );

    assert!(wait_for(&manager, "probe", RunnerState::Failed, Duration::from_secs(5)).await);
    let status = manager.agent_status("probe").unwrap();
    assert!(status.error.is_some());

    loop_token.cancel();
    handle.await.unwrap();
    manager.stop_all().await;
}

#[tokio::test]
async fn health_loop_never_probes_a_stopped_agent() {
    let tmp = TempDir::new().unwrap();
    let agents = tmp.path().join("agents");
    write_agent(&agents, "01-idle", "idle", "echo AGENT_PORT=45914; sleep 30");

    let manager = Arc::new(Manager::new(Registry::scan(&agents).unwrap()));
    // Never started: the loop must leave it untouched.
    let loop_token = CancellationToken::new();
    let handle = spawn_health_loop(
        Arc::clone(&manager),
        Duration::from_millis(50),
        loop_token.clone(),
    );

    tokio::time::sleep(Duration::from_millis(300)).await;
    let status = manager.agent_status("idle").unwrap();
    assert_eq!(status.state, RunnerState::Stopped);
    assert!(status.error.is_none());

    loop_token.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn skill_lookup_routes_to_the_first_claimant() {
    let tmp = TempDir::new().unwrap();
    let agents = tmp.path().join("agents");
    write_agent(&agents, "01-first", "first", "exit 0");
    // The second agent also claims the first one's skill.
    let dir = agents.join("02-second");
    std::fs::create_dir_all(&dir).unwrap();
    let manifest = serde_json::json!({
        "name": "second",
        "skills": ["first", "own"],
        "command": "sh",
        "args": ["-c", "exit 0"],
        "dir": "."
    });
    std::fs::write(dir.join("manifest.json"), manifest.to_string()).unwrap();

    let manager = Manager::new(Registry::scan(&agents).unwrap());

    // Skill resolution happens on the registry; routing is by agent name.
    assert_eq!(manager.registry().agent_for_skill("first"), Some("first"));
    assert_eq!(manager.registry().agent_for_skill("own"), Some("second"));
    assert_eq!(manager.all_statuses().len(), 2);
}
