//! Periodic liveness probing.
//!
//! One background task probes every Running agent on a fixed interval and
//! demotes agents that fail the probe to Failed. Recovery is an explicit
//! operator action (a subsequent start); the loop never restarts anything.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::manager::Manager;
use super::runner::{Runner, RunnerState};
use crate::error::RunnerError;

pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(30);

/// Per-probe deadline.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Spawn the background health loop.
///
/// The first probe round runs one full `interval` after the call. The loop
/// exits when `token` is cancelled.
pub fn spawn_health_loop(
    manager: Arc<Manager>,
    interval: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + interval;
        let mut ticker = tokio::time::interval_at(start, interval);
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = ticker.tick() => check_all(&manager).await,
            }
        }
    })
}

async fn check_all(manager: &Manager) {
    // Snapshot the runner set first; probes run without any manager state.
    let runners: Vec<Arc<Runner>> = manager.runners().cloned().collect();

    for runner in runners {
        if runner.state() != RunnerState::Running {
            continue;
        }

        let cause = match tokio::time::timeout(PROBE_TIMEOUT, runner.health()).await {
            Ok(Ok(_)) => continue,
            Ok(Err(e)) => e.to_string(),
            Err(_) => RunnerError::ProbeTimeout {
                agent: runner.name().to_string(),
            }
            .to_string(),
        };

        warn!(agent = %runner.name(), error = %cause, "health check failed");
        runner.fail_if_running(cause);
    }
}
