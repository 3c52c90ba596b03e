//! Per-agent lifecycle state machine.
//!
//! A [`Runner`] owns one child process, one RPC client, and the single
//! authoritative state value for its agent. State transitions are
//! serialized behind one `RwLock`; the lock is never held across an await,
//! so long-running I/O (scanning stdout, waiting on the process, RPCs)
//! happens outside it.
//!
//! The child is cancelled through a [`CancellationToken`] derived from the
//! caller's token. The exit monitor is the only task that waits on the
//! process: on cancellation it SIGKILLs the child's process group and
//! reaps it, and on exit it records the death as a failure unless `stop`
//! already moved the runner to Stopped.

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::manifest::Manifest;
use crate::error::RunnerError;
use crate::rpc::client::AgentClient;
use crate::rpc::types::{HealthResponse, TaskEvent, TaskRequest};

/// How long the child has to print its `AGENT_PORT=` line.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// How long `stop` waits for the exit monitor to confirm the child is gone.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Lifecycle state of an agent subprocess.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerState {
    Stopped,
    Starting,
    Running,
    Failed,
}

impl fmt::Display for RunnerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunnerState::Stopped => "stopped",
            RunnerState::Starting => "starting",
            RunnerState::Running => "running",
            RunnerState::Failed => "failed",
        })
    }
}

/// Snapshot of a runner for external readers. Carries no handle to the
/// underlying process.
#[derive(Clone, Debug, Serialize)]
pub struct AgentStatus {
    pub name: String,
    pub state: RunnerState,
    pub skills: Vec<String>,
    #[serde(skip_serializing_if = "port_is_zero")]
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn port_is_zero(port: &u16) -> bool {
    *port == 0
}

/// Mutable per-agent state, guarded by the runner's lock.
struct Cell {
    state: RunnerState,
    port: u16,
    client: Option<AgentClient>,
    cancel: Option<CancellationToken>,
    /// Fired by the exit monitor once the process has been reaped.
    exited: Option<CancellationToken>,
    error: Option<String>,
}

/// Supervisor for a single agent subprocess.
pub struct Runner {
    manifest: Manifest,
    base_dir: PathBuf,
    handshake_timeout: Duration,
    cell: Arc<RwLock<Cell>>,
}

impl Runner {
    pub fn new(manifest: Manifest, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            manifest,
            base_dir: base_dir.into(),
            handshake_timeout: HANDSHAKE_TIMEOUT,
            cell: Arc::new(RwLock::new(Cell {
                state: RunnerState::Stopped,
                port: 0,
                client: None,
                cancel: None,
                exited: None,
                error: None,
            })),
        }
    }

    /// Override the handshake deadline (mainly for fast-failing tests).
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.manifest.name
    }

    pub fn state(&self) -> RunnerState {
        self.cell.read().unwrap().state
    }

    /// Spawn the subprocess, wait for the port handshake, and build the RPC
    /// client. Returns immediately with `Ok` if already Starting or Running.
    ///
    /// Cancelling `parent` tears the child down through the exit monitor.
    pub async fn start(&self, parent: &CancellationToken) -> Result<(), RunnerError> {
        let (cancel, exited) = {
            let mut cell = self.cell.write().unwrap();
            if matches!(cell.state, RunnerState::Running | RunnerState::Starting) {
                return Ok(());
            }
            cell.state = RunnerState::Starting;
            cell.error = None;
            let cancel = parent.child_token();
            let exited = CancellationToken::new();
            cell.cancel = Some(cancel.clone());
            cell.exited = Some(exited.clone());
            (cancel, exited)
        };

        let work_dir = self.manifest.abs_dir(&self.base_dir);
        let mut command = Command::new(&self.manifest.command);
        command
            .args(&self.manifest.args)
            .current_dir(&work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(source) => {
                let err = RunnerError::Spawn {
                    agent: self.manifest.name.clone(),
                    source,
                };
                self.fail_start(&cancel, err.to_string());
                return Err(err);
            }
        };

        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                let err = RunnerError::StdoutPipe {
                    agent: self.manifest.name.clone(),
                };
                self.fail_start(&cancel, err.to_string());
                return Err(err);
            }
        };

        if let Some(stderr) = child.stderr.take() {
            let agent = self.manifest.name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.is_empty() {
                        debug!(agent = %agent, line = %line, "agent stderr");
                    }
                }
            });
        }

        info!(agent = %self.manifest.name, pid = ?child.id(), "agent process started");

        self.spawn_monitor(child, cancel.clone(), exited);

        // Stdout scanner: resolves the handshake through the port/error
        // channels, then keeps draining lines to the debug log.
        let (port_tx, port_rx) = oneshot::channel();
        let (err_tx, err_rx) = oneshot::channel();
        let agent = self.manifest.name.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let mut port_tx = Some(port_tx);
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(rest) = line.strip_prefix("AGENT_PORT=") {
                    if let Some(tx) = port_tx.take() {
                        match rest.trim().parse::<u16>() {
                            Ok(port) => {
                                let _ = tx.send(port);
                                continue;
                            }
                            Err(_) => {
                                let _ = err_tx.send(RunnerError::HandshakeMalformed {
                                    agent: agent.clone(),
                                    line,
                                });
                                return;
                            }
                        }
                    }
                }
                debug!(agent = %agent, line = %line, "agent stdout");
            }
            if port_tx.is_some() {
                let _ = err_tx.send(RunnerError::HandshakeExit { agent });
            }
        });

        let handshake = async {
            match port_rx.await {
                Ok(port) => Ok(port),
                // Scanner dropped the port sender; the cause is on err_rx.
                Err(_) => Err(err_rx.await.unwrap_or_else(|_| RunnerError::HandshakeExit {
                    agent: self.manifest.name.clone(),
                })),
            }
        };
        let port = match tokio::time::timeout(self.handshake_timeout, handshake).await {
            Ok(Ok(port)) => port,
            Ok(Err(err)) => {
                self.fail_start(&cancel, err.to_string());
                return Err(err);
            }
            Err(_) => {
                let err = RunnerError::HandshakeTimeout {
                    agent: self.manifest.name.clone(),
                };
                self.fail_start(&cancel, err.to_string());
                return Err(err);
            }
        };

        info!(agent = %self.manifest.name, port, "agent port received");

        let client = match AgentClient::connect_lazy(port) {
            Ok(client) => client,
            Err(source) => {
                let err = RunnerError::Dial {
                    agent: self.manifest.name.clone(),
                    addr: format!("127.0.0.1:{port}"),
                    source,
                };
                self.fail_start(&cancel, err.to_string());
                return Err(err);
            }
        };

        {
            let mut cell = self.cell.write().unwrap();
            // A concurrent stop won the race; its result stands.
            if cell.state != RunnerState::Starting {
                debug!(agent = %self.manifest.name, "start superseded by stop");
                return Ok(());
            }
            cell.port = port;
            cell.client = Some(client);
            cell.state = RunnerState::Running;
        }

        info!(agent = %self.manifest.name, addr = %format!("127.0.0.1:{port}"), "agent connected");
        Ok(())
    }

    /// Stop the subprocess. Safe to call from any state.
    ///
    /// State moves to Stopped before the child is signalled, which is what
    /// tells the exit monitor the termination was intentional.
    pub async fn stop(&self) {
        let (prev, client, cancel, exited) = {
            let mut cell = self.cell.write().unwrap();
            let prev = cell.state;
            cell.state = RunnerState::Stopped;
            (
                prev,
                cell.client.take(),
                cell.cancel.take(),
                cell.exited.clone(),
            )
        };

        drop(client);

        if let Some(cancel) = cancel {
            cancel.cancel();
        }

        if let Some(exited) = exited {
            if matches!(prev, RunnerState::Running | RunnerState::Starting)
                && tokio::time::timeout(STOP_GRACE, exited.cancelled())
                    .await
                    .is_err()
            {
                warn!(agent = %self.manifest.name, "agent stop timed out");
            }
        }

        info!(agent = %self.manifest.name, "agent stopped");
    }

    /// Send a task to the agent and collect the full event stream.
    pub async fn execute(&self, req: TaskRequest) -> Result<Vec<TaskEvent>, RunnerError> {
        let mut client = self.running_client()?;
        let stream = client.execute(req).await.map_err(|source| RunnerError::Rpc {
            agent: self.manifest.name.clone(),
            source,
        })?;
        stream.recv_all().await.map_err(|source| RunnerError::Rpc {
            agent: self.manifest.name.clone(),
            source,
        })
    }

    /// Probe the agent's health endpoint.
    pub async fn health(&self) -> Result<HealthResponse, RunnerError> {
        let mut client = self.running_client()?;
        client.health().await.map_err(|source| RunnerError::Rpc {
            agent: self.manifest.name.clone(),
            source,
        })
    }

    /// Current status as a pure value.
    pub fn status(&self) -> AgentStatus {
        let cell = self.cell.read().unwrap();
        AgentStatus {
            name: self.manifest.name.clone(),
            state: cell.state,
            skills: self.manifest.skills.clone(),
            port: cell.port,
            error: cell.error.clone(),
        }
    }

    /// Demote a Running runner to Failed (used by the health loop). A no-op
    /// in every other state: stop and restart take precedence.
    pub(crate) fn fail_if_running(&self, cause: String) {
        let mut cell = self.cell.write().unwrap();
        if cell.state != RunnerState::Running {
            return;
        }
        cell.state = RunnerState::Failed;
        error!(agent = %self.manifest.name, error = %cause, "agent failed");
        cell.error = Some(cause);
    }

    /// Capture a consistent (state, client) pair; callers do their RPC
    /// outside the lock, so a concurrent stop may invalidate the clone --
    /// the transport error that produces is surfaced, not hidden.
    fn running_client(&self) -> Result<AgentClient, RunnerError> {
        let cell = self.cell.read().unwrap();
        match (cell.state, &cell.client) {
            (RunnerState::Running, Some(client)) => Ok(client.clone()),
            _ => Err(RunnerError::NotRunning {
                agent: self.manifest.name.clone(),
                state: cell.state,
            }),
        }
    }

    /// Failure path shared by start: tear the child down and record the
    /// cause. A no-op if a concurrent stop already moved us to Stopped.
    fn fail_start(&self, cancel: &CancellationToken, cause: String) {
        cancel.cancel();
        let mut cell = self.cell.write().unwrap();
        if cell.state == RunnerState::Stopped {
            return;
        }
        cell.state = RunnerState::Failed;
        error!(agent = %self.manifest.name, error = %cause, "agent failed");
        cell.error = Some(cause);
    }

    /// Launch the exit monitor: the sole task that waits on the child.
    ///
    /// `exited` belongs to this process generation; a restart allocates a
    /// fresh one, so a late monitor never signals the wrong generation.
    fn spawn_monitor(&self, mut child: Child, cancel: CancellationToken, exited: CancellationToken) {
        let cell = Arc::clone(&self.cell);
        let agent = self.manifest.name.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = cancel.cancelled() => {
                    #[cfg(unix)]
                    kill_process_group(&child);
                    #[cfg(not(unix))]
                    let _ = child.start_kill();
                    child.wait().await
                }
            };

            exited.cancel();

            let mut cell = cell.write().unwrap();

            // Stop writes Stopped before cancelling, so reaching this branch
            // means the process died out from under us.
            if cell.state == RunnerState::Running {
                cell.state = RunnerState::Failed;
                let cause = match status {
                    Ok(status) if status.success() => {
                        "process exited unexpectedly with code 0".to_string()
                    }
                    Ok(status) => format!("process exited unexpectedly ({status})"),
                    Err(e) => format!("process exited unexpectedly: {e}"),
                };
                warn!(agent = %agent, error = %cause, "agent process exited");
                cell.error = Some(cause);
            }
        });
    }
}

/// SIGKILL the child's process group (the child was spawned with
/// `process_group(0)`, so its own descendants die with it).
#[cfg(unix)]
fn kill_process_group(child: &Child) {
    if let Some(pid) = child.id() {
        let pgid = nix::unistd::Pid::from_raw(pid as i32);
        let _ = nix::sys::signal::killpg(pgid, nix::sys::signal::Signal::SIGKILL);
    }
}
