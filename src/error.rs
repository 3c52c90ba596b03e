use std::path::PathBuf;

use crate::fleet::runner::RunnerState;

/// Errors from loading and validating a single agent manifest.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("read manifest {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse manifest {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid manifest {path}: {reason}")]
    Invalid { path: PathBuf, reason: String },
}

/// Errors from scanning the agents directory.
///
/// Per-manifest failures are not represented here: the registry logs and
/// skips those. Only a broken agents directory aborts construction.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("read agents dir {dir}: {source}")]
    ReadDir {
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors surfaced by a runner's lifecycle and RPC operations.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("spawn agent {agent}: {source}")]
    Spawn {
        agent: String,
        #[source]
        source: std::io::Error,
    },

    #[error("agent {agent}: stdout pipe unavailable")]
    StdoutPipe { agent: String },

    #[error("agent {agent} exited without printing AGENT_PORT")]
    HandshakeExit { agent: String },

    #[error("timeout waiting for AGENT_PORT from agent {agent}")]
    HandshakeTimeout { agent: String },

    #[error("agent {agent} printed a malformed port line: {line:?}")]
    HandshakeMalformed { agent: String, line: String },

    #[error("connect to agent {agent} at {addr}: {source}")]
    Dial {
        agent: String,
        addr: String,
        #[source]
        source: tonic::transport::Error,
    },

    #[error("agent {agent} is not running (state: {state})")]
    NotRunning { agent: String, state: RunnerState },

    #[error("rpc to agent {agent}: {source}")]
    Rpc {
        agent: String,
        #[source]
        source: tonic::Status,
    },

    #[error("agent {agent} health probe timed out")]
    ProbeTimeout { agent: String },

    #[error("unknown agent: {name}")]
    UnknownAgent { name: String },
}

/// Errors from the config store.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("encode config: {source}")]
    Encode {
        #[source]
        source: serde_json::Error,
    },

    #[error("write config {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("port must not be zero")]
    InvalidPort,
}

/// Errors from the HTTP frontend.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("no available port (tried {requested} and 7601-7609)")]
    NoAvailablePort { requested: u16 },
}
