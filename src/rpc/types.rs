//! Message types for the agent RPC protocol.
//!
//! Plain structs encoded and decoded by the hand-written codec in
//! [`super::wire`] -- no protoc code generation, but the byte layout is
//! standard protobuf wire format, so agents built with stock protobuf
//! toolchains (Python, TypeScript, ...) stay compatible.
//!
//! All types also serialize to JSON for the HTTP frontend.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Task sent by the orchestrator to an agent.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub task_id: String,
    pub skill: String,
    pub input: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

/// Event streamed back from an agent while it works a task.
///
/// Agents conventionally use the types "progress", "result", and "error",
/// but the orchestrator does not interpret them -- every received event is
/// passed through to the caller.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub task_id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: String,
}

/// Reply to the unary health probe.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub agent_name: String,
}

/// Mirrors `google.protobuf.Empty`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Empty;
