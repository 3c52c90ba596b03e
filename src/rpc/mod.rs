//! Client-side RPC plumbing: message types, wire codec, gRPC client.

pub mod client;
pub mod types;
pub mod wire;

pub use client::{AgentClient, ExecuteStream};
pub use types::{Empty, HealthResponse, TaskEvent, TaskRequest};
