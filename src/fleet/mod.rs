//! Agent fleet supervision: discovery, lifecycle, routing, liveness.

pub mod health;
pub mod manager;
pub mod manifest;
pub mod registry;
pub mod runner;

pub use health::{spawn_health_loop, DEFAULT_HEALTH_INTERVAL};
pub use manager::Manager;
pub use manifest::Manifest;
pub use registry::Registry;
pub use runner::{AgentStatus, Runner, RunnerState};
