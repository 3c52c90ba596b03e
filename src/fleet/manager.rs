//! Fleet-wide orchestration facade.
//!
//! The manager materializes one [`Runner`] per registered manifest, keyed
//! by agent name. The runner map is built once and only read afterwards, so
//! it needs no lock; all mutable state lives inside the runners.

use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::registry::Registry;
use super::runner::{AgentStatus, Runner};
use crate::error::RunnerError;
use crate::rpc::types::{TaskEvent, TaskRequest};

pub struct Manager {
    registry: Registry,
    runners: HashMap<String, Arc<Runner>>,
}

impl Manager {
    /// Build one runner per registered manifest.
    pub fn new(registry: Registry) -> Self {
        let runners = registry
            .agents()
            .iter()
            .map(|manifest| {
                let runner = Runner::new(manifest.clone(), registry.base_dir());
                (manifest.name.clone(), Arc::new(runner))
            })
            .collect();
        Self { registry, runners }
    }

    /// Start every runner concurrently. Individual failures are logged and
    /// do not cancel peers; returns once every start attempt has settled.
    pub async fn start_all(&self, parent: &CancellationToken) {
        let starts = self.runners.values().map(|runner| {
            let runner = Arc::clone(runner);
            let parent = parent.clone();
            async move {
                if let Err(e) = runner.start(&parent).await {
                    error!(agent = %runner.name(), error = %e, "failed to start agent");
                }
            }
        });
        futures::future::join_all(starts).await;
        info!(count = self.runners.len(), "all agents started");
    }

    /// Stop every runner. Runners are independent, so ordering between
    /// peers does not matter.
    pub async fn stop_all(&self) {
        for runner in self.runners.values() {
            runner.stop().await;
        }
        info!("all agents stopped");
    }

    /// Execute a task on the named agent and collect its event stream.
    ///
    /// Skill-to-agent resolution happens upstream via the registry; this
    /// routes by agent name only.
    pub async fn route_task(
        &self,
        agent_name: &str,
        req: TaskRequest,
    ) -> Result<Vec<TaskEvent>, RunnerError> {
        let runner = self
            .runners
            .get(agent_name)
            .ok_or_else(|| RunnerError::UnknownAgent {
                name: agent_name.to_string(),
            })?;
        runner.execute(req).await
    }

    /// Status snapshots for every agent, in registry order.
    pub fn all_statuses(&self) -> Vec<AgentStatus> {
        self.registry
            .agents()
            .iter()
            .filter_map(|m| self.runners.get(&m.name))
            .map(|runner| runner.status())
            .collect()
    }

    /// Status snapshot for one agent by name.
    pub fn agent_status(&self, name: &str) -> Option<AgentStatus> {
        self.runners.get(name).map(|runner| runner.status())
    }

    /// Runner accessor (used by the health loop).
    pub fn runner(&self, name: &str) -> Option<&Arc<Runner>> {
        self.runners.get(name)
    }

    /// All runners, in no particular order.
    pub fn runners(&self) -> impl Iterator<Item = &Arc<Runner>> {
        self.runners.values()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}
