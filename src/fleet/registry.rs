//! Agent discovery: scans a directory of per-agent subdirectories.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use super::manifest::Manifest;
use crate::error::RegistryError;

/// Discovered agent manifests plus the skill-to-agent lookup map.
///
/// Immutable after construction; safe to share by reference.
pub struct Registry {
    agents: Vec<Manifest>,
    skill_map: HashMap<String, String>,
    base_dir: PathBuf,
}

impl Registry {
    /// Scan `agents_dir` for `<sub>/manifest.json` files.
    ///
    /// Subdirectories are visited in name order. A missing agents directory
    /// yields an empty registry; any other read error aborts construction.
    /// Manifests that fail to load are logged and skipped, and a skill
    /// already claimed by an earlier manifest stays with the first claimant.
    pub fn scan(agents_dir: &Path) -> Result<Self, RegistryError> {
        // Project base is the parent of agents/.
        let base_dir = agents_dir.parent().unwrap_or(Path::new("")).to_path_buf();
        let mut registry = Registry {
            agents: Vec::new(),
            skill_map: HashMap::new(),
            base_dir,
        };

        let read_dir = match std::fs::read_dir(agents_dir) {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(dir = %agents_dir.display(), "agents directory not found, no agents to load");
                return Ok(registry);
            }
            Err(source) => {
                return Err(RegistryError::ReadDir {
                    dir: agents_dir.to_path_buf(),
                    source,
                })
            }
        };

        let mut entries = Vec::new();
        for entry in read_dir {
            let entry = entry.map_err(|source| RegistryError::ReadDir {
                dir: agents_dir.to_path_buf(),
                source,
            })?;
            entries.push(entry.path());
        }
        entries.sort();

        for path in entries {
            if !path.is_dir() {
                continue;
            }
            let manifest_path = path.join("manifest.json");
            if !manifest_path.exists() {
                continue;
            }

            let manifest = match Manifest::load(&manifest_path) {
                Ok(manifest) => manifest,
                Err(e) => {
                    warn!(dir = %path.display(), error = %e, "skipping agent");
                    continue;
                }
            };

            for skill in &manifest.skills {
                if let Some(existing) = registry.skill_map.get(skill) {
                    warn!(
                        skill = %skill,
                        kept = %existing,
                        skipped = %manifest.name,
                        "skill conflict, keeping first agent"
                    );
                    continue;
                }
                registry
                    .skill_map
                    .insert(skill.clone(), manifest.name.clone());
            }

            info!(name = %manifest.name, skills = ?manifest.skills, "registered agent");
            registry.agents.push(manifest);
        }

        Ok(registry)
    }

    /// All accepted manifests, in scan order.
    pub fn agents(&self) -> &[Manifest] {
        &self.agents
    }

    /// The agent that owns a skill, if any.
    pub fn agent_for_skill(&self, skill: &str) -> Option<&str> {
        self.skill_map.get(skill).map(String::as_str)
    }

    /// Project base directory (parent of the agents directory).
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn add_agent(root: &Path, sub: &str, json: &str) {
        let dir = root.join(sub);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("manifest.json"), json).unwrap();
    }

    #[test]
    fn missing_agents_dir_yields_empty_registry() {
        let registry = Registry::scan(Path::new("/no/such/agents")).unwrap();
        assert!(registry.agents().is_empty());
        assert_eq!(registry.base_dir(), Path::new("/no/such"));
    }

    #[test]
    fn scans_subdirectories_in_name_order() {
        let tmp = TempDir::new().unwrap();
        add_agent(
            tmp.path(),
            "b-agent",
            r#"{"name": "beta", "skills": ["b"], "command": "c", "dir": "."}"#,
        );
        // No dir: legal, resolves to the project base.
        add_agent(
            tmp.path(),
            "a-agent",
            r#"{"name": "alpha", "skills": ["a"], "command": "c"}"#,
        );

        let registry = Registry::scan(tmp.path()).unwrap();
        let names: Vec<_> = registry.agents().iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "beta"]);
    }

    #[test]
    fn skips_files_and_dirs_without_manifest() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("stray.txt"), "ignore me").unwrap();
        std::fs::create_dir(tmp.path().join("empty")).unwrap();
        add_agent(
            tmp.path(),
            "real",
            r#"{"name": "real", "skills": ["s"], "command": "c", "dir": "."}"#,
        );

        let registry = Registry::scan(tmp.path()).unwrap();
        assert_eq!(registry.agents().len(), 1);
    }

    #[test]
    fn invalid_manifest_is_skipped_but_scan_continues() {
        let tmp = TempDir::new().unwrap();
        add_agent(tmp.path(), "broken", r#"{"name": "", "skills": []}"#);
        add_agent(
            tmp.path(),
            "ok",
            r#"{"name": "ok", "skills": ["s"], "command": "c", "dir": "."}"#,
        );

        let registry = Registry::scan(tmp.path()).unwrap();
        assert_eq!(registry.agents().len(), 1);
        assert_eq!(registry.agents()[0].name, "ok");
    }

    #[test]
    fn skill_conflict_keeps_first_claimant() {
        let tmp = TempDir::new().unwrap();
        add_agent(
            tmp.path(),
            "01-first",
            r#"{"name": "first", "skills": ["summarize", "extra"], "command": "c", "dir": "."}"#,
        );
        add_agent(
            tmp.path(),
            "02-second",
            r#"{"name": "second", "skills": ["summarize", "translate"], "command": "c", "dir": "."}"#,
        );

        let registry = Registry::scan(tmp.path()).unwrap();

        // Both agents register; only the contested skill stays with the first.
        assert_eq!(registry.agents().len(), 2);
        assert_eq!(registry.agent_for_skill("summarize"), Some("first"));
        assert_eq!(registry.agent_for_skill("extra"), Some("first"));
        assert_eq!(registry.agent_for_skill("translate"), Some("second"));
        assert_eq!(registry.agent_for_skill("unknown"), None);
    }

    #[test]
    fn base_dir_is_parent_of_agents_dir() {
        let tmp = TempDir::new().unwrap();
        let agents = tmp.path().join("agents");
        std::fs::create_dir(&agents).unwrap();
        let registry = Registry::scan(&agents).unwrap();
        assert_eq!(registry.base_dir(), tmp.path());
    }
}
