//! Orchestrator configuration, persisted as JSON.
//!
//! The config file lives in the platform config directory
//! (`~/.config/idra/config.json` on Linux). Saves are atomic (write to a
//! temp file, then rename) and a bearer token for the HTTP API is minted on
//! first run. The store is a plain struct behind an `RwLock` -- no process
//! globals.

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::ConfigError;

/// Per-agent override. `enabled: None` means enabled.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentConfig {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub port: u16,
    pub bearer_token: String,
    pub auto_open_browser: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub agents: Vec<AgentConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 7600,
            bearer_token: String::new(),
            auto_open_browser: true,
            agents: Vec::new(),
        }
    }
}

/// Reader/writer handle for the on-disk config.
#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    current: RwLock<Config>,
}

impl ConfigStore {
    /// Platform default config path (`<config dir>/idra/config.json`).
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "idra")
            .map(|dirs| dirs.config_dir().join("config.json"))
    }

    /// Load from `path`, creating the file (with a fresh bearer token) when
    /// it does not exist yet.
    pub fn load(path: PathBuf) -> Result<Self, ConfigError> {
        let mut config = match std::fs::read(&path) {
            Ok(data) => serde_json::from_slice(&data).map_err(|source| ConfigError::Parse {
                path: path.clone(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "no config file, writing defaults");
                Config::default()
            }
            Err(source) => return Err(ConfigError::Read { path, source }),
        };

        let mut dirty = config.bearer_token.is_empty();
        if dirty {
            config.bearer_token = generate_token();
        }
        // Also (re)create the file when it was missing entirely.
        if !path.exists() {
            dirty = true;
        }
        if dirty {
            save_to(&path, &config)?;
        }

        Ok(Self {
            path,
            current: RwLock::new(config),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current config as a value.
    pub fn get(&self) -> Config {
        self.current.read().unwrap().clone()
    }

    /// Apply `apply` to a copy of the config, validate it, persist it, and
    /// make it current.
    pub fn update(&self, apply: impl FnOnce(&mut Config)) -> Result<Config, ConfigError> {
        let mut current = self.current.write().unwrap();
        let mut next = current.clone();
        apply(&mut next);
        validate(&next)?;
        save_to(&self.path, &next)?;
        *current = next.clone();
        Ok(next)
    }

    /// Replace the whole config. The bearer token cannot be changed this
    /// way; the stored one is carried over.
    pub fn replace(&self, mut config: Config) -> Result<Config, ConfigError> {
        let mut current = self.current.write().unwrap();
        config.bearer_token = current.bearer_token.clone();
        validate(&config)?;
        save_to(&self.path, &config)?;
        *current = config.clone();
        Ok(config)
    }
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.port == 0 {
        return Err(ConfigError::InvalidPort);
    }
    Ok(())
}

fn save_to(path: &Path, config: &Config) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })?;
    }

    let data = serde_json::to_vec_pretty(config).map_err(|source| ConfigError::Encode { source })?;

    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, data).map_err(|source| ConfigError::Write {
        path: tmp.clone(),
        source,
    })?;
    std::fs::rename(&tmp, path).map_err(|source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    })
}

fn generate_token() -> String {
    // Two v4 UUIDs give 64 hex chars of token material.
    format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}
