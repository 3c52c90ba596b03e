//! Agent manifest loading and validation.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::ManifestError;

/// Immutable descriptor of a single agent, read from its `manifest.json`.
#[derive(Clone, Debug, Deserialize)]
pub struct Manifest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub skills: Vec<String>,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory, relative to the project base or absolute. An
    /// omitted dir resolves to the project base itself.
    #[serde(default)]
    pub dir: String,
}

impl Manifest {
    /// Read and validate a `manifest.json` file.
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let data = std::fs::read(path).map_err(|source| ManifestError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let manifest: Manifest =
            serde_json::from_slice(&data).map_err(|source| ManifestError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        manifest.validate(path)?;
        Ok(manifest)
    }

    fn validate(&self, path: &Path) -> Result<(), ManifestError> {
        let invalid = |reason: &str| ManifestError::Invalid {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        };
        if self.name.is_empty() {
            return Err(invalid("name is required"));
        }
        if self.skills.is_empty() {
            return Err(invalid("at least one skill is required"));
        }
        if self.command.is_empty() {
            return Err(invalid("command is required"));
        }
        Ok(())
    }

    /// Working directory resolved against `base`; absolute dirs pass through.
    pub fn abs_dir(&self, base: &Path) -> PathBuf {
        let dir = Path::new(&self.dir);
        if dir.is_absolute() {
            dir.to_path_buf()
        } else {
            base.join(dir)
        }
    }
}
