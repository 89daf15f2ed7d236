//! Service manifests.
//!
//! A manifest is a YAML document describing one service:
//!
//! ```yaml
//! Description: Switches lights on request
//! Topics:
//!   - "home/{ROOM[,]}/light/set"
//!   - "home/{EXTRA}?/light/set"
//! EnvironmentFiles:
//!   - /etc/hookrelay/lights.env
//! Hooks:
//!   OnReceive: /usr/bin/set-light "$TOPIC"
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ManifestError;
use crate::hook::HookKind;

/// The `Hooks` section of a manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ManifestHooks {
    /// Command run for every delivered message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_receive: Option<String>,
}

/// Declarative description of one service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Manifest {
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// Topic templates.
    #[serde(default)]
    pub topics: Vec<String>,
    /// Environment files, merged in order.
    #[serde(default)]
    pub environment_files: Vec<PathBuf>,
    /// Hook command lines.
    #[serde(default)]
    pub hooks: ManifestHooks,
}

impl Manifest {
    /// Parses a manifest from raw YAML. `path` is only used in errors.
    ///
    /// # Errors
    ///
    /// [`ManifestError::Parse`] if the document is not a valid manifest.
    pub fn from_slice(data: &[u8], path: &Path) -> Result<Self, ManifestError> {
        serde_yaml::from_slice(data).map_err(|source| ManifestError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Reads and parses the manifest at `path`.
    ///
    /// # Errors
    ///
    /// [`ManifestError::Read`] if the file cannot be read, otherwise see
    /// [`Manifest::from_slice`].
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let data = fs::read(path).map_err(|source| ManifestError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_slice(&data, path)
    }

    /// Command line configured for `kind`, if any.
    #[must_use]
    pub fn hook_command(&self, kind: HookKind) -> Option<&str> {
        let command = match kind {
            HookKind::OnReceive => self.hooks.on_receive.as_deref(),
        };
        command.filter(|c| !c.trim().is_empty())
    }
}
