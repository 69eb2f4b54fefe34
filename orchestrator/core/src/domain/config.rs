// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Runner Configuration
//
// Tunables of a machine runner, loadable from a Kubernetes-style manifest:
//
//   apiVersion: 100monkeys.ai/v1
//   kind: MachineRunnerConfig
//   metadata:
//     name: warehouse-transport
//   spec:
//     resubscribe_initial_backoff: 250ms
//     resubscribe_max_backoff: 10s
//     diagnostics_capacity: 256
//
// Every field is optional and falls back to its default.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const API_VERSION: &str = "100monkeys.ai/v1";
pub const KIND: &str = "MachineRunnerConfig";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Delay before the first resubscription after a subscription error
    #[serde(default = "default_initial_backoff", with = "humantime_serde")]
    pub resubscribe_initial_backoff: Duration,

    /// Cap on a single resubscription delay (not an attempt limit)
    #[serde(default = "default_max_backoff", with = "humantime_serde")]
    pub resubscribe_max_backoff: Duration,

    /// Buffer size of the diagnostics broadcast channel
    #[serde(default = "default_diagnostics_capacity")]
    pub diagnostics_capacity: usize,
}

fn default_initial_backoff() -> Duration {
    Duration::from_millis(250)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(10)
}

fn default_diagnostics_capacity() -> usize {
    256
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            resubscribe_initial_backoff: default_initial_backoff(),
            resubscribe_max_backoff: default_max_backoff(),
            diagnostics_capacity: default_diagnostics_capacity(),
        }
    }
}

impl RunnerConfig {
    /// Delay before resubscription attempt `attempt` (0-based):
    /// `initial * 2^attempt`, capped at `resubscribe_max_backoff`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.resubscribe_initial_backoff
            .saturating_mul(factor)
            .min(self.resubscribe_max_backoff)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.resubscribe_initial_backoff.is_zero() {
            return Err(ConfigError::Invalid(
                "resubscribe_initial_backoff must be greater than zero".into(),
            ));
        }
        if self.resubscribe_max_backoff < self.resubscribe_initial_backoff {
            return Err(ConfigError::Invalid(format!(
                "resubscribe_max_backoff ({:?}) is below resubscribe_initial_backoff ({:?})",
                self.resubscribe_max_backoff, self.resubscribe_initial_backoff
            )));
        }
        if self.diagnostics_capacity == 0 {
            return Err(ConfigError::Invalid(
                "diagnostics_capacity must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Parse and validate a manifest, returning its spec.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let manifest: RunnerConfigManifest = serde_yaml::from_str(yaml)?;
        manifest.validate()?;
        Ok(manifest.spec)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&content)
    }
}

/// Top-level Kubernetes-style runner configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfigManifest {
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    pub kind: String,

    pub metadata: ManifestMetadata,

    #[serde(default)]
    pub spec: RunnerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
}

impl RunnerConfigManifest {
    pub fn new(name: impl Into<String>, spec: RunnerConfig) -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: name.into(),
                labels: None,
            },
            spec,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_version != API_VERSION {
            return Err(ConfigError::InvalidApiVersion(self.api_version.clone()));
        }
        if self.kind != KIND {
            return Err(ConfigError::InvalidKind(self.kind.clone()));
        }
        self.spec.validate()
    }

    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid apiVersion: '{0}'. Must be '100monkeys.ai/v1'")]
    InvalidApiVersion(String),

    #[error("Invalid kind: '{0}'. Must be 'MachineRunnerConfig'")]
    InvalidKind(String),

    #[error("Invalid runner config: {0}")]
    Invalid(String),
}
