//! Orchestrator configuration
//!
//! A fixed, enumerated set of options parsed from `.gitswarm/config.toml`.
//! Unknown keys are rejected rather than silently ignored; every field has
//! a default so an absent file yields a working configuration.

use crate::error::{OrchestratorError, Result};
use crate::utils::config_path;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct OrchestratorConfig {
    /// Branch the conflict monitor merges clean work into.
    #[serde(default = "default_integration_branch")]
    pub integration_branch: String,

    /// Seconds between conflict monitor sweeps.
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,

    /// Upper bound on concurrently running sessions per team.
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,

    /// Retries after a transient task failure. Merge escalations never retry.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Consecutive no-change turns before a session times out.
    #[serde(default = "default_no_progress_turns")]
    pub no_progress_turns: u32,

    /// Seconds allowed for one auto-resolution attempt.
    #[serde(default = "default_resolve_timeout_secs")]
    pub resolve_timeout_secs: u64,
}

fn default_integration_branch() -> String {
    "main".to_string()
}

fn default_check_interval_secs() -> u64 {
    60
}

fn default_max_concurrent_tasks() -> usize {
    3
}

fn default_max_retries() -> u32 {
    1
}

fn default_no_progress_turns() -> u32 {
    3
}

fn default_resolve_timeout_secs() -> u64 {
    120
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            integration_branch: default_integration_branch(),
            check_interval_secs: default_check_interval_secs(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
            max_retries: default_max_retries(),
            no_progress_turns: default_no_progress_turns(),
            resolve_timeout_secs: default_resolve_timeout_secs(),
        }
    }
}

impl OrchestratorConfig {
    /// Load from `<repo>/.gitswarm/config.toml`, falling back to defaults
    /// when the file does not exist.
    pub fn load(repo_path: &Path) -> Result<Self> {
        let path = config_path(repo_path);
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path).map_err(|e| {
            OrchestratorError::Repository(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: Self = toml::from_str(&content).map_err(|e| {
            OrchestratorError::Repository(format!("Invalid config at {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.integration_branch.is_empty() {
            return Err(OrchestratorError::Invariant(
                "integration_branch must not be empty".to_string(),
            ));
        }
        if self.check_interval_secs == 0 {
            return Err(OrchestratorError::Invariant(
                "check_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.max_concurrent_tasks == 0 {
            return Err(OrchestratorError::Invariant(
                "max_concurrent_tasks must be at least 1".to_string(),
            ));
        }
        if self.no_progress_turns == 0 {
            return Err(OrchestratorError::Invariant(
                "no_progress_turns must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::gitswarm_dir;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.integration_branch, "main");
        assert_eq!(config.check_interval_secs, 60);
        assert_eq!(config.max_retries, 1);
        config.validate().unwrap();
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config = OrchestratorConfig::load(temp_dir.path()).unwrap();
        assert_eq!(config, OrchestratorConfig::default());
    }

    #[test]
    fn test_load_partial_file() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::create_dir_all(gitswarm_dir(temp_dir.path())).unwrap();
        std::fs::write(
            config_path(temp_dir.path()),
            "integration_branch = \"develop\"\ncheck_interval_secs = 10\n",
        )
        .unwrap();

        let config = OrchestratorConfig::load(temp_dir.path()).unwrap();
        assert_eq!(config.integration_branch, "develop");
        assert_eq!(config.check_interval_secs, 10);
        assert_eq!(config.max_retries, 1);
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::create_dir_all(gitswarm_dir(temp_dir.path())).unwrap();
        std::fs::write(
            config_path(temp_dir.path()),
            "integration_branch = \"main\"\nsurprise_option = true\n",
        )
        .unwrap();

        assert!(OrchestratorConfig::load(temp_dir.path()).is_err());
    }

    #[test]
    fn test_zero_interval_rejected() {
        let config = OrchestratorConfig {
            check_interval_secs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
