//! Deployer configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DeployError, DeployResult};
use crate::model::Script;

/// Default marker line grammar: `KEY=VALUE`, surrounding whitespace trimmed.
pub const DEFAULT_MARKER_PATTERN: &str =
    r"^\s*(?P<key>[A-Za-z_][A-Za-z0-9_]*)=(?P<value>.*?)\s*$";

/// Grammar of the `KEY=VALUE` lines a script uses to report outputs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MarkerConfig {
    /// Regex with named groups `key` and `value`.
    pub pattern: String,

    /// Keys with this prefix are recognized; others are ignored.
    pub key_prefix: String,

    /// Keys with this prefix also contribute to the endpoint set.
    pub endpoint_prefix: String,

    /// Keys whose absence downgrades a zero exit to partial success.
    pub required_keys: Vec<String>,
}

impl Default for MarkerConfig {
    fn default() -> Self {
        Self {
            pattern: DEFAULT_MARKER_PATTERN.to_string(),
            key_prefix: "OUTPUT_".to_string(),
            endpoint_prefix: "OUTPUT_ENDPOINT".to_string(),
            required_keys: vec!["OUTPUT_ENDPOINT".to_string()],
        }
    }
}

impl MarkerConfig {
    pub fn with_required_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_keys = keys.into_iter().map(Into::into).collect();
        self
    }
}

/// Subprocess settings for the shell execution engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Program used to run staged scripts.
    pub interpreter: String,

    /// Arguments placed before the script path.
    pub interpreter_args: Vec<String>,

    /// Capture cap per stream, in bytes.
    pub max_output_bytes: usize,

    /// Layer the derived environment over the parent's environment.
    pub inherit_env: bool,

    /// Kill processes the script left running in its group after exit.
    pub kill_lingering_processes: bool,

    /// How long to wait for pipes to drain after a kill (milliseconds).
    pub output_grace_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            interpreter: "bash".to_string(),
            interpreter_args: Vec::new(),
            max_output_bytes: 1024 * 1024,
            inherit_env: true,
            kill_lingering_processes: true,
            output_grace_ms: 2_000,
        }
    }
}

/// Top-level configuration shared by all deployers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeployConfig {
    /// Default script timeout in seconds.
    pub timeout_secs: u64,

    pub executor: ExecutorConfig,

    pub markers: MarkerConfig,

    /// Per-call output directories live under `<repository>/<output_dir_name>/`.
    pub output_dir_name: String,

    pub log_file_name: String,

    /// Optional `KEY=VALUE` file a script may write into its output directory.
    pub outputs_file_name: String,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 1_800,
            executor: ExecutorConfig::default(),
            markers: MarkerConfig::default(),
            output_dir_name: ".deployments".to_string(),
            log_file_name: "deploy.log".to_string(),
            outputs_file_name: "deployment.properties".to_string(),
        }
    }
}

impl DeployConfig {
    /// Load a JSON config file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> DeployResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: DeployConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> DeployResult<()> {
        if self.timeout_secs == 0 {
            return Err(DeployError::InvalidConfig(
                "timeout_secs must be greater than zero".into(),
            ));
        }
        if self.executor.interpreter.trim().is_empty() {
            return Err(DeployError::InvalidConfig("interpreter must not be empty".into()));
        }
        if self.executor.max_output_bytes == 0 {
            return Err(DeployError::InvalidConfig(
                "max_output_bytes must be greater than zero".into(),
            ));
        }
        for name in [&self.output_dir_name, &self.log_file_name, &self.outputs_file_name] {
            if name.is_empty() || name.contains('/') || name == ".." {
                return Err(DeployError::InvalidConfig(format!(
                    "invalid file name in config: {name:?}"
                )));
            }
        }
        Ok(())
    }

    /// Reject per-script settings that the config itself would refuse.
    pub fn validate_script(&self, script: &Script) -> DeployResult<()> {
        if script.timeout_secs == Some(0) {
            return Err(DeployError::InvalidScript(format!(
                "script {:?}: timeout_secs must be greater than zero",
                script.name
            )));
        }
        Ok(())
    }

    /// Timeout for `script`, honouring its override.
    pub fn timeout_for(&self, script: &Script) -> Duration {
        Duration::from_secs(script.timeout_secs.unwrap_or(self.timeout_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deploy_config_default() {
        let cfg = DeployConfig::default();
        assert_eq!(cfg.timeout_secs, 1_800);
        assert_eq!(cfg.executor.interpreter, "bash");
        assert_eq!(cfg.executor.max_output_bytes, 1024 * 1024);
        assert_eq!(cfg.markers.required_keys, vec!["OUTPUT_ENDPOINT".to_string()]);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_partial_json_takes_defaults() {
        let cfg: DeployConfig =
            serde_json::from_str(r#"{"timeout_secs": 30, "executor": {"interpreter": "sh"}}"#)
                .unwrap();
        assert_eq!(cfg.timeout_secs, 30);
        assert_eq!(cfg.executor.interpreter, "sh");
        assert!(cfg.executor.inherit_env);
        assert_eq!(cfg.markers.key_prefix, "OUTPUT_");
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let cfg = DeployConfig {
            timeout_secs: 0,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(DeployError::InvalidConfig(_))));
    }

    #[test]
    fn test_validate_rejects_path_in_file_name() {
        let cfg = DeployConfig {
            log_file_name: "../escape.log".into(),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_timeout_for_prefers_script_override() {
        let cfg = DeployConfig::default();
        let script = Script::inline("deploy.sh", "true").with_timeout_secs(30);
        assert_eq!(cfg.timeout_for(&script), Duration::from_secs(30));
        let script = Script::inline("deploy.sh", "true");
        assert_eq!(cfg.timeout_for(&script), Duration::from_secs(1_800));
    }

    #[test]
    fn test_validate_script_rejects_zero_timeout() {
        let cfg = DeployConfig::default();
        let script = Script::inline("deploy.sh", "true").with_timeout_secs(0);
        assert!(matches!(
            cfg.validate_script(&script),
            Err(DeployError::InvalidScript(_))
        ));
        assert!(cfg
            .validate_script(&Script::inline("deploy.sh", "true").with_timeout_secs(u64::MAX))
            .is_ok());
        assert!(cfg.validate_script(&Script::inline("deploy.sh", "true")).is_ok());
    }

    #[test]
    fn test_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deploy.json");
        std::fs::write(&path, r#"{"timeout_secs": 45}"#).unwrap();
        let cfg = DeployConfig::from_json_file(&path).unwrap();
        assert_eq!(cfg.timeout_secs, 45);
    }
}
