//! Data contracts shared with the provisioning and test-execution stages.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Supported deployer back-ends. Used as the registry lookup key.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeployerType {
    Shell,
    Kubernetes,
    Docker,
}

impl DeployerType {
    /// All deployer types, in declaration order.
    pub const ALL: [DeployerType; 3] = [
        DeployerType::Shell,
        DeployerType::Kubernetes,
        DeployerType::Docker,
    ];

    /// Canonical upper-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeployerType::Shell => "SHELL",
            DeployerType::Kubernetes => "KUBERNETES",
            DeployerType::Docker => "DOCKER",
        }
    }
}

impl fmt::Display for DeployerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeployerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DeployerType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown deployer type: {s}"))
    }
}

/// Logical type of a deployment script.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScriptType {
    #[default]
    Shell,
    Kubernetes,
    Helm,
    Docker,
}

impl ScriptType {
    /// The deployer expected to run scripts of this type.
    pub fn deployer_type(&self) -> DeployerType {
        match self {
            ScriptType::Shell => DeployerType::Shell,
            ScriptType::Kubernetes | ScriptType::Helm => DeployerType::Kubernetes,
            ScriptType::Docker => DeployerType::Docker,
        }
    }
}

/// Identity and deployment settings of a test run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TestPlan {
    /// Test plan identifier.
    pub id: String,

    /// Working-directory root for the deployment step.
    pub deployment_repository: PathBuf,

    /// Deployer requested by the plan.
    pub deployer_type: DeployerType,

    /// Optional deployment pattern name (e.g. "two-node-cluster").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_pattern: Option<String>,

    /// Infrastructure and deployment metadata.
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

impl TestPlan {
    pub fn new(
        id: impl Into<String>,
        deployment_repository: impl Into<PathBuf>,
        deployer_type: DeployerType,
    ) -> Self {
        Self {
            id: id.into(),
            deployment_repository: deployment_repository.into(),
            deployer_type,
            deployment_pattern: None,
            parameters: BTreeMap::new(),
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn repository(&self) -> &Path {
        &self.deployment_repository
    }
}

/// Cluster coordinates for orchestrator back-ends.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ClusterDetails {
    /// API server endpoint.
    pub endpoint: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Path to a kubeconfig file on the execution host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<PathBuf>,
}

/// Output of infrastructure provisioning. Read-only input to this layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct InfrastructureProvisionResult {
    /// Name of the provisioned infrastructure (stack name, cluster name, ...).
    pub name: String,

    /// Addressable endpoints keyed by logical name.
    #[serde(default)]
    pub endpoints: BTreeMap<String, String>,

    /// Credentials needed to reach the environment.
    #[serde(default)]
    pub credentials: BTreeMap<String, String>,

    /// Cloud resource identifiers.
    #[serde(default)]
    pub resource_ids: BTreeMap<String, String>,

    /// Free-form provisioning outputs.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<ClusterDetails>,
}

impl InfrastructureProvisionResult {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_endpoint(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.endpoints.insert(key.into(), value.into());
        self
    }

    pub fn with_credential(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.credentials.insert(key.into(), value.into());
        self
    }

    pub fn with_cluster(mut self, cluster: ClusterDetails) -> Self {
        self.cluster = Some(cluster);
        self
    }
}

/// Descriptor of the deployment script to run.
///
/// At most one of `asset`, `inline_content` and `file` should be set.
/// Orchestrator deployers ignore all three and stage their bundled script.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Script {
    /// File name used when the script is staged.
    pub name: String,

    #[serde(default)]
    pub script_type: ScriptType,

    /// Name of an embedded asset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_content: Option<String>,

    /// Existing script, relative to the deployment repository.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,

    /// Exposed to the script as environment variables.
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,

    /// Overrides the configured timeout for this script.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl Script {
    pub fn new(name: impl Into<String>, script_type: ScriptType) -> Self {
        Self {
            name: name.into(),
            script_type,
            ..Default::default()
        }
    }

    pub fn inline(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            inline_content: Some(content.into()),
            ..Self::new(name, ScriptType::Shell)
        }
    }

    pub fn from_asset(name: impl Into<String>, asset: impl Into<String>) -> Self {
        Self {
            asset: Some(asset.into()),
            ..Self::new(name, ScriptType::Shell)
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }
}

/// Terminal status of a deploy call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentStatus {
    Success,
    /// Script exited 0 but required output markers were missing.
    PartialSuccess,
    Failed,
    TimedOut,
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeploymentStatus::Success => "SUCCESS",
            DeploymentStatus::PartialSuccess => "PARTIAL_SUCCESS",
            DeploymentStatus::Failed => "FAILED",
            DeploymentStatus::TimedOut => "TIMED_OUT",
        };
        f.write_str(s)
    }
}

/// Captured script output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct DeploymentLogs {
    pub stdout: String,
    pub stderr: String,

    /// True when either stream exceeded the capture cap.
    pub truncated: bool,

    /// Combined log persisted in the per-call output directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
}

impl DeploymentLogs {
    /// Whether `needle` appears in either stream.
    pub fn contains(&self, needle: &str) -> bool {
        self.stdout.contains(needle) || self.stderr.contains(needle)
    }
}

/// Structured outcome of one deploy call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentCreationResult {
    pub deployment_id: Uuid,
    pub test_plan_id: String,
    pub deployer: DeployerType,
    pub status: DeploymentStatus,

    /// Service endpoints reported by the script.
    pub endpoints: BTreeSet<String>,

    /// Every recognized marker key and its value.
    pub outputs: BTreeMap<String, String>,

    /// Required marker keys the script did not emit.
    #[serde(default)]
    pub missing_keys: Vec<String>,

    /// Absent when the script was killed before exiting.
    pub exit_code: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    pub logs: DeploymentLogs,

    /// SHA-256 of the script that was executed.
    pub script_digest: String,

    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl DeploymentCreationResult {
    /// Only a full success counts; partial success is a degraded state.
    pub fn is_success(&self) -> bool {
        self.status == DeploymentStatus::Success
    }

    pub fn output(&self, key: &str) -> Option<&str> {
        self.outputs.get(key).map(String::as_str)
    }
}
