//! Result correlation: turn a raw script outcome into a
//! [`DeploymentCreationResult`].
//!
//! Scripts report outputs as marker lines (`KEY=VALUE` by default). The line
//! grammar, the recognized key prefix and the required keys all come from
//! [`MarkerConfig`].

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Instant;

use chrono::{DateTime, Utc};
use regex::Regex;
use uuid::Uuid;

use crate::config::MarkerConfig;
use crate::error::{DeployError, DeployResult};
use crate::executor::ExecutionOutcome;
use crate::model::{DeployerType, DeploymentCreationResult, DeploymentLogs, DeploymentStatus};

/// Marker values extracted from script output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Markers {
    pub outputs: BTreeMap<String, String>,
    pub endpoints: BTreeSet<String>,
}

impl Markers {
    /// Merge `other` into `self`; its values win on key conflicts.
    pub fn merge(&mut self, other: Markers) {
        self.outputs.extend(other.outputs);
        self.endpoints.extend(other.endpoints);
    }
}

/// Compiled marker grammar.
#[derive(Debug, Clone)]
pub struct MarkerProtocol {
    line: Regex,
    key_prefix: String,
    endpoint_prefix: String,
    required_keys: Vec<String>,
}

impl MarkerProtocol {
    pub fn from_config(config: &MarkerConfig) -> DeployResult<Self> {
        let line = Regex::new(&config.pattern)
            .map_err(|e| DeployError::InvalidConfig(format!("invalid marker pattern: {e}")))?;
        let groups: Vec<&str> = line.capture_names().flatten().collect();
        if !groups.contains(&"key") || !groups.contains(&"value") {
            return Err(DeployError::InvalidConfig(
                "marker pattern must define named groups `key` and `value`".into(),
            ));
        }
        Ok(Self {
            line,
            key_prefix: config.key_prefix.clone(),
            endpoint_prefix: config.endpoint_prefix.clone(),
            required_keys: config.required_keys.clone(),
        })
    }

    pub fn required_keys(&self) -> &[String] {
        &self.required_keys
    }

    /// Extract recognized markers from `text`. Non-matching lines and keys
    /// without the recognized prefix are ignored; the last value of a
    /// repeated key wins.
    pub fn parse(&self, text: &str) -> Markers {
        let mut markers = Markers::default();
        for line in text.lines() {
            let Some(caps) = self.line.captures(line) else {
                continue;
            };
            let (Some(key), Some(value)) = (caps.name("key"), caps.name("value")) else {
                continue;
            };
            let (key, value) = (key.as_str(), value.as_str());
            if !key.starts_with(&self.key_prefix) {
                continue;
            }
            if key.starts_with(&self.endpoint_prefix) && !value.is_empty() {
                markers.endpoints.insert(value.to_string());
            }
            markers.outputs.insert(key.to_string(), value.to_string());
        }
        markers
    }

    /// Required keys absent from `markers`, in configured order.
    pub fn missing_keys(&self, markers: &Markers) -> Vec<String> {
        self.required_keys
            .iter()
            .filter(|k| !markers.outputs.contains_key(k.as_str()))
            .cloned()
            .collect()
    }
}

/// Identity of the deploy call a result belongs to.
#[derive(Debug, Clone)]
pub struct CorrelationContext {
    pub deployment_id: Uuid,
    pub test_plan_id: String,
    pub deployer: DeployerType,
    pub script_digest: String,
    pub started_at: DateTime<Utc>,
    pub started: Instant,
    pub log_file: Option<PathBuf>,
}

impl CorrelationContext {
    pub fn new(test_plan_id: impl Into<String>, deployer: DeployerType) -> Self {
        Self {
            deployment_id: Uuid::new_v4(),
            test_plan_id: test_plan_id.into(),
            deployer,
            script_digest: String::new(),
            started_at: Utc::now(),
            started: Instant::now(),
            log_file: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResultCorrelator {
    protocol: MarkerProtocol,
}

impl ResultCorrelator {
    pub fn new(protocol: MarkerProtocol) -> Self {
        Self { protocol }
    }

    pub fn from_config(config: &MarkerConfig) -> DeployResult<Self> {
        Ok(Self::new(MarkerProtocol::from_config(config)?))
    }

    pub fn protocol(&self) -> &MarkerProtocol {
        &self.protocol
    }

    /// Build the result for a script that ran to completion.
    ///
    /// `outputs_file` is the content of the optional outputs file the script
    /// may write; its markers are merged after stdout's.
    pub fn correlate(
        &self,
        ctx: &CorrelationContext,
        outcome: &ExecutionOutcome,
        outputs_file: Option<&str>,
    ) -> DeploymentCreationResult {
        let logs = DeploymentLogs {
            stdout: outcome.stdout.clone(),
            stderr: outcome.stderr.clone(),
            truncated: outcome.truncated(),
            log_file: ctx.log_file.clone(),
        };

        if !outcome.succeeded() {
            let message = match outcome.signal {
                Some(signal) => format!("deployment script killed by signal {signal}"),
                None => format!("deployment script exited with code {}", outcome.exit_code),
            };
            return build(
                ctx,
                DeploymentStatus::Failed,
                Markers::default(),
                Vec::new(),
                Some(outcome.exit_code),
                Some(message),
                logs,
            );
        }

        let mut markers = self.protocol.parse(&outcome.stdout);
        if let Some(extra) = outputs_file {
            markers.merge(self.protocol.parse(extra));
        }
        let missing = self.protocol.missing_keys(&markers);
        let (status, message) = if missing.is_empty() {
            (DeploymentStatus::Success, None)
        } else {
            (
                DeploymentStatus::PartialSuccess,
                Some(format!(
                    "missing required output markers: {}",
                    missing.join(", ")
                )),
            )
        };

        build(ctx, status, markers, missing, Some(0), message, logs)
    }

    /// Build the result for a script killed at its time limit.
    pub fn timed_out(
        &self,
        ctx: &CorrelationContext,
        limit_ms: u64,
        stdout: String,
        stderr: String,
        truncated: bool,
    ) -> DeploymentCreationResult {
        let logs = DeploymentLogs {
            stdout,
            stderr,
            truncated,
            log_file: ctx.log_file.clone(),
        };
        build(
            ctx,
            DeploymentStatus::TimedOut,
            Markers::default(),
            Vec::new(),
            None,
            Some(format!("deployment script exceeded timeout of {limit_ms}ms")),
            logs,
        )
    }
}

fn build(
    ctx: &CorrelationContext,
    status: DeploymentStatus,
    markers: Markers,
    missing_keys: Vec<String>,
    exit_code: Option<i32>,
    message: Option<String>,
    logs: DeploymentLogs,
) -> DeploymentCreationResult {
    DeploymentCreationResult {
        deployment_id: ctx.deployment_id,
        test_plan_id: ctx.test_plan_id.clone(),
        deployer: ctx.deployer,
        status,
        endpoints: markers.endpoints,
        outputs: markers.outputs,
        missing_keys,
        exit_code,
        message,
        logs,
        script_digest: ctx.script_digest.clone(),
        started_at: ctx.started_at,
        duration_ms: ctx.started.elapsed().as_millis() as u64,
    }
}
