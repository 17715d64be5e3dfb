//! Environment handed to deployment scripts.
//!
//! Variables are layered, later layers overriding earlier ones:
//!
//! 1. test plan parameters and infrastructure properties (sanitized keys)
//! 2. `INFRA_ENDPOINT_*`, `INFRA_CREDENTIAL_*`, `INFRA_RESOURCE_*`
//! 3. script parameters
//! 4. reserved variables (`TESTPLAN_ID`, `DEPLOYMENT_REPOSITORY`, ...)
//!
//! Keys from free-form maps (layers 1 and 3) that name a variable the shell
//! or dynamic loader interprets, such as `PATH` or `LD_PRELOAD`, are dropped.
//!
//! Credential values are tracked as secrets and never appear in `Debug`
//! output or logs.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;

use tracing::warn;

use crate::model::{DeployerType, InfrastructureProvisionResult, Script, TestPlan};

pub const TESTPLAN_ID: &str = "TESTPLAN_ID";
pub const DEPLOYMENT_REPOSITORY: &str = "DEPLOYMENT_REPOSITORY";
pub const DEPLOY_OUTPUT_DIR: &str = "DEPLOY_OUTPUT_DIR";
pub const DEPLOYER_TYPE: &str = "DEPLOYER_TYPE";
pub const INFRA_NAME: &str = "INFRA_NAME";
pub const DEPLOYMENT_PATTERN: &str = "DEPLOYMENT_PATTERN";

const REDACTED: &str = "***";

/// Variables that change how the interpreter or loader behaves.
const PROTECTED_VARS: &[&str] = &[
    "PATH",
    "HOME",
    "SHELL",
    "USER",
    "IFS",
    "ENV",
    "BASH_ENV",
    "SHELLOPTS",
    "BASHOPTS",
    "PS4",
    "CDPATH",
];

const PROTECTED_PREFIXES: &[&str] = &["LD_", "DYLD_", "BASH_FUNC_"];

/// True for variable names that free-form parameters may not set.
pub fn is_protected(key: &str) -> bool {
    PROTECTED_VARS.contains(&key) || PROTECTED_PREFIXES.iter().any(|p| key.starts_with(p))
}

/// Named variables exposed to a deployment script.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct DeployEnvironment {
    vars: BTreeMap<String, String>,
    secrets: BTreeSet<String>,
}

impl DeployEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the environment for one deploy call.
    pub fn derive(
        plan: &TestPlan,
        infra: &InfrastructureProvisionResult,
        script: &Script,
        deployer: DeployerType,
        output_dir: &Path,
    ) -> Self {
        let mut env = Self::new();

        for (k, v) in plan.parameters.iter().chain(infra.properties.iter()) {
            env.set_parameter(env_key(k), v);
        }
        for (k, v) in &infra.endpoints {
            env.set(format!("INFRA_ENDPOINT_{}", env_key(k)), v);
        }
        for (k, v) in &infra.credentials {
            env.set_secret(format!("INFRA_CREDENTIAL_{}", env_key(k)), v);
        }
        for (k, v) in &infra.resource_ids {
            env.set(format!("INFRA_RESOURCE_{}", env_key(k)), v);
        }
        for (k, v) in &script.parameters {
            env.set_parameter(env_key(k), v);
        }

        env.set(TESTPLAN_ID, &plan.id);
        env.set(
            DEPLOYMENT_REPOSITORY,
            plan.deployment_repository.to_string_lossy(),
        );
        env.set(DEPLOY_OUTPUT_DIR, output_dir.to_string_lossy());
        env.set(DEPLOYER_TYPE, deployer.as_str());
        env.set(INFRA_NAME, &infra.name);
        if let Some(pattern) = &plan.deployment_pattern {
            env.set(DEPLOYMENT_PATTERN, pattern);
        }
        env
    }

    fn set_parameter(&mut self, key: String, value: &str) {
        if is_protected(&key) {
            warn!(key = %key, "Ignoring parameter that would override a protected variable");
            return;
        }
        self.set(key, value);
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        self.secrets.remove(&key);
        self.vars.insert(key, value.into());
    }

    /// Set a variable whose value must never be logged.
    pub fn set_secret(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        self.secrets.insert(key.clone());
        self.vars.insert(key, value.into());
    }

    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn is_secret(&self, key: &str) -> bool {
        self.secrets.contains(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.vars.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Copy of the variables with secret values masked.
    pub fn redacted(&self) -> BTreeMap<String, String> {
        self.vars
            .iter()
            .map(|(k, v)| {
                let v = if self.secrets.contains(k) {
                    REDACTED.to_string()
                } else {
                    v.clone()
                };
                (k.clone(), v)
            })
            .collect()
    }
}

impl fmt::Debug for DeployEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.redacted()).finish()
    }
}

/// Turn an arbitrary key into a portable environment variable name:
/// upper-case ASCII alphanumerics and `_`, never starting with a digit.
pub fn env_key(raw: &str) -> String {
    let mut key: String = raw
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    if key.is_empty() || key.starts_with(|c: char| c.is_ascii_digit()) {
        key.insert(0, '_');
    }
    key
}
