//! Runs a caller-described shell script inside the deployment repository.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::{Deployer, ScriptPipeline, ScriptSource};
use crate::assets::{AssetCatalog, SHELL_DEPLOY_SCRIPT};
use crate::config::DeployConfig;
use crate::error::{DeployError, DeployResult};
use crate::model::{
    DeployerType, DeploymentCreationResult, InfrastructureProvisionResult, Script, TestPlan,
};

/// Staged name for inline scripts that carry no name of their own.
const DEFAULT_INLINE_NAME: &str = "deploy.sh";

/// Deployer for [`DeployerType::Shell`].
///
/// The script comes from exactly one of `Script::asset`, `Script::inline_content`
/// or `Script::file`. With none set, the bundled `shell_deploy.sh` runs the
/// repository's own `deploy.sh`.
#[derive(Debug, Clone)]
pub struct ShellDeployer {
    pipeline: ScriptPipeline,
}

impl ShellDeployer {
    pub fn new(pipeline: ScriptPipeline) -> Self {
        Self { pipeline }
    }

    pub fn from_config(config: DeployConfig) -> DeployResult<Self> {
        Self::with_catalog(config, Arc::new(AssetCatalog::builtin()))
    }

    pub fn with_catalog(config: DeployConfig, catalog: Arc<AssetCatalog>) -> DeployResult<Self> {
        Ok(Self::new(ScriptPipeline::new(config, catalog)?))
    }
}

#[async_trait]
impl Deployer for ShellDeployer {
    fn name(&self) -> &str {
        DeployerType::Shell.as_str()
    }

    fn deployer_type(&self) -> DeployerType {
        DeployerType::Shell
    }

    async fn deploy(
        &self,
        plan: &TestPlan,
        infra: &InfrastructureProvisionResult,
        script: &Script,
    ) -> DeployResult<DeploymentCreationResult> {
        let source = script_source(script)?;
        self.pipeline
            .execute(
                DeployerType::Shell,
                plan,
                infra,
                script,
                source,
                BTreeMap::new(),
            )
            .await
    }
}

fn script_source(script: &Script) -> DeployResult<ScriptSource<'_>> {
    match (&script.asset, &script.inline_content, &script.file) {
        (Some(asset), None, None) => Ok(ScriptSource::Asset {
            name: asset,
            staged_name: staged_name(script, asset),
        }),
        (None, Some(content), None) => Ok(ScriptSource::Inline {
            content: content.as_bytes(),
            staged_name: staged_name(script, DEFAULT_INLINE_NAME),
        }),
        (None, None, Some(file)) => Ok(ScriptSource::Existing(file)),
        // Staged under the asset's own name so the repository's deploy.sh,
        // which the wrapper execs, is never overwritten.
        (None, None, None) => Ok(ScriptSource::Asset {
            name: SHELL_DEPLOY_SCRIPT,
            staged_name: SHELL_DEPLOY_SCRIPT,
        }),
        _ => Err(DeployError::InvalidScript(format!(
            "script {:?} sets more than one of asset, inline_content and file",
            script.name
        ))),
    }
}

fn staged_name<'a>(script: &'a Script, fallback: &'a str) -> &'a str {
    if script.name.trim().is_empty() {
        fallback
    } else {
        &script.name
    }
}
