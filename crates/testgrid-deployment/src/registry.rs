//! Deployer registry: maps a [`DeployerType`] to the deployer that handles it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::assets::AssetCatalog;
use crate::config::DeployConfig;
use crate::deployer::{Deployer, KubernetesDeployer, ScriptPipeline, ShellDeployer};
use crate::error::{DeployError, DeployResult};
use crate::model::{DeployerType, Script, TestPlan};

/// Read-only after construction; share it behind an `Arc` or clone it.
#[derive(Clone, Default)]
pub struct DeployerRegistry {
    deployers: HashMap<DeployerType, Arc<dyn Deployer>>,
}

impl DeployerRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry with the shell and Kubernetes deployers over the embedded assets.
    pub fn builtin(config: DeployConfig) -> DeployResult<Self> {
        Self::with_catalog(config, Arc::new(AssetCatalog::builtin()))
    }

    pub fn with_catalog(config: DeployConfig, catalog: Arc<AssetCatalog>) -> DeployResult<Self> {
        let pipeline = ScriptPipeline::new(config, catalog)?;
        Ok(Self::empty()
            .register(Arc::new(ShellDeployer::new(pipeline.clone())))
            .register(Arc::new(KubernetesDeployer::new(pipeline))))
    }

    /// Add `deployer` under its own type, replacing any earlier registration.
    pub fn register(mut self, deployer: Arc<dyn Deployer>) -> Self {
        let deployer_type = deployer.deployer_type();
        if self.deployers.insert(deployer_type, deployer).is_some() {
            debug!(deployer = %deployer_type, "Replaced registered deployer");
        }
        self
    }

    pub fn resolve(&self, deployer_type: DeployerType) -> DeployResult<Arc<dyn Deployer>> {
        self.deployers
            .get(&deployer_type)
            .cloned()
            .ok_or(DeployError::UnknownDeployer(deployer_type))
    }

    /// Deployer for the plan's configured type.
    pub fn resolve_for_plan(&self, plan: &TestPlan) -> DeployResult<Arc<dyn Deployer>> {
        self.resolve(plan.deployer_type)
    }

    /// Deployer implied by the script's type.
    pub fn resolve_for_script(&self, script: &Script) -> DeployResult<Arc<dyn Deployer>> {
        self.resolve(script.script_type.deployer_type())
    }

    pub fn contains(&self, deployer_type: DeployerType) -> bool {
        self.deployers.contains_key(&deployer_type)
    }

    /// Registered types, in declaration order.
    pub fn registered(&self) -> Vec<DeployerType> {
        DeployerType::ALL
            .iter()
            .copied()
            .filter(|t| self.deployers.contains_key(t))
            .collect()
    }
}

impl fmt::Debug for DeployerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeployerRegistry")
            .field("deployers", &self.registered())
            .finish()
    }
}
