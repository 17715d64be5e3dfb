//! Deploys onto a Kubernetes cluster with the bundled `kubernetes_deploy.sh`.
//!
//! The script applies the manifests under the deployment repository and
//! reports service endpoints through output markers. Cluster coordinates
//! come from the provisioned infrastructure:
//!
//! | variable                | source                                          |
//! |-------------------------|-------------------------------------------------|
//! | `KUBE_CLUSTER_ENDPOINT` | `ClusterDetails::endpoint`                      |
//! | `KUBE_NAMESPACE`        | `ClusterDetails::namespace`, else derived       |
//! | `KUBECONFIG`            | `ClusterDetails::kubeconfig`                    |

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{Deployer, ScriptPipeline, ScriptSource};
use crate::assets::{AssetCatalog, KUBERNETES_DEPLOY_SCRIPT};
use crate::config::DeployConfig;
use crate::error::DeployResult;
use crate::model::{
    DeployerType, DeploymentCreationResult, InfrastructureProvisionResult, Script, TestPlan,
};

pub const KUBE_CLUSTER_ENDPOINT: &str = "KUBE_CLUSTER_ENDPOINT";
pub const KUBE_NAMESPACE: &str = "KUBE_NAMESPACE";
pub const KUBECONFIG: &str = "KUBECONFIG";

/// DNS-1123 label limit.
const MAX_NAMESPACE_LEN: usize = 63;
const NAMESPACE_PREFIX: &str = "testgrid-";

/// Deployer for [`DeployerType::Kubernetes`].
#[derive(Debug, Clone)]
pub struct KubernetesDeployer {
    pipeline: ScriptPipeline,
}

impl KubernetesDeployer {
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
impl Deployer for KubernetesDeployer {
    fn name(&self) -> &str {
        DeployerType::Kubernetes.as_str()
    }

    fn deployer_type(&self) -> DeployerType {
        DeployerType::Kubernetes
    }

    async fn deploy(
        &self,
        plan: &TestPlan,
        infra: &InfrastructureProvisionResult,
        script: &Script,
    ) -> DeployResult<DeploymentCreationResult> {
        if script.asset.is_some() || script.inline_content.is_some() || script.file.is_some() {
            debug!(
                script = %script.name,
                "Ignoring script source; running bundled {}", KUBERNETES_DEPLOY_SCRIPT
            );
        }

        self.pipeline
            .execute(
                DeployerType::Kubernetes,
                plan,
                infra,
                script,
                ScriptSource::Asset {
                    name: KUBERNETES_DEPLOY_SCRIPT,
                    staged_name: KUBERNETES_DEPLOY_SCRIPT,
                },
                cluster_env(plan, infra),
            )
            .await
    }
}

fn cluster_env(plan: &TestPlan, infra: &InfrastructureProvisionResult) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    let cluster = infra.cluster.as_ref();

    if let Some(endpoint) = cluster.map(|c| c.endpoint.trim()).filter(|e| !e.is_empty()) {
        env.insert(KUBE_CLUSTER_ENDPOINT.to_string(), endpoint.to_string());
    }
    if let Some(kubeconfig) = cluster.and_then(|c| c.kubeconfig.as_ref()) {
        env.insert(KUBECONFIG.to_string(), kubeconfig.to_string_lossy().into_owned());
    }

    let namespace = cluster
        .and_then(|c| c.namespace.as_deref())
        .map(str::trim)
        .filter(|ns| !ns.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| namespace_for(&plan.id));
    env.insert(KUBE_NAMESPACE.to_string(), namespace);
    env
}

/// Namespace derived from a test plan id: `testgrid-<id>` reduced to a valid
/// DNS-1123 label.
pub fn namespace_for(test_plan_id: &str) -> String {
    let mut label = String::with_capacity(NAMESPACE_PREFIX.len() + test_plan_id.len());
    label.push_str(NAMESPACE_PREFIX);
    for c in test_plan_id.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_alphanumeric() {
            label.push(c);
        } else if !label.ends_with('-') {
            label.push('-');
        }
    }
    label.truncate(MAX_NAMESPACE_LEN);
    label.trim_end_matches('-').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ClusterDetails;

    #[test]
    fn test_namespace_for_sanitizes_plan_id() {
        assert_eq!(namespace_for("TP_42"), "testgrid-tp-42");
        assert_eq!(namespace_for("a..b"), "testgrid-a-b");
        assert_eq!(namespace_for("plan-"), "testgrid-plan");
        assert_eq!(namespace_for(""), "testgrid");
    }

    #[test]
    fn test_namespace_for_respects_label_limit() {
        let ns = namespace_for(&"x".repeat(200));
        assert_eq!(ns.len(), MAX_NAMESPACE_LEN);
        assert!(ns.starts_with(NAMESPACE_PREFIX));
    }

    #[test]
    fn test_cluster_env_from_details() {
        let plan = TestPlan::new("tp-1", "/repo", DeployerType::Kubernetes);
        let infra = InfrastructureProvisionResult::new("gke").with_cluster(ClusterDetails {
            endpoint: "https://10.0.0.1:6443".into(),
            namespace: Some("apps".into()),
            kubeconfig: Some("/etc/kube/config".into()),
        });
        let env = cluster_env(&plan, &infra);
        assert_eq!(env[KUBE_CLUSTER_ENDPOINT], "https://10.0.0.1:6443");
        assert_eq!(env[KUBE_NAMESPACE], "apps");
        assert_eq!(env[KUBECONFIG], "/etc/kube/config");
    }

    #[test]
    fn test_cluster_env_without_details_derives_namespace() {
        let plan = TestPlan::new("Plan.7", "/repo", DeployerType::Kubernetes);
        let env = cluster_env(&plan, &InfrastructureProvisionResult::new("none"));
        assert_eq!(env.get(KUBE_NAMESPACE).map(String::as_str), Some("testgrid-plan-7"));
        assert!(!env.contains_key(KUBE_CLUSTER_ENDPOINT));
        assert!(!env.contains_key(KUBECONFIG));
    }

    #[tokio::test]
    async fn test_missing_bundled_script_fails_before_running() {
        let dir = tempfile::tempdir().unwrap();
        let deployer = KubernetesDeployer::with_catalog(
            DeployConfig::default(),
            Arc::new(AssetCatalog::empty()),
        )
        .unwrap();
        let plan = TestPlan::new("tp-1", dir.path(), DeployerType::Kubernetes);

        let err = deployer
            .deploy(
                &plan,
                &InfrastructureProvisionResult::new("none"),
                &Script::default(),
            )
            .await
            .unwrap_err();

        assert!(err.is_asset_not_found());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
