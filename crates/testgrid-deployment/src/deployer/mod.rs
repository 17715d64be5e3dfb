//! Deployer abstraction and the staging/execution pipeline shared by all
//! implementations.
//!
//! - [`shell`]: `ShellDeployer`, runs the script described by the caller
//! - [`kubernetes`]: `KubernetesDeployer`, runs the bundled cluster deploy script

pub mod kubernetes;
pub mod shell;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{warn, Instrument};

use crate::assets::{sha256_hex, AssetCatalog};
use crate::config::DeployConfig;
use crate::correlator::{CorrelationContext, ResultCorrelator};
use crate::env::DeployEnvironment;
use crate::error::{DeployError, DeployResult, ExecutionError, StagingError, StagingResult};
use crate::executor::ShellExecutor;
use crate::lifecycle::{DeployLifecycle, DeployPhase};
use crate::model::{
    DeployerType, DeploymentCreationResult, InfrastructureProvisionResult, Script, TestPlan,
};
use crate::obs;
use crate::stager::{write_atomic, StagedScript, Stager};

pub use kubernetes::KubernetesDeployer;
pub use shell::ShellDeployer;

/// A deployment back-end.
///
/// Implementations are stateless and shared across concurrent deploy calls.
/// Script-level failures are reported in the returned result; only staging
/// and launch failures fail the call.
#[async_trait]
pub trait Deployer: Send + Sync {
    fn name(&self) -> &str;

    fn deployer_type(&self) -> DeployerType;

    async fn deploy(
        &self,
        plan: &TestPlan,
        infra: &InfrastructureProvisionResult,
        script: &Script,
    ) -> DeployResult<DeploymentCreationResult>;
}

/// Where the script to run comes from.
#[derive(Debug, Clone)]
pub enum ScriptSource<'a> {
    /// Embedded asset, staged as `staged_name` in the deployment repository.
    Asset {
        name: &'a str,
        staged_name: &'a str,
    },
    /// Caller-supplied content, staged as `staged_name`.
    Inline {
        content: &'a [u8],
        staged_name: &'a str,
    },
    /// Script already present in the deployment repository; not copied.
    Existing(&'a Path),
}

/// Stage → run → correlate, with lifecycle tracking and log persistence.
#[derive(Debug, Clone)]
pub struct ScriptPipeline {
    config: Arc<DeployConfig>,
    stager: Stager,
    executor: ShellExecutor,
    correlator: ResultCorrelator,
}

impl ScriptPipeline {
    pub fn new(config: DeployConfig, catalog: Arc<AssetCatalog>) -> DeployResult<Self> {
        config.validate()?;
        let correlator = ResultCorrelator::from_config(&config.markers)?;
        Ok(Self {
            stager: Stager::new(catalog),
            executor: ShellExecutor::new(config.executor.clone()),
            correlator,
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &DeployConfig {
        &self.config
    }

    pub fn stager(&self) -> &Stager {
        &self.stager
    }

    /// Run one deploy call.
    ///
    /// `extra_env` is layered over the derived environment.
    pub async fn execute(
        &self,
        deployer: DeployerType,
        plan: &TestPlan,
        infra: &InfrastructureProvisionResult,
        script: &Script,
        source: ScriptSource<'_>,
        extra_env: BTreeMap<String, String>,
    ) -> DeployResult<DeploymentCreationResult> {
        let ctx = CorrelationContext::new(&plan.id, deployer);
        let span = obs::DeploySpan::span(&ctx.deployment_id.to_string(), &plan.id);
        self.execute_in_span(ctx, plan, infra, script, source, extra_env)
            .instrument(span)
            .await
    }

    async fn execute_in_span(
        &self,
        mut ctx: CorrelationContext,
        plan: &TestPlan,
        infra: &InfrastructureProvisionResult,
        script: &Script,
        source: ScriptSource<'_>,
        extra_env: BTreeMap<String, String>,
    ) -> DeployResult<DeploymentCreationResult> {
        let deployment_id = ctx.deployment_id.to_string();
        obs::emit_deploy_started(&deployment_id, &plan.id, ctx.deployer);

        let repository = plan.repository();
        let output_dir = repository
            .join(&self.config.output_dir_name)
            .join(&deployment_id);

        let mut lifecycle = DeployLifecycle::new(&deployment_id);
        lifecycle.advance(DeployPhase::Staging)?;

        if let Err(e) = self.config.validate_script(script) {
            warn!(error = %e, "Rejected script descriptor; nothing staged");
            lifecycle.advance(DeployPhase::Failed)?;
            return Err(e);
        }

        let staged = match self.stage(repository, &source, &output_dir) {
            Ok(staged) => staged,
            Err(e) => {
                warn!(error = %e, "Staging failed; deployment script not started");
                lifecycle.advance(DeployPhase::Failed)?;
                return Err(e);
            }
        };
        ctx.script_digest = staged.digest.clone();

        let mut env =
            DeployEnvironment::derive(plan, infra, script, ctx.deployer, &output_dir);
        for (key, value) in extra_env {
            env.set(key, value);
        }

        lifecycle.advance(DeployPhase::Running)?;
        let timeout = self.config.timeout_for(script);
        let log_file = output_dir.join(&self.config.log_file_name);

        let result = match self
            .executor
            .run(&staged.path, repository, &env, timeout)
            .await
        {
            Ok(outcome) => {
                ctx.log_file = persist_log(&log_file, &outcome.stdout, &outcome.stderr);
                let outputs = self.read_outputs_file(&output_dir);
                self.correlator.correlate(&ctx, &outcome, outputs.as_deref())
            }
            Err(ExecutionError::Timeout {
                limit_ms,
                elapsed_ms,
                stdout,
                stderr,
                stdout_truncated,
                stderr_truncated,
            }) => {
                warn!(
                    limit_ms = limit_ms,
                    elapsed_ms = elapsed_ms,
                    "Deployment script timed out; process group killed"
                );
                ctx.log_file = persist_log(&log_file, &stdout, &stderr);
                let truncated = stdout_truncated || stderr_truncated;
                self.correlator
                    .timed_out(&ctx, limit_ms, stdout, stderr, truncated)
            }
            Err(e) => {
                warn!(error = %e, "Deployment script could not be run");
                lifecycle.advance(DeployPhase::Failed)?;
                return Err(e.into());
            }
        };

        lifecycle.advance(result.status.into())?;
        obs::emit_deploy_finished(
            &deployment_id,
            result.status,
            result.exit_code,
            result.duration_ms,
        );
        Ok(result)
    }

    /// Materialize the script and create the per-call output directory.
    /// A missing asset is detected before anything is written.
    fn stage(
        &self,
        repository: &Path,
        source: &ScriptSource<'_>,
        output_dir: &Path,
    ) -> DeployResult<StagedScript> {
        let staged = match source {
            ScriptSource::Asset { name, staged_name } => {
                let target = staging_target(repository, staged_name)?;
                self.stager.stage(name, &target)?
            }
            ScriptSource::Inline {
                content,
                staged_name,
            } => {
                let target = staging_target(repository, staged_name)?;
                self.stager.stage_bytes(content, &target)?
            }
            ScriptSource::Existing(path) => {
                existing_script(&repository_script(repository, path)?)?
            }
        };

        fs::create_dir_all(output_dir).map_err(|source| StagingError::Io {
            path: output_dir.to_path_buf(),
            source,
        })?;
        Ok(staged)
    }

    fn read_outputs_file(&self, output_dir: &Path) -> Option<String> {
        let path = output_dir.join(&self.config.outputs_file_name);
        match fs::read_to_string(&path) {
            Ok(content) => Some(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring unreadable outputs file");
                None
            }
        }
    }
}

/// `<repository>/<staged_name>`, rejecting names that are not a plain file name.
fn staging_target(repository: &Path, staged_name: &str) -> DeployResult<PathBuf> {
    let name = Path::new(staged_name);
    let plain = name.components().count() == 1
        && name.file_name().map(|n| n == name.as_os_str()).unwrap_or(false);
    if !plain {
        return Err(DeployError::InvalidScript(format!(
            "script name must be a plain file name: {staged_name:?}"
        )));
    }
    Ok(repository.join(name))
}

/// Resolve a repository-relative script path, refusing anything that lands
/// outside the repository (absolute paths, `..`, or symlinks pointing out).
fn repository_script(repository: &Path, relative: &Path) -> DeployResult<PathBuf> {
    let plain = !relative.as_os_str().is_empty()
        && relative
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if !plain {
        return Err(DeployError::InvalidScript(format!(
            "script file must be relative to the deployment repository: {}",
            relative.display()
        )));
    }

    let root = canonical(repository)?;
    let resolved = canonical(&repository.join(relative))?;
    if !resolved.starts_with(&root) {
        return Err(DeployError::InvalidScript(format!(
            "script file resolves outside the deployment repository: {}",
            relative.display()
        )));
    }
    Ok(resolved)
}

fn canonical(path: &Path) -> StagingResult<PathBuf> {
    fs::canonicalize(path).map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            StagingError::ScriptNotFound {
                path: path.to_path_buf(),
            }
        } else {
            StagingError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    })
}

fn existing_script(path: &Path) -> StagingResult<StagedScript> {
    let bytes = fs::read(path).map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            StagingError::ScriptNotFound {
                path: path.to_path_buf(),
            }
        } else {
            StagingError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    })?;
    Ok(StagedScript {
        path: path.to_path_buf(),
        size: bytes.len() as u64,
        digest: sha256_hex(&bytes),
    })
}

/// Write the combined log; returns its path, or `None` if it could not be written.
fn persist_log(path: &Path, stdout: &str, stderr: &str) -> Option<PathBuf> {
    let content = format!("==> stdout <==\n{stdout}\n==> stderr <==\n{stderr}");
    match write_atomic(path, content.as_bytes()) {
        Ok(()) => Some(path.to_path_buf()),
        Err(e) => {
            warn!(error = %e, "Failed to persist deployment log");
            None
        }
    }
}
