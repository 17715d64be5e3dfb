//! TestGrid deployment layer
//!
//! Stages deployment scripts into a test plan's repository, runs them under a
//! time bound with their whole process group, and turns their output into a
//! typed deployment result.

pub mod assets;
pub mod config;
pub mod correlator;
pub mod deployer;
pub mod env;
pub mod error;
pub mod executor;
pub mod lifecycle;
pub mod model;
pub mod obs;
pub mod registry;
pub mod stager;
pub mod telemetry;

pub use assets::{AssetCatalog, KUBERNETES_DEPLOY_SCRIPT, SHELL_DEPLOY_SCRIPT};
pub use config::{DeployConfig, ExecutorConfig, MarkerConfig, DEFAULT_MARKER_PATTERN};
pub use correlator::{CorrelationContext, MarkerProtocol, Markers, ResultCorrelator};
pub use deployer::{Deployer, KubernetesDeployer, ScriptPipeline, ScriptSource, ShellDeployer};
pub use env::DeployEnvironment;
pub use error::{
    DeployError, DeployResult, ExecutionError, ExecutionResult, StagingError, StagingResult,
};
pub use executor::{ExecutionOutcome, ShellExecutor};
pub use lifecycle::{DeployLifecycle, DeployPhase};
pub use model::{
    ClusterDetails, DeployerType, DeploymentCreationResult, DeploymentLogs, DeploymentStatus,
    InfrastructureProvisionResult, Script, ScriptType, TestPlan,
};
pub use obs::{
    emit_deploy_finished, emit_deploy_started, emit_phase_changed, emit_process_killed,
    emit_staged, DeploySpan,
};
pub use registry::DeployerRegistry;
pub use stager::{write_atomic, StagedScript, Stager};
pub use telemetry::init_tracing;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
