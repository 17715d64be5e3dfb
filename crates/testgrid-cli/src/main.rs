//! TestGrid deployment CLI
//!
//! The `testgrid-deploy` command runs one deployment against already
//! provisioned infrastructure and prints the correlated result.
//!
//! ## Commands
//!
//! - `deploy`: Stage and run a deployment script, print the result as JSON
//! - `deployers`: List registered deployer types
//! - `assets`: List embedded deployment assets and their digests

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{info, Level};

use testgrid_deployment::{
    AssetCatalog, DeployConfig, DeployerRegistry, DeployerType, DeploymentCreationResult,
    DeploymentStatus, InfrastructureProvisionResult, Script, TestPlan,
};

#[derive(Parser)]
#[command(name = "testgrid-deploy")]
#[command(author = "TestGrid Contributors")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run TestGrid deployment scripts against provisioned infrastructure", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(flatten)]
    config: ConfigArgs,

    #[command(subcommand)]
    command: Commands,
}

/// Configuration file plus per-field overrides.
#[derive(clap::Args, Debug, Default)]
struct ConfigArgs {
    /// Deployment configuration file (JSON)
    #[arg(long, global = true, env = "TESTGRID_DEPLOY_CONFIG")]
    config: Option<PathBuf>,

    /// Default script timeout in seconds
    #[arg(long, global = true, env = "TESTGRID_DEPLOY_TIMEOUT_SECS")]
    timeout_secs: Option<u64>,

    /// Per-stream output capture limit in bytes
    #[arg(long, global = true)]
    max_output_bytes: Option<usize>,

    /// Interpreter used to run deployment scripts
    #[arg(long, global = true)]
    interpreter: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Stage and run a deployment script
    Deploy {
        /// Test plan (JSON)
        #[arg(long)]
        test_plan: PathBuf,

        /// Infrastructure provisioning result (JSON)
        #[arg(long)]
        infra: PathBuf,

        /// Script descriptor (JSON)
        #[arg(long)]
        script: PathBuf,

        /// Deployer type (default: the test plan's)
        #[arg(long)]
        deployer: Option<DeployerType>,
    },

    /// List registered deployer types
    Deployers,

    /// List embedded deployment assets
    Assets,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    testgrid_deployment::init_tracing(cli.json, level);

    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Deploy {
            test_plan,
            infra,
            script,
            deployer,
        } => {
            let registry =
                DeployerRegistry::builtin(config).context("Failed to build deployer registry")?;
            let result = cmd_deploy(&registry, &test_plan, &infra, &script, deployer).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(ExitCode::from(exit_code_for(result.status)))
        }
        Commands::Deployers => {
            let registry =
                DeployerRegistry::builtin(config).context("Failed to build deployer registry")?;
            for deployer_type in registry.registered() {
                println!("{}", deployer_type);
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Assets => {
            cmd_assets(&AssetCatalog::builtin());
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Config file (if any) with flag overrides applied, validated.
fn load_config(args: &ConfigArgs) -> Result<DeployConfig> {
    let mut config = match &args.config {
        Some(path) => DeployConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => DeployConfig::default(),
    };

    if let Some(secs) = args.timeout_secs {
        config.timeout_secs = secs;
    }
    if let Some(bytes) = args.max_output_bytes {
        config.executor.max_output_bytes = bytes;
    }
    if let Some(interpreter) = &args.interpreter {
        config.executor.interpreter = interpreter.clone();
    }

    config.validate().context("Invalid deployment configuration")?;
    Ok(config)
}

async fn cmd_deploy(
    registry: &DeployerRegistry,
    plan_path: &Path,
    infra_path: &Path,
    script_path: &Path,
    deployer: Option<DeployerType>,
) -> Result<DeploymentCreationResult> {
    let plan: TestPlan = read_json_file(plan_path)?;
    let infra: InfrastructureProvisionResult = read_json_file(infra_path)?;
    let script: Script = read_json_file(script_path)?;

    let deployer_type = deployer.unwrap_or(plan.deployer_type);
    let deployer = registry
        .resolve(deployer_type)
        .with_context(|| format!("No deployer for {}", deployer_type))?;

    info!(
        test_plan = %plan.id,
        deployer = deployer.name(),
        "Deploying"
    );

    let result = deployer
        .deploy(&plan, &infra, &script)
        .await
        .with_context(|| format!("Deployment for test plan {} failed", plan.id))?;

    info!(
        deployment_id = %result.deployment_id,
        status = %result.status,
        duration_ms = result.duration_ms,
        "Deployment finished"
    );
    Ok(result)
}

fn cmd_assets(catalog: &AssetCatalog) {
    for name in catalog.names() {
        let digest = catalog.digest(name).unwrap_or_default();
        println!("{}  {}", digest, name);
    }
}

/// Process exit code for a deployment status.
fn exit_code_for(status: DeploymentStatus) -> u8 {
    match status {
        DeploymentStatus::Success => 0,
        DeploymentStatus::PartialSuccess => 2,
        DeploymentStatus::Failed | DeploymentStatus::TimedOut => 1,
    }
}

fn read_json_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {:?}", path))?;
    serde_json::from_str(&content).with_context(|| format!("Invalid JSON in {:?}", path))
}
