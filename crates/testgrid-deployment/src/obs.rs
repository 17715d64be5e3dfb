//! Structured observability hooks for the deploy lifecycle.
//!
//! This module provides:
//! - A deploy-scoped tracing span via the `DeploySpan` RAII guard
//! - Emission functions for key lifecycle events: start, phase change,
//!   staging, process kill, finish
//!
//! Events are emitted at `info!` level; filter with `RUST_LOG`.

use std::path::Path;

use tracing::{info, warn};

use crate::lifecycle::DeployPhase;
use crate::model::{DeployerType, DeploymentStatus};

/// RAII guard that enters a deploy-scoped tracing span.
///
/// Holding the guard across an `.await` is not supported; use
/// [`DeploySpan::span`] with `tracing::Instrument` for async code.
pub struct DeploySpan {
    _span: tracing::span::EnteredSpan,
}

impl DeploySpan {
    /// Create and enter a span tagged with the deployment and test plan ids.
    pub fn enter(deployment_id: &str, test_plan_id: &str) -> Self {
        Self {
            _span: Self::span(deployment_id, test_plan_id).entered(),
        }
    }

    pub fn span(deployment_id: &str, test_plan_id: &str) -> tracing::Span {
        tracing::info_span!(
            "testgrid.deploy",
            deployment_id = %deployment_id,
            test_plan = %test_plan_id,
        )
    }
}

pub fn emit_deploy_started(deployment_id: &str, test_plan_id: &str, deployer: DeployerType) {
    info!(
        event = "deploy.started",
        deployment_id = %deployment_id,
        test_plan = %test_plan_id,
        deployer = %deployer,
    );
}

pub fn emit_phase_changed(deployment_id: &str, from: DeployPhase, to: DeployPhase) {
    info!(
        event = "deploy.phase_changed",
        deployment_id = %deployment_id,
        from = %from,
        to = %to,
    );
}

pub fn emit_staged(path: &Path, size: u64, digest: &str) {
    info!(
        event = "deploy.staged",
        path = %path.display(),
        size = size,
        digest = %digest,
    );
}

/// Emit event: a process group was force-killed.
pub fn emit_process_killed(pgid: i32, reason: &str) {
    warn!(event = "deploy.process_killed", pgid = pgid, reason = %reason);
}

pub fn emit_deploy_finished(
    deployment_id: &str,
    status: DeploymentStatus,
    exit_code: Option<i32>,
    duration_ms: u64,
) {
    info!(
        event = "deploy.finished",
        deployment_id = %deployment_id,
        status = %status,
        exit_code = ?exit_code,
        duration_ms = duration_ms,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deploy_span_create() {
        let _span = DeploySpan::enter("deployment-1", "tp-1");
        emit_phase_changed("deployment-1", DeployPhase::NotStarted, DeployPhase::Staging);
    }
}
