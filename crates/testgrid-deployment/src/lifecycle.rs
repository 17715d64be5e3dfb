//! Per-call deploy state machine.
//!
//! ```text
//! NotStarted -> Staging -> Running -> {Success, PartialSuccess, Failed, TimedOut}
//!                  \
//!                   `-> Failed
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{DeployError, DeployResult};
use crate::model::DeploymentStatus;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DeployPhase {
    NotStarted,
    Staging,
    Running,
    Success,
    PartialSuccess,
    Failed,
    TimedOut,
}

impl DeployPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeployPhase::Success
                | DeployPhase::PartialSuccess
                | DeployPhase::Failed
                | DeployPhase::TimedOut
        )
    }

    pub fn can_transition_to(&self, next: DeployPhase) -> bool {
        use DeployPhase::*;
        matches!(
            (self, next),
            (NotStarted, Staging)
                | (Staging, Running)
                | (Staging, Failed)
                | (Running, Success)
                | (Running, PartialSuccess)
                | (Running, Failed)
                | (Running, TimedOut)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeployPhase::NotStarted => "not_started",
            DeployPhase::Staging => "staging",
            DeployPhase::Running => "running",
            DeployPhase::Success => "success",
            DeployPhase::PartialSuccess => "partial_success",
            DeployPhase::Failed => "failed",
            DeployPhase::TimedOut => "timed_out",
        }
    }
}

impl fmt::Display for DeployPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<DeploymentStatus> for DeployPhase {
    fn from(status: DeploymentStatus) -> Self {
        match status {
            DeploymentStatus::Success => DeployPhase::Success,
            DeploymentStatus::PartialSuccess => DeployPhase::PartialSuccess,
            DeploymentStatus::Failed => DeployPhase::Failed,
            DeploymentStatus::TimedOut => DeployPhase::TimedOut,
        }
    }
}

/// Tracks the phase of a single deploy call and logs each transition.
#[derive(Debug)]
pub struct DeployLifecycle {
    deployment_id: String,
    phase: DeployPhase,
    history: Vec<DeployPhase>,
}

impl DeployLifecycle {
    pub fn new(deployment_id: impl Into<String>) -> Self {
        Self {
            deployment_id: deployment_id.into(),
            phase: DeployPhase::NotStarted,
            history: vec![DeployPhase::NotStarted],
        }
    }

    pub fn phase(&self) -> DeployPhase {
        self.phase
    }

    /// Every phase visited so far, in order.
    pub fn history(&self) -> &[DeployPhase] {
        &self.history
    }

    pub fn advance(&mut self, next: DeployPhase) -> DeployResult<()> {
        if !self.phase.can_transition_to(next) {
            return Err(DeployError::InvalidTransition {
                from: self.phase,
                to: next,
            });
        }
        crate::obs::emit_phase_changed(&self.deployment_id, self.phase, next);
        self.phase = next;
        self.history.push(next);
        Ok(())
    }
}
