//! Queued run data model.
//!
//! A `QueuedRun` moves through `queued → running → succeeded | failed |
//! canceled`. A failed attempt with retry budget left goes `running →
//! queued` with `next_attempt_at` pushed out by the backoff.

use crate::autoqueue::{approval_required, canary_selection};
use crate::catalog::{confirm_phrase, RemediationAction};
use crate::error::{Result, WardenError};
use crate::policy::{PolicyProfile, ResolvedPolicy};
use crate::runner::RunReport;
use crate::types::{ActionMode, AutoTier, Priority, Risk};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// RunState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl RunState {
    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Queued => "queued",
            RunState::Running => "running",
            RunState::Succeeded => "succeeded",
            RunState::Failed => "failed",
            RunState::Canceled => "canceled",
        }
    }

    pub fn is_active(self) -> bool {
        matches!(self, RunState::Queued | RunState::Running)
    }

    pub fn can_transition_to(self, to: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, to),
            (Queued, Running)
                | (Queued, Canceled)
                | (Running, Queued)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Canceled)
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunState {
    type Err = WardenError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "queued" => Ok(RunState::Queued),
            "running" => Ok(RunState::Running),
            "succeeded" => Ok(RunState::Succeeded),
            "failed" => Ok(RunState::Failed),
            "canceled" | "cancelled" => Ok(RunState::Canceled),
            _ => Err(WardenError::InvalidValue(format!(
                "unknown run state '{s}': must be queued, running, succeeded, failed, or canceled"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Runtime metadata
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    #[default]
    None,
    Pending,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApprovalMeta {
    pub required: bool,
    pub status: ApprovalStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CanaryMeta {
    pub enabled: bool,
    pub rollout_percent: u32,
    pub bucket: u32,
    pub selected: bool,
    #[serde(default)]
    pub checks: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RollbackMeta {
    pub enabled: bool,
    pub attempted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub succeeded: Option<bool>,
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueRuntimeMeta {
    pub attempts: u32,
    pub max_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default)]
    pub dlq: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dlq_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replay_of_run_id: Option<Uuid>,
    #[serde(default)]
    pub approval: ApprovalMeta,
    #[serde(default)]
    pub canary: CanaryMeta,
    #[serde(default)]
    pub rollback: RollbackMeta,
    #[serde(default)]
    pub auto_queued: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_tier: Option<AutoTier>,
}

impl QueueRuntimeMeta {
    /// Fresh metadata for a run of `action` on `host_id` under `policy`.
    /// Approval, canary and rollback only apply to execute mode.
    pub fn fresh(
        host_id: &str,
        action: &RemediationAction,
        mode: ActionMode,
        policy: &ResolvedPolicy,
    ) -> Self {
        let p = &policy.remediation;
        let execute = mode == ActionMode::Execute;

        let approval_needed = execute && approval_required(action, p);
        let approval = ApprovalMeta {
            required: approval_needed,
            status: if approval_needed {
                ApprovalStatus::Pending
            } else {
                ApprovalStatus::None
            },
            ..Default::default()
        };

        let selection = canary_selection(host_id, &action.id, action.auto_tier, p);
        let canary = CanaryMeta {
            enabled: execute && selection.selected && !action.canary_checks.is_empty(),
            rollout_percent: selection.rollout_percent,
            bucket: selection.bucket,
            selected: selection.selected,
            checks: action.canary_checks.clone(),
            passed: None,
            error: None,
        };

        let rollback = RollbackMeta {
            enabled: execute && p.auto_rollback && !action.rollback_commands.is_empty(),
            commands: action.rollback_commands.clone(),
            ..Default::default()
        };

        Self {
            attempts: 0,
            max_attempts: p.retry_max_attempts,
            approval,
            canary,
            rollback,
            ..Default::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Payload / output
// ---------------------------------------------------------------------------

/// The action as it was rendered when the run was queued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSnapshot {
    pub title: String,
    pub priority: Priority,
    pub risk: Risk,
    pub tier: AutoTier,
    pub commands: Vec<String>,
    #[serde(default)]
    pub rollback_commands: Vec<String>,
    #[serde(default)]
    pub canary_checks: Vec<String>,
}

impl From<&RemediationAction> for ActionSnapshot {
    fn from(a: &RemediationAction) -> Self {
        Self {
            title: a.title.clone(),
            priority: a.priority,
            risk: a.risk,
            tier: a.auto_tier,
            commands: a.commands.clone(),
            rollback_commands: a.rollback_commands.clone(),
            canary_checks: a.canary_checks.clone(),
        }
    }
}

impl ActionSnapshot {
    /// Rebuild the action exactly as it was queued, for replays.
    pub fn to_action(&self, action_id: &str) -> RemediationAction {
        RemediationAction {
            id: action_id.to_string(),
            priority: self.priority,
            risk: self.risk,
            title: self.title.clone(),
            why: String::new(),
            source_codes: Vec::new(),
            commands: self.commands.clone(),
            rollback_notes: None,
            rollback_commands: self.rollback_commands.clone(),
            canary_checks: self.canary_checks.clone(),
            auto_tier: self.tier,
            requires_confirm: true,
            confirm_phrase: confirm_phrase(action_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteRunPayload {
    pub mode: ActionMode,
    pub action: ActionSnapshot,
    pub profile: PolicyProfile,
    pub runtime: QueueRuntimeMeta,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunOutput {
    pub execution: RunReport,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canary: Option<RunReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback: Option<RunReport>,
}

// ---------------------------------------------------------------------------
// QueuedRun
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedRun {
    pub id: Uuid,
    pub host_id: String,
    pub action_id: String,
    pub requested_by: String,
    pub state: RunState,
    pub requested_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub params: ExecuteRunPayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<RunOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl QueuedRun {
    pub fn new(
        host_id: &str,
        action: &RemediationAction,
        mode: ActionMode,
        requested_by: &str,
        policy: &ResolvedPolicy,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            host_id: host_id.to_string(),
            action_id: action.id.clone(),
            requested_by: requested_by.to_string(),
            state: RunState::Queued,
            requested_at: now,
            started_at: None,
            finished_at: None,
            params: ExecuteRunPayload {
                mode,
                action: ActionSnapshot::from(action),
                profile: policy.profile,
                runtime: QueueRuntimeMeta::fresh(host_id, action, mode, policy),
            },
            output: None,
            error: None,
        }
    }

    pub fn mode(&self) -> ActionMode {
        self.params.mode
    }

    pub fn runtime(&self) -> &QueueRuntimeMeta {
        &self.params.runtime
    }

    pub fn runtime_mut(&mut self) -> &mut QueueRuntimeMeta {
        &mut self.params.runtime
    }

    /// Eligible for a drain pass at `now`.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        let rt = self.runtime();
        self.state == RunState::Queued
            && !rt.dlq
            && (!rt.approval.required || rt.approval.status == ApprovalStatus::Approved)
            && rt.next_attempt_at.map_or(true, |at| at <= now)
    }

    pub fn transition(&mut self, to: RunState) -> Result<()> {
        if !self.state.can_transition_to(to) {
            return Err(WardenError::InvalidTransition {
                from: self.state.to_string(),
                to: to.to_string(),
                reason: format!("run {} cannot move from {} to {}", self.id, self.state, to),
            });
        }
        self.state = to;
        Ok(())
    }

    /// Route to failed + DLQ.
    pub fn dead_letter(&mut self, reason: &str, error: String, now: DateTime<Utc>) -> Result<()> {
        self.transition(RunState::Failed)?;
        self.finished_at = Some(now);
        self.error = Some(error.clone());
        let rt = self.runtime_mut();
        rt.dlq = true;
        rt.dlq_reason = Some(reason.to_string());
        rt.last_error = Some(error);
        rt.next_attempt_at = None;
        Ok(())
    }

    pub fn cancel(&mut self, reason: &str, now: DateTime<Utc>) -> Result<()> {
        self.transition(RunState::Canceled)?;
        self.finished_at = Some(now);
        self.error = Some(reason.to_string());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{build_actions, RemediationContext};
    use crate::config::WardenConfig;
    use crate::host::HostConfig;
    use crate::policy::resolve;
    use crate::signals::IncidentSignal;
    use crate::types::{Severity, SignalCode, SignalSource};
    use chrono::Duration;

    fn action(code: SignalCode) -> RemediationAction {
        let signal = IncidentSignal {
            code,
            severity: Severity::High,
            title: "t".into(),
            detail: None,
            timestamp: Utc::now(),
            snapshot_id: None,
            source: SignalSource::Alert,
        };
        build_actions(&[signal], &RemediationContext::default()).remove(0)
    }

    fn policy() -> ResolvedPolicy {
        resolve(&WardenConfig::default(), &HostConfig::default())
    }

    #[test]
    fn risky_execute_needs_approval_dry_run_does_not() {
        let lockdown = action(SignalCode::ConfigTamper);
        let now = Utc::now();
        let exec = QueuedRun::new("h1", &lockdown, ActionMode::Execute, "alice", &policy(), now);
        assert!(exec.runtime().approval.required);
        assert_eq!(exec.runtime().approval.status, ApprovalStatus::Pending);
        assert!(!exec.is_ready(now));
        assert!(exec.runtime().rollback.enabled);

        let dry = QueuedRun::new("h1", &lockdown, ActionMode::DryRun, "alice", &policy(), now);
        assert!(!dry.runtime().approval.required);
        assert!(!dry.runtime().canary.enabled);
        assert!(!dry.runtime().rollback.enabled);
        assert!(dry.is_ready(now));
    }

    #[test]
    fn readiness_respects_backoff_and_dlq() {
        let verify = action(SignalCode::PackageDrift);
        let now = Utc::now();
        let mut run = QueuedRun::new("h1", &verify, ActionMode::Execute, "alice", &policy(), now);
        assert!(run.is_ready(now));
        run.runtime_mut().next_attempt_at = Some(now + Duration::seconds(30));
        assert!(!run.is_ready(now));
        assert!(run.is_ready(now + Duration::seconds(30)));
        run.runtime_mut().dlq = true;
        assert!(!run.is_ready(now + Duration::hours(1)));
    }

    #[test]
    fn transitions_are_checked() {
        let verify = action(SignalCode::PackageDrift);
        let now = Utc::now();
        let mut run = QueuedRun::new("h1", &verify, ActionMode::DryRun, "alice", &policy(), now);
        assert!(run.transition(RunState::Succeeded).is_err());
        run.transition(RunState::Running).unwrap();
        run.transition(RunState::Queued).unwrap();
        run.transition(RunState::Running).unwrap();
        run.dead_letter("canary_failed", "canary check failed".into(), now)
            .unwrap();
        assert_eq!(run.state, RunState::Failed);
        assert!(run.runtime().dlq);
        assert!(run.cancel("late", now).is_err());
    }
}
