//! Autonomous queuing.
//!
//! Each action in a host's plan is tried against an ordered gate chain and
//! skipped with the reason of the first gate it fails. Survivors are queued
//! as execute-mode runs owned by the autonomous actor.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::fmt;
use tracing::{debug, info};
use uuid::Uuid;

use crate::audit::{AuditEntry, AuditEvent};
use crate::catalog::{RemediationAction, RemediationPlan};
use crate::error::Result;
use crate::fleet::{is_rollout_paused, FleetPolicy};
use crate::guard::validate_action_lists;
use crate::host::Host;
use crate::policy::{RemediationPolicy, ResolvedPolicy};
use crate::queue::{QueuedRun, RunFilter, RunState, Store};
use crate::types::{ActionMode, AutoTier, AUTONOMOUS_ACTOR};

// ---------------------------------------------------------------------------
// Canary selection and approval
// ---------------------------------------------------------------------------

/// Stable bucket in `0..100` for a host/action pair.
pub fn canary_bucket(host_id: &str, action_id: &str) -> u32 {
    let digest = Sha256::digest(format!("{host_id}::{action_id}").as_bytes());
    let head = [digest[0], digest[1], digest[2], digest[3]];
    u32::from_be_bytes(head) % 100
}

/// Rollout percentage for a tier: safe actions always run their canary,
/// observe-only actions never do.
pub fn rollout_percent(tier: AutoTier, policy: &RemediationPolicy) -> u32 {
    match tier {
        AutoTier::SafeAuto => 100,
        AutoTier::Observe => 0,
        AutoTier::GuardedAuto | AutoTier::RiskyManual => policy.canary_rollout_percent,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanarySelection {
    pub bucket: u32,
    pub rollout_percent: u32,
    pub selected: bool,
}

pub fn canary_selection(
    host_id: &str,
    action_id: &str,
    tier: AutoTier,
    policy: &RemediationPolicy,
) -> CanarySelection {
    let bucket = canary_bucket(host_id, action_id);
    let rollout_percent = rollout_percent(tier, policy);
    CanarySelection {
        bucket,
        rollout_percent,
        selected: bucket < rollout_percent,
    }
}

pub fn approval_required(action: &RemediationAction, policy: &RemediationPolicy) -> bool {
    action.auto_tier == AutoTier::RiskyManual || action.risk >= policy.approval_risk_threshold
}

// ---------------------------------------------------------------------------
// Queue load
// ---------------------------------------------------------------------------

/// Queue state around one host, loaded once per evaluation. Both manual
/// and autonomous queuing check their caps against it.
#[derive(Debug, Clone, Default)]
pub struct QueueLoad {
    /// Queued or running runs on the host.
    pub host_active: Vec<QueuedRun>,
    /// Queued or running runs across the fleet.
    pub global_active: usize,
    /// Non-canceled runs on the host requested inside the lookback.
    pub host_recent: Vec<QueuedRun>,
}

impl QueueLoad {
    pub fn load(
        store: &dyn Store,
        host_id: &str,
        policy: &RemediationPolicy,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let host_active = store.list_runs(&RunFilter {
            host_id: Some(host_id.to_string()),
            ..RunFilter::active()
        })?;
        let global_active = store.count_runs(&RunFilter::active())?;

        let lookback = i64::from(policy.execute_cooldown_minutes).max(60);
        let host_recent = store
            .list_runs(&RunFilter {
                requested_since: Some(now - Duration::minutes(lookback)),
                ..RunFilter::for_host(host_id)
            })?
            .into_iter()
            .filter(|r| r.state != RunState::Canceled)
            .collect();

        Ok(Self {
            host_active,
            global_active,
            host_recent,
        })
    }

    /// Account for a run queued during this evaluation.
    pub fn record(&mut self, run: &QueuedRun) {
        self.host_active.push(run.clone());
        self.host_recent.push(run.clone());
        self.global_active += 1;
    }

    pub fn active_for(&self, action_id: &str) -> Option<&QueuedRun> {
        self.host_active.iter().find(|r| r.action_id == action_id)
    }

    fn last_hour(&self, now: DateTime<Utc>) -> impl Iterator<Item = &QueuedRun> {
        let since = now - Duration::hours(1);
        self.host_recent.iter().filter(move |r| r.requested_at >= since)
    }

    pub fn executes_last_hour(&self, now: DateTime<Utc>) -> usize {
        self.last_hour(now)
            .filter(|r| r.mode() == ActionMode::Execute)
            .count()
    }

    pub fn auto_queued_last_hour(&self, now: DateTime<Utc>) -> usize {
        self.last_hour(now).filter(|r| r.runtime().auto_queued).count()
    }

    /// Time left before `action_id` may be executed again.
    pub fn cooldown_remaining(
        &self,
        action_id: &str,
        cooldown_minutes: u32,
        now: DateTime<Utc>,
    ) -> Option<Duration> {
        let last = self
            .host_recent
            .iter()
            .filter(|r| r.action_id == action_id && r.mode() == ActionMode::Execute)
            .map(|r| r.requested_at)
            .max()?;
        let remaining = last + Duration::minutes(i64::from(cooldown_minutes)) - now;
        (remaining > Duration::zero()).then_some(remaining)
    }
}

// ---------------------------------------------------------------------------
// Gate chain
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    CycleCap,
    ObserveTier,
    TierAboveMax,
    HourlyAutoCap,
    HourlyExecuteCap,
    HostBacklog,
    GlobalBacklog,
    AlreadyActive,
    Cooldown,
    GuardRejected,
    CanaryChecksMissing,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            SkipReason::CycleCap => "cycle_cap",
            SkipReason::ObserveTier => "observe_tier",
            SkipReason::TierAboveMax => "tier_above_max",
            SkipReason::HourlyAutoCap => "hourly_auto_cap",
            SkipReason::HourlyExecuteCap => "hourly_execute_cap",
            SkipReason::HostBacklog => "host_backlog",
            SkipReason::GlobalBacklog => "global_backlog",
            SkipReason::AlreadyActive => "already_active",
            SkipReason::Cooldown => "cooldown",
            SkipReason::GuardRejected => "guard_rejected",
            SkipReason::CanaryChecksMissing => "canary_checks_missing",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// First gate `action` fails, if any.
pub fn check_gates(
    action: &RemediationAction,
    policy: &ResolvedPolicy,
    load: &QueueLoad,
    queued_this_cycle: usize,
    now: DateTime<Utc>,
) -> Option<SkipReason> {
    let p = &policy.remediation;
    let cap = |limit: u32| limit as usize;

    if queued_this_cycle >= cap(p.autonomous_max_per_cycle) {
        return Some(SkipReason::CycleCap);
    }
    if action.auto_tier == AutoTier::Observe {
        return Some(SkipReason::ObserveTier);
    }
    if action.auto_tier > p.autonomous_max_tier {
        return Some(SkipReason::TierAboveMax);
    }
    if load.auto_queued_last_hour(now) >= cap(p.autonomous_max_per_hour) {
        return Some(SkipReason::HourlyAutoCap);
    }
    if load.executes_last_hour(now) >= cap(p.max_executes_per_hour) {
        return Some(SkipReason::HourlyExecuteCap);
    }
    if load.host_active.len() >= cap(p.max_queued_per_host) {
        return Some(SkipReason::HostBacklog);
    }
    if load.global_active >= cap(p.max_queued_global) {
        return Some(SkipReason::GlobalBacklog);
    }
    if load.active_for(&action.id).is_some() {
        return Some(SkipReason::AlreadyActive);
    }
    if load
        .cooldown_remaining(&action.id, p.execute_cooldown_minutes, now)
        .is_some()
    {
        return Some(SkipReason::Cooldown);
    }
    let issues = validate_action_lists(
        &action.commands,
        &action.canary_checks,
        &action.rollback_commands,
        &policy.guard,
    );
    if !issues.is_empty() {
        return Some(SkipReason::GuardRejected);
    }
    if p.require_canary_checks && action.canary_checks.is_empty() {
        return Some(SkipReason::CanaryChecksMissing);
    }
    None
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoQueueStatus {
    Evaluated,
    AutonomousDisabled,
    HostDisabled,
    RolloutPaused,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoQueuedRun {
    pub run_id: Uuid,
    pub action_id: String,
    pub tier: AutoTier,
    pub approval_required: bool,
    pub canary_selected: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedAction {
    pub action_id: String,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoQueueOutcome {
    pub host_id: String,
    pub status: AutoQueueStatus,
    pub queued: Vec<AutoQueuedRun>,
    pub skipped: Vec<SkippedAction>,
    /// Something was queued and the policy wants the queue drained.
    pub drain_requested: bool,
}

impl AutoQueueOutcome {
    fn idle(host_id: &str, status: AutoQueueStatus) -> Self {
        Self {
            host_id: host_id.to_string(),
            status,
            queued: Vec::new(),
            skipped: Vec::new(),
            drain_requested: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Queuing
// ---------------------------------------------------------------------------

/// Run the gate chain over `plan` and queue every surviving action.
pub fn auto_queue(
    store: &dyn Store,
    fleet: &FleetPolicy,
    host: &Host,
    plan: &RemediationPlan,
    policy: &ResolvedPolicy,
    now: DateTime<Utc>,
) -> Result<AutoQueueOutcome> {
    if !host.enabled {
        return Ok(AutoQueueOutcome::idle(&host.id, AutoQueueStatus::HostDisabled));
    }
    if !policy.remediation.autonomous_enabled {
        return Ok(AutoQueueOutcome::idle(&host.id, AutoQueueStatus::AutonomousDisabled));
    }
    if is_rollout_paused(&host.config.fleet, fleet) {
        return Ok(AutoQueueOutcome::idle(&host.id, AutoQueueStatus::RolloutPaused));
    }

    let mut load = QueueLoad::load(store, &host.id, &policy.remediation, now)?;
    let mut outcome = AutoQueueOutcome::idle(&host.id, AutoQueueStatus::Evaluated);

    for action in &plan.actions {
        if let Some(reason) = check_gates(action, policy, &load, outcome.queued.len(), now) {
            debug!(host = %host.id, action = %action.id, reason = reason.as_str(), "auto-queue skipped");
            outcome.skipped.push(SkippedAction {
                action_id: action.id.clone(),
                reason,
            });
            continue;
        }

        let mut run = QueuedRun::new(&host.id, action, ActionMode::Execute, AUTONOMOUS_ACTOR, policy, now);
        let auto_reason = format!(
            "posture {} ({}), stage {}",
            plan.posture.score,
            plan.posture.band.as_str(),
            plan.posture.stage.as_str()
        );
        let rt = run.runtime_mut();
        rt.auto_queued = true;
        rt.auto_reason = Some(auto_reason.clone());
        rt.auto_tier = Some(action.auto_tier);

        store.insert_run(&run)?;
        let rt = run.runtime();
        store.append_audit(
            &AuditEntry::new(AUTONOMOUS_ACTOR, AuditEvent::RunAutoQueued, now)
                .run(&run)
                .detail(json!({
                    "profile": policy.profile,
                    "tier": action.auto_tier,
                    "risk": action.risk,
                    "reason": auto_reason,
                    "approval_required": rt.approval.required,
                    "canary": {
                        "bucket": rt.canary.bucket,
                        "rollout_percent": rt.canary.rollout_percent,
                        "selected": rt.canary.selected,
                    },
                })),
        )?;
        info!(host = %host.id, action = %action.id, run_id = %run.id, "action auto-queued");

        outcome.queued.push(AutoQueuedRun {
            run_id: run.id,
            action_id: action.id.clone(),
            tier: action.auto_tier,
            approval_required: rt.approval.required,
            canary_selected: rt.canary.selected,
        });
        load.record(&run);
    }

    outcome.drain_requested = !outcome.queued.is_empty() && policy.remediation.queue_auto_drain;
    Ok(outcome)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{build_actions, RemediationContext, HARDEN_SSH_AUTH, VERIFY_CONFIG_DRIFT};
    use crate::config::WardenConfig;
    use crate::host::HostConfig;
    use crate::policy::resolve;
    use crate::posture::{score_posture, HeartbeatState};
    use crate::queue::RedbStore;
    use crate::signals::IncidentSignal;
    use crate::types::{Risk, Severity, SignalCode, SignalSource};
    use tempfile::TempDir;

    fn signal(code: SignalCode, now: DateTime<Utc>) -> IncidentSignal {
        IncidentSignal {
            code,
            severity: Severity::High,
            title: code.as_str().into(),
            detail: None,
            timestamp: now,
            snapshot_id: None,
            source: SignalSource::Alert,
        }
    }

    fn plan(codes: &[SignalCode], now: DateTime<Utc>) -> RemediationPlan {
        let signals: Vec<IncidentSignal> = codes.iter().map(|c| signal(*c, now)).collect();
        RemediationPlan {
            host_id: "web-1".into(),
            generated_at: now,
            posture: score_posture(&signals, HeartbeatState::Fresh, now),
            context: RemediationContext::default(),
            actions: build_actions(&signals, &RemediationContext::default()),
        }
    }

    fn autonomous_policy(max_tier: AutoTier) -> ResolvedPolicy {
        let mut config = WardenConfig::default();
        config.remediation.autonomous_enabled = true;
        config.remediation.autonomous_max_tier = max_tier;
        resolve(&config, &HostConfig::default())
    }

    fn open() -> (TempDir, RedbStore, Host) {
        let dir = TempDir::new().unwrap();
        let store = RedbStore::open(&dir.path().join("warden.db")).unwrap();
        let host = Host::new("web-1", "Web 1", Utc::now());
        store.put_host(&host).unwrap();
        (dir, store, host)
    }

    #[test]
    fn bucket_is_deterministic_and_in_range() {
        let a = canary_bucket("web-1", "harden-ssh-auth");
        for _ in 0..10 {
            assert_eq!(canary_bucket("web-1", "harden-ssh-auth"), a);
        }
        assert!(a < 100);
        for i in 0..200 {
            assert!(canary_bucket(&format!("host-{i}"), "x") < 100);
        }
    }

    #[test]
    fn rollout_percent_follows_tier() {
        let policy = RemediationPolicy::default();
        for i in 0..50 {
            let host = format!("h{i}");
            assert!(canary_selection(&host, "a", AutoTier::SafeAuto, &policy).selected);
            assert!(!canary_selection(&host, "a", AutoTier::Observe, &policy).selected);
            let guarded = canary_selection(&host, "a", AutoTier::GuardedAuto, &policy);
            assert_eq!(guarded.rollout_percent, 25);
            assert_eq!(guarded.selected, guarded.bucket < 25);
        }
    }

    #[test]
    fn approval_by_tier_or_risk() {
        let now = Utc::now();
        let p = plan(&[SignalCode::ConfigTamper, SignalCode::SshFailedPassword], now);
        let mut policy = RemediationPolicy::default();
        let lockdown = &p.actions[0];
        let ssh = &p.actions[1];
        assert!(approval_required(lockdown, &policy));
        assert!(!approval_required(ssh, &policy));
        policy.approval_risk_threshold = Risk::Medium;
        assert!(approval_required(ssh, &policy));
    }

    #[test]
    fn gates_skip_in_order() {
        let now = Utc::now();
        let p = plan(
            &[SignalCode::ConfigTamper, SignalCode::SshFailedPassword, SignalCode::PackageDrift],
            now,
        );
        let policy = autonomous_policy(AutoTier::SafeAuto);
        let load = QueueLoad::default();

        assert_eq!(check_gates(&p.actions[0], &policy, &load, 0, now), Some(SkipReason::TierAboveMax));
        assert_eq!(check_gates(&p.actions[1], &policy, &load, 0, now), Some(SkipReason::TierAboveMax));
        assert_eq!(check_gates(&p.actions[2], &policy, &load, 0, now), None);
        // The cycle cap wins over everything else.
        assert_eq!(check_gates(&p.actions[2], &policy, &load, 2, now), Some(SkipReason::CycleCap));

        let forensics = plan(&[], now);
        assert_eq!(
            check_gates(&forensics.actions[0], &policy, &load, 0, now),
            Some(SkipReason::ObserveTier)
        );
    }

    #[test]
    fn queues_survivors_once_then_reports_already_active() {
        let (_dir, store, host) = open();
        let now = Utc::now();
        let p = plan(&[SignalCode::SshFailedPassword, SignalCode::PackageDrift], now);
        let policy = autonomous_policy(AutoTier::GuardedAuto);

        let first = auto_queue(&store, &FleetPolicy::default(), &host, &p, &policy, now).unwrap();
        assert_eq!(first.status, AutoQueueStatus::Evaluated);
        let ids: Vec<&str> = first.queued.iter().map(|q| q.action_id.as_str()).collect();
        assert_eq!(ids, vec![HARDEN_SSH_AUTH, VERIFY_CONFIG_DRIFT]);
        assert!(first.drain_requested);

        let run = store.get_run(first.queued[0].run_id).unwrap().unwrap();
        assert_eq!(run.mode(), ActionMode::Execute);
        assert_eq!(run.requested_by, AUTONOMOUS_ACTOR);
        assert!(run.runtime().auto_queued);
        assert_eq!(run.runtime().attempts, 0);

        let second = auto_queue(&store, &FleetPolicy::default(), &host, &p, &policy, now).unwrap();
        assert!(second.queued.is_empty());
        assert!(second
            .skipped
            .iter()
            .all(|s| s.reason == SkipReason::AlreadyActive));
        assert!(!second.drain_requested);
    }

    #[test]
    fn required_canary_checks_skip_actions_without_them() {
        let (_dir, store, host) = open();
        let now = Utc::now();
        let p = plan(&[SignalCode::PackageDrift], now);
        let mut policy = autonomous_policy(AutoTier::SafeAuto);
        policy.remediation.require_canary_checks = true;

        let outcome = auto_queue(&store, &FleetPolicy::default(), &host, &p, &policy, now).unwrap();
        assert!(outcome.queued.is_empty());
        assert_eq!(outcome.skipped[0].reason, SkipReason::CanaryChecksMissing);
    }

    #[test]
    fn blocked_rollback_command_skips_action() {
        let (_dir, store, host) = open();
        let now = Utc::now();
        let mut p = plan(&[SignalCode::PackageDrift], now);
        p.actions[0].rollback_commands.push("rm -rf /".into());
        let policy = autonomous_policy(AutoTier::SafeAuto);

        let outcome = auto_queue(&store, &FleetPolicy::default(), &host, &p, &policy, now).unwrap();
        assert!(outcome.queued.is_empty());
        assert_eq!(outcome.skipped[0].reason, SkipReason::GuardRejected);
        assert!(store.list_runs(&RunFilter::default()).unwrap().is_empty());
    }

    #[test]
    fn paused_or_disabled_hosts_are_left_alone() {
        let (_dir, store, mut host) = open();
        let now = Utc::now();
        let p = plan(&[SignalCode::PackageDrift], now);
        let policy = autonomous_policy(AutoTier::SafeAuto);

        host.config.fleet.rollout_paused = true;
        let paused = auto_queue(&store, &FleetPolicy::default(), &host, &p, &policy, now).unwrap();
        assert_eq!(paused.status, AutoQueueStatus::RolloutPaused);

        host.enabled = false;
        let disabled = auto_queue(&store, &FleetPolicy::default(), &host, &p, &policy, now).unwrap();
        assert_eq!(disabled.status, AutoQueueStatus::HostDisabled);

        host.enabled = true;
        host.config.fleet.rollout_paused = false;
        let off = auto_queue(
            &store,
            &FleetPolicy::default(),
            &host,
            &p,
            &resolve(&WardenConfig::default(), &HostConfig::default()),
            now,
        )
        .unwrap();
        assert_eq!(off.status, AutoQueueStatus::AutonomousDisabled);
    }

    #[test]
    fn cooldown_counts_from_last_execute() {
        let now = Utc::now();
        let p = plan(&[SignalCode::PackageDrift], now);
        let policy = autonomous_policy(AutoTier::SafeAuto);
        let mut run = QueuedRun::new(
            "web-1",
            &p.actions[0],
            ActionMode::Execute,
            "alice",
            &policy,
            now - Duration::minutes(10),
        );
        run.state = RunState::Succeeded;
        let load = QueueLoad {
            host_recent: vec![run],
            ..Default::default()
        };
        assert_eq!(
            load.cooldown_remaining(VERIFY_CONFIG_DRIFT, 15, now),
            Some(Duration::minutes(5))
        );
        assert_eq!(load.cooldown_remaining(VERIFY_CONFIG_DRIFT, 10, now), None);
        assert_eq!(check_gates(&p.actions[0], &policy, &load, 0, now), Some(SkipReason::Cooldown));
    }
}
