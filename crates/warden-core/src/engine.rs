//! Engine facade: every operation the CLI and daemon perform.
//!
//! The engine owns no state beyond its collaborators. Every operation takes
//! the current time explicitly so callers and tests control the clock.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::{AuditEntry, AuditEvent, AuditFilter};
use crate::autoqueue::{auto_queue, AutoQueueOutcome, QueueLoad};
use crate::catalog::{build_actions, RemediationAction, RemediationContext, RemediationPlan};
use crate::config::WardenConfig;
use crate::error::{Result, WardenError};
use crate::fleet::{plan_rollout, FleetSelector, RolloutPlan};
use crate::guard::validate_action_lists;
use crate::host::{validate_host_id, Host, HostConfig, HostConfigPatch};
use crate::kit::{build_kit, ContainmentKit};
use crate::paths;
use crate::policy::{resolve, ResolvedPolicy};
use crate::posture::{score_posture, HeartbeatState, SecurityPosture};
use crate::queue::{
    drain_queue, ApprovalStatus, DrainContext, DrainSummary, PruneSummary, QueuedRun, RedbStore, RunFilter,
    RunState,
    Store,
};
use crate::runner::{CommandExecutor, ShellExecutor};
use crate::snapshot::Snapshot;
use crate::timeline::{build_timeline, Timeline, TimelineOptions};
use crate::trigger::DrainSignal;
use crate::types::{ActionMode, Actor};

/// A manual request to queue one plan action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueRequest {
    pub host_id: String,
    pub action_id: String,
    pub mode: ActionMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirm: Option<String>,
}

/// Host fields an operator may change besides its config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostUpdate {
    pub name: Option<String>,
    pub enabled: Option<bool>,
}

pub struct Engine {
    store: Arc<dyn Store>,
    config: Arc<WardenConfig>,
    executor: Arc<dyn CommandExecutor>,
    drain_signal: Option<DrainSignal>,
}

/// Everything derived from a host's recent snapshots in one evaluation.
struct Assessment {
    snapshots: Vec<Snapshot>,
    timeline: Timeline,
    posture: SecurityPosture,
}

impl Engine {
    pub fn new(store: Arc<dyn Store>, config: Arc<WardenConfig>, executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            store,
            config,
            executor,
            drain_signal: None,
        }
    }

    /// Open the redb store under `root` and run commands through `sh`.
    pub fn open(root: &Path, config: Arc<WardenConfig>) -> Result<Self> {
        let store = RedbStore::open(&paths::db_path(root))?;
        let executor = ShellExecutor {
            cwd: Some(root.to_path_buf()),
        };
        Ok(Self::new(Arc::new(store), config, Arc::new(executor)))
    }

    pub fn with_drain_signal(mut self, signal: DrainSignal) -> Self {
        self.drain_signal = Some(signal);
        self
    }

    pub fn config(&self) -> &WardenConfig {
        &self.config
    }

    fn kick_drain(&self) {
        if let Some(signal) = &self.drain_signal {
            signal.kick();
        }
    }

    fn audit(&self, entry: AuditEntry) -> Result<()> {
        self.store.append_audit(&entry)
    }

    // -----------------------------------------------------------------------
    // Hosts
    // -----------------------------------------------------------------------

    pub fn add_host(&self, actor: &Actor, id: &str, name: &str, config: HostConfig, now: DateTime<Utc>) -> Result<Host> {
        actor.require_operator("adding a host")?;
        validate_host_id(id)?;
        if self.store.get_host(id)?.is_some() {
            return Err(WardenError::HostExists(id.to_string()));
        }
        let mut host = Host::new(id, name, now);
        host.config = config;
        self.store.put_host(&host)?;
        self.audit(
            AuditEntry::new(&actor.user_id, AuditEvent::HostAdded, now)
                .host(id)
                .detail(json!({ "name": name, "profile": host.config.profile })),
        )?;
        info!(host = %id, "host added");
        Ok(host)
    }

    pub fn get_host(&self, host_id: &str) -> Result<Host> {
        self.store
            .get_host(host_id)?
            .ok_or_else(|| WardenError::HostNotFound(host_id.to_string()))
    }

    pub fn list_hosts(&self) -> Result<Vec<Host>> {
        self.store.list_hosts()
    }

    pub fn update_host(&self, actor: &Actor, host_id: &str, update: &HostUpdate, now: DateTime<Utc>) -> Result<Host> {
        actor.require_operator("updating a host")?;
        let mut host = self.get_host(host_id)?;
        if let Some(name) = &update.name {
            host.name = name.clone();
        }
        if let Some(enabled) = update.enabled {
            host.enabled = enabled;
        }
        self.store.put_host(&host)?;
        self.audit(
            AuditEntry::new(&actor.user_id, AuditEvent::HostUpdated, now)
                .host(host_id)
                .detail(json!({ "name": update.name, "enabled": update.enabled })),
        )?;
        Ok(host)
    }

    pub fn patch_host(&self, actor: &Actor, host_id: &str, patch: &HostConfigPatch, now: DateTime<Utc>) -> Result<Host> {
        actor.require_operator("changing host config")?;
        let mut host = self.get_host(host_id)?;
        host.config = host.config.merge(patch);
        self.store.put_host(&host)?;
        self.audit(
            AuditEntry::new(&actor.user_id, AuditEvent::HostUpdated, now)
                .host(host_id)
                .detail(serde_json::to_value(patch)?),
        )?;
        Ok(host)
    }

    // -----------------------------------------------------------------------
    // Snapshots and assessment
    // -----------------------------------------------------------------------

    pub fn ingest_snapshot(
        &self,
        host_id: &str,
        status: Value,
        timestamp: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Snapshot> {
        let mut host = self.get_host(host_id)?;
        let snapshot = Snapshot::new(host_id, timestamp.unwrap_or(now), status);
        self.store.insert_snapshot(&snapshot)?;

        if host.last_seen_at.map_or(true, |seen| snapshot.timestamp > seen) {
            host.last_seen_at = Some(snapshot.timestamp);
            self.store.put_host(&host)?;
        }
        let signals = crate::signals::extract_from_snapshot(&snapshot).len();
        self.audit(
            AuditEntry::new(host_id, AuditEvent::SnapshotIngested, now)
                .host(host_id)
                .detail(json!({ "snapshot_id": snapshot.id, "timestamp": snapshot.timestamp, "signals": signals })),
        )?;
        info!(host = %host_id, snapshot_id = %snapshot.id, signals, "snapshot ingested");
        Ok(snapshot)
    }

    fn timeline_options(&self) -> TimelineOptions {
        TimelineOptions {
            dedupe_window_minutes: self.config.dedupe_window_minutes,
            max_entries: None,
        }
    }

    fn assess(&self, host: &Host, now: DateTime<Utc>) -> Result<Assessment> {
        let snapshots = self.store.recent_snapshots(&host.id, self.config.snapshot_lookback)?;
        let timeline = build_timeline(&snapshots, self.timeline_options());
        let last_seen = host
            .last_seen_at
            .or_else(|| snapshots.first().map(|s| s.timestamp));
        let heartbeat = HeartbeatState::from_last_seen(
            last_seen,
            now,
            self.config.heartbeat_delayed_minutes,
            self.config.heartbeat_stale_minutes,
        );
        let posture = score_posture(&timeline.signals, heartbeat, now);
        Ok(Assessment {
            snapshots,
            timeline,
            posture,
        })
    }

    pub fn timeline(&self, host_id: &str) -> Result<Timeline> {
        self.get_host(host_id)?;
        let snapshots = self.store.recent_snapshots(host_id, self.config.snapshot_lookback)?;
        Ok(build_timeline(&snapshots, self.timeline_options()))
    }

    pub fn get_posture(&self, host_id: &str, now: DateTime<Utc>) -> Result<SecurityPosture> {
        let host = self.get_host(host_id)?;
        Ok(self.assess(&host, now)?.posture)
    }

    fn plan_for(&self, host: &Host, now: DateTime<Utc>) -> Result<RemediationPlan> {
        let assessment = self.assess(host, now)?;
        let context = RemediationContext::from_snapshots(&assessment.snapshots);
        let actions = build_actions(&assessment.timeline.signals, &context);
        Ok(RemediationPlan {
            host_id: host.id.clone(),
            generated_at: now,
            posture: assessment.posture,
            context,
            actions,
        })
    }

    pub fn evaluate_host(&self, host_id: &str, now: DateTime<Utc>) -> Result<RemediationPlan> {
        let host = self.get_host(host_id)?;
        self.plan_for(&host, now)
    }

    pub fn resolve_policy(&self, host_id: &str) -> Result<ResolvedPolicy> {
        let host = self.get_host(host_id)?;
        Ok(resolve(&self.config, &host.config))
    }

    pub fn get_containment_kit(&self, host_id: &str, now: DateTime<Utc>) -> Result<ContainmentKit> {
        let plan = self.evaluate_host(host_id, now)?;
        Ok(build_kit(host_id, &plan.posture, &plan.actions, &plan.context, now))
    }

    // -----------------------------------------------------------------------
    // Manual queuing
    // -----------------------------------------------------------------------

    pub fn queue_action(&self, request: &QueueRequest, actor: &Actor, now: DateTime<Utc>) -> Result<QueuedRun> {
        actor.require_operator("queuing an action")?;
        let host = self.get_host(&request.host_id)?;
        if !host.enabled {
            return Err(WardenError::HostDisabled(host.id));
        }
        let plan = self.plan_for(&host, now)?;
        let action = plan
            .find_action(&request.action_id)
            .ok_or_else(|| WardenError::ActionNotInPlan {
                host: host.id.clone(),
                action: request.action_id.clone(),
            })?;
        let policy = resolve(&self.config, &host.config);
        let p = &policy.remediation;
        let execute = request.mode == ActionMode::Execute;

        if execute {
            if action.requires_confirm && request.confirm.as_deref().map(str::trim) != Some(action.confirm_phrase.as_str()) {
                return Err(WardenError::ConfirmPhraseMismatch {
                    expected: action.confirm_phrase.clone(),
                });
            }
            self.require_recent_dry_run(&host.id, &action.id, p.dry_run_window_minutes, now)?;
        }

        let load = QueueLoad::load(self.store.as_ref(), &host.id, p, now)?;
        if execute {
            if let Some(remaining) = load.cooldown_remaining(&action.id, p.execute_cooldown_minutes, now) {
                return Err(WardenError::CooldownActive {
                    action: action.id.clone(),
                    remaining_minutes: ceil_minutes(remaining),
                });
            }
            if load.executes_last_hour(now) >= p.max_executes_per_hour as usize {
                return Err(WardenError::RateLimited(format!(
                    "host '{}' reached {} execute run(s) in the last hour",
                    host.id, p.max_executes_per_hour
                )));
            }
        }
        check_backlog(&load, &policy, &host.id)?;
        if let Some(active) = load.active_for(&action.id) {
            return Err(WardenError::ActionAlreadyActive {
                action: action.id.clone(),
                run_id: active.id.to_string(),
            });
        }
        let issues = validate_action_lists(
            &action.commands,
            &action.canary_checks,
            &action.rollback_commands,
            &policy.guard,
        );
        if !issues.is_empty() {
            return Err(WardenError::GuardRejected { issues });
        }

        let run = QueuedRun::new(&host.id, action, request.mode, &actor.user_id, &policy, now);
        self.store.insert_run(&run)?;
        self.audit(
            AuditEntry::new(&actor.user_id, AuditEvent::RunQueued, now)
                .run(&run)
                .detail(queue_detail(&run, &policy)),
        )?;
        info!(host = %host.id, action = %action.id, run_id = %run.id, mode = request.mode.as_str(), "action queued");

        if p.queue_auto_drain {
            self.kick_drain();
        }
        Ok(run)
    }

    fn require_recent_dry_run(&self, host_id: &str, action_id: &str, window_minutes: u32, now: DateTime<Utc>) -> Result<()> {
        let filter = RunFilter {
            host_id: Some(host_id.to_string()),
            action_id: Some(action_id.to_string()),
            states: vec![RunState::Succeeded],
            mode: Some(ActionMode::DryRun),
            finished_since: Some(now - Duration::minutes(i64::from(window_minutes))),
            limit: Some(1),
            ..Default::default()
        };
        if self.store.list_runs(&filter)?.is_empty() {
            return Err(WardenError::DryRunRequired {
                action: action_id.to_string(),
                window_minutes,
            });
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Run operations
    // -----------------------------------------------------------------------

    pub fn get_run(&self, run_id: Uuid) -> Result<QueuedRun> {
        self.store
            .get_run(run_id)?
            .ok_or_else(|| WardenError::RunNotFound(run_id.to_string()))
    }

    pub fn list_runs(&self, filter: &RunFilter) -> Result<Vec<QueuedRun>> {
        self.store.list_runs(filter)
    }

    pub fn list_audit(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>> {
        self.store.list_audit(filter)
    }

    fn queued_run(&self, run_id: Uuid, what: &str) -> Result<QueuedRun> {
        let run = self.get_run(run_id)?;
        if run.state != RunState::Queued {
            return Err(WardenError::InvalidTransition {
                from: run.state.to_string(),
                to: what.to_string(),
                reason: format!("run {run_id} is {}; only queued runs can be {what}", run.state),
            });
        }
        Ok(run)
    }

    /// Write `run` back if it is still queued.
    fn save_queued(&self, run: &QueuedRun) -> Result<()> {
        if self.store.update_run_if(run, RunState::Queued)? {
            Ok(())
        } else {
            Err(WardenError::InvalidTransition {
                from: "running".to_string(),
                to: run.state.to_string(),
                reason: format!("run {} was claimed by a drain worker", run.id),
            })
        }
    }

    pub fn approve_run(&self, run_id: Uuid, actor: &Actor, now: DateTime<Utc>) -> Result<QueuedRun> {
        actor.require_operator("approving a run")?;
        let mut run = self.queued_run(run_id, "approved")?;
        let approval = &mut run.runtime_mut().approval;
        if approval.status != ApprovalStatus::Pending {
            return Err(WardenError::InvalidValue(format!(
                "run {run_id} is not awaiting approval"
            )));
        }
        approval.status = ApprovalStatus::Approved;
        approval.decided_by = Some(actor.user_id.clone());
        approval.decided_at = Some(now);
        self.save_queued(&run)?;
        self.audit(AuditEntry::new(&actor.user_id, AuditEvent::RunApproved, now).run(&run))?;
        info!(run_id = %run_id, by = %actor.user_id, "run approved");
        if let Some(host) = self.store.get_host(&run.host_id)? {
            if resolve(&self.config, &host.config).remediation.queue_auto_drain {
                self.kick_drain();
            }
        }
        Ok(run)
    }

    pub fn reject_run(&self, run_id: Uuid, actor: &Actor, reason: &str, now: DateTime<Utc>) -> Result<QueuedRun> {
        actor.require_operator("rejecting a run")?;
        let mut run = self.queued_run(run_id, "rejected")?;
        let approval = &mut run.runtime_mut().approval;
        approval.status = ApprovalStatus::Rejected;
        approval.reason = Some(reason.to_string());
        approval.decided_by = Some(actor.user_id.clone());
        approval.decided_at = Some(now);
        run.cancel(&format!("rejected: {reason}"), now)?;
        self.save_queued(&run)?;
        self.audit(
            AuditEntry::new(&actor.user_id, AuditEvent::RunRejected, now)
                .run(&run)
                .detail(json!({ "reason": reason })),
        )?;
        info!(run_id = %run_id, by = %actor.user_id, "run rejected");
        Ok(run)
    }

    pub fn cancel_run(&self, run_id: Uuid, actor: &Actor, reason: &str, now: DateTime<Utc>) -> Result<QueuedRun> {
        actor.require_operator("canceling a run")?;
        let mut run = self.queued_run(run_id, "canceled")?;
        run.cancel(reason, now)?;
        self.save_queued(&run)?;
        self.audit(
            AuditEntry::new(&actor.user_id, AuditEvent::RunCanceled, now)
                .run(&run)
                .detail(json!({ "reason": reason })),
        )?;
        Ok(run)
    }

    /// Queue a fresh copy of a failed or canceled run under the current
    /// policy. Approval is evaluated again.
    pub fn replay_run(&self, run_id: Uuid, actor: &Actor, now: DateTime<Utc>) -> Result<QueuedRun> {
        actor.require_operator("replaying a run")?;
        let source = self.get_run(run_id)?;
        if !matches!(source.state, RunState::Failed | RunState::Canceled) {
            return Err(WardenError::InvalidTransition {
                from: source.state.to_string(),
                to: "replayed".to_string(),
                reason: format!("run {run_id} is {}; only failed or canceled runs can be replayed", source.state),
            });
        }
        let host = self.get_host(&source.host_id)?;
        if !host.enabled {
            return Err(WardenError::HostDisabled(host.id));
        }
        let policy = resolve(&self.config, &host.config);
        let action: RemediationAction = source.params.action.to_action(&source.action_id);

        let load = QueueLoad::load(self.store.as_ref(), &host.id, &policy.remediation, now)?;
        check_backlog(&load, &policy, &host.id)?;
        if let Some(active) = load.active_for(&action.id) {
            return Err(WardenError::ActionAlreadyActive {
                action: action.id.clone(),
                run_id: active.id.to_string(),
            });
        }
        let issues = validate_action_lists(
            &action.commands,
            &action.canary_checks,
            &action.rollback_commands,
            &policy.guard,
        );
        if !issues.is_empty() {
            return Err(WardenError::GuardRejected { issues });
        }

        let mut run = QueuedRun::new(&host.id, &action, source.mode(), &actor.user_id, &policy, now);
        run.runtime_mut().replay_of_run_id = Some(source.id);
        self.store.insert_run(&run)?;
        self.audit(
            AuditEntry::new(&actor.user_id, AuditEvent::RunReplayed, now)
                .run(&run)
                .detail(json!({ "replay_of_run_id": source.id, "mode": run.mode() })),
        )?;
        info!(run_id = %run.id, source = %source.id, "run replayed");
        if policy.remediation.queue_auto_drain {
            self.kick_drain();
        }
        Ok(run)
    }

    pub fn drain_queue(&self, limit: usize, now: DateTime<Utc>) -> Result<DrainSummary> {
        let ctx = DrainContext {
            store: self.store.as_ref(),
            config: &self.config,
            executor: self.executor.as_ref(),
        };
        drain_queue(&ctx, limit, now)
    }

    // -----------------------------------------------------------------------
    // Autonomous queuing and fleet
    // -----------------------------------------------------------------------

    pub fn auto_queue_host(&self, host_id: &str, now: DateTime<Utc>) -> Result<AutoQueueOutcome> {
        let host = self.get_host(host_id)?;
        let plan = self.plan_for(&host, now)?;
        let policy = resolve(&self.config, &host.config);
        let outcome = auto_queue(self.store.as_ref(), &self.config.fleet, &host, &plan, &policy, now)?;
        if outcome.drain_requested {
            self.kick_drain();
        }
        Ok(outcome)
    }

    /// Auto-queue every enabled host. A host that fails to evaluate is
    /// logged and skipped.
    pub fn run_autonomous_cycle(&self, now: DateTime<Utc>) -> Result<Vec<AutoQueueOutcome>> {
        let mut outcomes = Vec::new();
        for host in self.store.list_hosts()?.into_iter().filter(|h| h.enabled) {
            match self.auto_queue_host(&host.id, now) {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => warn!(host = %host.id, error = %e, "autonomous evaluation failed"),
            }
        }
        let queued: usize = outcomes.iter().map(|o| o.queued.len()).sum();
        info!(hosts = outcomes.len(), queued, "autonomous cycle finished");
        Ok(outcomes)
    }

    /// Drop finished runs and audit entries older than `days`, or the
    /// configured `retention_days` when not given.
    pub fn prune_history(&self, actor: &Actor, days: Option<u32>, now: DateTime<Utc>) -> Result<PruneSummary> {
        actor.require_operator("pruning history")?;
        let days = days.unwrap_or(self.config.retention_days).max(1);
        let before = now - Duration::days(i64::from(days));
        let summary = self.store.prune(before)?;
        if summary.runs + summary.audit > 0 {
            self.audit(
                AuditEntry::new(&actor.user_id, AuditEvent::HistoryPruned, now)
                    .detail(json!({ "before": before, "runs": summary.runs, "audit": summary.audit })),
            )?;
            info!(runs = summary.runs, audit = summary.audit, days, "history pruned");
        }
        Ok(summary)
    }

    pub fn plan_fleet_rollout(&self, selector: &FleetSelector, action_id: &str) -> Result<RolloutPlan> {
        let hosts = self.store.list_hosts()?;
        Ok(plan_rollout(&hosts, selector, action_id, &self.config.fleet))
    }
}

fn ceil_minutes(d: Duration) -> i64 {
    (d.num_seconds() + 59) / 60
}

fn check_backlog(load: &QueueLoad, policy: &ResolvedPolicy, host_id: &str) -> Result<()> {
    let p = &policy.remediation;
    if load.host_active.len() >= p.max_queued_per_host as usize {
        return Err(WardenError::BacklogFull(format!(
            "host '{host_id}' already has {} active run(s)",
            load.host_active.len()
        )));
    }
    if load.global_active >= p.max_queued_global as usize {
        return Err(WardenError::BacklogFull(format!(
            "{} active run(s) across the fleet",
            load.global_active
        )));
    }
    Ok(())
}

fn queue_detail(run: &QueuedRun, policy: &ResolvedPolicy) -> Value {
    let rt = run.runtime();
    json!({
        "mode": run.mode(),
        "profile": policy.profile,
        "tier": run.params.action.tier,
        "risk": run.params.action.risk,
        "approval_required": rt.approval.required,
        "canary": {
            "bucket": rt.canary.bucket,
            "rollout_percent": rt.canary.rollout_percent,
            "selected": rt.canary.selected,
        },
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
