//! Drain worker: claim ready runs one at a time and carry each to its next
//! state.
//!
//! Failure routing:
//! - host missing/disabled or TTL expired: `canceled`
//! - dequeue-time guard rejection: `failed` + DLQ, no attempt consumed
//! - canary failure or any rollback attempt: `failed` + DLQ immediately
//! - other execution failures: back to `queued` with backoff until the
//!   attempt budget is spent, then `failed` + DLQ

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::{AuditEntry, AuditEvent};
use crate::config::WardenConfig;
use crate::error::{Result, WardenError};
use crate::guard::validate_action_lists;
use crate::policy::{resolve, ResolvedPolicy};
use crate::runner::{run_commands, CommandExecutor, RunLimits};
use crate::types::{ActionMode, DRAIN_ACTOR};

use super::run::{QueuedRun, RunOutput, RunState};
use super::store::{RunFilter, Store};

/// Candidates tried per slot before giving up when other workers keep
/// winning the claim.
pub const MAX_CLAIM_ATTEMPTS: usize = 5;

pub const REASON_HOST_DISABLED: &str = "host_disabled";
pub const REASON_TTL_EXPIRED: &str = "queue_ttl_expired";
pub const REASON_GUARD_REJECTED: &str = "guard_rejected";
pub const REASON_CANARY_FAILED: &str = "canary_failed";
pub const REASON_ROLLBACK_ATTEMPTED: &str = "rollback_attempted";
pub const REASON_MAX_ATTEMPTS: &str = "max_attempts_exceeded";

pub struct DrainContext<'a> {
    pub store: &'a dyn Store,
    pub config: &'a WardenConfig,
    pub executor: &'a dyn CommandExecutor,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainSummary {
    pub claimed: usize,
    pub succeeded: usize,
    pub retried: usize,
    pub failed: usize,
    pub dead_lettered: usize,
    pub canceled: usize,
    /// Claims lost to a concurrent worker.
    pub stolen: usize,
    pub run_ids: Vec<Uuid>,
}

/// What happened to one claimed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Succeeded,
    Retried,
    DeadLettered,
    Canceled,
}

/// Process up to `limit` ready runs, oldest request first.
pub fn drain_queue(ctx: &DrainContext<'_>, limit: usize, now: DateTime<Utc>) -> Result<DrainSummary> {
    let mut summary = DrainSummary::default();

    while summary.claimed < limit {
        let Some(run) = claim_next(ctx.store, now, &mut summary)? else {
            break;
        };
        summary.claimed += 1;
        summary.run_ids.push(run.id);

        match process_claimed(ctx, run, now)? {
            Disposition::Succeeded => summary.succeeded += 1,
            Disposition::Retried => summary.retried += 1,
            Disposition::DeadLettered => {
                summary.failed += 1;
                summary.dead_lettered += 1;
            }
            Disposition::Canceled => summary.canceled += 1,
        }
    }

    if summary.claimed > 0 {
        info!(
            claimed = summary.claimed,
            succeeded = summary.succeeded,
            retried = summary.retried,
            failed = summary.failed,
            canceled = summary.canceled,
            "drain pass finished"
        );
    }
    Ok(summary)
}

/// Flip one ready run from `queued` to `running`. A candidate whose state
/// changed underneath us counts as stolen and the next one is tried.
fn claim_next(
    store: &dyn Store,
    now: DateTime<Utc>,
    summary: &mut DrainSummary,
) -> Result<Option<QueuedRun>> {
    let filter = RunFilter {
        states: vec![RunState::Queued],
        ..Default::default()
    };
    let candidates = store
        .list_runs(&filter)?
        .into_iter()
        .filter(|r| r.is_ready(now))
        .take(MAX_CLAIM_ATTEMPTS);

    for candidate in candidates {
        let mut claimed = candidate;
        claimed.transition(RunState::Running)?;
        claimed.started_at = Some(now);
        if store.update_run_if(&claimed, RunState::Queued)? {
            return Ok(Some(claimed));
        }
        summary.stolen += 1;
        warn!(run_id = %claimed.id, "claim lost to another worker");
    }
    Ok(None)
}

fn process_claimed(ctx: &DrainContext<'_>, mut run: QueuedRun, now: DateTime<Utc>) -> Result<Disposition> {
    let host = ctx.store.get_host(&run.host_id)?;
    let Some(host) = host.filter(|h| h.enabled) else {
        run.cancel(REASON_HOST_DISABLED, now)?;
        return finish(ctx.store, &run, None, AuditEvent::RunCanceled, now, Disposition::Canceled);
    };

    let policy = resolve(ctx.config, &host.config);
    let ttl = Duration::minutes(i64::from(policy.remediation.queue_ttl_minutes));
    if now - run.requested_at > ttl {
        run.cancel(REASON_TTL_EXPIRED, now)?;
        return finish(ctx.store, &run, Some(&policy), AuditEvent::RunCanceled, now, Disposition::Canceled);
    }

    // The policy may have tightened since the run was queued.
    let rt = run.runtime();
    let issues = validate_action_lists(
        &run.params.action.commands,
        &rt.canary.checks,
        &rt.rollback.commands,
        &policy.guard,
    );
    if !issues.is_empty() {
        let message = WardenError::GuardRejected { issues }.to_string();
        run.dead_letter(REASON_GUARD_REJECTED, message, now)?;
        return finish(ctx.store, &run, Some(&policy), AuditEvent::RunFailed, now, Disposition::DeadLettered);
    }

    let limits = RunLimits {
        timeout: std::time::Duration::from_secs(policy.remediation.command_timeout_secs),
        output_buffer_bytes: usize::try_from(policy.remediation.output_buffer_bytes).unwrap_or(usize::MAX),
    };
    let dry_run = run.mode() == ActionMode::DryRun;
    run.runtime_mut().attempts += 1;

    let execution = run_commands(ctx.executor, &run.params.action.commands, &limits, dry_run);
    let mut error = execution.error_message();
    let mut output = RunOutput {
        execution,
        canary: None,
        rollback: None,
    };
    let mut ok = output.execution.ok;

    let mut canary_failed = false;
    if ok && run.runtime().canary.enabled {
        let checks = run.runtime().canary.checks.clone();
        let report = run_commands(ctx.executor, &checks, &limits, false);
        let canary = &mut run.runtime_mut().canary;
        canary.passed = Some(report.ok);
        if !report.ok {
            let message = format!(
                "canary check failed: {}",
                report.error_message().unwrap_or_default()
            );
            canary.error = Some(message.clone());
            canary_failed = true;
            ok = false;
            error = Some(message);
        }
        output.canary = Some(report);
    }

    if !ok && run.runtime().rollback.enabled && !run.runtime().rollback.commands.is_empty() {
        let commands = run.runtime().rollback.commands.clone();
        let report = run_commands(ctx.executor, &commands, &limits, false);
        let rollback = &mut run.runtime_mut().rollback;
        rollback.attempted = true;
        rollback.succeeded = Some(report.ok);
        rollback.error = report.error_message();
        output.rollback = Some(report);
    }
    run.output = Some(output);

    if ok {
        run.transition(RunState::Succeeded)?;
        run.finished_at = Some(now);
        run.error = None;
        let rt = run.runtime_mut();
        rt.last_error = None;
        rt.next_attempt_at = None;
        return finish(ctx.store, &run, Some(&policy), AuditEvent::RunSucceeded, now, Disposition::Succeeded);
    }

    let message = error.unwrap_or_else(|| "execution failed".to_string());
    let rt = run.runtime();
    let forced = if canary_failed {
        Some(REASON_CANARY_FAILED)
    } else if rt.rollback.attempted {
        Some(REASON_ROLLBACK_ATTEMPTED)
    } else if rt.attempts >= rt.max_attempts {
        Some(REASON_MAX_ATTEMPTS)
    } else {
        None
    };

    match forced {
        Some(reason) => {
            run.dead_letter(reason, message, now)?;
            finish(ctx.store, &run, Some(&policy), AuditEvent::RunFailed, now, Disposition::DeadLettered)
        }
        None => {
            let attempt = run.runtime().attempts;
            run.transition(RunState::Queued)?;
            run.error = Some(message.clone());
            let rt = run.runtime_mut();
            rt.last_error = Some(message);
            rt.next_attempt_at = Some(now + policy.remediation.backoff(attempt));
            finish(ctx.store, &run, Some(&policy), AuditEvent::RunRetryScheduled, now, Disposition::Retried)
        }
    }
}

/// Persist the run's new state and write the matching audit entry.
fn finish(
    store: &dyn Store,
    run: &QueuedRun,
    policy: Option<&ResolvedPolicy>,
    event: AuditEvent,
    now: DateTime<Utc>,
    disposition: Disposition,
) -> Result<Disposition> {
    if !store.update_run_if(run, RunState::Running)? {
        warn!(run_id = %run.id, "run changed while it was running; result not recorded");
        return Ok(disposition);
    }

    let rt = run.runtime();
    let detail = json!({
        "state": run.state,
        "mode": run.mode(),
        "profile": policy.map(|p| p.profile).unwrap_or(run.params.profile),
        "tier": run.params.action.tier,
        "attempts": rt.attempts,
        "max_attempts": rt.max_attempts,
        "next_attempt_at": rt.next_attempt_at,
        "dlq": rt.dlq,
        "dlq_reason": rt.dlq_reason,
        "canary": {
            "enabled": rt.canary.enabled,
            "passed": rt.canary.passed,
        },
        "rollback": {
            "attempted": rt.rollback.attempted,
            "succeeded": rt.rollback.succeeded,
        },
        "error": run.error,
    });
    store.append_audit(&AuditEntry::new(DRAIN_ACTOR, event, now).run(run).detail(detail))?;

    match disposition {
        Disposition::Succeeded => info!(run_id = %run.id, host = %run.host_id, action = %run.action_id, "run succeeded"),
        Disposition::Retried => info!(
            run_id = %run.id,
            attempts = rt.attempts,
            next_attempt_at = ?rt.next_attempt_at,
            "run failed; retry scheduled"
        ),
        Disposition::DeadLettered => warn!(
            run_id = %run.id,
            reason = rt.dlq_reason.as_deref().unwrap_or(""),
            "run dead-lettered"
        ),
        Disposition::Canceled => warn!(run_id = %run.id, reason = run.error.as_deref().unwrap_or(""), "run canceled"),
    }
    Ok(disposition)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
