use crate::output::{print_json, print_table, short_id};
use chrono::Utc;
use tracing::info;
use warden_core::{
    autoqueue::{AutoQueueOutcome, AutoQueueStatus},
    engine::QueueRequest,
    queue::ApprovalStatus,
    types::ActionMode,
};

use super::Session;

pub fn run(
    session: &Session,
    host: &str,
    action: &str,
    mode: ActionMode,
    confirm: Option<String>,
) -> anyhow::Result<()> {
    let request = QueueRequest {
        host_id: host.to_string(),
        action_id: action.to_string(),
        mode,
        confirm,
    };
    let run = session
        .engine()?
        .queue_action(&request, &session.actor, Utc::now())?;

    if session.json {
        return print_json(&run);
    }
    println!("Queued {} {} on {} (run {})", run.mode(), run.action_id, run.host_id, run.id);
    let rt = run.runtime();
    if rt.approval.status == ApprovalStatus::Pending {
        println!("  awaiting approval: warden run approve {}", run.id);
    }
    if rt.canary.enabled {
        println!(
            "  canary checks enabled (bucket {} < {}%)",
            rt.canary.bucket, rt.canary.rollout_percent
        );
    }
    Ok(())
}

pub fn drain(session: &Session, limit: usize) -> anyhow::Result<()> {
    let summary = session.engine()?.drain_queue(limit, Utc::now())?;
    info!(claimed = summary.claimed, "drain finished");
    if session.json {
        return print_json(&summary);
    }
    if summary.claimed == 0 && summary.canceled == 0 {
        println!("Nothing ready to drain.");
        return Ok(());
    }
    println!(
        "Drained {} run(s): {} succeeded, {} retrying, {} failed ({} dead-lettered), {} canceled",
        summary.claimed,
        summary.succeeded,
        summary.retried,
        summary.failed,
        summary.dead_lettered,
        summary.canceled
    );
    if summary.stolen > 0 {
        println!("  {} run(s) were claimed by another worker", summary.stolen);
    }
    Ok(())
}

pub fn auto(session: &Session, host: Option<&str>) -> anyhow::Result<()> {
    let engine = session.engine()?;
    let now = Utc::now();
    let outcomes = match host {
        Some(host) => vec![engine.auto_queue_host(host, now)?],
        None => engine.run_autonomous_cycle(now)?,
    };
    if session.json {
        return print_json(&outcomes);
    }
    if outcomes.is_empty() {
        println!("No enabled hosts.");
        return Ok(());
    }
    let rows = outcomes.iter().flat_map(outcome_rows).collect();
    print_table(&["HOST", "STATUS", "ACTION", "RESULT"], rows);
    Ok(())
}

fn status_label(status: AutoQueueStatus) -> &'static str {
    match status {
        AutoQueueStatus::Evaluated => "evaluated",
        AutoQueueStatus::AutonomousDisabled => "autonomous_disabled",
        AutoQueueStatus::HostDisabled => "host_disabled",
        AutoQueueStatus::RolloutPaused => "rollout_paused",
    }
}

fn outcome_rows(outcome: &AutoQueueOutcome) -> Vec<Vec<String>> {
    let status = status_label(outcome.status);
    let mut rows: Vec<Vec<String>> = outcome
        .queued
        .iter()
        .map(|q| {
            let mut result = format!("queued {}", short_id(&q.run_id));
            if q.approval_required {
                result.push_str(" (approval)");
            }
            vec![outcome.host_id.clone(), status.into(), q.action_id.clone(), result]
        })
        .collect();
    rows.extend(outcome.skipped.iter().map(|s| {
        vec![
            outcome.host_id.clone(),
            status.into(),
            s.action_id.clone(),
            format!("skipped: {}", s.reason),
        ]
    }));
    if rows.is_empty() {
        rows.push(vec![outcome.host_id.clone(), status.into(), "-".into(), "-".into()]);
    }
    rows
}
