use crate::output::{print_json, print_table, short_id, short_time};
use anyhow::Context;
use chrono::Utc;
use warden_core::audit::{AuditEvent, AuditFilter};

use super::{parse_run_id, Session};

pub fn run(
    session: &Session,
    host: Option<String>,
    run_id: Option<&str>,
    event: Option<&str>,
    limit: usize,
) -> anyhow::Result<()> {
    let filter = AuditFilter {
        host_id: host,
        run_id: run_id.map(parse_run_id).transpose()?,
        event: event.map(parse_event).transpose()?,
        since: None,
        limit: Some(limit),
    };
    let entries = session.engine()?.list_audit(&filter)?;
    if session.json {
        return print_json(&entries);
    }
    if entries.is_empty() {
        println!("No audit entries.");
        return Ok(());
    }
    let rows = entries
        .iter()
        .map(|e| {
            vec![
                short_time(&e.at),
                e.event.to_string(),
                e.actor.clone(),
                e.host_id.clone().unwrap_or_else(|| "-".into()),
                e.run_id.as_ref().map(short_id).unwrap_or_else(|| "-".into()),
                e.action_id.clone().unwrap_or_else(|| "-".into()),
            ]
        })
        .collect();
    print_table(&["TIME", "EVENT", "ACTOR", "HOST", "RUN", "ACTION"], rows);
    Ok(())
}

/// Drop finished runs and audit entries past the retention window.
pub fn prune(session: &Session, days: Option<u32>) -> anyhow::Result<()> {
    let summary = session
        .engine()?
        .prune_history(&session.actor, days, Utc::now())?;
    if session.json {
        return print_json(&summary);
    }
    println!(
        "Pruned {} run(s) and {} audit entr{}",
        summary.runs,
        summary.audit,
        if summary.audit == 1 { "y" } else { "ies" }
    );
    Ok(())
}

fn parse_event(raw: &str) -> anyhow::Result<AuditEvent> {
    serde_json::from_value(serde_json::Value::String(raw.trim().to_string()))
        .with_context(|| format!("unknown audit event '{raw}'"))
}
