use crate::output::{print_json, print_table, short_time};
use chrono::Utc;
use warden_core::kit::render_text;

use super::Session;

pub fn timeline(session: &Session, host: &str, limit: Option<usize>) -> anyhow::Result<()> {
    let mut timeline = session.engine()?.timeline(host)?;
    if let Some(limit) = limit {
        timeline.signals.truncate(limit);
    }
    if session.json {
        return print_json(&timeline);
    }
    if timeline.is_empty() {
        println!("No signals for {host}.");
        return Ok(());
    }
    let rows = timeline
        .signals
        .iter()
        .map(|s| {
            vec![
                short_time(&s.timestamp),
                s.severity.as_str().to_string(),
                s.code.as_str().to_string(),
                s.title.clone(),
            ]
        })
        .collect();
    print_table(&["TIME", "SEVERITY", "CODE", "TITLE"], rows);
    let by_severity: Vec<String> = timeline
        .summary
        .by_severity
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect();
    println!("\n{} signal(s): {}", timeline.summary.total, by_severity.join(" "));
    Ok(())
}

pub fn posture(session: &Session, host: &str) -> anyhow::Result<()> {
    let posture = session.engine()?.get_posture(host, Utc::now())?;
    if session.json {
        return print_json(&posture);
    }
    println!("Host:      {host}");
    println!("Score:     {} ({})", posture.score, posture.band.as_str());
    println!("Stage:     {}", posture.stage.as_str());
    println!("Heartbeat: {}", posture.heartbeat.as_str());
    println!("Signals:   {}", posture.signal_count);
    if !posture.priority_codes.is_empty() {
        let codes: Vec<&str> = posture.priority_codes.iter().map(|c| c.as_str()).collect();
        println!("Priority:  {}", codes.join(", "));
    }
    if posture.lockdown_active {
        println!("Lockdown:  active");
    }
    println!("\nNext move: {}", posture.next_move);
    Ok(())
}

pub fn plan(session: &Session, host: &str) -> anyhow::Result<()> {
    let plan = session.engine()?.evaluate_host(host, Utc::now())?;
    if session.json {
        return print_json(&plan);
    }
    println!(
        "Plan for {host}: posture {} ({}), stage {}",
        plan.posture.score,
        plan.posture.band.as_str(),
        plan.posture.stage.as_str()
    );
    let rows = plan
        .actions
        .iter()
        .map(|a| {
            vec![
                a.id.clone(),
                a.priority.as_str().to_string(),
                a.risk.as_str().to_string(),
                a.auto_tier.as_str().to_string(),
                a.title.clone(),
            ]
        })
        .collect();
    print_table(&["ACTION", "PRIORITY", "RISK", "TIER", "TITLE"], rows);
    for a in &plan.actions {
        println!("\n{}: {}", a.id, a.why);
        for c in &a.commands {
            println!("  $ {c}");
        }
    }
    Ok(())
}

pub fn kit(session: &Session, host: &str) -> anyhow::Result<()> {
    let kit = session.engine()?.get_containment_kit(host, Utc::now())?;
    if session.json {
        return print_json(&kit);
    }
    print!("{}", render_text(&kit));
    Ok(())
}
