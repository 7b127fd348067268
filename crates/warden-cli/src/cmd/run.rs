use crate::output::{print_json, print_table, short_id, short_time};
use chrono::Utc;
use clap::Subcommand;
use warden_core::{
    queue::{QueuedRun, RunFilter, RunState},
    runner::RunReport,
    types::ActionMode,
};

use super::{parse_run_id, parse_time, Session};

#[derive(Subcommand)]
pub enum RunSubcommand {
    /// List runs, newest first
    List {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        action: Option<String>,
        /// Filter by state: queued, running, succeeded, failed, canceled
        #[arg(long)]
        state: Option<RunState>,
        #[arg(long)]
        mode: Option<ActionMode>,
        /// Only dead-lettered runs
        #[arg(long)]
        dlq: bool,
        /// Only runs requested at or after this time (RFC 3339)
        #[arg(long)]
        since: Option<String>,
        #[arg(long, default_value = "50")]
        limit: usize,
    },
    /// Show one run with its step output
    Show { id: String },
    /// Approve a run that is awaiting approval
    Approve { id: String },
    /// Reject a queued run
    Reject {
        id: String,
        #[arg(required = true)]
        reason: Vec<String>,
    },
    /// Cancel a queued run
    Cancel {
        id: String,
        /// Reason recorded on the run
        #[arg(long, default_value = "canceled by operator")]
        reason: String,
    },
    /// Queue a fresh copy of a failed or canceled run
    Replay { id: String },
}

pub fn run(session: &Session, subcmd: RunSubcommand) -> anyhow::Result<()> {
    match subcmd {
        RunSubcommand::List {
            host,
            action,
            state,
            mode,
            dlq,
            since,
            limit,
        } => {
            let filter = RunFilter {
                host_id: host,
                action_id: action,
                states: state.into_iter().collect(),
                mode,
                requested_since: since.as_deref().map(parse_time).transpose()?,
                dlq: dlq.then_some(true),
                newest_first: true,
                limit: Some(limit),
                ..Default::default()
            };
            list(session, &filter)
        }
        RunSubcommand::Show { id } => show(session, &id),
        RunSubcommand::Approve { id } => {
            let id = parse_run_id(&id)?;
            let run = session
                .engine()?
                .approve_run(id, &session.actor, Utc::now())?;
            report(session, &run, "Approved")
        }
        RunSubcommand::Reject { id, reason } => {
            let id = parse_run_id(&id)?;
            let run = session
                .engine()?
                .reject_run(id, &session.actor, &reason.join(" "), Utc::now())?;
            report(session, &run, "Rejected")
        }
        RunSubcommand::Cancel { id, reason } => {
            let id = parse_run_id(&id)?;
            let run = session
                .engine()?
                .cancel_run(id, &session.actor, &reason, Utc::now())?;
            report(session, &run, "Canceled")
        }
        RunSubcommand::Replay { id } => {
            let id = parse_run_id(&id)?;
            let run = session
                .engine()?
                .replay_run(id, &session.actor, Utc::now())?;
            if session.json {
                return print_json(&run);
            }
            println!("Replayed {} as run {}", id, run.id);
            Ok(())
        }
    }
}

fn report(session: &Session, run: &QueuedRun, verb: &str) -> anyhow::Result<()> {
    if session.json {
        print_json(run)
    } else {
        println!("{verb} run {} ({} on {}): {}", run.id, run.action_id, run.host_id, run.state);
        Ok(())
    }
}

fn list(session: &Session, filter: &RunFilter) -> anyhow::Result<()> {
    let runs = session.engine()?.list_runs(filter)?;
    if session.json {
        return print_json(&runs);
    }
    if runs.is_empty() {
        println!("No runs.");
        return Ok(());
    }
    let rows = runs
        .iter()
        .map(|r| {
            let rt = r.runtime();
            let mut state = r.state.to_string();
            if rt.dlq {
                state.push_str(" (dlq)");
            }
            vec![
                short_id(&r.id),
                r.host_id.clone(),
                r.action_id.clone(),
                r.mode().to_string(),
                state,
                format!("{}/{}", rt.attempts, rt.max_attempts),
                short_time(&r.requested_at),
            ]
        })
        .collect();
    print_table(
        &["RUN", "HOST", "ACTION", "MODE", "STATE", "ATTEMPTS", "REQUESTED"],
        rows,
    );
    Ok(())
}

fn show(session: &Session, raw_id: &str) -> anyhow::Result<()> {
    let run = session.engine()?.get_run(parse_run_id(raw_id)?)?;
    if session.json {
        return print_json(&run);
    }
    let rt = run.runtime();
    println!("Run:       {}", run.id);
    println!("Host:      {}", run.host_id);
    println!("Action:    {} ({})", run.action_id, run.params.action.title);
    println!("Mode:      {}", run.mode());
    println!("State:     {}", run.state);
    println!("Profile:   {}", run.params.profile.as_str());
    println!("By:        {}", run.requested_by);
    println!("Requested: {}", short_time(&run.requested_at));
    if let Some(t) = &run.finished_at {
        println!("Finished:  {}", short_time(t));
    }
    println!("Attempts:  {}/{}", rt.attempts, rt.max_attempts);
    if let Some(next) = &rt.next_attempt_at {
        println!("Next try:  {}", short_time(next));
    }
    if rt.approval.required {
        println!("Approval:  {:?}", rt.approval.status);
    }
    if rt.dlq {
        println!("DLQ:       {}", rt.dlq_reason.as_deref().unwrap_or("-"));
    }
    if let Some(src) = rt.replay_of_run_id {
        println!("Replay of: {src}");
    }
    if let Some(err) = &run.error {
        println!("Error:     {err}");
    }
    if let Some(output) = &run.output {
        print_report("execution", &output.execution);
        if let Some(r) = &output.canary {
            print_report("canary", r);
        }
        if let Some(r) = &output.rollback {
            print_report("rollback", r);
        }
    }
    Ok(())
}

fn print_report(label: &str, report: &RunReport) {
    println!("\n{label}: {}", if report.ok { "ok" } else { "failed" });
    for step in &report.steps {
        println!("  [{}] {}", step.status.as_str(), step.command);
        for stream in [&step.stdout, &step.stderr] {
            for line in stream.trim_end().lines() {
                println!("      {line}");
            }
        }
    }
}
