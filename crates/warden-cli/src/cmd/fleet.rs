use crate::output::{print_json, print_table};
use clap::Subcommand;
use warden_core::fleet::{DeferReason, FleetScope, FleetSelector};

use super::Session;

#[derive(Subcommand)]
pub enum FleetSubcommand {
    /// Split matching hosts into rollout stages for one action
    Plan {
        action: String,
        #[arg(long)]
        group: Option<String>,
        /// Required tag; repeat for several
        #[arg(long = "tag")]
        tags: Vec<String>,
        #[arg(long)]
        scope: Option<FleetScope>,
    },
}

pub fn run(session: &Session, subcmd: FleetSubcommand) -> anyhow::Result<()> {
    match subcmd {
        FleetSubcommand::Plan {
            action,
            group,
            tags,
            scope,
        } => {
            let selector = FleetSelector { group, tags, scope };
            plan(session, &selector, &action)
        }
    }
}

fn plan(session: &Session, selector: &FleetSelector, action: &str) -> anyhow::Result<()> {
    let plan = session.engine()?.plan_fleet_rollout(selector, action)?;
    if session.json {
        return print_json(&plan);
    }
    println!("Rollout of {} across {} matching host(s)", plan.action_id, plan.matched);
    let rows = plan
        .stages
        .iter()
        .map(|s| {
            vec![
                s.name.clone(),
                format!("{}%", s.percent),
                s.hosts.len().to_string(),
                s.hosts.join(", "),
            ]
        })
        .collect();
    print_table(&["STAGE", "TARGET", "COUNT", "HOSTS"], rows);
    if !plan.deferred.is_empty() {
        println!("\nDeferred:");
        for d in &plan.deferred {
            let why = match d.reason {
                DeferReason::RolloutPaused => "rollout paused",
                DeferReason::BlastRadius => "blast radius cap",
            };
            println!("  {} ({why})", d.host_id);
        }
    }
    Ok(())
}
