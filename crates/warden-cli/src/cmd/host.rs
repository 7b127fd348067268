use crate::output::{print_json, print_table, short_time};
use anyhow::{bail, Context};
use chrono::Utc;
use clap::Subcommand;
use warden_core::{
    engine::HostUpdate,
    fleet::FleetScope,
    host::{Host, HostConfig, HostConfigPatch},
    policy::PolicyProfile,
};

use super::Session;

#[derive(Subcommand)]
pub enum HostSubcommand {
    /// Register a host
    Add {
        id: String,
        /// Display name (defaults to the id)
        #[arg(long)]
        name: Option<String>,
        /// Policy profile: strict, balanced, or rapid
        #[arg(long)]
        profile: Option<PolicyProfile>,
        #[arg(long)]
        group: Option<String>,
        /// Fleet tag; repeat for several
        #[arg(long = "tag")]
        tags: Vec<String>,
        /// production, staging, or development
        #[arg(long)]
        scope: Option<FleetScope>,
    },
    /// List registered hosts
    List,
    /// Show one host with its configuration
    Show { id: String },
    /// Rename, enable, or disable a host
    Set {
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long, conflicts_with = "disable")]
        enable: bool,
        #[arg(long)]
        disable: bool,
    },
    /// Change a host's policy profile, overrides, or fleet membership
    Patch {
        id: String,
        /// Full patch as JSON; flags below are applied on top
        #[arg(long = "patch")]
        patch_json: Option<String>,
        #[arg(long, conflicts_with = "clear_profile")]
        profile: Option<PolicyProfile>,
        #[arg(long)]
        clear_profile: bool,
        #[arg(long, conflicts_with = "clear_group")]
        group: Option<String>,
        #[arg(long)]
        clear_group: bool,
        /// Replace fleet tags (comma-separated; empty clears)
        #[arg(long)]
        tags: Option<String>,
        #[arg(long)]
        scope: Option<FleetScope>,
        /// Hold this host out of fleet rollouts
        #[arg(long, conflicts_with = "resume")]
        pause: bool,
        #[arg(long)]
        resume: bool,
        /// Drop every policy and guard override
        #[arg(long)]
        reset_overrides: bool,
    },
}

pub fn run(session: &Session, subcmd: HostSubcommand) -> anyhow::Result<()> {
    match subcmd {
        HostSubcommand::Add {
            id,
            name,
            profile,
            group,
            tags,
            scope,
        } => {
            let mut config = HostConfig {
                profile,
                ..Default::default()
            };
            config.fleet.group = group;
            config.fleet.tags = tags;
            if let Some(scope) = scope {
                config.fleet.scope = scope;
            }
            add(session, &id, name.as_deref().unwrap_or(&id), config)
        }
        HostSubcommand::List => list(session),
        HostSubcommand::Show { id } => show(session, &id),
        HostSubcommand::Set {
            id,
            name,
            enable,
            disable,
        } => {
            let enabled = match (enable, disable) {
                (true, _) => Some(true),
                (_, true) => Some(false),
                _ => None,
            };
            set(session, &id, HostUpdate { name, enabled })
        }
        HostSubcommand::Patch {
            id,
            patch_json,
            profile,
            clear_profile,
            group,
            clear_group,
            tags,
            scope,
            pause,
            resume,
            reset_overrides,
        } => {
            let mut patch = match patch_json {
                Some(raw) => serde_json::from_str::<HostConfigPatch>(&raw)
                    .context("invalid --patch JSON")?,
                None => HostConfigPatch::default(),
            };
            if profile.is_some() {
                patch.profile = profile;
            }
            patch.clear_profile |= clear_profile;
            patch.reset_overrides |= reset_overrides;
            if group.is_some() {
                patch.fleet.group = group;
            }
            patch.fleet.clear_group |= clear_group;
            if let Some(raw) = tags {
                patch.fleet.tags = Some(split_tags(&raw));
            }
            if scope.is_some() {
                patch.fleet.scope = scope;
            }
            if pause || resume {
                patch.fleet.rollout_paused = Some(pause);
            }
            if patch == HostConfigPatch::default() {
                bail!("nothing to change: pass --patch or at least one flag");
            }
            apply_patch(session, &id, &patch)
        }
    }
}

fn split_tags(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

// ---------------------------------------------------------------------------

fn add(session: &Session, id: &str, name: &str, config: HostConfig) -> anyhow::Result<()> {
    let engine = session.engine()?;
    let host = engine
        .add_host(&session.actor, id, name, config, Utc::now())
        .with_context(|| format!("failed to add host '{id}'"))?;
    if session.json {
        print_json(&host)
    } else {
        println!("Added host: {} ({})", host.id, host.name);
        Ok(())
    }
}

fn list(session: &Session) -> anyhow::Result<()> {
    let hosts = session.engine()?.list_hosts()?;
    if session.json {
        return print_json(&hosts);
    }
    if hosts.is_empty() {
        println!("No hosts registered.");
        return Ok(());
    }
    let rows = hosts
        .iter()
        .map(|h| {
            vec![
                h.id.clone(),
                h.name.clone(),
                if h.enabled { "yes" } else { "no" }.to_string(),
                h.config.profile.map(|p| p.as_str()).unwrap_or("-").to_string(),
                h.config.fleet.group.clone().unwrap_or_else(|| "-".into()),
                h.last_seen_at
                    .as_ref()
                    .map(short_time)
                    .unwrap_or_else(|| "never".into()),
            ]
        })
        .collect();
    print_table(&["ID", "NAME", "ENABLED", "PROFILE", "GROUP", "LAST SEEN"], rows);
    Ok(())
}

fn show(session: &Session, id: &str) -> anyhow::Result<()> {
    let host = session.engine()?.get_host(id)?;
    if session.json {
        return print_json(&host);
    }
    print_host(&host)
}

fn print_host(host: &Host) -> anyhow::Result<()> {
    println!("Host:      {}", host.id);
    println!("Name:      {}", host.name);
    println!("Enabled:   {}", host.enabled);
    println!("Created:   {}", short_time(&host.created_at));
    match &host.last_seen_at {
        Some(t) => println!("Last seen: {}", short_time(t)),
        None => println!("Last seen: never"),
    }
    let fleet = &host.config.fleet;
    println!(
        "Fleet:     scope={} group={} tags=[{}]{}",
        fleet.scope.as_str(),
        fleet.group.as_deref().unwrap_or("-"),
        fleet.tags.join(", "),
        if fleet.rollout_paused { " (paused)" } else { "" }
    );
    println!("\nConfig:");
    print!("{}", serde_yaml::to_string(&host.config)?);
    Ok(())
}

fn set(session: &Session, id: &str, update: HostUpdate) -> anyhow::Result<()> {
    if update == HostUpdate::default() {
        bail!("nothing to change: pass --name, --enable, or --disable");
    }
    let host = session
        .engine()?
        .update_host(&session.actor, id, &update, Utc::now())?;
    if session.json {
        print_json(&host)
    } else {
        println!(
            "Updated host: {} ({}, {})",
            host.id,
            host.name,
            if host.enabled { "enabled" } else { "disabled" }
        );
        Ok(())
    }
}

fn apply_patch(session: &Session, id: &str, patch: &HostConfigPatch) -> anyhow::Result<()> {
    let host = session
        .engine()?
        .patch_host(&session.actor, id, patch, Utc::now())?;
    if session.json {
        print_json(&host)
    } else {
        println!("Patched host: {}", host.id);
        print_host(&host)
    }
}
