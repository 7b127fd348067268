use crate::output::print_json;
use serde_json::json;
use warden_core::config::WarnLevel;

use super::Session;

/// With a host: the effective policy after profile and overrides. Without
/// one: config validation findings.
pub fn run(session: &Session, host: Option<&str>) -> anyhow::Result<()> {
    match host {
        Some(host) => resolved(session, host),
        None => validate(session),
    }
}

fn resolved(session: &Session, host: &str) -> anyhow::Result<()> {
    let policy = session.engine()?.resolve_policy(host)?;
    if session.json {
        return print_json(&policy);
    }
    println!("Host:    {host}");
    println!("Profile: {}", policy.profile.as_str());
    for note in &policy.adjustments {
        println!("  adjusted: {note}");
    }
    println!("\nremediation:");
    print!("{}", indent(&serde_yaml::to_string(&policy.remediation)?));
    println!("guard:");
    print!("{}", indent(&serde_yaml::to_string(&policy.guard)?));
    Ok(())
}

fn validate(session: &Session) -> anyhow::Result<()> {
    let config = session.config()?;
    let warnings = config.validate();
    let errors = warnings
        .iter()
        .filter(|w| w.level == WarnLevel::Error)
        .count();

    if session.json {
        return print_json(&json!({
            "default_profile": config.default_profile,
            "warnings": warnings,
            "ok": errors == 0,
        }));
    }
    println!("Default profile: {}", config.default_profile.as_str());
    if warnings.is_empty() {
        println!("Config OK.");
        return Ok(());
    }
    for w in &warnings {
        let tag = match w.level {
            WarnLevel::Error => "error",
            WarnLevel::Warning => "warning",
        };
        println!("  {tag}: {}", w.message);
    }
    Ok(())
}

fn indent(block: &str) -> String {
    block.lines().map(|l| format!("  {l}\n")).collect()
}
