pub mod assess;
pub mod audit;
pub mod daemon;
pub mod fleet;
pub mod host;
pub mod init;
pub mod policy;
pub mod queue;
pub mod run;
pub mod snapshot;

use anyhow::Context;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;
use warden_core::config::{WardenConfig, WarnLevel};
use warden_core::engine::Engine;
use warden_core::types::{Actor, Role};

/// Per-invocation context shared by every subcommand.
pub struct Session {
    pub root: PathBuf,
    pub json: bool,
    pub actor: Actor,
}

impl Session {
    pub fn new(root: PathBuf, json: bool, user_id: &str, role: Role) -> Self {
        Self {
            root,
            json,
            actor: Actor::new(user_id, role),
        }
    }

    pub fn config(&self) -> anyhow::Result<WardenConfig> {
        load_config(&self.root)
    }

    pub fn engine(&self) -> anyhow::Result<Engine> {
        let config = self.config()?;
        Engine::open(&self.root, Arc::new(config)).context("failed to open warden store")
    }
}

/// Config file plus `WARDEN_*` environment overrides.
pub fn load_config(root: &Path) -> anyhow::Result<WardenConfig> {
    let mut config = WardenConfig::load(root).context("failed to load .warden/config.yaml")?;
    for w in config.apply_env(std::env::vars()) {
        match w.level {
            WarnLevel::Error => warn!(level = "error", "{}", w.message),
            WarnLevel::Warning => warn!("{}", w.message),
        }
    }
    Ok(config)
}

pub fn parse_run_id(raw: &str) -> anyhow::Result<Uuid> {
    Uuid::parse_str(raw.trim()).with_context(|| format!("invalid run id '{raw}'"))
}

pub fn parse_time(raw: &str) -> anyhow::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|t| t.with_timezone(&Utc))
        .with_context(|| format!("invalid timestamp '{raw}': expected RFC 3339"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_time_accepts_offsets() {
        let t = parse_time("2026-03-01T10:00:00+02:00").unwrap();
        assert_eq!(t.to_rfc3339(), "2026-03-01T08:00:00+00:00");
        assert!(parse_time("yesterday").is_err());
    }

    #[test]
    fn parse_run_id_trims() {
        let id = Uuid::new_v4();
        assert_eq!(parse_run_id(&format!(" {id}\n")).unwrap(), id);
        assert!(parse_run_id("run-1").is_err());
    }
}
