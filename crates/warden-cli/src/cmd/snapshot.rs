use crate::output::print_json;
use anyhow::{bail, Context};
use chrono::Utc;
use clap::Subcommand;
use serde_json::{json, Value};
use std::io::Read;
use std::path::PathBuf;

use super::{parse_time, Session};

#[derive(Subcommand)]
pub enum SnapshotSubcommand {
    /// Store one status document for a host (JSON from --file or stdin)
    Ingest {
        host: String,
        /// Read the status document from this file instead of stdin
        #[arg(long)]
        file: Option<PathBuf>,
        /// Snapshot time (RFC 3339); defaults to now
        #[arg(long)]
        at: Option<String>,
    },
}

pub fn run(session: &Session, subcmd: SnapshotSubcommand) -> anyhow::Result<()> {
    match subcmd {
        SnapshotSubcommand::Ingest { host, file, at } => {
            let raw = match &file {
                Some(path) => std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read {}", path.display()))?,
                None => {
                    let mut buf = String::new();
                    std::io::stdin()
                        .read_to_string(&mut buf)
                        .context("failed to read status from stdin")?;
                    buf
                }
            };
            let at = at.as_deref().map(parse_time).transpose()?;
            ingest(session, &host, &raw, at)
        }
    }
}

fn ingest(
    session: &Session,
    host: &str,
    raw: &str,
    at: Option<chrono::DateTime<Utc>>,
) -> anyhow::Result<()> {
    if raw.trim().is_empty() {
        bail!("status document is empty");
    }
    let status: Value = serde_json::from_str(raw).context("status document is not valid JSON")?;
    let engine = session.engine()?;
    let snapshot = engine.ingest_snapshot(host, status, at, Utc::now())?;
    let signals = warden_core::signals::extract_from_snapshot(&snapshot);

    if session.json {
        return print_json(&json!({
            "snapshot_id": snapshot.id,
            "host_id": snapshot.host_id,
            "timestamp": snapshot.timestamp,
            "signals": signals,
        }));
    }
    println!(
        "Ingested snapshot {} for {} ({} signal(s))",
        snapshot.id,
        snapshot.host_id,
        signals.len()
    );
    for s in &signals {
        println!("  [{}] {} {}", s.severity.as_str(), s.code.as_str(), s.title);
    }
    Ok(())
}
