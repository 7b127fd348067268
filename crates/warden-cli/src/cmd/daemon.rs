use anyhow::Context;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use warden_core::{
    engine::Engine,
    trigger::{drain_channel, spawn_drain_worker},
    types::Actor,
};

use super::Session;

/// Periodic autonomous cycles plus a drain worker kicked by every queue
/// change. Each tick also prunes history past `retention_days` and kicks the
/// worker so scheduled retries get picked up. On ctrl-c the worker is allowed
/// to finish its current drain.
pub fn run(session: &Session, interval_secs: u64, drain_limit: usize) -> anyhow::Result<()> {
    let config = Arc::new(session.config()?);
    let (signal, rx) = drain_channel();
    let engine = Engine::open(&session.root, config)
        .context("failed to open warden store")?
        .with_drain_signal(signal.clone());
    let engine = Arc::new(engine);
    let interval = Duration::from_secs(interval_secs.max(1));

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let worker = spawn_drain_worker(&engine, rx, drain_limit);
        info!(
            root = %session.root.display(),
            interval_secs = interval.as_secs(),
            drain_limit,
            "warden daemon started"
        );

        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let cycle_engine = Arc::clone(&engine);
                    let result = tokio::task::spawn_blocking(move || {
                        let now = Utc::now();
                        cycle_engine.run_autonomous_cycle(now)?;
                        cycle_engine.prune_history(&Actor::autonomous(), None, now)
                    })
                    .await;
                    match result {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => warn!(error = %e, "autonomous cycle failed"),
                        Err(e) => warn!(error = %e, "autonomous cycle panicked"),
                    }
                    signal.kick();
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("shutting down");
                    break;
                }
            }
        }

        // Dropping the last senders lets the worker finish any drain in
        // flight and exit on its own.
        drop(signal);
        drop(engine);
        if let Err(e) = worker.await {
            warn!(error = %e, "drain worker ended abnormally");
        }
        Ok(())
    })
}
