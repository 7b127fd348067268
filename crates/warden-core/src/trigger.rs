//! Background drain trigger.
//!
//! Queuing code calls [`DrainSignal::kick`] and moves on; the worker task
//! drains on a blocking thread whenever it is kicked.

use std::sync::{Arc, Weak};

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::Engine;

/// One pending kick is enough: a drain that has not started yet will see
/// everything queued before it runs.
pub const DRAIN_SIGNAL_CAPACITY: usize = 1;

#[derive(Debug, Clone)]
pub struct DrainSignal {
    tx: mpsc::Sender<()>,
}

impl DrainSignal {
    /// Request a drain without waiting. Returns `false` when a drain is
    /// already pending or the worker is gone.
    pub fn kick(&self) -> bool {
        match self.tx.try_send(()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(())) => {
                debug!("drain already pending");
                false
            }
            Err(mpsc::error::TrySendError::Closed(())) => {
                warn!("drain worker is not running; kick dropped");
                false
            }
        }
    }
}

pub fn drain_channel() -> (DrainSignal, mpsc::Receiver<()>) {
    let (tx, rx) = mpsc::channel(DRAIN_SIGNAL_CAPACITY);
    (DrainSignal { tx }, rx)
}

/// Drain up to `limit` runs each time the channel is kicked.
///
/// The worker only holds a weak handle on the engine, so the engine's own
/// `DrainSignal` does not keep the channel open. The task ends once the
/// engine and every other `DrainSignal` clone have been dropped, after any
/// drain already in flight completes.
pub fn spawn_drain_worker(engine: &Arc<Engine>, mut rx: mpsc::Receiver<()>, limit: usize) -> JoinHandle<()> {
    let engine: Weak<Engine> = Arc::downgrade(engine);
    tokio::spawn(async move {
        while rx.recv().await.is_some() {
            let Some(engine) = engine.upgrade() else {
                break;
            };
            let result = tokio::task::spawn_blocking(move || engine.drain_queue(limit, Utc::now())).await;
            match result {
                Ok(Ok(summary)) => {
                    if summary.claimed > 0 {
                        info!(claimed = summary.claimed, succeeded = summary.succeeded, "background drain finished");
                    }
                }
                Ok(Err(e)) => warn!(error = %e, "background drain failed"),
                Err(e) => warn!(error = %e, "background drain panicked"),
            }
        }
        debug!("drain worker stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kick_never_blocks_when_full() {
        let (signal, _rx) = drain_channel();
        assert!(signal.kick());
        assert!(!signal.kick());
    }

    #[test]
    fn kick_reports_closed_channel() {
        let (signal, rx) = drain_channel();
        drop(rx);
        assert!(!signal.kick());
    }

    #[tokio::test]
    async fn worker_stops_when_engine_is_dropped() {
        use crate::config::WardenConfig;
        use crate::queue::RedbStore;
        use crate::runner::fake::ScriptedExecutor;
        use std::time::Duration;

        let dir = tempfile::TempDir::new().unwrap();
        let store = RedbStore::open(&dir.path().join("warden.db")).unwrap();
        let (signal, rx) = drain_channel();
        let engine = Arc::new(
            Engine::new(
                Arc::new(store),
                Arc::new(WardenConfig::default()),
                Arc::new(ScriptedExecutor::default()),
            )
            .with_drain_signal(signal),
        );
        let worker = spawn_drain_worker(&engine, rx, 10);

        drop(engine);
        let stopped = tokio::time::timeout(Duration::from_secs(2), worker).await;
        assert!(matches!(stopped, Ok(Ok(()))), "worker still running");
    }

    #[tokio::test]
    async fn kick_after_engine_drop_stops_worker() {
        use crate::config::WardenConfig;
        use crate::queue::RedbStore;
        use crate::runner::fake::ScriptedExecutor;
        use std::time::Duration;

        let dir = tempfile::TempDir::new().unwrap();
        let store = RedbStore::open(&dir.path().join("warden.db")).unwrap();
        let (signal, rx) = drain_channel();
        let engine = Arc::new(
            Engine::new(
                Arc::new(store),
                Arc::new(WardenConfig::default()),
                Arc::new(ScriptedExecutor::default()),
            )
            .with_drain_signal(signal.clone()),
        );
        let worker = spawn_drain_worker(&engine, rx, 10);
        drop(engine);

        // A kick after the engine is gone ends the loop instead of draining.
        assert!(signal.kick());
        let stopped = tokio::time::timeout(Duration::from_secs(2), worker).await;
        assert!(matches!(stopped, Ok(Ok(()))));
    }
}
