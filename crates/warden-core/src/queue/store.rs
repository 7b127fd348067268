//! Persistence for hosts, snapshots, runs and the audit trail.
//!
//! # Table design
//!
//! Time-ordered tables use a 24-byte composite key:
//! ```text
//! [ timestamp_ms: u64 big-endian (8 bytes) | uuid: 16 bytes ]
//! ```
//! so a plain range scan returns records in time order. Snapshots prefix
//! that key with `host_id` and a `0x00` separator, which keeps every host's
//! snapshots contiguous. `RUN_INDEX` maps a run uuid to its `RUNS` key.
//!
//! Two secondary indexes keep gate checks off the full `RUNS` table:
//! `RUNS_BY_HOST` (host prefix, then the run's time key) and `ACTIVE_RUNS`
//! (time keys of queued or running runs only). Terminal runs and audit
//! entries older than the retention horizon are removed by `prune`.
//!
//! redb serializes write transactions, so the read-check-write inside
//! `update_run_if` is an atomic compare-and-set on the run state.

use std::path::Path;

use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::audit::{AuditEntry, AuditFilter};
use crate::error::{Result, WardenError};
use crate::host::Host;
use crate::snapshot::Snapshot;
use crate::types::ActionMode;

use super::run::{QueuedRun, RunState};

// ---------------------------------------------------------------------------
// Store trait
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub host_id: Option<String>,
    pub action_id: Option<String>,
    /// Empty means any state.
    pub states: Vec<RunState>,
    pub mode: Option<ActionMode>,
    pub requested_since: Option<DateTime<Utc>>,
    pub finished_since: Option<DateTime<Utc>>,
    pub auto_queued: Option<bool>,
    pub dlq: Option<bool>,
    pub newest_first: bool,
    pub limit: Option<usize>,
}

impl RunFilter {
    /// Only queued or running runs can match.
    fn active_only(&self) -> bool {
        !self.states.is_empty() && self.states.iter().all(|s| s.is_active())
    }

    pub fn for_host(host_id: &str) -> Self {
        Self {
            host_id: Some(host_id.to_string()),
            ..Default::default()
        }
    }

    pub fn active() -> Self {
        Self {
            states: vec![RunState::Queued, RunState::Running],
            ..Default::default()
        }
    }

    pub fn matches(&self, run: &QueuedRun) -> bool {
        let rt = run.runtime();
        self.host_id.as_ref().map_or(true, |h| &run.host_id == h)
            && self.action_id.as_ref().map_or(true, |a| &run.action_id == a)
            && (self.states.is_empty() || self.states.contains(&run.state))
            && self.mode.map_or(true, |m| run.mode() == m)
            && self.requested_since.map_or(true, |t| run.requested_at >= t)
            && self
                .finished_since
                .map_or(true, |t| run.finished_at.is_some_and(|f| f >= t))
            && self.auto_queued.map_or(true, |a| rt.auto_queued == a)
            && self.dlq.map_or(true, |d| rt.dlq == d)
    }
}

/// Storage seam for the engine. Implementations must make
/// `update_run_if` atomic.
pub trait Store: Send + Sync {
    fn put_host(&self, host: &Host) -> Result<()>;
    fn get_host(&self, host_id: &str) -> Result<Option<Host>>;
    fn list_hosts(&self) -> Result<Vec<Host>>;

    fn insert_snapshot(&self, snapshot: &Snapshot) -> Result<()>;
    /// Newest first.
    fn recent_snapshots(&self, host_id: &str, limit: usize) -> Result<Vec<Snapshot>>;

    fn insert_run(&self, run: &QueuedRun) -> Result<()>;
    fn get_run(&self, id: Uuid) -> Result<Option<QueuedRun>>;
    /// Ordered by request time, oldest first unless `newest_first`.
    fn list_runs(&self, filter: &RunFilter) -> Result<Vec<QueuedRun>>;
    fn count_runs(&self, filter: &RunFilter) -> Result<usize> {
        let unlimited = RunFilter {
            limit: None,
            ..filter.clone()
        };
        Ok(self.list_runs(&unlimited)?.len())
    }
    /// Write `run` only if the stored copy is still in `expected`. Returns
    /// whether the write happened.
    fn update_run_if(&self, run: &QueuedRun, expected: RunState) -> Result<bool>;

    fn append_audit(&self, entry: &AuditEntry) -> Result<()>;
    /// Newest first.
    fn list_audit(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>>;

    /// Delete terminal runs that finished before `before` and audit entries
    /// recorded before it. Queued and running runs are never touched.
    fn prune(&self, before: DateTime<Utc>) -> Result<PruneSummary>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PruneSummary {
    pub runs: usize,
    pub audit: usize,
}

// ---------------------------------------------------------------------------
// Table definitions
// ---------------------------------------------------------------------------

/// Key: host id. Value: JSON `Host`.
const HOSTS: TableDefinition<&str, &[u8]> = TableDefinition::new("hosts");
/// Key: host id ++ 0x00 ++ time key. Value: JSON `Snapshot`.
const SNAPSHOTS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("snapshots");
/// Key: time key of `requested_at`. Value: JSON `QueuedRun`.
const RUNS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("runs");
/// Key: run uuid bytes. Value: `RUNS` key.
const RUN_INDEX: TableDefinition<&[u8], &[u8]> = TableDefinition::new("run_index");
/// Key: host id ++ 0x00 ++ `RUNS` key. Value: `RUNS` key.
const RUNS_BY_HOST: TableDefinition<&[u8], &[u8]> = TableDefinition::new("runs_by_host");
/// Key: `RUNS` key of a queued or running run. Value: empty.
const ACTIVE_RUNS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("active_runs");
const EMPTY: &[u8] = &[];
/// Key: time key of `at`. Value: JSON `AuditEntry`.
const AUDIT: TableDefinition<&[u8], &[u8]> = TableDefinition::new("audit");

// ---------------------------------------------------------------------------
// Key helpers
// ---------------------------------------------------------------------------

fn time_key(ts: DateTime<Utc>, id: Uuid) -> [u8; 24] {
    let mut key = [0u8; 24];
    let ms = ts.timestamp_millis().max(0) as u64;
    key[..8].copy_from_slice(&ms.to_be_bytes());
    key[8..].copy_from_slice(id.as_bytes());
    key
}

/// `host_id ++ 0x00`, shared by the snapshot and run-by-host tables.
fn host_prefix(host_id: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(host_id.len() + 1);
    prefix.extend_from_slice(host_id.as_bytes());
    prefix.push(0);
    prefix
}

fn host_key(host_id: &str, time_key: &[u8]) -> Vec<u8> {
    let mut key = host_prefix(host_id);
    key.extend_from_slice(time_key);
    key
}

fn snapshot_key(snapshot: &Snapshot) -> Vec<u8> {
    host_key(&snapshot.host_id, &time_key(snapshot.timestamp, snapshot.id))
}

/// Lowest time key a run requested at or after `since` can have.
fn lower_time_key(since: Option<DateTime<Utc>>) -> [u8; 24] {
    since.map_or([0u8; 24], |t| time_key(t, Uuid::nil()))
}

fn ordered<'a, I>(iter: I, newest_first: bool) -> Box<dyn Iterator<Item = I::Item> + 'a>
where
    I: DoubleEndedIterator + 'a,
{
    if newest_first {
        Box::new(iter.rev())
    } else {
        Box::new(iter)
    }
}

fn db_err(e: impl std::fmt::Display) -> WardenError {
    WardenError::Store(e.to_string())
}

// ---------------------------------------------------------------------------
// RedbStore
// ---------------------------------------------------------------------------

pub struct RedbStore {
    db: Database,
}

impl RedbStore {
    /// Open or create the database at `path`, creating every table.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path).map_err(db_err)?;
        let wt = db.begin_write().map_err(db_err)?;
        wt.open_table(HOSTS).map_err(db_err)?;
        wt.open_table(SNAPSHOTS).map_err(db_err)?;
        wt.open_table(RUNS).map_err(db_err)?;
        wt.open_table(RUN_INDEX).map_err(db_err)?;
        wt.open_table(RUNS_BY_HOST).map_err(db_err)?;
        wt.open_table(ACTIVE_RUNS).map_err(db_err)?;
        wt.open_table(AUDIT).map_err(db_err)?;
        wt.commit().map_err(db_err)?;
        let store = Self { db };
        store.backfill_run_indexes()?;
        Ok(store)
    }

    /// Build the secondary run indexes for a store written before they
    /// existed. No-op once either index has an entry.
    fn backfill_run_indexes(&self) -> Result<()> {
        let wt = self.db.begin_write().map_err(db_err)?;
        let mut indexed = 0usize;
        {
            let runs = wt.open_table(RUNS).map_err(db_err)?;
            let mut by_host = wt.open_table(RUNS_BY_HOST).map_err(db_err)?;
            let mut active = wt.open_table(ACTIVE_RUNS).map_err(db_err)?;
            let empty = by_host.iter().map_err(db_err)?.next().is_none()
                && active.iter().map_err(db_err)?.next().is_none();
            if empty {
                for entry in runs.iter().map_err(db_err)? {
                    let (k, v) = entry.map_err(db_err)?;
                    let run: QueuedRun = serde_json::from_slice(v.value())?;
                    let key = k.value();
                    by_host
                        .insert(host_key(&run.host_id, key).as_slice(), key)
                        .map_err(db_err)?;
                    if run.state.is_active() {
                        active.insert(key, EMPTY).map_err(db_err)?;
                    }
                    indexed += 1;
                }
            }
        }
        if indexed > 0 {
            wt.commit().map_err(db_err)?;
            info!(runs = indexed, "built run indexes");
        } else {
            wt.abort().map_err(db_err)?;
        }
        Ok(())
    }

    fn put_bytes(&self, table: TableDefinition<&[u8], &[u8]>, key: &[u8], value: &[u8]) -> Result<()> {
        let wt = self.db.begin_write().map_err(db_err)?;
        {
            let mut t = wt.open_table(table).map_err(db_err)?;
            t.insert(key, value).map_err(db_err)?;
        }
        wt.commit().map_err(db_err)?;
        Ok(())
    }
}

impl Store for RedbStore {
    fn put_host(&self, host: &Host) -> Result<()> {
        let value = serde_json::to_vec(host)?;
        let wt = self.db.begin_write().map_err(db_err)?;
        {
            let mut t = wt.open_table(HOSTS).map_err(db_err)?;
            t.insert(host.id.as_str(), value.as_slice()).map_err(db_err)?;
        }
        wt.commit().map_err(db_err)?;
        Ok(())
    }

    fn get_host(&self, host_id: &str) -> Result<Option<Host>> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let t = rt.open_table(HOSTS).map_err(db_err)?;
        match t.get(host_id).map_err(db_err)? {
            Some(v) => Ok(Some(serde_json::from_slice(v.value())?)),
            None => Ok(None),
        }
    }

    fn list_hosts(&self) -> Result<Vec<Host>> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let t = rt.open_table(HOSTS).map_err(db_err)?;
        let mut hosts = Vec::new();
        for entry in t.iter().map_err(db_err)? {
            let (_, v) = entry.map_err(db_err)?;
            hosts.push(serde_json::from_slice(v.value())?);
        }
        Ok(hosts)
    }

    fn insert_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let value = serde_json::to_vec(snapshot)?;
        self.put_bytes(SNAPSHOTS, &snapshot_key(snapshot), &value)
    }

    fn recent_snapshots(&self, host_id: &str, limit: usize) -> Result<Vec<Snapshot>> {
        let mut lo = host_prefix(host_id);
        let mut hi = lo.clone();
        lo.extend_from_slice(&[0u8; 24]);
        hi.extend_from_slice(&[0xffu8; 24]);

        let rt = self.db.begin_read().map_err(db_err)?;
        let t = rt.open_table(SNAPSHOTS).map_err(db_err)?;
        let mut out = Vec::new();
        for entry in t.range(lo.as_slice()..=hi.as_slice()).map_err(db_err)?.rev() {
            if out.len() >= limit {
                break;
            }
            let (_, v) = entry.map_err(db_err)?;
            out.push(serde_json::from_slice(v.value())?);
        }
        Ok(out)
    }

    fn insert_run(&self, run: &QueuedRun) -> Result<()> {
        let key = time_key(run.requested_at, run.id);
        let value = serde_json::to_vec(run)?;
        let wt = self.db.begin_write().map_err(db_err)?;
        {
            let mut runs = wt.open_table(RUNS).map_err(db_err)?;
            runs.insert(key.as_slice(), value.as_slice()).map_err(db_err)?;
            let mut index = wt.open_table(RUN_INDEX).map_err(db_err)?;
            index
                .insert(run.id.as_bytes().as_slice(), key.as_slice())
                .map_err(db_err)?;
            let mut by_host = wt.open_table(RUNS_BY_HOST).map_err(db_err)?;
            by_host
                .insert(host_key(&run.host_id, &key).as_slice(), key.as_slice())
                .map_err(db_err)?;
            if run.state.is_active() {
                let mut active = wt.open_table(ACTIVE_RUNS).map_err(db_err)?;
                active.insert(key.as_slice(), EMPTY).map_err(db_err)?;
            }
        }
        wt.commit().map_err(db_err)?;
        Ok(())
    }

    fn get_run(&self, id: Uuid) -> Result<Option<QueuedRun>> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let index = rt.open_table(RUN_INDEX).map_err(db_err)?;
        let Some(key) = index.get(id.as_bytes().as_slice()).map_err(db_err)? else {
            return Ok(None);
        };
        let runs = rt.open_table(RUNS).map_err(db_err)?;
        match runs.get(key.value()).map_err(db_err)? {
            Some(v) => Ok(Some(serde_json::from_slice(v.value())?)),
            None => Ok(None),
        }
    }

    fn list_runs(&self, filter: &RunFilter) -> Result<Vec<QueuedRun>> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let runs = rt.open_table(RUNS).map_err(db_err)?;
        let lo = lower_time_key(filter.requested_since);
        let hi = [0xffu8; 24];

        let mut out = Vec::new();
        // Returns true once the limit is reached.
        let mut push = |bytes: &[u8]| -> Result<bool> {
            let run: QueuedRun = serde_json::from_slice(bytes)?;
            if filter.matches(&run) {
                out.push(run);
            }
            Ok(filter.limit.is_some_and(|l| out.len() >= l))
        };

        if let Some(host_id) = &filter.host_id {
            let by_host = rt.open_table(RUNS_BY_HOST).map_err(db_err)?;
            let (lo, hi) = (host_key(host_id, &lo), host_key(host_id, &hi));
            let range = by_host.range(lo.as_slice()..=hi.as_slice()).map_err(db_err)?;
            for entry in ordered(range, filter.newest_first) {
                let (_, key) = entry.map_err(db_err)?;
                if let Some(v) = runs.get(key.value()).map_err(db_err)? {
                    if push(v.value())? {
                        break;
                    }
                }
            }
        } else if filter.active_only() {
            let active = rt.open_table(ACTIVE_RUNS).map_err(db_err)?;
            let range = active.range(lo.as_slice()..=hi.as_slice()).map_err(db_err)?;
            for entry in ordered(range, filter.newest_first) {
                let (key, _) = entry.map_err(db_err)?;
                if let Some(v) = runs.get(key.value()).map_err(db_err)? {
                    if push(v.value())? {
                        break;
                    }
                }
            }
        } else {
            let range = runs.range(lo.as_slice()..=hi.as_slice()).map_err(db_err)?;
            for entry in ordered(range, filter.newest_first) {
                let (_, v) = entry.map_err(db_err)?;
                if push(v.value())? {
                    break;
                }
            }
        }
        Ok(out)
    }

    fn update_run_if(&self, run: &QueuedRun, expected: RunState) -> Result<bool> {
        let value = serde_json::to_vec(run)?;
        let wt = self.db.begin_write().map_err(db_err)?;
        let written = {
            let index = wt.open_table(RUN_INDEX).map_err(db_err)?;
            let key = match index.get(run.id.as_bytes().as_slice()).map_err(db_err)? {
                Some(k) => k.value().to_vec(),
                None => return Err(WardenError::RunNotFound(run.id.to_string())),
            };
            let mut runs = wt.open_table(RUNS).map_err(db_err)?;
            let current: Option<QueuedRun> = match runs.get(key.as_slice()).map_err(db_err)? {
                Some(v) => Some(serde_json::from_slice(v.value())?),
                None => None,
            };
            match current {
                Some(stored) if stored.state == expected => {
                    runs.insert(key.as_slice(), value.as_slice()).map_err(db_err)?;
                    let mut active = wt.open_table(ACTIVE_RUNS).map_err(db_err)?;
                    if run.state.is_active() {
                        active.insert(key.as_slice(), EMPTY).map_err(db_err)?;
                    } else {
                        active.remove(key.as_slice()).map_err(db_err)?;
                    }
                    true
                }
                Some(_) => false,
                None => return Err(WardenError::RunNotFound(run.id.to_string())),
            }
        };
        if written {
            wt.commit().map_err(db_err)?;
        } else {
            wt.abort().map_err(db_err)?;
        }
        Ok(written)
    }

    fn append_audit(&self, entry: &AuditEntry) -> Result<()> {
        let value = serde_json::to_vec(entry)?;
        self.put_bytes(AUDIT, &time_key(entry.at, entry.id), &value)
    }

    fn list_audit(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let t = rt.open_table(AUDIT).map_err(db_err)?;
        let mut out = Vec::new();
        for entry in t.iter().map_err(db_err)?.rev() {
            let (_, v) = entry.map_err(db_err)?;
            let audit: AuditEntry = serde_json::from_slice(v.value())?;
            if filter.matches(&audit) {
                out.push(audit);
                if filter.limit.is_some_and(|l| out.len() >= l) {
                    break;
                }
            }
        }
        Ok(out)
    }

    fn prune(&self, before: DateTime<Utc>) -> Result<PruneSummary> {
        let horizon = time_key(before, Uuid::nil());
        let wt = self.db.begin_write().map_err(db_err)?;
        let mut summary = PruneSummary::default();
        {
            // A run requested after the horizon cannot have finished before it.
            let mut runs = wt.open_table(RUNS).map_err(db_err)?;
            let mut expired = Vec::new();
            for entry in runs.range(..horizon.as_slice()).map_err(db_err)? {
                let (k, v) = entry.map_err(db_err)?;
                let run: QueuedRun = serde_json::from_slice(v.value())?;
                let finished = run.finished_at.unwrap_or(run.requested_at);
                if !run.state.is_active() && finished < before {
                    expired.push((k.value().to_vec(), run.id, run.host_id));
                }
            }
            let mut index = wt.open_table(RUN_INDEX).map_err(db_err)?;
            let mut by_host = wt.open_table(RUNS_BY_HOST).map_err(db_err)?;
            for (key, id, host_id) in &expired {
                runs.remove(key.as_slice()).map_err(db_err)?;
                index.remove(id.as_bytes().as_slice()).map_err(db_err)?;
                by_host.remove(host_key(host_id, key).as_slice()).map_err(db_err)?;
            }
            summary.runs = expired.len();

            let mut audit = wt.open_table(AUDIT).map_err(db_err)?;
            let mut old = Vec::new();
            for entry in audit.range(..horizon.as_slice()).map_err(db_err)? {
                let (k, _) = entry.map_err(db_err)?;
                old.push(k.value().to_vec());
            }
            for key in &old {
                audit.remove(key.as_slice()).map_err(db_err)?;
            }
            summary.audit = old.len();
        }
        wt.commit().map_err(db_err)?;
        Ok(summary)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditEvent;
    use crate::catalog::{build_actions, RemediationContext};
    use crate::config::WardenConfig;
    use crate::host::HostConfig;
    use crate::policy::resolve;
    use chrono::Duration;
    use serde_json::json;
    use std::sync::{Arc, Barrier};
    use tempfile::TempDir;

    fn open_tmp() -> (TempDir, RedbStore) {
        let dir = TempDir::new().unwrap();
        let store = RedbStore::open(&dir.path().join("warden.db")).unwrap();
        (dir, store)
    }

    fn run_at(host: &str, ts: DateTime<Utc>) -> QueuedRun {
        let action = build_actions(&[], &RemediationContext::default()).remove(0);
        let policy = resolve(&WardenConfig::default(), &HostConfig::default());
        QueuedRun::new(host, &action, ActionMode::DryRun, "alice", &policy, ts)
    }

    #[test]
    fn hosts_roundtrip_sorted_by_id() {
        let (_dir, store) = open_tmp();
        let now = Utc::now();
        store.put_host(&Host::new("web-2", "Web 2", now)).unwrap();
        store.put_host(&Host::new("web-1", "Web 1", now)).unwrap();
        let ids: Vec<String> = store.list_hosts().unwrap().into_iter().map(|h| h.id).collect();
        assert_eq!(ids, vec!["web-1", "web-2"]);
        assert!(store.get_host("nope").unwrap().is_none());
    }

    #[test]
    fn recent_snapshots_are_per_host_newest_first() {
        let (_dir, store) = open_tmp();
        let now = Utc::now();
        for minutes in [30, 10, 20] {
            store
                .insert_snapshot(&Snapshot::new("web", now - Duration::minutes(minutes), json!({})))
                .unwrap();
        }
        // "web-1" shares the "web" byte prefix but not the separator.
        store
            .insert_snapshot(&Snapshot::new("web-1", now, json!({})))
            .unwrap();

        let recent = store.recent_snapshots("web", 2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].timestamp.timestamp_millis(), (now - Duration::minutes(10)).timestamp_millis());
        assert_eq!(recent[1].timestamp.timestamp_millis(), (now - Duration::minutes(20)).timestamp_millis());
        assert!(recent.iter().all(|s| s.host_id == "web"));
    }

    #[test]
    fn runs_list_in_request_order_with_filters() {
        let (_dir, store) = open_tmp();
        let now = Utc::now();
        let late = run_at("h1", now);
        let early = run_at("h1", now - Duration::minutes(5));
        let other = run_at("h2", now - Duration::minutes(1));
        store.insert_run(&late).unwrap();
        store.insert_run(&early).unwrap();
        store.insert_run(&other).unwrap();

        let h1 = store.list_runs(&RunFilter::for_host("h1")).unwrap();
        assert_eq!(h1.iter().map(|r| r.id).collect::<Vec<_>>(), vec![early.id, late.id]);

        let newest = store
            .list_runs(&RunFilter {
                newest_first: true,
                limit: Some(1),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(newest[0].id, late.id);
        assert_eq!(store.count_runs(&RunFilter::active()).unwrap(), 3);
        assert_eq!(store.get_run(other.id).unwrap().unwrap().host_id, "h2");
    }

    #[test]
    fn update_run_if_checks_expected_state() {
        let (_dir, store) = open_tmp();
        let mut run = run_at("h1", Utc::now());
        store.insert_run(&run).unwrap();

        run.transition(RunState::Running).unwrap();
        assert!(store.update_run_if(&run, RunState::Queued).unwrap());
        // Stored copy is now running; a second claim must fail.
        assert!(!store.update_run_if(&run, RunState::Queued).unwrap());
        assert_eq!(store.get_run(run.id).unwrap().unwrap().state, RunState::Running);

        let ghost = run_at("h1", Utc::now());
        assert!(matches!(
            store.update_run_if(&ghost, RunState::Queued),
            Err(WardenError::RunNotFound(_))
        ));
    }

    #[test]
    fn concurrent_claims_have_one_winner() {
        let (_dir, store) = open_tmp();
        let store = Arc::new(store);
        let run = run_at("h1", Utc::now());
        store.insert_run(&run).unwrap();

        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = (0..2)
            .map(|i| {
                let store = Arc::clone(&store);
                let barrier = Arc::clone(&barrier);
                let mut claim = run.clone();
                std::thread::spawn(move || {
                    claim.transition(RunState::Running).unwrap();
                    claim.requested_by = format!("worker-{i}");
                    barrier.wait();
                    store.update_run_if(&claim, RunState::Queued).unwrap()
                })
            })
            .collect();
        let wins: usize = handles
            .into_iter()
            .map(|h| h.join().unwrap() as usize)
            .sum();
        assert_eq!(wins, 1);
    }

    fn finish(store: &RedbStore, run: &mut QueuedRun, state: RunState, at: DateTime<Utc>) {
        run.transition(RunState::Running).unwrap();
        assert!(store.update_run_if(run, RunState::Queued).unwrap());
        run.transition(state).unwrap();
        run.finished_at = Some(at);
        assert!(store.update_run_if(run, RunState::Running).unwrap());
    }

    #[test]
    fn host_listing_stays_within_host_and_since() {
        let (_dir, store) = open_tmp();
        let now = Utc::now();
        let old = run_at("web", now - Duration::hours(3));
        let recent = run_at("web", now - Duration::minutes(2));
        // "web-1" shares the "web" byte prefix but not the separator.
        let neighbour = run_at("web-1", now - Duration::minutes(1));
        for run in [&old, &recent, &neighbour] {
            store.insert_run(run).unwrap();
        }

        let all = store.list_runs(&RunFilter::for_host("web")).unwrap();
        assert_eq!(all.iter().map(|r| r.id).collect::<Vec<_>>(), vec![old.id, recent.id]);

        let since = store
            .list_runs(&RunFilter {
                requested_since: Some(now - Duration::hours(1)),
                newest_first: true,
                ..RunFilter::for_host("web")
            })
            .unwrap();
        assert_eq!(since.len(), 1);
        assert_eq!(since[0].id, recent.id);
    }

    #[test]
    fn active_listing_follows_state_changes() {
        let (_dir, store) = open_tmp();
        let now = Utc::now();
        let mut done = run_at("h1", now - Duration::minutes(2));
        let waiting = run_at("h2", now - Duration::minutes(1));
        store.insert_run(&done).unwrap();
        store.insert_run(&waiting).unwrap();
        assert_eq!(store.count_runs(&RunFilter::active()).unwrap(), 2);

        finish(&store, &mut done, RunState::Succeeded, now);
        let active = store.list_runs(&RunFilter::active()).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, waiting.id);
        // terminal runs are still listed when asked for
        let all = store.list_runs(&RunFilter::default()).unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn prune_drops_old_terminal_runs_and_audit_only() {
        let (_dir, store) = open_tmp();
        let now = Utc::now();
        let horizon = now - Duration::days(30);

        let mut expired = run_at("h1", now - Duration::days(40));
        store.insert_run(&expired).unwrap();
        finish(&store, &mut expired, RunState::Failed, now - Duration::days(39));
        // requested long ago but finished inside the window
        let mut late_finish = run_at("h1", now - Duration::days(31));
        store.insert_run(&late_finish).unwrap();
        finish(&store, &mut late_finish, RunState::Succeeded, now - Duration::days(1));
        let stuck = run_at("h1", now - Duration::days(45));
        store.insert_run(&stuck).unwrap();

        store
            .append_audit(&AuditEntry::new("a", AuditEvent::RunQueued, now - Duration::days(40)))
            .unwrap();
        store
            .append_audit(&AuditEntry::new("a", AuditEvent::RunQueued, now))
            .unwrap();

        let summary = store.prune(horizon).unwrap();
        assert_eq!(summary, PruneSummary { runs: 1, audit: 1 });
        assert!(store.get_run(expired.id).unwrap().is_none());
        assert!(store.get_run(late_finish.id).unwrap().is_some());
        assert_eq!(store.get_run(stuck.id).unwrap().unwrap().state, RunState::Queued);

        let host = store.list_runs(&RunFilter::for_host("h1")).unwrap();
        assert_eq!(host.len(), 2);
        assert!(host.iter().all(|r| r.id != expired.id));
        assert_eq!(store.count_runs(&RunFilter::active()).unwrap(), 1);
        assert_eq!(store.list_audit(&AuditFilter::default()).unwrap().len(), 1);

        assert_eq!(store.prune(horizon).unwrap(), PruneSummary::default());
    }

    #[test]
    fn reopen_rebuilds_missing_run_indexes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("warden.db");
        let now = Utc::now();
        let mut done = run_at("h1", now - Duration::minutes(3));
        let waiting = run_at("h1", now - Duration::minutes(1));
        {
            let store = RedbStore::open(&path).unwrap();
            store.insert_run(&done).unwrap();
            store.insert_run(&waiting).unwrap();
            finish(&store, &mut done, RunState::Succeeded, now);

            // Simulate a store written before the indexes existed.
            let wt = store.db.begin_write().unwrap();
            wt.delete_table(RUNS_BY_HOST).unwrap();
            wt.delete_table(ACTIVE_RUNS).unwrap();
            wt.commit().unwrap();
        }

        let store = RedbStore::open(&path).unwrap();
        assert_eq!(store.list_runs(&RunFilter::for_host("h1")).unwrap().len(), 2);
        let active = store.list_runs(&RunFilter::active()).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, waiting.id);
    }

    #[test]
    fn audit_lists_newest_first() {
        let (_dir, store) = open_tmp();
        let now = Utc::now();
        store
            .append_audit(&AuditEntry::new("a", AuditEvent::HostAdded, now - Duration::seconds(2)).host("h1"))
            .unwrap();
        store
            .append_audit(&AuditEntry::new("a", AuditEvent::RunQueued, now).host("h1"))
            .unwrap();
        let entries = store.list_audit(&AuditFilter::default()).unwrap();
        assert_eq!(entries[0].event, AuditEvent::RunQueued);
        assert_eq!(entries[1].event, AuditEvent::HostAdded);
    }
}
