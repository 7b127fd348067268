use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEvent {
    HostAdded,
    HostUpdated,
    SnapshotIngested,
    RunQueued,
    RunAutoQueued,
    RunApproved,
    RunRejected,
    RunCanceled,
    RunReplayed,
    RunRetryScheduled,
    RunSucceeded,
    RunFailed,
    HistoryPruned,
}

impl AuditEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditEvent::HostAdded => "host_added",
            AuditEvent::HostUpdated => "host_updated",
            AuditEvent::SnapshotIngested => "snapshot_ingested",
            AuditEvent::RunQueued => "run_queued",
            AuditEvent::RunAutoQueued => "run_auto_queued",
            AuditEvent::RunApproved => "run_approved",
            AuditEvent::RunRejected => "run_rejected",
            AuditEvent::RunCanceled => "run_canceled",
            AuditEvent::RunReplayed => "run_replayed",
            AuditEvent::RunRetryScheduled => "run_retry_scheduled",
            AuditEvent::RunSucceeded => "run_succeeded",
            AuditEvent::RunFailed => "run_failed",
            AuditEvent::HistoryPruned => "history_pruned",
        }
    }
}

impl fmt::Display for AuditEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One append-only audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub at: DateTime<Utc>,
    pub actor: String,
    pub event: AuditEvent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_id: Option<String>,
    #[serde(default)]
    pub detail: Value,
}

impl AuditEntry {
    pub fn new(actor: &str, event: AuditEvent, at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            at,
            actor: actor.to_string(),
            event,
            host_id: None,
            run_id: None,
            action_id: None,
            detail: Value::Null,
        }
    }

    pub fn host(mut self, host_id: &str) -> Self {
        self.host_id = Some(host_id.to_string());
        self
    }

    pub fn run(mut self, run: &crate::queue::QueuedRun) -> Self {
        self.host_id = Some(run.host_id.clone());
        self.run_id = Some(run.id);
        self.action_id = Some(run.action_id.clone());
        self
    }

    pub fn detail(mut self, detail: Value) -> Self {
        self.detail = detail;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub host_id: Option<String>,
    pub run_id: Option<Uuid>,
    pub event: Option<AuditEvent>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl AuditFilter {
    pub fn matches(&self, entry: &AuditEntry) -> bool {
        self.host_id
            .as_ref()
            .map_or(true, |h| entry.host_id.as_ref() == Some(h))
            && self.run_id.map_or(true, |id| entry.run_id == Some(id))
            && self.event.map_or(true, |e| entry.event == e)
            && self.since.map_or(true, |since| entry.at >= since)
    }
}
