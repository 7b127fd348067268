//! Host status snapshots and the lenient schema used to read them.
//!
//! Snapshots arrive as opaque JSON from the host agent. `SnapshotStatus`
//! pulls out the four sections the signal extractor understands. Every
//! section is optional and parsed independently: a malformed section is
//! treated as absent, never as an error.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: Uuid,
    pub host_id: String,
    pub timestamp: DateTime<Utc>,
    pub status: Value,
}

impl Snapshot {
    pub fn new(host_id: impl Into<String>, timestamp: DateTime<Utc>, status: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            host_id: host_id.into(),
            timestamp,
            status,
        }
    }

    pub fn parsed_status(&self) -> SnapshotStatus {
        SnapshotStatus::from_value(&self.status)
    }
}

// ---------------------------------------------------------------------------
// Status sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusAlert {
    #[serde(alias = "name", alias = "summary")]
    pub title: String,
    #[serde(default, alias = "message", alias = "details")]
    pub detail: Option<String>,
    #[serde(default, alias = "level")]
    pub severity: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthCounters {
    pub ssh_failed_password: u64,
    pub ssh_invalid_user: u64,
    pub ssh_new_accepts: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortEntry {
    pub port: u16,
    pub proto: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PortSummary {
    pub total: Option<u64>,
    pub unexpected_count: Option<u64>,
    pub unexpected: Vec<PortEntry>,
}

impl PortSummary {
    /// An explicit unexpected count wins over the listed entries, which win
    /// over the raw listening total.
    pub fn effective_unexpected(&self) -> u64 {
        if let Some(n) = self.unexpected_count {
            return n;
        }
        if !self.unexpected.is_empty() {
            return self.unexpected.len() as u64;
        }
        self.total.unwrap_or(0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestIntegrity {
    pub warnings: Vec<String>,
}

// ---------------------------------------------------------------------------
// SnapshotStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotStatus {
    pub alerts: Vec<StatusAlert>,
    pub auth: Option<AuthCounters>,
    pub ports: Option<PortSummary>,
    pub ingest: Option<IngestIntegrity>,
}

impl SnapshotStatus {
    pub fn from_value(value: &Value) -> Self {
        let Some(obj) = value.as_object() else {
            return Self::default();
        };
        Self {
            alerts: obj.get("alerts").map(parse_alerts).unwrap_or_default(),
            auth: field(obj, &["auth", "authSummary", "auth_summary"]).and_then(parse_auth),
            ports: field(obj, &["ports", "listening", "portSummary"]).and_then(parse_ports),
            ingest: field(obj, &["ingest", "integrity", "ingestIntegrity"]).and_then(parse_ingest),
        }
    }
}

fn field<'a>(obj: &'a serde_json::Map<String, Value>, names: &[&str]) -> Option<&'a Value> {
    names.iter().find_map(|n| obj.get(*n))
}

/// Accept counters as numbers or numeric strings.
fn as_count(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn count_field(obj: &serde_json::Map<String, Value>, names: &[&str]) -> Option<u64> {
    field(obj, names).and_then(as_count)
}

fn parse_alerts(value: &Value) -> Vec<StatusAlert> {
    let Some(items) = value.as_array() else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| match item {
            Value::String(s) if !s.trim().is_empty() => Some(StatusAlert {
                title: s.clone(),
                ..Default::default()
            }),
            Value::Object(_) => serde_json::from_value::<StatusAlert>(item.clone())
                .ok()
                .filter(|a| !a.title.trim().is_empty()),
            _ => None,
        })
        .collect()
}

fn parse_auth(value: &Value) -> Option<AuthCounters> {
    let obj = value.as_object()?;
    let counters = AuthCounters {
        ssh_failed_password: count_field(
            obj,
            &["ssh_failed_password", "sshFailedPassword", "failed_password"],
        )
        .unwrap_or(0),
        ssh_invalid_user: count_field(obj, &["ssh_invalid_user", "sshInvalidUser", "invalid_user"])
            .unwrap_or(0),
        ssh_new_accepts: count_field(obj, &["ssh_new_accepts", "sshNewAccepts", "new_accepts"])
            .unwrap_or(0),
    };
    Some(counters)
}

fn parse_port_entry(value: &Value) -> Option<PortEntry> {
    let obj = value.as_object()?;
    let port = count_field(obj, &["port"]).and_then(|p| u16::try_from(p).ok())?;
    let proto = obj
        .get("proto")
        .or_else(|| obj.get("protocol"))
        .and_then(Value::as_str)
        .map(|s| s.to_ascii_lowercase())
        .unwrap_or_else(|| "tcp".to_string());
    let text = |names: &[&str]| {
        field(obj, names)
            .and_then(Value::as_str)
            .map(str::to_string)
    };
    Some(PortEntry {
        port,
        proto,
        process: text(&["process", "proc", "program"]),
        address: text(&["address", "addr", "bind"]),
    })
}

fn parse_ports(value: &Value) -> Option<PortSummary> {
    let obj = value.as_object()?;
    let unexpected_value = field(obj, &["unexpected", "unexpected_ports", "unexpectedPorts"]);
    let (list, list_count): (Vec<PortEntry>, Option<u64>) = match unexpected_value {
        Some(Value::Array(items)) => (items.iter().filter_map(parse_port_entry).collect(), None),
        Some(other) => (Vec::new(), as_count(other)),
        None => (Vec::new(), None),
    };
    Some(PortSummary {
        total: count_field(obj, &["total", "public_total", "publicTotal", "count"]),
        unexpected_count: count_field(obj, &["unexpected_count", "unexpectedCount"]).or(list_count),
        unexpected: list,
    })
}

fn parse_ingest(value: &Value) -> Option<IngestIntegrity> {
    let warnings = match value {
        Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        Value::Object(obj) => obj
            .get("warnings")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default(),
        _ => return None,
    };
    Some(IngestIntegrity { warnings })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_all_sections() {
        let status = SnapshotStatus::from_value(&json!({
            "alerts": [{"title": "Packages changed", "detail": "apt upgrade"}, "bare alert"],
            "auth": {"ssh_failed_password": 12, "sshInvalidUser": "3"},
            "ports": {"total": 9, "unexpected": [{"port": 6379, "proto": "TCP", "proc": "redis"}]},
            "ingest": {"warnings": ["checksum mismatch"]}
        }));
        assert_eq!(status.alerts.len(), 2);
        assert_eq!(status.alerts[1].title, "bare alert");
        let auth = status.auth.unwrap();
        assert_eq!(auth.ssh_failed_password, 12);
        assert_eq!(auth.ssh_invalid_user, 3);
        let ports = status.ports.unwrap();
        assert_eq!(ports.unexpected[0].proto, "tcp");
        assert_eq!(ports.unexpected[0].process.as_deref(), Some("redis"));
        assert_eq!(ports.effective_unexpected(), 1);
        assert_eq!(status.ingest.unwrap().warnings, vec!["checksum mismatch"]);
    }

    #[test]
    fn unknown_shapes_are_absent_not_errors() {
        let status = SnapshotStatus::from_value(&json!({
            "alerts": "not a list",
            "auth": 5,
            "ports": ["weird"],
        }));
        assert!(status.alerts.is_empty());
        assert!(status.auth.is_none());
        assert!(status.ports.is_none());
        assert_eq!(SnapshotStatus::from_value(&json!(null)), SnapshotStatus::default());
    }

    #[test]
    fn explicit_unexpected_count_beats_total() {
        let status = SnapshotStatus::from_value(&json!({
            "ports": {"total": 10, "unexpectedCount": 2}
        }));
        assert_eq!(status.ports.unwrap().effective_unexpected(), 2);

        let status = SnapshotStatus::from_value(&json!({"ports": {"total": 4}}));
        assert_eq!(status.ports.unwrap().effective_unexpected(), 4);
    }

    #[test]
    fn malformed_port_entries_are_dropped() {
        let status = SnapshotStatus::from_value(&json!({
            "ports": {"unexpected": [{"port": 70000}, {"port": 22}, {"proto": "udp"}]}
        }));
        let ports = status.ports.unwrap();
        assert_eq!(ports.unexpected.len(), 1);
        assert_eq!(ports.unexpected[0].port, 22);
        assert_eq!(ports.unexpected[0].proto, "tcp");
    }
}
