//! Signal extraction: one status snapshot in, zero or more typed signals out.
//!
//! Four independent sub-parsers (alerts, auth counters, unexpected ports,
//! ingest warnings) each contribute signals. The output is unordered; the
//! timeline builder sorts and deduplicates.

use crate::snapshot::{AuthCounters, IngestIntegrity, PortSummary, Snapshot, SnapshotStatus, StatusAlert};
use crate::types::{Severity, SignalCode, SignalSource};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use uuid::Uuid;

/// `ssh_failed_password` at or above this count is `high`.
pub const FAILED_PASSWORD_HIGH: u64 = 10;
/// `ssh_invalid_user` at or above this count is `high`.
pub const INVALID_USER_HIGH: u64 = 5;
/// `ssh_new_accepts` at or above this count is `high`.
pub const NEW_ACCEPTS_HIGH: u64 = 3;
/// Unexpected public ports at or above this count are `critical`.
pub const UNEXPECTED_PORTS_CRITICAL: u64 = 3;

// ---------------------------------------------------------------------------
// IncidentSignal
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentSignal {
    pub code: SignalCode,
    pub severity: Severity,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<Uuid>,
    pub source: SignalSource,
}

struct Origin {
    timestamp: DateTime<Utc>,
    snapshot_id: Option<Uuid>,
}

impl Origin {
    fn signal(
        &self,
        code: SignalCode,
        severity: Severity,
        source: SignalSource,
        title: impl Into<String>,
        detail: Option<String>,
    ) -> IncidentSignal {
        IncidentSignal {
            code,
            severity,
            title: title.into(),
            detail,
            timestamp: self.timestamp,
            snapshot_id: self.snapshot_id,
            source,
        }
    }
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

pub fn extract_from_snapshot(snapshot: &Snapshot) -> Vec<IncidentSignal> {
    extract_signals(
        &snapshot.parsed_status(),
        Some(snapshot.id),
        snapshot.timestamp,
    )
}

pub fn extract_signals(
    status: &SnapshotStatus,
    snapshot_id: Option<Uuid>,
    timestamp: DateTime<Utc>,
) -> Vec<IncidentSignal> {
    let origin = Origin {
        timestamp,
        snapshot_id,
    };
    let mut out = Vec::new();
    for alert in &status.alerts {
        out.push(alert_signal(&origin, alert));
    }
    if let Some(auth) = &status.auth {
        out.extend(auth_signals(&origin, auth));
    }
    if let Some(ports) = &status.ports {
        out.extend(port_signal(&origin, ports));
    }
    if let Some(ingest) = &status.ingest {
        out.extend(ingest_signals(&origin, ingest));
    }
    out
}

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

struct AlertPatterns {
    config: Regex,
    firewall: Regex,
    accounts: Regex,
    packages: Regex,
}

fn alert_patterns() -> &'static AlertPatterns {
    static PATTERNS: OnceLock<AlertPatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| AlertPatterns {
        config: Regex::new(
            r"(?i)(/etc/(sudoers|ssh/|shadow|passwd|pam\.d|crontab|cron\.|profile\.d|ld\.so)|authorized_keys|\.env\b|secrets?\b|private key|credential|config(uration)? (file )?(changed|modified|tamper))",
        )
        .expect("static regex"),
        firewall: Regex::new(r"(?i)\b(firewall|iptables|nftables|nft|ufw|firewalld|pf\.conf)\b")
            .expect("static regex"),
        accounts: Regex::new(
            r"(?i)(\b(useradd|userdel|usermod|groupadd|adduser|deluser)\b|\b(new|added|removed|deleted|created|modified) (user|account|group)s?\b|\b(user|account|group)s? (added|removed|deleted|created|changed|modified)\b|\buid 0\b)",
        )
        .expect("static regex"),
        packages: Regex::new(
            r"(?i)\b(packages?|apt|dpkg|yum|dnf|rpm|pacman|apk|snap|brew)\b",
        )
        .expect("static regex"),
    })
}

/// Classify free alert text, most sensitive match first.
pub fn classify_alert(title: &str, detail: Option<&str>) -> SignalCode {
    let text = match detail {
        Some(d) => format!("{title} {d}"),
        None => title.to_string(),
    };
    let p = alert_patterns();
    if p.config.is_match(&text) {
        SignalCode::ConfigTamper
    } else if p.firewall.is_match(&text) {
        SignalCode::FirewallDrift
    } else if p.accounts.is_match(&text) {
        SignalCode::AccountDrift
    } else if p.packages.is_match(&text) {
        SignalCode::PackageDrift
    } else {
        SignalCode::SecurityAlert
    }
}

fn alert_signal(origin: &Origin, alert: &StatusAlert) -> IncidentSignal {
    let code = classify_alert(&alert.title, alert.detail.as_deref());
    let severity = match code {
        SignalCode::ConfigTamper => Severity::Critical,
        SignalCode::FirewallDrift | SignalCode::AccountDrift => Severity::High,
        SignalCode::PackageDrift => Severity::Medium,
        _ => alert
            .severity
            .as_deref()
            .and_then(Severity::parse_loose)
            .unwrap_or(Severity::Medium),
    };
    origin.signal(
        code,
        severity,
        SignalSource::Alert,
        alert.title.trim(),
        alert
            .detail
            .as_ref()
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty()),
    )
}

// ---------------------------------------------------------------------------
// Auth counters
// ---------------------------------------------------------------------------

fn escalate(count: u64, high_at: u64) -> Severity {
    if count >= high_at {
        Severity::High
    } else {
        Severity::Medium
    }
}

fn auth_signals(origin: &Origin, auth: &AuthCounters) -> Vec<IncidentSignal> {
    let mut out = Vec::new();
    if auth.ssh_failed_password > 0 {
        out.push(origin.signal(
            SignalCode::SshFailedPassword,
            escalate(auth.ssh_failed_password, FAILED_PASSWORD_HIGH),
            SignalSource::Auth,
            "SSH failed password attempts",
            Some(format!("{} failed password attempt(s)", auth.ssh_failed_password)),
        ));
    }
    if auth.ssh_invalid_user > 0 {
        out.push(origin.signal(
            SignalCode::SshInvalidUser,
            escalate(auth.ssh_invalid_user, INVALID_USER_HIGH),
            SignalSource::Auth,
            "SSH invalid user attempts",
            Some(format!("{} invalid user attempt(s)", auth.ssh_invalid_user)),
        ));
    }
    if auth.ssh_new_accepts > 0 {
        out.push(origin.signal(
            SignalCode::SshNewAccepts,
            escalate(auth.ssh_new_accepts, NEW_ACCEPTS_HIGH),
            SignalSource::Auth,
            "New SSH logins accepted",
            Some(format!("{} new accepted login(s)", auth.ssh_new_accepts)),
        ));
    }
    out
}

// ---------------------------------------------------------------------------
// Ports
// ---------------------------------------------------------------------------

fn port_signal(origin: &Origin, ports: &PortSummary) -> Option<IncidentSignal> {
    let count = ports.effective_unexpected();
    if count == 0 {
        return None;
    }
    let severity = if count >= UNEXPECTED_PORTS_CRITICAL {
        Severity::Critical
    } else {
        Severity::High
    };
    let detail = if ports.unexpected.is_empty() {
        format!("{count} unexpected public listener(s)")
    } else {
        let listed: Vec<String> = ports
            .unexpected
            .iter()
            .map(|p| match &p.process {
                Some(proc_name) => format!("{}/{} ({proc_name})", p.port, p.proto),
                None => format!("{}/{}", p.port, p.proto),
            })
            .collect();
        format!("{count} unexpected public listener(s): {}", listed.join(", "))
    };
    Some(origin.signal(
        SignalCode::UnexpectedPublicPorts,
        severity,
        SignalSource::Ports,
        "Unexpected public ports listening",
        Some(detail),
    ))
}

// ---------------------------------------------------------------------------
// Ingest integrity
// ---------------------------------------------------------------------------

fn integrity_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(signature|checksum|hash|tamper|mismatch)").expect("static regex")
    })
}

fn ingest_signals(origin: &Origin, ingest: &IngestIntegrity) -> Vec<IncidentSignal> {
    ingest
        .warnings
        .iter()
        .map(|w| w.trim())
        .filter(|w| !w.is_empty())
        .map(|w| {
            let severity = if integrity_pattern().is_match(w) {
                Severity::Medium
            } else {
                Severity::Low
            };
            origin.signal(
                SignalCode::IngestIntegrity,
                severity,
                SignalSource::Ingest,
                "Ingest integrity warning",
                Some(w.to_string()),
            )
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn extract(value: serde_json::Value) -> Vec<IncidentSignal> {
        extract_signals(&SnapshotStatus::from_value(&value), None, Utc::now())
    }

    #[test]
    fn sudoers_detail_is_config_tamper_critical() {
        let signals = extract(json!({
            "alerts": [{"title": "File integrity change", "detail": "modified /etc/sudoers.d/90-cloud"}]
        }));
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].code, SignalCode::ConfigTamper);
        assert_eq!(signals[0].severity, Severity::Critical);
        assert_eq!(signals[0].source, SignalSource::Alert);
    }

    #[test]
    fn classification_respects_sensitivity_order() {
        // Mentions both firewall and packages: firewall wins.
        assert_eq!(
            classify_alert("ufw package upgraded", None),
            SignalCode::FirewallDrift
        );
        // Config path beats firewall.
        assert_eq!(
            classify_alert("iptables rules", Some("/etc/ssh/sshd_config rewritten")),
            SignalCode::ConfigTamper
        );
        assert_eq!(classify_alert("New user added", None), SignalCode::AccountDrift);
        assert_eq!(classify_alert("Packages changed", None), SignalCode::PackageDrift);
        assert_eq!(classify_alert("Something odd", None), SignalCode::SecurityAlert);
    }

    #[test]
    fn generic_alert_uses_its_own_severity() {
        let signals = extract(json!({"alerts": [{"title": "Odd beacon", "severity": "critical"}]}));
        assert_eq!(signals[0].code, SignalCode::SecurityAlert);
        assert_eq!(signals[0].severity, Severity::Critical);
    }

    #[test]
    fn failed_password_threshold_boundary() {
        for (count, expected) in [
            (1, Severity::Medium),
            (FAILED_PASSWORD_HIGH - 1, Severity::Medium),
            (FAILED_PASSWORD_HIGH, Severity::High),
            (FAILED_PASSWORD_HIGH + 90, Severity::High),
        ] {
            let signals = extract(json!({"auth": {"ssh_failed_password": count}}));
            assert_eq!(signals.len(), 1, "count {count}");
            assert_eq!(signals[0].code, SignalCode::SshFailedPassword);
            assert_eq!(signals[0].severity, expected, "count {count}");
        }
    }

    #[test]
    fn zero_counters_yield_nothing() {
        let signals = extract(json!({"auth": {"ssh_failed_password": 0, "ssh_invalid_user": 0}}));
        assert!(signals.is_empty());
    }

    #[test]
    fn port_count_severity() {
        let two = extract(json!({"ports": {"unexpected_count": 2}}));
        assert_eq!(two[0].severity, Severity::High);
        let three = extract(json!({"ports": {"unexpected_count": 3, "total": 1}}));
        assert_eq!(three[0].severity, Severity::Critical);
        assert!(extract(json!({"ports": {"unexpected_count": 0, "total": 8}})).is_empty());
    }

    #[test]
    fn ingest_warnings_pass_through_low_or_medium() {
        let signals = extract(json!({"ingest": {"warnings": ["late batch", "signature mismatch", " "]}}));
        assert_eq!(signals.len(), 2);
        assert_eq!(signals[0].severity, Severity::Low);
        assert_eq!(signals[1].severity, Severity::Medium);
    }

    #[test]
    fn snapshot_id_and_timestamp_propagate() {
        let snap = Snapshot::new("h1", Utc::now(), json!({"alerts": ["Packages changed"]}));
        let signals = extract_from_snapshot(&snap);
        assert_eq!(signals[0].snapshot_id, Some(snap.id));
        assert_eq!(signals[0].timestamp, snap.timestamp);
    }
}
