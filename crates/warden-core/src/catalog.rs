//! Fixed remediation catalog: maps the signal codes present in a timeline
//! onto concrete, guard-checkable actions.

use crate::posture::SecurityPosture;
use crate::signals::IncidentSignal;
use crate::snapshot::{PortEntry, Snapshot};
use crate::types::{AutoTier, Priority, Risk, SignalCode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub const LOCKDOWN_ACCESS_SURFACE: &str = "lockdown-access-surface";
pub const QUARANTINE_UNEXPECTED_PORTS: &str = "quarantine-unexpected-ports";
pub const HARDEN_SSH_AUTH: &str = "harden-ssh-auth";
pub const VERIFY_CONFIG_DRIFT: &str = "verify-config-drift";
pub const COLLECT_FORENSICS: &str = "collect-forensics";

pub fn confirm_phrase(action_id: &str) -> String {
    format!("EXECUTE {action_id}")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemediationAction {
    pub id: String,
    pub priority: Priority,
    pub risk: Risk,
    pub title: String,
    pub why: String,
    pub source_codes: Vec<SignalCode>,
    pub commands: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_notes: Option<String>,
    #[serde(default)]
    pub rollback_commands: Vec<String>,
    #[serde(default)]
    pub canary_checks: Vec<String>,
    pub auto_tier: AutoTier,
    pub requires_confirm: bool,
    pub confirm_phrase: String,
}

/// Snapshot-derived detail used to render concrete commands.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemediationContext {
    pub unexpected_ports: Vec<PortEntry>,
}

impl RemediationContext {
    /// Take the unexpected ports listed by the newest snapshot that lists
    /// any, deduplicated by `port/proto`.
    pub fn from_snapshots(snapshots: &[Snapshot]) -> Self {
        let newest = snapshots
            .iter()
            .map(|s| (s.timestamp, s.parsed_status()))
            .filter_map(|(ts, status)| {
                status
                    .ports
                    .filter(|p| !p.unexpected.is_empty())
                    .map(|p| (ts, p.unexpected))
            })
            .max_by_key(|(ts, _)| *ts);

        let mut seen = BTreeSet::new();
        let unexpected_ports = newest
            .map(|(_, entries)| entries)
            .unwrap_or_default()
            .into_iter()
            .filter(|e| seen.insert((e.port, e.proto.clone())))
            .collect();
        Self { unexpected_ports }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationPlan {
    pub host_id: String,
    pub generated_at: DateTime<Utc>,
    pub posture: SecurityPosture,
    pub context: RemediationContext,
    pub actions: Vec<RemediationAction>,
}

impl RemediationPlan {
    pub fn find_action(&self, action_id: &str) -> Option<&RemediationAction> {
        find_action(&self.actions, action_id)
    }
}

pub fn find_action<'a>(actions: &'a [RemediationAction], action_id: &str) -> Option<&'a RemediationAction> {
    actions.iter().find(|a| a.id == action_id)
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

struct Template {
    id: &'static str,
    priority: Priority,
    risk: Risk,
    tier: AutoTier,
    title: &'static str,
    triggers: &'static [SignalCode],
}

const TEMPLATES: &[Template] = &[
    Template {
        id: LOCKDOWN_ACCESS_SURFACE,
        priority: Priority::P0,
        risk: Risk::High,
        tier: AutoTier::RiskyManual,
        title: "Lock down access surface",
        triggers: &[
            SignalCode::ConfigTamper,
            SignalCode::AccountDrift,
            SignalCode::SshNewAccepts,
        ],
    },
    Template {
        id: QUARANTINE_UNEXPECTED_PORTS,
        priority: Priority::P0,
        risk: Risk::Medium,
        tier: AutoTier::GuardedAuto,
        title: "Quarantine unexpected public ports",
        triggers: &[SignalCode::UnexpectedPublicPorts],
    },
    Template {
        id: HARDEN_SSH_AUTH,
        priority: Priority::P1,
        risk: Risk::Medium,
        tier: AutoTier::GuardedAuto,
        title: "Harden SSH authentication",
        triggers: &[SignalCode::SshFailedPassword, SignalCode::SshInvalidUser],
    },
    Template {
        id: VERIFY_CONFIG_DRIFT,
        priority: Priority::P2,
        risk: Risk::Low,
        tier: AutoTier::SafeAuto,
        title: "Verify configuration drift",
        triggers: &[
            SignalCode::FirewallDrift,
            SignalCode::PackageDrift,
            SignalCode::SecurityAlert,
            SignalCode::IngestIntegrity,
        ],
    },
];

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

struct Body {
    why: String,
    commands: Vec<String>,
    rollback_notes: Option<String>,
    rollback_commands: Vec<String>,
    canary_checks: Vec<String>,
}

fn render(id: &str, codes: &[SignalCode], ctx: &RemediationContext) -> Body {
    let seen = codes
        .iter()
        .map(|c| c.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    match id {
        LOCKDOWN_ACCESS_SURFACE => Body {
            why: format!("{seen} observed: privileged access may have changed outside change control"),
            commands: strings(&[
                "# keep the current firewall state so rollback can restore it",
                "sudo cp -p /etc/ufw/user.rules /etc/ufw/user.rules.warden-bak",
                "sudo cp -p /etc/default/ufw /etc/default/ufw.warden-bak",
                "# freeze inbound access while the change is investigated",
                "sudo ufw default deny incoming",
                "sudo ufw limit 22/tcp",
                "sudo ls -la /etc/sudoers.d /etc/ssh",
                "sudo last -n 20",
                "sudo journalctl -u ssh --since -3h --no-pager -n 200",
            ]),
            rollback_notes: Some(
                "Restores the firewall rules and defaults saved before the lockdown.".into(),
            ),
            rollback_commands: strings(&[
                "sudo cp -p /etc/ufw/user.rules.warden-bak /etc/ufw/user.rules",
                "sudo cp -p /etc/default/ufw.warden-bak /etc/default/ufw",
                "sudo ufw reload",
            ]),
            canary_checks: strings(&["sudo ufw status verbose", "sudo systemctl is-active ssh"]),
        },
        QUARANTINE_UNEXPECTED_PORTS => {
            let mut commands = strings(&["sudo ss -tulpn"]);
            let mut rollback_commands = Vec::new();
            if ctx.unexpected_ports.is_empty() {
                commands.push(
                    "# TODO: no concrete ports in the latest snapshot; add 'sudo ufw deny <port>/<proto>' per exposed port"
                        .into(),
                );
            }
            for p in &ctx.unexpected_ports {
                commands.push(format!("sudo ufw deny {}/{}", p.port, p.proto));
                rollback_commands.push(format!("sudo ufw delete deny {}/{}", p.port, p.proto));
            }
            Body {
                why: format!(
                    "{seen} observed: {} unexpected listener(s) reachable from outside",
                    ctx.unexpected_ports.len()
                ),
                commands,
                rollback_notes: (!rollback_commands.is_empty())
                    .then(|| "Removes the deny rules added for each quarantined port.".to_string()),
                rollback_commands,
                canary_checks: strings(&["sudo ufw status numbered", "sudo ss -tulpn"]),
            }
        }
        HARDEN_SSH_AUTH => Body {
            why: format!("{seen} observed: SSH is being brute-forced or scanned"),
            commands: strings(&[
                "sudo grep -E '^(PasswordAuthentication|PermitRootLogin|MaxAuthTries)' /etc/ssh/sshd_config",
                "sudo ufw limit 22/tcp",
                "sudo fail2ban-client status sshd",
                "sudo sshd -t",
                "sudo systemctl reload ssh",
            ]),
            rollback_notes: Some("Removes the SSH rate limit.".into()),
            rollback_commands: strings(&["sudo ufw delete limit 22/tcp"]),
            canary_checks: strings(&["sudo sshd -t", "sudo systemctl is-active ssh"]),
        },
        VERIFY_CONFIG_DRIFT => Body {
            why: format!("{seen} observed: confirm the drift is expected before it is trusted"),
            commands: strings(&[
                "sudo ufw status verbose",
                "sudo dpkg --verify",
                "sudo ls -la --time-style=full-iso /etc/sudoers.d /etc/ssh",
                "sudo journalctl -p warning --since -3h --no-pager -n 200",
            ]),
            rollback_notes: None,
            rollback_commands: Vec::new(),
            canary_checks: Vec::new(),
        },
        _ => forensics_body(),
    }
}

fn forensics_body() -> Body {
    Body {
        why: "No actionable signals: capture a baseline so later drift can be compared.".into(),
        commands: strings(&[
            "sudo ss -tulpn",
            "sudo ps auxww",
            "sudo last -n 50",
            "sudo journalctl --since -24h --no-pager -n 500",
            "sudo ls -la /etc/sudoers.d /etc/ssh /etc/cron.d",
        ]),
        rollback_notes: None,
        rollback_commands: Vec::new(),
        canary_checks: Vec::new(),
    }
}

fn assemble(
    id: &str,
    priority: Priority,
    risk: Risk,
    tier: AutoTier,
    title: &str,
    source_codes: Vec<SignalCode>,
    body: Body,
) -> RemediationAction {
    RemediationAction {
        id: id.to_string(),
        priority,
        risk,
        title: title.to_string(),
        why: body.why,
        source_codes,
        commands: body.commands,
        rollback_notes: body.rollback_notes,
        rollback_commands: body.rollback_commands,
        canary_checks: body.canary_checks,
        auto_tier: tier,
        requires_confirm: true,
        confirm_phrase: confirm_phrase(id),
    }
}

/// Build the action list in catalog order. With no matching group the plan
/// holds exactly one `collect-forensics` action.
pub fn build_actions(signals: &[IncidentSignal], ctx: &RemediationContext) -> Vec<RemediationAction> {
    let present: BTreeSet<SignalCode> = signals.iter().map(|s| s.code).collect();

    let mut actions: Vec<RemediationAction> = TEMPLATES
        .iter()
        .filter_map(|t| {
            let codes: Vec<SignalCode> = t
                .triggers
                .iter()
                .copied()
                .filter(|c| present.contains(c))
                .collect();
            if codes.is_empty() {
                return None;
            }
            let body = render(t.id, &codes, ctx);
            Some(assemble(t.id, t.priority, t.risk, t.tier, t.title, codes, body))
        })
        .collect();

    if actions.is_empty() {
        actions.push(assemble(
            COLLECT_FORENSICS,
            Priority::P2,
            Risk::Low,
            AutoTier::Observe,
            "Collect forensics baseline",
            Vec::new(),
            forensics_body(),
        ));
    }
    actions
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::{validate_action_lists, GuardPolicy};
    use crate::signals::extract_from_snapshot;
    use crate::types::{Severity, SignalSource};
    use serde_json::json;

    fn sig(code: SignalCode) -> IncidentSignal {
        IncidentSignal {
            code,
            severity: Severity::High,
            title: code.as_str().into(),
            detail: None,
            timestamp: Utc::now(),
            snapshot_id: None,
            source: SignalSource::Alert,
        }
    }

    #[test]
    fn sudoers_alert_produces_lockdown_first() {
        let snapshot = Snapshot::new(
            "web-1",
            Utc::now(),
            json!({"alerts": [{"title": "File changed", "detail": "/etc/sudoers.d/90-cloud-init-users modified"}]}),
        );
        let signals = extract_from_snapshot(&snapshot);
        assert_eq!(signals[0].code, SignalCode::ConfigTamper);
        assert_eq!(signals[0].severity, Severity::Critical);

        let actions = build_actions(&signals, &RemediationContext::default());
        assert_eq!(actions[0].id, LOCKDOWN_ACCESS_SURFACE);
        assert_eq!(actions[0].priority, Priority::P0);
        assert_eq!(actions[0].confirm_phrase, "EXECUTE lockdown-access-surface");
        assert!(actions[0].requires_confirm);
    }

    #[test]
    fn groups_follow_catalog_order() {
        let signals = vec![
            sig(SignalCode::PackageDrift),
            sig(SignalCode::SshFailedPassword),
            sig(SignalCode::UnexpectedPublicPorts),
            sig(SignalCode::AccountDrift),
        ];
        let ids: Vec<String> = build_actions(&signals, &RemediationContext::default())
            .into_iter()
            .map(|a| a.id)
            .collect();
        assert_eq!(
            ids,
            vec![
                LOCKDOWN_ACCESS_SURFACE,
                QUARANTINE_UNEXPECTED_PORTS,
                HARDEN_SSH_AUTH,
                VERIFY_CONFIG_DRIFT
            ]
        );
    }

    #[test]
    fn fallback_is_single_forensics_action() {
        let actions = build_actions(&[], &RemediationContext::default());
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].id, COLLECT_FORENSICS);
        assert_eq!(actions[0].auto_tier, AutoTier::Observe);
    }

    #[test]
    fn quarantine_renders_concrete_ports() {
        let snapshots = vec![
            Snapshot::new(
                "h",
                Utc::now() - chrono::Duration::hours(2),
                json!({"ports": {"unexpected": [{"port": 21, "proto": "tcp"}]}}),
            ),
            Snapshot::new(
                "h",
                Utc::now(),
                json!({"ports": {"unexpected": [
                    {"port": 6379, "proto": "tcp", "proc": "redis"},
                    {"port": 6379, "proto": "tcp"},
                    {"port": 5353, "proto": "udp"}
                ]}}),
            ),
        ];
        let ctx = RemediationContext::from_snapshots(&snapshots);
        assert_eq!(ctx.unexpected_ports.len(), 2);

        let actions = build_actions(&[sig(SignalCode::UnexpectedPublicPorts)], &ctx);
        let q = find_action(&actions, QUARANTINE_UNEXPECTED_PORTS).unwrap();
        assert!(q.commands.contains(&"sudo ufw deny 6379/tcp".to_string()));
        assert!(q.commands.contains(&"sudo ufw deny 5353/udp".to_string()));
        assert!(!q.commands.iter().any(|c| c.contains("21/tcp")));
        assert_eq!(q.rollback_commands.len(), 2);
    }

    #[test]
    fn quarantine_without_context_has_todo_placeholder() {
        let actions = build_actions(
            &[sig(SignalCode::UnexpectedPublicPorts)],
            &RemediationContext::default(),
        );
        let q = find_action(&actions, QUARANTINE_UNEXPECTED_PORTS).unwrap();
        assert!(q.commands.iter().any(|c| c.starts_with('#') && c.contains("TODO")));
        assert!(q.rollback_commands.is_empty());
    }

    #[test]
    fn every_catalog_action_passes_default_guard() {
        let ctx = RemediationContext {
            unexpected_ports: vec![PortEntry {
                port: 8080,
                proto: "tcp".into(),
                process: None,
                address: None,
            }],
        };
        let all: Vec<IncidentSignal> = SignalCode::all().iter().map(|c| sig(*c)).collect();
        let mut actions = build_actions(&all, &ctx);
        actions.extend(build_actions(&[], &ctx));
        let policy = GuardPolicy::default();
        for action in &actions {
            let issues = validate_action_lists(
                &action.commands,
                &action.canary_checks,
                &action.rollback_commands,
                &policy,
            );
            assert!(issues.is_empty(), "{}: {issues:?}", action.id);
        }
    }

    #[test]
    fn lockdown_rollback_restores_saved_firewall_state() {
        let actions = build_actions(&[sig(SignalCode::ConfigTamper)], &RemediationContext::default());
        let lockdown = find_action(&actions, LOCKDOWN_ACCESS_SURFACE).unwrap();

        let backup = lockdown
            .commands
            .iter()
            .position(|c| c.contains("user.rules.warden-bak"))
            .unwrap();
        let deny = lockdown
            .commands
            .iter()
            .position(|c| c == "sudo ufw default deny incoming")
            .unwrap();
        assert!(backup < deny, "state must be saved before it changes");

        assert!(lockdown
            .rollback_commands
            .iter()
            .any(|c| c.ends_with("warden-bak /etc/ufw/user.rules")));
        assert_eq!(lockdown.rollback_commands.last().unwrap(), "sudo ufw reload");
    }

    #[test]
    fn no_rollback_opens_the_firewall() {
        let ctx = RemediationContext {
            unexpected_ports: vec![PortEntry {
                port: 8080,
                proto: "tcp".into(),
                process: None,
                address: None,
            }],
        };
        let all: Vec<IncidentSignal> = SignalCode::all().iter().map(|c| sig(*c)).collect();
        for action in build_actions(&all, &ctx) {
            for command in &action.rollback_commands {
                assert!(!command.contains("default allow"), "{}: {command}", action.id);
                assert!(!command.starts_with("sudo ufw allow"), "{}: {command}", action.id);
            }
        }
    }
}
