//! Containment kit: a plain-text runbook assembled from a host's posture and
//! ranked actions. Nothing here executes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

use crate::catalog::{RemediationAction, RemediationContext};
use crate::posture::{ContainmentStage, PostureBand, SecurityPosture};
use crate::types::{Priority, Risk};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KitProfile {
    Critical,
    Elevated,
    Standard,
}

impl KitProfile {
    pub fn for_posture(posture: &SecurityPosture) -> Self {
        if posture.stage == ContainmentStage::Lockdown || posture.band == PostureBand::Critical {
            KitProfile::Critical
        } else if posture.stage == ContainmentStage::Contain || posture.band == PostureBand::Elevated {
            KitProfile::Elevated
        } else {
            KitProfile::Standard
        }
    }

    /// How many ranked actions the kit carries.
    pub fn action_limit(self) -> usize {
        match self {
            KitProfile::Critical => 4,
            KitProfile::Elevated => 3,
            KitProfile::Standard => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            KitProfile::Critical => "critical",
            KitProfile::Elevated => "elevated",
            KitProfile::Standard => "standard",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KitSectionKind {
    Triage,
    Contain,
    Verify,
    Recover,
}

impl KitSectionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            KitSectionKind::Triage => "triage",
            KitSectionKind::Contain => "contain",
            KitSectionKind::Verify => "verify",
            KitSectionKind::Recover => "recover",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KitSection {
    pub kind: KitSectionKind,
    pub commands: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KitAction {
    pub id: String,
    pub title: String,
    pub priority: Priority,
    pub risk: Risk,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainmentKit {
    pub host_id: String,
    pub generated_at: DateTime<Utc>,
    pub profile: KitProfile,
    pub score: u32,
    pub band: PostureBand,
    pub stage: ContainmentStage,
    pub next_move: String,
    pub actions: Vec<KitAction>,
    pub sections: Vec<KitSection>,
    pub deny_rules: Vec<String>,
}

const TRIAGE_BASELINE: &[&str] = &[
    "sudo ss -tulpn",
    "sudo last -n 20",
    "sudo journalctl --since -1h --no-pager -n 200",
];

const TRIAGE_CRITICAL: &[&str] = &["sudo ps auxww", "sudo ls -la /etc/sudoers.d /etc/ssh"];

/// Highest priority first, then riskier first, then by title.
pub fn rank_actions(actions: &[RemediationAction]) -> Vec<&RemediationAction> {
    let mut ranked: Vec<&RemediationAction> = actions.iter().collect();
    ranked.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then(b.risk.cmp(&a.risk))
            .then_with(|| a.title.cmp(&b.title))
    });
    ranked
}

fn push_unique(out: &mut Vec<String>, command: &str) {
    if !out.iter().any(|c| c == command) {
        out.push(command.to_string());
    }
}

pub fn build_kit(
    host_id: &str,
    posture: &SecurityPosture,
    actions: &[RemediationAction],
    context: &RemediationContext,
    now: DateTime<Utc>,
) -> ContainmentKit {
    let profile = KitProfile::for_posture(posture);
    let selected: Vec<&RemediationAction> = rank_actions(actions)
        .into_iter()
        .take(profile.action_limit())
        .collect();

    let mut triage: Vec<String> = TRIAGE_BASELINE.iter().map(|s| s.to_string()).collect();
    if profile == KitProfile::Critical {
        triage.extend(TRIAGE_CRITICAL.iter().map(|s| s.to_string()));
    }

    let mut contain = Vec::new();
    let mut verify = Vec::new();
    let mut recover = Vec::new();
    for action in &selected {
        contain.push(format!("# {} ({})", action.title, action.id));
        for command in &action.commands {
            push_unique(&mut contain, command);
        }
        for check in &action.canary_checks {
            push_unique(&mut verify, check);
        }
        if let Some(notes) = &action.rollback_notes {
            recover.push(format!("# {}: {notes}", action.id));
        }
        for command in &action.rollback_commands {
            push_unique(&mut recover, command);
        }
    }
    if verify.is_empty() {
        verify.push("sudo ufw status verbose".to_string());
    }
    if recover.is_empty() {
        recover.push("# no automated rollback for the selected actions".to_string());
    }

    let deny_rules = context
        .unexpected_ports
        .iter()
        .map(|p| format!("sudo ufw deny {}/{}", p.port, p.proto))
        .collect();

    ContainmentKit {
        host_id: host_id.to_string(),
        generated_at: now,
        profile,
        score: posture.score,
        band: posture.band,
        stage: posture.stage,
        next_move: posture.next_move.clone(),
        actions: selected
            .iter()
            .map(|a| KitAction {
                id: a.id.clone(),
                title: a.title.clone(),
                priority: a.priority,
                risk: a.risk,
            })
            .collect(),
        sections: vec![
            KitSection {
                kind: KitSectionKind::Triage,
                commands: triage,
            },
            KitSection {
                kind: KitSectionKind::Contain,
                commands: contain,
            },
            KitSection {
                kind: KitSectionKind::Verify,
                commands: verify,
            },
            KitSection {
                kind: KitSectionKind::Recover,
                commands: recover,
            },
        ],
        deny_rules,
    }
}

pub fn render_text(kit: &ContainmentKit) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Containment kit: {} ({})", kit.host_id, kit.profile.as_str());
    let _ = writeln!(out, "# generated {}", kit.generated_at.to_rfc3339());
    let _ = writeln!(
        out,
        "# posture {} / band {} / stage {}",
        kit.score,
        kit.band.as_str(),
        kit.stage.as_str()
    );
    let _ = writeln!(out, "# next move: {}", kit.next_move);
    for action in &kit.actions {
        let _ = writeln!(
            out,
            "#   [{}] {} (risk {}) {}",
            action.priority.as_str(),
            action.id,
            action.risk.as_str(),
            action.title
        );
    }

    for section in &kit.sections {
        let _ = writeln!(out, "\n## {}", section.kind.as_str());
        for command in &section.commands {
            let _ = writeln!(out, "{command}");
        }
    }

    if !kit.deny_rules.is_empty() {
        let _ = writeln!(out, "\n## deny rules");
        for rule in &kit.deny_rules {
            let _ = writeln!(out, "{rule}");
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{build_actions, HARDEN_SSH_AUTH, LOCKDOWN_ACCESS_SURFACE, QUARANTINE_UNEXPECTED_PORTS};
    use crate::posture::{score_posture, HeartbeatState};
    use crate::signals::IncidentSignal;
    use crate::snapshot::PortEntry;
    use crate::types::{Severity, SignalCode, SignalSource};

    fn signals(codes: &[(SignalCode, Severity)]) -> Vec<IncidentSignal> {
        codes
            .iter()
            .map(|(code, severity)| IncidentSignal {
                code: *code,
                severity: *severity,
                title: code.as_str().into(),
                detail: None,
                timestamp: Utc::now(),
                snapshot_id: None,
                source: SignalSource::Alert,
            })
            .collect()
    }

    #[test]
    fn ranking_orders_by_priority_then_risk_then_title() {
        let sigs = signals(&[
            (SignalCode::PackageDrift, Severity::Low),
            (SignalCode::SshFailedPassword, Severity::High),
            (SignalCode::UnexpectedPublicPorts, Severity::High),
            (SignalCode::ConfigTamper, Severity::Critical),
        ]);
        let actions = build_actions(&sigs, &RemediationContext::default());
        let ids: Vec<&str> = rank_actions(&actions).iter().map(|a| a.id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                LOCKDOWN_ACCESS_SURFACE,
                QUARANTINE_UNEXPECTED_PORTS,
                HARDEN_SSH_AUTH,
                "verify-config-drift"
            ]
        );
    }

    #[test]
    fn lockdown_posture_gets_critical_kit_with_deny_rules() {
        let now = Utc::now();
        let sigs = signals(&[
            (SignalCode::ConfigTamper, Severity::Critical),
            (SignalCode::UnexpectedPublicPorts, Severity::High),
        ]);
        let posture = score_posture(&sigs, HeartbeatState::Fresh, now);
        let ctx = RemediationContext {
            unexpected_ports: vec![PortEntry {
                port: 6379,
                proto: "tcp".into(),
                process: Some("redis".into()),
                address: None,
            }],
        };
        let actions = build_actions(&sigs, &ctx);
        let kit = build_kit("web-1", &posture, &actions, &ctx, now);

        assert_eq!(kit.profile, KitProfile::Critical);
        assert_eq!(kit.actions.len(), 2);
        assert_eq!(kit.deny_rules, vec!["sudo ufw deny 6379/tcp"]);
        let kinds: Vec<KitSectionKind> = kit.sections.iter().map(|s| s.kind).collect();
        assert_eq!(
            kinds,
            vec![
                KitSectionKind::Triage,
                KitSectionKind::Contain,
                KitSectionKind::Verify,
                KitSectionKind::Recover
            ]
        );

        let text = render_text(&kit);
        assert!(text.contains("## triage"));
        assert!(text.contains("## deny rules"));
        assert!(text.contains("sudo ufw delete deny 6379/tcp"));
    }

    #[test]
    fn quiet_host_gets_standard_kit() {
        let now = Utc::now();
        let posture = score_posture(&[], HeartbeatState::Fresh, now);
        let actions = build_actions(&[], &RemediationContext::default());
        let kit = build_kit("web-1", &posture, &actions, &RemediationContext::default(), now);
        assert_eq!(kit.profile, KitProfile::Standard);
        assert_eq!(kit.actions.len(), 1);
        assert!(kit.deny_rules.is_empty());
    }
}
