//! Monitored hosts and their typed, versioned configuration record.

use crate::error::{Result, WardenError};
use crate::fleet::{FleetMembership, FleetScope};
use crate::policy::{GuardOverrides, PolicyOverrides, PolicyProfile};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::sync::OnceLock;
use tracing::warn;

pub const HOST_CONFIG_VERSION: u32 = 1;

fn host_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[a-z0-9]([a-z0-9._-]*[a-z0-9])?$").expect("static regex is valid")
    })
}

/// Host ids are lowercase, start and end alphanumeric, and may contain
/// `.`, `_` and `-` in between.
pub fn validate_host_id(id: &str) -> Result<()> {
    if id.is_empty() || id.len() > 64 || !host_id_re().is_match(id) {
        return Err(WardenError::InvalidValue(format!(
            "invalid host id '{id}': use lowercase letters, digits, '.', '_' or '-'"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// HostConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostConfig {
    #[serde(default = "default_host_config_version")]
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<PolicyProfile>,
    #[serde(default, skip_serializing_if = "PolicyOverrides::is_empty")]
    pub policy: PolicyOverrides,
    #[serde(default, skip_serializing_if = "GuardOverrides::is_empty")]
    pub guard: GuardOverrides,
    #[serde(default)]
    pub fleet: FleetMembership,
}

fn default_host_config_version() -> u32 {
    HOST_CONFIG_VERSION
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            version: HOST_CONFIG_VERSION,
            profile: None,
            policy: PolicyOverrides::default(),
            guard: GuardOverrides::default(),
            fleet: FleetMembership::default(),
        }
    }
}

impl HostConfig {
    /// Lenient read: each section is parsed on its own and dropped when
    /// malformed, then set values are clamped. Returns the notes describing
    /// anything that was dropped or adjusted.
    pub fn from_value(value: &Value) -> (HostConfig, Vec<String>) {
        let mut notes = Vec::new();
        let mut config = HostConfig::default();
        let Some(obj) = value.as_object() else {
            if !value.is_null() {
                notes.push("host config is not an object; using defaults".to_string());
            }
            return (config, notes);
        };

        if let Some(p) = obj.get("profile").filter(|v| !v.is_null()) {
            match p.as_str().map(str::parse::<PolicyProfile>) {
                Some(Ok(profile)) => config.profile = Some(profile),
                _ => notes.push(format!("ignoring unknown profile {p}")),
            }
        }
        section(obj, "policy", &mut config.policy, &mut notes);
        section(obj, "guard", &mut config.guard, &mut notes);
        section(obj, "fleet", &mut config.fleet, &mut notes);

        notes.extend(config.policy.clamp());
        notes.extend(config.guard.clamp());
        config.version = HOST_CONFIG_VERSION;
        (config, notes)
    }

    /// Apply a patch and return the merged record.
    pub fn merge(&self, patch: &HostConfigPatch) -> HostConfig {
        let mut next = self.clone();
        if patch.clear_profile {
            next.profile = None;
        }
        if let Some(profile) = patch.profile {
            next.profile = Some(profile);
        }
        if patch.reset_overrides {
            next.policy = PolicyOverrides::default();
            next.guard = GuardOverrides::default();
        }
        next.policy.merge(&patch.policy);
        next.guard.merge(&patch.guard);

        let fleet = &patch.fleet;
        if fleet.clear_group {
            next.fleet.group = None;
        }
        if let Some(group) = &fleet.group {
            next.fleet.group = Some(group.clone());
        }
        if let Some(tags) = &fleet.tags {
            next.fleet.tags = tags.clone();
        }
        if let Some(scope) = fleet.scope {
            next.fleet.scope = scope;
        }
        if let Some(paused) = fleet.rollout_paused {
            next.fleet.rollout_paused = paused;
        }

        next.policy.clamp();
        next.guard.clamp();
        next.version = HOST_CONFIG_VERSION;
        next
    }
}

fn section<T: serde::de::DeserializeOwned>(
    obj: &serde_json::Map<String, Value>,
    key: &str,
    slot: &mut T,
    notes: &mut Vec<String>,
) {
    let Some(v) = obj.get(key).filter(|v| !v.is_null()) else {
        return;
    };
    match serde_json::from_value::<T>(v.clone()) {
        Ok(parsed) => *slot = parsed,
        Err(e) => notes.push(format!("ignoring malformed '{key}' section: {e}")),
    }
}

fn deserialize_lenient<'de, D>(deserializer: D) -> std::result::Result<HostConfig, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    let (config, notes) = HostConfig::from_value(&value);
    for note in notes {
        warn!(note = %note, "host config adjusted on read");
    }
    Ok(config)
}

// ---------------------------------------------------------------------------
// HostConfigPatch
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetPatch {
    pub group: Option<String>,
    pub clear_group: bool,
    pub tags: Option<Vec<String>>,
    pub scope: Option<FleetScope>,
    pub rollout_paused: Option<bool>,
}

/// Explicit partial update for a host's configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfigPatch {
    pub profile: Option<PolicyProfile>,
    pub clear_profile: bool,
    /// Drop every policy and guard override before applying this patch.
    pub reset_overrides: bool,
    pub policy: PolicyOverrides,
    pub guard: GuardOverrides,
    pub fleet: FleetPatch,
}

// ---------------------------------------------------------------------------
// Host
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    #[serde(default, deserialize_with = "deserialize_lenient")]
    pub config: HostConfig,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen_at: Option<DateTime<Utc>>,
}

impl Host {
    pub fn new(id: impl Into<String>, name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            enabled: true,
            config: HostConfig::default(),
            created_at: now,
            last_seen_at: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AutoTier;
    use serde_json::json;

    #[test]
    fn host_id_validation() {
        for ok in ["web-1", "db.eu-west", "a", "node_07"] {
            validate_host_id(ok).unwrap_or_else(|_| panic!("expected valid: {ok}"));
        }
        for bad in ["", "-web", "web-", "Web", "has space", "a/b"] {
            assert!(validate_host_id(bad).is_err(), "expected invalid: {bad}");
        }
    }

    #[test]
    fn lenient_read_drops_bad_sections() {
        let (config, notes) = HostConfig::from_value(&json!({
            "profile": "turbo",
            "policy": {"canary_rollout_percent": 300, "auto_rollback": false},
            "guard": "not an object",
            "fleet": {"group": "web", "tags": ["edge"]}
        }));
        assert_eq!(config.profile, None);
        assert_eq!(config.policy.canary_rollout_percent, Some(100));
        assert_eq!(config.policy.auto_rollback, Some(false));
        assert_eq!(config.guard, GuardOverrides::default());
        assert_eq!(config.fleet.group.as_deref(), Some("web"));
        assert_eq!(notes.len(), 3, "{notes:?}");
    }

    #[test]
    fn host_json_with_legacy_config_still_loads() {
        let host: Host = serde_json::from_value(json!({
            "id": "web-1",
            "name": "Web 1",
            "enabled": true,
            "created_at": "2026-01-01T00:00:00Z",
            "config": {"profile": "strict", "policy": {"retry_max_attempts": "three"}}
        }))
        .unwrap();
        assert_eq!(host.config.profile, Some(PolicyProfile::Strict));
        assert!(host.config.policy.is_empty());
        assert_eq!(host.config.version, HOST_CONFIG_VERSION);

        let bare: Host = serde_json::from_value(json!({
            "id": "web-2",
            "name": "Web 2",
            "enabled": false,
            "created_at": "2026-01-01T00:00:00Z"
        }))
        .unwrap();
        assert_eq!(bare.config, HostConfig::default());
    }

    #[test]
    fn merge_patches_field_by_field() {
        let base = HostConfig {
            profile: Some(PolicyProfile::Strict),
            policy: PolicyOverrides {
                command_timeout_secs: Some(20),
                ..Default::default()
            },
            fleet: FleetMembership {
                group: Some("db".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        let patch = HostConfigPatch {
            policy: PolicyOverrides {
                autonomous_enabled: Some(true),
                autonomous_max_tier: Some(AutoTier::GuardedAuto),
                ..Default::default()
            },
            fleet: FleetPatch {
                rollout_paused: Some(true),
                ..Default::default()
            },
            ..Default::default()
        };
        let merged = base.merge(&patch);
        assert_eq!(merged.profile, Some(PolicyProfile::Strict));
        assert_eq!(merged.policy.command_timeout_secs, Some(20));
        assert_eq!(merged.policy.autonomous_enabled, Some(true));
        assert_eq!(merged.fleet.group.as_deref(), Some("db"));
        assert!(merged.fleet.rollout_paused);

        let cleared = merged.merge(&HostConfigPatch {
            clear_profile: true,
            reset_overrides: true,
            ..Default::default()
        });
        assert_eq!(cleared.profile, None);
        assert!(cleared.policy.is_empty());
    }
}
