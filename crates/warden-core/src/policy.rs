//! Remediation policy resolution.
//!
//! Every evaluation resolves one `ResolvedPolicy` per host in three layers:
//! the configured base (file + environment), then the named profile, then
//! the host's own overrides. Guard settings a profile mandates (strict's
//! allowlist) are reapplied over the host layer, and numeric fields are
//! clamped after every layer has been applied.

use crate::config::WardenConfig;
use crate::error::WardenError;
use crate::guard::GuardPolicy;
use crate::host::HostConfig;
use crate::types::{AutoTier, Risk};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

// ---------------------------------------------------------------------------
// RemediationPolicy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemediationPolicy {
    pub dry_run_window_minutes: u32,
    pub execute_cooldown_minutes: u32,
    pub max_executes_per_hour: u32,
    pub max_queued_per_host: u32,
    pub max_queued_global: u32,
    pub queue_ttl_minutes: u32,
    pub retry_max_attempts: u32,
    pub retry_backoff_base_secs: u64,
    pub retry_backoff_max_secs: u64,
    pub command_timeout_secs: u64,
    pub output_buffer_bytes: u64,
    pub autonomous_enabled: bool,
    pub autonomous_max_tier: AutoTier,
    pub autonomous_max_per_cycle: u32,
    pub autonomous_max_per_hour: u32,
    pub approval_risk_threshold: Risk,
    pub canary_rollout_percent: u32,
    pub require_canary_checks: bool,
    pub auto_rollback: bool,
    pub queue_auto_drain: bool,
}

impl Default for RemediationPolicy {
    fn default() -> Self {
        Self {
            dry_run_window_minutes: 30,
            execute_cooldown_minutes: 15,
            max_executes_per_hour: 6,
            max_queued_per_host: 5,
            max_queued_global: 50,
            queue_ttl_minutes: 120,
            retry_max_attempts: 3,
            retry_backoff_base_secs: 30,
            retry_backoff_max_secs: 900,
            command_timeout_secs: 60,
            output_buffer_bytes: 64 * 1024,
            autonomous_enabled: false,
            autonomous_max_tier: AutoTier::SafeAuto,
            autonomous_max_per_cycle: 2,
            autonomous_max_per_hour: 6,
            approval_risk_threshold: Risk::High,
            canary_rollout_percent: 25,
            require_canary_checks: false,
            auto_rollback: true,
            queue_auto_drain: true,
        }
    }
}

fn clamp_field<T>(name: &str, value: &mut T, lo: T, hi: T, notes: &mut Vec<String>)
where
    T: PartialOrd + Copy + fmt::Display,
{
    let clamped = if *value < lo {
        lo
    } else if *value > hi {
        hi
    } else {
        return;
    };
    warn!(field = name, value = %value, clamped = %clamped, "policy value out of range");
    notes.push(format!("{name}={value} clamped to {clamped}"));
    *value = clamped;
}

impl RemediationPolicy {
    /// Clamp every numeric field into its fixed bounds. Returns one note per
    /// adjusted field.
    pub fn clamp(&mut self) -> Vec<String> {
        let mut notes = Vec::new();
        let n = &mut notes;
        clamp_field("dry_run_window_minutes", &mut self.dry_run_window_minutes, 1, 1_440, n);
        clamp_field("execute_cooldown_minutes", &mut self.execute_cooldown_minutes, 0, 1_440, n);
        clamp_field("max_executes_per_hour", &mut self.max_executes_per_hour, 1, 120, n);
        clamp_field("max_queued_per_host", &mut self.max_queued_per_host, 1, 100, n);
        clamp_field("max_queued_global", &mut self.max_queued_global, 1, 5_000, n);
        clamp_field("queue_ttl_minutes", &mut self.queue_ttl_minutes, 5, 10_080, n);
        clamp_field("retry_max_attempts", &mut self.retry_max_attempts, 1, 10, n);
        clamp_field("retry_backoff_base_secs", &mut self.retry_backoff_base_secs, 1, 3_600, n);
        clamp_field("retry_backoff_max_secs", &mut self.retry_backoff_max_secs, 1, 86_400, n);
        clamp_field("command_timeout_secs", &mut self.command_timeout_secs, 1, 3_600, n);
        clamp_field("output_buffer_bytes", &mut self.output_buffer_bytes, 1_024, 4 * 1024 * 1024, n);
        clamp_field("autonomous_max_per_cycle", &mut self.autonomous_max_per_cycle, 0, 50, n);
        clamp_field("autonomous_max_per_hour", &mut self.autonomous_max_per_hour, 0, 500, n);
        clamp_field("canary_rollout_percent", &mut self.canary_rollout_percent, 0, 100, n);
        notes
    }

    /// Delay before retry number `attempt` (1-based):
    /// `min(max, base * 2^(attempt - 1))`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(62);
        let secs = self
            .retry_backoff_base_secs
            .saturating_mul(1u64 << exp)
            .min(self.retry_backoff_max_secs);
        Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX))
    }
}

// ---------------------------------------------------------------------------
// Overrides
// ---------------------------------------------------------------------------

/// Field-by-field overrides. `None` falls through to the layer below.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dry_run_window_minutes: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execute_cooldown_minutes: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_executes_per_hour: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_queued_per_host: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_queued_global: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_ttl_minutes: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_max_attempts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_backoff_base_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_backoff_max_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_timeout_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_buffer_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub autonomous_enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub autonomous_max_tier: Option<AutoTier>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub autonomous_max_per_cycle: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub autonomous_max_per_hour: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_risk_threshold: Option<Risk>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub canary_rollout_percent: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub require_canary_checks: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_rollback: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_auto_drain: Option<bool>,
}

macro_rules! overlay {
    ($src:expr, $dst:expr; $($field:ident),+ $(,)?) => {
        $(
            if let Some(v) = $src.$field.clone() {
                $dst.$field = v;
            }
        )+
    };
}

macro_rules! overlay_opt {
    ($src:expr, $dst:expr; $($field:ident),+ $(,)?) => {
        $(
            if $src.$field.is_some() {
                $dst.$field = $src.$field.clone();
            }
        )+
    };
}

macro_rules! refresh {
    ($src:expr, $dst:expr; $($field:ident),+ $(,)?) => {
        $(
            if $dst.$field.is_some() {
                $dst.$field = Some($src.$field.clone());
            }
        )+
    };
}

impl PolicyOverrides {
    pub fn apply(&self, policy: &mut RemediationPolicy) {
        overlay!(self, policy;
            dry_run_window_minutes, execute_cooldown_minutes, max_executes_per_hour,
            max_queued_per_host, max_queued_global, queue_ttl_minutes, retry_max_attempts,
            retry_backoff_base_secs, retry_backoff_max_secs, command_timeout_secs,
            output_buffer_bytes, autonomous_enabled, autonomous_max_tier,
            autonomous_max_per_cycle, autonomous_max_per_hour, approval_risk_threshold,
            canary_rollout_percent, require_canary_checks, auto_rollback, queue_auto_drain,
        );
    }

    /// Fields set in `patch` replace ours; unset fields are kept.
    pub fn merge(&mut self, patch: &PolicyOverrides) {
        overlay_opt!(patch, self;
            dry_run_window_minutes, execute_cooldown_minutes, max_executes_per_hour,
            max_queued_per_host, max_queued_global, queue_ttl_minutes, retry_max_attempts,
            retry_backoff_base_secs, retry_backoff_max_secs, command_timeout_secs,
            output_buffer_bytes, autonomous_enabled, autonomous_max_tier,
            autonomous_max_per_cycle, autonomous_max_per_hour, approval_risk_threshold,
            canary_rollout_percent, require_canary_checks, auto_rollback, queue_auto_drain,
        );
    }

    /// Clamp the fields that are set into the same bounds the resolved
    /// policy uses.
    pub fn clamp(&mut self) -> Vec<String> {
        let mut scratch = RemediationPolicy::default();
        self.apply(&mut scratch);
        let notes = scratch.clamp();
        if !notes.is_empty() {
            refresh!(scratch, self;
                dry_run_window_minutes, execute_cooldown_minutes, max_executes_per_hour,
                max_queued_per_host, max_queued_global, queue_ttl_minutes, retry_max_attempts,
                retry_backoff_base_secs, retry_backoff_max_secs, command_timeout_secs,
                output_buffer_bytes, autonomous_max_per_cycle, autonomous_max_per_hour,
                canary_rollout_percent,
            );
        }
        notes
    }

    pub fn is_empty(&self) -> bool {
        *self == PolicyOverrides::default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enforce_allowlist: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_commands_per_action: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_command_length: Option<u32>,
    /// Replaces the allowlist wholesale.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowlist: Option<Vec<String>>,
    /// Replaces the blocklist wholesale.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocklist: Option<Vec<String>>,
}

impl GuardOverrides {
    pub fn apply(&self, guard: &mut GuardPolicy) {
        overlay!(self, guard;
            enforce_allowlist, max_commands_per_action, max_command_length, allowlist, blocklist,
        );
    }

    pub fn merge(&mut self, patch: &GuardOverrides) {
        overlay_opt!(patch, self;
            enforce_allowlist, max_commands_per_action, max_command_length, allowlist, blocklist,
        );
    }

    pub fn clamp(&mut self) -> Vec<String> {
        let mut scratch = GuardPolicy::default();
        self.apply(&mut scratch);
        let notes = clamp_guard(&mut scratch);
        if !notes.is_empty() {
            refresh!(scratch, self; max_commands_per_action, max_command_length);
        }
        notes
    }

    pub fn is_empty(&self) -> bool {
        *self == GuardOverrides::default()
    }
}

pub fn clamp_guard(guard: &mut GuardPolicy) -> Vec<String> {
    let mut notes = Vec::new();
    clamp_field("max_commands_per_action", &mut guard.max_commands_per_action, 1, 50, &mut notes);
    clamp_field("max_command_length", &mut guard.max_command_length, 16, 4_096, &mut notes);
    notes
}

// ---------------------------------------------------------------------------
// PolicyProfile
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyProfile {
    Strict,
    #[default]
    Balanced,
    Rapid,
}

impl PolicyProfile {
    pub fn all() -> &'static [PolicyProfile] {
        &[PolicyProfile::Strict, PolicyProfile::Balanced, PolicyProfile::Rapid]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PolicyProfile::Strict => "strict",
            PolicyProfile::Balanced => "balanced",
            PolicyProfile::Rapid => "rapid",
        }
    }

    pub fn overrides(self) -> (PolicyOverrides, GuardOverrides) {
        match self {
            PolicyProfile::Strict => (
                PolicyOverrides {
                    dry_run_window_minutes: Some(15),
                    execute_cooldown_minutes: Some(30),
                    max_executes_per_hour: Some(2),
                    max_queued_per_host: Some(2),
                    max_queued_global: Some(20),
                    retry_max_attempts: Some(2),
                    command_timeout_secs: Some(30),
                    output_buffer_bytes: Some(16 * 1024),
                    autonomous_max_per_cycle: Some(1),
                    autonomous_max_per_hour: Some(2),
                    approval_risk_threshold: Some(Risk::Medium),
                    require_canary_checks: Some(true),
                    queue_auto_drain: Some(false),
                    ..Default::default()
                },
                GuardOverrides {
                    enforce_allowlist: Some(true),
                    max_commands_per_action: Some(8),
                    ..Default::default()
                },
            ),
            PolicyProfile::Balanced => (PolicyOverrides::default(), GuardOverrides::default()),
            PolicyProfile::Rapid => (
                PolicyOverrides {
                    dry_run_window_minutes: Some(60),
                    execute_cooldown_minutes: Some(5),
                    max_executes_per_hour: Some(20),
                    max_queued_per_host: Some(10),
                    max_queued_global: Some(200),
                    retry_max_attempts: Some(5),
                    command_timeout_secs: Some(180),
                    output_buffer_bytes: Some(256 * 1024),
                    autonomous_max_per_cycle: Some(5),
                    autonomous_max_per_hour: Some(20),
                    ..Default::default()
                },
                GuardOverrides {
                    max_commands_per_action: Some(20),
                    max_command_length: Some(1_024),
                    ..Default::default()
                },
            ),
        }
    }
}

impl PolicyProfile {
    /// Guard settings the profile holds against host overrides.
    pub fn mandated_guard(self) -> GuardOverrides {
        match self {
            PolicyProfile::Strict => GuardOverrides {
                enforce_allowlist: Some(true),
                ..Default::default()
            },
            PolicyProfile::Balanced | PolicyProfile::Rapid => GuardOverrides::default(),
        }
    }
}

impl fmt::Display for PolicyProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PolicyProfile {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(PolicyProfile::Strict),
            "balanced" => Ok(PolicyProfile::Balanced),
            "rapid" => Ok(PolicyProfile::Rapid),
            other => Err(WardenError::InvalidValue(format!(
                "unknown profile '{other}': must be strict, balanced, or rapid"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedPolicy {
    pub profile: PolicyProfile,
    pub remediation: RemediationPolicy,
    pub guard: GuardPolicy,
    /// Fields that had to be clamped into range or were held by the profile.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub adjustments: Vec<String>,
}

pub fn resolve(config: &WardenConfig, host: &HostConfig) -> ResolvedPolicy {
    let profile = host.profile.unwrap_or(config.default_profile);
    let mut remediation = config.remediation.clone();
    let mut guard = config.guard.clone();

    let (profile_policy, profile_guard) = profile.overrides();
    profile_policy.apply(&mut remediation);
    profile_guard.apply(&mut guard);

    host.policy.apply(&mut remediation);
    host.guard.apply(&mut guard);

    let mut adjustments = Vec::new();
    let mandated = profile.mandated_guard();
    if mandated.enforce_allowlist == Some(true) && !guard.enforce_allowlist {
        adjustments.push(format!(
            "enforce_allowlist: host override ignored, the {profile} profile requires the allowlist"
        ));
    }
    mandated.apply(&mut guard);

    adjustments.extend(remediation.clamp());
    adjustments.extend(clamp_guard(&mut guard));

    ResolvedPolicy {
        profile,
        remediation,
        guard,
        adjustments,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
