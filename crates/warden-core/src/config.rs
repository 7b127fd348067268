use crate::error::{Result, WardenError};
use crate::fleet::FleetPolicy;
use crate::guard::GuardPolicy;
use crate::policy::{clamp_guard, PolicyProfile, RemediationPolicy};
use crate::timeline::DEFAULT_DEDUPE_WINDOW_MINUTES;
use crate::types::{AutoTier, Risk};
use crate::paths;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

impl ConfigWarning {
    fn warning(message: impl Into<String>) -> Self {
        Self {
            level: WarnLevel::Warning,
            message: message.into(),
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            level: WarnLevel::Error,
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// WardenConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WardenConfig {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub default_profile: PolicyProfile,
    #[serde(default = "default_dedupe_window")]
    pub dedupe_window_minutes: u32,
    /// How many recent snapshots feed each timeline/posture evaluation.
    #[serde(default = "default_snapshot_lookback")]
    pub snapshot_lookback: usize,
    #[serde(default = "default_heartbeat_delayed")]
    pub heartbeat_delayed_minutes: u32,
    #[serde(default = "default_heartbeat_stale")]
    pub heartbeat_stale_minutes: u32,
    /// Finished runs and audit entries older than this are pruned.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default)]
    pub remediation: RemediationPolicy,
    #[serde(default)]
    pub guard: GuardPolicy,
    #[serde(default)]
    pub fleet: FleetPolicy,
}

fn default_version() -> u32 {
    1
}

fn default_dedupe_window() -> u32 {
    DEFAULT_DEDUPE_WINDOW_MINUTES
}

fn default_snapshot_lookback() -> usize {
    50
}

fn default_heartbeat_delayed() -> u32 {
    10
}

fn default_heartbeat_stale() -> u32 {
    60
}

fn default_retention_days() -> u32 {
    30
}

impl Default for WardenConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            default_profile: PolicyProfile::default(),
            dedupe_window_minutes: default_dedupe_window(),
            snapshot_lookback: default_snapshot_lookback(),
            heartbeat_delayed_minutes: default_heartbeat_delayed(),
            heartbeat_stale_minutes: default_heartbeat_stale(),
            retention_days: default_retention_days(),
            remediation: RemediationPolicy::default(),
            guard: GuardPolicy::default(),
            fleet: FleetPolicy::default(),
        }
    }
}

impl WardenConfig {
    /// Load `.warden/config.yaml`. A missing file inside an initialized
    /// root yields the defaults.
    pub fn load(root: &Path) -> Result<Self> {
        if !paths::is_initialized(root) {
            return Err(WardenError::NotInitialized);
        }
        let path = paths::config_path(root);
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(&path)?;
        if data.trim().is_empty() {
            return Ok(Self::default());
        }
        let cfg: WardenConfig = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    // -----------------------------------------------------------------------
    // Environment overrides
    // -----------------------------------------------------------------------

    /// Apply `WARDEN_*` overrides from `vars`. Malformed values are ignored
    /// and reported; numeric values are clamped afterwards.
    pub fn apply_env<I, K, V>(&mut self, vars: I) -> Vec<ConfigWarning>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut warnings = Vec::new();
        for (key, value) in vars {
            let (key, raw) = (key.as_ref(), value.as_ref().trim());
            let Some(name) = key.strip_prefix("WARDEN_") else {
                continue;
            };
            let mut w = EnvReader {
                key,
                raw,
                warnings: &mut warnings,
            };
            let r = &mut self.remediation;
            match name {
                "PROFILE" => set(&mut self.default_profile, w.parse::<PolicyProfile>()),
                "DEDUPE_WINDOW_MINUTES" => set(&mut self.dedupe_window_minutes, w.parse()),
                "SNAPSHOT_LOOKBACK" => set(&mut self.snapshot_lookback, w.parse()),
                "HEARTBEAT_DELAYED_MINUTES" => set(&mut self.heartbeat_delayed_minutes, w.parse()),
                "HEARTBEAT_STALE_MINUTES" => set(&mut self.heartbeat_stale_minutes, w.parse()),
                "RETENTION_DAYS" => set(&mut self.retention_days, w.parse()),
                "DRY_RUN_WINDOW_MINUTES" => set(&mut r.dry_run_window_minutes, w.parse()),
                "EXECUTE_COOLDOWN_MINUTES" => set(&mut r.execute_cooldown_minutes, w.parse()),
                "MAX_EXECUTES_PER_HOUR" => set(&mut r.max_executes_per_hour, w.parse()),
                "MAX_QUEUED_PER_HOST" => set(&mut r.max_queued_per_host, w.parse()),
                "MAX_QUEUED_GLOBAL" => set(&mut r.max_queued_global, w.parse()),
                "QUEUE_TTL_MINUTES" => set(&mut r.queue_ttl_minutes, w.parse()),
                "RETRY_MAX_ATTEMPTS" => set(&mut r.retry_max_attempts, w.parse()),
                "RETRY_BACKOFF_BASE_SECS" => set(&mut r.retry_backoff_base_secs, w.parse()),
                "RETRY_BACKOFF_MAX_SECS" => set(&mut r.retry_backoff_max_secs, w.parse()),
                "COMMAND_TIMEOUT_SECS" => set(&mut r.command_timeout_secs, w.parse()),
                "OUTPUT_BUFFER_BYTES" => set(&mut r.output_buffer_bytes, w.parse()),
                "AUTONOMOUS_ENABLED" => set(&mut r.autonomous_enabled, w.flag()),
                "AUTONOMOUS_MAX_TIER" => set(&mut r.autonomous_max_tier, w.parse::<AutoTier>()),
                "AUTONOMOUS_MAX_PER_CYCLE" => set(&mut r.autonomous_max_per_cycle, w.parse()),
                "AUTONOMOUS_MAX_PER_HOUR" => set(&mut r.autonomous_max_per_hour, w.parse()),
                "APPROVAL_RISK_THRESHOLD" => set(&mut r.approval_risk_threshold, w.parse::<Risk>()),
                "CANARY_ROLLOUT_PERCENT" => set(&mut r.canary_rollout_percent, w.parse()),
                "REQUIRE_CANARY_CHECKS" => set(&mut r.require_canary_checks, w.flag()),
                "AUTO_ROLLBACK" => set(&mut r.auto_rollback, w.flag()),
                "QUEUE_AUTO_DRAIN" => set(&mut r.queue_auto_drain, w.flag()),
                "ENFORCE_ALLOWLIST" => set(&mut self.guard.enforce_allowlist, w.flag()),
                "MAX_COMMANDS_PER_ACTION" => {
                    set(&mut self.guard.max_commands_per_action, w.parse())
                }
                "MAX_COMMAND_LENGTH" => set(&mut self.guard.max_command_length, w.parse()),
                _ => {}
            }
        }

        for note in self.clamp() {
            warnings.push(ConfigWarning::warning(note));
        }
        warnings
    }

    fn clamp(&mut self) -> Vec<String> {
        let mut notes = self.remediation.clamp();
        notes.extend(clamp_guard(&mut self.guard));
        if !(1..=1_440).contains(&self.dedupe_window_minutes) {
            let v = self.dedupe_window_minutes.clamp(1, 1_440);
            notes.push(format!("dedupe_window_minutes={} clamped to {v}", self.dedupe_window_minutes));
            self.dedupe_window_minutes = v;
        }
        if !(1..=1_000).contains(&self.snapshot_lookback) {
            let v = self.snapshot_lookback.clamp(1, 1_000);
            notes.push(format!("snapshot_lookback={} clamped to {v}", self.snapshot_lookback));
            self.snapshot_lookback = v;
        }
        if !(1..=3_650).contains(&self.retention_days) {
            let v = self.retention_days.clamp(1, 3_650);
            notes.push(format!("retention_days={} clamped to {v}", self.retention_days));
            self.retention_days = v;
        }
        notes
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        for pattern in self.guard.invalid_patterns() {
            warnings.push(ConfigWarning::error(format!(
                "guard pattern '{pattern}' is not a valid regex and will be skipped"
            )));
        }

        let r = &self.remediation;
        if r.retry_backoff_max_secs < r.retry_backoff_base_secs {
            warnings.push(ConfigWarning::warning(format!(
                "retry_backoff_max_secs ({}) is below retry_backoff_base_secs ({}); every retry waits the max",
                r.retry_backoff_max_secs, r.retry_backoff_base_secs
            )));
        }

        if self.heartbeat_stale_minutes < self.heartbeat_delayed_minutes {
            warnings.push(ConfigWarning::warning(format!(
                "heartbeat_stale_minutes ({}) is below heartbeat_delayed_minutes ({})",
                self.heartbeat_stale_minutes, self.heartbeat_delayed_minutes
            )));
        }

        if r.require_canary_checks && r.canary_rollout_percent == 0 {
            warnings.push(ConfigWarning::warning(
                "require_canary_checks is set but canary_rollout_percent is 0",
            ));
        }

        if !self.guard.enforce_allowlist {
            warnings.push(ConfigWarning::warning(
                "guard allowlist is not enforced; only the blocklist protects hosts",
            ));
        }

        if let Err(e) = self.fleet.validate() {
            warnings.push(ConfigWarning::error(e.to_string()));
        }

        warnings
    }
}

struct EnvReader<'a> {
    key: &'a str,
    raw: &'a str,
    warnings: &'a mut Vec<ConfigWarning>,
}

impl EnvReader<'_> {
    fn parse<T>(&mut self) -> Option<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.raw.parse::<T>() {
            Ok(v) => Some(v),
            Err(e) => {
                self.reject(&e.to_string());
                None
            }
        }
    }

    fn flag(&mut self) -> Option<bool> {
        match self.raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => {
                self.reject("expected true or false");
                None
            }
        }
    }

    fn reject(&mut self, why: &str) {
        tracing::warn!(key = self.key, value = self.raw, "ignoring malformed override");
        self.warnings.push(ConfigWarning::warning(format!(
            "ignoring {}='{}': {why}",
            self.key, self.raw
        )));
    }
}

fn set<T>(slot: &mut T, value: Option<T>) {
    if let Some(v) = value {
        *slot = v;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn partial_yaml_fills_defaults() {
        let cfg: WardenConfig = serde_yaml::from_str(
            "dedupe_window_minutes: 45\nremediation:\n  autonomous_enabled: true\n",
        )
        .unwrap();
        assert_eq!(cfg.dedupe_window_minutes, 45);
        assert!(cfg.remediation.autonomous_enabled);
        assert_eq!(cfg.remediation.retry_max_attempts, 3);
        assert_eq!(cfg.guard, GuardPolicy::default());
        assert_eq!(cfg.heartbeat_stale_minutes, 60);
    }

    #[test]
    fn load_requires_init_and_tolerates_missing_file() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            WardenConfig::load(dir.path()),
            Err(WardenError::NotInitialized)
        ));
        std::fs::create_dir_all(paths::warden_dir(dir.path())).unwrap();
        assert_eq!(WardenConfig::load(dir.path()).unwrap(), WardenConfig::default());
    }

    #[test]
    fn save_then_load() {
        let dir = TempDir::new().unwrap();
        let mut cfg = WardenConfig::default();
        cfg.default_profile = PolicyProfile::Strict;
        cfg.save(dir.path()).unwrap();
        let loaded = WardenConfig::load(dir.path()).unwrap();
        assert_eq!(loaded.default_profile, PolicyProfile::Strict);
    }

    #[test]
    fn env_overrides_apply_and_clamp() {
        let mut cfg = WardenConfig::default();
        let warnings = cfg.apply_env([
            ("WARDEN_PROFILE", "rapid"),
            ("WARDEN_AUTONOMOUS_ENABLED", "yes"),
            ("WARDEN_AUTONOMOUS_MAX_TIER", "guarded_auto"),
            ("WARDEN_CANARY_ROLLOUT_PERCENT", "140"),
            ("WARDEN_ROOT", "/tmp/elsewhere"),
            ("HOME", "/root"),
        ]);
        assert_eq!(cfg.default_profile, PolicyProfile::Rapid);
        assert!(cfg.remediation.autonomous_enabled);
        assert_eq!(cfg.remediation.autonomous_max_tier, AutoTier::GuardedAuto);
        assert_eq!(cfg.remediation.canary_rollout_percent, 100);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].message.contains("canary_rollout_percent"));
    }

    #[test]
    fn retention_days_reads_env_and_clamps() {
        let mut cfg = WardenConfig::default();
        assert_eq!(cfg.retention_days, 30);
        assert!(cfg.apply_env([("WARDEN_RETENTION_DAYS", "7")]).is_empty());
        assert_eq!(cfg.retention_days, 7);

        let warnings = cfg.apply_env([("WARDEN_RETENTION_DAYS", "0")]);
        assert_eq!(cfg.retention_days, 1);
        assert!(warnings[0].message.contains("retention_days"));
    }

    #[test]
    fn malformed_env_values_are_ignored() {
        let mut cfg = WardenConfig::default();
        let warnings = cfg.apply_env([
            ("WARDEN_COMMAND_TIMEOUT_SECS", "soon"),
            ("WARDEN_AUTO_ROLLBACK", "maybe"),
        ]);
        assert_eq!(cfg.remediation.command_timeout_secs, 60);
        assert!(cfg.remediation.auto_rollback);
        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].message.contains("WARDEN_COMMAND_TIMEOUT_SECS"));
    }

    #[test]
    fn validate_default_has_no_errors() {
        let warnings = WardenConfig::default().validate();
        assert!(warnings.is_empty(), "{warnings:?}");
    }

    #[test]
    fn validate_flags_bad_pattern_and_backoff() {
        let mut cfg = WardenConfig::default();
        cfg.guard.blocklist.push("[oops".into());
        cfg.remediation.retry_backoff_max_secs = 5;
        let warnings = cfg.validate();
        assert!(warnings
            .iter()
            .any(|w| w.level == WarnLevel::Error && w.message.contains("[oops")));
        assert!(warnings
            .iter()
            .any(|w| w.message.contains("retry_backoff_max_secs")));
    }
}
