use crate::error::WardenError;
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Severity
// ---------------------------------------------------------------------------

/// Signal severity. Ordering is ascending: `Info < Low < ... < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn all() -> &'static [Severity] {
        &[
            Severity::Critical,
            Severity::High,
            Severity::Medium,
            Severity::Low,
            Severity::Info,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    /// Scoring multiplier applied to a signal's base weight.
    pub fn multiplier(self) -> f64 {
        match self {
            Severity::Critical => 1.25,
            Severity::High => 1.0,
            Severity::Medium => 0.7,
            Severity::Low => 0.45,
            Severity::Info => 0.25,
        }
    }

    /// Lenient parse used for agent-supplied alert severities.
    pub fn parse_loose(s: &str) -> Option<Severity> {
        match s.trim().to_ascii_lowercase().as_str() {
            "critical" | "crit" | "emergency" | "alert" => Some(Severity::Critical),
            "high" | "error" | "err" => Some(Severity::High),
            "medium" | "moderate" | "warning" | "warn" => Some(Severity::Medium),
            "low" | "notice" => Some(Severity::Low),
            "info" | "informational" | "debug" => Some(Severity::Info),
            _ => None,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// SignalSource
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalSource {
    Alert,
    Auth,
    Ports,
    Ingest,
}

impl SignalSource {
    pub fn as_str(self) -> &'static str {
        match self {
            SignalSource::Alert => "alert",
            SignalSource::Auth => "auth",
            SignalSource::Ports => "ports",
            SignalSource::Ingest => "ingest",
        }
    }
}

impl fmt::Display for SignalSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// SignalCode
// ---------------------------------------------------------------------------

/// Fixed vocabulary of incident signal codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalCode {
    ConfigTamper,
    FirewallDrift,
    AccountDrift,
    PackageDrift,
    SecurityAlert,
    SshFailedPassword,
    SshInvalidUser,
    SshNewAccepts,
    UnexpectedPublicPorts,
    IngestIntegrity,
}

impl SignalCode {
    pub fn all() -> &'static [SignalCode] {
        &[
            SignalCode::ConfigTamper,
            SignalCode::FirewallDrift,
            SignalCode::AccountDrift,
            SignalCode::PackageDrift,
            SignalCode::SecurityAlert,
            SignalCode::SshFailedPassword,
            SignalCode::SshInvalidUser,
            SignalCode::SshNewAccepts,
            SignalCode::UnexpectedPublicPorts,
            SignalCode::IngestIntegrity,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SignalCode::ConfigTamper => "config_tamper",
            SignalCode::FirewallDrift => "firewall_drift",
            SignalCode::AccountDrift => "account_drift",
            SignalCode::PackageDrift => "package_drift",
            SignalCode::SecurityAlert => "security_alert",
            SignalCode::SshFailedPassword => "ssh_failed_password",
            SignalCode::SshInvalidUser => "ssh_invalid_user",
            SignalCode::SshNewAccepts => "ssh_new_accepts",
            SignalCode::UnexpectedPublicPorts => "unexpected_public_ports",
            SignalCode::IngestIntegrity => "ingest_integrity",
        }
    }

    /// Codes that force lockdown posture while recent.
    pub fn triggers_lockdown(self) -> bool {
        matches!(
            self,
            SignalCode::ConfigTamper | SignalCode::UnexpectedPublicPorts
        )
    }
}

impl fmt::Display for SignalCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SignalCode {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SignalCode::all()
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| WardenError::InvalidValue(format!("unknown signal code '{s}'")))
    }
}

// ---------------------------------------------------------------------------
// Priority / Risk
// ---------------------------------------------------------------------------

/// Action priority. `P0` sorts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    P0,
    P1,
    P2,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::P0 => "P0",
            Priority::P1 => "P1",
            Priority::P2 => "P2",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Risk {
    Low,
    Medium,
    High,
}

impl Risk {
    pub fn as_str(self) -> &'static str {
        match self {
            Risk::Low => "low",
            Risk::Medium => "medium",
            Risk::High => "high",
        }
    }
}

impl fmt::Display for Risk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Risk {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Risk::Low),
            "medium" => Ok(Risk::Medium),
            "high" => Ok(Risk::High),
            _ => Err(WardenError::InvalidValue(format!(
                "unknown risk '{s}': must be low, medium, or high"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// AutoTier
// ---------------------------------------------------------------------------

/// How autonomously an action may execute. Ordered from least to most
/// autonomy required.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoTier {
    Observe,
    SafeAuto,
    GuardedAuto,
    RiskyManual,
}

impl AutoTier {
    pub fn as_str(self) -> &'static str {
        match self {
            AutoTier::Observe => "observe",
            AutoTier::SafeAuto => "safe_auto",
            AutoTier::GuardedAuto => "guarded_auto",
            AutoTier::RiskyManual => "risky_manual",
        }
    }
}

impl fmt::Display for AutoTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AutoTier {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "observe" => Ok(AutoTier::Observe),
            "safe_auto" => Ok(AutoTier::SafeAuto),
            "guarded_auto" => Ok(AutoTier::GuardedAuto),
            "risky_manual" => Ok(AutoTier::RiskyManual),
            _ => Err(WardenError::InvalidValue(format!(
                "unknown tier '{s}': must be observe, safe_auto, guarded_auto, or risky_manual"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// ActionMode
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionMode {
    DryRun,
    Execute,
}

impl ActionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionMode::DryRun => "dry_run",
            ActionMode::Execute => "execute",
        }
    }
}

impl fmt::Display for ActionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ActionMode {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dry_run" | "dry-run" => Ok(ActionMode::DryRun),
            "execute" => Ok(ActionMode::Execute),
            _ => Err(WardenError::InvalidValue(format!(
                "unknown mode '{s}': must be dry-run or execute"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Role / Actor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Viewer,
    Ops,
    Admin,
}

impl std::str::FromStr for Role {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "viewer" => Ok(Role::Viewer),
            "ops" => Ok(Role::Ops),
            "admin" => Ok(Role::Admin),
            _ => Err(WardenError::InvalidValue(format!(
                "unknown role '{s}': must be viewer, ops, or admin"
            ))),
        }
    }
}

/// The identity on whose behalf an operation runs. Resolved by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub user_id: String,
    pub role: Role,
}

pub const AUTONOMOUS_ACTOR: &str = "system:autonomous";
pub const DRAIN_ACTOR: &str = "system:drain";

impl Actor {
    pub fn new(user_id: impl Into<String>, role: Role) -> Self {
        Self {
            user_id: user_id.into(),
            role,
        }
    }

    pub fn autonomous() -> Self {
        Self::new(AUTONOMOUS_ACTOR, Role::Admin)
    }

    /// Manual queueing, approval and replay need at least `ops`.
    pub fn require_operator(&self, what: &str) -> crate::error::Result<()> {
        if self.role >= Role::Ops {
            Ok(())
        } else {
            Err(WardenError::Forbidden(format!(
                "{what} requires role ops or admin (user '{}')",
                self.user_id
            )))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_orders_ascending() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::Low > Severity::Info);
        assert_eq!(Severity::parse_loose("WARNING"), Some(Severity::Medium));
        assert_eq!(Severity::parse_loose("bogus"), None);
    }

    #[test]
    fn tier_ordering_matches_autonomy() {
        assert!(AutoTier::Observe < AutoTier::SafeAuto);
        assert!(AutoTier::SafeAuto < AutoTier::GuardedAuto);
        assert!(AutoTier::GuardedAuto < AutoTier::RiskyManual);
    }

    #[test]
    fn signal_code_parses_from_str() {
        for code in SignalCode::all() {
            let parsed: SignalCode = code.as_str().parse().unwrap();
            assert_eq!(parsed, *code);
        }
        assert!("nope".parse::<SignalCode>().is_err());
    }

    #[test]
    fn viewer_cannot_operate() {
        let viewer = Actor::new("u1", Role::Viewer);
        assert!(viewer.require_operator("approve").is_err());
        assert!(Actor::new("u2", Role::Ops).require_operator("approve").is_ok());
    }

    #[test]
    fn mode_accepts_dash_and_underscore() {
        assert_eq!("dry-run".parse::<ActionMode>().unwrap(), ActionMode::DryRun);
        assert_eq!("dry_run".parse::<ActionMode>().unwrap(), ActionMode::DryRun);
        assert!("later".parse::<ActionMode>().is_err());
    }
}
