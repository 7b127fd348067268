//! Posture scoring: turns a signal timeline plus heartbeat freshness into a
//! 0..=100 risk score, a band and a containment stage.

use crate::signals::IncidentSignal;
use crate::types::SignalCode;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Window in which a lockdown-triggering code floors the score and forces
/// the lockdown stage.
pub const LOCKDOWN_WINDOW_MINUTES: i64 = 180;
/// Score floor while a lockdown-triggering code is recent.
pub const LOCKDOWN_SCORE_FLOOR: f64 = 72.0;
/// Base weight for codes without an explicit entry.
pub const DEFAULT_BASE_WEIGHT: f64 = 6.0;

// ---------------------------------------------------------------------------
// HeartbeatState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeartbeatState {
    Fresh,
    Delayed,
    Stale,
    Missing,
}

impl HeartbeatState {
    /// Classify the age of the latest snapshot. Thresholds are inclusive.
    pub fn from_last_seen(
        last_seen: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        delayed_after_minutes: u32,
        stale_after_minutes: u32,
    ) -> Self {
        let Some(last) = last_seen else {
            return HeartbeatState::Missing;
        };
        let age = (now - last).num_minutes().max(0);
        if age <= i64::from(delayed_after_minutes) {
            HeartbeatState::Fresh
        } else if age <= i64::from(stale_after_minutes) {
            HeartbeatState::Delayed
        } else {
            HeartbeatState::Stale
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HeartbeatState::Fresh => "fresh",
            HeartbeatState::Delayed => "delayed",
            HeartbeatState::Stale => "stale",
            HeartbeatState::Missing => "missing",
        }
    }

    pub fn penalty(self) -> f64 {
        match self {
            HeartbeatState::Missing => 20.0,
            HeartbeatState::Stale => 12.0,
            HeartbeatState::Delayed => 6.0,
            HeartbeatState::Fresh => 0.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Band / Stage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostureBand {
    Low,
    Guarded,
    Elevated,
    Critical,
}

impl PostureBand {
    pub fn from_score(score: u32) -> Self {
        match score {
            s if s >= 70 => PostureBand::Critical,
            s if s >= 40 => PostureBand::Elevated,
            s if s >= 20 => PostureBand::Guarded,
            _ => PostureBand::Low,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PostureBand::Low => "low",
            PostureBand::Guarded => "guarded",
            PostureBand::Elevated => "elevated",
            PostureBand::Critical => "critical",
        }
    }
}

impl fmt::Display for PostureBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainmentStage {
    Observe,
    Watch,
    Contain,
    Lockdown,
}

impl ContainmentStage {
    /// Score and lockdown activity are evaluated independently: a floored
    /// score of 72 alone does not reach lockdown.
    pub fn from_score(score: u32, lockdown_active: bool) -> Self {
        if score >= 80 || lockdown_active {
            ContainmentStage::Lockdown
        } else if score >= 55 {
            ContainmentStage::Contain
        } else if score >= 30 {
            ContainmentStage::Watch
        } else {
            ContainmentStage::Observe
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ContainmentStage::Observe => "observe",
            ContainmentStage::Watch => "watch",
            ContainmentStage::Contain => "contain",
            ContainmentStage::Lockdown => "lockdown",
        }
    }

    pub fn next_move(self) -> &'static str {
        match self {
            ContainmentStage::Observe => {
                "Keep collecting snapshots; no containment needed right now."
            }
            ContainmentStage::Watch => {
                "Review the top signals and dry-run the suggested verification actions."
            }
            ContainmentStage::Contain => {
                "Queue containment actions for the priority signals and confirm canary checks."
            }
            ContainmentStage::Lockdown => {
                "Lock down access surfaces now, quarantine exposed ports and collect forensics."
            }
        }
    }
}

impl fmt::Display for ContainmentStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// SecurityPosture
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityPosture {
    pub score: u32,
    pub band: PostureBand,
    pub stage: ContainmentStage,
    pub next_move: String,
    pub signal_count: usize,
    pub priority_codes: Vec<SignalCode>,
    pub heartbeat: HeartbeatState,
    pub lockdown_active: bool,
}

pub fn base_weight(code: SignalCode) -> f64 {
    match code {
        SignalCode::ConfigTamper => 30.0,
        SignalCode::UnexpectedPublicPorts => 28.0,
        SignalCode::FirewallDrift => 20.0,
        SignalCode::AccountDrift => 18.0,
        SignalCode::SshNewAccepts => 16.0,
        SignalCode::SshFailedPassword => 14.0,
        SignalCode::SshInvalidUser => 12.0,
        SignalCode::SecurityAlert => 10.0,
        SignalCode::PackageDrift => 8.0,
        SignalCode::IngestIntegrity => DEFAULT_BASE_WEIGHT,
    }
}

pub fn recency_multiplier(age_minutes: i64) -> f64 {
    match age_minutes.max(0) {
        a if a <= 30 => 1.0,
        a if a <= 180 => 0.84,
        a if a <= 1_440 => 0.58,
        a if a <= 4_320 => 0.36,
        _ => 0.22,
    }
}

fn age_minutes(signal: &IncidentSignal, now: DateTime<Utc>) -> i64 {
    (now - signal.timestamp).num_minutes().max(0)
}

pub fn lockdown_active(signals: &[IncidentSignal], now: DateTime<Utc>) -> bool {
    let window = Duration::minutes(LOCKDOWN_WINDOW_MINUTES);
    signals
        .iter()
        .any(|s| s.code.triggers_lockdown() && now - s.timestamp <= window)
}

pub fn score_posture(
    signals: &[IncidentSignal],
    heartbeat: HeartbeatState,
    now: DateTime<Utc>,
) -> SecurityPosture {
    let mut raw: f64 = signals
        .iter()
        .map(|s| {
            base_weight(s.code) * s.severity.multiplier() * recency_multiplier(age_minutes(s, now))
        })
        .sum();
    raw += heartbeat.penalty();

    let active = lockdown_active(signals, now);
    if active {
        raw = raw.max(LOCKDOWN_SCORE_FLOOR);
    }
    let score = raw.clamp(0.0, 100.0).round() as u32;
    let stage = ContainmentStage::from_score(score, active);

    SecurityPosture {
        score,
        band: PostureBand::from_score(score),
        stage,
        next_move: stage.next_move().to_string(),
        signal_count: signals.len(),
        priority_codes: priority_codes(signals, 3),
        heartbeat,
        lockdown_active: active,
    }
}

/// Most frequent codes, ties broken by base weight then name.
fn priority_codes(signals: &[IncidentSignal], n: usize) -> Vec<SignalCode> {
    let mut counts: HashMap<SignalCode, usize> = HashMap::new();
    for s in signals {
        *counts.entry(s.code).or_insert(0) += 1;
    }
    let mut ranked: Vec<(SignalCode, usize)> = counts.into_iter().collect();
    ranked.sort_by(|(ca, na), (cb, nb)| {
        nb.cmp(na)
            .then_with(|| base_weight(*cb).total_cmp(&base_weight(*ca)))
            .then_with(|| ca.as_str().cmp(cb.as_str()))
    });
    ranked.into_iter().take(n).map(|(c, _)| c).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
