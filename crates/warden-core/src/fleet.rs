//! Fleet membership, rollout pauses and staged rollout planning.

use crate::autoqueue::canary_bucket;
use crate::error::{Result, WardenError};
use crate::host::Host;
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Membership
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FleetScope {
    #[default]
    Production,
    Staging,
    Development,
}

impl FleetScope {
    pub fn as_str(self) -> &'static str {
        match self {
            FleetScope::Production => "production",
            FleetScope::Staging => "staging",
            FleetScope::Development => "development",
        }
    }
}

impl fmt::Display for FleetScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FleetScope {
    type Err = WardenError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "production" | "prod" => Ok(FleetScope::Production),
            "staging" => Ok(FleetScope::Staging),
            "development" | "dev" => Ok(FleetScope::Development),
            _ => Err(WardenError::InvalidValue(format!(
                "unknown scope '{s}': must be production, staging, or development"
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetMembership {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    pub scope: FleetScope,
    pub rollout_paused: bool,
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloutStage {
    pub name: String,
    /// Cumulative share of the matched hosts reached once this stage is done.
    pub percent: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetPolicy {
    pub paused_groups: Vec<String>,
    pub stages: Vec<RolloutStage>,
    pub max_blast_radius_hosts: u32,
    pub max_blast_radius_percent: u32,
}

impl Default for FleetPolicy {
    fn default() -> Self {
        let stage = |name: &str, percent| RolloutStage {
            name: name.to_string(),
            percent,
        };
        Self {
            paused_groups: Vec::new(),
            stages: vec![
                stage("canary", 5),
                stage("early", 25),
                stage("broad", 50),
                stage("full", 100),
            ],
            max_blast_radius_hosts: 25,
            max_blast_radius_percent: 50,
        }
    }
}

impl FleetPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.stages.is_empty() {
            return Err(WardenError::InvalidValue(
                "fleet.stages must name at least one stage".into(),
            ));
        }
        let mut last = 0;
        for stage in &self.stages {
            if stage.percent == 0 || stage.percent > 100 || stage.percent < last {
                return Err(WardenError::InvalidValue(format!(
                    "fleet stage '{}' has percent {}: stages must be non-decreasing within 1..=100",
                    stage.name, stage.percent
                )));
            }
            last = stage.percent;
        }
        if self.max_blast_radius_hosts == 0
            || self.max_blast_radius_percent == 0
            || self.max_blast_radius_percent > 100
        {
            return Err(WardenError::InvalidValue(
                "fleet blast radius must allow at least one host and stay within 1..=100 percent"
                    .into(),
            ));
        }
        Ok(())
    }
}

pub fn is_rollout_paused(membership: &FleetMembership, policy: &FleetPolicy) -> bool {
    membership.rollout_paused
        || membership
            .group
            .as_ref()
            .is_some_and(|g| policy.paused_groups.iter().any(|p| p == g))
}

// ---------------------------------------------------------------------------
// Selector
// ---------------------------------------------------------------------------

/// Empty selector matches every host. All given criteria must hold; every
/// listed tag must be present.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetSelector {
    pub group: Option<String>,
    pub tags: Vec<String>,
    pub scope: Option<FleetScope>,
}

impl FleetSelector {
    pub fn matches(&self, membership: &FleetMembership) -> bool {
        if let Some(group) = &self.group {
            if membership.group.as_ref() != Some(group) {
                return false;
            }
        }
        if let Some(scope) = self.scope {
            if membership.scope != scope {
                return false;
            }
        }
        self.tags.iter().all(|t| membership.tags.contains(t))
    }
}

// ---------------------------------------------------------------------------
// Rollout planning
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedStage {
    pub name: String,
    pub percent: u32,
    pub hosts: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeferReason {
    RolloutPaused,
    BlastRadius,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeferredHost {
    pub host_id: String,
    pub reason: DeferReason,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolloutPlan {
    pub action_id: String,
    pub matched: usize,
    pub stages: Vec<PlannedStage>,
    pub deferred: Vec<DeferredHost>,
}

fn ceil_percent(n: usize, percent: u32) -> usize {
    (n * percent as usize).div_ceil(100)
}

pub fn plan_rollout(
    hosts: &[Host],
    selector: &FleetSelector,
    action_id: &str,
    policy: &FleetPolicy,
) -> RolloutPlan {
    let mut deferred = Vec::new();
    let mut ordered: Vec<(u32, &str)> = Vec::new();
    for host in hosts
        .iter()
        .filter(|h| h.enabled && selector.matches(&h.config.fleet))
    {
        if is_rollout_paused(&host.config.fleet, policy) {
            deferred.push(DeferredHost {
                host_id: host.id.clone(),
                reason: DeferReason::RolloutPaused,
            });
        } else {
            ordered.push((canary_bucket(&host.id, action_id), host.id.as_str()));
        }
    }
    ordered.sort();

    let matched = ordered.len() + deferred.len();
    let eligible = ordered.len();
    let per_stage_cap = (policy.max_blast_radius_hosts as usize)
        .min(ceil_percent(eligible, policy.max_blast_radius_percent))
        .max(1);

    let mut stages = Vec::with_capacity(policy.stages.len());
    let mut assigned = 0;
    for stage in &policy.stages {
        let target = ceil_percent(eligible, stage.percent.min(100)).max(assigned);
        let take = (target - assigned).min(per_stage_cap);
        let hosts = ordered[assigned..assigned + take]
            .iter()
            .map(|(_, id)| id.to_string())
            .collect();
        assigned += take;
        stages.push(PlannedStage {
            name: stage.name.clone(),
            percent: stage.percent,
            hosts,
        });
    }

    deferred.extend(ordered[assigned..].iter().map(|(_, id)| DeferredHost {
        host_id: id.to_string(),
        reason: DeferReason::BlastRadius,
    }));

    RolloutPlan {
        action_id: action_id.to_string(),
        matched,
        stages,
        deferred,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
