//! Timeline builder: flattens signals from many snapshots, orders them
//! newest first and collapses repeats of the same `(code, title, detail)`
//! that fall inside the dedupe window.

use crate::signals::{extract_from_snapshot, IncidentSignal};
use crate::snapshot::Snapshot;
use crate::types::SignalCode;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

pub const DEFAULT_DEDUPE_WINDOW_MINUTES: u32 = 30;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimelineSummary {
    pub total: usize,
    pub by_severity: BTreeMap<String, usize>,
    pub by_code: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Timeline {
    pub signals: Vec<IncidentSignal>,
    pub summary: TimelineSummary,
}

impl Timeline {
    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TimelineOptions {
    pub dedupe_window_minutes: u32,
    /// Cap applied after deduplication. `None` keeps everything.
    pub max_entries: Option<usize>,
}

impl Default for TimelineOptions {
    fn default() -> Self {
        Self {
            dedupe_window_minutes: DEFAULT_DEDUPE_WINDOW_MINUTES,
            max_entries: None,
        }
    }
}

pub fn build_timeline(snapshots: &[Snapshot], options: TimelineOptions) -> Timeline {
    let signals = snapshots.iter().flat_map(extract_from_snapshot).collect();
    build_from_signals(signals, options)
}

/// Sort (timestamp desc, severity desc; stable for ties), deduplicate and
/// summarize.
pub fn build_from_signals(mut signals: Vec<IncidentSignal>, options: TimelineOptions) -> Timeline {
    signals.sort_by(|a, b| {
        b.timestamp
            .cmp(&a.timestamp)
            .then_with(|| b.severity.cmp(&a.severity))
    });

    let window = Duration::minutes(i64::from(options.dedupe_window_minutes));
    let mut kept: Vec<IncidentSignal> = Vec::with_capacity(signals.len());
    // Timestamp of the most recently kept (i.e. oldest so far) instance per key.
    let mut last_kept: HashMap<(SignalCode, String, Option<String>), DateTime<Utc>> =
        HashMap::new();

    for signal in signals {
        let key = (signal.code, signal.title.clone(), signal.detail.clone());
        if let Some(prev) = last_kept.get(&key) {
            if *prev - signal.timestamp <= window {
                continue;
            }
        }
        last_kept.insert(key, signal.timestamp);
        kept.push(signal);
    }

    if let Some(max) = options.max_entries {
        kept.truncate(max);
    }

    let summary = summarize(&kept);
    Timeline {
        signals: kept,
        summary,
    }
}

fn summarize(signals: &[IncidentSignal]) -> TimelineSummary {
    let mut summary = TimelineSummary {
        total: signals.len(),
        ..Default::default()
    };
    for s in signals {
        *summary
            .by_severity
            .entry(s.severity.as_str().to_string())
            .or_insert(0) += 1;
        *summary.by_code.entry(s.code.as_str().to_string()).or_insert(0) += 1;
    }
    summary
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Severity, SignalSource};
    use serde_json::json;

    fn signal(code: SignalCode, severity: Severity, title: &str, ts: DateTime<Utc>) -> IncidentSignal {
        IncidentSignal {
            code,
            severity,
            title: title.to_string(),
            detail: None,
            timestamp: ts,
            snapshot_id: None,
            source: SignalSource::Alert,
        }
    }

    fn opts(window: u32) -> TimelineOptions {
        TimelineOptions {
            dedupe_window_minutes: window,
            max_entries: None,
        }
    }

    #[test]
    fn dedupe_boundary_is_inclusive() {
        let now = Utc::now();
        let at_window = vec![
            signal(SignalCode::PackageDrift, Severity::Medium, "Packages changed", now),
            signal(
                SignalCode::PackageDrift,
                Severity::Medium,
                "Packages changed",
                now - Duration::minutes(30),
            ),
        ];
        assert_eq!(build_from_signals(at_window, opts(30)).signals.len(), 1);

        let past_window = vec![
            signal(SignalCode::PackageDrift, Severity::Medium, "Packages changed", now),
            signal(
                SignalCode::PackageDrift,
                Severity::Medium,
                "Packages changed",
                now - Duration::minutes(30) - Duration::seconds(1),
            ),
        ];
        assert_eq!(build_from_signals(past_window, opts(30)).signals.len(), 2);
    }

    #[test]
    fn repeated_package_alert_across_three_snapshots() {
        let now = Utc::now();
        let status = json!({"alerts": [{"title": "Packages changed"}]});
        let snapshots = vec![
            Snapshot::new("h1", now - Duration::minutes(2), status.clone()),
            Snapshot::new("h1", now - Duration::minutes(190), status.clone()),
            Snapshot::new("h1", now, status),
        ];
        let timeline = build_timeline(&snapshots, opts(30));
        assert_eq!(timeline.signals.len(), 2);
        assert!(timeline
            .signals
            .iter()
            .all(|s| s.code == SignalCode::PackageDrift));
        assert_eq!(timeline.signals[0].timestamp, now);
        assert_eq!(timeline.signals[1].timestamp, now - Duration::minutes(190));
        assert_eq!(timeline.summary.by_code["package_drift"], 2);
    }

    #[test]
    fn ties_sort_by_severity_then_input_order() {
        let now = Utc::now();
        let signals = vec![
            signal(SignalCode::PackageDrift, Severity::Low, "a", now),
            signal(SignalCode::ConfigTamper, Severity::Critical, "b", now),
            signal(SignalCode::SecurityAlert, Severity::Low, "c", now),
        ];
        let timeline = build_from_signals(signals, opts(30));
        let titles: Vec<_> = timeline.signals.iter().map(|s| s.title.as_str()).collect();
        assert_eq!(titles, vec!["b", "a", "c"]);
    }

    #[test]
    fn distinct_details_are_not_merged() {
        let now = Utc::now();
        let mut a = signal(SignalCode::SecurityAlert, Severity::Medium, "x", now);
        a.detail = Some("one".into());
        let mut b = a.clone();
        b.detail = Some("two".into());
        assert_eq!(build_from_signals(vec![a, b], opts(30)).signals.len(), 2);
    }

    #[test]
    fn summary_counts_and_cap() {
        let now = Utc::now();
        let signals = vec![
            signal(SignalCode::ConfigTamper, Severity::Critical, "a", now),
            signal(SignalCode::PackageDrift, Severity::Medium, "b", now - Duration::minutes(1)),
            signal(SignalCode::PackageDrift, Severity::Medium, "c", now - Duration::minutes(2)),
        ];
        let timeline = build_from_signals(
            signals,
            TimelineOptions {
                dedupe_window_minutes: 30,
                max_entries: Some(2),
            },
        );
        assert_eq!(timeline.summary.total, 2);
        assert_eq!(timeline.summary.by_severity["critical"], 1);
        assert_eq!(timeline.summary.by_severity["medium"], 1);
    }
}
