//! Core data models.
//!
//! `Event` is the normalized, immutable seismic record kept in the store.
//! `AlarmResult` is the transient verdict computed per region and run.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// A normalized seismic event.
///
/// Created only by the normalizer, never mutated after it is stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    /// Event time (UTC, second precision)
    pub event_time: DateTime<Utc>,

    /// Latitude in degrees
    pub latitude: f64,

    /// Longitude in degrees
    pub longitude: f64,

    /// Depth in kilometers (positive down)
    pub depth_km: Option<f64>,

    /// Selected magnitude value
    pub magnitude: f64,

    /// Descriptive location label (may be empty)
    pub location: String,

    /// Provenance tag, e.g. "koeri"
    pub source: String,

    /// Stable dedup key
    pub fingerprint: String,
}

impl Event {
    /// Event time as the sortable storage key (`YYYY-MM-DDTHH:MM:SSZ`).
    #[must_use]
    pub fn time_key(&self) -> String {
        time_key(self.event_time)
    }

    /// Distance from this event to a point, in kilometers.
    #[must_use]
    pub fn distance_to(&self, lat: f64, lon: f64) -> f64 {
        crate::geo::distance_km(lat, lon, self.latitude, self.longitude)
    }
}

/// Render an instant in the fixed, lexically sortable storage format.
#[must_use]
pub fn time_key(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Ordinal alarm severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    #[default]
    Normal,
    Orange,
    Red,
}

impl Severity {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "NORMAL",
            Self::Orange => "ORANGE",
            Self::Red => "RED",
        }
    }

    /// Numeric rank used by the cluster score.
    #[must_use]
    pub const fn rank(self) -> u8 {
        match self {
            Self::Normal => 0,
            Self::Orange => 1,
            Self::Red => 2,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Count of events at or above one magnitude threshold.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MagnitudeCount {
    pub min_magnitude: f64,
    pub count: usize,
}

/// Aggregate statistics for one time window.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WindowMetrics {
    /// Total events in the window
    pub total: usize,

    /// Counts per magnitude threshold, ascending by threshold
    pub counts: Vec<MagnitudeCount>,

    /// Largest magnitude in the window (0.0 if empty)
    pub max_magnitude: f64,

    /// Weighted activity normalized by window length
    pub activity: f64,
}

impl WindowMetrics {
    /// Look up the count computed for a threshold.
    #[must_use]
    pub fn count_at(&self, min_magnitude: f64) -> Option<usize> {
        self.counts
            .iter()
            .find(|c| same_threshold(c.min_magnitude, min_magnitude))
            .map(|c| c.count)
    }
}

/// Threshold equality tolerant of decimal round-off.
#[must_use]
pub fn same_threshold(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}

/// A rule that fired, with the observed values that triggered it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reason {
    /// Rule identifier
    pub rule: String,

    /// Severity the rule assigns
    pub severity: Severity,

    /// Observed metrics against thresholds
    pub detail: String,
}

/// Verdict for one region and one evaluation run.
#[derive(Debug, Clone, Serialize)]
pub struct AlarmResult {
    /// Region name from configuration
    pub region: String,

    /// Resulting severity
    pub level: Severity,

    /// Rules that fired, in evaluation order
    pub reasons: Vec<Reason>,

    /// Metrics per window name
    pub window_metrics: BTreeMap<String, WindowMetrics>,

    /// Cluster center (lat, lon) for cluster regions
    pub center: Option<(f64, f64)>,

    /// Radius used around the center
    pub radius_km: f64,

    /// Ranking score (severity and weighted activity)
    pub score: f64,

    /// Largest contributing events, magnitude descending
    pub top_events: Vec<Event>,

    /// Evaluation instant
    pub evaluated_at: DateTime<Utc>,
}

impl AlarmResult {
    /// A NORMAL result with no center and no metrics.
    #[must_use]
    pub fn quiet(region: &str, radius_km: f64, evaluated_at: DateTime<Utc>) -> Self {
        Self {
            region: region.to_string(),
            level: Severity::Normal,
            reasons: Vec::new(),
            window_metrics: BTreeMap::new(),
            center: None,
            radius_km,
            score: 0.0,
            top_events: Vec::new(),
            evaluated_at,
        }
    }

    /// Whether downstream notification should treat this as an alarm.
    #[must_use]
    pub fn is_alarm(&self) -> bool {
        self.level > Severity::Normal
    }
}
