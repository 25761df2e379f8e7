//! Per-window statistics over a candidate event set.
//!
//! Pure functions; callers hand in whatever slice they already selected.

use std::cmp::Ordering;
use std::time::Duration;

use crate::models::{Event, MagnitudeCount, WindowMetrics};

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Number of events with magnitude at or above `threshold`.
#[must_use]
pub fn count_at_least(events: &[&Event], threshold: f64) -> usize {
    events.iter().filter(|e| e.magnitude >= threshold).count()
}

/// Largest magnitude, or 0.0 for an empty set.
#[must_use]
pub fn max_magnitude(events: &[&Event]) -> f64 {
    events.iter().map(|e| e.magnitude).fold(0.0, f64::max)
}

/// The `n` largest events; equal magnitudes put the more recent first.
#[must_use]
pub fn top_by_magnitude(events: &[&Event], n: usize) -> Vec<Event> {
    let mut sorted: Vec<&Event> = events.to_vec();
    sorted.sort_by(|a, b| {
        b.magnitude
            .partial_cmp(&a.magnitude)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.event_time.cmp(&a.event_time))
            .then_with(|| a.fingerprint.cmp(&b.fingerprint))
    });
    sorted.into_iter().take(n).cloned().collect()
}

/// Contribution of one event to the activity score.
///
/// Small events count about 1, each magnitude unit above 1.5 adds 1.
#[must_use]
pub fn event_weight(magnitude: f64) -> f64 {
    if magnitude <= 0.0 {
        return 0.0;
    }
    1.0 + (magnitude - 1.5).max(0.0)
}

/// Total weight divided by the square root of the window length in days,
/// so long windows do not dominate.
#[must_use]
pub fn activity(events: &[&Event], span: Duration) -> f64 {
    let days = (span.as_secs_f64() / SECONDS_PER_DAY).max(1.0);
    let total: f64 = events.iter().map(|e| event_weight(e.magnitude)).sum();
    total / days.sqrt()
}

/// Compute all statistics for one window.
///
/// `thresholds` may be unsorted or repeat; the result lists each once,
/// ascending.
#[must_use]
pub fn window_metrics(events: &[&Event], thresholds: &[f64], span: Duration) -> WindowMetrics {
    let mut levels: Vec<f64> = thresholds.iter().copied().filter(|t| t.is_finite()).collect();
    levels.sort_by(f64::total_cmp);
    levels.dedup_by(|a, b| crate::models::same_threshold(*a, *b));

    WindowMetrics {
        total: events.len(),
        counts: levels
            .into_iter()
            .map(|min_magnitude| MagnitudeCount {
                min_magnitude,
                count: count_at_least(events, min_magnitude),
            })
            .collect(),
        max_magnitude: max_magnitude(events),
        activity: activity(events, span),
    }
}
