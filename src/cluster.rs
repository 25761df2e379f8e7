//! Most-active-neighborhood search.
//!
//! Regions without a fixed center enumerate candidate centers from recent
//! events, assess every candidate with the same window metrics and rules a
//! fixed region uses, and keep the highest-scoring one.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::debug;

use crate::aggregate::{top_by_magnitude, window_metrics};
use crate::config::{CandidateStrategy, ClusterConfig, WindowConfig};
use crate::models::{Event, Severity, WindowMetrics};
use crate::rules::{RuleSet, Verdict, evaluate};

/// Severity weight in the candidate score; dominates any activity total.
const SEVERITY_SCALE: f64 = 1_000_000.0;

/// A window with the thresholds to count in it.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowPlan {
    pub name: String,
    pub span: Duration,
    pub thresholds: Vec<f64>,
}

/// Combine configured windows with the thresholds a rule set reads.
#[must_use]
pub fn plan_windows(windows: &[WindowConfig], rules: &RuleSet, report_thresholds: &[f64]) -> Vec<WindowPlan> {
    windows
        .iter()
        .map(|w| {
            let mut thresholds = report_thresholds.to_vec();
            thresholds.extend(rules.thresholds_for(&w.name));
            WindowPlan {
                name: w.name.clone(),
                span: w.span,
                thresholds,
            }
        })
        .collect()
}

/// Start of a trailing window ending at `now`.
#[must_use]
pub fn window_start(now: DateTime<Utc>, span: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(span)
        .ok()
        .and_then(|d| now.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Metrics and verdict around one center.
#[derive(Debug, Clone)]
pub struct Assessment {
    pub verdict: Verdict,
    pub metrics: BTreeMap<String, WindowMetrics>,
    pub score: f64,
    pub top_events: Vec<Event>,
}

/// Evaluate the rules around one center.
///
/// Windows are half-open, `[now - span, now)`. `events` should already be
/// limited to the longest window; each window then selects by time before
/// any distance is computed for it.
#[must_use]
pub fn assess_center(
    events: &[Event],
    center: (f64, f64),
    radius_km: f64,
    plans: &[WindowPlan],
    rules: &RuleSet,
    now: DateTime<Utc>,
    top_n: usize,
) -> Assessment {
    let earliest = plans
        .iter()
        .map(|p| window_start(now, p.span))
        .min()
        .unwrap_or(now);

    let nearby: Vec<&Event> = events
        .iter()
        .filter(|e| e.event_time >= earliest && e.event_time < now)
        .filter(|e| e.distance_to(center.0, center.1) <= radius_km)
        .collect();

    let mut metrics = BTreeMap::new();
    for plan in plans {
        let since = window_start(now, plan.span);
        let in_window: Vec<&Event> = nearby.iter().copied().filter(|e| e.event_time >= since).collect();
        metrics.insert(plan.name.clone(), window_metrics(&in_window, &plan.thresholds, plan.span));
    }

    let verdict = evaluate(rules, &metrics);
    let activity: f64 = metrics.values().map(|m| m.activity).sum();
    let score = f64::from(verdict.level.rank()) * SEVERITY_SCALE + activity;

    Assessment {
        verdict,
        metrics,
        score,
        top_events: top_by_magnitude(&nearby, top_n),
    }
}

/// Candidate set: recent events at or above the magnitude floor.
///
/// Falls back to every supplied event above the floor when nothing recent
/// qualifies.
fn seed_events<'a>(events: &'a [Event], cfg: &ClusterConfig, now: DateTime<Utc>) -> Vec<&'a Event> {
    let since = window_start(now, cfg.candidate_span);
    let eligible = |e: &&Event| e.magnitude >= cfg.min_magnitude && e.event_time < now;
    let recent: Vec<&Event> = events.iter().filter(eligible).filter(|e| e.event_time >= since).collect();
    if recent.is_empty() {
        debug!("no recent candidate events, seeding from the full window");
        return events.iter().filter(eligible).collect();
    }
    recent
}

/// Distinct epicenters, largest magnitude first, capped.
#[must_use]
pub fn epicenter_candidates(events: &[Event], cfg: &ClusterConfig, now: DateTime<Utc>) -> Vec<(f64, f64)> {
    let mut seeds = seed_events(events, cfg, now);
    seeds.sort_by(|a, b| {
        b.magnitude
            .partial_cmp(&a.magnitude)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.event_time.cmp(&a.event_time))
            .then_with(|| a.fingerprint.cmp(&b.fingerprint))
    });

    let mut seen = HashSet::new();
    seeds
        .into_iter()
        .filter(|e| seen.insert((e.latitude.to_bits(), e.longitude.to_bits())))
        .map(|e| (e.latitude, e.longitude))
        .take(cfg.max_candidates)
        .collect()
}

/// Running-mean centroid of a growing group.
#[derive(Debug, Clone, Copy)]
struct Centroid {
    lat_sum: f64,
    lon_sum: f64,
    members: u32,
}

impl Centroid {
    fn position(&self) -> (f64, f64) {
        let n = f64::from(self.members);
        (self.lat_sum / n, self.lon_sum / n)
    }
}

/// Incremental grouping, oldest event first.
///
/// Each event joins the nearest centroid within `radius_km`, otherwise opens
/// a new group while fewer than `max_candidates` exist.
#[must_use]
pub fn incremental_candidates(
    events: &[Event],
    cfg: &ClusterConfig,
    radius_km: f64,
    now: DateTime<Utc>,
) -> Vec<(f64, f64)> {
    let mut seeds = seed_events(events, cfg, now);
    seeds.sort_by(|a, b| {
        a.event_time
            .cmp(&b.event_time)
            .then_with(|| a.fingerprint.cmp(&b.fingerprint))
    });

    let mut groups: Vec<Centroid> = Vec::new();
    for e in seeds {
        let nearest = groups
            .iter()
            .enumerate()
            .map(|(i, g)| {
                let (lat, lon) = g.position();
                (i, e.distance_to(lat, lon))
            })
            .filter(|(_, d)| *d <= radius_km)
            .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal).then(a.0.cmp(&b.0)));

        match nearest {
            Some((i, _)) => {
                let g = &mut groups[i];
                g.lat_sum += e.latitude;
                g.lon_sum += e.longitude;
                g.members += 1;
            }
            None if groups.len() < cfg.max_candidates => groups.push(Centroid {
                lat_sum: e.latitude,
                lon_sum: e.longitude,
                members: 1,
            }),
            None => {}
        }
    }

    groups.iter().map(Centroid::position).collect()
}

/// The winning cluster of one search.
#[derive(Debug, Clone)]
pub struct ClusterPick {
    pub center: (f64, f64),
    pub assessment: Assessment,
    pub candidates: usize,
}

/// Search for the most severe neighborhood.
///
/// Returns `None` when no candidate reaches ORANGE. Exact score ties go to
/// the smaller (lat, lon), then to the earlier candidate.
#[must_use]
pub fn find_best(
    events: &[Event],
    radius_km: f64,
    plans: &[WindowPlan],
    rules: &RuleSet,
    cfg: &ClusterConfig,
    now: DateTime<Utc>,
    top_n: usize,
) -> Option<ClusterPick> {
    let candidates = match cfg.strategy {
        CandidateStrategy::Epicenters => epicenter_candidates(events, cfg, now),
        CandidateStrategy::Incremental => incremental_candidates(events, cfg, radius_km, now),
    };
    debug!("assessing {} cluster candidates", candidates.len());

    let mut best: Option<((f64, f64), Assessment)> = None;
    for center in &candidates {
        let assessment = assess_center(events, *center, radius_km, plans, rules, now, top_n);
        let better = match &best {
            None => true,
            Some((best_center, best_assessment)) => {
                match assessment.score.total_cmp(&best_assessment.score) {
                    Ordering::Greater => true,
                    Ordering::Less => false,
                    Ordering::Equal => {
                        center.0.total_cmp(&best_center.0).then(center.1.total_cmp(&best_center.1))
                            == Ordering::Less
                    }
                }
            }
        };
        if better {
            best = Some((*center, assessment));
        }
    }

    let (center, assessment) = best?;
    if assessment.verdict.level == Severity::Normal {
        return None;
    }
    Some(ClusterPick {
        center,
        assessment,
        candidates: candidates.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::fixtures::event;
    use crate::rules::{Condition, Rule};
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 11, 20, 12, 0, 0).unwrap()
    }

    fn plans() -> Vec<WindowPlan> {
        let windows = vec![
            WindowConfig::new("24h", Duration::from_secs(86_400)),
            WindowConfig::new("7d", Duration::from_secs(7 * 86_400)),
        ];
        plan_windows(&windows, &rules(), &[3.0])
    }

    fn rules() -> RuleSet {
        RuleSet {
            red: vec![Rule {
                id: "red-7d-m6.5".into(),
                condition: Condition::CountAtLeast {
                    window: "7d".into(),
                    min_magnitude: 6.5,
                    count: 1,
                },
            }],
            orange: vec![Rule {
                id: "orange-7d-m3x4".into(),
                condition: Condition::CountAtLeast {
                    window: "7d".into(),
                    min_magnitude: 3.0,
                    count: 4,
                },
            }],
        }
    }

    /// Five M3.0-3.5 events within 10 km of (39, 27) and one M6.0 at (38, 28).
    fn two_groups() -> Vec<Event> {
        let h = |n| now() - TimeDelta::hours(n);
        vec![
            event(h(50), 39.00, 27.00, 3.0),
            event(h(40), 39.05, 27.02, 3.1),
            event(h(30), 38.97, 26.96, 3.5),
            event(h(20), 39.02, 27.05, 3.2),
            event(h(10), 38.98, 27.01, 3.3),
            event(h(5), 38.00, 28.00, 6.0),
        ]
    }

    fn centroid(events: &[Event]) -> (f64, f64) {
        let n = f64::from(u32::try_from(events.len()).unwrap());
        (
            events.iter().map(|e| e.latitude).sum::<f64>() / n,
            events.iter().map(|e| e.longitude).sum::<f64>() / n,
        )
    }

    #[test]
    fn test_plan_windows_merges_thresholds() {
        let p = plans();
        assert_eq!(p[0].thresholds, vec![3.0]);
        assert_eq!(p[1].thresholds, vec![3.0, 6.5, 3.0]);
    }

    #[test]
    fn test_window_start_saturates() {
        assert_eq!(window_start(now(), Duration::from_secs(3_600)), now() - TimeDelta::hours(1));
        assert_eq!(window_start(now(), Duration::MAX), DateTime::<Utc>::MIN_UTC);
    }

    #[test]
    fn test_incremental_groups_by_proximity() {
        let events = two_groups();
        let centers = incremental_candidates(&events, &ClusterConfig::default(), 50.0, now());
        assert_eq!(centers.len(), 2);

        let expected = centroid(&events[..5]);
        assert!((centers[0].0 - expected.0).abs() < 1e-9);
        assert!((centers[0].1 - expected.1).abs() < 1e-9);
        assert_eq!(centers[1], (38.0, 28.0));
    }

    #[test]
    fn test_incremental_respects_cap() {
        let cfg = ClusterConfig {
            max_candidates: 1,
            ..ClusterConfig::default()
        };
        let centers = incremental_candidates(&two_groups(), &cfg, 50.0, now());
        assert_eq!(centers.len(), 1);
    }

    #[test]
    fn test_epicenters_ordered_and_distinct() {
        let mut events = two_groups();
        events.push(event(now() - TimeDelta::hours(1), 38.0, 28.0, 2.0));
        let cfg = ClusterConfig {
            strategy: CandidateStrategy::Epicenters,
            ..ClusterConfig::default()
        };
        let centers = epicenter_candidates(&events, &cfg, now());
        assert_eq!(centers.len(), 6);
        assert_eq!(centers[0], (38.0, 28.0));
        assert_eq!(centers[1], (38.97, 26.96));

        let capped = ClusterConfig { max_candidates: 2, ..cfg };
        assert_eq!(epicenter_candidates(&events, &capped, now()).len(), 2);
    }

    #[test]
    fn test_seed_falls_back_to_older_events() {
        let old = vec![event(now() - TimeDelta::days(20), 39.0, 27.0, 5.2)];
        let centers = incremental_candidates(&old, &ClusterConfig::default(), 50.0, now());
        assert_eq!(centers, vec![(39.0, 27.0)]);
    }

    #[test]
    fn test_find_best_selects_active_group() {
        let events = two_groups();
        let pick = find_best(&events, 50.0, &plans(), &rules(), &ClusterConfig::default(), now(), 3)
            .expect("group 1 should trigger ORANGE");

        let expected = centroid(&events[..5]);
        assert!((pick.center.0 - expected.0).abs() < 1e-9);
        assert!((pick.center.1 - expected.1).abs() < 1e-9);
        assert_eq!(pick.assessment.verdict.level, Severity::Orange);
        assert_eq!(pick.assessment.verdict.reasons[0].rule, "orange-7d-m3x4");
        assert_eq!(pick.candidates, 2);
        assert_eq!(pick.assessment.metrics["7d"].count_at(3.0), Some(5));
        assert_eq!(pick.assessment.top_events.len(), 3);
        assert!((pick.assessment.top_events[0].magnitude - 3.5).abs() < 1e-9);
    }

    #[test]
    fn test_find_best_is_deterministic() {
        let events = two_groups();
        let mut shuffled = events.clone();
        shuffled.reverse();

        for strategy in [CandidateStrategy::Incremental, CandidateStrategy::Epicenters] {
            let cfg = ClusterConfig {
                strategy,
                ..ClusterConfig::default()
            };
            let a = find_best(&events, 50.0, &plans(), &rules(), &cfg, now(), 3).unwrap();
            let b = find_best(&shuffled, 50.0, &plans(), &rules(), &cfg, now(), 3).unwrap();
            assert_eq!(a.center, b.center);
            assert!((a.assessment.score - b.assessment.score).abs() < f64::EPSILON);
        }
    }

    #[test]
    fn test_find_best_none_when_quiet() {
        let events = vec![event(now() - TimeDelta::hours(3), 39.0, 27.0, 2.0)];
        assert!(find_best(&events, 50.0, &plans(), &rules(), &ClusterConfig::default(), now(), 3).is_none());
        assert!(find_best(&[], 50.0, &plans(), &rules(), &ClusterConfig::default(), now(), 3).is_none());
    }

    #[test]
    fn test_assess_center_windows_filter_by_time() {
        let events = two_groups();
        let a = assess_center(&events, (39.0, 27.0), 50.0, &plans(), &rules(), now(), 5);
        // Only the 20h and 10h events fall in the last 24 hours
        assert_eq!(a.metrics["24h"].total, 2);
        assert_eq!(a.metrics["7d"].total, 5);
        assert!(a.score >= SEVERITY_SCALE);
    }
}
