//! Ingestion and evaluation runs.
//!
//! `ingest` takes feed rows through normalization into the store and applies
//! retention. `evaluate` reads the store once and produces one
//! [`AlarmResult`] per configured region.

use std::thread;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, NaiveTime, TimeDelta, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::cluster::{self, assess_center, plan_windows, window_start};
use crate::config::{Config, RegionConfig, WindowConfig};
use crate::errors::{Result, SeismoalarmError};
use crate::models::{AlarmResult, Event};
use crate::normalize::{Normalizer, local_to_utc};
use crate::store::{EventStore, MAX_WRITE_ATTEMPTS, UpsertOutcome, is_transient};

/// Pause between whole-batch retries after a transient commit failure.
const BATCH_RETRY_BACKOFF: Duration = Duration::from_millis(200);

/// Counters from one ingestion run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    /// Rows normalized into events
    pub parsed: usize,
    /// Rows rejected by the normalizer
    pub skipped: usize,
    pub inserted: usize,
    pub duplicates: usize,
    /// Events dropped after storage errors
    pub failed: usize,
    /// Rows removed by retention
    pub evicted: usize,
}

/// Normalize feed rows, store new events, then enforce retention.
///
/// Unusable rows and per-row storage failures are counted rather than
/// returned. A transient failure of the whole batch is retried a bounded
/// number of times before its events are counted as failed.
///
/// # Errors
///
/// Returns an error for non-transient storage failures.
#[instrument(skip(store, normalizer, lines))]
pub fn ingest<'a, I>(store: &mut EventStore, normalizer: &Normalizer, lines: I, capacity: usize) -> Result<IngestReport>
where
    I: IntoIterator<Item = &'a str>,
{
    let batch = normalizer.normalize_lines(lines);
    let mut report = IngestReport {
        parsed: batch.events.len(),
        skipped: batch.skipped,
        ..IngestReport::default()
    };

    let outcome = upsert_with_retry(store, &batch.events)?;
    report.inserted = outcome.inserted;
    report.duplicates = outcome.duplicates;
    report.failed = outcome.failed;
    if report.failed > 0 {
        warn!("{} of {} events could not be stored", report.failed, report.parsed);
    }

    report.evicted = store.enforce_capacity(capacity)?;

    info!(
        "ingested {} rows: {} new, {} duplicate, {} skipped, {} evicted",
        report.parsed + report.skipped,
        report.inserted,
        report.duplicates,
        report.skipped,
        report.evicted
    );
    Ok(report)
}

fn upsert_with_retry(store: &mut EventStore, events: &[Event]) -> Result<UpsertOutcome> {
    let mut attempt = 1;
    loop {
        match store.upsert(events) {
            Ok(outcome) => return Ok(outcome),
            Err(SeismoalarmError::Store(e)) if is_transient(&e) => {
                if attempt >= MAX_WRITE_ATTEMPTS {
                    warn!("store still locked after {attempt} attempts, dropping batch: {e}");
                    return Ok(UpsertOutcome {
                        failed: events.len(),
                        ..UpsertOutcome::default()
                    });
                }
                warn!("store locked on attempt {attempt}, retrying batch");
                thread::sleep(BATCH_RETRY_BACKOFF * attempt);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Evaluate every configured region against the store.
///
/// # Errors
///
/// Returns an error if the store cannot be read.
#[instrument(skip(store, config), fields(now = %now))]
pub fn evaluate(store: &EventStore, config: &Config, now: DateTime<Utc>) -> Result<Vec<AlarmResult>> {
    let since = window_start(now, config.longest_window());
    let events = store.query_window(since, now)?;
    Ok(evaluate_events(&events, config, now))
}

/// Evaluate every configured region against an already loaded event set.
#[must_use]
pub fn evaluate_events(events: &[Event], config: &Config, now: DateTime<Utc>) -> Vec<AlarmResult> {
    let windows = config.evaluation_windows();
    config
        .regions
        .iter()
        .map(|region| {
            let result = evaluate_region(events, region, config, &windows, now);
            info!("region {}: {}", result.region, result.level);
            result
        })
        .collect()
}

fn evaluate_region(
    events: &[Event],
    region: &RegionConfig,
    config: &Config,
    windows: &[WindowConfig],
    now: DateTime<Utc>,
) -> AlarmResult {
    let rules = region.rule_set(config.quick_trigger.as_ref());
    let plans = plan_windows(windows, &rules, &config.report_thresholds);

    let (center, assessment) = match region.center {
        Some(c) => {
            let center = (c.lat, c.lon);
            let a = assess_center(events, center, region.radius_km, &plans, &rules, now, config.top_events);
            (center, a)
        }
        None => {
            let Some(pick) = cluster::find_best(
                events,
                region.radius_km,
                &plans,
                &rules,
                &config.cluster,
                now,
                config.top_events,
            ) else {
                return AlarmResult::quiet(&region.name, region.radius_km, now);
            };
            debug!("region {}: best of {} candidates at {:?}", region.name, pick.candidates, pick.center);
            (pick.center, pick.assessment)
        }
    };

    AlarmResult {
        region: region.name.clone(),
        level: assessment.verdict.level,
        reasons: assessment.verdict.reasons,
        window_metrics: assessment.metrics,
        center: Some(center),
        radius_km: region.radius_km,
        score: assessment.score,
        top_events: assessment.top_events,
        evaluated_at: now,
    }
}

/// Feed versus store comparison for the newest feed day.
#[derive(Debug, Clone, Serialize)]
pub struct Reconciliation {
    /// Newest day in the feed, on the feed clock
    pub day: Option<NaiveDate>,
    pub feed_count: usize,
    pub store_count: usize,
    pub latest_stored: Option<DateTime<Utc>>,
    pub recent_feed: Vec<Event>,
    pub recent_stored: Vec<Event>,
}

impl Reconciliation {
    /// Feed rows for the day that the store does not hold.
    #[must_use]
    pub fn missing(&self) -> isize {
        let feed = isize::try_from(self.feed_count).unwrap_or(isize::MAX);
        let stored = isize::try_from(self.store_count).unwrap_or(isize::MAX);
        feed - stored
    }
}

/// Compare the feed's newest day with what the store holds for that day.
///
/// # Errors
///
/// Returns an error if the store cannot be read.
#[instrument(skip_all)]
pub fn reconcile<'a, I>(store: &EventStore, normalizer: &Normalizer, lines: I, sample: usize) -> Result<Reconciliation>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut feed = normalizer.normalize_lines(lines).events;
    feed.sort_by(|a, b| {
        b.event_time
            .cmp(&a.event_time)
            .then_with(|| a.fingerprint.cmp(&b.fingerprint))
    });

    let clock = normalizer.clock();
    let day = feed.first().map(|e| e.event_time.with_timezone(&clock).date_naive());

    let (feed_count, store_count) = match day {
        Some(day) => {
            let start = local_to_utc(day.and_time(NaiveTime::MIN), clock);
            let end = start + TimeDelta::days(1);
            let in_day = feed
                .iter()
                .filter(|e| e.event_time >= start && e.event_time < end)
                .count();
            (in_day, store.count_between(start, end)?)
        }
        None => (0, 0),
    };

    feed.truncate(sample);
    Ok(Reconciliation {
        day,
        feed_count,
        store_count,
        latest_stored: store.latest_event_time()?,
        recent_feed: feed,
        recent_stored: store.query_recent(sample)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Center, ClusterConfig};
    use crate::models::Severity;
    use crate::rules::{Condition, Rule};
    use chrono::{FixedOffset, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 11, 20, 12, 0, 0).unwrap()
    }

    fn normalizer() -> Normalizer {
        Config::default().normalizer().unwrap()
    }

    /// A KOERI row for an event at `t` (UTC), magnitude in the ML column.
    fn line(t: DateTime<Utc>, lat: f64, lon: f64, mag: f64) -> String {
        let local = t.with_timezone(&FixedOffset::east_opt(3 * 3_600).unwrap());
        format!(
            "{} {lat:.4} {lon:.4} 7.0 -.- {mag:.1} -.- TEST-KOY (BALIKESIR) İlksel",
            local.format("%Y.%m.%d %H:%M:%S")
        )
    }

    fn ingest_lines(store: &mut EventStore, lines: &[String], capacity: usize) -> IngestReport {
        ingest(store, &normalizer(), lines.iter().map(String::as_str), capacity).unwrap()
    }

    fn region(name: &str, center: Option<(f64, f64)>, radius_km: f64, red: Vec<Rule>, orange: Vec<Rule>) -> RegionConfig {
        RegionConfig {
            name: name.into(),
            center: center.map(|(lat, lon)| Center { lat, lon }),
            radius_km,
            quick_trigger: false,
            red,
            orange,
        }
    }

    fn count(window: &str, min_magnitude: f64, count: usize) -> Condition {
        Condition::CountAtLeast {
            window: window.into(),
            min_magnitude,
            count,
        }
    }

    #[test]
    fn test_scenario_a_swarm_orange() {
        let mut store = EventStore::open_in_memory().unwrap();
        let mut lines: Vec<String> = (0..41)
            .map(|i| {
                let t = now() - TimeDelta::minutes(20 * (i + 1));
                let offset = f64::from(u32::try_from(i % 5).unwrap()) * 0.05;
                let mag = 3.0 + f64::from(u32::try_from(i % 10).unwrap()) * 0.1;
                line(t, 40.0 + offset, 28.0 - offset, mag)
            })
            .collect();
        lines.push(line(now() - TimeDelta::hours(2), 40.1, 28.1, 4.2));
        let report = ingest_lines(&mut store, &lines, 1_000);
        assert_eq!(report.inserted, 42);

        let rule = Rule {
            id: "orange-24h-swarm".into(),
            condition: Condition::All(vec![
                count("24h", 3.0, 40),
                Condition::MaxAtLeast {
                    window: "24h".into(),
                    magnitude: 4.0,
                },
            ]),
        };
        let config = Config {
            regions: vec![region("scenario-a", Some((40.0, 28.0)), 100.0, vec![], vec![rule])],
            ..Config::default()
        };

        let results = evaluate(&store, &config, now()).unwrap();
        assert_eq!(results.len(), 1);
        let r = &results[0];
        assert_eq!(r.level, Severity::Orange);
        assert_eq!(r.reasons[0].rule, "orange-24h-swarm");
        assert_eq!(r.window_metrics["24h"].count_at(3.0), Some(42));
        assert!((r.window_metrics["24h"].max_magnitude - 4.2).abs() < 1e-9);
        assert!((r.top_events[0].magnitude - 4.2).abs() < 1e-9);
    }

    #[test]
    fn test_scenario_b_large_event_red() {
        let mut store = EventStore::open_in_memory().unwrap();
        let lines = vec![
            line(now() - TimeDelta::days(3), 40.40, 27.90, 6.6),
            line(now() - TimeDelta::hours(5), 40.30, 27.95, 2.1),
        ];
        ingest_lines(&mut store, &lines, 1_000);

        let results = evaluate(&store, &Config::default(), now()).unwrap();
        let bandirma = results.iter().find(|r| r.region == "bandirma").unwrap();
        assert_eq!(bandirma.level, Severity::Red);
        assert_eq!(bandirma.reasons.len(), 1);
        assert_eq!(bandirma.reasons[0].rule, "red-7d-m6.5");
        assert_eq!(bandirma.center, Some((40.3522, 27.9767)));

        let cluster = results.iter().find(|r| r.region == "turkey-cluster").unwrap();
        assert_eq!(cluster.level, Severity::Red);
    }

    #[test]
    fn test_quick_trigger_fires_first() {
        let mut store = EventStore::open_in_memory().unwrap();
        ingest_lines(&mut store, &[line(now() - TimeDelta::hours(1), 40.35, 27.97, 4.6)], 1_000);

        let results = evaluate(&store, &Config::default(), now()).unwrap();
        let bandirma = results.iter().find(|r| r.region == "bandirma").unwrap();
        assert_eq!(bandirma.level, Severity::Orange);
        assert_eq!(bandirma.reasons[0].rule, "quick-orange");
    }

    #[test]
    fn test_scenario_c_duplicate_lines() {
        let mut store = EventStore::open_in_memory().unwrap();
        let l = line(now() - TimeDelta::hours(1), 40.0, 28.0, 3.1);
        let lines = vec![l.clone(), l];

        let first = ingest_lines(&mut store, &lines, 1_000);
        assert_eq!(first.parsed, 2);
        assert_eq!(first.inserted, 1);
        assert_eq!(first.duplicates, 1);

        let second = ingest_lines(&mut store, &lines, 1_000);
        assert_eq!(second.inserted, 0);
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_scenario_d_capacity() {
        let mut store = EventStore::open_in_memory().unwrap();
        let times: Vec<DateTime<Utc>> = (0..8).map(|i| now() - TimeDelta::hours(8 - i)).collect();
        let lines: Vec<String> = times.iter().map(|t| line(*t, 40.0, 28.0, 2.0)).collect();

        let report = ingest_lines(&mut store, &lines, 5);
        assert_eq!(report.inserted, 8);
        assert_eq!(report.evicted, 3);
        assert_eq!(store.count().unwrap(), 5);

        let kept: Vec<DateTime<Utc>> = store.query_recent(10).unwrap().iter().map(|e| e.event_time).collect();
        let expected: Vec<DateTime<Utc>> = times.iter().rev().take(5).copied().collect();
        assert_eq!(kept, expected);
    }

    #[test]
    fn test_scenario_e_cluster_centroid() {
        let mut store = EventStore::open_in_memory().unwrap();
        let group1 = [
            (39.00, 27.00, 3.0),
            (39.05, 27.02, 3.1),
            (38.97, 26.96, 3.5),
            (39.02, 27.05, 3.2),
            (38.98, 27.01, 3.3),
        ];
        let mut lines: Vec<String> = group1
            .iter()
            .enumerate()
            .map(|(i, &(lat, lon, mag))| {
                let hours = i64::try_from(10 * (i + 1)).unwrap();
                line(now() - TimeDelta::hours(hours), lat, lon, mag)
            })
            .collect();
        lines.push(line(now() - TimeDelta::hours(3), 38.0, 28.0, 6.0));
        ingest_lines(&mut store, &lines, 1_000);

        let red = Rule {
            id: "red-7d-m6.5".into(),
            condition: count("7d", 6.5, 1),
        };
        let orange = Rule {
            id: "orange-7d-m3x4".into(),
            condition: count("7d", 3.0, 4),
        };
        let config = Config {
            regions: vec![region("cluster", None, 50.0, vec![red], vec![orange])],
            cluster: ClusterConfig::default(),
            ..Config::default()
        };

        let results = evaluate(&store, &config, now()).unwrap();
        let r = &results[0];
        assert_eq!(r.level, Severity::Orange);
        assert_eq!(r.reasons[0].rule, "orange-7d-m3x4");

        let (lat, lon) = r.center.unwrap();
        let mean_lat = group1.iter().map(|g| g.0).sum::<f64>() / 5.0;
        let mean_lon = group1.iter().map(|g| g.1).sum::<f64>() / 5.0;
        assert!((lat - mean_lat).abs() < 1e-9);
        assert!((lon - mean_lon).abs() < 1e-9);
    }

    #[test]
    fn test_cluster_region_quiet_has_no_center() {
        let store = EventStore::open_in_memory().unwrap();
        let config = Config::default();
        let results = evaluate(&store, &config, now()).unwrap();
        let cluster = results.iter().find(|r| r.region == "turkey-cluster").unwrap();
        assert_eq!(cluster.level, Severity::Normal);
        assert!(cluster.center.is_none());
        assert!(cluster.reasons.is_empty());

        let bandirma = results.iter().find(|r| r.region == "bandirma").unwrap();
        assert_eq!(bandirma.level, Severity::Normal);
        assert_eq!(bandirma.window_metrics["30d"].total, 0);
    }

    #[test]
    fn test_skipped_rows_do_not_abort() {
        let mut store = EventStore::open_in_memory().unwrap();
        let lines = vec![
            "garbage".to_string(),
            "2025.11.20 10:00:00 99.0 28.0 7.0 -.- 3.1 -.- NOWHERE İlksel".to_string(),
            line(now() - TimeDelta::hours(1), 40.0, 28.0, 3.1),
        ];
        let report = ingest_lines(&mut store, &lines, 1_000);
        assert_eq!(report.skipped, 2);
        assert_eq!(report.inserted, 1);
    }

    #[test]
    fn test_events_outside_windows_ignored() {
        let mut store = EventStore::open_in_memory().unwrap();
        let lines = vec![
            line(now() - TimeDelta::days(40), 40.35, 27.97, 6.8),
            line(now() + TimeDelta::hours(1), 40.35, 27.97, 6.8),
        ];
        ingest_lines(&mut store, &lines, 1_000);

        let results = evaluate(&store, &Config::default(), now()).unwrap();
        assert!(results.iter().all(|r| r.level == Severity::Normal));
    }

    #[test]
    fn test_combined_score_region() {
        let near = |n: usize| -> Vec<String> {
            (0..n)
                .map(|i| {
                    let minutes = i64::try_from(30 * (i + 1)).unwrap();
                    line(now() - TimeDelta::minutes(minutes), 40.35, 27.97, 2.0)
                })
                .collect()
        };

        // 3 x weight 1.5 over 90d+30d+7d+24h is about 7.5
        let mut store = EventStore::open_in_memory().unwrap();
        ingest_lines(&mut store, &near(3), 1_000);
        let results = evaluate(&store, &Config::default(), now()).unwrap();
        let score = results.iter().find(|r| r.region == "bandirma-score").unwrap();
        assert_eq!(score.level, Severity::Orange);
        assert_eq!(score.reasons[0].rule, "orange-combined-score");
        assert!(score.reasons[0].detail.starts_with("activity(90d+30d+7d+24h)=7.50"), "{}", score.reasons[0].detail);
        let bandirma = results.iter().find(|r| r.region == "bandirma").unwrap();
        assert_eq!(bandirma.level, Severity::Normal);

        // 5 events push the sum to about 12.5
        let mut store = EventStore::open_in_memory().unwrap();
        ingest_lines(&mut store, &near(5), 1_000);
        let results = evaluate(&store, &Config::default(), now()).unwrap();
        let score = results.iter().find(|r| r.region == "bandirma-score").unwrap();
        assert_eq!(score.level, Severity::Red);
        assert_eq!(score.reasons[0].rule, "red-combined-score");
    }

    #[test]
    fn test_locked_store_counts_failed_events() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.db");
        let mut store = EventStore::open_with_busy_timeout(&path, Duration::from_millis(20)).unwrap();
        let lines = vec![
            line(now() - TimeDelta::hours(2), 40.0, 28.0, 2.5),
            line(now() - TimeDelta::hours(1), 40.1, 28.0, 2.6),
        ];

        let writer = rusqlite::Connection::open(&path).unwrap();
        writer.execute_batch("BEGIN IMMEDIATE").unwrap();

        let report = ingest_lines(&mut store, &lines, 1_000);
        assert_eq!(report.parsed, 2);
        assert_eq!(report.failed, report.parsed);
        assert_eq!(report.inserted, 0);

        writer.execute_batch("ROLLBACK").unwrap();
        let report = ingest_lines(&mut store, &lines, 1_000);
        assert_eq!(report.inserted, 2);
        assert_eq!(report.failed, 0);
    }

    #[test]
    fn test_reconcile_newest_day() {
        let mut store = EventStore::open_in_memory().unwrap();
        let a = line(now() - TimeDelta::hours(2), 40.0, 28.0, 2.0);
        let b = line(now() - TimeDelta::hours(1), 40.1, 28.0, 2.1);
        let c = line(now() - TimeDelta::minutes(30), 40.2, 28.0, 2.2);
        let old = line(now() - TimeDelta::days(2), 40.0, 28.0, 2.0);
        ingest_lines(&mut store, &[a.clone(), b.clone(), old.clone()], 1_000);

        let feed = [c, b, a, old];
        let rec = reconcile(&store, &normalizer(), feed.iter().map(String::as_str), 2).unwrap();
        assert_eq!(rec.day, NaiveDate::from_ymd_opt(2025, 11, 20));
        assert_eq!(rec.feed_count, 3);
        assert_eq!(rec.store_count, 2);
        assert_eq!(rec.missing(), 1);
        assert_eq!(rec.recent_feed.len(), 2);
        assert_eq!(rec.recent_stored.len(), 2);
        assert_eq!(rec.latest_stored, Some(now() - TimeDelta::hours(1)));
    }

    #[test]
    fn test_reconcile_empty_feed() {
        let store = EventStore::open_in_memory().unwrap();
        let rec = reconcile(&store, &normalizer(), std::iter::empty::<&str>(), 5).unwrap();
        assert!(rec.day.is_none());
        assert_eq!(rec.missing(), 0);
        assert!(rec.latest_stored.is_none());
    }
}
