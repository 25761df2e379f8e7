//! Configuration.
//!
//! One immutable value loaded from YAML (or built-in defaults), validated
//! before anything is evaluated, then passed by reference to each component.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::FixedOffset;
use serde::Deserialize;

use crate::errors::{Result, SeismoalarmError};
use crate::geo::valid_coordinates;
use crate::normalize::{FieldLayout, Normalizer};
use crate::rules::{Condition, QUICK_WINDOW, QuickTrigger, Rule, RuleSet};

/// KOERI "last 500 events" listing.
pub const DEFAULT_FEED_URL: &str = "http://www.koeri.boun.edu.tr/scripts/lst6.asp";

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Provenance tag written on every event. Default: "koeri".
    pub source: String,

    /// Where the feed is fetched from when no input file is given.
    pub feed_url: String,

    /// Offset of the feed's wall clock from UTC, e.g. "+03:00".
    pub source_clock_utc_offset: String,

    /// SQLite database file.
    pub db_path: PathBuf,

    /// Retention cap; the oldest events beyond it are evicted.
    pub storage_capacity_max_rows: usize,

    /// Named trailing windows used by rules and reports.
    pub windows: Vec<WindowConfig>,

    /// Thresholds always counted in every window, besides those rules read.
    pub report_thresholds: Vec<f64>,

    /// Single-event trigger; `None` disables it everywhere.
    pub quick_trigger: Option<QuickTrigger>,

    /// Column layout of feed rows.
    pub layout: FieldLayout,

    /// Candidate search for regions without a fixed center.
    pub cluster: ClusterConfig,

    /// Regions to evaluate.
    pub regions: Vec<RegionConfig>,

    /// Size of the `top_events` sample in each result.
    pub top_events: usize,
}

/// A named trailing window.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WindowConfig {
    pub name: String,
    #[serde(with = "humantime_serde")]
    pub span: Duration,
}

impl WindowConfig {
    #[must_use]
    pub fn new(name: &str, span: Duration) -> Self {
        Self {
            name: name.to_string(),
            span,
        }
    }
}

/// How the cluster finder picks candidate centers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CandidateStrategy {
    /// Every distinct epicenter in the candidate set
    Epicenters,
    /// Incremental grouping around running-mean centroids
    #[default]
    Incremental,
}

/// Cluster finder configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub strategy: CandidateStrategy,

    /// Only events this recent seed candidates. Default: 14 days.
    #[serde(with = "humantime_serde")]
    pub candidate_span: Duration,

    /// Only events at least this large seed candidates.
    pub min_magnitude: f64,

    /// Upper bound on candidates per evaluation.
    pub max_candidates: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            strategy: CandidateStrategy::default(),
            candidate_span: days(14),
            min_magnitude: 0.0,
            max_candidates: 250,
        }
    }
}

/// Fixed region center.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct Center {
    pub lat: f64,
    pub lon: f64,
}

/// One region and its rules.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RegionConfig {
    pub name: String,

    /// Fixed center; absent means "search for the most active cluster".
    #[serde(default)]
    pub center: Option<Center>,

    pub radius_km: f64,

    /// Whether the global quick trigger applies here.
    #[serde(default = "default_true")]
    pub quick_trigger: bool,

    #[serde(default)]
    pub red: Vec<Rule>,

    #[serde(default)]
    pub orange: Vec<Rule>,
}

impl RegionConfig {
    /// The effective rule set, quick trigger rules first.
    #[must_use]
    pub fn rule_set(&self, quick: Option<&QuickTrigger>) -> RuleSet {
        let rules = RuleSet {
            red: self.red.clone(),
            orange: self.orange.clone(),
        };
        match quick {
            Some(q) if self.quick_trigger => rules.with_quick_trigger(q),
            _ => rules,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Windows summed by the default combined-score rules.
const COMBINED_WINDOWS: [&str; 4] = ["90d", "30d", "7d", "24h"];

const fn days(n: u64) -> Duration {
    Duration::from_secs(n * 86_400)
}

fn count(window: &str, min_magnitude: f64, count: usize) -> Condition {
    Condition::CountAtLeast {
        window: window.to_string(),
        min_magnitude,
        count,
    }
}

fn max(window: &str, magnitude: f64) -> Condition {
    Condition::MaxAtLeast {
        window: window.to_string(),
        magnitude,
    }
}

fn activity(windows: &[&str], score: f64) -> Condition {
    Condition::ActivityAtLeast {
        windows: windows.iter().map(|w| (*w).to_string()).collect(),
        score,
    }
}

fn rule(id: &str, condition: Condition) -> Rule {
    Rule {
        id: id.to_string(),
        condition,
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source: "koeri".to_string(),
            feed_url: DEFAULT_FEED_URL.to_string(),
            source_clock_utc_offset: "+03:00".to_string(),
            db_path: PathBuf::from("deprem.db"),
            storage_capacity_max_rows: 50_000,
            windows: vec![
                WindowConfig::new("24h", Duration::from_secs(24 * 3_600)),
                WindowConfig::new("7d", days(7)),
                WindowConfig::new("14d", days(14)),
                WindowConfig::new("30d", days(30)),
                WindowConfig::new("90d", days(90)),
            ],
            report_thresholds: vec![3.0, 4.0, 5.0],
            quick_trigger: Some(QuickTrigger::default()),
            layout: FieldLayout::default(),
            cluster: ClusterConfig::default(),
            regions: vec![
                RegionConfig {
                    name: "bandirma".to_string(),
                    center: Some(Center {
                        lat: 40.3522,
                        lon: 27.9767,
                    }),
                    radius_km: 70.0,
                    quick_trigger: true,
                    red: vec![
                        rule("red-7d-m6.5", count("7d", 6.5, 1)),
                        rule("red-30d-m5.8x2", count("30d", 5.8, 2)),
                        rule("red-24h-m4x10", count("24h", 4.0, 10)),
                    ],
                    orange: vec![
                        rule(
                            "orange-24h-swarm",
                            Condition::All(vec![count("24h", 3.0, 40), max("24h", 4.0)]),
                        ),
                        rule(
                            "orange-7d-swarm",
                            Condition::All(vec![count("7d", 3.0, 25), count("7d", 4.0, 2)]),
                        ),
                        rule("orange-30d-m5", count("30d", 5.0, 1)),
                    ],
                },
                RegionConfig {
                    name: "turkey-cluster".to_string(),
                    center: None,
                    radius_km: 70.0,
                    quick_trigger: false,
                    red: vec![rule("red-14d-max5.5", max("14d", 5.5))],
                    orange: vec![rule("orange-30d-max5.0", max("30d", 5.0))],
                },
                RegionConfig {
                    name: "bandirma-score".to_string(),
                    center: Some(Center {
                        lat: 40.3522,
                        lon: 27.9767,
                    }),
                    radius_km: 70.0,
                    quick_trigger: false,
                    red: vec![rule("red-combined-score", activity(&COMBINED_WINDOWS, 10.0))],
                    orange: vec![rule("orange-combined-score", activity(&COMBINED_WINDOWS, 6.0))],
                },
            ],
            top_events: 5,
        }
    }
}

impl Config {
    /// Load configuration from a YAML file and validate it.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Self::from_yaml(&data)
    }

    /// Parse and validate a YAML document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is malformed or inconsistent.
    pub fn from_yaml(data: &str) -> Result<Self> {
        let cfg: Config = serde_yaml::from_str(data)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parsed feed clock offset.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the offset is not `±HH:MM`.
    pub fn clock(&self) -> Result<FixedOffset> {
        parse_offset(&self.source_clock_utc_offset).map_err(SeismoalarmError::Config)
    }

    /// Build the normalizer for this feed.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for a bad offset or layout.
    pub fn normalizer(&self) -> Result<Normalizer> {
        Normalizer::new(self.layout.clone(), self.clock()?, self.source.clone())
    }

    /// Configured windows plus the quick window when the trigger is on.
    #[must_use]
    pub fn evaluation_windows(&self) -> Vec<WindowConfig> {
        let mut windows = self.windows.clone();
        if let Some(quick) = &self.quick_trigger {
            windows.push(WindowConfig::new(QUICK_WINDOW, quick.span()));
        }
        windows
    }

    /// Longest evaluation window, which bounds every storage read.
    #[must_use]
    pub fn longest_window(&self) -> Duration {
        self.evaluation_windows()
            .iter()
            .map(|w| w.span)
            .chain(std::iter::once(self.cluster.candidate_span))
            .max()
            .unwrap_or_default()
    }

    /// Validate the configuration for required fields and consistency.
    ///
    /// # Errors
    ///
    /// Returns [`SeismoalarmError::Config`] describing the first problem.
    pub fn validate(&self) -> Result<()> {
        self.validate_inner().map_err(SeismoalarmError::Config)
    }

    fn validate_inner(&self) -> std::result::Result<(), String> {
        if self.source.trim().is_empty() {
            return Err("source is required".into());
        }
        parse_offset(&self.source_clock_utc_offset)?;
        self.layout.validate().map_err(|e| format!("layout: {e}"))?;

        if self.windows.is_empty() {
            return Err("at least one window is required".into());
        }
        let mut names = HashSet::new();
        for w in &self.windows {
            if w.name.is_empty() {
                return Err("window name is required".into());
            }
            if w.name == QUICK_WINDOW {
                return Err(format!("window name '{QUICK_WINDOW}' is reserved"));
            }
            if w.span.is_zero() {
                return Err(format!("window {} must have a positive span", w.name));
            }
            if !names.insert(w.name.as_str()) {
                return Err(format!("window {} is defined twice", w.name));
            }
        }

        for t in &self.report_thresholds {
            if !t.is_finite() || !crate::normalize::MAGNITUDE_RANGE.contains(t) {
                return Err(format!("report threshold {t} outside [0, 10]"));
            }
        }

        if let Some(q) = &self.quick_trigger {
            q.validate()?;
            names.insert(QUICK_WINDOW);
        }

        if self.cluster.max_candidates == 0 {
            return Err("cluster.max_candidates must be positive".into());
        }
        if self.cluster.candidate_span.is_zero() {
            return Err("cluster.candidate_span must be positive".into());
        }

        if self.regions.is_empty() {
            return Err("at least one region is required".into());
        }
        let mut region_names = HashSet::new();
        for region in &self.regions {
            validate_region(region, &names)?;
            if !region_names.insert(region.name.as_str()) {
                return Err(format!("region {} is defined twice", region.name));
            }
        }

        Ok(())
    }
}

fn parse_offset(raw: &str) -> std::result::Result<FixedOffset, String> {
    raw.parse::<FixedOffset>()
        .map_err(|e| format!("source_clock_utc_offset '{raw}': {e}"))
}

fn validate_region(region: &RegionConfig, windows: &HashSet<&str>) -> std::result::Result<(), String> {
    if region.name.trim().is_empty() {
        return Err("region name is required".into());
    }
    if !(region.radius_km > 0.0 && region.radius_km.is_finite()) {
        return Err(format!("region {}: radius_km must be positive", region.name));
    }
    if let Some(c) = region.center {
        if !valid_coordinates(c.lat, c.lon) {
            return Err(format!("region {}: center {},{} out of range", region.name, c.lat, c.lon));
        }
    }
    if region.red.is_empty() && region.orange.is_empty() && !region.quick_trigger {
        return Err(format!("region {} has no rules", region.name));
    }

    let mut ids = HashSet::new();
    for r in region.red.iter().chain(&region.orange) {
        if r.id.is_empty() {
            return Err(format!("region {}: rule id is required", region.name));
        }
        if !ids.insert(r.id.as_str()) {
            return Err(format!("region {}: rule {} is defined twice", region.name, r.id));
        }
        r.condition
            .validate()
            .map_err(|e| format!("region {}: rule {}: {e}", region.name, r.id))?;
        let mut unknown = None;
        r.condition.visit(&mut |w, _| {
            if !windows.contains(w) && unknown.is_none() {
                unknown = Some(w.to_string());
            }
        });
        if let Some(w) = unknown {
            return Err(format!("region {}: rule {} reads unknown window {w}", region.name, r.id));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = Config::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.clock().unwrap(), FixedOffset::east_opt(3 * 3600).unwrap());
        assert_eq!(cfg.longest_window(), days(90));
        assert_eq!(cfg.evaluation_windows().last().unwrap().name, QUICK_WINDOW);
    }

    #[test]
    fn test_yaml_overrides_and_defaults() {
        let cfg = Config::from_yaml(
            "
source_clock_utc_offset: \"+00:00\"
storage_capacity_max_rows: 100
windows:
  - {name: 1d, span: 1day}
  - {name: 7d, span: 7days}
quick_trigger: null
cluster: {strategy: epicenters, max_candidates: 10}
regions:
  - name: izmir
    center: {lat: 38.42, lon: 27.14}
    radius_km: 50
    orange:
      - id: busy-week
        condition: {count_at_least: {window: 7d, min_magnitude: 3.0, count: 4}}
",
        )
        .unwrap();

        assert_eq!(cfg.storage_capacity_max_rows, 100);
        assert_eq!(cfg.windows[0].span, days(1));
        assert!(cfg.quick_trigger.is_none());
        assert_eq!(cfg.cluster.strategy, CandidateStrategy::Epicenters);
        assert_eq!(cfg.cluster.candidate_span, days(14));
        assert_eq!(cfg.regions.len(), 1);
        assert!(cfg.regions[0].quick_trigger);
        assert_eq!(cfg.regions[0].orange[0].condition, count("7d", 3.0, 4));
        // Untouched fields keep their defaults
        assert_eq!(cfg.source, "koeri");
        assert_eq!(cfg.layout, FieldLayout::default());
    }

    #[test]
    fn test_rule_set_respects_region_quick_flag() {
        let cfg = Config::default();
        let quick = cfg.quick_trigger.as_ref();
        assert_eq!(cfg.regions[0].rule_set(quick).red[0].id, "quick-red");
        assert_eq!(cfg.regions[1].rule_set(quick).red[0].id, "red-14d-max5.5");
    }

    #[test]
    fn test_rejects_unknown_window() {
        let mut cfg = Config::default();
        cfg.regions[0].red.push(rule("bad", count("120d", 5.0, 1)));
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("unknown window 120d"), "{err}");

        let mut cfg = Config::default();
        cfg.regions[2].red.push(rule("bad-sum", activity(&["7d", "365d"], 5.0)));
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("unknown window 365d"), "{err}");
    }

    #[test]
    fn test_quick_window_requires_trigger() {
        let mut cfg = Config::default();
        cfg.regions[1].red.push(rule("q", max(QUICK_WINDOW, 5.0)));
        cfg.validate().unwrap();

        cfg.quick_trigger = None;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_inconsistent_values() {
        let broken: [fn(&mut Config); 19] = [
            |c| c.windows.clear(),
            |c| c.windows.push(WindowConfig::new("7d", days(7))),
            |c| c.windows.push(WindowConfig::new("zero", Duration::ZERO)),
            |c| c.windows.push(WindowConfig::new(QUICK_WINDOW, days(1))),
            |c| c.regions.clear(),
            |c| c.regions[0].radius_km = 0.0,
            |c| c.regions[0].center = Some(Center { lat: 95.0, lon: 0.0 }),
            |c| c.regions.push(c.regions[0].clone()),
            |c| c.source_clock_utc_offset = "three hours".into(),
            |c| c.quick_trigger = Some(QuickTrigger { hours: 24, orange_mag: 6.0, red_mag: 5.0 }),
            |c| c.cluster.max_candidates = 0,
            |c| c.report_thresholds.push(11.0),
            |c| c.layout.magnitude_columns.clear(),
            |c| c.regions[0].red.push(rule("nan", count("7d", f64::NAN, 1))),
            |c| c.regions[0].orange.push(rule("big", max("24h", 10.5))),
            |c| c.regions[0].orange.push(rule("zero", count("24h", 3.0, 0))),
            |c| c.regions[2].red[0] = rule("neg", activity(&COMBINED_WINDOWS, -1.0)),
            |c| c.quick_trigger = Some(QuickTrigger { hours: 24, orange_mag: f64::NAN, red_mag: 5.0 }),
            |c| c.quick_trigger = Some(QuickTrigger { hours: 24, orange_mag: 4.5, red_mag: f64::NAN }),
        ];
        for (i, mutate) in broken.into_iter().enumerate() {
            let mut cfg = Config::default();
            mutate(&mut cfg);
            assert!(cfg.validate().is_err(), "case {i} should be rejected");
        }
    }

    #[test]
    fn test_load_nested_rules_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(
            &mut file,
            b"
windows:
  - {name: 24h, span: 1day}
  - {name: 7d, span: 7days}
  - {name: 90d, span: 90days}
regions:
  - name: bandirma
    center: {lat: 40.3522, lon: 27.9767}
    radius_km: 70
    red:
      - id: red-combined
        condition:
          activity_at_least: {windows: [90d, 7d, 24h], score: 10}
    orange:
      - id: orange-24h-swarm
        condition:
          all:
            - count_at_least: {window: 24h, min_magnitude: 3.0, count: 40}
            - max_at_least: {window: 24h, magnitude: 4.0}
",
        )
        .unwrap();

        let cfg = Config::load(file.path()).unwrap();
        let region = &cfg.regions[0];
        assert_eq!(region.red[0].condition, activity(&["90d", "7d", "24h"], 10.0));
        assert_eq!(
            region.orange[0].condition,
            Condition::All(vec![count("24h", 3.0, 40), max("24h", 4.0)])
        );
        assert_eq!(cfg.longest_window(), days(90));
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load(Path::new("/nonexistent/seismoalarm.yaml")).unwrap_err();
        assert!(matches!(err, SeismoalarmError::Io(_)));
    }
}
