//! Layered alarm rules.
//!
//! A rule is a named condition tree over window metrics. RED rules are tried
//! before ORANGE rules and the first match decides the level. Evaluation only
//! sees metrics that were already aggregated; it never touches storage.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::{Reason, Severity, WindowMetrics};
use crate::normalize::MAGNITUDE_RANGE;

/// Window name used by the single-event quick trigger rules.
pub const QUICK_WINDOW: &str = "quick";

/// Condition over aggregated window metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    /// At least `count` events with magnitude ≥ `min_magnitude` in `window`
    CountAtLeast {
        window: String,
        min_magnitude: f64,
        count: usize,
    },
    /// Largest magnitude in `window` is ≥ `magnitude`
    MaxAtLeast { window: String, magnitude: f64 },
    /// Activity summed over `windows` is ≥ `score`
    ActivityAtLeast { windows: Vec<String>, score: f64 },
    /// Every inner condition holds
    All(Vec<Condition>),
    /// Any inner condition holds
    Any(Vec<Condition>),
}

impl Condition {
    /// Check the condition, returning the observed values if it holds.
    #[must_use]
    pub fn check(&self, metrics: &BTreeMap<String, WindowMetrics>) -> Option<String> {
        match self {
            Self::CountAtLeast {
                window,
                min_magnitude,
                count,
            } => {
                let Some(observed) = metrics.get(window).and_then(|m| m.count_at(*min_magnitude)) else {
                    debug!("no count for m>={min_magnitude} in window {window}");
                    return None;
                };
                (observed >= *count)
                    .then(|| format!("count(m>={min_magnitude:.1}, {window})={observed} >= {count}"))
            }
            Self::MaxAtLeast { window, magnitude } => {
                let observed = metrics.get(window)?.max_magnitude;
                (observed >= *magnitude).then(|| format!("max({window})={observed:.1} >= {magnitude:.1}"))
            }
            Self::ActivityAtLeast { windows, score } => {
                if windows.is_empty() {
                    return None;
                }
                let observed: f64 = windows
                    .iter()
                    .map(|w| metrics.get(w).map(|m| m.activity))
                    .sum::<Option<f64>>()?;
                (observed >= *score).then(|| format!("activity({})={observed:.2} >= {score:.2}", windows.join("+")))
            }
            Self::All(inner) => {
                if inner.is_empty() {
                    return None;
                }
                let parts: Option<Vec<String>> = inner.iter().map(|c| c.check(metrics)).collect();
                parts.map(|p| p.join(" and "))
            }
            Self::Any(inner) => inner.iter().find_map(|c| c.check(metrics)),
        }
    }

    /// Visit every (window, count threshold) this condition reads.
    ///
    /// `MaxAtLeast` leaves report `None` as threshold.
    pub fn visit(&self, f: &mut impl FnMut(&str, Option<f64>)) {
        match self {
            Self::CountAtLeast {
                window, min_magnitude, ..
            } => f(window, Some(*min_magnitude)),
            Self::MaxAtLeast { window, .. } => f(window, None),
            Self::ActivityAtLeast { windows, .. } => {
                for w in windows {
                    f(w, None);
                }
            }
            Self::All(inner) | Self::Any(inner) => {
                for c in inner {
                    c.visit(f);
                }
            }
        }
    }

    /// Check that every threshold in the tree is usable.
    ///
    /// # Errors
    ///
    /// Returns a description of the first bad threshold.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::CountAtLeast {
                window,
                min_magnitude,
                count,
            } => {
                check_magnitude(*min_magnitude).map_err(|e| format!("count_at_least({window}).min_magnitude {e}"))?;
                if *count == 0 {
                    return Err(format!("count_at_least({window}).count must be positive"));
                }
                Ok(())
            }
            Self::MaxAtLeast { window, magnitude } => {
                check_magnitude(*magnitude).map_err(|e| format!("max_at_least({window}).magnitude {e}"))
            }
            Self::ActivityAtLeast { windows, score } => {
                if windows.is_empty() {
                    return Err("activity_at_least needs at least one window".into());
                }
                if !(score.is_finite() && *score > 0.0) {
                    return Err(format!("activity_at_least.score {score} must be positive"));
                }
                Ok(())
            }
            Self::All(inner) | Self::Any(inner) => {
                if inner.is_empty() {
                    return Err("all/any needs at least one condition".into());
                }
                inner.iter().try_for_each(Condition::validate)
            }
        }
    }
}

/// Magnitude thresholds must be finite and in [0, 10].
fn check_magnitude(value: f64) -> Result<(), String> {
    if value.is_finite() && MAGNITUDE_RANGE.contains(&value) {
        Ok(())
    } else {
        Err(format!("{value} outside [0, 10]"))
    }
}

/// A named condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    #[serde(with = "serde_yaml::with::singleton_map_recursive")]
    pub condition: Condition,
}

/// Ordered RED and ORANGE rules for one region.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default)]
    pub red: Vec<Rule>,
    #[serde(default)]
    pub orange: Vec<Rule>,
}

impl RuleSet {
    /// Rules with their severity, RED first.
    pub fn iter(&self) -> impl Iterator<Item = (Severity, &Rule)> {
        self.red
            .iter()
            .map(|r| (Severity::Red, r))
            .chain(self.orange.iter().map(|r| (Severity::Orange, r)))
    }

    /// Count thresholds the rules read from `window`.
    #[must_use]
    pub fn thresholds_for(&self, window: &str) -> Vec<f64> {
        let mut out = Vec::new();
        for (_, rule) in self.iter() {
            rule.condition.visit(&mut |w, t| {
                if let Some(t) = t.filter(|_| w == window) {
                    out.push(t);
                }
            });
        }
        out
    }

    /// Prepend the quick trigger rules to their severity lists.
    #[must_use]
    pub fn with_quick_trigger(mut self, quick: &QuickTrigger) -> Self {
        let (red, orange) = quick.rules();
        self.red.insert(0, red);
        self.orange.insert(0, orange);
        self
    }
}

/// Immediate verdict from one large recent event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuickTrigger {
    /// Look-back in hours
    pub hours: u32,
    pub orange_mag: f64,
    pub red_mag: f64,
}

impl Default for QuickTrigger {
    fn default() -> Self {
        Self {
            hours: 24,
            orange_mag: 4.5,
            red_mag: 5.0,
        }
    }
}

impl QuickTrigger {
    /// Check hours and magnitudes.
    ///
    /// # Errors
    ///
    /// Returns a description of the first bad value.
    pub fn validate(&self) -> Result<(), String> {
        if self.hours == 0 {
            return Err("quick_trigger.hours must be positive".into());
        }
        check_magnitude(self.orange_mag).map_err(|e| format!("quick_trigger.orange_mag {e}"))?;
        check_magnitude(self.red_mag).map_err(|e| format!("quick_trigger.red_mag {e}"))?;
        if self.orange_mag > self.red_mag {
            return Err(format!(
                "quick_trigger.orange_mag {} exceeds red_mag {}",
                self.orange_mag, self.red_mag
            ));
        }
        Ok(())
    }

    /// Length of the quick window.
    #[must_use]
    pub fn span(&self) -> Duration {
        Duration::from_secs(u64::from(self.hours) * 3_600)
    }

    /// The RED and ORANGE single-event rules.
    #[must_use]
    pub fn rules(&self) -> (Rule, Rule) {
        let rule = |id: &str, magnitude: f64| Rule {
            id: id.to_string(),
            condition: Condition::MaxAtLeast {
                window: QUICK_WINDOW.to_string(),
                magnitude,
            },
        };
        (rule("quick-red", self.red_mag), rule("quick-orange", self.orange_mag))
    }
}

/// Level and the rule that decided it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Verdict {
    pub level: Severity,
    pub reasons: Vec<Reason>,
}

/// Apply a rule set to window metrics.
///
/// The first matching RED rule wins; otherwise the first matching ORANGE
/// rule; otherwise NORMAL.
#[must_use]
pub fn evaluate(rules: &RuleSet, metrics: &BTreeMap<String, WindowMetrics>) -> Verdict {
    for (severity, rule) in rules.iter() {
        if let Some(detail) = rule.condition.check(metrics) {
            debug!("rule {} fired ({severity}): {detail}", rule.id);
            return Verdict {
                level: severity,
                reasons: vec![Reason {
                    rule: rule.id.clone(),
                    severity,
                    detail,
                }],
            };
        }
    }
    Verdict::default()
}
