//! Raw feed line normalization.
//!
//! Turns a whitespace-tokenized feed row into a canonical [`Event`] using an
//! explicit, validated [`FieldLayout`]. The feed's local clock is converted to
//! UTC with a configured fixed offset; nothing is inferred per line.

use std::fmt;

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Timelike, Utc};
use serde::Deserialize;
use tracing::debug;
use xxhash_rust::xxh3::xxh3_128;

use crate::errors::{Result, SeismoalarmError};
use crate::geo::valid_coordinates;
use crate::models::{Event, time_key};

/// Accepted magnitude range.
pub const MAGNITUDE_RANGE: std::ops::RangeInclusive<f64> = 0.0..=10.0;

/// Column positions of a feed row.
///
/// Defaults describe the KOERI `lst6` listing:
/// `date time lat lon depth MD ML Mw location... quality`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct FieldLayout {
    pub date: usize,
    pub time: usize,
    pub latitude: usize,
    pub longitude: usize,
    pub depth: usize,

    /// Magnitude columns in priority order; the first in range wins
    pub magnitude_columns: Vec<usize>,

    /// First token of the free-text location
    pub location_start: usize,

    /// Rows with fewer tokens are skipped
    pub min_tokens: usize,

    /// chrono format of the date token
    pub date_format: String,

    /// chrono format of the time token
    pub time_format: String,

    /// When no declared column holds a magnitude, take the first value in
    /// range between the depth column and the location
    pub scan_fallback: bool,
}

impl Default for FieldLayout {
    fn default() -> Self {
        Self {
            date: 0,
            time: 1,
            latitude: 2,
            longitude: 3,
            depth: 4,
            magnitude_columns: vec![7, 6, 5],
            location_start: 8,
            min_tokens: 9,
            date_format: "%Y.%m.%d".to_string(),
            time_format: "%H:%M:%S".to_string(),
            scan_fallback: true,
        }
    }
}

impl FieldLayout {
    fn fixed_columns(&self) -> [usize; 5] {
        [self.date, self.time, self.latitude, self.longitude, self.depth]
    }

    /// Check the layout once, before any line is parsed.
    ///
    /// # Errors
    ///
    /// Returns a description of the first inconsistency found.
    pub fn validate(&self) -> std::result::Result<(), String> {
        let fixed = self.fixed_columns();
        for (i, a) in fixed.iter().enumerate() {
            if fixed[i + 1..].contains(a) {
                return Err(format!("layout column {a} is assigned twice"));
            }
        }
        if self.magnitude_columns.is_empty() {
            return Err("layout needs at least one magnitude column".into());
        }
        for col in &self.magnitude_columns {
            if fixed.contains(col) {
                return Err(format!("magnitude column {col} overlaps a fixed column"));
            }
            if *col >= self.location_start {
                return Err(format!(
                    "magnitude column {col} must precede location_start {}",
                    self.location_start
                ));
            }
        }
        let last_fixed = fixed.iter().copied().max().unwrap_or(0);
        if self.location_start <= last_fixed {
            return Err(format!(
                "location_start {} must follow the fixed columns",
                self.location_start
            ));
        }
        if self.min_tokens <= last_fixed {
            return Err(format!(
                "min_tokens {} does not cover column {last_fixed}",
                self.min_tokens
            ));
        }
        if self.date_format.is_empty() || self.time_format.is_empty() {
            return Err("date_format and time_format must be set".into());
        }
        Ok(())
    }
}

/// Why a row was excluded from storage.
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    TooFewTokens { found: usize, required: usize },
    BadDate(String),
    BadCoordinate(String),
    CoordinateOutOfRange { latitude: f64, longitude: f64 },
    NoMagnitude,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooFewTokens { found, required } => {
                write!(f, "{found} tokens, layout requires {required}")
            }
            Self::BadDate(s) => write!(f, "unparsable date/time '{s}'"),
            Self::BadCoordinate(s) => write!(f, "unparsable coordinate '{s}'"),
            Self::CoordinateOutOfRange { latitude, longitude } => {
                write!(f, "coordinate {latitude},{longitude} out of range")
            }
            Self::NoMagnitude => f.write_str("no magnitude in [0, 10]"),
        }
    }
}

/// Outcome of normalizing a batch of rows.
#[derive(Debug, Default)]
pub struct NormalizedBatch {
    pub events: Vec<Event>,
    pub skipped: usize,
}

/// Converts tokenized feed rows into events.
#[derive(Debug, Clone)]
pub struct Normalizer {
    layout: FieldLayout,
    clock: FixedOffset,
    source: String,
}

impl Normalizer {
    /// Create a normalizer for one feed layout and clock.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the layout is inconsistent.
    pub fn new(layout: FieldLayout, clock: FixedOffset, source: impl Into<String>) -> Result<Self> {
        layout.validate().map_err(SeismoalarmError::Config)?;
        Ok(Self {
            layout,
            clock,
            source: source.into(),
        })
    }

    /// Offset of the feed's wall clock.
    #[must_use]
    pub fn clock(&self) -> FixedOffset {
        self.clock
    }

    /// Normalize one row, or `None` if it fails validation.
    #[must_use]
    pub fn normalize(&self, tokens: &[&str]) -> Option<Event> {
        match self.parse(tokens) {
            Ok(event) => Some(event),
            Err(reason) => {
                debug!("skipping row: {reason}");
                None
            }
        }
    }

    /// Normalize every non-empty line, counting rows that were skipped.
    pub fn normalize_lines<'a, I>(&self, lines: I) -> NormalizedBatch
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut batch = NormalizedBatch::default();
        for line in lines {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.is_empty() {
                continue;
            }
            match self.normalize(&tokens) {
                Some(event) => batch.events.push(event),
                None => batch.skipped += 1,
            }
        }
        batch
    }

    /// Parse one row into an event.
    ///
    /// # Errors
    ///
    /// Returns the [`SkipReason`] for rows that fail layout or range checks.
    pub fn parse(&self, tokens: &[&str]) -> std::result::Result<Event, SkipReason> {
        let layout = &self.layout;
        if tokens.len() < layout.min_tokens {
            return Err(SkipReason::TooFewTokens {
                found: tokens.len(),
                required: layout.min_tokens,
            });
        }

        let event_time = self.parse_time(tokens[layout.date], tokens[layout.time])?;

        let latitude = parse_coordinate(tokens[layout.latitude])?;
        let longitude = parse_coordinate(tokens[layout.longitude])?;
        if !valid_coordinates(latitude, longitude) {
            return Err(SkipReason::CoordinateOutOfRange { latitude, longitude });
        }

        // Depth is always taken from its fixed column before any magnitude lookup.
        let depth_km = tokens[layout.depth]
            .parse::<f64>()
            .ok()
            .filter(|d| d.is_finite() && *d >= 0.0);

        let magnitude = self.select_magnitude(tokens).ok_or(SkipReason::NoMagnitude)?;

        let location = tokens
            .get(layout.location_start..)
            .map(|rest| rest.join(" "))
            .unwrap_or_default()
            .trim()
            .to_string();

        let fingerprint = fingerprint(event_time, latitude, longitude, magnitude, depth_km, &location);

        Ok(Event {
            event_time,
            latitude,
            longitude,
            depth_km,
            magnitude,
            location,
            source: self.source.clone(),
            fingerprint,
        })
    }

    /// Interpret date and time tokens on the feed clock and convert to UTC.
    fn parse_time(&self, date: &str, time: &str) -> std::result::Result<DateTime<Utc>, SkipReason> {
        let text = format!("{date} {time}");
        let format = format!("{} {}", self.layout.date_format, self.layout.time_format);
        let naive = NaiveDateTime::parse_from_str(&text, &format)
            .map_err(|_| SkipReason::BadDate(text.clone()))?;
        let naive = naive.with_nanosecond(0).unwrap_or(naive);
        Ok(local_to_utc(naive, self.clock))
    }

    fn select_magnitude(&self, tokens: &[&str]) -> Option<f64> {
        let layout = &self.layout;
        let declared = layout
            .magnitude_columns
            .iter()
            .filter_map(|&col| tokens.get(col))
            .find_map(|t| parse_magnitude(t));
        if declared.is_some() || !layout.scan_fallback {
            return declared;
        }

        let end = layout.location_start.min(tokens.len());
        tokens
            .get(layout.depth + 1..end)?
            .iter()
            .find_map(|t| parse_magnitude(t))
    }
}

/// Convert a wall-clock time on a fixed-offset clock to UTC.
#[must_use]
pub fn local_to_utc(naive: NaiveDateTime, clock: FixedOffset) -> DateTime<Utc> {
    // A fixed offset has exactly one mapping for every local time.
    clock
        .from_local_datetime(&naive)
        .single()
        .map_or_else(|| naive.and_utc(), |t| t.with_timezone(&Utc))
}

fn parse_coordinate(token: &str) -> std::result::Result<f64, SkipReason> {
    token
        .parse::<f64>()
        .map_err(|_| SkipReason::BadCoordinate(token.to_string()))
}

fn parse_magnitude(token: &str) -> Option<f64> {
    token
        .parse::<f64>()
        .ok()
        .filter(|m| m.is_finite() && MAGNITUDE_RANGE.contains(m))
}

/// Fixed-point rendering that never yields a negative zero.
fn fixed(value: f64, places: usize) -> String {
    let s = format!("{value:.places$}");
    match s.strip_prefix('-') {
        Some(rest) if rest.chars().all(|c| c == '0' || c == '.') => rest.to_string(),
        _ => s,
    }
}

/// Compute the dedup key of an event.
///
/// Hashes the UTC second, coordinates to 4 decimals, magnitude and depth to
/// 1 decimal, and the trimmed location.
#[must_use]
pub fn fingerprint(
    event_time: DateTime<Utc>,
    latitude: f64,
    longitude: f64,
    magnitude: f64,
    depth_km: Option<f64>,
    location: &str,
) -> String {
    let depth = depth_km.map_or_else(|| "-".to_string(), |d| fixed(d, 1));
    let canonical = format!(
        "{}|{}|{}|{}|{}|{}",
        time_key(event_time),
        fixed(latitude, 4),
        fixed(longitude, 4),
        fixed(magnitude, 1),
        depth,
        location.trim()
    );
    format!("{:032x}", xxh3_128(canonical.as_bytes()))
}
