//! Output formatters for alarm results and events.
//!
//! Supports human-readable (with colors), JSON, and NDJSON formats.

use std::io::{self, Write};

use serde::Serialize;

use crate::geo::distance_km;
use crate::models::{AlarmResult, Event, Severity};
use crate::pipeline::Reconciliation;

// ANSI color codes
const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";

// Magnitude-based colors
const RED: &str = "\x1b[91m"; // mag >= 6.0
const YELLOW: &str = "\x1b[93m"; // mag >= 5.0
const CYAN: &str = "\x1b[96m"; // mag >= 4.0
const GREEN: &str = "\x1b[92m"; // mag >= 3.0
const WHITE: &str = "\x1b[97m";

// Severity badges
const BADGE_NORMAL: &str = "\x1b[42;30m";
const BADGE_ORANGE: &str = "\x1b[48;5;208;30m";
const BADGE_RED: &str = "\x1b[41;97m";

const ICON_QUAKE: &str = "🌍";
const ICON_ALERT: &str = "⚠️";

/// Output format selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Format {
    /// Human-readable terminal output (default)
    #[default]
    Human,
    /// JSON array
    Json,
    /// Newline-delimited JSON (one object per line)
    Ndjson,
}

impl std::str::FromStr for Format {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "human" => Ok(Self::Human),
            "json" => Ok(Self::Json),
            "ndjson" => Ok(Self::Ndjson),
            _ => Err(format!("unknown format: {s} (expected: human, json, ndjson)")),
        }
    }
}

fn magnitude_color(mag: f64) -> &'static str {
    match mag {
        m if m >= 6.0 => RED,
        m if m >= 5.0 => YELLOW,
        m if m >= 4.0 => CYAN,
        m if m >= 3.0 => GREEN,
        _ => WHITE,
    }
}

fn magnitude_label(mag: f64) -> &'static str {
    match mag {
        m if m >= 7.0 => "MAJOR",
        m if m >= 6.0 => "STRONG",
        m if m >= 4.5 => "MODERATE",
        m if m >= 3.0 => "LIGHT",
        m if m >= 2.0 => "MINOR",
        _ => "MICRO",
    }
}

fn severity_badge(level: Severity) -> String {
    let color = match level {
        Severity::Red => BADGE_RED,
        Severity::Orange => BADGE_ORANGE,
        Severity::Normal => BADGE_NORMAL,
    };
    format!("{color} {level} {RESET}")
}

fn write_event_line<W: Write>(writer: &mut W, event: &Event, indent: &str, distance_km: Option<f64>) -> io::Result<()> {
    let time = event.event_time.format("%Y-%m-%d %H:%M:%S");
    let mag = event.magnitude;
    let color = magnitude_color(mag);
    let label = magnitude_label(mag);
    let depth = event
        .depth_km
        .map_or_else(|| "    ?".to_string(), |d| format!("{d:>5.0}"));
    let place = if event.location.is_empty() {
        "Unknown location"
    } else {
        &event.location
    };
    let distance = distance_km.map_or_else(String::new, |d| format!(" │ {d:.1} km away"));

    writeln!(
        writer,
        "{indent}{ICON_QUAKE} {color}{BOLD}M{mag:.1}{RESET} │ \
         {color}{label:8}{RESET} │ \
         {DIM}{depth}km{RESET} │ \
         {time} UTC │ \
         {place}{distance}"
    )
}

/// Write events in human-readable format, one line each.
///
/// # Errors
///
/// Returns an error if writing fails.
pub fn write_human_events<W: Write>(writer: &mut W, events: &[Event]) -> io::Result<()> {
    for event in events {
        write_event_line(writer, event, "", None)?;
    }
    Ok(())
}

/// Write alarm results in human-readable format.
///
/// # Errors
///
/// Returns an error if writing fails.
pub fn write_human_results<W: Write>(writer: &mut W, results: &[AlarmResult]) -> io::Result<()> {
    for result in results {
        let center = result
            .center
            .map_or_else(|| "no cluster".to_string(), |(lat, lon)| format!("{lat:.4}, {lon:.4}"));
        let alert_icon = if result.is_alarm() {
            format!(" {ICON_ALERT}")
        } else {
            String::new()
        };

        writeln!(
            writer,
            "{} {BOLD}{}{RESET}{alert_icon} │ {center} │ {:.0} km │ {DIM}score {:.2}{RESET}",
            severity_badge(result.level),
            result.region,
            result.radius_km,
            result.score
        )?;

        for reason in &result.reasons {
            writeln!(writer, "    {BOLD}{}{RESET}: {}", reason.rule, reason.detail)?;
        }

        for (name, m) in &result.window_metrics {
            let counts: Vec<String> = m
                .counts
                .iter()
                .map(|c| format!("m≥{:.1}:{}", c.min_magnitude, c.count))
                .collect();
            writeln!(
                writer,
                "    {DIM}{name:>5}{RESET} │ {:>4} events │ max {:.1} │ {}",
                m.total,
                m.max_magnitude,
                counts.join(" ")
            )?;
        }

        for event in &result.top_events {
            write_event_line(writer, event, "    ", None)?;
        }
    }
    Ok(())
}

/// Write a feed/store reconciliation summary.
///
/// # Errors
///
/// Returns an error if writing fails.
pub fn write_reconciliation<W: Write>(writer: &mut W, rec: &Reconciliation) -> io::Result<()> {
    let Some(day) = rec.day else {
        return writeln!(writer, "{DIM}feed has no usable rows{RESET}");
    };

    let missing = rec.missing();
    let color = if missing == 0 { GREEN } else { YELLOW };
    writeln!(
        writer,
        "{BOLD}{day}{RESET} │ feed {} │ stored {} │ {color}difference {missing}{RESET}",
        rec.feed_count, rec.store_count
    )?;

    let latest = rec
        .latest_stored
        .map_or_else(|| "none".to_string(), |t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string());
    writeln!(writer, "latest stored: {latest}")?;

    writeln!(writer, "{DIM}── newest in feed{RESET}")?;
    write_human_events(writer, &rec.recent_feed)?;
    writeln!(writer, "{DIM}── newest stored{RESET}")?;
    write_human_events(writer, &rec.recent_stored)
}

/// Write values as a pretty JSON array.
///
/// # Errors
///
/// Returns an error if serialization or writing fails.
pub fn write_json<W: Write, T: Serialize>(writer: &mut W, items: &[T]) -> io::Result<()> {
    let json = serde_json::to_string_pretty(items).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writeln!(writer, "{json}")
}

/// Write values as newline-delimited JSON.
///
/// # Errors
///
/// Returns an error if serialization or writing fails.
pub fn write_ndjson<W: Write, T: Serialize>(writer: &mut W, items: &[T]) -> io::Result<()> {
    for item in items {
        let json = serde_json::to_string(item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        writeln!(writer, "{json}")?;
    }
    Ok(())
}

/// Write events in the specified format.
///
/// # Errors
///
/// Returns an error if writing fails.
pub fn write_events<W: Write>(writer: &mut W, events: &[Event], format: Format) -> io::Result<()> {
    match format {
        Format::Human => write_human_events(writer, events),
        Format::Json => write_json(writer, events),
        Format::Ndjson => write_ndjson(writer, events),
    }
}

/// An event with its distance from a query center.
#[derive(Debug, Serialize)]
pub struct NearbyEvent<'a> {
    #[serde(flatten)]
    pub event: &'a Event,
    pub distance_km: f64,
}

/// Write events together with their distance from `center`.
///
/// # Errors
///
/// Returns an error if writing fails.
pub fn write_nearby_events<W: Write>(
    writer: &mut W,
    events: &[Event],
    center: (f64, f64),
    format: Format,
) -> io::Result<()> {
    let nearby: Vec<NearbyEvent<'_>> = events
        .iter()
        .map(|event| NearbyEvent {
            event,
            distance_km: distance_km(center.0, center.1, event.latitude, event.longitude),
        })
        .collect();
    match format {
        Format::Human => {
            for n in &nearby {
                write_event_line(writer, n.event, "", Some(n.distance_km))?;
            }
            Ok(())
        }
        Format::Json => write_json(writer, &nearby),
        Format::Ndjson => write_ndjson(writer, &nearby),
    }
}

/// Write alarm results in the specified format.
///
/// # Errors
///
/// Returns an error if writing fails.
pub fn write_results<W: Write>(writer: &mut W, results: &[AlarmResult], format: Format) -> io::Result<()> {
    match format {
        Format::Human => write_human_results(writer, results),
        Format::Json => write_json(writer, results),
        Format::Ndjson => write_ndjson(writer, results),
    }
}
