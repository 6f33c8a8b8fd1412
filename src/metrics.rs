//! Metrics Parser
//!
//! The engine writes summary comments into its output file:
//!
//! ```text
//! ; filament used [mm] = 1520.36
//! ; filament used [cm3] = 3.66
//! ; filament used [g] = 4.54
//! ; total filament cost = 0.11
//! ; estimated printing time (normal mode) = 36m 28s
//! ```
//!
//! The estimated time line is the last one of interest, so scanning stops
//! there.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::{debug, warn};

const FILAMENT_LENGTH: &str = "; filament used [mm]";
const FILAMENT_VOLUME: &str = "; filament used [cm3]";
const FILAMENT_WEIGHT: &str = "; filament used [g]";
const FILAMENT_COST: &str = "; total filament cost";
const ESTIMATED_TIME: &str = "; estimated printing time";

/// Physical print metrics reported by the engine. Absent annotations stay `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrintMetrics {
    pub filament_length_mm: Option<f64>,
    pub filament_volume_cm3: Option<f64>,
    pub filament_weight_g: Option<f64>,
    pub filament_cost: Option<f64>,
    pub estimated_time: Option<String>,
    pub estimated_time_seconds: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricField {
    FilamentLength,
    FilamentVolume,
    FilamentWeight,
    FilamentCost,
}

/// An annotation that was present but could not be read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricIssue {
    pub field: MetricField,
    /// 1-based line number in the engine output.
    pub line: usize,
    pub raw: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsReport {
    pub metrics: PrintMetrics,
    pub issues: Vec<MetricIssue>,
}

impl MetricsReport {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Parse engine output held in memory.
pub fn parse_metrics(output: &str) -> MetricsReport {
    let mut scanner = Scanner::default();
    for (index, line) in output.lines().enumerate() {
        if scanner.feed(index + 1, line) {
            break;
        }
    }
    scanner.finish()
}

/// Parse engine output from a reader, stopping as soon as the estimated time
/// annotation has been seen. Invalid UTF-8 is decoded lossily.
pub fn parse_metrics_reader<R: BufRead>(mut reader: R) -> std::io::Result<MetricsReport> {
    let mut scanner = Scanner::default();
    let mut buf = Vec::new();
    let mut line_no = 0;
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        line_no += 1;
        let line = String::from_utf8_lossy(&buf);
        if scanner.feed(line_no, line.trim_end_matches(['\r', '\n'])) {
            break;
        }
    }
    Ok(scanner.finish())
}

pub fn parse_metrics_file(path: &Path) -> std::io::Result<MetricsReport> {
    let file = File::open(path)?;
    let report = parse_metrics_reader(BufReader::new(file))?;
    debug!(
        path = %path.display(),
        issues = report.issues.len(),
        "Parsed engine output"
    );
    Ok(report)
}

#[derive(Default)]
struct Scanner {
    report: MetricsReport,
}

impl Scanner {
    /// Returns true once the final annotation has been consumed.
    fn feed(&mut self, line_no: usize, line: &str) -> bool {
        if line.starts_with(FILAMENT_LENGTH) {
            self.report.metrics.filament_length_mm =
                self.number(MetricField::FilamentLength, line_no, line);
        } else if line.starts_with(FILAMENT_VOLUME) {
            self.report.metrics.filament_volume_cm3 =
                self.number(MetricField::FilamentVolume, line_no, line);
        } else if line.starts_with(FILAMENT_WEIGHT) {
            self.report.metrics.filament_weight_g =
                self.number(MetricField::FilamentWeight, line_no, line);
        } else if line.starts_with(FILAMENT_COST) {
            self.report.metrics.filament_cost =
                self.number(MetricField::FilamentCost, line_no, line);
        } else if line.starts_with(ESTIMATED_TIME) {
            let value = annotation_value(line).unwrap_or_default().to_string();
            self.report.metrics.estimated_time_seconds = Some(duration_to_seconds(&value));
            self.report.metrics.estimated_time = Some(value);
            return true;
        }
        false
    }

    fn number(&mut self, field: MetricField, line_no: usize, line: &str) -> Option<f64> {
        let parsed = annotation_value(line)
            .ok_or_else(|| "missing '=' separator".to_string())
            .and_then(|raw| raw.parse::<f64>().map_err(|e| e.to_string()));
        match parsed {
            Ok(value) => Some(value),
            Err(message) => {
                warn!(?field, line = line_no, %message, "Unreadable engine annotation");
                self.report.issues.push(MetricIssue {
                    field,
                    line: line_no,
                    raw: line.to_string(),
                    message,
                });
                None
            }
        }
    }

    fn finish(self) -> MetricsReport {
        self.report
    }
}

fn annotation_value(line: &str) -> Option<&str> {
    line.split_once('=').map(|(_, value)| value.trim())
}

/// Convert an engine duration such as `1d 2h 3m 4s` into seconds.
///
/// Tokens with an unknown unit or a non-integer amount are skipped, so empty
/// or unreadable input yields zero.
pub fn duration_to_seconds(duration: &str) -> u64 {
    duration
        .split_whitespace()
        .filter_map(token_seconds)
        .fold(0u64, u64::saturating_add)
}

fn token_seconds(token: &str) -> Option<u64> {
    let unit = token.chars().last()?;
    let multiplier = match unit {
        'd' => 86_400,
        'h' => 3_600,
        'm' => 60,
        's' => 1,
        _ => return None,
    };
    let amount: u64 = token[..token.len() - unit.len_utf8()].parse().ok()?;
    Some(amount.saturating_mul(multiplier))
}

#[cfg(test)]
mod tests {
    use super::*;

    const OUTPUT: &str = "\
G1 X10 Y10
; filament used [mm] = 1520.36
; filament used [cm3] = 3.66
; filament used [g] = 4.54
; total filament cost = 0.11
; estimated printing time (normal mode) = 36m 28s
; estimated printing time (silent mode) = 38m 2s
";

    #[test]
    fn test_duration_examples() {
        assert_eq!(duration_to_seconds("36m 28s"), 2188);
        assert_eq!(duration_to_seconds("1h 5m"), 3900);
        assert_eq!(duration_to_seconds("2d"), 172_800);
        assert_eq!(duration_to_seconds(""), 0);
        assert_eq!(duration_to_seconds("1d 2h 3m 4s"), 93_784);
    }

    #[test]
    fn test_duration_ignores_unknown_tokens() {
        assert_eq!(duration_to_seconds("3w 10s"), 10);
        assert_eq!(duration_to_seconds("abc"), 0);
        assert_eq!(duration_to_seconds("xm 5s"), 5);
        assert_eq!(duration_to_seconds("  "), 0);
    }

    #[test]
    fn test_duration_saturates() {
        assert_eq!(duration_to_seconds("18446744073709551615d"), u64::MAX);
    }

    #[test]
    fn test_parse_all_fields() {
        let report = parse_metrics(OUTPUT);
        assert!(report.is_clean());
        let m = report.metrics;
        assert_eq!(m.filament_length_mm, Some(1520.36));
        assert_eq!(m.filament_volume_cm3, Some(3.66));
        assert_eq!(m.filament_weight_g, Some(4.54));
        assert_eq!(m.filament_cost, Some(0.11));
        assert_eq!(m.estimated_time.as_deref(), Some("36m 28s"));
        assert_eq!(m.estimated_time_seconds, Some(2188));
    }

    #[test]
    fn test_stops_at_estimated_time() {
        let output = "\
; filament used [g] = 10.0
; estimated printing time (normal mode) = 1h
; filament used [g] = 99.0
; estimated printing time (normal mode) = 9h
";
        let m = parse_metrics(output).metrics;
        assert_eq!(m.filament_weight_g, Some(10.0));
        assert_eq!(m.estimated_time_seconds, Some(3600));
    }

    #[test]
    fn test_missing_fields_stay_unset() {
        let m = parse_metrics("; filament used [mm] = 12.5\n").metrics;
        assert_eq!(m.filament_length_mm, Some(12.5));
        assert_eq!(m.filament_weight_g, None);
        assert_eq!(m.estimated_time, None);
        assert_eq!(m.estimated_time_seconds, None);
    }

    #[test]
    fn test_malformed_number_is_field_local() {
        let output = "\
; filament used [mm] = lots
; filament used [g] = 4.5
; estimated printing time (normal mode) = 5m
";
        let report = parse_metrics(output);
        assert_eq!(report.metrics.filament_length_mm, None);
        assert_eq!(report.metrics.filament_weight_g, Some(4.5));
        assert_eq!(report.issues.len(), 1);
        assert_eq!(report.issues[0].field, MetricField::FilamentLength);
        assert_eq!(report.issues[0].line, 1);
    }

    #[test]
    fn test_unreadable_duration_is_zero() {
        let m = parse_metrics("; estimated printing time (normal mode) = soon\n").metrics;
        assert_eq!(m.estimated_time.as_deref(), Some("soon"));
        assert_eq!(m.estimated_time_seconds, Some(0));
    }

    #[test]
    fn test_reader_handles_crlf_and_invalid_utf8() {
        let mut bytes = b"; filament used [g] = 7.25\r\n".to_vec();
        bytes.extend_from_slice(&[0xff, 0xfe, b'\n']);
        bytes.extend_from_slice(b"; estimated printing time (normal mode) = 2h\r\n");
        let report = parse_metrics_reader(&bytes[..]).unwrap();
        assert_eq!(report.metrics.filament_weight_g, Some(7.25));
        assert_eq!(report.metrics.estimated_time.as_deref(), Some("2h"));
    }
}
