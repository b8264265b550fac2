use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Which metric family a request or poll targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MetricsScope {
    All,
    Board,
    Dora,
}

impl MetricsScope {
    pub fn covers_board(self) -> bool {
        matches!(self, MetricsScope::All | MetricsScope::Board)
    }

    pub fn covers_dora(self) -> bool {
        matches!(self, MetricsScope::All | MetricsScope::Dora)
    }

    /// Whether `report` carries the completion flag this scope waits for
    pub fn is_completed_in(self, report: &ReportResponse) -> bool {
        match self {
            MetricsScope::All => report.all_metrics_completed,
            MetricsScope::Board => report.board_metrics_completed,
            MetricsScope::Dora => report.dora_metrics_completed,
        }
    }
}

impl fmt::Display for MetricsScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MetricsScope::All => "ALL",
            MetricsScope::Board => "BOARD",
            MetricsScope::Dora => "DORA",
        };
        f.write_str(name)
    }
}

impl FromStr for MetricsScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "all" => Ok(MetricsScope::All),
            "board" => Ok(MetricsScope::Board),
            "dora" => Ok(MetricsScope::Dora),
            other => Err(format!("unknown metrics scope '{other}' (expected all, board or dora)")),
        }
    }
}

/// One reporting window; `start_date` identifies it within a batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DateRange {
    pub start_date: DateTime<FixedOffset>,
    pub end_date: DateTime<FixedOffset>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DateRangeParseError {
    #[error("expected <start>..<end>, got '{0}'")]
    MissingSeparator(String),
    #[error("invalid date '{value}': {reason}")]
    InvalidDate { value: String, reason: String },
    #[error("range ends ({end}) before it starts ({start})")]
    Reversed { start: NaiveDate, end: NaiveDate },
}

impl DateRange {
    pub fn new(start_date: DateTime<FixedOffset>, end_date: DateTime<FixedOffset>) -> Self {
        Self {
            start_date,
            end_date,
        }
    }

    /// Whole UTC days, from the start of `start` to the last millisecond of `end`
    pub fn whole_days(start: NaiveDate, end: NaiveDate) -> Self {
        let start_date = start.and_time(NaiveTime::MIN).and_utc().fixed_offset();
        let end_date = (end.and_time(NaiveTime::MIN) + Duration::days(1) - Duration::milliseconds(1))
            .and_utc()
            .fixed_offset();
        Self::new(start_date, end_date)
    }

    /// Canonical identifier of this range within a batch
    pub fn key(&self) -> String {
        self.start_date.to_rfc3339()
    }

    pub fn start_millis(&self) -> i64 {
        self.start_date.timestamp_millis()
    }

    pub fn end_millis(&self) -> i64 {
        self.end_date.timestamp_millis()
    }
}

impl FromStr for DateRange {
    type Err = DateRangeParseError;

    /// Parses `2024-01-01..2024-01-07`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (start, end) = s
            .split_once("..")
            .ok_or_else(|| DateRangeParseError::MissingSeparator(s.to_string()))?;
        let parse = |value: &str| {
            NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d").map_err(|e| {
                DateRangeParseError::InvalidDate {
                    value: value.to_string(),
                    reason: e.to_string(),
                }
            })
        };
        let (start, end) = (parse(start)?, parse(end)?);
        if end < start {
            return Err(DateRangeParseError::Reversed { start, end });
        }
        Ok(DateRange::whole_days(start, end))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsFamilyError {
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Per-family failures reported inside an otherwise usable payload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportMetricsError {
    #[serde(default)]
    pub board_metrics_error: Option<MetricsFamilyError>,
    #[serde(default)]
    pub pipeline_metrics_error: Option<MetricsFamilyError>,
    #[serde(default)]
    pub source_control_metrics_error: Option<MetricsFamilyError>,
}

/// Report payload as returned by the report service.
///
/// Metric bodies are computed server-side and kept as opaque JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub velocity: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cycle_time: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rework: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification_list: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_frequency: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lead_time_for_changes: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dev_change_failure_rate: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dev_mean_time_to_recovery: Option<Value>,
    #[serde(default)]
    pub report_metrics_error: ReportMetricsError,
    /// Minutes the generated CSV files stay downloadable
    #[serde(default)]
    pub export_validity_time: Option<u64>,
    #[serde(default)]
    pub board_metrics_completed: bool,
    #[serde(default)]
    pub dora_metrics_completed: bool,
    #[serde(default)]
    pub overall_metrics_completed: bool,
    #[serde(default)]
    pub all_metrics_completed: bool,
    #[serde(default)]
    pub is_successful_create_csv_file: bool,
}

/// `202 Accepted` body of a report submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackResponse {
    pub callback_url: String,
    /// Suggested poll interval in seconds
    pub interval: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportIdResponse {
    pub report_id: String,
}

/// Body of `GET /reports/{id}` on the share path
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportUrlsResponse {
    #[serde(rename = "reportURLs", default)]
    pub report_urls: Vec<String>,
    #[serde(default)]
    pub metrics: Vec<String>,
}
