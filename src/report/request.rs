//! Builds the scope-specific body submitted for one date range.

use crate::report::types::{DateRange, MetricsScope};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

pub const BOARD_METRICS: [&str; 4] = ["Velocity", "Cycle time", "Classification", "Rework times"];

pub const DORA_METRICS: [&str; 4] = [
    "Lead time for changes",
    "Deployment frequency",
    "Dev change failure rate",
    "Dev mean time to recovery",
];

pub fn is_board_metric(metric: &str) -> bool {
    BOARD_METRICS.iter().any(|m| m.eq_ignore_ascii_case(metric))
}

pub fn is_dora_metric(metric: &str) -> bool {
    DORA_METRICS.iter().any(|m| m.eq_ignore_ascii_case(metric))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CalendarType {
    #[default]
    #[serde(rename = "REGULAR")]
    Regular,
    #[serde(rename = "CN")]
    China,
    #[serde(rename = "VN")]
    Vietnam,
}

/// Already-validated report settings handed over by the configuration step.
///
/// Board, pipeline and source-control settings are passed through to the
/// report service untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportConfig {
    pub metrics: Vec<String>,
    #[serde(default)]
    pub calendar_type: CalendarType,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub csv_time_stamp: i64,
    #[serde(default)]
    pub board: Option<Value>,
    #[serde(default)]
    pub pipeline: Option<Value>,
    #[serde(default)]
    pub source_control: Option<Value>,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl ReportConfig {
    /// Read a report configuration from a `.json` or `.toml` file
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read report config {}", path.display()))?;
        let config = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&content)
                .with_context(|| format!("Invalid JSON report config {}", path.display()))?,
            _ => toml::from_str(&content)
                .with_context(|| format!("Invalid TOML report config {}", path.display()))?,
        };
        Ok(config)
    }

    pub fn selects_board(&self) -> bool {
        self.metrics.iter().any(|m| is_board_metric(m))
    }

    pub fn selects_dora(&self) -> bool {
        self.metrics.iter().any(|m| is_dora_metric(m))
    }
}

/// JSON body of `POST /reports/{reportId}`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportRequestBody {
    pub metrics: Vec<String>,
    pub metric_types: Vec<MetricsScope>,
    pub start_time: String,
    pub end_time: String,
    pub timezone: String,
    pub consider_holiday: bool,
    pub calendar_type: CalendarType,
    pub csv_time_stamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jira_board_setting: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_kite_setting: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub codebase_setting: Option<Value>,
}

/// Build the request body for one range.
///
/// A `Board` body carries no pipeline or source-control settings at all, and a
/// `Dora` body no board settings, so the service never starts unrelated work.
pub fn build(scope: MetricsScope, config: &ReportConfig, range: &DateRange) -> ReportRequestBody {
    let (metrics, metric_types, board, dora) = match scope {
        MetricsScope::All => {
            let board = config.selects_board();
            let dora = config.selects_dora();
            let mut types = Vec::with_capacity(2);
            if board {
                types.push(MetricsScope::Board);
            }
            if dora {
                types.push(MetricsScope::Dora);
            }
            (config.metrics.clone(), types, board, dora)
        }
        MetricsScope::Board => (
            filtered(&config.metrics, is_board_metric),
            vec![MetricsScope::Board],
            true,
            false,
        ),
        MetricsScope::Dora => (
            filtered(&config.metrics, is_dora_metric),
            vec![MetricsScope::Dora],
            false,
            true,
        ),
    };

    ReportRequestBody {
        metrics,
        metric_types,
        start_time: range.start_millis().to_string(),
        end_time: range.end_millis().to_string(),
        timezone: config.timezone.clone(),
        consider_holiday: config.calendar_type != CalendarType::Regular,
        calendar_type: config.calendar_type,
        csv_time_stamp: config.csv_time_stamp.to_string(),
        jira_board_setting: if board { config.board.clone() } else { None },
        build_kite_setting: if dora { config.pipeline.clone() } else { None },
        codebase_setting: if dora { config.source_control.clone() } else { None },
    }
}

fn filtered(metrics: &[String], keep: fn(&str) -> bool) -> Vec<String> {
    metrics.iter().filter(|m| keep(m)).cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_config() -> ReportConfig {
        ReportConfig {
            metrics: vec![
                "Velocity".to_string(),
                "Cycle time".to_string(),
                "Deployment frequency".to_string(),
                "Lead time for changes".to_string(),
            ],
            calendar_type: CalendarType::China,
            timezone: "Asia/Shanghai".to_string(),
            csv_time_stamp: 1_704_067_200_000,
            board: Some(json!({"type": "jira", "boardId": "2", "site": "dorametrics"})),
            pipeline: Some(json!({"type": "BuildKite", "deploymentEnvList": []})),
            source_control: Some(json!({"type": "GitHub", "leadTime": []})),
        }
    }

    fn range() -> DateRange {
        "2024-01-01..2024-01-07".parse().unwrap()
    }

    #[test]
    fn test_board_body_omits_dora_settings() {
        let body = serde_json::to_value(build(MetricsScope::Board, &sample_config(), &range())).unwrap();

        assert_eq!(body["metricTypes"], json!(["BOARD"]));
        assert_eq!(body["metrics"], json!(["Velocity", "Cycle time"]));
        assert!(body.get("jiraBoardSetting").is_some());
        assert!(body.get("buildKiteSetting").is_none());
        assert!(body.get("codebaseSetting").is_none());
    }

    #[test]
    fn test_dora_body_omits_board_settings() {
        let body = serde_json::to_value(build(MetricsScope::Dora, &sample_config(), &range())).unwrap();

        assert_eq!(body["metricTypes"], json!(["DORA"]));
        assert_eq!(body["metrics"], json!(["Deployment frequency", "Lead time for changes"]));
        assert!(body.get("jiraBoardSetting").is_none());
        assert!(body.get("buildKiteSetting").is_some());
        assert!(body.get("codebaseSetting").is_some());
    }

    #[test]
    fn test_all_body_carries_everything_and_absolute_times() {
        let body = serde_json::to_value(build(MetricsScope::All, &sample_config(), &range())).unwrap();

        assert_eq!(body["metricTypes"], json!(["BOARD", "DORA"]));
        assert_eq!(body["metrics"].as_array().map(Vec::len), Some(4));
        assert_eq!(body["startTime"], json!("1704067200000"));
        assert_eq!(body["endTime"], json!("1704671999999"));
        assert_eq!(body["considerHoliday"], json!(true));
        assert_eq!(body["calendarType"], json!("CN"));
        assert_eq!(body["csvTimeStamp"], json!("1704067200000"));
        assert!(body.get("jiraBoardSetting").is_some());
        assert!(body.get("buildKiteSetting").is_some());
    }

    #[test]
    fn test_all_body_skips_families_the_config_does_not_select() {
        let mut config = sample_config();
        config.metrics = vec!["Velocity".to_string()];

        let body = build(MetricsScope::All, &config, &range());

        assert_eq!(body.metric_types, vec![MetricsScope::Board]);
        assert!(body.jira_board_setting.is_some());
        assert!(body.build_kite_setting.is_none());
        assert!(body.codebase_setting.is_none());
    }

    #[test]
    fn test_report_config_reads_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.toml");
        std::fs::write(
            &path,
            r#"
metrics = ["Velocity", "Deployment frequency"]
calendarType = "VN"
timezone = "Asia/Ho_Chi_Minh"

[board]
type = "jira"
boardId = "7"
"#,
        )
        .unwrap();

        let config = ReportConfig::from_path(&path).unwrap();

        assert_eq!(config.calendar_type, CalendarType::Vietnam);
        assert!(config.selects_board());
        assert!(config.selects_dora());
        assert_eq!(config.board.unwrap()["boardId"], json!("7"));
    }
}
