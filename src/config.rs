use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration structure for the report engine
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ReportEngineConfig {
    /// Report service connection settings
    pub server: ServerConfig,
    /// Polling cadence, deadline and retry budget
    pub polling: PollingConfig,
    /// Observability settings
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Base URL of the report API, e.g. `http://localhost:4322/api/v1`
    pub base_url: String,
    /// Per-call watchdog
    pub request_timeout_ms: u64,
    /// Sustained request rate towards the report service
    pub requests_per_second: u32,
    /// Burst capacity
    pub burst_capacity: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:4322/api/v1".to_string(),
            request_timeout_ms: 30_000,
            requests_per_second: 20,
            burst_capacity: 10,
        }
    }
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Lower clamp for the server-suggested poll interval
    pub min_interval_ms: u64,
    /// Upper clamp for the server-suggested poll interval
    pub max_interval_ms: u64,
    /// Wall-clock budget of one polling session
    pub session_deadline_secs: u64,
    /// Consecutive transient failures tolerated before a session times out
    pub max_transient_failures: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Randomize backoff delays by up to +/-50%
    pub jitter: bool,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: 1_000,
            max_interval_ms: 30_000,
            session_deadline_secs: 600, // 10 minutes
            max_transient_failures: 5,
            backoff_base_ms: 1_000,
            backoff_max_ms: 30_000,
            jitter: true,
        }
    }
}

impl PollingConfig {
    /// Clamp the interval (seconds) suggested by the report service
    pub fn clamp_interval(&self, suggested_secs: u64) -> Duration {
        let suggested_ms = suggested_secs.saturating_mul(1_000);
        let upper = self.max_interval_ms.max(self.min_interval_ms);
        Duration::from_millis(suggested_ms.clamp(self.min_interval_ms, upper))
    }

    /// Un-jittered backoff after `failures` consecutive transient failures
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        let delay = self.backoff_base_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.backoff_max_ms))
    }

    pub fn session_deadline(&self) -> Duration {
        Duration::from_secs(self.session_deadline_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level
    pub log_level: String,
    /// Emit JSON log lines instead of human-readable output
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

impl ReportEngineConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. Configuration files (report-engine.toml, .report-engine-rc)
    /// 3. Environment variables (prefixed with REPORT_ENGINE_, sections split by `__`)
    pub fn load() -> Result<Self> {
        let mut builder = Config::builder();

        if Path::new("report-engine.toml").exists() {
            builder = builder.add_source(File::with_name("report-engine"));
        }

        if Path::new(".report-engine-rc").exists() {
            builder = builder.add_source(
                File::with_name(".report-engine-rc").format(config::FileFormat::Toml),
            );
        }

        builder = builder.add_source(
            Environment::with_prefix("REPORT_ENGINE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        Ok(config.try_deserialize()?)
    }

    /// Load from an explicit file, environment still taking precedence
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let config = Config::builder()
            .add_source(File::from(path))
            .add_source(
                Environment::with_prefix("REPORT_ENGINE")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(config.try_deserialize()?)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }
}
